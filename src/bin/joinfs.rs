use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{App, Arg};
use tarfslib::fs::TarFs;

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), tarfslib::Error> {
    let matches = App::new("joinfs")
        .about("Mounts several files concatenated end to end as a single read-only file")
        .arg(
            Arg::with_name("args")
                .required(true)
                .multiple(true)
                .min_values(2)
                .help("One or more files to join, followed by the mountpoint"),
        )
        .get_matches();

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    // The last positional argument is the mountpoint, the rest are the
    // parts to join, exactly as `JoinedFileMount.py`'s `cli()` splits
    // `args[-1]` from `args[:-1]`.
    let mut args: Vec<PathBuf> = matches.values_of_os("args").unwrap().map(PathBuf::from).collect();
    let mountpoint = args.pop().unwrap();
    let parts = args;

    // Validate every part before touching the mountpoint, the same
    // fail-fast-before-mkdir ordering as `main.rs`.
    let (tree, joined) = tarfslib::prepare_joined_mount(parts)?;

    // `FuseFileObjectMount.__init__` creates the mountpoint if it doesn't
    // exist and removes it again in `__del__` iff it created it; mirror
    // that instead of requiring the caller to pre-create the directory.
    let mountpoint_was_created = if !mountpoint.exists() {
        fs::create_dir(&mountpoint)?;
        true
    } else {
        false
    };

    let adapter = TarFs::new(tree, joined);
    let result = fuse::mount(adapter, &mountpoint, &[]).map_err(tarfslib::Error::from);

    if mountpoint_was_created {
        let _ = fs::remove_dir(&mountpoint);
    }

    result
}
