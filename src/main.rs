use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{App, Arg};

use tarfslib::{fs::TarFs, index_codec, index_tar_archive, Error, MountOptions};

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let matches = App::new("tarfs")
        .about("Mounts the contents of a TAR archive as a read-only filesystem")
        .arg(Arg::with_name("foreground").short("f").long("foreground").help("Run in the foreground instead of daemonizing"))
        .arg(
            Arg::with_name("debug")
                .short("d")
                .long("debug")
                .takes_value(true)
                .default_value("1")
                .help("Verbosity: 0=warn, 1=info, 2=debug, 3=trace"),
        )
        .arg(Arg::with_name("recreate-index").short("c").long("recreate-index").help("Delete any existing index and rebuild it"))
        .arg(Arg::with_name("recursive").short("r").long("recursive").help("Recursively mount nested TAR archives"))
        .arg(
            Arg::with_name("serialization-backend")
                .short("s")
                .long("serialization-backend")
                .takes_value(true)
                .default_value("custom")
                .help("Index serialization backend, e.g. custom, custom.gz, custom.lz4"),
        )
        .arg(Arg::with_name("archive").required(true).index(1))
        .arg(Arg::with_name("mountpoint").index(2))
        .get_matches();

    let verbosity: u8 = matches.value_of("debug").unwrap().parse().unwrap_or(1);
    init_logger(verbosity);

    let archive_path = PathBuf::from(matches.value_of_os("archive").unwrap());
    let mountpoint = matches
        .value_of_os("mountpoint")
        .map(PathBuf::from)
        .unwrap_or_else(|| default_mountpoint(&archive_path));

    let (codec, compression) = index_codec::parse_backend(matches.value_of("serialization-backend").unwrap());
    let opts = MountOptions {
        write_index: true,
        clear_cache: matches.is_present("recreate-index"),
        recursive: matches.is_present("recursive"),
        codec,
        compression,
        verbosity,
    };

    let foreground = matches.is_present("foreground");

    // Open and fully index the archive before touching the mountpoint, so a
    // malformed/unreadable archive fails fast without ever creating a
    // directory that would then need cleanup.
    let (tree, file) = index_tar_archive(&archive_path, opts)?;

    let mountpoint_was_created = if !mountpoint.exists() {
        fs::create_dir(&mountpoint)?;
        true
    } else {
        false
    };

    log::info!("mounting {} at {}", archive_path.display(), mountpoint.display());
    let adapter = TarFs::new(tree, file);
    let result = fuse::mount(adapter, &mountpoint, &[]).map_err(Error::from);

    if mountpoint_was_created && foreground {
        let _ = fs::remove_dir(&mountpoint);
    }

    result
}

fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

/// `<archive>` with its last extension stripped, mirroring
/// `os.path.splitext(tarToMount)[0]` in `ratarmount.py`.
fn default_mountpoint(archive_path: &Path) -> PathBuf {
    archive_path.with_extension("")
}
