//! Host mount binary (spec §6): parses the CLI, brings up the orchestrator,
//! and hands the tree over to the kernel via `fuser`.

use clap::Parser;
use fuser::MountOption;
use tracing::error;

use madbfs::config::Config;
use madbfs::fs::MadbfsFs;
use madbfs::orchestrator::Orchestrator;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_MISSING_MOUNTPOINT: i32 = 2;

fn main() {
    let config = Config::parse();

    if config.port == 0 {
        eprintln!("madbfs: --port must be between 1 and 65535");
        std::process::exit(EXIT_CONFIG_ERROR);
    }
    if !config.mountpoint.is_dir() {
        eprintln!("madbfs: mount point {:?} does not exist or is not a directory", config.mountpoint);
        std::process::exit(EXIT_MISSING_MOUNTPOINT);
    }

    let (_guard, logcat, log_handle) = madbfs::log::init(config.log_level, &config.log_file);

    let orchestrator = match Orchestrator::start(&config, logcat, log_handle) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("madbfs: failed to start core: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let options = vec![
        MountOption::FSName("madbfs".to_string()),
        MountOption::NoDev,
        MountOption::NoSuid,
        MountOption::DefaultPermissions,
    ];

    let fs = MadbfsFs::new(orchestrator);
    if let Err(e) = fuser::mount2(fs, &config.mountpoint, &options) {
        error!(error = %e, "mount failed");
        eprintln!("madbfs: mount failed: {e}");
        std::process::exit(EXIT_CONFIG_ERROR);
    }
}
