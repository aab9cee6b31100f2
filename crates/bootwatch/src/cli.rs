use std::path::PathBuf;

pub const DEFAULT_SYMLINK_PATH: &str = "/tmp/ssd";

static HELP_STR_LOG: &str = "
    Optional log file. If not provided, logs go to stderr. The filter is \
                             taken from RUST_LOG and defaults to info.
";

#[derive(clap::Parser, Debug)]
#[command(
    name = "bootwatch",
    version,
    about = "bootwatch",
    long_about = "Holds the boot sequence until the board support package \
                  has created the SSD symlink and assigned the control-plane \
                  address, then derives the master node's exclusive address"
)]
pub enum Args {
    /// Wait for the symlink and control-plane address, then report the
    /// exclusive address.
    Gate {
        #[arg(
            long,
            short,
            value_name = "SYMLINK_PATH",
            help = "Symlink the BSP creates once the SSD is ready",
            default_value = DEFAULT_SYMLINK_PATH
        )]
        symlink_path: PathBuf,

        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
    /// Print filesystem events for a directory until Ctrl-C.
    WatchPath {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
    /// Print routing messages until Ctrl-C.
    WatchAddr {
        #[arg(long, short = 'l', value_name = "LOG_PATH", help = HELP_STR_LOG)]
        log_path: Option<PathBuf>,
    },
}

impl Args {
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Args::Gate { log_path, .. }
            | Args::WatchPath { log_path, .. }
            | Args::WatchAddr { log_path } => log_path.as_ref(),
        }
    }
}
