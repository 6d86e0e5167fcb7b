//! portfwd command-line entry point

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use portfwd_lib::RunOptions;

/// portfwd - named TCP port forwarding rules with live statistics
#[derive(Debug, Parser)]
#[command(name = "portfwd", version, about)]
struct Cli {
    /// Rules file (default: ~/.portfwd/rules.json, created if missing)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log every rule's status this often, in seconds (0 = never)
    #[arg(long = "status-interval", default_value = "0", value_name = "SECS")]
    status_interval: u64,
}

impl Cli {
    fn into_options(self) -> RunOptions {
        RunOptions {
            config_path: self.config,
            status_interval: (self.status_interval > 0)
                .then(|| Duration::from_secs(self.status_interval)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    portfwd_lib::init_logging();

    tracing::info!("portfwd v{} starting", env!("CARGO_PKG_VERSION"));

    match portfwd_lib::run(cli.into_options()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
