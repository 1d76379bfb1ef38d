//! # filehook - XML report shipper
//!
//! Watches a directory for XML reports dropped by another program, waits
//! until each file is fully written, and ships it to a remote collector.
//!
//! ## Features
//!
//! - **Write detection**: a file is only picked up once its size stops changing
//! - **Validation**: incomplete or malformed XML is re-checked until it parses
//! - **Compact uploads**: payloads are minified and gzip-compressed
//! - **Retries**: failed uploads back off exponentially (2, 4, 8, 16, 32 minutes)
//! - **Archival**: delivered files can be kept as `<name>.zip` in an output directory
//! - **Status endpoint**: `GET /` lists the directory and the files in work
//!
//! ## Usage
//!
//! ```bash
//! # Ship every .xml report dropped into /var/reports
//! filehook watch --dir /var/reports --url https://collector/api --token secret
//!
//! # Keep zipped copies instead of just deleting delivered files
//! filehook watch --dir /var/reports --zip --out /var/reports/sent
//!
//! # See which reports would currently pass validation
//! filehook check /var/reports
//! ```

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use filehook::commands::{check::CheckCommand, watch::WatchCommand};
use filehook::config::Config;

/// filehook - ships XML reports from a directory to a remote collector
#[derive(Parser)]
#[command(
    name = "filehook",
    about = "Watches a directory and ships finished XML reports to a remote collector",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Watch a directory and upload every new report
    Watch(WatchArgs),
    /// Validate the reports currently in a directory without uploading them
    Check {
        /// Directory to check
        path: PathBuf,
        /// Accepted filename suffixes
        #[arg(long, default_value = ".xml")]
        patterns: String,
        /// Separator between suffixes in --patterns
        #[arg(long, default_value = ",")]
        separator: String,
    },
}

#[derive(Args)]
struct WatchArgs {
    /// Directory to watch for new files (defaults to current working directory)
    #[arg(long, env = "FILEHOOK_DIR")]
    dir: Option<PathBuf>,
    /// Directory for zipped copies of delivered files (defaults to --dir)
    #[arg(long, env = "FILEHOOK_OUT")]
    out: Option<PathBuf>,
    /// Accepted filename suffixes
    #[arg(long, env = "FILEHOOK_PATTERNS", default_value = ".xml")]
    patterns: String,
    /// Separator between suffixes in --patterns
    #[arg(long, env = "FILEHOOK_SEPARATOR", default_value = ",")]
    separator: String,
    /// Seconds to sleep between directory scans
    #[arg(long, env = "FILEHOOK_INTERVAL", default_value_t = 60)]
    interval: u64,
    /// Seconds between validation attempts of a file that is not ready yet
    #[arg(long, env = "FILEHOOK_CHECK", default_value_t = 180)]
    check: u64,
    /// Connect timeout for upload requests, in seconds
    #[arg(long, env = "FILEHOOK_TIMEOUT", default_value_t = 30)]
    timeout: u64,
    /// URL of the reports API
    #[arg(long, env = "FILEHOOK_URL", default_value = "http://localhost:3000/")]
    url: String,
    /// Auth token for the reports API
    #[arg(long, env = "FILEHOOK_TOKEN", default_value = "", hide_env_values = true)]
    token: String,
    /// Zip delivered files into --out (implies removing the source)
    #[arg(long, env = "FILEHOOK_ZIP")]
    zip: bool,
    /// Remove files after they were delivered
    #[arg(long, env = "FILEHOOK_CLEAR", default_value_t = true, action = clap::ArgAction::Set)]
    clear: bool,
    /// Address of the status endpoint
    #[arg(long, env = "FILEHOOK_LISTEN", default_value = "0.0.0.0:9090")]
    listen: String,
    /// Do not start the status endpoint
    #[arg(long)]
    no_status: bool,
    /// Verbose output
    #[arg(long, short)]
    verbose: bool,
}

impl WatchArgs {
    fn into_config(self) -> Result<Config> {
        let dir = match self.dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let out = self.out.unwrap_or_else(|| dir.clone());

        Ok(Config {
            dir,
            out,
            patterns: self.patterns,
            separator: self.separator,
            url: self.url,
            token: self.token,
            zip: self.zip,
            clear: self.clear,
            verbose: self.verbose,
            listen: (!self.no_status).then_some(self.listen),
            scan_interval: self.interval,
            check_interval: self.check,
            timeout: self.timeout,
            ..Config::from_env()
        })
    }
}

fn log_configuration(config: &Config) {
    info!("Configuration:");
    info!("  Interval:\t{} seconds", config.scan_interval);
    info!("  Check:\t{} seconds", config.check_interval);
    info!("  Timeout:\t{} seconds", config.timeout);
    info!("  Directory:\t{:?}", config.dir);
    info!("  Output:\t{:?}", config.out);
    info!("  Patterns:\t{:?}", config.suffixes());
    info!("  URL:\t\t{}", config.url);
    info!("  Zip:\t\t{}", config.zip);
    info!("  Clear:\t{}", config.clear);
    info!("  Status:\t{}", config.listen.as_deref().unwrap_or("disabled"));
    info!("  Verbose:\t{}", config.verbose);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(&cli.command, Commands::Watch(args) if args.verbose);
    let default_filter = if verbose { "filehook=debug" } else { "filehook=info" };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Watch(args) => match args.into_config() {
            Ok(config) => {
                log_configuration(&config);
                WatchCommand::new(config).execute().await
            }
            Err(e) => Err(e),
        },
        Commands::Check {
            path,
            patterns,
            separator,
        } => {
            info!("Starting check command for path: {:?}", path);
            let suffixes = Config {
                patterns,
                separator,
                ..Config::default()
            }
            .suffixes();
            let check_cmd = CheckCommand::new(path, suffixes);
            match check_cmd.execute().await {
                Ok(report) => {
                    check_cmd.print_report(&report);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
