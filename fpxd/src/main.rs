use anyhow::{Context, Result};
use clap::Parser;
use fpx_core::access_log::AccessLog;
use fpx_core::config::{self, Config, StaticMount};
use fpx_core::observability;
use fpxd::fcgi_client::FcgiClient;
use fpxd::fpm::FpmClient;
use fpxd::server::{self, AppState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fpxd", about = "Single-script HTTP front door for PHP-FPM")]
struct Cli {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Path to the PHP-FPM Unix socket.
    #[arg(short, long)]
    socket: PathBuf,

    /// Path to the index.php entrypoint handed to FPM.
    #[arg(short, long)]
    index_file: PathBuf,

    /// Application name, used as a metric label.
    #[arg(long, default_value = "php-app")]
    app: String,

    /// Static folder in the form "/path/to/folder:/endpoint/prefix".
    #[arg(short = 'f', long = "static-folder", value_parser = config::parse_static_mount)]
    static_folder: Vec<StaticMount>,

    /// Number of persistent connections to FPM.
    #[arg(long, default_value_t = 32)]
    fpm_pool_size: usize,

    /// Per-request deadline [500ms, 30s, 1m].
    #[arg(long, default_value = "30s", value_parser = config::parse_duration)]
    timeout: Duration,

    /// Enable access logging.
    #[arg(long)]
    access_log: bool,

    /// Print debug output.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            socket: self.socket,
            index_file: self.index_file,
            app: self.app,
            static_mounts: self.static_folder,
            fpm_pool_size: self.fpm_pool_size,
            timeout: self.timeout,
            access_log: self.access_log,
            verbose: self.verbose,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(cli.into_config());
    observability::init_logging(config.verbose)?;
    config.validate()?;
    config.log_startup();

    let metrics = observability::install_metrics()?;
    let fcgi = FcgiClient::connect(&config.socket, config.fpm_pool_size)
        .await
        .context("could not create FPM client")?;
    let fpm = Arc::new(FpmClient::new(fcgi, config.clone()));
    let state = Arc::new(AppState {
        config: config.clone(),
        fpm,
        metrics,
        access_log: AccessLog::new(config.access_log),
    });
    server::run(state).await
}
