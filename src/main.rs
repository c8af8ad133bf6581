use anyhow::Result;
use clap::Parser;
use expod::{config::ServerConfig, rest, AppContext};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "expod",
    about = "expod — self-hosted over-the-air update server for Expo apps",
    version
)]
struct Args {
    /// HTTP listen port (overrides the PORT environment variable)
    #[arg(long)]
    port: Option<u16>,

    /// Log level filter, e.g. "debug" or "info,expod=trace"
    #[arg(long, env = "EXPOD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "EXPOD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(args.log.as_deref().unwrap_or("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Keep the non-blocking writer guard alive for the whole process.
    let _log_guard = match &args.log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or(std::ffi::OsStr::new("expod.log"));
            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    let mut config = ServerConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        storage = ?config.storage_mode,
        base_url = %config.base_url,
        port = config.port,
        "starting update server"
    );

    let ctx = AppContext::from_config(config).await?;
    rest::serve(ctx).await
}
