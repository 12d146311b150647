use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// A Kafka-compatible broker control plane.
#[derive(Debug, Parser)]
#[command(name = "hedda", version, about)]
struct Args {
    /// Location of the config file.
    #[arg(long, value_name = "PATH", default_value = "Config.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::Layer::new().compact().with_writer(writer));
    tracing::subscriber::set_global_default(subscriber)?;

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(hedda::hedda(args.config, token))
}
