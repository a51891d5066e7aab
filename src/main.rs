use clap::{Parser, ValueEnum};
use ssc_stream::{logger, Config, Role};
use std::path::PathBuf;
use tracing::error;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum RoleArg {
    Streamer,
    Viewer,
}

#[derive(Parser)]
#[command(name = "ssc-stream", version, about = "Streamer/viewer WebRTC session")]
struct Cli {
    #[arg(short, long, value_enum)]
    role: RoleArg,

    /// TOML configuration
    #[arg(short, long, env = "SSC_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `signaling_url` from the configuration
    #[arg(short, long, env = "SSC_SIGNALING_URL")]
    signaling: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load {}: {e}", path.display());
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    if let Some(url) = cli.signaling {
        config.signaling_url = url;
    }

    logger::init(&config.log_filter);

    let role = match cli.role {
        RoleArg::Streamer => Role::Streamer,
        RoleArg::Viewer => Role::Viewer,
    };
    if let Err(e) = ssc_stream::run(config, role).await {
        error!("{e}");
        std::process::exit(1);
    }
}
