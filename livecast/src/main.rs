mod server;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use livecast_core::{
    bootstrap::{load_config, validate_config},
    logging,
};

use server::LivecastServer;

#[derive(Parser, Debug)]
#[command(name = "livecast")]
#[command(about = "Live MPEG-TS to HLS segmenter with an RTSP control endpoint", long_about = None)]
struct Args {
    /// Config file (YAML or TOML)
    #[arg(long, short)]
    config: Option<String>,

    /// Source locator (rtsp://, tcp://, file:// or a path), overrides source.url
    #[arg(long, short, env = "INPUT_RTSP")]
    input: Option<String>,

    /// Segment output directory, overrides hls.output_path
    #[arg(long, short, env = "OUTPUT_PATH")]
    output: Option<PathBuf>,

    /// ffmpeg binary used to remux network sources
    #[arg(long, env = "FFMPEG_PATH", default_value = "ffmpeg")]
    ffmpeg: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, command line wins over file and environment
    let mut config = load_config(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.source.url = input;
    }
    if let Some(output) = args.output {
        config.hls.output_path = output;
    }

    // 2. Validate before anything starts
    validate_config(&config)?;

    // 3. Initialize logging
    logging::init_logging(&config.logging, config.features.enable_debug)?;
    info!("livecast starting...");
    info!("Source: {}", config.source.url);
    info!("Segments: {}", config.hls.output_path.display());
    if config.features.enable_hls {
        info!("HLS address: {}", config.hls_address());
    }
    if config.features.enable_rtsp {
        info!("RTSP address: {}", config.rtsp_address());
    }

    // 4. Run until end of stream, a fatal error or a shutdown signal
    LivecastServer::new(config, args.ffmpeg).run().await
}
