use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use voxrelay_core::config::Config;
use voxrelay_gateway::GatewayState;
use voxrelay_media::chunk::window_bytes;
use voxrelay_media::pcm::{duration_ms, pcm_to_wav};
use voxrelay_media::supervisor::SynthesisSupervisor;
use voxrelay_tts::TtsState;

mod client;
mod logging;

/// Sample rate assumed for synthesized audio when no `tts` section is configured.
const DEFAULT_TTS_SAMPLE_RATE: u32 = 22_050;

/// Duration of each audio frame `relay` sends to the gateway.
const RELAY_FRAME_MS: u32 = 100;

#[derive(Parser)]
#[command(
    name = "voxrelay",
    about = "Speech relay: stream audio in, get it recognized, hear the reply synthesized",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the duplex gateway server
    Gateway {
        /// Port to listen on (default: gateway.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Start the streaming synthesis service
    Tts {
        /// Port to listen on (default: tts.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Synthesize text through the synthesis service
    Speak {
        /// Text to speak
        #[arg(short, long)]
        text: String,

        /// Write the audio to this WAV file
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Synthesis service URL (default: upstream.tts_ws_url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Send a raw PCM file through the gateway and collect the reply
    Relay {
        /// Raw 16-bit little-endian PCM at recognition.sample_rate
        #[arg(short, long)]
        input: PathBuf,

        /// Write the reply audio to this WAV file
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Gateway URL (default: derived from gateway.host/port)
        #[arg(long)]
        url: Option<String>,
    },

    /// Validate config and resolve the synthesis engine
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_path);
    let loaded = Config::load(&config_path);

    logging::init_logging(loaded.as_ref().ok().map(|c| &c.logging), cli.verbose)?;

    match cli.command {
        Commands::Gateway { port } => {
            let config = loaded?;
            let gateway = config.gateway()?;
            let addr = port
                .map(|port| format!("{}:{port}", gateway.host))
                .unwrap_or_else(|| gateway.bind_addr());

            let state = GatewayState::from_config(Arc::new(config))?;
            #[cfg(feature = "metrics")]
            let state = state.with_metrics(voxrelay_gateway::metrics::install_prometheus_recorder()?);

            voxrelay_gateway::start_gateway(Arc::new(state), &addr, shutdown_token()).await?;
        }
        Commands::Tts { port } => {
            let config = loaded?;
            let tts = config.tts()?;
            let addr = port
                .map(|port| format!("{}:{port}", tts.host))
                .unwrap_or_else(|| tts.bind_addr());

            let state = TtsState::from_config(tts)?;
            voxrelay_tts::start_tts_service(Arc::new(state), &addr, shutdown_token()).await?;
        }
        Commands::Speak { text, out, url } => {
            let config = loaded.ok();
            let url = match url {
                Some(url) => url,
                None => tts_url(config.as_ref()).context("no --url and no upstream/tts config")?,
            };
            let timeout = config
                .as_ref()
                .and_then(|c| c.upstream.as_ref())
                .map(|u| u.ws_timeout())
                .unwrap_or(Duration::from_secs(30));
            let sample_rate = tts_sample_rate(config.as_ref());

            info!("Synthesizing via {url}");
            let report = client::speak(&url, &text, timeout).await?;
            println!("Chunks: {}", report.chunks);
            match report.first_chunk {
                Some(latency) => println!("First chunk after {} ms", latency.as_millis()),
                None => println!("No audio returned"),
            }
            println!(
                "Audio: {} bytes ({} ms) in {} ms",
                report.pcm.len(),
                duration_ms(report.pcm.len(), sample_rate, 1),
                report.total.as_millis()
            );

            if let Some(out) = out {
                std::fs::write(&out, pcm_to_wav(&report.pcm, sample_rate, 1))?;
                println!("Wrote {}", out.display());
            }
        }
        Commands::Relay { input, out, url } => {
            let config = loaded.ok();
            let url = match url {
                Some(url) => url,
                None => config
                    .as_ref()
                    .and_then(|c| c.gateway.as_ref())
                    .map(|g| client::ws_url(&g.host, g.port, "/ws/gateway"))
                    .context("no --url and no gateway config")?,
            };
            let recognition = config
                .as_ref()
                .map(|c| c.recognition.clone())
                .unwrap_or_default();
            let sample_rate = tts_sample_rate(config.as_ref());

            let pcm = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let frame_bytes = window_bytes(recognition.sample_rate, RELAY_FRAME_MS)
                * usize::from(recognition.channels.max(1));

            info!("Relaying {} bytes via {url}", pcm.len());
            let outcome = client::relay(&url, &pcm, frame_bytes).await?;
            println!("Recognized: {:?}", outcome.asr_text);
            println!("Reply: {} chunks, {} bytes", outcome.chunks, outcome.pcm.len());

            if let Some(out) = out {
                std::fs::write(&out, pcm_to_wav(&outcome.pcm, sample_rate, 1))?;
                println!("Wrote {}", out.display());
            }
        }
        Commands::Check => {
            let config = loaded?;
            println!("voxrelay v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());

            let (warnings, errors) = config.validate();
            for warning in &warnings {
                println!("warning: {warning}");
            }
            for error in &errors {
                println!("error: {error}");
            }

            if let Some(upstream) = &config.upstream {
                println!("Recognition: {}", upstream.asr_url);
                println!("Synthesis: {}", upstream.tts_ws_url);
            }

            let mut failed = !errors.is_empty();
            if let Some(tts) = &config.tts {
                match SynthesisSupervisor::from_config(tts) {
                    Ok(supervisor) => println!(
                        "Synthesis engine: ok ({} bytes per window)",
                        supervisor.window_bytes()
                    ),
                    Err(e) => {
                        println!("Synthesis engine: {e}");
                        failed = true;
                    }
                }
            }

            if failed {
                anyhow::bail!("configuration check failed");
            }
            println!("Status: ok");
        }
    }

    Ok(())
}

/// Cancelled on Ctrl+C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let signal = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(%e, "Failed to listen for Ctrl+C, shutting down"),
        }
        signal.cancel();
    });
    token
}

fn tts_url(config: Option<&Config>) -> Option<String> {
    let config = config?;
    if let Some(upstream) = &config.upstream {
        return Some(upstream.tts_ws_url.clone());
    }
    config
        .tts
        .as_ref()
        .map(|t| client::ws_url(&t.host, t.port, "/ws/tts"))
}

fn tts_sample_rate(config: Option<&Config>) -> u32 {
    config
        .and_then(|c| c.tts.as_ref())
        .map(|t| t.sample_rate)
        .unwrap_or(DEFAULT_TTS_SAMPLE_RATE)
}
