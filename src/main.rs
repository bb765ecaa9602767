use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use lancast::config::CasterConfig;
use lancast::{CaptureMode, Device, StatusKind, StreamOrchestrator};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List Cast receivers on the local network
    Discover {
        /// Seconds to browse for
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Stream the screen to a receiver until Ctrl-C
    Cast {
        /// Device id or friendly name
        #[arg(short, long)]
        device: String,

        /// Capture a single window instead of the full screen
        #[arg(short, long)]
        window: Option<String>,

        #[arg(long)]
        fps: Option<u32>,

        /// PulseAudio source to include as audio
        #[arg(long)]
        audio_source: Option<String>,

        /// Capture size as WIDTHxHEIGHT
        #[arg(long)]
        resolution: Option<String>,

        /// Directory of extra files to serve alongside the stream
        #[arg(long)]
        web_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = CasterConfig::load(args.config.as_deref()).context("loading config")?;

    match args.command {
        Command::Discover { timeout } => {
            let orchestrator = StreamOrchestrator::from_config(config);
            let devices = orchestrator
                .discover(timeout.map(Duration::from_secs))
                .await?;
            if devices.is_empty() {
                println!("No Cast devices found");
            }
            for device in devices {
                println!(
                    "{}  {} ({}, {}) at {}:{}",
                    device.id,
                    device.display_name,
                    device.model_name,
                    device.manufacturer,
                    device.address,
                    device.port
                );
            }
        }
        Command::Cast {
            device,
            window,
            fps,
            audio_source,
            resolution,
            web_root,
        } => {
            if web_root.is_some() {
                config.server.web_root = web_root;
            }
            let mut settings = config.capture.defaults.clone();
            if let Some(window) = window {
                settings.mode = CaptureMode::Window(window);
            }
            if let Some(fps) = fps {
                settings.frame_rate = fps;
            }
            settings.audio_source = audio_source.or(settings.audio_source);
            settings.resolution = resolution.or(settings.resolution);

            let orchestrator = StreamOrchestrator::from_config(config);
            let target = find_device(&orchestrator, &device).await?;

            orchestrator.configure_capture(settings).await?;
            orchestrator.select(target).await?;

            let mut events = orchestrator.subscribe();
            orchestrator.start().await?;
            tracing::info!("Press Ctrl-C to stop");

            let mut failure = None;
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    signal = &mut ctrl_c => {
                        signal?;
                        break;
                    }
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        match event.kind {
                            StatusKind::Started { device_name, .. } => {
                                println!("Starting stream to {}", device_name)
                            }
                            StatusKind::Streaming { stream_url } => println!("Streaming {}", stream_url),
                            StatusKind::Reconnecting { attempt, reason } => {
                                println!("Reconnecting (attempt {}): {}", attempt, reason)
                            }
                            StatusKind::Failed { reason } => {
                                println!("Failed: {}", reason);
                                failure = Some(reason);
                            }
                            StatusKind::Stopped => {
                                println!("Stopped");
                                break;
                            }
                        }
                    }
                }
            }

            orchestrator.stop().await?;
            if let Some(reason) = failure {
                bail!("Stream failed: {}", reason);
            }
        }
    }

    Ok(())
}

async fn find_device(orchestrator: &StreamOrchestrator, wanted: &str) -> anyhow::Result<Device> {
    let devices = orchestrator.discover(None).await?;
    let found = devices
        .into_iter()
        .find(|d| d.id == wanted || d.display_name.eq_ignore_ascii_case(wanted));
    match found {
        Some(device) => Ok(device),
        None => bail!("No Cast device matching '{}' found", wanted),
    }
}
