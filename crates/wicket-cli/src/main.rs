use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::PathBuf;
use wicket_hw::{Camera, Constraints, FacingMode, StreamSource, V4l2Devices, V4l2Source};

/// Frames pulled per camera before diagnostics give up on a ready one.
const DIAGNOSTIC_GRABS: usize = 10;

#[zbus::proxy(
    interface = "org.wicket.Kiosk1",
    default_service = "org.wicket.Kiosk1",
    default_path = "/org/wicket/Kiosk1"
)]
trait Kiosk {
    async fn start_scan(&self) -> zbus::Result<()>;
    async fn stop_scan(&self) -> zbus::Result<()>;
    async fn manual_input(&self, value: &str) -> zbus::Result<()>;
    async fn submit_code(&self, value: &str) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn status_changed(&self, message: &str, severity: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn verification_finished(&self, outcome: &str, message: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn reset_complete(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "wicket", about = "Wicket access-control kiosk CLI")]
struct Cli {
    /// Talk to wicketd on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start scanning for a QR badge
    Start,
    /// Stop scanning
    Stop,
    /// Type a badge code (debounced like keyboard input)
    Enter {
        /// Badge code
        code: String,
    },
    /// Submit a badge code immediately
    Submit {
        /// Badge code
        code: String,
    },
    /// Show daemon status
    Status,
    /// Print kiosk events until interrupted
    Watch,
    /// Run camera diagnostics
    Test {
        /// Environment-facing (badge) camera
        #[arg(long, default_value = "/dev/video0")]
        qr_device: String,
        /// User-facing (face) camera
        #[arg(long, default_value = "/dev/video2")]
        face_device: String,
        /// Write each grabbed frame as a JPEG into this directory
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Test {
            qr_device,
            face_device,
            save,
        } => return run_diagnostics(qr_device, face_device, save).await,
        command => command,
    };

    let connection = if cli.system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    let proxy = KioskProxy::new(&connection).await?;
    tracing::debug!(system_bus = cli.system, "connected to wicketd");

    match command {
        Commands::Start => {
            proxy.start_scan().await?;
            println!("Scanning started");
        }
        Commands::Stop => {
            proxy.stop_scan().await?;
            println!("Scanning stopped");
        }
        Commands::Enter { code } => {
            proxy.manual_input(&code).await?;
            println!("Code entered: {code}");
        }
        Commands::Submit { code } => {
            proxy.submit_code(&code).await?;
            println!("Code submitted: {code}");
        }
        Commands::Status => {
            let raw = proxy.status().await?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Watch => watch(&proxy).await?,
        Commands::Test { .. } => {}
    }

    Ok(())
}

async fn watch(proxy: &KioskProxy<'_>) -> Result<()> {
    let mut status = proxy.receive_status_changed().await?;
    let mut finished = proxy.receive_verification_finished().await?;
    let mut reset = proxy.receive_reset_complete().await?;
    println!("Watching kiosk events (Ctrl-C to stop)...");

    loop {
        tokio::select! {
            Some(signal) = status.next() => {
                let args = signal.args()?;
                println!("[{}] {}", args.severity(), args.message());
            }
            Some(signal) = finished.next() => {
                let args = signal.args()?;
                println!("result: {} | {}", args.outcome(), args.message());
            }
            Some(_) = reset.next() => println!("reset complete"),
            _ = tokio::signal::ctrl_c() => break,
            else => bail!("signal streams closed"),
        }
    }
    Ok(())
}

/// Direct camera test, bypassing the daemon.
async fn run_diagnostics(
    qr_device: String,
    face_device: String,
    save: Option<PathBuf>,
) -> Result<()> {
    println!("Running camera diagnostics...");

    let devices = Camera::list_devices();
    tracing::info!(count = devices.len(), "V4L2 capture devices found");
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for info in &devices {
        println!("  {:<12} {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let source = V4l2Source::new(V4l2Devices {
        environment: Some(qr_device.clone()),
        user: Some(face_device.clone()),
        fallback: qr_device.clone(),
    });

    let mut failures = 0;
    for (mode, path) in [
        (FacingMode::Environment, &qr_device),
        (FacingMode::User, &face_device),
    ] {
        let mut stream = match source.request_stream(&Constraints::facing(mode)).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(facing = %mode, device = %path, error = %err, "camera open failed");
                println!("{mode} camera {path}: {err}");
                failures += 1;
                continue;
            }
        };

        let mut grabbed = None;
        for _ in 0..DIAGNOSTIC_GRABS {
            match stream.next_frame().await {
                Ok(Some(frame)) if frame.is_decodable() => {
                    grabbed = Some(frame);
                    break;
                }
                Ok(_) => tracing::debug!(device = %path, "frame not ready"),
                Err(err) => {
                    tracing::warn!(facing = %mode, device = %path, error = %err, "capture failed");
                    println!("{mode} camera {path}: capture failed: {err}");
                    break;
                }
            }
        }
        stream.stop();

        let Some(frame) = grabbed else {
            println!("{mode} camera {path}: no usable frame in {DIAGNOSTIC_GRABS} grabs");
            failures += 1;
            continue;
        };
        println!(
            "{mode} camera {path}: {}x{} frame, brightness {:.1}",
            frame.width,
            frame.height,
            frame.avg_brightness()
        );

        if let Some(dir) = &save {
            let out = dir.join(format!("{mode}.jpg"));
            std::fs::write(&out, frame.encode_jpeg(90)?)?;
            println!("  saved {}", out.display());
        }
    }

    if failures > 0 {
        bail!("{failures} camera(s) failed diagnostics");
    }
    println!("All cameras OK");
    Ok(())
}
