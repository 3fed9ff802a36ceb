use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{imgproc, EncoderConfig, FaceEncoder, QualityConfig, QualityGate, ScrfdDetector};
use facegate_hw::{Camera, FrameSource};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face authentication CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a new user from the camera or a directory of images
    Enroll {
        /// Display name of the user
        #[arg(short, long)]
        name: String,
        /// Access level: 1 (admin), 2 (operator) or 3 (standard)
        #[arg(short, long, default_value_t = 3)]
        level: u8,
        /// Enroll from the PNG/JPEG files in this directory instead of the camera
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Authenticate the face in front of the camera
    Auth,
    /// Cancel the running authentication or enrollment
    Cancel,
    /// List enrolled users (confirms your identity by face)
    List,
    /// Delete an enrolled user (level 1 only; confirms your identity by face)
    Delete {
        /// User ID to delete
        id: i64,
    },
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Number of frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: usize,
        /// Save the last captured frame to this path
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
    /// Run the quality gate and encoder on an image file (offline)
    Check {
        /// Image to analyse
        image: PathBuf,
        /// SCRFD model file
        #[arg(short, long)]
        model: Option<PathBuf>,
    },
}

#[zbus::proxy(
    interface = "org.facegate.Daemon1",
    default_service = "org.facegate.Daemon1",
    default_path = "/org/facegate/Daemon1"
)]
trait Daemon {
    async fn authenticate(&self) -> zbus::Result<String>;
    async fn enroll(&self, name: &str, level: u8) -> zbus::Result<i64>;
    async fn enroll_from_directory(&self, name: &str, level: u8, dir: &str) -> zbus::Result<i64>;
    async fn cancel(&self) -> zbus::Result<()>;
    async fn list_users(&self) -> zbus::Result<String>;
    async fn delete_user(&self, id: i64) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn connect() -> Result<DaemonProxy<'static>> {
    let conn = if std::env::var("FACEGATE_SESSION_BUS").map(|v| v == "1").unwrap_or(false) {
        zbus::Connection::session().await?
    } else {
        zbus::Connection::system().await?
    };
    DaemonProxy::new(&conn).await.context("facegated is not reachable")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Enroll { name, level, dir } => {
            let proxy = connect().await?;
            let id = match dir {
                Some(dir) => {
                    let dir = dir.canonicalize().with_context(|| format!("cannot access {}", dir.display()))?;
                    println!("Enrolling {name} from {}...", dir.display());
                    proxy.enroll_from_directory(&name, level, &dir.to_string_lossy()).await?
                }
                None => {
                    println!("Enrolling {name}; look at the camera...");
                    proxy.enroll(&name, level).await?
                }
            };
            println!("Enrolled {name} with id {id}");
        }
        Commands::Auth => {
            let proxy = connect().await?;
            println!("Authenticating; look at the camera...");
            let outcome: serde_json::Value = serde_json::from_str(&proxy.authenticate().await?)?;
            if outcome["granted"].as_bool().unwrap_or(false) {
                println!(
                    "Access granted: {} (level {}, best {:.3}, mean {:.3})",
                    outcome["user"].as_str().unwrap_or("?"),
                    outcome["access_level"],
                    outcome["best_score"].as_f64().unwrap_or(0.0),
                    outcome["mean_top_k"].as_f64().unwrap_or(0.0),
                );
            } else {
                println!("Access not granted ({})", outcome["outcome"].as_str().unwrap_or("unknown"));
                if let Some(last) = outcome["last_status"].as_str() {
                    println!("  last status: {last}");
                }
                std::process::exit(1);
            }
        }
        Commands::Cancel => {
            connect().await?.cancel().await?;
            println!("Cancel requested");
        }
        Commands::List => {
            let proxy = connect().await?;
            println!("Confirming identity; look at the camera...");
            let users: serde_json::Value = serde_json::from_str(&proxy.list_users().await?)?;
            let users = users.as_array().cloned().unwrap_or_default();
            if users.is_empty() {
                println!("No users enrolled");
            }
            for u in users {
                println!(
                    "{:>4}  {:<20} level {}  {:>4} templates  {}",
                    u["id"],
                    u["name"].as_str().unwrap_or(""),
                    u["access_level"],
                    u["templates"],
                    u["created_at"].as_str().unwrap_or(""),
                );
            }
        }
        Commands::Delete { id } => {
            let proxy = connect().await?;
            println!("Confirming identity; look at the camera...");
            if proxy.delete_user(id).await? {
                println!("Deleted user {id}");
            } else {
                bail!("no user with id {id}");
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&connect().await?.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, frames, save } => run_camera_test(&device, frames, save)?,
        Commands::Check { image, model } => run_check(&image, model)?,
    }

    Ok(())
}

fn run_camera_test(device: &str, count: usize, save: Option<PathBuf>) -> Result<()> {
    println!("Capture devices:");
    for info in Camera::list_devices() {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let mut camera = Camera::open(device)?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let mut last = None;
    for i in 0..count {
        let Some(frame) = camera.next_frame() else {
            println!("  frame {i}: capture failed");
            continue;
        };
        let brightness = imgproc::mean_intensity(&imgproc::to_gray(&frame));
        println!("  frame {i}: {}x{} brightness {brightness:.1}", frame.width(), frame.height());
        last = Some(frame);
    }

    match (save, last) {
        (Some(path), Some(frame)) => {
            frame.save(&path).with_context(|| format!("failed to save {}", path.display()))?;
            println!("Saved last frame to {}", path.display());
        }
        (_, None) => bail!("no frames captured"),
        _ => {}
    }
    Ok(())
}

fn run_check(image: &Path, model: Option<PathBuf>) -> Result<()> {
    let model = model.unwrap_or_else(default_model_path);
    let detector = Arc::new(
        ScrfdDetector::load(&model).with_context(|| format!("failed to load detector {}", model.display()))?,
    );
    let frame = image::open(image)
        .with_context(|| format!("failed to read {}", image.display()))?
        .to_rgb8();

    let gate = QualityGate::new(detector.clone(), QualityConfig::default());
    match gate.check(&frame) {
        Ok(report) => println!(
            "Quality: OK (face {}x{} at {},{}; brightness {:.1}; sharpness {:.1})",
            report.face.bounds.width,
            report.face.bounds.height,
            report.face.bounds.x,
            report.face.bounds.y,
            report.brightness,
            report.sharpness
        ),
        Err(rejection) => println!("Quality: rejected ({rejection})"),
    }

    let encoder = FaceEncoder::new(detector, EncoderConfig::default());
    match encoder.encode(&frame) {
        Some(vector) => println!("Encoding: {} values, norm {:.4}", vector.len(), vector.norm()),
        None => println!("Encoding: failed"),
    }
    Ok(())
}

fn default_model_path() -> PathBuf {
    let dir = std::env::var("FACEGATE_MODEL_DIR").map(PathBuf::from).unwrap_or_else(|_| {
        std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())).join(".local/share")
            })
            .join("facegate/models")
    });
    dir.join("det_10g.onnx")
}
