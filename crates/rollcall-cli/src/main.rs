use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rollcall_core::{
    ArcFaceEmbedder, FaceDetector, FaceEmbedder, Identifier, MultiPassDetector, PipelineConfig, YoloFaceDetector,
};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    async fn identify(&self, image: &[u8]) -> zbus::Result<String>;
    async fn identify_file(&self, path: &str) -> zbus::Result<String>;
    async fn refresh_references(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face identification CLI")]
struct Cli {
    /// Bus the daemon is registered on
    #[arg(long, value_enum, default_value_t = BusKind::Session, global = true)]
    bus: BusKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum BusKind {
    Session,
    System,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify every face in a photo
    Identify {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Let the daemon read the file itself instead of sending its bytes
        #[arg(long)]
        by_path: bool,
    },
    /// Reload the enrolled roster now
    Refresh,
    /// Show daemon status
    Status,
    /// Run face detection locally, without the daemon
    Detect {
        image: PathBuf,
        /// Directory containing yolov8n-face.onnx
        #[arg(long)]
        models_dir: Option<PathBuf>,
        /// Pipeline TOML overriding detection parameters
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Compute enrollment embeddings locally, one per portrait
    Embed {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Directory containing yolov8n-face.onnx and w600k_r50.onnx
        #[arg(long)]
        models_dir: Option<PathBuf>,
        /// Pipeline TOML overriding detection parameters
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ROLLCALL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { image, by_path } => {
            let proxy = connect(cli.bus).await?;
            let json = if by_path {
                let absolute = std::fs::canonicalize(&image)
                    .with_context(|| format!("resolving {}", image.display()))?;
                proxy.identify_file(&absolute.to_string_lossy()).await?
            } else {
                let bytes = std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
                proxy.identify(&bytes).await?
            };
            print_json(&json)?;
        }
        Commands::Refresh => {
            let proxy = connect(cli.bus).await?;
            print_json(&proxy.refresh_references().await?)?;
        }
        Commands::Status => match connect(cli.bus).await {
            Ok(proxy) => print_json(&proxy.status().await?)?,
            Err(e) => {
                tracing::debug!(error = %e, "daemon connection failed");
                println!("rollcalld: not connected");
            }
        },
        Commands::Detect {
            image,
            models_dir,
            config,
        } => detect_local(&image, models_dir, config.as_deref())?,
        Commands::Embed {
            images,
            models_dir,
            config,
        } => embed_local(&images, models_dir, config.as_deref())?,
    }

    Ok(())
}

async fn connect(bus: BusKind) -> Result<RollcallProxy<'static>> {
    let connection = match bus {
        BusKind::Session => zbus::Connection::session().await,
        BusKind::System => zbus::Connection::system().await,
    }
    .context("connecting to D-Bus")?;
    RollcallProxy::new(&connection)
        .await
        .context("creating rollcalld proxy")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn load_pipeline(config: Option<&Path>) -> Result<PipelineConfig> {
    match config {
        Some(path) => {
            let src = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(PipelineConfig::from_toml(&src)?)
        }
        None => Ok(PipelineConfig::default()),
    }
}

fn detect_local(image: &Path, models_dir: Option<PathBuf>, config: Option<&Path>) -> Result<()> {
    let pipeline = load_pipeline(config)?;

    let model_path = models_dir
        .unwrap_or_else(default_model_dir)
        .join("yolov8n-face.onnx");
    let detector = YoloFaceDetector::load(&model_path.to_string_lossy(), pipeline.detection.inference_size)?;
    let mut detector = MultiPassDetector::new(detector, pipeline.detection);

    let rgb = image::open(image)
        .with_context(|| format!("opening {}", image.display()))?
        .to_rgb8();
    let faces = detector.detect(&rgb)?;

    println!("{}", serde_json::to_string_pretty(&faces)?);
    Ok(())
}

fn embed_local(images: &[PathBuf], models_dir: Option<PathBuf>, config: Option<&Path>) -> Result<()> {
    let pipeline = load_pipeline(config)?;
    let models_dir = models_dir.unwrap_or_else(default_model_dir);

    let detector = YoloFaceDetector::load(
        &models_dir.join("yolov8n-face.onnx").to_string_lossy(),
        pipeline.detection.inference_size,
    )?;
    let embedder = ArcFaceEmbedder::load(&models_dir.join("w600k_r50.onnx").to_string_lossy())?;
    let mut identifier = Identifier::from_config(detector, embedder, &pipeline);

    let enrolled = embed_files(&mut identifier, images);
    if enrolled.len() < images.len() {
        eprintln!("embedded {} of {} images", enrolled.len(), images.len());
    }
    println!("{}", serde_json::to_string_pretty(&enrolled)?);
    Ok(())
}

/// One `{file, embedding}` entry per image that yielded a face.
///
/// Unreadable images and images without a usable face are logged and left out.
fn embed_files<D: FaceDetector, E: FaceEmbedder>(
    identifier: &mut Identifier<D, E>,
    images: &[PathBuf],
) -> Vec<serde_json::Value> {
    let mut enrolled = Vec::with_capacity(images.len());
    for path in images {
        let rgb = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "cannot read image; skipping");
                continue;
            }
        };
        match identifier.embed_primary(&rgb) {
            Ok(Some(embedding)) => enrolled.push(serde_json::json!({
                "file": path.to_string_lossy(),
                "embedding": embedding.values,
            })),
            Ok(None) => tracing::warn!(file = %path.display(), "no face found; skipping"),
            Err(e) => tracing::warn!(file = %path.display(), error = %e, "embedding failed; skipping"),
        }
    }
    enrolled
}

fn default_model_dir() -> PathBuf {
    std::env::var("ROLLCALL_MODEL_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let data = std::env::var("XDG_DATA_HOME").map(PathBuf::from).unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            });
            data.join("rollcall/models")
        })
}
