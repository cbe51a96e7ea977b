//! Capture and analysis, triggered after the accessories are retracted.

use crate::bus::{handler_fn, BusError, EventBus, HandlerError};
use crate::events::{Event, EventKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

const PATH_PLACEHOLDER: &str = "{path}";

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("camera failed: {0}")]
    Camera(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("capture i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Dispatch(#[from] BusError),
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Take a picture and return where it was stored.
    async fn capture(&self) -> Result<PathBuf, CaptureError>;
}

#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    async fn analyze(&self, image: &Path) -> Result<String, CaptureError>;
}

/// Camera driven by an external still-capture program.
///
/// Every `{path}` in the argument list is replaced with the output file.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: String,
    args: Vec<String>,
    output_dir: PathBuf,
}

impl CommandCamera {
    pub fn from_argv(argv: &[String], output_dir: impl Into<PathBuf>) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            output_dir: output_dir.into(),
        })
    }

    fn next_path(&self) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.output_dir.join(format!("capture_{}.jpg", stamp))
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn capture(&self) -> Result<PathBuf, CaptureError> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.next_path();
        let path_arg = path.to_string_lossy().into_owned();
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(PATH_PLACEHOLDER, &path_arg))
            .collect();

        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .await
            .map_err(|e| CaptureError::Camera(format!("{}: {}", self.program, e)))?;

        if !status.success() {
            return Err(CaptureError::Camera(format!(
                "{} exited with {}",
                self.program, status
            )));
        }
        Ok(path)
    }
}

/// Analyzer used when no vision backend is configured.
#[derive(Debug, Default)]
pub struct NoopAnalyzer;

#[async_trait]
impl VisionAnalyzer for NoopAnalyzer {
    async fn analyze(&self, image: &Path) -> Result<String, CaptureError> {
        Ok(format!("captured {} (analysis disabled)", image.display()))
    }
}

/// Takes a picture on capture-requested and publishes the analysis.
pub struct CaptureService {
    bus: Arc<EventBus>,
    camera: Arc<dyn Camera>,
    analyzer: Arc<dyn VisionAnalyzer>,
    captures: AtomicU64,
}

impl CaptureService {
    pub fn new(
        bus: Arc<EventBus>,
        camera: Arc<dyn Camera>,
        analyzer: Arc<dyn VisionAnalyzer>,
    ) -> Self {
        Self {
            bus,
            camera,
            analyzer,
            captures: AtomicU64::new(0),
        }
    }

    pub fn attach(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.bus.subscribe(
            EventKind::CaptureRequested,
            handler_fn("capture.on_request", move |_event| {
                let service = weak.upgrade();
                async move {
                    match service {
                        Some(service) => service
                            .capture_and_analyze()
                            .await
                            .map(|_| ())
                            .map_err(HandlerError::from),
                        None => Ok(()),
                    }
                }
            }),
        );
    }

    /// Capture, analyze, publish. Returns the published summary.
    pub async fn capture_and_analyze(&self) -> Result<String, CaptureError> {
        let image = self.camera.capture().await?;
        self.captures.fetch_add(1, Ordering::Relaxed);
        info!(image = %image.display(), "image captured");

        let summary = match self.analyzer.analyze(&image).await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "image analysis failed");
                return Err(e);
            }
        };

        let image_str = image.to_string_lossy();
        self.bus
            .publish(Event::analysis_result(&image_str, &summary).with_source("capture"))
            .await?;
        Ok(summary)
    }

    pub fn captures(&self) -> u64 {
        self.captures.load(Ordering::Relaxed)
    }
}
