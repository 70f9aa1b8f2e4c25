use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use renderer::{CpuFrame, RendererError, RetouchEngine, RetouchParameters};

/// Suffix appended to the file stem of every batch output.
pub const OUTPUT_SUFFIX: &str = "_rt";

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("select at least one skin tone before batch processing")]
    NoSkinTones,
    #[error("batch queue is empty")]
    EmptyQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ItemStatus {
    Running,
    Done { output: PathBuf },
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BatchEvent {
    Started {
        run_id: String,
        total: usize,
    },
    Item {
        run_id: String,
        index: usize,
        total: usize,
        source: PathBuf,
        status: ItemStatus,
    },
    Finished {
        run_id: String,
        succeeded: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchFailure {
    pub source: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: String,
    pub outputs: Vec<PathBuf>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outputs.len()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// The export half of the engine contract. Implemented by [`RetouchEngine`].
pub trait OffscreenRenderer {
    fn set_image(&mut self, image: &RgbaImage) -> Result<(), RendererError>;
    fn render_to_buffer(&mut self, params: &RetouchParameters) -> Result<(), RendererError>;
    fn read_pixels(&mut self) -> Result<CpuFrame, RendererError>;
}

impl OffscreenRenderer for RetouchEngine {
    fn set_image(&mut self, image: &RgbaImage) -> Result<(), RendererError> {
        RetouchEngine::set_image(self, image)
    }

    fn render_to_buffer(&mut self, params: &RetouchParameters) -> Result<(), RendererError> {
        RetouchEngine::render_to_buffer(self, params).map(|_| ())
    }

    fn read_pixels(&mut self) -> Result<CpuFrame, RendererError> {
        RetouchEngine::read_pixels(self)
    }
}

pub trait ImageLoader {
    fn load(&mut self, path: &Path) -> Result<RgbaImage>;
}

pub trait FrameWriter {
    /// Persist the retouched frame for `source`; returns where it was written.
    fn write(&mut self, source: &Path, frame: CpuFrame) -> Result<PathBuf>;
}

/// Decodes any format the `image` crate understands.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageLoader;

impl ImageLoader for FsImageLoader {
    fn load(&mut self, path: &Path) -> Result<RgbaImage> {
        let image = image::open(path).with_context(|| format!("decode {}", path.display()))?;
        Ok(image.to_rgba8())
    }
}

/// Writes `<stem>_rt.png` next to the source, or into `output_dir` when set.
#[derive(Debug, Default, Clone)]
pub struct PngWriter {
    pub output_dir: Option<PathBuf>,
}

impl FrameWriter for PngWriter {
    fn write(&mut self, source: &Path, frame: CpuFrame) -> Result<PathBuf> {
        let output = retouched_path(source, self.output_dir.as_deref());
        let image = frame
            .into_rgba_image()
            .context("frame buffer does not match its dimensions")?;
        image
            .save_with_format(&output, image::ImageFormat::Png)
            .with_context(|| format!("save {}", output.display()))?;
        Ok(output)
    }
}

pub fn retouched_path(source: &Path, output_dir: Option<&Path>) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let dir = output_dir
        .map(Path::to_path_buf)
        .or_else(|| source.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    dir.join(format!("{stem}{OUTPUT_SUFFIX}.png"))
}

/// Runs a queue of images through one renderer, strictly one at a time.
pub struct OffscreenBatchRunner<R: OffscreenRenderer = RetouchEngine> {
    renderer: R,
    subscribers: Vec<Sender<BatchEvent>>,
}

impl<R: OffscreenRenderer> OffscreenBatchRunner<R> {
    pub fn new(renderer: R) -> Self {
        Self {
            renderer,
            subscribers: Vec::new(),
        }
    }

    /// Receiver for progress events of every subsequent run. Events are only
    /// queued while at least one receiver is alive.
    pub fn subscribe(&mut self) -> Receiver<BatchEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    pub fn into_renderer(self) -> R {
        self.renderer
    }

    /// Process `queue` in order. Items that fail to load, render or save
    /// (including renderer errors such as an image too large for the device)
    /// are reported and skipped; only the preconditions abort the run.
    pub fn run(
        &mut self,
        queue: &[PathBuf],
        params: &RetouchParameters,
        loader: &mut impl ImageLoader,
        writer: &mut impl FrameWriter,
    ) -> Result<BatchReport, BatchError> {
        if params.skin_tones.is_empty() {
            return Err(BatchError::NoSkinTones);
        }
        if queue.is_empty() {
            return Err(BatchError::EmptyQueue);
        }

        let run_id = Uuid::new_v4().to_string();
        let total = queue.len();
        let export = params.for_export();
        let mut report = BatchReport {
            run_id: run_id.clone(),
            ..Default::default()
        };
        info!(run_id = %run_id, total, "starting batch export");
        self.emit(BatchEvent::Started {
            run_id: run_id.clone(),
            total,
        });

        for (index, source) in queue.iter().enumerate() {
            let name = source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| source.display().to_string());
            info!("processing {name} ({}/{total})", index + 1);
            self.emit_item(&run_id, index, total, source, ItemStatus::Running);

            let status = match self.process(source, &export, loader, writer) {
                Ok(output) => {
                    info!(output = %output.display(), "saved {name}");
                    report.outputs.push(output.clone());
                    ItemStatus::Done { output }
                }
                Err(err) => {
                    let error = format!("{err:#}");
                    warn!("skipping {name}: {error}");
                    report.failures.push(BatchFailure {
                        source: source.clone(),
                        error: error.clone(),
                    });
                    ItemStatus::Failed(error)
                }
            };
            self.emit_item(&run_id, index, total, source, status);
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch export finished"
        );
        self.emit(BatchEvent::Finished {
            run_id,
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Ok(report)
    }

    fn process(
        &mut self,
        source: &Path,
        params: &RetouchParameters,
        loader: &mut impl ImageLoader,
        writer: &mut impl FrameWriter,
    ) -> Result<PathBuf> {
        let image = loader.load(source)?;
        self.renderer.set_image(&image)?;
        self.renderer.render_to_buffer(params)?;
        let frame = self.renderer.read_pixels()?;
        writer.write(source, frame)
    }

    fn emit_item(
        &mut self,
        run_id: &str,
        index: usize,
        total: usize,
        source: &Path,
        status: ItemStatus,
    ) {
        self.emit(BatchEvent::Item {
            run_id: run_id.to_string(),
            index,
            total,
            source: source.to_path_buf(),
            status,
        });
    }

    fn emit(&mut self, event: BatchEvent) {
        // Sending only fails once the receiver is gone.
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
