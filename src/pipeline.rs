//! Request orchestration: three per-image pipelines, one swap, one relay.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::try_join3;
use tracing::{info, instrument};

use crate::artifact::{TempArtifact, cleanup_all};
use crate::config::{Concurrency, ResizeMode};
use crate::error::Result;
use crate::gradio::{BlendOptions, FileRef, InferenceClient, Slot};
use crate::guard::Supervisor;
use crate::preprocess::{DEFAULT_IMAGE_SIZE, ImageSource, resize_off_thread};
use crate::relay::Relay;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub resize_mode: ResizeMode,
    pub concurrency: Concurrency,
    pub image_size: u32,
    pub temp_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            resize_mode: ResizeMode::Local,
            concurrency: Concurrency::Parallel,
            image_size: DEFAULT_IMAGE_SIZE,
            temp_dir: None,
        }
    }
}

/// A validated swap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapParams {
    pub face_url: String,
    pub shape_url: String,
    pub color_url: String,
    pub blend: BlendOptions,
}

impl SwapParams {
    fn url(&self, slot: Slot) -> &str {
        match slot {
            Slot::Face => &self.face_url,
            Slot::Shape => &self.shape_url,
            Slot::Color => &self.color_url,
        }
    }
}

/// Output of one per-image task. Owned by that task alone until the
/// orchestrator merges the three after fan-in.
#[derive(Debug)]
pub struct PreparedSlot {
    pub file: FileRef,
    pub artifacts: Vec<TempArtifact>,
}

pub struct Pipeline {
    images: Arc<dyn ImageSource>,
    relay: Arc<dyn Relay>,
    inference: Arc<dyn InferenceClient>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        images: Arc<dyn ImageSource>,
        relay: Arc<dyn Relay>,
        inference: Arc<dyn InferenceClient>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            images,
            relay,
            inference,
            options,
        }
    }

    /// Run a whole swap and return the public URL of the result.
    ///
    /// Every on-disk artifact is gone by the time this returns, whatever the
    /// outcome.
    #[instrument(skip_all, fields(mode = ?self.options.resize_mode, concurrency = ?self.options.concurrency))]
    pub async fn run(&self, params: &SwapParams, supervisor: &Supervisor) -> Result<String> {
        let (face, shape, color) = self.prepare_all(params).await?;

        let mut artifacts = Vec::new();
        let files = [face, shape, color].map(|prepared| {
            artifacts.extend(prepared.artifacts);
            prepared.file
        });

        let outcome = self.swap_and_relay(&files, &params.blend, supervisor, &mut artifacts).await;
        cleanup_all(artifacts);
        outcome
    }

    async fn prepare_all(&self, params: &SwapParams) -> Result<(PreparedSlot, PreparedSlot, PreparedSlot)> {
        let [face, shape, color] = Slot::ALL;
        match self.options.concurrency {
            // Dropping the unfinished siblings on the first error is the
            // cancellation; their temp files go with them.
            Concurrency::Parallel => {
                try_join3(
                    self.prepare_slot(face, params.url(face)),
                    self.prepare_slot(shape, params.url(shape)),
                    self.prepare_slot(color, params.url(color)),
                )
                .await
            }
            Concurrency::Sequential => Ok((
                self.prepare_slot(face, params.url(face)).await?,
                self.prepare_slot(shape, params.url(shape)).await?,
                self.prepare_slot(color, params.url(color)).await?,
            )),
        }
    }

    /// Fetch, resize and relay one source image.
    #[instrument(skip(self, slot), fields(slot = slot.keyword()))]
    pub async fn prepare_slot(&self, slot: Slot, url: &str) -> Result<PreparedSlot> {
        let source = self.images.fetch(url).await?;
        let resized = resize_off_thread(source, self.options.image_size).await?;

        let (file, artifacts) = match self.options.resize_mode {
            ResizeMode::Local => {
                let artifact = TempArtifact::memory(resized);
                let url = self.relay.upload(&artifact).await?;
                (FileRef::Url(url), vec![artifact])
            }
            ResizeMode::Remote => {
                let staged = TempArtifact::disk(self.options.temp_dir.as_deref(), &resized)?;
                let uploaded = self.inference.upload(&staged).await?;
                let aligned = self.inference.resize(slot, &uploaded).await?;
                let aligned = self.images.fetch(&self.inference.file_url(&aligned)).await?;
                // The model answers in its own format; the relay only takes JPEG.
                let aligned = resize_off_thread(aligned, self.options.image_size).await?;
                let aligned = TempArtifact::memory(aligned);
                let url = self.relay.upload(&aligned).await?;
                (FileRef::Url(url), vec![staged, aligned])
            }
        };
        info!(file = file.as_str(), "slot prepared");
        Ok(PreparedSlot { file, artifacts })
    }

    async fn swap_and_relay(
        &self,
        files: &[FileRef; 3],
        blend: &BlendOptions,
        supervisor: &Supervisor,
        artifacts: &mut Vec<TempArtifact>,
    ) -> Result<String> {
        supervisor.checkpoint("swap")?;

        let [face, shape, color] = files;
        let output = self.inference.swap(face, shape, color, blend).await?;
        let result = output.into_file()?;
        info!(result = result.as_str(), "swap finished");

        let bytes = self.images.fetch(&self.inference.file_url(&result)).await?;
        let resized = resize_off_thread(bytes, self.options.image_size).await?;
        let artifact = match self.options.resize_mode {
            ResizeMode::Local => TempArtifact::memory(resized),
            ResizeMode::Remote => TempArtifact::disk(self.options.temp_dir.as_deref(), &resized)?,
        };
        let relayed = self.relay.upload(&artifact).await;
        artifacts.push(artifact);
        relayed
    }
}
