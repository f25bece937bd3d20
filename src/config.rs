//! Command line configuration.
//!
//! Everything the handler needs is built from a [`Config`] once at start-up
//! and handed to the application state; nothing is read from globals.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::gradio::DEFAULT_SPACE;
use crate::pipeline::PipelineOptions;
use crate::relay::{DEFAULT_DOWNLOAD_BASE, DEFAULT_UPLOAD_URL};

const MEGABYTE: u64 = 1024 * 1024;

/// Where the per-image resize happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResizeMode {
    /// Resize locally and relay the JPEG straight to the file host.
    Local,
    /// Resize locally, then run the model's own align/resize step on it.
    Remote,
}

/// How the three per-image pipelines are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Concurrency {
    /// Run face, shape and color together; the first failure cancels the rest.
    Parallel,
    /// Run face, shape and color one after another.
    Sequential,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "hairswap-gateway", version, about = "HTTP gateway for remote hair transfer")]
pub struct Config {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(long, default_value_t = 5000)]
    pub port: u16,

    /// Hosted model space, as `owner/name`
    #[arg(long, default_value = DEFAULT_SPACE)]
    pub space: String,

    /// Explicit model root URL; overrides `--space`
    #[arg(long)]
    pub gradio_url: Option<String>,

    /// File host upload endpoint
    #[arg(long, default_value = DEFAULT_UPLOAD_URL)]
    pub upload_url: String,

    /// Origin whose links get rewritten to direct downloads
    #[arg(long, default_value = DEFAULT_DOWNLOAD_BASE)]
    pub download_base: String,

    /// Resident memory ceiling in megabytes
    #[arg(long, default_value_t = 900)]
    pub memory_threshold_mb: u64,

    #[arg(long, value_enum, default_value_t = ResizeMode::Local)]
    pub resize_mode: ResizeMode,

    #[arg(long, value_enum, default_value_t = Concurrency::Parallel)]
    pub concurrency: Concurrency,

    /// Edge length of the square images sent to the model
    #[arg(long, default_value_t = 480)]
    pub image_size: u32,

    /// Directory for on-disk intermediate files (system temp dir if unset)
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Timeout for calls to the hosted model; unset means wait forever
    #[arg(long)]
    pub remote_timeout_secs: Option<u64>,

    /// Default log filter when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn memory_threshold_bytes(&self) -> u64 {
        self.memory_threshold_mb.saturating_mul(MEGABYTE)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            resize_mode: self.resize_mode,
            concurrency: self.concurrency,
            image_size: self.image_size,
            temp_dir: self.temp_dir.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["hairswap-gateway"])
    }
}
