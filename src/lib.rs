//! HTTP gateway in front of a hosted hair transfer model.
//!
//! `POST /process-hair-swap` takes a face, a hair-shape donor and a
//! hair-color donor by URL, squares them to 480x480, relays them through a
//! public file host, asks the model to swap, and answers with a direct
//! download link to the result.

pub mod artifact;
pub mod config;
pub mod error;
pub mod gradio;
pub mod guard;
pub mod handler;
pub mod logging;
pub mod pipeline;
pub mod preprocess;
pub mod relay;

pub use config::Config;
pub use error::{GatewayError, Result};
pub use handler::{AppState, configure};
