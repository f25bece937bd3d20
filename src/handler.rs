use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpResponse, Responder, get, post, web};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::gradio::{BlendOptions, GradioClient};
use crate::guard::{MemoryGuard, Supervisor, TerminateProcess};
use crate::pipeline::{Pipeline, SwapParams};
use crate::preprocess::HttpImageSource;
use crate::relay::TmpfilesRelay;

const MISSING_URLS: &str = "face_url, shape_url, and color_url are required";

// Struct to receive the swap request in JSON format.
// Fields stay loosely typed so a missing URL is reported before any bad
// tuning value.
#[derive(Debug, Deserialize)]
pub struct SwapRequest {
    face_url: Option<Value>,
    shape_url: Option<Value>,
    color_url: Option<Value>,
    #[serde(default)]
    blending: Option<Value>,
    #[serde(default)]
    poisson_iters: Option<Value>,
    #[serde(default)]
    poisson_erosion: Option<Value>,
}

impl SwapRequest {
    /// Parsed regardless of content type.
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("invalid JSON body: {e}")))
    }

    pub fn validate(self) -> Result<SwapParams> {
        let (Some(face_url), Some(shape_url), Some(color_url)) = (
            present_url(self.face_url),
            present_url(self.shape_url),
            present_url(self.color_url),
        ) else {
            return Err(GatewayError::Validation(MISSING_URLS.to_string()));
        };

        let defaults = BlendOptions::default();
        let blending = match self.blending {
            None => defaults.blending,
            Some(Value::String(blending)) => blending,
            Some(other) => {
                return Err(GatewayError::InvalidParameter {
                    name: "blending",
                    value: other.to_string(),
                });
            }
        };
        Ok(SwapParams {
            face_url,
            shape_url,
            color_url,
            blend: BlendOptions {
                blending,
                poisson_iters: coerce_int(
                    "poisson_iters",
                    self.poisson_iters,
                    defaults.poisson_iters,
                )?,
                poisson_erosion: coerce_int(
                    "poisson_erosion",
                    self.poisson_erosion,
                    defaults.poisson_erosion,
                )?,
            },
        })
    }
}

fn present_url(value: Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(url)) if !url.is_empty() => Some(url),
        _ => None,
    }
}

/// Integer knob from a loosely typed JSON value: integers, floats
/// (truncated toward zero), booleans and numeric strings are accepted.
fn coerce_int(name: &'static str, value: Option<Value>, default: i64) -> Result<i64> {
    let Some(value) = value else {
        return Ok(default);
    };
    let coerced = match &value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && f.abs() < i64::MAX as f64)
                .map(|f| f.trunc() as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    coerced.ok_or_else(|| GatewayError::InvalidParameter {
        name,
        value: value.to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwapResponse {
    pub result_url: String,
}

pub struct AppState {
    pub pipeline: Pipeline,
    pub supervisor: Supervisor,
}

impl AppState {
    pub fn new(pipeline: Pipeline, supervisor: Supervisor) -> Self {
        Self {
            pipeline,
            supervisor,
        }
    }

    /// Production wiring: real HTTP collaborators and a guard that kills the
    /// process on memory pressure.
    pub fn from_config(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::network("failed to build HTTP client", e))?;

        let mut remote = reqwest::Client::builder();
        if let Some(secs) = config.remote_timeout_secs {
            remote = remote.timeout(Duration::from_secs(secs));
        }
        let remote = remote
            .build()
            .map_err(|e| GatewayError::network("failed to build model client", e))?;
        let inference = match &config.gradio_url {
            Some(url) => GradioClient::new(remote, url),
            None => GradioClient::for_space(remote, &config.space),
        };
        info!(root = inference.root(), "using hosted model");

        let pipeline = Pipeline::new(
            Arc::new(HttpImageSource::new(http.clone())),
            Arc::new(TmpfilesRelay::new(http, &config.upload_url, &config.download_base)),
            Arc::new(inference),
            config.pipeline_options(),
        );
        let supervisor = Supervisor::new(
            MemoryGuard::new(config.memory_threshold_bytes()),
            Arc::new(TerminateProcess),
        );
        Ok(Self::new(pipeline, supervisor))
    }
}

#[post("/process-hair-swap")]
pub async fn process_hair_swap(
    data: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse> {
    data.supervisor.checkpoint("request")?;
    let params = SwapRequest::parse(&body)?.validate()?;

    match data.pipeline.run(&params, &data.supervisor).await {
        Ok(result_url) => {
            info!(%result_url, "hair swap finished");
            Ok(HttpResponse::Ok().json(SwapResponse { result_url }))
        }
        Err(err) => {
            error!(error = ?err, "hair swap failed");
            Err(err)
        }
    }
}

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(process_hair_swap).service(health);
}
