use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Every failure a hair swap request can end in.
///
/// The `Display` text is what callers see in the `error` field of the JSON
/// body; the full chain only goes to the server log.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),

    #[error("{context}: {source}")]
    Network {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("{0}")]
    RemoteInference(String),

    #[error("invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("temporary file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("resident memory {rss_mb} MB exceeds {threshold_mb} MB")]
    ResourcePressure { rss_mb: u64, threshold_mb: u64 },
}

impl GatewayError {
    pub fn network(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            context: context.into(),
            source,
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteInference(message.into())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::ResourcePressure { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.to_string(),
        })
    }
}
