//! Client for the hosted hair transfer model.
//!
//! The model runs as a Gradio application. A call is two requests: a POST to
//! `/gradio_api/call/{api}` that queues the job and hands back an event id,
//! then a GET on the same path plus the id that streams server-sent events
//! until `complete` or `error`.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::artifact::TempArtifact;
use crate::error::{GatewayError, Result};

pub const DEFAULT_SPACE: &str = "AIRI-Institute/HairFastGAN";

/// The three source images of a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Face,
    Shape,
    Color,
}

impl Slot {
    pub const ALL: [Slot; 3] = [Slot::Face, Slot::Shape, Slot::Color];

    pub fn keyword(self) -> &'static str {
        match self {
            Slot::Face => "face",
            Slot::Shape => "shape",
            Slot::Color => "color",
        }
    }

    /// Label the model's align checkbox group uses for this slot.
    pub fn label(self) -> &'static str {
        match self {
            Slot::Face => "Face",
            Slot::Shape => "Shape",
            Slot::Color => "Color",
        }
    }

    pub fn resize_endpoint(self) -> &'static str {
        match self {
            Slot::Face => "/resize_inner",
            Slot::Shape => "/resize_inner_1",
            Slot::Color => "/resize_inner_2",
        }
    }
}

/// Tuning knobs forwarded to `/swap_hair`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlendOptions {
    pub blending: String,
    pub poisson_iters: i64,
    pub poisson_erosion: i64,
}

impl Default for BlendOptions {
    fn default() -> Self {
        Self {
            blending: "Article".to_string(),
            poisson_iters: 2500,
            poisson_erosion: 100,
        }
    }
}

/// A file as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    /// Publicly fetchable; the model downloads it itself.
    Url(String),
    /// Path on the model host, as returned by its upload route.
    Path(String),
}

impl FileRef {
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(s) if is_url(s) => Ok(Self::Url(s.clone())),
            Value::String(s) => Ok(Self::Path(s.clone())),
            Value::Object(map) => {
                if let Some(url) = map.get("url").and_then(Value::as_str) {
                    Ok(Self::Url(url.to_string()))
                } else if let Some(path) = map.get("path").and_then(Value::as_str) {
                    Self::from_value(&Value::String(path.to_string()))
                } else {
                    Err(GatewayError::remote(format!("file reference without url or path: {value}")))
                }
            }
            other => Err(GatewayError::remote(format!("not a file reference: {other}"))),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(s) | Self::Path(s) => s,
        }
    }

    /// Gradio `FileData` payload.
    pub fn to_file_data(&self) -> Value {
        match self {
            Self::Url(url) => json!({
                "path": url,
                "url": url,
                "meta": { "_type": "gradio.FileData" },
            }),
            Self::Path(path) => json!({
                "path": path,
                "meta": { "_type": "gradio.FileData" },
            }),
        }
    }
}

fn is_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// One entry of a multi-output response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultSlot {
    Descriptor { visible: bool, value: Option<Value> },
    Opaque(Value),
}

impl ResultSlot {
    fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Descriptor {
                visible: map.get("visible").is_some_and(is_truthy),
                value: map.get("value").cloned(),
            },
            other => Self::Opaque(other),
        }
    }
}

/// What `/swap_hair` hands back. The service answers either with the file
/// directly or with a list of component updates, only one of which is
/// visible and carries the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SwapOutput {
    Single(Value),
    Slots(Vec<ResultSlot>),
}

impl SwapOutput {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Slots(items.into_iter().map(ResultSlot::from_value).collect()),
            other => Self::Single(other),
        }
    }

    /// The first visible slot that has a value, or the bare file.
    pub fn into_file(self) -> Result<FileRef> {
        let selected = match &self {
            Self::Single(value) => Some(value),
            Self::Slots(slots) => slots.iter().find_map(|slot| match slot {
                ResultSlot::Descriptor {
                    visible: true,
                    value: Some(value),
                } => Some(value),
                _ => None,
            }),
        };
        match selected {
            Some(value) if is_truthy(value) => FileRef::from_value(value),
            _ => Err(GatewayError::remote(format!(
                "unexpected swap output format: {}",
                serde_json::to_string(&self).unwrap_or_default()
            ))),
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Push a local artifact to the model host.
    async fn upload(&self, artifact: &TempArtifact) -> Result<FileRef>;

    /// Run the model's own align/resize step for one slot.
    async fn resize(&self, slot: Slot, file: &FileRef) -> Result<FileRef>;

    async fn swap(
        &self,
        face: &FileRef,
        shape: &FileRef,
        color: &FileRef,
        options: &BlendOptions,
    ) -> Result<SwapOutput>;

    /// Where a file returned by the model can be downloaded.
    fn file_url(&self, file: &FileRef) -> String;
}

/// `owner/name` to its `hf.space` origin.
pub fn space_root(space: &str) -> String {
    let host: String = space
        .chars()
        .map(|c| match c {
            '/' | '.' | '_' => '-',
            c => c.to_ascii_lowercase(),
        })
        .collect();
    format!("https://{host}.hf.space")
}

#[derive(Deserialize)]
struct EventTicket {
    event_id: String,
}

#[derive(Debug, Clone)]
pub struct GradioClient {
    client: reqwest::Client,
    root: String,
}

impl GradioClient {
    pub fn new(client: reqwest::Client, root: &str) -> Self {
        Self {
            client,
            root: root.trim_end_matches('/').to_string(),
        }
    }

    pub fn for_space(client: reqwest::Client, space: &str) -> Self {
        Self::new(client, &space_root(space))
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    #[instrument(skip(self, data), fields(root = %self.root))]
    async fn call(&self, api_name: &str, data: Vec<Value>) -> Result<Vec<Value>> {
        let endpoint = format!("{}/gradio_api/call/{}", self.root, api_name.trim_start_matches('/'));

        let response = self
            .client
            .post(&endpoint)
            .json(&json!({ "data": data }))
            .send()
            .await
            .map_err(|e| GatewayError::network(format!("call to {api_name} failed"), e))?;
        let response = ensure_success(&endpoint, response).await?;
        let ticket: EventTicket = response
            .json()
            .await
            .map_err(|e| GatewayError::network(format!("invalid queue response from {api_name}"), e))?;
        debug!(event_id = %ticket.event_id, "job queued");

        let stream_url = format!("{endpoint}/{}", ticket.event_id);
        let response = self
            .client
            .get(&stream_url)
            .send()
            .await
            .map_err(|e| GatewayError::network(format!("result stream of {api_name} failed"), e))?;
        let response = ensure_success(&stream_url, response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::network(format!("failed reading result of {api_name}"), e))?;
        parse_event_stream(&body)
    }
}

async fn ensure_success(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl InferenceClient for GradioClient {
    async fn upload(&self, artifact: &TempArtifact) -> Result<FileRef> {
        let name = artifact
            .path()
            .and_then(|path| path.file_name())
            .and_then(|name| name.to_str())
            .unwrap_or("image.jpg")
            .to_string();
        let part = Part::bytes(artifact.bytes().await?)
            .file_name(name)
            .mime_str("image/jpeg")
            .map_err(|e| GatewayError::network("invalid upload content type", e))?;
        let endpoint = format!("{}/gradio_api/upload", self.root);

        let response = self
            .client
            .post(&endpoint)
            .multipart(Form::new().part("files", part))
            .send()
            .await
            .map_err(|e| GatewayError::network("upload to model host failed", e))?;
        let response = ensure_success(&endpoint, response).await?;
        let paths: Vec<String> = response
            .json()
            .await
            .map_err(|e| GatewayError::network("invalid upload response from model host", e))?;
        paths
            .into_iter()
            .next()
            .map(FileRef::Path)
            .ok_or_else(|| GatewayError::remote("model host accepted upload but returned no path"))
    }

    async fn resize(&self, slot: Slot, file: &FileRef) -> Result<FileRef> {
        let outputs = self
            .call(slot.resize_endpoint(), vec![file.to_file_data(), json!([slot.label()])])
            .await?;
        let first = outputs
            .first()
            .ok_or_else(|| GatewayError::remote(format!("{} returned nothing", slot.resize_endpoint())))?;
        FileRef::from_value(first)
    }

    async fn swap(
        &self,
        face: &FileRef,
        shape: &FileRef,
        color: &FileRef,
        options: &BlendOptions,
    ) -> Result<SwapOutput> {
        let data = vec![
            face.to_file_data(),
            shape.to_file_data(),
            color.to_file_data(),
            json!(options.blending),
            json!(options.poisson_iters),
            json!(options.poisson_erosion),
        ];
        let mut outputs = self.call("/swap_hair", data).await?;
        let output = if outputs.len() == 1 {
            outputs.remove(0)
        } else {
            Value::Array(outputs)
        };
        Ok(SwapOutput::from_value(output))
    }

    fn file_url(&self, file: &FileRef) -> String {
        match file {
            FileRef::Url(url) => url.clone(),
            FileRef::Path(path) => format!("{}/gradio_api/file={path}", self.root),
        }
    }
}

/// Read a finished server-sent event stream down to the `complete` payload.
pub fn parse_event_stream(body: &str) -> Result<Vec<Value>> {
    for block in body.split("\n\n") {
        let mut event = None;
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(name) = line.strip_prefix("event:") {
                event = Some(name.trim());
            } else if let Some(chunk) = line.strip_prefix("data:") {
                data.push(chunk.trim_start());
            }
        }
        let data = data.join("\n");
        match event {
            Some("complete") => {
                let value: Value = serde_json::from_str(&data).map_err(|e| {
                    GatewayError::remote(format!("malformed result payload: {e}"))
                })?;
                return Ok(match value {
                    Value::Array(items) => items,
                    other => vec![other],
                });
            }
            Some("error") => {
                return Err(GatewayError::remote(format!("remote model reported an error: {data}")));
            }
            _ => {}
        }
    }
    Err(GatewayError::remote("result stream ended without a result"))
}
