//! Relay of artifacts through a public anonymous file host.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use tracing::debug;

use crate::artifact::TempArtifact;
use crate::error::{GatewayError, Result};

pub const DEFAULT_UPLOAD_URL: &str = "https://tmpfiles.org/api/v1/upload";
pub const DEFAULT_DOWNLOAD_BASE: &str = "https://tmpfiles.org/";

const UPLOAD_FILE_NAME: &str = "resized.jpg";
const DOWNLOAD_MARKER: &str = "/dl/";

/// Turns an artifact into a public URL.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn upload(&self, artifact: &TempArtifact) -> Result<String>;
}

pub struct TmpfilesRelay {
    client: reqwest::Client,
    upload_url: String,
    download_base: String,
}

impl TmpfilesRelay {
    pub fn new(client: reqwest::Client, upload_url: &str, download_base: &str) -> Self {
        let mut download_base = download_base.to_string();
        if !download_base.ends_with('/') {
            download_base.push('/');
        }
        Self {
            client,
            upload_url: upload_url.to_string(),
            download_base,
        }
    }
}

#[async_trait]
impl Relay for TmpfilesRelay {
    async fn upload(&self, artifact: &TempArtifact) -> Result<String> {
        let part = Part::bytes(artifact.bytes().await?)
            .file_name(UPLOAD_FILE_NAME)
            .mime_str("image/jpeg")
            .map_err(|e| GatewayError::network("invalid upload content type", e))?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| GatewayError::network(format!("upload to {} failed", self.upload_url), e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::network("failed reading upload response", e))?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                url: self.upload_url.clone(),
                status: status.as_u16(),
                body,
            });
        }

        let url = normalize_download_url(&extract_uploaded_url(&body), &self.download_base);
        debug!(%url, "artifact relayed");
        Ok(url)
    }
}

/// Pull the URL out of whatever the file host answered.
///
/// JSON bodies are searched for `data.url`, `url` and `link` in that order;
/// failing those the parsed value itself is used. Non-JSON bodies are taken
/// verbatim, trimmed.
pub fn extract_uploaded_url(body: &str) -> String {
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return body.trim().to_string(),
    };

    let found = [value.pointer("/data/url"), value.get("url"), value.get("link")]
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .find(|url| !url.is_empty())
        .map(str::to_string);

    match (found, value) {
        (Some(url), _) => url,
        (None, Value::String(raw)) => raw,
        (None, raw) => raw.to_string(),
    }
}

/// Rewrite landing-page links under `base` into direct-download links.
/// Idempotent.
pub fn normalize_download_url(url: &str, base: &str) -> String {
    match url.strip_prefix(base) {
        Some(rest) if !url.contains(DOWNLOAD_MARKER) => format!("{base}dl/{rest}"),
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_data_url_wins() {
        let body = r#"{"status":"success","data":{"url":"https://tmpfiles.org/1/a.jpg"},"url":"https://x/2","link":"https://x/3"}"#;
        assert_eq!(extract_uploaded_url(body), "https://tmpfiles.org/1/a.jpg");
    }

    #[test]
    fn top_level_url_before_link() {
        let body = r#"{"data":{},"url":"https://x/2","link":"https://x/3"}"#;
        assert_eq!(extract_uploaded_url(body), "https://x/2");
    }

    #[test]
    fn link_is_last_resort_field() {
        let body = r#"{"data":{"url":""},"url":null,"link":"https://x/3"}"#;
        assert_eq!(extract_uploaded_url(body), "https://x/3");
    }

    #[test]
    fn json_without_fields_falls_back_to_raw_value() {
        assert_eq!(extract_uploaded_url(r#""https://x/4""#), "https://x/4");
        assert_eq!(extract_uploaded_url(r#"{"status":"ok"}"#), r#"{"status":"ok"}"#);
    }

    #[test]
    fn plain_text_body_is_trimmed() {
        assert_eq!(
            extract_uploaded_url("  https://tmpfiles.org/5/b.jpg\n"),
            "https://tmpfiles.org/5/b.jpg"
        );
    }

    #[test]
    fn landing_links_become_downloads() {
        assert_eq!(
            normalize_download_url("https://tmpfiles.org/123/resized.jpg", DEFAULT_DOWNLOAD_BASE),
            "https://tmpfiles.org/dl/123/resized.jpg"
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_download_url("https://tmpfiles.org/9/r.jpg", DEFAULT_DOWNLOAD_BASE);
        let twice = normalize_download_url(&once, DEFAULT_DOWNLOAD_BASE);
        assert_eq!(once, twice);
        assert_eq!(
            normalize_download_url("https://tmpfiles.org/dl/9/r.jpg", DEFAULT_DOWNLOAD_BASE),
            "https://tmpfiles.org/dl/9/r.jpg"
        );
    }

    #[test]
    fn foreign_hosts_are_untouched() {
        assert_eq!(
            normalize_download_url("https://example.com/123/r.jpg", DEFAULT_DOWNLOAD_BASE),
            "https://example.com/123/r.jpg"
        );
    }

    #[test]
    fn base_gets_trailing_slash() {
        let relay = TmpfilesRelay::new(
            reqwest::Client::new(),
            DEFAULT_UPLOAD_URL,
            "https://tmpfiles.org",
        );
        assert_eq!(relay.download_base, DEFAULT_DOWNLOAD_BASE);
    }
}
