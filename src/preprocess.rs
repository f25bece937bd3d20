use std::io::Cursor;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use tracing::debug;

use crate::error::{GatewayError, Result};

/// Side length of the square images the model expects.
pub const DEFAULT_IMAGE_SIZE: u32 = 480;

/// Where source images come from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpImageSource {
    client: reqwest::Client,
}

impl HttpImageSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| GatewayError::network(format!("failed to download {url}"), e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::network(format!("failed reading body of {url}"), e))?;
        debug!(url, len = bytes.len(), "downloaded image");
        Ok(bytes.to_vec())
    }
}

/// Decode, force RGB, stretch to `size`x`size` and re-encode as JPEG.
///
/// Aspect ratio is not preserved.
pub fn resize_to_jpeg(bytes: &[u8], size: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(bytes)?;
    let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
    let resized = rgb.resize_exact(size, size, FilterType::Triangle);

    let mut out = Cursor::new(Vec::new());
    resized.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

/// [`resize_to_jpeg`] on the blocking pool, off the request's executor.
pub async fn resize_off_thread(bytes: Vec<u8>, size: u32) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || resize_to_jpeg(&bytes, size)).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgba, RgbaImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 10, 40, 128]));
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn output_is_square_jpeg_regardless_of_input_shape() {
        let jpeg = resize_to_jpeg(&png(120, 40), DEFAULT_IMAGE_SIZE).unwrap();

        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (480, 480));
        assert_eq!(decoded.color().channel_count(), 3);
    }

    #[test]
    fn garbage_is_an_image_error() {
        let err = resize_to_jpeg(b"definitely not an image", 480).unwrap_err();
        assert!(matches!(err, GatewayError::Image(_)));
    }

    #[actix_web::test]
    async fn off_thread_resize_matches_inline() {
        let source = png(10, 10);
        let jpeg = resize_off_thread(source, 32).await.unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
    }
}
