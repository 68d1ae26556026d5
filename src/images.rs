//! Product image download and validation.
//!
//! Images are fetched as raw bytes, sniffed with `infer` and decoded with
//! `image` before they reach the encoder, so undecodable payloads fail
//! early with a descriptive error.

use std::time::Duration;

use image::{DynamicImage, GenericImageView};

/// Images larger than this are rejected before decoding.
pub const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid image url {0:?}")]
    InvalidUrl(String),

    #[error("image request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("image server returned {0}")]
    Status(reqwest::StatusCode),

    #[error("image is too large ({0} bytes)")]
    TooLarge(usize),
}

pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP fetcher with a per-request timeout.
pub struct HttpImageFetcher {
    client: reqwest::blocking::Client,
}

impl HttpImageFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("lookalike/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl ImageFetcher for HttpImageFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        let response = self.client.get(parsed).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let bytes = response.bytes()?;
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(FetchError::TooLarge(bytes.len()));
        }

        Ok(bytes.to_vec())
    }
}

/// Check that bytes carry a known image signature.
pub fn is_image(data: &[u8]) -> bool {
    infer::get(data)
        .map(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .unwrap_or(false)
}

/// Decode image bytes into RGB pixels.
pub fn decode(data: &[u8]) -> anyhow::Result<DynamicImage> {
    if !is_image(data) {
        anyhow::bail!("payload is not a recognized image format");
    }

    let img = image::load_from_memory(data)?;
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        anyhow::bail!("image has zero dimensions");
    }

    Ok(DynamicImage::ImageRgb8(img.to_rgb8()))
}
