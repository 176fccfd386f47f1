//! Image generation passthrough: one prompt in, raw image bytes out.

use futures_util::future::BoxFuture;
use reqwest::Client;

use crate::error::ImageError;
use crate::providers::{ImageRequest, UpstreamErrorBody};

/// Message used when the image upstream fails without saying why.
pub const IMAGE_FAILED: &str = "Image Generation Failed";

pub trait ImageGenerator: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ImageError>>;
}

pub struct HttpImageProxy {
    client: Client,
    url: String,
    api_token: Option<String>,
}

impl HttpImageProxy {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.api_token = token.filter(|t| !t.is_empty());
        self
    }

    async fn fetch(&self, prompt: &str) -> Result<Vec<u8>, ImageError> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&ImageRequest { inputs: prompt });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ImageError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ImageError::Request(e.to_string()))?;

        if !status.is_success() {
            let message =
                UpstreamErrorBody::parse_message(&body).unwrap_or_else(|| IMAGE_FAILED.to_string());
            return Err(ImageError::Upstream {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body.to_vec())
    }
}

impl ImageGenerator for HttpImageProxy {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<Vec<u8>, ImageError>> {
        Box::pin(self.fetch(prompt))
    }
}
