//! HTTP detector client.
//!
//! Posts the grayscale pixels of each frame to a detection service and
//! parses the regions it returns:
//!
//! ```text
//! POST {endpoint}?width=W&height=H
//! Content-Type: application/octet-stream
//! <W*H luma bytes>
//!
//! 200 [{"x":10,"y":20,"width":64,"height":64}, ...]
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use camwatch_core::{DetectError, Detector, GrayFrame, Region};

/// `Detector` that delegates to a remote HTTP service.
#[derive(Debug, Clone)]
pub struct HttpDetector {
    client: Client,
    endpoint: String,
}

impl HttpDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &GrayFrame) -> Result<Vec<Region>, DetectError> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("width", frame.width()), ("height", frame.height())])
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(frame.as_bytes().to_vec())
            .send()
            .await
            .map_err(|e| DetectError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectError::Unavailable(format!("detector returned {status}")));
        }

        response
            .json::<Vec<Region>>()
            .await
            .map_err(|e| DetectError::InvalidResponse(e.to_string()))
    }
}
