use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use emberline_common::{Error, Result};
use emberline_config::ModelDescriptor;
use tracing::debug;

use crate::backend::{BackendClient, WireMessage};

const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

impl BackendClient {
    /// Fetch an image and have the vision model describe it. The returned
    /// text is what the chat models see; raw image bytes never enter a
    /// conversation.
    pub async fn describe_image(
        &self,
        descriptor: &ModelDescriptor,
        prompt: &str,
        image_url: &str,
    ) -> Result<String> {
        let res = self
            .client
            .get(image_url)
            .timeout(IMAGE_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("image fetch failed: {e}")))?;

        if !res.status().is_success() {
            return Err(Error::Backend(format!(
                "image fetch error status: {}",
                res.status()
            )));
        }

        let bytes = res
            .bytes()
            .await
            .map_err(|e| Error::Backend(format!("failed to read image bytes: {e}")))?;
        debug!(url = image_url, size = bytes.len(), "image fetched for description");

        let message = WireMessage {
            role: "user",
            content: prompt.to_string(),
            images: Some(vec![BASE64.encode(&bytes)]),
        };

        self.complete(descriptor, &[message]).await
    }
}
