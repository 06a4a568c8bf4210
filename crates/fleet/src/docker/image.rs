//! Image domain — presence checks and registry pulls.

use super::client::DockerClient;
use crate::error::{Error, Result};
use futures_util::stream::StreamExt;

impl DockerClient {
    /// Make sure `image` is present on the host; pull from the registry
    /// when it is missing or when `force` is set.
    pub async fn ensure_image(&self, image: &str, force: bool) -> Result<()> {
        if !force && self.client.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image, host = %self.addr, "Pulling image");
        self.pull_image(image).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        use bollard::query_parameters::CreateImageOptions;

        let (name, tag) = image
            .rsplit_once(':')
            .unwrap_or((image, "latest"));

        let options = Some(CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    tracing::debug!(status = ?info.status, host = %self.addr, "Image pull progress");
                }
                Err(e) => return Err(Error::from(e)),
            }
        }

        Ok(())
    }
}
