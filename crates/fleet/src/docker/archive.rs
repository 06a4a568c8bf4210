//! Archive domain — tar streams in and out of container filesystems.
//! Used for config/code uploads and backup capture.

use super::client::DockerClient;
use crate::error::{Error, Result};
use bollard::query_parameters::{DownloadFromContainerOptions, UploadToContainerOptions};
use futures_util::stream::StreamExt;

impl DockerClient {
    /// Fetch `path` from the container as an uncompressed tar stream.
    pub async fn get_archive(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let options = Some(DownloadFromContainerOptions {
            path: path.to_string(),
            ..Default::default()
        });

        let mut stream = self.client.download_from_container(container, options);
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    return Err(Error::NotFound(format!("{container}:{path}")));
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(data)
    }

    /// Unpack an uncompressed tar stream into `path` inside the container.
    pub async fn put_archive(&self, container: &str, path: &str, tar: Vec<u8>) -> Result<()> {
        let options = Some(UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        });

        self.client
            .upload_to_container(container, options, bollard::body_full(tar.into()))
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => Error::NotFound(format!("{container}:{path}")),
                other => Error::from(other),
            })
    }
}
