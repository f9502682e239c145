use std::convert::Infallible;
use std::io::Read;

use anyhow::{bail, Context, Result};
use reqwest::Body;
use serde::Deserialize;

use crate::workload::{ExternalId, Payload};

const UPLOAD_BUFFER: usize = 1024 * 1024;

/// Talks to the `/files` endpoints of a running gridbucket server.
pub struct BucketClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct UploadResponse {
    id: ExternalId,
}

impl BucketClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{id}", self.base_url)
    }

    pub async fn write(&self, filename: String, payload: Payload) -> Result<ExternalId> {
        let stream = futures_util::stream::unfold(payload, |mut payload| async move {
            if payload.len == 0 {
                return None;
            }
            let mut read_buf = vec![0; UPLOAD_BUFFER];
            let read_len = payload.read(&mut read_buf).ok()?;
            read_buf.truncate(read_len);

            Some((Ok::<_, Infallible>(read_buf), payload))
        });

        let response: UploadResponse = self
            .client
            .post(format!("{}/files", self.base_url))
            .header("filename", filename)
            .header("content-type", "application/octet-stream")
            .body(Body::wrap_stream(stream))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.id)
    }

    pub async fn read(&self, id: &str, mut payload: Payload) -> Result<()> {
        let file_contents = self
            .client
            .get(self.file_url(id))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let mut expected_payload = Vec::new();
        payload.read_to_end(&mut expected_payload)?;

        if file_contents != expected_payload {
            bail!(
                "readback mismatch for {id}: got {} bytes, expected {}",
                file_contents.len(),
                expected_payload.len()
            );
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(self.file_url(id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("failed to delete {id}"))?;
        Ok(())
    }
}
