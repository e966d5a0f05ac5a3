//! # Large Message Codec
//!
//! Encodes task messages into payloads that fit the queue's byte budget.
//! Messages above the threshold are gzip-compressed and written to the
//! hub's large-message container as `<instance_id>/<uuid>.json.gz`; the
//! queue then carries only an envelope naming the blob. Decoding is
//! transparent either way.

use crate::error::{Result, TaskHubError};
use crate::messaging::message::{MessageEnvelope, TaskMessage};
use crate::storage::{BlobStore, RetryPolicy};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of encoding one task message.
#[derive(Debug)]
pub struct EncodedMessage {
    /// Queue-ready envelope body.
    pub body: String,
    /// Name of the off-loaded blob, when the payload exceeded the threshold.
    pub blob_name: Option<String>,
    pub sequence_number: i64,
    pub activity_id: Uuid,
}

/// Inline/blob codec for queue payloads.
pub struct LargeMessageCodec {
    blob_store: Arc<dyn BlobStore>,
    container: String,
    threshold_bytes: usize,
    retry: RetryPolicy,
    sequence: AtomicI64,
}

impl LargeMessageCodec {
    pub fn new(blob_store: Arc<dyn BlobStore>, container: String, threshold_bytes: usize) -> Self {
        Self {
            blob_store,
            container,
            threshold_bytes,
            retry: RetryPolicy::default(),
            sequence: AtomicI64::new(0),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Encode a message, off-loading to the blob store if the inline form
    /// exceeds the threshold. A payload exactly at the threshold stays
    /// inline.
    pub async fn encode(&self, message: &TaskMessage) -> Result<EncodedMessage> {
        let sequence_number = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let activity_id = Uuid::new_v4();
        let serialized = serde_json::to_string(message)?;

        if serialized.len() <= self.threshold_bytes {
            let envelope = MessageEnvelope {
                task_message: Some(message.clone()),
                compressed_blob_name: None,
                sequence_number,
                activity_id,
            };
            return Ok(EncodedMessage {
                body: serde_json::to_string(&envelope)?,
                blob_name: None,
                sequence_number,
                activity_id,
            });
        }

        let blob_name = format!(
            "{}/{}.json.gz",
            message.instance_id(),
            Uuid::new_v4()
        );
        let compressed = gzip_compress(serialized.as_bytes())?;

        debug!(
            instance_id = message.instance_id(),
            blob_name = %blob_name,
            inline_bytes = serialized.len(),
            compressed_bytes = compressed.len(),
            "Off-loading large message to blob store"
        );

        self.retry
            .run("put_large_message", || {
                let blob_store = self.blob_store.clone();
                let container = self.container.clone();
                let blob_name = blob_name.clone();
                let bytes = compressed.clone();
                async move { blob_store.put(&container, &blob_name, &bytes).await }
            })
            .await
            .map_err(TaskHubError::from)?;

        let envelope = MessageEnvelope {
            task_message: None,
            compressed_blob_name: Some(blob_name.clone()),
            sequence_number,
            activity_id,
        };
        Ok(EncodedMessage {
            body: serde_json::to_string(&envelope)?,
            blob_name: Some(blob_name),
            sequence_number,
            activity_id,
        })
    }

    /// Decode a queue body, fetching and inflating the blob when the
    /// payload was off-loaded. Failures are permanent decode errors.
    pub async fn decode(&self, body: &str) -> Result<(TaskMessage, MessageEnvelope)> {
        let envelope: MessageEnvelope = serde_json::from_str(body)
            .map_err(|e| TaskHubError::decode(format!("invalid message envelope: {e}")))?;

        let message = match (&envelope.task_message, &envelope.compressed_blob_name) {
            (Some(message), _) => message.clone(),
            (None, Some(blob_name)) => {
                let bytes = self
                    .retry
                    .run("get_large_message", || {
                        let blob_store = self.blob_store.clone();
                        let container = self.container.clone();
                        let blob_name = blob_name.clone();
                        async move { blob_store.get(&container, &blob_name).await }
                    })
                    .await
                    .map_err(|e| {
                        TaskHubError::decode(format!("large message blob {blob_name}: {e}"))
                    })?;
                let inflated = gzip_decompress(&bytes)?;
                serde_json::from_slice(&inflated).map_err(|e| {
                    TaskHubError::decode(format!("large message blob {blob_name}: {e}"))
                })?
            }
            (None, None) => {
                return Err(TaskHubError::decode(
                    "envelope carries neither an inline message nor a blob name",
                ))
            }
        };

        Ok((message, envelope))
    }

    /// Delete an off-loaded blob after its message has been consumed.
    pub async fn delete_blob(&self, blob_name: &str) -> Result<bool> {
        Ok(self.blob_store.delete(&self.container, blob_name).await?)
    }

    /// Fire-and-forget blob cleanup used on the checkpoint hot path.
    pub fn delete_blob_deferred(self: &Arc<Self>, blob_name: String) {
        let codec = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = codec.delete_blob(&blob_name).await {
                warn!(blob_name = %blob_name, error = %error, "Deferred blob delete failed");
            }
        });
    }

    /// Delete every off-loaded blob belonging to an instance.
    pub async fn purge_instance_blobs(&self, instance_id: &str) -> Result<u64> {
        let prefix = format!("{instance_id}/");
        let names = self.blob_store.list(&self.container, &prefix).await?;
        let mut deleted = 0u64;
        for name in names {
            if self.blob_store.delete(&self.container, &name).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn gzip_compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| TaskHubError::internal(format!("gzip compression failed: {e}")))?;
    encoder
        .finish()
        .map_err(|e| TaskHubError::internal(format!("gzip compression failed: {e}")))
}

fn gzip_decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| TaskHubError::decode(format!("gzip inflation failed: {e}")))?;
    Ok(inflated)
}
