use crate::rpc::client::{CheckpointRequest, TunnelClient, TunnelError};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Records consumption progress of one channel on the Tunnel service.
///
/// The local sequence number always points at the next write. A write the
/// service rejects as stale triggers a single resynchronisation through
/// `get_checkpoint`, after which the write is retried with the service's
/// number plus one.
pub struct Checkpointer {
    client: Arc<dyn TunnelClient>,
    tunnel_id: String,
    client_id: String,
    channel_id: String,
    sequence_number: AtomicI64,
}

impl Checkpointer {
    /// `next_sequence_number` is the number the first write will carry,
    /// normally the service's current number plus one.
    pub fn new(
        client: Arc<dyn TunnelClient>,
        tunnel_id: impl Into<String>,
        client_id: impl Into<String>,
        channel_id: impl Into<String>,
        next_sequence_number: i64,
    ) -> Self {
        Self {
            client,
            tunnel_id: tunnel_id.into(),
            client_id: client_id.into(),
            channel_id: channel_id.into(),
            sequence_number: AtomicI64::new(next_sequence_number),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number.load(Ordering::SeqCst)
    }

    pub async fn checkpoint(&self, token: &str) -> Result<(), TunnelError> {
        let sequence_number = self.sequence_number();
        match self.write(token, sequence_number).await {
            Ok(()) => {
                self.sequence_number
                    .store(sequence_number + 1, Ordering::SeqCst);
                tracing::debug!(
                    channel_id = %self.channel_id,
                    sequence_number,
                    token,
                    "checkpoint recorded"
                );
                Ok(())
            }
            Err(err) if err.is_sequence_mismatch() => self.resync_and_retry(token, err).await,
            Err(err) => {
                tracing::warn!(
                    channel_id = %self.channel_id,
                    sequence_number,
                    error = %err,
                    "checkpoint failed"
                );
                Err(err)
            }
        }
    }

    async fn resync_and_retry(
        &self,
        token: &str,
        conflict: TunnelError,
    ) -> Result<(), TunnelError> {
        let current = self
            .client
            .get_checkpoint(&self.tunnel_id, &self.client_id, &self.channel_id)
            .await
            .map_err(|err| {
                tracing::warn!(
                    channel_id = %self.channel_id,
                    error = %err,
                    "failed to fetch checkpoint after sequence conflict"
                );
                err
            })?;

        let retry_sequence = current.sequence_number + 1;
        tracing::info!(
            channel_id = %self.channel_id,
            local = self.sequence_number(),
            remote = current.sequence_number,
            conflict = %conflict,
            "checkpoint sequence conflict; resynchronising"
        );

        match self.write(token, retry_sequence).await {
            Ok(()) => {
                self.sequence_number
                    .store(retry_sequence + 1, Ordering::SeqCst);
                Ok(())
            }
            Err(err) => {
                self.sequence_number.store(retry_sequence, Ordering::SeqCst);
                tracing::warn!(
                    channel_id = %self.channel_id,
                    sequence_number = retry_sequence,
                    error = %err,
                    "checkpoint retry after resync failed"
                );
                Err(err)
            }
        }
    }

    async fn write(&self, token: &str, sequence_number: i64) -> Result<(), TunnelError> {
        let request = CheckpointRequest {
            tunnel_id: self.tunnel_id.clone(),
            client_id: self.client_id.clone(),
            channel_id: self.channel_id.clone(),
            token: token.to_string(),
            sequence_number,
        };
        self.client.checkpoint(&request).await
    }
}
