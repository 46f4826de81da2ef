use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Bounds how many channel pipelines read and process at the same time.
///
/// Reads and processing draw from separate pools so a slow processor only
/// starves other processors, never the reads of idle channels. The optional
/// channel pool caps whole read/process cycles.
#[derive(Debug)]
pub struct ChannelExecutor {
    channels: Option<Arc<Semaphore>>,
    reads: Arc<Semaphore>,
    processes: Arc<Semaphore>,
}

impl ChannelExecutor {
    pub fn new(
        max_channel_parallel: Option<usize>,
        read_concurrency: usize,
        process_concurrency: usize,
    ) -> Self {
        Self {
            channels: max_channel_parallel.map(|permits| Arc::new(Semaphore::new(permits))),
            reads: Arc::new(Semaphore::new(read_concurrency)),
            processes: Arc::new(Semaphore::new(process_concurrency)),
        }
    }

    /// Waits for a cycle slot. `Ok(None)` when the channel pool is unbounded,
    /// `Err(())` when cancelled or the executor is closed.
    pub(crate) async fn acquire_channel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.channels {
            None => Ok(None),
            Some(semaphore) => acquire(semaphore, cancel).await.map(Some),
        }
    }

    pub(crate) async fn acquire_read(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ()> {
        acquire(&self.reads, cancel).await
    }

    pub(crate) async fn acquire_process(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ()> {
        acquire(&self.processes, cancel).await
    }

    /// Wakes every waiter with an error; later acquisitions fail immediately.
    pub fn close(&self) {
        if let Some(channels) = &self.channels {
            channels.close();
        }
        self.reads.close();
        self.processes.close();
    }

    pub fn is_closed(&self) -> bool {
        self.reads.is_closed()
    }

    #[cfg(test)]
    pub(crate) fn available_processes(&self) -> usize {
        self.processes.available_permits()
    }
}

async fn acquire(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        permit = semaphore.clone().acquire_owned() => permit.map_err(|_| ()),
    }
}
