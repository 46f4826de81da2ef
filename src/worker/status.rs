use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a [`crate::TunnelWorker`]: READY → STARTED → ENDED | HALT.
///
/// ENDED can go back to READY and reconnect; HALT is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TunnelWorkerStatus {
    Ready = 0,
    Started = 1,
    Ended = 2,
    Halt = 3,
}

impl TunnelWorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TunnelWorkerStatus::Ready,
            1 => TunnelWorkerStatus::Started,
            2 => TunnelWorkerStatus::Ended,
            _ => TunnelWorkerStatus::Halt,
        }
    }
}

impl fmt::Display for TunnelWorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TunnelWorkerStatus::Ready => "READY",
            TunnelWorkerStatus::Started => "STARTED",
            TunnelWorkerStatus::Ended => "ENDED",
            TunnelWorkerStatus::Halt => "HALT",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
pub(crate) struct AtomicWorkerStatus(AtomicU8);

impl AtomicWorkerStatus {
    pub(crate) fn new(status: TunnelWorkerStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub(crate) fn load(&self) -> TunnelWorkerStatus {
        TunnelWorkerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, status: TunnelWorkerStatus) {
        self.0.store(status as u8, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, from: TunnelWorkerStatus, to: TunnelWorkerStatus) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
