//! Session lifecycle: the [`TunnelWorker`] orchestrator, its heartbeat
//! loop, and the [`TunnelStateMachine`] that reconciles heartbeat results
//! into channel connects.

mod heartbeat;
pub mod state_machine;
pub mod status;
pub mod tunnel_worker;

pub use state_machine::TunnelStateMachine;
pub use status::TunnelWorkerStatus;
pub use tunnel_worker::TunnelWorker;
