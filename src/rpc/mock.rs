//! Scripted in-memory `TunnelClient` used by unit tests.

use crate::model::{Channel, Checkpoint};
use crate::rpc::client::{
    CheckpointRequest, ClientConfig, ReadRecordsRequest, ReadRecordsResponse, TunnelClient,
    TunnelError, TunnelFuture,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) const INITIAL_TOKEN: &str = "start";

#[derive(Default)]
pub(crate) struct MockTunnelClient {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    sessions: u64,
    connect_failures: VecDeque<TunnelError>,
    connect_delay: Option<Duration>,
    stall_heartbeats: bool,
    heartbeat_responses: VecDeque<Result<Vec<Channel>, TunnelError>>,
    heartbeat_requests: Vec<Vec<Channel>>,
    reads: HashMap<String, VecDeque<Result<ReadRecordsResponse, TunnelError>>>,
    read_requests: Vec<ReadRecordsRequest>,
    read_times: Vec<Instant>,
    checkpoints: HashMap<String, Checkpoint>,
    checkpoint_requests: Vec<CheckpointRequest>,
    checkpoint_failures: VecDeque<TunnelError>,
    get_checkpoint_calls: usize,
    get_checkpoint_failures: HashMap<String, TunnelError>,
    closed_sessions: Vec<String>,
}

impl MockTunnelClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_next_connect(&self, err: TunnelError) {
        self.state.lock().connect_failures.push_back(err);
    }

    pub(crate) fn push_heartbeat(&self, response: Result<Vec<Channel>, TunnelError>) {
        self.state.lock().heartbeat_responses.push_back(response);
    }

    /// Holds every `connect_session` call for `delay` before answering.
    pub(crate) fn delay_connect(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Heartbeats never answer while set.
    pub(crate) fn stall_heartbeats(&self, stall: bool) {
        self.state.lock().stall_heartbeats = stall;
    }

    pub(crate) fn push_read(
        &self,
        channel_id: &str,
        response: Result<ReadRecordsResponse, TunnelError>,
    ) {
        self.state
            .lock()
            .reads
            .entry(channel_id.to_string())
            .or_default()
            .push_back(response);
    }

    pub(crate) fn set_checkpoint(&self, channel_id: &str, checkpoint: Checkpoint) {
        self.state
            .lock()
            .checkpoints
            .insert(channel_id.to_string(), checkpoint);
    }

    pub(crate) fn fail_next_checkpoint(&self, err: TunnelError) {
        self.state.lock().checkpoint_failures.push_back(err);
    }

    pub(crate) fn fail_get_checkpoint(&self, channel_id: &str, err: TunnelError) {
        self.state
            .lock()
            .get_checkpoint_failures
            .insert(channel_id.to_string(), err);
    }

    pub(crate) fn checkpoint_of(&self, channel_id: &str) -> Option<Checkpoint> {
        self.state.lock().checkpoints.get(channel_id).cloned()
    }

    pub(crate) fn checkpoint_requests(&self) -> Vec<CheckpointRequest> {
        self.state.lock().checkpoint_requests.clone()
    }

    pub(crate) fn read_requests(&self) -> Vec<ReadRecordsRequest> {
        self.state.lock().read_requests.clone()
    }

    /// When each read reached the client, in call order.
    pub(crate) fn read_times(&self) -> Vec<Instant> {
        self.state.lock().read_times.clone()
    }

    pub(crate) fn heartbeat_requests(&self) -> Vec<Vec<Channel>> {
        self.state.lock().heartbeat_requests.clone()
    }

    pub(crate) fn get_checkpoint_calls(&self) -> usize {
        self.state.lock().get_checkpoint_calls
    }

    pub(crate) fn sessions_opened(&self) -> u64 {
        self.state.lock().sessions
    }

    pub(crate) fn closed_sessions(&self) -> Vec<String> {
        self.state.lock().closed_sessions.clone()
    }
}

impl TunnelClient for MockTunnelClient {
    fn connect_session<'a>(
        &'a self,
        _tunnel_id: &'a str,
        _config: &'a ClientConfig,
    ) -> TunnelFuture<'a, String> {
        Box::pin(async move {
            let delay = self.state.lock().connect_delay;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut state = self.state.lock();
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
            state.sessions += 1;
            Ok(format!("client-{}", state.sessions))
        })
    }

    fn heartbeat<'a>(
        &'a self,
        _tunnel_id: &'a str,
        _client_id: &'a str,
        channels: &'a [Channel],
    ) -> TunnelFuture<'a, Vec<Channel>> {
        Box::pin(async move {
            let stalled = {
                let mut state = self.state.lock();
                state.heartbeat_requests.push(channels.to_vec());
                state.stall_heartbeats
            };
            if stalled {
                futures::future::pending::<()>().await;
            }
            let mut state = self.state.lock();
            state
                .heartbeat_responses
                .pop_front()
                .unwrap_or_else(|| Ok(channels.to_vec()))
        })
    }

    fn read_records<'a>(
        &'a self,
        request: &'a ReadRecordsRequest,
    ) -> TunnelFuture<'a, ReadRecordsResponse> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.read_requests.push(request.clone());
            state.read_times.push(Instant::now());
            state
                .reads
                .get_mut(&request.channel_id)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| {
                    Ok(ReadRecordsResponse {
                        records: Vec::new(),
                        next_token: Some(request.token.clone()),
                    })
                })
        })
    }

    fn checkpoint<'a>(&'a self, request: &'a CheckpointRequest) -> TunnelFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.checkpoint_requests.push(request.clone());
            if let Some(err) = state.checkpoint_failures.pop_front() {
                return Err(err);
            }
            let current = state
                .checkpoints
                .get(&request.channel_id)
                .map(|checkpoint| checkpoint.sequence_number)
                .unwrap_or(0);
            if request.sequence_number <= current {
                return Err(TunnelError::SequenceNumberNotMatch {
                    message: format!(
                        "sequence {} is not newer than {current}",
                        request.sequence_number
                    ),
                });
            }
            state.checkpoints.insert(
                request.channel_id.clone(),
                Checkpoint::new(request.token.clone(), request.sequence_number),
            );
            Ok(())
        })
    }

    fn get_checkpoint<'a>(
        &'a self,
        _tunnel_id: &'a str,
        _client_id: &'a str,
        channel_id: &'a str,
    ) -> TunnelFuture<'a, Checkpoint> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.get_checkpoint_calls += 1;
            if let Some(err) = state.get_checkpoint_failures.get(channel_id) {
                return Err(err.clone());
            }
            Ok(state
                .checkpoints
                .get(channel_id)
                .cloned()
                .unwrap_or_else(|| Checkpoint::new(INITIAL_TOKEN, 0)))
        })
    }

    fn close_session<'a>(
        &'a self,
        _tunnel_id: &'a str,
        client_id: &'a str,
    ) -> TunnelFuture<'a, ()> {
        Box::pin(async move {
            self.state.lock().closed_sessions.push(client_id.to_string());
            Ok(())
        })
    }
}
