use crate::channel::connect::{ChannelConnection, ChannelStatusSink, FailedChannelConnect};
use crate::channel::dialer::ChannelDialer;
use crate::model::{Channel, ChannelStatus};
use crate::runtime::config::TunnelWorkerConfig;
use crate::runtime::telemetry::Telemetry;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Default)]
struct ReconcileState {
    closing_rounds: HashMap<String, usize>,
}

/// Reconciles the service's channel assignments with the local connects.
///
/// `channels` holds the latest known version of every assigned channel and
/// is what the next heartbeat reports. `connects` holds exactly one entry per
/// channel id: a live connect, a closed connect awaiting the service's
/// acknowledgement, or a failed-dial stand-in.
pub struct TunnelStateMachine {
    tunnel_id: String,
    client_id: String,
    dialer: Arc<ChannelDialer>,
    channels: DashMap<String, Channel>,
    connects: DashMap<String, ChannelConnection>,
    reconcile: tokio::sync::Mutex<ReconcileState>,
    closing_channel_max_rounds: Option<usize>,
    shutdown_grace: Duration,
    telemetry: Arc<Telemetry>,
    closed: AtomicBool,
    this: Weak<TunnelStateMachine>,
}

impl TunnelStateMachine {
    pub fn new(
        tunnel_id: impl Into<String>,
        client_id: impl Into<String>,
        dialer: Arc<ChannelDialer>,
        config: &TunnelWorkerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Arc<Self> {
        let tunnel_id = tunnel_id.into();
        let client_id = client_id.into();
        Arc::new_cyclic(|this| Self {
            tunnel_id,
            client_id,
            dialer,
            channels: DashMap::new(),
            connects: DashMap::new(),
            reconcile: tokio::sync::Mutex::new(ReconcileState::default()),
            closing_channel_max_rounds: config.closing_channel_max_rounds(),
            shutdown_grace: config.shutdown_grace(),
            telemetry,
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Channels to report on the next heartbeat, ordered by id.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    pub fn channel(&self, channel_id: &str) -> Option<Channel> {
        self.channels.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn connection(&self, channel_id: &str) -> Option<ChannelConnection> {
        self.connects.get(channel_id).map(|entry| entry.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connects.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn sink(&self) -> Weak<dyn ChannelStatusSink> {
        self.this.clone()
    }

    /// Applies the authoritative channel list returned by a heartbeat.
    pub async fn batch_update_channels(&self, remote: Vec<Channel>) {
        let mut state = self.reconcile.lock().await;
        if self.is_closed() {
            return;
        }

        let merged = self.merge_channels(remote);
        self.dial_missing(&merged).await;
        self.notify_connects(&merged);
        self.collect_released(&merged);
        self.detect_hung_closing(&mut state, &merged);

        let active = self
            .connects
            .iter()
            .filter(|entry| !entry.value().is_closed())
            .count();
        self.telemetry.set_active_channels(active);
    }

    /// Merges each remote channel into the held copy under its map entry,
    /// so a connect's concurrent report at a higher version is never lost.
    fn merge_channels(&self, remote: Vec<Channel>) -> HashMap<String, Channel> {
        let mut merged = HashMap::with_capacity(remote.len());
        for channel in remote {
            let channel_id = channel.channel_id.clone();
            let stored = match self.channels.entry(channel_id.clone()) {
                Entry::Occupied(mut held) => {
                    let next = channel.merge(held.get().clone());
                    held.insert(next.clone());
                    next
                }
                Entry::Vacant(slot) => slot.insert(channel).value().clone(),
            };
            merged.insert(channel_id, stored);
        }

        self.channels.retain(|channel_id, _| merged.contains_key(channel_id));
        merged
    }

    async fn dial_missing(&self, merged: &HashMap<String, Channel>) {
        let to_dial: Vec<&Channel> = merged
            .values()
            .filter(|channel| match self.connection(&channel.channel_id) {
                None => true,
                Some(existing) => existing.should_redial(channel),
            })
            .collect();

        if to_dial.is_empty() {
            return;
        }

        let dials = to_dial.iter().map(|channel| async move {
            let result = self.dialer.dial(channel, self.sink()).await;
            (*channel, result)
        });

        for (channel, result) in join_all(dials).await {
            let connection = match result {
                Ok(connect) => {
                    self.telemetry.record_dial(true);
                    ChannelConnection::Active(connect)
                }
                Err(err) => {
                    self.telemetry.record_dial(false);
                    tracing::warn!(
                        tunnel_id = %self.tunnel_id,
                        client_id = %self.client_id,
                        channel_id = %channel.channel_id,
                        error = %err,
                        "failed to dial channel; registering failed connect"
                    );
                    ChannelConnection::Failed(Arc::new(FailedChannelConnect::new(
                        channel.channel_id.clone(),
                        format!("{err:#}"),
                        self.sink(),
                    )))
                }
            };

            if let Some(previous) = self
                .connects
                .insert(channel.channel_id.clone(), connection)
            {
                tracing::debug!(
                    channel_id = %channel.channel_id,
                    version = channel.version,
                    "replaced released connect with a fresh dial"
                );
                previous.close();
            }
        }
    }

    fn notify_connects(&self, merged: &HashMap<String, Channel>) {
        let targets: Vec<(ChannelConnection, Channel)> = merged
            .values()
            .filter_map(|channel| {
                self.connection(&channel.channel_id)
                    .map(|connection| (connection, channel.clone()))
            })
            .collect();

        for (connection, channel) in targets {
            connection.notify_status(channel);
        }
    }

    fn collect_released(&self, merged: &HashMap<String, Channel>) {
        let stale: Vec<String> = self
            .connects
            .iter()
            .filter(|entry| !merged.contains_key(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for channel_id in stale {
            if let Some((_, connection)) = self.connects.remove(&channel_id) {
                tracing::info!(
                    client_id = %self.client_id,
                    channel_id = %channel_id,
                    "channel no longer assigned; removing connect"
                );
                connection.close();
            }
        }
    }

    fn detect_hung_closing(&self, state: &mut ReconcileState, merged: &HashMap<String, Channel>) {
        let Some(max_rounds) = self.closing_channel_max_rounds else {
            return;
        };

        state.closing_rounds.retain(|channel_id, _| {
            merged
                .get(channel_id)
                .map(|channel| channel.status == ChannelStatus::Closing)
                .unwrap_or(false)
        });

        let mut hung = Vec::new();
        let closing: HashSet<&String> = merged
            .values()
            .filter(|channel| channel.status == ChannelStatus::Closing)
            .map(|channel| &channel.channel_id)
            .collect();
        for channel_id in closing {
            let rounds = state.closing_rounds.entry(channel_id.clone()).or_insert(0);
            *rounds += 1;
            if *rounds > max_rounds {
                hung.push(channel_id.clone());
            }
        }

        for channel_id in hung {
            state.closing_rounds.remove(&channel_id);
            let Some(connection) = self.connection(&channel_id) else {
                continue;
            };
            tracing::warn!(
                client_id = %self.client_id,
                channel_id = %channel_id,
                max_rounds,
                "channel stuck in CLOSING; forcing close"
            );
            if let ChannelConnection::Active(connect) = &connection {
                connect.close(false);
                connect.check_and_update_channel_status();
            }
        }
    }

    /// Closes every connect and waits, bounded by the shutdown grace, for
    /// their pipelines and processor shutdowns to finish.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _state = self.reconcile.lock().await;

        let connections: Vec<ChannelConnection> = self
            .connects
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        tracing::info!(
            client_id = %self.client_id,
            connects = connections.len(),
            "closing tunnel state machine"
        );

        for connection in &connections {
            connection.close();
        }
        join_all(
            connections
                .iter()
                .map(|connection| connection.join(self.shutdown_grace)),
        )
        .await;

        self.connects.clear();
        self.channels.clear();
        self.telemetry.set_active_channels(0);
    }
}

impl ChannelStatusSink for TunnelStateMachine {
    /// Merges a connect's own CLOSE/TERMINATED report so the next heartbeat
    /// carries it. Reports for channels no longer assigned are dropped.
    fn update_status(&self, channel: Channel) {
        match self.channels.get_mut(&channel.channel_id) {
            Some(mut held) => {
                if channel.version > held.version {
                    tracing::debug!(
                        channel_id = %channel.channel_id,
                        version = channel.version,
                        status = %channel.status,
                        "channel status updated by connect"
                    );
                    *held = channel;
                }
            }
            None => {
                tracing::debug!(
                    channel_id = %channel.channel_id,
                    "ignoring status report for unassigned channel"
                );
            }
        }
    }
}
