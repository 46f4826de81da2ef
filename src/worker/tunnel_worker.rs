use crate::channel::dialer::ChannelDialer;
use crate::checkpoint::ChannelProcessFactory;
use crate::model::Channel;
use crate::rpc::client::{TunnelClient, TunnelError};
use crate::rpc::retry::{RetryContext, CONNECT_RETRY};
use crate::runtime::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::runtime::config::TunnelWorkerConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::processor::ChannelProcessorFactory;
use crate::runtime::telemetry::{spawn_metrics_reporter, Telemetry};
use crate::worker::heartbeat;
use crate::worker::state_machine::TunnelStateMachine;
use crate::worker::status::{AtomicWorkerStatus, TunnelWorkerStatus};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Consumes one tunnel on behalf of the application.
///
/// The worker opens a session, heartbeats the channels it holds, and lets
/// the [`TunnelStateMachine`] dial, run, and release channels as the service
/// rebalances them. Clones share the same worker.
#[derive(Clone)]
pub struct TunnelWorker {
    inner: Arc<WorkerInner>,
}

pub(crate) struct Session {
    pub client_id: String,
    pub dialer: Arc<ChannelDialer>,
    pub state_machine: Arc<TunnelStateMachine>,
}

pub(crate) struct WorkerInner {
    pub tunnel_id: String,
    pub client: Arc<dyn TunnelClient>,
    pub factory: Arc<dyn ChannelProcessorFactory>,
    pub config: TunnelWorkerConfig,
    pub telemetry: Arc<Telemetry>,
    pub status: AtomicWorkerStatus,
    pub session: Mutex<Option<Arc<Session>>>,
    pub last_heartbeat: Mutex<Instant>,
    pub halt: CancellationToken,
    pub fatal: FatalErrorHandler,
    shutdown_lock: tokio::sync::Mutex<()>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelWorker {
    pub fn new<F>(
        tunnel_id: impl Into<String>,
        client: Arc<dyn TunnelClient>,
        factory: F,
        config: TunnelWorkerConfig,
    ) -> Self
    where
        F: ChannelProcessorFactory,
    {
        let halt = CancellationToken::new();
        Self {
            inner: Arc::new(WorkerInner {
                tunnel_id: tunnel_id.into(),
                client,
                factory: Arc::new(factory),
                config,
                telemetry: Arc::new(Telemetry::default()),
                status: AtomicWorkerStatus::new(TunnelWorkerStatus::Ready),
                session: Mutex::new(None),
                last_heartbeat: Mutex::new(Instant::now()),
                fatal: FatalErrorHandler::new(halt.clone()),
                halt,
                shutdown_lock: tokio::sync::Mutex::new(()),
                heartbeat_task: Mutex::new(None),
                metrics_task: Mutex::new(None),
            }),
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.inner.tunnel_id
    }

    pub fn status(&self) -> TunnelWorkerStatus {
        self.inner.status.load()
    }

    /// Identifier of the current session, if one is open.
    pub fn client_id(&self) -> Option<String> {
        self.inner
            .current_session()
            .map(|session| session.client_id.clone())
    }

    /// Channels the worker currently reports on its heartbeat.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner
            .current_session()
            .map(|session| session.state_machine.channels())
            .unwrap_or_default()
    }

    pub fn state_machine(&self) -> Option<Arc<TunnelStateMachine>> {
        self.inner
            .current_session()
            .map(|session| session.state_machine.clone())
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.inner.telemetry.clone()
    }

    pub fn config(&self) -> &TunnelWorkerConfig {
        &self.inner.config
    }

    /// Opens a session. Transient failures are retried after a random delay
    /// bounded by `connect_retry_max_delay`; a fatal failure halts the worker
    /// and is returned.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner
            .status
            .transition(TunnelWorkerStatus::Ready, TunnelWorkerStatus::Started)
            && !inner
                .status
                .transition(TunnelWorkerStatus::Ended, TunnelWorkerStatus::Started)
        {
            bail!("tunnel worker cannot connect while {}", inner.status.load());
        }

        inner.establish_session().await
    }

    /// Connects and starts the background heartbeat. Returns once the session
    /// is open; the worker then runs until [`shutdown`](Self::shutdown) or a
    /// fatal error, observable through [`wait`](Self::wait).
    pub async fn connect_and_working(&self) -> Result<()> {
        self.connect().await?;
        self.inner.start_background_tasks();
        Ok(())
    }

    /// Stops every channel and closes the session. `is_halt` also stops the
    /// heartbeat for good; otherwise the worker ends in ENDED and the
    /// heartbeat reconnects it on its next tick.
    pub async fn shutdown(&self, is_halt: bool) {
        self.inner.shutdown(is_halt).await;
    }

    /// Resolves once the worker halts. Returns the fatal error that caused
    /// the halt, if any.
    pub async fn wait(&self) -> Result<()> {
        match self.inner.fatal.wait().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl WorkerInner {
    pub(crate) fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().clone()
    }

    pub(crate) fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
    }

    /// Opens a session and installs a fresh dialer and state machine. The
    /// caller has already moved the status to STARTED.
    pub(crate) async fn establish_session(&self) -> Result<()> {
        let client: &dyn TunnelClient = self.client.as_ref();
        let tunnel_id = self.tunnel_id.as_str();
        let client_config = self.config.client_config();
        let client_config = &client_config;
        let retry = RetryContext::new(&CONNECT_RETRY);

        let result = retry_with_backoff(
            RetryBackoff::jittered(self.config.connect_retry_max_delay())
                .with_cancellation(&self.halt),
            move |_| client.connect_session(tunnel_id, client_config),
            |attempt, delay, err: &TunnelError| retry.log_retry(attempt, delay, err),
            |_, err: &TunnelError| {
                if err.is_fatal() {
                    RetryDisposition::Abort
                } else {
                    RetryDisposition::Retry
                }
            },
        )
        .await;

        let client_id = match result {
            Ok(client_id) => client_id,
            Err(err) => {
                let fatal = err
                    .downcast_ref::<TunnelError>()
                    .map(TunnelError::is_fatal)
                    .unwrap_or(false);
                if fatal {
                    self.status.store(TunnelWorkerStatus::Halt);
                    return Err(self.fatal.trigger("connect", err));
                }
                let status = if self.halt.is_cancelled() {
                    TunnelWorkerStatus::Halt
                } else {
                    TunnelWorkerStatus::Ended
                };
                self.status.store(status);
                return Err(err.context("tunnel connect abandoned"));
            }
        };

        // A shutdown that ran while the connect RPC was in flight owns the
        // status from here on; hand the fresh session straight back.
        let _guard = self.shutdown_lock.lock().await;
        if self.status.load() != TunnelWorkerStatus::Started || self.halt.is_cancelled() {
            tracing::info!(
                tunnel_id = %self.tunnel_id,
                client_id = %client_id,
                status = %self.status.load(),
                "worker shut down while connecting; releasing new session"
            );
            if let Err(err) = self.client.close_session(&self.tunnel_id, &client_id).await {
                tracing::warn!(
                    tunnel_id = %self.tunnel_id,
                    client_id = %client_id,
                    error = %err,
                    "failed to close abandoned tunnel session"
                );
            }
            bail!("tunnel worker shut down while connecting");
        }

        let process_factory = ChannelProcessFactory::new(
            self.factory.clone(),
            self.config.checkpoint_interval(),
            self.telemetry.clone(),
        );
        let dialer = Arc::new(ChannelDialer::new(
            self.tunnel_id.clone(),
            client_id.clone(),
            self.client.clone(),
            process_factory,
            &self.config,
            self.telemetry.clone(),
        ));
        let state_machine = TunnelStateMachine::new(
            self.tunnel_id.clone(),
            client_id.clone(),
            dialer.clone(),
            &self.config,
            self.telemetry.clone(),
        );

        *self.session.lock() = Some(Arc::new(Session {
            client_id: client_id.clone(),
            dialer,
            state_machine,
        }));
        self.touch_heartbeat();

        tracing::info!(
            tunnel_id = %self.tunnel_id,
            client_id = %client_id,
            "tunnel session established"
        );
        Ok(())
    }

    fn start_background_tasks(self: &Arc<Self>) {
        {
            let mut slot = self.heartbeat_task.lock();
            let running = slot.as_ref().map(|task| !task.is_finished()).unwrap_or(false);
            if !running {
                *slot = Some(heartbeat::spawn_heartbeat(self.clone()));
            }
        }

        let mut slot = self.metrics_task.lock();
        if slot.is_none() {
            *slot = Some(spawn_metrics_reporter(
                self.telemetry.clone(),
                self.halt.child_token(),
                self.config.metrics_interval(),
            ));
        }
    }

    pub(crate) async fn shutdown(&self, is_halt: bool) {
        let _guard = self.shutdown_lock.lock().await;

        let current = self.status.load();
        if current == TunnelWorkerStatus::Halt
            || (current == TunnelWorkerStatus::Ended && !is_halt)
        {
            return;
        }

        tracing::info!(
            tunnel_id = %self.tunnel_id,
            status = %current,
            is_halt,
            "shutting down tunnel worker"
        );

        let session = self.session.lock().take();
        if let Some(session) = session {
            session.dialer.shutdown();
            session.state_machine.close().await;

            if let Err(err) = self
                .client
                .close_session(&self.tunnel_id, &session.client_id)
                .await
            {
                tracing::warn!(
                    tunnel_id = %self.tunnel_id,
                    client_id = %session.client_id,
                    error = %err,
                    "failed to close tunnel session"
                );
            }
        }

        if is_halt {
            self.status.store(TunnelWorkerStatus::Halt);
            self.halt.cancel();
        } else {
            self.status.store(TunnelWorkerStatus::Ended);
        }
    }
}
