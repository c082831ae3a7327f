//! The client: one actor task that owns the connection and everything tied
//! to it.
//!
//! Callers talk to the actor through a [`ClientHandle`] and observe it through
//! the [`ClientEvent`] stream. The actor serializes all access to the cipher,
//! job table, directory and session, so none of them need locks.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use crate::config::NetworkConfig;
use crate::core::emsg::{EResult, MsgType};
use crate::core::envelope::Envelope;
use crate::core::multi;
use crate::core::proto::{CmList, LoggedOff, LogonResponse};
use crate::core::registry::SchemaRegistry;
use crate::discovery::directory::endpoints_from_cm_list;
use crate::discovery::{Directory, Endpoint, LoadProbe, Quality, Selector, StaticLoadProbe, UdpLoadProbe};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::handshake::{Handshake, HandshakeAction, UniverseKeys};
use crate::protocol::heartbeat::HeartbeatScheduler;
use crate::protocol::jobs::{JobHandle, JobId, JobManager};
use crate::protocol::session::{ConnectionState, Session};
use crate::service::logon::{LogOnDetails, MachineIdProvider};
use crate::transport::{Connector, DisconnectReason, FramedChannel, Transport, TransportKind};
use crate::utils::backoff::ExponentialBackoff;
use crate::utils::metrics::Metrics;
use crate::utils::timeout::JOB_SWEEP_INTERVAL;

/// Stream of [`ClientEvent`]s.
pub type EventStream = ReceiverStream<ClientEvent>;

/// Something the client wants its owner to know about.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Transport open, channel setup under way.
    Connected { endpoint: Endpoint },
    /// Handshake done; application traffic may flow.
    ChannelEncrypted,
    LoggedOn {
        result: EResult,
        heartbeat_interval: Option<Duration>,
    },
    LoggedOff { result: EResult },
    ServerListUpdated { servers: usize },
    /// A message no job or handler claimed.
    Message(Envelope),
    /// A message tunnelled from a sub-application.
    AppMessage { appid: u32, envelope: Envelope },
    Disconnected {
        reason: DisconnectReason,
        user_initiated: bool,
    },
    Reconnecting { attempt: u32, delay: Duration },
    /// Auto-reconnect gave up.
    ReconnectFailed,
}

/// Point-in-time view of the client.
#[derive(Debug, Clone)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub endpoint: Option<Endpoint>,
    pub account_id: Option<u64>,
    pub session_id: Option<i32>,
    /// Interval of the running heartbeat; `None` when it is stopped.
    pub heartbeat_interval: Option<Duration>,
    pub pending_jobs: usize,
}

enum Command {
    Connect(oneshot::Sender<Result<Endpoint>>),
    Disconnect(oneshot::Sender<()>),
    Send(Envelope, oneshot::Sender<Result<()>>),
    SendJob(Envelope, oneshot::Sender<Result<JobHandle>>),
    CancelJob(JobId, oneshot::Sender<bool>),
    LogOn(Box<LogOnDetails>, oneshot::Sender<Result<()>>),
    Status(oneshot::Sender<ClientStatus>),
}

/// Cloneable handle to a running client. The actor stops once every handle
/// is dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    metrics: Arc<Metrics>,
}

impl ClientHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ProtocolError::Custom(constants::ERR_CLIENT_STOPPED.to_string()))?;
        response
            .await
            .map_err(|_| ProtocolError::Custom(constants::ERR_CLIENT_STOPPED.to_string()))
    }

    /// Discover a server and open a transport to it. Resolves once the
    /// transport is up; [`ClientEvent::ChannelEncrypted`] follows when the
    /// handshake completes. A [`disconnect`](Self::disconnect) issued while
    /// discovery is still running cancels it.
    pub async fn connect(&self) -> Result<Endpoint> {
        self.request(Command::Connect).await?
    }

    /// Close the connection. Never triggers a reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Send a message that expects no reply.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.request(|reply| Command::Send(envelope, reply)).await?
    }

    /// Send a message to a sub-application.
    pub async fn send_to_app(&self, appid: u32, envelope: Envelope) -> Result<()> {
        self.send(envelope.wrap_tunnel(appid)).await
    }

    /// Send a request and get a handle that resolves with the reply.
    pub async fn send_job(&self, envelope: Envelope) -> Result<JobHandle> {
        self.request(|reply| Command::SendJob(envelope, reply)).await?
    }

    /// [`send_job`](Self::send_job) and wait for the reply.
    pub async fn call(&self, envelope: Envelope) -> Result<Envelope> {
        self.send_job(envelope).await?.await
    }

    /// Drop a pending job. Its handle resolves with `JobCancelled` and a late
    /// reply surfaces as an unclaimed [`ClientEvent::Message`]. Returns false
    /// when the job had already ended.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        self.request(|reply| Command::CancelJob(job_id, reply)).await
    }

    /// Send the logon request. The outcome arrives as [`ClientEvent::LoggedOn`].
    pub async fn logon(&self, details: LogOnDetails) -> Result<()> {
        self.request(|reply| Command::LogOn(Box::new(details), reply)).await?
    }

    pub async fn status(&self) -> Result<ClientStatus> {
        self.request(Command::Status).await
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

/// Client under construction. Collaborators not supplied fall back to the
/// ones the configuration describes.
pub struct Client {
    config: NetworkConfig,
    keys: UniverseKeys,
    transport: Option<Arc<dyn Transport>>,
    probe: Option<Arc<dyn LoadProbe>>,
    directory: Option<Directory>,
    registry: SchemaRegistry,
    dispatcher: Dispatcher,
    machine_id: Option<Arc<dyn MachineIdProvider>>,
}

impl Client {
    /// # Errors
    /// `ProtocolError::ConfigError` when the configuration does not validate.
    pub fn new(config: NetworkConfig, keys: UniverseKeys) -> Result<Self> {
        config.validate_strict()?;
        Ok(Self {
            config,
            keys,
            transport: None,
            probe: None,
            directory: None,
            registry: SchemaRegistry::default(),
            dispatcher: Dispatcher::new(),
            machine_id: None,
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_load_probe(mut self, probe: Arc<dyn LoadProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_directory(mut self, directory: Directory) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_registry(mut self, registry: SchemaRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Handlers registered on `dispatcher` (before or after start) receive
    /// every message they are keyed on.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_machine_id(mut self, provider: Arc<dyn MachineIdProvider>) -> Self {
        self.machine_id = Some(provider);
        self
    }

    /// Spawn the actor. Must be called from within a tokio runtime.
    pub fn start(self) -> (ClientHandle, EventStream) {
        let config = self.config;
        let capacity = config.client.channel_capacity;

        let transport = self.transport.unwrap_or_else(|| {
            Arc::new(Connector::new(&config.transport, config.client.connection_timeout))
        });
        let probe = self.probe.unwrap_or_else(|| match config.transport.kind {
            TransportKind::Udp => Arc::new(UdpLoadProbe::new(config.discovery.window)),
            _ => Arc::new(StaticLoadProbe::default()),
        });
        let directory = self
            .directory
            .unwrap_or_else(|| Directory::from_config(&config.discovery));

        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (beat_tx, beat_rx) = mpsc::channel(4);
        let metrics = Arc::new(Metrics::new());

        let reconnect = ExponentialBackoff::new(
            config.client.reconnect_delay,
            config.client.max_reconnect_delay,
            Some(config.client.max_reconnect_attempts),
        )
        .with_jitter();

        let actor = Actor {
            selector: Selector::new(probe, &config.discovery),
            handshake: Handshake::new(config.client.universe, self.keys),
            jobs: JobManager::new(config.client.job_timeout),
            session: Session::new(),
            heartbeat: HeartbeatScheduler::new(),
            transport,
            directory,
            registry: self.registry,
            dispatcher: self.dispatcher,
            machine_id: self.machine_id,
            metrics: metrics.clone(),
            events: event_tx,
            commands: command_rx,
            beat_tx,
            beat_rx,
            channel: None,
            discovery: None,
            reconnect,
            reconnect_at: None,
            wants_connection: false,
            config,
        };
        tokio::spawn(actor.run());

        (
            ClientHandle {
                commands: command_tx,
                metrics,
            },
            ReceiverStream::new(event_rx),
        )
    }
}

/// Discovery running off the actor; `reply` is set for an explicit connect.
struct Discovery {
    task: JoinHandle<Result<Endpoint>>,
    reply: Option<oneshot::Sender<Result<Endpoint>>>,
}

impl Discovery {
    fn cancel(self) {
        self.task.abort();
        if let Some(reply) = self.reply {
            let _ = reply.send(Err(ProtocolError::ConnectionFailed(
                constants::ERR_CONNECT_CANCELLED.to_string(),
            )));
        }
    }
}

async fn discovery_done(discovery: &mut Option<Discovery>) -> Result<Endpoint> {
    match discovery {
        Some(d) => match (&mut d.task).await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::ConnectionFailed(format!("discovery task failed: {e}"))),
        },
        None => std::future::pending().await,
    }
}

enum Step {
    Frame(Option<Bytes>),
    Discovered(Result<Endpoint>),
    Command(Option<Command>),
    Heartbeat(Envelope),
    Sweep,
    Reconnect,
}

struct Actor {
    config: NetworkConfig,
    transport: Arc<dyn Transport>,
    selector: Selector,
    directory: Directory,
    handshake: Handshake,
    session: Session,
    jobs: JobManager,
    heartbeat: HeartbeatScheduler,
    registry: SchemaRegistry,
    dispatcher: Dispatcher,
    machine_id: Option<Arc<dyn MachineIdProvider>>,
    metrics: Arc<Metrics>,
    events: mpsc::Sender<ClientEvent>,
    commands: mpsc::Receiver<Command>,
    beat_tx: mpsc::Sender<Envelope>,
    beat_rx: mpsc::Receiver<Envelope>,
    channel: Option<FramedChannel>,
    discovery: Option<Discovery>,
    reconnect: ExponentialBackoff,
    reconnect_at: Option<Instant>,
    wants_connection: bool,
}

impl Actor {
    async fn run(mut self) {
        let mut sweep = interval(JOB_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = self.reconnect_at;
            let step = match self.channel.as_mut() {
                Some(channel) => tokio::select! {
                    frame = channel.recv() => Step::Frame(frame),
                    command = self.commands.recv() => Step::Command(command),
                    Some(beat) = self.beat_rx.recv() => Step::Heartbeat(beat),
                    _ = sweep.tick() => Step::Sweep,
                },
                None => tokio::select! {
                    command = self.commands.recv() => Step::Command(command),
                    found = discovery_done(&mut self.discovery), if self.discovery.is_some() => Step::Discovered(found),
                    _ = sleep_until(reconnect_at.unwrap_or_else(Instant::now)), if reconnect_at.is_some() => Step::Reconnect,
                    _ = sweep.tick() => Step::Sweep,
                },
            };

            match step {
                Step::Frame(Some(frame)) => {
                    if let Err(e) = self.on_frame(frame).await {
                        self.connection_lost(DisconnectReason::Error(e.to_string()));
                    }
                }
                Step::Frame(None) => {
                    let reason = match self.channel.as_mut() {
                        Some(channel) => channel.closed().await,
                        None => DisconnectReason::RemoteClosed,
                    };
                    self.connection_lost(reason);
                }
                Step::Command(Some(command)) => self.on_command(command).await,
                Step::Discovered(found) => self.on_discovered(found).await,
                Step::Command(None) => {
                    debug!("all client handles dropped");
                    if let Some(discovery) = self.discovery.take() {
                        discovery.cancel();
                    }
                    self.teardown(&DisconnectReason::UserInitiated);
                    break;
                }
                Step::Heartbeat(mut beat) => {
                    if self.session.is_logged_on() {
                        self.session.stamp(&mut beat);
                        if let Err(e) = self.write(beat).await {
                            self.connection_lost(DisconnectReason::Error(e.to_string()));
                        }
                    }
                }
                Step::Sweep => {
                    let expired = self.jobs.sweep(Instant::now());
                    if expired > 0 {
                        self.metrics.jobs_timed_out(expired as u64);
                    }
                }
                Step::Reconnect => {
                    self.reconnect_at = None;
                    self.start_discovery(None);
                }
            }
        }
        self.metrics.log_summary();
        debug!("client actor stopped");
    }

    fn emit(&self, event: ClientEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!(?event, "event stream full, dropping event");
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                self.wants_connection = true;
                self.reconnect_at = None;
                self.reconnect.reset();
                self.start_discovery(Some(reply));
            }
            Command::Disconnect(reply) => {
                self.wants_connection = false;
                self.reconnect_at = None;
                if let Some(discovery) = self.discovery.take() {
                    info!("connect cancelled during discovery");
                    discovery.cancel();
                }
                if self.channel.is_some() {
                    info!("disconnecting");
                    self.teardown(&DisconnectReason::UserInitiated);
                    self.emit(ClientEvent::Disconnected {
                        reason: DisconnectReason::UserInitiated,
                        user_initiated: true,
                    });
                }
                let _ = reply.send(());
            }
            Command::Send(envelope, reply) => {
                let _ = reply.send(self.send_application(envelope).await);
            }
            Command::SendJob(mut envelope, reply) => {
                if let Err(e) = self.ensure_encrypted() {
                    let _ = reply.send(Err(e));
                    return;
                }
                let handle = self.jobs.start(&mut envelope);
                let job_id = handle.job_id();
                match self.send_application(envelope).await {
                    Ok(()) => {
                        self.metrics.job_started();
                        let _ = reply.send(Ok(handle));
                    }
                    Err(e) => {
                        self.jobs.cancel(job_id);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::CancelJob(job_id, reply) => {
                let cancelled = self.jobs.cancel(job_id);
                debug!(%job_id, cancelled, "job cancel requested");
                let _ = reply.send(cancelled);
            }
            Command::LogOn(details, reply) => {
                let result = match self.ensure_encrypted() {
                    Ok(()) => {
                        let machine_id = self.machine_id.as_ref().and_then(|p| match p.machine_id() {
                            Ok(id) => Some(id),
                            Err(e) => {
                                warn!(error = %e, "machine id unavailable");
                                None
                            }
                        });
                        info!(details = ?details, "logging on");
                        self.write(details.to_envelope(machine_id)).await
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(ClientStatus {
                    state: self.session.state(),
                    endpoint: self.session.endpoint().cloned(),
                    account_id: self.session.account_id(),
                    session_id: self.session.session_id(),
                    heartbeat_interval: self.heartbeat.interval(),
                    pending_jobs: self.jobs.len(),
                });
            }
        }
    }

    /// Drop any current connection and start discovery in its own task so
    /// commands keep flowing while servers are probed.
    fn start_discovery(&mut self, reply: Option<oneshot::Sender<Result<Endpoint>>>) {
        if self.channel.is_some() {
            self.teardown(&DisconnectReason::UserInitiated);
        }
        if let Some(previous) = self.discovery.take() {
            previous.cancel();
        }

        let candidates = self.directory.candidates(self.config.transport.kind);
        let selector = self.selector.clone();
        debug!(candidates = candidates.len(), "starting discovery");
        let task = tokio::spawn(async move { selector.discover(&candidates).await });
        self.discovery = Some(Discovery { task, reply });
    }

    async fn on_discovered(&mut self, found: Result<Endpoint>) {
        let reply = self.discovery.take().and_then(|d| d.reply);
        let result = match found {
            Ok(endpoint) => self.open(endpoint).await,
            Err(e) => Err(e),
        };
        match reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(error = %e, "reconnect attempt failed");
                    self.schedule_reconnect();
                }
            }
        }
    }

    /// Open a fresh connection to the selected server.
    #[instrument(skip_all, fields(%endpoint))]
    async fn open(&mut self, endpoint: Endpoint) -> Result<Endpoint> {
        let channel = match self.transport.open(&endpoint).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(%endpoint, error = %e, "failed to open transport");
                self.metrics.connection_error();
                self.directory.mark(&endpoint, Quality::Bad);
                return Err(e);
            }
        };

        info!(%endpoint, remote = channel.remote(), "connected");
        self.metrics.connection_established();
        self.metrics.handshake_attempt();
        self.session.begin(endpoint.clone());
        self.handshake.connected();
        self.channel = Some(channel);
        self.emit(ClientEvent::Connected {
            endpoint: endpoint.clone(),
        });
        Ok(endpoint)
    }

    /// Drop everything tied to the current connection.
    fn teardown(&mut self, reason: &DisconnectReason) {
        self.heartbeat.stop();
        if let Some(channel) = self.channel.take() {
            channel.close();
            self.metrics.connection_closed();
        }
        if let Some(endpoint) = self.session.endpoint().cloned() {
            if !reason.is_user_initiated() {
                self.directory.mark(&endpoint, Quality::Bad);
            }
        }
        self.session.clear();
        self.handshake.reset();
        self.jobs.fail_all();
    }

    fn connection_lost(&mut self, reason: DisconnectReason) {
        warn!(%reason, "connection lost");
        self.teardown(&reason);
        self.emit(ClientEvent::Disconnected {
            user_initiated: reason.is_user_initiated(),
            reason,
        });
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.client.auto_reconnect || !self.wants_connection {
            return;
        }
        match self.reconnect.next_delay() {
            Some(delay) => {
                let attempt = self.reconnect.attempts();
                info!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
                self.metrics.reconnect();
                self.reconnect_at = Some(Instant::now() + delay);
                self.emit(ClientEvent::Reconnecting { attempt, delay });
            }
            None => {
                error!(
                    attempts = self.reconnect.attempts(),
                    "giving up on reconnecting"
                );
                self.wants_connection = false;
                self.emit(ClientEvent::ReconnectFailed);
            }
        }
    }

    fn ensure_encrypted(&self) -> Result<()> {
        if self.channel.is_none() {
            return Err(ProtocolError::ConnectionFailed(constants::ERR_NOT_CONNECTED.to_string()));
        }
        if !self.session.is_encrypted() {
            return Err(ProtocolError::ConnectionFailed(constants::ERR_CHANNEL_NOT_READY.to_string()));
        }
        Ok(())
    }

    async fn send_application(&mut self, mut envelope: Envelope) -> Result<()> {
        self.ensure_encrypted()?;
        self.session.stamp(&mut envelope);
        self.write(envelope).await
    }

    /// Seal and queue one envelope on the current channel.
    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| ProtocolError::ConnectionFailed(constants::ERR_NOT_CONNECTED.to_string()))?;
        let frame = self.session.seal(&envelope)?;
        debug!(msg_type = %envelope.msg_type(), len = frame.len(), "sending");
        let len = frame.len() as u64;
        channel.send(frame).await?;
        self.metrics.frame_sent(len);
        Ok(())
    }

    /// Handle one frame. An error is fatal to the connection; decode errors in
    /// a single message are logged and swallowed here.
    async fn on_frame(&mut self, frame: Bytes) -> Result<()> {
        self.metrics.frame_received(frame.len() as u64);
        let plain = self.session.open(frame)?;
        let envelope = match Envelope::decode(plain) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping undecodable message");
                self.metrics.decode_error();
                return Ok(());
            }
        };
        debug!(msg_type = %envelope.msg_type(), "received");

        if !self.session.is_encrypted() {
            return self.on_handshake_message(&envelope).await;
        }

        if envelope.msg_type() == MsgType::MULTI {
            match multi::unpack(&envelope) {
                Ok(messages) => {
                    for message in messages {
                        self.on_message(message).await?;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping corrupt multi");
                    self.metrics.decode_error();
                }
            }
            return Ok(());
        }
        self.on_message(envelope).await
    }

    async fn on_handshake_message(&mut self, envelope: &Envelope) -> Result<()> {
        let action = match self.handshake.handle(envelope) {
            Ok(action) => action,
            Err(e) => {
                error!(error = %e, "channel handshake failed");
                self.metrics.handshake_failed();
                return Err(e);
            }
        };
        match action {
            HandshakeAction::Reply(reply) => self.write(reply).await,
            HandshakeAction::Established(cipher) => {
                self.session.install_cipher(cipher);
                self.metrics.handshake_success();
                if let Some(endpoint) = self.session.endpoint().cloned() {
                    self.directory.mark(&endpoint, Quality::Good);
                }
                self.reconnect.reset();
                self.emit(ClientEvent::ChannelEncrypted);
                Ok(())
            }
            HandshakeAction::Ignored => Ok(()),
        }
    }

    async fn on_message(&mut self, envelope: Envelope) -> Result<()> {
        let msg_type = envelope.msg_type();
        match msg_type {
            MsgType::JOB_HEARTBEAT => {
                self.jobs.heartbeat(envelope.target_job());
                return Ok(());
            }
            MsgType::DEST_JOB_FAILED => {
                self.jobs.fail(envelope.target_job());
                return Ok(());
            }
            MsgType::CLIENT_FROM_GC => {
                match envelope.unwrap_tunnel() {
                    Ok((appid, inner)) => self.emit(ClientEvent::AppMessage { appid, envelope: inner }),
                    Err(e) => {
                        warn!(error = %e, "dropping malformed tunnel message");
                        self.metrics.decode_error();
                    }
                }
                return Ok(());
            }
            MsgType::CLIENT_LOG_ON_RESPONSE => {
                let Some(response) = self.control::<LogonResponse>(&envelope) else {
                    return Ok(());
                };
                self.on_logon_response(&envelope, &response);
            }
            MsgType::CLIENT_LOGGED_OFF => {
                let Some(logged_off) = self.control::<LoggedOff>(&envelope) else {
                    return Ok(());
                };
                self.on_logged_off(&logged_off);
            }
            MsgType::CLIENT_CM_LIST => {
                let Some(list) = self.control::<CmList>(&envelope) else {
                    return Ok(());
                };
                self.on_cm_list(&list);
            }
            _ => {}
        }

        let body = match self.registry.decode(&envelope) {
            Ok(body) => body,
            Err(e) => {
                warn!(%msg_type, error = %e, "dropping message with undecodable body");
                self.metrics.decode_error();
                return Ok(());
            }
        };

        let target = envelope.target_job();
        if target.is_valid() && self.jobs.is_pending(target) {
            if self.jobs.complete(envelope) {
                self.metrics.job_completed();
            }
            return Ok(());
        }

        match self.dispatcher.dispatch(&envelope, &body) {
            Ok(true) => {}
            Ok(false) => self.emit(ClientEvent::Message(envelope)),
            Err(e) => warn!(%msg_type, error = %e, "handler failed"),
        }
        Ok(())
    }

    /// Decode a message the engine itself acts on. The registry only feeds
    /// the dispatcher, so a caller-supplied one cannot hide these.
    fn control<M: prost::Message + Default>(&self, envelope: &Envelope) -> Option<M> {
        match envelope.decode_body::<M>() {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(msg_type = %envelope.msg_type(), error = %e, "dropping malformed control message");
                self.metrics.decode_error();
                None
            }
        }
    }

    fn on_logon_response(&mut self, envelope: &Envelope, response: &LogonResponse) {
        let result = EResult(response.eresult.unwrap_or(EResult::INVALID.0));

        if !result.is_ok() {
            warn!(%result, "logon rejected");
            self.emit(ClientEvent::LoggedOn {
                result,
                heartbeat_interval: None,
            });
            return;
        }

        let interval = response
            .out_of_game_heartbeat_seconds
            .and_then(|s| u64::try_from(s).ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.config.client.heartbeat_interval);

        self.session.logged_on(
            envelope.header().account_id(),
            envelope.header().session_id(),
            response.cell_id,
            interval,
        );
        self.handshake.logged_on();
        self.heartbeat.start(interval, self.beat_tx.clone());
        self.emit(ClientEvent::LoggedOn {
            result,
            heartbeat_interval: Some(interval),
        });
    }

    fn on_logged_off(&mut self, logged_off: &LoggedOff) {
        let result = logged_off.eresult.map_or(EResult::INVALID, EResult);
        info!(%result, "logged off by server");

        self.heartbeat.stop();
        self.session.logged_off();
        self.handshake.logged_off();

        if result == EResult::TRY_ANOTHER_CM || result == EResult::SERVICE_UNAVAILABLE {
            if let Some(endpoint) = self.session.endpoint().cloned() {
                self.directory.mark(&endpoint, Quality::Bad);
            }
        }
        self.emit(ClientEvent::LoggedOff { result });
    }

    fn on_cm_list(&mut self, list: &CmList) {
        let endpoints = endpoints_from_cm_list(list);
        if endpoints.is_empty() {
            return;
        }
        self.directory.replace_list(endpoints);
        self.emit(ClientEvent::ServerListUpdated {
            servers: self.directory.len(),
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::discovery::MemoryEndpointStore;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    /// Transport whose server side is driven by the test.
    #[derive(Default)]
    struct LoopbackTransport {
        servers: Mutex<Vec<crate::transport::ChannelDriver>>,
    }

    #[async_trait]
    impl Transport for LoopbackTransport {
        async fn open(&self, endpoint: &Endpoint) -> Result<FramedChannel> {
            let (channel, driver) = crate::transport::channel_pair(endpoint.address(), 16);
            self.servers.lock().unwrap().push(driver);
            Ok(channel)
        }
    }

    fn client(transport: Arc<LoopbackTransport>) -> Client {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.client.auto_reconnect = false;
        });
        let directory = Directory::new(
            vec![Endpoint::new("10.0.0.1:27017", TransportKind::Tcp)],
            Box::new(MemoryEndpointStore::new()),
        );
        Client::new(config, UniverseKeys::new())
            .unwrap()
            .with_transport(transport)
            .with_directory(directory)
    }

    #[tokio::test]
    async fn test_send_before_encryption_is_refused() {
        let transport = Arc::new(LoopbackTransport::default());
        let (handle, mut events) = client(transport.clone()).start();

        let err = handle.send(crate::protocol::heartbeat::heartbeat_message()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(ref m) if m == constants::ERR_NOT_CONNECTED));

        let endpoint = handle.connect().await.unwrap();
        assert_eq!(endpoint.address(), "10.0.0.1:27017");
        assert!(matches!(events.next().await, Some(ClientEvent::Connected { .. })));

        let err = handle.send(crate::protocol::heartbeat::heartbeat_message()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(ref m) if m == constants::ERR_CHANNEL_NOT_READY));
        assert_eq!(handle.status().await.unwrap().state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_remote_close_without_reconnect() {
        let transport = Arc::new(LoopbackTransport::default());
        let (handle, mut events) = client(transport.clone()).start();
        handle.connect().await.unwrap();
        assert!(matches!(events.next().await, Some(ClientEvent::Connected { .. })));

        let driver = transport.servers.lock().unwrap().pop().unwrap();
        driver.finish(DisconnectReason::RemoteClosed);
        drop(driver);

        match events.next().await {
            Some(ClientEvent::Disconnected { reason, user_initiated }) => {
                assert_eq!(reason, DisconnectReason::RemoteClosed);
                assert!(!user_initiated);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.status().await.unwrap().state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_user_disconnect() {
        let transport = Arc::new(LoopbackTransport::default());
        let (handle, mut events) = client(transport.clone()).start();
        handle.connect().await.unwrap();
        events.next().await;

        handle.disconnect().await.unwrap();
        match events.next().await {
            Some(ClientEvent::Disconnected { user_initiated, .. }) => assert!(user_initiated),
            other => panic!("unexpected {other:?}"),
        }
        let driver = transport.servers.lock().unwrap().pop().unwrap();
        assert!(driver.shutdown.is_cancelled());
    }

    struct StalledLoad;

    #[async_trait]
    impl LoadProbe for StalledLoad {
        async fn probe(&self, _endpoint: &Endpoint) -> Result<u32> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_discovery_in_flight() {
        let transport = Arc::new(LoopbackTransport::default());
        let (handle, _events) = client(transport.clone())
            .with_load_probe(Arc::new(StalledLoad))
            .start();

        let connecting = tokio::spawn({
            let handle = handle.clone();
            async move { handle.connect().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = tokio::time::timeout(Duration::from_millis(200), handle.status())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);

        handle.disconnect().await.unwrap();
        let err = connecting.await.unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionFailed(ref m) if m == constants::ERR_CONNECT_CANCELLED));
        assert!(transport.servers.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_handles_stops_the_actor() {
        let transport = Arc::new(LoopbackTransport::default());
        let (handle, mut events) = client(transport).start();
        drop(handle);
        assert!(events.next().await.is_none());
    }
}
