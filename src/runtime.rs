#![cfg(feature = "runtime")]

//! Tokio-based runtime scaffolding for driving a [`CoreContext`].
//!
//! The core itself never performs I/O. [`spawn_core`] moves it into a task that polls a
//! [`Transport`] on a fixed interval, wakes for the core's own timers, executes the
//! [`Action`]s the core queues and forwards client notifications into bounded channels.
//! Directory lookups run on tasks of their own and report back over a channel, so a slow
//! [`Directory`] never holds up other sessions.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError, Receiver, Sender},
        oneshot,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    api::{completion, Action, Directory, OutboundMessage, SendOutcome, Transport, TransportEvent},
    clients::{ClientId, ClientInterest, Notification},
    context::CoreContext,
    crypto::identity::{PeerId, PeerKey},
    peer::PeerSnapshot,
};

/// Configuration parameters controlling how the core task is driven.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between transport polls and timer checks.
    pub tick: Duration,
    /// Capacity of the command channel used between the handle and the core task.
    pub command_buffer: usize,
    /// Capacity of the event channel surfaced to the caller.
    pub event_buffer: usize,
    /// Capacity of each client's notification channel.
    pub notification_buffer: usize,
    /// Upper bound on transport events handled per tick.
    pub max_events_per_tick: usize,
    /// Number of consecutive transport errors tolerated before the runtime stops.
    pub max_error_burst: usize,
    /// Grace period allowed for the task to stop during [`CoreHandle::shutdown`].
    pub shutdown_grace: Duration,
}

impl RuntimeConfig {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            ..Self::default()
        }
    }

    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn with_notification_buffer(mut self, capacity: usize) -> Self {
        self.notification_buffer = capacity.max(1);
        self
    }

    pub fn with_max_events_per_tick(mut self, events: usize) -> Self {
        self.max_events_per_tick = events;
        self
    }

    pub fn with_max_error_burst(mut self, burst: usize) -> Self {
        self.max_error_burst = burst;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn normalize(&mut self) {
        if self.tick.is_zero() {
            self.tick = Duration::from_millis(1);
        }
        self.command_buffer = self.command_buffer.max(1);
        self.event_buffer = self.event_buffer.max(1);
        self.notification_buffer = self.notification_buffer.max(1);
        self.max_events_per_tick = self.max_events_per_tick.max(1);
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
            command_buffer: 512,
            event_buffer: 1024,
            notification_buffer: 256,
            max_events_per_tick: 256,
            max_error_burst: 4,
            shutdown_grace: Duration::from_secs(1),
        }
    }
}

/// Reason why the core task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStopReason {
    /// Explicit [`CoreHandle::shutdown`].
    Shutdown,
    /// Every handle was dropped without a shutdown request.
    CommandChannelClosed,
    /// The consumer dropped the event channel.
    EventChannelClosed,
    /// Too many consecutive transport errors.
    Fatal,
}

/// Events emitted by a running core task.
#[derive(Debug)]
pub enum RuntimeEvent<TE> {
    /// The transport reported a new connection.
    PeerConnected(PeerId),
    /// The transport reported a lost connection.
    PeerDisconnected(PeerId),
    /// The transport failed while polling or executing an action.
    TransportError(TE),
    /// The runtime stopped after repeated transport errors.
    Fatal {
        /// Number of back-to-back errors encountered before termination.
        consecutive_errors: usize,
    },
    /// The task finished execution.
    Stopped(CoreStopReason),
}

/// A registered client and the channel its notifications arrive on.
#[derive(Debug)]
pub struct ClientSubscription {
    pub id: ClientId,
    pub notifications: Receiver<Notification>,
}

impl ClientSubscription {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }
}

/// Handle used to interact with a spawned core task.
#[derive(Debug)]
pub struct CoreHandle {
    local: PeerId,
    commands: Sender<CoreCommand>,
    join: JoinHandle<()>,
    config: Arc<RuntimeConfig>,
}

impl CoreHandle {
    /// Identity of the local node.
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Queues a message; the returned receiver resolves with its outcome.
    pub fn submit(
        &self,
        peer: PeerId,
        message: OutboundMessage,
    ) -> Result<oneshot::Receiver<SendOutcome>, CoreHandleError> {
        let (tx, rx) = completion();
        self.try_command(CoreCommand::Submit {
            peer,
            message,
            completion: tx,
        })?;
        Ok(rx)
    }

    /// Queues a message without tracking its outcome.
    pub fn send<B>(&self, peer: PeerId, msg_type: u16, payload: B, priority: u32, deadline: Instant) -> Result<(), CoreHandleError>
    where
        B: Into<Bytes>,
    {
        self.submit(peer, OutboundMessage::new(msg_type, payload, priority, deadline))
            .map(drop)
    }

    pub fn increase_preference(&self, peer: PeerId, delta: u64) -> Result<(), CoreHandleError> {
        self.try_command(CoreCommand::IncreasePreference { peer, delta })
    }

    pub fn set_outbound_limit(&self, peer: PeerId, bpm: u32) -> Result<(), CoreHandleError> {
        self.try_command(CoreCommand::SetOutboundLimit { peer, bpm })
    }

    pub fn unregister_client(&self, id: ClientId) -> Result<(), CoreHandleError> {
        self.try_command(CoreCommand::UnregisterClient(id))
    }

    /// Registers a client; connect notifications for confirmed peers arrive first.
    pub async fn register_client(&self, interest: ClientInterest) -> Result<ClientSubscription, CoreHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CoreCommand::RegisterClient { interest, reply: tx })
            .await
            .map_err(|_| CoreHandleError::ChannelClosed)?;
        rx.await.map_err(|_| CoreHandleError::CoreStopped)
    }

    /// Requests a snapshot of one session and awaits the result.
    pub async fn snapshot(&self, peer: PeerId) -> Result<Option<PeerSnapshot>, CoreHandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(CoreCommand::Snapshot { peer, reply: tx })
            .await
            .map_err(|_| CoreHandleError::ChannelClosed)?;
        rx.await.map_err(|_| CoreHandleError::CoreStopped)
    }

    /// Signals the core task to tear down and waits for the join handle.
    pub async fn shutdown(self) -> Result<(), CoreHandleError> {
        let CoreHandle {
            commands,
            join,
            config,
            ..
        } = self;

        commands
            .send(CoreCommand::Shutdown)
            .await
            .map_err(|_| CoreHandleError::ChannelClosed)?;

        if config.shutdown_grace.is_zero() {
            join.await?;
            return Ok(());
        }

        match time::timeout(config.shutdown_grace, join).await {
            Ok(result) => result.map_err(CoreHandleError::Join),
            Err(_) => Err(CoreHandleError::ShutdownTimeout),
        }
    }

    fn try_command(&self, command: CoreCommand) -> Result<(), CoreHandleError> {
        self.commands.try_send(command).map_err(|err| match err {
            TrySendError::Closed(_) => CoreHandleError::ChannelClosed,
            TrySendError::Full(_) => CoreHandleError::CommandQueueFull,
        })
    }
}

/// Errors returned by [`CoreHandle`].
#[derive(Debug, Error)]
pub enum CoreHandleError {
    #[error("core runtime channel closed")]
    ChannelClosed,
    #[error("core runtime command channel is full")]
    CommandQueueFull,
    #[error("core runtime stopped unexpectedly")]
    CoreStopped,
    #[error("core runtime join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("core runtime shutdown timed out")]
    ShutdownTimeout,
}

enum CoreCommand {
    Submit {
        peer: PeerId,
        message: OutboundMessage,
        completion: oneshot::Sender<SendOutcome>,
    },
    RegisterClient {
        interest: ClientInterest,
        reply: oneshot::Sender<ClientSubscription>,
    },
    UnregisterClient(ClientId),
    IncreasePreference {
        peer: PeerId,
        delta: u64,
    },
    SetOutboundLimit {
        peer: PeerId,
        bpm: u32,
    },
    Snapshot {
        peer: PeerId,
        reply: oneshot::Sender<Option<PeerSnapshot>>,
    },
    Shutdown,
}

/// Spawns a Tokio task that drives `core` against `transport` and `directory`.
pub fn spawn_core<T, D>(
    core: CoreContext,
    transport: T,
    directory: D,
) -> (CoreHandle, Receiver<RuntimeEvent<T::Error>>)
where
    T: Transport + Send + 'static,
    D: Directory,
{
    spawn_core_with_config(core, transport, directory, RuntimeConfig::default())
}

/// Spawns the core task using an explicit [`RuntimeConfig`].
pub fn spawn_core_with_config<T, D>(
    core: CoreContext,
    transport: T,
    directory: D,
    mut config: RuntimeConfig,
) -> (CoreHandle, Receiver<RuntimeEvent<T::Error>>)
where
    T: Transport + Send + 'static,
    D: Directory,
{
    config.normalize();
    let config = Arc::new(config);
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
    let (lookup_tx, lookup_rx) = mpsc::channel(config.command_buffer);
    let local = core.local_id();

    let driver = Driver {
        core,
        transport,
        directory: Arc::new(directory),
        lookups: AHashMap::default(),
        next_lookup: 0,
        lookup_results: lookup_tx,
        subscribers: Vec::new(),
        notices: Vec::new(),
        notification_buffer: config.notification_buffer,
    };
    let join = tokio::spawn(run_core(
        driver,
        Arc::clone(&config),
        command_rx,
        lookup_rx,
        event_tx,
    ));
    let handle = CoreHandle {
        local,
        commands: command_tx,
        join,
        config,
    };
    (handle, event_rx)
}

/// A directory lookup running on its own task.
struct PendingLookup {
    generation: u64,
    task: JoinHandle<()>,
}

/// Outcome of a lookup task, tagged so results of superseded lookups are ignored.
struct LookupResult {
    peer: PeerId,
    generation: u64,
    key: Option<PeerKey>,
}

struct Driver<T: Transport, D> {
    core: CoreContext,
    transport: T,
    directory: Arc<D>,
    lookups: AHashMap<PeerId, PendingLookup>,
    next_lookup: u64,
    lookup_results: Sender<LookupResult>,
    subscribers: Vec<(ClientId, Sender<Notification>)>,
    notices: Vec<RuntimeEvent<T::Error>>,
    notification_buffer: usize,
}

impl<T: Transport, D: Directory> Driver<T, D> {
    /// One tick: drain transport events, fire due timers, execute actions.
    fn drive(&mut self, max_events: usize) -> Result<(), T::Error> {
        for _ in 0..max_events {
            let Some(event) = self.transport.poll()? else {
                break;
            };
            self.on_transport_event(event)?;
        }
        self.fire_timers()
    }

    fn fire_timers(&mut self) -> Result<(), T::Error> {
        let now = Instant::now();
        if self.core.poll_timeout().map_or(false, |at| at <= now) {
            self.core.handle_timeout(now);
        }
        self.flush()
    }

    fn start_lookup(&mut self, peer: PeerId, timeout: Duration) {
        self.next_lookup += 1;
        let generation = self.next_lookup;
        let directory = Arc::clone(&self.directory);
        let results = self.lookup_results.clone();
        let task = tokio::spawn(async move {
            let key = time::timeout(timeout, directory.lookup_public_key(peer, timeout))
                .await
                .ok()
                .flatten();
            let _ = results.send(LookupResult { peer, generation, key }).await;
        });
        if let Some(previous) = self.lookups.insert(peer, PendingLookup { generation, task }) {
            previous.task.abort();
        }
    }

    fn cancel_lookup(&mut self, peer: &PeerId) {
        if let Some(pending) = self.lookups.remove(peer) {
            pending.task.abort();
            debug!(%peer, "directory lookup cancelled");
        }
    }

    fn on_lookup_result(&mut self, result: LookupResult) -> Result<(), T::Error> {
        match self.lookups.get(&result.peer) {
            Some(pending) if pending.generation == result.generation => {
                self.lookups.remove(&result.peer);
            }
            _ => {
                debug!(peer = %result.peer, "result of abandoned lookup dropped");
                return Ok(());
            }
        }
        self.core
            .on_lookup_complete(&result.peer, result.key, Instant::now());
        self.flush()
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Result<(), T::Error> {
        let now = Instant::now();
        match event {
            TransportEvent::Connected(peer) => {
                self.core.on_connect(peer, now);
                self.notices.push(RuntimeEvent::PeerConnected(peer));
            }
            TransportEvent::Disconnected(peer) => {
                self.core.on_disconnect(&peer);
                self.notices.push(RuntimeEvent::PeerDisconnected(peer));
            }
            TransportEvent::Received { peer, frame } => self.core.on_receive(&peer, &frame, now),
            TransportEvent::SendReady {
                peer,
                ticket,
                capacity,
            } => {
                let mut buf = vec![0u8; capacity];
                let written = self.core.on_send_ready(&peer, ticket, Some(&mut buf), now);
                if written > 0 {
                    buf.truncate(written);
                    self.transport.transmit(&peer, Bytes::from(buf))?;
                }
            }
            TransportEvent::SendFailed { peer, ticket } => {
                self.core.on_send_ready(&peer, ticket, None, now);
            }
        }
        self.execute_actions()
    }

    fn flush(&mut self) -> Result<(), T::Error> {
        let result = self.execute_actions();
        self.forward_notifications();
        result
    }

    fn execute_actions(&mut self) -> Result<(), T::Error> {
        while let Some(action) = self.core.poll_action() {
            match action {
                Action::RequestSendSlot {
                    peer,
                    ticket,
                    max_size,
                    priority,
                    deadline,
                } => self
                    .transport
                    .request_send_slot(&peer, ticket, max_size, priority, deadline)?,
                Action::CancelSendSlot { peer, ticket } => {
                    self.transport.cancel_send_slot(&peer, ticket)?
                }
                Action::SetReceiveQuota { peer, bpm } => self.transport.set_receive_quota(&peer, bpm)?,
                Action::LookupPublicKey { peer, timeout } => self.start_lookup(peer, timeout),
                Action::CancelLookup { peer } => self.cancel_lookup(&peer),
            }
        }
        Ok(())
    }

    fn forward_notifications(&mut self) {
        let core = &mut self.core;
        self.subscribers.retain(|(id, tx)| loop {
            let Some(notification) = core.poll_notification(*id) else {
                return true;
            };
            match tx.try_send(notification) {
                Ok(()) => {}
                Err(TrySendError::Full(notification)) => {
                    core.requeue_notification(*id, notification);
                    return true;
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(client = %id, "client channel closed, unregistering");
                    core.unregister_client(*id);
                    return false;
                }
            }
        });
    }

    fn handle_command(&mut self, command: CoreCommand) -> LoopControl {
        let now = Instant::now();
        match command {
            CoreCommand::Submit {
                peer,
                message,
                completion,
            } => self.core.submit(&peer, message, Some(completion), now),
            CoreCommand::RegisterClient { interest, reply } => {
                let id = self.core.register_client(interest);
                let (tx, rx) = mpsc::channel(self.notification_buffer);
                self.subscribers.push((id, tx));
                let subscription = ClientSubscription {
                    id,
                    notifications: rx,
                };
                if reply.send(subscription).is_err() {
                    self.subscribers.retain(|(client, _)| *client != id);
                    self.core.unregister_client(id);
                }
            }
            CoreCommand::UnregisterClient(id) => {
                self.subscribers.retain(|(client, _)| *client != id);
                self.core.unregister_client(id);
            }
            CoreCommand::IncreasePreference { peer, delta } => {
                if !self.core.increase_preference(&peer, delta) {
                    debug!(%peer, "preference for unknown peer ignored");
                }
            }
            CoreCommand::SetOutboundLimit { peer, bpm } => {
                self.core.set_outbound_limit(&peer, bpm, now);
            }
            CoreCommand::Snapshot { peer, reply } => {
                let _ = reply.send(self.core.snapshot(&peer, now));
            }
            CoreCommand::Shutdown => return LoopControl::Break(CoreStopReason::Shutdown),
        }
        LoopControl::Continue
    }

    fn teardown(&mut self) {
        self.core.teardown();
        if let Err(err) = self.flush() {
            debug!(error = %err, "transport error while cancelling during teardown");
        }
        for (_, pending) in self.lookups.drain() {
            pending.task.abort();
        }
    }
}

async fn run_core<T, D>(
    mut driver: Driver<T, D>,
    config: Arc<RuntimeConfig>,
    mut commands: Receiver<CoreCommand>,
    mut lookups: Receiver<LookupResult>,
    events: Sender<RuntimeEvent<T::Error>>,
) where
    T: Transport + Send + 'static,
    D: Directory,
{
    let mut ticker = time::interval(config.tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut consecutive_errors = 0usize;
    let exit_reason;

    loop {
        let wake = driver.core.poll_timeout().map(time::Instant::from_std);
        let mut control = tokio::select! {
            biased;
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(cmd) => match driver.handle_command(cmd) {
                        LoopControl::Continue => match driver.flush() {
                            Ok(()) => LoopControl::Continue,
                            Err(err) => {
                                report_error(&events, config.max_error_burst, &mut consecutive_errors, err).await
                            }
                        },
                        stop => stop,
                    },
                    None => LoopControl::Break(CoreStopReason::CommandChannelClosed),
                }
            }
            Some(result) = lookups.recv() => {
                match driver.on_lookup_result(result) {
                    Ok(()) => LoopControl::Continue,
                    Err(err) => {
                        report_error(&events, config.max_error_burst, &mut consecutive_errors, err).await
                    }
                }
            }
            _ = ticker.tick() => {
                match driver.drive(config.max_events_per_tick) {
                    Ok(()) => {
                        consecutive_errors = 0;
                        LoopControl::Continue
                    }
                    Err(err) => {
                        report_error(&events, config.max_error_burst, &mut consecutive_errors, err).await
                    }
                }
            }
            _ = time::sleep_until(wake.unwrap_or_else(time::Instant::now)), if wake.is_some() => {
                match driver.fire_timers() {
                    Ok(()) => LoopControl::Continue,
                    Err(err) => {
                        report_error(&events, config.max_error_burst, &mut consecutive_errors, err).await
                    }
                }
            }
        };

        for notice in std::mem::take(&mut driver.notices) {
            if let Err(reason) = push_event(&events, notice).await {
                control = LoopControl::Break(reason);
                break;
            }
        }

        if let LoopControl::Break(reason) = control {
            exit_reason = reason;
            break;
        }
    }

    driver.teardown();
    if let Err(reason) = push_event(&events, RuntimeEvent::Stopped(exit_reason)).await {
        debug!(
            local = %driver.core.local_id(),
            ?exit_reason,
            suppressed = ?reason,
            "failed to deliver final stop event for core runtime"
        );
    }
}

enum LoopControl {
    Continue,
    Break(CoreStopReason),
}

async fn report_error<E>(
    events: &Sender<RuntimeEvent<E>>,
    max_error_burst: usize,
    consecutive_errors: &mut usize,
    err: E,
) -> LoopControl
where
    E: Send + 'static,
{
    *consecutive_errors = consecutive_errors.saturating_add(1);
    if let Err(reason) = push_event(events, RuntimeEvent::TransportError(err)).await {
        return LoopControl::Break(reason);
    }
    if max_error_burst == 0 || *consecutive_errors < max_error_burst {
        return LoopControl::Continue;
    }
    warn!(
        consecutive_errors = *consecutive_errors,
        "core runtime stopping after consecutive transport errors"
    );
    let fatal = RuntimeEvent::Fatal {
        consecutive_errors: *consecutive_errors,
    };
    match push_event(events, fatal).await {
        Ok(()) => LoopControl::Break(CoreStopReason::Fatal),
        Err(reason) => LoopControl::Break(reason),
    }
}

async fn push_event<E>(events: &Sender<RuntimeEvent<E>>, event: RuntimeEvent<E>) -> Result<(), CoreStopReason>
where
    E: Send + 'static,
{
    match events.try_send(event) {
        Ok(_) => Ok(()),
        Err(TrySendError::Full(event)) => {
            warn!("runtime event channel full; applying backpressure");
            events
                .send(event)
                .await
                .map_err(|_| CoreStopReason::EventChannelClosed)
        }
        Err(TrySendError::Closed(_)) => Err(CoreStopReason::EventChannelClosed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::{SendTicket, TransportResult},
        config::Config,
        crypto::identity::{Identity, PeerKey},
        handshake::HandshakeState,
        metrics::Metrics,
    };
    use ahash::AHashMap;
    use std::{
        collections::VecDeque,
        convert::Infallible,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Mutex,
        },
    };

    /// In-memory network shared by every [`LoopTransport`].
    #[derive(Default)]
    struct Wire {
        inboxes: AHashMap<PeerId, VecDeque<TransportEvent>>,
        transmitted: usize,
        quotas: Vec<(PeerId, u32)>,
    }

    #[derive(Clone)]
    struct LoopTransport {
        local: PeerId,
        wire: Arc<Mutex<Wire>>,
    }

    impl LoopTransport {
        fn inject(&self, event: TransportEvent) {
            let mut wire = self.wire.lock().unwrap();
            wire.inboxes.entry(self.local).or_default().push_back(event);
        }
    }

    impl Transport for LoopTransport {
        type Error = Infallible;

        fn poll(&mut self) -> TransportResult<Option<TransportEvent>, Self::Error> {
            let mut wire = self.wire.lock().unwrap();
            Ok(wire.inboxes.entry(self.local).or_default().pop_front())
        }

        fn request_send_slot(
            &mut self,
            peer: &PeerId,
            ticket: SendTicket,
            max_size: usize,
            _priority: u32,
            _deadline: Duration,
        ) -> TransportResult<(), Self::Error> {
            self.inject(TransportEvent::SendReady {
                peer: *peer,
                ticket,
                capacity: max_size,
            });
            Ok(())
        }

        fn cancel_send_slot(&mut self, _peer: &PeerId, ticket: SendTicket) -> TransportResult<(), Self::Error> {
            let mut wire = self.wire.lock().unwrap();
            if let Some(inbox) = wire.inboxes.get_mut(&self.local) {
                inbox.retain(|event| {
                    !matches!(event, TransportEvent::SendReady { ticket: pending, .. } if *pending == ticket)
                });
            }
            Ok(())
        }

        fn transmit(&mut self, peer: &PeerId, frame: Bytes) -> TransportResult<(), Self::Error> {
            let mut wire = self.wire.lock().unwrap();
            wire.transmitted += 1;
            wire.inboxes
                .entry(*peer)
                .or_default()
                .push_back(TransportEvent::Received {
                    peer: self.local,
                    frame,
                });
            Ok(())
        }

        fn set_receive_quota(&mut self, peer: &PeerId, bpm: u32) -> TransportResult<(), Self::Error> {
            self.wire.lock().unwrap().quotas.push((*peer, bpm));
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct StaticDirectory(AHashMap<PeerId, PeerKey>);

    impl Directory for StaticDirectory {
        async fn lookup_public_key(&self, peer: PeerId, _timeout: Duration) -> Option<PeerKey> {
            self.0.get(&peer).cloned()
        }
    }

    /// Raises its flag when dropped before [`Abandon::disarm`].
    struct Abandon(Option<Arc<AtomicBool>>);

    impl Abandon {
        fn disarm(mut self) {
            self.0 = None;
        }
    }

    impl Drop for Abandon {
        fn drop(&mut self) {
            if let Some(flag) = self.0.take() {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Directory that takes `delay` to answer every lookup with a miss.
    #[derive(Clone, Default)]
    struct SlowDirectory {
        delay: Duration,
        lookups: Arc<AtomicUsize>,
        started: Arc<AtomicBool>,
        abandoned: Arc<AtomicBool>,
    }

    impl Directory for SlowDirectory {
        async fn lookup_public_key(&self, _peer: PeerId, _timeout: Duration) -> Option<PeerKey> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.started.store(true, Ordering::SeqCst);
            let guard = Abandon(Some(Arc::clone(&self.abandoned)));
            time::sleep(self.delay).await;
            guard.disarm();
            None
        }
    }

    async fn wait_for(flag: &AtomicBool) -> bool {
        time::timeout(Duration::from_secs(1), async {
            while !flag.load(Ordering::SeqCst) {
                time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .is_ok()
    }

    #[derive(Debug, Error)]
    #[error("fatal transport error")]
    struct FatalError;

    struct FailingTransport;

    impl Transport for FailingTransport {
        type Error = FatalError;

        fn poll(&mut self) -> TransportResult<Option<TransportEvent>, Self::Error> {
            Err(FatalError)
        }

        fn request_send_slot(
            &mut self,
            _peer: &PeerId,
            _ticket: SendTicket,
            _max_size: usize,
            _priority: u32,
            _deadline: Duration,
        ) -> TransportResult<(), Self::Error> {
            Ok(())
        }

        fn cancel_send_slot(&mut self, _peer: &PeerId, _ticket: SendTicket) -> TransportResult<(), Self::Error> {
            Ok(())
        }

        fn transmit(&mut self, _peer: &PeerId, _frame: Bytes) -> TransportResult<(), Self::Error> {
            Ok(())
        }

        fn set_receive_quota(&mut self, _peer: &PeerId, _bpm: u32) -> TransportResult<(), Self::Error> {
            Ok(())
        }
    }

    fn core() -> CoreContext {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        CoreContext::init(Identity::generate(), Config::default(), metrics, Instant::now()).expect("core")
    }

    async fn next_inbound(subscription: &mut ClientSubscription) -> Option<Notification> {
        time::timeout(Duration::from_secs(2), async {
            loop {
                match subscription.recv().await {
                    Some(notification @ Notification::Inbound { .. }) => break Some(notification),
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    #[tokio::test]
    async fn two_cores_handshake_and_exchange_messages() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let (a_core, b_core) = (core(), core());
        let (a_id, b_id) = (a_core.local_id(), b_core.local_id());
        let mut keys = AHashMap::default();
        keys.insert(a_id, a_core.public_key().clone());
        keys.insert(b_id, b_core.public_key().clone());
        let directory = StaticDirectory(keys);

        let a_transport = LoopTransport {
            local: a_id,
            wire: Arc::clone(&wire),
        };
        let b_transport = LoopTransport {
            local: b_id,
            wire: Arc::clone(&wire),
        };
        a_transport.inject(TransportEvent::Connected(b_id));
        b_transport.inject(TransportEvent::Connected(a_id));

        let (a, mut a_events) = spawn_core(a_core, a_transport, directory.clone());
        let (b, _b_events) = spawn_core(b_core, b_transport, directory);

        let first = time::timeout(Duration::from_secs(1), a_events.recv())
            .await
            .ok()
            .flatten();
        assert!(matches!(first, Some(RuntimeEvent::PeerConnected(peer)) if peer == b_id));

        let mut subscription = b.register_client(ClientInterest::types([42])).await.expect("register");
        let outcome = a
            .submit(
                b_id,
                OutboundMessage::new(42, &b"ping"[..], 5, Instant::now() + Duration::from_secs(1)),
            )
            .expect("submit");

        let delivered = next_inbound(&mut subscription).await.expect("delivered");
        assert_eq!(
            delivered,
            Notification::Inbound {
                peer: a_id,
                msg_type: 42,
                size: 8,
                payload: Some(Bytes::from_static(b"ping")),
            }
        );
        let outcome = time::timeout(Duration::from_secs(1), outcome)
            .await
            .expect("outcome in time")
            .expect("outcome sent");
        assert!(matches!(outcome, SendOutcome::Transmitted { .. }));

        let snapshot = a.snapshot(b_id).await.expect("snapshot").expect("session");
        assert_eq!(snapshot.state, HandshakeState::KeyConfirmed);
        assert!(wire.lock().unwrap().transmitted >= 3);
        assert!(wire.lock().unwrap().quotas.iter().any(|(peer, _)| *peer == b_id));

        a.shutdown().await.expect("shutdown a");
        b.shutdown().await.expect("shutdown b");
    }

    #[tokio::test]
    async fn submit_to_unknown_peer_resolves_disconnected() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let core = core();
        let transport = LoopTransport {
            local: core.local_id(),
            wire,
        };
        let (handle, mut events) = spawn_core(core, transport, StaticDirectory::default());

        let stranger = Identity::generate().id();
        let outcome = handle
            .submit(stranger, OutboundMessage::new(1, &b"x"[..], 1, Instant::now()))
            .expect("submit");
        assert_eq!(outcome.await, Ok(SendOutcome::Disconnected));

        handle.shutdown().await.expect("shutdown");
        let stopped = time::timeout(Duration::from_millis(200), async {
            loop {
                match events.recv().await {
                    Some(RuntimeEvent::Stopped(reason)) => break Some(reason),
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .ok()
        .flatten();
        assert_eq!(stopped, Some(CoreStopReason::Shutdown));
    }

    #[tokio::test]
    async fn slow_lookup_does_not_hold_up_commands() {
        let core = core();
        let transport = LoopTransport {
            local: core.local_id(),
            wire: Arc::new(Mutex::new(Wire::default())),
        };
        let stranger = Identity::generate().id();
        transport.inject(TransportEvent::Connected(stranger));
        let directory = SlowDirectory {
            delay: Duration::from_secs(5),
            ..SlowDirectory::default()
        };
        let started = Arc::clone(&directory.started);
        let (handle, _events) = spawn_core(core, transport, directory);
        assert!(wait_for(&started).await, "lookup never started");

        let asked = Instant::now();
        let snapshot = time::timeout(Duration::from_millis(500), handle.snapshot(stranger))
            .await
            .expect("core answered while the lookup runs")
            .expect("snapshot")
            .expect("session");
        assert!(asked.elapsed() < Duration::from_millis(250));
        assert_eq!(snapshot.state, HandshakeState::Down);

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn disconnect_aborts_running_lookup() {
        let core = core();
        let transport = LoopTransport {
            local: core.local_id(),
            wire: Arc::new(Mutex::new(Wire::default())),
        };
        let stranger = Identity::generate().id();
        transport.inject(TransportEvent::Connected(stranger));
        let directory = SlowDirectory {
            delay: Duration::from_secs(5),
            ..SlowDirectory::default()
        };
        let (started, abandoned) = (Arc::clone(&directory.started), Arc::clone(&directory.abandoned));
        let (handle, _events) = spawn_core(core, transport.clone(), directory);
        assert!(wait_for(&started).await, "lookup never started");

        transport.inject(TransportEvent::Disconnected(stranger));
        assert!(wait_for(&abandoned).await, "lookup kept running after disconnect");
        assert!(handle.snapshot(stranger).await.expect("snapshot").is_none());

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn core_timers_fire_between_ticks() {
        let mut config = Config::default();
        config.handshake.initial_retry_ms = 20;
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        let core = CoreContext::init(Identity::generate(), config, metrics, Instant::now()).expect("core");
        let transport = LoopTransport {
            local: core.local_id(),
            wire: Arc::new(Mutex::new(Wire::default())),
        };
        let stranger = Identity::generate().id();
        transport.inject(TransportEvent::Connected(stranger));
        let directory = SlowDirectory {
            delay: Duration::from_millis(1),
            ..SlowDirectory::default()
        };
        let lookups = Arc::clone(&directory.lookups);
        // Only the first tick runs within the test; the retry must come from the core timer.
        let runtime = RuntimeConfig::new(Duration::from_secs(3600));
        let (handle, _events) = spawn_core_with_config(core, transport, directory, runtime);

        let retried = time::timeout(Duration::from_secs(1), async {
            while lookups.load(Ordering::SeqCst) < 2 {
                time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await;
        assert!(retried.is_ok(), "failed lookup was never retried");
        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn command_channel_backpressure_returns_error() {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let core = core();
        let transport = LoopTransport {
            local: core.local_id(),
            wire,
        };
        let config = RuntimeConfig::new(Duration::from_millis(5)).with_command_buffer(1);
        let (handle, _events) = spawn_core_with_config(core, transport, StaticDirectory::default(), config);

        let peer = Identity::generate().id();
        handle.increase_preference(peer, 1).expect("first command fits");
        let err = handle
            .increase_preference(peer, 1)
            .expect_err("second command should backpressure");
        assert!(matches!(err, CoreHandleError::CommandQueueFull));

        handle.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn emits_fatal_event_after_consecutive_errors() {
        let config = RuntimeConfig::new(Duration::from_millis(5))
            .with_event_buffer(16)
            .with_max_error_burst(2);
        let (handle, mut events) =
            spawn_core_with_config(core(), FailingTransport, StaticDirectory::default(), config);

        let mut fatal_seen = false;
        let mut stop_reason = None;
        for _ in 0..8 {
            if let Some(event) = time::timeout(Duration::from_millis(50), events.recv())
                .await
                .ok()
                .flatten()
            {
                match event {
                    RuntimeEvent::TransportError(_) => {}
                    RuntimeEvent::Fatal { consecutive_errors } => {
                        fatal_seen = true;
                        assert!(consecutive_errors >= 2);
                    }
                    RuntimeEvent::Stopped(reason) => {
                        stop_reason = Some(reason);
                        break;
                    }
                    other => panic!("unexpected runtime event: {other:?}"),
                }
            }
        }

        assert!(fatal_seen, "expected fatal event after consecutive errors");
        assert_eq!(stop_reason, Some(CoreStopReason::Fatal));
        if let Err(err) = handle.shutdown().await {
            assert!(
                matches!(err, CoreHandleError::ChannelClosed | CoreHandleError::ShutdownTimeout),
                "unexpected shutdown error: {err}"
            );
        }
    }
}
