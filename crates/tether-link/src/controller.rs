//! Connection controller actor.
//!
//! One spawned task owns every piece of link state: the dispatch queue,
//! the health monitor, both transport adapters, and the subscription
//! registry. Callers interact through a cheap-to-clone [`LinkHandle`];
//! commands arrive on a channel and are interleaved with timer ticks in a
//! single `select!` loop, so no two operations ever run concurrently and
//! no locks are needed.
//!
//! ## Failover
//!
//! The controller starts every session on the socket transport and falls
//! back to polling when the socket proves unusable:
//!
//! - three consecutive socket failures (failed opens, broken writes, or a
//!   dropped read loop), or
//! - the health monitor reporting unhealthy (three straight missed
//!   pongs), or
//! - the reconnect attempt cap
//!
//! all force the switch. Failover is one-way: the controller never walks
//! back to the socket by itself. An explicit [`LinkHandle::connect`]
//! starts a fresh session, which tries the socket again.
//!
//! Reconnect attempts are counted per session (reset only by `connect`),
//! while the consecutive-failure counter resets on every successful open;
//! the attempt cap therefore still catches a socket that flaps between
//! short-lived successes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use tether_core::envelope::{TYPE_PING, TYPE_PONG};
use tether_core::{
    Envelope, Error, Message, MessageId, PingPayload, Priority, Result, SessionId, SubscriptionId,
};

use crate::config::LinkConfig;
use crate::health::HealthMonitor;
use crate::metrics::LinkMetrics;
use crate::queue::{DispatchQueue, DroppedMessage, RequeueOutcome};
use crate::session::{ConnectionSession, LinkState};
use crate::transport::Transport;

/// Commands accepted by the controller actor.
enum LinkCommand {
    Connect,
    Disconnect,
    Publish(Message),
    Subscribe {
        message_type: String,
        sender: mpsc::UnboundedSender<Envelope>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe(SubscriptionId),
    Session {
        reply: oneshot::Sender<ConnectionSession>,
    },
    Shutdown,
}

/// Events the actor loop reduces each `select!` round to.
enum Event {
    Command(Option<LinkCommand>),
    Inbound(Option<Envelope>),
    DispatchTick,
    HeartbeatTick,
    PollTick,
    ReconnectDue,
}

/// Loop control returned by command handling.
#[derive(PartialEq)]
enum Flow {
    Continue,
    Stop,
}

/// Handle to a running connection controller.
///
/// Cloning is cheap; all clones talk to the same actor. The actor stops
/// when [`LinkHandle::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    fn send(&self, command: LinkCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::internal("connection controller is not running"))
    }

    /// Starts a session: fresh session ID, socket transport first.
    ///
    /// No-op while a socket session is already connecting or connected.
    /// Called after failover, it abandons polling and tries the socket
    /// again.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub fn connect(&self) -> Result<()> {
        self.send(LinkCommand::Connect)
    }

    /// Stops the active transport. Idempotent.
    ///
    /// Queued-but-unsent messages stay in the dispatch queue; a later
    /// [`Self::connect`] resumes delivery.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub fn disconnect(&self) -> Result<()> {
        self.send(LinkCommand::Disconnect)
    }

    /// Enqueues a message for delivery and returns its ID immediately.
    ///
    /// Never blocks and never deduplicates; delivery obeys priority order
    /// and the rate limit.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub fn publish(&self, message: Message) -> Result<MessageId> {
        let id = message.id;
        self.send(LinkCommand::Publish(message))?;
        Ok(id)
    }

    /// Registers a subscriber for one message type.
    ///
    /// Every inbound envelope whose `type` matches is delivered to the
    /// returned receiver. There is no broadcast; unmatched envelopes are
    /// dropped with a debug log.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub async fn subscribe(
        &self,
        message_type: impl Into<String>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Envelope>)> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (reply, reply_rx) = oneshot::channel();
        self.send(LinkCommand::Subscribe {
            message_type: message_type.into(),
            sender,
            reply,
        })?;
        let id = reply_rx
            .await
            .map_err(|_| Error::internal("connection controller is not running"))?;
        Ok((id, receiver))
    }

    /// Removes a subscription. Unknown IDs are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.send(LinkCommand::Unsubscribe(id))
    }

    /// Returns a point-in-time snapshot of the link.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has stopped.
    pub async fn session(&self) -> Result<ConnectionSession> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(LinkCommand::Session { reply })?;
        reply_rx
            .await
            .map_err(|_| Error::internal("connection controller is not running"))
    }

    /// Stops the controller task. Queued messages are discarded.
    ///
    /// # Errors
    ///
    /// Returns an error when the controller task has already stopped.
    pub fn shutdown(&self) -> Result<()> {
        self.send(LinkCommand::Shutdown)
    }
}

/// The connection controller actor.
///
/// Constructed and spawned through [`ConnectionController::spawn`]; all
/// further interaction goes through the returned [`LinkHandle`].
pub struct ConnectionController {
    config: LinkConfig,
    socket: Box<dyn Transport>,
    polling: Box<dyn Transport>,
    queue: DispatchQueue,
    health: HealthMonitor,
    metrics: LinkMetrics,
    session_id: SessionId,
    state: LinkState,
    consecutive_failures: u32,
    reconnect_attempt: u32,
    reconnect_at: Option<tokio::time::Instant>,
    connected_at: Option<DateTime<Utc>>,
    inbound_rx: Option<mpsc::UnboundedReceiver<Envelope>>,
    subscribers: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>,
    subscription_types: HashMap<SubscriptionId, String>,
    drops_tx: mpsc::UnboundedSender<DroppedMessage>,
}

impl ConnectionController {
    /// Validates the configuration, spawns the actor, and returns its
    /// handle plus the channel carrying exactly-once drop reports.
    ///
    /// Must be called from within a tokio runtime. The controller starts
    /// in `DISCONNECTED`; call [`LinkHandle::connect`] to bring the link
    /// up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] when `config` fails validation.
    pub fn spawn(
        config: LinkConfig,
        socket: Box<dyn Transport>,
        polling: Box<dyn Transport>,
    ) -> Result<(LinkHandle, mpsc::UnboundedReceiver<DroppedMessage>)> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (drops_tx, drops_rx) = mpsc::unbounded_channel();

        let controller = Self {
            queue: DispatchQueue::new(config.rate_per_sec, now_std()),
            health: HealthMonitor::new(config.heartbeat_interval),
            metrics: LinkMetrics::new(),
            session_id: SessionId::generate(),
            state: LinkState::Disconnected,
            consecutive_failures: 0,
            reconnect_attempt: 0,
            reconnect_at: None,
            connected_at: None,
            inbound_rx: None,
            subscribers: HashMap::new(),
            subscription_types: HashMap::new(),
            drops_tx,
            config,
            socket,
            polling,
        };

        tokio::spawn(controller.run(commands_rx));

        Ok((
            LinkHandle {
                commands: commands_tx,
            },
            drops_rx,
        ))
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LinkCommand>) {
        let mut dispatch_tick = tokio::time::interval(self.config.dispatch_interval);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat_tick = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll_tick = tokio::time::interval(self.config.poll_interval);
        poll_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // The inbound receiver moves out of self for this round so the
            // select futures only borrow locals.
            let mut taken_rx = self.inbound_rx.take();
            let reconnect_due = self.reconnect_at;

            let event = tokio::select! {
                biased;

                command = commands.recv() => Event::Command(command),

                inbound = recv_or_pending(&mut taken_rx) => Event::Inbound(inbound),

                () = sleep_until_or_pending(reconnect_due) => Event::ReconnectDue,

                _ = heartbeat_tick.tick(), if self.state.is_connected() => Event::HeartbeatTick,

                _ = poll_tick.tick(), if self.state.is_polling() => Event::PollTick,

                _ = dispatch_tick.tick() => Event::DispatchTick,
            };
            self.inbound_rx = taken_rx;

            match event {
                Event::Command(Some(command)) => {
                    if self.handle_command(command).await == Flow::Stop {
                        break;
                    }
                }
                // Every handle dropped: nothing can reach us again.
                Event::Command(None) => break,
                Event::Inbound(Some(envelope)) => self.route_inbound(envelope),
                Event::Inbound(None) => self.on_inbound_closed().await,
                Event::DispatchTick => self.on_dispatch_tick().await,
                Event::HeartbeatTick => self.on_heartbeat_tick().await,
                Event::PollTick => self.on_poll_tick().await,
                Event::ReconnectDue => self.on_reconnect_due().await,
            }
        }

        self.socket.close().await;
        self.polling.close().await;
        tracing::debug!(session_id = %self.session_id, "connection controller stopped");
    }

    async fn handle_command(&mut self, command: LinkCommand) -> Flow {
        match command {
            LinkCommand::Connect => self.on_connect().await,
            LinkCommand::Disconnect => self.on_disconnect().await,
            LinkCommand::Publish(message) => {
                self.metrics.record_enqueue(message.priority);
                self.queue.enqueue(message);
            }
            LinkCommand::Subscribe {
                message_type,
                sender,
                reply,
            } => {
                let id = SubscriptionId::generate();
                self.subscribers
                    .entry(message_type.clone())
                    .or_default()
                    .push((id, sender));
                self.subscription_types.insert(id, message_type);
                let _ = reply.send(id);
            }
            LinkCommand::Unsubscribe(id) => {
                if let Some(message_type) = self.subscription_types.remove(&id) {
                    if let Some(list) = self.subscribers.get_mut(&message_type) {
                        list.retain(|(sub_id, _)| *sub_id != id);
                        if list.is_empty() {
                            self.subscribers.remove(&message_type);
                        }
                    }
                }
            }
            LinkCommand::Session { reply } => {
                let _ = reply.send(self.snapshot());
            }
            LinkCommand::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    /// Starts a fresh session on the socket transport.
    async fn on_connect(&mut self) {
        if self.state.is_socket() {
            tracing::debug!(state = %self.state, "connect ignored: socket session in progress");
            return;
        }
        if self.state.is_polling() {
            // Explicit connect after failover: abandon polling and give
            // the socket another chance.
            self.polling.close().await;
            self.inbound_rx = None;
            self.set_state(LinkState::Disconnected);
            self.connected_at = None;
        }

        self.session_id = SessionId::generate();
        self.consecutive_failures = 0;
        self.reconnect_attempt = 0;
        self.reconnect_at = None;
        tracing::info!(session_id = %self.session_id, "starting session");

        self.set_state(LinkState::ConnectingSocket);
        self.try_open_socket().await;
    }

    /// Stops the active transport, keeping queued messages.
    async fn on_disconnect(&mut self) {
        if self.state == LinkState::Disconnected {
            return;
        }
        self.socket.close().await;
        self.polling.close().await;
        self.inbound_rx = None;
        self.reconnect_at = None;
        self.connected_at = None;
        self.health.reset();
        self.set_state(LinkState::Disconnected);
        tracing::info!(
            session_id = %self.session_id,
            queued = self.queue.depth(),
            "disconnected; queued messages retained"
        );
    }

    async fn try_open_socket(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.socket.open(tx).await {
            Ok(()) => {
                self.inbound_rx = Some(rx);
                self.consecutive_failures = 0;
                self.connected_at = Some(Utc::now());
                self.health.reset();
                self.set_state(LinkState::ConnectedSocket);
                tracing::info!(session_id = %self.session_id, "socket connected");
            }
            Err(err) => {
                if matches!(err, Error::Auth { .. }) {
                    tracing::error!(
                        session_id = %self.session_id,
                        error = %err,
                        "socket credentials rejected; disconnecting"
                    );
                    self.on_disconnect().await;
                    return;
                }
                tracing::warn!(
                    session_id = %self.session_id,
                    error = %err,
                    "socket open failed"
                );
                self.register_socket_failure().await;
            }
        }
    }

    /// Counts a socket failure and decides between retry and failover.
    async fn register_socket_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.state == LinkState::ConnectedSocket {
            self.set_state(LinkState::ConnectingSocket);
            self.connected_at = None;
        }

        if self.consecutive_failures >= 3 {
            self.fail_over("consecutive_failures").await;
            return;
        }

        self.reconnect_attempt += 1;
        if self
            .config
            .backoff
            .attempts_exhausted(self.reconnect_attempt)
        {
            self.fail_over("retries_exhausted").await;
            return;
        }

        let delay = self.config.backoff.delay_for(self.reconnect_attempt);
        tracing::info!(
            session_id = %self.session_id,
            attempt = self.reconnect_attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling socket reconnect"
        );
        self.reconnect_at = Some(tokio::time::Instant::now() + delay);
    }

    async fn on_reconnect_due(&mut self) {
        self.reconnect_at = None;
        if self.state != LinkState::ConnectingSocket {
            return;
        }
        self.metrics.record_reconnect_attempt();
        self.try_open_socket().await;
    }

    /// Switches to the polling transport; one-way for this session.
    async fn fail_over(&mut self, reason: &'static str) {
        tracing::warn!(
            session_id = %self.session_id,
            reason,
            failures = self.consecutive_failures,
            "failing over to polling transport"
        );
        self.metrics.record_failover(reason);
        self.socket.close().await;
        self.reconnect_at = None;
        self.connected_at = None;
        self.health.reset();
        self.set_state(LinkState::ConnectingPolling);

        let (tx, rx) = mpsc::unbounded_channel();
        match self.polling.open(tx).await {
            Ok(()) => {
                self.inbound_rx = Some(rx);
                // First successful poll confirms the fallback path.
                self.on_poll_tick().await;
            }
            Err(err) => {
                tracing::error!(session_id = %self.session_id, error = %err, "polling open failed");
                self.inbound_rx = None;
            }
        }
    }

    /// The socket read loop exited: peer closed or read error.
    async fn on_inbound_closed(&mut self) {
        self.inbound_rx = None;
        if !self.state.is_socket() {
            return;
        }
        tracing::warn!(session_id = %self.session_id, "socket connection lost");
        self.socket.close().await;
        self.register_socket_failure().await;
    }

    /// Drains a rate-limited batch and forwards it to the active transport.
    async fn on_dispatch_tick(&mut self) {
        if !self.state.is_connected() {
            self.update_queue_gauges();
            return;
        }

        let mut batch = self.queue.drain_batch(self.config.batch_size, now_std());
        if batch.is_empty() {
            return;
        }

        while !batch.is_empty() {
            let message = batch.remove(0);
            let envelope = Envelope::from_message(&message);
            let is_ping = envelope.message_type == TYPE_PING;
            let priority = message.priority;

            let send_result = if self.state == LinkState::ConnectedSocket {
                self.socket.send(&envelope).await
            } else {
                self.polling.send(&envelope).await
            };

            match send_result {
                Ok(piggyback) => {
                    self.metrics.record_send(priority, true);
                    if is_ping {
                        self.health.record_ping_sent(now_std());
                    }
                    for inbound in piggyback {
                        self.route_inbound(inbound);
                    }
                }
                Err(err) => {
                    self.metrics.record_send(priority, false);
                    tracing::warn!(
                        session_id = %self.session_id,
                        message_id = %message.id,
                        error = %err,
                        "send failed"
                    );
                    // The rest of the batch was never attempted; put it
                    // back with its tokens before the failed message
                    // reclaims the head slot.
                    while let Some(unattempted) = batch.pop() {
                        self.queue.restore_front(unattempted);
                    }
                    match self.queue.requeue_front(message) {
                        RequeueOutcome::Requeued => {}
                        RequeueOutcome::Dropped(dropped) => self.report_drop(dropped),
                    }
                    self.on_send_failure(err).await;
                    break;
                }
            }
        }

        self.update_queue_gauges();
    }

    async fn on_send_failure(&mut self, err: Error) {
        if matches!(err, Error::Auth { .. }) {
            tracing::error!(
                session_id = %self.session_id,
                error = %err,
                "authentication rejected; disconnecting"
            );
            self.on_disconnect().await;
            return;
        }
        if self.state.is_socket() {
            self.register_socket_failure().await;
        }
        // Polling-mode transport hiccups are retried on the next tick.
    }

    /// Scores the outstanding ping and emits the next one.
    async fn on_heartbeat_tick(&mut self) {
        if self.health.check_deadline(now_std()) {
            self.metrics.record_heartbeat_miss();
            tracing::warn!(
                session_id = %self.session_id,
                misses = self.health.consecutive_misses(),
                "heartbeat pong missed"
            );
            if self.health.is_unhealthy() && self.state.is_socket() {
                self.fail_over("unhealthy").await;
                return;
            }
        }

        if self.health.has_outstanding_ping() || !self.state.is_connected() {
            return;
        }
        match PingPayload::now().to_value() {
            Ok(payload) => {
                self.queue
                    .enqueue(Message::new(TYPE_PING, payload, Priority::High));
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to encode heartbeat payload");
            }
        }
    }

    /// Empty poll: drains server-side pending messages in polling mode.
    async fn on_poll_tick(&mut self) {
        match self.polling.poll().await {
            Ok(messages) => {
                if self.state == LinkState::ConnectingPolling {
                    self.set_state(LinkState::ConnectedPolling);
                    self.connected_at = Some(Utc::now());
                    tracing::info!(session_id = %self.session_id, "polling connected");
                }
                for envelope in messages {
                    self.route_inbound(envelope);
                }
            }
            Err(err) if matches!(err, Error::Auth { .. }) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %err,
                    "authentication rejected; disconnecting"
                );
                self.on_disconnect().await;
            }
            Err(err) => {
                tracing::warn!(session_id = %self.session_id, error = %err, "poll failed");
            }
        }
    }

    /// Routes one inbound envelope: heartbeats internally, everything
    /// else to type-matched subscribers.
    fn route_inbound(&mut self, envelope: Envelope) {
        if envelope.message_type == TYPE_PING {
            // Answer with the peer's own timestamp so it can measure RTT.
            self.queue
                .enqueue(Message::new(TYPE_PONG, envelope.payload, Priority::High));
            return;
        }
        if envelope.message_type == TYPE_PONG {
            if let Some(rtt) = self.health.record_pong(now_std()) {
                self.metrics.observe_heartbeat_rtt(rtt);
                tracing::debug!(
                    session_id = %self.session_id,
                    rtt_ms = u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX),
                    "heartbeat round trip"
                );
            }
            return;
        }

        let Some(list) = self.subscribers.get_mut(&envelope.message_type) else {
            tracing::debug!(
                message_type = %envelope.message_type,
                "no subscriber for inbound envelope"
            );
            return;
        };

        // Deliver to every subscriber of the type, pruning dead receivers.
        let mut dead = Vec::new();
        for (id, sender) in list.iter() {
            if sender.send(envelope.clone()).is_err() {
                dead.push(*id);
            }
        }
        if !dead.is_empty() {
            list.retain(|(id, _)| !dead.contains(id));
            if list.is_empty() {
                self.subscribers.remove(&envelope.message_type);
            }
            for id in dead {
                self.subscription_types.remove(&id);
            }
        }
    }

    fn report_drop(&mut self, dropped: DroppedMessage) {
        self.metrics.record_drop(dropped.message.priority);
        tracing::warn!(
            session_id = %self.session_id,
            message_id = %dropped.message.id,
            reason = %dropped.reason,
            "message dropped"
        );
        let _ = self.drops_tx.send(dropped);
    }

    fn set_state(&mut self, target: LinkState) {
        if self.state == target {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(target),
            "invalid link transition {} -> {}",
            self.state,
            target
        );
        self.metrics
            .record_state_transition(self.state.as_label(), target.as_label());
        tracing::debug!(
            session_id = %self.session_id,
            from = %self.state,
            to = %target,
            "link state transition"
        );
        self.state = target;
    }

    fn snapshot(&self) -> ConnectionSession {
        ConnectionSession {
            id: self.session_id,
            state: self.state,
            mode: self.state.mode(),
            consecutive_failures: self.consecutive_failures,
            reconnect_attempt: self.reconnect_attempt,
            queue_depth: self.queue.depth(),
            last_latency_ms: self
                .health
                .last_latency()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            average_latency_ms: self
                .health
                .average_latency()
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            quality: self.health.quality(),
            connected_at: self.connected_at,
        }
    }

    fn update_queue_gauges(&self) {
        for priority in Priority::ALL {
            self.metrics
                .set_queue_depth(priority, self.queue.depth_for(priority));
        }
    }
}

/// Clock read that respects tokio's paused test time.
fn now_std() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn recv_or_pending(rx: &mut Option<mpsc::UnboundedReceiver<Envelope>>) -> Option<Envelope> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_or_pending(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
