//! The primary `RealtimeManager` that owns the broker connection.

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::auth::session::SessionReader;
use crate::config::RealtimeSettings;
use crate::error::{RealtimeError, TransportError};
use crate::realtime::connector::{BrokerCommand, BrokerEvent, BrokerLink, Connector};
use crate::realtime::handler::{SessionForwarder, TopicHandler};
use crate::realtime::messages::RealtimeEvent;
use crate::realtime::topics::{self, TopicKind};
use crate::realtime::types::{ConnectionState, ReconnectPolicy, StateChange, Topic};

const SESSION_EVENT_CAPACITY: usize = 64;

/// Owns one logical connection to the message broker.
///
/// The manager reconnects after transport failures with linear backoff
/// (`base_delay × attempt`) until the attempt ceiling is reached, then stops
/// in [`ConnectionState::Error`]. Credential rejections are never retried.
/// Inbound messages are decoded by topic and delivered to the handler
/// registered for that exact topic.
///
/// Cloning is cheap; clones control the same connection.
pub struct RealtimeManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

struct Inner<C: Connector> {
    connector: C,
    session: SessionReader,
    policy: ReconnectPolicy,
    machine: Mutex<Machine>,
    /// Topic key -> registration. Lock order: `machine` before `registry`.
    registry: DashMap<Topic, Registration>,
    state_tx: watch::Sender<ConnectionState>,
    session_events: broadcast::Sender<RealtimeEvent>,
    forwarder: Arc<dyn TopicHandler>,
}

struct Machine {
    state: ConnectionState,
    attempts: u32,
    /// Bumped by every connect, disconnect and scheduled retry. Async results
    /// tagged with an older epoch are discarded.
    epoch: u64,
    history: VecDeque<StateChange>,
    link: Option<ActiveLink>,
    retry_timer: Option<JoinHandle<()>>,
}

struct ActiveLink {
    commands: mpsc::UnboundedSender<BrokerCommand>,
    reader: JoinHandle<()>,
}

#[derive(Clone)]
struct Registration {
    id: String,
    handler: Arc<dyn TopicHandler>,
}

impl Registration {
    fn new(handler: Arc<dyn TopicHandler>) -> Self {
        Self {
            id: format!("sub-{}", Uuid::new_v4()),
            handler,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Automatic,
}

impl<C: Connector> Clone for RealtimeManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> RealtimeManager<C> {
    pub fn new(connector: C, session: SessionReader, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (session_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let forwarder: Arc<dyn TopicHandler> = Arc::new(SessionForwarder {
            events: session_events.clone(),
        });

        let mut history = VecDeque::with_capacity(policy.history_limit.min(64));
        history.push_back(StateChange::now(ConnectionState::Disconnected));

        Self {
            inner: Arc::new(Inner {
                connector,
                session,
                policy,
                machine: Mutex::new(Machine {
                    state: ConnectionState::Disconnected,
                    attempts: 0,
                    epoch: 0,
                    history,
                    link: None,
                    retry_timer: None,
                }),
                registry: DashMap::new(),
                state_tx,
                session_events,
                forwarder,
            }),
        }
    }

    pub fn from_settings(connector: C, session: SessionReader, settings: &RealtimeSettings) -> Self {
        Self::new(connector, session, ReconnectPolicy::from(settings))
    }

    /// Open the connection with the session's access token.
    ///
    /// Does nothing while connected or while a handshake is in progress. On
    /// success the per-session topics are registered and every registered
    /// topic is subscribed on the broker.
    ///
    /// # Errors
    ///
    /// [`RealtimeError::MissingCredentials`] without a session (the state is
    /// left alone), [`RealtimeError::Handshake`] when the broker cannot be
    /// reached or refuses the token (the state becomes `Error`), and
    /// [`RealtimeError::Superseded`] when a disconnect overtook the handshake.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        let (epoch, token) = {
            let mut machine = self.inner.machine.lock();
            if matches!(
                machine.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                debug!(state = %machine.state, "Connect ignored.");
                return Ok(());
            }
            let Some(token) = self.inner.session.access_token() else {
                warn!("Cannot connect without an access token.");
                return Err(RealtimeError::MissingCredentials);
            };
            if let Some(timer) = machine.retry_timer.take() {
                timer.abort();
            }
            machine.epoch += 1;
            self.inner
                .transition(&mut machine, StateChange::now(ConnectionState::Connecting));
            (machine.epoch, token)
        };

        self.inner.establish(epoch, token, Trigger::Manual).await
    }

    /// Tear the connection down and forget every subscription. Idempotent.
    #[instrument(skip(self))]
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    /// Register `handler` for `topic` and subscribe on the broker.
    ///
    /// Returns `false` without registering anything when not connected (the
    /// request is dropped, not queued) or when `topic` is already registered.
    #[instrument(skip_all, fields(topic = tracing::field::Empty))]
    pub fn subscribe(&self, topic: impl Into<Topic>, handler: Arc<dyn TopicHandler>) -> bool {
        let topic = topic.into();
        tracing::Span::current().record("topic", tracing::field::display(&topic));

        let machine = self.inner.machine.lock();
        let Some(link) = machine
            .link
            .as_ref()
            .filter(|_| machine.state == ConnectionState::Connected)
        else {
            info!(state = %machine.state, "Not connected; subscription dropped.");
            return false;
        };

        match self.inner.registry.entry(topic) {
            Entry::Occupied(_) => {
                debug!("Topic already registered.");
                false
            }
            Entry::Vacant(vacant) => {
                let registration = Registration::new(handler);
                send_command(
                    &link.commands,
                    BrokerCommand::Subscribe {
                        id: registration.id.clone(),
                        destination: vacant.key().clone(),
                    },
                );
                vacant.insert(registration);
                info!("Subscribed.");
                true
            }
        }
    }

    /// Forget `topic`. Safe to call for unknown topics or while disconnected.
    #[instrument(skip(self))]
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let machine = self.inner.machine.lock();
        let Some((_, registration)) = self.inner.registry.remove(topic) else {
            debug!("Topic was not registered.");
            return false;
        };
        if let Some(link) = machine.link.as_ref() {
            send_command(&link.commands, BrokerCommand::Unsubscribe { id: registration.id });
        }
        info!("Unsubscribed.");
        true
    }

    /// Disconnect whenever the session ends (logout or failed refresh).
    ///
    /// The task ends when the session's owner is dropped or the manager is.
    pub fn follow_session(&self) -> JoinHandle<()> {
        let weak: Weak<Inner<C>> = Arc::downgrade(&self.inner);
        let mut session = self.inner.session.clone();
        tokio::spawn(
            async move {
                while session.changed().await {
                    if session.is_authenticated() {
                        continue;
                    }
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    info!("Session ended; disconnecting.");
                    inner.disconnect();
                }
            }
            .instrument(info_span!("follow_session")),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.machine.lock().state
    }

    /// Reconnect attempts since the last successful connection.
    pub fn attempts(&self) -> u32 {
        self.inner.machine.lock().attempts
    }

    /// Recent state changes, oldest first.
    pub fn history(&self) -> Vec<StateChange> {
        self.inner.machine.lock().history.iter().cloned().collect()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.registry.contains_key(topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Registered topic keys, sorted.
    pub fn subscribed_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self
            .inner
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        topics.sort();
        topics
    }

    /// Messages arriving on the per-session topics.
    pub fn session_events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.inner.session_events.subscribe()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    #[cfg(test)]
    fn has_pending_retry(&self) -> bool {
        self.inner
            .machine
            .lock()
            .retry_timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

#[cfg(feature = "websocket")]
impl RealtimeManager<crate::realtime::websocket::StompConnector> {
    /// A manager that speaks STOMP over WebSocket to `settings.url`.
    pub fn over_websocket(settings: &RealtimeSettings, session: SessionReader) -> Self {
        let connector = crate::realtime::websocket::StompConnector::from_settings(settings);
        Self::from_settings(connector, session, settings)
    }
}

impl<C: Connector> Inner<C> {
    fn transition(&self, machine: &mut Machine, change: StateChange) {
        info!(
            from = %machine.state,
            to = %change.state,
            attempt = ?change.attempt,
            error = ?change.error,
            "Connection state changed."
        );
        machine.state = change.state;
        while machine.history.len() >= self.policy.history_limit.max(1) {
            machine.history.pop_front();
        }
        machine.history.push_back(change);
        self.state_tx.send_replace(machine.state);
    }

    async fn establish(
        self: &Arc<Self>,
        epoch: u64,
        token: String,
        trigger: Trigger,
    ) -> Result<(), RealtimeError> {
        let result = self.connector.connect(&token).await;

        let mut machine = self.machine.lock();
        if machine.epoch != epoch || machine.state != ConnectionState::Connecting {
            debug!(epoch, current = machine.epoch, "Discarding superseded handshake.");
            if let Ok(link) = result {
                send_command(&link.commands, BrokerCommand::Disconnect);
            }
            return Err(RealtimeError::Superseded);
        }

        match result {
            Ok(link) => {
                self.activate(&mut machine, epoch, link);
                Ok(())
            }
            Err(err) => {
                warn!(?trigger, "Handshake failed: {}", err);
                if trigger == Trigger::Automatic && err.is_retryable() {
                    self.schedule_retry(&mut machine, &err);
                } else {
                    self.transition(
                        &mut machine,
                        StateChange::now(ConnectionState::Error).with_error(&err),
                    );
                }
                Err(RealtimeError::Handshake(err))
            }
        }
    }

    fn activate(self: &Arc<Self>, machine: &mut Machine, epoch: u64, link: BrokerLink) {
        machine.attempts = 0;

        if let Some(username) = self.session.username() {
            for topic in topics::session_topics(&username) {
                self.registry
                    .entry(topic)
                    .or_insert_with(|| Registration::new(Arc::clone(&self.forwarder)));
            }
        }

        let BrokerLink { commands, events } = link;
        for entry in self.registry.iter() {
            send_command(
                &commands,
                BrokerCommand::Subscribe {
                    id: entry.value().id.clone(),
                    destination: entry.key().clone(),
                },
            );
        }

        let reader = tokio::spawn(
            Arc::clone(self)
                .read_loop(epoch, events)
                .instrument(info_span!("realtime_reader", epoch)),
        );
        machine.link = Some(ActiveLink { commands, reader });
        self.transition(machine, StateChange::now(ConnectionState::Connected));
    }

    /// Delivers inbound messages in arrival order until the link ends.
    async fn read_loop(self: Arc<Self>, epoch: u64, mut events: mpsc::UnboundedReceiver<BrokerEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                BrokerEvent::Message { destination, body } => self.dispatch(&destination, &body),
                BrokerEvent::Fault(err) => {
                    self.on_link_lost(epoch, err);
                    return;
                }
            }
        }
        self.on_link_lost(epoch, TransportError::Closed);
    }

    fn dispatch(&self, topic: &str, body: &str) {
        let handler = match self.registry.get(topic) {
            Some(registration) => Arc::clone(&registration.handler),
            None => {
                debug!(topic, "No registration for topic; message dropped.");
                return;
            }
        };

        match RealtimeEvent::decode(TopicKind::classify(topic), body) {
            Ok(event) => handler.handle(topic, event),
            Err(e) => warn!(topic, "Dropping malformed message: {}", e),
        }
    }

    fn on_link_lost(self: &Arc<Self>, epoch: u64, err: TransportError) {
        let mut machine = self.machine.lock();
        if machine.epoch != epoch || machine.state != ConnectionState::Connected {
            debug!(epoch, "Ignoring loss of a stale link.");
            return;
        }
        // The reader is the caller; dropping the sender ends the transport.
        machine.link = None;
        warn!("Broker link lost: {}", err);

        if err.is_retryable() {
            self.schedule_retry(&mut machine, &err);
        } else {
            self.transition(
                &mut machine,
                StateChange::now(ConnectionState::Error).with_error(&err),
            );
        }
    }

    fn schedule_retry(self: &Arc<Self>, machine: &mut Machine, err: &TransportError) {
        if machine.attempts >= self.policy.max_attempts {
            warn!(attempts = machine.attempts, "Reconnect ceiling reached; giving up.");
            let reason = format!("gave up after {} reconnect attempts: {err}", machine.attempts);
            self.transition(
                machine,
                StateChange::now(ConnectionState::Error).with_error(reason),
            );
            return;
        }

        machine.attempts += 1;
        machine.epoch += 1;
        let attempt = machine.attempts;
        let epoch = machine.epoch;
        let delay = self.policy.delay_for(attempt);
        self.transition(
            machine,
            StateChange::now(ConnectionState::Reconnecting)
                .with_attempt(attempt)
                .with_error(err),
        );
        info!(attempt, ?delay, "Reconnect scheduled.");

        let inner = Arc::clone(self);
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                // Aborting the timer must not cancel a handshake in progress.
                tokio::spawn(inner.retry(epoch));
            }
            .instrument(info_span!("reconnect_timer", attempt)),
        );
        if let Some(previous) = machine.retry_timer.replace(timer) {
            previous.abort();
        }
    }

    async fn retry(self: Arc<Self>, epoch: u64) {
        let token = {
            let mut machine = self.machine.lock();
            if machine.epoch != epoch || machine.state != ConnectionState::Reconnecting {
                debug!(epoch, "Retry superseded.");
                return;
            }
            machine.retry_timer = None;
            match self.session.access_token() {
                Some(token) => {
                    self.transition(&mut machine, StateChange::now(ConnectionState::Connecting));
                    token
                }
                None => {
                    info!("Session ended before reconnecting.");
                    drop(machine);
                    self.disconnect();
                    return;
                }
            }
        };

        if let Err(e) = self.establish(epoch, token, Trigger::Automatic).await {
            debug!("Reconnect attempt did not connect: {}", e);
        }
    }

    fn disconnect(&self) {
        let mut machine = self.machine.lock();
        machine.epoch += 1;
        if let Some(timer) = machine.retry_timer.take() {
            timer.abort();
        }
        if let Some(link) = machine.link.take() {
            send_command(&link.commands, BrokerCommand::Disconnect);
            link.reader.abort();
        }
        self.registry.clear();
        machine.attempts = 0;
        if machine.state != ConnectionState::Disconnected {
            self.transition(&mut machine, StateChange::now(ConnectionState::Disconnected));
        }
    }
}

fn send_command(commands: &mpsc::UnboundedSender<BrokerCommand>, command: BrokerCommand) {
    if commands.send(command).is_err() {
        debug!("Link already closed; command not sent.");
    }
}

impl<C: Connector> fmt::Debug for RealtimeManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let machine = self.inner.machine.lock();
        f.debug_struct("RealtimeManager")
            .field("state", &machine.state)
            .field("attempts", &machine.attempts)
            .field("subscriptions", &self.inner.registry.len())
            .field("policy", &self.inner.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::{Session, SessionCell};
    use crate::auth::types::Principal;
    use crate::realtime::connector::LinkEnd;
    use crate::realtime::handler;
    use crate::test_support::init_tracing;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    const BASE: Duration = Duration::from_secs(5);

    /// Answers handshakes from a script; `Ok` once the script runs out.
    #[derive(Default)]
    struct ScriptedConnector {
        script: Mutex<VecDeque<Result<(), TransportError>>>,
        calls: AtomicUsize,
        ends: Mutex<Vec<LinkEnd>>,
        hold: Mutex<Option<oneshot::Receiver<()>>>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Result<(), TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn fail_link(&self, index: usize, err: TransportError) {
            let ends = self.ends.lock();
            ends[index].events.send(BrokerEvent::Fault(err)).unwrap();
        }

        fn deliver(&self, index: usize, destination: &str, body: &str) {
            let ends = self.ends.lock();
            ends[index]
                .events
                .send(BrokerEvent::Message {
                    destination: destination.to_string(),
                    body: body.to_string(),
                })
                .unwrap();
        }

        fn commands(&self, index: usize) -> Vec<BrokerCommand> {
            let mut ends = self.ends.lock();
            let mut seen = Vec::new();
            while let Ok(command) = ends[index].commands.try_recv() {
                seen.push(command);
            }
            seen
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, access_token: &str) -> Result<BrokerLink, TransportError> {
            assert_eq!(access_token, "abc");
            self.calls.fetch_add(1, Ordering::SeqCst);
            let hold = self.hold.lock().take();
            if let Some(hold) = hold {
                let _ = hold.await;
            }
            let outcome = self.script.lock().pop_front().unwrap_or(Ok(()));
            outcome?;
            let (link, end) = BrokerLink::pair();
            self.ends.lock().push(end);
            Ok(link)
        }
    }

    fn ada() -> Session {
        Session::new("abc", "r1", Principal::new(7, "ada"))
    }

    fn manager(connector: &Arc<ScriptedConnector>) -> RealtimeManager<Arc<ScriptedConnector>> {
        let policy = ReconnectPolicy {
            base_delay: BASE,
            max_attempts: 5,
            history_limit: 50,
        };
        RealtimeManager::new(
            Arc::clone(connector),
            SessionReader::from_session(ada()),
            policy,
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn states(manager: &RealtimeManager<Arc<ScriptedConnector>>) -> Vec<(ConnectionState, Option<u32>)> {
        manager
            .history()
            .into_iter()
            .map(|change| (change.state, change.attempt))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_connected_is_a_no_op() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_without_token_stays_disconnected() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = RealtimeManager::new(
            Arc::clone(&connector),
            SessionReader::anonymous(),
            ReconnectPolicy::default(),
        );

        assert_eq!(manager.connect().await, Err(RealtimeError::MissingCredentials));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_registers_session_topics() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);

        manager.connect().await.unwrap();

        assert_eq!(manager.subscription_count(), 5);
        assert!(manager.is_subscribed("/user/ada/queue/notifications"));
        let destinations: Vec<String> = connector
            .commands(0)
            .into_iter()
            .filter_map(|command| match command {
                BrokerCommand::Subscribe { destination, .. } => Some(destination),
                _ => None,
            })
            .collect();
        assert_eq!(destinations.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_drop_reconnects_and_resets_attempts() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        assert!(manager.subscribe(topics::post(1), Arc::new(|_: &str, _: RealtimeEvent| {})));

        connector.fail_link(0, TransportError::Io("connection reset".into()));
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempts(), 1);

        sleep(BASE + Duration::from_millis(1)).await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.attempts(), 0);
        assert_eq!(connector.calls(), 2);
        assert_eq!(
            states(&manager),
            vec![
                (ConnectionState::Disconnected, None),
                (ConnectionState::Connecting, None),
                (ConnectionState::Connected, None),
                (ConnectionState::Reconnecting, Some(1)),
                (ConnectionState::Connecting, None),
                (ConnectionState::Connected, None),
            ]
        );
        // Registrations survive the drop and are subscribed again.
        let resubscribed = connector
            .commands(1)
            .into_iter()
            .filter(|command| matches!(command, BrokerCommand::Subscribe { destination, .. } if destination == "/topic/posts/1"))
            .count();
        assert_eq!(resubscribed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_attempt_ceiling() {
        init_tracing();
        let io = || Err(TransportError::Io("refused".into()));
        let connector = ScriptedConnector::new(vec![Ok(()), io(), io(), io(), io(), io()]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        // One dropped link plus five failed reconnects: six transport errors.
        connector.fail_link(0, TransportError::Closed);
        sleep(Duration::from_secs(120)).await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(manager.attempts(), 5);
        assert_eq!(connector.calls(), 6);
        assert!(!manager.has_pending_retry());

        let reconnecting: Vec<Option<u32>> = manager
            .history()
            .into_iter()
            .filter(|change| change.state == ConnectionState::Reconnecting)
            .map(|change| change.attempt)
            .collect();
        assert_eq!(reconnecting, vec![Some(1), Some(2), Some(3), Some(4), Some(5)]);

        sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_linearly() {
        init_tracing();
        let io = || Err(TransportError::Io("refused".into()));
        let connector = ScriptedConnector::new(vec![Ok(()), io(), io()]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        connector.fail_link(0, TransportError::Closed);
        settle().await;

        sleep(BASE - Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(connector.calls(), 1);
        sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        assert_eq!(manager.attempts(), 2);

        // Second delay is twice the base.
        sleep(BASE * 2 - Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(connector.calls(), 2);
        sleep(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(connector.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_on_reconnect_is_terminal() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![
            Ok(()),
            Err(TransportError::Unauthorized("token expired".into())),
        ]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        connector.fail_link(0, TransportError::Closed);
        sleep(Duration::from_secs(60)).await;
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(connector.calls(), 2);
        assert!(!manager.has_pending_retry());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_manual_handshake_is_not_retried() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![Err(TransportError::Io("refused".into()))]);
        let manager = manager(&connector);

        let err = manager.connect().await.unwrap_err();
        assert_eq!(err, RealtimeError::Handshake(TransportError::Io("refused".into())));
        assert_eq!(manager.state(), ConnectionState::Error);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.calls(), 1);

        // The caller decides to try again.
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_requires_connection_and_dedupes() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        let (handler, _rx) = handler::channel();

        assert!(!manager.subscribe(topics::post(1), handler.clone()));
        assert_eq!(manager.subscription_count(), 0);

        manager.connect().await.unwrap();
        connector.commands(0);
        assert!(manager.subscribe(topics::post(1), handler.clone()));
        assert!(!manager.subscribe(topics::post(1), handler.clone()));
        assert_eq!(connector.commands(0).len(), 1);

        assert!(manager.unsubscribe("/topic/posts/1"));
        assert!(!manager.unsubscribe("/topic/posts/1"));
        assert!(matches!(
            connector.commands(0).as_slice(),
            [BrokerCommand::Unsubscribe { .. }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_reconnect() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        connector.fail_link(0, TransportError::Closed);
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.subscription_count(), 0);
        assert_eq!(manager.attempts(), 0);

        sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(connector.calls(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_from_error_resets_everything() {
        init_tracing();
        let io = || Err(TransportError::Io("refused".into()));
        let connector = ScriptedConnector::new(vec![Ok(()), io(), io(), io(), io(), io()]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        assert!(manager.subscribe(topics::post(1), Arc::new(|_: &str, _: RealtimeEvent| {})));

        connector.fail_link(0, TransportError::Closed);
        sleep(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Error);
        assert_eq!(manager.attempts(), 5);
        assert!(manager.is_subscribed("/topic/posts/1"));

        manager.disconnect();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.attempts(), 0);
        assert_eq!(manager.subscription_count(), 0);
        assert!(!manager.has_pending_retry());
        assert_eq!(
            manager.history().last().map(|change| change.state),
            Some(ConnectionState::Disconnected)
        );

        // A fresh connect starts from scratch.
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.is_subscribed("/topic/posts/1"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_while_reconnecting_is_dropped() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        connector.fail_link(0, TransportError::Closed);
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        let (handler, _rx) = handler::channel();
        assert!(!manager.subscribe(topics::post(9), handler));
        assert!(!manager.is_subscribed("/topic/posts/9"));

        sleep(BASE + Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connected);

        // The dropped request is not replayed on the new link.
        let replayed = connector
            .commands(1)
            .into_iter()
            .any(|command| matches!(command, BrokerCommand::Subscribe { destination, .. } if destination == "/topic/posts/9"));
        assert!(!replayed);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_closes_the_link() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();
        connector.commands(0);

        manager.disconnect();

        assert_eq!(connector.commands(0), vec![BrokerCommand::Disconnect]);
        assert!(manager.subscribed_topics().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_handshake_is_discarded() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let (release, hold) = oneshot::channel();
        *connector.hold.lock() = Some(hold);
        let manager = manager(&connector);

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await }
        });
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect();
        release.send(()).unwrap();

        assert_eq!(pending.await.unwrap(), Err(RealtimeError::Superseded));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(connector.commands(0), vec![BrokerCommand::Disconnect]);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_messages_to_exact_topic_in_order() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        manager.connect().await.unwrap();

        let (first, mut first_rx) = handler::channel();
        let (second, mut second_rx) = handler::channel();
        manager.subscribe(topics::post(1), first);
        manager.subscribe(topics::post(2), second);

        let update = |score: i64| {
            format!(
                r#"{{"postId":1,"score":{score},"commentCount":0,"upvotes":1,"downvotes":0,"viewCount":9}}"#
            )
        };
        connector.deliver(0, "/topic/posts/1", &update(1));
        connector.deliver(0, "/topic/posts/3", &update(5));
        connector.deliver(0, "/topic/posts/1", "{not json");
        connector.deliver(0, "/topic/posts/1", &update(2));
        settle().await;

        let mut scores = Vec::new();
        while let Ok((topic, event)) = first_rx.try_recv() {
            assert_eq!(topic, "/topic/posts/1");
            let RealtimeEvent::PostUpdate(update) = event else {
                panic!("unexpected event {event:?}");
            };
            scores.push(update.score);
        }
        assert_eq!(scores, vec![1, 2]);
        assert!(second_rx.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn session_topics_are_republished() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let manager = manager(&connector);
        let mut events = manager.session_events();
        manager.connect().await.unwrap();

        connector.deliver(
            0,
            "/user/ada/queue/karma",
            r#"{"userId":7,"change":10,"newTotal":110,"reason":"post upvoted"}"#,
        );
        settle().await;

        let RealtimeEvent::KarmaUpdate(karma) = events.try_recv().unwrap() else {
            panic!("expected a karma update");
        };
        assert_eq!(karma.new_total, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_session_end() {
        init_tracing();
        let connector = ScriptedConnector::new(vec![]);
        let cell = SessionCell::new(Some(ada()));
        let manager = RealtimeManager::new(
            Arc::clone(&connector),
            cell.reader(),
            ReconnectPolicy::default(),
        );
        let _follower = manager.follow_session();
        manager.connect().await.unwrap();

        cell.clear();
        settle().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.subscription_count(), 0);
    }

    #[test]
    fn history_is_bounded() {
        let connector = ScriptedConnector::new(vec![]);
        let manager = RealtimeManager::new(
            Arc::clone(&connector),
            SessionReader::anonymous(),
            ReconnectPolicy {
                base_delay: BASE,
                max_attempts: 5,
                history_limit: 3,
            },
        );
        {
            let inner = &manager.inner;
            let mut machine = inner.machine.lock();
            for state in [
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Connecting,
                ConnectionState::Error,
            ] {
                inner.transition(&mut machine, StateChange::now(state));
            }
        }
        let history = manager.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].state, ConnectionState::Error);
    }
}
