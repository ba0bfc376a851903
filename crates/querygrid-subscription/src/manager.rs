//! Subscription manager — one background task per topic, shared by every
//! local subscriber of that topic.
//!
//! The topic table maps each topic to its subscriber list and the handle of
//! the task that owns the transport stream. The task reads events, turns
//! their invalidation tags into query cache invalidations, and fans the
//! event out to subscriber callbacks outside the table lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use querygrid_cache::QueryCache;
use querygrid_core::{
    Backoff, ChangeEvent, QueryGridConfig, SubscriptionTransport, TransportError,
};
use querygrid_metrics::{MetricsCollector, names};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Reconnect timing for topic streams.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionConfig {
    /// First reconnect delay (default: 100ms).
    pub backoff_base: Duration,
    /// Upper bound on any reconnect delay (default: 10s).
    pub backoff_max: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
        }
    }
}

impl From<&QueryGridConfig> for SubscriptionConfig {
    fn from(config: &QueryGridConfig) -> Self {
        Self {
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

/// State of a topic's transport subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Connecting,
    Active,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::Connecting => write!(f, "connecting"),
            SubscriptionState::Active => write!(f, "active"),
            SubscriptionState::Reconnecting => write!(f, "reconnecting"),
            SubscriptionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a subscription was closed from under its subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The transport reported an unrecoverable protocol error.
    Protocol(String),
    /// The manager was shut down.
    Shutdown,
}

/// What a subscriber callback receives.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    Data(ChangeEvent),
    /// Terminal; delivered at most once per subscriber.
    Closed(CloseReason),
}

/// Subscriber callback. Invoked from the topic task, so it must not block.
pub type EventCallback = Arc<dyn Fn(SubscriptionEvent) + Send + Sync>;

/// Per-topic table entry.
struct TopicHandle {
    /// Distinguishes this task from an earlier one for the same topic.
    generation: u64,
    subscribers: BTreeMap<u64, EventCallback>,
    state: watch::Receiver<SubscriptionState>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    transport: Arc<dyn SubscriptionTransport>,
    cache: Option<Arc<QueryCache>>,
    config: SubscriptionConfig,
    metrics: MetricsCollector,
    topics: Mutex<HashMap<String, TopicHandle>>,
    next_id: AtomicU64,
}

/// Shares transport subscriptions between local subscribers.
///
/// Cloning is cheap; clones share the same topic table.
#[derive(Clone)]
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    pub fn new(
        transport: Arc<dyn SubscriptionTransport>,
        cache: Option<Arc<QueryCache>>,
        config: SubscriptionConfig,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                cache,
                config,
                metrics,
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `callback` for events on `topic`.
    ///
    /// The first subscriber of a topic opens the transport subscription.
    /// Must be called from within a Tokio runtime. Dropping the returned
    /// [`Subscription`] unsubscribes.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> Subscription
    where
        F: Fn(SubscriptionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let callback: EventCallback = Arc::new(callback);

        let mut topics = self.inner.topics.lock();
        match topics.get_mut(topic) {
            Some(handle) => {
                handle.subscribers.insert(id, callback);
                debug!(
                    topic,
                    subscribers = handle.subscribers.len(),
                    "joined shared subscription"
                );
            }
            None => {
                let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let (state_tx, state) = watch::channel(SubscriptionState::Connecting);
                let (shutdown_tx, shutdown) = watch::channel(false);
                let task = tokio::spawn(run_topic(
                    Arc::downgrade(&self.inner),
                    topic.to_string(),
                    generation,
                    state_tx,
                    shutdown,
                ));
                topics.insert(
                    topic.to_string(),
                    TopicHandle {
                        generation,
                        subscribers: BTreeMap::from([(id, callback)]),
                        state,
                        shutdown_tx,
                        task,
                    },
                );
                info!(topic, "opening subscription");
            }
        }

        Subscription {
            inner: Arc::clone(&self.inner),
            topic: topic.to_string(),
            id,
            active: true,
        }
    }

    /// Current state of `topic`; `Closed` when nobody is subscribed.
    pub fn state(&self, topic: &str) -> SubscriptionState {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(SubscriptionState::Closed, |handle| *handle.state.borrow())
    }

    /// Watch state transitions of `topic`'s current task.
    pub fn watch_state(&self, topic: &str) -> Option<watch::Receiver<SubscriptionState>> {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map(|handle| handle.state.clone())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |handle| handle.subscribers.len())
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Close every topic, notify every subscriber, and wait for the topic
    /// tasks to exit.
    pub async fn close_all(&self) {
        let handles: Vec<(String, TopicHandle)> = self.inner.topics.lock().drain().collect();
        if handles.is_empty() {
            return;
        }
        info!(topics = handles.len(), "closing all subscriptions");

        let mut tasks = Vec::with_capacity(handles.len());
        for (topic, handle) in handles {
            let _ = handle.shutdown_tx.send(true);
            self.inner.metrics.increment(names::SUBSCRIPTION_CLOSED);
            debug!(topic = %topic, subscribers = handle.subscribers.len(), "subscription shut down");
            for callback in handle.subscribers.values() {
                callback(SubscriptionEvent::Closed(CloseReason::Shutdown));
            }
            tasks.push(handle.task);
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("config", &self.inner.config)
            .field("topics", &self.inner.topics.lock().len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn remove_subscriber(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock();
        let Some(handle) = topics.get_mut(topic) else {
            return;
        };
        if handle.subscribers.remove(&id).is_none() || !handle.subscribers.is_empty() {
            return;
        }
        if let Some(handle) = topics.remove(topic) {
            let _ = handle.shutdown_tx.send(true);
            self.metrics.increment(names::SUBSCRIPTION_CLOSED);
            info!(topic, "last subscriber left, closing subscription");
        }
    }

    /// Invalidate the event's tags, then hand it to every subscriber.
    fn deliver(&self, topic: &str, generation: u64, event: ChangeEvent) {
        let callbacks: Vec<EventCallback> = match self.topics.lock().get(topic) {
            Some(handle) if handle.generation == generation => {
                handle.subscribers.values().cloned().collect()
            }
            _ => return,
        };

        if let Some(cache) = &self.cache {
            // Untagged events invalidate entries tagged with the topic itself.
            let removed: usize = if event.invalidates.is_empty() {
                cache.invalidate_by_tag(topic)
            } else {
                event
                    .invalidates
                    .iter()
                    .map(|tag| cache.invalidate_by_tag(tag))
                    .sum()
            };
            if removed > 0 {
                debug!(topic, removed, "change event invalidated cache entries");
            }
        }

        self.metrics.increment(names::SUBSCRIPTION_EVENT);
        for callback in callbacks {
            callback(SubscriptionEvent::Data(event.clone()));
        }
    }

    /// Drop the topic after an unrecoverable error and notify its
    /// subscribers once.
    fn close_topic(&self, topic: &str, generation: u64, reason: CloseReason) {
        let handle = {
            let mut topics = self.topics.lock();
            match topics.get(topic) {
                Some(handle) if handle.generation == generation => topics.remove(topic),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return;
        };

        self.metrics.increment(names::SUBSCRIPTION_CLOSED);
        for callback in handle.subscribers.values() {
            callback(SubscriptionEvent::Closed(reason.clone()));
        }
    }
}

/// A live registration. Dropping it unsubscribes.
pub struct Subscription {
    inner: Arc<Inner>,
    topic: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop receiving events. Closes the transport subscription if this
    /// was the last subscriber.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.active) {
            self.inner.remove_subscriber(&self.topic, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

// ── Topic task ──────────────────────────────────────────────────────

enum Exit {
    Shutdown,
    Fatal(String),
}

async fn run_topic(
    inner: Weak<Inner>,
    topic: String,
    generation: u64,
    state: watch::Sender<SubscriptionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let exit = drive(&inner, &topic, generation, &state, &mut shutdown).await;
    state.send_replace(SubscriptionState::Closed);

    match exit {
        Exit::Shutdown => debug!(topic = %topic, "subscription task stopped"),
        Exit::Fatal(reason) => {
            warn!(topic = %topic, reason = %reason, "subscription closed on protocol error");
            if let Some(inner) = inner.upgrade() {
                inner.close_topic(&topic, generation, CloseReason::Protocol(reason));
            }
        }
    }
}

async fn drive(
    inner: &Weak<Inner>,
    topic: &str,
    generation: u64,
    state: &watch::Sender<SubscriptionState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Exit {
    let Some((transport, config, metrics)) = inner
        .upgrade()
        .map(|i| (Arc::clone(&i.transport), i.config.clone(), i.metrics.clone()))
    else {
        return Exit::Shutdown;
    };
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);

    loop {
        let opened = tokio::select! {
            opened = transport.open_subscription(topic) => opened,
            _ = shutdown.changed() => return Exit::Shutdown,
        };

        match opened {
            Ok(mut stream) => {
                state.send_replace(SubscriptionState::Active);
                if backoff.attempts() > 0 {
                    info!(topic, attempts = backoff.attempts(), "subscription reconnected");
                } else {
                    debug!(topic, "subscription active");
                }
                backoff.reset();

                loop {
                    tokio::select! {
                        item = stream.next() => match item {
                            Some(Ok(event)) => match inner.upgrade() {
                                Some(inner) => inner.deliver(topic, generation, event),
                                None => return Exit::Shutdown,
                            },
                            Some(Err(TransportError::Protocol(reason))) => {
                                return Exit::Fatal(reason);
                            }
                            Some(Err(e)) => {
                                warn!(topic, error = %e, "subscription stream failed");
                                break;
                            }
                            None => {
                                warn!(topic, "subscription stream ended");
                                break;
                            }
                        },
                        _ = shutdown.changed() => return Exit::Shutdown,
                    }
                }
            }
            Err(TransportError::Protocol(reason)) => return Exit::Fatal(reason),
            Err(e) => {
                warn!(topic, error = %e, "failed to open subscription");
            }
        }

        state.send_replace(SubscriptionState::Reconnecting);
        let delay = backoff.next_delay();
        metrics.record_duration(names::SUBSCRIPTION_RECONNECT_DELAY_MS, delay);
        debug!(topic, delay = ?delay, attempt = backoff.attempts(), "reconnecting subscription");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return Exit::Shutdown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use querygrid_cache::CacheConfig;
    use querygrid_core::{EventStream, QueryFingerprint};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    type Feed = mpsc::UnboundedSender<Result<ChangeEvent, TransportError>>;

    /// Transport whose streams are fed by the test. The next `fail_opens`
    /// opens fail with `open_error`.
    struct MockTransport {
        opens: AtomicUsize,
        fail_opens: AtomicUsize,
        open_error: TransportError,
        feeds: parking_lot::Mutex<Vec<Feed>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Self::failing(0, TransportError::Unreachable("refused".into()))
        }

        fn failing(fail_opens: usize, open_error: TransportError) -> Arc<Self> {
            Arc::new(Self {
                opens: AtomicUsize::new(0),
                fail_opens: AtomicUsize::new(fail_opens),
                open_error,
                feeds: parking_lot::Mutex::new(Vec::new()),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn feed(&self) -> Feed {
            self.feeds.lock().last().cloned().expect("no stream opened")
        }

        fn push(&self, event: ChangeEvent) {
            self.feed().send(Ok(event)).unwrap();
        }
    }

    #[async_trait]
    impl SubscriptionTransport for MockTransport {
        async fn open_subscription(&self, _topic: &str) -> Result<EventStream, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.fail_opens.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_opens.store(remaining - 1, Ordering::SeqCst);
                return Err(self.open_error.clone());
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.feeds.lock().push(tx);
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            Ok(stream.boxed())
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<parking_lot::Mutex<Vec<SubscriptionEvent>>>);

    impl Recorder {
        fn callback(&self) -> impl Fn(SubscriptionEvent) + Send + Sync + 'static {
            let events = Arc::clone(&self.0);
            move |event| events.lock().push(event)
        }

        fn events(&self) -> Vec<SubscriptionEvent> {
            self.0.lock().clone()
        }

        fn len(&self) -> usize {
            self.0.lock().len()
        }
    }

    fn config() -> SubscriptionConfig {
        SubscriptionConfig {
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(400),
        }
    }

    fn make_manager(
        transport: Arc<MockTransport>,
        cache: Option<Arc<QueryCache>>,
    ) -> (SubscriptionManager, MetricsCollector) {
        let metrics = MetricsCollector::new(1024, Duration::from_secs(600));
        let manager = SubscriptionManager::new(transport, cache, config(), metrics.clone());
        (manager, metrics)
    }

    async fn wait_for_state(manager: &SubscriptionManager, topic: &str, want: SubscriptionState) {
        let mut rx = manager.watch_state(topic).expect("topic not open");
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("topic task gone");
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent::new("users", json!({ "n": n }))
    }

    // ── Sharing ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn subscribers_share_one_transport_subscription() {
        let transport = MockTransport::new();
        let (manager, metrics) = make_manager(transport.clone(), None);
        let a = Recorder::default();
        let b = Recorder::default();

        let _sa = manager.subscribe("users", a.callback());
        let _sb = manager.subscribe("users", b.callback());
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(manager.subscriber_count("users"), 2);

        transport.push(event(1));
        eventually(|| a.len() == 1 && b.len() == 1).await;
        assert_eq!(a.events(), vec![SubscriptionEvent::Data(event(1))]);
        assert_eq!(metrics.count(names::SUBSCRIPTION_EVENT, Duration::from_secs(60)), 1);
    }

    #[tokio::test]
    async fn topics_are_independent() {
        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport.clone(), None);

        let _a = manager.subscribe("users", |_| {});
        let _b = manager.subscribe("orders", |_| {});
        assert_eq!(manager.topics(), vec!["orders".to_string(), "users".to_string()]);
        eventually(|| transport.opens() == 2).await;
    }

    #[tokio::test]
    async fn last_unsubscribe_closes_topic() {
        let transport = MockTransport::new();
        let (manager, metrics) = make_manager(transport.clone(), None);
        let a = manager.subscribe("users", |_| {});
        let b = manager.subscribe("users", |_| {});
        wait_for_state(&manager, "users", SubscriptionState::Active).await;
        let mut state = manager.watch_state("users").unwrap();

        a.unsubscribe();
        assert_eq!(manager.subscriber_count("users"), 1);
        assert_eq!(manager.state("users"), SubscriptionState::Active);

        b.unsubscribe();
        assert!(manager.topics().is_empty());
        assert_eq!(manager.state("users"), SubscriptionState::Closed);
        state.wait_for(|s| *s == SubscriptionState::Closed).await.unwrap();
        eventually(|| transport.feed().is_closed()).await;
        assert_eq!(metrics.count(names::SUBSCRIPTION_CLOSED, Duration::from_secs(60)), 1);

        // A new subscriber opens a fresh transport subscription.
        let _c = manager.subscribe("users", |_| {});
        wait_for_state(&manager, "users", SubscriptionState::Active).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes() {
        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport, None);
        {
            let _sub = manager.subscribe("users", |_| {});
            assert_eq!(manager.subscriber_count("users"), 1);
        }
        assert_eq!(manager.subscriber_count("users"), 0);
        assert!(manager.topics().is_empty());
    }

    #[tokio::test]
    async fn unsubscribed_callback_stops_receiving() {
        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport.clone(), None);
        let a = Recorder::default();
        let b = Recorder::default();
        let sa = manager.subscribe("users", a.callback());
        let _sb = manager.subscribe("users", b.callback());
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        sa.unsubscribe();
        transport.push(event(1));
        eventually(|| b.len() == 1).await;
        assert_eq!(a.len(), 0);
    }

    // ── Reconnect ───────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stream_failure_reconnects_without_notifying_subscribers() {
        let transport = MockTransport::new();
        let (manager, metrics) = make_manager(transport.clone(), None);
        let rec = Recorder::default();
        let _sub = manager.subscribe("users", rec.callback());
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        transport
            .feed()
            .send(Err(TransportError::Closed))
            .unwrap();
        wait_for_state(&manager, "users", SubscriptionState::Reconnecting).await;
        wait_for_state(&manager, "users", SubscriptionState::Active).await;
        assert_eq!(transport.opens(), 2);

        transport.push(event(2));
        eventually(|| rec.len() == 1).await;
        assert_eq!(rec.events(), vec![SubscriptionEvent::Data(event(2))]);
        assert_eq!(
            metrics.count(names::SUBSCRIPTION_RECONNECT_DELAY_MS, Duration::from_secs(60)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_end_reconnects() {
        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport.clone(), None);
        let _sub = manager.subscribe("users", |_| {});
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        transport.feeds.lock().clear();
        wait_for_state(&manager, "users", SubscriptionState::Reconnecting).await;
        wait_for_state(&manager, "users", SubscriptionState::Active).await;
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_opens_back_off_within_bounds() {
        let transport = MockTransport::failing(5, TransportError::Unreachable("refused".into()));
        let (manager, metrics) = make_manager(transport.clone(), None);
        let rec = Recorder::default();
        let _sub = manager.subscribe("users", rec.callback());

        wait_for_state(&manager, "users", SubscriptionState::Active).await;
        assert_eq!(transport.opens(), 6);
        assert!(rec.events().is_empty());

        let delays = metrics.aggregate(names::SUBSCRIPTION_RECONNECT_DELAY_MS, Duration::from_secs(600));
        assert_eq!(delays.count, 5);
        assert!(delays.min >= 50.0);
        assert!(delays.max <= 400.0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let transport = MockTransport::failing(usize::MAX, TransportError::Timeout("5s".into()));
        let (manager, _) = make_manager(transport.clone(), None);
        let sub = manager.subscribe("users", |_| {});
        wait_for_state(&manager, "users", SubscriptionState::Reconnecting).await;

        let mut state = manager.watch_state("users").unwrap();
        sub.unsubscribe();
        state.wait_for(|s| *s == SubscriptionState::Closed).await.unwrap();
    }

    // ── Closure ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn protocol_error_closes_with_one_notification() {
        let transport = MockTransport::new();
        let (manager, metrics) = make_manager(transport.clone(), None);
        let a = Recorder::default();
        let b = Recorder::default();
        let _sa = manager.subscribe("users", a.callback());
        let _sb = manager.subscribe("users", b.callback());
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        transport.push(event(1));
        transport
            .feed()
            .send(Err(TransportError::Protocol("bad frame".into())))
            .unwrap();
        eventually(|| manager.topics().is_empty()).await;

        let closed = SubscriptionEvent::Closed(CloseReason::Protocol("bad frame".into()));
        assert_eq!(a.events(), vec![SubscriptionEvent::Data(event(1)), closed.clone()]);
        assert_eq!(b.events(), vec![SubscriptionEvent::Data(event(1)), closed]);
        assert_eq!(transport.opens(), 1);
        assert_eq!(metrics.count(names::SUBSCRIPTION_CLOSED, Duration::from_secs(60)), 1);
    }

    #[tokio::test]
    async fn protocol_error_on_open_closes() {
        let transport = MockTransport::failing(1, TransportError::Protocol("unknown topic".into()));
        let (manager, _) = make_manager(transport.clone(), None);
        let rec = Recorder::default();
        let sub = manager.subscribe("nope", rec.callback());

        eventually(|| rec.len() == 1).await;
        assert_eq!(
            rec.events(),
            vec![SubscriptionEvent::Closed(CloseReason::Protocol("unknown topic".into()))]
        );
        assert_eq!(manager.state("nope"), SubscriptionState::Closed);
        // Unsubscribing after closure is a no-op.
        sub.unsubscribe();
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn close_all_notifies_every_subscriber() {
        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport.clone(), None);
        let a = Recorder::default();
        let b = Recorder::default();
        let _sa = manager.subscribe("users", a.callback());
        let _sb = manager.subscribe("orders", b.callback());

        manager.close_all().await;
        assert!(manager.topics().is_empty());
        let closed = vec![SubscriptionEvent::Closed(CloseReason::Shutdown)];
        assert_eq!(a.events(), closed);
        assert_eq!(b.events(), closed);
    }

    // ── Cache invalidation ──────────────────────────────────────────

    #[tokio::test]
    async fn change_events_invalidate_cache_tags() {
        let metrics = MetricsCollector::new(1024, Duration::from_secs(600));
        let cache = Arc::new(QueryCache::new(CacheConfig::default(), metrics));
        let user = QueryFingerprint::from_bytes([1; 32]);
        let order = QueryFingerprint::from_bytes([2; 32]);
        let listing = QueryFingerprint::from_bytes([3; 32]);
        cache.put(user.clone(), json!({"id": 1}), None, &["user:1".to_string()]);
        cache.put(order.clone(), json!({"id": 9}), None, &["order:9".to_string()]);
        cache.put(listing.clone(), json!([]), None, &["users".to_string()]);

        let transport = MockTransport::new();
        let (manager, _) = make_manager(transport.clone(), Some(Arc::clone(&cache)));
        let rec = Recorder::default();
        let _sub = manager.subscribe("users", rec.callback());
        wait_for_state(&manager, "users", SubscriptionState::Active).await;

        transport.push(event(1).invalidating(["user:1"]));
        eventually(|| rec.len() == 1).await;
        assert!(cache.peek(&user).is_none());
        assert!(cache.peek(&order).is_some());
        assert!(cache.peek(&listing).is_some());

        // Untagged events invalidate the topic tag.
        transport.push(event(2));
        eventually(|| rec.len() == 2).await;
        assert!(cache.peek(&listing).is_none());
        assert!(cache.peek(&order).is_some());
    }
}
