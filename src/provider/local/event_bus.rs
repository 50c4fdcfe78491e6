//! In-process event bus — the reference implementation
//!
//! Topic queues are created lazily and each gets one processor task. A
//! processor matches an event against the subscription table (literal fast
//! path plus pre-compiled wildcard patterns), evaluates filters, and invokes
//! handlers concurrently under a global semaphore. Failing handlers retry
//! with exponential backoff; exhausted events land in a bounded in-memory
//! dead-letter queue. Queue contents survive `stop()`/`start()` cycles.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::event::EventMessage;
use crate::health::{HealthCheckResult, HealthCheckable};
use crate::provider::event_bus::{DeadLetterRecord, EventBus, EventHandler, FilterExpression};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify, Semaphore};

const DEFAULT_TOPIC: &str = "default";
const MAX_DEAD_LETTERS: usize = 10_000;
const MAX_ORPHANS: usize = 1_000;

/// Tunables for the local bus, derived from [`RuntimeConfig`]
#[derive(Debug, Clone)]
pub struct LocalBusOptions {
    /// Maximum handler retries before dead-lettering
    pub retry_max_attempts: u32,
    /// Base of the exponential backoff, in seconds
    pub retry_backoff_seconds: u64,
    /// Hard deadline per handler invocation, in seconds
    pub operation_timeout_seconds: u64,
    /// Global bound on in-flight handler invocations
    pub max_concurrent_operations: usize,
}

impl Default for LocalBusOptions {
    fn default() -> Self {
        Self {
            retry_max_attempts: 3,
            retry_backoff_seconds: 1,
            operation_timeout_seconds: 300,
            max_concurrent_operations: 100,
        }
    }
}

impl From<&RuntimeConfig> for LocalBusOptions {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            retry_max_attempts: config.retry_max_attempts,
            retry_backoff_seconds: config.retry_backoff_seconds,
            operation_timeout_seconds: config.operation_timeout_seconds,
            max_concurrent_operations: config.max_concurrent_operations.max(1),
        }
    }
}

/// One named FIFO channel of events
#[derive(Clone)]
struct TopicQueue {
    queue: Arc<Mutex<VecDeque<EventMessage>>>,
    notify: Arc<Notify>,
}

impl TopicQueue {
    fn new() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&self, event: EventMessage) {
        self.queue.lock().expect("queue lock").push_back(event);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<EventMessage> {
        self.queue.lock().expect("queue lock").pop_front()
    }
}

struct Subscription {
    id: String,
    pattern: String,
    topic: String,
    handler: EventHandler,
    filter: Option<FilterExpression>,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
}

/// Pattern-indexed subscription table
///
/// Literal patterns go in a map keyed by the full event type; wildcard
/// patterns are compiled once at subscribe time and scanned at dispatch.
#[derive(Default)]
struct SubscriptionTable {
    by_id: HashMap<String, Arc<Subscription>>,
    literal: HashMap<String, Vec<Arc<Subscription>>>,
    wildcard: Vec<(Regex, Arc<Subscription>)>,
}

impl SubscriptionTable {
    fn insert(&mut self, sub: Arc<Subscription>, compiled: Option<Regex>) {
        self.by_id.insert(sub.id.clone(), Arc::clone(&sub));
        match compiled {
            Some(regex) => self.wildcard.push((regex, sub)),
            None => self
                .literal
                .entry(sub.pattern.clone())
                .or_default()
                .push(sub),
        }
    }

    fn remove(&mut self, subscription_id: &str) -> Option<Arc<Subscription>> {
        let sub = self.by_id.remove(subscription_id)?;
        if let Some(bucket) = self.literal.get_mut(&sub.pattern) {
            bucket.retain(|s| s.id != subscription_id);
            if bucket.is_empty() {
                self.literal.remove(&sub.pattern);
            }
        }
        self.wildcard.retain(|(_, s)| s.id != subscription_id);
        Some(sub)
    }

    /// All subscriptions on `topic` whose pattern matches `event_type`
    fn matching(&self, event_type: &str, topic: &str) -> Vec<Arc<Subscription>> {
        let mut matches = Vec::new();
        if let Some(bucket) = self.literal.get(event_type) {
            matches.extend(bucket.iter().filter(|s| s.topic == topic).cloned());
        }
        for (regex, sub) in &self.wildcard {
            if sub.topic == topic && regex.is_match(event_type) {
                matches.push(Arc::clone(sub));
            }
        }
        matches
    }
}

struct Lifecycle {
    running: bool,
    shutdown: Option<watch::Sender<bool>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    processors: HashMap<String, tokio::task::JoinHandle<()>>,
}

struct BusInner {
    topics: RwLock<HashMap<String, TopicQueue>>,
    subscriptions: RwLock<SubscriptionTable>,
    dead_letters: RwLock<Vec<DeadLetterRecord>>,
    orphans: RwLock<Vec<EventMessage>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    semaphore: Arc<Semaphore>,
    options: LocalBusOptions,
}

/// In-memory event bus implementation
pub struct LocalEventBus {
    inner: Arc<BusInner>,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::with_options(LocalBusOptions::default())
    }
}

impl LocalEventBus {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self::with_options(LocalBusOptions::from(config))
    }

    pub fn with_options(options: LocalBusOptions) -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                subscriptions: RwLock::new(SubscriptionTable::default()),
                dead_letters: RwLock::new(Vec::new()),
                orphans: RwLock::new(Vec::new()),
                lifecycle: tokio::sync::Mutex::new(Lifecycle {
                    running: false,
                    shutdown: None,
                    shutdown_rx: None,
                    processors: HashMap::new(),
                }),
                semaphore: Arc::new(Semaphore::new(options.max_concurrent_operations)),
                options,
            }),
        }
    }

    /// Dead-letter records with full context (topic, subscription, reason)
    pub fn dead_letter_records(&self) -> Vec<DeadLetterRecord> {
        self.inner
            .dead_letters
            .read()
            .expect("dlq lock")
            .clone()
    }

    /// Compile a subscription pattern: `*` segments match any run of
    /// characters, dots are literal, matching spans the whole type string
    fn compile_pattern(pattern: &str) -> Option<Regex> {
        if !pattern.contains('*') {
            return None;
        }
        let escaped = regex::escape(pattern).replace(r"\*", ".*");
        // Escaped patterns are always valid regexes
        Some(Regex::new(&format!("^{}$", escaped)).expect("compiled pattern"))
    }

    /// Ensure a topic exists; spawn its processor if the bus is running
    async fn ensure_topic(&self, topic: &str) {
        let created = {
            let mut topics = self.inner.topics.write().expect("topic lock");
            if topics.contains_key(topic) {
                false
            } else {
                topics.insert(topic.to_string(), TopicQueue::new());
                true
            }
        };
        if created {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            if lifecycle.running {
                Self::spawn_processor(&self.inner, &mut lifecycle, topic);
            }
        }
    }

    fn spawn_processor(inner: &Arc<BusInner>, lifecycle: &mut Lifecycle, topic: &str) {
        if lifecycle.processors.contains_key(topic) {
            return;
        }
        let queue = {
            let topics = inner.topics.read().expect("topic lock");
            match topics.get(topic) {
                Some(q) => q.clone(),
                None => return,
            }
        };
        let shutdown = match &lifecycle.shutdown_rx {
            Some(rx) => rx.clone(),
            None => return,
        };
        let inner = Arc::clone(inner);
        let topic_name = topic.to_string();
        let handle = tokio::spawn(run_topic_processor(inner, topic_name.clone(), queue, shutdown));
        lifecycle.processors.insert(topic_name, handle);
    }
}

/// Per-topic dispatcher loop
///
/// Pops events in FIFO order; computes the full handler set for event `n`
/// before touching event `n+1`. Wakes on new events, shutdown, or a 1s tick
/// so topic deletion is observed promptly.
async fn run_topic_processor(
    inner: Arc<BusInner>,
    topic: String,
    queue: TopicQueue,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!(topic = %topic, "Started topic processor");
    loop {
        if *shutdown.borrow() {
            break;
        }
        if !inner.topics.read().expect("topic lock").contains_key(&topic) {
            break;
        }
        match queue.pop() {
            Some(event) => BusInner::dispatch(&inner, event, &topic).await,
            None => {
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }
    tracing::info!(topic = %topic, "Stopped topic processor");
}

impl BusInner {
    async fn dispatch(inner: &Arc<Self>, event: EventMessage, topic: &str) {
        // Expired events are discarded, never delivered or dead-lettered
        if event.is_expired() {
            tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Dropping expired event");
            return;
        }

        let matches: Vec<Arc<Subscription>> = {
            let table = inner.subscriptions.read().expect("subscription lock");
            table
                .matching(&event.event_type, topic)
                .into_iter()
                .filter(|sub| matches_filter(&event, sub.filter.as_ref()))
                .collect()
        };

        if matches.is_empty() {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event_type,
                topic,
                "No matching subscriptions"
            );
            let mut orphans = inner.orphans.write().expect("orphan lock");
            orphans.push(event);
            if orphans.len() > MAX_ORPHANS {
                let excess = orphans.len() - MAX_ORPHANS;
                orphans.drain(..excess);
            }
            return;
        }

        for sub in matches {
            // Wait for a slot rather than spawn unboundedly
            let permit = Arc::clone(&inner.semaphore)
                .acquire_owned()
                .await
                .expect("semaphore closed");
            let task_inner = Arc::clone(inner);
            let event = event.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                task_inner.invoke_with_retry(sub, event, topic).await;
                drop(permit);
            });
        }
    }

    /// Invoke one handler with timeout, retry with exponential backoff, and
    /// dead-letter on exhaustion. A success at any attempt clears the state.
    async fn invoke_with_retry(&self, sub: Arc<Subscription>, event: EventMessage, topic: String) {
        let timeout = Duration::from_secs(self.options.operation_timeout_seconds);
        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::time::timeout(timeout, (sub.handler)(event.clone())).await;
            let reason = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(
                        event_id = %event.id,
                        subscription = %sub.id,
                        attempt,
                        "Handler succeeded"
                    );
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("handler timed out after {}s", timeout.as_secs()),
            };

            if attempt >= self.options.retry_max_attempts {
                tracing::error!(
                    event_id = %event.id,
                    subscription = %sub.id,
                    attempts = attempt + 1,
                    reason = %reason,
                    "Event moved to dead letter queue"
                );
                let mut dlq = self.dead_letters.write().expect("dlq lock");
                dlq.push(DeadLetterRecord {
                    event,
                    topic,
                    subscription_id: sub.id.clone(),
                    reason,
                    attempts: attempt + 1,
                    dead_lettered_at: Utc::now(),
                });
                if dlq.len() > MAX_DEAD_LETTERS {
                    let excess = dlq.len() - MAX_DEAD_LETTERS;
                    dlq.drain(..excess);
                }
                return;
            }

            let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
            let delay = self.options.retry_backoff_seconds.saturating_mul(factor);
            tracing::warn!(
                event_id = %event.id,
                subscription = %sub.id,
                attempt,
                delay_seconds = delay,
                reason = %reason,
                "Handler failed, retrying"
            );
            tokio::time::sleep(Duration::from_secs(delay)).await;
            attempt += 1;
        }
    }
}

/// Evaluate a filter expression against an event. All conditions must hold;
/// an unreachable path or missing key fails the filter.
fn matches_filter(event: &EventMessage, filter: Option<&FilterExpression>) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    for (key, expected) in filter {
        let actual: Option<serde_json::Value> = if let Some(path) = key.strip_prefix("data.") {
            lookup_path(&event.data, path)
        } else if let Some(field) = key.strip_prefix("metadata.") {
            event.metadata.get(field).cloned()
        } else {
            event_attribute(event, key)
        };
        if actual.as_ref() != Some(expected) {
            return false;
        }
    }
    true
}

fn lookup_path(value: &serde_json::Value, path: &str) -> Option<serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}

fn event_attribute(event: &EventMessage, name: &str) -> Option<serde_json::Value> {
    match name {
        "id" => Some(serde_json::Value::String(event.id.clone())),
        "event_type" => Some(serde_json::Value::String(event.event_type.clone())),
        "priority" => serde_json::to_value(event.priority).ok(),
        "correlation_id" => event
            .correlation_id
            .as_ref()
            .map(|v| serde_json::Value::String(v.clone())),
        "reply_to" => event
            .reply_to
            .as_ref()
            .map(|v| serde_json::Value::String(v.clone())),
        _ => None,
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: EventMessage, topic: Option<&str>) -> Result<()> {
        let topic = topic.unwrap_or(DEFAULT_TOPIC);
        self.ensure_topic(topic).await;
        tracing::debug!(event_id = %event.id, event_type = %event.event_type, topic, "Published event");
        let queue = {
            let topics = self.inner.topics.read().expect("topic lock");
            topics.get(topic).cloned()
        };
        match queue {
            Some(q) => {
                q.push(event);
                Ok(())
            }
            None => Err(RuntimeError::Provider(format!(
                "Topic disappeared during publish: {}",
                topic
            ))),
        }
    }

    async fn publish_batch(&self, events: Vec<EventMessage>, topic: Option<&str>) -> Result<()> {
        for event in events {
            self.publish(event, topic).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        topic: Option<&str>,
        filter: Option<FilterExpression>,
    ) -> Result<String> {
        let topic = topic.unwrap_or(DEFAULT_TOPIC);
        let subscription_id = uuid::Uuid::new_v4().to_string();
        let compiled = Self::compile_pattern(event_type);
        let sub = Arc::new(Subscription {
            id: subscription_id.clone(),
            pattern: event_type.to_string(),
            topic: topic.to_string(),
            handler,
            filter,
            created_at: Utc::now(),
        });

        self.inner
            .subscriptions
            .write()
            .expect("subscription lock")
            .insert(sub, compiled);
        self.ensure_topic(topic).await;

        tracing::info!(
            subscription = %subscription_id,
            pattern = event_type,
            topic,
            "Created subscription"
        );
        Ok(subscription_id)
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        let removed = self
            .inner
            .subscriptions
            .write()
            .expect("subscription lock")
            .remove(subscription_id);
        if removed.is_some() {
            tracing::info!(subscription = %subscription_id, "Removed subscription");
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.running {
            return Ok(());
        }
        let (tx, rx) = watch::channel(false);
        lifecycle.shutdown = Some(tx);
        lifecycle.shutdown_rx = Some(rx);
        lifecycle.running = true;

        let topics: Vec<String> = {
            let topics = self.inner.topics.read().expect("topic lock");
            topics.keys().cloned().collect()
        };
        for topic in topics {
            Self::spawn_processor(&self.inner, &mut lifecycle, &topic);
        }

        tracing::info!("Local event bus started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if !lifecycle.running {
            return Ok(());
        }
        if let Some(tx) = lifecycle.shutdown.take() {
            let _ = tx.send(true);
        }
        lifecycle.shutdown_rx = None;
        for (_, handle) in lifecycle.processors.drain() {
            let _ = handle.await;
        }
        lifecycle.running = false;
        tracing::info!("Local event bus stopped");
        Ok(())
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        self.ensure_topic(topic_name).await;
        Ok(())
    }

    async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let removed = {
            let mut topics = self.inner.topics.write().expect("topic lock");
            topics.remove(topic_name)
        };
        if let Some(queue) = removed {
            // Wake the processor so it observes the deletion
            queue.notify.notify_waiters();
            let mut lifecycle = self.inner.lifecycle.lock().await;
            lifecycle.processors.remove(topic_name);
        }
        Ok(())
    }

    async fn topic_exists(&self, topic_name: &str) -> bool {
        self.inner
            .topics
            .read()
            .expect("topic lock")
            .contains_key(topic_name)
    }

    async fn get_dead_letter_events(
        &self,
        topic: Option<&str>,
        max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        let dlq = self.inner.dead_letters.read().expect("dlq lock");
        let events: Vec<EventMessage> = dlq
            .iter()
            .filter(|record| topic.map_or(true, |t| record.topic == t))
            .take(max_items.unwrap_or(usize::MAX))
            .map(|record| record.event.clone())
            .collect();
        Ok(events)
    }

    async fn reprocess_dead_letter_event(&self, event_id: &str, topic: Option<&str>) -> Result<()> {
        let record = {
            let mut dlq = self.inner.dead_letters.write().expect("dlq lock");
            let index = dlq.iter().position(|record| {
                record.event.id == event_id && topic.map_or(true, |t| record.topic == t)
            });
            match index {
                Some(i) => dlq.remove(i),
                None => {
                    return Err(RuntimeError::NotFound(format!(
                        "Dead letter event not found: {}",
                        event_id
                    )))
                }
            }
        };
        tracing::info!(event_id = %event_id, topic = %record.topic, "Reprocessing dead letter event");
        self.publish(record.event, Some(&record.topic)).await
    }

    async fn has_subscribers(&self, event_type: &str, topic: Option<&str>) -> bool {
        let topic = topic.unwrap_or(DEFAULT_TOPIC);
        let table = self.inner.subscriptions.read().expect("subscription lock");
        !table.matching(event_type, topic).is_empty()
    }

    async fn get_orphaned_events(
        &self,
        since: Option<DateTime<Utc>>,
        max_items: Option<usize>,
    ) -> Result<Vec<EventMessage>> {
        let orphans = self.inner.orphans.read().expect("orphan lock");
        Ok(orphans
            .iter()
            .filter(|e| since.map_or(true, |s| e.timestamp >= s))
            .take(max_items.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn drain_orphaned_events(
        &self,
        event_types: Option<&[String]>,
        before: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        let mut orphans = self.inner.orphans.write().expect("orphan lock");
        let before_len = orphans.len();
        orphans.retain(|e| {
            let type_match = event_types.map_or(true, |types| types.contains(&e.event_type));
            let time_match = before.map_or(true, |b| e.timestamp < b);
            !(type_match && time_match)
        });
        Ok(before_len - orphans.len())
    }
}

#[async_trait]
impl HealthCheckable for LocalEventBus {
    async fn health_check(&self) -> HealthCheckResult {
        let start = std::time::Instant::now();
        let _ = self.inner.topics.read().expect("topic lock").len();
        HealthCheckResult::healthy(start.elapsed().as_secs_f64() * 1000.0)
    }

    fn provider_name(&self) -> &str {
        "event_bus_local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::event_bus::handler_fn;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn zero_backoff_bus(retry_max_attempts: u32) -> LocalEventBus {
        LocalEventBus::with_options(LocalBusOptions {
            retry_max_attempts,
            retry_backoff_seconds: 0,
            operation_timeout_seconds: 5,
            max_concurrent_operations: 16,
        })
    }

    fn counting_handler(counter: Arc<AtomicU32>) -> EventHandler {
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn failing_handler(counter: Arc<AtomicU32>) -> EventHandler {
        handler_fn(move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RuntimeError::Handler("always fails".to_string()))
            }
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[test]
    fn test_pattern_compilation() {
        assert!(LocalEventBus::compile_pattern("user.created").is_none());

        let wildcard = LocalEventBus::compile_pattern("user.*").unwrap();
        assert!(wildcard.is_match("user.created"));
        assert!(wildcard.is_match("user.deleted"));
        assert!(!wildcard.is_match("userx.created"));
        assert!(!wildcard.is_match("User.created"));

        let deep = LocalEventBus::compile_pattern("voice.*").unwrap();
        assert!(deep.is_match("voice.call.started"));

        // A bare star matches every type
        let any = LocalEventBus::compile_pattern("*").unwrap();
        assert!(any.is_match("chat.msg"));
        assert!(any.is_match("voice.call.started"));

        // Mid-pattern wildcards match across segments
        let mid = LocalEventBus::compile_pattern("index.*.ready").unwrap();
        assert!(mid.is_match("index.guide.ready"));
        assert!(!mid.is_match("index.guide.pending"));
    }

    #[test]
    fn test_filter_data_path() {
        let event = EventMessage::new("t", serde_json::json!({"x": 1, "nested": {"y": "z"}}));

        let mut filter = FilterExpression::new();
        filter.insert("data.x".to_string(), serde_json::json!(1));
        assert!(matches_filter(&event, Some(&filter)));

        filter.insert("data.nested.y".to_string(), serde_json::json!("z"));
        assert!(matches_filter(&event, Some(&filter)));

        filter.insert("data.missing".to_string(), serde_json::json!(true));
        assert!(!matches_filter(&event, Some(&filter)));
    }

    #[test]
    fn test_filter_metadata_and_attributes() {
        let event = EventMessage::new("user.created", serde_json::json!({}))
            .with_metadata("userID", "u-1");

        let mut filter = FilterExpression::new();
        filter.insert("metadata.userID".to_string(), serde_json::json!("u-1"));
        filter.insert("event_type".to_string(), serde_json::json!("user.created"));
        filter.insert("priority".to_string(), serde_json::json!("normal"));
        assert!(matches_filter(&event, Some(&filter)));

        let mut wrong = FilterExpression::new();
        wrong.insert("metadata.userID".to_string(), serde_json::json!("u-2"));
        assert!(!matches_filter(&event, Some(&wrong)));

        let mut unknown = FilterExpression::new();
        unknown.insert("no_such_attribute".to_string(), serde_json::json!(1));
        assert!(!matches_filter(&event, Some(&unknown)));
    }

    #[tokio::test]
    async fn test_publish_subscribe_literal() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("user.created", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("user.created", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wildcard_matching_dispatch() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("user.*", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("user.created", serde_json::json!({})), None)
            .await
            .unwrap();
        bus.publish(EventMessage::new("user.deleted", serde_json::json!({})), None)
            .await
            .unwrap();
        bus.publish(EventMessage::new("userx.created", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_isolation() {
        let bus = zero_backoff_bus(3);
        let counter_a = Arc::new(AtomicU32::new(0));
        let counter_b = Arc::new(AtomicU32::new(0));
        bus.subscribe("job.done", counting_handler(counter_a.clone()), Some("topic-a"), None)
            .await
            .unwrap();
        bus.subscribe("job.done", counting_handler(counter_b.clone()), Some("topic-b"), None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("job.done", serde_json::json!({})), Some("topic-a"))
            .await
            .unwrap();
        settle().await;

        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 0);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_filter_gates_dispatch() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        let mut filter = FilterExpression::new();
        filter.insert("data.x".to_string(), serde_json::json!(1));
        bus.subscribe("t", counting_handler(counter.clone()), None, Some(filter))
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("t", serde_json::json!({"x": 1})), None)
            .await
            .unwrap();
        bus.publish(EventMessage::new("t", serde_json::json!({"x": 2})), None)
            .await
            .unwrap();
        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let bus = zero_backoff_bus(2);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("t", failing_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        let event = EventMessage::new("t", serde_json::json!({}));
        let event_id = event.id.clone();
        bus.publish(event, None).await.unwrap();
        settle().await;

        // Initial attempt + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        let dead = bus.get_dead_letter_events(None, None).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, event_id);

        let records = bus.dead_letter_records();
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[0].topic, "default");
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_success_after_failures_clears_retry_state() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_inner = Arc::clone(&attempts);
        let counter_inner = Arc::clone(&counter);
        let handler = handler_fn(move |_event| {
            let attempts = Arc::clone(&attempts_inner);
            let counter = Arc::clone(&counter_inner);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RuntimeError::Handler("transient".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        bus.subscribe("t", handler, None, None).await.unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        // Fails twice, succeeds on the third attempt, no DLQ entry
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(bus.get_dead_letter_events(None, None).await.unwrap().is_empty());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_event_dropped_silently() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("t", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        let mut event = EventMessage::new("t", serde_json::json!({})).with_ttl(60);
        event.timestamp = Utc::now() - chrono::Duration::seconds(120);
        bus.publish(event, None).await.unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(bus.get_dead_letter_events(None, None).await.unwrap().is_empty());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_timeout_counts_as_failure() {
        let bus = LocalEventBus::with_options(LocalBusOptions {
            retry_max_attempts: 1,
            retry_backoff_seconds: 0,
            operation_timeout_seconds: 1,
            max_concurrent_operations: 16,
        });
        let handler = handler_fn(|_event| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        bus.subscribe("t", handler, None, None).await.unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let records = bus.dead_letter_records();
        assert_eq!(records.len(), 1);
        assert!(records[0].reason.contains("timed out"));
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_reprocess_dead_letter() {
        let bus = zero_backoff_bus(0);
        let failures = Arc::new(AtomicU32::new(0));
        let failures_inner = Arc::clone(&failures);
        // Fails the first time, succeeds on reprocess
        let handler = handler_fn(move |_event| {
            let failures = Arc::clone(&failures_inner);
            async move {
                if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RuntimeError::Handler("first delivery fails".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        bus.subscribe("t", handler, Some("jobs"), None).await.unwrap();
        bus.start().await.unwrap();

        let event = EventMessage::new("t", serde_json::json!({}));
        let event_id = event.id.clone();
        bus.publish(event, Some("jobs")).await.unwrap();
        settle().await;

        assert_eq!(bus.get_dead_letter_events(Some("jobs"), None).await.unwrap().len(), 1);

        bus.reprocess_dead_letter_event(&event_id, None).await.unwrap();
        settle().await;

        assert!(bus.get_dead_letter_events(None, None).await.unwrap().is_empty());
        assert_eq!(failures.load(Ordering::SeqCst), 2);

        // Record is gone, so a second reprocess fails
        let err = bus.reprocess_dead_letter_event(&event_id, None).await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        let sub_id = bus
            .subscribe("t", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();

        bus.unsubscribe(&sub_id).await.unwrap();
        bus.unsubscribe(&sub_id).await.unwrap();
        bus.unsubscribe("never-existed").await.unwrap();

        bus.start().await.unwrap();
        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_subscribe_double_delivery() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("t", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.subscribe("t", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_order_preserved() {
        // One handler slot serializes invocations, exposing dispatch order
        let bus = LocalEventBus::with_options(LocalBusOptions {
            retry_max_attempts: 0,
            retry_backoff_seconds: 0,
            operation_timeout_seconds: 5,
            max_concurrent_operations: 1,
        });
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_inner = Arc::clone(&seen);
        let handler = handler_fn(move |event: EventMessage| {
            let seen = Arc::clone(&seen_inner);
            async move {
                seen.lock().expect("seen lock").push(event.id);
                Ok(())
            }
        });
        bus.subscribe("t", handler, None, None).await.unwrap();
        bus.start().await.unwrap();

        let events: Vec<EventMessage> = (0..20)
            .map(|i| {
                let mut e = EventMessage::new("t", serde_json::json!({"i": i}));
                e.id = format!("e-{:02}", i);
                e
            })
            .collect();
        bus.publish_batch(events, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let order = seen.lock().expect("seen lock").clone();
        assert_eq!(order.len(), 20);
        // Dispatch order follows publish order; with one subscription the
        // match step is strictly sequential
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_preserves_queue_contents() {
        let bus = zero_backoff_bus(3);
        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("t", counting_handler(counter.clone()), None, None)
            .await
            .unwrap();

        // Not started yet — events accumulate
        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        bus.start().await.unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let bus = zero_backoff_bus(3);
        bus.start().await.unwrap();
        bus.start().await.unwrap();
        bus.stop().await.unwrap();
        bus.stop().await.unwrap();
        bus.start().await.unwrap();
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_lifecycle() {
        let bus = zero_backoff_bus(3);
        assert!(!bus.topic_exists("jobs").await);
        bus.create_topic("jobs").await.unwrap();
        assert!(bus.topic_exists("jobs").await);
        bus.create_topic("jobs").await.unwrap();
        bus.delete_topic("jobs").await.unwrap();
        assert!(!bus.topic_exists("jobs").await);
        bus.delete_topic("jobs").await.unwrap();
    }

    #[tokio::test]
    async fn test_lazy_topic_creation_on_publish() {
        let bus = zero_backoff_bus(3);
        bus.publish(EventMessage::new("t", serde_json::json!({})), Some("fresh"))
            .await
            .unwrap();
        assert!(bus.topic_exists("fresh").await);
        assert!(bus.topic_exists("fresh").await);
    }

    #[tokio::test]
    async fn test_has_subscribers() {
        let bus = zero_backoff_bus(3);
        assert!(!bus.has_subscribers("user.created", None).await);

        let counter = Arc::new(AtomicU32::new(0));
        bus.subscribe("user.*", counting_handler(counter), None, None)
            .await
            .unwrap();
        assert!(bus.has_subscribers("user.created", None).await);
        assert!(!bus.has_subscribers("order.created", None).await);
        assert!(!bus.has_subscribers("user.created", Some("other")).await);
    }

    #[tokio::test]
    async fn test_orphaned_events_recorded_and_drained() {
        let bus = zero_backoff_bus(3);
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("nobody.listens", serde_json::json!({})), None)
            .await
            .unwrap();
        settle().await;

        let orphans = bus.get_orphaned_events(None, None).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].event_type, "nobody.listens");

        let drained = bus
            .drain_orphaned_events(Some(&["nobody.listens".to_string()]), None)
            .await
            .unwrap();
        assert_eq!(drained, 1);
        assert!(bus.get_orphaned_events(None, None).await.unwrap().is_empty());
        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_limit_respected() {
        let bus = LocalEventBus::with_options(LocalBusOptions {
            retry_max_attempts: 0,
            retry_backoff_seconds: 0,
            operation_timeout_seconds: 5,
            max_concurrent_operations: 2,
        });
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let in_flight_inner = Arc::clone(&in_flight);
        let peak_inner = Arc::clone(&peak);
        let handler = handler_fn(move |_event| {
            let in_flight = Arc::clone(&in_flight_inner);
            let peak = Arc::clone(&peak_inner);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });
        // Several subscriptions so one event fans out widely
        for _ in 0..6 {
            bus.subscribe("t", handler.clone(), None, None).await.unwrap();
        }
        bus.start().await.unwrap();

        bus.publish(EventMessage::new("t", serde_json::json!({})), None)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(peak.load(Ordering::SeqCst) <= 2);
        bus.stop().await.unwrap();
    }
}
