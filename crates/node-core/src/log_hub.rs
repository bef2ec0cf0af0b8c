//! Per-subscriber fan-out of proxy core output.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::StreamExt;
use tokio::{
    sync::Notify,
    time::{Instant, sleep_until},
};

use crate::LogMsg;

/// Default per-subscriber queue capacity, in lines.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default number of lines retained for crash diagnostics.
pub const DEFAULT_HISTORY_LINES: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a subscription stopped yielding lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber detached itself.
    Detached,
    /// The process instance that owned the hub ended or was replaced.
    InstanceEnded,
}

struct Queue {
    lines: VecDeque<String>,
    dropped: u64,
    closed: Option<CloseReason>,
}

/// Delivery slot shared between the hub and one subscription.
struct Slot {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

impl Slot {
    fn new(capacity: usize, closed: Option<CloseReason>) -> Self {
        Self {
            queue: Mutex::new(Queue {
                lines: VecDeque::with_capacity(capacity.min(32)),
                dropped: 0,
                closed,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, line: &str) {
        {
            let mut queue = lock(&self.queue);
            if queue.closed.is_some() {
                return;
            }
            // Drop-oldest: the producer never waits on a slow consumer.
            if queue.lines.len() >= self.capacity {
                queue.lines.pop_front();
                queue.dropped += 1;
            }
            queue.lines.push_back(line.to_owned());
        }
        self.notify.notify_one();
    }

    fn close(&self, reason: CloseReason) {
        {
            let mut queue = lock(&self.queue);
            if queue.closed.is_none() {
                queue.closed = Some(reason);
            }
            if reason == CloseReason::Detached {
                queue.lines.clear();
            }
        }
        self.notify.notify_one();
    }
}

struct Inner {
    subscribers: HashMap<u64, Arc<Slot>>,
    next_id: u64,
    history: VecDeque<LogMsg>,
    closed: bool,
}

/// Fan-out hub owned by one running proxy core instance.
///
/// One producer (the stdout/stderr forwarder) pushes lines; every attached
/// [`Subscription`] receives them through its own bounded queue, so a
/// consumer that never reads only loses its own oldest lines.
pub struct LogHub {
    inner: Mutex<Inner>,
    queue_capacity: usize,
    history_lines: usize,
}

impl Default for LogHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LogHub {
    /// Create a hub with default queue and history sizes.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, DEFAULT_HISTORY_LINES)
    }

    /// Create a hub with explicit per-subscriber capacity and history length.
    #[must_use]
    pub fn with_capacity(queue_capacity: usize, history_lines: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                subscribers: HashMap::new(),
                next_id: 0,
                history: VecDeque::with_capacity(history_lines.min(32)),
                closed: false,
            }),
            queue_capacity,
            history_lines,
        }
    }

    /// A hub that is already closed; attaching yields an ended subscription.
    #[must_use]
    pub fn closed() -> Self {
        let hub = Self::new();
        lock(&hub.inner).closed = true;
        hub
    }

    /// Deliver a line to every attached subscription and record it in history.
    pub fn push(&self, msg: LogMsg) {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        for slot in inner.subscribers.values() {
            slot.push(msg.text());
        }
        if self.history_lines > 0 {
            if inner.history.len() >= self.history_lines {
                inner.history.pop_front();
            }
            inner.history.push_back(msg);
        }
    }

    /// Push stdout line.
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stdout(s.into()));
    }

    /// Push stderr line.
    pub fn push_stderr<S: Into<String>>(&self, s: S) {
        self.push(LogMsg::Stderr(s.into()));
    }

    /// Attach a new subscription.
    ///
    /// `interval` is the minimum time between two wake-ups of the
    /// subscriber; lines arriving meanwhile are batched. Zero delivers
    /// immediately.
    #[must_use]
    pub fn attach(self: &Arc<Self>, interval: Duration) -> Subscription {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;

        let slot = if inner.closed {
            Arc::new(Slot::new(self.queue_capacity, Some(CloseReason::InstanceEnded)))
        } else {
            let slot = Arc::new(Slot::new(self.queue_capacity, None));
            inner.subscribers.insert(id, Arc::clone(&slot));
            slot
        };
        drop(inner);

        tracing::trace!(subscription = id, ?interval, "log subscription attached");

        Subscription {
            id,
            slot,
            hub: Arc::clone(self),
            interval,
            last_delivery: None,
            pending: VecDeque::new(),
        }
    }

    /// Detach a subscription. Detaching twice is a no-op.
    pub fn detach(&self, id: u64) {
        let removed = lock(&self.inner).subscribers.remove(&id);
        if let Some(slot) = removed {
            slot.close(CloseReason::Detached);
            tracing::trace!(subscription = id, "log subscription detached");
        }
    }

    /// Close the hub: subscribers drain what is queued, then see the end.
    pub fn close(&self) {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        for (_, slot) in inner.subscribers.drain() {
            slot.close(CloseReason::InstanceEnded);
        }
    }

    /// Whether the hub has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    /// Number of currently attached subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<LogMsg> {
        lock(&self.inner).history.iter().cloned().collect()
    }

    /// Text of the last `n` retained lines, oldest first.
    #[must_use]
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = lock(&self.inner);
        let skip = inner.history.len().saturating_sub(n);
        inner
            .history
            .iter()
            .skip(skip)
            .map(|m| m.text().to_owned())
            .collect()
    }

    /// Forward a stream of log messages into this hub, closing it when the
    /// stream ends.
    pub fn spawn_forwarder<S, E>(self: Arc<Self>, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: futures::Stream<Item = Result<LogMsg, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        tokio::spawn(async move {
            tokio::pin!(stream);

            while let Some(next) = stream.next().await {
                match next {
                    Ok(msg) => self.push(msg),
                    Err(e) => self.push(LogMsg::Stderr(format!("stream error: {e}"))),
                }
            }

            self.close();
        })
    }
}

/// One attached observer of a [`LogHub`].
///
/// Dropping the subscription detaches it.
pub struct Subscription {
    id: u64,
    slot: Arc<Slot>,
    hub: Arc<LogHub>,
    interval: Duration,
    last_delivery: Option<Instant>,
    pending: VecDeque<String>,
}

impl Subscription {
    /// Subscription identifier within its hub.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Lines discarded because this subscriber fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        lock(&self.slot.queue).dropped
    }

    /// Why the subscription ended, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.slot.queue).closed
    }

    /// Detach from the hub. Idempotent.
    pub fn detach(&self) {
        self.hub.detach(self.id);
    }

    /// Wait for the next batch of lines.
    ///
    /// Returns `None` once the subscription is detached, or once the hub
    /// closed and every queued line has been handed out.
    pub async fn next_batch(&mut self) -> Option<Vec<String>> {
        if !self.pending.is_empty() {
            return Some(self.pending.drain(..).collect());
        }

        loop {
            if let Some(last) = self.last_delivery.filter(|_| !self.interval.is_zero()) {
                sleep_until(last + self.interval).await;
            }

            {
                let mut queue = lock(&self.slot.queue);
                if queue.closed == Some(CloseReason::Detached) {
                    return None;
                }
                if !queue.lines.is_empty() {
                    let batch: Vec<String> = queue.lines.drain(..).collect();
                    drop(queue);
                    self.last_delivery = Some(Instant::now());
                    return Some(batch);
                }
                if queue.closed.is_some() {
                    return None;
                }
            }

            self.slot.notify.notified().await;
        }
    }

    /// Wait for the next single line.
    pub async fn next_line(&mut self) -> Option<String> {
        if let Some(line) = self.pending.pop_front() {
            return Some(line);
        }
        let batch = self.next_batch().await?;
        self.pending.extend(batch);
        self.pending.pop_front()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.detach(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let hub = Arc::new(LogHub::new());
        let mut a = hub.attach(Duration::ZERO);
        let mut b = hub.attach(Duration::ZERO);

        hub.push_stdout("one");
        hub.push_stderr("two");

        assert_eq!(a.next_line().await.as_deref(), Some("one"));
        assert_eq!(a.next_line().await.as_deref(), Some("two"));
        assert_eq!(b.next_batch().await, Some(vec!["one".into(), "two".into()]));
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_affect_others() {
        let hub = Arc::new(LogHub::with_capacity(4, 10));
        let mut fast = hub.attach(Duration::ZERO);
        let slow = hub.attach(Duration::ZERO);

        for i in 0..3 {
            hub.push_stdout(format!("line {i}"));
            assert_eq!(fast.next_line().await, Some(format!("line {i}")));
        }
        for i in 3..10 {
            hub.push_stdout(format!("line {i}"));
        }

        // Fast subscriber still sees everything within its own capacity.
        let batch = fast.next_batch().await.unwrap();
        assert_eq!(batch, vec!["line 6", "line 7", "line 8", "line 9"]);

        // Slow subscriber kept only the newest lines.
        assert_eq!(slow.dropped(), 6);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_lines() {
        let hub = Arc::new(LogHub::with_capacity(2, 0));
        let mut sub = hub.attach(Duration::ZERO);

        hub.push_stdout("a");
        hub.push_stdout("b");
        hub.push_stdout("c");

        assert_eq!(sub.next_batch().await, Some(vec!["b".into(), "c".into()]));
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn test_waiting_subscriber_is_woken() {
        let hub = Arc::new(LogHub::new());
        let mut sub = hub.attach(Duration::ZERO);

        let producer = Arc::clone(&hub);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push_stdout("late");
        });

        let line = tokio::time::timeout(Duration::from_secs(2), sub.next_line())
            .await
            .unwrap();
        assert_eq!(line.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let hub = Arc::new(LogHub::new());
        let mut sub = hub.attach(Duration::ZERO);

        hub.push_stdout("last words");
        hub.close();

        assert_eq!(sub.next_line().await.as_deref(), Some("last words"));
        assert_eq!(sub.next_line().await, None);
        assert_eq!(sub.close_reason(), Some(CloseReason::InstanceEnded));
    }

    #[tokio::test]
    async fn test_attach_to_closed_hub_ends_immediately() {
        let hub = Arc::new(LogHub::closed());
        let mut sub = hub.attach(Duration::from_millis(100));

        assert_eq!(sub.next_line().await, None);
        assert_eq!(sub.close_reason(), Some(CloseReason::InstanceEnded));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let hub = Arc::new(LogHub::new());
        let mut sub = hub.attach(Duration::ZERO);
        hub.push_stdout("discarded");

        sub.detach();
        sub.detach();
        hub.detach(sub.id());

        assert_eq!(hub.subscriber_count(), 0);
        assert_eq!(sub.next_line().await, None);
        assert_eq!(sub.close_reason(), Some(CloseReason::Detached));
    }

    #[tokio::test]
    async fn test_drop_detaches() {
        let hub = Arc::new(LogHub::new());
        {
            let _sub = hub.attach(Duration::ZERO);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_interval_batches_lines() {
        let hub = Arc::new(LogHub::new());
        let mut sub = hub.attach(Duration::from_millis(200));

        hub.push_stdout("first");
        assert_eq!(sub.next_batch().await, Some(vec!["first".into()]));

        let started = Instant::now();
        hub.push_stdout("second");
        hub.push_stdout("third");
        let batch = sub.next_batch().await.unwrap();

        assert_eq!(batch, vec!["second", "third"]);
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn test_history_is_bounded() {
        let hub = LogHub::with_capacity(10, 3);
        for i in 0..5 {
            hub.push_stdout(format!("{i}"));
        }
        assert_eq!(hub.tail(10), vec!["2", "3", "4"]);
        assert_eq!(hub.tail(1), vec!["4"]);
        assert_eq!(hub.history().len(), 3);
    }

    #[tokio::test]
    async fn test_forwarder_closes_hub_at_end_of_stream() {
        let hub = Arc::new(LogHub::new());
        let mut sub = hub.attach(Duration::ZERO);

        let stream = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(LogMsg::Stdout("hello".into())),
            Err(std::io::Error::other("pipe broke")),
        ]);
        Arc::clone(&hub).spawn_forwarder(stream).await.unwrap();

        assert!(hub.is_closed());
        assert_eq!(sub.next_line().await.as_deref(), Some("hello"));
        assert_eq!(
            sub.next_line().await.as_deref(),
            Some("stream error: pipe broke")
        );
        assert_eq!(sub.next_line().await, None);
    }
}
