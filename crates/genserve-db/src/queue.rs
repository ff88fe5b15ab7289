//! Durable work queue between the API and the dispatcher.
//!
//! Messages are bare task IDs. Delivery is at-least-once: a message stays
//! `unacked` until the consumer acks or nacks it, and a consumer holds at
//! most `prefetch` unacked deliveries at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use genserve_config::QueueConfig;
use genserve_types::{current_timestamp_secs, GenError, Result};
use log::{error, info, warn};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{db_error, SharedDatabase};

/// One message handed to a consumer. `tag` identifies it for ack/nack.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: u64,
    pub queue: String,
    pub payload: String,
    pub redelivered: bool,
}

pub trait QueueTransport: Send + Sync {
    fn publish(&self, queue: &str, payload: &str) -> Result<()>;

    /// Wait up to `wait` for the next message. `Ok(None)` when nothing
    /// arrived in time or the prefetch window is full.
    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery; `requeue = false` drops it.
    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Messages waiting to be delivered.
    fn message_count(&self, queue: &str) -> Result<usize>;

    /// Re-establish the underlying connection after a receive failure.
    fn reconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Backoff schedule for [`consume`].
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            multiplier: 1.5,
            max_attempts: 5,
        }
    }
}

impl From<&QueueConfig> for ReconnectPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_initial_delay_ms),
            multiplier: config.reconnect_multiplier,
            max_attempts: config.reconnect_max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        self.initial_delay.mul_f64(self.multiplier.powi(exp))
    }
}

/// Consume `queue` until `shutdown` is set, handing each delivery to
/// `on_delivery`. Receive failures back off and reconnect; more than
/// `policy.max_attempts` consecutive failures end the loop with the last
/// error.
pub fn consume<F>(
    transport: &dyn QueueTransport,
    queue: &str,
    poll: Duration,
    policy: &ReconnectPolicy,
    shutdown: &AtomicBool,
    mut on_delivery: F,
) -> Result<()>
where
    F: FnMut(Delivery),
{
    let mut failures = 0u32;
    while !shutdown.load(Ordering::SeqCst) {
        match transport.receive(queue, poll) {
            Ok(Some(delivery)) => {
                failures = 0;
                on_delivery(delivery);
            }
            Ok(None) => failures = 0,
            Err(e) => {
                failures += 1;
                if failures > policy.max_attempts {
                    error!("[QUEUE] giving up on {queue} after {} reconnect attempts: {e}", policy.max_attempts);
                    return Err(e);
                }
                let delay = policy.delay(failures);
                warn!(
                    "[QUEUE] receive from {queue} failed: {e}; reconnecting in {:.1}s (attempt {failures}/{})",
                    delay.as_secs_f64(),
                    policy.max_attempts
                );
                sleep_unless(delay, shutdown);
                if let Err(e) = transport.reconnect() {
                    warn!("[QUEUE] reconnect failed: {e}");
                }
            }
        }
    }
    info!("[QUEUE] consumer on {queue} stopped");
    Ok(())
}

fn sleep_unless(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(100)));
    }
}

/// SQLite-backed queue shared across processes through the database file.
pub struct SqliteQueue {
    db: SharedDatabase,
    prefetch: usize,
    outstanding: Mutex<HashSet<u64>>,
    poll_step: Duration,
}

impl SqliteQueue {
    pub fn new(db: SharedDatabase) -> Self {
        Self {
            db,
            prefetch: 1,
            outstanding: Mutex::new(HashSet::new()),
            poll_step: Duration::from_millis(50),
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Return every unacked message to `ready`. Run once at consumer
    /// startup; deliveries held by a crashed consumer become redeliverable.
    pub fn recover(&self) -> Result<usize> {
        let conn = self.db.connection();
        let restored = conn
            .execute(
                "UPDATE queue_messages SET state = 'ready' WHERE state = 'unacked'",
                [],
            )
            .map_err(db_error("recover unacked messages"))?;
        self.outstanding_set().clear();
        if restored > 0 {
            info!("[QUEUE] recovered {restored} unacked message(s)");
        }
        Ok(restored)
    }

    fn outstanding_set(&self) -> std::sync::MutexGuard<'_, HashSet<u64>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_claim(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut conn = self.db.connection();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_error("begin claim"))?;

        let row: Option<(i64, String, i64)> = tx
            .query_row(
                "SELECT id, payload, delivery_count FROM queue_messages
                 WHERE queue = ?1 AND state = 'ready' ORDER BY id LIMIT 1",
                [queue],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(db_error("select next message"))?;

        let Some((id, payload, delivery_count)) = row else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE queue_messages SET state = 'unacked', delivery_count = delivery_count + 1,
             delivered_at = ?2 WHERE id = ?1",
            params![id, current_timestamp_secs()],
        )
        .map_err(db_error("claim message"))?;
        tx.commit().map_err(db_error("commit claim"))?;

        Ok(Some(Delivery {
            tag: id as u64,
            queue: queue.to_string(),
            payload,
            redelivered: delivery_count > 0,
        }))
    }

    fn settle(&self, delivery: &Delivery, sql: &str, context: &str) -> Result<()> {
        self.outstanding_set().remove(&delivery.tag);
        let conn = self.db.connection();
        let changed = conn
            .execute(sql, [delivery.tag as i64])
            .map_err(db_error(context))?;
        if changed == 0 {
            return Err(GenError::Queue(format!(
                "unknown delivery tag {} on {}",
                delivery.tag, delivery.queue
            )));
        }
        Ok(())
    }
}

impl QueueTransport for SqliteQueue {
    fn publish(&self, queue: &str, payload: &str) -> Result<()> {
        let conn = self.db.connection();
        conn.execute(
            "INSERT INTO queue_messages (queue, payload, state, published_at) VALUES (?1, ?2, 'ready', ?3)",
            params![queue, payload, current_timestamp_secs()],
        )
        .map_err(db_error("publish message"))?;
        Ok(())
    }

    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if self.outstanding_set().len() < self.prefetch {
                if let Some(delivery) = self.try_claim(queue)? {
                    self.outstanding_set().insert(delivery.tag);
                    return Ok(Some(delivery));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_step.min(deadline - now));
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.settle(
            delivery,
            "DELETE FROM queue_messages WHERE id = ?1 AND state = 'unacked'",
            "ack message",
        )
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if requeue {
            self.settle(
                delivery,
                "UPDATE queue_messages SET state = 'ready' WHERE id = ?1 AND state = 'unacked'",
                "requeue message",
            )
        } else {
            self.settle(
                delivery,
                "DELETE FROM queue_messages WHERE id = ?1 AND state = 'unacked'",
                "reject message",
            )
        }
    }

    fn message_count(&self, queue: &str) -> Result<usize> {
        let conn = self.db.connection();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM queue_messages WHERE queue = ?1 AND state = 'ready'",
                [queue],
                |row| row.get(0),
            )
            .map_err(db_error("count messages"))?;
        Ok(count as usize)
    }
}

#[derive(Debug, Clone)]
struct Message {
    tag: u64,
    queue: String,
    payload: String,
    redelivered: bool,
}

impl Message {
    fn delivery(&self) -> Delivery {
        Delivery {
            tag: self.tag,
            queue: self.queue.clone(),
            payload: self.payload.clone(),
            redelivered: self.redelivered,
        }
    }
}

#[derive(Default)]
struct MemoryQueueState {
    next_tag: u64,
    ready: HashMap<String, VecDeque<Message>>,
    unacked: HashMap<u64, Message>,
}

/// In-process queue for tests and single-process runs.
pub struct MemoryQueue {
    state: Mutex<MemoryQueueState>,
    available: Condvar,
    prefetch: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            available: Condvar::new(),
            prefetch: 1,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_unacked(&self, delivery: &Delivery) -> Result<(std::sync::MutexGuard<'_, MemoryQueueState>, Message)> {
        let mut state = self.lock();
        let message = state.unacked.remove(&delivery.tag).ok_or_else(|| {
            GenError::Queue(format!("unknown delivery tag {} on {}", delivery.tag, delivery.queue))
        })?;
        Ok((state, message))
    }
}

impl QueueTransport for MemoryQueue {
    fn publish(&self, queue: &str, payload: &str) -> Result<()> {
        let mut state = self.lock();
        state.next_tag += 1;
        let message = Message {
            tag: state.next_tag,
            queue: queue.to_string(),
            payload: payload.to_string(),
            redelivered: false,
        };
        state.ready.entry(queue.to_string()).or_default().push_back(message);
        self.available.notify_all();
        Ok(())
    }

    fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        let mut state = self.lock();
        loop {
            if state.unacked.len() < self.prefetch {
                if let Some(message) = state.ready.get_mut(queue).and_then(VecDeque::pop_front) {
                    let delivery = message.delivery();
                    state.unacked.insert(message.tag, message);
                    return Ok(Some(delivery));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn ack(&self, delivery: &Delivery) -> Result<()> {
        let (_state, _message) = self.take_unacked(delivery)?;
        self.available.notify_all();
        Ok(())
    }

    fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let (mut state, mut message) = self.take_unacked(delivery)?;
        if requeue {
            message.redelivered = true;
            state
                .ready
                .entry(message.queue.clone())
                .or_default()
                .push_front(message);
        }
        self.available.notify_all();
        Ok(())
    }

    fn message_count(&self, queue: &str) -> Result<usize> {
        Ok(self.lock().ready.get(queue).map_or(0, VecDeque::len))
    }
}
