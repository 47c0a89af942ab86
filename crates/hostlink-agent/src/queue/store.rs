//! Priority outbox mirrored to disk.
//!
//! Messages are kept in strict priority order (higher first, arrival order
//! within a priority). Every mutation rewrites the whole snapshot through a
//! temp file and a rename, so the file on disk is always either the old or
//! the new state.
//!
//! Dequeued messages stay in the snapshot as in-flight until they are marked
//! processed, rejected or requeued. A crash mid-delivery therefore redelivers
//! rather than loses them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use hostlink_core::now_millis;
use hostlink_core::time::duration_millis;

use super::error::QueueError;
use super::message::{QueuedMessage, REQUEUE_STEP};

/// Default bound on queued messages.
pub const DEFAULT_CAPACITY: usize = 1000;
/// Default bound on a single serialized payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Snapshot file. `None` keeps the queue in memory only.
    pub path: Option<PathBuf>,
    pub capacity: usize,
    pub max_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: None,
            capacity: DEFAULT_CAPACITY,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }
}

/// Cumulative queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub processed: u64,
    /// Permanently failed: retries exhausted or rejected by the backend.
    pub failed: u64,
    pub expired: u64,
    pub evicted: u64,
    pub requeued: u64,
    pub persist_errors: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    saved_at: i64,
    messages: Vec<QueuedMessage>,
}

#[derive(Debug, Default)]
struct State {
    messages: Vec<QueuedMessage>,
    in_flight: HashMap<String, QueuedMessage>,
    stats: QueueStats,
}

impl State {
    /// Insert before the first entry of lower priority.
    fn insert_by_priority(&mut self, message: QueuedMessage) {
        let pos = self
            .messages
            .iter()
            .position(|m| m.priority < message.priority)
            .unwrap_or(self.messages.len());
        self.messages.insert(pos, message);
    }

    /// Insert by priority, then by earliest rescheduled time.
    fn insert_rescheduled(&mut self, message: QueuedMessage) {
        let pos = self
            .messages
            .iter()
            .position(|m| {
                m.priority < message.priority
                    || (m.priority == message.priority
                        && m.next_attempt_at > message.next_attempt_at)
            })
            .unwrap_or(self.messages.len());
        self.messages.insert(pos, message);
    }

    /// Remove the oldest message among those with the lowest priority.
    fn evict_one(&mut self) -> Option<QueuedMessage> {
        let lowest = self.messages.iter().map(|m| m.priority).min()?;
        let (idx, _) = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.priority == lowest)
            .min_by_key(|(_, m)| m.timestamp)?;
        Some(self.messages.remove(idx))
    }

    fn purge_expired(&mut self, now: i64) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.is_expired_at(now));
        let purged = before - self.messages.len();
        self.stats.expired += purged as u64;
        purged
    }

    fn snapshot(&self) -> Snapshot {
        let mut messages: Vec<QueuedMessage> = self.in_flight.values().cloned().collect();
        messages.extend(self.messages.iter().cloned());
        Snapshot {
            saved_at: now_millis(),
            messages,
        }
    }
}

/// Durable priority queue.
pub struct MessageQueue {
    state: RwLock<State>,
    path: Option<PathBuf>,
    capacity: usize,
    max_payload_bytes: usize,
}

impl MessageQueue {
    /// Open the queue, loading any snapshot at `config.path`.
    ///
    /// A missing file means an empty queue. An unreadable or unparseable file
    /// is an error. Expired and corrupted entries are dropped on load.
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        let mut state = State::default();
        let mut dirty = false;

        if let Some(path) = &config.path {
            if let Some(snapshot) = load_snapshot(path)? {
                let now = now_millis();
                let total = snapshot.messages.len();
                for message in snapshot.messages {
                    if message.is_expired_at(now) {
                        state.stats.expired += 1;
                        dirty = true;
                    } else if !message.verify_checksum() {
                        warn!(id = %message.id, "Dropping queued message with bad checksum");
                        state.stats.failed += 1;
                        dirty = true;
                    } else {
                        state.insert_by_priority(message);
                    }
                }
                info!(
                    path = %path.display(),
                    loaded = state.messages.len(),
                    discarded = total - state.messages.len(),
                    "Loaded message queue"
                );
            }
        }

        if dirty {
            if let Err(e) = write_snapshot(config.path.as_deref(), &state) {
                state.stats.persist_errors += 1;
                error!(error = %e, "Failed to persist message queue");
            }
        }

        Ok(Self {
            state: RwLock::new(state),
            path: config.path,
            capacity: config.capacity.max(1),
            max_payload_bytes: config.max_payload_bytes,
        })
    }

    /// An in-memory queue with default limits.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
            capacity: DEFAULT_CAPACITY,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a message, evicting the oldest lowest-priority one when full.
    pub async fn enqueue(&self, message: QueuedMessage) -> Result<(), QueueError> {
        let size = message.payload_len();
        if size > self.max_payload_bytes {
            return Err(QueueError::PayloadTooLarge {
                size,
                max: self.max_payload_bytes,
            });
        }

        let mut state = self.state.write().await;
        if state.messages.len() >= self.capacity {
            if let Some(evicted) = state.evict_one() {
                state.stats.evicted += 1;
                warn!(
                    id = %evicted.id,
                    message_type = %evicted.message_type,
                    priority = evicted.priority,
                    "Queue full, evicted message"
                );
            }
        }
        debug!(
            id = %message.id,
            message_type = %message.message_type,
            priority = message.priority,
            "Enqueued message"
        );
        state.insert_by_priority(message);
        state.stats.enqueued += 1;
        self.persist(&mut state);
        Ok(())
    }

    /// Take the highest-priority eligible message.
    pub async fn dequeue(&self) -> Result<QueuedMessage, QueueError> {
        self.dequeue_at(now_millis()).await
    }

    pub async fn dequeue_at(&self, now: i64) -> Result<QueuedMessage, QueueError> {
        let mut state = self.state.write().await;
        let purged = state.purge_expired(now);
        let found = state.messages.iter().position(|m| m.is_eligible_at(now));
        let Some(idx) = found else {
            if purged > 0 {
                self.persist(&mut state);
            }
            return Err(QueueError::Empty);
        };
        let message = state.messages.remove(idx);
        state.in_flight.insert(message.id.clone(), message.clone());
        if purged > 0 {
            self.persist(&mut state);
        }
        Ok(message)
    }

    /// Look at the message `dequeue` would return, without taking it.
    pub async fn peek(&self) -> Result<QueuedMessage, QueueError> {
        self.peek_at(now_millis()).await
    }

    pub async fn peek_at(&self, now: i64) -> Result<QueuedMessage, QueueError> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.is_eligible_at(now))
            .cloned()
            .ok_or(QueueError::Empty)
    }

    /// Put a failed message back with a delay of `retries * 1s`.
    ///
    /// Once the incremented retry count reaches `max_retries` the message is
    /// dropped, counted as failed, and [`QueueError::RetriesExhausted`] is returned.
    pub async fn requeue(&self, message: QueuedMessage, error: &str) -> Result<(), QueueError> {
        self.requeue_at(message, error, now_millis()).await
    }

    pub async fn requeue_at(
        &self,
        mut message: QueuedMessage,
        error: &str,
        now: i64,
    ) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        state.in_flight.remove(&message.id);

        message.retries = message.retries.saturating_add(1);
        message.last_error = Some(error.to_string());
        message.last_attempt_at = Some(now);

        if message.retries >= message.max_retries {
            state.stats.failed += 1;
            self.persist(&mut state);
            warn!(
                id = %message.id,
                message_type = %message.message_type,
                retries = message.retries,
                error,
                "Message failed permanently"
            );
            return Err(QueueError::RetriesExhausted {
                id: message.id,
                retries: message.retries,
            });
        }

        let delay = duration_millis(REQUEUE_STEP.saturating_mul(message.retries));
        message.next_attempt_at = now.saturating_add(delay);
        debug!(id = %message.id, retries = message.retries, delay_ms = delay, "Requeued message");
        state.insert_rescheduled(message);
        state.stats.requeued += 1;
        self.persist(&mut state);
        Ok(())
    }

    /// Return an in-flight message untouched, e.g. after cancellation.
    pub async fn restore(&self, message: QueuedMessage) {
        let mut state = self.state.write().await;
        state.in_flight.remove(&message.id);
        state.insert_rescheduled(message);
        self.persist(&mut state);
    }

    /// Record successful delivery. Returns whether the id was known.
    pub async fn mark_processed(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let known = if state.in_flight.remove(id).is_some() {
            true
        } else if let Some(idx) = state.messages.iter().position(|m| m.id == id) {
            state.messages.remove(idx);
            true
        } else {
            false
        };
        if known {
            state.stats.processed += 1;
            self.persist(&mut state);
        }
        known
    }

    /// Drop a message the backend refused. It is never retried.
    pub async fn reject(&self, message: &QueuedMessage, reason: &str) {
        let mut state = self.state.write().await;
        state.in_flight.remove(&message.id);
        state.messages.retain(|m| m.id != message.id);
        state.stats.failed += 1;
        warn!(id = %message.id, message_type = %message.message_type, reason, "Message rejected");
        self.persist(&mut state);
    }

    /// Remove everything, including in-flight messages.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.messages.clear();
        state.in_flight.clear();
        self.persist(&mut state);
    }

    /// Messages waiting for delivery.
    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.messages.is_empty()
    }

    /// Messages handed out and not yet settled.
    pub async fn in_flight(&self) -> usize {
        self.state.read().await.in_flight.len()
    }

    /// Fill ratio in `[0, 1]`.
    pub async fn utilization(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = self.len().await as f64 / self.capacity as f64;
        ratio.min(1.0)
    }

    pub async fn stats(&self) -> QueueStats {
        self.state.read().await.stats.clone()
    }

    /// Persist, counting failures instead of returning them.
    fn persist(&self, state: &mut State) {
        if let Err(e) = write_snapshot(self.path.as_deref(), state) {
            state.stats.persist_errors += 1;
            error!(error = %e, "Failed to persist message queue");
        }
    }
}

/// Write the snapshot to a sibling temp file, then rename it into place.
fn write_snapshot(path: Option<&Path>, state: &State) -> Result<(), QueueError> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_vec(&state.snapshot())?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, json)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_snapshot(path: &Path) -> Result<Option<Snapshot>, QueueError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|e| QueueError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}
