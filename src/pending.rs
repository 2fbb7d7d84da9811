//! Pending-request registry
//!
//! Client-side table pairing outbound request IDs with waiting callers.
//! Every client-side transport shares this structure: a request registers
//! a waiter before its bytes leave the process, the inbound dispatcher
//! completes the matching entry by ID, and the waiter observes exactly one
//! of completion, error, or timeout.
//!
//! # Design
//!
//! The table is open-addressed with linear probing. Capacity is always a
//! power of two and doubles when an insert would reach a 0.75 load factor.
//! Removed entries become tombstones so probe chains stay intact; a
//! tombstone is reusable by a later insert, and reinserting a previously
//! removed ID yields a fresh entry. Each occupied slot owns a
//! [`tokio::sync::oneshot`] sender as its one-shot notifier; dropping the
//! entry drops the sender, so cleanup is deterministic and panic-safe.
//!
//! All table access is serialized by one mutex. Waiters never hold it
//! while awaiting: `add` hands back a [`PendingWaiter`] whose receiver is
//! awaited outside the lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

use crate::codec::JsonRpcError;
use crate::error::{McpgateError, Result};

/// Initial table capacity; must be a power of two.
const INITIAL_CAPACITY: usize = 16;

/// Outcome delivered to a waiter: the `result` payload or the peer's
/// JSON-RPC error object.
pub type PendingOutcome = std::result::Result<serde_json::Value, JsonRpcError>;

/// Lifecycle of a pending entry. `Waiting` entries hold a live notifier;
/// the other states are terminal and observed only transiently before the
/// entry is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Registered, no response yet.
    Waiting,
    /// The dispatcher delivered a successful result.
    Completed,
    /// The dispatcher delivered a peer error.
    Error,
    /// The per-call deadline elapsed before a response arrived.
    Timeout,
}

/// One registered request.
#[derive(Debug)]
struct PendingEntry {
    id: u64,
    status: PendingStatus,
    /// One-shot notifier; `take`n on completion, dropped on removal.
    tx: Option<oneshot::Sender<PendingOutcome>>,
}

/// A table slot. Tombstones retain the removed ID so linear probe chains
/// that pass through them remain searchable.
#[derive(Debug)]
enum Slot {
    Empty,
    Occupied(PendingEntry),
    Tombstone { id: u64 },
}

impl Slot {
    fn occupied_id(&self) -> Option<u64> {
        match self {
            Slot::Occupied(e) => Some(e.id),
            _ => None,
        }
    }
}

struct Table {
    slots: Vec<Slot>,
    /// Number of occupied (non-tombstone) slots.
    count: usize,
    draining: bool,
}

impl Table {
    fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self {
            slots,
            count: 0,
            draining: false,
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn home(&self, id: u64) -> usize {
        (id & (self.capacity() as u64 - 1)) as usize
    }

    /// Locate the slot holding `id`, probing linearly through tombstones.
    fn find(&self, id: u64) -> Option<usize> {
        let capacity = self.capacity();
        let mut index = self.home(id);
        for _ in 0..capacity {
            match &self.slots[index] {
                Slot::Empty => return None,
                Slot::Occupied(e) if e.id == id => return Some(index),
                _ => index = (index + 1) & (capacity - 1),
            }
        }
        None
    }

    /// Locate the insert position for `id`: the first tombstone on the
    /// probe path when the key is absent, else the first empty slot.
    ///
    /// Returns `Err` on a duplicate occupied ID.
    fn find_insert(&self, id: u64) -> std::result::Result<usize, McpgateError> {
        let capacity = self.capacity();
        let mut index = self.home(id);
        let mut first_tombstone: Option<usize> = None;
        for _ in 0..capacity {
            match &self.slots[index] {
                Slot::Empty => return Ok(first_tombstone.unwrap_or(index)),
                Slot::Occupied(e) if e.id == id => {
                    return Err(McpgateError::Internal(format!(
                        "duplicate pending request id {id}"
                    )))
                }
                Slot::Tombstone { .. } => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                    index = (index + 1) & (capacity - 1);
                }
                Slot::Occupied(_) => index = (index + 1) & (capacity - 1),
            }
        }
        first_tombstone.ok_or_else(|| {
            McpgateError::Internal("pending registry table full after resize".to_string())
        })
    }

    /// Double capacity and rehash occupied entries. Tombstones are
    /// discarded. Membership is preserved: every ID findable before the
    /// resize is findable after.
    fn grow(&mut self) -> std::result::Result<(), McpgateError> {
        let new_capacity = self.capacity() * 2;
        let old = std::mem::replace(&mut self.slots, {
            let mut v = Vec::with_capacity(new_capacity);
            v.resize_with(new_capacity, || Slot::Empty);
            v
        });
        for slot in old {
            if let Slot::Occupied(entry) = slot {
                let index = self.find_insert(entry.id)?;
                self.slots[index] = Slot::Occupied(entry);
            }
        }
        Ok(())
    }
}

/// Handle returned by [`PendingRegistry::add`]; awaited by the caller
/// outside the registry lock.
#[derive(Debug)]
pub struct PendingWaiter {
    id: u64,
    rx: oneshot::Receiver<PendingOutcome>,
}

impl PendingWaiter {
    /// The request ID this waiter is registered under.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Hash table mapping request ID to waiting caller, shared by all
/// client-side transports of one client instance.
///
/// # Examples
///
/// ```
/// use mcpgate::pending::PendingRegistry;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let registry = PendingRegistry::new();
/// let id = registry.next_id();
/// let waiter = registry.add(id)?;
/// registry.complete(id, Ok(serde_json::json!({"pong": true})));
/// let value = registry
///     .wait(waiter, std::time::Duration::from_secs(1))
///     .await?;
/// assert_eq!(value["pong"], true);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct PendingRegistry {
    table: Mutex<Table>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("capacity", &self.capacity())
            .field("count", &self.count)
            .field("draining", &self.draining)
            .finish()
    }
}

impl Default for PendingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table::with_capacity(INITIAL_CAPACITY)),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next request ID. IDs are strictly monotonic per
    /// registry, never zero, and emitted in call order.
    pub fn next_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a waiter for `id`.
    ///
    /// Resizes first when the insert would reach the 0.75 load factor.
    ///
    /// # Errors
    ///
    /// [`McpgateError::InvalidParams`] for `id == 0`,
    /// [`McpgateError::Shutdown`] after [`drain`](Self::drain), and
    /// [`McpgateError::Internal`] for a duplicate ID (a logic bug; never
    /// silently overwritten).
    pub fn add(&self, id: u64) -> Result<PendingWaiter> {
        if id == 0 {
            return Err(McpgateError::InvalidParams("request id 0 is reserved".to_string()).into());
        }
        let (tx, rx) = oneshot::channel();

        let mut table = self.lock();
        if table.draining {
            return Err(McpgateError::Shutdown("pending registry drained".to_string()).into());
        }
        if 4 * (table.count + 1) >= 3 * table.capacity() {
            table.grow()?;
        }
        let index = table.find_insert(id)?;
        table.slots[index] = Slot::Occupied(PendingEntry {
            id,
            status: PendingStatus::Waiting,
            tx: Some(tx),
        });
        table.count += 1;
        Ok(PendingWaiter { id, rx })
    }

    /// Deliver a response to the waiter registered under `id`.
    ///
    /// Called from the inbound dispatcher. Returns `false` when no live
    /// waiter exists (already completed, timed out, or never registered);
    /// late responses are dropped, never mismatched.
    pub fn complete(&self, id: u64, outcome: PendingOutcome) -> bool {
        let mut table = self.lock();
        let Some(index) = table.find(id) else {
            return false;
        };
        let Slot::Occupied(entry) = &mut table.slots[index] else {
            return false;
        };
        let Some(tx) = entry.tx.take() else {
            return false;
        };
        entry.status = if outcome.is_ok() {
            PendingStatus::Completed
        } else {
            PendingStatus::Error
        };
        // A waiter that raced its own timeout may have dropped the
        // receiver already; that is not an error here.
        tx.send(outcome).is_ok()
    }

    /// Remove the entry for `id`, leaving a tombstone.
    ///
    /// The notifier is dropped here, under the registry mutex, which
    /// guarantees no signal races its destruction. Returns `false` when
    /// the ID is not present.
    pub fn remove(&self, id: u64) -> bool {
        let mut table = self.lock();
        let Some(index) = table.find(id) else {
            return false;
        };
        table.slots[index] = Slot::Tombstone { id };
        table.count -= 1;
        true
    }

    /// Await the outcome for a registered waiter, bounded by `timeout`.
    ///
    /// The entry is always removed before returning, whatever the
    /// outcome.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Timeout`] on deadline expiry, [`McpgateError::Rpc`]
    /// when the peer answered with an error object, and
    /// [`McpgateError::Shutdown`] when the registry was drained while
    /// waiting.
    pub async fn wait(&self, waiter: PendingWaiter, timeout: Duration) -> Result<serde_json::Value> {
        let PendingWaiter { id, rx } = waiter;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(value))) => {
                self.remove(id);
                Ok(value)
            }
            Ok(Ok(Err(rpc_error))) => {
                self.remove(id);
                Err(McpgateError::Rpc {
                    code: rpc_error.code,
                    message: rpc_error.message,
                }
                .into())
            }
            Ok(Err(_dropped)) => {
                // Sender dropped without a send: the registry was drained.
                self.remove(id);
                Err(McpgateError::Shutdown(
                    "registry drained before response arrived".to_string(),
                )
                .into())
            }
            Err(_elapsed) => {
                self.mark_timed_out(id);
                self.remove(id);
                Err(McpgateError::Timeout(format!(
                    "request {id} timed out after {}ms",
                    timeout.as_millis()
                ))
                .into())
            }
        }
    }

    /// Frame `payload` onto `writer`, then wait for the matching response.
    ///
    /// The entry registered for `waiter` is removed before returning on
    /// every path, including a failed write.
    pub async fn send_and_wait<W>(
        &self,
        writer: &mut W,
        payload: &[u8],
        waiter: PendingWaiter,
        timeout: Duration,
    ) -> Result<serde_json::Value>
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = crate::framing::write_frame(writer, payload, None).await {
            self.remove(waiter.id);
            return Err(e);
        }
        self.wait(waiter, timeout).await
    }

    /// Drop every live waiter and refuse further registrations.
    ///
    /// In-flight `wait` calls resolve with a shutdown error instead of
    /// blocking until their deadlines.
    pub fn drain(&self) {
        let mut table = self.lock();
        table.draining = true;
        for slot in table.slots.iter_mut() {
            *slot = Slot::Empty;
        }
        table.count = 0;
    }

    /// Number of live (occupied) entries.
    pub fn count(&self) -> usize {
        self.lock().count
    }

    /// Current table capacity. Exposed for load-factor assertions.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// True when `id` currently occupies a slot.
    pub fn contains(&self, id: u64) -> bool {
        self.lock().find(id).is_some()
    }

    fn mark_timed_out(&self, id: u64) {
        let mut table = self.lock();
        if let Some(index) = table.find(id) {
            if let Slot::Occupied(entry) = &mut table.slots[index] {
                entry.status = PendingStatus::Timeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::as_mcpgate_error;

    #[test]
    fn test_add_then_remove_returns_to_baseline() {
        let registry = PendingRegistry::new();
        let baseline = registry.count();
        let _waiter = registry.add(1).unwrap();
        assert_eq!(registry.count(), baseline + 1);
        assert!(registry.remove(1));
        assert_eq!(registry.count(), baseline);
    }

    #[test]
    fn test_id_zero_rejected() {
        let registry = PendingRegistry::new();
        assert!(registry.add(0).is_err());
    }

    #[test]
    fn test_duplicate_id_is_internal_error() {
        let registry = PendingRegistry::new();
        let _first = registry.add(5).unwrap();
        let err = registry.add(5).unwrap_err();
        assert!(matches!(
            as_mcpgate_error(&err),
            Some(McpgateError::Internal(_))
        ));
        // The original entry is untouched.
        assert!(registry.contains(5));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_missing_id_reports_missing() {
        let registry = PendingRegistry::new();
        assert!(!registry.remove(42));
    }

    #[test]
    fn test_tombstone_id_is_reusable() {
        let registry = PendingRegistry::new();
        let _w = registry.add(9).unwrap();
        assert!(registry.remove(9));
        // Reinserting a previously removed ID yields a fresh entry.
        let _w2 = registry.add(9).unwrap();
        assert!(registry.contains(9));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_probe_through_tombstone_finds_entry() {
        let registry = PendingRegistry::new();
        // Capacity 16: IDs 1 and 17 share home bucket 1.
        let _a = registry.add(1).unwrap();
        let _b = registry.add(17).unwrap();
        assert!(registry.remove(1));
        // 17 sits behind the tombstone left by 1.
        assert!(registry.contains(17));
        registry.complete(17, Ok(serde_json::Value::Null));
    }

    #[test]
    fn test_load_factor_boundary_resizes_exactly_at_three_quarters() {
        let registry = PendingRegistry::new();
        assert_eq!(registry.capacity(), 16);
        // 11 entries: 11/16 < 0.75 even counting the pending insert.
        for id in 1..=11u64 {
            registry.add(id).unwrap();
        }
        assert_eq!(registry.capacity(), 16, "must not resize below 0.75");
        // The 12th insert would reach 12/16 == 0.75: resize exactly once.
        registry.add(12).unwrap();
        assert_eq!(registry.capacity(), 32);
        // All previous IDs survive the rehash.
        for id in 1..=12u64 {
            assert!(registry.contains(id), "id {id} lost in resize");
        }
    }

    #[test]
    fn test_next_id_monotonic_and_nonzero() {
        let registry = PendingRegistry::new();
        let a = registry.next_id();
        let b = registry.next_id();
        let c = registry.next_id();
        assert!(a < b && b < c);
        assert_ne!(a, 0);
    }

    #[tokio::test]
    async fn test_complete_wakes_waiter_with_result() {
        let registry = PendingRegistry::new();
        let waiter = registry.add(3).unwrap();
        assert!(registry.complete(3, Ok(serde_json::json!({"ok": 1}))));
        let value = registry.wait(waiter, Duration::from_secs(1)).await.unwrap();
        assert_eq!(value["ok"], 1);
        assert_eq!(registry.count(), 0, "entry removed after wait");
    }

    #[tokio::test]
    async fn test_peer_error_surfaces_as_rpc_error() {
        let registry = PendingRegistry::new();
        let waiter = registry.add(4).unwrap();
        registry.complete(
            4,
            Err(JsonRpcError {
                code: -32601,
                message: "Method not found".to_string(),
                data: None,
            }),
        );
        let err = registry.wait(waiter, Duration::from_secs(1)).await.unwrap_err();
        match as_mcpgate_error(&err) {
            Some(McpgateError::Rpc { code, .. }) => assert_eq!(*code, -32601),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_reports_timeout() {
        let registry = PendingRegistry::new();
        let baseline = registry.count();
        let waiter = registry.add(6).unwrap();

        let start = std::time::Instant::now();
        let err = registry
            .wait(waiter, Duration::from_millis(200))
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(as_mcpgate_error(&err).unwrap().is_timeout());
        assert!(
            elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300),
            "timeout fired at {elapsed:?}"
        );
        assert_eq!(registry.count(), baseline, "count returns to baseline");
        // Late completion after the timeout is dropped, not delivered.
        assert!(!registry.complete(6, Ok(serde_json::Value::Null)));
    }

    #[tokio::test]
    async fn test_drain_releases_all_waiters() {
        let registry = std::sync::Arc::new(PendingRegistry::new());
        let waiter = registry.add(8).unwrap();

        let reg = std::sync::Arc::clone(&registry);
        let task = tokio::spawn(async move { reg.wait(waiter, Duration::from_secs(10)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.drain();

        let outcome = task.await.unwrap();
        let err = outcome.unwrap_err();
        assert!(as_mcpgate_error(&err).unwrap().is_shutdown());
        assert!(registry.add(99).is_err(), "drained registry rejects adds");
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let registry = std::sync::Arc::new(PendingRegistry::new());
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = std::sync::Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let id = reg.next_id();
                let waiter = reg.add(id).unwrap();
                // Completion arrives from "the dispatcher" shortly after.
                let completer = std::sync::Arc::clone(&reg);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    completer.complete(id, Ok(serde_json::json!({ "echo": id })));
                });
                let value = reg.wait(waiter, Duration::from_secs(2)).await.unwrap();
                assert_eq!(value["echo"], id);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_send_and_wait_write_failure_removes_entry() {
        let registry = PendingRegistry::new();
        let id = registry.next_id();
        let waiter = registry.add(id).unwrap();

        // A closed duplex pipe makes the framed write fail.
        let (mut a, b) = tokio::io::duplex(8);
        drop(b);
        // Fill then close: first write errors because the peer is gone.
        let err = registry
            .send_and_wait(&mut a, b"payload", waiter, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(as_mcpgate_error(&err).is_some());
        assert_eq!(registry.count(), 0, "entry removed after failed send");
    }
}
