//! Per-backend TCP connection pool
//!
//! Maintains warm connections to one backend with an MRU idle list,
//! health scoring, idle expiry, and a background maintenance task. The
//! gateway borrows a connection per forwarded request and returns it with
//! a validity verdict; invalid connections are closed and their capacity
//! slot handed to the next waiter.
//!
//! # Accounting
//!
//! `total == idle + active` at every observation point, and `total` never
//! exceeds the configured maximum. A connection is owned by exactly one
//! place at a time: the idle list, a borrower, or the maintenance task
//! mid-probe (counted as active). Blocking I/O (connects and probes)
//! always happens with the state mutex released; the affected capacity is
//! reserved first (`total` pre-incremented, or the entry moved out of the
//! idle list) so other tasks observe consistent counts.
//!
//! Address resolution goes through the process-wide [`DnsCache`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::dns::DnsCache;
use crate::error::{McpgateError, Result};

/// Cadence of the background maintenance task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum idle connections probed per maintenance pass.
const HEALTH_CHECK_BATCH: usize = 16;

/// Probes slower than this are logged.
const SLOW_PROBE_THRESHOLD: Duration = Duration::from_millis(100);

/// Immutable pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backend host name or address.
    pub host: String,
    /// Backend port.
    pub port: u16,
    /// Connections the maintenance task keeps warm.
    pub min_connections: usize,
    /// Hard cap on live connections.
    pub max_connections: usize,
    /// Idle connections older than this are closed; zero disables expiry.
    pub idle_timeout: Duration,
    /// Deadline for one connect attempt.
    pub connect_timeout: Duration,
    /// Idle connections unprobed for longer than this are health checked;
    /// zero disables background probes.
    pub health_check_interval: Duration,
    /// Deadline for one probe.
    pub health_check_timeout: Duration,
    /// Probe a connection before lending it out.
    pub health_check_on_borrow: bool,
}

impl PoolConfig {
    /// Config with production defaults for the given backend.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            min_connections: 0,
            max_connections: 8,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_millis(500),
            health_check_on_borrow: false,
        }
    }
}

/// One pooled TCP connection with its health bookkeeping.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    created_at: Instant,
    last_used_at: Instant,
    last_health_check_at: Instant,
    health_score: i32,
    use_count: u32,
}

impl PooledConnection {
    fn new(stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            stream,
            created_at: now,
            last_used_at: now,
            last_health_check_at: now,
            health_score: 100,
            use_count: 0,
        }
    }

    /// The underlying stream, for framed I/O by the borrower.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Current health score in `[0, 100]`.
    pub fn health_score(&self) -> i32 {
        self.health_score
    }

    /// Number of times this connection has been lent out.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Age since creation.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Passing probe: recover toward 100, faster for well-used connections.
    fn record_probe_success(&mut self) {
        self.health_score = score_after_pass(self.health_score, self.use_count);
    }

    /// Failing probe: proportional penalty, floored at 10, softened 20%
    /// for connections with a usage track record.
    fn record_probe_failure(&mut self) {
        self.health_score = score_after_fail(self.health_score, self.use_count);
    }

    /// Eviction threshold: 50, with a 5-point grace window for
    /// connections used more than 20 times.
    fn is_unhealthy(&self) -> bool {
        let threshold = if self.use_count > 20 { 45 } else { 50 };
        self.health_score <= threshold
    }
}

/// Monotonic observability counters.
#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    gets: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    wait_ms: AtomicU64,
}

/// Point-in-time snapshot returned by [`ConnectionPool::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
    /// `get` calls issued.
    pub gets: u64,
    /// `get` calls that expired waiting.
    pub timeouts: u64,
    /// Connect or resolution failures.
    pub errors: u64,
    /// Cumulative milliseconds spent inside `get`.
    pub total_wait_ms: u64,
    /// Idle connections right now.
    pub idle: usize,
    /// Lent-out (or mid-probe) connections right now.
    pub active: usize,
    /// Live connections right now.
    pub total: usize,
}

struct PoolState {
    /// Front is most recently used; back is the eviction end.
    idle: VecDeque<PooledConnection>,
    active_count: usize,
    total_count: usize,
    shutting_down: bool,
}

struct PoolShared {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// Wakes one `get` waiter per released slot or idle connection.
    available: Notify,
    shutdown: CancellationToken,
    counters: PoolCounters,
    maintenance: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PoolShared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pool of live connections to one backend.
///
/// Cloning is cheap and shares the same pool. Must be constructed inside
/// a Tokio runtime (the maintenance task is spawned at construction).
///
/// # Examples
///
/// ```no_run
/// use mcpgate::pool::{ConnectionPool, PoolConfig};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let pool = ConnectionPool::new(PoolConfig::new("backend.local", 9100));
/// let conn = pool.get(Duration::from_secs(1)).await?;
/// // ... framed request/response on conn.stream_mut() ...
/// pool.release(conn, true);
/// pool.destroy().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock_state();
        f.debug_struct("ConnectionPool")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("idle", &state.idle.len())
            .field("active", &state.active_count)
            .field("total", &state.total_count)
            .finish()
    }
}

impl ConnectionPool {
    /// Create the pool and spawn its maintenance task.
    pub fn new(config: PoolConfig) -> Self {
        let shared = Arc::new(PoolShared {
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active_count: 0,
                total_count: 0,
                shutting_down: false,
            }),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
            counters: PoolCounters::default(),
            maintenance: tokio::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(maintenance_loop(Arc::clone(&shared)));
        // The task handle is stored for destroy() to join. try_lock cannot
        // contend here: no other reference to `shared` exists yet.
        if let Ok(mut guard) = shared.maintenance.try_lock() {
            *guard = Some(handle);
        }

        Self { shared }
    }

    /// Borrow a connection, waiting up to `timeout` for one to free up.
    ///
    /// Preference order: most recently used idle connection, then a fresh
    /// connect while under the cap, then a bounded wait for a release.
    /// `get(Duration::ZERO)` against a saturated pool fails immediately
    /// without performing I/O.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Shutdown`] after [`destroy`](Self::destroy),
    /// [`McpgateError::Timeout`] on deadline expiry, and
    /// [`McpgateError::Transport`] when a connect attempt fails and no
    /// slot frees before the deadline.
    pub async fn get(&self, timeout: Duration) -> Result<PooledConnection> {
        let started = Instant::now();
        self.shared.counters.gets.fetch_add(1, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + timeout;
        let result = self.get_inner(deadline).await;
        self.shared
            .counters
            .wait_ms
            .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
        result
    }

    async fn get_inner(&self, deadline: tokio::time::Instant) -> Result<PooledConnection> {
        enum Step {
            Borrowed(PooledConnection),
            Create,
            Wait,
        }

        let config = &self.shared.config;
        loop {
            let step = {
                let mut state = self.shared.lock_state();
                if state.shutting_down {
                    return Err(McpgateError::Shutdown(format!(
                        "pool for {}:{} destroyed",
                        config.host, config.port
                    ))
                    .into());
                }

                let mut borrowed = None;
                while let Some(conn) = state.idle.pop_front() {
                    if !config.idle_timeout.is_zero()
                        && conn.last_used_at.elapsed() > config.idle_timeout
                    {
                        state.total_count -= 1;
                        self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    borrowed = Some(conn);
                    break;
                }

                match borrowed {
                    Some(conn) => {
                        state.active_count += 1;
                        Step::Borrowed(conn)
                    }
                    None if state.total_count < config.max_connections => {
                        // Reserve the slot before connecting unlocked.
                        state.total_count += 1;
                        Step::Create
                    }
                    None => Step::Wait,
                }
            };

            match step {
                Step::Borrowed(mut conn) => {
                    if config.health_check_on_borrow {
                        let healthy =
                            probe_connection(&mut conn, config.health_check_timeout).await;
                        conn.last_health_check_at = Instant::now();
                        if healthy {
                            conn.record_probe_success();
                        } else {
                            conn.record_probe_failure();
                        }
                        if !healthy || conn.is_unhealthy() {
                            let mut state = self.shared.lock_state();
                            state.active_count -= 1;
                            state.total_count -= 1;
                            self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                            drop(state);
                            self.shared.available.notify_one();
                            continue;
                        }
                    }
                    conn.use_count += 1;
                    conn.last_used_at = Instant::now();
                    return Ok(conn);
                }
                Step::Create => match connect_backend(config).await {
                    Ok(mut conn) => {
                        let mut state = self.shared.lock_state();
                        if state.shutting_down {
                            state.total_count -= 1;
                            drop(state);
                            return Err(McpgateError::Shutdown(format!(
                                "pool for {}:{} destroyed",
                                config.host, config.port
                            ))
                            .into());
                        }
                        state.active_count += 1;
                        drop(state);
                        self.shared.counters.created.fetch_add(1, Ordering::Relaxed);
                        conn.use_count = 1;
                        conn.last_used_at = Instant::now();
                        return Ok(conn);
                    }
                    Err(e) => {
                        {
                            let mut state = self.shared.lock_state();
                            state.total_count -= 1;
                        }
                        self.shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                        self.shared.available.notify_one();
                        tracing::debug!(error = %e, "pool connect failed; waiting for a release");
                        // Fall through to the waiter path; the overall
                        // deadline governs the outcome from here.
                        if self.wait_available(deadline).await.is_err() {
                            self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                            return Err(McpgateError::Timeout(format!(
                                "no pooled connection to {}:{} within deadline",
                                config.host, config.port
                            ))
                            .into());
                        }
                    }
                },
                Step::Wait => {
                    if self.wait_available(deadline).await.is_err() {
                        self.shared.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                        return Err(McpgateError::Timeout(format!(
                            "no pooled connection to {}:{} within deadline",
                            config.host, config.port
                        ))
                        .into());
                    }
                }
            }
        }
    }

    /// Wait for a release/slot signal until `deadline`. A shutdown wake
    /// also returns `Ok`, letting the caller re-check `shutting_down`.
    async fn wait_available(
        &self,
        deadline: tokio::time::Instant,
    ) -> std::result::Result<(), ()> {
        if tokio::time::Instant::now() >= deadline {
            return Err(());
        }
        tokio::select! {
            _ = self.shared.available.notified() => Ok(()),
            _ = self.shared.shutdown.cancelled() => Ok(()),
            _ = tokio::time::sleep_until(deadline) => Err(()),
        }
    }

    /// Return a borrowed connection.
    ///
    /// `valid` connections go back to the MRU head; invalid ones are
    /// closed and their slot offered to the next waiter.
    pub fn release(&self, mut conn: PooledConnection, valid: bool) {
        {
            let mut state = self.shared.lock_state();
            state.active_count = state.active_count.saturating_sub(1);
            if valid && !state.shutting_down {
                conn.last_used_at = Instant::now();
                state.idle.push_front(conn);
            } else {
                state.total_count = state.total_count.saturating_sub(1);
                self.shared.counters.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.shared.available.notify_one();
    }

    /// Shut the pool down: drain idle connections, release all waiters
    /// with failure, and join the maintenance task. Idempotent.
    pub async fn destroy(&self) {
        {
            let mut state = self.shared.lock_state();
            state.shutting_down = true;
            let drained = state.idle.len();
            state.idle.clear();
            state.total_count -= drained;
            self.shared
                .counters
                .closed
                .fetch_add(drained as u64, Ordering::Relaxed);
        }
        self.shared.shutdown.cancel();
        self.shared.available.notify_waiters();

        let handle = self.shared.maintenance.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Snapshot of counters and live gauges.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        let c = &self.shared.counters;
        PoolStats {
            created: c.created.load(Ordering::Relaxed),
            closed: c.closed.load(Ordering::Relaxed),
            gets: c.gets.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            total_wait_ms: c.wait_ms.load(Ordering::Relaxed),
            idle: state.idle.len(),
            active: state.active_count,
            total: state.total_count,
        }
    }

    /// The configured backend host.
    pub fn host(&self) -> &str {
        &self.shared.config.host
    }

    /// The configured backend port.
    pub fn port(&self) -> u16 {
        self.shared.config.port
    }
}

/// Health score after a passing probe.
fn score_after_pass(score: i32, use_count: u32) -> i32 {
    let usage_bonus = (1.0 + f64::from(use_count) / 20.0).min(1.5);
    let gain = ((f64::from(100 - score) / 5.0) * usage_bonus).max(1.0) as i32;
    (score + gain).min(100)
}

/// Health score after a failing probe.
fn score_after_fail(score: i32, use_count: u32) -> i32 {
    let mut penalty = (score / 4).max(10);
    if use_count > 10 {
        penalty = penalty * 8 / 10;
    }
    (score - penalty).max(0)
}

/// Resolve and connect to the configured backend within its connect
/// timeout. The DNS reference taken for resolution is released before
/// returning.
async fn connect_backend(config: &PoolConfig) -> Result<PooledConnection> {
    let addrs = DnsCache::global().resolve(&config.host, config.port).await?;

    let attempt = async {
        let mut last_err: Option<std::io::Error> = None;
        for addr in &addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no address")))
    };

    let result = tokio::time::timeout(config.connect_timeout, attempt).await;
    DnsCache::global().release(&config.host, config.port);

    match result {
        Ok(Ok(stream)) => Ok(PooledConnection::new(stream)),
        Ok(Err(e)) => Err(McpgateError::Transport(format!(
            "connect to {}:{} failed: {e}",
            config.host, config.port
        ))
        .into()),
        Err(_) => Err(McpgateError::Timeout(format!(
            "connect to {}:{} exceeded {}ms",
            config.host,
            config.port,
            config.connect_timeout.as_millis()
        ))
        .into()),
    }
}

/// Liveness probe: wait for readability or error within `timeout`, then
/// peek one byte. EOF is unhealthy, pending data or a quiet socket is
/// healthy.
async fn probe_connection(conn: &mut PooledConnection, timeout: Duration) -> bool {
    let started = Instant::now();

    let healthy = match tokio::time::timeout(timeout, conn.stream.ready(Interest::READABLE)).await
    {
        // Nothing arrived within the window: the socket is quiet but open.
        Err(_elapsed) => true,
        Ok(Err(_)) => false,
        Ok(Ok(ready)) => {
            if ready.is_read_closed() {
                false
            } else {
                let mut buf = [0u8; 1];
                match conn.stream.peek(&mut buf).await {
                    Ok(0) => false,
                    Ok(_) => true,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
                    Err(_) => false,
                }
            }
        }
    };

    let elapsed = started.elapsed();
    if elapsed > SLOW_PROBE_THRESHOLD {
        tracing::warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            healthy,
            "slow connection probe"
        );
    }
    healthy
}

/// Background maintenance: idle expiry, batched health probes, and
/// min-connection top-up, every [`MAINTENANCE_INTERVAL`].
async fn maintenance_loop(shared: Arc<PoolShared>) {
    let config = shared.config.clone();
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
        }

        // Close idle-expired connections from the LRU end.
        if !config.idle_timeout.is_zero() {
            let mut state = shared.lock_state();
            if state.shutting_down {
                break;
            }
            while let Some(last) = state.idle.back() {
                if last.last_used_at.elapsed() > config.idle_timeout {
                    state.idle.pop_back();
                    state.total_count -= 1;
                    shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                } else {
                    break;
                }
            }
        }

        // Probe a batch of idle connections that are due. Entries are
        // pulled out of the idle list (counted active) so the probe I/O
        // happens without the lock.
        if !config.health_check_interval.is_zero() {
            let mut due = Vec::new();
            {
                let mut state = shared.lock_state();
                let mut index = 0;
                while index < state.idle.len() && due.len() < HEALTH_CHECK_BATCH {
                    let is_due = state.idle[index].last_health_check_at.elapsed()
                        > config.health_check_interval;
                    if is_due {
                        if let Some(conn) = state.idle.remove(index) {
                            state.active_count += 1;
                            due.push(conn);
                        }
                    } else {
                        index += 1;
                    }
                }
            }

            for mut conn in due {
                let healthy = probe_connection(&mut conn, config.health_check_timeout).await;
                conn.last_health_check_at = Instant::now();
                if healthy {
                    conn.record_probe_success();
                } else {
                    conn.record_probe_failure();
                }

                let mut state = shared.lock_state();
                state.active_count -= 1;
                if !healthy && conn.is_unhealthy() {
                    state.total_count -= 1;
                    shared.counters.closed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        score = conn.health_score,
                        use_count = conn.use_count,
                        "removing unhealthy pooled connection"
                    );
                } else {
                    state.idle.push_back(conn);
                }
            }
        }

        // Top up to the configured minimum.
        loop {
            let reserve = {
                let mut state = shared.lock_state();
                if state.shutting_down {
                    break;
                }
                if state.total_count < config.min_connections {
                    state.total_count += 1;
                    true
                } else {
                    false
                }
            };
            if !reserve {
                break;
            }
            match connect_backend(&config).await {
                Ok(conn) => {
                    let mut state = shared.lock_state();
                    if state.shutting_down {
                        state.total_count -= 1;
                        break;
                    }
                    state.idle.push_back(conn);
                    drop(state);
                    shared.counters.created.fetch_add(1, Ordering::Relaxed);
                    shared.available.notify_one();
                }
                Err(e) => {
                    let mut state = shared.lock_state();
                    state.total_count -= 1;
                    drop(state);
                    shared.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(error = %e, "pool top-up connect failed");
                    break;
                }
            }
        }
    }
}
