//! The acquire/return state machine (`spec.md` §4, §5).
//!
//! This is the pool core: [`Pool`] is a thin `Arc<PoolInner>` handle (same
//! split the teacher uses for its own `Pool<T, K>`/`PoolInner<T, K>`); the
//! locked state lives in [`Shared`], guarded by one `std::sync::Mutex` whose
//! critical sections never cross an `.await` that could block on I/O
//! (`spec.md` §5, "Suspension points"). Idle sockets live in an arena
//! (`Shared::idle_entries`, keyed by a monotonic id) referenced from both a
//! pool-wide ordered set and each target's own deque, instead of the
//! source's intrusive linked lists (`spec.md` §9, "arena with stable
//! indices").

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use futures_util::future::{self, Either};
use http::Uri;

use crate::balance::Balancer;
use crate::common::{exec, Exec, Timer, WeakOpt};
use crate::connect::{Connect, PeekResult, PoolableConnection, Resolve};
use crate::error::Error;
use crate::target::{SockKind, Target, TargetKind};

/// Pool-wide configuration (`spec.md` §3 Pool fields).
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Default 2000ms per `spec.md` §3. Zero disables keep-alive
    /// (`can_keepalive` becomes `false`, and the expirer never reaps
    /// anything because nothing is ever kept).
    pub idle_timeout: Duration,
    /// Advisory upper bound on total connections. Stored, never consulted
    /// by `acquire` (`spec.md` §9, "Open question — capacity"). `None`
    /// means "no advertised limit".
    pub capacity: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            idle_timeout: Duration::from_millis(2000),
            capacity: None,
        }
    }
}

/// One idle, exported connection plus bookkeeping (`spec.md` §3 PoolEntry).
struct PoolEntry<Conn> {
    conn: Conn,
    target_index: usize,
    added_at: Instant,
}

/// The mutex-guarded state: target list, idle arena, and the two orderings
/// over it (`spec.md` §3 Pool fields `all_idle`/per-target `idle_list`).
struct Shared<Conn, C> {
    targets: Vec<Arc<Target<C>>>,
    /// Global-pool find-or-add index, keyed by scheme+host+port
    /// (`spec.md` §4.2). Empty and unused for a non-global pool.
    target_keys: HashMap<crate::target::TargetKey, usize>,
    /// Ordered by insertion id, which is also insertion *time* order since
    /// a single id counter is handed out under this same mutex at the
    /// moment each entry is created (I6).
    all_idle: BTreeSet<u64>,
    idle_entries: HashMap<u64, PoolEntry<Conn>>,
    /// Per target, MRU at the back (`spec.md` §4.4: "pop the tail-most
    /// entry"); the expirer instead walks `all_idle` from the front, but
    /// because both orderings agree on relative time order, an id at the
    /// front of `all_idle` is always also at the front of its own target's
    /// deque (see `DESIGN.md`).
    target_idle: Vec<VecDeque<u64>>,
    next_id: u64,
}

impl<Conn, C> Shared<Conn, C> {
    fn pop_target_idle(&mut self, target_index: usize) -> Option<PoolEntry<Conn>> {
        let id = self.target_idle[target_index].pop_back()?;
        self.all_idle.remove(&id);
        Some(
            self.idle_entries
                .remove(&id)
                .expect("id present in both the deque and the arena"),
        )
    }
}

struct PoolInner<Conn, B, C> {
    shared: Mutex<Shared<Conn, C>>,
    /// Mirrors `len(all_idle)` plus outstanding reservations (I2). Not
    /// covered by `shared`'s mutex — advisory/observability only, per
    /// `spec.md` §5 "Atomicity".
    total_idle_count: AtomicUsize,
    is_global: bool,
    idle_timeout: Duration,
    #[allow(dead_code)] // stored per spec.md §9 "Open question — capacity", never read
    capacity: Option<usize>,
    balancer: B,
    connect: Arc<dyn Connect<Conn>>,
    resolve: Arc<dyn Resolve>,
    exec: Exec,
    /// `Some` iff an event loop (here: an executor + timer) has been
    /// registered (`spec.md` §4.3). Dropping the sender tells the running
    /// `Expirer` task to stop, same mechanic as the teacher's
    /// `idle_interval_ref`.
    expirer: Mutex<Option<oneshot::Sender<Infallible>>>,
    _config: PhantomData<C>,
}

impl<Conn, B, C> PoolInner<Conn, B, C>
where
    Conn: PoolableConnection,
    B: Balancer<C>,
    C: Send + Sync + 'static,
{
    /// Run a full expiry pass (`spec.md` §4.3) with the mutex already held.
    /// Called opportunistically from `acquire` (Phase A) and `return`
    /// (§4.6), and from the periodic `Expirer` task under its try-lock.
    fn expire_locked(&self, shared: &mut Shared<Conn, C>) {
        if self.idle_timeout.is_zero() {
            return;
        }
        let now = Instant::now();
        loop {
            let Some(&id) = shared.all_idle.iter().next() else {
                break;
            };
            let age = now.saturating_duration_since(shared.idle_entries[&id].added_at);
            if age < self.idle_timeout {
                break;
            }
            shared.all_idle.remove(&id);
            let entry = shared
                .idle_entries
                .remove(&id)
                .expect("id present in the arena");
            let front = shared.target_idle[entry.target_index].pop_front();
            debug_assert_eq!(front, Some(id), "expired id must be its target's oldest entry");
            self.total_idle_count.fetch_sub(1, Ordering::Relaxed);
            trace!(target_index = entry.target_index, age_ms = age.as_millis() as u64, "idle connection expired");
        }
    }

    fn lookup_or_add(&self, shared: &mut Shared<Conn, C>, url: &Uri) -> Result<usize, Error> {
        let key = crate::target::TargetKey::from_uri(url).ok_or(Error::ConnectionFailed)?;
        if let Some(&idx) = shared.target_keys.get(&key) {
            return Ok(idx);
        }
        let target = Target::new(url.clone(), None)?;
        let idx = shared.targets.len();
        shared.targets.push(Arc::new(target));
        shared.target_idle.push(VecDeque::new());
        shared.target_keys.insert(key, idx);
        Ok(idx)
    }

    /// `spec.md` §4.6 return: decrement `request_count` unconditionally
    /// (every checked-out socket's `on_close` fires exactly once, I3), then
    /// either drop the dead connection (and release its `total_idle_count`
    /// reservation, also per I3) or reinsert it as a fresh idle entry
    /// (`total_idle_count` is *not* touched here — it was reserved back in
    /// Phase B and stays reserved until this entry eventually dies).
    fn on_return(&self, target_index: usize, conn: Conn) {
        {
            let shared = self.shared.lock().unwrap();
            if let Some(target) = shared.targets.get(target_index) {
                target.request_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if !conn.is_open() {
            self.total_idle_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        self.expire_locked(&mut shared);
        let id = shared.next_id;
        shared.next_id += 1;
        shared.idle_entries.insert(
            id,
            PoolEntry {
                conn,
                target_index,
                added_at: Instant::now(),
            },
        );
        shared.all_idle.insert(id);
        shared.target_idle[target_index].push_back(id);
    }
}

/// Process-wide, once-per-reason warnings for dead/dirty idle sockets
/// (`spec.md` §9, "Global state").
static WARN_PEER_CLOSED: std::sync::Once = std::sync::Once::new();
static WARN_UNEXPECTED_DATA: std::sync::Once = std::sync::Once::new();

fn warn_peer_closed() {
    WARN_PEER_CLOSED.call_once(|| {
        warn!("idle connection was closed by the peer; discarding (further occurrences of this will not be logged)");
    });
}

fn warn_unexpected_data(target_index: usize) {
    let _ = target_index;
    WARN_UNEXPECTED_DATA.call_once(|| {
        warn!("idle connection had unexpected data queued; discarding (further occurrences of this will not be logged)");
    });
}

/// The live state machine for one outstanding `acquire` call (`spec.md`
/// §4.4). Modeled as a loop rather than the source's mutually recursive
/// `try_connect`/`on_connect` to keep stack depth bounded across many
/// target retries (`spec.md` §9, "Callback control flow").
///
/// Returns `None` if `cancel_rx` fired before completion — the caller must
/// not invoke its `on_done` callback in that case (`spec.md` §4.4
/// "Cancel").
async fn run_acquire<Conn, B, C>(
    inner: Arc<PoolInner<Conn, B, C>>,
    url: Uri,
    lb_extra: B::Extra,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Option<Result<(Conn, usize), Error>>
where
    Conn: PoolableConnection,
    B: Balancer<C>,
    C: Send + Sync + 'static,
{
    // Phase A — target resolution, under mutex, briefly.
    let (mut selected, mut tried, mut remaining_tries) = {
        let mut shared = inner.shared.lock().unwrap();
        inner.expire_locked(&mut shared);
        if inner.is_global {
            match inner.lookup_or_add(&mut shared, &url) {
                Ok(idx) => (Some(idx), None, 1usize),
                Err(e) => return Some(Err(e)),
            }
        } else if shared.targets.len() == 1 {
            (Some(0), None, 1usize)
        } else {
            let n = shared.targets.len();
            (None, Some(vec![false; n]), n)
        }
    };

    loop {
        // Phase B — try_connect: pick a target (if not already fixed),
        // then drain its idle list looking for a live socket.
        if remaining_tries == 0 {
            return Some(Err(Error::ConnectionFailed));
        }
        remaining_tries -= 1;

        let via_balancer;
        let (target_idx, mut popped) = {
            let mut shared = inner.shared.lock().unwrap();
            let target_idx = match selected {
                Some(i) => {
                    via_balancer = false;
                    i
                }
                None => {
                    let tried_ref = tried.as_ref().expect("sentinel selection implies a tried-set");
                    let i = inner.balancer.select(&shared.targets, tried_ref, &lb_extra);
                    tried.as_mut().unwrap()[i] = true;
                    shared.targets[i].request_count.fetch_add(1, Ordering::Relaxed);
                    via_balancer = true;
                    i
                }
            };
            selected = Some(target_idx);
            let popped = shared.pop_target_idle(target_idx);
            (target_idx, popped)
        };

        loop {
            let Some(entry) = popped else { break };
            // `poll_peek` returning `None` means the probe isn't supported
            // for this connection type; fall back to trusting `is_open`
            // (`connect::PoolableConnection::poll_peek` contract).
            let alive = match entry.conn.poll_peek() {
                Some(PeekResult::Alive) => true,
                Some(PeekResult::Eof) => {
                    warn_peer_closed();
                    false
                }
                Some(PeekResult::UnexpectedData) => {
                    warn_unexpected_data(target_idx);
                    false
                }
                None => entry.conn.is_open(),
            };
            if alive {
                trace!(target_index = target_idx, "reusing idle connection");
                return Some(Ok((entry.conn, target_idx)));
            }
            inner.total_idle_count.fetch_sub(1, Ordering::Relaxed);
            drop(entry);
            let mut shared = inner.shared.lock().unwrap();
            popped = shared.pop_target_idle(target_idx);
        }

        // Reserve a slot for the fresh connect attempt about to start.
        inner.total_idle_count.fetch_add(1, Ordering::Relaxed);

        let target = {
            let shared = inner.shared.lock().unwrap();
            shared.targets[target_idx].clone()
        };

        // A cancellation here must release what this attempt reserved:
        // in the source, canceling an in-flight connect closes the
        // partial socket, which fires `on_close` and does this same
        // release; dropping the losing future on our side has no socket
        // to fire a hook on, so the release happens here instead.
        macro_rules! release_on_cancel {
            () => {{
                inner.total_idle_count.fetch_sub(1, Ordering::Relaxed);
                if via_balancer {
                    target.request_count.fetch_sub(1, Ordering::Relaxed);
                }
                return None;
            }};
        }

        let connect_result: io::Result<Conn> = match &target.kind {
            TargetKind::Named { host, port } => {
                let resolve_fut = Box::pin(inner.resolve.resolve(host, port));
                match future::select(resolve_fut, &mut cancel_rx).await {
                    Either::Right(_) => release_on_cancel!(),
                    Either::Left((Err(e), _)) => {
                        // Phase C: DNS failure is a hard error on this
                        // target; not retried (`spec.md` §4.4 Phase C).
                        if via_balancer {
                            target.request_count.fetch_sub(1, Ordering::Relaxed);
                        }
                        inner.total_idle_count.fetch_sub(1, Ordering::Relaxed);
                        return Some(Err(Error::Resolve(Box::new(e))));
                    }
                    Either::Left((Ok(addrs), _)) => match inner.resolve.select_one(&addrs) {
                        Some(addr) => {
                            let connect_fut = Box::pin(inner.connect.connect_inet(addr));
                            match future::select(connect_fut, &mut cancel_rx).await {
                                Either::Left((r, _)) => r,
                                Either::Right(_) => release_on_cancel!(),
                            }
                        }
                        // Phase D: nothing to dial means the connect could
                        // never even be initiated, same category as the
                        // source's synchronous "failed to allocate a
                        // socket" — complete directly, no target fallback
                        // (`spec.md` §4.4 Phase D).
                        None => {
                            if via_balancer {
                                target.request_count.fetch_sub(1, Ordering::Relaxed);
                            }
                            inner.total_idle_count.fetch_sub(1, Ordering::Relaxed);
                            return Some(Err(Error::FailedToConnect(io::Error::new(
                                io::ErrorKind::NotFound,
                                "resolver returned no addresses",
                            ))));
                        }
                    },
                }
            }
            TargetKind::Sockaddr(SockKind::Inet(addr)) => {
                let connect_fut = Box::pin(inner.connect.connect_inet(*addr));
                match future::select(connect_fut, &mut cancel_rx).await {
                    Either::Left((r, _)) => r,
                    Either::Right(_) => release_on_cancel!(),
                }
            }
            TargetKind::Sockaddr(SockKind::Unix(path)) => {
                let connect_fut = Box::pin(inner.connect.connect_unix(path.clone()));
                match future::select(connect_fut, &mut cancel_rx).await {
                    Either::Left((r, _)) => r,
                    Either::Right(_) => release_on_cancel!(),
                }
            }
        };

        match connect_result {
            Ok(conn) => return Some(Ok((conn, target_idx))),
            Err(e) => {
                // Phase E failure: reverse the balancer's reservation and
                // this attempt's slot, then fall back to another target
                // if any tries remain.
                if via_balancer {
                    target.request_count.fetch_sub(1, Ordering::Relaxed);
                }
                inner.total_idle_count.fetch_sub(1, Ordering::Relaxed);
                trace!(target_index = target_idx, error = %e, "connect attempt failed");
                if remaining_tries > 0 {
                    selected = None;
                    continue;
                }
                return Some(Err(Error::ConnectionFailed));
            }
        }
    }
}

/// Handle returned by [`Pool::acquire`]; may be used to cancel the
/// in-flight attempt (`spec.md` §4.4 "Cancel").
pub struct AcquireHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl AcquireHandle {
    /// Cancels the pending acquire. No-op if the acquire already
    /// completed. The caller's `on_done` will not be invoked afterward.
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl fmt::Debug for AcquireHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcquireHandle").finish()
    }
}

/// A checked-out connection. Reinserts itself into the pool on `Drop` if
/// still open (`spec.md` §4.6 `return`); this is the idiomatic-Rust
/// rendition of the spec's explicit `return_socket` call, the same RAII
/// shape the teacher's own `Pooled<T, K>` uses.
pub struct Pooled<Conn: PoolableConnection, B: Balancer<C>, C> {
    conn: Option<Conn>,
    target_index: usize,
    pool: WeakOpt<PoolInner<Conn, B, C>>,
}

impl<Conn: PoolableConnection, B: Balancer<C>, C> Pooled<Conn, B, C> {
    /// Index of the target this connection was established against.
    pub fn target_index(&self) -> usize {
        self.target_index
    }

    /// Explicit rendition of the spec's `return_socket`: drops `self`
    /// immediately rather than waiting for Rust's ordinary scope-based
    /// `Drop`. Always succeeds in this implementation — unlike the
    /// source, Rust's async socket types need no export/re-import dance
    /// around an event loop, so there is no analogue of the source's
    /// export-failure error path (see `DESIGN.md`).
    pub fn return_to_pool(self) {
        drop(self);
    }
}

impl<Conn: PoolableConnection, B: Balancer<C>, C> Deref for Pooled<Conn, B, C> {
    type Target = Conn;
    fn deref(&self) -> &Conn {
        self.conn.as_ref().expect("not dropped")
    }
}

impl<Conn: PoolableConnection, B: Balancer<C>, C> DerefMut for Pooled<Conn, B, C> {
    fn deref_mut(&mut self) -> &mut Conn {
        self.conn.as_mut().expect("not dropped")
    }
}

impl<Conn, B, C> Drop for Pooled<Conn, B, C>
where
    Conn: PoolableConnection,
    B: Balancer<C>,
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        inner.on_return(self.target_index, conn);
    }
}

impl<Conn: PoolableConnection + fmt::Debug, B: Balancer<C>, C> fmt::Debug for Pooled<Conn, B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("target_index", &self.target_index)
            .field("conn", &self.conn)
            .finish()
    }
}

/// The periodic idle-trimmer (`spec.md` §4.3). One instance runs per
/// registered loop; a `try_lock` discipline means a busy pool just skips a
/// tick rather than blocking whatever thread the timer fires on.
struct Expirer<Conn, B, C> {
    inner: Arc<PoolInner<Conn, B, C>>,
    timer: Timer,
    period: Duration,
    drop_rx: oneshot::Receiver<Infallible>,
}

impl<Conn, B, C> Expirer<Conn, B, C>
where
    Conn: PoolableConnection,
    B: Balancer<C> + 'static,
    C: Send + Sync + 'static,
{
    async fn run(self) {
        use hyper::rt::Timer as _;

        let mut sleep = self.timer.sleep(self.period);
        let mut drop_rx = self.drop_rx;
        loop {
            match future::select(&mut drop_rx, sleep).await {
                Either::Left(_) => break,
                Either::Right(((), _)) => {
                    if let Ok(mut shared) = self.inner.shared.try_lock() {
                        self.inner.expire_locked(&mut shared);
                    } else {
                        trace!("expirer tick skipped: pool mutex busy");
                    }
                    let deadline = Instant::now() + self.period;
                    sleep = self.timer.sleep(self.period);
                    let _ = deadline;
                }
            }
        }
        trace!("pool disposed, expirer stopping");
    }
}

/// A connection pool keyed by upstream [`Target`] (`spec.md` §3 Pool).
///
/// Generic over:
/// - `Conn`: the connection type handed out (default production use is
///   [`crate::connect::Conn`]; tests substitute a lightweight stub).
/// - `B`: the [`Balancer`] used to pick among targets when more than one
///   exists.
/// - `C`: the opaque per-target balancer configuration type (`spec.md`
///   §4.5).
pub struct Pool<Conn, B, C = ()>(Arc<PoolInner<Conn, B, C>>);

impl<Conn, B, C> Clone for Pool<Conn, B, C> {
    fn clone(&self) -> Self {
        Pool(self.0.clone())
    }
}

impl<Conn: PoolableConnection, B: Balancer<C>, C> fmt::Debug for Pool<Conn, B, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool").field("is_global", &self.0.is_global).finish()
    }
}

impl<Conn, B, C> Pool<Conn, B, C>
where
    Conn: PoolableConnection,
    B: Balancer<C>,
    C: Send + Sync + 'static,
{
    /// `spec.md` §6 `can_keepalive`.
    pub fn can_keepalive(&self) -> bool {
        !self.0.idle_timeout.is_zero()
    }

    /// Number of targets currently known to the pool. For a global pool
    /// this grows as new URLs are acquired (`spec.md` §4.2).
    pub fn target_count(&self) -> usize {
        self.0.shared.lock().unwrap().targets.len()
    }

    /// Advisory total-idle-plus-in-flight count (I2). Observability only.
    pub fn total_idle_count(&self) -> usize {
        self.0.total_idle_count.load(Ordering::Relaxed)
    }

    pub fn target(&self, index: usize) -> Option<Arc<Target<C>>> {
        self.0.shared.lock().unwrap().targets.get(index).cloned()
    }

    /// Registers a repeating 1000ms timer that trims expired idle entries
    /// (`spec.md` §4.3). A no-op if already registered.
    pub fn register_loop<T>(&self, timer: T, executor: impl hyper::rt::Executor<exec::BoxSendFuture> + Send + Sync + Clone + 'static)
    where
        T: hyper::rt::Timer + Send + Sync + Clone + 'static,
        B: 'static,
        Conn: 'static,
        C: 'static,
    {
        let mut guard = self.0.expirer.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        *guard = Some(tx);
        drop(guard);
        let task = Expirer {
            inner: self.0.clone(),
            timer: Timer::new(timer),
            period: Duration::from_millis(1000),
            drop_rx: rx,
        };
        Exec::new(executor).execute(task.run());
    }

    /// Unregisters the expirer, if any (`spec.md` §4.3). `dispose` calls
    /// this implicitly.
    pub fn unregister_loop(&self) {
        self.0.expirer.lock().unwrap().take();
    }

    /// `spec.md` §4.4 `acquire`. `lb_extra` is forwarded to the balancer's
    /// `select` for every attempt this acquire makes. `on_done` fires
    /// exactly once unless the returned handle is used to cancel first, in
    /// which case it never fires (`spec.md` §4.4 "Cancel").
    pub fn acquire(
        &self,
        url: Uri,
        lb_extra: B::Extra,
        on_done: impl FnOnce(Result<Pooled<Conn, B, C>, Error>) + Send + 'static,
    ) -> AcquireHandle
    where
        B: 'static,
        Conn: 'static,
        C: 'static,
    {
        let inner = self.0.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let fut = async move {
            let outcome = run_acquire(inner.clone(), url, lb_extra, cancel_rx).await;
            if let Some(result) = outcome {
                let result = result.map(|(conn, target_index)| Pooled {
                    conn: Some(conn),
                    target_index,
                    pool: WeakOpt::downgrade(&inner),
                });
                on_done(result);
            }
        };
        self.0.exec.execute(fut);
        AcquireHandle {
            cancel: Some(cancel_tx),
        }
    }

    /// `spec.md` §4.7 `dispose`: destroys every idle entry and stops the
    /// expirer. Targets and the balancer are freed by ordinary `Drop` once
    /// the last `Pool` handle (and every outstanding `Pooled`) goes away.
    pub fn dispose(&self) {
        let destroyed = {
            let mut shared = self.0.shared.lock().unwrap();
            let ids: Vec<u64> = shared.all_idle.iter().copied().collect();
            for &id in &ids {
                if let Some(entry) = shared.idle_entries.remove(&id) {
                    shared.target_idle[entry.target_index].retain(|&x| x != id);
                }
                shared.all_idle.remove(&id);
            }
            ids.len()
        };
        self.0.total_idle_count.fetch_sub(destroyed, Ordering::Relaxed);
        self.unregister_loop();
    }
}

/// Builds a [`Pool`] (`spec.md` §6 `init_specific`/`init_global`), mirroring
/// the teacher's `Config` + constructor split with the builder ergonomics
/// the rest of the pack's HTTP-client crates use (`SPEC_FULL.md` §4.2a).
pub struct PoolBuilder<Conn, B, C> {
    idle_timeout: Duration,
    capacity: Option<usize>,
    balancer: B,
    connect: Arc<dyn Connect<Conn>>,
    resolve: Arc<dyn Resolve>,
    exec: Exec,
    _marker: PhantomData<C>,
}

impl<Conn, B, C> PoolBuilder<Conn, B, C>
where
    Conn: PoolableConnection,
    B: Balancer<C>,
    C: Send + Sync + 'static,
{
    pub fn new<E>(balancer: B, connect: Arc<dyn Connect<Conn>>, resolve: Arc<dyn Resolve>, executor: E) -> Self
    where
        E: hyper::rt::Executor<exec::BoxSendFuture> + Send + Sync + Clone + 'static,
    {
        let config = Config::default();
        PoolBuilder {
            idle_timeout: config.idle_timeout,
            capacity: config.capacity,
            balancer,
            connect,
            resolve,
            exec: Exec::new(executor),
            _marker: PhantomData,
        }
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// `spec.md` §6 `init_specific`: a fixed target set, at least one
    /// target (I5).
    pub fn build_specific(self, targets: Vec<Target<C>>) -> Result<Pool<Conn, B, C>, Error> {
        if targets.is_empty() {
            return Err(Error::NoTargets);
        }
        let n = targets.len();
        Ok(Pool(Arc::new(PoolInner {
            shared: Mutex::new(Shared {
                targets: targets.into_iter().map(Arc::new).collect(),
                target_keys: HashMap::new(),
                all_idle: BTreeSet::new(),
                idle_entries: HashMap::new(),
                target_idle: (0..n).map(|_| VecDeque::new()).collect(),
                next_id: 0,
            }),
            total_idle_count: AtomicUsize::new(0),
            is_global: false,
            idle_timeout: self.idle_timeout,
            capacity: self.capacity,
            balancer: self.balancer,
            connect: self.connect,
            resolve: self.resolve,
            exec: self.exec,
            expirer: Mutex::new(None),
            _config: PhantomData,
        })))
    }

    /// `spec.md` §6 `init_global`: starts with no targets; they're added
    /// lazily on first `acquire` to a new URL (`spec.md` §4.2).
    pub fn build_global(self) -> Pool<Conn, B, C> {
        Pool(Arc::new(PoolInner {
            shared: Mutex::new(Shared {
                targets: Vec::new(),
                target_keys: HashMap::new(),
                all_idle: BTreeSet::new(),
                idle_entries: HashMap::new(),
                target_idle: Vec::new(),
                next_id: 0,
            }),
            total_idle_count: AtomicUsize::new(0),
            is_global: true,
            idle_timeout: self.idle_timeout,
            capacity: self.capacity,
            balancer: self.balancer,
            connect: self.connect,
            resolve: self.resolve,
            exec: self.exec,
            expirer: Mutex::new(None),
            _config: PhantomData,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::RoundRobin;
    use crate::connect::BoxFuture;
    use crate::rt::TokioExecutor;
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug)]
    struct StubConn {
        open: Arc<AtomicBool>,
        peek: Arc<Mutex<Option<PeekResult>>>,
    }

    impl StubConn {
        fn new() -> (Self, Arc<AtomicBool>, Arc<Mutex<Option<PeekResult>>>) {
            let open = Arc::new(AtomicBool::new(true));
            let peek = Arc::new(Mutex::new(Some(PeekResult::Alive)));
            (
                StubConn {
                    open: open.clone(),
                    peek: peek.clone(),
                },
                open,
                peek,
            )
        }
    }

    impl PoolableConnection for StubConn {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Relaxed)
        }

        fn poll_peek(&self) -> Option<PeekResult> {
            *self.peek.lock().unwrap()
        }
    }

    /// Each connect call pulls the next scripted outcome off a per-target
    /// queue; running dry panics (the test under-provisioned attempts).
    #[derive(Default)]
    struct ScriptedConnect {
        scripts: Mutex<HashMap<SocketAddr, VecDeque<io::Result<()>>>>,
        attempts: AtomicUsize,
    }

    impl ScriptedConnect {
        fn push(&self, addr: SocketAddr, outcome: io::Result<()>) {
            self.scripts.lock().unwrap().entry(addr).or_default().push_back(outcome);
        }
    }

    impl Connect<StubConn> for ScriptedConnect {
        fn connect_inet(&self, addr: SocketAddr) -> BoxFuture<io::Result<StubConn>> {
            self.attempts.fetch_add(1, Ordering::Relaxed);
            let outcome = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&addr)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(()));
            Box::pin(async move {
                outcome.map(|()| StubConn::new().0)
            })
        }

        fn connect_unix(&self, _path: PathBuf) -> BoxFuture<io::Result<StubConn>> {
            Box::pin(async { Ok(StubConn::new().0) })
        }
    }

    struct FailingResolve(String);

    impl Resolve for FailingResolve {
        fn resolve(&self, _host: &str, _port: &str) -> BoxFuture<io::Result<Vec<SocketAddr>>> {
            let msg = self.0.clone();
            Box::pin(async move { Err(io::Error::new(io::ErrorKind::NotFound, msg)) })
        }
    }

    struct NoopResolve;

    impl Resolve for NoopResolve {
        fn resolve(&self, _host: &str, _port: &str) -> BoxFuture<io::Result<Vec<SocketAddr>>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn target(addr: &str) -> Target<()> {
        Target::new(format!("http://{addr}").parse().unwrap(), None).unwrap()
    }

    async fn acquire_sync<Conn, B, C>(pool: &Pool<Conn, B, C>, url: Uri, lb_extra: B::Extra) -> Result<Pooled<Conn, B, C>, Error>
    where
        Conn: PoolableConnection + 'static,
        B: Balancer<C> + 'static,
        C: Send + Sync + 'static,
    {
        let (tx, rx) = futures_channel::oneshot::channel();
        pool.acquire(url, lb_extra, move |res| {
            let _ = tx.send(res);
        });
        rx.await.expect("on_done was dropped without firing")
    }

    #[tokio::test]
    async fn scenario_1_reuse_mru_socket_and_idle_count() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let connect = Arc::new(ScriptedConnect::default());
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect.clone(),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .idle_timeout(Duration::from_millis(2000))
        .build_specific(vec![target("127.0.0.1:8080")])
        .unwrap();

        let url: Uri = "http://127.0.0.1:8080".parse().unwrap();
        let pooled = acquire_sync(&pool, url.clone(), ()).await.unwrap();
        assert_eq!(pool.total_idle_count(), 0);
        let first_conn_ptr = &*pooled.open as *const AtomicBool;
        pooled.return_to_pool();

        assert_eq!(pool.total_idle_count(), 1);

        let reused = acquire_sync(&pool, url, ()).await.unwrap();
        assert_eq!(reused.open.as_ref() as *const AtomicBool, first_conn_ptr);
        assert_eq!(connect.attempts.load(Ordering::Relaxed), 1, "second acquire should not have dialed again");
    }

    #[tokio::test]
    async fn scenario_2_dns_failure_is_not_retried_and_leaves_counters_clean() {
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(FailingResolve("nxdomain".into())),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("example.invalid:80")])
        .unwrap();

        let url: Uri = "http://example.invalid:80".parse().unwrap();
        let err = acquire_sync(&pool, url, ()).await.unwrap_err();
        assert_eq!(err.to_string(), "nxdomain");
        assert_eq!(pool.total_idle_count(), 0);
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
    }

    #[tokio::test]
    async fn dns_failure_on_balancer_selected_target_reverses_request_count() {
        // Unlike `scenario_2_dns_failure_is_not_retried_and_leaves_counters_clean`
        // (a single-target pool, where `via_balancer` is always false), this
        // pool has two targets, so the balancer's selection bumps
        // `request_count` before DNS is even attempted (`spec.md` §4.4 Phase
        // B). That bump must be reversed on the DNS failure path too, not
        // just on the sibling "no resolved addresses" and connect-failure
        // paths.
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(FailingResolve("nxdomain".into())),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("example.invalid:80"), target("10.0.0.2:80")])
        .unwrap();

        let url: Uri = "http://whatever/".parse().unwrap();
        let err = acquire_sync(&pool, url, ()).await.unwrap_err();
        assert_eq!(err.to_string(), "nxdomain");
        assert_eq!(pool.total_idle_count(), 0);
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
        assert_eq!(pool.target(1).unwrap().request_count(), 0);
    }

    #[tokio::test]
    async fn named_target_with_no_resolved_addresses_fails_immediately_without_fallback() {
        // `spec.md` §4.4 Phase D: nothing to dial completes the callback
        // directly with "failed to connect to host" — it does not fall
        // back to the second target the way a Phase E connect failure
        // would (`scenario_3_fallback_to_second_target_on_connect_failure`).
        let connect = Arc::new(ScriptedConnect::default());
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect.clone(),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("example.invalid:80"), target("10.0.0.2:80")])
        .unwrap();

        let url: Uri = "http://whatever/".parse().unwrap();
        let err = acquire_sync(&pool, url, ()).await.unwrap_err();
        assert_eq!(err.to_string(), "failed to connect to host");
        assert_eq!(connect.attempts.load(Ordering::Relaxed), 0, "no fallback dial should have happened");
        assert_eq!(pool.total_idle_count(), 0);
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
    }

    #[tokio::test]
    async fn scenario_3_fallback_to_second_target_on_connect_failure() {
        let addr0: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let addr1: SocketAddr = "10.0.0.2:80".parse().unwrap();
        let connect = Arc::new(ScriptedConnect::default());
        connect.push(addr0, Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));

        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect,
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("10.0.0.1:80"), target("10.0.0.2:80")])
        .unwrap();

        let url: Uri = "http://whatever/".parse().unwrap();
        let pooled = acquire_sync(&pool, url, ()).await.unwrap();
        assert_eq!(pooled.target_index(), 1);
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
        assert_eq!(pool.target(1).unwrap().request_count(), 1);
    }

    #[tokio::test]
    async fn scenario_3b_all_targets_fail_surfaces_connection_failed() {
        let addr0: SocketAddr = "10.0.1.1:80".parse().unwrap();
        let addr1: SocketAddr = "10.0.1.2:80".parse().unwrap();
        let connect = Arc::new(ScriptedConnect::default());
        connect.push(addr0, Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));
        connect.push(addr1, Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")));

        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect,
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("10.0.1.1:80"), target("10.0.1.2:80")])
        .unwrap();

        let url: Uri = "http://whatever/".parse().unwrap();
        let err = acquire_sync(&pool, url, ()).await.unwrap_err();
        assert_eq!(err.to_string(), "connection failed");
        assert_eq!(pool.total_idle_count(), 0);
    }

    #[tokio::test]
    async fn scenario_4_global_pool_merges_case_differing_hosts() {
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_global();

        acquire_sync(&pool, "http://Host/".parse().unwrap(), ())
            .await
            .unwrap()
            .return_to_pool();
        acquire_sync(&pool, "http://host/".parse().unwrap(), ())
            .await
            .unwrap();

        assert_eq!(pool.target_count(), 1);
    }

    #[tokio::test]
    async fn scenario_5_dead_idle_socket_is_discarded_transparently() {
        let connect = Arc::new(ScriptedConnect::default());
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect.clone(),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("127.0.0.1:9")])
        .unwrap();

        let url: Uri = "http://127.0.0.1:9/".parse().unwrap();
        let pooled = acquire_sync(&pool, url.clone(), ()).await.unwrap();
        *pooled.peek.lock().unwrap() = Some(PeekResult::Eof);
        pooled.return_to_pool();

        let reconnected = acquire_sync(&pool, url, ()).await.unwrap();
        assert!(reconnected.is_open());
        assert_eq!(connect.attempts.load(Ordering::Relaxed), 2);
        assert_eq!(pool.total_idle_count(), 0);
    }

    #[tokio::test]
    async fn poll_peek_none_falls_back_to_is_open() {
        // `connect::PoolableConnection::poll_peek` is documented to return
        // `None` when the probe isn't supported, in which case the pool
        // must fall back to `is_open` rather than assuming the connection
        // is alive.
        let connect = Arc::new(ScriptedConnect::default());
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            connect.clone(),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("127.0.0.1:10")])
        .unwrap();

        let url: Uri = "http://127.0.0.1:10/".parse().unwrap();

        // `is_open() == true`, `poll_peek() == None`: still reused, no
        // redial. Flip `peek` to `None` only *after* returning, so
        // `on_return`'s own `is_open()` gate (a separate check, §4.6) still
        // sees `true` and actually reinserts the entry.
        let pooled = acquire_sync(&pool, url.clone(), ()).await.unwrap();
        let open = pooled.open.clone();
        let peek = pooled.peek.clone();
        pooled.return_to_pool();
        *peek.lock().unwrap() = None;

        let reused = acquire_sync(&pool, url.clone(), ()).await.unwrap();
        assert_eq!(connect.attempts.load(Ordering::Relaxed), 1, "is_open() == true should have been trusted");

        // `is_open() == false`, `poll_peek() == None`: discarded from the
        // idle list on the *next* acquire's pop-and-probe loop, and a fresh
        // connection is dialed instead.
        let open2 = reused.open.clone();
        let peek2 = reused.peek.clone();
        reused.return_to_pool();
        open2.store(false, Ordering::Relaxed);
        *peek2.lock().unwrap() = None;
        let _ = (open, peek);

        let redialed = acquire_sync(&pool, url, ()).await.unwrap();
        assert!(redialed.is_open());
        assert_eq!(connect.attempts.load(Ordering::Relaxed), 2, "is_open() == false should have been discarded");
        assert_eq!(pool.total_idle_count(), 0);
    }

    #[tokio::test]
    async fn scenario_6_cancel_before_connect_completes_invokes_no_callback() {
        struct NeverConnect;
        impl Connect<StubConn> for NeverConnect {
            fn connect_inet(&self, _addr: SocketAddr) -> BoxFuture<io::Result<StubConn>> {
                Box::pin(futures_util::future::pending())
            }
        }

        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(NeverConnect),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("127.0.0.1:1")])
        .unwrap();

        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let handle = pool.acquire("http://127.0.0.1:1/".parse().unwrap(), (), move |_| {
            called2.store(true, Ordering::Relaxed);
        });
        tokio::task::yield_now().await;
        handle.cancel();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert!(!called.load(Ordering::Relaxed));
        assert_eq!(pool.total_idle_count(), 0);
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
    }

    #[tokio::test]
    async fn idle_hit_does_not_bump_request_count() {
        // `spec.md` §9, "Open question — request_count on idle-hit":
        // reusing an idle socket on a single-target pool must not bump
        // `request_count`, but returning it always decrements — so the
        // counter can legitimately go negative. Pinned here deliberately.
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("127.0.0.1:7000")])
        .unwrap();

        let url: Uri = "http://127.0.0.1:7000/".parse().unwrap();
        let pooled = acquire_sync(&pool, url.clone(), ()).await.unwrap();
        assert_eq!(pool.target(0).unwrap().request_count(), 0);
        pooled.return_to_pool();
        assert_eq!(pool.target(0).unwrap().request_count(), -1);

        let reused = acquire_sync(&pool, url, ()).await.unwrap();
        assert_eq!(pool.target(0).unwrap().request_count(), -1);
        reused.return_to_pool();
        assert_eq!(pool.target(0).unwrap().request_count(), -2);
    }

    #[tokio::test]
    async fn expirer_empties_idle_list_after_timeout() {
        tokio::time::pause();
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .idle_timeout(Duration::from_millis(100))
        .build_specific(vec![target("127.0.0.1:6000")])
        .unwrap();

        pool.register_loop(crate::rt::TokioTimer::new(), TokioExecutor::new());

        let url: Uri = "http://127.0.0.1:6000/".parse().unwrap();
        acquire_sync(&pool, url, ()).await.unwrap().return_to_pool();
        assert_eq!(pool.total_idle_count(), 1);

        tokio::time::advance(Duration::from_millis(1300)).await;
        tokio::task::yield_now().await;

        assert_eq!(pool.total_idle_count(), 0);
    }

    #[tokio::test]
    async fn dispose_clears_idle_entries() {
        let pool: Pool<StubConn, RoundRobin, ()> = PoolBuilder::new(
            RoundRobin::new(),
            Arc::new(ScriptedConnect::default()),
            Arc::new(NoopResolve),
            TokioExecutor::new(),
        )
        .build_specific(vec![target("127.0.0.1:5000")])
        .unwrap();

        let url: Uri = "http://127.0.0.1:5000/".parse().unwrap();
        acquire_sync(&pool, url, ()).await.unwrap().return_to_pool();
        assert_eq!(pool.total_idle_count(), 1);

        pool.dispose();
        assert_eq!(pool.total_idle_count(), 0);
    }
}
