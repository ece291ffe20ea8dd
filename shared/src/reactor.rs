//! Multi-threaded readiness reactor.
//!
//! A [`Reactor`] owns a fixed pool of event-loop threads. Each thread polls
//! its own `mio::Poll` instance, so the file descriptors watched by the pool
//! are partitioned across disjoint readiness sets. Registrations pick their
//! thread round-robin.
//!
//! A registered *reaction* is a boxed closure plus whatever state it
//! captured. File-descriptor reactions run when their fd reports readiness;
//! timer reactions refire on a monotonically advancing schedule. On any one
//! thread, reactions run strictly one at a time; reactions on different
//! threads run in parallel, so state they share must carry its own lock.
//!
//! The per-thread mutex guards the reaction tables and the timer heap. It is
//! *not* held while a callback runs: the dispatch loop lifts the closure out
//! of its slot, releases the lock, invokes, and puts the closure back unless
//! the reaction removed itself. Registration therefore always locks,
//! including from inside a callback targeting its own thread.

use std::collections::BinaryHeap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, trace};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::holey::HoleyTable;

/// Most readiness events drained from one poll wakeup.
pub const MAX_EVENT_BATCH: usize = 64;

/// Token reserved for each thread's waker; never a table slot.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Readiness bits delivered to an fd reaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventSet {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the connection errored; treat as end of stream.
    pub hangup: bool,
}

impl EventSet {
    fn from_event(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            hangup: event.is_read_closed() || event.is_error(),
        }
    }
}

/// Identifies a registered fd reaction: which thread owns it and which slot
/// it occupies in that thread's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactionHandle {
    pub thread: usize,
    pub slot: usize,
}

/// Callback for fd readiness. The closure owns its state by capture.
pub type FdCallback = Box<dyn FnMut(EventSet, &Context) + Send>;

/// Callback for a periodic timer.
pub type TimerCallback = Box<dyn FnMut(&Context) + Send>;

/// The slot keeps the reaction alive; the callback box is absent only while
/// the dispatch loop is invoking it.
struct FdReaction {
    callback: Option<FdCallback>,
}

struct TimerReaction {
    callback: Option<TimerCallback>,
}

/// Heap entry ordering the next firings. Reversed comparison turns the
/// std max-heap into a min-heap on fire time.
struct PendingTimer {
    at: Instant,
    interval: Duration,
    slot: usize,
}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for PendingTimer {}
impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.at.cmp(&self.at)
    }
}

struct ThreadState {
    fd_reactions: HoleyTable<FdReaction>,
    timer_reactions: HoleyTable<TimerReaction>,
    pending_timers: BinaryHeap<PendingTimer>,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            fd_reactions: HoleyTable::with_capacity(8),
            timer_reactions: HoleyTable::with_capacity(4),
            pending_timers: BinaryHeap::new(),
        }
    }
}

/// Per-thread pieces shared with registrars on other threads.
struct ThreadShared {
    registry: Registry,
    waker: Waker,
    state: Mutex<ThreadState>,
}

struct Core {
    threads: Vec<ThreadShared>,
    cursor: AtomicUsize,
    shutdown: AtomicBool,
}

/// Cloneable reference to a running reactor. Everything that registers
/// reactions or re-arms socket interest goes through one of these.
#[derive(Clone)]
pub struct Handle {
    core: Arc<Core>,
}

impl Handle {
    pub fn thread_count(&self) -> usize {
        self.core.threads.len()
    }

    /// The readiness registry of one reactor thread, for re-arming interest
    /// on an already-registered fd.
    pub fn registry(&self, thread: usize) -> &Registry {
        &self.core.threads[thread].registry
    }

    /// Registers `fd` with a reaction on a round-robin-chosen thread.
    ///
    /// The fd is added to that thread's readiness set with its token set to
    /// the reaction's slot index; the registration happens while the slot is
    /// being placed, so a failure leaves no trace in the table.
    pub fn add_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: FdCallback,
    ) -> io::Result<ReactionHandle> {
        let thread = self.next_thread();
        let shared = &self.core.threads[thread];
        let slot = {
            let mut state = shared.state.lock();
            state.fd_reactions.try_insert_with(|slot| -> io::Result<FdReaction> {
                shared
                    .registry
                    .register(&mut SourceFd(&fd), Token(slot), interest)?;
                Ok(FdReaction {
                    callback: Some(callback),
                })
            })?
        };
        trace!("registered fd {fd} as reaction {slot} on thread {thread}");
        Ok(ReactionHandle { thread, slot })
    }

    /// Installs a periodic timer on a round-robin-chosen thread. The first
    /// firing is one `interval` from now; subsequent firings advance by
    /// `interval` from the scheduled (not actual) time.
    pub fn add_timer(&self, interval: Duration, callback: TimerCallback) -> io::Result<()> {
        let thread = self.next_thread();
        let shared = &self.core.threads[thread];
        {
            let mut state = shared.state.lock();
            let slot = state.timer_reactions.insert(TimerReaction {
                callback: Some(callback),
            });
            state.pending_timers.push(PendingTimer {
                at: Instant::now() + interval,
                interval,
                slot,
            });
        }
        // The target may be parked with no deadline; poke it so it picks up
        // the new earliest fire time.
        shared.waker.wake()
    }

    /// Cursor imprecision only affects placement fairness, so relaxed
    /// ordering is enough.
    fn next_thread(&self) -> usize {
        self.core.cursor.fetch_add(1, Ordering::Relaxed) % self.core.threads.len()
    }
}

/// Execution context handed to every reaction while it runs.
pub struct Context<'a> {
    handle: &'a Handle,
    thread_index: usize,
}

impl Context<'_> {
    pub fn reactor(&self) -> &Handle {
        self.handle
    }

    pub fn thread_index(&self) -> usize {
        self.thread_index
    }

    /// Destroys an fd reaction owned by the executing thread and drops the
    /// fd from the readiness set. A reaction may remove itself as its last
    /// act; the handle must not be used afterwards.
    ///
    /// Only the owning thread may remove a reaction, which is guaranteed
    /// when called from inside one of that thread's callbacks.
    pub fn remove_fd(&self, reaction: ReactionHandle, fd: RawFd) {
        debug_assert_eq!(reaction.thread, self.thread_index);
        let shared = &self.handle.core.threads[reaction.thread];
        // The fd may already be closed, in which case the kernel has
        // dropped it from the set on its own.
        let _ = shared.registry.deregister(&mut SourceFd(&fd));
        shared.state.lock().fd_reactions.remove(reaction.slot);
    }
}

/// Fixed pool of reactor threads. Dropping it stops and joins the pool.
pub struct Reactor {
    handle: Handle,
    joiners: Vec<JoinHandle<()>>,
}

impl Reactor {
    /// Starts `thread_count` event-loop threads (at least one).
    pub fn new(thread_count: usize) -> io::Result<Self> {
        assert!(thread_count >= 1, "reactor needs at least one thread");
        let mut polls = Vec::with_capacity(thread_count);
        let mut threads = Vec::with_capacity(thread_count);
        for _ in 0..thread_count {
            let poll = Poll::new()?;
            let registry = poll.registry().try_clone()?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
            threads.push(ThreadShared {
                registry,
                waker,
                state: Mutex::new(ThreadState::new()),
            });
            polls.push(poll);
        }
        let core = Arc::new(Core {
            threads,
            cursor: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let joiners = polls
            .into_iter()
            .enumerate()
            .map(|(index, poll)| {
                let core = Arc::clone(&core);
                std::thread::Builder::new()
                    .name(format!("reactor-{index}"))
                    .spawn(move || run_thread(core, index, poll))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            handle: Handle { core },
            joiners,
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.handle.core.shutdown.store(true, Ordering::Relaxed);
        for thread in &self.handle.core.threads {
            let _ = thread.waker.wake();
        }
        for joiner in self.joiners.drain(..) {
            let _ = joiner.join();
        }
    }
}

fn run_thread(core: Arc<Core>, index: usize, mut poll: Poll) {
    let handle = Handle { core };
    let mut events = Events::with_capacity(MAX_EVENT_BATCH);
    loop {
        let timeout = {
            let state = handle.core.threads[index].state.lock();
            state
                .pending_timers
                .peek()
                .map(|timer| timer.at.saturating_duration_since(Instant::now()))
        };
        if let Err(e) = poll.poll(&mut events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                // Anything else from the poller is a system failure.
                error!("reactor thread {index}: poll failed: {e}");
                return;
            }
            events.clear();
        }
        if handle.core.shutdown.load(Ordering::Relaxed) {
            return;
        }
        let ctx = Context {
            handle: &handle,
            thread_index: index,
        };
        fire_due_timers(&ctx);
        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            dispatch_fd_event(&ctx, event);
        }
        // Dispatch may have taken a while; catch timers that came due.
        fire_due_timers(&ctx);
    }
}

fn dispatch_fd_event(ctx: &Context, event: &mio::event::Event) {
    let slot = event.token().0;
    let shared = &ctx.handle.core.threads[ctx.thread_index];
    let mut callback = {
        let mut state = shared.state.lock();
        match state.fd_reactions.get_mut(slot).and_then(|r| r.callback.take()) {
            Some(callback) => callback,
            // Removed earlier in this batch; the event is stale.
            None => return,
        }
    };
    callback(EventSet::from_event(event), ctx);
    let mut state = shared.state.lock();
    if let Some(reaction) = state.fd_reactions.get_mut(slot) {
        // Present with an empty callback means it is still our reaction; a
        // reaction that removed itself left the slot free (or a newly
        // registered one now holds it, with its own callback in place).
        if reaction.callback.is_none() {
            reaction.callback = Some(callback);
        }
    }
}

fn fire_due_timers(ctx: &Context) {
    let shared = &ctx.handle.core.threads[ctx.thread_index];
    loop {
        let due = {
            let mut state = shared.state.lock();
            let now = Instant::now();
            if state.pending_timers.peek().is_some_and(|timer| timer.at <= now) {
                state.pending_timers.pop().map(|timer| {
                    let callback = state
                        .timer_reactions
                        .get_mut(timer.slot)
                        .and_then(|r| r.callback.take());
                    (timer, callback)
                })
            } else {
                None
            }
        };
        let (mut timer, callback) = match due {
            Some(entry) => entry,
            None => break,
        };
        let mut callback = match callback {
            Some(callback) => callback,
            // Reaction vanished; drop the stale schedule entry with it.
            None => continue,
        };
        callback(ctx);
        timer.at += timer.interval;
        let mut state = shared.state.lock();
        if let Some(reaction) = state.timer_reactions.get_mut(timer.slot) {
            reaction.callback = Some(callback);
        }
        state.pending_timers.push(timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::sync::mpsc;
    use std::sync::OnceLock;

    #[test]
    fn test_timer_fires_repeatedly() {
        let reactor = Reactor::new(1).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        reactor
            .handle()
            .add_timer(
                Duration::from_millis(5),
                Box::new(move |_ctx: &Context| {
                    seen.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert!(count.load(Ordering::Relaxed) >= 3);
    }

    #[test]
    fn test_registrations_round_robin_across_threads() {
        let reactor = Reactor::new(2).unwrap();
        let listeners: Vec<TcpListener> = (0..4)
            .map(|_| {
                let l = TcpListener::bind("127.0.0.1:0").unwrap();
                l.set_nonblocking(true).unwrap();
                l
            })
            .collect();
        let mut threads = Vec::new();
        for listener in &listeners {
            let handle = reactor
                .handle()
                .add_fd(
                    listener.as_raw_fd(),
                    Interest::READABLE,
                    Box::new(|_events: EventSet, _ctx: &Context| {}),
                )
                .unwrap();
            threads.push(handle.thread);
        }
        assert_eq!(threads, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_fd_reaction_fires_on_readable() {
        let reactor = Reactor::new(2).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        reactor
            .handle()
            .add_fd(
                listener.as_raw_fd(),
                Interest::READABLE,
                // The closure owns the listener for the reaction's lifetime.
                Box::new(move |_events: EventSet, _ctx: &Context| {
                    if listener.accept().is_ok() {
                        tx.send(()).unwrap();
                    }
                }),
            )
            .unwrap();
        let _conn = TcpStream::connect(addr).unwrap();
        rx.recv_timeout(Duration::from_secs(2))
            .expect("accept reaction never ran");
    }

    #[test]
    fn test_reaction_can_remove_itself() {
        let reactor = Reactor::new(1).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let fd = listener.as_raw_fd();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle_cell = Arc::new(OnceLock::new());

        let fired_in_cb = Arc::clone(&fired);
        let handle_in_cb = Arc::clone(&handle_cell);
        let handle = reactor
            .handle()
            .add_fd(
                fd,
                Interest::READABLE,
                Box::new(move |_events: EventSet, ctx: &Context| {
                    let _ = listener.accept();
                    fired_in_cb.fetch_add(1, Ordering::Relaxed);
                    let own: &ReactionHandle = handle_in_cb.get().unwrap();
                    ctx.remove_fd(*own, fd);
                }),
            )
            .unwrap();
        handle_cell.set(handle).unwrap();

        let _first = TcpStream::connect(addr).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        // The fd is out of the readiness set; further connects go unseen.
        let _second = TcpStream::connect(addr);
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_callback_can_register_on_own_reactor() {
        let reactor = Reactor::new(1).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_inner = Arc::clone(&fired);
        let installed = Arc::new(AtomicUsize::new(0));
        let installed_in_cb = Arc::clone(&installed);
        reactor
            .handle()
            .add_timer(
                Duration::from_millis(5),
                Box::new(move |ctx: &Context| {
                    // Install a second timer from inside a callback; with a
                    // single reactor thread this lands on the running thread.
                    if installed_in_cb.swap(1, Ordering::Relaxed) == 0 {
                        let fired_inner = Arc::clone(&fired_inner);
                        ctx.reactor()
                            .add_timer(
                                Duration::from_millis(5),
                                Box::new(move |_ctx: &Context| {
                                    fired_inner.fetch_add(1, Ordering::Relaxed);
                                }),
                            )
                            .unwrap();
                    }
                }),
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        assert!(fired.load(Ordering::Relaxed) >= 1);
    }
}
