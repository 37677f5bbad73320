//! Endpoint state machine and resource tracking.
//!
//! Each endpoint (server or client) owns one [`Supervisor`]. It holds the
//! observable state in a watch channel, a per-cycle cancellation token that
//! doubles as the monotonic abort flag, a task tracker whose drain defines
//! the end of `stop()`, and the registry of live bridged streams.
//!
//! Every kernel resource is owned by exactly one tracked task; the task's
//! exit is the resource's terminal event and its deregistration. A stream id
//! enters and leaves the stream registry together with its paired TCP socket,
//! by the bridge that owns both.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Observable endpoint state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Stopped,
    Listening,
    Connecting,
    Connected,
    Disconnected,
    Stopping,
}

impl EndpointState {
    /// The log token for this state.
    pub fn token(&self) -> &'static str {
        match self {
            EndpointState::Stopped => "stopped",
            EndpointState::Listening => "listening",
            EndpointState::Connecting => "connecting",
            EndpointState::Connected => "connected",
            EndpointState::Disconnected => "disconnected",
            EndpointState::Stopping => "stopping",
        }
    }
}

struct Cycle {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Cycle {
    fn fresh() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }
}

/// Per-endpoint supervisor.
pub struct Supervisor {
    role: &'static str,
    state_tx: watch::Sender<EndpointState>,
    cycle: Mutex<Cycle>,
    streams: Mutex<HashSet<u64>>,
    stream_counter: AtomicU64,
}

impl Supervisor {
    /// Creates a supervisor in the `Stopped` state.
    pub fn new(role: &'static str) -> Self {
        let (state_tx, _) = watch::channel(EndpointState::Stopped);
        Self {
            role,
            state_tx,
            cycle: Mutex::new(Cycle::fresh()),
            streams: Mutex::new(HashSet::new()),
            stream_counter: AtomicU64::new(0),
        }
    }

    /// Opens a fresh start/stop cycle and returns its shutdown token and task
    /// tracker. Any prior cycle's abort flag stays set; the new cycle starts
    /// unaborted.
    pub fn begin(&self) -> (CancellationToken, TaskTracker) {
        let mut cycle = self.cycle.lock().unwrap();
        *cycle = Cycle::fresh();
        self.streams.lock().unwrap().clear();
        (cycle.shutdown.clone(), cycle.tasks.clone())
    }

    /// Returns clones of the current cycle's shutdown token and task tracker.
    pub fn handles(&self) -> (CancellationToken, TaskTracker) {
        let cycle = self.cycle.lock().unwrap();
        (cycle.shutdown.clone(), cycle.tasks.clone())
    }

    /// Returns the endpoint role ("server" or "client").
    pub fn role(&self) -> &'static str {
        self.role
    }

    /// Returns the current state.
    pub fn state(&self) -> EndpointState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions. The receiver observes the current
    /// state immediately; rapid intermediate transitions may coalesce.
    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.state_tx.subscribe()
    }

    /// The single state update site. Logs the state token on every actual
    /// transition, except `Connected`, whose log line carries the peer
    /// addresses and is emitted by the connection owner.
    pub fn set_state(&self, next: EndpointState) {
        let changed = self.state_tx.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed && next != EndpointState::Connected {
            tracing::info!(role = self.role, "{}", next.token());
        }
    }

    /// Waits until the endpoint reaches the given state. Returns immediately
    /// if the state is already reached.
    pub async fn wait_until(&self, target: EndpointState) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Whether the current cycle has been aborted. Monotonic per cycle.
    pub fn aborted(&self) -> bool {
        self.cycle.lock().unwrap().shutdown.is_cancelled()
    }

    /// Allocates the next stream id. Monotonic across the supervisor's
    /// lifetime; purely observational.
    pub fn next_stream_id(&self) -> u64 {
        self.stream_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Registers a live bridged stream. Returns false when the endpoint is
    /// aborted: late arrivals must be destroyed by the caller instead.
    pub fn track_stream(&self, id: u64) -> bool {
        if self.aborted() {
            return false;
        }
        self.streams.lock().unwrap().insert(id)
    }

    /// Deregisters a bridged stream. Idempotent.
    pub fn untrack_stream(&self, id: u64) {
        self.streams.lock().unwrap().remove(&id);
    }

    /// Number of live bridged streams.
    pub fn active_streams(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    /// Stops the endpoint: aborts the current cycle, then waits for every
    /// tracked task to exit. Idempotent; never fails, even for resources that
    /// are mid-teardown.
    pub async fn stop(&self) {
        let (shutdown, tasks) = self.handles();
        if !shutdown.is_cancelled() && self.state() != EndpointState::Stopped {
            self.set_state(EndpointState::Stopping);
        }
        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
        self.set_state(EndpointState::Stopped);
    }
}
