use std::io;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use slab::Slab;

use crate::backend::Backend;
use crate::conn::{ConnectionPool, TcpDialer};
use crate::heap::TimerHeap;
use crate::probe::poke;
use crate::spec::ProbeSpec;
use crate::target::{StatusSnapshot, Target};
use crate::workers::{Priority, TaskPool};

/// Cap on the dispatcher's idle wait, so the enable signal is never the only
/// thing that can unblock it.
const IDLE_WAIT: Duration = Duration::from_millis(8192);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    /// Removed while its probe task was in flight; the task drops it on exit.
    Doomed,
}

/// Mutex-guarded scheduling record for one target.
///
/// `probe` holds the target's state whenever no task is executing it; a
/// running task checks the box out and returns it at completion.
struct Slot {
    interval: Duration,
    run: RunState,
    backend: Weak<Backend>,
    probe: Option<Box<Target>>,
    snap: StatusSnapshot,
}

#[derive(Default)]
struct State {
    heap: TimerHeap,
    slots: Slab<Slot>,
    stopping: bool,
}

impl State {
    fn release(&mut self, id: usize) {
        self.slots.remove(id);
    }

    fn slot_mut(&mut self, id: usize) -> Option<&mut Slot> {
        self.slots.get_mut(id)
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
}

/// The health-probe subsystem: one scheduling heap, one dispatcher thread,
/// probe tasks fanned out to a worker pool.
///
/// The poller owns every target's health information; backends only carry
/// the published view. Dropping the poller stops the dispatcher; probes
/// already submitted run to completion on the worker pool.
pub struct Poller {
    shared: Arc<Shared>,
    dispatcher: Option<thread::JoinHandle<()>>,
}

impl Poller {
    /// Creates the poller state and spawns its dispatcher thread.
    ///
    /// # Arguments
    /// * `tasks` - The worker pool probe tasks are submitted to
    pub fn new(tasks: Arc<dyn TaskPool>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        });
        let dispatcher = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("probe-dispatcher".to_string())
                .spawn(move || dispatcher_loop(shared, tasks))
                .expect("failed to spawn probe dispatcher")
        };
        Self {
            shared,
            dispatcher: Some(dispatcher),
        }
    }

    /// Attaches a probe to `backend`, dialing its configured addresses
    /// directly.
    ///
    /// # Arguments
    /// * `backend` - The backend to probe and report into
    /// * `spec` - Probe parameters; normalized before use
    /// * `host` - Optional `Host` header value for synthesized requests
    pub fn insert(&self, backend: &Arc<Backend>, spec: ProbeSpec, host: Option<&str>) {
        let pool = Arc::new(TcpDialer::new(backend.addr_v4(), backend.addr_v6()));
        self.insert_with_pool(backend, spec, host, pool);
    }

    /// Attaches a probe that opens its connections through `pool`.
    ///
    /// Seeds the history with the spec's `initial` synthetic happy probes,
    /// so the backend starts out healthy when `initial >= threshold`, then
    /// schedules the first real probe immediately.
    pub fn insert_with_pool(
        &self,
        backend: &Arc<Backend>,
        spec: ProbeSpec,
        host: Option<&str>,
        pool: Arc<dyn ConnectionPool>,
    ) {
        let spec = spec.normalized();
        let req = spec.build_request(host);
        let interval = spec.interval;
        let mut vt = Box::new(Target::new(spec, req, pool));
        vt.seed(backend);
        let snap = vt.snapshot();

        let mut st = self.shared.state.lock().unwrap();
        let id = st.slots.insert(Slot {
            interval,
            run: RunState::Idle,
            backend: Arc::downgrade(backend),
            probe: Some(vt),
            snap,
        });
        let prev = backend.set_probe_slot(Some(id));
        assert!(prev.is_none(), "backend {} already has a probe", backend);
        st.heap.insert(id, Instant::now());
        drop(st);
        self.shared.cond.notify_one();
    }

    /// Detaches and tears down `backend`'s probe.
    ///
    /// If a probe task is in flight the target is doomed instead of freed;
    /// the task observes that at its tail and drops the target itself, so
    /// removal never races a running probe.
    pub fn remove(&self, backend: &Backend) {
        let mut st = self.shared.state.lock().unwrap();
        let Some(id) = backend.set_probe_slot(None) else {
            return;
        };
        // a removed backend must not stay parked sick
        backend.set_healthy(true);
        st.heap.remove(id);
        let run = st.slot_mut(id).map(|s| s.run);
        match run {
            Some(RunState::Idle) => st.release(id),
            Some(RunState::Running) => {
                let slot = st.slot_mut(id).expect("running target lost its slot");
                slot.run = RunState::Doomed;
                slot.backend = Weak::new();
                debug!("target {} doomed; its probe task will drop it", id);
            }
            Some(RunState::Doomed) | None => unreachable!("probe removed twice"),
        }
    }

    /// Enables or disables probing without touching the probe's history.
    pub fn control(&self, backend: &Backend, enable: bool) {
        let mut st = self.shared.state.lock().unwrap();
        let Some(id) = backend.probe_slot() else {
            warn!("control on backend {} which has no probe", backend.name());
            return;
        };
        if enable {
            if !st.heap.contains(id) {
                st.heap.insert(id, Instant::now());
                drop(st);
                self.shared.cond.notify_one();
            }
        } else {
            st.heap.remove(id);
        }
    }

    /// Renders `backend`'s probe state: `good/window`, or the full bitmap
    /// listing when `details` is set.
    pub fn status(
        &self,
        w: &mut dyn io::Write,
        backend: &Backend,
        details: bool,
    ) -> io::Result<()> {
        let snap = {
            let mut st = self.shared.state.lock().unwrap();
            backend
                .probe_slot()
                .and_then(|id| st.slot_mut(id).map(|slot| slot.snap))
        };
        match snap {
            None => write!(w, "No probe"),
            Some(snap) if details => snap.render_details(w),
            Some(snap) => snap.render_brief(w),
        }
    }

    #[cfg(test)]
    fn target_count(&self) -> usize {
        self.shared.state.lock().unwrap().slots.len()
    }

    #[cfg(test)]
    fn scheduled_count(&self) -> usize {
        self.shared.state.lock().unwrap().heap.len()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.stopping = true;
            debug!("poller stopping with {} targets scheduled", st.heap.len());
        }
        self.shared.cond.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn dispatcher_loop(shared: Arc<Shared>, tasks: Arc<dyn TaskPool>) {
    let mut st = shared.state.lock().unwrap();
    loop {
        if st.stopping {
            break;
        }
        let now = Instant::now();
        if st.heap.is_empty() {
            st = shared.cond.wait_timeout(st, IDLE_WAIT).unwrap().0;
            continue;
        }
        let (id, due) = st.heap.peek().expect("heap not empty");
        if due > now {
            st = shared.cond.wait_timeout(st, due - now).unwrap().0;
            continue;
        }

        st.heap.pop();
        let slot = st.slot_mut(id).expect("scheduled target has no slot");
        let interval = slot.interval;
        let busy = slot.run != RunState::Idle;
        if !busy {
            slot.run = RunState::Running;
        }
        st.heap.insert(id, due + interval);
        if busy {
            // previous probe still in flight; keep the schedule and move on
            continue;
        }

        drop(st);
        let job = {
            let shared = Arc::clone(&shared);
            Box::new(move || run_probe(&shared, id))
        };
        let submit = tasks.submit(Priority::Front, job);
        st = shared.state.lock().unwrap();
        if let Err(e) = submit {
            warn!("probe task for target {} rejected: {}; retrying next cycle", id, e);
            let run = st.slot_mut(id).map(|s| s.run);
            match run {
                Some(RunState::Running) => {
                    st.slot_mut(id).expect("slot vanished").run = RunState::Idle;
                }
                // removed while unlocked; nobody else is left to free it
                Some(RunState::Doomed) => st.release(id),
                _ => {}
            }
        }
    }
}

/// Probe task body. The checked-out target is exclusively ours between the
/// two critical sections.
fn run_probe(shared: &Arc<Shared>, id: usize) {
    let mut vt = {
        let mut st = shared.state.lock().unwrap();
        let Some(slot) = st.slot_mut(id) else { return };
        slot.probe.take().expect("probe state already checked out")
    };

    vt.start_poke();
    poke(&mut vt);
    vt.has_poked();

    let mut st = shared.state.lock().unwrap();
    let run = match st.slot_mut(id) {
        Some(slot) => slot.run,
        None => return,
    };
    match run {
        RunState::Doomed => {
            st.release(id);
            debug!("dropped doomed target {}", id);
        }
        RunState::Running => {
            let slot = st.slot_mut(id).expect("slot vanished");
            if let Some(backend) = slot.backend.upgrade() {
                vt.publish(&backend);
            }
            slot.snap = vt.snapshot();
            slot.probe = Some(vt);
            slot.run = RunState::Idle;
        }
        RunState::Idle => unreachable!("probe task completed on an idle target"),
    }
}
