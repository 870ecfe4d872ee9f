//! Timed-action scheduler: a priority queue of parameter writes.
//!
//! Actions enter through the `action_to_send` cell as a JSON batch; each
//! action is stamped with a cumulative execution time (`wait_after_ms` on
//! action *i* delays action *i+1*, not action *i*) and pushed onto a
//! min-heap keyed by that time.  A dedicated task pops due actions and
//! dispatches them to local parameters or remote sessions.
//!
//! This component also owns the shared nickname map: writes to its
//! `device_nicknames` cell are the single mutation path.

use crate::actions::{self, Action};
use crate::state::{DeviceTable, Nicknames};
use pb_core::{Component, Parameter, Registry};
use pb_protocol::ParamValue;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, error, info};

const DISABLED_POLL: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_millis(50);
const MAX_WAIT: Duration = Duration::from_millis(100);

/// An action waiting on the heap.  Ordering is by execution time only;
/// FIFO among equal-time actions is not guaranteed.
struct QueuedAction {
    execute_at: Instant,
    action: Action,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.execute_at == other.execute_at
    }
}

impl Eq for QueuedAction {}

impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap, we want earliest-first.
        other.execute_at.cmp(&self.execute_at)
    }
}

/// The scheduler component and its processing queue.
pub struct Scheduler {
    registry: Arc<Registry>,
    devices: Arc<DeviceTable>,
    nicknames: Nicknames,
    queue: Mutex<BinaryHeap<QueuedAction>>,
    queue_length: Arc<Parameter>,
    enabled: Arc<Parameter>,
}

impl Scheduler {
    pub const COMPONENT: &'static str = "Scheduler";

    /// Build the component, register it, and wire the cell callbacks.
    pub fn new(
        registry: Arc<Registry>,
        devices: Arc<DeviceTable>,
        nicknames: Nicknames,
    ) -> Arc<Self> {
        let mut comp = Component::new(Self::COMPONENT, registry.allocator());
        let action_to_send = comp.add_str("action_to_send", 1, 1, "", false);
        let queue_length = comp.add_int("queue_length", 1, 1, 0, 999_999, 0, true);
        let enabled = comp.add_bool("enabled", 1, 1, true, false);
        let nicknames_cell = comp.add_str("device_nicknames", 1, 1, "{}", false);
        registry.register(comp);

        let scheduler = Arc::new(Self {
            registry,
            devices,
            nicknames: nicknames.clone(),
            queue: Mutex::new(BinaryHeap::new()),
            queue_length,
            enabled,
        });

        // Queue new batches written into action_to_send, then clear the
        // cell (notify off, so the clear does not re-enter this callback).
        let weak = Arc::downgrade(&scheduler);
        action_to_send.subscribe(Arc::new(move |param, _row, _col, new, _old| {
            let ParamValue::Str(text) = new else { return };
            if text.is_empty() {
                return;
            }
            if let Some(scheduler) = weak.upgrade() {
                match actions::parse_batch(text) {
                    Ok(batch) => scheduler.enqueue(batch),
                    Err(e) => error!(error = %e, "invalid action batch in action_to_send"),
                }
            }
            let _ = param.set(0, 0, ParamValue::Str(String::new()), false);
        }));

        // Single mutation path for the shared nickname map.
        nicknames_cell.subscribe(Arc::new(move |_param, _row, _col, new, _old| {
            let ParamValue::Str(text) = new else { return };
            let source = if text.is_empty() { "{}" } else { text.as_str() };
            match serde_json::from_str::<HashMap<String, String>>(source) {
                Ok(map) => {
                    debug!(nicknames = map.len(), "device nicknames updated");
                    nicknames.replace(map);
                }
                Err(e) => error!(error = %e, "failed to parse device nicknames"),
            }
        }));

        scheduler
    }

    /// Stamp a batch with cumulative execution times and push it.
    pub fn enqueue(&self, batch: Vec<Action>) {
        let now = Instant::now();
        let mut cumulative = Duration::ZERO;
        let queued = batch.len();

        let len = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            for action in batch {
                let wait_after = Duration::from_millis(action.wait_after_ms);
                queue.push(QueuedAction { execute_at: now + cumulative, action });
                cumulative += wait_after;
            }
            queue.len()
        };

        self.update_queue_length(len);
        info!(queued, queue = len, "actions queued");
    }

    /// Drop all pending actions immediately.
    pub fn clear_queue(&self) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.update_queue_length(0);
        info!("action queue cleared");
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Processing loop; runs on its own task until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler processing started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let step = self.next_step();
            match step {
                Step::Execute(action) => {
                    actions::execute(&action, &self.registry, &self.devices, &self.nicknames);
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        () = sleep(duration) => {}
                    }
                }
            }
        }
        info!("scheduler processing stopped");
    }

    // -- internal --

    fn next_step(&self) -> Step {
        if self.enabled.get(0, 0).ok() != Some(ParamValue::Bool(true)) {
            return Step::Sleep(DISABLED_POLL);
        }

        let (due, len) = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            match queue.peek() {
                None => return Step::Sleep(IDLE_POLL),
                Some(head) => {
                    let now = Instant::now();
                    if head.execute_at > now {
                        return Step::Sleep((head.execute_at - now).min(MAX_WAIT));
                    }
                }
            }
            let due = queue.pop();
            (due, queue.len())
        };

        match due {
            Some(queued) => {
                self.update_queue_length(len);
                Step::Execute(queued.action)
            }
            None => Step::Sleep(IDLE_POLL),
        }
    }

    fn update_queue_length(&self, len: usize) {
        let _ = self.queue_length.set(0, 0, ParamValue::Int(len as i64), true);
    }
}

enum Step {
    Sleep(Duration),
    Execute(Action),
}
