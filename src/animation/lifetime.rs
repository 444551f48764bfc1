//! Automatic reclamation timing for dispatched instances.
//!
//! Each pooled instance carries a [`LifetimeController`] that is re-armed,
//! never recreated, on every dispatch. Armed controllers have an entry in the
//! router's [`LifetimeScheduler`]; the entry only fires if the controller is
//! still armed with the same token when its deadline is reached.

use crate::animation::effect::{EffectInstance, EffectTemplate, TimedSubEffect};
use crate::animation::effect_pool::EffectHandle;
use crate::animation::effect_router::EffectRouter;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Seconds an instance stays active.
///
/// A positive `hint` wins. Otherwise the longest sub-effect span is used, and
/// when that is missing or not positive the `fallback` applies.
pub fn effective_duration(hint: Option<f64>, sub_effects: &[TimedSubEffect], fallback: f64) -> f64 {
    if let Some(hint) = hint.filter(|h| *h > 0.0 && h.is_finite()) {
        return hint;
    }

    let longest = sub_effects
        .iter()
        .map(TimedSubEffect::span)
        .fold(0.0_f64, f64::max);

    if longest > 0.0 && longest.is_finite() {
        longest
    } else {
        fallback
    }
}

/// Convert seconds to whole milliseconds on the router clock
pub fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round().max(0.0) as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeState {
    Idle,
    Armed { deadline_ms: u64, token: u64 },
}

/// Timer armed by [`LifetimeController::init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimeTimer {
    pub deadline_ms: u64,
    pub token: u64,
}

/// Per-instance timer state: Idle -> Armed -> Idle.
#[derive(Debug)]
pub struct LifetimeController {
    state: LifetimeState,
    next_token: u64,
}

impl Default for LifetimeController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeController {
    pub fn new() -> Self {
        Self {
            state: LifetimeState::Idle,
            next_token: 0,
        }
    }

    /// Cancel any pending timer and arm a new one `duration_secs` after `now_ms`.
    pub fn init(&mut self, now_ms: u64, duration_secs: f64) -> LifetimeTimer {
        self.cancel();
        self.next_token += 1;
        let timer = LifetimeTimer {
            deadline_ms: now_ms.saturating_add(secs_to_ms(duration_secs)),
            token: self.next_token,
        };
        self.state = LifetimeState::Armed {
            deadline_ms: timer.deadline_ms,
            token: timer.token,
        };
        timer
    }

    /// Returns true if a timer was pending
    pub fn cancel(&mut self) -> bool {
        let was_armed = self.is_armed();
        self.state = LifetimeState::Idle;
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, LifetimeState::Armed { .. })
    }

    /// Checked immediately before a scheduled reclamation runs
    pub fn is_armed_with(&self, token: u64) -> bool {
        matches!(self.state, LifetimeState::Armed { token: t, .. } if t == token)
    }

    pub fn state(&self) -> LifetimeState {
        self.state
    }
}

/// Pending reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledReclaim {
    pub deadline_ms: u64,
    pub handle: EffectHandle,
    pub token: u64,
}

impl Ord for ScheduledReclaim {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline_ms
            .cmp(&other.deadline_ms)
            .then_with(|| self.handle.ticket.cmp(&other.handle.ticket))
            .then_with(|| self.token.cmp(&other.token))
    }
}

impl PartialOrd for ScheduledReclaim {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Cancelled entries tolerated before the queue is compacted
const COMPACT_MIN_STALE: usize = 32;

#[derive(Debug, Default)]
struct Queue {
    heap: BinaryHeap<Reverse<ScheduledReclaim>>,
    /// Entries whose timer was cancelled but which are still in `heap`
    stale: usize,
}

/// Expiry queue ordered by deadline.
///
/// Cancelling a timer does not remove its entry. The owner reports each
/// cancellation with [`LifetimeScheduler::mark_stale`]; once stale entries
/// outnumber live ones the queue is rebuilt with [`LifetimeScheduler::compact`],
/// so its size stays proportional to the pending timers.
#[derive(Debug, Default)]
pub struct LifetimeScheduler {
    queue: Mutex<Queue>,
}

impl LifetimeScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, handle: EffectHandle, timer: LifetimeTimer) {
        self.queue.lock().heap.push(Reverse(ScheduledReclaim {
            deadline_ms: timer.deadline_ms,
            handle,
            token: timer.token,
        }));
    }

    /// Remove and return every entry due at `now_ms`, earliest first
    pub fn drain_due(&self, now_ms: u64) -> Vec<ScheduledReclaim> {
        let mut queue = self.queue.lock();
        let mut due = Vec::new();
        while let Some(Reverse(next)) = queue.heap.peek() {
            if next.deadline_ms > now_ms {
                break;
            }
            if let Some(Reverse(entry)) = queue.heap.pop() {
                due.push(entry);
            }
        }
        due
    }

    /// Record that one queued timer was cancelled.
    /// Returns true when the queue should be compacted.
    pub fn mark_stale(&self) -> bool {
        let mut queue = self.queue.lock();
        queue.stale = (queue.stale + 1).min(queue.heap.len());
        queue.stale >= COMPACT_MIN_STALE && queue.stale * 2 > queue.heap.len()
    }

    /// A drained entry turned out to be cancelled
    pub fn discard_stale(&self) {
        let mut queue = self.queue.lock();
        queue.stale = queue.stale.saturating_sub(1);
    }

    /// Drop every entry `live` rejects. Returns how many were removed.
    pub fn compact(&self, live: impl Fn(&ScheduledReclaim) -> bool) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.heap.len();
        queue.heap.retain(|Reverse(entry)| live(entry));
        queue.stale = 0;
        before - queue.heap.len()
    }

    /// Earliest pending deadline, cancelled entries included
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.lock().heap.peek().map(|Reverse(entry)| entry.deadline_ms)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().heap.is_empty()
    }

    pub fn clear(&self) {
        let mut queue = self.queue.lock();
        queue.heap.clear();
        queue.stale = 0;
    }
}

/// Return `instance` to `router`, or destroy it when no router is available.
pub fn reclaim<T: EffectTemplate>(router: Option<&EffectRouter<T>>, instance: T::Instance) {
    match router {
        Some(router) => {
            if let Err(err) = router.release_instance(instance) {
                tracing::warn!("[EFFECT LIFETIME] Reclaim failed: {}", err);
            }
        }
        None => {
            tracing::debug!(
                "[EFFECT LIFETIME] No router for {}, destroying",
                instance.instance_id()
            );
            instance.destroy();
        }
    }
}
