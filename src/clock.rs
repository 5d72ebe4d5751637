//! Virtual clock and scheduler interception.
//!
//! The clock owns the engine's notion of elapsed time and the three pending
//! callback sets (animation-frame callbacks, timeouts, intervals). Animation
//! code schedules against a [`ClockHandle`] exactly as it would against a
//! host's real timing primitives; during a capture the scheduler advances the
//! clock frame by frame and [`VirtualClock::tick`] fires whatever is due, so
//! unmodified animation logic observes deterministic time.
//!
//! The clock is an explicit, injected instance rather than patched globals:
//! the scheduler is the single writer (`install`/`advance`/`tick`/`restore`),
//! while any number of cloned handles may query time or schedule callbacks.

use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Opaque id returned by [`ClockHandle::set_timeout`] and
/// [`ClockHandle::set_interval`]. Unique for the clock's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

type FrameCallback = Box<dyn FnOnce(f64) + Send>;
type TimeoutCallback = Box<dyn FnOnce() + Send>;
type IntervalCallback = Arc<Mutex<dyn FnMut() + Send>>;

struct Timeout {
    fire_at_ms: f64,
    callback: TimeoutCallback,
}

struct Interval {
    last_fire_ms: f64,
    period_ms: f64,
    callback: IntervalCallback,
}

struct ClockState {
    installed: bool,
    elapsed_ms: f64,
    next_id: u64,
    frame_callbacks: Vec<FrameCallback>,
    timeouts: HashMap<u64, Timeout>,
    intervals: HashMap<u64, Interval>,
}

struct Inner {
    epoch: Instant,
    state: Mutex<ClockState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ClockState> {
        // A callback that panicked mid-tick must not wedge the clock.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Engine-controlled stand-in for elapsed time.
///
/// While installed, every [`ClockHandle`] clock query returns the virtual
/// `elapsed` value and every scheduled callback fires only from [`tick`].
/// The batched frame scheduler is the intended single caller of the
/// lifecycle operations.
///
/// [`tick`]: VirtualClock::tick
#[derive(Clone)]
pub struct VirtualClock {
    inner: Arc<Inner>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                epoch: Instant::now(),
                state: Mutex::new(ClockState {
                    installed: false,
                    elapsed_ms: 0.0,
                    next_id: 0,
                    frame_callbacks: Vec::new(),
                    timeouts: HashMap::new(),
                    intervals: HashMap::new(),
                }),
            }),
        }
    }

    /// The animation-facing view of this clock.
    pub fn handle(&self) -> ClockHandle {
        ClockHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Enter the timewarp: clock queries start returning virtual time.
    ///
    /// Idempotent; calling while already installed never double-wraps.
    pub fn install(&self) {
        let mut state = self.inner.lock();
        if !state.installed {
            state.installed = true;
            tracing::debug!("virtual clock installed");
        }
    }

    pub fn is_installed(&self) -> bool {
        self.inner.lock().installed
    }

    /// Set `elapsed` to `ms`. The scheduler only ever moves time forward
    /// within one session.
    pub fn advance(&self, ms: f64) {
        self.inner.lock().elapsed_ms = ms;
    }

    /// Current virtual elapsed time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.inner.lock().elapsed_ms
    }

    /// Fire everything due at the current `elapsed`, in one atomic step:
    ///
    /// 1. all pending frame callbacks — the set is drained *before* invocation,
    ///    so a callback re-registering itself lands in the next tick;
    /// 2. all timeouts with `fire_at <= elapsed`, which are then removed;
    /// 3. all intervals with `elapsed - last_fire >= period`, rearmed with
    ///    `last_fire += period`. An interval fires at most once per tick even
    ///    when several periods have elapsed.
    ///
    /// Callbacks run with no internal lock held and may freely schedule or
    /// cancel. Within each phase, firing order follows registration order.
    pub fn tick(&self) {
        let (frame_cbs, elapsed) = {
            let mut state = self.inner.lock();
            (mem::take(&mut state.frame_callbacks), state.elapsed_ms)
        };
        for cb in frame_cbs {
            cb(elapsed);
        }

        // Timeouts are re-read after the frame callbacks ran: a zero-delay
        // timeout scheduled by a frame callback fires within the same tick.
        let due_timeouts: Vec<TimeoutCallback> = {
            let mut state = self.inner.lock();
            let elapsed = state.elapsed_ms;
            let mut due: Vec<u64> = state
                .timeouts
                .iter()
                .filter(|(_, t)| t.fire_at_ms <= elapsed)
                .map(|(id, _)| *id)
                .collect();
            due.sort_unstable();
            due.into_iter()
                .filter_map(|id| state.timeouts.remove(&id))
                .map(|t| t.callback)
                .collect()
        };
        for cb in due_timeouts {
            cb();
        }

        let firing_intervals: Vec<IntervalCallback> = {
            let mut state = self.inner.lock();
            let elapsed = state.elapsed_ms;
            let mut due: Vec<u64> = state
                .intervals
                .iter()
                .filter(|(_, iv)| elapsed - iv.last_fire_ms >= iv.period_ms)
                .map(|(id, _)| *id)
                .collect();
            due.sort_unstable();
            due.into_iter()
                .filter_map(|id| {
                    let iv = state.intervals.get_mut(&id)?;
                    iv.last_fire_ms += iv.period_ms;
                    Some(Arc::clone(&iv.callback))
                })
                .collect()
        };
        for cb in firing_intervals {
            let mut cb = cb.lock().unwrap_or_else(PoisonError::into_inner);
            (&mut *cb)();
        }
    }

    /// Leave the timewarp: clock queries return to real time and all pending
    /// callback sets are flushed. Safe to call when never installed (no-op)
    /// and idempotent.
    pub fn restore(&self) {
        let mut state = self.inner.lock();
        state.frame_callbacks.clear();
        state.timeouts.clear();
        state.intervals.clear();
        state.elapsed_ms = 0.0;
        if state.installed {
            state.installed = false;
            tracing::debug!("virtual clock restored");
        }
    }
}

/// Clonable animation-facing view of a [`VirtualClock`]: the four timing
/// primitive families, without the lifecycle operations.
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<Inner>,
}

impl ClockHandle {
    /// Register a one-shot callback for the next [`VirtualClock::tick`].
    ///
    /// Mirrors animation-frame semantics: fire once with the current
    /// timestamp, re-register from inside the callback to keep animating.
    pub fn request_animation_frame(&self, callback: impl FnOnce(f64) + Send + 'static) {
        self.inner.lock().frame_callbacks.push(Box::new(callback));
    }

    /// Schedule `callback` to fire once at the first tick where
    /// `elapsed >= now + delay_ms`.
    pub fn set_timeout(&self, callback: impl FnOnce() + Send + 'static, delay_ms: f64) -> TimerId {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        let fire_at_ms = state.elapsed_ms + delay_ms;
        state.timeouts.insert(
            id,
            Timeout {
                fire_at_ms,
                callback: Box::new(callback),
            },
        );
        TimerId(id)
    }

    /// Cancel a pending timeout. Idempotent; unknown ids are ignored.
    pub fn clear_timeout(&self, id: TimerId) {
        self.inner.lock().timeouts.remove(&id.0);
    }

    /// Schedule `callback` to fire on every tick where at least `period_ms`
    /// has elapsed since its last firing.
    pub fn set_interval(&self, callback: impl FnMut() + Send + 'static, period_ms: f64) -> TimerId {
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        let last_fire_ms = state.elapsed_ms;
        state.intervals.insert(
            id,
            Interval {
                last_fire_ms,
                period_ms,
                callback: Arc::new(Mutex::new(callback)),
            },
        );
        TimerId(id)
    }

    /// Cancel a pending interval. Idempotent; unknown ids are ignored.
    pub fn clear_interval(&self, id: TimerId) {
        self.inner.lock().intervals.remove(&id.0);
    }

    /// Monotonic clock query in milliseconds. Virtual `elapsed` while the
    /// clock is installed, real time since clock construction otherwise.
    pub fn now_ms(&self) -> f64 {
        let state = self.inner.lock();
        if state.installed {
            state.elapsed_ms
        } else {
            self.inner.epoch.elapsed().as_secs_f64() * 1000.0
        }
    }

    /// Wall clock query in milliseconds since the unix epoch. Virtual
    /// `elapsed` while the clock is installed.
    pub fn wall_time_ms(&self) -> f64 {
        let state = self.inner.lock();
        if state.installed {
            state.elapsed_ms
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64() * 1000.0)
                .unwrap_or(0.0)
        }
    }
}
