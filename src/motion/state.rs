//! Shared motion state.
//!
//! The executor is the only writer; handler and monitor threads read
//! snapshots for telemetry replies and health logs.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::protocol::mailbox::Order;

#[derive(Debug, Clone)]
pub struct MotionState {
    pub current_order: Option<Order>,
    pub relaxed: bool,
    pub relaxed_since: Option<Instant>,
    pub balancing: bool,
    pub attitude_active: bool,
    /// Seconds spent out of the relaxed posture since the last rest.
    pub move_seconds_accum: f64,
    /// Last walking/turning order, with its receive time.
    pub last_motion_order: Option<Order>,
    pub speed: u32,
    pub height: f64,
    pub pwm_enabled: bool,
    /// Overuse protection forced a rest that has not finished yet.
    pub resting: bool,
}

impl MotionState {
    pub fn new(speed: u32, height: f64) -> Self {
        Self {
            current_order: None,
            relaxed: false,
            relaxed_since: None,
            balancing: false,
            attitude_active: false,
            move_seconds_accum: 0.0,
            last_motion_order: None,
            speed,
            height,
            pwm_enabled: false,
            resting: false,
        }
    }

    /// Time spent relaxed so far, zero when standing.
    pub fn rest_elapsed(&self, now: Instant) -> Duration {
        match (self.relaxed, self.relaxed_since) {
            (true, Some(since)) => now.saturating_duration_since(since),
            _ => Duration::ZERO,
        }
    }
}

/// Handle through which every thread reaches the motion state.
#[derive(Clone)]
pub struct SharedMotionState {
    inner: Arc<Mutex<MotionState>>,
}

impl SharedMotionState {
    pub fn new(state: MotionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub fn snapshot(&self) -> MotionState {
        self.inner.lock().clone()
    }

    pub fn is_relaxed(&self) -> bool {
        self.inner.lock().relaxed
    }

    pub fn is_resting(&self) -> bool {
        self.inner.lock().resting
    }

    /// `(active seconds, rest seconds)` for working-time replies.
    pub fn working_time(&self, now: Instant) -> (f64, f64) {
        let s = self.inner.lock();
        let rest = if s.resting {
            s.rest_elapsed(now).as_secs_f64()
        } else {
            0.0
        };
        (s.move_seconds_accum, rest)
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut MotionState) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_time_reports_rest_only_while_resting() {
        let shared = SharedMotionState::new(MotionState::new(8, 99.0));
        let t0 = Instant::now();
        shared.update(|s| {
            s.move_seconds_accum = 12.4;
            s.relaxed = true;
            s.relaxed_since = Some(t0);
        });
        let later = t0 + Duration::from_secs(5);
        assert_eq!(shared.working_time(later), (12.4, 0.0));

        shared.update(|s| s.resting = true);
        let (active, rest) = shared.working_time(later);
        assert_eq!(active, 12.4);
        assert!((rest - 5.0).abs() < 1e-9);
    }
}
