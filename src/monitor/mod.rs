// Background monitors
// battery: low-voltage debounce, forced relax/PWM cut and motion lockout
// health: listener re-binding and periodic status summaries

pub mod battery;
pub mod health;

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

const IDLE_SLICE: Duration = Duration::from_millis(50);

/// Sleeps for `period`, returning early once `running` drops.
pub(crate) fn idle(running: &AtomicBool, period: Duration) {
    let deadline = Instant::now() + period;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(IDLE_SLICE.min(deadline - now));
    }
}
