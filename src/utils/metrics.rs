//! Runtime counters shared by the network threads and read by the health
//! monitor.
//!
//! Counters are plain atomics so the hot paths (frame writes, control reads)
//! never take a lock; the last-activity instants sit behind a small mutex.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    control_disconnects: AtomicU64,
    video_disconnects: AtomicU64,
    camera_failures: AtomicU64,
    frames_sent: AtomicU64,
    lines_received: AtomicU64,
    video_connected: AtomicBool,
    last_frame_at: Mutex<Option<Instant>>,
    last_rx_at: Mutex<Option<Instant>>,
}

/// Point-in-time copy of [`ServerMetrics`] for logging.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub control_disconnects: u64,
    pub video_disconnects: u64,
    pub camera_failures: u64,
    pub frames_sent: u64,
    pub lines_received: u64,
    pub video_connected: bool,
    pub last_frame_age: Option<Duration>,
    pub last_rx_age: Option<Duration>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_control_disconnect(&self) {
        self.control_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_video_disconnect(&self) {
        self.video_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_camera_failure(&self) {
        self.camera_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.lock() = Some(Instant::now());
    }

    pub fn record_rx(&self) {
        self.lines_received.fetch_add(1, Ordering::Relaxed);
        *self.last_rx_at.lock() = Some(Instant::now());
    }

    pub fn set_video_connected(&self, connected: bool) {
        self.video_connected.store(connected, Ordering::Relaxed);
    }

    pub fn video_connected(&self) -> bool {
        self.video_connected.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn camera_failures(&self) -> u64 {
        self.camera_failures.load(Ordering::Relaxed)
    }

    pub fn video_disconnects(&self) -> u64 {
        self.video_disconnects.load(Ordering::Relaxed)
    }

    pub fn control_disconnects(&self) -> u64 {
        self.control_disconnects.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, now: Instant) -> MetricsSnapshot {
        let age = |t: &Mutex<Option<Instant>>| {
            let at = *t.lock();
            at.map(|at| now.saturating_duration_since(at))
        };
        MetricsSnapshot {
            control_disconnects: self.control_disconnects(),
            video_disconnects: self.video_disconnects(),
            camera_failures: self.camera_failures(),
            frames_sent: self.frames_sent(),
            lines_received: self.lines_received.load(Ordering::Relaxed),
            video_connected: self.video_connected(),
            last_frame_age: age(&self.last_frame_at),
            last_rx_age: age(&self.last_rx_at),
        }
    }
}

/// Formats an optional age as seconds, or `-` when nothing happened yet.
pub fn format_age(age: Option<Duration>) -> String {
    match age {
        Some(d) => format!("{:.1}s", d.as_secs_f64()),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_ages_show_up_in_snapshot() {
        let m = ServerMetrics::new();
        let empty = m.snapshot(Instant::now());
        assert_eq!(empty.frames_sent, 0);
        assert!(empty.last_frame_age.is_none());

        m.record_frame();
        m.record_frame();
        m.record_camera_failure();
        m.record_rx();
        m.set_video_connected(true);

        let snap = m.snapshot(Instant::now() + Duration::from_secs(1));
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.camera_failures, 1);
        assert_eq!(snap.lines_received, 1);
        assert!(snap.video_connected);
        assert!(snap.last_frame_age.unwrap() >= Duration::from_secs(1));
    }

    #[test]
    fn age_formatting() {
        assert_eq!(format_age(None), "-");
        assert_eq!(format_age(Some(Duration::from_millis(2500))), "2.5s");
    }
}
