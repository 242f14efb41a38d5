//! Listener health.
//!
//! Once a second every listener is checked; one that has been closed is bound
//! again, no more often than the re-open backoff allows. Connected clients
//! are never touched. Optionally a one-line status summary is logged.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Instant,
};

use log::{info, warn};
use parking_lot::Mutex;

use super::idle;
use crate::{
    config::HealthConfig,
    error::ServerError,
    network::{clients::ClientRegistry, listener::ListenerSocket, ownership::OwnershipArbiter},
    utils::metrics::{ServerMetrics, format_age},
};

pub struct HealthMonitor {
    config: HealthConfig,
    listeners: Vec<Arc<ListenerSocket>>,
    last_attempt: Mutex<Vec<Option<Instant>>>,
    last_summary: Mutex<Option<Instant>>,
    clients: Arc<ClientRegistry>,
    arbiter: Arc<OwnershipArbiter>,
    metrics: Arc<ServerMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        listeners: Vec<Arc<ListenerSocket>>,
        clients: Arc<ClientRegistry>,
        arbiter: Arc<OwnershipArbiter>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        let last_attempt = Mutex::new(vec![None; listeners.len()]);
        Self {
            config,
            listeners,
            last_attempt,
            last_summary: Mutex::new(None),
            clients,
            arbiter,
            metrics,
        }
    }

    /// Re-binds closed listeners whose backoff has expired. Returns the roles
    /// that are listening again.
    pub fn check_once(&self, now: Instant) -> Vec<&'static str> {
        let mut rebound = Vec::new();
        let mut attempts = self.last_attempt.lock();
        for (listener, last) in self.listeners.iter().zip(attempts.iter_mut()) {
            if listener.is_bound() {
                continue;
            }
            if last.is_some_and(|t| now.saturating_duration_since(t) < self.config.reopen_backoff) {
                continue;
            }
            *last = Some(now);
            match listener.bind() {
                Ok(()) => {
                    info!("[HEALTH] {} listener re-opened on port {}", listener.role(), listener.port());
                    rebound.push(listener.role());
                }
                Err(e) => warn!("[HEALTH] {e}"),
            }
        }
        rebound
    }

    /// Status line for the periodic summary.
    pub fn summary(&self, now: Instant) -> String {
        let listening: Vec<String> = self
            .listeners
            .iter()
            .map(|l| format!("{}={}", l.role(), if l.is_bound() { "up" } else { "down" }))
            .collect();
        let m = self.metrics.snapshot(now);
        let owner = self
            .arbiter
            .holder()
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        format!(
            "{} ctrl_clients={} video={} owner={} last_frame={} last_rx={} frames={} ctrl_disc={} video_disc={} cam_fail={}",
            listening.join(" "),
            self.clients.len(),
            u8::from(m.video_connected),
            owner,
            format_age(m.last_frame_age),
            format_age(m.last_rx_age),
            m.frames_sent,
            m.control_disconnects,
            m.video_disconnects,
            m.camera_failures,
        )
    }

    fn maybe_log_summary(&self, now: Instant) {
        if !self.config.log_summary {
            return;
        }
        let mut last = self.last_summary.lock();
        if last.is_some_and(|t| now.saturating_duration_since(t) < self.config.summary_interval) {
            return;
        }
        *last = Some(now);
        info!("[HEALTH] {}", self.summary(now));
    }

    pub fn spawn(self: &Arc<Self>, running: Arc<AtomicBool>) -> Result<JoinHandle<()>, ServerError> {
        let monitor = self.clone();
        thread::Builder::new()
            .name("health".into())
            .spawn(move || {
                info!("[HEALTH] monitor started");
                while running.load(Ordering::Acquire) {
                    let now = Instant::now();
                    monitor.check_once(now);
                    monitor.maybe_log_summary(now);
                    idle(&running, monitor.config.interval);
                }
                info!("[HEALTH] monitor stopped");
            })
            .map_err(|source| ServerError::Spawn { name: "health", source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        net::{IpAddr, Ipv4Addr},
        time::Duration,
    };

    fn monitor(listener: Arc<ListenerSocket>) -> HealthMonitor {
        HealthMonitor::new(
            HealthConfig::default(),
            vec![listener],
            Arc::new(ClientRegistry::new()),
            Arc::new(OwnershipArbiter::new(Duration::from_secs(8))),
            Arc::new(ServerMetrics::new()),
        )
    }

    #[test]
    fn closed_listener_is_rebound_with_backoff() {
        let listener = Arc::new(ListenerSocket::new("CTRL", IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 4));
        listener.bind().unwrap();
        let health = monitor(listener.clone());
        let t0 = Instant::now();
        assert!(health.check_once(t0).is_empty());

        listener.close();
        assert_eq!(health.check_once(t0), vec!["CTRL"]);
        assert!(listener.is_bound());

        listener.close();
        assert!(health.check_once(t0 + Duration::from_secs(1)).is_empty());
        assert!(!listener.is_bound());
        assert_eq!(health.check_once(t0 + Duration::from_secs(2)), vec!["CTRL"]);
    }

    #[test]
    fn summary_mentions_listener_state_and_owner() {
        let listener = Arc::new(ListenerSocket::new("VIDEO", IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 1));
        let health = monitor(listener);
        let line = health.summary(Instant::now());
        assert!(line.starts_with("VIDEO=down"));
        assert!(line.contains("owner=-"));
        assert!(line.contains("ctrl_clients=0"));
    }
}
