//! Server assembly: binds the listeners, builds the shared state and starts
//! every thread. [`Server::shutdown`] stops the threads without moving the
//! robot.

use std::{
    mem,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{info, warn};

use crate::{
    config::ServerConfig,
    error::ServerError,
    hardware::{BeepPattern, Hardware, LightPattern},
    monitor::{battery::BatteryMonitor, health::HealthMonitor},
    motion::{
        calibration::CalibrationStore,
        executor::MotionExecutor,
        state::{MotionState, SharedMotionState},
    },
    network::{
        clients::ClientRegistry,
        control::{CommandRouter, ControlServer},
        listener::ListenerSocket,
        ownership::OwnershipArbiter,
        video::VideoStreamer,
    },
    protocol::mailbox::OrderMailbox,
    utils::metrics::ServerMetrics,
};

pub struct Server {
    running: Arc<AtomicBool>,
    control: Arc<ListenerSocket>,
    video: Arc<ListenerSocket>,
    mailbox: Arc<OrderMailbox>,
    motion: SharedMotionState,
    arbiter: Arc<OwnershipArbiter>,
    battery: Arc<BatteryMonitor>,
    clients: Arc<ClientRegistry>,
    metrics: Arc<ServerMetrics>,
    health: Arc<HealthMonitor>,
    handles: Vec<JoinHandle<()>>,
}

impl Server {
    /// Binds both listeners and starts all threads. Failing to bind is the
    /// only error that aborts startup; threads already running when a later
    /// spawn fails are stopped and joined before the error is returned.
    pub fn start(config: ServerConfig, hardware: Hardware) -> Result<Self, ServerError> {
        let running = Arc::new(AtomicBool::new(true));

        let control = Arc::new(ListenerSocket::new(
            "CTRL",
            config.bind_host,
            config.control_port,
            config.control_backlog,
        ));
        let video = Arc::new(ListenerSocket::new(
            "VIDEO",
            config.bind_host,
            config.video_port,
            config.video_backlog,
        ));
        control.bind()?;
        video.bind()?;

        let mailbox = Arc::new(OrderMailbox::new(config.motion.mailbox_capacity));
        let motion = SharedMotionState::new(MotionState::new(
            config.motion.default_speed,
            config.motion.default_height,
        ));
        let arbiter = Arc::new(OwnershipArbiter::new(config.ownership_timeout));
        let battery = Arc::new(BatteryMonitor::new(config.battery.clone()));
        let clients = Arc::new(ClientRegistry::new());
        let metrics = Arc::new(ServerMetrics::new());
        let mut startup = Startup::new(running.clone());

        let calibration = CalibrationStore::load_or_neutral(config.calibration_path.clone());
        let executor = MotionExecutor::new(
            config.motion.clone(),
            hardware.servos.clone(),
            hardware.imu.clone(),
            mailbox.clone(),
            motion.clone(),
            calibration,
            running.clone(),
        );
        startup.push(executor.spawn())?;

        let router = Arc::new(CommandRouter::new(
            mailbox.clone(),
            arbiter.clone(),
            battery.clone(),
            hardware.clone(),
            motion.clone(),
        ));
        let control_server = Arc::new(ControlServer::new(
            control.clone(),
            router,
            clients.clone(),
            arbiter.clone(),
            metrics.clone(),
            running.clone(),
            config.accept_timeout,
            config.read_timeout,
        ));
        startup.push(control_server.spawn())?;

        let streamer = VideoStreamer::new(
            video.clone(),
            hardware.camera.clone(),
            metrics.clone(),
            config.video.clone(),
            running.clone(),
            config.accept_timeout,
        );
        startup.push(streamer.spawn())?;

        if config.battery.enabled {
            startup.push(battery.spawn(
                hardware.power.clone(),
                hardware.indicator.clone(),
                mailbox.clone(),
                running.clone(),
            ))?;
        } else {
            info!("[Main] battery monitor disabled");
        }

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            vec![control.clone(), video.clone()],
            clients.clone(),
            arbiter.clone(),
            metrics.clone(),
        ));
        if config.health.enabled {
            startup.push(health.spawn(running.clone()))?;
        } else {
            info!("[Main] health monitor disabled");
        }

        let handles = startup.finish();
        if config.ready_signal {
            ready_signal(&hardware);
        }
        info!(
            "[Main] server ready: control {} video {}",
            control.local_addr(),
            video.local_addr()
        );

        Ok(Self {
            running,
            control,
            video,
            mailbox,
            motion,
            arbiter,
            battery,
            clients,
            metrics,
            health,
            handles,
        })
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control.local_addr()
    }

    pub fn video_addr(&self) -> SocketAddr {
        self.video.local_addr()
    }

    pub fn control_listener(&self) -> &Arc<ListenerSocket> {
        &self.control
    }

    pub fn video_listener(&self) -> &Arc<ListenerSocket> {
        &self.video
    }

    pub fn mailbox(&self) -> &Arc<OrderMailbox> {
        &self.mailbox
    }

    pub fn motion(&self) -> &SharedMotionState {
        &self.motion
    }

    pub fn arbiter(&self) -> &Arc<OwnershipArbiter> {
        &self.arbiter
    }

    pub fn battery(&self) -> &Arc<BatteryMonitor> {
        &self.battery
    }

    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Flag the binary flips from its Ctrl-C handler.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops every thread and waits for them.
    pub fn shutdown(self) {
        info!("[Main] shutting down");
        self.running.store(false, Ordering::Release);
        self.clients.shutdown_all();
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("[Main] {name} thread panicked");
            }
        }
        self.control.close();
        self.video.close();
        info!("[Main] shutdown complete");
    }
}

/// Threads started so far. Dropped before [`Startup::finish`], it clears the
/// running flag and joins them.
struct Startup {
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Startup {
    fn new(running: Arc<AtomicBool>) -> Self {
        Self {
            running,
            handles: Vec::new(),
        }
    }

    fn push(&mut self, spawned: Result<JoinHandle<()>, ServerError>) -> Result<(), ServerError> {
        self.handles.push(spawned?);
        Ok(())
    }

    fn finish(mut self) -> Vec<JoinHandle<()>> {
        mem::take(&mut self.handles)
    }
}

impl Drop for Startup {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        warn!("[Main] startup aborted, stopping {} thread(s)", self.handles.len());
        self.running.store(false, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("[Main] thread panicked during aborted startup");
            }
        }
    }
}

/// Two beeps and two blue flashes once the server is listening.
fn ready_signal(hardware: &Hardware) {
    let beeps = BeepPattern::Pulses {
        count: 2,
        on: Duration::from_millis(100),
        off: Duration::from_millis(100),
    };
    let flash = LightPattern::Flash {
        rgb: [0, 0, 255],
        count: 2,
        on: Duration::from_millis(150),
    };
    if let Err(e) = hardware.indicator.beep(&beeps) {
        warn!("[Main] ready beep failed: {e}");
    }
    if let Err(e) = hardware.indicator.light(&flash) {
        warn!("[Main] ready flash failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn worker(running: &Arc<AtomicBool>, exited: &Arc<AtomicBool>) -> Result<JoinHandle<()>, ServerError> {
        let (running, exited) = (running.clone(), exited.clone());
        thread::Builder::new()
            .name("worker".into())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    thread::sleep(Duration::from_millis(5));
                }
                exited.store(true, Ordering::Release);
            })
            .map_err(|source| ServerError::Spawn { name: "worker", source })
    }

    #[test]
    fn failed_spawn_stops_threads_already_started() {
        let running = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(AtomicBool::new(false));

        let result = (|| -> Result<Vec<JoinHandle<()>>, ServerError> {
            let mut startup = Startup::new(running.clone());
            startup.push(worker(&running, &exited))?;
            startup.push(Err(ServerError::NotBound))?;
            Ok(startup.finish())
        })();

        assert!(matches!(result, Err(ServerError::NotBound)));
        assert!(!running.load(Ordering::Acquire));
        assert!(exited.load(Ordering::Acquire));
    }

    #[test]
    fn finished_startup_leaves_threads_running() {
        let running = Arc::new(AtomicBool::new(true));
        let exited = Arc::new(AtomicBool::new(false));

        let mut startup = Startup::new(running.clone());
        startup.push(worker(&running, &exited)).unwrap();
        let handles = startup.finish();
        assert!(running.load(Ordering::Acquire));

        running.store(false, Ordering::Release);
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(exited.load(Ordering::Acquire));
    }
}
