//! Control port.
//!
//! The accept loop hands every client its own handler thread. A handler
//! buffers bytes until a newline, routes each complete line through the
//! [`CommandRouter`] and writes back whatever reply the router produced.
//! Routing decides, per command class:
//! - telemetry is answered on the spot from the sensors;
//! - safety orders are always posted;
//! - writes need the battery lockout to be clear and write ownership.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use super::{clients::ClientRegistry, listener::ListenerSocket, ownership::OwnershipArbiter};
use crate::{
    error::{ActuatorError, ProtocolError, ServerError},
    hardware::{BeepPattern, Hardware, LightPattern},
    monitor::battery::BatteryMonitor,
    motion::state::SharedMotionState,
    protocol::{
        command::{Command, CommandClass},
        mailbox::{ClientId, OrderMailbox, OrderSource},
    },
    utils::metrics::ServerMetrics,
};

/// Longest line accepted without a newline before the buffer is discarded.
const MAX_LINE: usize = 4096;
/// Back-off while the listener is closed and waiting for the health monitor.
const UNBOUND_WAIT: Duration = Duration::from_millis(100);
/// A client that stops reading is dropped once a reply stalls this long.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of routing one control line.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Telemetry answer to write back.
    Reply(String),
    /// Posted to the motion mailbox.
    Posted { sequence: u64 },
    /// Handled on the spot (indicator commands).
    Applied,
    /// Write refused; carries the `CMD_BUSY` line.
    Busy(String),
    /// Write dropped during low-battery lockout.
    LockedOut,
    Rejected(ProtocolError),
}

impl Dispatch {
    /// Bytes to send back to the client, if any.
    pub fn reply(&self) -> Option<&str> {
        match self {
            Dispatch::Reply(r) | Dispatch::Busy(r) => Some(r),
            _ => None,
        }
    }
}

pub struct CommandRouter {
    mailbox: Arc<OrderMailbox>,
    arbiter: Arc<OwnershipArbiter>,
    battery: Arc<BatteryMonitor>,
    hardware: Hardware,
    motion: SharedMotionState,
}

impl CommandRouter {
    pub fn new(
        mailbox: Arc<OrderMailbox>,
        arbiter: Arc<OwnershipArbiter>,
        battery: Arc<BatteryMonitor>,
        hardware: Hardware,
        motion: SharedMotionState,
    ) -> Self {
        Self {
            mailbox,
            arbiter,
            battery,
            hardware,
            motion,
        }
    }

    pub fn route(&self, client: &ClientId, line: &str) -> Dispatch {
        let command = match Command::parse(line) {
            Ok(c) => c,
            Err(e) => {
                warn!("[CTRL] {client}: dropped line: {e}");
                return Dispatch::Rejected(e);
            }
        };
        if command.is_chatty() {
            debug!("[CTRL] {client}: {command}");
        } else {
            info!("[CTRL] {client}: {command}");
        }

        match command.class() {
            CommandClass::Telemetry => Dispatch::Reply(self.telemetry(&command)),
            CommandClass::Safety => {
                let relax = matches!(command, Command::Relax);
                let sequence = self.post(client, command, line);
                if relax {
                    let confirm = BeepPattern::Pulses {
                        count: 1,
                        on: Duration::from_millis(50),
                        off: Duration::ZERO,
                    };
                    report(self.hardware.indicator.beep(&confirm));
                }
                Dispatch::Posted { sequence }
            }
            CommandClass::Write => {
                if self.battery.lockout_active() {
                    if self.battery.should_log_lockout(Instant::now()) {
                        info!("[CTRL] low battery lockout, ignoring {}", command.name());
                    }
                    return Dispatch::LockedOut;
                }
                if let Err(denied) = self.arbiter.authorize_write(client) {
                    info!("[CTRL] {client}: {} refused, {denied}", command.name());
                    return Dispatch::Busy(denied.reply());
                }
                self.write(client, command, line)
            }
        }
    }

    fn write(&self, client: &ClientId, command: Command, line: &str) -> Dispatch {
        let indicator = &self.hardware.indicator;
        match command {
            Command::Led(params) => {
                report(indicator.light(&LightPattern::Color(params)));
                Dispatch::Applied
            }
            Command::LedMode(params) => {
                report(indicator.light(&LightPattern::Mode(params)));
                Dispatch::Applied
            }
            Command::Buzzer(on) => {
                let pattern = if on { BeepPattern::On } else { BeepPattern::Off };
                report(indicator.beep(&pattern));
                Dispatch::Applied
            }
            other => Dispatch::Posted {
                sequence: self.post(client, other, line),
            },
        }
    }

    fn post(&self, client: &ClientId, command: Command, line: &str) -> u64 {
        self.mailbox
            .post(command, line.trim(), OrderSource::Client(client.clone()))
    }

    /// Answers a telemetry query. Sensor failures yield sentinel values.
    fn telemetry(&self, command: &Command) -> String {
        match command {
            Command::Power => {
                let volts = self.battery.power_reading(&*self.hardware.power);
                let resting = u8::from(self.motion.is_resting());
                format!("CMD_POWER#{volts:.2}\nCMD_RELAX#{resting}\n")
            }
            Command::Sonic => {
                let cm = self.hardware.range.read_distance_cm().unwrap_or_else(|e| {
                    debug!("[CTRL] {e}");
                    0.0
                });
                format!("CMD_SONIC#{cm:.0}\n")
            }
            Command::AttitudeQuery => {
                let a = self.hardware.imu.read_attitude().unwrap_or_else(|e| {
                    debug!("[CTRL] {e}");
                    Default::default()
                });
                format!(
                    "CMD_ATTITUDE#ROLL:{:.2}#PITCH:{:.2}#YAW:{:.2}\n",
                    a.roll, a.pitch, a.yaw
                )
            }
            Command::WorkingTime => {
                let (active, rest) = self.motion.working_time(Instant::now());
                format!("CMD_WORKING_TIME#{active:.0}#{rest:.0}\n")
            }
            other => {
                debug!("[CTRL] {} has no telemetry reply", other.name());
                String::new()
            }
        }
    }
}

fn report(result: Result<(), ActuatorError>) {
    if let Err(e) = result {
        warn!("[CTRL] {e}");
    }
}

/// Accept loop plus per-client handlers for the control port.
pub struct ControlServer {
    listener: Arc<ListenerSocket>,
    router: Arc<CommandRouter>,
    clients: Arc<ClientRegistry>,
    arbiter: Arc<OwnershipArbiter>,
    metrics: Arc<ServerMetrics>,
    running: Arc<AtomicBool>,
    accept_timeout: Duration,
    read_timeout: Duration,
}

impl ControlServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: Arc<ListenerSocket>,
        router: Arc<CommandRouter>,
        clients: Arc<ClientRegistry>,
        arbiter: Arc<OwnershipArbiter>,
        metrics: Arc<ServerMetrics>,
        running: Arc<AtomicBool>,
        accept_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            listener,
            router,
            clients,
            arbiter,
            metrics,
            running,
            accept_timeout,
            read_timeout,
        }
    }

    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<()>, ServerError> {
        thread::Builder::new()
            .name("control-accept".into())
            .spawn(move || self.accept_loop())
            .map_err(|source| ServerError::Spawn { name: "control-accept", source })
    }

    fn accept_loop(self: Arc<Self>) {
        info!("[CTRL] accept loop started");
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept_timeout(self.accept_timeout) {
                Ok(Some((stream, addr))) => {
                    let server = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("control-{addr}"))
                        .spawn(move || server.handle(stream, addr));
                    if let Err(e) = spawned {
                        warn!("[CTRL] could not spawn handler for {addr}: {e}");
                    }
                }
                Ok(None) => {}
                Err(ServerError::NotBound) => thread::sleep(UNBOUND_WAIT),
                Err(e) => warn!("[CTRL] {e}"),
            }
        }
        self.clients.shutdown_all();
        info!("[CTRL] accept loop stopped");
    }

    fn handle(&self, stream: TcpStream, addr: SocketAddr) {
        let id = ClientId::from(addr);
        info!("[CTRL] client connected: {id}");
        match stream.try_clone() {
            Ok(clone) => self.clients.register(id.clone(), addr, clone),
            Err(e) => debug!("[CTRL] {id}: not registered: {e}"),
        }
        if let Err(e) = self.serve(stream, &id) {
            debug!("[CTRL] {id}: connection error: {e}");
        }
        self.arbiter.release(&id);
        self.clients.remove(&id);
        self.metrics.record_control_disconnect();
        info!("[CTRL] client disconnected: {id}");
    }

    fn serve(&self, mut stream: TcpStream, id: &ClientId) -> io::Result<()> {
        prepare_stream(&stream, self.read_timeout)?;
        let mut pending: Vec<u8> = Vec::with_capacity(256);
        let mut buf = [0u8; 1024];

        while self.running.load(Ordering::Acquire) {
            let n = match stream.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            pending.extend_from_slice(&buf[..n]);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..pos]);
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                self.metrics.record_rx();
                if let Some(reply) = self.router.route(id, line).reply() {
                    stream.write_all(reply.as_bytes())?;
                }
            }
            if pending.len() > MAX_LINE {
                warn!("[CTRL] {id}: discarding {} bytes without a newline", pending.len());
                pending.clear();
            }
        }
        Ok(())
    }
}

/// Read timeout keeps the handler polling the running flag; write timeout
/// bounds how long a non-reading client can hold its handler.
fn prepare_stream(stream: &TcpStream, read_timeout: Duration) -> io::Result<()> {
    stream.set_read_timeout(Some(read_timeout))?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.set_nodelay(true).ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BatteryConfig, VideoConfig},
        hardware::sim::{IndicatorEvent, SimImu, SimIndicator, SimPower},
        hardware::Attitude,
        motion::state::MotionState,
    };

    struct Fixture {
        router: CommandRouter,
        mailbox: Arc<OrderMailbox>,
        battery: Arc<BatteryMonitor>,
        indicator: Arc<SimIndicator>,
        imu: Arc<SimImu>,
        power: Arc<SimPower>,
        motion: SharedMotionState,
    }

    fn fixture() -> Fixture {
        let mut hardware = Hardware::simulated(&VideoConfig::default());
        let indicator = Arc::new(SimIndicator::new());
        let imu = Arc::new(SimImu::with_noise(0.0));
        let power = Arc::new(SimPower::new(7.5));
        hardware.indicator = indicator.clone();
        hardware.imu = imu.clone();
        hardware.power = power.clone();

        let mailbox = Arc::new(OrderMailbox::new(16));
        let battery = Arc::new(BatteryMonitor::new(BatteryConfig::default()));
        let motion = SharedMotionState::new(MotionState::new(8, 99.0));
        let router = CommandRouter::new(
            mailbox.clone(),
            Arc::new(OwnershipArbiter::new(Duration::from_secs(8))),
            battery.clone(),
            hardware,
            motion.clone(),
        );
        Fixture { router, mailbox, battery, indicator, imu, power, motion }
    }

    fn a() -> ClientId {
        ClientId::from("10.0.0.5:40000")
    }

    fn b() -> ClientId {
        ClientId::from("10.0.0.6:40001")
    }

    fn lock_out(battery: &BatteryMonitor) {
        let t0 = Instant::now();
        battery.evaluate(5.0, t0);
        battery.evaluate(5.0, t0 + Duration::from_secs(4));
        assert!(battery.lockout_active());
    }

    #[test]
    fn attitude_query_replies_with_three_fields() {
        let f = fixture();
        f.imu.set_attitude(Attitude { roll: 1.5, pitch: -2.25, yaw: 0.0 });
        let reply = f.router.route(&a(), "CMD_ATTITUDE");
        assert_eq!(
            reply,
            Dispatch::Reply("CMD_ATTITUDE#ROLL:1.50#PITCH:-2.25#YAW:0.00\n".into())
        );
        assert!(f.mailbox.latest().is_none());
    }

    #[test]
    fn attitude_sentinel_when_imu_fails() {
        let f = fixture();
        f.imu.set_failing(true);
        assert_eq!(
            f.router.route(&a(), "CMD_ATTITUDE").reply(),
            Some("CMD_ATTITUDE#ROLL:0.00#PITCH:0.00#YAW:0.00\n")
        );
    }

    #[test]
    fn power_reply_includes_rest_flag() {
        let f = fixture();
        assert_eq!(
            f.router.route(&a(), "CMD_POWER").reply(),
            Some("CMD_POWER#7.50\nCMD_RELAX#0\n")
        );
        f.motion.update(|s| s.resting = true);
        f.power.set_voltage(6.8);
        assert_eq!(
            f.router.route(&a(), "CMD_POWER").reply(),
            Some("CMD_POWER#6.80\nCMD_RELAX#1\n")
        );
        // A failed read reports the last samples.
        f.power.set_failing(true);
        assert_eq!(
            f.router.route(&a(), "CMD_POWER").reply(),
            Some("CMD_POWER#6.80\nCMD_RELAX#1\n")
        );
    }

    #[test]
    fn second_writer_gets_busy_but_safety_passes() {
        let f = fixture();
        assert!(matches!(
            f.router.route(&a(), "CMD_MOVE_FORWARD#8"),
            Dispatch::Posted { .. }
        ));
        assert_eq!(
            f.router.route(&b(), "CMD_ATTITUDE#5#0#0"),
            Dispatch::Busy("CMD_BUSY#OWNER:10.0.0.5:40000\n".into())
        );

        let Dispatch::Posted { sequence } = f.router.route(&b(), "CMD_MOVE_STOP") else {
            panic!("stop was not posted");
        };
        let latest = f.mailbox.latest().unwrap();
        assert_eq!(latest.sequence, sequence);
        assert_eq!(latest.command, Command::Stop);
        assert_eq!(latest.source, OrderSource::Client(b()));
    }

    #[test]
    fn lockout_drops_writes_but_not_safety() {
        let f = fixture();
        lock_out(&f.battery);
        assert_eq!(f.router.route(&a(), "CMD_MOVE_FORWARD#8"), Dispatch::LockedOut);
        assert_eq!(f.router.route(&a(), "CMD_LED#255#0#0"), Dispatch::LockedOut);
        assert!(f.mailbox.latest().is_none());
        assert!(matches!(f.router.route(&a(), "CMD_STOP_PWM"), Dispatch::Posted { .. }));
    }

    #[test]
    fn indicator_commands_bypass_the_mailbox() {
        let f = fixture();
        assert_eq!(f.router.route(&a(), "CMD_BUZZER#1"), Dispatch::Applied);
        assert_eq!(f.router.route(&a(), "CMD_LED_MOD#2"), Dispatch::Applied);
        assert!(f.mailbox.latest().is_none());
        let events = f.indicator.events();
        assert_eq!(events[0], IndicatorEvent::Beep(BeepPattern::On));
        assert_eq!(events[1], IndicatorEvent::Light(LightPattern::Mode(vec!["2".into()])));
    }

    #[test]
    fn relax_is_posted_with_a_confirmation_beep() {
        let f = fixture();
        assert!(matches!(f.router.route(&b(), "CMD_RELAX"), Dispatch::Posted { .. }));
        assert!(matches!(
            f.indicator.events()[0],
            IndicatorEvent::Beep(BeepPattern::Pulses { count: 1, .. })
        ));
    }

    #[test]
    fn malformed_lines_have_no_side_effects() {
        let f = fixture();
        assert!(matches!(f.router.route(&a(), "CMD_FLY#3"), Dispatch::Rejected(_)));
        assert!(matches!(f.router.route(&a(), "CMD_HEAD"), Dispatch::Rejected(_)));
        assert!(f.mailbox.latest().is_none());
        // A rejected line does not claim ownership.
        assert!(matches!(f.router.route(&b(), "CMD_HEAD#90"), Dispatch::Posted { .. }));
    }

    #[test]
    fn client_streams_get_read_and_write_timeouts() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();

        prepare_stream(&stream, Duration::from_millis(250)).unwrap();
        assert_eq!(stream.read_timeout().unwrap(), Some(Duration::from_millis(250)));
        assert_eq!(stream.write_timeout().unwrap(), Some(WRITE_TIMEOUT));
    }

    #[test]
    fn working_time_reply_has_two_fields() {
        let f = fixture();
        f.motion.update(|s| s.move_seconds_accum = 42.4);
        assert_eq!(
            f.router.route(&a(), "CMD_WORKING_TIME").reply(),
            Some("CMD_WORKING_TIME#42#0\n")
        );
    }
}
