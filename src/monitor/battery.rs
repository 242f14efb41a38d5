//! Low-battery protection.
//!
//! A 1 Hz poll feeds [`BatteryMonitor::evaluate`]. Once the pack has stayed
//! under the threshold for the debounce period the monitor goes into lockout:
//! it forces one relax, then one PWM cut after a grace delay, warns
//! periodically, and makes the control router drop write commands. Any sample
//! back at or above the threshold ends the lockout immediately.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use super::idle;
use crate::{
    config::BatteryConfig,
    error::ServerError,
    hardware::{BeepPattern, Indicator, LightPattern, PowerSensor},
    protocol::{
        command::Command,
        mailbox::{OrderMailbox, OrderSource},
    },
};

/// Samples kept for `CMD_POWER` replies; also the number of fresh reads one
/// query takes.
pub const POWER_WINDOW: usize = 5;
/// Reported until the first successful reading.
pub const INITIAL_VOLTAGE: f64 = 8.4;

#[derive(Debug, Clone, Default)]
pub struct BatteryState {
    pub latest_voltage: Option<f64>,
    pub debounce_started_at: Option<Instant>,
    pub low_active: bool,
    pub low_active_since: Option<Instant>,
    pub relax_queued: bool,
    pub stop_pwm_queued: bool,
    pub last_warning_at: Option<Instant>,
}

/// What the poll loop has to do after one sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatteryActions {
    pub activated: bool,
    pub recovered: bool,
    pub queue_relax: bool,
    pub queue_stop_pwm: bool,
    pub warn: bool,
}

pub struct BatteryMonitor {
    config: BatteryConfig,
    state: Mutex<BatteryState>,
    window: Mutex<VecDeque<f64>>,
    last_lockout_log: Mutex<Option<Instant>>,
}

impl BatteryMonitor {
    pub fn new(config: BatteryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BatteryState::default()),
            window: Mutex::new(VecDeque::with_capacity(POWER_WINDOW)),
            last_lockout_log: Mutex::new(None),
        }
    }

    pub fn state(&self) -> BatteryState {
        self.state.lock().clone()
    }

    pub fn lockout_active(&self) -> bool {
        self.state.lock().low_active
    }

    /// True at most once per `lockout_log_interval`; gates the
    /// "ignoring command" log while locked out.
    pub fn should_log_lockout(&self, now: Instant) -> bool {
        let mut last = self.last_lockout_log.lock();
        let due = last.is_none_or(|t| now.saturating_duration_since(t) >= self.config.lockout_log_interval);
        if due {
            *last = Some(now);
        }
        due
    }

    /// Pushes one voltage sample into the `CMD_POWER` window.
    pub fn record_sample(&self, voltage: f64) {
        let mut window = self.window.lock();
        if window.len() == POWER_WINDOW {
            window.pop_front();
        }
        window.push_back(voltage);
    }

    /// Answers `CMD_POWER`: takes a full window of fresh readings and returns
    /// the maximum. Failed reads keep older samples in place.
    pub fn power_reading(&self, power: &dyn PowerSensor) -> f64 {
        for _ in 0..POWER_WINDOW {
            match power.read_voltage() {
                Ok(v) => self.record_sample(v),
                Err(e) => debug!("[BAT] power read failed: {e}"),
            }
        }
        self.window_max()
    }

    fn window_max(&self) -> f64 {
        let window = self.window.lock();
        if window.is_empty() {
            return INITIAL_VOLTAGE;
        }
        window.iter().copied().fold(f64::MIN, f64::max)
    }

    /// Advances the lockout state machine by one sample taken at `now`.
    pub fn evaluate(&self, voltage: f64, now: Instant) -> BatteryActions {
        let mut actions = BatteryActions::default();
        let mut s = self.state.lock();
        s.latest_voltage = Some(voltage);

        if voltage >= self.config.threshold_v {
            if s.low_active {
                actions.recovered = true;
            }
            *s = BatteryState {
                latest_voltage: Some(voltage),
                ..BatteryState::default()
            };
            return actions;
        }

        let started = *s.debounce_started_at.get_or_insert(now);
        if !s.low_active && now.saturating_duration_since(started) >= self.config.debounce {
            s.low_active = true;
            s.low_active_since = Some(now);
            actions.activated = true;
        }
        if !s.low_active {
            return actions;
        }

        if !s.relax_queued {
            s.relax_queued = true;
            actions.queue_relax = true;
        }
        let since = s.low_active_since.unwrap_or(now);
        if !s.stop_pwm_queued && now.saturating_duration_since(since) >= self.config.stop_pwm_delay {
            s.stop_pwm_queued = true;
            actions.queue_stop_pwm = true;
        }
        if s
            .last_warning_at
            .is_none_or(|t| now.saturating_duration_since(t) >= self.config.warning_interval)
        {
            s.last_warning_at = Some(now);
            actions.warn = true;
        }
        actions
    }

    /// Spawns the 1 Hz poll loop.
    pub fn spawn(
        self: &Arc<Self>,
        power: Arc<dyn PowerSensor>,
        indicator: Arc<dyn Indicator>,
        mailbox: Arc<OrderMailbox>,
        running: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, ServerError> {
        let monitor = self.clone();
        thread::Builder::new()
            .name("battery".into())
            .spawn(move || monitor.run(&*power, &*indicator, &mailbox, &running))
            .map_err(|source| ServerError::Spawn { name: "battery", source })
    }

    fn run(&self, power: &dyn PowerSensor, indicator: &dyn Indicator, mailbox: &OrderMailbox, running: &AtomicBool) {
        info!(
            "[BAT] monitor started (threshold {:.2} V, debounce {}s)",
            self.config.threshold_v,
            self.config.debounce.as_secs()
        );
        while running.load(Ordering::Acquire) {
            match power.read_voltage() {
                Ok(v) => {
                    self.record_sample(v);
                    let actions = self.evaluate(v, Instant::now());
                    self.apply(v, actions, indicator, mailbox);
                }
                Err(e) => debug!("[BAT] sample skipped: {e}"),
            }
            idle(running, self.config.poll_interval);
        }
        info!("[BAT] monitor stopped");
    }

    fn apply(&self, voltage: f64, actions: BatteryActions, indicator: &dyn Indicator, mailbox: &OrderMailbox) {
        if actions.activated {
            warn!("[BAT] low battery ({voltage:.2} V), locking out motion");
        }
        if actions.recovered {
            info!("[BAT] battery recovered ({voltage:.2} V), lockout cleared");
        }
        if actions.queue_relax {
            let seq = mailbox.post(Command::Relax, "CMD_RELAX#(battery_guard)", OrderSource::BatteryGuard);
            info!("[BAT] forced relax queued (#{seq})");
        }
        if actions.queue_stop_pwm {
            let seq = mailbox.post(Command::StopPwm, "CMD_STOP_PWM#(battery_guard)", OrderSource::BatteryGuard);
            info!("[BAT] forced PWM cut queued (#{seq})");
        }
        if actions.warn {
            warn!("[BAT] battery low: {voltage:.2} V");
            warning_signal(indicator);
        }
    }
}

fn warning_signal(indicator: &dyn Indicator) {
    let beeps = BeepPattern::Pulses {
        count: 2,
        on: Duration::from_millis(100),
        off: Duration::from_millis(80),
    };
    let flash = LightPattern::Flash {
        rgb: [255, 0, 0],
        count: 1,
        on: Duration::from_millis(100),
    };
    if let Err(e) = indicator.beep(&beeps).and_then(|()| indicator.light(&flash)) {
        debug!("[BAT] warning signal failed: {e}");
    }
}
