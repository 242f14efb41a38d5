//! executor.rs
//! Motion executor: the only thread that moves the legs.
//!
//! Each loop iteration drains the order mailbox, keeps the newest order as the
//! current one and executes it:
//! - gait orders run one full phase cycle and stay current, so walking
//!   repeats until another order replaces them;
//! - every other order runs once and is cleared.
//!
//! Every pose goes through `apply_pose`, which rejects unreachable targets
//! before IK and funnels every servo write through one fault handler.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use super::{
    balance::{AttitudeBalancer, BodyFrame, commanded_attitude, posture_transform},
    calibration::CalibrationStore,
    gait::{Gait, level_pose},
    kinematics::{JointAngles, LegPose, solve_pose},
    state::SharedMotionState,
};
use crate::{
    config::{MotionConfig, OveruseLimits},
    error::{ActuatorError, MotionError, ServerError},
    hardware::{Attitude, AttitudeSensor, HEAD_CHANNEL, ServoDriver},
    protocol::{
        command::{Command, CommandClass},
        mailbox::{Order, OrderMailbox},
    },
};

/// Settling pause between the relaxed posture and cutting PWM.
const PWM_CUT_DELAY: Duration = Duration::from_millis(100);

pub struct MotionExecutor {
    config: MotionConfig,
    servos: Arc<dyn ServoDriver>,
    imu: Arc<dyn AttitudeSensor>,
    mailbox: Arc<OrderMailbox>,
    state: SharedMotionState,
    calibration: CalibrationStore,
    balancer: AttitudeBalancer,
    running: Arc<AtomicBool>,
    pose: LegPose,
    angles: JointAngles,
    speed: u32,
    height: f64,
    sleeper: SpinSleeper,
    last_tick: Instant,
    faults: u64,
}

impl MotionExecutor {
    pub fn new(
        config: MotionConfig,
        servos: Arc<dyn ServoDriver>,
        imu: Arc<dyn AttitudeSensor>,
        mailbox: Arc<OrderMailbox>,
        state: SharedMotionState,
        calibration: CalibrationStore,
        running: Arc<AtomicBool>,
    ) -> Self {
        let speed = config.default_speed;
        let height = config.default_height;
        state.update(|s| {
            s.speed = speed;
            s.height = height;
        });
        Self {
            balancer: AttitudeBalancer::new(config.balance.clone()),
            config,
            servos,
            imu,
            mailbox,
            state,
            calibration,
            running,
            pose: LegPose::initial(height),
            angles: JointAngles::default(),
            speed,
            height,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            last_tick: Instant::now(),
            faults: 0,
        }
    }

    pub fn pose(&self) -> &LegPose {
        &self.pose
    }

    pub fn angles(&self) -> &JointAngles {
        &self.angles
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Actuator write failures seen so far.
    pub fn faults(&self) -> u64 {
        self.faults
    }

    /// Spawns the executor on its own thread, optionally at maximum priority
    /// and pinned to a core.
    pub fn spawn(mut self) -> Result<JoinHandle<()>, ServerError> {
        let pin = self.config.pin_core;
        let builder = thread::Builder::new().name("motion".into());
        let spawned = if self.config.realtime_priority {
            builder.spawn_with_priority(ThreadPriority::Max, move |res| {
                if let Err(e) = res {
                    debug!("[MOTION] running at default priority: {e:?}");
                }
                pin_to_core(pin);
                self.run();
            })
        } else {
            builder.spawn(move || {
                pin_to_core(pin);
                self.run();
            })
        };
        spawned.map_err(|source| ServerError::Spawn { name: "motion", source })
    }

    /// Main loop. Starts relaxed with power cut, then serves orders until the
    /// running flag drops.
    pub fn run(&mut self) {
        info!("[MOTION] executor started");
        self.relax(true);
        self.last_tick = Instant::now();
        while self.running.load(Ordering::Acquire) {
            self.step(self.config.idle_poll);
        }
        info!("[MOTION] executor stopped ({} actuator faults)", self.faults);
    }

    /// One executor iteration: wait up to `wait` for new orders, then run the
    /// current one.
    pub fn step(&mut self, wait: Duration) {
        let orders = self.mailbox.drain(wait);
        self.accept(orders);

        let now = Instant::now();
        self.track_activity(now);

        let Some(order) = self.state.update(|s| s.current_order.clone()) else {
            return;
        };

        if self.state.is_resting() && order.command.class() != CommandClass::Safety {
            debug!("[MOTION] resting, ignoring {}", order.command);
            self.clear_current();
            return;
        }

        if matches!(order.command, Command::Stop) && self.hold_for_motion(now) {
            return;
        }

        let snapshot = self.state.snapshot();
        if snapshot.relaxed
            && !matches!(order.command, Command::Relax | Command::StopPwm | Command::Stop)
        {
            info!("[MOTION] waking legs for {}", order.command);
            self.stop();
        }
        if snapshot.attitude_active && !matches!(order.command, Command::Attitude { .. }) {
            self.stop();
            self.state.update(|s| s.attitude_active = false);
        }

        self.execute(order);
    }

    fn accept(&mut self, orders: Vec<Order>) {
        let Some(newest) = orders.last().cloned() else {
            return;
        };
        let last_motion = orders.iter().rev().find(|o| o.command.gait().is_some()).cloned();
        if newest.command.is_chatty() {
            debug!("[MOTION] order #{} {}", newest.sequence, newest.command);
        } else {
            info!("[MOTION] order #{} {}", newest.sequence, newest.command);
        }
        self.state.update(|s| {
            if let Some(m) = last_motion {
                s.last_motion_order = Some(m);
            }
            s.current_order = Some(newest);
        });
    }

    /// A stop arriving right after a motion order lets that motion run one more
    /// cycle before the stop takes effect. Returns true when it did.
    fn hold_for_motion(&mut self, now: Instant) -> bool {
        let grace = self.config.move_hold_grace;
        if grace.is_zero() {
            return false;
        }
        let Some(last) = self.state.update(|s| s.last_motion_order.clone()) else {
            return false;
        };
        if now.saturating_duration_since(last.received_at) >= grace {
            return false;
        }
        let Some(gait) = last.command.gait() else {
            return false;
        };
        debug!("[MOTION] holding stop for one {} cycle", gait.name());
        if self.state.is_relaxed() {
            self.stop();
        }
        self.walk(gait, &last);
        true
    }

    fn execute(&mut self, order: Order) {
        match order.command {
            Command::Move { gait, speed } => {
                if let Some(speed) = speed {
                    self.speed = speed;
                    self.state.update(|s| s.speed = speed);
                }
                self.walk(gait, &order);
                // Stays current: the cycle repeats on the next iteration.
            }
            Command::Stop => {
                self.stop();
                self.clear_current();
            }
            Command::Relax => {
                // Re-run the posture after a PWM cut even though already relaxed.
                let snapshot = self.state.snapshot();
                if !snapshot.relaxed || !snapshot.pwm_enabled {
                    self.stop();
                    self.relax(false);
                }
                self.clear_current();
            }
            Command::StopPwm => {
                self.cut_power();
                self.clear_current();
            }
            Command::Head(angle) => {
                let result = self.servos.set_servo_angle(HEAD_CHANNEL, angle.clamp(0.0, 180.0));
                self.report(result);
                self.clear_current();
            }
            Command::Height(delta) => {
                let height = self.config.default_height + delta;
                let target = level_pose(&self.pose, 0.0, height);
                if self.apply_pose(target).is_ok() {
                    self.height = height;
                    self.state.update(|s| s.height = height);
                }
                self.clear_current();
            }
            Command::Horizon(lean) => {
                let target = level_pose(&self.pose, lean, self.height);
                let _ = self.apply_pose(target);
                self.clear_current();
            }
            Command::Attitude { roll, pitch, yaw } => {
                self.state.update(|s| s.attitude_active = true);
                let target = posture_transform(
                    commanded_attitude(roll, pitch, yaw),
                    self.height,
                    BodyFrame::Grounded,
                );
                let _ = self.apply_pose(target);
                self.clear_current();
            }
            Command::Balance(true) => {
                self.clear_current();
                self.balance();
            }
            Command::Balance(false) => self.clear_current(),
            Command::Calibrate { leg, point } => {
                self.calibration.set_point(leg, point);
                info!("[MOTION] leg {leg} calibration point set to {point:?}");
                let pose = self.pose;
                let _ = self.apply_pose(pose);
                self.clear_current();
            }
            Command::SaveCalibration => {
                if let Err(e) = self.calibration.save() {
                    warn!("[MOTION] {e}");
                }
                self.stop();
                self.clear_current();
            }
            Command::Power
            | Command::Sonic
            | Command::WorkingTime
            | Command::AttitudeQuery
            | Command::Led(_)
            | Command::LedMode(_)
            | Command::Buzzer(_) => {
                debug!("[MOTION] {} is not a motion order", order.command);
                self.clear_current();
            }
        }
    }

    fn clear_current(&self) {
        self.state.update(|s| s.current_order = None);
    }

    /// True when a newer order of a different kind has been posted.
    fn superseded(&self, running: &Order) -> bool {
        self.mailbox
            .latest()
            .is_some_and(|l| l.sequence > running.sequence && !l.command.same_kind(&running.command))
    }

    /// One full gait cycle.
    fn walk(&mut self, gait: Gait, order: &Order) {
        for phase in gait.phases(self.speed) {
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            if self.config.preempt_on_new_command && self.superseded(order) {
                info!("[MOTION] {} preempted at phase {phase}", gait.name());
                return;
            }
            let _ = self.apply_pose(gait.pose_at(phase, self.height));
            self.pause(self.config.step_interval);
        }
    }

    /// Stands up into the neutral stance at the current height.
    pub fn stop(&mut self) {
        self.interpolate_to(LegPose::neutral(self.height));
        self.state.update(|s| {
            s.relaxed = false;
            s.relaxed_since = None;
        });
    }

    /// Lies down. With `cut_power` the servos are switched off afterwards.
    pub fn relax(&mut self, cut_power: bool) {
        self.interpolate_to(LegPose::relaxed());
        let now = Instant::now();
        self.state.update(|s| {
            if !s.relaxed {
                s.relaxed_since = Some(now);
            }
            s.relaxed = true;
        });
        if cut_power {
            self.pause(PWM_CUT_DELAY.min(self.config.step_interval * 10));
            self.cut_power();
        }
    }

    fn cut_power(&mut self) {
        let result = self.servos.stop_all_pwm();
        self.report(result);
        let now = Instant::now();
        self.state.update(|s| {
            s.pwm_enabled = false;
            if !s.relaxed {
                s.relaxed_since = Some(now);
            }
            s.relaxed = true;
        });
        info!("[MOTION] PWM disabled");
    }

    fn interpolate_to(&mut self, target: LegPose) {
        let from = self.pose;
        let steps = self.config.interpolation_steps;
        for k in 1..=steps.max(1) {
            let _ = self.apply_pose(from.lerp(&target, k, steps));
            self.pause(self.config.step_interval);
        }
    }

    /// Solves `pose` and writes all twelve leg servos. Unreachable poses are
    /// dropped whole; nothing is written and the previous pose stays current.
    pub fn apply_pose(&mut self, pose: LegPose) -> Result<(), MotionError> {
        let angles = match solve_pose(&pose, self.calibration.offsets()) {
            Ok(angles) => angles,
            Err(e) => {
                warn!("[MOTION] skipping tick: {e}");
                return Err(e);
            }
        };
        self.pose = pose;
        self.angles = angles;
        for (channel, degrees) in angles.channel_writes() {
            let result = self.servos.set_servo_angle(channel, degrees);
            self.report(result);
        }
        self.state.update(|s| s.pwm_enabled = true);
        Ok(())
    }

    /// Single place actuator failures are handled: log and keep going.
    fn report(&mut self, result: Result<(), ActuatorError>) {
        if let Err(e) = result {
            self.faults += 1;
            if self.faults.is_power_of_two() {
                warn!("[MOTION] {e} (fault #{})", self.faults);
            } else {
                debug!("[MOTION] {e}");
            }
        }
    }

    fn pause(&self, d: Duration) {
        if !d.is_zero() {
            self.sleeper.sleep(d);
        }
    }

    /// Accumulates active time and enforces overuse rests.
    fn track_activity(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        let rest_period = self.config.overuse.unwrap_or_default().rest;

        let (accum, resting) = self.state.update(|s| {
            if !s.relaxed {
                s.move_seconds_accum += dt;
            } else if s.rest_elapsed(now) >= rest_period && (s.move_seconds_accum > 0.0 || s.resting) {
                s.move_seconds_accum = 0.0;
                if s.resting {
                    info!("[MOTION] rest complete");
                }
                s.resting = false;
            }
            (s.move_seconds_accum, s.resting)
        });

        if let Some(OveruseLimits { active_limit, .. }) = self.config.overuse {
            if !resting && accum >= active_limit.as_secs_f64() {
                warn!("[MOTION] active for {accum:.0}s, forcing a rest");
                self.state.update(|s| {
                    s.resting = true;
                    s.current_order = None;
                });
                self.relax(true);
            }
        }
    }

    /// Closed-loop balancing until a new order arrives or the session cap
    /// is reached.
    fn balance(&mut self) {
        info!("[MOTION] balance on");
        self.state.update(|s| s.balancing = true);
        self.balancer.reset();

        let level = posture_transform(Attitude::default(), self.height, BodyFrame::Raised);
        let _ = self.apply_pose(level);
        self.pause(self.config.balance.settle_before_zero);
        if let Err(e) = self.balancer.calibrate(&*self.imu) {
            warn!("[MOTION] balance aborted, imu unavailable: {e}");
            self.state.update(|s| s.balancing = false);
            return;
        }
        self.pause(self.config.balance.settle_after_zero);

        let started = Instant::now();
        let tick = self.config.balance.tick;
        let cap = self.config.balance.max_duration;
        while self.running.load(Ordering::Acquire) {
            if self.mailbox.has_pending() {
                break;
            }
            if started.elapsed() >= cap {
                info!("[MOTION] balance session capped at {}s", cap.as_secs());
                break;
            }
            self.track_activity(Instant::now());
            match self.imu.read_attitude() {
                Ok(sample) => {
                    let correction = self.balancer.correct(sample);
                    let target = posture_transform(correction, self.height, BodyFrame::Raised);
                    let _ = self.apply_pose(target);
                }
                Err(e) => debug!("[MOTION] imu sample skipped: {e}"),
            }
            self.pause(tick);
        }
        self.state.update(|s| s.balancing = false);
        info!("[MOTION] balance off");
    }
}

fn pin_to_core(core: Option<usize>) {
    let Some(index) = core else {
        return;
    };
    match core_affinity::get_core_ids().and_then(|ids| ids.into_iter().nth(index)) {
        Some(id) if core_affinity::set_for_current(id) => {
            info!("[MOTION] pinned to core {index}");
        }
        _ => warn!("[MOTION] could not pin to core {index}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::BalanceConfig,
        hardware::sim::{SimImu, SimServos},
        motion::{calibration::CalibrationStore, state::MotionState},
        protocol::mailbox::{ClientId, OrderSource},
    };
    use std::{env, process};

    struct Rig {
        exec: MotionExecutor,
        servos: Arc<SimServos>,
        mailbox: Arc<OrderMailbox>,
        state: SharedMotionState,
    }

    fn test_config() -> MotionConfig {
        MotionConfig {
            step_interval: Duration::ZERO,
            idle_poll: Duration::ZERO,
            move_hold_grace: Duration::ZERO,
            realtime_priority: false,
            balance: BalanceConfig {
                zero_samples: 5,
                settle_before_zero: Duration::ZERO,
                settle_after_zero: Duration::ZERO,
                tick: Duration::ZERO,
                max_duration: Duration::from_millis(50),
                ..BalanceConfig::default()
            },
            ..MotionConfig::default()
        }
    }

    fn rig_with(config: MotionConfig, servos: Arc<dyn ServoDriver>, sim: Arc<SimServos>, mailbox: Arc<OrderMailbox>) -> Rig {
        let state = SharedMotionState::new(MotionState::new(8, 99.0));
        let path = env::temp_dir().join(format!("dog_server_exec_{}.txt", process::id()));
        let exec = MotionExecutor::new(
            config,
            servos,
            Arc::new(SimImu::with_noise(0.0)),
            mailbox.clone(),
            state.clone(),
            CalibrationStore::neutral(path),
            Arc::new(AtomicBool::new(true)),
        );
        Rig { exec, servos: sim, mailbox, state }
    }

    fn rig(config: MotionConfig) -> Rig {
        let sim = Arc::new(SimServos::new());
        rig_with(config, sim.clone(), sim, Arc::new(OrderMailbox::new(16)))
    }

    fn post(mailbox: &OrderMailbox, command: Command) -> u64 {
        let raw = command.to_string();
        mailbox.post(command, raw, OrderSource::Client(ClientId::from("127.0.0.1:9")))
    }

    fn forward() -> Command {
        Command::Move { gait: Gait::Forward, speed: Some(8) }
    }

    /// Servo driver that posts an order once a given number of writes happened.
    struct PostingServos {
        inner: Arc<SimServos>,
        mailbox: Arc<OrderMailbox>,
        after: u64,
        command: Command,
        posted: AtomicBool,
    }

    impl ServoDriver for PostingServos {
        fn set_servo_angle(&self, channel: u8, degrees: f64) -> Result<(), ActuatorError> {
            let result = self.inner.set_servo_angle(channel, degrees);
            if self.inner.write_count() >= self.after && !self.posted.swap(true, Ordering::AcqRel) {
                post(&self.mailbox, self.command.clone());
            }
            result
        }

        fn stop_all_pwm(&self) -> Result<(), ActuatorError> {
            self.inner.stop_all_pwm()
        }
    }

    #[test]
    fn startup_relax_cuts_power() {
        let mut r = rig(test_config());
        r.exec.relax(true);
        assert_eq!(r.exec.pose(), &LegPose::relaxed());
        assert!(!r.servos.pwm_enabled());
        let s = r.state.snapshot();
        assert!(s.relaxed);
        assert!(!s.pwm_enabled);
    }

    #[test]
    fn stop_stands_in_neutral_stance() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
        assert_eq!(r.servos.write_count(), 50 * 12);
        assert!(r.state.snapshot().current_order.is_none());
    }

    #[test]
    fn walking_repeats_until_stopped() {
        let mut r = rig(test_config());
        let seq = post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        let after_one = r.servos.write_count();
        assert_eq!(after_one, 46 * 12);
        assert_eq!(r.state.snapshot().current_order.unwrap().sequence, seq);

        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), after_one * 2);

        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
        assert!(r.state.snapshot().current_order.is_none());
    }

    #[test]
    fn relaxed_legs_wake_before_walking() {
        let mut r = rig(test_config());
        r.exec.relax(true);
        let base = r.servos.write_count();
        post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count() - base, 50 * 12 + 46 * 12);
        assert!(!r.state.is_relaxed());
        assert!(r.servos.pwm_enabled());
    }

    #[test]
    fn unreachable_height_writes_nothing() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        let before = r.servos.write_count();
        let pose = *r.exec.pose();

        post(&r.mailbox, Command::Height(100.0));
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), before);
        assert_eq!(r.exec.pose(), &pose);
        assert_eq!(r.state.snapshot().height, 99.0);
    }

    #[test]
    fn height_and_horizon_move_all_feet() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Height(-10.0));
        r.exec.step(Duration::ZERO);
        assert!(r.exec.pose().0.iter().all(|f| f[1] == 89.0));

        post(&r.mailbox, Command::Horizon(5.0));
        r.exec.step(Duration::ZERO);
        assert!(r.exec.pose().0.iter().all(|f| f[0] == 15.0 && f[1] == 89.0));
    }

    #[test]
    fn head_goes_to_channel_fifteen() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        post(&r.mailbox, Command::Head(120.0));
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.angle(HEAD_CHANNEL), Some(120.0));
    }

    #[test]
    fn stop_pwm_cuts_power_without_moving() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        let writes = r.servos.write_count();
        post(&r.mailbox, Command::StopPwm);
        r.exec.step(Duration::ZERO);
        assert!(!r.servos.pwm_enabled());
        assert_eq!(r.servos.write_count(), writes);
        assert!(r.state.is_relaxed());
    }

    #[test]
    fn relax_after_pwm_cut_powers_the_posture_again() {
        let mut r = rig(test_config());
        r.exec.relax(true);
        assert!(!r.servos.pwm_enabled());

        let before = r.servos.write_count();
        post(&r.mailbox, Command::Relax);
        r.exec.step(Duration::ZERO);
        assert!(r.servos.write_count() > before);
        assert!(r.servos.pwm_enabled());
        assert_eq!(r.exec.pose(), &LegPose::relaxed());
        assert!(r.state.is_relaxed());

        // Already relaxed with power on: nothing to do.
        let settled = r.servos.write_count();
        post(&r.mailbox, Command::Relax);
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), settled);
    }

    #[test]
    fn attitude_then_move_restores_stance_first() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        post(&r.mailbox, Command::Attitude { roll: 20.0, pitch: 0.0, yaw: 0.0 });
        r.exec.step(Duration::ZERO);
        assert!(r.state.snapshot().attitude_active);
        assert_ne!(r.exec.pose(), &LegPose::neutral(99.0));

        let before = r.servos.write_count();
        post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        assert!(!r.state.snapshot().attitude_active);
        assert_eq!(r.servos.write_count() - before, 50 * 12 + 46 * 12);
    }

    #[test]
    fn preemption_aborts_running_cycle() {
        let sim = Arc::new(SimServos::new());
        let mailbox = Arc::new(OrderMailbox::new(16));
        let driver = Arc::new(PostingServos {
            inner: sim.clone(),
            mailbox: mailbox.clone(),
            after: 5 * 12,
            command: Command::Stop,
            posted: AtomicBool::new(false),
        });
        let config = MotionConfig { preempt_on_new_command: true, ..test_config() };
        let mut r = rig_with(config, driver, sim, mailbox);
        post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        assert!(r.servos.write_count() < 46 * 12);
        assert_eq!(r.mailbox.latest().unwrap().command, Command::Stop);
    }

    #[test]
    fn without_preemption_cycle_completes() {
        let sim = Arc::new(SimServos::new());
        let mailbox = Arc::new(OrderMailbox::new(16));
        let driver = Arc::new(PostingServos {
            inner: sim.clone(),
            mailbox: mailbox.clone(),
            after: 5 * 12,
            command: Command::Stop,
            posted: AtomicBool::new(false),
        });
        let mut r = rig_with(test_config(), driver, sim, mailbox);
        post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), 46 * 12);

        r.exec.step(Duration::ZERO);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
    }

    #[test]
    fn stop_right_after_motion_runs_one_more_cycle() {
        let config = MotionConfig {
            move_hold_grace: Duration::from_millis(200),
            ..test_config()
        };
        let mut r = rig(config);
        post(&r.mailbox, forward());
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), 46 * 12);
        assert_eq!(r.state.snapshot().current_order.unwrap().command, Command::Stop);

        thread::sleep(Duration::from_millis(250));
        r.exec.step(Duration::ZERO);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
        assert!(r.state.snapshot().current_order.is_none());
    }

    #[test]
    fn actuator_fault_does_not_stop_the_pose() {
        let mut r = rig(test_config());
        r.servos.fail_channel(Some(4));
        post(&r.mailbox, Command::Stop);
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), 50 * 11);
        assert_eq!(r.exec.faults(), 50);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
    }

    #[test]
    fn balance_session_ends_at_cap() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Balance(true));
        let start = Instant::now();
        r.exec.step(Duration::ZERO);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!r.state.snapshot().balancing);
        assert!(r.servos.write_count() > 0);
    }

    #[test]
    fn balance_session_ends_on_new_order() {
        let sim = Arc::new(SimServos::new());
        let mailbox = Arc::new(OrderMailbox::new(16));
        let driver = Arc::new(PostingServos {
            inner: sim.clone(),
            mailbox: mailbox.clone(),
            after: 50 * 12 + 40 * 12,
            command: Command::Balance(false),
            posted: AtomicBool::new(false),
        });
        let mut config = test_config();
        config.balance.max_duration = Duration::from_secs(30);
        let mut r = rig_with(config, driver, sim, mailbox);
        post(&r.mailbox, Command::Balance(true));
        let start = Instant::now();
        r.exec.step(Duration::ZERO);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(r.mailbox.has_pending());

        r.exec.step(Duration::ZERO);
        assert!(r.state.snapshot().current_order.is_none());
    }

    #[test]
    fn calibration_changes_offsets_and_saves() {
        let mut r = rig(test_config());
        post(&r.mailbox, Command::Calibrate { leg: 0, point: [4.0, 99.0, 10.0] });
        r.exec.step(Duration::ZERO);
        assert_ne!(r.exec.calibration().offsets()[0], [0.0; 3]);

        post(&r.mailbox, Command::SaveCalibration);
        r.exec.step(Duration::ZERO);
        let reloaded = CalibrationStore::load_or_neutral(
            env::temp_dir().join(format!("dog_server_exec_{}.txt", process::id())),
        );
        assert_eq!(reloaded.points().0[0], [4.0, 99.0, 10.0]);
        assert_eq!(r.exec.pose(), &LegPose::neutral(99.0));
    }

    #[test]
    fn overuse_forces_rest_and_drops_orders() {
        let config = MotionConfig {
            overuse: Some(OveruseLimits {
                active_limit: Duration::ZERO,
                rest: Duration::from_secs(3600),
            }),
            ..test_config()
        };
        let mut r = rig(config);
        r.exec.step(Duration::ZERO);
        assert!(r.state.is_resting());
        assert!(!r.servos.pwm_enabled());

        let writes = r.servos.write_count();
        post(&r.mailbox, forward());
        r.exec.step(Duration::ZERO);
        assert_eq!(r.servos.write_count(), writes);
        assert!(r.state.snapshot().current_order.is_none());
    }
}
