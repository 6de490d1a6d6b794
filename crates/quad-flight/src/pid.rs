//! Multi-axis PID loop running on a dedicated thread.
//!
//! The loop regulates its own rate: every tick the sleep is the nominal
//! period minus the compute cost, plus a slow proportional term accumulating
//! the deviation between the measured period and a target slightly under the
//! nominal period.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{FlightError, Result};

/// Relative margin around the nominal period considered a healthy loop rate.
pub const PERIOD_RANGE_MARGIN: f64 = 0.1;

const PERIOD_CORRECTION_GAIN: f64 = 0.1;
const MIN_SLEEP: Duration = Duration::from_millis(1);

pub type InputFn = Box<dyn FnMut() -> Result<Vec<f64>> + Send>;
pub type OutputFn = Box<dyn FnMut(&[f64]) + Send>;

/// Targets, accumulators and gains of every channel.
#[derive(Debug, Clone)]
pub struct PidState {
    targets: Vec<f64>,
    integrals: Vec<f64>,
    last_errors: Vec<f64>,
    kp: Vec<f64>,
    ki: Vec<f64>,
    kd: Vec<f64>,
    current_period: f64,
}

impl PidState {
    pub fn new(kp: Vec<f64>, ki: Vec<f64>, kd: Vec<f64>) -> Result<Self> {
        let len = kp.len();
        if len == 0 || ki.len() != len || kd.len() != len {
            return Err(FlightError::GainLength { p: kp.len(), i: ki.len(), d: kd.len() });
        }
        Ok(Self {
            targets: vec![0.0; len],
            integrals: vec![0.0; len],
            last_errors: vec![0.0; len],
            kp,
            ki,
            kd,
            current_period: 0.0,
        })
    }

    pub fn len(&self) -> usize {
        self.kp.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kp.is_empty()
    }

    /// One PID step over all channels. `dt` is the measured time since the
    /// previous step, in seconds.
    pub fn step(&mut self, input: &[f64], dt: f64) -> Result<Vec<f64>> {
        if input.len() != self.len() {
            return Err(FlightError::VectorLength { expected: self.len(), got: input.len() });
        }

        let mut output = vec![0.0; self.len()];
        for (i, value) in input.iter().enumerate() {
            let error = self.targets[i] - value;
            self.integrals[i] += error * dt;
            let derivative = if dt > 0.0 { (error - self.last_errors[i]) / dt } else { 0.0 };
            output[i] = self.kp[i] * error + self.ki[i] * self.integrals[i] + self.kd[i] * derivative;
            self.last_errors[i] = error;
        }
        self.current_period = dt;
        Ok(output)
    }

    pub fn reset(&mut self) {
        self.integrals.iter_mut().for_each(|v| *v = 0.0);
        self.last_errors.iter_mut().for_each(|v| *v = 0.0);
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.len() {
            return Err(FlightError::ChannelOutOfRange { index, len: self.len() });
        }
        Ok(())
    }
}

/// Shared access to a [`PidState`]. Edits take the same lock a tick holds
/// while computing, so they land between ticks.
#[derive(Debug, Clone)]
pub struct PidHandle {
    state: Arc<Mutex<PidState>>,
}

impl PidHandle {
    pub fn new(kp: Vec<f64>, ki: Vec<f64>, kd: Vec<f64>) -> Result<Self> {
        Ok(Self { state: Arc::new(Mutex::new(PidState::new(kp, ki, kd)?)) })
    }

    fn lock(&self) -> MutexGuard<'_, PidState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn set_target(&self, index: usize, value: f64) -> Result<()> {
        let mut st = self.lock();
        st.check_index(index)?;
        st.targets[index] = value;
        Ok(())
    }

    pub fn set_targets(&self, targets: &[f64]) -> Result<()> {
        let mut st = self.lock();
        if targets.len() != st.len() {
            return Err(FlightError::VectorLength { expected: st.len(), got: targets.len() });
        }
        st.targets.copy_from_slice(targets);
        Ok(())
    }

    pub fn target(&self, index: usize) -> Result<f64> {
        let st = self.lock();
        st.check_index(index)?;
        Ok(st.targets[index])
    }

    pub fn targets(&self) -> Vec<f64> {
        self.lock().targets.clone()
    }

    pub fn set_gains(&self, index: usize, p: f64, i: f64, d: f64) -> Result<()> {
        let mut st = self.lock();
        st.check_index(index)?;
        st.kp[index] = p;
        st.ki[index] = i;
        st.kd[index] = d;
        Ok(())
    }

    /// (p, i, d) of one channel.
    pub fn gains(&self, index: usize) -> Result<(f64, f64, f64)> {
        let st = self.lock();
        st.check_index(index)?;
        Ok((st.kp[index], st.ki[index], st.kd[index]))
    }

    /// Last measured sample interval in seconds.
    pub fn current_period(&self) -> f64 {
        self.lock().current_period
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    fn step(&self, input: &[f64], dt: f64) -> Result<Vec<f64>> {
        self.lock().step(input, dt)
    }
}

/// Loop-rate class of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateClass {
    /// Faster than `0.9 * period`.
    OverRate,
    InRange,
    /// Slower than nominal but within `1.1 * period`.
    Acceptable,
    UnderRate,
}

impl RateClass {
    pub fn classify(measured: f64, period: f64) -> Self {
        let min_period = period * (1.0 - PERIOD_RANGE_MARGIN);
        let max_period = period * (1.0 + PERIOD_RANGE_MARGIN);
        if measured < min_period {
            RateClass::OverRate
        } else if measured <= period {
            RateClass::InRange
        } else if measured <= max_period {
            RateClass::Acceptable
        } else {
            RateClass::UnderRate
        }
    }
}

/// Diagnostics of one start/stop run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopStats {
    pub ticks: u64,
    pub compute_time_sum: f64,
    pub period_sum: f64,
    pub in_range: u64,
    pub acceptable: u64,
    pub under_rate: u64,
    pub over_rate: u64,
}

impl LoopStats {
    fn record(&mut self, compute_time: f64, measured: f64, class: RateClass) {
        self.ticks += 1;
        self.compute_time_sum += compute_time;
        self.period_sum += measured;
        match class {
            RateClass::OverRate => self.over_rate += 1,
            RateClass::InRange => self.in_range += 1,
            RateClass::Acceptable => self.acceptable += 1,
            RateClass::UnderRate => self.under_rate += 1,
        }
    }

    pub fn avg_compute_ms(&self) -> f64 {
        if self.ticks == 0 { 0.0 } else { self.compute_time_sum * 1000.0 / self.ticks as f64 }
    }

    /// Average effective loop frequency, infinite when nothing ran.
    pub fn avg_frequency_hz(&self) -> f64 {
        if self.period_sum > 0.0 { self.ticks as f64 / self.period_sum } else { f64::INFINITY }
    }

    fn percent(&self, n: u64) -> f64 {
        if self.ticks == 0 { 0.0 } else { n as f64 * 100.0 / self.ticks as f64 }
    }
}

struct PidIo {
    read_input: InputFn,
    set_output: OutputFn,
}

struct Worker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<LoopStats>,
}

pub struct Pid {
    name: String,
    period: Duration,
    state: PidHandle,
    io: Arc<Mutex<PidIo>>,
    worker: Mutex<Option<Worker>>,
    last_stats: Mutex<Option<LoopStats>>,
    runs: AtomicU64,
}

impl Pid {
    pub fn new(
        name: impl Into<String>,
        period: Duration,
        kp: Vec<f64>,
        ki: Vec<f64>,
        kd: Vec<f64>,
        read_input: InputFn,
        set_output: OutputFn,
    ) -> Result<Self> {
        let state = PidHandle::new(kp, ki, kd)?;
        Ok(Self::with_state(name, period, state, read_input, set_output))
    }

    /// Builds the engine around an existing handle, for callers whose output
    /// sink needs to edit targets (cascaded loops).
    pub fn with_state(
        name: impl Into<String>,
        period: Duration,
        state: PidHandle,
        read_input: InputFn,
        set_output: OutputFn,
    ) -> Self {
        Self {
            name: name.into(),
            period,
            state,
            io: Arc::new(Mutex::new(PidIo { read_input, set_output })),
            worker: Mutex::new(None),
            last_stats: Mutex::new(None),
            runs: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &PidHandle {
        &self.state
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn set_target(&self, index: usize, value: f64) -> Result<()> {
        self.state.set_target(index, value)
    }

    pub fn set_targets(&self, targets: &[f64]) -> Result<()> {
        self.state.set_targets(targets)
    }

    pub fn current_period(&self) -> f64 {
        self.state.current_period()
    }

    /// Number of times the loop thread was actually spawned.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn last_stats(&self) -> Option<LoopStats> {
        self.last_stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_running(&self) -> bool {
        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        worker.as_ref().map(|w| !w.handle.is_finished()).unwrap_or(false)
    }

    /// Spawns the loop thread. No-op while already running. Integrals and
    /// last errors are cleared on every actual start.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(w) = worker.as_ref() {
            if !w.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(w) = worker.take() {
            // loop exited on its own (panicking sink); collect what it left
            if let Ok(stats) = w.handle.join() {
                *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats);
            }
        }

        info!("pid {}: starting", self.name);
        self.state.reset();

        let running = Arc::new(AtomicBool::new(true));
        let ctx = LoopContext {
            name: self.name.clone(),
            period: self.period,
            state: self.state.clone(),
            io: self.io.clone(),
            running: running.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("pid-{}", self.name))
            .spawn(move || ctx.run())?;

        self.runs.fetch_add(1, Ordering::Relaxed);
        *worker = Some(Worker { running, handle });
        Ok(())
    }

    /// Signals the loop to exit and joins it. Returns the run's statistics,
    /// or `None` when nothing was running.
    pub fn stop(&self) -> Option<LoopStats> {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        let w = worker.take()?;
        w.running.store(false, Ordering::Release);

        let stats = match w.handle.join() {
            Ok(stats) => stats,
            Err(_) => {
                warn!("pid {}: loop thread panicked", self.name);
                return None;
            }
        };

        info!(
            "pid {}: avg. compute {:.3}ms, avg. freq {:.3}Hz over {} ticks",
            self.name,
            stats.avg_compute_ms(),
            stats.avg_frequency_hz(),
            stats.ticks
        );
        info!(
            "pid {}: in freq {:.3}%, acceptable {:.3}%, under f. {:.3}%, over f. {:.3}%",
            self.name,
            stats.percent(stats.in_range),
            stats.percent(stats.acceptable),
            stats.percent(stats.under_rate),
            stats.percent(stats.over_rate)
        );

        *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(stats.clone());
        Some(stats)
    }
}

impl Drop for Pid {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LoopContext {
    name: String,
    period: Duration,
    state: PidHandle,
    io: Arc<Mutex<PidIo>>,
    running: Arc<AtomicBool>,
}

impl LoopContext {
    fn run(self) -> LoopStats {
        let period = self.period.as_secs_f64();
        let min_period = period * (1.0 - PERIOD_RANGE_MARGIN);
        let max_period = period * (1.0 + PERIOD_RANGE_MARGIN);
        let period_target = (min_period + period) / 2.0;

        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stats = LoopStats::default();
        let mut diff = 0.0;

        let mut last = Instant::now();
        thread::sleep(self.period);

        while self.running.load(Ordering::Acquire) {
            let t0 = Instant::now();

            let measured = match self.tick(&mut io, &mut last) {
                Ok(dt) => dt,
                Err(e) => {
                    warn!("pid {}: tick skipped: {}", self.name, e);
                    // the next dt covers only the retry wait
                    last = Instant::now();
                    thread::sleep(self.period);
                    continue;
                }
            };

            let compute_time = t0.elapsed().as_secs_f64();
            let class = RateClass::classify(measured, period);
            if class == RateClass::UnderRate {
                warn!(
                    "pid {}: cannot operate at min. {:.3}Hz, current rate is {:.3}Hz",
                    self.name,
                    1.0 / max_period,
                    1.0 / measured
                );
            }
            stats.record(compute_time, measured, class);

            diff += period_target - measured;
            let sleep = period - compute_time + PERIOD_CORRECTION_GAIN * diff;
            thread::sleep(clamp_sleep(sleep));
        }

        debug!("pid {}: loop exited after {} ticks", self.name, stats.ticks);
        stats
    }

    fn tick(&self, io: &mut PidIo, last: &mut Instant) -> Result<f64> {
        let input = (io.read_input)()?;
        let now = Instant::now();
        let dt = now.duration_since(*last).as_secs_f64();
        let output = self.state.step(&input, dt)?;
        *last = now;
        (io.set_output)(&output);
        Ok(dt)
    }
}

/// Sleep for the next tick, floored at 1ms.
fn clamp_sleep(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(MIN_SLEEP.as_secs_f64())).unwrap_or(MIN_SLEEP)
}
