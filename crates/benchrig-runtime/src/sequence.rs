//! Time-extended hardware procedures.
//!
//! | Procedure           | Setup                          | Per step                               | Pause              |
//! |---------------------|--------------------------------|----------------------------------------|--------------------|
//! | `burst_series(n)`   | 10 kHz pulse, 20 % duty        | arm c cycles and trigger, c = n..1     | 100 ms             |
//! | `pulse_train_sweep` | reset, 5 MHz square, output on | arm n cycles and trigger, n = max..min | `inter_train_wait` |
//! | `voltage_sweep`     | rails check on both endpoints  | set wiper for `start + i × step`       | `step_duration`    |
//! | `configured_burst`  | none (uses the stored signal)  | one trigger                            | inter-block delay  |
//!
//! Every procedure appends to a [`SweepRecorder`] in step order and returns
//! the frozen [`SweepResult`]. Steps are also pushed to an optional progress
//! channel as they complete.
//!
//! A [`CancelGuard`] is checked before every step and interrupts the pauses
//! between them. A step counts as completed only once its pause has run out;
//! a cancelled procedure returns [`RigError::Cancelled`] with that count.

use std::sync::Arc;
use std::time::Duration;

use benchrig_hal::{HardwareFacade, PotRails, TriggerSource};
use benchrig_types::{
    ProgressEvent, RigError, SequenceKind, SignalConfig, SweepRecorder, SweepResult,
    VoltageSweepRequest, edge_time_for_width,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument};

/// Carrier of the burst series.
pub const BURST_CARRIER_HZ: f64 = 10_000.0;
/// Duty cycle of the burst series carrier, in percent.
pub const BURST_DUTY_CYCLE: f64 = 20.0;
/// Pause after each burst of a burst series.
pub const BURST_STEP_PAUSE: Duration = Duration::from_millis(100);
/// Fixed square-wave carrier of the pulse-train sweep.
pub const PULSE_TRAIN_CARRIER_HZ: f64 = 5e6;

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────────────────

/// Shared cancellation signal.
///
/// Each [`cancel`][Self::cancel] bumps an epoch. A [`CancelGuard`] remembers
/// the epoch it was armed at and reports cancelled once it moves on, so a
/// single cancel stops the running sequence and every one queued before it,
/// while work queued afterwards is unaffected.
#[derive(Clone)]
pub struct CancelToken {
    epoch: Arc<watch::Sender<u64>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            epoch: Arc::new(epoch),
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.epoch.send_modify(|e| *e = e.wrapping_add(1));
        debug!(epoch = *self.epoch.borrow(), "cancellation raised");
    }

    /// A guard armed at the current epoch.
    pub fn guard(&self) -> CancelGuard {
        let rx = self.epoch.subscribe();
        let armed = *rx.borrow();
        CancelGuard {
            _token: self.clone(),
            rx,
            armed,
        }
    }
}

pub struct CancelGuard {
    // Keeps the sender alive so `pause` never sees a closed channel.
    _token: CancelToken,
    rx: watch::Receiver<u64>,
    armed: u64,
}

impl CancelGuard {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() != self.armed
    }

    /// Sleep for `duration`, waking early on cancellation. Returns `true`
    /// when the full pause elapsed.
    pub async fn pause(&mut self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let armed = self.armed;
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.rx.wait_for(|e| *e != armed) => false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SequenceEngine
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SequenceEngine {
    hw: HardwareFacade,
    rails: PotRails,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl SequenceEngine {
    pub fn new(hw: HardwareFacade, rails: PotRails) -> Self {
        Self {
            hw,
            rails,
            progress: None,
        }
    }

    /// Push every completed step to `tx`.
    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub fn rails(&self) -> PotRails {
        self.rails
    }

    /// Ramp the burst length from `n` cycles down to one, one software
    /// trigger per length.
    ///
    /// # Errors
    ///
    /// - [`RigError::Validation`] when `n` is zero.
    /// - [`RigError::Device`] from the generator; the series stops there.
    /// - [`RigError::Cancelled`] when the guard trips.
    #[instrument(skip(self, cancel))]
    pub async fn burst_series(
        &self,
        n: u32,
        cancel: &mut CancelGuard,
    ) -> Result<SweepResult, RigError> {
        if n == 0 {
            return Err(RigError::Validation(
                "burst series needs at least one cycle".into(),
            ));
        }
        let sequence = SequenceKind::BurstSeries;
        let width = BURST_DUTY_CYCLE / 100.0 / BURST_CARRIER_HZ;
        self.hw
            .apply_pulse(BURST_CARRIER_HZ, width, edge_time_for_width(width))
            .await?;

        let mut rec = SweepRecorder::new(sequence);
        for cycles in (1..=n).rev() {
            if cancel.is_cancelled() {
                return Err(cancelled(&rec, sequence));
            }
            self.fire(cycles).await?;
            if !cancel.pause(BURST_STEP_PAUSE).await {
                return Err(cancelled(&rec, sequence));
            }
            self.step(&mut rec, cycles, f64::from(cycles), f64::from(cycles));
        }
        info!(cycles = n, "burst series complete");
        Ok(rec.finish())
    }

    /// Preset diagnostic sweep on a 5 MHz square carrier: one triggered
    /// burst for each length from `max_pulses` down to `min_pulses`.
    ///
    /// # Errors
    ///
    /// [`RigError::Validation`] when `min_pulses` is zero or above
    /// `max_pulses`; otherwise as [`burst_series`][Self::burst_series].
    #[instrument(skip(self, cancel))]
    pub async fn pulse_train_sweep(
        &self,
        max_pulses: u32,
        min_pulses: u32,
        inter_train_wait: Duration,
        cancel: &mut CancelGuard,
    ) -> Result<SweepResult, RigError> {
        if min_pulses == 0 || min_pulses > max_pulses {
            return Err(RigError::Validation(format!(
                "pulse train bounds must satisfy 1 <= min ({min_pulses}) <= max ({max_pulses})"
            )));
        }
        let sequence = SequenceKind::PulseTrainSweep;
        self.hw.reset_generator().await?;
        self.hw.configure_square(PULSE_TRAIN_CARRIER_HZ).await?;
        self.hw.set_output(true).await?;

        let mut rec = SweepRecorder::new(sequence);
        for pulses in (min_pulses..=max_pulses).rev() {
            if cancel.is_cancelled() {
                return Err(cancelled(&rec, sequence));
            }
            self.fire(pulses).await?;
            if !cancel.pause(inter_train_wait).await {
                return Err(cancelled(&rec, sequence));
            }
            self.step(&mut rec, pulses, f64::from(pulses), f64::from(pulses));
        }
        info!(max_pulses, min_pulses, "pulse train sweep complete");
        Ok(rec.finish())
    }

    /// Step the wiper from `start_v` to `end_v` over `steps + 1` points.
    ///
    /// Each point records the applied code, the requested voltage and the
    /// voltage that code theoretically yields.
    ///
    /// # Errors
    ///
    /// - [`RigError::Range`] when either endpoint lies outside the rails;
    ///   nothing is written.
    /// - [`RigError::Validation`] when `steps` is zero.
    /// - [`RigError::Device`] / [`RigError::Cancelled`] mid-sweep.
    #[instrument(skip(self, cancel))]
    pub async fn voltage_sweep(
        &self,
        req: &VoltageSweepRequest,
        cancel: &mut CancelGuard,
    ) -> Result<SweepResult, RigError> {
        self.rails.check(req.start_v)?;
        self.rails.check(req.end_v)?;
        if req.steps == 0 {
            return Err(RigError::Validation(
                "sweep_steps must be at least 1".into(),
            ));
        }
        let sequence = SequenceKind::VoltageSweep;
        let step_size = (req.end_v - req.start_v) / f64::from(req.steps);

        let mut rec = SweepRecorder::new(sequence);
        for i in 0..=req.steps {
            if cancel.is_cancelled() {
                return Err(cancelled(&rec, sequence));
            }
            let target = req.start_v + f64::from(i) * step_size;
            let code = self.rails.code_for_voltage(target);
            self.hw.set_wiper(code).await?;
            if !cancel.pause(req.step_duration).await {
                return Err(cancelled(&rec, sequence));
            }
            self.step(
                &mut rec,
                u32::from(code.value()),
                target,
                self.rails.voltage_for_code(code),
            );
        }
        info!(points = rec.len(), "voltage sweep complete");
        Ok(rec.finish())
    }

    /// Fire one software trigger with whatever burst `config` armed, then
    /// hold for its inter-block delay.
    #[instrument(skip(self, config, cancel), fields(bursts = config.burst_count))]
    pub async fn configured_burst(
        &self,
        config: &SignalConfig,
        cancel: &mut CancelGuard,
    ) -> Result<SweepResult, RigError> {
        let sequence = SequenceKind::ConfiguredBurst;
        let mut rec = SweepRecorder::new(sequence);
        if cancel.is_cancelled() {
            return Err(cancelled(&rec, sequence));
        }
        self.hw.trigger().await?;
        if !cancel.pause(config.inter_block_delay()).await {
            return Err(cancelled(&rec, sequence));
        }
        let bursts = config.burst_count;
        self.step(&mut rec, bursts, f64::from(bursts), f64::from(bursts));
        Ok(rec.finish())
    }

    async fn fire(&self, cycles: u32) -> Result<(), RigError> {
        self.hw.set_burst(cycles, TriggerSource::Bus, true).await?;
        self.hw.trigger().await
    }

    fn step(&self, rec: &mut SweepRecorder, applied: u32, target: f64, expected: f64) {
        let step = rec.record(applied, target, expected).clone();
        debug!(step = step.step, applied, target, "sequence step");
        if let Some(tx) = &self.progress {
            // The receiver going away only stops progress reporting.
            let _ = tx.send(ProgressEvent {
                sequence: rec.sequence(),
                step,
            });
        }
    }
}

fn cancelled(rec: &SweepRecorder, sequence: SequenceKind) -> RigError {
    RigError::Cancelled {
        sequence: sequence.to_string(),
        completed_steps: rec.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchrig_hal::sim::{GeneratorOp, SimRig};

    fn engine(rails: PotRails) -> (SequenceEngine, benchrig_hal::sim::SimHandles) {
        let (hw, sim) = SimRig::new().build();
        (SequenceEngine::new(hw, rails), sim)
    }

    fn sweep(start_v: f64, end_v: f64, steps: u32) -> VoltageSweepRequest {
        VoltageSweepRequest {
            start_v,
            end_v,
            steps,
            step_duration: Duration::ZERO,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_series_counts_down_to_one_with_fixed_pause() {
        let (engine, sim) = engine(PotRails::default());
        let token = CancelToken::new();

        let result = engine.burst_series(5, &mut token.guard()).await.unwrap();

        assert_eq!(sim.triggered_bursts(), vec![5, 4, 3, 2, 1]);
        let times = sim.trigger_times();
        for pair in times.windows(2) {
            assert_eq!(pair[1] - pair[0], BURST_STEP_PAUSE);
        }
        let applied: Vec<u32> = result.steps().iter().map(|s| s.applied).collect();
        assert_eq!(applied, vec![5, 4, 3, 2, 1]);
        assert_eq!(result.sequence(), SequenceKind::BurstSeries);

        match &sim.generator_ops()[0] {
            GeneratorOp::ApplyPulse {
                frequency_hz,
                width_s,
                edge_s,
            } => {
                assert_eq!(*frequency_hz, BURST_CARRIER_HZ);
                assert!((width_s - 20e-6).abs() < 1e-12);
                assert!((edge_s - 1e-6).abs() < 1e-12);
            }
            other => panic!("expected pulse setup first, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_series_of_zero_is_rejected_before_hardware() {
        let (engine, sim) = engine(PotRails::default());
        let err = engine
            .burst_series(0, &mut CancelToken::new().guard())
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Validation(_)));
        assert!(sim.generator_ops().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pulse_train_sweep_runs_twenty_down_to_one() {
        let (engine, sim) = engine(PotRails::default());
        let result = engine
            .pulse_train_sweep(20, 1, Duration::from_millis(100), &mut CancelToken::new().guard())
            .await
            .unwrap();

        assert_eq!(sim.triggered_bursts(), (1..=20).rev().collect::<Vec<u32>>());
        assert_eq!(result.len(), 20);
        let ops = sim.generator_ops();
        assert_eq!(ops[0], GeneratorOp::Reset);
        assert_eq!(
            ops[1],
            GeneratorOp::ConfigureSquare {
                frequency_hz: PULSE_TRAIN_CARRIER_HZ
            }
        );
        assert_eq!(ops[2], GeneratorOp::SetOutput(true));
    }

    #[tokio::test(start_paused = true)]
    async fn voltage_sweep_visits_both_endpoints() {
        let rails = PotRails {
            vdd: 10.0,
            vss: 0.0,
        };
        let (engine, sim) = engine(rails);
        let result = engine
            .voltage_sweep(&sweep(0.0, 10.0, 4), &mut CancelToken::new().guard())
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        let steps = result.steps();
        for pair in steps.windows(2) {
            assert!(pair[1].target > pair[0].target);
            assert!(pair[1].applied >= pair[0].applied);
            assert_eq!(pair[1].step, pair[0].step + 1);
        }
        let codes: Vec<u8> = sim.wiper_codes().iter().map(|c| c.value()).collect();
        assert_eq!(codes, vec![0, 64, 128, 191, 255]);
        assert_eq!(steps[4].expected, 255.0 / 256.0 * 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn voltage_sweep_outside_rails_writes_nothing() {
        let (engine, sim) = engine(PotRails::default());
        let err = engine
            .voltage_sweep(&sweep(0.0, 10.0, 4), &mut CancelToken::new().guard())
            .await
            .unwrap_err();
        assert!(matches!(err, RigError::Range(_)));
        assert!(sim.wiper_codes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn progress_events_follow_step_order() {
        let (hw, _sim) = SimRig::new().build();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = SequenceEngine::new(hw, PotRails::default()).with_progress(tx);

        engine
            .burst_series(3, &mut CancelToken::new().guard())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.sequence, SequenceKind::BurstSeries);
            seen.push(event.step.step);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_between_steps() {
        let (engine, sim) = engine(PotRails::default());
        let token = CancelToken::new();
        let mut guard = token.guard();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });

        let err = engine.burst_series(10, &mut guard).await.unwrap_err();
        // The third burst fired at 200 ms but its pause was cut short.
        assert_eq!(
            err,
            RigError::Cancelled {
                sequence: "burst_series".into(),
                completed_steps: 2,
            }
        );
        assert_eq!(sim.triggered_bursts(), vec![10, 9, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_pause_is_not_reported_as_progress() {
        let (hw, sim) = SimRig::new().build();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let engine = SequenceEngine::new(hw, PotRails::default()).with_progress(tx);
        let token = CancelToken::new();
        let mut guard = token.guard();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(201)).await;
            canceller.cancel();
        });

        let err = engine.burst_series(10, &mut guard).await.unwrap_err();
        assert!(matches!(err, RigError::Cancelled { completed_steps: 2, .. }));
        let mut events = 0;
        while rx.try_recv().is_ok() {
            events += 1;
        }
        assert_eq!(events, 2);
        assert_eq!(sim.triggered_bursts(), vec![10, 9, 8]);
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_reads_are_not_blocked_by_a_running_sequence() {
        let (hw, _sim) = SimRig::new().with_temperature(300.0).build();
        let engine = SequenceEngine::new(hw.clone(), PotRails::default());
        let start = tokio::time::Instant::now();

        let sequence = tokio::spawn(async move {
            engine
                .burst_series(20, &mut CancelToken::new().guard())
                .await
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        let kelvin = hw.read_temperature().await.unwrap();
        let read_at = start.elapsed();
        assert_eq!(kelvin, 300.0);
        assert!(read_at < Duration::from_millis(200), "read took until {read_at:?}");
        assert!(!sequence.is_finished());

        let result = sequence.await.unwrap().unwrap();
        assert_eq!(result.len(), 20);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_armed_after_cancel_is_clear() {
        let token = CancelToken::new();
        let stale = token.guard();
        token.cancel();
        let fresh = token.guard();
        assert!(stale.is_cancelled());
        assert!(!fresh.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_burst_fires_once_and_holds() {
        let (engine, sim) = engine(PotRails::default());
        let config = SignalConfig::default();
        let start = tokio::time::Instant::now();

        let result = engine
            .configured_burst(&config, &mut CancelToken::new().guard())
            .await
            .unwrap();

        assert_eq!(sim.generator_ops(), vec![GeneratorOp::Trigger]);
        assert_eq!(result.steps()[0].applied, config.burst_count);
        assert!(start.elapsed() >= config.inter_block_delay());
    }
}
