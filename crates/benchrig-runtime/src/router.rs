//! Command routing.
//!
//! [`CommandRouter`] owns the only carried-over state of the rig, the active
//! [`ChannelState`] and the stored [`SignalConfig`], and turns one
//! [`Command`] at a time into hardware calls and a [`ResponseEnvelope`].
//!
//! Nothing escapes [`CommandRouter::execute`]: decoding failures, range
//! checks, driver faults and cancellations all come back as error envelopes
//! that echo the inbound command.

use benchrig_hal::{HardwareFacade, TriggerSource};
use benchrig_types::{
    Channel, ChannelState, Command, CommandKind, ResponseEnvelope, RigError, SignalConfig, SweepResult,
    WiperCode,
};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::sequence::{CancelGuard, CancelToken, SequenceEngine};

pub struct CommandRouter {
    hw: HardwareFacade,
    engine: SequenceEngine,
    cancel: CancelToken,
    channel: ChannelState,
    signal: SignalConfig,
}

impl CommandRouter {
    pub fn new(hw: HardwareFacade, engine: SequenceEngine, cancel: CancelToken) -> Self {
        Self {
            hw,
            engine,
            cancel,
            channel: ChannelState::default(),
            signal: SignalConfig::default(),
        }
    }

    pub fn channel(&self) -> ChannelState {
        self.channel
    }

    pub fn signal(&self) -> &SignalConfig {
        &self.signal
    }

    /// Decode `raw` and run it to completion.
    pub async fn handle(&mut self, raw: &Value) -> ResponseEnvelope {
        match Command::from_value(raw) {
            Ok(command) => {
                let mut guard = self.cancel.guard();
                self.execute(command, raw, &mut guard).await
            }
            Err(e) => reject(&e, raw),
        }
    }

    /// Run an already-decoded command. `raw` is echoed back on failure.
    #[instrument(skip_all, fields(command = %command.kind()))]
    pub async fn execute(
        &mut self,
        command: Command,
        raw: &Value,
        cancel: &mut CancelGuard,
    ) -> ResponseEnvelope {
        match self.run(command, cancel).await {
            Ok(response) => {
                info!(response = %response.response_type, "command completed");
                response
            }
            Err(e) => reject(&e, raw),
        }
    }

    async fn run(
        &mut self,
        command: Command,
        cancel: &mut CancelGuard,
    ) -> Result<ResponseEnvelope, RigError> {
        let reply = ResponseEnvelope::success(command.kind(), Map::new());
        match command {
            Command::ChannelSelect {
                channel,
                percent,
                code,
            } => {
                self.select(Some(channel), code, cancel).await?;
                Ok(reply
                    .with("channel", channel.number())
                    .with("percent", percent)
                    .with("code", code.value()))
            }
            Command::PotentiometerSetPercent {
                percent,
                code,
                channel,
            } => {
                self.select(channel, code, cancel).await?;
                Ok(reply
                    .with("channel", self.channel.active().map(Channel::number))
                    .with("percent", percent)
                    .with("code", code.value()))
            }
            Command::Burst { cycles } => {
                let result = self.engine.burst_series(cycles, cancel).await?;
                Ok(reply.with("cycles", cycles).with("records", records(&result)))
            }
            Command::SignalConfig(config) => {
                self.apply_signal(config).await?;
                let s = &self.signal;
                Ok(reply
                    .with("frequency", s.frequency_hz)
                    .with("bursts", s.burst_count)
                    .with("duty_cycle", s.duty_cycle)
                    .with("amplitude", s.amplitude_v)
                    .with("inter_burst_wait", s.inter_block_delay_s)
                    .with("pulse_width", s.pulse_width_s())
                    .with("edge_time", s.edge_time_s()))
            }
            Command::ConnectGenerator => {
                let generator = self.hw.connect_generator().await?;
                info!(%generator, "generator connected");
                Ok(reply.with("generator", generator))
            }
            Command::DisconnectGenerator => {
                let was_connected = self.hw.disconnect_generator().await;
                Ok(reply.with("was_connected", was_connected))
            }
            Command::AllOff => {
                self.hw.all_off().await?;
                info!("all relays off");
                Ok(reply.with("relays", "off"))
            }
            Command::TriggerBurst => {
                let signal = self.signal.clone();
                let result = self.engine.configured_burst(&signal, cancel).await?;
                Ok(reply
                    .with("bursts", signal.burst_count)
                    .with("records", records(&result)))
            }
            Command::PulseTrainSweep {
                max_pulses,
                min_pulses,
                inter_train_wait,
            } => {
                let result = self
                    .engine
                    .pulse_train_sweep(max_pulses, min_pulses, inter_train_wait, cancel)
                    .await?;
                Ok(reply
                    .with("max_pulses", max_pulses)
                    .with("min_pulses", min_pulses)
                    .with("records", records(&result)))
            }
            Command::PotentiometerVoltageSweep(req) => {
                let result = self.engine.voltage_sweep(&req, cancel).await?;
                Ok(reply
                    .with("start_v", req.start_v)
                    .with("end_v", req.end_v)
                    .with("sweep_steps", req.steps)
                    .with("records", records(&result)))
            }
            Command::CancelSequence => {
                self.cancel.cancel();
                Ok(reply.with("cancelled", true))
            }
        }
    }

    /// Switch to `channel` when it is not already live, then always re-apply
    /// the wiper code.
    ///
    /// An `all_off` raised while this runs wins: the guard is checked before
    /// the relays are touched and again after, and a late cancel switches the
    /// bank back off.
    async fn select(
        &mut self,
        channel: Option<Channel>,
        code: WiperCode,
        cancel: &CancelGuard,
    ) -> Result<(), RigError> {
        if let Some(channel) = channel {
            if !self.channel.is(channel) || !self.hw.relays_energised().await {
                if cancel.is_cancelled() {
                    return Err(interrupted_select());
                }
                self.hw.activate_channel(channel).await?;
                if cancel.is_cancelled() {
                    self.hw.all_off().await?;
                    warn!(channel = channel.number(), "channel activation overtaken by all_off");
                    return Err(interrupted_select());
                }
                self.channel.select(channel);
                info!(channel = channel.number(), "channel activated");
            }
        }
        self.hw.set_wiper(code).await
    }

    /// Push `config` to the generator; it becomes the stored signal only once
    /// every call succeeded.
    async fn apply_signal(&mut self, config: SignalConfig) -> Result<(), RigError> {
        config.validate()?;
        self.hw
            .apply_pulse(config.frequency_hz, config.pulse_width_s(), config.edge_time_s())
            .await?;
        self.hw.set_output(true).await?;
        self.hw
            .set_burst(config.burst_count, TriggerSource::Bus, true)
            .await?;
        info!(
            frequency_hz = config.frequency_hz,
            bursts = config.burst_count,
            duty_cycle = config.duty_cycle,
            "signal configured"
        );
        self.signal = config;
        Ok(())
    }
}

/// Error envelope for `err`, logged at the boundary.
pub fn reject(err: &RigError, raw: &Value) -> ResponseEnvelope {
    warn!(kind = ?err.kind(), error = %err, "command rejected");
    ResponseEnvelope::failure(err, raw.clone())
}

fn interrupted_select() -> RigError {
    RigError::Cancelled {
        sequence: CommandKind::ChannelSelect.as_str().to_string(),
        completed_steps: 0,
    }
}

fn records(result: &SweepResult) -> Value {
    serde_json::to_value(result.steps()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use benchrig_hal::PotRails;
    use benchrig_hal::sim::{GeneratorOp, SimHandles, SimRig};
    use benchrig_types::ErrorKind;
    use serde_json::json;

    fn router_on(rig: SimRig) -> (CommandRouter, SimHandles) {
        let (hw, sim) = rig.build();
        let engine = SequenceEngine::new(hw.clone(), PotRails::default());
        (CommandRouter::new(hw, engine, CancelToken::new()), sim)
    }

    fn router() -> (CommandRouter, SimHandles) {
        router_on(SimRig::new())
    }

    #[tokio::test]
    async fn unknown_command_is_echoed_and_changes_nothing() {
        let (mut router, sim) = router();
        let raw = json!({"type": "frobnicate", "channel": 3});

        let reply = router.handle(&raw).await;

        assert!(!reply.success);
        assert_eq!(reply.response_type, "error");
        assert_eq!(reply.error_kind(), Some(ErrorKind::UnknownCommand));
        assert_eq!(reply.command, Some(raw));
        assert_eq!(router.channel().active(), None);
        assert_eq!(router.signal(), &SignalConfig::default());
        assert!(sim.generator_ops().is_empty());
        assert_eq!(sim.relay_writes(), 0);
    }

    #[tokio::test]
    async fn out_of_range_duty_cycle_makes_no_hardware_calls() {
        let (mut router, sim) = router();
        let reply = router
            .handle(&json!({"type": "signal_config", "duty_cycle": 150}))
            .await;

        assert_eq!(reply.error_kind(), Some(ErrorKind::ValidationError));
        assert!(sim.generator_ops().is_empty());
        assert_eq!(router.signal(), &SignalConfig::default());
    }

    #[tokio::test]
    async fn channel_select_switches_relays_and_sets_wiper() {
        let (mut router, sim) = router();
        let reply = router
            .handle(&json!({"type": "channel_select", "channel": 3, "percent": 100}))
            .await;

        assert!(reply.success);
        assert_eq!(reply.response_type, "channel_select_status");
        assert_eq!(reply.data["channel"], 3);
        assert_eq!(reply.data["code"], 255);
        assert_eq!(router.channel().active().map(Channel::number), Some(3));
        assert_eq!(sim.wiper_codes(), vec![WiperCode::MAX]);
        assert!(sim.relay_writes() > 0);
    }

    #[tokio::test]
    async fn repeated_channel_select_only_reapplies_the_wiper() {
        let (mut router, sim) = router();
        let cmd = json!({"type": "channel_select", "channel": 5, "percent": 40});
        assert!(router.handle(&cmd).await.success);
        sim.relays.writes().clear();
        sim.wiper.clear();

        assert!(router.handle(&cmd).await.success);

        assert_eq!(sim.relay_writes(), 0);
        assert_eq!(sim.wiper_codes().len(), 1);
    }

    #[tokio::test]
    async fn channel_select_after_all_off_reenergises_the_same_channel() {
        let (mut router, sim) = router();
        let cmd = json!({"type": "channel_select", "channel": 2});
        router.handle(&cmd).await;
        assert!(router.handle(&json!({"type": "all_off"})).await.success);
        // The last selection is remembered across all_off.
        assert_eq!(router.channel().active().map(Channel::number), Some(2));
        sim.relays.writes().clear();

        router.handle(&cmd).await;
        assert!(sim.relay_writes() > 0);
    }

    #[tokio::test]
    async fn channel_select_after_cancel_leaves_relays_alone() {
        let (mut router, sim) = router();
        let token = CancelToken::new();
        let mut guard = token.guard();
        token.cancel();

        let raw = json!({"type": "channel_select", "channel": 6, "percent": 10});
        let command = Command::from_value(&raw).unwrap();
        let reply = router.execute(command, &raw, &mut guard).await;

        assert_eq!(reply.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(sim.relay_writes(), 0);
        assert!(sim.wiper_codes().is_empty());
        assert_eq!(router.channel().active(), None);
    }

    #[tokio::test]
    async fn invalid_channel_is_rejected_without_side_effects() {
        let (mut router, sim) = router();
        for channel in [0, 9, -1] {
            let reply = router
                .handle(&json!({"type": "channel_select", "channel": channel}))
                .await;
            assert_eq!(reply.error_kind(), Some(ErrorKind::InvalidChannel));
        }
        assert_eq!(sim.relay_writes(), 0);
        assert!(sim.wiper_codes().is_empty());
    }

    #[tokio::test]
    async fn set_percent_without_channel_keeps_relays() {
        let (mut router, sim) = router();
        let reply = router
            .handle(&json!({"type": "potentiometer_set_percent", "percent": 0}))
            .await;
        assert!(reply.success);
        assert_eq!(reply.data["channel"], Value::Null);
        assert_eq!(sim.wiper_codes(), vec![WiperCode::MIN]);
        assert_eq!(sim.relay_writes(), 0);
    }

    #[tokio::test]
    async fn signal_config_programs_pulse_output_then_burst() {
        let (mut router, sim) = router();
        let reply = router
            .handle(&json!({
                "type": "signal_config",
                "frequency": 2000,
                "bursts": 7,
                "duty_cycle": 25,
            }))
            .await;

        assert!(reply.success);
        let ops = sim.generator_ops();
        assert!(matches!(ops[0], GeneratorOp::ApplyPulse { frequency_hz, .. } if frequency_hz == 2000.0));
        assert_eq!(ops[1], GeneratorOp::SetOutput(true));
        assert_eq!(
            ops[2],
            GeneratorOp::SetBurst {
                cycles: 7,
                source: TriggerSource::Bus,
                enabled: true
            }
        );
        assert_eq!(router.signal().burst_count, 7);
    }

    #[tokio::test]
    async fn failed_signal_config_keeps_previous_signal() {
        let (mut router, sim) = router();
        sim.generator_fault.set();
        let reply = router
            .handle(&json!({"type": "signal_config", "bursts": 3}))
            .await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::DeviceError));
        assert_eq!(router.signal(), &SignalConfig::default());
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_burst_uses_stored_burst_count() {
        let (mut router, sim) = router();
        router
            .handle(&json!({"type": "signal_config", "bursts": 4, "inter_burst_wait": 0}))
            .await;
        let reply = router.handle(&json!({"type": "trigger_burst"})).await;

        assert!(reply.success);
        assert_eq!(reply.data["bursts"], 4);
        assert_eq!(sim.triggered_bursts(), vec![4]);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_reply_carries_every_record() {
        let (mut router, sim) = router();
        let reply = router.handle(&json!({"type": "burst", "cycles": 3})).await;

        assert_eq!(reply.response_type, "burst_status");
        assert_eq!(reply.data["cycles"], 3);
        assert_eq!(reply.data["records"].as_array().map(Vec::len), Some(3));
        assert_eq!(sim.triggered_bursts(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn voltage_sweep_beyond_rails_is_a_range_error() {
        let (mut router, sim) = router();
        let reply = router
            .handle(&json!({"type": "potentiometer_voltage_sweep", "end_v": 10}))
            .await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::RangeError));
        assert!(sim.wiper_codes().is_empty());
    }

    #[tokio::test]
    async fn generator_lifecycle_round_trip() {
        let (mut router, sim) = router_on(SimRig::new().disconnected());

        let reply = router.handle(&json!({"type": "trigger_burst"})).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::DeviceError));

        let reply = router.handle(&json!({"type": "connect_generator"})).await;
        assert!(reply.success);
        assert_eq!(reply.data["generator"], "sim0");
        assert_eq!(sim.opened_ports(), vec!["sim0".to_string()]);

        let reply = router.handle(&json!({"type": "disconnect_generator"})).await;
        assert_eq!(reply.data["was_connected"], true);
        let reply = router.handle(&json!({"type": "disconnect_generator"})).await;
        assert_eq!(reply.data["was_connected"], false);
    }

    #[tokio::test]
    async fn missing_type_is_a_validation_error() {
        let (mut router, _sim) = router();
        let reply = router.handle(&json!({"channel": 1})).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::ValidationError));
        let reply = router.handle(&json!("not an object")).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::ValidationError));
    }
}
