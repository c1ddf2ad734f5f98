//! The hardware state machine: camera power lifecycle, voltage recovery,
//! graceful shutdown, restart.
//!
//! Decoded fresh from the persisted record every tick, driven entirely by
//! bus events.  Time events observe timeouts and poll camera liveness; all
//! other transitions react to request and outcome events.  After every event
//! the current state is serialised back to the record.

use std::sync::Arc;
use tracing::{debug, error, warn};

use oc_events::{
    Bus, Cause, Event, Subscriber,
    bus::HandlerError,
    event::{ERR_NO_SHUTDOWN_ACTIONS, WARN_SKIP_SHUTDOWN},
};

use crate::manager::HardwareManager;

use super::hardware_state::{
    HardwareState, PHASE_TIMEOUT_SECS, RestartPhase, STARTING_TIMEOUT_SECS, StoppingPhase,
};
use super::{TickContext, Timed};

pub struct HardwareMachine {
    ctx: Arc<TickContext>,
    manager: HardwareManager,
    state: HardwareState,
}

impl HardwareMachine {
    /// Decode the machine from the persisted record.  A fresh record starts
    /// `Off`; an unreadable state is logged and also starts `Off`.
    pub fn new(ctx: Arc<TickContext>) -> Self {
        let state = {
            let cfg = ctx.cfg();
            HardwareState::decode(&cfg.hardware_state, &cfg.hardware_state_data).unwrap_or_else(
                |e| {
                    warn!(broadcast = %cfg.name, %e, "hardware state unreadable; resetting to off");
                    HardwareState::Off
                },
            )
        };
        let manager = HardwareManager::new(ctx.clone());
        HardwareMachine {
            ctx,
            manager,
            state,
        }
    }

    pub fn state(&self) -> HardwareState {
        self.state
    }

    // -----------------------------------------------------------------------
    // Entry actions
    // -----------------------------------------------------------------------

    /// Consult the controller and start the camera if the world allows it.
    ///
    /// With no controller configured the checks are skipped entirely.  A
    /// reported or measured low-voltage condition publishes
    /// `lowVoltageEvent`; an off controller with healthy voltage publishes
    /// `controllerFailureEvent`; an on controller at alarm voltage is an
    /// inconsistent world and publishes `invalidConfigurationEvent`.
    fn enter_starting(&self, bus: &Bus) -> HardwareState {
        let now = self.ctx.now();
        let next = HardwareState::Starting(Timed::new(now, STARTING_TIMEOUT_SECS));
        let (controller_mac, required) = {
            let cfg = self.ctx.cfg();
            (cfg.controller_mac, cfg.required_streaming_voltage)
        };

        if controller_mac == 0 {
            self.manager.start(bus);
            return next;
        }

        match self.manager.controller_error() {
            Ok(Some(crate::device::ControllerErrorKind::LowVoltage)) => {
                bus.publish(Event::LowVoltage);
                return next;
            }
            Ok(Some(crate::device::ControllerErrorKind::Other(e))) => {
                bus.publish(Event::InvalidConfiguration {
                    cause: Some(Cause::generic(format!("controller error: {e}"))),
                });
                return next;
            }
            Ok(None) => {}
            Err(e) => debug!(%e, "controller error unreadable; continuing"),
        }

        let readings = (|| -> Result<(f64, f64, bool), crate::device::DeviceError> {
            let voltage = self.manager.voltage()?;
            let alarm = self.manager.alarm_voltage()?;
            let controller_on = self.manager.is_up(controller_mac)?;
            Ok((voltage, alarm, controller_on))
        })();
        let (voltage, alarm, controller_on) = match readings {
            Ok(r) => r,
            Err(e) => {
                warn!(%e, "controller readings unavailable; starting camera anyway");
                self.manager.start(bus);
                return next;
            }
        };

        if voltage <= alarm {
            if controller_on {
                bus.publish(Event::InvalidConfiguration {
                    cause: Some(Cause::generic(format!(
                        "controller reports on at alarm voltage ({voltage:.1}V)"
                    ))),
                });
            } else {
                bus.publish(Event::LowVoltage);
            }
        } else if !controller_on {
            bus.publish(Event::ControllerFailure {
                cause: Some(Cause::generic("controller heartbeat lost")),
            });
        } else if voltage < required {
            bus.publish(Event::LowVoltage);
        } else {
            self.manager.start(bus);
        }
        next
    }

    fn enter_recovering(&self) -> HardwareState {
        let hours = self.ctx.cfg().voltage_recovery_timeout_hours;
        HardwareState::RecoveringVoltage(Timed::new(self.ctx.now(), hours * 3600))
    }

    fn enter_shutting_down(&self, bus: &Bus) -> StoppingPhase {
        self.manager.shutdown(bus);
        StoppingPhase::ShuttingDown(Timed::new(self.ctx.now(), PHASE_TIMEOUT_SECS))
    }

    fn enter_powering_off(&self, bus: &Bus) -> StoppingPhase {
        self.manager.stop(bus);
        StoppingPhase::PoweringOff(Timed::new(self.ctx.now(), PHASE_TIMEOUT_SECS))
    }

    fn enter_failure(&self, event: &Event) -> HardwareState {
        error!(broadcast = %self.ctx.cfg().name, event = %event, "hardware entered failure");
        HardwareState::Failure
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn transition(&mut self, event: &Event, bus: &Bus) {
        use HardwareState as S;

        // A controller failure fells any active state.
        if matches!(event, Event::ControllerFailure { .. })
            && !matches!(self.state, S::Off | S::Failure)
        {
            self.state = self.enter_failure(event);
            return;
        }

        match (self.state, event) {
            (S::Off, Event::HardwareStartRequest | Event::HardwareResetRequest) => {
                self.state = self.enter_starting(bus);
            }

            (S::On, Event::HardwareStopRequest | Event::LowVoltage) => {
                self.state = S::Stopping(self.enter_shutting_down(bus));
            }
            (S::On, Event::HardwareResetRequest) => {
                self.state = S::Restarting(RestartPhase::Stopping(self.enter_shutting_down(bus)));
            }

            (S::Starting(timed), Event::Time { now }) => {
                if timed.timed_out(*now) {
                    bus.publish(Event::HardwareStartFailed {
                        cause: Some(Cause::generic("camera did not start within the deadline")),
                    });
                    self.state = S::Off;
                } else {
                    let mac = self.ctx.cfg().camera_mac;
                    self.manager
                        .publish_event_if_status(Event::HardwareStarted, true, mac, bus);
                }
            }
            (S::Starting(_), Event::HardwareStarted) => self.state = S::On,
            (S::Starting(_), Event::HardwareStartFailed { .. }) => {
                self.state = self.enter_failure(event);
            }
            (S::Starting(_), Event::LowVoltage) => self.state = self.enter_recovering(),

            (S::RecoveringVoltage(timed), Event::Time { now }) => {
                let required = self.ctx.cfg().required_streaming_voltage;
                match self.manager.voltage() {
                    Ok(v) if v >= required => bus.publish(Event::VoltageRecovered),
                    Ok(_) | Err(_) => {
                        if timed.timed_out(*now) {
                            bus.publish(Event::HardwareStartFailed {
                                cause: Some(Cause::generic("voltage did not recover in time")),
                            });
                            self.state = S::Off;
                        }
                    }
                }
            }
            (S::RecoveringVoltage(_), Event::VoltageRecovered) => {
                self.state = self.enter_starting(bus);
            }

            (S::Stopping(phase), _) => {
                if let Some(next) = self.step_stopping(phase, event, bus) {
                    self.state = next;
                }
            }

            (S::Restarting(phase), _) => self.step_restarting(phase, event, bus),

            _ => debug!(state = self.state.tag(), event = %event, "ignoring event"),
        }
    }

    /// Drive a top-level stop.  Returns the machine's next state when the
    /// phase sequence moves, None to stay put.
    fn step_stopping(
        &mut self,
        phase: StoppingPhase,
        event: &Event,
        bus: &Bus,
    ) -> Option<HardwareState> {
        use HardwareState as S;
        match self.step_stop_phase(phase, event, bus) {
            StopStep::Stay => None,
            StopStep::Phase(next) => Some(S::Stopping(next)),
            StopStep::Done => Some(S::Off),
            StopStep::Failed => Some(self.enter_failure(event)),
        }
    }

    /// Drive a restart: the stop sequence, then a fresh start.
    fn step_restarting(&mut self, phase: RestartPhase, event: &Event, bus: &Bus) {
        use HardwareState as S;
        match phase {
            RestartPhase::Stopping(stopping) => {
                match self.step_stop_phase(stopping, event, bus) {
                    StopStep::Stay => {}
                    StopStep::Phase(next) => {
                        self.state = S::Restarting(RestartPhase::Stopping(next));
                    }
                    StopStep::Done => {
                        // Camera is off; begin the fresh start.
                        let started = self.enter_starting(bus);
                        if let S::Starting(t) = started {
                            self.state = S::Restarting(RestartPhase::Starting(t));
                        }
                    }
                    StopStep::Failed => self.state = self.enter_failure(event),
                }
            }
            RestartPhase::Starting(timed) => match event {
                Event::Time { now } => {
                    if timed.timed_out(*now) {
                        bus.publish(Event::HardwareStartFailed {
                            cause: Some(Cause::generic(
                                "camera did not restart within the deadline",
                            )),
                        });
                        self.state = S::Off;
                    } else {
                        let mac = self.ctx.cfg().camera_mac;
                        self.manager
                            .publish_event_if_status(Event::HardwareStarted, true, mac, bus);
                    }
                }
                Event::HardwareStarted => self.state = S::On,
                Event::HardwareStartFailed { .. } => self.state = self.enter_failure(event),
                Event::LowVoltage => self.state = self.enter_recovering(),
                _ => debug!(state = self.state.tag(), event = %event, "ignoring event"),
            },
        }
    }

    /// The shared two-phase stop logic used by both `Stopping` and the
    /// stopping half of `Restarting`.
    fn step_stop_phase(&self, phase: StoppingPhase, event: &Event, bus: &Bus) -> StopStep {
        let camera_mac = self.ctx.cfg().camera_mac;
        match (phase, event) {
            (StoppingPhase::ShuttingDown(timed), Event::Time { now }) => {
                if timed.timed_out(*now) {
                    bus.publish(Event::HardwareShutdownFailed {
                        cause: Some(Cause::generic("camera shutdown timed out")),
                    });
                    return StopStep::Stay;
                }
                if !self.camera_reporting(camera_mac) {
                    bus.publish(Event::HardwareShutdown);
                    return StopStep::Phase(self.enter_powering_off(bus));
                }
                StopStep::Stay
            }
            (StoppingPhase::ShuttingDown(_), Event::HardwareShutdownFailed { cause }) => {
                match cause {
                    Some(Cause::Generic(msg)) if msg == WARN_SKIP_SHUTDOWN => {
                        debug!("shutdown skipped by configuration");
                    }
                    Some(Cause::Generic(msg)) if msg == ERR_NO_SHUTDOWN_ACTIONS => {
                        warn!("no shutdown actions; powering off without graceful shutdown");
                    }
                    _ => warn!(event = %event, "shutdown failed; powering off anyway"),
                }
                StopStep::Phase(self.enter_powering_off(bus))
            }
            (StoppingPhase::PoweringOff(timed), Event::Time { now }) => {
                if !self.camera_reporting(camera_mac) {
                    bus.publish(Event::HardwareStopped);
                    return StopStep::Done;
                }
                if timed.timed_out(*now) {
                    bus.publish(Event::HardwarePowerOffFailed {
                        cause: Some(Cause::generic("camera still reporting after power off")),
                    });
                }
                StopStep::Stay
            }
            (StoppingPhase::PoweringOff(_), Event::HardwarePowerOffFailed { .. }) => {
                bus.publish(Event::HardwareStopFailed {
                    cause: Some(Cause::Event(Box::new(event.clone()))),
                });
                StopStep::Failed
            }
            _ => StopStep::Stay,
        }
    }

    fn camera_reporting(&self, mac: u64) -> bool {
        self.manager.is_up(mac).unwrap_or(false)
    }

    /// Serialise the current state back onto the record.
    fn persist(&self) {
        let tag = self.state.tag().to_owned();
        let data = self.state.encode_data();
        self.ctx.save_logged("hardware state", &move |cfg| {
            cfg.hardware_state = tag.clone();
            cfg.hardware_state_data = data.clone();
        });
    }
}

enum StopStep {
    Stay,
    Phase(StoppingPhase),
    Done,
    Failed,
}

impl Subscriber for HardwareMachine {
    fn name(&self) -> &'static str {
        "hardware-sm"
    }

    fn handle(&mut self, event: &Event, bus: &Bus) -> Result<(), HandlerError> {
        let before = self.state;
        self.transition(event, bus);
        if before != self.state {
            debug!(
                broadcast = %self.ctx.cfg().name,
                from = before.tag(),
                to = self.state.tag(),
                event = %event,
                "hardware transition"
            );
        }
        self.persist();
        Ok(())
    }
}
