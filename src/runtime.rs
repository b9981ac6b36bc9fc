// Fixed-rate servo loop with a bus-fault watchdog
// Note: each tick reads the arm (update) and then writes joint torques (setjtor).
// A failed tick holds zero torque; too many failed ticks in a row stop the loop.

use std::time::{Duration, Instant};

use nalgebra::DVector;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info, warn};

use crate::config::{LOOP_HZ, MAX_CONSECUTIVE_FAULTS, STATE_LOG_PERIOD, WambotConfig};
use crate::messages::{JointState, RuntimeHealth};
use crate::wambot::{Wambot, WambotError};

/// Error types for the servo loop
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Wambot error: {0}")]
    Wambot(#[from] WambotError),

    #[error("{count} consecutive bus faults, last: {last}")]
    TooManyFaults { count: u32, last: WambotError },

    #[error("Torque command has {len} entries, arm has {dof} joints")]
    TorqueLength { len: usize, dof: usize },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

pub struct Runtime {
    torque: DVector<f64>,
    health: RuntimeHealth,
    consecutive_faults: u32,
    cycles: u64,
    last_state_log: Option<Instant>,
    wambot: Wambot,
}

impl Runtime {
    pub fn new(wambot: Wambot) -> Self {
        Self {
            torque: DVector::zeros(wambot.dof()),
            health: RuntimeHealth::Ok,
            consecutive_faults: 0,
            cycles: 0,
            last_state_log: None,
            wambot,
        }
    }

    /// Joint torque sent on every following tick (zero until set)
    pub fn set_torque(&mut self, torque: &[f64]) -> Result<()> {
        if torque.len() != self.torque.len() {
            return Err(RuntimeError::TorqueLength {
                len: torque.len(),
                dof: self.torque.len(),
            });
        }
        self.torque.copy_from_slice(torque);
        Ok(())
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn wambot(&self) -> &Wambot {
        &self.wambot
    }

    /// One control cycle: update, then setjtor
    pub fn step(&mut self) -> Result<()> {
        self.cycles += 1;
        match self.exchange() {
            Ok(()) => {
                if self.health != RuntimeHealth::Ok {
                    info!("Bus recovered after {} faulted cycles", self.consecutive_faults);
                }
                self.health = RuntimeHealth::Ok;
                self.consecutive_faults = 0;
                self.log_state();
                Ok(())
            }
            Err(e) => {
                self.health = RuntimeHealth::BusFault;
                self.consecutive_faults += 1;
                warn!(
                    "Cycle {} failed ({} in a row): {}",
                    self.cycles, self.consecutive_faults, e
                );
                if let Err(hold) = self.wambot.hold_zero_torque() {
                    warn!("Failed to hold zero torque: {}", hold);
                }
                if self.consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                    return Err(RuntimeError::TooManyFaults {
                        count: self.consecutive_faults,
                        last: e,
                    });
                }
                Ok(())
            }
        }
    }

    fn exchange(&mut self) -> std::result::Result<(), WambotError> {
        self.wambot.update()?;
        self.wambot.jtorque_mut().copy_from(&self.torque);
        self.wambot.setjtor()
    }

    fn log_state(&mut self) {
        let now = Instant::now();
        if self
            .last_state_log
            .is_some_and(|last| now.duration_since(last) < STATE_LOG_PERIOD)
        {
            return;
        }
        self.last_state_log = Some(now);
        match serde_json::to_string(&JointState::from(&self.wambot)) {
            Ok(json) => info!("Joint state: {}", json),
            Err(e) => warn!("Failed to serialize joint state: {}", e),
        }
    }

    /// Tick at `LOOP_HZ` until `cycles` ticks have run (forever if `None`)
    /// or Ctrl-C is pressed.
    ///
    /// Bus I/O is synchronous and runs on the loop's own task.
    pub async fn run_for(&mut self, cycles: Option<u64>) -> Result<()> {
        let mut tick = interval(Duration::from_micros(1_000_000 / LOOP_HZ));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!("Servo loop started: {}Hz, {} DOF", LOOP_HZ, self.wambot.dof());

        let mut ran = 0u64;
        while cycles.is_none_or(|limit| ran < limit) {
            tokio::select! {
                _ = tick.tick() => {}
                _ = &mut shutdown => {
                    info!("Ctrl-C received, stopping servo loop");
                    break;
                }
            }
            self.step()?;
            ran += 1;
        }
        Ok(())
    }
}

// Never leave the arm with the last commanded torque
impl Drop for Runtime {
    fn drop(&mut self) {
        if let Err(e) = self.wambot.hold_zero_torque() {
            error!("Failed to zero torques on shutdown: {}", e);
        }
    }
}

/// Build the arm from `config` and servo it with zero torque until Ctrl-C
pub async fn run(config: &WambotConfig) -> Result<()> {
    info!("Connecting to the WAM...");
    let wambot = Wambot::create(config)?;
    let mut runtime = Runtime::new(wambot);
    runtime.run_for(None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Property;
    use crate::can::CanDevice;
    use crate::can::sim::SimBus;

    fn runtime(sim: &SimBus) -> Runtime {
        let wam = Wambot::with_device(
            &WambotConfig::wam4_sim(),
            CanDevice::new(Box::new(sim.clone())),
        )
        .unwrap();
        Runtime::new(wam)
    }

    #[tokio::test]
    async fn test_runs_fixed_cycles() {
        let sim = SimBus::wam(4);
        let mut rt = runtime(&sim);
        rt.run_for(Some(5)).await.unwrap();
        assert_eq!(rt.cycles(), 5);
        assert_eq!(rt.health(), RuntimeHealth::Ok);
        assert_eq!(rt.wambot().bus().update_count(), 5);
    }

    #[test]
    fn test_commanded_torque_reaches_pucks() {
        let sim = SimBus::wam(4);
        let mut rt = runtime(&sim);
        rt.set_torque(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        rt.step().unwrap();
        assert_eq!(sim.torque(1), Some((-1.0 / 42.0 * 2700.0) as i64));

        drop(rt);
        assert_eq!(sim.torque(1), Some(0));
    }

    #[test]
    fn test_torque_length_checked() {
        let sim = SimBus::wam(4);
        let mut rt = runtime(&sim);
        assert!(matches!(
            rt.set_torque(&[0.0; 3]),
            Err(RuntimeError::TorqueLength { len: 3, dof: 4 })
        ));
    }

    #[test]
    fn test_watchdog_trips_after_consecutive_faults() {
        let sim = SimBus::wam(4);
        let mut rt = runtime(&sim);
        rt.step().unwrap();

        // a reset puck stops answering packed position requests
        sim.set(3, Property::Stat, 0);
        for _ in 1..MAX_CONSECUTIVE_FAULTS {
            rt.step().unwrap();
            assert_eq!(rt.health(), RuntimeHealth::BusFault);
        }
        assert!(matches!(
            rt.step(),
            Err(RuntimeError::TooManyFaults { count, .. }) if count == MAX_CONSECUTIVE_FAULTS
        ));
    }

    #[test]
    fn test_fault_counter_resets_on_success() {
        let sim = SimBus::wam(4);
        let mut rt = runtime(&sim);

        sim.set(3, Property::Stat, 0);
        rt.step().unwrap();
        assert_eq!(rt.health(), RuntimeHealth::BusFault);

        sim.set(3, Property::Stat, 2);
        rt.step().unwrap();
        assert_eq!(rt.health(), RuntimeHealth::Ok);
    }
}
