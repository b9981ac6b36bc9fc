// Joint-space view of a WAM
//
// Provides:
// - Motor <-> joint transmission with cached inverses (transmission.rs)
// - Zero calibration at startup (zero.rs)
// - Wambot: joint position/velocity/acceleration in, joint torque out

mod transmission;
pub mod zero;

use nalgebra::DVector;
use tracing::{info, warn};

use crate::bus::{Bus, BusError, UpdatePolicy};
use crate::can::CanDevice;
use crate::config::{ConfigError, WambotConfig, WambotKind};

pub use transmission::Transmission;
pub use zero::ZeroOutcome;

/// Error types for the joint-space layer
#[derive(Debug, thiserror::Error)]
pub enum WambotError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("j2mp transmission matrix is not invertible")]
    SingularTransmission,

    #[error("Expected puck {id} on the bus but it was not found")]
    MissingPuck { id: u8 },

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

pub type Result<T> = std::result::Result<T, WambotError>;

/// A WAM arm in joint space.
///
/// Motor j is driven by puck j + 1. The bus is declared last so it is
/// dropped after everything that refers to its pucks.
pub struct Wambot {
    kind: WambotKind,
    jtorque: DVector<f64>,
    jposition: DVector<f64>,
    jvelocity: DVector<f64>,
    jacceleration: DVector<f64>,
    home: DVector<f64>,
    transmission: Transmission,

    mposition: DVector<f64>,
    mvelocity: DVector<f64>,
    macceleration: DVector<f64>,
    mtorque: DVector<f64>,

    zero_outcome: ZeroOutcome,
    bus: Bus,
}

impl Wambot {
    /// Open the configured bus, discover the arm and zero it
    pub fn create(config: &WambotConfig) -> Result<Self> {
        config.validate()?;
        let transmission = Transmission::from_rows(&config.j2mp)?;
        let bus = Bus::create(&config.bus, update_policy(config.kind))?;
        Self::with_bus(config, transmission, bus)
    }

    /// [`Wambot::create`] on an already-open device
    pub fn with_device(config: &WambotConfig, device: CanDevice) -> Result<Self> {
        config.validate()?;
        let transmission = Transmission::from_rows(&config.j2mp)?;
        let bus = Bus::with_device(device, &config.bus, update_policy(config.kind))?;
        Self::with_bus(config, transmission, bus)
    }

    fn with_bus(config: &WambotConfig, transmission: Transmission, bus: Bus) -> Result<Self> {
        let dof = config.dof;
        for id in 1..=dof {
            let id = u8::try_from(id).map_err(|_| {
                ConfigError::Invalid(format!("dof {} exceeds the puck ID range", dof))
            })?;
            if bus.puck(id).is_none() {
                return Err(WambotError::MissingPuck { id });
            }
        }

        let home = DVector::from_column_slice(&config.home);
        let zeroangle = match (config.kind, config.zeroangle.as_deref()) {
            (WambotKind::Physical, zeroangle) => zeroangle,
            (WambotKind::Standard, Some(_)) => {
                warn!("zeroangle is only used by the physical wambot; ignoring it");
                None
            }
            (WambotKind::Standard, None) => None,
        };
        let zero_outcome = zero::zero(&bus, &transmission, &home, zeroangle)?;

        info!(
            "Wambot ready: {:?}, {} DOF, {} pucks on port {}",
            config.kind,
            dof,
            bus.pucks().occupied(),
            bus.port()
        );

        Ok(Self {
            kind: config.kind,
            jtorque: DVector::zeros(dof),
            jposition: DVector::zeros(dof),
            jvelocity: DVector::zeros(dof),
            jacceleration: DVector::zeros(dof),
            home,
            transmission,
            mposition: DVector::zeros(dof),
            mvelocity: DVector::zeros(dof),
            macceleration: DVector::zeros(dof),
            mtorque: DVector::zeros(dof),
            zero_outcome,
            bus,
        })
    }

    /// Sample the bus and refresh the joint-space state
    pub fn update(&mut self) -> Result<()> {
        self.bus.update()?;

        for j in 0..self.dof() {
            if let Some(puck) = self.bus.puck(motor_puck(j)) {
                self.mposition[j] = puck.position;
                self.mvelocity[j] = puck.velocity;
                self.macceleration[j] = puck.acceleration;
            }
        }

        let m2jp = self.transmission.m2jp();
        m2jp.mul_to(&self.mposition, &mut self.jposition);
        m2jp.mul_to(&self.mvelocity, &mut self.jvelocity);
        if self.kind == WambotKind::Standard {
            m2jp.mul_to(&self.macceleration, &mut self.jacceleration);
        }
        Ok(())
    }

    /// Send the joint torques in [`Wambot::jtorque_mut`] to the motors
    pub fn setjtor(&mut self) -> Result<()> {
        self.transmission
            .j2mt()
            .mul_to(&self.jtorque, &mut self.mtorque);

        for j in 0..self.dof() {
            if let Some(puck) = self.bus.puck_mut(motor_puck(j)) {
                puck.torque = self.mtorque[j];
            }
        }
        self.bus.set_torques()?;
        Ok(())
    }

    /// Zero every joint torque and send it
    pub fn hold_zero_torque(&mut self) -> Result<()> {
        self.jtorque.fill(0.0);
        self.setjtor()
    }

    pub fn kind(&self) -> WambotKind {
        self.kind
    }

    pub fn dof(&self) -> usize {
        self.jtorque.len()
    }

    /// Joint positions (rad)
    pub fn jposition(&self) -> &DVector<f64> {
        &self.jposition
    }

    /// Joint velocities (rad/s)
    pub fn jvelocity(&self) -> &DVector<f64> {
        &self.jvelocity
    }

    /// Joint accelerations (rad/s^2); zero for the physical wambot
    pub fn jacceleration(&self) -> &DVector<f64> {
        &self.jacceleration
    }

    /// Joint torques (Nm) sent by the next [`Wambot::setjtor`]
    pub fn jtorque(&self) -> &DVector<f64> {
        &self.jtorque
    }

    pub fn jtorque_mut(&mut self) -> &mut DVector<f64> {
        &mut self.jtorque
    }

    pub fn home(&self) -> &DVector<f64> {
        &self.home
    }

    /// Motor torques (Nm) of the last [`Wambot::setjtor`]
    pub fn mtorque(&self) -> &DVector<f64> {
        &self.mtorque
    }

    pub fn transmission(&self) -> &Transmission {
        &self.transmission
    }

    pub fn zero_outcome(&self) -> ZeroOutcome {
        self.zero_outcome
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut Bus {
        &mut self.bus
    }
}

fn update_policy(kind: WambotKind) -> UpdatePolicy {
    match kind {
        WambotKind::Standard => UpdatePolicy::AccelerationPosition,
        WambotKind::Physical => UpdatePolicy::PositionDiff,
    }
}

fn motor_puck(j: usize) -> u8 {
    (j + 1) as u8
}
