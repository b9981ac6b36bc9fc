// Zero calibration
//
// Once per power cycle the pucks' encoders are told which joint position
// they sit at. The safety module remembers that this happened (ZERO) so a
// restarted application does not redefine a moved arm.

use std::f64::consts::{PI, TAU};
use std::thread::sleep;

use nalgebra::DVector;
use tracing::{info, warn};

use super::transmission::Transmission;
use super::{Result, WambotError};
use crate::bus::{Bus, Property, SafetyPuck};
use crate::config::{ConfigError, ZEROING_FAULT_MASK, ZERO_COMPENSATION_MIN_FIRMWARE};

/// What zeroing did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroOutcome {
    /// The safety module already had ZERO set
    AlreadyZeroed,
    /// No safety module on the bus; positions were left alone
    NoSafetyModule,
    /// Positions were defined from the home position
    Zeroed { compensated: bool },
}

/// Zero the arm unless the safety module says it already is.
///
/// With `zeroangle`, each absolute encoder's MECH reading corrects the
/// assumption that the arm sits exactly at `home`.
pub fn zero(
    bus: &Bus,
    transmission: &Transmission,
    home: &DVector<f64>,
    zeroangle: Option<&[f64]>,
) -> Result<ZeroOutcome> {
    let Some(safety) = bus.safety_puck() else {
        warn!("No safety puck: WAM may not be zeroed");
        return Ok(ZeroOutcome::NoSafetyModule);
    };

    if bus.get_property(safety.id, Property::Zero)? != 0 {
        info!("WAM was already zeroed");
        return Ok(ZeroOutcome::AlreadyZeroed);
    }

    let compensated = zeroangle.is_some();
    let target = match zeroangle {
        Some(zeroangle) => compensated_home(bus, transmission, home, zeroangle)?,
        None => home.clone(),
    };

    define_position(bus, safety, transmission, &target)?;
    bus.set_property(safety.id, Property::Zero, 1, true)?;
    if compensated {
        info!("WAM zeroed with zero-compensation");
    } else {
        info!("WAM zeroed without zero-compensation");
    }
    Ok(ZeroOutcome::Zeroed { compensated })
}

/// Write the motor counts for joint position `joint` into every puck
pub fn define_position(
    bus: &Bus,
    safety: SafetyPuck,
    transmission: &Transmission,
    joint: &DVector<f64>,
) -> Result<()> {
    let motor = transmission.joint_to_motor_position(joint);

    // positions jump while being redefined
    bus.set_property(safety.id, Property::Ifault, ZEROING_FAULT_MASK, true)?;

    for (j, angle) in motor.iter().enumerate() {
        let id = puck_id(j);
        let puck = bus.puck(id).ok_or(WambotError::MissingPuck { id })?;
        let counts = puck.rad_to_counts(*angle);
        bus.set_property(id, Property::Ap, counts, false)?;
        sleep(bus.timing().calibration_spacing());
    }
    Ok(())
}

/// `home` corrected by the absolute encoders' offset from their
/// calibrated zero angles
fn compensated_home(
    bus: &Bus,
    transmission: &Transmission,
    home: &DVector<f64>,
    zeroangle: &[f64],
) -> Result<DVector<f64>> {
    let dof = transmission.dof();
    if zeroangle.len() != dof {
        return Err(WambotError::Config(ConfigError::Invalid(format!(
            "zeroangle has {} entries, dof is {}",
            zeroangle.len(),
            dof
        ))));
    }
    let mut current = DVector::zeros(dof);
    for j in 0..dof {
        let id = puck_id(j);
        let puck = bus.puck(id).ok_or(WambotError::MissingPuck { id })?;
        current[j] = puck.counts_to_rad(bus.get_property(id, Property::Mech)?);
    }

    let expected = transmission.joint_to_motor_position(home) + DVector::from_column_slice(zeroangle);
    let mut error = (expected - current).map(wrap_angle);

    for j in 0..dof {
        let id = puck_id(j);
        let puck = bus.puck(id).ok_or(WambotError::MissingPuck { id })?;
        if puck.vers() < ZERO_COMPENSATION_MIN_FIRMWARE {
            warn!("No zero-compensation for puck {}: old firmware", id);
            error[j] = 0.0;
        } else if !puck.has_absolute_encoder() {
            warn!("No zero-compensation for puck {}: no absolute encoder", id);
            error[j] = 0.0;
        } else if !(0.0..TAU).contains(&zeroangle[j]) {
            warn!("No zero-compensation for puck {}: bad calibration data", id);
            error[j] = 0.0;
        }
    }

    Ok(home - transmission.motor_to_joint_position(&error))
}

/// Wrap an angle into [-pi, pi)
pub fn wrap_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(TAU) - PI
}

/// Motor j is driven by puck j + 1
fn puck_id(j: usize) -> u8 {
    (j + 1) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_angle() {
        assert!((wrap_angle(0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_angle(TAU + 0.5) - 0.5).abs() < 1e-12);
        assert!((wrap_angle(-TAU - 0.5) + 0.5).abs() < 1e-12);
        assert!((wrap_angle(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
        let w = wrap_angle(-56.5);
        assert!((-PI..PI).contains(&w));
        assert!(((w + 56.5) / TAU - ((w + 56.5) / TAU).round()).abs() < 1e-9);
    }
}
