// Message types emitted by the runtime

use serde::{Deserialize, Serialize};

use crate::wambot::Wambot;

/// Joint-space snapshot of the arm, logged as JSON by the runtime
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct JointState {
    pub positions: Vec<f64>,
    pub velocities: Vec<f64>,
    pub accelerations: Vec<f64>,
    pub torques: Vec<f64>,
}

// Copies the current joint vectors out of a borrowed Wambot
impl From<&Wambot> for JointState {
    fn from(wam: &Wambot) -> Self {
        Self {
            positions: wam.jposition().iter().copied().collect(),
            velocities: wam.jvelocity().iter().copied().collect(),
            accelerations: wam.jacceleration().iter().copied().collect(),
            torques: wam.jtorque().iter().copied().collect(),
        }
    }
}

/// Health status reported by the runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    /// The last bus update or torque write failed
    BusFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&RuntimeHealth::Ok).unwrap(), "\"ok\"");
        assert_eq!(
            serde_json::to_string(&RuntimeHealth::BusFault).unwrap(),
            "\"bus_fault\""
        );
    }

    #[test]
    fn test_joint_state_json() {
        let state = JointState {
            positions: vec![0.0, -2.0],
            velocities: vec![0.5, 0.0],
            accelerations: vec![0.0, 0.0],
            torques: vec![1.0, 0.0],
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: JointState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.starts_with("{\"positions\":[0.0,-2.0]"));
    }
}
