// Timing, limits, bus and arm configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::can::AdapterKind;

pub use crate::can::MAX_NODES;
pub use crate::can::frame::TORQUE_LIMIT;

// Servo loop frequency
pub const LOOP_HZ: u64 = 500;

// Consecutive failed ticks before the servo loop stops the arm
pub const MAX_CONSECUTIVE_FAULTS: u32 = 10;

// How often the servo loop logs a joint-state snapshot
pub const STATE_LOG_PERIOD: Duration = Duration::from_secs(1);

// Node ID of the safety module
pub const SAFETY_PUCK_ID: u8 = 10;

// Largest believable change between two position samples (raw counts)
pub const MAX_POSITION_JUMP: i64 = 1000;

// Largest believable change between two acceleration samples (raw units)
pub const MAX_ACCELERATION_JUMP: i64 = 100_000;

// Faults the safety module ignores while positions are being redefined
pub const ZEROING_FAULT_MASK: i64 = 8;

// Oldest firmware that reports a trustworthy absolute MECH angle
pub const ZERO_COMPENSATION_MIN_FIRMWARE: i64 = 118;

// Config file read by the CLI when none is given
pub const DEFAULT_CONFIG_PATH: &str = "wam.json";

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Sleeps used during discovery and zeroing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusTiming {
    /// After broadcasting READY, before probing
    pub wake_settle_ms: u64,
    /// Between a status probe and its non-blocking read
    pub probe_wait_ms: u64,
    /// After forcing a puck to IDLE
    pub mode_settle_us: u64,
    /// Between successive position writes while zeroing
    pub calibration_spacing_ms: u64,
}

impl Default for BusTiming {
    fn default() -> Self {
        Self {
            wake_settle_ms: 300,
            probe_wait_ms: 1,
            mode_settle_us: 200,
            calibration_spacing_ms: 1,
        }
    }
}

impl BusTiming {
    /// No waits at all; for the simulated bus
    pub fn immediate() -> Self {
        Self {
            wake_settle_ms: 0,
            probe_wait_ms: 0,
            mode_settle_us: 0,
            calibration_spacing_ms: 0,
        }
    }

    pub fn wake_settle(&self) -> Duration {
        Duration::from_millis(self.wake_settle_ms)
    }

    pub fn probe_wait(&self) -> Duration {
        Duration::from_millis(self.probe_wait_ms)
    }

    pub fn mode_settle(&self) -> Duration {
        Duration::from_micros(self.mode_settle_us)
    }

    pub fn calibration_spacing(&self) -> Duration {
        Duration::from_millis(self.calibration_spacing_ms)
    }
}

/// One CAN bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Zero-indexed port; checked when the bus is opened
    pub port: Option<i64>,
    #[serde(default)]
    pub adapter: AdapterKind,
    /// Interface name, serial device or simulator preset
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub check_acceleration_jumps: bool,
    #[serde(default)]
    pub timing: BusTiming,
}

impl BusConfig {
    /// Simulated bus with no settle delays
    pub fn sim(preset: &str) -> Self {
        Self {
            port: Some(0),
            adapter: AdapterKind::Sim,
            device: Some(preset.to_string()),
            check_acceleration_jumps: false,
            timing: BusTiming::immediate(),
        }
    }
}

/// Which wambot flavour to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WambotKind {
    /// Alternating acceleration/position updates, joint acceleration
    #[default]
    Standard,
    /// Position-only updates with optional absolute-encoder zero correction
    Physical,
}

/// Arm description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WambotConfig {
    #[serde(default)]
    pub kind: WambotKind,
    pub dof: usize,
    /// Joint-space home position (rad)
    pub home: Vec<f64>,
    /// Joint-to-motor position transmission, `dof` rows of `dof`
    pub j2mp: Vec<Vec<f64>>,
    /// Motor angle of each absolute encoder at home (rad)
    #[serde(default)]
    pub zeroangle: Option<Vec<f64>>,
    pub bus: BusConfig,
}

impl WambotConfig {
    /// Load and validate a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dof == 0 {
            return Err(ConfigError::Invalid("dof must be positive".to_string()));
        }
        if self.home.len() != self.dof {
            return Err(ConfigError::Invalid(format!(
                "home has {} entries, dof is {}",
                self.home.len(),
                self.dof
            )));
        }
        if self.j2mp.len() != self.dof || self.j2mp.iter().any(|row| row.len() != self.dof) {
            return Err(ConfigError::Invalid(format!(
                "j2mp must be {0}x{0}",
                self.dof
            )));
        }
        if let Some(zeroangle) = &self.zeroangle {
            if zeroangle.len() != self.dof {
                return Err(ConfigError::Invalid(format!(
                    "zeroangle has {} entries, dof is {}",
                    zeroangle.len(),
                    self.dof
                )));
            }
        }
        match self.bus.port {
            Some(port) if port >= 0 => Ok(()),
            Some(port) => Err(ConfigError::Invalid(format!("bus port {} is negative", port))),
            None => Err(ConfigError::Invalid("bus port missing".to_string())),
        }
    }

    /// 4-DOF WAM on a simulated bus
    pub fn wam4_sim() -> Self {
        Self {
            kind: WambotKind::Standard,
            dof: 4,
            home: vec![0.0, -2.0, 0.0, 3.14],
            j2mp: vec![
                vec![-42.0, 0.0, 0.0, 0.0],
                vec![0.0, 28.25, -28.25, 0.0],
                vec![0.0, -16.8155, -16.8155, 0.0],
                vec![0.0, 0.0, 0.0, -18.0],
            ],
            zeroangle: None,
            bus: BusConfig::sim("wam4"),
        }
    }

    /// 7-DOF WAM on a simulated bus
    pub fn wam7_sim() -> Self {
        let mut j2mp = vec![vec![0.0; 7]; 7];
        for (r, row) in Self::wam4_sim().j2mp.into_iter().enumerate() {
            j2mp[r][..4].copy_from_slice(&row);
        }
        j2mp[4][4] = 9.7;
        j2mp[4][5] = 9.7;
        j2mp[5][4] = -9.7;
        j2mp[5][5] = 9.7;
        j2mp[6][6] = -14.93;
        Self {
            kind: WambotKind::Standard,
            dof: 7,
            home: vec![0.0, -2.0, 0.0, 3.14, 0.0, 0.0, 0.0],
            j2mp,
            zeroangle: None,
            bus: BusConfig::sim("wam7"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAM4_JSON: &str = r#"{
        "dof": 4,
        "home": [0.0, -2.0, 0.0, 3.14],
        "j2mp": [[-42, 0, 0, 0], [0, 28.25, -28.25, 0], [0, -16.8155, -16.8155, 0], [0, 0, 0, -18]],
        "bus": { "port": 0 }
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = WambotConfig::from_json(WAM4_JSON).unwrap();
        assert_eq!(config.kind, WambotKind::Standard);
        assert_eq!(config.bus.adapter, AdapterKind::Socket);
        assert_eq!(config.bus.timing, BusTiming::default());
        assert_eq!(config.bus.timing.wake_settle(), Duration::from_millis(300));
        assert!(!config.bus.check_acceleration_jumps);
        assert!(config.zeroangle.is_none());
    }

    #[test]
    fn test_physical_with_zeroangle() {
        let json = WAM4_JSON.replace(
            "\"dof\": 4,",
            "\"dof\": 4, \"kind\": \"physical\", \"zeroangle\": [1, 2, 3, 4],",
        );
        let config = WambotConfig::from_json(&json).unwrap();
        assert_eq!(config.kind, WambotKind::Physical);
        assert_eq!(config.zeroangle, Some(vec![1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn test_validate_rejects_bad_shapes() {
        let mut config = WambotConfig::wam4_sim();
        config.home.pop();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WambotConfig::wam4_sim();
        config.j2mp[2].push(1.0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WambotConfig::wam4_sim();
        config.zeroangle = Some(vec![0.0; 3]);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = WambotConfig::wam4_sim();
        config.dof = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_port() {
        let mut config = WambotConfig::wam4_sim();
        config.bus.port = None;
        assert!(config.validate().is_err());
        config.bus.port = Some(-1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_field_is_parse_error() {
        assert!(matches!(
            WambotConfig::from_json(r#"{ "dof": 4 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_presets_are_valid() {
        WambotConfig::wam4_sim().validate().unwrap();
        WambotConfig::wam7_sim().validate().unwrap();
    }
}
