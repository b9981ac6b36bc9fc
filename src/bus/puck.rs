// Puck, safety puck and broadcast group records.

use std::f64::consts::TAU;

use crate::can::frame::TORQUE_LIMIT;

/// Puck status as reported through STAT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PuckStatus {
    Offline = -1,
    Reset = 0,
    Err = 1,
    Ready = 2,
}

impl PuckStatus {
    pub fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            -1 => Some(PuckStatus::Offline),
            0 => Some(PuckStatus::Reset),
            1 => Some(PuckStatus::Err),
            2 => Some(PuckStatus::Ready),
            _ => None,
        }
    }
}

/// Puck control modes (MODE)
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Idle = 0,
    Duty = 1,
    Torque = 2,
    Pid = 3,
    Velocity = 4,
    Trapezoidal = 5,
}

/// ROLE bit set on pucks with an absolute (magnetic) encoder
pub const ROLE_ABSOLUTE_ENCODER: i64 = 0x100;

/// Packed accelerations are scaled by the 5 kHz servo rate and 2^18
const ACCELERATION_SCALE: f64 = 5000.0 * 5000.0 / (1u32 << 18) as f64;

/// One motor-controller node
#[derive(Debug, Clone, PartialEq)]
pub struct Puck {
    id: u8,
    vers: i64,
    role: i64,
    counts_per_rev: i64,
    i_per_nm: f64,
    group: u8,
    order: usize,

    /// Last accepted raw values
    pub raw_position: i64,
    pub raw_acceleration: i64,
    pub raw_torque: i32,

    /// SI values: rad, rad/s, rad/s^2, Nm
    pub position: f64,
    pub velocity: f64,
    pub acceleration: f64,
    pub torque: f64,

    pub position_last: f64,
    pub velocity_last: f64,
}

impl Puck {
    /// `order` is the zero-based slot within the group (PIDX - 1)
    pub fn new(
        id: u8,
        vers: i64,
        role: i64,
        counts_per_rev: i64,
        i_per_nm: f64,
        group: u8,
        order: usize,
    ) -> Self {
        Self {
            id,
            vers,
            role,
            counts_per_rev,
            i_per_nm,
            group,
            order,
            raw_position: 0,
            raw_acceleration: 0,
            raw_torque: 0,
            position: 0.0,
            velocity: 0.0,
            acceleration: 0.0,
            torque: 0.0,
            position_last: 0.0,
            velocity_last: 0.0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn vers(&self) -> i64 {
        self.vers
    }

    pub fn role(&self) -> i64 {
        self.role
    }

    pub fn counts_per_rev(&self) -> i64 {
        self.counts_per_rev
    }

    /// Current units per Newton-meter
    pub fn i_per_nm(&self) -> f64 {
        self.i_per_nm
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn has_absolute_encoder(&self) -> bool {
        self.role & ROLE_ABSOLUTE_ENCODER != 0
    }

    /// Encoder counts to radians
    pub fn counts_to_rad(&self, counts: i64) -> f64 {
        TAU * counts as f64 / self.counts_per_rev as f64
    }

    /// Radians to encoder counts; exact inverse of [`Puck::counts_to_rad`]
    /// for whole counts
    pub fn rad_to_counts(&self, rad: f64) -> i64 {
        (rad * self.counts_per_rev as f64 / TAU).round() as i64
    }

    /// Raw packed acceleration to rad/s^2
    pub fn acceleration_from_raw(&self, raw: i64) -> f64 {
        ACCELERATION_SCALE * self.counts_to_rad(raw)
    }

    /// Commanded torque in puck current units, clamped to the packed range
    pub fn torque_to_raw(&self) -> i32 {
        (self.torque * self.i_per_nm).clamp(-(TORQUE_LIMIT as f64), TORQUE_LIMIT as f64) as i32
    }
}

/// The safety module node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyPuck {
    pub id: u8,
}

/// Up to four pucks sharing one packed torque frame, by slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Group {
    slots: [Option<u8>; 4],
}

impl Group {
    pub const SIZE: usize = 4;

    pub fn slot(&self, order: usize) -> Option<u8> {
        self.slots.get(order).copied().flatten()
    }

    pub(crate) fn assign(&mut self, order: usize, puck: u8) {
        self.slots[order] = Some(puck);
    }

    /// Puck IDs by slot
    pub fn slots(&self) -> [Option<u8>; 4] {
        self.slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn puck(cts: i64, ipnm: f64) -> Puck {
        Puck::new(1, 130, ROLE_ABSOLUTE_ENCODER, cts, ipnm, 1, 0)
    }

    #[test]
    fn test_counts_round_trip() {
        for cts in [4096, 40960, 131072] {
            let p = puck(cts, 1.0);
            for counts in [-300_000, -4097, -1, 0, 1, 200, 4096, 4296, 1_000_000] {
                assert_eq!(p.rad_to_counts(p.counts_to_rad(counts)), counts);
            }
        }
    }

    #[test]
    fn test_counts_to_rad() {
        let p = puck(4096, 1.0);
        assert!((p.counts_to_rad(4096) - TAU).abs() < 1e-12);
        assert!((p.counts_to_rad(-1024) + TAU / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_torque_to_raw() {
        let mut p = puck(4096, 1000.0);
        p.torque = 1.0;
        assert_eq!(p.torque_to_raw(), 1000);
        p.torque = -1.0;
        assert_eq!(p.torque_to_raw(), -1000);
        p.torque = 100.0;
        assert_eq!(p.torque_to_raw(), 8191);
        p.torque = -100.0;
        assert_eq!(p.torque_to_raw(), -8191);
    }

    #[test]
    fn test_acceleration_scale() {
        let p = puck(4096, 1.0);
        let expected = 25e6 * TAU * 1.0 / 4096.0 / 262144.0;
        assert!((p.acceleration_from_raw(1) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_status_from_raw() {
        assert_eq!(PuckStatus::from_raw(2), Some(PuckStatus::Ready));
        assert_eq!(PuckStatus::from_raw(0), Some(PuckStatus::Reset));
        assert_eq!(PuckStatus::from_raw(7), None);
    }

    #[test]
    fn test_group_slots() {
        let mut g = Group::default();
        g.assign(2, 3);
        assert_eq!(g.slot(2), Some(3));
        assert_eq!(g.slot(0), None);
        assert_eq!(g.slot(9), None);
        assert_eq!(g.slots(), [None, None, Some(3), None]);
    }
}
