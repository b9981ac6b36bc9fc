// Motor <-> joint transmission for the WAM cable drives
//
// Motor angles are j2mp * joint angles. Joint torques map to motor torques
// through the inverse transpose, so power is the same on both sides.

use nalgebra::{DMatrix, DVector};

use super::{Result, WambotError};

/// Joint-to-motor position matrix and its cached derivatives
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    j2mp: DMatrix<f64>,
    m2jp: DMatrix<f64>,
    j2mt: DMatrix<f64>,
}

impl Transmission {
    /// Factor `j2mp` once. Fails if it is not square or not invertible.
    pub fn new(j2mp: DMatrix<f64>) -> Result<Self> {
        if !j2mp.is_square() || j2mp.nrows() == 0 {
            return Err(WambotError::SingularTransmission);
        }
        let m2jp = invert(&j2mp)?;
        let j2mt = invert(&j2mp.transpose())?;
        Ok(Self { j2mp, m2jp, j2mt })
    }

    /// Build from config rows (`dof` rows of `dof` values)
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let n = rows.len();
        if rows.iter().any(|row| row.len() != n) {
            return Err(WambotError::SingularTransmission);
        }
        Self::new(DMatrix::from_fn(n, n, |r, c| rows[r][c]))
    }

    pub fn dof(&self) -> usize {
        self.j2mp.nrows()
    }

    pub fn j2mp(&self) -> &DMatrix<f64> {
        &self.j2mp
    }

    pub fn m2jp(&self) -> &DMatrix<f64> {
        &self.m2jp
    }

    pub fn j2mt(&self) -> &DMatrix<f64> {
        &self.j2mt
    }

    /// Joint angles to motor angles (rad)
    pub fn joint_to_motor_position(&self, joint: &DVector<f64>) -> DVector<f64> {
        &self.j2mp * joint
    }

    /// Motor angles (or rates) to joint angles (or rates)
    pub fn motor_to_joint_position(&self, motor: &DVector<f64>) -> DVector<f64> {
        &self.m2jp * motor
    }

    /// Joint torques to motor torques (Nm)
    pub fn joint_to_motor_torque(&self, joint: &DVector<f64>) -> DVector<f64> {
        &self.j2mt * joint
    }
}

fn invert(m: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    m.clone()
        .lu()
        .try_inverse()
        .filter(|inv| inv.iter().all(|x| x.is_finite()))
        .ok_or(WambotError::SingularTransmission)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wam4() -> Transmission {
        Transmission::from_rows(&[
            vec![-42.0, 0.0, 0.0, 0.0],
            vec![0.0, 28.25, -28.25, 0.0],
            vec![0.0, -16.8155, -16.8155, 0.0],
            vec![0.0, 0.0, 0.0, -18.0],
        ])
        .unwrap()
    }

    fn assert_identity(m: &DMatrix<f64>) {
        let eye = DMatrix::<f64>::identity(m.nrows(), m.ncols());
        assert!((m - eye).amax() < 1e-9, "not identity: {}", m);
    }

    #[test]
    fn test_inverses() {
        let t = wam4();
        assert_identity(&(t.j2mp() * t.m2jp()));
        assert_identity(&(t.j2mp() * t.j2mt().transpose()));
    }

    #[test]
    fn test_inverses_dense() {
        // arbitrary well-conditioned 7x7
        let rows: Vec<Vec<f64>> = (0..7)
            .map(|r| {
                (0..7)
                    .map(|c| if r == c { 10.0 + r as f64 } else { ((r * 7 + c) % 5) as f64 - 2.0 })
                    .collect()
            })
            .collect();
        let t = Transmission::from_rows(&rows).unwrap();
        assert_eq!(t.dof(), 7);
        assert_identity(&(t.j2mp() * t.m2jp()));
        assert_identity(&(t.j2mp() * t.j2mt().transpose()));
    }

    #[test]
    fn test_round_trip_position() {
        let t = wam4();
        let joint = DVector::from_vec(vec![0.1, -2.0, 0.3, 3.14]);
        let back = t.motor_to_joint_position(&t.joint_to_motor_position(&joint));
        assert!((back - joint).amax() < 1e-12);
    }

    #[test]
    fn test_torque_power_balance() {
        let t = wam4();
        let jt = DVector::from_vec(vec![1.0, -0.5, 2.0, 0.25]);
        let jv = DVector::from_vec(vec![0.3, 0.1, -0.2, 1.0]);
        let mt = t.joint_to_motor_torque(&jt);
        let mv = t.joint_to_motor_position(&jv);
        assert!((jt.dot(&jv) - mt.dot(&mv)).abs() < 1e-9);
    }

    #[test]
    fn test_singular_rejected() {
        let result = Transmission::from_rows(&[vec![1.0, 2.0], vec![2.0, 4.0]]);
        assert!(matches!(result, Err(WambotError::SingularTransmission)));
        let result = Transmission::from_rows(&[vec![1.0, 2.0], vec![2.0]]);
        assert!(matches!(result, Err(WambotError::SingularTransmission)));
    }
}
