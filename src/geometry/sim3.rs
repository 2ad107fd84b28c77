//! Sim3: 7-DOF similarity transformation (rotation + translation + scale).
//!
//! Monocular depth is only defined up to scale, so keyframe-to-parent poses
//! carry an explicit similarity scale. The mapping core renormalizes this
//! scale whenever a new keyframe's mean inverse depth is rescaled to one.

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use super::SE3;

/// 7-DOF Similarity transformation: rotation + translation + scale.
///
/// Transforms points as: p' = s * R * p + t
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    /// Identity transformation (no rotation, no translation, scale = 1).
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    /// Construct from rotation matrix, translation, and scale.
    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        let rot3 = Rotation3::from_matrix_unchecked(rotation);
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&rot3),
            translation,
            scale,
        }
    }

    /// Construct from SE3 with scale = 1.0.
    pub fn from_se3(se3: &SE3) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale: 1.0,
        }
    }

    /// Construct from SE3 with explicit scale.
    pub fn from_se3_with_scale(se3: &SE3, scale: f64) -> Self {
        Self {
            rotation: se3.rotation,
            translation: se3.translation,
            scale,
        }
    }

    /// Convert to SE3, dropping the scale.
    pub fn to_se3(&self) -> SE3 {
        SE3 {
            rotation: self.rotation,
            translation: self.translation,
        }
    }

    /// Inverse transformation.
    ///
    /// For S = [sR | t; 0 | 1]:
    /// S^{-1} = [(1/s)R^T | -(1/s)R^T*t; 0 | 1]
    pub fn inverse(&self) -> Self {
        let rot_inv = self.rotation.inverse();
        let scale_inv = 1.0 / self.scale;
        let t_inv = -(rot_inv * self.translation) * scale_inv;
        Self {
            rotation: rot_inv,
            translation: t_inv,
            scale: scale_inv,
        }
    }

    /// Compose two Sim3 transforms: self ∘ other.
    ///
    /// For S1 = [s1*R1 | t1] and S2 = [s2*R2 | t2]:
    /// S1 ∘ S2 = [s1*s2*R1*R2 | s1*R1*t2 + t1]
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.scale * (self.rotation * other.translation) + self.translation,
            scale: self.scale * other.scale,
        }
    }

    /// Transform a single point: p' = s * R * p + t.
    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.scale * (self.rotation * p) + self.translation
    }

    /// Get the rotation matrix (without scale).
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Get the scaled rotation matrix (s * R).
    pub fn scaled_rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner() * self.scale
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_identity() {
        let sim3 = Sim3::identity();
        assert_eq!(sim3.scale, 1.0);
        assert_eq!(sim3.translation, Vector3::zeros());

        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_transformed = sim3.transform_point(&p);
        assert_relative_eq!(p_transformed, p, epsilon = 1e-10);
    }

    #[test]
    fn test_from_se3() {
        let se3 = SE3::from_quaternion(1.0, 0.0, 0.0, 0.0, Vector3::new(1.0, 2.0, 3.0));
        let sim3 = Sim3::from_se3(&se3);

        assert_eq!(sim3.scale, 1.0);
        assert_eq!(sim3.translation, se3.translation);
        assert_eq!(sim3.rotation, se3.rotation);
    }

    #[test]
    fn test_to_se3() {
        let sim3 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 2.0,
        };
        let se3 = sim3.to_se3();

        assert_eq!(se3.translation, sim3.translation);
        assert_eq!(se3.rotation, sim3.rotation);
    }

    #[test]
    fn test_inverse() {
        let sim3 = Sim3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(0.0, 0.0, 1.0)),
                std::f64::consts::FRAC_PI_2,
            ),
            translation: Vector3::new(1.0, 2.0, 3.0),
            scale: 2.0,
        };

        let sim3_inv = sim3.inverse();
        let composed = sim3.compose(&sim3_inv);

        assert_relative_eq!(composed.scale, 1.0, epsilon = 1e-10);
        assert_relative_eq!(composed.translation.norm(), 0.0, epsilon = 1e-10);

        // Also verify with a point
        let p = Vector3::new(1.0, 2.0, 3.0);
        let p_transformed = sim3.transform_point(&p);
        let p_back = sim3_inv.transform_point(&p_transformed);
        assert_relative_eq!(p_back, p, epsilon = 1e-10);
    }

    #[test]
    fn test_compose() {
        let s1 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
        };
        let s2 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.0, 1.0, 0.0),
            scale: 3.0,
        };

        let composed = s1.compose(&s2);

        // Scale should multiply
        assert_relative_eq!(composed.scale, 6.0, epsilon = 1e-10);

        // Translation: s1.t + s1.s * R1 * s2.t = (1,0,0) + 2*(0,1,0) = (1,2,0)
        assert_relative_eq!(
            composed.translation,
            Vector3::new(1.0, 2.0, 0.0),
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_transform_point_with_scale() {
        let sim3 = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(1.0, 0.0, 0.0),
            scale: 2.0,
        };

        let p = Vector3::new(1.0, 1.0, 1.0);
        let p_transformed = sim3.transform_point(&p);

        // p' = 2 * I * (1,1,1) + (1,0,0) = (3, 2, 2)
        assert_relative_eq!(p_transformed, Vector3::new(3.0, 2.0, 2.0), epsilon = 1e-10);
    }

    #[test]
    fn test_rescale_roundtrip() {
        let se3 = SE3 {
            rotation: UnitQuaternion::from_axis_angle(
                &nalgebra::Unit::new_normalize(Vector3::new(1.0, 0.0, 0.0)),
                0.4,
            ),
            translation: Vector3::new(0.1, 0.2, 0.3),
        };

        let sim3 = Sim3::from_se3_with_scale(&se3, 2.5);
        assert_relative_eq!(sim3.scale, 2.5, epsilon = 1e-12);
        assert_eq!(sim3.to_se3(), se3);
    }
}
