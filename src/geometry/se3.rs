//! SE(3) rigid transforms.
//!
//! Poses and relative transforms are stored as rotation + translation and
//! composed like homogeneous matrices: `a.compose(&b)` applies `b` first.
//! The exponential/logarithm maps use the `[v, ω]` twist ordering and are
//! what the iterative aligners and the pose-graph solver parameterize over.

use nalgebra::{Matrix3, Matrix4, UnitQuaternion, Vector3, Vector6};

/// Small angle threshold below which series expansions are used.
const SMALL_ANGLE_THRESHOLD: f64 = 1e-8;

/// A rigid transform in 3D: rotation followed by translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SE3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
}

impl SE3 {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
        }
    }

    pub fn new(rotation: UnitQuaternion<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn from_translation(translation: Vector3<f64>) -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation,
        }
    }

    /// Inverse transform: if `self` maps a to b, the result maps b to a.
    pub fn inverse(&self) -> Self {
        let rotation = self.rotation.inverse();
        Self {
            translation: -(rotation * self.translation),
            rotation,
        }
    }

    /// Composition `self * other` (matrix order: `other` is applied first).
    pub fn compose(&self, other: &SE3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.rotation * other.translation + self.translation,
        }
    }

    /// Apply the transform to a point.
    pub fn transform_point(&self, point: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * point + self.translation
    }

    /// Rotation angle in radians.
    pub fn angle(&self) -> f64 {
        self.rotation.angle()
    }

    /// Exponential map from a twist `[v, ω]`.
    pub fn exp(twist: &Vector6<f64>) -> Self {
        let v = Vector3::new(twist[0], twist[1], twist[2]);
        let omega = Vector3::new(twist[3], twist[4], twist[5]);
        let rotation = UnitQuaternion::from_scaled_axis(omega);
        Self {
            rotation,
            translation: left_jacobian_so3(&omega) * v,
        }
    }

    /// Logarithm map to a twist `[v, ω]`. Inverse of [`SE3::exp`].
    pub fn log(&self) -> Vector6<f64> {
        let omega = self.rotation.scaled_axis();
        let v = left_jacobian_so3_inv(&omega) * self.translation;
        Vector6::new(v.x, v.y, v.z, omega.x, omega.y, omega.z)
    }

    /// The transform as a 4×4 homogeneous matrix.
    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut matrix = Matrix4::identity();
        matrix
            .fixed_view_mut::<3, 3>(0, 0)
            .copy_from(self.rotation.to_rotation_matrix().matrix());
        matrix
            .fixed_view_mut::<3, 1>(0, 3)
            .copy_from(&self.translation);
        matrix
    }

    /// Build from a 4×4 homogeneous matrix (upper 3×3 assumed orthonormal).
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Self {
        let rotation = UnitQuaternion::from_rotation_matrix(
            &nalgebra::Rotation3::from_matrix_unchecked(
                matrix.fixed_view::<3, 3>(0, 0).clone_owned(),
            ),
        );
        let translation = matrix.fixed_view::<3, 1>(0, 3).clone_owned();
        Self {
            rotation,
            translation,
        }
    }
}

/// Skew-symmetric matrix `[v]×` such that `[v]× u = v × u`.
#[inline]
#[rustfmt::skip]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y,
        v.z, 0.0, -v.x,
        -v.y, v.x, 0.0,
    )
}

/// Left Jacobian of SO(3), relating the translational twist component to the
/// translation of `exp`.
fn left_jacobian_so3(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() + 0.5 * skew(omega);
    }

    let theta_sq = theta * theta;
    let theta_cu = theta_sq * theta;
    let skew_omega = skew(omega);
    let skew_omega_sq = skew_omega * skew_omega;

    Matrix3::identity()
        + ((1.0 - theta.cos()) / theta_sq) * skew_omega
        + ((theta - theta.sin()) / theta_cu) * skew_omega_sq
}

/// Inverse of the left Jacobian of SO(3).
fn left_jacobian_so3_inv(omega: &Vector3<f64>) -> Matrix3<f64> {
    let theta = omega.norm();
    let skew_omega = skew(omega);
    if theta < SMALL_ANGLE_THRESHOLD {
        return Matrix3::identity() - 0.5 * skew_omega + (1.0 / 12.0) * skew_omega * skew_omega;
    }

    let theta_sq = theta * theta;
    let half_theta = 0.5 * theta;
    let coefficient = 1.0 / theta_sq - half_theta.cos() / (2.0 * theta * half_theta.sin());

    Matrix3::identity() - 0.5 * skew_omega + coefficient * (skew_omega * skew_omega)
}
