//! Iterative pose alignment.
//!
//! Damped Gauss-Newton over SE3 minimizing a robust reprojection-plus-depth
//! error. Near points contribute a depth residual scaled to pixel units;
//! far points are bearing-only. The same machinery, with its own parameter
//! set, aligns 3D-3D landmark correspondences for the relocalizer.

use nalgebra::{Matrix2x3, Matrix3x6, Matrix6, Vector2, Vector3, Vector6};

use crate::config::AlignerParameters;
use crate::geometry::{skew, Camera, SE3};

/// One landmark-to-measurement correspondence for pose refinement.
#[derive(Debug, Clone)]
pub struct AlignmentCorrespondence {
    /// Landmark position in world coordinates.
    pub world_coordinates: Vector3<f64>,
    /// Measured pixel in the left image.
    pub image_coordinates: Vector2<f64>,
    /// Measured depth along the optical axis.
    pub depth_meters: f64,
    /// Far points carry no depth residual.
    pub is_near: bool,
}

#[derive(Debug, Clone)]
pub struct AlignmentResult {
    pub world_to_camera: SE3,
    pub iterations: usize,
    /// Robust weighted squared error of the last evaluation.
    pub total_error: f64,
    pub number_of_inliers: usize,
    pub inlier_ratio: f64,
    pub converged: bool,
    pub diverged: bool,
    pub inlier_mask: Vec<bool>,
}

impl AlignmentResult {
    /// Success requires convergence plus both inlier gates.
    pub fn has_succeeded(&self, parameters: &AlignerParameters) -> bool {
        self.converged
            && !self.diverged
            && self.number_of_inliers >= parameters.minimum_number_of_inliers
            && self.inlier_ratio >= parameters.minimum_inlier_ratio
    }
}

/// Refine `world_to_camera` against reprojection-plus-depth measurements.
pub fn align(
    parameters: &AlignerParameters,
    camera: &Camera,
    initial_world_to_camera: &SE3,
    correspondences: &[AlignmentCorrespondence],
) -> AlignmentResult {
    let mut estimate = initial_world_to_camera.clone();
    let mut inlier_mask = vec![false; correspondences.len()];
    let mut result = AlignmentResult {
        world_to_camera: estimate.clone(),
        iterations: 0,
        total_error: 0.0,
        number_of_inliers: 0,
        inlier_ratio: 0.0,
        converged: false,
        diverged: false,
        inlier_mask: inlier_mask.clone(),
    };
    if correspondences.is_empty() {
        return result;
    }

    let mut previous_error = f64::MAX;
    let mut error_growths = 0usize;

    for iteration in 0..parameters.maximum_number_of_iterations {
        result.iterations = iteration + 1;

        let mut hessian = Matrix6::<f64>::zeros();
        let mut gradient = Vector6::<f64>::zeros();
        let mut total_error = 0.0;
        let mut inliers = 0usize;

        for (index, correspondence) in correspondences.iter().enumerate() {
            inlier_mask[index] = false;
            let point_camera = estimate.transform_point(&correspondence.world_coordinates);
            if point_camera.z <= 1e-6 {
                continue;
            }
            let Some(projection) = camera.project(&point_camera) else {
                continue;
            };

            // Depth residual in pixel units; far points are bearing-only.
            let depth_scaling = if correspondence.is_near {
                camera.fx / correspondence.depth_meters.max(1e-3)
            } else {
                0.0
            };
            let error = Vector3::new(
                projection.x - correspondence.image_coordinates.x,
                projection.y - correspondence.image_coordinates.y,
                depth_scaling * (point_camera.z - correspondence.depth_meters),
            );

            let chi = error.norm_squared();
            let mut weight = 1.0;
            if chi > parameters.maximum_error_kernel {
                weight = parameters.maximum_error_kernel / chi;
            } else {
                inlier_mask[index] = true;
                inliers += 1;
            }
            total_error += weight * chi;

            // d(u,v)/dp for the pinhole projection.
            let z = point_camera.z;
            let z_squared = z * z;
            let jacobian_projection = Matrix2x3::new(
                camera.fx / z,
                0.0,
                -camera.fx * point_camera.x / z_squared,
                0.0,
                camera.fy / z,
                -camera.fy * point_camera.y / z_squared,
            );
            // dp/dξ for a left-multiplied twist [v, ω].
            let mut jacobian_point = Matrix3x6::<f64>::zeros();
            jacobian_point
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&nalgebra::Matrix3::identity());
            jacobian_point
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-skew(&point_camera)));

            let jacobian_uv = jacobian_projection * jacobian_point; // 2x6
            let jacobian_depth = depth_scaling * jacobian_point.row(2); // 1x6

            let mut jacobian = Matrix3x6::<f64>::zeros();
            jacobian.fixed_view_mut::<2, 6>(0, 0).copy_from(&jacobian_uv);
            jacobian.fixed_view_mut::<1, 6>(2, 0).copy_from(&jacobian_depth);

            hessian += weight * jacobian.transpose() * jacobian;
            gradient += weight * jacobian.transpose() * error;
        }

        result.total_error = total_error;
        result.number_of_inliers = inliers;
        result.inlier_ratio = inliers as f64 / correspondences.len() as f64;
        result.inlier_mask.copy_from_slice(&inlier_mask);
        result.world_to_camera = estimate.clone();

        // Levenberg-style damping keeps the normal equations solvable.
        let damped = hessian + parameters.damping * Matrix6::identity();
        let Some(solution) = damped.cholesky().map(|factor| factor.solve(&(-gradient))) else {
            result.diverged = true;
            break;
        };
        estimate = SE3::exp(&solution).compose(&estimate);

        if (previous_error - total_error).abs() < parameters.error_delta_for_convergence {
            result.converged = true;
            result.world_to_camera = estimate;
            break;
        }
        if total_error > previous_error {
            // Hysteresis: a single growth can be damping noise.
            error_growths += 1;
            if error_growths > 1 {
                result.diverged = true;
                break;
            }
        } else {
            error_growths = 0;
        }
        previous_error = total_error;
    }

    result
}

/// Refine `query_to_reference` against 3D-3D landmark correspondences
/// (used for the geometric verification of loop closures).
pub fn align_points(
    parameters: &AlignerParameters,
    initial_query_to_reference: &SE3,
    pairs: &[(Vector3<f64>, Vector3<f64>)],
) -> AlignmentResult {
    let mut estimate = initial_query_to_reference.clone();
    let mut inlier_mask = vec![false; pairs.len()];
    let mut result = AlignmentResult {
        world_to_camera: estimate.clone(),
        iterations: 0,
        total_error: 0.0,
        number_of_inliers: 0,
        inlier_ratio: 0.0,
        converged: false,
        diverged: false,
        inlier_mask: inlier_mask.clone(),
    };
    if pairs.is_empty() {
        return result;
    }

    let mut previous_error = f64::MAX;
    let mut error_growths = 0usize;

    for iteration in 0..parameters.maximum_number_of_iterations {
        result.iterations = iteration + 1;

        let mut hessian = Matrix6::<f64>::zeros();
        let mut gradient = Vector6::<f64>::zeros();
        let mut total_error = 0.0;
        let mut inliers = 0usize;

        for (index, (query_point, reference_point)) in pairs.iter().enumerate() {
            inlier_mask[index] = false;
            let transformed = estimate.transform_point(query_point);
            let error = transformed - reference_point;

            let chi = error.norm_squared();
            let mut weight = 1.0;
            if chi > parameters.maximum_error_kernel {
                weight = parameters.maximum_error_kernel / chi;
            } else {
                inlier_mask[index] = true;
                inliers += 1;
            }
            total_error += weight * chi;

            let mut jacobian = Matrix3x6::<f64>::zeros();
            jacobian
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&nalgebra::Matrix3::identity());
            jacobian
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-skew(&transformed)));

            hessian += weight * jacobian.transpose() * jacobian;
            gradient += weight * jacobian.transpose() * error;
        }

        result.total_error = total_error;
        result.number_of_inliers = inliers;
        result.inlier_ratio = inliers as f64 / pairs.len() as f64;
        result.inlier_mask.copy_from_slice(&inlier_mask);
        result.world_to_camera = estimate.clone();

        let damped = hessian + parameters.damping * Matrix6::identity();
        let Some(solution) = damped.cholesky().map(|factor| factor.solve(&(-gradient))) else {
            result.diverged = true;
            break;
        };
        estimate = SE3::exp(&solution).compose(&estimate);

        if (previous_error - total_error).abs() < parameters.error_delta_for_convergence {
            result.converged = true;
            result.world_to_camera = estimate;
            break;
        }
        if total_error > previous_error {
            error_growths += 1;
            if error_growths > 1 {
                result.diverged = true;
                break;
            }
        } else {
            error_growths = 0;
        }
        previous_error = total_error;
    }

    result
}
