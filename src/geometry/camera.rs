//! Pinhole camera model with stereo baseline.

use nalgebra::{Vector2, Vector3};

/// Rectified pinhole camera.
///
/// For a stereo rig both cameras share the intrinsics of the left camera and
/// `baseline_meters` is the horizontal offset between them. For an RGB-D
/// sensor the baseline is the registered depth sensor's virtual baseline and
/// only used where disparity is needed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub width: u32,
    pub height: u32,
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub baseline_meters: f64,
}

impl Camera {
    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the image plane.
    pub fn project(&self, point: &Vector3<f64>) -> Option<Vector2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        Some(Vector2::new(
            self.fx * point.x / point.z + self.cx,
            self.fy * point.y / point.z + self.cy,
        ))
    }

    /// Back-project a pixel at a known depth into the camera frame.
    pub fn back_project(&self, u: f64, v: f64, depth_meters: f64) -> Vector3<f64> {
        Vector3::new(
            (u - self.cx) * depth_meters / self.fx,
            (v - self.cy) * depth_meters / self.fy,
            depth_meters,
        )
    }

    /// Depth from stereo disparity: `z = fx · b / d`.
    pub fn depth_from_disparity(&self, disparity_pixels: f64) -> f64 {
        self.fx * self.baseline_meters / disparity_pixels
    }

    /// Disparity a point at the given depth would produce.
    pub fn disparity_from_depth(&self, depth_meters: f64) -> f64 {
        self.fx * self.baseline_meters / depth_meters
    }

    /// Whether pixel coordinates fall inside the image, with a margin.
    pub fn is_in_image(&self, u: f64, v: f64, margin: f64) -> bool {
        u >= -margin
            && u < self.width as f64 + margin
            && v >= -margin
            && v < self.height as f64 + margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_camera() -> Camera {
        Camera {
            width: 640,
            height: 480,
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
            baseline_meters: 0.1,
        }
    }

    #[test]
    fn test_project_back_project_roundtrip() {
        let camera = sample_camera();
        let point = Vector3::new(0.4, -0.2, 3.0);

        let pixel = camera.project(&point).unwrap();
        let back = camera.back_project(pixel.x, pixel.y, point.z);

        assert_relative_eq!(back, point, epsilon = 1e-12);
    }

    #[test]
    fn test_project_behind_camera() {
        let camera = sample_camera();
        assert!(camera.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera.project(&Vector3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_disparity_depth_inverse() {
        let camera = sample_camera();
        let depth = camera.depth_from_disparity(10.0);

        assert_relative_eq!(depth, 5.0, epsilon = 1e-12);
        assert_relative_eq!(camera.disparity_from_depth(depth), 10.0, epsilon = 1e-12);
    }

    #[test]
    fn test_is_in_image() {
        let camera = sample_camera();
        assert!(camera.is_in_image(0.0, 0.0, 0.0));
        assert!(camera.is_in_image(639.5, 479.5, 0.0));
        assert!(!camera.is_in_image(640.0, 100.0, 0.0));
        assert!(camera.is_in_image(-5.0, 100.0, 10.0));
    }
}
