//! Accuracy measures for a finished calibration.
//!
//! All measures run over a correspondence set (usually the calibration data
//! itself, or a held-out set):
//!
//! - [`distorted_image_plane_error`]: pixel distance between each observed
//!   image point and the model projection of its world point.
//! - [`undistorted_image_plane_error`]: the same distance measured in
//!   undistorted image coordinates, which is the quantity the nonlinear
//!   refinement actually minimizes.
//! - [`object_space_error`]: distance of closest approach between the world
//!   point and the line of sight obtained by back-projecting the observed
//!   image point.
//! - [`normalized_calibration_error`]: the dimensionless error measure of
//!   Weng, Cohen and Herniou (IEEE PAMI, October 1992), which normalizes the
//!   back-projection error by the pixel footprint at the point's depth.

use serde::Serialize;

use crate::calibration::Correspondence;
use crate::camera::{CameraError, CameraParameters};

/// Magnitude statistics of an error measure over a data set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ErrorStats {
    pub mean: f64,
    pub stddev: f64,
    pub max: f64,
    /// Sum of squared errors.
    pub sse: f64,
}

/// Running accumulator for error magnitudes.
struct Accumulator {
    sum: f64,
    sum_squared: f64,
    max: f64,
    count: usize,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            sum: 0.0,
            sum_squared: 0.0,
            max: 0.0,
            count: 0,
        }
    }

    fn add_squared(&mut self, squared_error: f64) {
        let error = squared_error.sqrt();
        self.sum += error;
        self.sum_squared += squared_error;
        self.max = self.max.max(error);
        self.count += 1;
    }

    fn finish(self) -> ErrorStats {
        if self.count == 0 {
            return ErrorStats {
                mean: 0.0,
                stddev: 0.0,
                max: 0.0,
                sse: 0.0,
            };
        }
        let n = self.count as f64;
        let stddev = if self.count == 1 {
            0.0
        } else {
            ((self.sum_squared - self.sum * self.sum / n) / (n - 1.0))
                .max(0.0)
                .sqrt()
        };
        ErrorStats {
            mean: self.sum / n,
            stddev,
            max: self.max,
            sse: self.sum_squared,
        }
    }
}

/// Error between each observed image point and the projection of its world
/// point, in distorted (i.e. as-measured) image coordinates [pix].
pub fn distorted_image_plane_error(
    cp: &CameraParameters,
    points: &[Correspondence],
) -> Result<ErrorStats, CameraError> {
    let mut acc = Accumulator::new();
    for p in points {
        let pf = cp.world_to_image(&p.world())?;
        let dx = pf.x - p.xf;
        let dy = pf.y - p.yf;
        acc.add_squared(dx * dx + dy * dy);
    }
    Ok(acc.finish())
}

/// Error between each observed image point and the projection of its world
/// point, in undistorted image coordinates [pix].
pub fn undistorted_image_plane_error(
    cp: &CameraParameters,
    points: &[Correspondence],
) -> Result<ErrorStats, CameraError> {
    let mut acc = Accumulator::new();
    for p in points {
        let pc = cp.world_to_camera(&p.world());
        let pu_model = cp.camera_to_sensor(&pc)?;

        let pd = cp.image_to_sensor(&p.image());
        let pu_observed = cp.distorted_to_undistorted_sensor(&pd);

        let x_pixel_error = cp.sx * (pu_model.x - pu_observed.x) / cp.dpx;
        let y_pixel_error = (pu_model.y - pu_observed.y) / cp.dpy;
        acc.add_squared(x_pixel_error * x_pixel_error + y_pixel_error * y_pixel_error);
    }
    Ok(acc.finish())
}

/// Distance of closest approach [mm] between each world point and the line
/// of sight back-projected through the observed image point.
pub fn object_space_error(cp: &CameraParameters, points: &[Correspondence]) -> ErrorStats {
    let mut acc = Accumulator::new();
    for p in points {
        let pc = cp.world_to_camera(&p.world());

        let pd = cp.image_to_sensor(&p.image());
        let pu = cp.distorted_to_undistorted_sensor(&pd);

        let t = (pc.x * pu.x + pc.y * pu.y + pc.z * cp.f)
            / (pu.x * pu.x + pu.y * pu.y + cp.f * cp.f);
        let dx = pc.x - pu.x * t;
        let dy = pc.y - pu.y * t;
        let dz = pc.z - cp.f * t;
        acc.add_squared(dx * dx + dy * dy + dz * dz);
    }
    acc.finish()
}

/// Normalized calibration error of Weng, Cohen and Herniou: mean and
/// standard deviation of the back-projection error normalized by the pixel
/// footprint at each point's depth. Values near 1 mean the calibration is as
/// good as the pixel quantization allows.
pub fn normalized_calibration_error(
    cp: &CameraParameters,
    points: &[Correspondence],
) -> Result<(f64, f64), CameraError> {
    if cp.f == 0.0 {
        return Err(CameraError::InvalidParams(
            "normalized calibration error requires a calibrated focal length".to_string(),
        ));
    }

    let mut acc = Accumulator::new();
    for p in points {
        let pc = cp.world_to_camera(&p.world());

        let pd = cp.image_to_sensor(&p.image());
        let pu = cp.distorted_to_undistorted_sensor(&pd);

        // back project the observed image position onto the point's depth
        let zc_est = pc.z;
        let xc_est = zc_est * pu.x / cp.f;
        let yc_est = zc_est * pu.y / cp.f;

        let fu = cp.sx * cp.f / cp.dpx;
        let fv = cp.f / cp.dpy;

        let dx = xc_est - pc.x;
        let dy = yc_est - pc.y;
        let squared_error = (dx * dx + dy * dy)
            / (zc_est * zc_est * (1.0 / (fu * fu) + 1.0 / (fv * fv)) / 12.0);
        acc.add_squared(squared_error);
    }

    let stats = acc.finish();
    Ok((stats.mean, stats.stddev))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::test_support::{coplanar_grid, ground_truth_camera, project_points};

    #[test]
    fn test_stats_vanish_on_perfect_data() {
        let cp = ground_truth_camera();
        let points = project_points(&cp, &coplanar_grid(5, 150.0));

        let distorted = distorted_image_plane_error(&cp, &points).unwrap();
        assert!(distorted.mean < 1e-9);
        assert!(distorted.max < 1e-9);

        let undistorted = undistorted_image_plane_error(&cp, &points).unwrap();
        assert!(undistorted.mean < 1e-9);

        let object = object_space_error(&cp, &points);
        assert!(object.mean < 1e-9);

        let (nce_mean, nce_stddev) = normalized_calibration_error(&cp, &points).unwrap();
        assert!(nce_mean < 1e-6);
        assert!(nce_stddev < 1e-6);
    }

    #[test]
    fn test_image_noise_shows_up_in_the_stats() {
        let cp = ground_truth_camera();
        let mut points = project_points(&cp, &coplanar_grid(5, 150.0));
        for (i, p) in points.iter_mut().enumerate() {
            // deterministic +/- half pixel perturbation
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            p.xf += 0.5 * sign;
            p.yf -= 0.5 * sign;
        }

        let distorted = distorted_image_plane_error(&cp, &points).unwrap();
        let expected = 0.5 * std::f64::consts::SQRT_2;
        assert!((distorted.mean - expected).abs() < 1e-9);
        assert!(distorted.max <= expected + 1e-9);
        assert!(distorted.sse > 0.0);

        let object = object_space_error(&cp, &points);
        assert!(object.mean > 0.0);
    }

    #[test]
    fn test_empty_data_yields_zero_stats() {
        let cp = ground_truth_camera();
        let stats = distorted_image_plane_error(&cp, &[]).unwrap();
        assert_eq!(stats.mean, 0.0);
        assert_eq!(stats.sse, 0.0);
    }
}
