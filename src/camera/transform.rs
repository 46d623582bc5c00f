//! Coordinate transforms for the Tsai camera model.
//!
//! The pipeline runs world -> camera -> undistorted sensor -> distorted
//! sensor -> image, with an inverse for every step:
//!
//! - world/camera: rigid transform `xc = R * xw + T`
//! - camera/sensor: perspective projection `Xu = f * xc / zc`
//! - sensor distortion: first order radial model `Xu = Xd * (1 + kappa1 * Rd^2)`
//! - sensor/image: pixel scaling about the image center
//!
//! Sensor coordinates are in millimetres on the sensor plane, image
//! coordinates in frame grabber pixels. The undistorted-to-distorted
//! direction inverts the cubic `Ru = Rd * (1 + kappa1 * Rd^2)` algebraically
//! by the Cardan method; for `kappa1 < 0` the distorted plane only extends to
//! the maximum barrel distortion radius `sqrt(-1/(3 * kappa1))`, and points
//! beyond it are reported as [`CameraError::DistortionInversionFailed`].

use nalgebra::{Vector2, Vector3};

use crate::camera::{CameraError, CameraParameters};

const SQRT3: f64 = 1.732_050_807_568_877_2;

/// Projection is considered degenerate when `zc` falls below this threshold.
fn zc_floor() -> f64 {
    f64::EPSILON.sqrt()
}

impl CameraParameters {
    /// Transforms a point from world coordinates to camera coordinates.
    pub fn world_to_camera(&self, pw: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(
            self.r1 * pw.x + self.r2 * pw.y + self.r3 * pw.z + self.tx,
            self.r4 * pw.x + self.r5 * pw.y + self.r6 * pw.z + self.ty,
            self.r7 * pw.x + self.r8 * pw.y + self.r9 * pw.z + self.tz,
        )
    }

    /// Transforms a point from camera coordinates back to world coordinates.
    ///
    /// # Errors
    ///
    /// [`CameraError::SingularRotation`] if `r1..r9` is not invertible.
    pub fn camera_to_world(&self, pc: &Vector3<f64>) -> Result<Vector3<f64>, CameraError> {
        let r_inv = self
            .rotation_matrix()
            .try_inverse()
            .ok_or(CameraError::SingularRotation)?;
        let t = Vector3::new(self.tx, self.ty, self.tz);
        Ok(r_inv * (pc - t))
    }

    /// Projects camera coordinates onto the undistorted sensor plane.
    ///
    /// # Errors
    ///
    /// [`CameraError::DegenerateProjection`] when the point is at or behind
    /// the camera's focal plane (`zc <= 0`, including a small positive guard
    /// band against division blowup). The condition is reported, never
    /// silently sign-flipped.
    pub fn camera_to_sensor(&self, pc: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        if pc.z < zc_floor() {
            return Err(CameraError::DegenerateProjection { zc: pc.z });
        }
        Ok(Vector2::new(self.f * pc.x / pc.z, self.f * pc.y / pc.z))
    }

    /// Removes radial distortion from distorted sensor coordinates.
    pub fn distorted_to_undistorted_sensor(&self, pd: &Vector2<f64>) -> Vector2<f64> {
        let distortion_factor = 1.0 + self.kappa1 * (pd.x * pd.x + pd.y * pd.y);
        Vector2::new(pd.x * distortion_factor, pd.y * distortion_factor)
    }

    /// Adds radial distortion to undistorted sensor coordinates.
    ///
    /// Solves the cubic `Ru = Rd * (1 + kappa1 * Rd^2)` for `Rd` with the
    /// Cardan method. To follow the case analysis, graph the polynomial for
    /// positive and negative `kappa1`.
    ///
    /// # Errors
    ///
    /// [`CameraError::DistortionInversionFailed`] when `kappa1 < 0` and the
    /// undistorted radius exceeds the maximum barrel distortion radius.
    pub fn undistorted_to_distorted_sensor(
        &self,
        pu: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraError> {
        if (pu.x == 0.0 && pu.y == 0.0) || self.kappa1 == 0.0 {
            return Ok(*pu);
        }

        let ru = pu.x.hypot(pu.y);

        let c = 1.0 / self.kappa1;
        let d = -c * ru;

        let q = c / 3.0;
        let r = -d / 2.0;
        let discriminant = q * q * q + r * r;

        let rd = if discriminant >= 0.0 {
            // one real root
            let sq = discriminant.sqrt();
            let s = (r + sq).cbrt();
            let t = (r - sq).cbrt();
            let rd = s + t;
            if rd < 0.0 {
                return Err(CameraError::DistortionInversionFailed {
                    xu: pu.x,
                    yu: pu.y,
                    max_radius: (-1.0 / (3.0 * self.kappa1)).sqrt(),
                });
            }
            rd
        } else {
            // three real roots; the smaller positive one is the physical
            // solution
            let sq = (-discriminant).sqrt();
            let s = r.hypot(sq).cbrt();
            let t = sq.atan2(r) / 3.0;
            let (sin_t, cos_t) = t.sin_cos();
            -s * cos_t + SQRT3 * s * sin_t
        };

        let lambda = rd / ru;
        Ok(Vector2::new(pu.x * lambda, pu.y * lambda))
    }

    /// Converts distorted sensor coordinates to image pixel coordinates.
    pub fn sensor_to_image(&self, pd: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            pd.x * self.sx / self.dpx + self.cx,
            pd.y / self.dpy + self.cy,
        )
    }

    /// Converts image pixel coordinates to distorted sensor coordinates.
    pub fn image_to_sensor(&self, pf: &Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            self.dpx * (pf.x - self.cx) / self.sx,
            self.dpy * (pf.y - self.cy),
        )
    }

    /// Removes radial distortion from image pixel coordinates.
    pub fn distorted_to_undistorted_image(&self, pf: &Vector2<f64>) -> Vector2<f64> {
        let pd = self.image_to_sensor(pf);
        let pu = self.distorted_to_undistorted_sensor(&pd);
        self.sensor_to_image(&pu)
    }

    /// Adds radial distortion to undistorted image pixel coordinates.
    pub fn undistorted_to_distorted_image(
        &self,
        pf: &Vector2<f64>,
    ) -> Result<Vector2<f64>, CameraError> {
        let pu = self.image_to_sensor(pf);
        let pd = self.undistorted_to_distorted_sensor(&pu)?;
        Ok(self.sensor_to_image(&pd))
    }

    /// Projects a world point through the full model to image coordinates.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nalgebra::Vector3;
    /// use tsai_tools::camera::CameraParameters;
    ///
    /// let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
    /// cp.f = 800.0;
    /// cp.update_rotation_matrix(); // identity rotation
    /// cp.tz = 1000.0;
    ///
    /// let pf = cp.world_to_image(&Vector3::new(100.0, 50.0, 0.0)).unwrap();
    /// assert!((pf.x - 400.0).abs() < 1e-9); // 320 + 800 * 100 / 1000
    /// assert!((pf.y - 280.0).abs() < 1e-9); // 240 + 800 *  50 / 1000
    /// ```
    pub fn world_to_image(&self, pw: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        let pc = self.world_to_camera(pw);
        let pu = self.camera_to_sensor(&pc)?;
        let pd = self.undistorted_to_distorted_sensor(&pu)?;
        Ok(self.sensor_to_image(&pd))
    }

    /// Inverse perspective projection of an image point.
    ///
    /// A single image point only constrains a ray, so the world z coordinate
    /// `zw` of the target plane must be supplied; the returned point lies on
    /// that plane. The closed form below comes from inverting the projection
    /// equations symbolically.
    ///
    /// # Errors
    ///
    /// [`CameraError::DegenerateBackProjection`] when the viewing ray is
    /// parallel to the requested plane.
    pub fn image_to_world(&self, pf: &Vector2<f64>, zw: f64) -> Result<Vector3<f64>, CameraError> {
        let pd = self.image_to_sensor(pf);
        let pu = self.distorted_to_undistorted_sensor(&pd);

        let common_denominator = (self.r1 * self.r8 - self.r2 * self.r7) * pu.y
            + (self.r5 * self.r7 - self.r4 * self.r8) * pu.x
            - self.f * self.r1 * self.r5
            + self.f * self.r2 * self.r4;
        if common_denominator.abs() < f64::EPSILON {
            return Err(CameraError::DegenerateBackProjection);
        }

        let xw = (((self.r2 * self.r9 - self.r3 * self.r8) * pu.y
            + (self.r6 * self.r8 - self.r5 * self.r9) * pu.x
            - self.f * self.r2 * self.r6
            + self.f * self.r3 * self.r5)
            * zw
            + (self.r2 * self.tz - self.r8 * self.tx) * pu.y
            + (self.r8 * self.ty - self.r5 * self.tz) * pu.x
            - self.f * self.r2 * self.ty
            + self.f * self.r5 * self.tx)
            / common_denominator;

        let yw = -(((self.r1 * self.r9 - self.r3 * self.r7) * pu.y
            + (self.r6 * self.r7 - self.r4 * self.r9) * pu.x
            - self.f * self.r1 * self.r6
            + self.f * self.r3 * self.r4)
            * zw
            + (self.r1 * self.tz - self.r7 * self.tx) * pu.y
            + (self.r7 * self.ty - self.r4 * self.tz) * pu.x
            - self.f * self.r1 * self.ty
            + self.f * self.r4 * self.tx)
            / common_denominator;

        Ok(Vector3::new(xw, yw, zw))
    }

    /// The camera's horizontal field of view angle in radians,
    /// `fovx = 2 * atan2(Ncx * dx, 2 * f)`.
    pub fn fovx(&self) -> f64 {
        2.0 * (self.ncx * self.dx).atan2(2.0 * self.f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// A tilted synthetic camera looking at the z = 0 world plane.
    fn tilted_camera() -> CameraParameters {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        cp.f = 800.0;
        cp.rot_x = -0.5;
        cp.rot_y = 0.15;
        cp.rot_z = 0.1;
        cp.update_rotation_matrix();
        cp.tx = 30.0;
        cp.ty = -40.0;
        cp.tz = 1200.0;
        cp
    }

    #[test]
    fn test_world_camera_round_trip() {
        let cp = tilted_camera();
        let pw = Vector3::new(17.0, -80.0, 42.0);
        let pc = cp.world_to_camera(&pw);
        let back = cp.camera_to_world(&pc).unwrap();
        assert_relative_eq!(back.x, pw.x, epsilon = 1e-9);
        assert_relative_eq!(back.y, pw.y, epsilon = 1e-9);
        assert_relative_eq!(back.z, pw.z, epsilon = 1e-9);
    }

    #[test]
    fn test_world_image_round_trip_without_distortion() {
        let cp = tilted_camera();
        for &(x, y) in &[(0.0, 0.0), (100.0, -60.0), (-150.0, 130.0), (80.0, 75.0)] {
            let pw = Vector3::new(x, y, 0.0);
            let pf = cp.world_to_image(&pw).unwrap();
            let back = cp.image_to_world(&pf, 0.0).unwrap();
            assert_relative_eq!(back.x, pw.x, epsilon = 1e-6);
            assert_relative_eq!(back.y, pw.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_world_image_round_trip_with_distortion() {
        let mut cp = tilted_camera();
        cp.kappa1 = 2.0e-6;
        let pw = Vector3::new(120.0, -90.0, 0.0);
        let pf = cp.world_to_image(&pw).unwrap();
        let back = cp.image_to_world(&pf, 0.0).unwrap();
        assert_relative_eq!(back.x, pw.x, epsilon = 1e-6);
        assert_relative_eq!(back.y, pw.y, epsilon = 1e-6);
    }

    #[test]
    fn test_distortion_round_trip() {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        for &kappa1 in &[-0.01, -1e-4, -1e-6, 0.0, 1e-6, 1e-4, 0.01] {
            cp.kappa1 = kappa1;
            let pu = Vector2::new(1.7, -2.3);
            let pd = cp.undistorted_to_distorted_sensor(&pu).unwrap();
            let back = cp.distorted_to_undistorted_sensor(&pd);
            assert_relative_eq!(back.x, pu.x, epsilon = 1e-6);
            assert_relative_eq!(back.y, pu.y, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_distortion_beyond_barrel_radius_fails() {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        cp.kappa1 = -0.01;
        // maximum barrel radius is sqrt(1/0.03) ~ 5.77; the undistorted image
        // of that circle has radius ~ 2/3 * 5.77 ~ 3.85
        let result = cp.undistorted_to_distorted_sensor(&Vector2::new(30.0, 0.0));
        assert!(matches!(
            result,
            Err(CameraError::DistortionInversionFailed { .. })
        ));
    }

    #[test]
    fn test_degenerate_projection() {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        cp.f = 800.0;
        cp.update_rotation_matrix();
        let result = cp.camera_to_sensor(&Vector3::new(1.0, 1.0, -5.0));
        assert!(matches!(
            result,
            Err(CameraError::DegenerateProjection { .. })
        ));
        assert!(cp.camera_to_sensor(&Vector3::new(1.0, 1.0, 0.0)).is_err());
    }

    #[test]
    fn test_sensor_image_round_trip() {
        let cp = CameraParameters::from_model(crate::camera::KnownCamera::SonyXc75Matrox);
        let pd = Vector2::new(0.91, -1.13);
        let pf = cp.sensor_to_image(&pd);
        let back = cp.image_to_sensor(&pf);
        assert_relative_eq!(back.x, pd.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, pd.y, epsilon = 1e-12);
    }

    #[test]
    fn test_fovx() {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        cp.f = 320.0;
        // Ncx * dx = 640, 2f = 640 -> fovx = 2 * atan(1) = pi/2
        assert_relative_eq!(cp.fovx(), std::f64::consts::FRAC_PI_2, epsilon = 1e-12);
    }
}
