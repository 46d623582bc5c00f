//! Coplanar camera calibration.
//!
//! All calibration points must lie in the z = 0 world plane. The linear stage
//! solves for the first two rotation rows and the x/y translation up to the
//! scale `1/Ty`, recovers `|Ty|` in closed form, fixes its sign with the
//! observation farthest from the image center, completes the orthonormal
//! rotation via a cross product, and estimates `f` and `Tz` with a second
//! linear solve. A negative focal length means the wrong branch of the
//! two-fold rotation ambiguity was picked; the alternate solution is tried
//! once before giving up.
//!
//! The full optimization then walks the same staged pipeline as the original
//! Tsai implementation: after the basic `f`/`Tz`/`kappa1` refinement come two
//! five-parameter passes that add the image center (with distortion removed
//! late, then early - the latter assumes the distortion is already modelled
//! reasonably well), an eight-parameter pass over the whole pose, and a final
//! ten-parameter pass that frees the image center again.

use nalgebra::{DMatrix, DVector};

use crate::calibration::{
    run_stage, sign_differs, Calibration, CalibrationError, StageLog, Workspace, EPSILON,
};
use crate::camera::CameraError;
use crate::linalg::lstsq;
use crate::optim::ResidualProblem;

/// Three parameter (`f`, `Tz`, `kappa1`) coplanar calibration.
pub(crate) fn calibrate(ws: &mut Workspace) -> Result<Calibration, CalibrationError> {
    let mut log = StageLog::new();
    three_param(ws, &mut log)?;
    Ok(log.into_calibration(&ws.cp))
}

/// Full staged coplanar calibration.
pub(crate) fn calibrate_full(ws: &mut Workspace) -> Result<Calibration, CalibrationError> {
    let mut log = StageLog::new();
    three_param(ws, &mut log)?;
    five_param_late_distortion(ws, &mut log)?;
    five_param_early_distortion(ws, &mut log)?;
    pose_optimization(ws, &mut log)?;
    full_optimization(ws, &mut log)?;
    Ok(log.into_calibration(&ws.cp))
}

fn three_param(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    for (index, p) in ws.points.iter().enumerate() {
        if p.zw != 0.0 {
            return Err(CalibrationError::DataNotCoplanar { index, zw: p.zw });
        }
    }

    ws.compute_distorted_sensor_coords();
    let u = compute_u(ws)?;
    compute_tx_ty(ws, &u);
    compute_r(ws, &u);
    let (f, tz) = resolve_handedness(ws)?;
    ws.cp.f = f;
    ws.cp.tz = tz;
    // the linear estimate was made under the assumption of zero distortion
    ws.cp.kappa1 = 0.0;

    let initial = DVector::from_vec(vec![ws.cp.f, ws.cp.tz, ws.cp.kappa1]);
    let params = run_stage(
        &mut ExactFTz { ws },
        initial,
        "coplanar f/Tz/kappa1 refinement",
        log,
    )?;
    ws.cp.f = params[0];
    ws.cp.tz = params[1];
    ws.cp.kappa1 = params[2];
    Ok(())
}

/// Solves the five-unknown linear system relating the scaled rotation rows
/// and x/y translation to the observed sensor coordinates.
fn compute_u(ws: &Workspace) -> Result<[f64; 5], CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(n, 5);
    let mut b = DVector::zeros(n);
    for (i, p) in ws.points.iter().enumerate() {
        m[(i, 0)] = ws.yd[i] * p.xw;
        m[(i, 1)] = ws.yd[i] * p.yw;
        m[(i, 2)] = ws.yd[i];
        m[(i, 3)] = -ws.xd[i] * p.xw;
        m[(i, 4)] = -ws.xd[i] * p.yw;
        b[i] = ws.xd[i];
    }
    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "coplanar U solve",
        source,
    })?;
    Ok([a[0], a[1], a[2], a[3], a[4]])
}

fn compute_tx_ty(ws: &mut Workspace, u: &[f64; 5]) {
    let r1p = u[0];
    let r2p = u[1];
    let r4p = u[3];
    let r5p = u[4];

    // |Ty|^2, with special cases for rows that vanished in the solve
    let ty_squared = if r1p.abs() < EPSILON && r2p.abs() < EPSILON {
        1.0 / (r4p * r4p + r5p * r5p)
    } else if r4p.abs() < EPSILON && r5p.abs() < EPSILON {
        1.0 / (r1p * r1p + r2p * r2p)
    } else if r1p.abs() < EPSILON && r4p.abs() < EPSILON {
        1.0 / (r2p * r2p + r5p * r5p)
    } else if r2p.abs() < EPSILON && r5p.abs() < EPSILON {
        1.0 / (r1p * r1p + r4p * r4p)
    } else {
        let sr = r1p * r1p + r2p * r2p + r4p * r4p + r5p * r5p;
        let det = r1p * r5p - r4p * r2p;
        (sr - (sr * sr - 4.0 * det * det).sqrt()) / (2.0 * det * det)
    };

    let far = ws.far_point();
    let p = ws.points[far];

    // assume Ty > 0, then check the assumption against the far point
    let ty = ty_squared.sqrt();
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    let tx = u[2] * ty;
    let r4 = u[3] * ty;
    let r5 = u[4] * ty;
    let x = r1 * p.xw + r2 * p.yw + tx;
    let y = r4 * p.xw + r5 * p.yw + ty;

    let ty = if sign_differs(x, ws.xd[far]) || sign_differs(y, ws.yd[far]) {
        -ty
    } else {
        ty
    };

    ws.cp.tx = u[2] * ty;
    ws.cp.ty = ty;
}

fn compute_r(ws: &mut Workspace, u: &[f64; 5]) {
    let ty = ws.cp.ty;
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    // radicands clamped against rounding noise
    let r3 = (1.0 - r1 * r1 - r2 * r2).max(0.0).sqrt();

    let r4 = u[3] * ty;
    let r5 = u[4] * ty;
    let mut r6 = (1.0 - r4 * r4 - r5 * r5).max(0.0).sqrt();
    if r1 * r4 + r2 * r5 > 0.0 {
        r6 = -r6;
    }

    // outer product of the first two rows gives the last row
    ws.cp.r1 = r1;
    ws.cp.r2 = r2;
    ws.cp.r3 = r3;
    ws.cp.r4 = r4;
    ws.cp.r5 = r5;
    ws.cp.r6 = r6;
    ws.cp.r7 = r2 * r6 - r3 * r5;
    ws.cp.r8 = r3 * r4 - r1 * r6;
    ws.cp.r9 = r1 * r5 - r2 * r4;
    ws.cp.update_euler_angles();
}

/// Linear estimate of `f` and `Tz` from the current rotation and x/y
/// translation, assuming zero distortion.
fn approximate_f_tz(ws: &Workspace) -> Result<(f64, f64), CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(n, 2);
    let mut b = DVector::zeros(n);
    let cp = &ws.cp;
    for (i, p) in ws.points.iter().enumerate() {
        m[(i, 0)] = cp.r4 * p.xw + cp.r5 * p.yw + cp.ty;
        m[(i, 1)] = -ws.yd[i];
        b[i] = (cp.r7 * p.xw + cp.r8 * p.yw) * ws.yd[i];
    }
    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "coplanar approximate f/Tz solve",
        source,
    })?;
    Ok((a[0], a[1]))
}

/// Picks the rotation solution that yields a positive focal length.
///
/// Returns the approximate `(f, Tz)` for the surviving solution.
fn resolve_handedness(ws: &mut Workspace) -> Result<(f64, f64), CalibrationError> {
    let (f, tz) = approximate_f_tz(ws)?;
    if f >= 0.0 {
        return Ok((f, tz));
    }

    // try the other solution for the orthonormal matrix
    ws.flip_rotation_solution();
    let (f, tz) = approximate_f_tz(ws)?;
    if f < 0.0 {
        return Err(CalibrationError::HandednessProblem);
    }
    Ok((f, tz))
}

/// Re-runs the linear pipeline for the current image center, without
/// distortion removal.
fn rebuild_from_center(ws: &mut Workspace) -> Result<(), CalibrationError> {
    ws.compute_distorted_sensor_coords();
    let u = compute_u(ws)?;
    compute_tx_ty(ws, &u);
    compute_r(ws, &u);
    resolve_handedness(ws)?;
    Ok(())
}

/// Re-runs the linear pipeline for the current image center with the sensor
/// coordinates undistorted under the current `kappa1` first.
fn rebuild_from_center_undistorted(ws: &mut Workspace) -> Result<(), CalibrationError> {
    ws.compute_distorted_sensor_coords();
    ws.remove_sensor_plane_distortion();
    let u = compute_u(ws)?;
    compute_tx_ty(ws, &u);
    compute_r(ws, &u);
    resolve_handedness(ws)?;
    Ok(())
}

fn five_param_late_distortion(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    let initial = DVector::from_vec(vec![
        ws.cp.f,
        ws.cp.tz,
        ws.cp.kappa1,
        ws.cp.cx,
        ws.cp.cy,
    ]);
    let params = run_stage(
        &mut FiveParamLate { ws: &mut *ws },
        initial,
        "coplanar five parameter refinement (late distortion removal)",
        log,
    )?;
    ws.cp.f = params[0];
    ws.cp.tz = params[1];
    ws.cp.kappa1 = params[2];
    ws.cp.cx = params[3];
    ws.cp.cy = params[4];
    // leave the pose consistent with the refined image center
    rebuild_from_center(ws)
}

fn five_param_early_distortion(
    ws: &mut Workspace,
    log: &mut StageLog,
) -> Result<(), CalibrationError> {
    let initial = DVector::from_vec(vec![
        ws.cp.f,
        ws.cp.tz,
        ws.cp.kappa1,
        ws.cp.cx,
        ws.cp.cy,
    ]);
    let params = run_stage(
        &mut FiveParamEarly { ws: &mut *ws },
        initial,
        "coplanar five parameter refinement (early distortion removal)",
        log,
    )?;
    ws.cp.f = params[0];
    ws.cp.tz = params[1];
    ws.cp.kappa1 = params[2];
    ws.cp.cx = params[3];
    ws.cp.cy = params[4];
    rebuild_from_center_undistorted(ws)
}

fn pose_optimization(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    let initial = DVector::from_vec(vec![
        ws.cp.rot_x,
        ws.cp.rot_y,
        ws.cp.rot_z,
        ws.cp.tx,
        ws.cp.ty,
        ws.cp.tz,
        ws.cp.kappa1,
        ws.cp.f,
    ]);
    let params = run_stage(
        &mut PoseOptimization { ws },
        initial,
        "coplanar pose refinement",
        log,
    )?;
    ws.cp.rot_x = params[0];
    ws.cp.rot_y = params[1];
    ws.cp.rot_z = params[2];
    ws.cp.update_rotation_matrix();
    ws.cp.tx = params[3];
    ws.cp.ty = params[4];
    ws.cp.tz = params[5];
    ws.cp.kappa1 = params[6];
    ws.cp.f = params[7];
    Ok(())
}

fn full_optimization(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    let initial = DVector::from_vec(vec![
        ws.cp.rot_x,
        ws.cp.rot_y,
        ws.cp.rot_z,
        ws.cp.tx,
        ws.cp.ty,
        ws.cp.tz,
        ws.cp.kappa1,
        ws.cp.f,
        ws.cp.cx,
        ws.cp.cy,
    ]);
    let params = run_stage(
        &mut FullOptimization { ws },
        initial,
        "coplanar full refinement",
        log,
    )?;
    ws.cp.rot_x = params[0];
    ws.cp.rot_y = params[1];
    ws.cp.rot_z = params[2];
    ws.cp.update_rotation_matrix();
    ws.cp.tx = params[3];
    ws.cp.ty = params[4];
    ws.cp.tz = params[5];
    ws.cp.kappa1 = params[6];
    ws.cp.f = params[7];
    ws.cp.cx = params[8];
    ws.cp.cy = params[9];
    Ok(())
}

fn degenerate(zc: f64) -> CalibrationError {
    CalibrationError::Camera(CameraError::DegenerateProjection { zc })
}

fn zc_floor() -> f64 {
    f64::EPSILON.sqrt()
}

/// Residuals for the `f`/`Tz`/`kappa1` refinement: distance between the
/// model projection and the undistorted observation, in sensor coordinates.
/// Rotation and x/y translation stay frozen at the linear estimate.
struct ExactFTz<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for ExactFTz<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(&mut self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), CalibrationError> {
        let f = params[0];
        let tz = params[1];
        let kappa1 = params[2];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            // zw is implicitly zero for coplanar data
            let xc = cp.r1 * p.xw + cp.r2 * p.yw + cp.tx;
            let yc = cp.r4 * p.xw + cp.r5 * p.yw + cp.ty;
            let zc = cp.r7 * p.xw + cp.r8 * p.yw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let distortion_factor = 1.0 + kappa1 * self.ws.r_squared[i];
            let xu_2 = self.ws.xd[i] * distortion_factor;
            let yu_2 = self.ws.yd[i] * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

/// Five parameter refinement with distortion removed only after the pose has
/// been re-estimated for the trial image center.
struct FiveParamLate<'a> {
    ws: &'a mut Workspace,
}

impl ResidualProblem for FiveParamLate<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(&mut self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), CalibrationError> {
        let f = params[0];
        let tz = params[1];
        let kappa1 = params[2];
        self.ws.cp.cx = params[3];
        self.ws.cp.cy = params[4];

        rebuild_from_center(self.ws)?;

        let ws = &*self.ws;
        let cp = &ws.cp;
        for (i, p) in ws.points.iter().enumerate() {
            let xc = cp.r1 * p.xw + cp.r2 * p.yw + cp.tx;
            let yc = cp.r4 * p.xw + cp.r5 * p.yw + cp.ty;
            let zc = cp.r7 * p.xw + cp.r8 * p.yw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let distortion_factor = 1.0 + kappa1 * ws.r_squared[i];
            let xu_2 = ws.xd[i] * distortion_factor;
            let yu_2 = ws.yd[i] * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

/// Five parameter refinement with distortion removed from the observations
/// before the pose is re-estimated. Assumes `kappa1` is already modelled
/// reasonably well.
struct FiveParamEarly<'a> {
    ws: &'a mut Workspace,
}

impl ResidualProblem for FiveParamEarly<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(&mut self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), CalibrationError> {
        let f = params[0];
        let tz = params[1];
        self.ws.cp.kappa1 = params[2];
        self.ws.cp.cx = params[3];
        self.ws.cp.cy = params[4];

        rebuild_from_center_undistorted(self.ws)?;

        let ws = &*self.ws;
        let cp = &ws.cp;
        for (i, p) in ws.points.iter().enumerate() {
            let xc = cp.r1 * p.xw + cp.r2 * p.yw + cp.tx;
            let yc = cp.r4 * p.xw + cp.r5 * p.yw + cp.ty;
            let zc = cp.r7 * p.xw + cp.r8 * p.yw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            // the observations were undistorted during the rebuild
            out[i] = (xu_1 - ws.xd[i]).hypot(yu_1 - ws.yd[i]);
        }
        Ok(())
    }
}

/// Eight parameter refinement over the pose, distortion and focal length,
/// with the image center frozen.
struct PoseOptimization<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for PoseOptimization<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(&mut self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), CalibrationError> {
        let (sa, ca) = params[0].sin_cos();
        let (sb, cb) = params[1].sin_cos();
        let (sg, cg) = params[2].sin_cos();
        let r1 = cb * cg;
        let r2 = cg * sa * sb - ca * sg;
        let r4 = cb * sg;
        let r5 = sa * sb * sg + ca * cg;
        let r7 = -sb;
        let r8 = cb * sa;

        let tx = params[3];
        let ty = params[4];
        let tz = params[5];
        let kappa1 = params[6];
        let f = params[7];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = r1 * p.xw + r2 * p.yw + tx;
            let yc = r4 * p.xw + r5 * p.yw + ty;
            let zc = r7 * p.xw + r8 * p.yw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let xd = cp.dpx * (p.xf - cp.cx) / cp.sx;
            let yd = cp.dpy * (p.yf - cp.cy);
            let distortion_factor = 1.0 + kappa1 * (xd * xd + yd * yd);
            let xu_2 = xd * distortion_factor;
            let yu_2 = yd * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

/// Ten parameter refinement: the pose, distortion, focal length and the
/// image center together.
struct FullOptimization<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for FullOptimization<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(&mut self, params: &DVector<f64>, out: &mut DVector<f64>) -> Result<(), CalibrationError> {
        let (sa, ca) = params[0].sin_cos();
        let (sb, cb) = params[1].sin_cos();
        let (sg, cg) = params[2].sin_cos();
        let r1 = cb * cg;
        let r2 = cg * sa * sb - ca * sg;
        let r4 = cb * sg;
        let r5 = sa * sb * sg + ca * cg;
        let r7 = -sb;
        let r8 = cb * sa;

        let tx = params[3];
        let ty = params[4];
        let tz = params[5];
        let kappa1 = params[6];
        let f = params[7];
        let cx = params[8];
        let cy = params[9];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = r1 * p.xw + r2 * p.yw + tx;
            let yc = r4 * p.xw + r5 * p.yw + ty;
            let zc = r7 * p.xw + r8 * p.yw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let xd = cp.dpx * (p.xf - cx) / cp.sx;
            let yd = cp.dpy * (p.yf - cy);
            let distortion_factor = 1.0 + kappa1 * (xd * xd + yd * yd);
            let xu_2 = xd * distortion_factor;
            let yu_2 = yd * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::calibration::test_support::{coplanar_grid, ground_truth_camera, project_points};
    use crate::calibration::{calibrate, CalibrationError, OptimizationType, TargetType};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    const DEG: f64 = std::f64::consts::PI / 180.0;

    #[test]
    fn test_synthetic_recovery_three_param() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            None,
        )
        .unwrap();
        let cp = &result.parameters;

        assert_relative_eq!(cp.f, truth.f, max_relative = 0.01);
        assert_relative_eq!(cp.tx, truth.tx, max_relative = 0.01);
        assert_relative_eq!(cp.ty, truth.ty, max_relative = 0.01);
        assert_relative_eq!(cp.tz, truth.tz, max_relative = 0.01);
        assert!((cp.kappa1).abs() < 1e-9);
    }

    #[test]
    fn test_synthetic_recovery_full() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::Full,
            &points,
            &initial,
            None,
        )
        .unwrap();
        let cp = &result.parameters;

        assert_relative_eq!(cp.f, truth.f, max_relative = 0.01);
        assert_relative_eq!(cp.tx, truth.tx, max_relative = 0.01);
        assert_relative_eq!(cp.ty, truth.ty, max_relative = 0.01);
        assert_relative_eq!(cp.tz, truth.tz, max_relative = 0.01);
        assert!((cp.rot_x - truth.rot_x).abs() < 0.1 * DEG);
        assert!((cp.rot_y - truth.rot_y).abs() < 0.1 * DEG);
        assert!((cp.rot_z - truth.rot_z).abs() < 0.1 * DEG);
    }

    #[test]
    fn test_rotation_is_orthonormal_after_calibration() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::Full,
            &points,
            &initial,
            None,
        )
        .unwrap();
        let r = result.parameters.rotation_matrix();

        assert_relative_eq!(
            (r.transpose() * r - Matrix3::identity()).norm(),
            0.0,
            epsilon = 1e-6
        );
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_recovery_with_distortion() {
        let mut truth = ground_truth_camera();
        truth.kappa1 = 5.0e-8;
        let points = project_points(&truth, &coplanar_grid(7, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::Full,
            &points,
            &initial,
            None,
        )
        .unwrap();
        let cp = &result.parameters;

        assert_relative_eq!(cp.f, truth.f, max_relative = 0.01);
        assert_relative_eq!(cp.tz, truth.tz, max_relative = 0.01);
        assert_relative_eq!(cp.kappa1, truth.kappa1, max_relative = 0.05);
    }

    #[test]
    fn test_sign_ambiguity_resolution() {
        let truth = ground_truth_camera();
        let world = coplanar_grid(5, 150.0);
        let points = project_points(&truth, &world);
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            None,
        )
        .unwrap();

        let in_front = world
            .iter()
            .filter(|pw| result.parameters.world_to_camera(pw).z > 0.0)
            .count();
        assert!(in_front as f64 >= 0.9 * world.len() as f64);
    }

    #[test]
    fn test_nonzero_z_is_rejected() {
        let truth = ground_truth_camera();
        let mut world = coplanar_grid(5, 150.0);
        world[7].z = 25.0;
        let points = project_points(&truth, &world);
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            None,
        );
        assert!(matches!(
            result,
            Err(CalibrationError::DataNotCoplanar { index: 7, .. })
        ));
    }

    #[test]
    fn test_origin_offset_shifts_translation() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);
        let offset = nalgebra::Vector3::new(40.0, -25.0, 0.0);

        let plain = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            None,
        )
        .unwrap();
        let shifted = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            Some(offset),
        )
        .unwrap();

        // the offset moves the world origin, so the recovered camera position
        // moves by R * offset in camera coordinates; the rotation is unchanged
        assert_relative_eq!(shifted.parameters.r1, plain.parameters.r1, epsilon = 1e-6);
        assert_relative_eq!(shifted.parameters.r9, plain.parameters.r9, epsilon = 1e-6);
        let r = plain.parameters.rotation_matrix();
        let delta = r * offset;
        assert_relative_eq!(
            shifted.parameters.tx,
            plain.parameters.tx - delta.x,
            max_relative = 1e-3
        );
        assert_relative_eq!(
            shifted.parameters.ty,
            plain.parameters.ty - delta.y,
            max_relative = 1e-3
        );
    }
}
