//! Non-coplanar camera calibration.
//!
//! The calibration points must span 3D space. Compared to the coplanar case
//! the linear stage solves for seven unknowns, which additionally pins down
//! the horizontal scale factor `sx` from the norm of the first rotation row.
//! The estimated rotation is re-orthonormalized through its roll/pitch/yaw
//! angles before the focal length solve.
//!
//! Feeding coplanar data into these routines leaves the seven-unknown system
//! rank deficient; this surfaces as a singular linear solve rather than
//! being detected up front.

use nalgebra::{DMatrix, DVector};

use crate::calibration::{
    run_stage, sign_differs, Calibration, CalibrationError, StageLog, Workspace,
};
use crate::camera::CameraError;
use crate::linalg::lstsq;
use crate::optim::ResidualProblem;

/// Three parameter (`f`, `Tz`, `kappa1`) non-coplanar calibration.
pub(crate) fn calibrate(ws: &mut Workspace) -> Result<Calibration, CalibrationError> {
    let mut log = StageLog::new();
    three_param(ws, &mut log)?;
    Ok(log.into_calibration(&ws.cp))
}

/// Full staged non-coplanar calibration.
pub(crate) fn calibrate_full(ws: &mut Workspace) -> Result<Calibration, CalibrationError> {
    let mut log = StageLog::new();
    three_param(ws, &mut log)?;
    pose_optimization(ws, &mut log)?;
    full_optimization(ws, &mut log)?;
    Ok(log.into_calibration(&ws.cp))
}

fn three_param(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    ws.compute_distorted_sensor_coords();
    let u = compute_u(ws)?;
    compute_tx_ty(ws, &u);
    compute_sx(ws, &u);
    // the scale factor just changed, so the sensor coordinates move with it
    ws.compute_distorted_sensor_coords();
    compute_r(ws, &u);
    let (f, tz) = resolve_handedness(ws)?;
    ws.cp.f = f;
    ws.cp.tz = tz;
    ws.cp.kappa1 = 0.0;

    let initial = DVector::from_vec(vec![ws.cp.f, ws.cp.tz, ws.cp.kappa1]);
    let params = run_stage(
        &mut ExactFTz { ws },
        initial,
        "noncoplanar f/Tz/kappa1 refinement",
        log,
    )?;
    ws.cp.f = params[0];
    ws.cp.tz = params[1];
    ws.cp.kappa1 = params[2];
    Ok(())
}

/// Solves the seven-unknown linear system. Rank deficiency here usually
/// means the data is coplanar after all.
fn compute_u(ws: &Workspace) -> Result<[f64; 7], CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(n, 7);
    let mut b = DVector::zeros(n);
    for (i, p) in ws.points.iter().enumerate() {
        m[(i, 0)] = ws.yd[i] * p.xw;
        m[(i, 1)] = ws.yd[i] * p.yw;
        m[(i, 2)] = ws.yd[i] * p.zw;
        m[(i, 3)] = ws.yd[i];
        m[(i, 4)] = -ws.xd[i] * p.xw;
        m[(i, 5)] = -ws.xd[i] * p.yw;
        m[(i, 6)] = -ws.xd[i] * p.zw;
        b[i] = ws.xd[i];
    }
    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "noncoplanar U solve (is the data coplanar?)",
        source,
    })?;
    Ok([a[0], a[1], a[2], a[3], a[4], a[5], a[6]])
}

fn compute_tx_ty(ws: &mut Workspace, u: &[f64; 7]) {
    let ty_squared = 1.0 / (u[4] * u[4] + u[5] * u[5] + u[6] * u[6]);

    let far = ws.far_point();
    let p = ws.points[far];

    // assume Ty > 0, then check the assumption against the far point
    let ty = ty_squared.sqrt();
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    let r3 = u[2] * ty;
    let tx = u[3] * ty;
    let r4 = u[4] * ty;
    let r5 = u[5] * ty;
    let r6 = u[6] * ty;
    let x = r1 * p.xw + r2 * p.yw + r3 * p.zw + tx;
    let y = r4 * p.xw + r5 * p.yw + r6 * p.zw + ty;

    let ty = if sign_differs(x, ws.xd[far]) || sign_differs(y, ws.yd[far]) {
        -ty
    } else {
        ty
    };

    ws.cp.tx = u[3] * ty;
    ws.cp.ty = ty;
}

fn compute_sx(ws: &mut Workspace, u: &[f64; 7]) {
    ws.cp.sx = (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt() * ws.cp.ty.abs();
}

/// Builds the rotation estimate and re-orthonormalizes it through its
/// roll/pitch/yaw angles.
fn compute_r(ws: &mut Workspace, u: &[f64; 7]) {
    let ty = ws.cp.ty;
    let sx = ws.cp.sx;
    let r1 = u[0] * ty / sx;
    let r2 = u[1] * ty / sx;
    let r3 = u[2] * ty / sx;
    let r4 = u[4] * ty;
    let r5 = u[5] * ty;
    let r6 = u[6] * ty;
    // only the first element of the outer-product row is needed for the angles
    let r7 = r2 * r6 - r3 * r5;

    let rot_z = r4.atan2(r1);
    let (sg, cg) = rot_z.sin_cos();
    let rot_y = (-r7).atan2(r1 * cg + r4 * sg);
    let rot_x = (r3 * sg - r6 * cg).atan2(r5 * cg - r2 * sg);

    ws.cp.rot_x = rot_x;
    ws.cp.rot_y = rot_y;
    ws.cp.rot_z = rot_z;
    ws.cp.update_rotation_matrix();
}

/// Linear estimate of `f` and `Tz` from the current rotation and x/y
/// translation, assuming zero distortion.
fn approximate_f_tz(ws: &Workspace) -> Result<(f64, f64), CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(n, 2);
    let mut b = DVector::zeros(n);
    let cp = &ws.cp;
    for (i, p) in ws.points.iter().enumerate() {
        m[(i, 0)] = cp.r4 * p.xw + cp.r5 * p.yw + cp.r6 * p.zw + cp.ty;
        m[(i, 1)] = -ws.yd[i];
        b[i] = (cp.r7 * p.xw + cp.r8 * p.yw + cp.r9 * p.zw) * ws.yd[i];
    }
    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "noncoplanar approximate f/Tz solve",
        source,
    })?;
    Ok((a[0], a[1]))
}

/// Picks the rotation solution that yields a positive focal length.
fn resolve_handedness(ws: &mut Workspace) -> Result<(f64, f64), CalibrationError> {
    let (f, tz) = approximate_f_tz(ws)?;
    if f >= 0.0 {
        return Ok((f, tz));
    }

    ws.flip_rotation_solution();
    let (f, tz) = approximate_f_tz(ws)?;
    if f < 0.0 {
        return Err(CalibrationError::HandednessProblem);
    }
    Ok((f, tz))
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
        ws.cp.sx,
    ]);
    let params = run_stage(
        &mut PoseOptimization { ws },
        initial,
        "noncoplanar pose refinement",
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
    ws.cp.sx = params[8];
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
        ws.cp.sx,
        ws.cp.cx,
        ws.cp.cy,
    ]);
    let params = run_stage(
        &mut FullOptimization { ws },
        initial,
        "noncoplanar full refinement",
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
    ws.cp.sx = params[8];
    ws.cp.cx = params[9];
    ws.cp.cy = params[10];
    Ok(())
}

fn degenerate(zc: f64) -> CalibrationError {
    CalibrationError::Camera(CameraError::DegenerateProjection { zc })
}

fn zc_floor() -> f64 {
    f64::EPSILON.sqrt()
}

/// Residuals for the `f`/`Tz`/`kappa1` refinement with the pose frozen.
struct ExactFTz<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for ExactFTz<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(
        &mut self,
        params: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CalibrationError> {
        let f = params[0];
        let tz = params[1];
        let kappa1 = params[2];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = cp.r1 * p.xw + cp.r2 * p.yw + cp.r3 * p.zw + cp.tx;
            let yc = cp.r4 * p.xw + cp.r5 * p.yw + cp.r6 * p.zw + cp.ty;
            let zc = cp.r7 * p.xw + cp.r8 * p.yw + cp.r9 * p.zw + tz;
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

/// Nine parameter refinement over the pose, distortion, focal length and
/// scale factor, with the image center frozen.
struct PoseOptimization<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for PoseOptimization<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(
        &mut self,
        params: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CalibrationError> {
        let (sa, ca) = params[0].sin_cos();
        let (sb, cb) = params[1].sin_cos();
        let (sg, cg) = params[2].sin_cos();
        let r1 = cb * cg;
        let r2 = cg * sa * sb - ca * sg;
        let r3 = sa * sg + ca * cg * sb;
        let r4 = cb * sg;
        let r5 = sa * sb * sg + ca * cg;
        let r6 = ca * sb * sg - cg * sa;
        let r7 = -sb;
        let r8 = cb * sa;
        let r9 = ca * cb;

        let tx = params[3];
        let ty = params[4];
        let tz = params[5];
        let kappa1 = params[6];
        let f = params[7];
        let sx = params[8];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = r1 * p.xw + r2 * p.yw + r3 * p.zw + tx;
            let yc = r4 * p.xw + r5 * p.yw + r6 * p.zw + ty;
            let zc = r7 * p.xw + r8 * p.yw + r9 * p.zw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let xd = cp.dpx * (p.xf - cp.cx) / sx;
            let yd = cp.dpy * (p.yf - cp.cy);
            let distortion_factor = 1.0 + kappa1 * (xd * xd + yd * yd);
            let xu_2 = xd * distortion_factor;
            let yu_2 = yd * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

/// Eleven parameter refinement: everything, including the image center.
struct FullOptimization<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for FullOptimization<'_> {
    type Error = CalibrationError;

    fn residual_count(&self) -> usize {
        self.ws.points.len()
    }

    fn residuals(
        &mut self,
        params: &DVector<f64>,
        out: &mut DVector<f64>,
    ) -> Result<(), CalibrationError> {
        let (sa, ca) = params[0].sin_cos();
        let (sb, cb) = params[1].sin_cos();
        let (sg, cg) = params[2].sin_cos();
        let r1 = cb * cg;
        let r2 = cg * sa * sb - ca * sg;
        let r3 = sa * sg + ca * cg * sb;
        let r4 = cb * sg;
        let r5 = sa * sb * sg + ca * cg;
        let r6 = ca * sb * sg - cg * sa;
        let r7 = -sb;
        let r8 = cb * sa;
        let r9 = ca * cb;

        let tx = params[3];
        let ty = params[4];
        let tz = params[5];
        let kappa1 = params[6];
        let f = params[7];
        let sx = params[8];
        let cx = params[9];
        let cy = params[10];
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = r1 * p.xw + r2 * p.yw + r3 * p.zw + tx;
            let yc = r4 * p.xw + r5 * p.yw + r6 * p.zw + ty;
            let zc = r7 * p.xw + r8 * p.yw + r9 * p.zw + tz;
            if zc < zc_floor() {
                return Err(degenerate(zc));
            }

            let xu_1 = f * xc / zc;
            let yu_1 = f * yc / zc;

            let xd = cp.dpx * (p.xf - cx) / sx;
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
    use crate::calibration::test_support::{
        coplanar_grid, ground_truth_camera, noncoplanar_grid, project_points,
    };
    use crate::calibration::{calibrate, CalibrationError, OptimizationType, TargetType};
    use approx::assert_relative_eq;
    use nalgebra::Matrix3;

    const DEG: f64 = std::f64::consts::PI / 180.0;

    #[test]
    fn test_synthetic_recovery_three_param() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &noncoplanar_grid(5, 150.0, 200.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Noncoplanar,
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
        assert_relative_eq!(cp.sx, 1.0, max_relative = 0.01);
    }

    #[test]
    fn test_synthetic_recovery_full() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &noncoplanar_grid(5, 150.0, 200.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Noncoplanar,
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
        assert_relative_eq!(cp.sx, 1.0, max_relative = 0.01);
        assert!((cp.rot_x - truth.rot_x).abs() < 0.1 * DEG);
        assert!((cp.rot_y - truth.rot_y).abs() < 0.1 * DEG);
        assert!((cp.rot_z - truth.rot_z).abs() < 0.1 * DEG);

        let r = cp.rotation_matrix();
        assert_relative_eq!(
            (r.transpose() * r - Matrix3::identity()).norm(),
            0.0,
            epsilon = 1e-6
        );
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_coplanar_data_makes_linear_stage_singular() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(4, 150.0));
        let initial = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = calibrate(
            TargetType::Noncoplanar,
            OptimizationType::ThreeParam,
            &points,
            &initial,
            None,
        );
        assert!(matches!(
            result,
            Err(CalibrationError::LinearSolve { .. })
        ));
    }
}
