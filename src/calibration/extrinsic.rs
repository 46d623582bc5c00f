//! Extrinsic-only parameter estimation.
//!
//! When the intrinsic constants (`f`, `kappa1`, `sx` and the sensor
//! geometry) are already known, the camera pose can be recovered on its own:
//! the linear stage runs on undistorted sensor coordinates, a trial focal
//! length solve disambiguates the two rotation solutions for coplanar data,
//! a single linear system then pins down the full translation, and a final
//! six parameter Levenberg-Marquardt pass refines the pose.

use nalgebra::{DMatrix, DVector};

use crate::calibration::{
    run_stage, sign_differs, Calibration, CalibrationError, Correspondence, StageLog, TargetType,
    Workspace, EPSILON,
};
use crate::camera::{CameraError, CameraParameters};
use crate::linalg::lstsq;
use crate::optim::ResidualProblem;

/// Estimates the camera pose (`Tx, Ty, Tz`, `r1..r9`) for a camera whose
/// intrinsic constants are already calibrated.
///
/// `params` must carry the sensor geometry plus `f` (positive) and `kappa1`;
/// those fields are left untouched in the returned parameter set.
pub fn estimate_extrinsics(
    target_type: TargetType,
    points: &[Correspondence],
    params: &CameraParameters,
) -> Result<Calibration, CalibrationError> {
    params.validate_sensor_geometry()?;
    if params.f <= 0.0 {
        return Err(CalibrationError::Camera(CameraError::InvalidParams(
            "extrinsic estimation requires a calibrated focal length".to_string(),
        )));
    }

    let required = target_type.min_points();
    if points.len() < required {
        return Err(CalibrationError::InsufficientData {
            required,
            actual: points.len(),
        });
    }

    let mut ws = Workspace::new(params.clone(), points.to_vec());
    let mut log = StageLog::new();

    // the linear stages run on undistorted sensor coordinates
    ws.compute_distorted_sensor_coords();
    ws.remove_sensor_plane_distortion();

    match target_type {
        TargetType::Coplanar => {
            let u = compute_u_coplanar(&ws)?;
            compute_tx_ty_coplanar(&mut ws, &u);
            compute_r_coplanar(&mut ws, &u);
            resolve_handedness(&mut ws)?;
        }
        TargetType::Noncoplanar => {
            let u = compute_u_noncoplanar(&ws)?;
            compute_tx_ty_noncoplanar(&mut ws, &u);
            compute_r_noncoplanar(&mut ws, &u);
        }
    }

    compute_translation(&mut ws)?;
    refine_pose(&mut ws, &mut log)?;

    Ok(log.into_calibration(&ws.cp))
}

fn compute_u_coplanar(ws: &Workspace) -> Result<[f64; 5], CalibrationError> {
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
        stage: "coplanar extrinsic U solve",
        source,
    })?;
    Ok([a[0], a[1], a[2], a[3], a[4]])
}

fn compute_u_noncoplanar(ws: &Workspace) -> Result<[f64; 7], CalibrationError> {
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
        stage: "noncoplanar extrinsic U solve",
        source,
    })?;
    Ok([a[0], a[1], a[2], a[3], a[4], a[5], a[6]])
}

/// Index of the observation farthest from the image center, in pixels.
fn far_point_pixels(ws: &Workspace) -> usize {
    let mut far_point = 0;
    let mut far_distance = 0.0;
    for (i, p) in ws.points.iter().enumerate() {
        let dx = p.xf - ws.cp.cx;
        let dy = p.yf - ws.cp.cy;
        let distance = dx * dx + dy * dy;
        if distance > far_distance {
            far_point = i;
            far_distance = distance;
        }
    }
    far_point
}

fn compute_tx_ty_coplanar(ws: &mut Workspace, u: &[f64; 5]) {
    let r1p = u[0];
    let r2p = u[1];
    let r4p = u[3];
    let r5p = u[4];

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

    let far = far_point_pixels(ws);
    let p = ws.points[far];

    let ty = ty_squared.sqrt();
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    let tx = u[2] * ty;
    let r4 = u[3] * ty;
    let r5 = u[4] * ty;
    let x = r1 * p.xw + r2 * p.yw + tx;
    let y = r4 * p.xw + r5 * p.yw + ty;

    let ty = if sign_differs(x, p.xf - ws.cp.cx) || sign_differs(y, p.yf - ws.cp.cy) {
        -ty
    } else {
        ty
    };

    ws.cp.tx = u[2] * ty;
    ws.cp.ty = ty;
}

fn compute_tx_ty_noncoplanar(ws: &mut Workspace, u: &[f64; 7]) {
    let ty_squared = 1.0 / (u[4] * u[4] + u[5] * u[5] + u[6] * u[6]);

    let far = far_point_pixels(ws);
    let p = ws.points[far];

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

    let ty = if sign_differs(x, p.xf - ws.cp.cx) || sign_differs(y, p.yf - ws.cp.cy) {
        -ty
    } else {
        ty
    };

    ws.cp.tx = u[3] * ty;
    ws.cp.ty = ty;
}

fn compute_r_coplanar(ws: &mut Workspace, u: &[f64; 5]) {
    let ty = ws.cp.ty;
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    let r3 = (1.0 - r1 * r1 - r2 * r2).max(0.0).sqrt();

    let r4 = u[3] * ty;
    let r5 = u[4] * ty;
    let mut r6 = (1.0 - r4 * r4 - r5 * r5).max(0.0).sqrt();
    if r1 * r4 + r2 * r5 > 0.0 {
        r6 = -r6;
    }

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

fn compute_r_noncoplanar(ws: &mut Workspace, u: &[f64; 7]) {
    let ty = ws.cp.ty;
    let r1 = u[0] * ty;
    let r2 = u[1] * ty;
    let r3 = u[2] * ty;
    let r4 = u[4] * ty;
    let r5 = u[5] * ty;
    let r6 = u[6] * ty;

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

/// Trial focal length for the handedness check; only its sign matters.
fn approximate_f(ws: &Workspace) -> Result<f64, CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(n, 2);
    let mut b = DVector::zeros(n);
    let cp = &ws.cp;
    for (i, p) in ws.points.iter().enumerate() {
        let yd = cp.dpy * (p.yf - cp.cy);
        m[(i, 0)] = cp.r4 * p.xw + cp.r5 * p.yw + cp.ty;
        m[(i, 1)] = -yd;
        b[i] = (cp.r7 * p.xw + cp.r8 * p.yw) * yd;
    }
    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "extrinsic trial focal length solve",
        source,
    })?;
    Ok(a[0])
}

fn resolve_handedness(ws: &mut Workspace) -> Result<(), CalibrationError> {
    let trial_f = approximate_f(ws)?;
    if trial_f >= 0.0 {
        return Ok(());
    }

    // try the other rotation matrix solution
    ws.flip_rotation_solution();
    let trial_f = approximate_f(ws)?;
    if trial_f < 0.0 {
        return Err(CalibrationError::HandednessProblem);
    }
    Ok(())
}

/// Solves the stacked 2N x 3 linear system for the full translation, given
/// the rotation and the known focal length.
fn compute_translation(ws: &mut Workspace) -> Result<(), CalibrationError> {
    let n = ws.points.len();
    let mut m = DMatrix::zeros(2 * n, 3);
    let mut b = DVector::zeros(2 * n);
    let cp = &ws.cp;

    for (i, p) in ws.points.iter().enumerate() {
        // untranslated camera coordinates
        let xk = cp.r1 * p.xw + cp.r2 * p.yw + cp.r3 * p.zw;
        let yk = cp.r4 * p.xw + cp.r5 * p.yw + cp.r6 * p.zw;
        let zk = cp.r7 * p.xw + cp.r8 * p.yw + cp.r9 * p.zw;

        let xu = ws.xd[i];
        let yu = ws.yd[i];

        m[(i, 0)] = cp.f;
        m[(i, 2)] = -xu;
        b[i] = xu * zk - cp.f * xk;

        m[(n + i, 1)] = cp.f;
        m[(n + i, 2)] = -yu;
        b[n + i] = yu * zk - cp.f * yk;
    }

    let a = lstsq(&m, &b).map_err(|source| CalibrationError::LinearSolve {
        stage: "extrinsic translation solve",
        source,
    })?;
    ws.cp.tx = a[0];
    ws.cp.ty = a[1];
    ws.cp.tz = a[2];
    Ok(())
}

fn refine_pose(ws: &mut Workspace, log: &mut StageLog) -> Result<(), CalibrationError> {
    let initial = DVector::from_vec(vec![
        ws.cp.rot_x,
        ws.cp.rot_y,
        ws.cp.rot_z,
        ws.cp.tx,
        ws.cp.ty,
        ws.cp.tz,
    ]);
    let params = run_stage(
        &mut PoseRefinement { ws },
        initial,
        "extrinsic pose refinement",
        log,
    )?;
    ws.cp.rot_x = params[0];
    ws.cp.rot_y = params[1];
    ws.cp.rot_z = params[2];
    ws.cp.update_rotation_matrix();
    ws.cp.tx = params[3];
    ws.cp.ty = params[4];
    ws.cp.tz = params[5];
    Ok(())
}

/// Six parameter pose refinement with all intrinsics frozen.
struct PoseRefinement<'a> {
    ws: &'a Workspace,
}

impl ResidualProblem for PoseRefinement<'_> {
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
        let cp = &self.ws.cp;

        for (i, p) in self.ws.points.iter().enumerate() {
            let xc = r1 * p.xw + r2 * p.yw + r3 * p.zw + tx;
            let yc = r4 * p.xw + r5 * p.yw + r6 * p.zw + ty;
            let zc = r7 * p.xw + r8 * p.yw + r9 * p.zw + tz;
            if zc < f64::EPSILON.sqrt() {
                return Err(CalibrationError::Camera(CameraError::DegenerateProjection {
                    zc,
                }));
            }

            let xu_1 = cp.f * xc / zc;
            let yu_1 = cp.f * yc / zc;

            let xd = cp.dpx * (p.xf - cp.cx) / cp.sx;
            let yd = cp.dpy * (p.yf - cp.cy);
            let distortion_factor = 1.0 + cp.kappa1 * (xd * xd + yd * yd);
            let xu_2 = xd * distortion_factor;
            let yu_2 = yd * distortion_factor;

            out[i] = (xu_1 - xu_2).hypot(yu_1 - yu_2);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::estimate_extrinsics;
    use crate::calibration::test_support::{
        coplanar_grid, ground_truth_camera, noncoplanar_grid, project_points,
    };
    use crate::calibration::{CalibrationError, TargetType};
    use approx::assert_relative_eq;

    const DEG: f64 = std::f64::consts::PI / 180.0;

    /// The true intrinsics with the pose cleared out.
    fn intrinsics_only() -> crate::camera::CameraParameters {
        let truth = ground_truth_camera();
        let mut cp = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);
        cp.f = truth.f;
        cp.kappa1 = truth.kappa1;
        cp
    }

    #[test]
    fn test_coplanar_pose_recovery() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));

        let result = estimate_extrinsics(TargetType::Coplanar, &points, &intrinsics_only()).unwrap();
        let cp = &result.parameters;

        assert_relative_eq!(cp.tx, truth.tx, max_relative = 0.01);
        assert_relative_eq!(cp.ty, truth.ty, max_relative = 0.01);
        assert_relative_eq!(cp.tz, truth.tz, max_relative = 0.01);
        assert!((cp.rot_x - truth.rot_x).abs() < 0.1 * DEG);
        assert!((cp.rot_y - truth.rot_y).abs() < 0.1 * DEG);
        assert!((cp.rot_z - truth.rot_z).abs() < 0.1 * DEG);
        // the intrinsics are not touched
        assert_eq!(cp.f, truth.f);
        assert_eq!(cp.kappa1, truth.kappa1);
    }

    #[test]
    fn test_noncoplanar_pose_recovery() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &noncoplanar_grid(5, 150.0, 200.0));

        let result =
            estimate_extrinsics(TargetType::Noncoplanar, &points, &intrinsics_only()).unwrap();
        let cp = &result.parameters;

        assert_relative_eq!(cp.tx, truth.tx, max_relative = 0.01);
        assert_relative_eq!(cp.ty, truth.ty, max_relative = 0.01);
        assert_relative_eq!(cp.tz, truth.tz, max_relative = 0.01);
        assert!((cp.rot_x - truth.rot_x).abs() < 0.1 * DEG);
    }

    #[test]
    fn test_missing_focal_length_is_rejected() {
        let truth = ground_truth_camera();
        let points = project_points(&truth, &coplanar_grid(5, 150.0));
        let geometry = crate::camera::CameraParameters::from_image_dim(640.0, 480.0);

        let result = estimate_extrinsics(TargetType::Coplanar, &points, &geometry);
        assert!(matches!(result, Err(CalibrationError::Camera(_))));
    }
}
