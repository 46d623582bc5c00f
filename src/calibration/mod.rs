//! Camera calibration by the two-stage method of Tsai.
//!
//! Calibration recovers the camera constants from correspondences between
//! known 3D world points and their observed 2D image projections. Stage one
//! is a closed-form linear estimate of the rotation, the x/y translation and
//! the scale factor, exploiting that these are linearly related to the image
//! coordinates up to an unknown scale and sign (the classical Tsai
//! decomposition). Stage two refines the estimate with the crate's
//! Levenberg-Marquardt solver, minimizing the reprojection error in
//! undistorted sensor coordinates.
//!
//! Two target types are supported, each in a reduced and a full optimization
//! flavour:
//!
//! - [`TargetType::Coplanar`]: all calibration points lie in the z = 0 world
//!   plane. For numerical stability the points should be placed away from the
//!   world origin, and the target plane should not be parallel to the image
//!   plane (a relative angle of 30 degrees is recommended).
//! - [`TargetType::Noncoplanar`]: the points span 3D space. Feeding coplanar
//!   data into this mode is not detected up front; it surfaces as a singular
//!   linear system.
//!
//! [`OptimizationType::ThreeParam`] refines only `f`, `Tz` and `kappa1`;
//! [`OptimizationType::Full`] runs the staged full pipelines that additionally
//! refine the pose, the image center and (for non-coplanar targets) `sx`.
//!
//! Entry points: [`calibrate`] with typed modes, [`calibrate_named`] with the
//! conventional string names. Extrinsic-only estimation for cameras with
//! known intrinsics lives in [`extrinsic`], calibration quality measures in
//! [`eval`].

use log::{debug, warn};
use nalgebra::{DVector, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::camera::{CameraError, CameraParameters};
use crate::linalg::LinAlgError;
use crate::optim::{levenberg_marquardt, OptimError, Options, ResidualProblem};

mod coplanar;
pub mod eval;
pub mod extrinsic;
mod noncoplanar;

pub use extrinsic::estimate_extrinsics;

/// Tolerance factor for the near-zero special cases of the linear stage.
pub(crate) const EPSILON: f64 = 1.0e-8;

/// Geometry of the calibration target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetType {
    /// All calibration points lie in the z = 0 world plane.
    Coplanar,
    /// The calibration points span 3D space.
    Noncoplanar,
}

impl TargetType {
    /// Minimum number of correspondences the linear stage needs.
    pub fn min_points(&self) -> usize {
        match self {
            TargetType::Coplanar => 5,
            TargetType::Noncoplanar => 7,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TargetType::Coplanar => "coplanar",
            TargetType::Noncoplanar => "noncoplanar",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which parameters the nonlinear stage refines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationType {
    /// Refine only `f`, `Tz` and `kappa1`.
    ThreeParam,
    /// Staged refinement of the full parameter set.
    Full,
}

impl OptimizationType {
    pub fn name(&self) -> &'static str {
        match self {
            OptimizationType::ThreeParam => "three-param",
            OptimizationType::Full => "full",
        }
    }
}

impl fmt::Display for OptimizationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One calibration data point: a world coordinate [mm] and the observed
/// image coordinate [pix] of the same feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub xw: f64,
    pub yw: f64,
    pub zw: f64,
    pub xf: f64,
    pub yf: f64,
}

impl Correspondence {
    pub fn new(xw: f64, yw: f64, zw: f64, xf: f64, yf: f64) -> Self {
        Correspondence { xw, yw, zw, xf, yf }
    }

    /// The world coordinate of the feature point.
    pub fn world(&self) -> Vector3<f64> {
        Vector3::new(self.xw, self.yw, self.zw)
    }

    /// The observed image coordinate of the feature point.
    pub fn image(&self) -> Vector2<f64> {
        Vector2::new(self.xf, self.yf)
    }
}

/// A finished calibration: the populated parameter set plus how the
/// nonlinear refinement went.
///
/// Non-convergence is deliberately not an error: `parameters` then holds the
/// best estimate found and `converged` is false, leaving the accept/reject
/// decision to the caller.
#[derive(Debug, Clone)]
pub struct Calibration {
    pub parameters: CameraParameters,
    /// Whether every nonlinear stage met its convergence tolerances.
    pub converged: bool,
    /// Sum of squared residuals of the last refinement stage.
    pub final_cost: f64,
    /// Total accepted iterations across all refinement stages.
    pub iterations: usize,
}

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("at least {required} correspondences are required, got {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error(
        "unknown combination of target_type='{target_type}' and \
         optimization_type='{optimization_type}'"
    )]
    UnsupportedConfiguration {
        target_type: String,
        optimization_type: String,
    },
    #[error("coplanar calibration tried with data outside of the z plane (point {index} has zw = {zw})")]
    DataNotCoplanar { index: usize, zw: f64 },
    #[error("possible handedness problem with the calibration data")]
    HandednessProblem,
    #[error("linear solve failed during {stage}: {source}")]
    LinearSolve {
        stage: &'static str,
        source: LinAlgError,
    },
    #[error("nonlinear refinement broke down during {stage} at iteration {iteration}")]
    NumericalBreakdown {
        stage: &'static str,
        iteration: usize,
    },
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Calibrates a camera from 3D/2D correspondences.
///
/// `initial` must carry the fixed sensor geometry (`Ncx, Nfx, dx, dy, dpx,
/// dpy, Cx, Cy, sx`); the calibrated constants are overwritten. The input is
/// never mutated; a fresh parameter set is returned.
///
/// `origin_offset`, if given, is added to the world coordinate of every
/// correspondence before calibration. Shifting the origin helps when the
/// world origin lies near the camera origin or the camera y axis, where the
/// linear stage degenerates. The returned translation stays expressed in the
/// shifted frame; accounting for the offset is the caller's responsibility.
pub fn calibrate(
    target_type: TargetType,
    optimization_type: OptimizationType,
    points: &[Correspondence],
    initial: &CameraParameters,
    origin_offset: Option<Vector3<f64>>,
) -> Result<Calibration, CalibrationError> {
    initial.validate_sensor_geometry()?;

    let required = target_type.min_points();
    if points.len() < required {
        return Err(CalibrationError::InsufficientData {
            required,
            actual: points.len(),
        });
    }

    let mut shifted = points.to_vec();
    if let Some(offset) = origin_offset {
        for c in &mut shifted {
            c.xw += offset.x;
            c.yw += offset.y;
            c.zw += offset.z;
        }
    }

    let mut ws = Workspace::new(initial.clone(), shifted);
    // the reserved tangential terms are not part of this model
    ws.cp.p1 = 0.0;
    ws.cp.p2 = 0.0;

    let outcome = match (target_type, optimization_type) {
        (TargetType::Coplanar, OptimizationType::ThreeParam) => coplanar::calibrate(&mut ws),
        (TargetType::Coplanar, OptimizationType::Full) => coplanar::calibrate_full(&mut ws),
        (TargetType::Noncoplanar, OptimizationType::ThreeParam) => noncoplanar::calibrate(&mut ws),
        (TargetType::Noncoplanar, OptimizationType::Full) => noncoplanar::calibrate_full(&mut ws),
    }?;

    if !outcome.converged {
        warn!(
            "{} {} calibration did not meet convergence tolerances; \
             returning best parameters found (cost {:.6e})",
            target_type, optimization_type, outcome.final_cost
        );
    }

    Ok(outcome)
}

/// String-typed variant of [`calibrate`] using the conventional mode names
/// `coplanar`/`noncoplanar` and `three-param`/`full`.
///
/// Any unknown combination fails with
/// [`CalibrationError::UnsupportedConfiguration`] before touching the data.
pub fn calibrate_named(
    target_type: &str,
    optimization_type: &str,
    points: &[Correspondence],
    initial: &CameraParameters,
    origin_offset: Option<Vector3<f64>>,
) -> Result<Calibration, CalibrationError> {
    let target = match target_type {
        "coplanar" => Some(TargetType::Coplanar),
        "noncoplanar" => Some(TargetType::Noncoplanar),
        _ => None,
    };
    let optimization = match optimization_type {
        "three-param" => Some(OptimizationType::ThreeParam),
        "full" => Some(OptimizationType::Full),
        _ => None,
    };

    match (target, optimization) {
        (Some(target), Some(optimization)) => {
            calibrate(target, optimization, points, initial, origin_offset)
        }
        _ => Err(CalibrationError::UnsupportedConfiguration {
            target_type: target_type.to_string(),
            optimization_type: optimization_type.to_string(),
        }),
    }
}

/// Mutable state shared by the calibration stages: the evolving parameter
/// estimate plus the distorted sensor coordinates of the observations.
pub(crate) struct Workspace {
    pub cp: CameraParameters,
    pub points: Vec<Correspondence>,
    pub xd: Vec<f64>,
    pub yd: Vec<f64>,
    pub r_squared: Vec<f64>,
}

impl Workspace {
    pub fn new(cp: CameraParameters, points: Vec<Correspondence>) -> Self {
        let n = points.len();
        Workspace {
            cp,
            points,
            xd: vec![0.0; n],
            yd: vec![0.0; n],
            r_squared: vec![0.0; n],
        }
    }

    /// Fills `xd`, `yd`, `r_squared` with the distorted sensor coordinates
    /// [mm] of the observed image points.
    pub fn compute_distorted_sensor_coords(&mut self) {
        for (i, p) in self.points.iter().enumerate() {
            let xd = self.cp.dpx * (p.xf - self.cp.cx) / self.cp.sx;
            let yd = self.cp.dpy * (p.yf - self.cp.cy);
            self.xd[i] = xd;
            self.yd[i] = yd;
            self.r_squared[i] = xd * xd + yd * yd;
        }
    }

    /// Replaces `xd`, `yd` with their undistorted counterparts under the
    /// current `kappa1`.
    pub fn remove_sensor_plane_distortion(&mut self) {
        for i in 0..self.points.len() {
            let pu = self
                .cp
                .distorted_to_undistorted_sensor(&Vector2::new(self.xd[i], self.yd[i]));
            self.xd[i] = pu.x;
            self.yd[i] = pu.y;
            self.r_squared[i] = pu.x * pu.x + pu.y * pu.y;
        }
    }

    /// Index of the observation farthest from the image center, used to fix
    /// the sign of `Ty`.
    pub fn far_point(&self) -> usize {
        let mut far_point = 0;
        let mut far_distance = 0.0;
        for (i, &d) in self.r_squared.iter().enumerate() {
            if d > far_distance {
                far_point = i;
                far_distance = d;
            }
        }
        far_point
    }

    /// Switches to the second solution of the orthonormal rotation matrix.
    pub fn flip_rotation_solution(&mut self) {
        self.cp.r3 = -self.cp.r3;
        self.cp.r6 = -self.cp.r6;
        self.cp.r7 = -self.cp.r7;
        self.cp.r8 = -self.cp.r8;
        self.cp.update_euler_angles();
    }
}

/// True when `a` and `b` lie on different sides of zero (zero counts as
/// negative, matching the sign-bit convention of the linear stage).
pub(crate) fn sign_differs(a: f64, b: f64) -> bool {
    (a > 0.0) != (b > 0.0)
}

/// Bookkeeping across the staged nonlinear refinements.
pub(crate) struct StageLog {
    pub converged: bool,
    pub iterations: usize,
    pub final_cost: f64,
}

impl StageLog {
    pub fn new() -> Self {
        StageLog {
            converged: true,
            iterations: 0,
            final_cost: 0.0,
        }
    }

    pub fn into_calibration(self, cp: &CameraParameters) -> Calibration {
        Calibration {
            parameters: cp.clone(),
            converged: self.converged,
            final_cost: self.final_cost,
            iterations: self.iterations,
        }
    }
}

/// Runs one nonlinear refinement stage and folds its outcome into `log`.
///
/// Solver failures are mapped into the calibration error taxonomy; exhausting
/// the iteration budget only clears the `converged` flag.
pub(crate) fn run_stage<P>(
    problem: &mut P,
    initial: DVector<f64>,
    stage: &'static str,
    log: &mut StageLog,
) -> Result<DVector<f64>, CalibrationError>
where
    P: ResidualProblem<Error = CalibrationError>,
{
    let solution =
        levenberg_marquardt(problem, &initial, &Options::default()).map_err(|err| match err {
            OptimError::Residual(inner) => inner,
            OptimError::NumericalBreakdown { iteration } => {
                CalibrationError::NumericalBreakdown { stage, iteration }
            }
            OptimError::Underdetermined {
                residuals,
                parameters,
            } => CalibrationError::InsufficientData {
                required: parameters,
                actual: residuals,
            },
        })?;

    debug!(
        "{}: {} iterations, cost {:.6e} -> {:.6e}, converged: {}",
        stage,
        solution.iterations,
        solution.initial_cost,
        solution.cost,
        solution.converged()
    );

    log.converged &= solution.converged();
    log.iterations += solution.iterations;
    log.final_cost = solution.cost;
    Ok(solution.params)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Projects a synthetic grid through a ground-truth camera, producing
    /// exact correspondences.
    pub fn project_points(cp: &CameraParameters, world: &[Vector3<f64>]) -> Vec<Correspondence> {
        world
            .iter()
            .map(|pw| {
                let pf = cp.world_to_image(pw).unwrap();
                Correspondence::new(pw.x, pw.y, pw.z, pf.x, pf.y)
            })
            .collect()
    }

    /// Ground-truth camera for the synthetic recovery tests: an image_dim
    /// model tilted ~30 degrees towards the z = 0 target plane, with the
    /// world origin kept away from the optical axis.
    pub fn ground_truth_camera() -> CameraParameters {
        let mut cp = CameraParameters::from_image_dim(640.0, 480.0);
        cp.f = 800.0;
        cp.rot_x = -0.52;
        cp.rot_y = 0.12;
        cp.rot_z = 0.08;
        cp.update_rotation_matrix();
        cp.tx = 60.0;
        cp.ty = -80.0;
        cp.tz = 1500.0;
        cp
    }

    /// A coplanar grid on z = 0, `side x side` points over `half_extent`.
    pub fn coplanar_grid(side: usize, half_extent: f64) -> Vec<Vector3<f64>> {
        let mut world = Vec::new();
        for yi in 0..side {
            for xi in 0..side {
                let x = (xi as f64 / (side - 1) as f64) * 2.0 * half_extent - half_extent;
                let y = (yi as f64 / (side - 1) as f64) * 2.0 * half_extent - half_extent;
                world.push(Vector3::new(x, y, 0.0));
            }
        }
        world
    }

    /// Two stacked grids, spanning 3D space.
    pub fn noncoplanar_grid(side: usize, half_extent: f64, depth: f64) -> Vec<Vector3<f64>> {
        let mut world = coplanar_grid(side, half_extent);
        for pw in coplanar_grid(side, half_extent * 0.8) {
            world.push(Vector3::new(pw.x + 10.0, pw.y - 15.0, depth));
        }
        world
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_geometry() -> CameraParameters {
        CameraParameters::from_image_dim(640.0, 480.0)
    }

    #[test]
    fn test_insufficient_data_fails_before_solving() {
        let points = vec![
            Correspondence::new(0.0, 0.0, 0.0, 100.0, 100.0),
            Correspondence::new(10.0, 0.0, 0.0, 120.0, 100.0),
            Correspondence::new(0.0, 10.0, 0.0, 100.0, 120.0),
        ];
        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &sensor_geometry(),
            None,
        );
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientData {
                required: 5,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_noncoplanar_needs_seven_points() {
        let points = vec![Correspondence::new(0.0, 0.0, 0.0, 0.0, 0.0); 6];
        let result = calibrate(
            TargetType::Noncoplanar,
            OptimizationType::ThreeParam,
            &points,
            &sensor_geometry(),
            None,
        );
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientData {
                required: 7,
                actual: 6
            })
        ));
    }

    #[test]
    fn test_unsupported_configuration_does_not_mutate_input() {
        let initial = sensor_geometry();
        let before = initial.clone();
        let points = vec![Correspondence::new(0.0, 0.0, 0.0, 0.0, 0.0); 10];
        let result = calibrate_named("coplanar", "bogus", &points, &initial, None);
        match result {
            Err(CalibrationError::UnsupportedConfiguration {
                target_type,
                optimization_type,
            }) => {
                assert_eq!(target_type, "coplanar");
                assert_eq!(optimization_type, "bogus");
            }
            other => panic!("expected UnsupportedConfiguration, got {:?}", other.err()),
        }
        assert_eq!(initial, before);
    }

    #[test]
    fn test_invalid_sensor_geometry_is_rejected() {
        let points = vec![Correspondence::new(0.0, 0.0, 0.0, 0.0, 0.0); 10];
        let result = calibrate(
            TargetType::Coplanar,
            OptimizationType::ThreeParam,
            &points,
            &CameraParameters::new(),
            None,
        );
        assert!(matches!(result, Err(CalibrationError::Camera(_))));
    }

    #[test]
    fn test_sign_differs_treats_zero_as_negative() {
        assert!(sign_differs(1.0, 0.0));
        assert!(sign_differs(1.0, -1.0));
        assert!(!sign_differs(0.0, -1.0));
        assert!(!sign_differs(2.0, 3.0));
    }
}
