//! Tsai Tools Library
//!
//! A Rust library for camera calibration using the two-stage method of Tsai.
//! Given correspondences between known 3D world points and their observed 2D
//! image projections, the library recovers:
//! - Intrinsic parameters: focal length, first-order radial lens distortion,
//!   and the horizontal scale uncertainty factor
//! - Extrinsic parameters: camera position and orientation in world coordinates
//!
//! Both coplanar and non-coplanar calibration targets are supported, each with
//! a fast three-parameter refinement or a full staged optimization. The
//! nonlinear stages run on the crate's own Levenberg-Marquardt solver with
//! forward-difference Jacobians.
//!
//! The library also includes extrinsic-only pose estimation for cameras with
//! known intrinsics, the full world/camera/sensor/image coordinate transform
//! pipeline, and accuracy measures for judging a finished calibration.

pub mod calibration;
pub mod camera;
pub mod linalg;
pub mod optim;

// Re-export commonly used types
pub use camera::{CameraError, CameraParameters, KnownCamera};

pub use calibration::{
    calibrate, calibrate_named, Calibration, CalibrationError, Correspondence, OptimizationType,
    TargetType,
};

pub use optim::{levenberg_marquardt, OptimError, Options, ResidualProblem, Solution, Termination};
