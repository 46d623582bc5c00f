//! Camera parameter model for Tsai's 11-parameter camera.
//!
//! The model is a pin hole camera with first order radial lens distortion.
//! [`CameraParameters`] collects the fixed sensor geometry (usually taken from
//! manufacturer specifications, or one of the [`KnownCamera`] presets), the
//! calibrated intrinsic constants and the calibrated extrinsic constants in a
//! single flat record. The coordinate transform pipeline built on top of the
//! record lives in [`transform`](crate::camera::transform).
//!
//! Notation follows the usual Tsai conventions: the camera X axis runs along
//! increasing column coordinates of the image, the Y axis along increasing row
//! coordinates, and all 3D coordinates are right-handed.

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::str::FromStr;

pub mod transform;

/// Complete parameter set for one camera.
///
/// The first block of fields is the fixed sensor geometry, the second block
/// holds the intrinsic constants recovered by calibration, and the third block
/// holds the extrinsic constants. The rotation matrix `r1..r9` (row major) is
/// the authoritative orientation; the Euler angles `rot_x, rot_y, rot_z` are
/// kept in sync for convenience but are derived data.
///
/// All fields default to zero. A freshly constructed record is only useful
/// once the sensor geometry has been filled in, either by hand, from a
/// [`KnownCamera`] preset, or from [`CameraParameters::from_image_dim`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CameraParameters {
    /// [sel] Number of sensor elements in the camera's x direction.
    pub ncx: f64,
    /// [pix] Number of pixels in the frame grabber's x direction.
    pub nfx: f64,
    /// [mm/sel] X dimension of the camera's sensor element.
    pub dx: f64,
    /// [mm/sel] Y dimension of the camera's sensor element.
    pub dy: f64,
    /// [mm/pix] Effective X dimension of a pixel in the frame grabber.
    pub dpx: f64,
    /// [mm/pix] Effective Y dimension of a pixel in the frame grabber.
    pub dpy: f64,
    /// [pix] Z axis intercept of the camera coordinate system (image center x).
    pub cx: f64,
    /// [pix] Z axis intercept of the camera coordinate system (image center y).
    pub cy: f64,
    /// [] Scale factor compensating for any error in dpx.
    pub sx: f64,

    /// [mm] Effective focal length of the pin hole camera.
    pub f: f64,
    /// [1/mm^2] First order radial lens distortion coefficient.
    pub kappa1: f64,
    /// [1/mm] Reserved tangential distortion term, always zero.
    pub p1: f64,
    /// [1/mm] Reserved tangential distortion term, always zero.
    pub p2: f64,

    /// [mm] Translation, x component.
    pub tx: f64,
    /// [mm] Translation, y component.
    pub ty: f64,
    /// [mm] Translation, z component.
    pub tz: f64,
    /// [rad] Rotation about the world x axis (derived from `r1..r9`).
    pub rot_x: f64,
    /// [rad] Rotation about the world y axis (derived from `r1..r9`).
    pub rot_y: f64,
    /// [rad] Rotation about the world z axis (derived from `r1..r9`).
    pub rot_z: f64,
    /// Rotation matrix element, row 1 column 1.
    pub r1: f64,
    /// Rotation matrix element, row 1 column 2.
    pub r2: f64,
    /// Rotation matrix element, row 1 column 3.
    pub r3: f64,
    /// Rotation matrix element, row 2 column 1.
    pub r4: f64,
    /// Rotation matrix element, row 2 column 2.
    pub r5: f64,
    /// Rotation matrix element, row 2 column 3.
    pub r6: f64,
    /// Rotation matrix element, row 3 column 1.
    pub r7: f64,
    /// Rotation matrix element, row 3 column 2.
    pub r8: f64,
    /// Rotation matrix element, row 3 column 3.
    pub r9: f64,
}

/// Camera / frame grabber combinations with published sensor geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnownCamera {
    PhotometricsStarI,
    GeneralImagingMos5300Matrox,
    PanasonicGpMf702Matrox,
    SonyXc75Matrox,
    SonyXc77Matrox,
    SonyXc57Androx,
    XapShotMatrox,
}

impl KnownCamera {
    /// The preset's conventional name, e.g. `sony-xc75-matrox`.
    pub fn name(&self) -> &'static str {
        match self {
            KnownCamera::PhotometricsStarI => "photometrics-star-I",
            KnownCamera::GeneralImagingMos5300Matrox => "general-imaging-mos5300-matrox",
            KnownCamera::PanasonicGpMf702Matrox => "panasonic-GP-MF702-matrox",
            KnownCamera::SonyXc75Matrox => "sony-xc75-matrox",
            KnownCamera::SonyXc77Matrox => "sony-xc77-matrox",
            KnownCamera::SonyXc57Androx => "sony-xc57-androx",
            KnownCamera::XapShotMatrox => "xapshot-matrox",
        }
    }
}

impl FromStr for KnownCamera {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "photometrics-star-I" => Ok(KnownCamera::PhotometricsStarI),
            "general-imaging-mos5300-matrox" => Ok(KnownCamera::GeneralImagingMos5300Matrox),
            "panasonic-GP-MF702-matrox" => Ok(KnownCamera::PanasonicGpMf702Matrox),
            "sony-xc75-matrox" => Ok(KnownCamera::SonyXc75Matrox),
            "sony-xc77-matrox" => Ok(KnownCamera::SonyXc77Matrox),
            "sony-xc57-androx" => Ok(KnownCamera::SonyXc57Androx),
            "xapshot-matrox" => Ok(KnownCamera::XapShotMatrox),
            other => Err(CameraError::UnknownModel(other.to_string())),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("point is at or behind the camera focal plane (zc = {zc})")]
    DegenerateProjection { zc: f64 },
    #[error(
        "undistorted sensor point ({xu}, {yu}) lies beyond the maximum \
         barrel distortion radius {max_radius}"
    )]
    DistortionInversionFailed { xu: f64, yu: f64, max_radius: f64 },
    #[error("rotation matrix is singular")]
    SingularRotation,
    #[error("back projection is degenerate for this view direction")]
    DegenerateBackProjection,
    #[error("pixel spacing dpx/dpy must be positive")]
    PixelSpacingMustBePositive,
    #[error("scale factor sx must be positive")]
    ScaleFactorMustBePositive,
    #[error("image center must be finite")]
    ImageCenterMustBeFinite,
    #[error("unknown camera model: {0}")]
    UnknownModel(String),
    #[error("invalid camera parameters: {0}")]
    InvalidParams(String),
    #[error("failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::IOError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CameraError {
    fn from(err: serde_yaml::Error) -> Self {
        CameraError::YamlError(err.to_string())
    }
}

impl CameraParameters {
    /// Creates an empty parameter set with every field zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the parameter set for a known camera / frame grabber pair.
    ///
    /// Only the sensor geometry is populated; the calibrated constants stay
    /// zero until a calibration run fills them in. For every preset the
    /// relation `dpx = dx * Ncx / Nfx` holds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tsai_tools::camera::{CameraParameters, KnownCamera};
    ///
    /// let cp = CameraParameters::from_model(KnownCamera::SonyXc75Matrox);
    /// assert_eq!(cp.ncx, 768.0);
    /// assert!((cp.dpx - 0.0084 * 768.0 / 512.0).abs() < 1e-12);
    /// ```
    pub fn from_model(model: KnownCamera) -> Self {
        let (ncx, nfx, dx, dy, cx, cy, sx) = match model {
            KnownCamera::PhotometricsStarI => (576.0, 576.0, 0.023, 0.023, 258.0, 204.0, 1.0),
            KnownCamera::GeneralImagingMos5300Matrox => {
                (649.0, 512.0, 0.015, 0.015, 256.0, 240.0, 1.0)
            }
            KnownCamera::PanasonicGpMf702Matrox => {
                (649.0, 512.0, 0.015, 0.015, 268.0, 248.0, 1.078647)
            }
            KnownCamera::SonyXc75Matrox => (768.0, 512.0, 0.0084, 0.0098, 256.0, 240.0, 1.0),
            KnownCamera::SonyXc77Matrox => (768.0, 512.0, 0.011, 0.013, 256.0, 240.0, 1.0),
            KnownCamera::SonyXc57Androx => (510.0, 512.0, 0.017, 0.013, 256.0, 240.0, 1.107914),
            KnownCamera::XapShotMatrox => {
                (739.0, 512.0, 6.4 / 782.0, 4.8 / 250.0, 256.0, 120.0, 1.027753)
            }
        };

        CameraParameters {
            ncx,
            nfx,
            dx,
            dy,
            dpx: dx * ncx / nfx,
            dpy: dy,
            cx,
            cy,
            sx,
            ..Default::default()
        }
    }

    /// Creates a synthetic pin-hole-like parameter set from image dimensions.
    ///
    /// Assumes square unit pixels (`dx = dy = dpx = dpy = 1`), `Ncx = Nfx =
    /// width`, the image center at the midpoint and `sx = 1`. Useful when no
    /// physical sensor data is available and the focal length is to be
    /// recovered in pixel units.
    pub fn from_image_dim(width: f64, height: f64) -> Self {
        CameraParameters {
            ncx: width,
            nfx: width,
            dx: 1.0,
            dy: 1.0,
            dpx: 1.0,
            dpy: 1.0,
            cx: width / 2.0,
            cy: height / 2.0,
            sx: 1.0,
            ..Default::default()
        }
    }

    /// Loads a parameter set from a YAML file.
    pub fn load_from_yaml(path: &str) -> Result<Self, CameraError> {
        let contents = fs::read_to_string(path)?;
        let params: CameraParameters = serde_yaml::from_str(&contents)?;
        params.validate_sensor_geometry()?;
        Ok(params)
    }

    /// Saves the parameter set to a YAML file.
    pub fn save_to_yaml(&self, path: &str) -> Result<(), CameraError> {
        let yaml_string = serde_yaml::to_string(self)?;
        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    /// Checks the fixed sensor geometry that calibration depends on.
    ///
    /// # Errors
    ///
    /// * [`CameraError::PixelSpacingMustBePositive`]
    /// * [`CameraError::ScaleFactorMustBePositive`]
    /// * [`CameraError::ImageCenterMustBeFinite`]
    pub fn validate_sensor_geometry(&self) -> Result<(), CameraError> {
        if self.dpx <= 0.0 || self.dpy <= 0.0 {
            return Err(CameraError::PixelSpacingMustBePositive);
        }
        if self.sx <= 0.0 {
            return Err(CameraError::ScaleFactorMustBePositive);
        }
        if !self.cx.is_finite() || !self.cy.is_finite() {
            return Err(CameraError::ImageCenterMustBeFinite);
        }
        Ok(())
    }

    /// The camera position `(Tx, Ty, Tz)`.
    pub fn position(&self) -> nalgebra::Vector3<f64> {
        nalgebra::Vector3::new(self.tx, self.ty, self.tz)
    }

    /// The rotation matrix `r1..r9` as a nalgebra matrix (row major).
    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.r1, self.r2, self.r3, self.r4, self.r5, self.r6, self.r7, self.r8, self.r9,
        )
    }

    /// Overwrites `r1..r9` from a matrix and refreshes the Euler angles.
    pub fn set_rotation_matrix(&mut self, r: &Matrix3<f64>) {
        self.r1 = r[(0, 0)];
        self.r2 = r[(0, 1)];
        self.r3 = r[(0, 2)];
        self.r4 = r[(1, 0)];
        self.r5 = r[(1, 1)];
        self.r6 = r[(1, 2)];
        self.r7 = r[(2, 0)];
        self.r8 = r[(2, 1)];
        self.r9 = r[(2, 2)];
        self.update_euler_angles();
    }

    /// Solves the roll, pitch and yaw angles for the current rotation matrix
    /// (Paul, "Robot Manipulators", p. 70).
    ///
    /// Should the matrix not be orthonormal these are not best-fit angles.
    /// There is a second solution, reachable by adding 180 degrees to `rot_z`
    /// before `rot_y` and `rot_x` are computed.
    pub fn update_euler_angles(&mut self) {
        self.rot_z = self.r4.atan2(self.r1);
        let (sg, cg) = self.rot_z.sin_cos();
        self.rot_y = (-self.r7).atan2(self.r1 * cg + self.r4 * sg);
        self.rot_x = (self.r3 * sg - self.r6 * cg).atan2(self.r5 * cg - self.r2 * sg);
    }

    /// Fills `r1..r9` from the current roll, pitch and yaw angles.
    pub fn update_rotation_matrix(&mut self) {
        let (sa, ca) = self.rot_x.sin_cos();
        let (sb, cb) = self.rot_y.sin_cos();
        let (sg, cg) = self.rot_z.sin_cos();

        self.r1 = cb * cg;
        self.r2 = cg * sa * sb - ca * sg;
        self.r3 = sa * sg + ca * cg * sb;
        self.r4 = cb * sg;
        self.r5 = sa * sb * sg + ca * cg;
        self.r6 = ca * sb * sg - cg * sa;
        self.r7 = -sb;
        self.r8 = cb * sa;
        self.r9 = ca * cb;
    }
}
