//! Guarded linear least-squares solves.
//!
//! Every linear stage of the calibration pipeline funnels through
//! [`lstsq`], which solves an overdetermined system `M a = b` in the least
//! squares sense via SVD and refuses to return garbage for rank-deficient
//! systems: a singular value below `RANK_TOLERANCE` relative to the largest
//! singular value means the point configuration does not constrain the
//! unknowns, which is reported as [`LinAlgError::SingularMatrix`].
//!
//! Ordinary dense operations (multiply, transpose, determinant, inverse)
//! are used straight from nalgebra where needed.

use nalgebra::{DMatrix, DVector};

/// Relative singular value cutoff below which a system counts as singular.
pub const RANK_TOLERANCE: f64 = 1e-10;

#[derive(thiserror::Error, Debug)]
pub enum LinAlgError {
    #[error(
        "matrix is singular to working precision \
         ({rows}x{cols}, singular value ratio {ratio:.3e})"
    )]
    SingularMatrix { rows: usize, cols: usize, ratio: f64 },
    #[error("SVD computation failed for a {rows}x{cols} matrix")]
    SvdFailed { rows: usize, cols: usize },
    #[error("dimension mismatch: matrix has {rows} rows but rhs has {len}")]
    DimensionMismatch { rows: usize, len: usize },
}

/// Solves `M a = b` in the least squares sense.
///
/// # Errors
///
/// * [`LinAlgError::DimensionMismatch`] if `b` does not match the row count.
/// * [`LinAlgError::SingularMatrix`] if the column space is rank deficient
///   relative to [`RANK_TOLERANCE`].
/// * [`LinAlgError::SvdFailed`] if the decomposition does not converge.
pub fn lstsq(m: &DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, LinAlgError> {
    let (rows, cols) = m.shape();
    if b.len() != rows {
        return Err(LinAlgError::DimensionMismatch { rows, len: b.len() });
    }

    let svd = nalgebra::SVD::try_new(m.clone(), true, true, f64::EPSILON, 0)
        .ok_or(LinAlgError::SvdFailed { rows, cols })?;

    let max_sv = svd.singular_values.max();
    let min_sv = svd.singular_values.min();
    if max_sv <= 0.0 || min_sv < RANK_TOLERANCE * max_sv {
        let ratio = if max_sv > 0.0 { min_sv / max_sv } else { 0.0 };
        return Err(LinAlgError::SingularMatrix { rows, cols, ratio });
    }

    svd.solve(b, RANK_TOLERANCE * max_sv)
        .map_err(|_| LinAlgError::SvdFailed { rows, cols })
}
