//! Zero-copy interop between `ndarray` containers and `faer` factorizations.
//!
//! All user-facing linear algebra in this crate lives in `ndarray`; anything
//! factorization-grade (Cholesky, symmetric inverses, solves) is handed to
//! faer through the views below. Matrices here are small (trait or factor
//! dimension, occasionally taxa x traits), so we prefer the simple owned-copy
//! fallbacks over clever stride games.

use faer::linalg::solvers::{self, Solve};
pub use faer::linalg::solvers::{Ldlt as FaerLdlt, Llt as FaerLlt};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FaerLinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("LDLT factorization failed: {0:?}")]
    Ldlt(solvers::LdltError),
    #[error("matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// Borrowed faer view over an `ndarray` matrix.
///
/// Layouts that faer kernels cannot traverse safely (zero or negative
/// strides) are materialized into a compact owned copy.
pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }

        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (self.ptr, self.rows, self.cols, self.row_stride, self.col_stride)
        };
        // SAFETY: the pointer and strides come straight from a live ndarray
        // whose layout was validated (or compacted) in `new`.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];
    // SAFETY: dimensions and strides are exactly those reported by ndarray.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub enum FaerSymmetricFactor {
    Llt(FaerLlt<f64>),
    Ldlt(FaerLdlt<f64>),
}

impl FaerSymmetricFactor {
    #[inline]
    pub fn solve_in_place(&self, rhs: MatMut<'_, f64>) {
        match self {
            FaerSymmetricFactor::Llt(f) => f.solve_in_place(rhs),
            FaerSymmetricFactor::Ldlt(f) => f.solve_in_place(rhs),
        }
    }
}

/// Factorize a symmetric matrix with an LLT first attempt and LDLT fallback.
///
/// Tree precisions and combined factor precisions are positive definite in
/// exact arithmetic but can brush against semidefiniteness once missing data
/// or near-zero branch lengths enter; the LDLT fallback keeps those cases
/// solvable.
pub fn factorize_symmetric_with_fallback(
    matrix: MatRef<'_, f64>,
    side: Side,
) -> Result<FaerSymmetricFactor, FaerLinalgError> {
    if let Ok(llt) = FaerLlt::new(matrix, side) {
        return Ok(FaerSymmetricFactor::Llt(llt));
    }
    log::warn!("LLT failed on a symmetric factorization; retrying with LDLT");
    let ldlt = FaerLdlt::new(matrix, side).map_err(FaerLinalgError::Ldlt)?;
    Ok(FaerSymmetricFactor::Ldlt(ldlt))
}

/// Invert a symmetric positive-(semi)definite matrix.
///
/// Numerical solves can leave tiny asymmetry in the inverse, which the
/// downstream Gaussian-combination arithmetic would amplify; symmetry is
/// enforced explicitly on the way out.
pub fn symmetric_inverse<S: Data<Elem = f64>>(
    matrix: &ArrayBase<S, Ix2>,
) -> Result<Array2<f64>, FaerLinalgError> {
    let p = matrix.nrows();
    if matrix.ncols() != p {
        return Err(FaerLinalgError::NotSquare {
            rows: p,
            cols: matrix.ncols(),
        });
    }

    let view = FaerArrayView::new(matrix);
    let factor = factorize_symmetric_with_fallback(view.as_ref(), Side::Lower)?;

    let mut inv = Array2::<f64>::eye(p);
    let mut inv_view = array2_to_mat_mut(&mut inv);
    factor.solve_in_place(inv_view.as_mut());

    for i in 0..p {
        for j in (i + 1)..p {
            let avg = 0.5 * (inv[[i, j]] + inv[[j, i]]);
            inv[[i, j]] = avg;
            inv[[j, i]] = avg;
        }
    }
    Ok(inv)
}

pub struct FaerCholeskyFactor {
    factor: FaerLlt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    /// log det of the factorized matrix, from the diagonal of `L`.
    pub fn log_determinant(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = 0.0;
        for i in 0..l.nrows() {
            acc += l[(i, i)].ln();
        }
        2.0 * acc
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, FaerLinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = FaerLlt::new(faer_view.as_ref(), side).map_err(FaerLinalgError::Cholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}

/// Compensated (Kahan) accumulator for order-stable reductions.
#[derive(Default, Clone, Copy)]
pub(crate) struct KahanSum {
    sum: f64,
    c: f64,
}

impl KahanSum {
    pub(crate) fn add(&mut self, value: f64) {
        let y = value - self.c;
        let t = self.sum + y;
        self.c = (t - self.sum) - y;
        self.sum = t;
    }

    pub(crate) fn sum(self) -> f64 {
        self.sum
    }
}
