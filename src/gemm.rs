//! Single-precision GEMM backend. Uses CBLAS when the `blas` feature is
//! on, matrixmultiply otherwise. All matrices are row-major slices.

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Transpose {
    None,
    Ordinary,
}

#[cfg(feature = "blas")]
mod imp {
    use super::Transpose;
    use cblas_sys::*;

    fn to_cblas(t: Transpose) -> CBLAS_TRANSPOSE {
        match t {
            Transpose::None => CBLAS_TRANSPOSE::CblasNoTrans,
            Transpose::Ordinary => CBLAS_TRANSPOSE::CblasTrans,
        }
    }

    /// C = alpha * op(A) @ op(B) + beta * C, with op(A): m×k, op(B): k×n.
    pub fn sgemm_rowmajor(
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) {
        let (m, n, k) = (m as i32, n as i32, k as i32);
        let lda = if trans_a == Transpose::None { k } else { m };
        let ldb = if trans_b == Transpose::None { n } else { k };
        let ldc = n;

        unsafe {
            cblas_sgemm(
                CBLAS_ORDER::CblasRowMajor,
                to_cblas(trans_a),
                to_cblas(trans_b),
                m,
                n,
                k,
                alpha,
                a.as_ptr(),
                lda,
                b.as_ptr(),
                ldb,
                beta,
                c.as_mut_ptr(),
                ldc,
            );
        }
    }
}

#[cfg(not(feature = "blas"))]
mod imp {
    use super::Transpose;
    use matrixmultiply::sgemm;

    /// C = alpha * op(A) @ op(B) + beta * C, with op(A): m×k, op(B): k×n.
    pub fn sgemm_rowmajor(
        trans_a: Transpose,
        trans_b: Transpose,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: &[f32],
        b: &[f32],
        beta: f32,
        c: &mut [f32],
    ) {
        // Row-major view strides for op(A): m×k
        let (a_rs, a_cs): (isize, isize) = match trans_a {
            Transpose::None => (k as isize, 1),
            Transpose::Ordinary => (1, m as isize),
        };
        // Row-major view strides for op(B): k×n
        let (b_rs, b_cs): (isize, isize) = match trans_b {
            Transpose::None => (n as isize, 1),
            Transpose::Ordinary => (1, k as isize),
        };
        let (c_rs, c_cs) = (n as isize, 1);

        unsafe {
            sgemm(
                m,
                k,
                n,
                alpha,
                a.as_ptr(),
                a_rs,
                a_cs,
                b.as_ptr(),
                b_rs,
                b_cs,
                beta,
                c.as_mut_ptr(),
                c_rs,
                c_cs,
            );
        }
    }
}

pub use imp::sgemm_rowmajor;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_transposed_rhs() {
        // A: 1x2, B stored as 1x2 but used transposed (2x1)
        let a = [1.0f32, 2.0];
        let b = [3.0f32, 4.0];
        let mut c = [0.0f32; 1];
        sgemm_rowmajor(
            Transpose::None,
            Transpose::Ordinary,
            1,
            1,
            2,
            1.0,
            &a,
            &b,
            0.0,
            &mut c,
        );
        assert!((c[0] - 11.0).abs() < 1e-6);
    }

    #[test]
    fn gemm_beta_accumulates_into_c() {
        let a = [1.0f32];
        let b = [2.0f32];
        let mut c = [5.0f32];
        sgemm_rowmajor(
            Transpose::None,
            Transpose::None,
            1,
            1,
            1,
            1.0,
            &a,
            &b,
            1.0,
            &mut c,
        );
        assert!((c[0] - 7.0).abs() < 1e-6);
    }
}
