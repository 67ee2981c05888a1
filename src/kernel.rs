//! Numeric kernel used by every layer.
//!
//! This module provides a single abstraction over matrix multiplication:
//! - default: a simple, safe triple-loop implementation
//! - optional: a faster backend via the `matrixmultiply` feature
//!
//! On top of [`gemm`] sit the three products the layers need. Weights are row-major
//! `(out_dim, in_dim)` and a timestep holds one contiguous vector per sequence, so all three
//! are plain strided views of the same buffers:
//!
//! - [`affine`]: `Y += X · Wᵀ` (forward)
//! - [`affine_transpose`]: `dX += D · W` (delta propagation)
//! - [`accumulate_outer`]: `M += alpha · Dᵀ · X` (gradient accumulation)

use crate::Real;

#[allow(clippy::too_many_arguments)]
#[inline]
pub(crate) fn gemm(
    m: usize,
    n: usize,
    k: usize,
    alpha: Real,
    a: &[Real],
    rsa: usize,
    csa: usize,
    b: &[Real],
    rsb: usize,
    csb: usize,
    beta: Real,
    c: &mut [Real],
    rsc: usize,
    csc: usize,
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    debug_assert!(a.len() >= (m - 1) * rsa + (k - 1) * csa + 1);
    debug_assert!(b.len() >= (k - 1) * rsb + (n - 1) * csb + 1);
    debug_assert!(c.len() >= (m - 1) * rsc + (n - 1) * csc + 1);

    #[cfg(feature = "matrixmultiply")]
    {
        // SAFETY: the debug assertions above describe the extent every caller passes; the
        // wrappers below derive the strides from slice lengths they check with `assert!`.
        unsafe {
            matrixmultiply::dgemm(
                m,
                k,
                n,
                alpha,
                a.as_ptr(),
                rsa as isize,
                csa as isize,
                b.as_ptr(),
                rsb as isize,
                csb as isize,
                beta,
                c.as_mut_ptr(),
                rsc as isize,
                csc as isize,
            );
        }
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0;
            let a0 = i * rsa;
            let b0 = j * csb;

            for p in 0..k {
                acc = a[a0 + p * csa].mul_add(b[p * rsb + b0], acc);
            }

            let idx = i * rsc + j * csc;
            c[idx] = alpha * acc + beta * c[idx];
        }
    }
}

/// `y[batch × out] += x[batch × in] · wᵀ` where `w` is `(out, in)` row-major.
pub(crate) fn affine(
    batch: usize,
    out: usize,
    input: usize,
    w: &[Real],
    x: &[Real],
    y: &mut [Real],
) {
    assert!(w.len() >= out * input, "weights too short for {out}x{input}");
    assert!(x.len() >= batch * input, "input too short for batch {batch}");
    assert!(y.len() >= batch * out, "output too short for batch {batch}");
    gemm(batch, out, input, 1.0, x, input, 1, w, 1, input, 1.0, y, out, 1);
}

/// `dx[batch × in] += d[batch × out] · w` where `w` is `(out, in)` row-major.
pub(crate) fn affine_transpose(
    batch: usize,
    out: usize,
    input: usize,
    w: &[Real],
    d: &[Real],
    dx: &mut [Real],
) {
    assert!(w.len() >= out * input, "weights too short for {out}x{input}");
    assert!(d.len() >= batch * out, "delta too short for batch {batch}");
    assert!(dx.len() >= batch * input, "input delta too short for batch {batch}");
    gemm(batch, input, out, 1.0, d, out, 1, w, input, 1, 1.0, dx, input, 1);
}

/// `m[out × in] += alpha · d[batch × out]ᵀ · x[batch × in]`.
pub(crate) fn accumulate_outer(
    batch: usize,
    out: usize,
    input: usize,
    alpha: Real,
    d: &[Real],
    x: &[Real],
    m: &mut [Real],
) {
    assert!(m.len() >= out * input, "matrix too short for {out}x{input}");
    assert!(d.len() >= batch * out, "delta too short for batch {batch}");
    assert!(x.len() >= batch * input, "input too short for batch {batch}");
    gemm(out, input, batch, alpha, d, 1, out, x, input, 1, 1.0, m, input, 1);
}

/// `y += alpha · x`.
#[inline]
pub(crate) fn axpy(alpha: Real, x: &[Real], y: &mut [Real]) {
    debug_assert_eq!(x.len(), y.len());
    for (yv, &xv) in y.iter_mut().zip(x) {
        *yv = alpha.mul_add(xv, *yv);
    }
}

/// `out += alpha · Σ_rows m`, for `m` holding `rows` contiguous rows of `out.len()` values.
pub(crate) fn column_sum_into(rows: usize, alpha: Real, m: &[Real], out: &mut [Real]) {
    let dim = out.len();
    for row in m[..rows * dim].chunks_exact(dim) {
        axpy(alpha, row, out);
    }
}

/// Broadcast `row` into the first `rows` rows of `m`, or zero them when `row` is `None`.
pub(crate) fn fill_rows(rows: usize, row: Option<&[Real]>, m: &mut [Real], dim: usize) {
    let m = &mut m[..rows * dim];
    match row {
        Some(row) => m.chunks_exact_mut(dim).for_each(|chunk| chunk.copy_from_slice(row)),
        None => m.fill(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_matches_manual_product() {
        // w = [[1, 2, 3], [4, 5, 6]], two inputs.
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, 0.0, -1.0, 0.5, 0.5, 0.5];
        let mut y = [1.0, 1.0, 0.0, 0.0];
        affine(2, 2, 3, &w, &x, &mut y);
        assert_eq!(y, [1.0 - 2.0, 1.0 - 2.0, 3.0, 7.5]);
    }

    #[test]
    fn affine_transpose_matches_manual_product() {
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let d = [1.0, -1.0];
        let mut dx = [0.0; 3];
        affine_transpose(1, 2, 3, &w, &d, &mut dx);
        assert_eq!(dx, [-3.0, -3.0, -3.0]);
    }

    #[test]
    fn accumulate_outer_sums_over_batch() {
        let d = [1.0, 2.0, 3.0, 4.0];
        let x = [1.0, 10.0];
        let mut m = [0.0; 4];
        accumulate_outer(2, 2, 1, -0.5, &d, &x, &mut m);
        // column 0 only (in_dim = 1): -0.5 * (d0*x0 + d1*x1) for each output.
        assert_eq!(&m[..2], &[-0.5 * (1.0 + 30.0), -0.5 * (2.0 + 40.0)]);
        assert_eq!(&m[2..], &[0.0, 0.0]);
    }

    #[test]
    fn column_sum_and_fill_rows() {
        let m = [1.0, 2.0, 3.0, 4.0, 100.0, 100.0];
        let mut out = [0.0, 0.0];
        column_sum_into(2, 2.0, &m, &mut out);
        assert_eq!(out, [8.0, 12.0]);

        let mut buf = [9.0; 6];
        fill_rows(2, Some(&[1.0, 2.0]), &mut buf, 2);
        assert_eq!(buf, [1.0, 2.0, 1.0, 2.0, 9.0, 9.0]);
        fill_rows(1, None, &mut buf, 2);
        assert_eq!(&buf[..2], &[0.0, 0.0]);
    }
}
