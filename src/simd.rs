//! Aligned single-precision point buffers and the vectorized
//! inverse-distance-squared kernels.
//!
//! Only one evaluator has a vector path: inverse distance with
//! `power = 2`, `smoothing = 0` and no search ellipse. Its inner loop is
//! two subtractions, two multiply-adds and a reciprocal per sample, so
//! it vectorizes perfectly over truncated f32 copies of the point
//! arrays. The trade-off is explicit: the kernels accumulate in f32 and
//! use the hardware reciprocal approximation for `1 / r²`, so results
//! are close to, but not bit-identical with, the scalar f64 path.
//!
//! The unsafe surface is confined to this module: the aligned
//! allocation, and `#[target_feature]` kernels that are only reachable
//! after a runtime CPU feature check.

use std::alloc::{alloc, dealloc, Layout};

use crate::GridError;

/// Squared-distance threshold under which a sample counts as an exact
/// hit of the query point.
const EPSILON: f32 = 1e-13;

/// The widest f32 block any kernel loads per unrolled iteration
/// (256-bit kernel: 8 lanes × unroll 2).
const MAX_BLOCK: usize = 16;

/// Buffer start alignment; satisfies both 128- and 256-bit loads.
const ALIGN: usize = 32;

/// A heap allocation of `f32` with 32-byte start alignment, padded up to
/// a whole vector block.
///
/// The padding repeats the final value so that an out-of-logical-range
/// read would trip the singular-point mask rather than skew a sum; the
/// kernels never read it because they round the vector loop down to
/// whole blocks of real samples.
#[derive(Debug)]
pub struct AlignedF32 {
    ptr: *mut f32,
    padded: usize,
    layout: Option<Layout>,
}

// SAFETY: the buffer is uniquely owned, written only during
// construction, and read-only afterwards.
unsafe impl Send for AlignedF32 {}
unsafe impl Sync for AlignedF32 {}

impl AlignedF32 {
    /// Copy `src` into a fresh aligned buffer, truncating to f32.
    pub fn from_f64(src: &[f64]) -> Result<Self, GridError> {
        if src.is_empty() {
            return Ok(Self { ptr: std::ptr::null_mut(), padded: 0, layout: None });
        }
        let padded = (src.len() + MAX_BLOCK - 1) / MAX_BLOCK * MAX_BLOCK;
        let layout = Layout::from_size_align(padded * std::mem::size_of::<f32>(), ALIGN)
            .map_err(|_| GridError::OutOfMemory)?;
        // SAFETY: layout has non-zero size; a null return is an
        // allocation failure we surface instead of aborting.
        let ptr = unsafe { alloc(layout) } as *mut f32;
        if ptr.is_null() {
            return Err(GridError::OutOfMemory);
        }
        // SAFETY: ptr covers `padded` f32 slots by construction.
        unsafe {
            for (i, &v) in src.iter().enumerate() {
                ptr.add(i).write(v as f32);
            }
            let sentinel = src[src.len() - 1] as f32;
            for i in src.len()..padded {
                ptr.add(i).write(sentinel);
            }
        }
        Ok(Self { ptr, padded, layout: Some(layout) })
    }

    /// The padded contents. Indices past the source length hold the
    /// sentinel copies.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        if self.padded == 0 {
            return &[];
        }
        // SAFETY: ptr/padded describe the live allocation.
        unsafe { std::slice::from_raw_parts(self.ptr, self.padded) }
    }
}

impl Drop for AlignedF32 {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `from_f64` with this exact layout.
            unsafe { dealloc(self.ptr as *mut u8, layout) }
        }
    }
}

/// The f32 shadow copies of a context's point arrays.
#[derive(Debug)]
pub struct SimdPoints {
    pub x: AlignedF32,
    pub y: AlignedF32,
    pub z: AlignedF32,
    /// Logical sample count (excluding padding).
    pub len: usize,
}

impl SimdPoints {
    pub fn new(x: &[f64], y: &[f64], z: &[f64]) -> Result<Self, GridError> {
        Ok(Self {
            x: AlignedF32::from_f64(x)?,
            y: AlignedF32::from_f64(y)?,
            z: AlignedF32::from_f64(z)?,
            len: x.len(),
        })
    }
}

/// Which vector kernel a context selected at creation time.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SimdKernel {
    /// 128-bit lanes, 8 samples per iteration.
    Sse128,
    /// 256-bit lanes, 16 samples per iteration.
    Avx256,
}

/// Pick the widest kernel the host supports, honoring the USE_SSE /
/// USE_AVX knobs. Returns `None` off x86-64 or when both are disabled.
pub fn select_kernel(use_sse: bool, use_avx: bool) -> Option<SimdKernel> {
    #[cfg(target_arch = "x86_64")]
    {
        if use_avx && std::is_x86_feature_detected!("avx") {
            return Some(SimdKernel::Avx256);
        }
        if use_sse && std::is_x86_feature_detected!("sse") {
            return Some(SimdKernel::Sse128);
        }
    }
    let _ = (use_sse, use_avx);
    None
}

/// Evaluate inverse-distance-squared (no smoothing, no search) at
/// `(qx, qy)` with the selected kernel.
pub fn evaluate(kernel: SimdKernel, points: &SimdPoints, qx: f64, qy: f64, nodata: f64) -> f64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: `select_kernel` only hands out a kernel after the
        // matching feature check succeeded on this host.
        return match kernel {
            SimdKernel::Sse128 => unsafe {
                x86::invdist_p2_sse(points, qx as f32, qy as f32, nodata)
            },
            SimdKernel::Avx256 => unsafe {
                x86::invdist_p2_avx(points, qx as f32, qy as f32, nodata)
            },
        };
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = kernel;
        scalar_tail(points, 0, 0.0, 0.0, qx as f32, qy as f32, nodata)
    }
}

/// Finish (or fully perform) the evaluation in scalar f32 from sample
/// `start`, with vector partial sums already folded into `num`/`den`.
fn scalar_tail(
    points: &SimdPoints,
    start: usize,
    mut num: f32,
    mut den: f32,
    qx: f32,
    qy: f32,
    nodata: f64,
) -> f64 {
    let x = points.x.as_slice();
    let y = points.y.as_slice();
    let z = points.z.as_slice();
    for i in start..points.len {
        let rx = x[i] - qx;
        let ry = y[i] - qy;
        let r2 = rx * rx + ry * ry;
        if r2 < EPSILON {
            return z[i] as f64;
        }
        let inv_r2 = 1.0 / r2;
        num += inv_r2 * z[i];
        den += inv_r2;
    }
    if den == 0.0 {
        nodata
    } else {
        (num / den) as f64
    }
}

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::{scalar_tail, SimdPoints, EPSILON};
    use std::arch::x86_64::*;

    /// 128-bit kernel: 4 f32 lanes, unrolled twice (8 samples per
    /// iteration). The singular-point test is a per-lane compare whose
    /// movemask aborts the vector loop; the offending sample is then
    /// identified exactly by the scalar tail.
    ///
    /// # Safety
    /// Requires SSE at runtime and `points` buffers with 16-byte
    /// alignment (guaranteed by `AlignedF32`).
    #[target_feature(enable = "sse")]
    pub unsafe fn invdist_p2_sse(points: &SimdPoints, qx: f32, qy: f32, nodata: f64) -> f64 {
        const BLOCK: usize = 8;
        let x = points.x.as_slice();
        let y = points.y.as_slice();
        let z = points.z.as_slice();
        let rounded = points.len / BLOCK * BLOCK;

        let xmm_small = _mm_set1_ps(EPSILON);
        let xmm_qx = _mm_set1_ps(qx);
        let xmm_qy = _mm_set1_ps(qy);
        let mut xmm_num = _mm_setzero_ps();
        let mut xmm_den = _mm_setzero_ps();

        let mut i = 0;
        while i < rounded {
            let rx = _mm_sub_ps(_mm_load_ps(x.as_ptr().add(i)), xmm_qx);
            let rx_4 = _mm_sub_ps(_mm_load_ps(x.as_ptr().add(i + 4)), xmm_qx);
            let ry = _mm_sub_ps(_mm_load_ps(y.as_ptr().add(i)), xmm_qy);
            let ry_4 = _mm_sub_ps(_mm_load_ps(y.as_ptr().add(i + 4)), xmm_qy);
            let r2 = _mm_add_ps(_mm_mul_ps(rx, rx), _mm_mul_ps(ry, ry));
            let r2_4 = _mm_add_ps(_mm_mul_ps(rx_4, rx_4), _mm_mul_ps(ry_4, ry_4));
            let inv_r2 = _mm_rcp_ps(r2);
            let inv_r2_4 = _mm_rcp_ps(r2_4);
            xmm_num = _mm_add_ps(xmm_num, _mm_mul_ps(inv_r2, _mm_load_ps(z.as_ptr().add(i))));
            xmm_num = _mm_add_ps(xmm_num, _mm_mul_ps(inv_r2_4, _mm_load_ps(z.as_ptr().add(i + 4))));
            xmm_den = _mm_add_ps(xmm_den, inv_r2);
            xmm_den = _mm_add_ps(xmm_den, inv_r2_4);

            let mask = _mm_movemask_ps(_mm_cmplt_ps(r2, xmm_small))
                | (_mm_movemask_ps(_mm_cmplt_ps(r2_4, xmm_small)) << 4);
            if mask != 0 {
                // An exact hit somewhere in this block: let the scalar
                // code find it and short-circuit.
                return scalar_tail(points, i, 0.0, 0.0, qx, qy, nodata);
            }
            i += BLOCK;
        }

        let mut lanes_num = [0.0f32; 4];
        let mut lanes_den = [0.0f32; 4];
        _mm_storeu_ps(lanes_num.as_mut_ptr(), xmm_num);
        _mm_storeu_ps(lanes_den.as_mut_ptr(), xmm_den);
        let num = lanes_num.iter().sum::<f32>();
        let den = lanes_den.iter().sum::<f32>();

        scalar_tail(points, rounded, num, den, qx, qy, nodata)
    }

    /// 256-bit kernel: 8 f32 lanes, unrolled twice (16 samples per
    /// iteration). Same contract as the SSE kernel.
    ///
    /// # Safety
    /// Requires AVX at runtime and 32-byte-aligned buffers.
    #[target_feature(enable = "avx")]
    pub unsafe fn invdist_p2_avx(points: &SimdPoints, qx: f32, qy: f32, nodata: f64) -> f64 {
        const BLOCK: usize = 16;
        let x = points.x.as_slice();
        let y = points.y.as_slice();
        let z = points.z.as_slice();
        let rounded = points.len / BLOCK * BLOCK;

        let ymm_small = _mm256_set1_ps(EPSILON);
        let ymm_qx = _mm256_set1_ps(qx);
        let ymm_qy = _mm256_set1_ps(qy);
        let mut ymm_num = _mm256_setzero_ps();
        let mut ymm_den = _mm256_setzero_ps();

        let mut i = 0;
        while i < rounded {
            let rx = _mm256_sub_ps(_mm256_load_ps(x.as_ptr().add(i)), ymm_qx);
            let rx_8 = _mm256_sub_ps(_mm256_load_ps(x.as_ptr().add(i + 8)), ymm_qx);
            let ry = _mm256_sub_ps(_mm256_load_ps(y.as_ptr().add(i)), ymm_qy);
            let ry_8 = _mm256_sub_ps(_mm256_load_ps(y.as_ptr().add(i + 8)), ymm_qy);
            let r2 = _mm256_add_ps(_mm256_mul_ps(rx, rx), _mm256_mul_ps(ry, ry));
            let r2_8 = _mm256_add_ps(_mm256_mul_ps(rx_8, rx_8), _mm256_mul_ps(ry_8, ry_8));
            let inv_r2 = _mm256_rcp_ps(r2);
            let inv_r2_8 = _mm256_rcp_ps(r2_8);
            ymm_num =
                _mm256_add_ps(ymm_num, _mm256_mul_ps(inv_r2, _mm256_load_ps(z.as_ptr().add(i))));
            ymm_num = _mm256_add_ps(
                ymm_num,
                _mm256_mul_ps(inv_r2_8, _mm256_load_ps(z.as_ptr().add(i + 8))),
            );
            ymm_den = _mm256_add_ps(ymm_den, inv_r2);
            ymm_den = _mm256_add_ps(ymm_den, inv_r2_8);

            let mask = _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_LT_OQ>(r2, ymm_small))
                | (_mm256_movemask_ps(_mm256_cmp_ps::<_CMP_LT_OQ>(r2_8, ymm_small)) << 8);
            if mask != 0 {
                return scalar_tail(points, i, 0.0, 0.0, qx, qy, nodata);
            }
            i += BLOCK;
        }

        let mut lanes_num = [0.0f32; 8];
        let mut lanes_den = [0.0f32; 8];
        _mm256_storeu_ps(lanes_num.as_mut_ptr(), ymm_num);
        _mm256_storeu_ps(lanes_den.as_mut_ptr(), ymm_den);
        let num = lanes_num.iter().sum::<f32>();
        let den = lanes_den.iter().sum::<f32>();

        scalar_tail(points, rounded, num, den, qx, qy, nodata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn scalar_reference(x: &[f64], y: &[f64], z: &[f64], qx: f64, qy: f64, nodata: f64) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        for i in 0..x.len() {
            let rx = x[i] - qx;
            let ry = y[i] - qy;
            let r2 = rx * rx + ry * ry;
            if r2 < 1e-13 {
                return z[i];
            }
            num += z[i] / r2;
            den += 1.0 / r2;
        }
        if den == 0.0 {
            nodata
        } else {
            num / den
        }
    }

    fn kernels_to_test() -> Vec<SimdKernel> {
        let mut out = Vec::new();
        if let Some(k) = select_kernel(true, true) {
            out.push(k);
        }
        if let Some(k) = select_kernel(true, false) {
            if !out.contains(&k) {
                out.push(k);
            }
        }
        out
    }

    #[test]
    fn matches_scalar_within_f32_tolerance() {
        let mut rng = StdRng::seed_from_u64(0x51_3d);
        let n = 137; // deliberately not a multiple of any block size
        let x: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..100.0)).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..100.0)).collect();
        let z: Vec<f64> = (0..n).map(|_| rng.gen_range(-50.0..50.0)).collect();
        let points = SimdPoints::new(&x, &y, &z).unwrap();

        for kernel in kernels_to_test() {
            for _ in 0..50 {
                let qx = rng.gen_range(0.0..100.0);
                let qy = rng.gen_range(0.0..100.0);
                let got = evaluate(kernel, &points, qx, qy, f64::NAN);
                let want = scalar_reference(&x, &y, &z, qx, qy, f64::NAN);
                let tol = 1e-3 * want.abs().max(1.0);
                assert!(
                    (got - want).abs() < tol,
                    "{kernel:?} at ({qx}, {qy}): got {got}, want {want}"
                );
            }
        }
    }

    #[test]
    fn exact_hit_returns_the_sample() {
        let x: Vec<f64> = (0..40).map(|i| i as f64).collect();
        let y = vec![0.0; 40];
        let z: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let points = SimdPoints::new(&x, &y, &z).unwrap();
        for kernel in kernels_to_test() {
            // Hit inside the vector body and in the scalar remainder.
            assert_eq!(evaluate(kernel, &points, 5.0, 0.0, 0.0), 105.0);
            assert_eq!(evaluate(kernel, &points, 39.0, 0.0, 0.0), 139.0);
        }
    }

    #[test]
    fn empty_point_set_is_nodata() {
        let points = SimdPoints::new(&[], &[], &[]).unwrap();
        for kernel in kernels_to_test() {
            assert_eq!(evaluate(kernel, &points, 1.0, 2.0, -9.0), -9.0);
        }
    }

    #[test]
    fn padding_repeats_the_last_sample() {
        let x = vec![1.0, 2.0, 3.0];
        let buf = AlignedF32::from_f64(&x).unwrap();
        let s = buf.as_slice();
        assert_eq!(s.len() % MAX_BLOCK, 0);
        assert_eq!(&s[..3], &[1.0f32, 2.0, 3.0]);
        assert!(s[3..].iter().all(|&v| v == 3.0));
    }
}
