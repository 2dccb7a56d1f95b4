//! Distance metrics and element-type kernels.
//!
//! The index is parametric in its element type. Kernel selection happens
//! statically through the [`Element`] trait so that integral and float data
//! never share a dynamic dispatch point on the hot path.

use tracing::warn;

/// Distance metric for index construction and search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Metric {
    /// Squared Euclidean distance.
    L2,
    /// Cosine distance; both sides are expected pre-normalized, so this
    /// reduces to L2 at search time.
    Cosine,
    /// Maximum inner product, lifted to L2 by an extra coordinate on the
    /// base side. Output distances are negated and rescaled.
    InnerProduct,
}

impl Metric {
    /// The metric actually evaluated by the kernels at search time.
    ///
    /// Float data for cosine/MIPS is pre-processed at build time
    /// (normalization, extra-coordinate lift), so the kernel is plain L2.
    /// Integral data cannot be normalized; fall back to L2 with a warning.
    pub fn resolve<T: Element>(self) -> Metric {
        match self {
            Metric::L2 => Metric::L2,
            Metric::Cosine | Metric::InnerProduct => {
                if T::IS_FLOAT {
                    Metric::L2
                } else {
                    warn!(
                        "cannot normalize integral data; falling back to L2 \
                         which may hurt recall"
                    );
                    Metric::L2
                }
            }
        }
    }
}

/// Element type stored on disk: `f32`, `i8` or `u8`.
pub trait Element: Copy + Default + Send + Sync + 'static {
    /// True for floating-point elements.
    const IS_FLOAT: bool;

    /// Width of one element on disk, in bytes.
    const WIDTH: usize;

    fn to_f32(self) -> f32;
    fn from_f32(v: f32) -> Self;

    /// Decode a little-endian byte run into `out`. `bytes` must hold at
    /// least `out.len() * WIDTH` bytes.
    fn decode_slice(bytes: &[u8], out: &mut [Self]);
}

impl Element for f32 {
    const IS_FLOAT: bool = true;
    const WIDTH: usize = 4;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v
    }

    fn decode_slice(bytes: &[u8], out: &mut [Self]) {
        for (i, v) in out.iter_mut().enumerate() {
            let b = &bytes[i * 4..i * 4 + 4];
            *v = f32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        }
    }
}

impl Element for i8 {
    const IS_FLOAT: bool = false;
    const WIDTH: usize = 1;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as i8
    }

    fn decode_slice(bytes: &[u8], out: &mut [Self]) {
        for (i, v) in out.iter_mut().enumerate() {
            *v = bytes[i] as i8;
        }
    }
}

impl Element for u8 {
    const IS_FLOAT: bool = false;
    const WIDTH: usize = 1;

    #[inline]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline]
    fn from_f32(v: f32) -> Self {
        v as u8
    }

    fn decode_slice(bytes: &[u8], out: &mut [Self]) {
        out.copy_from_slice(&bytes[..out.len()]);
    }
}

/// Squared L2 distance over element slices of equal length.
///
/// Four-lane accumulation; the tail is handled scalar. Lengths here are the
/// aligned dimension, which is a multiple of 8, so the tail loop is usually
/// empty.
#[inline]
#[must_use]
pub fn l2_squared<T: Element>(a: &[T], b: &[T]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for c in 0..chunks {
        for lane in 0..4 {
            let i = c * 4 + lane;
            let d = a[i].to_f32() - b[i].to_f32();
            acc[lane] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        let d = a[i].to_f32() - b[i].to_f32();
        sum += d * d;
    }
    sum
}

/// Dot product over f32 slices.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for c in 0..chunks {
        for lane in 0..4 {
            let i = c * 4 + lane;
            acc[lane] += a[i] * b[i];
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// L2 norm of a float vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Squared L2 distance over float slices.
#[inline]
#[must_use]
pub fn l2_squared_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let chunks = a.len() / 4;
    for c in 0..chunks {
        for lane in 0..4 {
            let i = c * 4 + lane;
            let d = a[i] - b[i];
            acc[lane] += d * d;
        }
    }
    let mut sum = acc[0] + acc[1] + acc[2] + acc[3];
    for i in chunks * 4..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}
