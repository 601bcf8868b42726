//! Block quantization codecs and the kernels that consume them
//!
//! Implements the container's quantized payload formats. All formats
//! store values in blocks of 32 with little-endian f32 block constants:
//!
//! - `Q4_0`: 20 bytes/block: f32 scale + 16 bytes of 4-bit values
//! - `Q4_1`: 24 bytes/block: f32 scale + f32 min + 16 bytes
//! - `Q5_0`: 24 bytes/block: f32 scale + u32 high bits + 16 bytes
//! - `Q5_1`: 28 bytes/block: f32 scale + f32 min + u32 high bits + 16 bytes
//! - `Q8_0`: 36 bytes/block: f32 scale + 32 int8 values
//!
//! Nibble packing puts values 0..16 of a block in the low nibbles of the
//! 16 data bytes and values 16..32 in the high nibbles.
//!
//! The mat-vec kernels here decode one block at a time into a stack
//! buffer, so evaluation needs no heap and no shared workspace.

use once_cell::sync::Lazy;

use crate::error::{Result, RwkvError};
use crate::tensor::ElementType;

/// Values per quantization block
pub const QK: usize = 32;

/// Bins in the quantization histogram
pub const HISTOGRAM_BINS: usize = 16;

/// Pre-computed f16 to f32 lookup table (65536 entries, 256 KiB).
///
/// Eliminates per-value conversion overhead in row decode and dot
/// kernels. Initialized once on first access, immutable thereafter.
static F16_TO_F32_LUT: Lazy<Box<[f32; 65536]>> = Lazy::new(|| {
    let mut lut = Box::new([0.0f32; 65536]);
    for (i, slot) in lut.iter_mut().enumerate() {
        *slot = half::f16::from_bits(i as u16).to_f32();
    }
    lut
});

/// Fast f16 (raw little-endian bits) to f32 conversion via the LUT
#[inline]
#[must_use]
pub fn f16_to_f32(bits: u16) -> f32 {
    F16_TO_F32_LUT[bits as usize]
}

/// Decode a row of little-endian f16 values into f32
pub fn f16_row_to_f32(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len() * 2);
    for (out, pair) in dst.iter_mut().zip(src.chunks_exact(2)) {
        *out = f16_to_f32(u16::from_le_bytes([pair[0], pair[1]]));
    }
}

/// Decode a row of little-endian f32 values
pub fn f32_row_from_le(src: &[u8], dst: &mut [f32]) {
    debug_assert_eq!(src.len(), dst.len() * 4);
    for (out, quad) in dst.iter_mut().zip(src.chunks_exact(4)) {
        *out = f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]);
    }
}

#[inline]
fn unpack_nibbles(data: &[u8], out: &mut [i32; QK]) {
    for (j, &byte) in data[..QK / 2].iter().enumerate() {
        out[j] = i32::from(byte & 0x0F);
        out[j + QK / 2] = i32::from(byte >> 4);
    }
}

#[inline]
fn pack_nibbles(vals: &[u8; QK], out: &mut [u8]) {
    for (j, slot) in out[..QK / 2].iter_mut().enumerate() {
        *slot = vals[j] | (vals[j + QK / 2] << 4);
    }
}

fn quantize_block_q4_0(src: &[f32], dst: &mut [u8], hist: &mut [i64; HISTOGRAM_BINS]) {
    let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
    let d = if amax > 0.0 { amax / 7.0 } else { 1.0 };
    let id = 1.0 / d;

    dst[0..4].copy_from_slice(&d.to_le_bytes());

    let mut quants = [0u8; QK];
    for (q, &v) in quants.iter_mut().zip(src) {
        let qi = ((v * id).round() as i32 + 8).clamp(0, 15);
        *q = qi as u8;
        hist[qi as usize] += 1;
    }
    pack_nibbles(&quants, &mut dst[4..20]);
}

fn dequantize_block_q4_0(src: &[u8], dst: &mut [f32]) {
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    let mut quants = [0i32; QK];
    unpack_nibbles(&src[4..20], &mut quants);
    for (out, q) in dst.iter_mut().zip(quants) {
        *out = (q - 8) as f32 * d;
    }
}

fn quantize_block_q4_1(src: &[f32], dst: &mut [u8], hist: &mut [i64; HISTOGRAM_BINS]) {
    let min = src.iter().copied().fold(f32::INFINITY, f32::min);
    let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let d = if max > min { (max - min) / 15.0 } else { 1.0 };
    let id = 1.0 / d;

    dst[0..4].copy_from_slice(&d.to_le_bytes());
    dst[4..8].copy_from_slice(&min.to_le_bytes());

    let mut quants = [0u8; QK];
    for (q, &v) in quants.iter_mut().zip(src) {
        let qi = (((v - min) * id).round() as i32).clamp(0, 15);
        *q = qi as u8;
        hist[qi as usize] += 1;
    }
    pack_nibbles(&quants, &mut dst[8..24]);
}

fn dequantize_block_q4_1(src: &[u8], dst: &mut [f32]) {
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    let min = f32::from_le_bytes([src[4], src[5], src[6], src[7]]);
    let mut quants = [0i32; QK];
    unpack_nibbles(&src[8..24], &mut quants);
    for (out, q) in dst.iter_mut().zip(quants) {
        *out = q as f32 * d + min;
    }
}

fn quantize_block_q5_0(src: &[f32], dst: &mut [u8], hist: &mut [i64; HISTOGRAM_BINS]) {
    let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
    let d = if amax > 0.0 { amax / 15.0 } else { 1.0 };
    let id = 1.0 / d;

    dst[0..4].copy_from_slice(&d.to_le_bytes());

    let mut quants = [0u8; QK];
    let mut qh = 0u32;
    for (j, (q, &v)) in quants.iter_mut().zip(src).enumerate() {
        let qi = ((v * id).round() as i32 + 16).clamp(0, 31);
        *q = (qi & 0x0F) as u8;
        qh |= u32::from(qi >= 16) << j;
        hist[(qi >> 1) as usize] += 1;
    }
    dst[4..8].copy_from_slice(&qh.to_le_bytes());
    pack_nibbles(&quants, &mut dst[8..24]);
}

fn dequantize_block_q5_0(src: &[u8], dst: &mut [f32]) {
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    let qh = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
    let mut quants = [0i32; QK];
    unpack_nibbles(&src[8..24], &mut quants);
    for (j, (out, q)) in dst.iter_mut().zip(quants).enumerate() {
        let q5 = q | (((qh >> j) & 1) as i32) << 4;
        *out = (q5 - 16) as f32 * d;
    }
}

fn quantize_block_q5_1(src: &[f32], dst: &mut [u8], hist: &mut [i64; HISTOGRAM_BINS]) {
    let min = src.iter().copied().fold(f32::INFINITY, f32::min);
    let max = src.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let d = if max > min { (max - min) / 31.0 } else { 1.0 };
    let id = 1.0 / d;

    dst[0..4].copy_from_slice(&d.to_le_bytes());
    dst[4..8].copy_from_slice(&min.to_le_bytes());

    let mut quants = [0u8; QK];
    let mut qh = 0u32;
    for (j, (q, &v)) in quants.iter_mut().zip(src).enumerate() {
        let qi = (((v - min) * id).round() as i32).clamp(0, 31);
        *q = (qi & 0x0F) as u8;
        qh |= u32::from(qi >= 16) << j;
        hist[(qi >> 1) as usize] += 1;
    }
    dst[8..12].copy_from_slice(&qh.to_le_bytes());
    pack_nibbles(&quants, &mut dst[12..28]);
}

fn dequantize_block_q5_1(src: &[u8], dst: &mut [f32]) {
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    let min = f32::from_le_bytes([src[4], src[5], src[6], src[7]]);
    let qh = u32::from_le_bytes([src[8], src[9], src[10], src[11]]);
    let mut quants = [0i32; QK];
    unpack_nibbles(&src[12..28], &mut quants);
    for (j, (out, q)) in dst.iter_mut().zip(quants).enumerate() {
        let q5 = q | (((qh >> j) & 1) as i32) << 4;
        *out = q5 as f32 * d + min;
    }
}

fn quantize_block_q8_0(src: &[f32], dst: &mut [u8], hist: &mut [i64; HISTOGRAM_BINS]) {
    let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
    let d = if amax > 0.0 { amax / 127.0 } else { 1.0 };
    let id = 1.0 / d;

    dst[0..4].copy_from_slice(&d.to_le_bytes());
    for (out, &v) in dst[4..36].iter_mut().zip(src) {
        let qi = ((v * id).round() as i32).clamp(-128, 127);
        *out = qi as i8 as u8;
        hist[((qi + 128) >> 4) as usize] += 1;
    }
}

fn dequantize_block_q8_0(src: &[u8], dst: &mut [f32]) {
    let d = f32::from_le_bytes([src[0], src[1], src[2], src[3]]);
    for (out, &b) in dst.iter_mut().zip(&src[4..36]) {
        *out = f32::from(b as i8) * d;
    }
}

type QuantizeBlockFn = fn(&[f32], &mut [u8], &mut [i64; HISTOGRAM_BINS]);
type DequantizeBlockFn = fn(&[u8], &mut [f32]);

fn block_codec(ty: ElementType) -> (QuantizeBlockFn, DequantizeBlockFn) {
    match ty {
        ElementType::Q4_0 => (quantize_block_q4_0, dequantize_block_q4_0),
        ElementType::Q4_1 => (quantize_block_q4_1, dequantize_block_q4_1),
        ElementType::Q5_0 => (quantize_block_q5_0, dequantize_block_q5_0),
        ElementType::Q5_1 => (quantize_block_q5_1, dequantize_block_q5_1),
        ElementType::Q8_0 => (quantize_block_q8_0, dequantize_block_q8_0),
        ElementType::F32 | ElementType::F16 => {
            unreachable!("float types have no block codec")
        },
    }
}

/// Quantize `src` into `dst` blockwise, accumulating a histogram of the
/// quantized values. Returns the number of bytes written.
///
/// # Errors
///
/// Returns `Data` if `ty` is not a block format, `src.len()` is not a
/// multiple of [`QK`], or `dst` is smaller than the quantized size.
pub fn quantize_chunk(
    ty: ElementType,
    src: &[f32],
    dst: &mut [u8],
    hist: &mut [i64; HISTOGRAM_BINS],
) -> Result<usize> {
    if !ty.is_quantized() {
        return Err(RwkvError::Data {
            message: "quantization target must be a block format".to_string(),
        });
    }
    if src.len() % QK != 0 {
        return Err(RwkvError::Data {
            message: format!(
                "quantization requires a multiple of {QK} values, got {}",
                src.len()
            ),
        });
    }

    let block_bytes = ty.type_size();
    let total = (src.len() / QK) * block_bytes;
    if dst.len() < total {
        return Err(RwkvError::Data {
            message: format!("quantization needs {total} output bytes, got {}", dst.len()),
        });
    }

    let (quantize, _) = block_codec(ty);
    for (block, out) in src.chunks_exact(QK).zip(dst.chunks_exact_mut(block_bytes)) {
        quantize(block, out, hist);
    }
    Ok(total)
}

/// Decode one row of `dst.len()` values from its stored representation.
///
/// # Panics
///
/// Panics when `src` is not exactly the row's stored size; row sizing is
/// validated when shapes are accepted from a file.
pub fn dequantize_row(ty: ElementType, src: &[u8], dst: &mut [f32]) {
    match ty {
        ElementType::F32 => f32_row_from_le(src, dst),
        ElementType::F16 => f16_row_to_f32(src, dst),
        _ => {
            let block_bytes = ty.type_size();
            assert_eq!(src.len(), (dst.len() / QK) * block_bytes);
            let (_, dequantize) = block_codec(ty);
            for (block, out) in src.chunks_exact(block_bytes).zip(dst.chunks_exact_mut(QK)) {
                dequantize(block, out);
            }
        },
    }
}

/// Dot product of one stored row with an f32 vector.
///
/// Quantized rows are decoded block-by-block into a stack buffer; this
/// is the point where stored precision meets the f32 compute path.
#[must_use]
pub fn vec_dot(ty: ElementType, row: &[u8], x: &[f32]) -> f32 {
    match ty {
        ElementType::F32 => row
            .chunks_exact(4)
            .zip(x)
            .map(|(quad, &v)| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]) * v)
            .sum(),
        ElementType::F16 => row
            .chunks_exact(2)
            .zip(x)
            .map(|(pair, &v)| f16_to_f32(u16::from_le_bytes([pair[0], pair[1]])) * v)
            .sum(),
        _ => {
            let block_bytes = ty.type_size();
            let (_, dequantize) = block_codec(ty);
            let mut decoded = [0.0f32; QK];
            let mut sum = 0.0f32;
            for (block, xs) in row.chunks_exact(block_bytes).zip(x.chunks_exact(QK)) {
                dequantize(block, &mut decoded);
                for (d, &v) in decoded.iter().zip(xs) {
                    sum += d * v;
                }
            }
            sum
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32 - 16.0) * 0.25).collect()
    }

    fn roundtrip(ty: ElementType, src: &[f32]) -> Vec<f32> {
        let mut hist = [0i64; HISTOGRAM_BINS];
        let mut bytes = vec![0u8; (src.len() / QK) * ty.type_size()];
        let written = quantize_chunk(ty, src, &mut bytes, &mut hist).unwrap();
        assert_eq!(written, bytes.len());

        let mut out = vec![0.0f32; src.len()];
        dequantize_row(ty, &bytes, &mut out);
        out
    }

    #[test]
    fn test_q8_0_roundtrip_accuracy() {
        let src = ramp(64);
        let out = roundtrip(ElementType::Q8_0, &src);
        let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        for (a, b) in src.iter().zip(&out) {
            assert!((a - b).abs() <= amax / 127.0, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_0_roundtrip_bounded() {
        let src = ramp(32);
        let out = roundtrip(ElementType::Q4_0, &src);
        let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
        for (a, b) in src.iter().zip(&out) {
            // one quantization step of headroom
            assert!((a - b).abs() <= amax / 7.0 + 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q4_1_exact_on_linear_ramp() {
        // A 16-level ramp is exactly representable with scale+min.
        let src: Vec<f32> = (0..32).map(|i| (i % 16) as f32 * 0.5 - 2.0).collect();
        let out = roundtrip(ElementType::Q4_1, &src);
        for (a, b) in src.iter().zip(&out) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn test_q5_0_and_q5_1_roundtrip_bounded() {
        let src = ramp(96);
        for ty in [ElementType::Q5_0, ElementType::Q5_1] {
            let out = roundtrip(ty, &src);
            let amax = src.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            for (a, b) in src.iter().zip(&out) {
                assert!((a - b).abs() <= amax / 15.0 + 1e-6, "{ty:?}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn test_histogram_counts_every_value() {
        let src = ramp(128);
        let mut hist = [0i64; HISTOGRAM_BINS];
        let mut bytes = vec![0u8; (src.len() / QK) * ElementType::Q4_0.type_size()];
        quantize_chunk(ElementType::Q4_0, &src, &mut bytes, &mut hist).unwrap();
        assert_eq!(hist.iter().sum::<i64>(), 128);
    }

    #[test]
    fn test_partial_block_rejected() {
        let src = ramp(33);
        let mut hist = [0i64; HISTOGRAM_BINS];
        let mut bytes = vec![0u8; 64];
        let result = quantize_chunk(ElementType::Q8_0, &src, &mut bytes, &mut hist);
        assert!(matches!(result, Err(RwkvError::Data { .. })));
    }

    #[test]
    fn test_float_target_rejected() {
        let src = ramp(32);
        let mut hist = [0i64; HISTOGRAM_BINS];
        let mut bytes = vec![0u8; 128];
        let result = quantize_chunk(ElementType::F16, &src, &mut bytes, &mut hist);
        assert!(matches!(result, Err(RwkvError::Data { .. })));
    }

    #[test]
    fn test_vec_dot_matches_dequantized_dot() {
        let src = ramp(64);
        let x: Vec<f32> = (0..64).map(|i| ((i * 7) % 13) as f32 * 0.1 - 0.6).collect();

        for ty in [
            ElementType::Q4_0,
            ElementType::Q4_1,
            ElementType::Q5_0,
            ElementType::Q5_1,
            ElementType::Q8_0,
        ] {
            let mut hist = [0i64; HISTOGRAM_BINS];
            let mut bytes = vec![0u8; (src.len() / QK) * ty.type_size()];
            quantize_chunk(ty, &src, &mut bytes, &mut hist).unwrap();

            let mut decoded = vec![0.0f32; src.len()];
            dequantize_row(ty, &bytes, &mut decoded);
            let expected: f32 = decoded.iter().zip(&x).map(|(a, b)| a * b).sum();

            let got = vec_dot(ty, &bytes, &x);
            assert!((got - expected).abs() < 1e-4, "{ty:?}: {got} vs {expected}");
        }
    }

    #[test]
    fn test_f32_and_f16_rows() {
        let values = [1.5f32, -2.25, 0.0, 100.0];

        let le: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = [0.0f32; 4];
        dequantize_row(ElementType::F32, &le, &mut out);
        assert_eq!(out, values);

        let halves: Vec<u8> = values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect();
        dequantize_row(ElementType::F16, &halves, &mut out);
        assert_eq!(out, values); // all four are exactly representable

        let x = [0.5f32, 1.0, 2.0, -1.0];
        let expected: f32 = values.iter().zip(&x).map(|(a, b)| a * b).sum();
        assert!((vec_dot(ElementType::F32, &le, &x) - expected).abs() < 1e-6);
        assert!((vec_dot(ElementType::F16, &halves, &x) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_f16_lut_matches_half() {
        for bits in [0u16, 1, 0x3C00, 0x7BFF, 0x8000, 0xFBFF] {
            let expected = half::f16::from_bits(bits).to_f32();
            let got = f16_to_f32(bits);
            assert!(got == expected || (got.is_nan() && expected.is_nan()));
        }
    }

    proptest! {
        #[test]
        fn prop_q8_0_error_within_one_step(values in prop::collection::vec(-100.0f32..100.0, QK)) {
            let out = roundtrip(ElementType::Q8_0, &values);
            let amax = values.iter().map(|v| v.abs()).fold(0.0f32, f32::max);
            let step = if amax > 0.0 { amax / 127.0 } else { 1.0 };
            for (a, b) in values.iter().zip(&out) {
                prop_assert!((a - b).abs() <= step * 0.5 + 1e-6);
            }
        }
    }
}
