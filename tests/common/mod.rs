//! Shared fixture: a deterministic tiny RWKV model file.
//!
//! The fixture is written through the crate's own format writers and is
//! stable across platforms: weights come from an explicit xorshift
//! generator, so every test sees byte-identical files.

// Each integration test crate compiles its own copy; not every test
// uses every helper.
#![allow(dead_code)]

use std::path::Path;

use recurrir::format::{FileHeader, FileType, TensorHeader, FILE_MAGIC, FILE_VERSION};

pub const N_VOCAB: u32 = 256;
pub const N_EMBED: u32 = 32;
pub const N_LAYER: u32 = 2;
pub const FFN_HIDDEN: u32 = 128;

/// The prompt evaluated byte-by-byte in the end-to-end scenarios.
#[allow(dead_code)]
pub const PROMPT: &str = "Describe the structure of an atom.";

struct Rng(u32);

impl Rng {
    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }

    /// Uniform in [lo, hi)
    fn uniform(&mut self, lo: f32, hi: f32) -> f32 {
        let unit = (self.next_u32() >> 8) as f32 / 16_777_216.0;
        lo + unit * (hi - lo)
    }

    fn fill(&mut self, n: usize, lo: f32, hi: f32) -> Vec<f32> {
        (0..n).map(|_| self.uniform(lo, hi)).collect()
    }
}

fn write_record(out: &mut Vec<u8>, key: &str, dims: (u32, u32), dim_count: u32, ty: FileType, values: &[f32]) {
    let header = TensorHeader {
        dim_count,
        key_length: key.len() as u32,
        data_type: ty,
        width: dims.0,
        height: dims.1,
    };
    header.write(out).unwrap();
    out.extend_from_slice(key.as_bytes());
    match ty {
        FileType::F16 => {
            for &v in values {
                out.extend_from_slice(&half::f16::from_f32(v).to_le_bytes());
            }
        },
        _ => {
            for &v in values {
                out.extend_from_slice(&v.to_le_bytes());
            }
        },
    }
}

/// Serialize the tiny model with its 2-D matrices in `matrix_type`
/// (f32 or f16); 1-D tensors are always f32. Records whose key is in
/// `skip` are omitted, which lets tests fabricate incomplete files.
pub fn tiny_model_bytes_without(matrix_type: FileType, skip: &[&str]) -> Vec<u8> {
    let mut rng = Rng(0x2A6B_315D);
    let mut out = Vec::new();

    FileHeader {
        magic: FILE_MAGIC,
        version: FILE_VERSION,
        n_vocab: N_VOCAB,
        n_embed: N_EMBED,
        n_layer: N_LAYER,
        data_type: matrix_type,
    }
    .write(&mut out)
    .unwrap();

    let embed = N_EMBED as usize;
    let vocab = N_VOCAB as usize;
    let hidden = FFN_HIDDEN as usize;

    let matrix = |out: &mut Vec<u8>, rng: &mut Rng, key: &str, w: usize, h: usize| {
        if !skip.contains(&key) {
            let values = rng.fill(w * h, -0.15, 0.15);
            write_record(out, key, (w as u32, h as u32), 2, matrix_type, &values);
        } else {
            // keep the stream deterministic past the gap
            let _ = rng.fill(w * h, -0.15, 0.15);
        }
    };
    let vector = |out: &mut Vec<u8>, rng: &mut Rng, key: &str, lo: f32, hi: f32| {
        if !skip.contains(&key) {
            let values = rng.fill(embed, lo, hi);
            write_record(out, key, (N_EMBED, 1), 1, FileType::F32, &values);
        } else {
            let _ = rng.fill(embed, lo, hi);
        }
    };

    matrix(&mut out, &mut rng, "emb.weight", embed, vocab);
    vector(&mut out, &mut rng, "blocks.0.ln0.weight", 0.9, 1.1);
    vector(&mut out, &mut rng, "blocks.0.ln0.bias", -0.05, 0.05);

    for i in 0..N_LAYER {
        let key = |suffix: &str| format!("blocks.{i}.{suffix}");

        vector(&mut out, &mut rng, &key("ln1.weight"), 0.9, 1.1);
        vector(&mut out, &mut rng, &key("ln1.bias"), -0.05, 0.05);
        vector(&mut out, &mut rng, &key("att.time_mix_k"), 0.2, 0.8);
        vector(&mut out, &mut rng, &key("att.time_mix_v"), 0.2, 0.8);
        vector(&mut out, &mut rng, &key("att.time_mix_r"), 0.2, 0.8);
        vector(&mut out, &mut rng, &key("att.time_first"), -0.3, 0.3);
        vector(&mut out, &mut rng, &key("att.time_decay"), -3.0, -0.5);
        matrix(&mut out, &mut rng, &key("att.key.weight"), embed, embed);
        matrix(&mut out, &mut rng, &key("att.value.weight"), embed, embed);
        matrix(&mut out, &mut rng, &key("att.receptance.weight"), embed, embed);
        matrix(&mut out, &mut rng, &key("att.output.weight"), embed, embed);
        vector(&mut out, &mut rng, &key("ln2.weight"), 0.9, 1.1);
        vector(&mut out, &mut rng, &key("ln2.bias"), -0.05, 0.05);
        vector(&mut out, &mut rng, &key("ffn.time_mix_k"), 0.2, 0.8);
        vector(&mut out, &mut rng, &key("ffn.time_mix_r"), 0.2, 0.8);
        matrix(&mut out, &mut rng, &key("ffn.key.weight"), embed, hidden);
        matrix(&mut out, &mut rng, &key("ffn.value.weight"), hidden, embed);
        matrix(&mut out, &mut rng, &key("ffn.receptance.weight"), embed, embed);
    }

    vector(&mut out, &mut rng, "ln_out.weight", 0.9, 1.1);
    vector(&mut out, &mut rng, "ln_out.bias", -0.05, 0.05);
    matrix(&mut out, &mut rng, "head.weight", embed, vocab);

    out
}

pub fn tiny_model_bytes(matrix_type: FileType) -> Vec<u8> {
    tiny_model_bytes_without(matrix_type, &[])
}

#[allow(dead_code)]
pub fn write_tiny_model(path: &Path, matrix_type: FileType) {
    std::fs::write(path, tiny_model_bytes(matrix_type)).unwrap();
}
