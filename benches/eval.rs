//! Single-step evaluation and quantizer throughput on a synthetic tiny
//! model.

use std::path::Path;

use criterion::{criterion_group, criterion_main, Criterion};

use recurrir::format::{FileHeader, FileType, TensorHeader, FILE_MAGIC, FILE_VERSION};
use recurrir::RwkvContext;

const N_VOCAB: u32 = 256;
const N_EMBED: u32 = 32;
const N_LAYER: u32 = 2;
const FFN_HIDDEN: u32 = 128;

struct Rng(u32);

impl Rng {
    fn uniform(&mut self, lo: f32, hi: f32) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        lo + ((x >> 8) as f32 / 16_777_216.0) * (hi - lo)
    }
}

fn record(out: &mut Vec<u8>, rng: &mut Rng, key: &str, dims: (u32, u32), lo: f32, hi: f32) {
    let dim_count = if dims.1 > 1 { 2 } else { 1 };
    TensorHeader {
        dim_count,
        key_length: key.len() as u32,
        data_type: FileType::F32,
        width: dims.0,
        height: dims.1,
    }
    .write(out)
    .unwrap();
    out.extend_from_slice(key.as_bytes());
    for _ in 0..dims.0 * dims.1 {
        out.extend_from_slice(&rng.uniform(lo, hi).to_le_bytes());
    }
}

fn write_model(path: &Path) {
    let mut rng = Rng(0x2A6B_315D);
    let mut out = Vec::new();
    FileHeader {
        magic: FILE_MAGIC,
        version: FILE_VERSION,
        n_vocab: N_VOCAB,
        n_embed: N_EMBED,
        n_layer: N_LAYER,
        data_type: FileType::F32,
    }
    .write(&mut out)
    .unwrap();

    record(&mut out, &mut rng, "emb.weight", (N_EMBED, N_VOCAB), -0.15, 0.15);
    record(&mut out, &mut rng, "blocks.0.ln0.weight", (N_EMBED, 1), 0.9, 1.1);
    record(&mut out, &mut rng, "blocks.0.ln0.bias", (N_EMBED, 1), -0.05, 0.05);
    for i in 0..N_LAYER {
        let key = |s: &str| format!("blocks.{i}.{s}");
        record(&mut out, &mut rng, &key("ln1.weight"), (N_EMBED, 1), 0.9, 1.1);
        record(&mut out, &mut rng, &key("ln1.bias"), (N_EMBED, 1), -0.05, 0.05);
        for mix in ["att.time_mix_k", "att.time_mix_v", "att.time_mix_r"] {
            record(&mut out, &mut rng, &key(mix), (N_EMBED, 1), 0.2, 0.8);
        }
        record(&mut out, &mut rng, &key("att.time_first"), (N_EMBED, 1), -0.3, 0.3);
        record(&mut out, &mut rng, &key("att.time_decay"), (N_EMBED, 1), -3.0, -0.5);
        for w in ["att.key.weight", "att.value.weight", "att.receptance.weight", "att.output.weight"] {
            record(&mut out, &mut rng, &key(w), (N_EMBED, N_EMBED), -0.15, 0.15);
        }
        record(&mut out, &mut rng, &key("ln2.weight"), (N_EMBED, 1), 0.9, 1.1);
        record(&mut out, &mut rng, &key("ln2.bias"), (N_EMBED, 1), -0.05, 0.05);
        record(&mut out, &mut rng, &key("ffn.time_mix_k"), (N_EMBED, 1), 0.2, 0.8);
        record(&mut out, &mut rng, &key("ffn.time_mix_r"), (N_EMBED, 1), 0.2, 0.8);
        record(&mut out, &mut rng, &key("ffn.key.weight"), (N_EMBED, FFN_HIDDEN), -0.15, 0.15);
        record(&mut out, &mut rng, &key("ffn.value.weight"), (FFN_HIDDEN, N_EMBED), -0.15, 0.15);
        record(&mut out, &mut rng, &key("ffn.receptance.weight"), (N_EMBED, N_EMBED), -0.15, 0.15);
    }
    record(&mut out, &mut rng, "ln_out.weight", (N_EMBED, 1), 0.9, 1.1);
    record(&mut out, &mut rng, "ln_out.bias", (N_EMBED, 1), -0.05, 0.05);
    record(&mut out, &mut rng, "head.weight", (N_EMBED, N_VOCAB), -0.15, 0.15);

    std::fs::write(path, out).unwrap();
}

fn bench_eval(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let model_path = dir.path().join("bench.bin");
    write_model(&model_path);

    recurrir::set_print_errors(None, false);
    let mut ctx = RwkvContext::init_from_file(&model_path, 1).unwrap();
    let mut state = vec![0.0f32; ctx.state_element_count() as usize];
    let mut logits = vec![0.0f32; ctx.logits_element_count() as usize];
    ctx.eval(0, None, &mut state, Some(&mut logits)).unwrap();

    c.bench_function("eval_single_step", |b| {
        let feedback = state.clone();
        b.iter(|| {
            ctx.eval(65, Some(&feedback), &mut state, Some(&mut logits)).unwrap();
        });
    });

    c.bench_function("quantize_q5_1", |b| {
        let out = dir.path().join("bench-q5_1.bin");
        b.iter(|| {
            recurrir::quantize_model_file(&model_path, &out, "Q5_1").unwrap();
        });
    });
}

criterion_group!(benches, bench_eval);
criterion_main!(benches);
