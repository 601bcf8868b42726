//! The build-once per-step compute graph
//!
//! A [`Graph`] is constructed once at load time and executed on every
//! step. Its two inputs are overwritten per step: the token slot and
//! the contents of the `input_state` tensor. Its outputs are the logits
//! tensor and `n_layer * 5` state-part tensors, read back by the
//! evaluator. Nodes execute in construction order, which is a
//! topological order by construction; the graph itself is acyclic, and
//! the step-to-step recurrence closes at the evaluator boundary.
//!
//! Per-layer state parts are 1-D views into the contiguous state tensor
//! at offsets `(layer * 5 + k) * n_embed`, ordered
//! `ffn_xx, att_xx, att_aa, att_bb, att_pp`.

use crate::model::Model;
use crate::quantize::{dequantize_row, vec_dot};
use crate::tensor::{TensorId, TensorPool};

/// Number of state parts per layer
pub const STATE_PARTS: usize = 5;

const LN_EPS: f32 = 1e-5;

fn exp(x: f32) -> f32 {
    x.exp()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn one_minus(x: f32) -> f32 {
    1.0 - x
}

fn maximum(a: f32, b: f32) -> f32 {
    a.max(b)
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Op {
    /// Gather the token's row from a stored matrix
    GetRows { matrix: TensorId },
    /// `(x - mean) / sqrt(var + eps) * weight + bias`
    LayerNorm {
        x: TensorId,
        weight: TensorId,
        bias: TensorId,
    },
    /// Stored matrix times f32 vector
    MatVec { weight: TensorId, x: TensorId },
    Add { a: TensorId, b: TensorId },
    Sub { a: TensorId, b: TensorId },
    Mul { a: TensorId, b: TensorId },
    Div { a: TensorId, b: TensorId },
    Relu { x: TensorId },
    Square { x: TensorId },
    /// Elementwise user function
    MapUnary { f: fn(f32) -> f32, x: TensorId },
    /// Elementwise binary user function
    MapBinary {
        f: fn(f32, f32) -> f32,
        a: TensorId,
        b: TensorId,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    op: Op,
    out: TensorId,
}

/// The per-step forward graph and its I/O tensors
#[derive(Debug)]
pub struct Graph {
    nodes: Vec<Node>,
    /// Token index consumed by the row gather; overwritten per step
    pub token: u32,
    /// Contiguous `n_layer * 5 * n_embed` input-state tensor
    pub input_state: TensorId,
    /// The `n_layer * 5` next-step state parts, in per-layer order
    /// `ffn_xx, att_xx, att_aa, att_bb, att_pp`
    pub output_state: Vec<TensorId>,
    /// Logits over the vocabulary
    pub logits: TensorId,
}

struct GraphBuilder<'p> {
    pool: &'p mut TensorPool,
    nodes: Vec<Node>,
}

impl GraphBuilder<'_> {
    fn emit(&mut self, op: Op, width: usize) -> TensorId {
        let out = self.pool.alloc_f32(width);
        self.nodes.push(Node { op, out });
        out
    }

    fn width(&self, id: TensorId) -> usize {
        self.pool.desc(id).width
    }

    fn get_rows(&mut self, matrix: TensorId) -> TensorId {
        let width = self.width(matrix);
        self.emit(Op::GetRows { matrix }, width)
    }

    fn layer_norm(&mut self, x: TensorId, weight: TensorId, bias: TensorId) -> TensorId {
        let width = self.width(x);
        self.emit(Op::LayerNorm { x, weight, bias }, width)
    }

    fn mat_vec(&mut self, weight: TensorId, x: TensorId) -> TensorId {
        let height = self.pool.desc(weight).height;
        self.emit(Op::MatVec { weight, x }, height)
    }

    fn add(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let width = self.width(a);
        self.emit(Op::Add { a, b }, width)
    }

    fn sub(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let width = self.width(a);
        self.emit(Op::Sub { a, b }, width)
    }

    fn mul(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let width = self.width(a);
        self.emit(Op::Mul { a, b }, width)
    }

    fn div(&mut self, a: TensorId, b: TensorId) -> TensorId {
        let width = self.width(a);
        self.emit(Op::Div { a, b }, width)
    }

    fn relu(&mut self, x: TensorId) -> TensorId {
        let width = self.width(x);
        self.emit(Op::Relu { x }, width)
    }

    fn square(&mut self, x: TensorId) -> TensorId {
        let width = self.width(x);
        self.emit(Op::Square { x }, width)
    }

    fn unary(&mut self, f: fn(f32) -> f32, x: TensorId) -> TensorId {
        let width = self.width(x);
        self.emit(Op::MapUnary { f, x }, width)
    }

    fn binary(&mut self, f: fn(f32, f32) -> f32, a: TensorId, b: TensorId) -> TensorId {
        let width = self.width(a);
        self.emit(Op::MapBinary { f, a, b }, width)
    }

    /// `x * coeff + prev * (1 - coeff)`: the learned per-channel mix of
    /// the current input with the previous step's input
    fn time_shift(&mut self, x: TensorId, prev: TensorId, coeff: TensorId) -> TensorId {
        let lhs = self.mul(x, coeff);
        let inv = self.unary(one_minus, coeff);
        let rhs = self.mul(prev, inv);
        self.add(lhs, rhs)
    }
}

/// One layer's attention-like substep; returns the new `x` and pushes
/// the four updated state parts.
struct AttOut {
    x: TensorId,
    att_xx: TensorId,
    att_aa: TensorId,
    att_bb: TensorId,
    att_pp: TensorId,
}

fn build_time_mix(
    b: &mut GraphBuilder<'_>,
    x: TensorId,
    layer: &crate::model::Layer,
    att_xx: TensorId,
    att_aa: TensorId,
    att_bb: TensorId,
    att_pp: TensorId,
) -> AttOut {
    let x0 = b.layer_norm(x, layer.ln1_weight, layer.ln1_bias);

    // xk = x0 * time_mix_k + att_xx * (1 - time_mix_k), likewise xv, xr
    let xk = b.time_shift(x0, att_xx, layer.att_time_mix_k);
    let xv = b.time_shift(x0, att_xx, layer.att_time_mix_v);
    let xr = b.time_shift(x0, att_xx, layer.att_time_mix_r);

    // r = sigmoid(Wr @ xr), k = Wk @ xk, v = Wv @ xv
    let rw = b.mat_vec(layer.att_receptance, xr);
    let r = b.unary(sigmoid, rw);
    let k = b.mat_vec(layer.att_key, xk);
    let v = b.mat_vec(layer.att_value, xv);

    // ww = time_first + k; qq = max(pp, ww)
    let ww = b.add(layer.att_time_first, k);
    let qq = b.binary(maximum, att_pp, ww);
    // e1 = exp(pp - qq); e2 = exp(ww - qq)
    let pp_qq = b.sub(att_pp, qq);
    let e1 = b.unary(exp, pp_qq);
    let ww_qq = b.sub(ww, qq);
    let e2 = b.unary(exp, ww_qq);

    // a = e1 * aa + e2 * v; b = e1 * bb + e2
    let e1_aa = b.mul(e1, att_aa);
    let e2_v = b.mul(e2, v);
    let a = b.add(e1_aa, e2_v);
    let e1_bb = b.mul(e1, att_bb);
    let bb = b.add(e1_bb, e2);

    // Next-step accumulators, rescaled around qq' = max(pp + decay, k)
    let ww2 = b.add(att_pp, layer.att_time_decay);
    let qq2 = b.binary(maximum, ww2, k);
    let ww2_qq2 = b.sub(ww2, qq2);
    let e1n = b.unary(exp, ww2_qq2);
    let k_qq2 = b.sub(k, qq2);
    let e2n = b.unary(exp, k_qq2);

    let e1n_aa = b.mul(e1n, att_aa);
    let e2n_v = b.mul(e2n, v);
    let aa_out = b.add(e1n_aa, e2n_v);
    let e1n_bb = b.mul(e1n, att_bb);
    let bb_out = b.add(e1n_bb, e2n);

    // wkv = a / b; x += Wo @ (r * wkv)
    let wkv = b.div(a, bb);
    let r_wkv = b.mul(r, wkv);
    let projected = b.mat_vec(layer.att_output, r_wkv);
    let x_out = b.add(x, projected);

    AttOut {
        x: x_out,
        att_xx: x0,
        att_aa: aa_out,
        att_bb: bb_out,
        att_pp: qq2,
    }
}

struct FfnOut {
    x: TensorId,
    ffn_xx: TensorId,
}

fn build_channel_mix(
    b: &mut GraphBuilder<'_>,
    x: TensorId,
    layer: &crate::model::Layer,
    ffn_xx: TensorId,
) -> FfnOut {
    let x0 = b.layer_norm(x, layer.ln2_weight, layer.ln2_bias);

    let xk = b.time_shift(x0, ffn_xx, layer.ffn_time_mix_k);
    let xr = b.time_shift(x0, ffn_xx, layer.ffn_time_mix_r);

    // r = sigmoid(Wr @ xr)
    let rw = b.mat_vec(layer.ffn_receptance, xr);
    let r = b.unary(sigmoid, rw);

    // k = relu(Wk @ xk)^2
    let kw = b.mat_vec(layer.ffn_key, xk);
    let krelu = b.relu(kw);
    let k = b.square(krelu);

    // x += r * (Wv @ k)
    let vk = b.mat_vec(layer.ffn_value, k);
    let gated = b.mul(r, vk);
    let x_out = b.add(x, gated);

    FfnOut { x: x_out, ffn_xx: x0 }
}

impl Graph {
    /// Build the single-step forward graph for `model`, planning every
    /// intermediate tensor into `pool`.
    #[must_use]
    pub fn build(pool: &mut TensorPool, model: &Model) -> Self {
        let n_embed = model.header.n_embed as usize;
        let n_layer = model.header.n_layer as usize;

        let input_state = pool.alloc_f32(n_layer * STATE_PARTS * n_embed);
        let mut b = GraphBuilder { pool, nodes: Vec::new() };

        // x = emb[token]; x = layer_norm(x, ln0)
        let mut x = b.get_rows(model.emb);
        x = b.layer_norm(x, model.ln0_weight, model.ln0_bias);

        let mut output_state = Vec::with_capacity(n_layer * STATE_PARTS);
        for (i, layer) in model.layers.iter().enumerate() {
            let part = |k: usize| (i * STATE_PARTS + k) * n_embed;
            let ffn_xx = b.pool.view_f32(input_state, n_embed, part(0));
            let att_xx = b.pool.view_f32(input_state, n_embed, part(1));
            let att_aa = b.pool.view_f32(input_state, n_embed, part(2));
            let att_bb = b.pool.view_f32(input_state, n_embed, part(3));
            let att_pp = b.pool.view_f32(input_state, n_embed, part(4));

            let att = build_time_mix(&mut b, x, layer, att_xx, att_aa, att_bb, att_pp);
            let ffn = build_channel_mix(&mut b, att.x, layer, ffn_xx);
            x = ffn.x;

            output_state.push(ffn.ffn_xx);
            output_state.push(att.att_xx);
            output_state.push(att.att_aa);
            output_state.push(att.att_bb);
            output_state.push(att.att_pp);
        }

        // x = layer_norm(x, ln_out); logits = head @ x
        x = b.layer_norm(x, model.ln_out_weight, model.ln_out_bias);
        let logits = b.mat_vec(model.head, x);

        Self {
            nodes: b.nodes,
            token: 0,
            input_state,
            output_state,
            logits,
        }
    }

    /// Execute all nodes in construction order.
    ///
    /// Every output slice sits above every input slice in the compute
    /// arena (bump allocation), so each node borrows its inputs and
    /// output disjointly through one split.
    pub fn compute(&self, pool: &mut TensorPool) {
        for node in &self.nodes {
            self.compute_node(node, pool);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn compute_node(&self, node: &Node, pool: &mut TensorPool) {
        match node.op {
            Op::GetRows { matrix } => {
                let desc = pool.desc(matrix);
                let row_bytes = desc.ty.row_bytes(desc.width);
                let offset = pool.param_offset(matrix) + row_bytes * self.token as usize;
                let (_, out, params) = pool.split_for(node.out);
                dequantize_row(desc.ty, &params[offset..offset + row_bytes], out);
            },
            Op::LayerNorm { x, weight, bias } => {
                let xo = pool.compute_offset(x);
                let wo = pool.compute_offset(weight);
                let bo = pool.compute_offset(bias);
                let (lo, out, _) = pool.split_for(node.out);
                let n = out.len();
                let xs = &lo[xo..xo + n];

                let mean = xs.iter().sum::<f32>() / n as f32;
                let var = xs.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                let inv_std = 1.0 / (var + LN_EPS).sqrt();
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = (xs[i] - mean) * inv_std * lo[wo + i] + lo[bo + i];
                }
            },
            Op::MatVec { weight, x } => {
                let desc = pool.desc(weight);
                let row_bytes = desc.ty.row_bytes(desc.width);
                let woff = pool.param_offset(weight);
                let xo = pool.compute_offset(x);
                let (lo, out, params) = pool.split_for(node.out);
                let xs = &lo[xo..xo + desc.width];
                for (r, slot) in out.iter_mut().enumerate() {
                    let row = &params[woff + r * row_bytes..woff + (r + 1) * row_bytes];
                    *slot = vec_dot(desc.ty, row, xs);
                }
            },
            Op::Add { a, b } => Self::binary_op(pool, node.out, a, b, |x, y| x + y),
            Op::Sub { a, b } => Self::binary_op(pool, node.out, a, b, |x, y| x - y),
            Op::Mul { a, b } => Self::binary_op(pool, node.out, a, b, |x, y| x * y),
            Op::Div { a, b } => Self::binary_op(pool, node.out, a, b, |x, y| x / y),
            Op::MapBinary { f, a, b } => Self::binary_op(pool, node.out, a, b, f),
            Op::Relu { x } => Self::unary_op(pool, node.out, x, |v| v.max(0.0)),
            Op::Square { x } => Self::unary_op(pool, node.out, x, |v| v * v),
            Op::MapUnary { f, x } => Self::unary_op(pool, node.out, x, f),
        }
    }

    fn unary_op(pool: &mut TensorPool, out: TensorId, x: TensorId, f: impl Fn(f32) -> f32) {
        let xo = pool.compute_offset(x);
        let (lo, out, _) = pool.split_for(out);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(lo[xo + i]);
        }
    }

    fn binary_op(
        pool: &mut TensorPool,
        out: TensorId,
        a: TensorId,
        b: TensorId,
        f: impl Fn(f32, f32) -> f32,
    ) {
        debug_assert_eq!(pool.desc(a).width, pool.desc(b).width);
        let ao = pool.compute_offset(a);
        let bo = pool.compute_offset(b);
        let (lo, out, _) = pool.split_for(out);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = f(lo[ao + i], lo[bo + i]);
        }
    }
}
