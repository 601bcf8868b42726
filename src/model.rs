//! Model parameter slots and the binder that fills them
//!
//! Parameters arrive from the file as a name-to-tensor mapping; the
//! binder walks the fixed schedule of parameter names and assigns each
//! into its slot, failing with the missing key's name when a parameter
//! is absent.

use std::collections::HashMap;

use crate::error::{Result, RwkvError};
use crate::format::FileHeader;
use crate::tensor::{TensorId, TensorPool};

/// Per-layer parameter slots.
///
/// `att` is the time-mix (attention-like) substep, `ffn` the
/// channel-mix substep; `ln1`/`ln2` are their layer norms.
#[derive(Debug, Clone, Copy)]
pub struct Layer {
    /// Time-mix layer norm weight
    pub ln1_weight: TensorId,
    /// Time-mix layer norm bias
    pub ln1_bias: TensorId,

    /// Per-channel mix coefficient for keys
    pub att_time_mix_k: TensorId,
    /// Per-channel mix coefficient for values
    pub att_time_mix_v: TensorId,
    /// Per-channel mix coefficient for receptance
    pub att_time_mix_r: TensorId,
    /// Bonus applied to the current token's key
    pub att_time_first: TensorId,
    /// Per-channel decay of the running accumulators
    pub att_time_decay: TensorId,
    /// Key projection
    pub att_key: TensorId,
    /// Value projection
    pub att_value: TensorId,
    /// Receptance projection
    pub att_receptance: TensorId,
    /// Output projection
    pub att_output: TensorId,

    /// Channel-mix layer norm weight
    pub ln2_weight: TensorId,
    /// Channel-mix layer norm bias
    pub ln2_bias: TensorId,

    /// Per-channel mix coefficient for keys
    pub ffn_time_mix_k: TensorId,
    /// Per-channel mix coefficient for receptance
    pub ffn_time_mix_r: TensorId,
    /// Up projection into the hidden width
    pub ffn_key: TensorId,
    /// Down projection back to the embedding width
    pub ffn_value: TensorId,
    /// Receptance projection
    pub ffn_receptance: TensorId,
}

/// All model parameters, bound by name
#[derive(Debug)]
pub struct Model {
    /// The validated file header
    pub header: FileHeader,

    /// Token embedding matrix, `(n_embed, n_vocab)`
    pub emb: TensorId,
    /// Input layer norm weight
    pub ln0_weight: TensorId,
    /// Input layer norm bias
    pub ln0_bias: TensorId,

    /// Per-layer parameters
    pub layers: Vec<Layer>,

    /// Output layer norm weight
    pub ln_out_weight: TensorId,
    /// Output layer norm bias
    pub ln_out_bias: TensorId,
    /// Output projection onto the vocabulary
    pub head: TensorId,
}

fn lookup(params: &HashMap<String, TensorId>, key: &str) -> Result<TensorId> {
    params.get(key).copied().ok_or_else(|| RwkvError::ParamMissing {
        key: key.to_string(),
    })
}

/// A slot consumed elementwise: must have been a 1-D record
fn vector(params: &HashMap<String, TensorId>, pool: &TensorPool, key: &str) -> Result<TensorId> {
    let id = lookup(params, key)?;
    if !pool.is_vector(id) {
        return Err(RwkvError::Shape {
            reason: format!("parameter {key} must be 1-D"),
        });
    }
    Ok(id)
}

/// A slot consumed by mat-vec or row gather: must have been a 2-D record
fn matrix(params: &HashMap<String, TensorId>, pool: &TensorPool, key: &str) -> Result<TensorId> {
    let id = lookup(params, key)?;
    if pool.is_vector(id) {
        return Err(RwkvError::Shape {
            reason: format!("parameter {key} must be 2-D"),
        });
    }
    Ok(id)
}

impl Model {
    /// Bind every parameter named by the schedule, then verify the
    /// embedding matrix agrees with the header dimensions.
    ///
    /// # Errors
    ///
    /// `ParamMissing` naming the first absent key, `Shape` for a slot
    /// whose record had the wrong dimension count, `Dimension` when the
    /// embedding does not measure `(n_embed, n_vocab)`.
    pub fn bind(
        header: FileHeader,
        params: &HashMap<String, TensorId>,
        pool: &TensorPool,
    ) -> Result<Self> {
        let emb = matrix(params, pool, "emb.weight")?;
        let ln0_weight = vector(params, pool, "blocks.0.ln0.weight")?;
        let ln0_bias = vector(params, pool, "blocks.0.ln0.bias")?;

        let mut layers = Vec::with_capacity(header.n_layer as usize);
        for i in 0..header.n_layer {
            let name = |suffix: &str| format!("blocks.{i}.{suffix}");
            layers.push(Layer {
                ln1_weight: vector(params, pool, &name("ln1.weight"))?,
                ln1_bias: vector(params, pool, &name("ln1.bias"))?,
                att_time_mix_k: vector(params, pool, &name("att.time_mix_k"))?,
                att_time_mix_v: vector(params, pool, &name("att.time_mix_v"))?,
                att_time_mix_r: vector(params, pool, &name("att.time_mix_r"))?,
                att_time_first: vector(params, pool, &name("att.time_first"))?,
                att_time_decay: vector(params, pool, &name("att.time_decay"))?,
                att_key: matrix(params, pool, &name("att.key.weight"))?,
                att_value: matrix(params, pool, &name("att.value.weight"))?,
                att_receptance: matrix(params, pool, &name("att.receptance.weight"))?,
                att_output: matrix(params, pool, &name("att.output.weight"))?,
                ln2_weight: vector(params, pool, &name("ln2.weight"))?,
                ln2_bias: vector(params, pool, &name("ln2.bias"))?,
                ffn_time_mix_k: vector(params, pool, &name("ffn.time_mix_k"))?,
                ffn_time_mix_r: vector(params, pool, &name("ffn.time_mix_r"))?,
                ffn_key: matrix(params, pool, &name("ffn.key.weight"))?,
                ffn_value: matrix(params, pool, &name("ffn.value.weight"))?,
                ffn_receptance: matrix(params, pool, &name("ffn.receptance.weight"))?,
            });
        }

        let ln_out_weight = vector(params, pool, "ln_out.weight")?;
        let ln_out_bias = vector(params, pool, "ln_out.bias")?;
        let head = matrix(params, pool, "head.weight")?;

        let emb_desc = pool.desc(emb);
        if emb_desc.width != header.n_embed as usize {
            return Err(RwkvError::Dimension {
                reason: format!(
                    "embedding width {} does not match header embedding width {}",
                    emb_desc.width, header.n_embed
                ),
            });
        }
        if emb_desc.height != header.n_vocab as usize {
            return Err(RwkvError::Dimension {
                reason: format!(
                    "embedding height {} does not match header vocabulary size {}",
                    emb_desc.height, header.n_vocab
                ),
            });
        }

        Ok(Self {
            header,
            emb,
            ln0_weight,
            ln0_bias,
            layers,
            ln_out_weight,
            ln_out_bias,
            head,
        })
    }
}
