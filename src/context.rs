//! Loaded model context and the per-step evaluator
//!
//! [`RwkvContext::init_from_file`] loads a model in two passes. The
//! first pass scans tensor headers (skipping payloads) and plans every
//! parameter tensor; the graph builder then plans every intermediate,
//! and one sealing allocation backs both arenas. The second pass reads
//! payloads into place. Because everything addressed by the second pass
//! was planned by the first, the second pass cannot fail on sizing.
//!
//! A context is not safe for concurrent evaluation: the input-state and
//! intermediate tensors are shared mutable buffers, which is why
//! [`RwkvContext::eval`] takes `&mut self`. Distinct contexts are
//! independent.

use std::cell::Cell;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use once_cell::sync::Lazy;

use crate::error::{self, ErrorFlags, Result, RwkvError};
use crate::format::{FileHeader, TensorHeader};
use crate::graph::{Graph, STATE_PARTS};
use crate::model::Model;
use crate::quantize::{f16_row_to_f32, f32_row_from_le};
use crate::tensor::{ElementType, TensorId, TensorPool};

/// Fresh-state value of each layer's `att_pp` slice: the running
/// log-scale starts far below any reachable value, so the first step
/// behaves as if there were no prior accumulator contribution.
const FRESH_STATE_PP: f32 = -1e30;

/// A loaded model: parameters, arenas, and the prebuilt step graph.
///
/// Immutable after construction except for the per-step graph inputs,
/// the evaluation intermediates, and the two diagnostic cells. Dropping
/// the context releases both arenas together.
#[derive(Debug)]
pub struct RwkvContext {
    model: Model,
    pool: TensorPool,
    graph: Graph,
    #[allow(dead_code)]
    n_threads: u32,
    pub(crate) last_error: Cell<ErrorFlags>,
    pub(crate) print_errors: Cell<bool>,
}

impl RwkvContext {
    /// Load a model file and build its step graph.
    ///
    /// `n_threads` is recorded for kernel dispatch; the scalar kernels
    /// in this crate run single-threaded and deterministic.
    ///
    /// # Errors
    ///
    /// Any loader failure; the error is also summarized into the
    /// per-thread last-error word and printed to stderr when ambient
    /// error printing is on. On failure nothing is leaked: the file
    /// handle and any partially planned arenas are dropped here.
    pub fn init_from_file(path: impl AsRef<Path>, n_threads: u32) -> Result<Self> {
        error::clear_global();
        Self::load(path.as_ref(), n_threads).map_err(|e| {
            error::record_global(&e);
            e
        })
    }

    fn load(path: &Path, n_threads: u32) -> Result<Self> {
        let file = File::open(path).map_err(|e| RwkvError::FileOpen {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let file_len = file
            .metadata()
            .map_err(|e| RwkvError::FileStat {
                path: path.display().to_string(),
                message: e.to_string(),
            })?
            .len();
        let mut reader = BufReader::new(file);

        let header = FileHeader::read(&mut reader, true)?;
        let tensors_start = stream_position(&mut reader)?;

        // First pass: plan one tensor per record, payloads skipped.
        let mut pool = TensorPool::new();
        let mut params: HashMap<String, TensorId> = HashMap::new();
        let mut ffn_hidden = 0u32;
        while stream_position(&mut reader)? < file_len {
            let tensor = TensorHeader::read(&mut reader)?;
            let key = tensor.read_key(&mut reader)?;
            tensor.skip_payload(&mut reader)?;

            let id = if tensor.dim_count == 1 {
                // Elementwise operands are f32 in the compute arena;
                // stored f16 converts at the fill pass.
                match tensor.element_type() {
                    ElementType::F32 | ElementType::F16 => pool.alloc_f32(tensor.width as usize),
                    _ => {
                        return Err(RwkvError::UnsupportedTensorType {
                            name: tensor.data_type.name(),
                            tensor: key,
                        })
                    },
                }
            } else {
                pool.alloc_param(
                    tensor.element_type(),
                    tensor.width as usize,
                    tensor.height as usize,
                )?
            };

            if key.ends_with("ffn.key.weight") {
                if ffn_hidden == 0 {
                    ffn_hidden = tensor.height;
                } else if tensor.height != ffn_hidden {
                    return Err(RwkvError::Shape {
                        reason: format!(
                            "{key} has hidden width {}, expected {ffn_hidden}",
                            tensor.height
                        ),
                    });
                }
            }

            params.insert(key, id);
        }

        if ffn_hidden == 0 {
            return Err(RwkvError::ParamMissing {
                key: "blocks.0.ffn.key.weight".to_string(),
            });
        }

        let model = Model::bind(header, &params, &pool)?;
        let graph = Graph::build(&mut pool, &model);
        pool.seal()?;

        // Second pass: read payloads into their planned places. The
        // staging buffer for 1-D conversion is the only transient and
        // drops before the context is published.
        reader
            .seek(SeekFrom::Start(tensors_start))
            .map_err(|_| RwkvError::FileRead {
                what: "tensor records".to_string(),
            })?;
        let mut staging: Vec<u8> = Vec::new();
        while stream_position(&mut reader)? < file_len {
            let tensor = TensorHeader::read(&mut reader)?;
            let key = tensor.read_key(&mut reader)?;
            let id = *params.get(&key).ok_or_else(|| RwkvError::Data {
                message: format!("tensor {key} appeared only on the second pass"),
            })?;

            let nbytes = usize::try_from(tensor.payload_bytes()).map_err(|_| RwkvError::Shape {
                reason: format!("tensor {key} exceeds the address space"),
            })?;
            if tensor.dim_count == 1 {
                staging.resize(nbytes, 0);
                tensor.read_payload(&mut reader, &mut staging)?;
                let dest = pool.f32s_mut(id);
                match tensor.element_type() {
                    ElementType::F16 => f16_row_to_f32(&staging, dest),
                    _ => f32_row_from_le(&staging, dest),
                }
            } else {
                tensor.read_payload(&mut reader, pool.param_bytes_mut(id))?;
            }
        }

        Ok(Self {
            model,
            pool,
            graph,
            n_threads,
            last_error: Cell::new(ErrorFlags::NONE),
            print_errors: Cell::new(error::get_print_errors(None)),
        })
    }

    /// Consume one token: read `state_in` (or a fresh state when
    /// `None`), run the step graph, and publish the next state and
    /// optionally the logits.
    ///
    /// All writes to `state_out` and `logits_out` are complete when the
    /// call returns `Ok`.
    ///
    /// # Errors
    ///
    /// `Args` when `token` is outside the vocabulary or a buffer length
    /// does not match the advertised element counts. The context's
    /// last-error is cleared on entry and records any failure.
    pub fn eval(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        self.last_error.set(ErrorFlags::NONE);
        match self.eval_step(token, state_in, state_out, logits_out) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.last_error.set(self.last_error.get() | e.flags());
                if self.print_errors.get() {
                    eprintln!("{e}");
                }
                Err(e)
            },
        }
    }

    fn eval_step(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        let header = &self.model.header;
        let n_embed = header.n_embed as usize;
        let state_len = self.state_element_count() as usize;

        if token >= header.n_vocab {
            return Err(RwkvError::Args {
                reason: format!("token {token} is out of range 0..{}", header.n_vocab),
            });
        }
        if state_out.len() != state_len {
            return Err(RwkvError::Args {
                reason: format!(
                    "state_out holds {} elements, expected {state_len}",
                    state_out.len()
                ),
            });
        }
        if let Some(state_in) = state_in {
            if state_in.len() != state_len {
                return Err(RwkvError::Args {
                    reason: format!(
                        "state_in holds {} elements, expected {state_len}",
                        state_in.len()
                    ),
                });
            }
        }
        if let Some(ref logits_out) = logits_out {
            if logits_out.len() != header.n_vocab as usize {
                return Err(RwkvError::Args {
                    reason: format!(
                        "logits buffer holds {} elements, expected {}",
                        logits_out.len(),
                        header.n_vocab
                    ),
                });
            }
        }

        self.graph.token = token;

        let input = self.pool.f32s_mut(self.graph.input_state);
        match state_in {
            Some(state_in) => input.copy_from_slice(state_in),
            None => {
                input.fill(0.0);
                for layer in 0..header.n_layer as usize {
                    let pp = (layer * STATE_PARTS + 4) * n_embed;
                    input[pp..pp + n_embed].fill(FRESH_STATE_PP);
                }
            },
        }

        self.graph.compute(&mut self.pool);

        for (i, &part) in self.graph.output_state.iter().enumerate() {
            state_out[i * n_embed..(i + 1) * n_embed].copy_from_slice(self.pool.f32s(part));
        }
        if let Some(logits_out) = logits_out {
            logits_out.copy_from_slice(self.pool.f32s(self.graph.logits));
        }

        Ok(())
    }

    /// Length of the recurrent-state buffers: `n_layer * 5 * n_embed`
    #[must_use]
    pub fn state_element_count(&self) -> u32 {
        let header = &self.model.header;
        header.n_layer * STATE_PARTS as u32 * header.n_embed
    }

    /// Length of the logits buffer: `n_vocab`
    #[must_use]
    pub fn logits_element_count(&self) -> u32 {
        self.model.header.n_vocab
    }

    /// The validated header of the loaded file
    #[must_use]
    pub fn header(&self) -> &FileHeader {
        &self.model.header
    }
}

fn stream_position(reader: &mut impl Seek) -> Result<u64> {
    reader.stream_position().map_err(|_| RwkvError::FileRead {
        what: "file position".to_string(),
    })
}

static SYSTEM_INFO: Lazy<String> = Lazy::new(|| {
    cpu_flags()
        .iter()
        .map(|(name, on)| format!("{name}={}", u8::from(*on)))
        .collect::<Vec<_>>()
        .join(" ")
});

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cpu_flags() -> Vec<(&'static str, bool)> {
    vec![
        ("AVX", is_x86_feature_detected!("avx")),
        ("AVX2", is_x86_feature_detected!("avx2")),
        ("AVX512", is_x86_feature_detected!("avx512f")),
        ("FMA", is_x86_feature_detected!("fma")),
        ("NEON", false),
        ("F16C", is_x86_feature_detected!("f16c")),
        ("SSE3", is_x86_feature_detected!("sse3")),
    ]
}

#[cfg(target_arch = "aarch64")]
fn cpu_flags() -> Vec<(&'static str, bool)> {
    vec![
        ("AVX", false),
        ("AVX2", false),
        ("AVX512", false),
        ("FMA", false),
        ("NEON", true),
        ("F16C", false),
        ("SSE3", false),
    ]
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
fn cpu_flags() -> Vec<(&'static str, bool)> {
    vec![
        ("AVX", false),
        ("AVX2", false),
        ("AVX512", false),
        ("FMA", false),
        ("NEON", false),
        ("F16C", false),
        ("SSE3", false),
    ]
}

/// Static text enumerating the CPU features the kernels can see.
#[must_use]
pub fn system_info_string() -> &'static str {
    &SYSTEM_INFO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info_lists_every_flag() {
        let info = system_info_string();
        for name in ["AVX", "AVX2", "AVX512", "FMA", "NEON", "F16C", "SSE3"] {
            assert!(info.contains(&format!("{name}=")), "missing {name} in '{info}'");
        }
    }

    #[test]
    fn test_init_missing_file_records_open_error() {
        error::set_print_errors(None, false);
        let result = RwkvContext::init_from_file("/nonexistent/model.bin", 1);
        assert!(matches!(result, Err(RwkvError::FileOpen { .. })));

        let flags = error::get_last_error(None);
        assert!(flags.contains(ErrorFlags::FILE));
        assert!(flags.contains(ErrorFlags::FILE_OPEN));
        assert_eq!(error::get_last_error(None), ErrorFlags::NONE);
        error::set_print_errors(None, true);
    }
}
