//! # Recurrir
//!
//! Single-token streaming inference engine for RWKV recurrent language
//! models, with an offline quantizer for the model-file container.
//!
//! A model file is loaded once into a [`RwkvContext`]: parameters land
//! in a byte arena, a per-step compute graph is built once, and every
//! later [`RwkvContext::eval`] call consumes one token plus the
//! previous recurrent state and produces the next state and a vector of
//! logits over the vocabulary, with no heap activity per step.
//!
//! ## Example
//!
//! ```rust,ignore
//! use recurrir::RwkvContext;
//!
//! let mut ctx = RwkvContext::init_from_file("model.bin", 4)?;
//! let mut state = vec![0.0; ctx.state_element_count() as usize];
//! let mut logits = vec![0.0; ctx.logits_element_count() as usize];
//!
//! // First step from a fresh state, then feed the state back.
//! ctx.eval(token, None, &mut state, Some(&mut logits))?;
//! let prev = state.clone();
//! ctx.eval(next_token, Some(&prev), &mut state, Some(&mut logits))?;
//! ```
//!
//! ## Quantization
//!
//! ```rust,ignore
//! recurrir::quantize_model_file("model-f32.bin", "model-q5_1.bin", "Q5_1")?;
//! ```
//!
//! ## Scope
//!
//! The engine is single-threaded and synchronous; a context is not safe
//! for concurrent evaluation (the type system enforces this through
//! `&mut self`). Tokenization, sampling, and batched prefill live
//! outside this crate.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Scalar kernels index in tight loops; the casts between value and
// index domains are shape-checked at construction time.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod context;
pub mod convert;
pub mod error;
pub mod format;
pub mod graph;
pub mod model;
pub mod quantize;
pub mod tensor;

// Re-exports for convenience
pub use context::{system_info_string, RwkvContext};
pub use convert::quantize_model_file;
pub use error::{
    get_last_error, get_print_errors, set_print_errors, ErrorFlags, Result, RwkvError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.contains('.'));
        assert!(!VERSION.is_empty());
    }
}
