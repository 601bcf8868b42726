//! Error types and ambient error state
//!
//! All fallible operations return [`Result`]. In addition to the typed
//! error value, every failure is summarized into an [`ErrorFlags`] word
//! that callers can retrieve (and thereby clear) with [`get_last_error`],
//! either from a context or from the per-thread ambient slot.

use std::cell::Cell;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

use crate::context::RwkvContext;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, RwkvError>;

/// Bitmask summary of an error.
///
/// The low byte holds a detail kind, the high byte a category; a category
/// and a detail OR together (for example `FILE | FILE_OPEN`). `NONE` is
/// the cleared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(u32);

impl ErrorFlags {
    /// No error recorded
    pub const NONE: Self = Self(0);

    /// Allocation failure
    pub const ALLOC: Self = Self(1);
    /// Failed to open a file
    pub const FILE_OPEN: Self = Self(2);
    /// Failed to stat a file
    pub const FILE_STAT: Self = Self(3);
    /// Failed to read from a file
    pub const FILE_READ: Self = Self(4);
    /// Failed to write to a file
    pub const FILE_WRITE: Self = Self(5);
    /// File magic did not match
    pub const FILE_MAGIC: Self = Self(6);
    /// File version outside the supported range
    pub const FILE_VERSION: Self = Self(7);
    /// A required model parameter was not present
    pub const PARAM_MISSING: Self = Self(8);
    /// Tensor shape is invalid
    pub const SHAPE: Self = Self(9);
    /// Tensor dimension is invalid
    pub const DIMENSION: Self = Self(10);
    /// Failed to read a tensor key
    pub const KEY: Self = Self(11);
    /// Failed to read tensor data
    pub const DATA: Self = Self(12);
    /// Data type is invalid, removed, or unusable here
    pub const DATA_TYPE: Self = Self(13);
    /// Operation or format not supported
    pub const UNSUPPORTED: Self = Self(14);

    /// Invalid arguments (category)
    pub const ARGS: Self = Self(1 << 8);
    /// File I/O or container validation (category)
    pub const FILE: Self = Self(2 << 8);
    /// Model parameter loading or binding (category)
    pub const MODEL_PARAMS: Self = Self(4 << 8);
    /// Graph construction or execution (category)
    pub const GRAPH: Self = Self(5 << 8);
    /// Context construction (category)
    pub const CTX: Self = Self(6 << 8);

    /// Raw bit value of the word
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// True when no error bits are set
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `other` is set in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Error type for all engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RwkvError {
    /// Caller passed an invalid argument
    #[error("invalid argument: {reason}")]
    Args {
        /// What was wrong with the arguments
        reason: String,
    },

    /// Failed to open a file
    #[error("failed to open file '{path}': {message}")]
    FileOpen {
        /// File path
        path: String,
        /// Underlying I/O error text
        message: String,
    },

    /// Failed to query file metadata
    #[error("failed to stat file '{path}': {message}")]
    FileStat {
        /// File path
        path: String,
        /// Underlying I/O error text
        message: String,
    },

    /// Short or failed read
    #[error("failed to read {what}")]
    FileRead {
        /// What was being read
        what: String,
    },

    /// Short or failed write
    #[error("failed to write {what}")]
    FileWrite {
        /// What was being written
        what: String,
    },

    /// File magic did not match the container magic
    #[error("invalid file magic 0x{magic:08X}")]
    BadMagic {
        /// Magic value found in the file
        magic: u32,
    },

    /// File version outside the supported range
    #[error("unsupported file version {version}")]
    BadVersion {
        /// Version value found in the file
        version: u32,
    },

    /// Type code outside the table of known codes
    #[error("{what} data type out of range ({code})")]
    TypeOutOfRange {
        /// Which record carried the code
        what: String,
        /// Offending code
        code: u32,
    },

    /// The on-disk format was removed and can no longer be loaded
    #[error(
        "models in {name} format cannot be loaded anymore because the format was removed; \
         quantize the model into another format"
    )]
    FormatRemoved {
        /// Name of the removed format
        name: &'static str,
    },

    /// A quantized file written by an older producer
    #[error(
        "the quantized model file in {name} format was created by an older quantizer and \
         can no longer be loaded; requantize the model from a float file"
    )]
    OldQuantizedFile {
        /// Name of the quantized format
        name: &'static str,
    },

    /// Quantization target name unknown, removed, or not a block format
    #[error("invalid quantization target data type ({name})")]
    BadTargetType {
        /// The offending target name
        name: String,
    },

    /// Quantizer source file is not in a float format
    #[error("unsupported source data type ({name}); the source must be f32 or f16")]
    BadSourceType {
        /// Name of the source file's data type
        name: &'static str,
    },

    /// Data type valid on disk but unusable for this tensor
    #[error("unsupported tensor data type {name} for '{tensor}'")]
    UnsupportedTensorType {
        /// Type name
        name: &'static str,
        /// Tensor key
        tensor: String,
    },

    /// Tensor shape rejected
    #[error("invalid tensor shape: {reason}")]
    Shape {
        /// Why the shape was rejected
        reason: String,
    },

    /// Embedding matrix dimensions disagree with the header
    #[error("unexpected dimension of embedding matrix: {reason}")]
    Dimension {
        /// Which dimension disagreed
        reason: String,
    },

    /// A parameter named by the model schedule was not in the file
    #[error("parameter {key} not found")]
    ParamMissing {
        /// The missing parameter key
        key: String,
    },

    /// Failed to read a tensor key
    #[error("failed to read tensor key: {message}")]
    Key {
        /// Underlying error text
        message: String,
    },

    /// Tensor payload rejected
    #[error("invalid tensor data: {message}")]
    Data {
        /// Why the payload was rejected
        message: String,
    },

    /// Arena or buffer allocation failed
    #[error("failed to allocate {what}")]
    Alloc {
        /// What was being allocated
        what: String,
    },

    /// Graph construction or execution failure
    #[error("graph error: {message}")]
    Graph {
        /// What went wrong
        message: String,
    },
}

impl RwkvError {
    /// Bitmask summary of this error, the word stored into last-error.
    #[must_use]
    pub fn flags(&self) -> ErrorFlags {
        use ErrorFlags as F;
        match self {
            Self::Args { .. } => F::ARGS,
            Self::FileOpen { .. } => F::FILE | F::FILE_OPEN,
            Self::FileStat { .. } => F::FILE | F::FILE_STAT,
            Self::FileRead { .. } => F::FILE | F::FILE_READ,
            Self::FileWrite { .. } => F::FILE | F::FILE_WRITE,
            Self::BadMagic { .. } => F::FILE | F::FILE_MAGIC,
            Self::BadVersion { .. } => F::FILE | F::FILE_VERSION,
            Self::TypeOutOfRange { .. }
            | Self::FormatRemoved { .. }
            | Self::OldQuantizedFile { .. }
            | Self::BadSourceType { .. } => F::FILE | F::DATA_TYPE,
            Self::BadTargetType { .. } => F::ARGS | F::DATA_TYPE,
            Self::UnsupportedTensorType { .. } => F::MODEL_PARAMS | F::UNSUPPORTED,
            Self::Shape { .. } => F::MODEL_PARAMS | F::SHAPE,
            Self::Dimension { .. } => F::MODEL_PARAMS | F::DIMENSION,
            Self::ParamMissing { .. } => F::MODEL_PARAMS | F::PARAM_MISSING,
            Self::Key { .. } => F::MODEL_PARAMS | F::KEY,
            Self::Data { .. } => F::MODEL_PARAMS | F::DATA,
            Self::Alloc { .. } => F::CTX | F::ALLOC,
            Self::Graph { .. } => F::GRAPH,
        }
    }
}

thread_local! {
    static GLOBAL_LAST_ERROR: Cell<ErrorFlags> = const { Cell::new(ErrorFlags::NONE) };
    static GLOBAL_PRINT_ERRORS: Cell<bool> = const { Cell::new(true) };
}

/// Enable or disable stderr error reporting.
///
/// With a context, sets that context's flag; with `None`, sets the
/// per-thread ambient flag used by context-free operations such as
/// [`crate::quantize_model_file`].
pub fn set_print_errors(ctx: Option<&RwkvContext>, print: bool) {
    match ctx {
        Some(ctx) => ctx.print_errors.set(print),
        None => GLOBAL_PRINT_ERRORS.with(|cell| cell.set(print)),
    }
}

/// Whether errors are currently reported to stderr for `ctx` (or the
/// per-thread ambient slot when `None`).
#[must_use]
pub fn get_print_errors(ctx: Option<&RwkvContext>) -> bool {
    match ctx {
        Some(ctx) => ctx.print_errors.get(),
        None => GLOBAL_PRINT_ERRORS.with(Cell::get),
    }
}

/// Retrieve and clear the last error word.
///
/// With a context, addresses that context's slot; with `None`, the
/// per-thread ambient slot. Reading clears: a second call returns
/// [`ErrorFlags::NONE`] until another failure is recorded.
pub fn get_last_error(ctx: Option<&RwkvContext>) -> ErrorFlags {
    match ctx {
        Some(ctx) => ctx.last_error.replace(ErrorFlags::NONE),
        None => GLOBAL_LAST_ERROR.with(|cell| cell.replace(ErrorFlags::NONE)),
    }
}

/// Record a failure into the per-thread ambient slot, printing when the
/// ambient print flag is on.
pub(crate) fn record_global(err: &RwkvError) {
    GLOBAL_LAST_ERROR.with(|cell| cell.set(cell.get() | err.flags()));
    if get_print_errors(None) {
        eprintln!("{err}");
    }
}

/// Clear the per-thread ambient slot (operation entry point).
pub(crate) fn clear_global() {
    GLOBAL_LAST_ERROR.with(|cell| cell.set(ErrorFlags::NONE));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_or() {
        let flags = ErrorFlags::FILE | ErrorFlags::FILE_OPEN;
        assert!(flags.contains(ErrorFlags::FILE));
        assert!(flags.contains(ErrorFlags::FILE_OPEN));
        assert!(!flags.contains(ErrorFlags::ARGS));
    }

    #[test]
    fn test_flags_default_is_none() {
        assert_eq!(ErrorFlags::default(), ErrorFlags::NONE);
        assert!(ErrorFlags::NONE.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = RwkvError::ParamMissing {
            key: "blocks.0.ln1.weight".to_string(),
        };
        assert!(err.to_string().contains("blocks.0.ln1.weight"));
    }

    #[test]
    fn test_error_flags_mapping() {
        let err = RwkvError::BadMagic { magic: 0xDEAD_BEEF };
        assert!(err.flags().contains(ErrorFlags::FILE_MAGIC));
        assert!(err.flags().contains(ErrorFlags::FILE));
    }

    #[test]
    fn test_global_last_error_clears_on_read() {
        clear_global();
        let was = get_print_errors(None);
        set_print_errors(None, false);
        record_global(&RwkvError::Args {
            reason: "test".to_string(),
        });
        set_print_errors(None, was);

        assert_eq!(get_last_error(None), ErrorFlags::ARGS);
        assert_eq!(get_last_error(None), ErrorFlags::NONE);
    }

    #[test]
    fn test_removed_and_old_quantizer_messages_differ() {
        let removed = RwkvError::FormatRemoved { name: "Q4_1_O" }.to_string();
        let old = RwkvError::OldQuantizedFile { name: "Q4_0" }.to_string();
        assert!(removed.contains("removed"));
        assert!(old.contains("older quantizer"));
        assert_ne!(removed, old);
    }
}
