//! Model-file container format
//!
//! A model file is a fixed header followed by tensor records until the
//! end of the file. All integers are little-endian, packed, no padding:
//!
//! ```text
//! HEADER := {
//!   magic: u32 = 0x67676d66
//!   version: u32            (supported range [100, 101])
//!   n_vocab: u32
//!   n_embed: u32
//!   n_layer: u32
//!   data_type: u32          (on-disk type code of the 2-D matrices)
//! }
//!
//! TENSOR := {
//!   dim_count: u32          (1 or 2)
//!   key_length: u32
//!   data_type: u32
//!   width: u32
//!   height: u32             (present only when dim_count == 2)
//!   key: u8[key_length]
//!   payload: u8[payload_bytes(data_type, width, height)]
//! }
//! ```
//!
//! Offsets are kept in u64 throughout; files above 2 GiB are routine.

use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Result, RwkvError};
use crate::tensor::ElementType;

/// Container magic, first four bytes of every model file
pub const FILE_MAGIC: u32 = 0x6767_6d66;

/// First supported container version
pub const FILE_VERSION_0: u32 = 100;
/// Version that introduced the current quantized block layouts
pub const FILE_VERSION_1: u32 = 101;
/// Lowest version accepted by the loader
pub const FILE_VERSION_MIN: u32 = FILE_VERSION_0;
/// Highest version accepted by the loader
pub const FILE_VERSION_MAX: u32 = FILE_VERSION_1;
/// Version written by this producer
pub const FILE_VERSION: u32 = FILE_VERSION_1;

/// On-disk type codes.
///
/// This closed enumeration is the single source of truth mapping
/// type codes to backend element types and to names. Three codes
/// (`Q4_1_O`, `Q4_2`, `Q4_3`) name formats that were removed: files
/// carrying them are recognized but can no longer be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum FileType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// 4-bit blocks, scale only
    Q4_0,
    /// 4-bit blocks, scale and minimum
    Q4_1,
    /// Removed 4-bit variant with outlier handling
    Q4_1_O,
    /// Removed 4-bit variant
    Q4_2,
    /// Removed 4-bit variant
    Q4_3,
    /// 5-bit blocks, scale only
    Q5_0,
    /// 5-bit blocks, scale and minimum
    Q5_1,
    /// 8-bit blocks, scale only
    Q8_0,
}

/// Number of on-disk type codes
pub const FILE_TYPE_COUNT: u32 = 10;

const FILE_TYPES: [FileType; FILE_TYPE_COUNT as usize] = [
    FileType::F32,
    FileType::F16,
    FileType::Q4_0,
    FileType::Q4_1,
    FileType::Q4_1_O,
    FileType::Q4_2,
    FileType::Q4_3,
    FileType::Q5_0,
    FileType::Q5_1,
    FileType::Q8_0,
];

impl FileType {
    /// Resolve an on-disk code; `None` when the code is out of range
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        FILE_TYPES.get(code as usize).copied()
    }

    /// The on-disk code of this type
    #[must_use]
    pub fn code(self) -> u32 {
        FILE_TYPES.iter().position(|&t| t == self).expect("type is in the table") as u32
    }

    /// Human-readable name, as accepted by the quantizer
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q4_1_O => "Q4_1_O",
            Self::Q4_2 => "Q4_2",
            Self::Q4_3 => "Q4_3",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
        }
    }

    /// Resolve a type by name (legacy names included)
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        FILE_TYPES.iter().copied().find(|t| t.name() == name)
    }

    /// The backend element type, or `None` for removed formats
    #[must_use]
    pub const fn element_type(self) -> Option<ElementType> {
        match self {
            Self::F32 => Some(ElementType::F32),
            Self::F16 => Some(ElementType::F16),
            Self::Q4_0 => Some(ElementType::Q4_0),
            Self::Q4_1 => Some(ElementType::Q4_1),
            Self::Q5_0 => Some(ElementType::Q5_0),
            Self::Q5_1 => Some(ElementType::Q5_1),
            Self::Q8_0 => Some(ElementType::Q8_0),
            Self::Q4_1_O | Self::Q4_2 | Self::Q4_3 => None,
        }
    }

    /// True for block-compressed codes, removed ones included
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }
}

fn read_u32(reader: &mut impl Read, what: &str) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(|_| RwkvError::FileRead {
        what: what.to_string(),
    })?;
    Ok(u32::from_le_bytes(buf))
}

fn write_u32(writer: &mut impl Write, value: u32, what: &str) -> Result<()> {
    writer.write_all(&value.to_le_bytes()).map_err(|_| RwkvError::FileWrite {
        what: what.to_string(),
    })
}

/// Fixed header at offset 0 of every model file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Container magic
    pub magic: u32,
    /// Container version
    pub version: u32,
    /// Vocabulary size
    pub n_vocab: u32,
    /// Embedding width
    pub n_embed: u32,
    /// Layer count
    pub n_layer: u32,
    /// On-disk type of the 2-D parameter matrices
    pub data_type: FileType,
}

impl FileHeader {
    /// Read and validate the file header.
    ///
    /// `verify_data_type` guards the two checks a loader needs but a
    /// rewriting reader must skip: that the type is still decodable
    /// (removed formats fail), and that a quantized file carries the
    /// version its block layouts were introduced in (older quantizer
    /// output fails).
    ///
    /// # Errors
    ///
    /// `FileRead` on short reads, `BadMagic`, `BadVersion`,
    /// `TypeOutOfRange`, `FormatRemoved`, or `OldQuantizedFile`.
    pub fn read(reader: &mut impl Read, verify_data_type: bool) -> Result<Self> {
        let magic = read_u32(reader, "file magic")?;
        if magic != FILE_MAGIC {
            return Err(RwkvError::BadMagic { magic });
        }

        let version = read_u32(reader, "file version")?;
        if !(FILE_VERSION_MIN..=FILE_VERSION_MAX).contains(&version) {
            return Err(RwkvError::BadVersion { version });
        }

        let n_vocab = read_u32(reader, "vocabulary size")?;
        let n_embed = read_u32(reader, "embedding width")?;
        let n_layer = read_u32(reader, "layer count")?;

        let code = read_u32(reader, "model data type")?;
        let data_type = FileType::from_code(code).ok_or_else(|| RwkvError::TypeOutOfRange {
            what: "model".to_string(),
            code,
        })?;

        if verify_data_type {
            if data_type.element_type().is_none() {
                return Err(RwkvError::FormatRemoved {
                    name: data_type.name(),
                });
            }
            if data_type.is_quantized() && version != FILE_VERSION_1 {
                return Err(RwkvError::OldQuantizedFile {
                    name: data_type.name(),
                });
            }
        }

        Ok(Self {
            magic,
            version,
            n_vocab,
            n_embed,
            n_layer,
            data_type,
        })
    }

    /// Write the header.
    ///
    /// # Errors
    ///
    /// `FileWrite` on I/O failure.
    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        write_u32(writer, self.magic, "file magic")?;
        write_u32(writer, self.version, "file version")?;
        write_u32(writer, self.n_vocab, "vocabulary size")?;
        write_u32(writer, self.n_embed, "embedding width")?;
        write_u32(writer, self.n_layer, "layer count")?;
        write_u32(writer, self.data_type.code(), "model data type")
    }
}

/// Header of one tensor record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHeader {
    /// 1 or 2
    pub dim_count: u32,
    /// Byte length of the key that follows
    pub key_length: u32,
    /// On-disk type of the payload
    pub data_type: FileType,
    /// Row length in values
    pub width: u32,
    /// Number of rows; 1 for 1-D tensors
    pub height: u32,
}

impl TensorHeader {
    /// Read and validate one tensor header.
    ///
    /// # Errors
    ///
    /// `FileRead` on short reads, `Shape` for a dimension count other
    /// than 1 or 2 or a width that does not fill whole blocks,
    /// `TypeOutOfRange` / `FormatRemoved` for bad type codes.
    pub fn read(reader: &mut impl Read) -> Result<Self> {
        let dim_count = read_u32(reader, "tensor dimension count")?;
        let key_length = read_u32(reader, "tensor key length")?;
        let code = read_u32(reader, "tensor data type")?;
        let width = read_u32(reader, "tensor width")?;

        if dim_count != 1 && dim_count != 2 {
            return Err(RwkvError::Shape {
                reason: format!("tensor has an invalid shape ({dim_count} dimensions)"),
            });
        }

        let data_type = FileType::from_code(code).ok_or_else(|| RwkvError::TypeOutOfRange {
            what: "tensor".to_string(),
            code,
        })?;
        let element = data_type.element_type().ok_or_else(|| RwkvError::FormatRemoved {
            name: data_type.name(),
        })?;

        if width as usize % element.block_size() != 0 {
            return Err(RwkvError::Shape {
                reason: format!(
                    "tensor width {width} does not fill whole {}-value blocks of {}",
                    element.block_size(),
                    data_type.name()
                ),
            });
        }

        let height = if dim_count == 2 {
            read_u32(reader, "tensor height")?
        } else {
            1
        };

        Ok(Self {
            dim_count,
            key_length,
            data_type,
            width,
            height,
        })
    }

    /// Write the tensor header; the height field is emitted only for
    /// 2-D records.
    ///
    /// # Errors
    ///
    /// `FileWrite` on I/O failure.
    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        write_u32(writer, self.dim_count, "tensor dimension count")?;
        write_u32(writer, self.key_length, "tensor key length")?;
        write_u32(writer, self.data_type.code(), "tensor data type")?;
        write_u32(writer, self.width, "tensor width")?;
        if self.dim_count == 2 {
            write_u32(writer, self.height, "tensor height")?;
        }
        Ok(())
    }

    /// Backend element type of the payload (validated at read time)
    #[must_use]
    pub fn element_type(&self) -> ElementType {
        self.data_type.element_type().expect("removed formats are rejected at read")
    }

    /// Payload size in bytes, a pure function of (type, width, height)
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        self.element_type().nbytes(self.width as usize, self.height as usize)
    }

    /// Read the key that follows the header.
    ///
    /// # Errors
    ///
    /// `Key` on short read or non-UTF-8 key bytes.
    pub fn read_key(&self, reader: &mut impl Read) -> Result<String> {
        let mut buf = vec![0u8; self.key_length as usize];
        reader.read_exact(&mut buf).map_err(|e| RwkvError::Key {
            message: e.to_string(),
        })?;
        String::from_utf8(buf).map_err(|e| RwkvError::Key {
            message: e.to_string(),
        })
    }

    /// Read exactly the payload into `dest` (`dest.len()` must equal
    /// [`Self::payload_bytes`]).
    ///
    /// # Errors
    ///
    /// `Data` on short read.
    pub fn read_payload(&self, reader: &mut impl Read, dest: &mut [u8]) -> Result<()> {
        debug_assert_eq!(dest.len() as u64, self.payload_bytes());
        reader.read_exact(dest).map_err(|e| RwkvError::Data {
            message: e.to_string(),
        })
    }

    /// Seek forward past the payload (the key has already been read).
    ///
    /// # Errors
    ///
    /// `FileRead` if the seek fails.
    pub fn skip_payload(&self, reader: &mut impl Seek) -> Result<()> {
        let skip = i64::try_from(self.payload_bytes()).map_err(|_| RwkvError::Shape {
            reason: "tensor payload exceeds seekable range".to_string(),
        })?;
        reader.seek(SeekFrom::Current(skip)).map_err(|_| RwkvError::FileRead {
            what: "tensor data".to_string(),
        })?;
        Ok(())
    }
}
