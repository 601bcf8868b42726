//! Tensor descriptors and the plan-then-seal arena pool
//!
//! All tensors live in one of two arenas owned by a [`TensorPool`]:
//! a byte arena for parameter payloads kept in their stored precision,
//! and an f32 arena for everything the per-step graph touches (converted
//! 1-D parameters, the recurrent state, intermediates, logits).
//!
//! The pool is built in two phases. During planning, `alloc_*` calls
//! assign 16-byte-aligned offsets and record descriptors without any
//! backing storage; [`TensorPool::seal`] then performs the single
//! allocation of both arenas. After sealing no further growth happens,
//! so steady-state evaluation runs without heap activity.

use crate::error::{Result, RwkvError};

/// Backend element types, with per-block sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum ElementType {
    /// 32-bit float
    F32,
    /// 16-bit float
    F16,
    /// 4-bit blocks with a scale
    Q4_0,
    /// 4-bit blocks with a scale and a minimum
    Q4_1,
    /// 5-bit blocks with a scale
    Q5_0,
    /// 5-bit blocks with a scale and a minimum
    Q5_1,
    /// 8-bit blocks with a scale
    Q8_0,
}

impl ElementType {
    /// Number of values per storage block
    #[must_use]
    pub const fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 => 32,
        }
    }

    /// Bytes per storage block
    #[must_use]
    pub const fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 20,
            Self::Q4_1 | Self::Q5_0 => 24,
            Self::Q5_1 => 28,
            Self::Q8_0 => 36,
        }
    }

    /// True for block-compressed types
    #[must_use]
    pub const fn is_quantized(self) -> bool {
        self.block_size() > 1
    }

    /// Bytes of one row of `width` values.
    ///
    /// `width` must be a multiple of [`Self::block_size`]; callers
    /// validate this when accepting shapes from a file.
    #[must_use]
    pub const fn row_bytes(self, width: usize) -> usize {
        (width / self.block_size()) * self.type_size()
    }

    /// Payload bytes of a `width x height` tensor, in u64 to stay exact
    /// for files above 2 GiB.
    #[must_use]
    pub const fn nbytes(self, width: usize, height: usize) -> u64 {
        self.row_bytes(width) as u64 * height as u64
    }
}

/// Opaque handle to a tensor in a [`TensorPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorId(u32);

/// Where a tensor's storage lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    /// Byte offset into the parameter arena
    Param(usize),
    /// Element offset into the f32 arena
    Compute(usize),
}

/// Shape, type, and placement of one tensor
#[derive(Debug, Clone, Copy)]
pub struct TensorDesc {
    /// Element type of the stored payload
    pub ty: ElementType,
    /// Row length in values
    pub width: usize,
    /// Number of rows (1 for 1-D tensors)
    pub height: usize,
    pub(crate) loc: Loc,
}

impl TensorDesc {
    /// Total number of values
    #[must_use]
    pub const fn elements(&self) -> usize {
        self.width * self.height
    }
}

/// Sizing numbers computed by the planning phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaPlan {
    /// Tensor descriptors recorded (object count)
    pub objects: usize,
    /// Bytes required by the parameter arena
    pub param_bytes: usize,
    /// Bytes required by the f32 compute arena
    pub compute_bytes: usize,
}

const ALIGN_BYTES: usize = 16;
const ALIGN_F32: usize = ALIGN_BYTES / 4;

const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Two-arena tensor storage with eager offset assignment.
#[derive(Debug, Default)]
pub struct TensorPool {
    descs: Vec<TensorDesc>,
    param_cursor: usize,
    compute_cursor: usize,
    params: Vec<u8>,
    compute: Vec<f32>,
    sealed: bool,
}

impl TensorPool {
    /// Create an empty pool in the planning phase
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, desc: TensorDesc) -> TensorId {
        let id = TensorId(u32::try_from(self.descs.len()).expect("tensor count fits in u32"));
        self.descs.push(desc);
        id
    }

    /// Plan a parameter tensor kept in its stored precision.
    ///
    /// # Errors
    ///
    /// Returns `Shape` if `width` is not a multiple of the type's block
    /// size, or if the payload size would overflow the address space.
    pub fn alloc_param(&mut self, ty: ElementType, width: usize, height: usize) -> Result<TensorId> {
        assert!(!self.sealed, "pool is sealed");
        if width % ty.block_size() != 0 {
            return Err(RwkvError::Shape {
                reason: format!(
                    "width {width} is not a multiple of the {}-value block",
                    ty.block_size()
                ),
            });
        }
        let nbytes = usize::try_from(ty.nbytes(width, height)).map_err(|_| RwkvError::Shape {
            reason: format!("tensor of {width}x{height} exceeds the address space"),
        })?;
        let offset = align_up(self.param_cursor, ALIGN_BYTES);
        self.param_cursor = offset + nbytes;
        Ok(self.push(TensorDesc {
            ty,
            width,
            height,
            loc: Loc::Param(offset),
        }))
    }

    /// Plan a 1-D f32 tensor in the compute arena
    pub fn alloc_f32(&mut self, width: usize) -> TensorId {
        assert!(!self.sealed, "pool is sealed");
        let offset = align_up(self.compute_cursor, ALIGN_F32);
        self.compute_cursor = offset + width;
        self.push(TensorDesc {
            ty: ElementType::F32,
            width,
            height: 1,
            loc: Loc::Compute(offset),
        })
    }

    /// Plan a 1-D view of `width` values into `base` starting at element
    /// `offset`. Views add an object but no storage.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not an f32 compute tensor or the view falls
    /// outside it; view layout is fixed at build time, not data-driven.
    #[must_use]
    pub fn view_f32(&mut self, base: TensorId, width: usize, offset: usize) -> TensorId {
        let desc = self.desc(base);
        let Loc::Compute(base_off) = desc.loc else {
            panic!("views require an f32 compute tensor");
        };
        assert!(
            offset + width <= desc.elements(),
            "view of {width} at {offset} escapes a tensor of {} values",
            desc.elements()
        );
        self.push(TensorDesc {
            ty: ElementType::F32,
            width,
            height: 1,
            loc: Loc::Compute(base_off + offset),
        })
    }

    /// Sizing numbers accumulated so far
    #[must_use]
    pub fn plan(&self) -> ArenaPlan {
        ArenaPlan {
            objects: self.descs.len(),
            param_bytes: self.param_cursor,
            compute_bytes: self.compute_cursor * 4,
        }
    }

    /// Perform the single backing allocation of both arenas.
    ///
    /// # Errors
    ///
    /// Returns `Alloc` if the reservation fails.
    pub fn seal(&mut self) -> Result<()> {
        assert!(!self.sealed, "pool is already sealed");
        self.params.try_reserve_exact(self.param_cursor).map_err(|_| RwkvError::Alloc {
            what: format!("parameter arena of {} bytes", self.param_cursor),
        })?;
        self.params.resize(self.param_cursor, 0);
        self.compute.try_reserve_exact(self.compute_cursor).map_err(|_| RwkvError::Alloc {
            what: format!("compute arena of {} values", self.compute_cursor),
        })?;
        self.compute.resize(self.compute_cursor, 0.0);
        self.sealed = true;
        Ok(())
    }

    /// Descriptor of `id`
    #[must_use]
    pub fn desc(&self, id: TensorId) -> TensorDesc {
        self.descs[id.0 as usize]
    }

    /// Payload bytes of a parameter tensor
    #[must_use]
    pub fn param_bytes(&self, id: TensorId) -> &[u8] {
        let desc = self.desc(id);
        let Loc::Param(offset) = desc.loc else {
            panic!("tensor is not in the parameter arena");
        };
        let nbytes = desc.ty.row_bytes(desc.width) * desc.height;
        &self.params[offset..offset + nbytes]
    }

    /// Mutable payload bytes of a parameter tensor (loader fill path)
    pub fn param_bytes_mut(&mut self, id: TensorId) -> &mut [u8] {
        let desc = self.desc(id);
        let Loc::Param(offset) = desc.loc else {
            panic!("tensor is not in the parameter arena");
        };
        let nbytes = desc.ty.row_bytes(desc.width) * desc.height;
        &mut self.params[offset..offset + nbytes]
    }

    /// Values of an f32 compute tensor
    #[must_use]
    pub fn f32s(&self, id: TensorId) -> &[f32] {
        let desc = self.desc(id);
        let Loc::Compute(offset) = desc.loc else {
            panic!("tensor is not in the compute arena");
        };
        &self.compute[offset..offset + desc.elements()]
    }

    /// Mutable values of an f32 compute tensor
    pub fn f32s_mut(&mut self, id: TensorId) -> &mut [f32] {
        let desc = self.desc(id);
        let Loc::Compute(offset) = desc.loc else {
            panic!("tensor is not in the compute arena");
        };
        &mut self.compute[offset..offset + desc.elements()]
    }

    /// Split the compute arena at the start of `out`, yielding every
    /// earlier-allocated tensor read-only alongside the mutable output
    /// slice and the parameter arena.
    ///
    /// Bump allocation guarantees that every input of a graph node was
    /// placed before the node's output, so this one split is enough for
    /// any op.
    pub(crate) fn split_for(&mut self, out: TensorId) -> (&[f32], &mut [f32], &[u8]) {
        let desc = self.desc(out);
        let Loc::Compute(offset) = desc.loc else {
            panic!("graph outputs live in the compute arena");
        };
        let (lo, hi) = self.compute.split_at_mut(offset);
        (lo, &mut hi[..desc.elements()], &self.params)
    }

    /// Element offset of an f32 compute tensor within the arena
    pub(crate) fn compute_offset(&self, id: TensorId) -> usize {
        let Loc::Compute(offset) = self.desc(id).loc else {
            panic!("tensor is not in the compute arena");
        };
        offset
    }

    /// Byte offset of a parameter tensor within the parameter arena
    pub(crate) fn param_offset(&self, id: TensorId) -> usize {
        let Loc::Param(offset) = self.desc(id).loc else {
            panic!("tensor is not in the parameter arena");
        };
        offset
    }

    /// True when the tensor is a 1-D f32 compute tensor
    pub(crate) fn is_vector(&self, id: TensorId) -> bool {
        matches!(self.desc(id).loc, Loc::Compute(_))
    }
}
