//! Computational primitives and the task descriptors submitted for them.

use std::fmt;

/// Largest `log_len` an audio edge is sized for.
pub const MAX_LOG_LEN: u32 = 24;

/// Most elements the arbiter allocates for one dataflow edge.
pub const MAX_EDGE_ELEMENTS: usize = 1 << MAX_LOG_LEN;

/// A named computational capability.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Primitive {
    /// No hardware primitive: marks a CPU fallback device.
    None,
    /// Audio-rate FFT (forward or inverse).
    AudioFft,
    /// Audio-rate FIR filter.
    AudioFir,
    /// Fused FFT → FIR → IFFT pipeline.
    AudioFfi,
    /// Dense matrix multiply.
    Gemm,
}

impl Primitive {
    /// Every primitive a request may name.
    pub const ALL: [Primitive; 4] = [
        Primitive::AudioFft,
        Primitive::AudioFir,
        Primitive::AudioFfi,
        Primitive::Gemm,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Primitive::None => "none",
            Primitive::AudioFft => "audio_fft",
            Primitive::AudioFir => "audio_fir",
            Primitive::AudioFfi => "audio_ffi",
            Primitive::Gemm => "gemm",
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Primitive-specific shape of a request or a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrimitiveParams {
    /// log2 of the transform/filter length (FFT, FIR, FFI).
    pub log_len: u32,
    /// Run the transform in inverse direction.
    pub inverse: bool,
    /// GEMM dimensions.
    pub dim_m: u32,
    pub dim_n: u32,
    pub dim_k: u32,
}

impl PrimitiveParams {
    pub fn audio(log_len: u32) -> Self {
        Self {
            log_len,
            ..Self::default()
        }
    }

    pub fn gemm(dim_m: u32, dim_n: u32, dim_k: u32) -> Self {
        Self {
            dim_m,
            dim_n,
            dim_k,
            ..Self::default()
        }
    }

    /// Elements carried per task on an edge for this shape.
    pub fn elements(&self, primitive: Primitive) -> usize {
        match primitive {
            Primitive::Gemm => (self.dim_m as usize).saturating_mul(self.dim_n as usize),
            Primitive::None => 0,
            _ => 1usize << self.log_len.min(MAX_LOG_LEN),
        }
    }
}

/// One unit of work pushed into a context's task queue.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Requester-assigned sequence number.
    pub seq: u64,
    /// Byte offset of the input data inside the bound buffer.
    pub in_offset: u32,
    /// Byte offset of the output data inside the bound buffer.
    pub out_offset: u32,
    pub params: PrimitiveParams,
}

impl TaskDescriptor {
    pub fn new(seq: u64, params: PrimitiveParams) -> Self {
        Self {
            seq,
            in_offset: 0,
            out_offset: 0,
            params,
        }
    }
}
