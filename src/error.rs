use thiserror::Error;

/// Top-level error type for the cache simulator
#[derive(Error, Debug)]
pub enum SimulatorError {
    #[error("Invalid configuration: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Memory error: {0}")]
    MemoryError(#[from] MemoryError),

    #[error("Trace error: {0}")]
    TraceError(#[from] TraceError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors raised while validating a cache geometry
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} must be non-zero")]
    ZeroParameter { name: &'static str },

    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: u32 },

    #[error("Block size {0} cannot hold a single 4-byte word")]
    BlockTooSmall(u32),

    #[error("Offset and index need {0} bits, more than a 32-bit address")]
    GeometryTooLarge(u32),
}

/// Errors related to backing memory operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Invalid memory alignment: address {0:#010x} is not aligned to {1} bytes")]
    AlignmentError(u32, u32),
}

/// Errors raised while reading a memory trace
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TraceError {
    #[error("Invalid trace at line {line}: {reason}")]
    ParseError { line: usize, reason: String },
}

/// Type alias for Result with SimulatorError
pub type SimulatorResult<T> = Result<T, SimulatorError>;
