//! Error taxonomy for plan building, kernel compilation, and execution.
//!
//! Every failure is surfaced synchronously to the caller of
//! `run`/`fill`/`reduce`/`create_array`; nothing is retried with altered
//! semantics and there is no host-side fallback path.

/// Errors produced by query planning, kernel compilation, and device execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Zip operands (or a fill destination) disagree on element count.
    /// Detected at plan-build time, before any device work.
    #[error("mismatched lengths: {left} vs {right}")]
    MismatchedLength { left: usize, right: usize },

    /// An expression construct the code generator cannot lower.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Struct layout or element type inconsistency.
    #[error("schema error: {0}")]
    Schema(String),

    /// The generated kernel source was rejected by the device compiler.
    /// Carries the full generated source for reproduction; never retried.
    #[error("device rejected generated kernel: {diagnostic}\n--- generated source ---\n{wgsl}")]
    DeviceCompile { diagnostic: String, wgsl: String },

    /// Device memory allocation failed.
    #[error("out of device memory: {0}")]
    OutOfDeviceMemory(String),

    /// A kernel launch or device-side execution fault.
    #[error("device execution failed: {0}")]
    DeviceExecution(String),

    /// A device buffer was used after `dispose()`.
    #[error("disposed device buffer used in {0}")]
    DisposedResource(&'static str),

    /// No usable compute device (no adapter, or the device request failed).
    #[error("no compute device available: {0}")]
    DeviceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
