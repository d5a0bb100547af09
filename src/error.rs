//! Central error handling for the trace3d render core
//!
//! Provides a unified RenderError enum with consistent categorization
//! across device, kernel and film operations.

/// Centralized error type for all render core operations
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Device error: {0}")]
    Device(String),

    #[error("Kernel compile error: {0}")]
    KernelCompile(String),

    #[error("Out of device memory: {0}")]
    OutOfDeviceMemory(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Upload error: {0}")]
    Upload(String),

    #[error("Readback error: {0}")]
    Readback(String),

    #[error("Film error: {0}")]
    Film(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Convenience constructors for common error types
    pub fn device<T: ToString>(msg: T) -> Self {
        RenderError::Device(msg.to_string())
    }

    pub fn kernel_compile<T: ToString>(msg: T) -> Self {
        RenderError::KernelCompile(msg.to_string())
    }

    pub fn out_of_device_memory<T: ToString>(msg: T) -> Self {
        RenderError::OutOfDeviceMemory(msg.to_string())
    }

    pub fn config<T: ToString>(msg: T) -> Self {
        RenderError::Config(msg.to_string())
    }

    pub fn upload<T: ToString>(msg: T) -> Self {
        RenderError::Upload(msg.to_string())
    }

    pub fn readback<T: ToString>(msg: T) -> Self {
        RenderError::Readback(msg.to_string())
    }

    pub fn film<T: ToString>(msg: T) -> Self {
        RenderError::Film(msg.to_string())
    }
}

/// Result type alias for render core operations
pub type RenderResult<T> = Result<T, RenderError>;
