//! Error types shared by the buffer arena, the graphics-device seam, the
//! compute-unit build and the scene configuration loader.
//!
//! Configuration and build errors never abort the host. Operations that are
//! required to refuse quietly log the error with `log::warn!` and return
//! `false` or `None`; the typed errors below carry the context for that log
//! line and are returned directly where a caller can act on them.

use std::path::PathBuf;

use thiserror::Error;

use crate::buffer::TextureFormat;

/// Failures of arena lookups and buffer mutations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer handle {index}:{generation} is stale or was never issued")]
    StaleHandle { index: u32, generation: u32 },

    #[error("buffer is not an image buffer")]
    NotAnImage,

    #[error("buffer is already owned by another compute unit")]
    AlreadyOwned,

    #[error(
        "image payload is {actual} bytes, expected {expected} for {width}x{height} {format:?}"
    )]
    SizeMismatch {
        expected: usize,
        actual: usize,
        width: u32,
        height: u32,
        format: TextureFormat,
    },
}

/// Failures reported by a [`crate::rhi::GraphicsDevice`] implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("shader bytecode is empty or invalid")]
    InvalidShader,

    #[error("cannot create a {what} of zero size")]
    ZeroSized { what: &'static str },

    #[error("unknown or released resource handle: {0}")]
    UnknownResource(String),

    #[error("device rejected the request: {0}")]
    Rejected(String),
}

/// Failures while loading or instantiating a scene description.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read scene file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scene description: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate {what} name '{name}'")]
    DuplicateName { what: &'static str, name: String },

    #[error("unknown {what} '{name}'")]
    UnknownName { what: &'static str, name: String },

    #[error("invalid value for {option}: {reason}")]
    InvalidOption { option: &'static str, reason: String },
}

/// Reasons a single resource could not be built for a compute unit.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("buffer {index}: cannot upload empty storage buffer")]
    EmptyStorage { index: usize },

    #[error("buffer {index}: image has neither a payload nor a source")]
    NoImageData { index: usize },

    #[error("buffer {index}: {source}")]
    Buffer {
        index: usize,
        #[source]
        source: BufferError,
    },

    #[error("buffer {index}: cannot decode {}: {source}", path.display())]
    Decode {
        index: usize,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),
}
