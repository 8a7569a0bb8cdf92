//! Declared data sources for compute units.
//!
//! A [`ShaderBuffer`] is either a generic storage buffer or an image. Buffers
//! are created by the application, inserted into a [`BufferArena`] owned by
//! the declaring scope, and referenced everywhere else through
//! generation-checked [`BufferHandle`]s.

mod arena;

pub use self::arena::{BufferArena, BufferHandle, OwnerToken};

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Pixel formats an image buffer may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum TextureFormat {
    #[default]
    #[serde(rename = "RGBA8")]
    Rgba8,
    #[serde(rename = "RGBA16F")]
    Rgba16F,
    #[serde(rename = "RGBA32F")]
    Rgba32F,
}

impl TextureFormat {
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::Rgba16F => 8,
            TextureFormat::Rgba32F => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Storage,
    Image,
}

/// A generic byte buffer bound as a read/write storage buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StorageBuffer {
    payload: Vec<u8>,
}

impl StorageBuffer {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Builds a storage buffer from any plain-old-data slice.
    pub fn from_pod<T: bytemuck::Pod>(data: &[T]) -> Self {
        Self::new(bytemuck::cast_slice(data).to_vec())
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// An image bound as a read/write storage texture.
///
/// Either `payload` together with an explicit size and format, or a source
/// path decoded to RGBA8 at build time, must be supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageBuffer {
    payload: Vec<u8>,
    size: Option<(u32, u32)>,
    format: TextureFormat,
    source: Option<PathBuf>,
}

impl ImageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Some((width, height));
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn size(&self) -> Option<(u32, u32)> {
        self.size
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Byte length the payload must have for the declared size and format.
    /// `None` when no explicit size was declared.
    pub fn expected_len(&self) -> Option<usize> {
        self.size
            .map(|(w, h)| w as usize * h as usize * self.format.bytes_per_pixel())
    }
}

/// A buffer declared for use by a compute unit.
#[derive(Debug, Clone, PartialEq)]
pub enum ShaderBuffer {
    Storage(StorageBuffer),
    Image(ImageBuffer),
}

impl ShaderBuffer {
    pub fn kind(&self) -> BufferKind {
        match self {
            ShaderBuffer::Storage(_) => BufferKind::Storage,
            ShaderBuffer::Image(_) => BufferKind::Image,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            ShaderBuffer::Storage(b) => b.payload(),
            ShaderBuffer::Image(b) => b.payload(),
        }
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Vec<u8> {
        match self {
            ShaderBuffer::Storage(b) => &mut b.payload,
            ShaderBuffer::Image(b) => &mut b.payload,
        }
    }

    pub fn as_image(&self) -> Option<&ImageBuffer> {
        match self {
            ShaderBuffer::Image(b) => Some(b),
            ShaderBuffer::Storage(_) => None,
        }
    }

    pub(crate) fn as_image_mut(&mut self) -> Option<&mut ImageBuffer> {
        match self {
            ShaderBuffer::Image(b) => Some(b),
            ShaderBuffer::Storage(_) => None,
        }
    }
}

impl From<StorageBuffer> for ShaderBuffer {
    fn from(b: StorageBuffer) -> Self {
        ShaderBuffer::Storage(b)
    }
}

impl From<ImageBuffer> for ShaderBuffer {
    fn from(b: ImageBuffer) -> Self {
        ShaderBuffer::Image(b)
    }
}
