use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage, ImageFormat, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Frames travel between threads behind an `Arc`; queue slots hold references.
pub type SharedFrame = Arc<Frame>;

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb24,
    Rgba,
}

impl PixelFormat {
    pub fn from_channels(channels: u8) -> Result<Self> {
        match channels {
            1 => Ok(Self::Gray8),
            3 => Ok(Self::Rgb24),
            4 => Ok(Self::Rgba),
            other => Err(Error::UnsupportedChannels(other)),
        }
    }

    pub fn channels(self) -> u8 {
        match self {
            Self::Gray8 => 1,
            Self::Rgb24 => 3,
            Self::Rgba => 4,
        }
    }

    /// Name understood by ffmpeg's `-pix_fmt`.
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            Self::Gray8 => "gray",
            Self::Rgb24 => "rgb24",
            Self::Rgba => "rgba",
        }
    }
}

/// Frame geometry: `(width, height, channel count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl Shape {
    pub fn new(width: u32, height: u32, channels: u8) -> Result<Self> {
        let format = PixelFormat::from_channels(channels)?;
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "frame dimensions must be non-zero, got {width}x{height}"
            )));
        }
        Ok(Self {
            width,
            height,
            format,
        })
    }

    pub fn channels(&self) -> u8 {
        self.format.channels()
    }

    /// Bytes in one raw frame of this shape.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.channels() as usize
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.channels())
    }
}

/// One decoded image sample.
///
/// Immutable after construction: the pixel buffer is a shared `Bytes`, so
/// cloning or fanning out a frame never copies pixel data.
#[derive(Clone)]
pub struct Frame {
    data: Bytes,
    shape: Shape,
    timestamp: Instant,
}

impl Frame {
    /// Wrap a raw interleaved buffer, stamped with the current instant.
    pub fn from_raw(shape: Shape, data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let expected = shape.frame_size();
        if data.len() != expected {
            return Err(Error::InvalidFrame {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            shape,
            timestamp: Instant::now(),
        })
    }

    /// Build a frame from a decoded image. Unusual color types are converted to RGB.
    pub fn from_image(image: DynamicImage) -> Result<Self> {
        let (width, height) = image.dimensions();
        let (channels, raw) = match image {
            DynamicImage::ImageLuma8(img) => (1, img.into_raw()),
            DynamicImage::ImageRgba8(img) => (4, img.into_raw()),
            DynamicImage::ImageRgb8(img) => (3, img.into_raw()),
            other => (3, other.into_rgb8().into_raw()),
        };
        Self::from_raw(Shape::new(width, height, channels)?, raw)
    }

    /// Replace the capture timestamp.
    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn to_image(&self) -> Result<DynamicImage> {
        let Shape { width, height, .. } = self.shape;
        let raw = self.data.to_vec();
        let image = match self.shape.format {
            PixelFormat::Gray8 => GrayImage::from_raw(width, height, raw).map(DynamicImage::ImageLuma8),
            PixelFormat::Rgb24 => RgbImage::from_raw(width, height, raw).map(DynamicImage::ImageRgb8),
            PixelFormat::Rgba => RgbaImage::from_raw(width, height, raw).map(DynamicImage::ImageRgba8),
        };
        image.ok_or(Error::InvalidFrame {
            expected: self.shape.frame_size(),
            actual: self.data.len(),
        })
    }

    /// Rescaled copy, keeping the capture timestamp.
    pub fn resize(&self, width: u32, height: u32) -> Result<Self> {
        let resized = self
            .to_image()?
            .resize_exact(width.max(1), height.max(1), FilterType::Triangle);
        Ok(Self::from_image(resized)?.with_timestamp(self.timestamp))
    }

    /// Encode as a still image (PNG or JPEG).
    pub fn encode(&self, format: ImageFormat) -> Result<Vec<u8>> {
        let mut image = self.to_image()?;
        if format == ImageFormat::Jpeg && self.shape.format == PixelFormat::Rgba {
            // JPEG has no alpha channel
            image = DynamicImage::ImageRgb8(image.into_rgb8());
        }
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, format)?;
        Ok(out.into_inner())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("shape", &self.shape)
            .field("bytes", &self.data.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}
