//! Shared types of the image loading pipeline.

use std::fmt;

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

/// A decoded image.
///
/// The pixel buffer is reference counted, so cloning an image is cheap.
#[derive(Clone, PartialEq)]
pub struct Image {
    width: u32,
    height: u32,
    scale: f32,
    pixels: Bytes,
}

impl Image {
    pub fn new(width: u32, height: u32, pixels: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            scale: 1.0,
            pixels: pixels.into(),
        }
    }

    /// Sets the scale factor of the image, e.g. `2.0` for a double density asset.
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn pixels(&self) -> &Bytes {
        &self.pixels
    }

    /// The memory cost of this image.
    ///
    /// This is the pixel count scaled by the square of the scale factor. Images without
    /// dimensions are charged with the size of their pixel buffer instead.
    pub fn cost(&self) -> u64 {
        let pixels = self.width as f64 * self.height as f64 * (self.scale as f64).powi(2);
        if pixels >= 1.0 {
            pixels as u64
        } else {
            self.pixels.len() as u64
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("scale", &self.scale)
            .field("pixels", &self.pixels.len())
            .finish()
    }
}

/// Converts between raw payloads and [`Image`]s.
///
/// Complete payloads are decoded on blocking worker threads, partial payloads inline while
/// the download is in flight.
pub trait ImageCodec: Send + Sync + 'static {
    /// Decodes a complete payload, returning `None` if the data is not a valid image.
    fn decode(&self, data: &[u8]) -> Option<Image>;

    /// Decodes the prefix of a payload that is still being downloaded.
    ///
    /// `expected_len` is the announced total length of the payload, if known.
    fn decode_partial(&self, data: &[u8], expected_len: Option<u64>) -> Option<Image> {
        let _ = (data, expected_len);
        None
    }

    /// Encodes an image for persisting it, if supported.
    fn encode(&self, image: &Image) -> Option<Bytes> {
        let _ = image;
        None
    }
}

/// A codec that keeps payloads as they are.
///
/// Every non-empty payload is accepted as an image without dimensions, which makes its cost
/// equal to its size in bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpaqueCodec;

impl ImageCodec for OpaqueCodec {
    fn decode(&self, data: &[u8]) -> Option<Image> {
        (!data.is_empty()).then(|| Image::new(0, 0, Bytes::copy_from_slice(data)))
    }

    fn encode(&self, image: &Image) -> Option<Bytes> {
        Some(image.pixels().clone())
    }
}

/// A minimal uncompressed RGBA format.
///
/// The payload starts with the width and height as little-endian `u32`, followed by
/// `width * height * 4` bytes of pixel data. Partially downloaded payloads decode to the rows
/// that are complete so far.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl RawCodec {
    const HEADER_LEN: usize = 8;
    const BYTES_PER_PIXEL: usize = 4;

    fn header(data: &[u8]) -> Option<(u32, u32)> {
        let width = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?);
        let height = u32::from_le_bytes(data.get(4..8)?.try_into().ok()?);
        Some((width, height))
    }

    fn row_len(width: u32) -> usize {
        width as usize * Self::BYTES_PER_PIXEL
    }
}

impl ImageCodec for RawCodec {
    fn decode(&self, data: &[u8]) -> Option<Image> {
        let (width, height) = Self::header(data)?;
        let pixels = &data[Self::HEADER_LEN..];
        let expected = Self::row_len(width).checked_mul(height as usize)?;
        if width == 0 || pixels.len() != expected {
            return None;
        }
        Some(Image::new(width, height, Bytes::copy_from_slice(pixels)))
    }

    fn decode_partial(&self, data: &[u8], _expected_len: Option<u64>) -> Option<Image> {
        let (width, height) = Self::header(data)?;
        let row_len = Self::row_len(width);
        if row_len == 0 {
            return None;
        }
        let rows = ((data.len() - Self::HEADER_LEN) / row_len).min(height as usize);
        if rows == 0 {
            return None;
        }
        let pixels = &data[Self::HEADER_LEN..Self::HEADER_LEN + rows * row_len];
        Some(Image::new(width, rows as u32, Bytes::copy_from_slice(pixels)))
    }

    fn encode(&self, image: &Image) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + image.pixels().len());
        buf.put_u32_le(image.width());
        buf.put_u32_le(image.height());
        buf.put_slice(image.pixels());
        Some(buf.freeze())
    }
}

/// Where an image was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheSource {
    /// Not cached, the image was downloaded.
    None,
    /// Served from the in-memory tier.
    Memory,
    /// Served from the on-disk tier.
    Disk,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSource::None => "none",
            CacheSource::Memory => "memory",
            CacheSource::Disk => "disk",
        }
    }
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Options of a single image load.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadOptions: u32 {
        /// Try the URL again even if it failed permanently before.
        const RETRY_FAILED = 1 << 0;
        /// Queue the download behind normal priority downloads.
        const LOW_PRIORITY = 1 << 1;
        /// Do not persist the downloaded image to disk.
        const CACHE_MEMORY_ONLY = 1 << 2;
        /// Deliver partial images while the download is in flight.
        const PROGRESSIVE = 1 << 3;
        /// Deliver a cached image, then download and deliver it again.
        const REFRESH_CACHED = 1 << 4;
        /// Keep the download running when the host goes to the background.
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        /// Send and store cookies.
        const HANDLE_COOKIES = 1 << 6;
        /// Accept invalid TLS certificates.
        const ALLOW_INVALID_CERTIFICATES = 1 << 7;
        /// Queue the download ahead of normal priority downloads.
        const HIGH_PRIORITY = 1 << 8;
        /// Hint for UI bindings not to apply the image automatically.
        const AVOID_AUTO_APPLY = 1 << 9;
    }
}

bitflags! {
    /// Options of a single download.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DownloadOptions: u32 {
        const LOW_PRIORITY = 1 << 0;
        const PROGRESSIVE = 1 << 1;
        const CONTINUE_IN_BACKGROUND = 1 << 2;
        const HANDLE_COOKIES = 1 << 3;
        const ALLOW_INVALID_CERTIFICATES = 1 << 4;
        const HIGH_PRIORITY = 1 << 5;
    }
}

impl DownloadOptions {
    /// The queue priority requested by these options.
    pub fn priority(self) -> Priority {
        if self.contains(DownloadOptions::HIGH_PRIORITY) {
            Priority::High
        } else if self.contains(DownloadOptions::LOW_PRIORITY) {
            Priority::Low
        } else {
            Priority::Normal
        }
    }
}

impl From<LoadOptions> for DownloadOptions {
    fn from(options: LoadOptions) -> Self {
        let pairs = [
            (LoadOptions::LOW_PRIORITY, DownloadOptions::LOW_PRIORITY),
            (LoadOptions::PROGRESSIVE, DownloadOptions::PROGRESSIVE),
            (
                LoadOptions::CONTINUE_IN_BACKGROUND,
                DownloadOptions::CONTINUE_IN_BACKGROUND,
            ),
            (LoadOptions::HANDLE_COOKIES, DownloadOptions::HANDLE_COOKIES),
            (
                LoadOptions::ALLOW_INVALID_CERTIFICATES,
                DownloadOptions::ALLOW_INVALID_CERTIFICATES,
            ),
            (LoadOptions::HIGH_PRIORITY, DownloadOptions::HIGH_PRIORITY),
        ];

        let mut result = DownloadOptions::empty();
        for (load, download) in pairs {
            if options.contains(load) {
                result |= download;
            }
        }
        result
    }
}

/// Priority class of a queued download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Order in which queued downloads of the same priority are started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// Oldest submission first.
    #[default]
    Fifo,
    /// Most recent submission first.
    Lifo,
}
