//! Artwork decoding, validation, and format normalization.

use image::{codecs::jpeg::JpegEncoder, DynamicImage, GenericImageView, ImageFormat};
use log::{debug, info, warn};
use zune_core::{colorspace::ColorSpace, options::DecoderOptions};
use zune_jpeg::JpegDecoder;

use crate::backends::{ArtistRecord, LibraryBackend};
use crate::logging::RunScope;

pub const DEFAULT_UPLOAD_MIN_EDGE_PX: u32 = 200;
pub const DEFAULT_INSTALLED_MIN_EDGE_PX: u32 = 100;
pub const DEFAULT_INSTALLED_MIN_BYTES: usize = 1000;
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

/// Why a set of image bytes was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArtworkRejection {
    #[error("image bytes could not be decoded")]
    Undecodable,

    #[error("image is {width}x{height}, below the {min}px minimum edge")]
    TooSmall { width: u32, height: u32, min: u32 },

    #[error("image body is {len} bytes, below the {min} byte minimum")]
    TooFewBytes { len: usize, min: usize },

    #[error("jpeg re-encode failed: {0}")]
    Encode(String),
}

/// Thresholds applied to artwork candidates and installed artwork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtworkThresholds {
    pub upload_min_edge_px: u32,
    pub installed_min_edge_px: u32,
    pub installed_min_bytes: usize,
    pub jpeg_quality: u8,
}

impl Default for ArtworkThresholds {
    fn default() -> Self {
        Self {
            upload_min_edge_px: DEFAULT_UPLOAD_MIN_EDGE_PX,
            installed_min_edge_px: DEFAULT_INSTALLED_MIN_EDGE_PX,
            installed_min_bytes: DEFAULT_INSTALLED_MIN_BYTES,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Vets artwork bytes before upload and checks what is already installed.
pub struct ArtworkValidator {
    thresholds: ArtworkThresholds,
    scope: RunScope,
}

impl ArtworkValidator {
    pub fn new(thresholds: ArtworkThresholds, scope: RunScope) -> Self {
        Self { thresholds, scope }
    }

    /// Returns upload-ready bytes. JPEG and PNG pass through untouched;
    /// other decodable formats are re-encoded as JPEG.
    pub fn validate(&self, bytes: &[u8]) -> Result<Vec<u8>, ArtworkRejection> {
        let decoded = decode_image_from_memory_with_fallback(bytes)
            .ok_or(ArtworkRejection::Undecodable)?;
        check_min_edge(&decoded, self.thresholds.upload_min_edge_px)?;

        match source_format(bytes) {
            Some(ImageFormat::Jpeg) | Some(ImageFormat::Png) => Ok(bytes.to_vec()),
            other => {
                debug!(
                    "[{}] Re-encoding {:?} artwork as JPEG (quality {})",
                    self.scope, other, self.thresholds.jpeg_quality
                );
                encode_jpeg(&decoded, self.thresholds.jpeg_quality)
            }
        }
    }

    /// Checks installed artwork bytes against the installed-artwork thresholds.
    pub fn check_installed_bytes(&self, bytes: &[u8]) -> Result<(), ArtworkRejection> {
        if bytes.len() < self.thresholds.installed_min_bytes {
            return Err(ArtworkRejection::TooFewBytes {
                len: bytes.len(),
                min: self.thresholds.installed_min_bytes,
            });
        }
        let decoded = decode_image_from_memory_with_fallback(bytes)
            .ok_or(ArtworkRejection::Undecodable)?;
        check_min_edge(&decoded, self.thresholds.installed_min_edge_px)
    }

    /// Whether the artist currently has usable artwork in the library.
    pub fn verify_installed(&self, library: &dyn LibraryBackend, artist: &ArtistRecord) -> bool {
        if artist.artwork.is_none() {
            debug!("[{}] No artwork reference for {}", self.scope, artist.name);
            return false;
        }
        let bytes = match library.artwork_bytes(artist) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("[{}] Artwork for {} is not downloadable", self.scope, artist.name);
                return false;
            }
            Err(err) => {
                warn!(
                    "[{}] Failed to download artwork for {}: {}",
                    self.scope, artist.name, err
                );
                return false;
            }
        };
        match self.check_installed_bytes(&bytes) {
            Ok(()) => {
                info!("[{}] Existing artwork for {} is valid", self.scope, artist.name);
                true
            }
            Err(rejection) => {
                info!(
                    "[{}] Existing artwork for {} is invalid: {}",
                    self.scope, artist.name, rejection
                );
                false
            }
        }
    }
}

fn check_min_edge(decoded: &DynamicImage, min_edge_px: u32) -> Result<(), ArtworkRejection> {
    let (width, height) = decoded.dimensions();
    if width < min_edge_px || height < min_edge_px {
        return Err(ArtworkRejection::TooSmall {
            width,
            height,
            min: min_edge_px,
        });
    }
    Ok(())
}

fn source_format(bytes: &[u8]) -> Option<ImageFormat> {
    if looks_like_jpeg(bytes) {
        return Some(ImageFormat::Jpeg);
    }
    image::guess_format(bytes).ok()
}

fn encode_jpeg(decoded: &DynamicImage, quality: u8) -> Result<Vec<u8>, ArtworkRejection> {
    let mut encoded = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100));
    encoder
        .encode_image(&DynamicImage::ImageRgb8(decoded.to_rgb8()))
        .map_err(|err| ArtworkRejection::Encode(err.to_string()))?;
    Ok(encoded)
}

fn looks_like_jpeg(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0xff && bytes[1] == 0xd8
}

fn decode_jpeg_non_strict(bytes: &[u8]) -> Option<DynamicImage> {
    if !looks_like_jpeg(bytes) {
        return None;
    }

    let options = DecoderOptions::new_cmd()
        .set_strict_mode(false)
        .jpeg_set_out_colorspace(ColorSpace::RGBA);
    let mut decoder = JpegDecoder::new_with_options(bytes, options);
    let pixels = decoder.decode().ok()?;
    let (width, height) = decoder.dimensions()?;
    let image = image::RgbaImage::from_raw(width as u32, height as u32, pixels)?;
    Some(DynamicImage::ImageRgba8(image))
}

pub fn decode_image_from_memory_with_fallback(bytes: &[u8]) -> Option<DynamicImage> {
    // Lenient JPEG decoding only runs when the primary decoder gives up.
    image::load_from_memory(bytes)
        .ok()
        .or_else(|| decode_jpeg_non_strict(bytes))
}
