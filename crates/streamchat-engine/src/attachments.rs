use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use streamchat_contracts::data_url::{estimate_data_url_bytes, to_data_url};
use streamchat_contracts::messages::OptimizedImageAttachment;

pub const MAX_ORIGINAL_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const COMPRESSION_TRIGGER_BYTES: u64 = 900 * 1024;
pub const MAX_BASE64_ATTACHMENT_BYTES: u64 = 1536 * 1024;
pub const MAX_EDGE_PX: u32 = 1600;
pub const MIN_EDGE_PX: u32 = 512;
pub const DEFAULT_JPEG_QUALITY: f32 = 0.85;
pub const MIN_JPEG_QUALITY: f32 = 0.55;
pub const JPEG_QUALITY_STEP: f32 = 0.10;
pub const DOWNSCALE_STEP: f32 = 0.85;
pub const JPEG_MIME: &str = "image/jpeg";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
const FLOOR_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptimizerConfig {
    pub max_original_bytes: u64,
    pub compression_trigger_bytes: u64,
    pub max_encoded_bytes: u64,
    pub max_edge: u32,
    pub min_edge: u32,
    pub initial_quality: f32,
    pub min_quality: f32,
    pub quality_step: f32,
    pub scale_step: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_original_bytes: MAX_ORIGINAL_FILE_BYTES,
            compression_trigger_bytes: COMPRESSION_TRIGGER_BYTES,
            max_encoded_bytes: MAX_BASE64_ATTACHMENT_BYTES,
            max_edge: MAX_EDGE_PX,
            min_edge: MIN_EDGE_PX,
            initial_quality: DEFAULT_JPEG_QUALITY,
            min_quality: MIN_JPEG_QUALITY,
            quality_step: JPEG_QUALITY_STEP,
            scale_step: DOWNSCALE_STEP,
        }
    }
}

impl OptimizerConfig {
    /// The search only terminates when both axes strictly shrink.
    pub fn validate(&self) -> Result<()> {
        if self.max_edge == 0 || self.min_edge == 0 {
            bail!("edge limits must be positive");
        }
        if !(self.quality_step > 0.0) {
            bail!("quality step must be positive");
        }
        if !(self.scale_step > 0.0 && self.scale_step < 1.0) {
            bail!("scale step must be between 0 and 1");
        }
        if !(self.min_quality > 0.0 && self.min_quality <= self.initial_quality)
            || self.initial_quality > 1.0
        {
            bail!("JPEG quality bounds must satisfy 0 < min <= initial <= 1");
        }
        Ok(())
    }
}

/// A user-selected file before optimization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentSource {
    pub name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl AttachmentSource {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("image")
            .to_string();
        Ok(Self::new(name, guess_mime(path), bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn read_as_data_url(&self) -> String {
        to_data_url(&self.mime_type, &self.bytes)
    }
}

/// One render/encode pass of the compression search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressionAttempt {
    pub quality: f32,
    pub scale: f32,
    pub width: u32,
    pub height: u32,
    pub encoded_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Compressed {
    pub attachment: OptimizedImageAttachment,
    pub attempts: Vec<CompressionAttempt>,
}

/// Caller-side gate applied before [`prepare`]: images only, at most
/// `max_original_bytes`.
pub fn validate_selection(source: &AttachmentSource, config: &OptimizerConfig) -> Result<()> {
    if !source.mime_type.to_ascii_lowercase().starts_with("image/") {
        bail!("{} is not an image", source.name);
    }
    if source.size() > config.max_original_bytes {
        bail!(
            "{} is larger than {} MB",
            source.name,
            megabytes(config.max_original_bytes)
        );
    }
    Ok(())
}

pub fn prepare(source: &AttachmentSource) -> Result<OptimizedImageAttachment> {
    prepare_with(source, &OptimizerConfig::default())
}

/// Produces an attachment whose encoded size fits `max_encoded_bytes`.
///
/// Small JPEGs pass through untouched. Everything else is re-encoded; if
/// re-encoding fails the original bytes are used as long as they fit.
pub fn prepare_with(
    source: &AttachmentSource,
    config: &OptimizerConfig,
) -> Result<OptimizedImageAttachment> {
    if is_jpeg(&source.mime_type) && source.size() <= config.compression_trigger_bytes {
        let data_url = source.read_as_data_url();
        let size = estimate_data_url_bytes(&data_url);
        if size <= config.max_encoded_bytes {
            return Ok(OptimizedImageAttachment {
                name: source.name.clone(),
                mime_type: source.mime_type.clone(),
                size,
                data_url,
            });
        }
    }

    match compress_with(source, config) {
        Ok(compressed) => Ok(compressed.attachment),
        Err(err) => {
            let data_url = source.read_as_data_url();
            let size = estimate_data_url_bytes(&data_url);
            if size > config.max_encoded_bytes {
                return Err(err.context(format!(
                    "{} exceeds the {} MB attachment limit",
                    source.name,
                    megabytes(config.max_encoded_bytes)
                )));
            }
            Ok(OptimizedImageAttachment {
                name: source.name.clone(),
                mime_type: source.mime_type.clone(),
                size,
                data_url,
            })
        }
    }
}

pub fn compress(source: &AttachmentSource) -> Result<Compressed> {
    compress_with(source, &OptimizerConfig::default())
}

/// Quality/scale search: quality drops first, in `quality_step` increments
/// down to `min_quality`; only then does the scale shrink by `scale_step`
/// down to the `min_edge` floor.
pub fn compress_with(source: &AttachmentSource, config: &OptimizerConfig) -> Result<Compressed> {
    config.validate()?;
    let decoded = image::load_from_memory(&source.bytes)
        .with_context(|| format!("failed to decode {}", source.name))?;
    let (width, height) = decoded.dimensions();
    if width == 0 || height == 0 {
        bail!("could not read dimensions of {}", source.name);
    }
    let pixels = flatten_onto_white(decoded);

    let longest = width.max(height) as f32;
    let mut scale = (config.max_edge as f32 / longest).min(1.0);
    if !scale.is_finite() || scale <= 0.0 {
        scale = 1.0;
    }
    let min_scale = (config.min_edge as f32 / longest).min(1.0);
    let mut quality = config.initial_quality;

    let mut attempts = Vec::new();
    let (mut data_url, mut attempt) = render_jpeg(&pixels, scale, quality)?;
    attempts.push(attempt);

    while attempt.encoded_bytes > config.max_encoded_bytes
        && (quality > config.min_quality + FLOOR_EPSILON || scale > min_scale + FLOOR_EPSILON)
    {
        if quality > config.min_quality + FLOOR_EPSILON {
            quality = (quality - config.quality_step).max(config.min_quality);
        } else {
            scale = (scale * config.scale_step).max(min_scale);
        }
        (data_url, attempt) = render_jpeg(&pixels, scale, quality)?;
        attempts.push(attempt);
    }

    if attempt.encoded_bytes > config.max_encoded_bytes {
        bail!(
            "{} could not be compressed under {} MB",
            source.name,
            megabytes(config.max_encoded_bytes)
        );
    }

    Ok(Compressed {
        attachment: OptimizedImageAttachment {
            name: jpeg_file_name(&source.name),
            mime_type: JPEG_MIME.to_string(),
            size: attempt.encoded_bytes,
            data_url,
        },
        attempts,
    })
}

fn render_jpeg(pixels: &RgbImage, scale: f32, quality: f32) -> Result<(String, CompressionAttempt)> {
    let width = scaled_dimension(pixels.width(), scale);
    let height = scaled_dimension(pixels.height(), scale);
    let resized;
    let frame = if width == pixels.width() && height == pixels.height() {
        pixels
    } else {
        resized = image::imageops::resize(pixels, width, height, FilterType::Triangle);
        &resized
    };

    let mut bytes = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut bytes, jpeg_quality_percent(quality));
    encoder
        .encode_image(frame)
        .context("JPEG encode failed")?;
    let data_url = to_data_url(JPEG_MIME, &bytes);
    let encoded_bytes = estimate_data_url_bytes(&data_url);
    Ok((
        data_url,
        CompressionAttempt {
            quality,
            scale,
            width,
            height,
            encoded_bytes,
        },
    ))
}

fn scaled_dimension(value: u32, scale: f32) -> u32 {
    ((value as f32 * scale).round() as u32).clamp(1, value.max(1))
}

fn jpeg_quality_percent(quality: f32) -> u8 {
    (quality * 100.0).round().clamp(1.0, 100.0) as u8
}

/// JPEG has no alpha channel; transparent pixels are composited over white.
fn flatten_onto_white(image: DynamicImage) -> RgbImage {
    if !image.color().has_alpha() {
        return image.into_rgb8();
    }
    let rgba = image.into_rgba8();
    let mut flattened = RgbImage::new(rgba.width(), rgba.height());
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u16::from(pixel[3]);
        let blend = |channel: u8| -> u8 {
            (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
        };
        flattened.put_pixel(x, y, Rgb([blend(pixel[0]), blend(pixel[1]), blend(pixel[2])]));
    }
    flattened
}

fn is_jpeg(mime: &str) -> bool {
    matches!(
        mime.trim().to_ascii_lowercase().as_str(),
        "image/jpeg" | "image/jpg"
    )
}

fn jpeg_file_name(name: &str) -> String {
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };
    let stem = stem.trim();
    if stem.is_empty() {
        "image.jpg".to_string()
    } else {
        format!("{stem}.jpg")
    }
}

pub fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

fn megabytes(bytes: u64) -> String {
    let text = format!("{:.6}", bytes as f64 / BYTES_PER_MB);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}
