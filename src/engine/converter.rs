// src/engine/converter.rs
//
// The Conversion Function seam and the default image converter.
//
// Converters must never partially overwrite the destination and must leave the
// source untouched. write_atomically() gives every converter that guarantee:
// bytes go to a temp file in the target directory which is renamed over the
// destination only once fully written and synced.

use crate::engine::{heif, metadata, MAX_DIMENSION, MAX_PIXELS};
use crate::error::BatchError;
use crate::task::{ConversionOptions, OutputFormat, Task};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, ImageReader};
use memmap2::Mmap;
use std::borrow::Cow;
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// Sizes reported by a successful conversion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Converted {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Executes one task. Called concurrently from many workers with distinct
/// tasks; may be slow and may panic (panics become InternalFault results).
pub trait Converter: Send + Sync {
    fn convert(&self, task: &Task) -> Result<Converted, BatchError>;
}

impl<F> Converter for F
where
    F: Fn(&Task) -> Result<Converted, BatchError> + Send + Sync,
{
    fn convert(&self, task: &Task) -> Result<Converted, BatchError> {
        self(task)
    }
}

/// Source extensions ImageConverter can decode in this build.
#[cfg(feature = "heif")]
const DECODABLE_EXTENSIONS: &[&str] = &["heic", "heif", "jpg", "jpeg", "png", "webp"];
#[cfg(not(feature = "heif"))]
const DECODABLE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Decode with the image crate (or libheif for HEIF sources), encode to the
/// task's format.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageConverter;

impl ImageConverter {
    pub fn decodable_extensions() -> &'static [&'static str] {
        DECODABLE_EXTENSIONS
    }

    /// Case-insensitive; a leading dot is ignored.
    pub fn decodes_extension(extension: &str) -> bool {
        let extension = extension.trim().trim_start_matches('.');
        DECODABLE_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(extension))
    }
}

impl Converter for ImageConverter {
    fn convert(&self, task: &Task) -> Result<Converted, BatchError> {
        let source = task.source();
        let data = map_source(source)?;
        let bytes_in = data.len() as u64;
        let encoded = convert_bytes(&data, task.options(), &source.display().to_string())?;
        let bytes_out = write_atomically(task.destination(), &encoded)?;
        Ok(Converted {
            bytes_in,
            bytes_out,
        })
    }
}

fn map_source(path: &Path) -> Result<Mmap, BatchError> {
    let display = || path.display().to_string();
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            BatchError::source_not_found(display())
        } else {
            BatchError::read_failed(display(), e)
        }
    })?;
    let len = file
        .metadata()
        .map_err(|e| BatchError::read_failed(display(), e))?
        .len();
    if len == 0 {
        return Err(BatchError::decode_failed(display(), "file is empty"));
    }
    // Safety: the source is only read. If another process truncates it while
    // mapped, decoding may fail or the OS may raise SIGBUS.
    unsafe { Mmap::map(&file) }.map_err(|e| BatchError::read_failed(display(), e))
}

/// Decode `data`, re-encode it per `options` and carry metadata over.
/// `label` names the source in errors.
pub fn convert_bytes(
    data: &[u8],
    options: &ConversionOptions,
    label: &str,
) -> Result<Vec<u8>, BatchError> {
    // img-parts cannot read HEIF containers, so libheif hands back its metadata
    let (img, heif_metadata) = if heif::is_heif(data) {
        let (img, carried) = heif::decode(data, label)?;
        (img, Some(carried))
    } else {
        ensure_dimensions_safe(data)
            .map_err(|reason| BatchError::decode_failed(label.to_string(), reason))?;
        let img = image::load_from_memory(data)
            .map_err(|e| BatchError::decode_failed(label.to_string(), e.to_string()))?;
        (img, None)
    };

    let encoded = encode(&img, options.format, options.quality)?;
    if !options.preserve_metadata {
        return Ok(encoded);
    }
    let carried = heif_metadata.unwrap_or_else(|| metadata::extract(data));
    metadata::embed(encoded, &carried, options.format)
}

/// Reject images whose header declares dimensions beyond the security limits.
pub fn check_dimensions(width: u32, height: u32) -> Result<(), String> {
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(format!(
            "dimension {} exceeds limit {MAX_DIMENSION}",
            width.max(height)
        ));
    }
    let pixels = width as u64 * height as u64;
    if pixels > MAX_PIXELS {
        return Err(format!("pixel count {pixels} exceeds limit {MAX_PIXELS}"));
    }
    Ok(())
}

/// Inspect the header and check dimensions before decoding.
/// Headers the image crate cannot read are left for the decoder to report.
fn ensure_dimensions_safe(bytes: &[u8]) -> Result<(), String> {
    if let Ok(reader) = ImageReader::new(Cursor::new(bytes)).with_guessed_format() {
        if let Ok((width, height)) = reader.into_dimensions() {
            return check_dimensions(width, height);
        }
    }
    Ok(())
}

/// Encode an image into the given format.
pub fn encode(img: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>, BatchError> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Jpeg => {
            // JPEG has no alpha channel; avoid the copy when already RGB8
            let rgb: Cow<'_, image::RgbImage> = match img {
                DynamicImage::ImageRgb8(rgb) => Cow::Borrowed(rgb),
                _ => Cow::Owned(img.to_rgb8()),
            };
            let (w, h) = rgb.dimensions();
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
            encoder
                .encode(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| BatchError::encode_failed("jpeg", e.to_string()))?;
        }
        OutputFormat::Png => {
            img.write_to(&mut Cursor::new(&mut buf), format.image_format())
                .map_err(|e| BatchError::encode_failed("png", e.to_string()))?;
        }
        OutputFormat::WebP => {
            // image's WebP encoder is lossless and wants 8-bit RGBA
            let rgba = DynamicImage::ImageRgba8(img.to_rgba8());
            rgba.write_to(&mut Cursor::new(&mut buf), format.image_format())
                .map_err(|e| BatchError::encode_failed("webp", e.to_string()))?;
        }
    }
    Ok(buf)
}

/// Write `data` to `path` atomically. Returns the number of bytes written.
pub fn write_atomically(path: &Path, data: &[u8]) -> Result<u64, BatchError> {
    let output_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(output_dir)
        .map_err(|e| BatchError::write_failed(output_dir.display().to_string(), e))?;

    // Same directory as the target so the rename never crosses filesystems
    let mut temp_file = NamedTempFile::new_in(output_dir)
        .map_err(|e| BatchError::write_failed(output_dir.display().to_string(), e))?;

    let temp_path = temp_file.path().to_path_buf();
    temp_file
        .write_all(data)
        .map_err(|e| BatchError::write_failed(temp_path.display().to_string(), e))?;
    temp_file
        .as_file_mut()
        .sync_all()
        .map_err(|e| BatchError::write_failed(temp_path.display().to_string(), e))?;

    // tempfile removes the temp file if persist fails
    temp_file
        .persist(path)
        .map_err(|e| BatchError::write_failed(path.display().to_string(), e.error))?;

    Ok(data.len() as u64)
}
