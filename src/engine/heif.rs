// src/engine/heif.rs
//
// HEIC/HEIF sources. Decoding goes through libheif when the `heif` feature is
// enabled; without it HEIF input is recognized and rejected with an
// UnsupportedFormat error instead of an opaque decode failure.

use crate::engine::metadata::Metadata;
use crate::error::BatchError;
use image::DynamicImage;

/// Major and compatible brands that mark an ISO-BMFF file as HEIF.
const HEIF_BRANDS: [&[u8; 4]; 8] = [
    b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx", b"mif1", b"msf1",
];

/// Sniff the `ftyp` box for a HEIF brand.
pub fn is_heif(data: &[u8]) -> bool {
    if data.len() < 16 || &data[4..8] != b"ftyp" {
        return false;
    }
    let box_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let end = box_len.clamp(16, data.len());
    // major brand at 8..12, minor version at 12..16, then compatible brands
    std::iter::once(&data[8..12])
        .chain(data[16..end].chunks_exact(4))
        .any(|brand| HEIF_BRANDS.iter().any(|known| brand == known.as_slice()))
}

#[cfg(not(feature = "heif"))]
pub fn decode(_data: &[u8], label: &str) -> Result<(DynamicImage, Metadata), BatchError> {
    Err(BatchError::unsupported_format(
        label.to_string(),
        "HEIF input needs lazy-batch built with the `heif` feature",
    ))
}

#[cfg(feature = "heif")]
pub fn decode(data: &[u8], label: &str) -> Result<(DynamicImage, Metadata), BatchError> {
    use crate::engine::converter::check_dimensions;
    use image::RgbImage;
    use img_parts::Bytes;
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    let fail = |message: String| BatchError::decode_failed(label.to_string(), message);

    let ctx = HeifContext::read_from_bytes(data).map_err(|e| fail(e.to_string()))?;
    let handle = ctx.primary_image_handle().map_err(|e| fail(e.to_string()))?;
    check_dimensions(handle.width(), handle.height()).map_err(fail)?;

    let metadata = Metadata {
        exif: handle
            .metadata_block_ids(b"Exif")
            .into_iter()
            .find_map(|id| handle.metadata(id).ok())
            .and_then(|block| strip_exif_offset(&block))
            .map(Bytes::from),
        icc: handle
            .color_profile_raw()
            .map(|profile| Bytes::from(profile.data)),
    };

    let heif = LibHeif::new();
    let decoded = heif
        .decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)
        .map_err(|e| fail(e.to_string()))?;
    let plane = decoded
        .planes()
        .interleaved
        .ok_or_else(|| fail("no interleaved RGB plane".to_string()))?;
    if plane.bits_per_pixel != 8 {
        return Err(fail(format!("unsupported bit depth {}", plane.bits_per_pixel)));
    }

    // rows are padded to `stride`
    let (width, height) = (plane.width, plane.height);
    let row_len = width as usize * 3;
    if plane.stride == 0 || plane.stride < row_len {
        return Err(fail(format!("stride {} shorter than a row", plane.stride)));
    }
    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in plane.data.chunks(plane.stride).take(height as usize) {
        let row = row
            .get(..row_len)
            .ok_or_else(|| fail("truncated pixel row".to_string()))?;
        pixels.extend_from_slice(row);
    }
    let rgb = RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| fail("pixel buffer size mismatch".to_string()))?;
    Ok((DynamicImage::ImageRgb8(rgb), metadata))
}

/// HEIF stores EXIF as a 4-byte big-endian offset followed by the block;
/// the TIFF header starts `offset` bytes after it.
#[cfg_attr(not(feature = "heif"), allow(dead_code))]
fn strip_exif_offset(block: &[u8]) -> Option<Vec<u8>> {
    let offset = u32::from_be_bytes(block.get(..4)?.try_into().ok()?) as usize;
    let tiff = block.get(4usize.checked_add(offset)?..)?;
    if tiff.starts_with(b"MM\0*") || tiff.starts_with(b"II*\0") {
        Some(tiff.to_vec())
    } else {
        None
    }
}
