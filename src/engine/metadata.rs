// src/engine/metadata.rs
//
// EXIF and ICC pass-through using img-parts.
// img-parts cannot parse HEIF containers; extract() yields nothing for them
// and the HEIF decoder supplies their metadata instead.

use crate::error::BatchError;
use crate::task::OutputFormat;
use img_parts::jpeg::Jpeg;
use img_parts::png::Png;
use img_parts::webp::WebP;
use img_parts::{Bytes, DynImage, ImageEXIF, ImageICC};

/// Metadata blocks lifted from a source file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub exif: Option<Bytes>,
    pub icc: Option<Bytes>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.exif.is_none() && self.icc.is_none()
    }
}

/// Read EXIF and ICC from JPEG, PNG or WebP bytes.
pub fn extract(data: &[u8]) -> Metadata {
    match DynImage::from_bytes(Bytes::copy_from_slice(data)) {
        Ok(Some(image)) => Metadata {
            exif: image.exif(),
            icc: image.icc_profile(),
        },
        _ => Metadata::default(),
    }
}

/// Write metadata into freshly encoded bytes.
pub fn embed(encoded: Vec<u8>, metadata: &Metadata, format: OutputFormat) -> Result<Vec<u8>, BatchError> {
    if metadata.is_empty() {
        return Ok(encoded);
    }
    let name = format.as_str();
    let parse_err = |e: img_parts::Error| {
        BatchError::encode_failed(name, format!("failed to parse output for metadata: {e}"))
    };
    let write_err = |e: std::io::Error| {
        BatchError::encode_failed(name, format!("failed to write metadata: {e}"))
    };

    let mut output = Vec::with_capacity(encoded.len() + 1024);
    match format {
        OutputFormat::Jpeg => {
            let mut jpeg = Jpeg::from_bytes(Bytes::from(encoded)).map_err(parse_err)?;
            apply(&mut jpeg, metadata);
            jpeg.encoder().write_to(&mut output).map_err(write_err)?;
        }
        OutputFormat::Png => {
            let mut png = Png::from_bytes(Bytes::from(encoded)).map_err(parse_err)?;
            apply(&mut png, metadata);
            png.encoder().write_to(&mut output).map_err(write_err)?;
        }
        OutputFormat::WebP => {
            let mut webp = WebP::from_bytes(Bytes::from(encoded)).map_err(parse_err)?;
            apply(&mut webp, metadata);
            webp.encoder().write_to(&mut output).map_err(write_err)?;
        }
    }
    Ok(output)
}

fn apply<T: ImageEXIF + ImageICC>(image: &mut T, metadata: &Metadata) {
    if let Some(exif) = &metadata.exif {
        image.set_exif(Some(exif.clone()));
    }
    if let Some(icc) = &metadata.icc {
        image.set_icc_profile(Some(icc.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::converter::encode;
    use image::{DynamicImage, ImageBuffer, Rgb};

    fn tiny_jpeg() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([200, 100, 50])));
        encode(&img, OutputFormat::Jpeg, 80).unwrap()
    }

    // Minimal big-endian TIFF header with zero IFD entries. img-parts adds
    // the "Exif\0\0" marker itself.
    fn exif_block() -> Bytes {
        Bytes::from_static(b"MM\0*\0\0\0\x08\0\0\0\0\0\0")
    }

    #[test]
    fn test_extract_from_unknown_format_is_empty() {
        assert!(extract(b"ftypheic-not-supported").is_empty());
    }

    #[test]
    fn test_embed_with_empty_metadata_is_identity() {
        let jpeg = tiny_jpeg();
        let out = embed(jpeg.clone(), &Metadata::default(), OutputFormat::Jpeg).unwrap();
        assert_eq!(out, jpeg);
    }

    #[test]
    fn test_exif_roundtrip_through_jpeg() {
        let metadata = Metadata {
            exif: Some(exif_block()),
            icc: None,
        };
        let tagged = embed(tiny_jpeg(), &metadata, OutputFormat::Jpeg).unwrap();
        let extracted = extract(&tagged);
        assert_eq!(extracted.exif, Some(exif_block()));
        // still a decodable image
        assert!(image::load_from_memory(&tagged).is_ok());
    }

    #[test]
    fn test_embed_rejects_garbage() {
        let metadata = Metadata {
            exif: Some(exif_block()),
            icc: None,
        };
        let err = embed(b"nope".to_vec(), &metadata, OutputFormat::Jpeg).unwrap_err();
        assert!(matches!(err, BatchError::EncodeFailed { .. }));
    }
}
