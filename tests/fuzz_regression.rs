//! Hostile-input regressions for the in-memory conversion path.
//! Each test should be cheap (single input) and run in the normal test suite.

use image::{ImageBuffer, ImageFormat, Rgb};
use lazy_batch::engine::{convert_bytes, meta, MAX_DIMENSION};
use lazy_batch::{BatchError, ConversionOptions};
use std::io::Cursor;

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn chunk(png: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
    let mut tagged = kind.to_vec();
    tagged.extend_from_slice(body);
    png.extend_from_slice(&(body.len() as u32).to_be_bytes());
    png.extend_from_slice(&tagged);
    png.extend_from_slice(&crc32(&tagged).to_be_bytes());
}

/// A PNG whose IHDR declares `width` x `height` but carries no pixel data.
fn png_header(width: u32, height: u32) -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);

    let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
    chunk(&mut png, b"IHDR", &ihdr);
    chunk(&mut png, b"IDAT", &[]);
    chunk(&mut png, b"IEND", &[]);
    png
}

fn valid_png() -> Vec<u8> {
    let img = ImageBuffer::from_pixel(8, 8, Rgb::<u8>([1, 2, 3]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .unwrap();
    out
}

#[test]
fn fuzz_regression_declared_dimensions_over_limit() {
    let data = png_header(MAX_DIMENSION + 1, 16);
    let err = convert_bytes(&data, &ConversionOptions::default(), "bomb.png").unwrap_err();
    match err {
        BatchError::DecodeFailed { message, .. } => assert!(message.contains("exceeds limit")),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn fuzz_regression_pixel_count_over_limit() {
    let data = png_header(20_000, 20_000);
    assert!(matches!(
        convert_bytes(&data, &ConversionOptions::default(), "wide.png"),
        Err(BatchError::DecodeFailed { .. })
    ));
}

#[test]
fn fuzz_regression_truncated_png() {
    let mut data = valid_png();
    data.truncate(data.len() / 2);
    assert!(convert_bytes(&data, &ConversionOptions::default(), "cut.png").is_err());
}

#[test]
fn fuzz_regression_jpeg_magic_with_garbage() {
    let mut data = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x02];
    data.extend(std::iter::repeat(0xAB).take(64));
    assert!(convert_bytes(&data, &ConversionOptions::default(), "junk.jpg").is_err());
    // metadata parsing of the same bytes must not panic either
    let _ = meta::extract(&data);
}

#[test]
fn fuzz_regression_single_byte() {
    assert!(convert_bytes(&[0x89], &ConversionOptions::default(), "one.bin").is_err());
}

#[test]
fn valid_png_still_converts() {
    let out = convert_bytes(&valid_png(), &ConversionOptions::default(), "ok.png").unwrap();
    assert_eq!(&out[..2], &[0xFF, 0xD8]);
}
