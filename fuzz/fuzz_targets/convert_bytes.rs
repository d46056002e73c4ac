#![no_main]

//! Arbitrary bytes through the in-memory conversion path.
//! Must return an error, never panic, for anything that is not a valid image.

use arbitrary::Arbitrary;
use lazy_batch::engine::convert_bytes;
use lazy_batch::{ConversionOptions, OutputFormat};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    data: Vec<u8>,
    format_byte: u8,
    quality: u8,
    preserve_metadata: bool,
}

fn format_from_byte(b: u8) -> OutputFormat {
    match b % 3 {
        0 => OutputFormat::Jpeg,
        1 => OutputFormat::Png,
        _ => OutputFormat::WebP,
    }
}

fuzz_target!(|input: Input| {
    if input.data.is_empty() {
        return;
    }
    let options = ConversionOptions {
        format: format_from_byte(input.format_byte),
        quality: input.quality.min(100),
        preserve_metadata: input.preserve_metadata,
        retire_source: false,
    };
    let _ = convert_bytes(&input.data, &options, "fuzz");
});
