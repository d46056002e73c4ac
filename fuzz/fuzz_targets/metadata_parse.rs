#![no_main]

//! EXIF/ICC extraction on arbitrary data, and re-embedding whatever was found.

use lazy_batch::engine::meta::{embed, extract};
use lazy_batch::OutputFormat;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let found = extract(data);
    for format in [OutputFormat::Jpeg, OutputFormat::Png, OutputFormat::WebP] {
        let _ = embed(data.to_vec(), &found, format);
    }
});
