#![no_main]

use cm_protocol::utils::compression::{compress, decompress, decompress_detected, CompressionKind};
use libfuzzer_sys::fuzz_target;

const KINDS: [CompressionKind; 4] = [
    CompressionKind::Lzma,
    CompressionKind::VZip,
    CompressionKind::VZstd,
    CompressionKind::Gzip,
];

fuzz_target!(|data: &[u8]| {
    for kind in KINDS {
        if let Ok(packed) = compress(data, kind) {
            assert_eq!(decompress(&packed, kind).ok().as_deref(), Some(data));
        }
        // Malformed containers must respect the size limit and never panic
        let _ = decompress(data, kind);
    }
    let _ = decompress_detected(data);
});
