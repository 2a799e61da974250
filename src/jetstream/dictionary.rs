//! Process-wide zstd decompression dictionary.
//!
//! Jetstream compresses every frame against a fixed custom dictionary
//! shipped with the client. The blob is embedded at build time and
//! loaded into a prepared [`DecoderDictionary`] once, at first use;
//! the resource is immutable afterwards and shared by every stream
//! instance in the process.

use std::io;
use std::sync::OnceLock;

use zstd::bulk::Decompressor;
use zstd::dict::DecoderDictionary;

static DICTIONARY_BYTES: &[u8] = include_bytes!("zstd_dictionary.bin");

static DICTIONARY: OnceLock<DecoderDictionary<'static>> = OnceLock::new();

fn dictionary() -> &'static DecoderDictionary<'static> {
    DICTIONARY.get_or_init(|| DecoderDictionary::copy(DICTIONARY_BYTES))
}

/// A decompressor primed with the shared dictionary. Each adapter
/// holds one and reuses it across frames.
pub(crate) fn new_decompressor() -> io::Result<Decompressor<'static>> {
    Decompressor::with_prepared_dictionary(dictionary())
}

#[cfg(test)]
pub(crate) fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::bulk::Compressor::with_dictionary(0, DICTIONARY_BYTES)?.compress(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_shared_dictionary() {
        let payload = br#"{"did":"did:plc:abc","time_us":1725519626134432,"kind":"commit"}"#;
        let compressed = compress(payload).unwrap();
        let decompressed = new_decompressor()
            .unwrap()
            .decompress(&compressed, payload.len() + 1)
            .unwrap();
        assert_eq!(decompressed, payload);
    }

    #[test]
    fn capacity_bound_is_enforced() {
        let payload = vec![b'a'; 4096];
        let compressed = compress(&payload).unwrap();
        assert!(new_decompressor()
            .unwrap()
            .decompress(&compressed, 16)
            .is_err());
    }
}
