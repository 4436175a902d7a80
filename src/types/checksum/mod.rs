#![forbid(unsafe_code)]

/// Incremental checksum over byte chunks.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes into the checksum.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed so far without consuming state.
    fn finalize(&self) -> u32;
}

/// CRC32 (IEEE) backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 over the concatenation of `chunks`.
pub fn crc32_of(chunks: &[&[u8]]) -> u32 {
    let mut hasher = Crc32Fast::default();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize()
}

/// Folds a frame into the running journal chain value.
///
/// The chain packs the frame length into the high half and the CRC of
/// `(previous chain, header, payload)` into the low half, so a frame spliced
/// in from another file or position never validates.
pub fn chain_crc32(prev_chain: u64, header: &[u8], payload: &[u8]) -> u64 {
    let mut hasher = Crc32Fast::default();
    hasher.update(&prev_chain.to_be_bytes());
    hasher.update(header);
    hasher.update(payload);
    let frame_len = (header.len() + payload.len()) as u64;
    (frame_len << 32) | u64::from(hasher.finalize())
}
