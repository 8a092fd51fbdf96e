//! Fixed-size PCM windows sized for a playback duration.

/// 16-bit mono PCM.
pub const BYTES_PER_SAMPLE: usize = 2;

/// Bytes in one window of `chunk_ms` at `sample_rate` (16-bit mono).
///
/// Never returns less than one sample.
pub fn window_bytes(sample_rate: u32, chunk_ms: u32) -> usize {
    let bytes = u64::from(sample_rate) * BYTES_PER_SAMPLE as u64 * u64::from(chunk_ms) / 1000;
    (bytes as usize).max(BYTES_PER_SAMPLE)
}

/// Split a PCM buffer into `chunk_size` slices; the last one may be shorter.
pub fn chunk_pcm(pcm: &[u8], chunk_size: usize) -> std::slice::Chunks<'_, u8> {
    pcm.chunks(chunk_size.max(1))
}
