//! Raw PCM helpers.

use crate::chunk::BYTES_PER_SAMPLE;

/// Wrap raw little-endian 16-bit PCM in a WAV container.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let data_len = pcm.len() as u32;
    let byte_rate = sample_rate * u32::from(channels) * u32::from(bits_per_sample) / 8;
    let block_align = channels * bits_per_sample / 8;

    let mut wav = Vec::with_capacity(44 + pcm.len());

    // RIFF header
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");

    // fmt chunk
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM format
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());

    // data chunk
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);

    wav
}

/// Playback duration of `byte_len` bytes of 16-bit PCM.
pub fn duration_ms(byte_len: usize, sample_rate: u32, channels: u16) -> u64 {
    let frame_bytes = BYTES_PER_SAMPLE as u64 * u64::from(channels.max(1));
    let frames = byte_len as u64 / frame_bytes;
    if sample_rate == 0 {
        return 0;
    }
    frames * 1000 / u64::from(sample_rate)
}
