//! Audio processing: G.711 codecs, PCM16 helpers, sample-rate conversion.

pub mod codecs;
pub mod resampler;

/// Convert raw bytes to i16 PCM samples (little-endian).
///
/// A trailing odd byte is ignored (i16 requires 2 bytes).
pub fn bytes_to_i16(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Convert i16 PCM samples to little-endian bytes.
pub fn i16_to_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

/// RMS (root mean square) of PCM16 little-endian audio.
pub fn rms(pcm: &[u8]) -> f32 {
    let n = pcm.len() / 2;
    if n == 0 {
        return 0.0;
    }
    let sum_squares: f64 = pcm
        .chunks_exact(2)
        .map(|chunk| {
            let s = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
            s * s
        })
        .sum();
    (sum_squares / n as f64).sqrt() as f32
}
