//! Sample rate conversion.
//!
//! Linear-interpolation resampling between the common telephony rates
//! (8 kHz, 16 kHz, 48 kHz). All audio is PCM16 little-endian mono. The
//! output length contract is exact: `floor(in_samples * to_rate / from_rate)`
//! samples, so a 20 ms frame stays a 20 ms frame across the bridge.

use std::borrow::Cow;

/// Resample PCM16 little-endian audio from one sample rate to another.
///
/// Equal rates return the input borrowed (zero copy). Empty input returns
/// empty output. Interpolated samples are clamped to the i16 range.
pub fn resample(data: &[u8], from_rate: u32, to_rate: u32) -> Cow<'_, [u8]> {
    if from_rate == to_rate {
        return Cow::Borrowed(data);
    }

    let n_samples = data.len() / 2;
    if n_samples == 0 {
        return Cow::Owned(Vec::new());
    }

    let samples: Vec<i16> = data
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect();

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (n_samples as u64 * to_rate as u64 / from_rate as u64) as usize;

    let mut out = Vec::with_capacity(out_len * 2);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let src_idx = src_pos as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < n_samples {
            samples[src_idx] as f64 * (1.0 - frac) + samples[src_idx + 1] as f64 * frac
        } else {
            samples[src_idx.min(n_samples - 1)] as f64
        };

        let clamped = sample.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
        out.extend_from_slice(&clamped.to_le_bytes());
    }

    Cow::Owned(out)
}

/// Stateful resampler bound to a source/target rate pair.
#[derive(Debug, Clone, Copy)]
pub struct Resampler {
    pub from_rate: u32,
    pub to_rate: u32,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self { from_rate, to_rate }
    }

    /// Resample a chunk of PCM16 audio.
    pub fn process<'a>(&self, data: &'a [u8]) -> Cow<'a, [u8]> {
        resample(data, self.from_rate, self.to_rate)
    }

    /// Whether this resampler actually changes the sample rate.
    pub fn needs_resample(&self) -> bool {
        self.from_rate != self.to_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::i16_to_bytes;

    #[test]
    fn test_identity_is_byte_exact() {
        let data = i16_to_bytes(&(0..10).collect::<Vec<i16>>());
        let result = resample(&data, 8000, 8000);
        assert_eq!(result.as_ref(), data.as_slice());
        assert!(matches!(result, Cow::Borrowed(_)));
    }

    #[test]
    fn test_upsample_doubles_length() {
        let data = i16_to_bytes(&[1000; 100]);
        let result = resample(&data, 8000, 16000);
        assert_eq!(result.len(), data.len() * 2);
    }

    #[test]
    fn test_downsample_halves_length() {
        let data = i16_to_bytes(&[1000; 200]);
        let result = resample(&data, 16000, 8000);
        assert_eq!(result.len(), data.len() / 2);
    }

    #[test]
    fn test_length_contract_across_rates() {
        let rates = [8000u32, 16000, 48000];
        let data = i16_to_bytes(&(0..160).map(|i| (i * 7 % 100) as i16).collect::<Vec<_>>());
        let n = data.len() as u64 / 2;
        for from in rates {
            for to in rates {
                let out = resample(&data, from, to);
                let expected = (n * to as u64 / from as u64) as usize * 2;
                assert_eq!(out.len(), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_interpolation_midpoints() {
        // Doubling the rate puts new samples halfway between the originals.
        let data = i16_to_bytes(&[0, 100, 200, 300]);
        let out = resample(&data, 8000, 16000);
        let samples = crate::audio::bytes_to_i16(&out);
        assert_eq!(samples[0], 0);
        assert_eq!(samples[1], 50);
        assert_eq!(samples[2], 100);
        assert_eq!(samples[3], 150);
    }

    #[test]
    fn test_empty_input() {
        assert!(resample(&[], 8000, 16000).is_empty());
    }

    #[test]
    fn test_random_audio_length_contract() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let samples: Vec<i16> = (0..320).map(|_| rng.gen()).collect();
        let data = i16_to_bytes(&samples);

        assert_eq!(resample(&data, 8000, 16000).len(), data.len() * 2);
        assert_eq!(resample(&data, 16000, 8000).len(), data.len() / 2);
        assert_eq!(resample(&data, 8000, 8000).as_ref(), data.as_slice());
    }

    #[test]
    fn test_resampler_struct() {
        let up = Resampler::new(8000, 16000);
        assert!(up.needs_resample());
        assert_eq!(up.process(&i16_to_bytes(&[500; 50])).len(), 200);

        let noop = Resampler::new(8000, 8000);
        assert!(!noop.needs_resample());
    }
}
