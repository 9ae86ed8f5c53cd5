//! G.711 codec engine.
//!
//! Pure-Rust mu-law and A-law encode/decode via lookup tables built once at
//! startup, PCM16 passthrough, and a hub-and-spoke [`CodecRegistry`] that
//! routes every conversion through PCM16. The registry stores N encoders and
//! N decoders instead of N^2 converters.
//!
//! Opus is optional and not wired by default; converting to or from an
//! unregistered codec fails with [`CodecError::Unsupported`].

use once_cell::sync::Lazy;
use std::collections::HashMap;
use thiserror::Error;

use crate::core::events::Codec;

/// Codec errors. Unsupported codecs are fatal to the owning call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported codec: {0}")]
    Unsupported(Codec),
}

// ---------------------------------------------------------------------------
// G.711 mu-law
// ---------------------------------------------------------------------------

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Encode a single PCM16 sample to mu-law (ITU-T G.711).
fn mulaw_encode_sample(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign: u8 = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };

    if s > MULAW_CLIP {
        s = MULAW_CLIP;
    }
    s += MULAW_BIAS;

    // Exponent = position of the highest set bit above bit 7.
    let mut exponent: u8 = 7;
    let mut exp_mask = 0x4000;
    for _ in 0..8 {
        if s & exp_mask != 0 {
            break;
        }
        exponent -= 1;
        exp_mask >>= 1;
    }

    let mantissa = ((s >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// mu-law byte -> PCM16 sample.
static MULAW_DECODE_TABLE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        let v = !(byte as u8);
        let sign = v & 0x80;
        let exponent = (v >> 4) & 0x07;
        let mantissa = (v & 0x0F) as i32;
        let t = ((mantissa << 3) + MULAW_BIAS) << exponent;
        let mut sample = t - MULAW_BIAS;
        if sign != 0 {
            sample = -sample;
        }
        *slot = sample as i16;
    }
    table
});

/// Unsigned-16 sample index -> mu-law byte.
static MULAW_ENCODE_TABLE: Lazy<Box<[u8; 65536]>> = Lazy::new(|| {
    let mut table = Box::new([0u8; 65536]);
    for i in 0..65536usize {
        table[i] = mulaw_encode_sample(i as u16 as i16);
    }
    table
});

/// Decode mu-law bytes to PCM16 little-endian bytes.
pub fn mulaw_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        out.extend_from_slice(&MULAW_DECODE_TABLE[b as usize].to_le_bytes());
    }
    out
}

/// Encode PCM16 little-endian bytes to mu-law bytes.
pub fn mulaw_encode(pcm: &[u8]) -> Vec<u8> {
    let table = &**MULAW_ENCODE_TABLE;
    let mut out = Vec::with_capacity(pcm.len() / 2);
    for chunk in pcm.chunks_exact(2) {
        let idx = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
        out.push(table[idx]);
    }
    out
}

// ---------------------------------------------------------------------------
// G.711 A-law
// ---------------------------------------------------------------------------

/// Encode a single PCM16 sample to A-law. The final byte is XORed with 0x55
/// (A-law's even-bit inversion).
fn alaw_encode_sample(sample: i16) -> u8 {
    let mut s = sample as i32;
    let sign: u8 = if s < 0 {
        s = -s;
        0x80
    } else {
        0
    };
    if s > 32767 {
        s = 32767;
    }

    let byte = if s >= 256 {
        let mut exponent: u8 = 7;
        let mut exp_mask = 0x4000;
        while exponent > 1 && s & exp_mask == 0 {
            exponent -= 1;
            exp_mask >>= 1;
        }
        let mantissa = ((s >> (exponent + 3)) & 0x0F) as u8;
        sign | (exponent << 4) | mantissa
    } else {
        sign | (s >> 4) as u8
    };

    byte ^ 0x55
}

/// A-law byte -> PCM16 sample.
static ALAW_DECODE_TABLE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (byte, slot) in table.iter_mut().enumerate() {
        let v = (byte as u8) ^ 0x55;
        let sign = v & 0x80;
        let exponent = (v >> 4) & 0x07;
        let mantissa = (v & 0x0F) as i32;
        let mut sample = if exponent == 0 {
            (mantissa << 4) + 8
        } else {
            ((mantissa << 4) + 264) << (exponent - 1)
        };
        if sign != 0 {
            sample = -sample;
        }
        *slot = sample as i16;
    }
    table
});

/// Unsigned-16 sample index -> A-law byte.
static ALAW_ENCODE_TABLE: Lazy<Box<[u8; 65536]>> = Lazy::new(|| {
    let mut table = Box::new([0u8; 65536]);
    for i in 0..65536usize {
        table[i] = alaw_encode_sample(i as u16 as i16);
    }
    table
});

/// Decode A-law bytes to PCM16 little-endian bytes.
pub fn alaw_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2);
    for &b in data {
        out.extend_from_slice(&ALAW_DECODE_TABLE[b as usize].to_le_bytes());
    }
    out
}

/// Encode PCM16 little-endian bytes to A-law bytes.
pub fn alaw_encode(pcm: &[u8]) -> Vec<u8> {
    let table = &**ALAW_ENCODE_TABLE;
    let mut out = Vec::with_capacity(pcm.len() / 2);
    for chunk in pcm.chunks_exact(2) {
        let idx = u16::from_le_bytes([chunk[0], chunk[1]]) as usize;
        out.push(table[idx]);
    }
    out
}

// ---------------------------------------------------------------------------
// Codec Registry
// ---------------------------------------------------------------------------

type CodecFn = Box<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Hub-and-spoke codec conversion registry.
///
/// All conversions route through PCM16 as the intermediate format. Custom
/// encoders/decoders (e.g. an Opus wrapper) can be registered before the
/// registry is shared; it is read-only once sessions exist.
pub struct CodecRegistry {
    decoders: HashMap<Codec, CodecFn>,
    encoders: HashMap<Codec, CodecFn>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        let mut decoders: HashMap<Codec, CodecFn> = HashMap::new();
        let mut encoders: HashMap<Codec, CodecFn> = HashMap::new();

        decoders.insert(Codec::Mulaw, Box::new(|d| mulaw_decode(d)));
        decoders.insert(Codec::Alaw, Box::new(|d| alaw_decode(d)));
        decoders.insert(Codec::Pcm16, Box::new(|d| d.to_vec()));

        encoders.insert(Codec::Mulaw, Box::new(|d| mulaw_encode(d)));
        encoders.insert(Codec::Alaw, Box::new(|d| alaw_encode(d)));
        encoders.insert(Codec::Pcm16, Box::new(|d| d.to_vec()));

        Self { decoders, encoders }
    }

    /// Decode from any supported codec to PCM16.
    pub fn decode(&self, data: &[u8], codec: Codec) -> Result<Vec<u8>, CodecError> {
        self.decoders
            .get(&codec)
            .map(|f| f(data))
            .ok_or(CodecError::Unsupported(codec))
    }

    /// Encode PCM16 data to any supported codec.
    pub fn encode(&self, pcm: &[u8], codec: Codec) -> Result<Vec<u8>, CodecError> {
        self.encoders
            .get(&codec)
            .map(|f| f(pcm))
            .ok_or(CodecError::Unsupported(codec))
    }

    /// Convert audio from one codec to another via the PCM16 hub.
    pub fn convert(&self, data: &[u8], from: Codec, to: Codec) -> Result<Vec<u8>, CodecError> {
        if from == to {
            return Ok(data.to_vec());
        }
        let pcm = self.decode(data, from)?;
        self.encode(&pcm, to)
    }

    /// Register a custom decoder (codec -> PCM16).
    pub fn register_decoder(&mut self, codec: Codec, f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        self.decoders.insert(codec, Box::new(f));
    }

    /// Register a custom encoder (PCM16 -> codec).
    pub fn register_encoder(&mut self, codec: Codec, f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static) {
        self.encoders.insert(codec, Box::new(f));
    }

    /// Codecs that have both an encoder and a decoder.
    pub fn supported_codecs(&self) -> Vec<Codec> {
        Codec::ALL
            .into_iter()
            .filter(|c| self.decoders.contains_key(c) && self.encoders.contains_key(c))
            .collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
