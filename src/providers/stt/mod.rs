//! Speech-to-text providers.

pub mod deepgram;

pub use deepgram::DeepgramStt;
