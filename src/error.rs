//! Top-level error rollup.

use thiserror::Error;

use crate::audio::codecs::CodecError;
use crate::config::ConfigError;
use crate::providers::ProviderError;
use crate::serializers::SerializerError;
use crate::transports::TransportError;

/// Any error the bridge can surface. Connection-scoped failures end the
/// owning call; only configuration and bind failures are process-fatal.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Serializer(#[from] SerializerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
