use crate::error::DecodeError;
use crate::protocol::ForwardMsg;

/// Turns wire bytes into messages and back. Implementations must be pure:
/// decoding the same bytes twice yields two independent, equal messages.
pub trait Codec {
    fn decode(&self, bytes: &[u8]) -> Result<ForwardMsg, DecodeError>;

    fn encode(&self, msg: &ForwardMsg) -> Result<Vec<u8>, DecodeError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, bytes: &[u8]) -> Result<ForwardMsg, DecodeError> {
        serde_json::from_slice(bytes).map_err(|err| DecodeError::Malformed(err.to_string()))
    }

    fn encode(&self, msg: &ForwardMsg) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(msg).map_err(|err| DecodeError::Encode(err.to_string()))
    }
}
