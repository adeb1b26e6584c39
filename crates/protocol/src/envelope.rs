use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::constants::{MessageType, PROTOCOL_VERSION};

/// Error details carried by a rejection envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: i32,
    pub message: String,
}

/// Envelope for all control traffic on a data channel.
///
/// Control messages need no request/response correlation: every payload
/// names the channel or file it concerns, and each channel delivers in
/// order. The envelope therefore carries only the sender's protocol
/// version, the message type, and the payload, deferred as
/// `serde_json::value::RawValue` until the type has been inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version of the sending peer.
    #[serde(default)]
    pub version: i32,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<serde_json::value::RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl Envelope {
    /// Wraps a typed payload under the current protocol version.
    pub fn carrying<T: Serialize>(
        msg_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let json = serde_json::to_string(payload)?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            payload: Some(serde_json::value::RawValue::from_string(json)?),
            error: None,
        })
    }

    /// Builds a rejection envelope.
    pub fn rejection(code: i32, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type: MessageType::Error,
            payload: None,
            error: Some(ErrorDetail {
                code,
                message: message.into(),
            }),
        }
    }

    /// Deserializes the payload. Every message type except `Error`
    /// carries one; its absence is a malformed envelope.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let raw = self.payload.as_ref().ok_or_else(|| {
            ProtocolError::MalformedFrame(format!("{:?} envelope without payload", self.msg_type))
        })?;
        Ok(serde_json::from_str(raw.get())?)
    }
}
