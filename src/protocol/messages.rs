// src/protocol/messages.rs

//! Structured payloads. Streamed stdout/stderr frames carry raw bytes and
//! have no message type.

use super::frame::{Command, Frame, ProtocolError, Status};
use crate::core::parser::HelpItem;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Body of `Execute`, `Completion` and `Help` requests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LineRequest {
    pub line: String,
}

/// The final frame of an execution.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExecuteAck {
    pub retcode: i32,
    /// Human-readable reason for parse, resolution or resource failures.
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionReply {
    /// The partial word the candidates complete.
    pub prefix: String,
    pub candidates: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HelpReply {
    pub prefix: String,
    pub items: Vec<HelpItem>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PromptReply {
    pub prompt: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resize {
    pub width: u16,
    pub height: u16,
}

/// A ping; the daemon echoes it back in `NotifyAck`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub message: String,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

/// Decodes a payload, rejecting trailing bytes.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let (value, read): (T, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
    if read != payload.len() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes",
            payload.len().saturating_sub(read)
        )));
    }
    Ok(value)
}

impl Frame {
    /// A frame carrying an encoded message.
    pub fn message<T: Serialize>(
        command: Command,
        status: Status,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(command, status, encode(value)?))
    }

    /// Decodes the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        decode(&self.payload)
    }

    /// Fails with [`ProtocolError::UnexpectedFrame`] unless the frame is a `command`.
    pub fn expect_command(&self, command: Command) -> Result<&Self, ProtocolError> {
        if self.command == command {
            Ok(self)
        } else {
            Err(ProtocolError::UnexpectedFrame(self.command))
        }
    }
}
