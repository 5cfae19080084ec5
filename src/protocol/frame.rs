// src/protocol/frame.rs

//! The frame codec: a fixed 16 byte big-endian header followed by the payload.
//!
//! ```text
//! 0       4     5     6         8           12          16
//! | magic | maj | min | command |  status   |  length   | payload...
//! ```

use crate::constants::{PROTOCOL_MAGIC, PROTOCOL_MAJOR, PROTOCOL_MINOR};
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("Bad frame magic 0x{0:08x}.")]
    BadMagic(u32),
    #[error("Unsupported protocol version {major}.{minor}.")]
    UnsupportedVersion { major: u8, minor: u8 },
    #[error("Unknown frame command {0}.")]
    UnknownCommand(u16),
    #[error("Frame payload of {len} bytes exceeds the limit of {max}.")]
    PayloadTooLarge { len: u32, max: u32 },
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("Failed to decode payload: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("Unexpected '{0}' frame.")]
    UnexpectedFrame(Command),
    #[error("Peer closed the connection.")]
    Disconnected,
}

/// Frame verbs. Requests and their acknowledgements share the numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Execute = 1,
    ExecuteAck = 2,
    Stdout = 3,
    Stderr = 4,
    Completion = 5,
    CompletionAck = 6,
    Help = 7,
    HelpAck = 8,
    Resize = 9,
    Notify = 10,
    NotifyAck = 11,
    Interrupt = 12,
    Close = 13,
    Prompt = 14,
    PromptAck = 15,
}

impl Command {
    const ALL: [Self; 15] = [
        Self::Execute,
        Self::ExecuteAck,
        Self::Stdout,
        Self::Stderr,
        Self::Completion,
        Self::CompletionAck,
        Self::Help,
        Self::HelpAck,
        Self::Resize,
        Self::Notify,
        Self::NotifyAck,
        Self::Interrupt,
        Self::Close,
        Self::Prompt,
        Self::PromptAck,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|c| c.code() == code)
            .ok_or(ProtocolError::UnknownCommand(code))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Status bits of a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Status(u32);

impl Status {
    pub const OK: Self = Self(0);
    pub const ERROR: Self = Self(1);
    /// The command line is a valid prefix but not a complete command.
    pub const INCOMPLETE: Self = Self(1 << 1);
    pub const CANCELED: Self = Self(1 << 2);
    /// The session is over; the client should disconnect.
    pub const EXIT: Self = Self(1 << 3);
    pub const DRY_RUN: Self = Self(1 << 4);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds `other` when `condition` holds.
    pub fn with_if(self, other: Self, condition: bool) -> Self {
        if condition { self | other } else { self }
    }
}

impl BitOr for Status {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub status: Status,
    pub len: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let [m0, m1, m2, m3] = PROTOCOL_MAGIC.to_be_bytes();
        let [c0, c1] = self.command.code().to_be_bytes();
        let [s0, s1, s2, s3] = self.status.bits().to_be_bytes();
        let [l0, l1, l2, l3] = self.len.to_be_bytes();
        [
            m0,
            m1,
            m2,
            m3,
            PROTOCOL_MAJOR,
            PROTOCOL_MINOR,
            c0,
            c1,
            s0,
            s1,
            s2,
            s3,
            l0,
            l1,
            l2,
            l3,
        ]
    }

    /// Parses and validates a header. Nothing about the payload is trusted
    /// before this succeeds.
    pub fn decode(bytes: [u8; HEADER_LEN], max_payload: u32) -> Result<Self, ProtocolError> {
        let [m0, m1, m2, m3, major, minor, c0, c1, s0, s1, s2, s3, l0, l1, l2, l3] = bytes;
        let magic = u32::from_be_bytes([m0, m1, m2, m3]);
        if magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::BadMagic(magic));
        }
        if major != PROTOCOL_MAJOR {
            return Err(ProtocolError::UnsupportedVersion { major, minor });
        }
        let command = Command::try_from(u16::from_be_bytes([c0, c1]))?;
        let len = u32::from_be_bytes([l0, l1, l2, l3]);
        if len > max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                max: max_payload,
            });
        }
        Ok(Self {
            command,
            status: Status::from_bits(u32::from_be_bytes([s0, s1, s2, s3])),
            len,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, status: Status, payload: Vec<u8>) -> Self {
        Self {
            command,
            status,
            payload,
        }
    }

    /// A frame with no payload and no status bits.
    pub fn empty(command: Command) -> Self {
        Self::new(command, Status::OK, Vec::new())
    }
}

/// Reads one frame. A clean end of stream before a header is
/// [`ProtocolError::Disconnected`].
pub async fn read_frame<R>(reader: &mut R, max_payload: u32) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Disconnected);
        }
        Err(e) => return Err(e.into()),
    }
    let header = Header::decode(header, max_payload)?;

    let len = usize::try_from(header.len)
        .map_err(|_| ProtocolError::PayloadTooLarge {
            len: header.len,
            max: max_payload,
        })?;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    log::trace!("<- {} status={:#x} len={}", header.command, header.status.bits(), len);
    Ok(Frame::new(header.command, header.status, payload))
}

/// Writes one frame and flushes it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.payload.len()).map_err(|_| {
        ProtocolError::Malformed(format!("payload of {} bytes", frame.payload.len()))
    })?;
    let header = Header {
        command: frame.command,
        status: frame.status,
        len,
    };
    writer.write_all(&header.encode()).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    log::trace!("-> {} status={:#x} len={}", frame.command, frame.status.bits(), len);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u32 = 1024;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = Header {
            command: Command::Stdout,
            status: Status::ERROR | Status::EXIT,
            len: 258,
        };
        let bytes = header.encode();
        assert_eq!(
            bytes,
            [0x4B, 0x53, 0x48, 0x31, 1, 0, 0, 3, 0, 0, 0, 9, 0, 0, 1, 2]
        );
        assert_eq!(Header::decode(bytes, MAX).unwrap(), header);
    }

    #[test]
    fn test_header_validation() {
        let good = Header {
            command: Command::Execute,
            status: Status::OK,
            len: 10,
        }
        .encode();

        let mut bad_magic = good;
        bad_magic[0] = 0;
        assert!(matches!(Header::decode(bad_magic, MAX), Err(ProtocolError::BadMagic(_))));

        let mut bad_version = good;
        bad_version[4] = 2;
        assert!(matches!(
            Header::decode(bad_version, MAX),
            Err(ProtocolError::UnsupportedVersion { major: 2, .. })
        ));

        let mut bad_command = good;
        bad_command[7] = 99;
        assert!(matches!(
            Header::decode(bad_command, MAX),
            Err(ProtocolError::UnknownCommand(99))
        ));

        assert!(matches!(
            Header::decode(good, 9),
            Err(ProtocolError::PayloadTooLarge { len: 10, max: 9 })
        ));
    }

    #[test]
    fn test_status_bits() {
        let status = Status::ERROR.with_if(Status::INCOMPLETE, true).with_if(Status::EXIT, false);
        assert!(status.contains(Status::ERROR));
        assert!(status.contains(Status::INCOMPLETE));
        assert!(!status.contains(Status::EXIT));
        assert!(status.contains(Status::OK));
    }

    #[tokio::test]
    async fn test_frames_over_a_stream() {
        // Setup
        let (mut a, mut b) = tokio::io::duplex(64);
        let frame = Frame::new(Command::Stderr, Status::OK, b"payload bigger than nothing".to_vec());

        // Execute
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::empty(Command::Close)).await.unwrap();
        drop(a);

        // Assert
        assert_eq!(read_frame(&mut b, MAX).await.unwrap(), frame);
        assert_eq!(read_frame(&mut b, MAX).await.unwrap(), Frame::empty(Command::Close));
        assert!(matches!(read_frame(&mut b, MAX).await, Err(ProtocolError::Disconnected)));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected_before_payload() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let header = Header {
            command: Command::Execute,
            status: Status::OK,
            len: MAX + 1,
        };
        a.write_all(&header.encode()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b, MAX).await,
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_an_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let header = Header {
            command: Command::Stdout,
            status: Status::OK,
            len: 8,
        };
        a.write_all(&header.encode()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, MAX).await, Err(ProtocolError::Io(_))));
    }
}
