// src/protocol/mod.rs

//! The wire protocol between `kshell` and `kshelld`.

pub mod frame;
pub mod messages;

pub use frame::{Command, Frame, Header, ProtocolError, Status, read_frame, write_frame};
