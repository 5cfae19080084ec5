// src/client/session.rs

use crate::constants::DEFAULT_MAX_PAYLOAD;
use crate::protocol::messages::{CompletionReply, ExecuteAck, HelpReply, LineRequest, Notify, PromptReply, Resize};
use crate::protocol::{Command, Frame, ProtocolError, Status, read_frame, write_frame};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Could not connect to the daemon at '{path}': {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Could not write output: {0}")]
    Output(#[from] io::Error),
}

/// What the daemon reported for one executed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    pub retcode: i32,
    pub status: Status,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn is_canceled(&self) -> bool {
        self.status.contains(Status::CANCELED)
    }

    /// The daemon closed the session after this line.
    pub fn is_exit(&self) -> bool {
        self.status.contains(Status::EXIT)
    }

    pub fn is_incomplete(&self) -> bool {
        self.status.contains(Status::INCOMPLETE)
    }

    pub fn is_error(&self) -> bool {
        self.status.contains(Status::ERROR)
    }
}

/// The client end of one daemon connection.
#[derive(Debug)]
pub struct ClientSession {
    stream: UnixStream,
    max_payload: u32,
}

impl ClientSession {
    pub async fn connect(path: &Path) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).await.map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        log::debug!("Connected to '{}'", path.display());
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    pub fn with_max_payload(mut self, max_payload: u32) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Executes `line`, copying streamed output to `stdout` and `stderr`
    /// until the daemon acknowledges. Every message on `interrupts` is
    /// forwarded as an `Interrupt` frame.
    pub async fn execute<O, E>(
        &mut self,
        line: &str,
        stdout: &mut O,
        stderr: &mut E,
        interrupts: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<ExecOutcome, ClientError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let request = LineRequest {
            line: line.to_string(),
        };
        write_frame(&mut self.stream, &Frame::message(Command::Execute, Status::OK, &request)?).await?;

        let max_payload = self.max_payload;
        let (mut reader, mut writer) = self.stream.split();
        loop {
            let next = read_frame(&mut reader, max_payload);
            tokio::pin!(next);
            let frame = loop {
                tokio::select! {
                    frame = &mut next => break frame?,
                    Some(()) = interrupts.recv() => {
                        log::debug!("Forwarding interrupt");
                        write_frame(&mut writer, &Frame::empty(Command::Interrupt)).await?;
                    }
                }
            };
            match frame.command {
                Command::Stdout => {
                    stdout.write_all(&frame.payload).await?;
                    stdout.flush().await?;
                }
                Command::Stderr => {
                    stderr.write_all(&frame.payload).await?;
                    stderr.flush().await?;
                }
                Command::ExecuteAck => {
                    let ack: ExecuteAck = frame.decode()?;
                    return Ok(ExecOutcome {
                        retcode: ack.retcode,
                        status: frame.status,
                        error: ack.error,
                    });
                }
                Command::NotifyAck => log::trace!("Late NotifyAck ignored"),
                other => return Err(ProtocolError::UnexpectedFrame(other).into()),
            }
        }
    }

    async fn request(&mut self, frame: &Frame, reply: Command) -> Result<Frame, ClientError> {
        write_frame(&mut self.stream, frame).await?;
        let answer = read_frame(&mut self.stream, self.max_payload).await?;
        answer.expect_command(reply)?;
        Ok(answer)
    }

    pub async fn complete(&mut self, line: &str) -> Result<CompletionReply, ClientError> {
        let request = LineRequest {
            line: line.to_string(),
        };
        let frame = Frame::message(Command::Completion, Status::OK, &request)?;
        Ok(self.request(&frame, Command::CompletionAck).await?.decode()?)
    }

    pub async fn help(&mut self, line: &str) -> Result<HelpReply, ClientError> {
        let request = LineRequest {
            line: line.to_string(),
        };
        let frame = Frame::message(Command::Help, Status::OK, &request)?;
        Ok(self.request(&frame, Command::HelpAck).await?.decode()?)
    }

    pub async fn prompt(&mut self) -> Result<String, ClientError> {
        let reply: PromptReply = self
            .request(&Frame::empty(Command::Prompt), Command::PromptAck)
            .await?
            .decode()?;
        Ok(reply.prompt)
    }

    pub async fn resize(&mut self, width: u16, height: u16) -> Result<(), ClientError> {
        let frame = Frame::message(Command::Resize, Status::OK, &Resize { width, height })?;
        write_frame(&mut self.stream, &frame).await?;
        Ok(())
    }

    /// Round-trips `message` through the daemon.
    pub async fn notify(&mut self, message: &str) -> Result<String, ClientError> {
        let frame = Frame::message(
            Command::Notify,
            Status::OK,
            &Notify {
                message: message.to_string(),
            },
        )?;
        let echoed: Notify = self.request(&frame, Command::NotifyAck).await?.decode()?;
        Ok(echoed.message)
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        write_frame(&mut self.stream, &Frame::empty(Command::Close)).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::encode;

    #[tokio::test]
    async fn test_execute_copies_output_until_ack() {
        // Setup: a fake daemon on the other end.
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let mut client = ClientSession::from_stream(client_end);
        let daemon = tokio::spawn(async move {
            let request = read_frame(&mut daemon_end, DEFAULT_MAX_PAYLOAD).await.unwrap();
            assert_eq!(request.decode::<LineRequest>().unwrap().line, "show clock");
            write_frame(&mut daemon_end, &Frame::new(Command::Stdout, Status::OK, b"12:00\n".to_vec()))
                .await
                .unwrap();
            write_frame(&mut daemon_end, &Frame::new(Command::Stderr, Status::OK, b"warn\n".to_vec()))
                .await
                .unwrap();
            let ack = ExecuteAck { retcode: 0, error: None };
            write_frame(&mut daemon_end, &Frame::message(Command::ExecuteAck, Status::OK, &ack).unwrap())
                .await
                .unwrap();
        });

        // Execute
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let outcome = client.execute("show clock", &mut out, &mut err, &mut rx).await.unwrap();

        // Assert
        daemon.await.unwrap();
        assert_eq!(outcome.retcode, 0);
        assert!(!outcome.is_error());
        assert_eq!(out, b"12:00\n");
        assert_eq!(err, b"warn\n");
    }

    #[tokio::test]
    async fn test_interrupt_is_forwarded_mid_execution() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let mut client = ClientSession::from_stream(client_end);
        let daemon = tokio::spawn(async move {
            read_frame(&mut daemon_end, DEFAULT_MAX_PAYLOAD).await.unwrap();
            let interrupt = read_frame(&mut daemon_end, DEFAULT_MAX_PAYLOAD).await.unwrap();
            assert_eq!(interrupt.command, Command::Interrupt);
            let ack = ExecuteAck { retcode: 130, error: None };
            write_frame(
                &mut daemon_end,
                &Frame::message(Command::ExecuteAck, Status::CANCELED, &ack).unwrap(),
            )
            .await
            .unwrap();
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(()).unwrap();
        let (mut out, mut err) = (Vec::new(), Vec::new());
        let outcome = client.execute("sleep 10", &mut out, &mut err, &mut rx).await.unwrap();

        daemon.await.unwrap();
        assert!(outcome.is_canceled());
        assert_eq!(outcome.retcode, 130);
    }

    #[tokio::test]
    async fn test_unexpected_reply_is_an_error() {
        let (client_end, mut daemon_end) = UnixStream::pair().unwrap();
        let mut client = ClientSession::from_stream(client_end);
        tokio::spawn(async move {
            read_frame(&mut daemon_end, DEFAULT_MAX_PAYLOAD).await.unwrap();
            let payload = encode(&HelpReply::default()).unwrap();
            write_frame(&mut daemon_end, &Frame::new(Command::HelpAck, Status::OK, payload))
                .await
                .unwrap();
        });

        let result = client.complete("sh").await;

        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::UnexpectedFrame(Command::HelpAck)))
        ));
    }
}
