// src/server/output.rs

//! Reading a pipeline's stdout and stderr.
//!
//! Each stream is drained by its own thread, so a handler writing from the
//! event-loop thread never waits for the loop to read. Deferred output of a
//! last-stage action is held back until both readers confirm that everything
//! written before it has been forwarded.

use crate::core::context::Capture;
use crate::protocol::Command;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const READ_CHUNK: usize = 4096;
/// How long a reader blocks before it looks for sync requests.
const SYNC_POLL: Duration = Duration::from_millis(20);

/// What the readers report, in the order they read it per stream.
#[derive(Debug)]
pub(crate) enum PipeEvent {
    Data(Command, Vec<u8>),
    /// Everything written to the stream before sync `marker` was requested
    /// has been reported.
    Synced(Command, u64),
    Closed(Command),
}

/// The blocking side, owned by the reader thread.
struct PipeReader {
    command: Command,
    stream: UnixStream,
    chunk: Vec<u8>,
    events: mpsc::UnboundedSender<PipeEvent>,
}

impl PipeReader {
    /// Sends a chunk on; `false` once nobody listens.
    fn forward(&self, n: usize) -> bool {
        let bytes = self.chunk.get(..n).map(<[u8]>::to_vec).unwrap_or_default();
        self.events.send(PipeEvent::Data(self.command, bytes)).is_ok()
    }

    fn run(mut self, requests: std_mpsc::Receiver<u64>) {
        let mut open = true;
        while open {
            match self.stream.read(&mut self.chunk) {
                Ok(0) => open = false,
                Ok(n) => {
                    if !self.forward(n) {
                        return;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    log::debug!("{} pipe read failed: {}", self.command, e);
                    open = false;
                }
            }
            while open {
                let marker = match requests.try_recv() {
                    Ok(marker) => marker,
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    // The run this pipe belonged to is over.
                    Err(std_mpsc::TryRecvError::Disconnected) => return,
                };
                open = self.take_buffered();
                if open && self.events.send(PipeEvent::Synced(self.command, marker)).is_err() {
                    return;
                }
            }
        }
        // A closed stream satisfies every sync still outstanding.
        let _ = self.events.send(PipeEvent::Closed(self.command));
    }

    /// Forwards whatever is already in the socket. `false` once the stream ended.
    fn take_buffered(&mut self) -> bool {
        if let Err(e) = self.stream.set_nonblocking(true) {
            log::debug!("{} pipe cannot be polled: {}", self.command, e);
            return false;
        }
        let open = loop {
            match self.stream.read(&mut self.chunk) {
                Ok(0) => break false,
                Ok(n) => {
                    if !self.forward(n) {
                        break false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break true,
                Err(e) => {
                    log::debug!("{} pipe read failed: {}", self.command, e);
                    break false;
                }
            }
        };
        open && self.stream.set_nonblocking(false).is_ok()
    }
}

/// The loop's handle on one reader thread.
#[derive(Debug)]
struct OutputPipe {
    requests: std_mpsc::Sender<u64>,
    open: bool,
}

impl OutputPipe {
    fn spawn(command: Command, stream: UnixStream, events: mpsc::UnboundedSender<PipeEvent>) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(SYNC_POLL))?;
        let (requests, pending) = std_mpsc::channel();
        let reader = PipeReader {
            command,
            stream,
            chunk: vec![0; READ_CHUNK],
            events,
        };
        thread::Builder::new()
            .name(format!("kshell-{}", command.to_string().to_lowercase()))
            .spawn(move || reader.run(pending))?;
        Ok(Self { requests, open: true })
    }
}

/// Deferred output waiting for the readers to catch up.
#[derive(Debug)]
pub(crate) struct PendingCapture {
    marker: u64,
    pub(crate) stage: usize,
    pub(crate) capture: Capture,
    pub(crate) flushed: oneshot::Sender<()>,
    stdout_synced: bool,
    stderr_synced: bool,
}

impl PendingCapture {
    fn is_ready(&self) -> bool {
        self.stdout_synced && self.stderr_synced
    }

    fn mark(&mut self, command: Command) {
        match command {
            Command::Stdout => self.stdout_synced = true,
            Command::Stderr => self.stderr_synced = true,
            _ => {}
        }
    }
}

/// Both output streams of one pipeline run.
#[derive(Debug)]
pub(crate) struct PipelineOutput {
    stdout: OutputPipe,
    stderr: OutputPipe,
    events: mpsc::UnboundedReceiver<PipeEvent>,
    pending: VecDeque<PendingCapture>,
    next_marker: u64,
}

impl PipelineOutput {
    pub(crate) fn spawn(stdout: UnixStream, stderr: UnixStream) -> io::Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        Ok(Self {
            stdout: OutputPipe::spawn(Command::Stdout, stdout, tx.clone())?,
            stderr: OutputPipe::spawn(Command::Stderr, stderr, tx)?,
            events,
            pending: VecDeque::new(),
            next_marker: 0,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.stdout.open || self.stderr.open
    }

    /// The next report of either reader; `None` once both are gone.
    pub(crate) async fn next(&mut self) -> Option<PipeEvent> {
        let event = self.events.recv().await;
        if event.is_none() {
            self.stdout.open = false;
            self.stderr.open = false;
        }
        event
    }

    /// Queues deferred output behind everything already written to the pipes.
    pub(crate) fn defer(&mut self, stage: usize, capture: Capture, flushed: oneshot::Sender<()>) {
        let marker = self.next_marker;
        self.next_marker += 1;
        let mut pending = PendingCapture {
            marker,
            stage,
            capture,
            flushed,
            stdout_synced: true,
            stderr_synced: true,
        };
        for (command, pipe) in [(Command::Stdout, &self.stdout), (Command::Stderr, &self.stderr)] {
            // A reader that already quit has reported all it will ever read.
            let waiting = pipe.open && pipe.requests.send(marker).is_ok();
            if waiting {
                match command {
                    Command::Stdout => pending.stdout_synced = false,
                    _ => pending.stderr_synced = false,
                }
            }
        }
        self.pending.push_back(pending);
    }

    /// Applies one report and returns the bytes to forward, if any.
    pub(crate) fn apply(&mut self, event: PipeEvent) -> Option<(Command, Vec<u8>)> {
        match event {
            PipeEvent::Data(command, bytes) => return Some((command, bytes)),
            PipeEvent::Synced(command, marker) => {
                if let Some(pending) = self.pending.iter_mut().find(|p| p.marker == marker) {
                    pending.mark(command);
                }
            }
            PipeEvent::Closed(command) => {
                match command {
                    Command::Stdout => self.stdout.open = false,
                    _ => self.stderr.open = false,
                }
                for pending in &mut self.pending {
                    pending.mark(command);
                }
            }
        }
        None
    }

    /// The oldest deferred output, once nothing written before it is still unread.
    pub(crate) fn pop_ready(&mut self) -> Option<PendingCapture> {
        if self.pending.front().is_some_and(PendingCapture::is_ready) {
            self.pending.pop_front()
        } else {
            None
        }
    }

    /// Gives up on the pipes: deferred output still waiting is released as is.
    pub(crate) fn release_all(&mut self) -> Vec<PendingCapture> {
        self.pending.drain(..).collect()
    }
}
