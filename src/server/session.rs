// src/server/session.rs

//! # Daemon-side transport session
//!
//! One [`DaemonSession`] serves one client connection:
//!
//! ```text
//! CONNECTED --Execute--> EXECUTING --stages done / canceled--> RESPONDING --ack--> CONNECTED
//!     |                                                                               |
//!     +------------------------- Close / disconnect / error ------------------> CLOSED
//! ```
//!
//! Frames are read by a separate task and queued, so the connection stays
//! responsive while a pipeline runs: `Interrupt`, `Close`, `Resize` and
//! `Notify` are handled in the middle of an execution. Every stage runs as
//! a local task; their streamed output is read on threads of its own (see
//! [`super::output`]) and forwarded as it arrives.

use crate::CancellationToken;
use crate::constants::{CANCELED_RETCODE, DEFAULT_PROMPT, EXEC_FAILURE_RETCODE};
use crate::core::context::ContextKind;
use crate::core::executor::{ExecError, Executor, ServiceRequest, StageEvent, StageRun};
use crate::core::parser::Parser;
use crate::core::pipeline::{self, Pipeline};
use crate::core::session::Session;
use crate::dev_utils::BlockTimer;
use crate::protocol::messages::{CompletionReply, ExecuteAck, HelpReply, LineRequest, PromptReply, Resize};
use crate::protocol::{Command, Frame, ProtocolError, Status, read_frame, write_frame};
use crate::server::output::{PendingCapture, PipeEvent, PipelineOutput};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

const INBOUND_QUEUE: usize = 32;
/// Largest payload used when sending captured output.
const OUTPUT_FRAME_LIMIT: usize = 64 * 1024;

type Inbound = mpsc::Receiver<Result<Frame, ProtocolError>>;

/// Where a connection is in its request cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connected,
    Executing,
    Responding,
    Closed,
}

/// Per-connection limits taken from the daemon configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_payload: u32,
    /// How long to keep forwarding output after the last stage ended.
    pub drain_timeout: Duration,
}

/// Whether the connection continues after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// The result of one pipeline run, before it is framed.
#[derive(Debug)]
struct RunOutcome {
    retcode: i32,
    status: Status,
    error: Option<String>,
    flow: Flow,
}

impl RunOutcome {
    fn failed(error: &ExecError) -> Self {
        let status = if matches!(error, ExecError::Canceled) {
            Status::CANCELED
        } else {
            Status::ERROR
        };
        Self {
            retcode: error.retcode(),
            status,
            error: Some(error.to_string()),
            flow: Flow::Continue,
        }
    }
}

/// Reads frames off the connection until it fails or nobody listens.
async fn read_frames<R>(mut reader: R, max_payload: u32, tx: mpsc::Sender<Result<Frame, ProtocolError>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let result = read_frame(&mut reader, max_payload).await;
        let failed = result.is_err();
        if tx.send(result).await.is_err() || failed {
            break;
        }
    }
}

/// The protocol state machine of one connection.
#[derive(Debug)]
pub struct DaemonSession {
    id: Uuid,
    executor: Arc<Executor>,
    session: Rc<RefCell<Session>>,
    limits: SessionLimits,
    interrupts: watch::Receiver<u64>,
    state: TransportState,
}

impl DaemonSession {
    pub fn new(
        executor: Arc<Executor>,
        session: Session,
        limits: SessionLimits,
        interrupts: watch::Receiver<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            executor,
            session: Rc::new(RefCell::new(session)),
            limits,
            interrupts,
            state: TransportState::Connected,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Serves the connection until the client closes it, the session ends
    /// or a protocol error occurs. Must run inside a `LocalSet`.
    pub async fn serve(mut self, stream: UnixStream) -> Result<(), ProtocolError> {
        log::debug!(
            "[{}] Session opened (peer pid {:?}, user {:?})",
            self.id,
            self.session.borrow().peer().pid,
            self.session.borrow().user()
        );
        let (read_half, mut writer) = stream.into_split();
        let (tx, mut inbound) = mpsc::channel(INBOUND_QUEUE);
        let reader = tokio::spawn(read_frames(read_half, self.limits.max_payload, tx));

        let result = self.dispatch(&mut writer, &mut inbound).await;
        reader.abort();
        self.state = TransportState::Closed;
        match &result {
            Ok(()) => log::debug!("[{}] Session closed", self.id),
            Err(e) => log::warn!("[{}] Session torn down: {}", self.id, e),
        }
        result
    }

    fn base_status(&self) -> Status {
        Status::OK.with_if(Status::DRY_RUN, self.executor.is_dry_run())
    }

    async fn dispatch<W>(&mut self, writer: &mut W, inbound: &mut Inbound) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(frame) = inbound.recv().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(ProtocolError::Disconnected) => break,
                Err(e) => return Err(e),
            };
            match frame.command {
                Command::Execute => {
                    let request: LineRequest = frame.decode()?;
                    if self.execute(&request.line, writer, inbound).await? == Flow::Close {
                        break;
                    }
                }
                Command::Completion => self.reply_completion(&frame.decode()?, writer).await?,
                Command::Help => self.reply_help(&frame.decode()?, writer).await?,
                Command::Prompt => {
                    let reply = PromptReply {
                        prompt: self.render_prompt(),
                    };
                    let status = self.base_status();
                    write_frame(writer, &Frame::message(Command::PromptAck, status, &reply)?).await?;
                }
                Command::Resize => self.apply_resize(&frame)?,
                Command::Notify => self.ack_notify(frame, writer).await?,
                Command::Interrupt => log::trace!("[{}] Interrupt while idle ignored", self.id),
                Command::Close => break,
                other => return Err(ProtocolError::UnexpectedFrame(other)),
            }
            if self.session.borrow().is_done() {
                log::debug!("[{}] Session finished by navigation", self.id);
                break;
            }
        }
        Ok(())
    }

    fn apply_resize(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let size: Resize = frame.decode()?;
        match self.session.try_borrow_mut() {
            Ok(mut session) => session.set_term_size(size.width, size.height),
            Err(_) => log::debug!("[{}] Resize dropped, session busy", self.id),
        }
        Ok(())
    }

    async fn ack_notify<W>(&self, frame: Frame, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let ack = Frame::new(Command::NotifyAck, self.base_status(), frame.payload);
        write_frame(writer, &ack).await
    }

    async fn send_ack<W>(
        &self,
        writer: &mut W,
        status: Status,
        retcode: i32,
        error: Option<String>,
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let ack = ExecuteAck { retcode, error };
        let frame = Frame::message(Command::ExecuteAck, self.base_status() | status, &ack)?;
        write_frame(writer, &frame).await
    }

    // --- Execution ---

    async fn execute<W>(&mut self, line: &str, writer: &mut W, inbound: &mut Inbound) -> Result<Flow, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let _timer = BlockTimer::new(format!("execute '{line}'"));
        let parsed = {
            let session = self.session.borrow();
            Parser::new(&self.executor, &session).parse_line(line)
        };
        let pipeline = match parsed {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::debug!("[{}] Rejected '{}': {}", self.id, line, e);
                let status = Status::ERROR.with_if(Status::INCOMPLETE, e.is_incomplete());
                self.send_ack(writer, status, EXEC_FAILURE_RETCODE, Some(e.to_string())).await?;
                return Ok(Flow::Continue);
            }
        };
        if pipeline.is_empty() {
            self.send_ack(writer, Status::OK, 0, None).await?;
            return Ok(Flow::Continue);
        }

        log::info!("[{}] Executing '{}'", self.id, pipeline.line());
        self.state = TransportState::Executing;
        let outcome = self.run_pipeline(pipeline, writer, inbound).await?;

        self.state = TransportState::Responding;
        let status = outcome
            .status
            .with_if(Status::EXIT, self.session.borrow().is_done());
        self.send_ack(writer, status, outcome.retcode, outcome.error).await?;
        self.state = TransportState::Connected;
        Ok(outcome.flow)
    }

    async fn run_pipeline<W>(
        &mut self,
        pipeline: Pipeline,
        writer: &mut W,
        inbound: &mut Inbound,
    ) -> Result<RunOutcome, ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let stage_count = pipeline.len();
        let line: Arc<str> = Arc::from(pipeline.line());
        let wired = pipeline::wire(stage_count)
            .and_then(|io| Ok((io.stages, PipelineOutput::spawn(io.stdout, io.stderr)?)));
        let (stage_ios, mut output) = match wired {
            Ok(wired) => wired,
            Err(e) => {
                let error = ExecError::Io(e);
                log::error!("[{}] Could not wire pipeline: {}", self.id, error);
                return Ok(RunOutcome::failed(&error));
            }
        };

        // An interrupt delivered while idle must not cancel this line.
        self.interrupts.mark_unchanged();
        let cancel: CancellationToken = Arc::new(AtomicBool::new(false));
        // Children still running when this returns, for whatever reason, are told to stop.
        let _stop_children = scopeguard::guard(Arc::clone(&cancel), |cancel| {
            cancel.store(true, Ordering::Relaxed);
        });
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let mut stages = JoinSet::new();
        for (index, (stage, io)) in pipeline.into_stages().into_iter().zip(stage_ios).enumerate() {
            let run = StageRun {
                index,
                is_last: index + 1 == stage_count,
                stage,
                io,
                line: Arc::clone(&line),
            };
            let executor = Arc::clone(&self.executor);
            let session = Rc::clone(&self.session);
            let cancel = Arc::clone(&cancel);
            let events_tx = events_tx.clone();
            stages.spawn_local(async move { (index, executor.run_stage(run, session, cancel, events_tx).await) });
        }
        drop(events_tx);

        let mut results: Vec<Option<Result<i32, ExecError>>> = (0..stage_count).map(|_| None).collect();
        let mut canceled = false;
        let mut flow = Flow::Continue;
        let mut inbound_open = true;
        let mut interrupts_open = true;

        while !stages.is_empty() {
            let mut cancel_now = false;
            tokio::select! {
                joined = stages.join_next() => match joined {
                    Some(Ok((index, result))) => {
                        if let Some(slot) = results.get_mut(index) {
                            *slot = Some(result);
                        }
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => log::error!("[{}] Stage task failed: {}", self.id, e),
                    None => {}
                },
                Some(event) = output.next(), if output.is_open() => {
                    self.forward(writer, &mut output, event).await?;
                }
                Some(event) = events.recv() => {
                    let StageEvent::Captured { stage, capture, flushed } = event;
                    output.defer(stage, capture, flushed);
                    self.flush_ready(writer, &mut output).await?;
                }
                frame = inbound.recv(), if inbound_open => match frame {
                    Some(Ok(frame)) => match frame.command {
                        Command::Interrupt => {
                            log::info!("[{}] Interrupted by client", self.id);
                            cancel_now = true;
                        }
                        Command::Close => {
                            cancel_now = true;
                            flow = Flow::Close;
                        }
                        Command::Resize => self.apply_resize(&frame)?,
                        Command::Notify => self.ack_notify(frame, writer).await?,
                        other => return Err(ProtocolError::UnexpectedFrame(other)),
                    },
                    Some(Err(ProtocolError::Disconnected)) | None => {
                        log::debug!("[{}] Client went away during execution", self.id);
                        inbound_open = false;
                        cancel_now = true;
                        flow = Flow::Close;
                    }
                    Some(Err(e)) => return Err(e),
                },
                changed = self.interrupts.changed(), if interrupts_open => {
                    if changed.is_ok() {
                        log::info!("[{}] Interrupted by signal", self.id);
                        cancel_now = true;
                    } else {
                        interrupts_open = false;
                    }
                }
            }

            if cancel_now && !canceled {
                canceled = true;
                cancel.store(true, Ordering::Relaxed);
                stages.abort_all();
            }
        }

        // Stages are done; what is left in the pipes still belongs to this line.
        while let Ok(StageEvent::Captured { stage, capture, flushed }) = events.try_recv() {
            output.defer(stage, capture, flushed);
        }
        if tokio::time::timeout(self.limits.drain_timeout, self.pump_until_closed(writer, &mut output))
            .await
            .is_err()
        {
            log::debug!("[{}] Output still open after drain timeout", self.id);
        }
        for pending in output.release_all() {
            self.flush_captured(writer, pending).await?;
        }

        let mut outcome = if canceled {
            RunOutcome {
                retcode: CANCELED_RETCODE,
                status: Status::CANCELED,
                error: None,
                flow,
            }
        } else {
            self.summarize(results)
        };
        outcome.flow = flow;
        Ok(outcome)
    }

    /// The first failing stage decides the outcome, otherwise the last
    /// stage's return code is reported.
    fn summarize(&self, results: Vec<Option<Result<i32, ExecError>>>) -> RunOutcome {
        let mut retcode = 0;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(code)) => retcode = code,
                Some(Err(e)) => {
                    log::warn!("[{}] Stage {} aborted: {}", self.id, index, e);
                    return RunOutcome::failed(&e);
                }
                None => {
                    return RunOutcome {
                        retcode: EXEC_FAILURE_RETCODE,
                        status: Status::ERROR,
                        error: Some(format!("Stage {index} crashed.")),
                        flow: Flow::Continue,
                    };
                }
            }
        }
        RunOutcome {
            retcode,
            status: Status::OK,
            error: None,
            flow: Flow::Continue,
        }
    }

    async fn pump_until_closed<W>(&self, writer: &mut W, output: &mut PipelineOutput) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        while output.is_open() {
            if let Some(event) = output.next().await {
                self.forward(writer, output, event).await?;
            }
        }
        self.flush_ready(writer, output).await
    }

    /// Forwards one reader report, then any deferred output it unblocked.
    async fn forward<W>(&self, writer: &mut W, output: &mut PipelineOutput, event: PipeEvent) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        if let Some((command, bytes)) = output.apply(event) {
            self.send_output(writer, command, &bytes).await?;
        }
        self.flush_ready(writer, output).await
    }

    async fn flush_ready<W>(&self, writer: &mut W, output: &mut PipelineOutput) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        while let Some(pending) = output.pop_ready() {
            self.flush_captured(writer, pending).await?;
        }
        Ok(())
    }

    /// Sends deferred output as one block and lets its stage continue.
    async fn flush_captured<W>(&self, writer: &mut W, pending: PendingCapture) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let PendingCapture {
            stage,
            capture,
            flushed,
            ..
        } = pending;
        log::trace!(
            "[{}] Flushing {} captured bytes of stage {}",
            self.id,
            capture.stdout.len() + capture.stderr.len(),
            stage
        );
        self.send_output(writer, Command::Stdout, &capture.stdout).await?;
        self.send_output(writer, Command::Stderr, &capture.stderr).await?;
        // The stage may have been aborted in the meantime.
        let _ = flushed.send(());
        Ok(())
    }

    async fn send_output<W>(&self, writer: &mut W, command: Command, bytes: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let limit = usize::try_from(self.limits.max_payload)
            .unwrap_or(OUTPUT_FRAME_LIMIT)
            .clamp(1, OUTPUT_FRAME_LIMIT);
        for chunk in bytes.chunks(limit) {
            write_frame(writer, &Frame::new(command, self.base_status(), chunk.to_vec())).await?;
        }
        Ok(())
    }

    // --- Services ---

    async fn reply_completion<W>(&self, request: &LineRequest, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = {
            let session = self.session.borrow();
            Parser::new(&self.executor, &session).complete(&request.line)
        };
        let (status, reply) = match result {
            Ok(completion) => (
                Status::OK,
                CompletionReply {
                    prefix: completion.prefix,
                    candidates: completion.candidates,
                },
            ),
            Err(e) => {
                log::debug!("[{}] No completion for '{}': {}", self.id, request.line, e);
                (Status::ERROR, CompletionReply::default())
            }
        };
        let frame = Frame::message(Command::CompletionAck, self.base_status() | status, &reply)?;
        write_frame(writer, &frame).await
    }

    async fn reply_help<W>(&self, request: &LineRequest, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let result = {
            let session = self.session.borrow();
            Parser::new(&self.executor, &session).help(&request.line)
        };
        let (status, reply) = match result {
            Ok(help) => (
                Status::OK,
                HelpReply {
                    prefix: help.prefix,
                    items: help.items,
                },
            ),
            Err(e) => {
                log::debug!("[{}] No help for '{}': {}", self.id, request.line, e);
                (Status::ERROR, HelpReply::default())
            }
        };
        let frame = Frame::message(Command::HelpAck, self.base_status() | status, &reply)?;
        write_frame(writer, &frame).await
    }

    /// Runs the current view's prompt actions.
    fn render_prompt(&self) -> String {
        let session = self.session.borrow();
        let Some(view) = session.current_view() else {
            return DEFAULT_PROMPT.to_string();
        };
        if view.prompt().is_empty() {
            return DEFAULT_PROMPT.to_string();
        }
        let request = ServiceRequest {
            session: Some(&session),
            ..ServiceRequest::default()
        };
        match self.executor.run_service(ContextKind::Prompt, view.prompt(), request) {
            Ok(outcome) if !outcome.capture.stdout.is_empty() => outcome.capture.stdout_text(),
            Ok(_) => DEFAULT_PROMPT.to_string(),
            Err(e) => {
                log::warn!("[{}] Prompt of '{}' failed: {}", self.id, view.name(), e);
                DEFAULT_PROMPT.to_string()
            }
        }
    }
}
