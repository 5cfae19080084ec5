// src/core/context.rs

//! # Execution context
//!
//! A [`Context`] is the frame handed to a handler for exactly one invocation.
//! It owns the stdio streams of that invocation (they close when the context
//! is dropped) and borrows everything else: the session, the parsed arguments,
//! the action being run and, for nested sub-queries, the parent parse state.
//!
//! Output written through the context goes either to the owned stdout/stderr
//! streams or, when the executor decided the output must be deferred, to a
//! [`Capture`] the caller flushes later.

use crate::CancellationToken;
use crate::core::action::Action;
use crate::core::parser::{ParsedArgs, Parg};
use crate::core::scheme::Entry;
use crate::core::session::Session;
use crate::core::symbol::Binding;
use std::any::Any;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// What a context was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// A regular action of a pipeline stage.
    Action,
    PluginInit,
    PluginFini,
    /// Validation of a candidate word against a parameter or command.
    Ptype,
    Completion,
    Help,
    Prompt,
}

impl ContextKind {
    /// Nested kinds run in-process with their output captured, never forked.
    pub fn is_service(self) -> bool {
        !matches!(self, Self::Action)
    }
}

/// Deferred output of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Capture {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// The captured stdout as text, lossy.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// The raw streams of one invocation. Dropping it closes every stream.
#[derive(Debug, Default)]
pub struct ContextIo {
    pub stdin: Option<UnixStream>,
    pub stdout: Option<UnixStream>,
    pub stderr: Option<UnixStream>,
}

impl ContextIo {
    /// Duplicates every descriptor so a single invocation can own a set
    /// while the stage keeps the originals for the next action.
    pub fn try_clone(&self) -> io::Result<Self> {
        let dup = |s: &Option<UnixStream>| s.as_ref().map(UnixStream::try_clone).transpose();
        Ok(Self {
            stdin: dup(&self.stdin)?,
            stdout: dup(&self.stdout)?,
            stderr: dup(&self.stderr)?,
        })
    }
}

/// Access a context grants to the session.
#[derive(Debug, Default)]
pub enum SessionRef<'a> {
    #[default]
    Detached,
    /// Read-only, used by nested sub-queries and prompt rendering.
    Shared(&'a Session),
    /// Read-write, only given to in-process actions of a pipeline stage.
    Exclusive(&'a mut Session),
}

/// The frame of one handler invocation.
#[derive(Debug)]
pub struct Context<'a> {
    kind: ContextKind,
    retcode: i32,
    position: usize,
    action: Option<&'a Action>,
    binding: Option<&'a Binding>,
    pargv: Option<&'a ParsedArgs>,
    parent_pargv: Option<&'a ParsedArgs>,
    session: SessionRef<'a>,
    io: ContextIo,
    capture: Option<&'a mut Capture>,
    stage_index: usize,
    is_last_stage: bool,
    line: &'a str,
    cancel: CancellationToken,
}

impl<'a> Context<'a> {
    pub fn new(kind: ContextKind, cancel: CancellationToken) -> Self {
        Self {
            kind,
            retcode: 0,
            position: 0,
            action: None,
            binding: None,
            pargv: None,
            parent_pargv: None,
            session: SessionRef::Detached,
            io: ContextIo::default(),
            capture: None,
            stage_index: 0,
            is_last_stage: true,
            line: "",
            cancel,
        }
    }

    // --- Builder methods used by the executor ---

    pub fn with_action(mut self, position: usize, action: &'a Action, binding: &'a Binding) -> Self {
        self.position = position;
        self.action = Some(action);
        self.binding = Some(binding);
        self
    }

    pub fn with_binding(mut self, binding: &'a Binding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_retcode(mut self, retcode: i32) -> Self {
        self.retcode = retcode;
        self
    }

    pub fn with_pargv(mut self, pargv: Option<&'a ParsedArgs>) -> Self {
        self.pargv = pargv;
        self
    }

    pub fn with_parent_pargv(mut self, parent: Option<&'a ParsedArgs>) -> Self {
        self.parent_pargv = parent;
        self
    }

    pub fn with_session(mut self, session: SessionRef<'a>) -> Self {
        self.session = session;
        self
    }

    pub fn with_io(mut self, io: ContextIo) -> Self {
        self.io = io;
        self
    }

    pub fn with_capture(mut self, capture: &'a mut Capture) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_stage(mut self, stage_index: usize, is_last_stage: bool) -> Self {
        self.stage_index = stage_index;
        self.is_last_stage = is_last_stage;
        self
    }

    pub fn with_line(mut self, line: &'a str) -> Self {
        self.line = line;
        self
    }

    // --- Accessors ---

    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// The accumulated return code of the stage before this action.
    pub fn retcode(&self) -> i32 {
        self.retcode
    }

    /// Index of the current action within its stage.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn action(&self) -> Option<&'a Action> {
        self.action
    }

    pub fn binding(&self) -> Option<&'a Binding> {
        self.binding
    }

    /// The script of the current action, empty if there is none.
    pub fn script(&self) -> &'a str {
        self.action.map_or("", Action::script)
    }

    pub fn pargv(&self) -> Option<&'a ParsedArgs> {
        self.pargv
    }

    pub fn parent_pargv(&self) -> Option<&'a ParsedArgs> {
        self.parent_pargv
    }

    /// The argument under the cursor of a nested sub-query.
    pub fn candidate_parg(&self) -> Option<&'a Parg> {
        self.parent_pargv.and_then(ParsedArgs::candidate)
    }

    pub fn candidate_entry(&self) -> Option<&'a Arc<Entry>> {
        self.candidate_parg().map(Parg::entry)
    }

    pub fn candidate_value(&self) -> Option<&'a str> {
        self.candidate_parg().map(Parg::value)
    }

    /// Value of a parsed argument by entry name, in the own parse state.
    pub fn param(&self, name: &str) -> Option<&'a str> {
        self.pargv.and_then(|pargv| pargv.value(name))
    }

    pub fn session(&self) -> Option<&Session> {
        match &self.session {
            SessionRef::Detached => None,
            SessionRef::Shared(session) => Some(*session),
            SessionRef::Exclusive(session) => Some(&**session),
        }
    }

    /// Mutable access, granted only to in-process stage actions.
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        match &mut self.session {
            SessionRef::Exclusive(session) => Some(&mut **session),
            _ => None,
        }
    }

    /// Data attached to the plugin that owns the running handler.
    pub fn plugin_data<T: Any + Send + Sync>(&self) -> Option<&'a T> {
        self.binding
            .and_then(|binding| binding.plugin_data.as_ref())
            .and_then(|data| data.downcast_ref::<T>())
    }

    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    pub fn is_last_stage(&self) -> bool {
        self.is_last_stage
    }

    /// The full command line this invocation belongs to.
    pub fn line(&self) -> &'a str {
        self.line
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the pipeline this context belongs to was interrupted. The
    /// executor flips the shared token, so a running handler sees it on its
    /// next check.
    pub fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    // --- Streams ---

    /// Output is being deferred into capture buffers.
    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Hands the raw streams over to the caller, leaving the context without any.
    pub fn take_io(&mut self) -> ContextIo {
        std::mem::take(&mut self.io)
    }

    pub fn write_out(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(capture) = self.capture.as_deref_mut() {
            capture.stdout.extend_from_slice(bytes);
            return Ok(());
        }
        match self.io.stdout.as_mut() {
            Some(stream) => stream.write_all(bytes),
            None => Ok(()),
        }
    }

    pub fn write_err(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(capture) = self.capture.as_deref_mut() {
            capture.stderr.extend_from_slice(bytes);
            return Ok(());
        }
        match self.io.stderr.as_mut() {
            Some(stream) => stream.write_all(bytes),
            None => Ok(()),
        }
    }

    pub fn print(&mut self, text: &str) {
        if let Err(e) = self.write_out(text.as_bytes()) {
            log::trace!("Dropped handler stdout: {}", e);
        }
    }

    pub fn println(&mut self, text: &str) {
        self.print(text);
        self.print("\n");
    }

    pub fn eprint(&mut self, text: &str) {
        if let Err(e) = self.write_err(text.as_bytes()) {
            log::trace!("Dropped handler stderr: {}", e);
        }
    }

    pub fn eprintln(&mut self, text: &str) {
        self.eprint(text);
        self.eprint("\n");
    }

    /// Reads the whole input stream. No input stream reads as empty.
    pub fn read_input(&mut self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        if let Some(stdin) = self.io.stdin.as_mut() {
            stdin.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    }
}
