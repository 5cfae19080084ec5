// src/core/executor.rs

//! # Pipeline executor
//!
//! Walks the actions of one pipeline stage in declared order. For each action
//! the condition is checked against the stage's running return code, the
//! handler is resolved and then either invoked in-process (sync actions) or
//! handed to a child task whose exit status comes back over a channel the
//! event loop awaits.
//!
//! In-process actions get exclusive access to the session. Child tasks run on
//! their own thread against a snapshot of it, so nothing they change is ever
//! visible to the connection that spawned them.
//!
//! Waiting for a named lock never happens on the event loop: in-process
//! actions wait on the blocking pool, children on their own thread.
//!
//! Nested service executions (ptype checks, completion, help, prompt) always
//! run in-process with their output captured, see [`Executor::run_service`].

use crate::CancellationToken;
use crate::constants::{CANCELED_RETCODE, DEFAULT_MAX_CHILDREN, EXEC_FAILURE_RETCODE};
use crate::core::action::{Action, ActionError};
use crate::core::context::{Capture, Context, ContextIo, ContextKind, SessionRef};
use crate::core::locks::{LockError, LockGuard, LockProvider};
use crate::core::parser::ParsedArgs;
use crate::core::pipeline::Stage;
use crate::core::session::Session;
use crate::core::symbol::{Binding, PluginRegistry, Symbol};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum ExecError {
    /// The action names a symbol no plugin provides.
    #[error(transparent)]
    Resolve(#[from] ActionError),
    #[error("Could not start a child task for '{sym}': {reason}")]
    Spawn { sym: String, reason: String },
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("Pipeline I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session is busy, cannot run '{0}' in-process.")]
    SessionBusy(String),
    #[error("Operation was cancelled by the user.")]
    Canceled,
}

impl ExecError {
    /// The return code a stage reports when it ends with this error.
    pub fn retcode(&self) -> i32 {
        match self {
            Self::Canceled => CANCELED_RETCODE,
            _ => EXEC_FAILURE_RETCODE,
        }
    }
}

/// Out-of-band notifications from a running stage to the transport.
#[derive(Debug)]
pub enum StageEvent {
    /// Deferred output of a silent in-process action of the last stage.
    /// The stage does not continue until `flushed` fires or is dropped.
    Captured {
        stage: usize,
        capture: Capture,
        flushed: oneshot::Sender<()>,
    },
}

/// One stage ready to run, with its wired streams.
#[derive(Debug)]
pub struct StageRun {
    pub index: usize,
    pub is_last: bool,
    pub stage: Stage,
    pub io: ContextIo,
    pub line: Arc<str>,
}

/// What a nested service execution may see.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceRequest<'a> {
    pub pargv: Option<&'a ParsedArgs>,
    pub parent: Option<&'a ParsedArgs>,
    pub session: Option<&'a Session>,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceOutcome {
    pub retcode: i32,
    pub capture: Capture,
}

/// Holds one unit of the child task budget until dropped.
#[derive(Debug)]
struct ChildSlot {
    live: Arc<AtomicUsize>,
}

impl ChildSlot {
    fn reserve(live: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        live.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                live: Arc::clone(live),
            })
    }
}

impl Drop for ChildSlot {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a child task needs, owned.
struct ChildJob {
    action: Arc<Action>,
    binding: Binding,
    pargv: Arc<ParsedArgs>,
    line: Arc<str>,
    stage_index: usize,
    is_last: bool,
    position: usize,
    retcode: i32,
    io: ContextIo,
    session: Session,
    cancel: CancellationToken,
    locks: Arc<dyn LockProvider>,
}

impl ChildJob {
    fn run(mut self) -> Result<i32, ExecError> {
        let _lock = match self.action.lock() {
            Some(name) => Some(self.locks.acquire(name)?),
            None => None,
        };
        let mut ctx = Context::new(ContextKind::Action, Arc::clone(&self.cancel))
            .with_action(self.position, &self.action, &self.binding)
            .with_retcode(self.retcode)
            .with_pargv(Some(&*self.pargv))
            .with_session(SessionRef::Exclusive(&mut self.session))
            .with_io(self.io)
            .with_stage(self.stage_index, self.is_last)
            .with_line(&self.line);
        Ok(self.binding.symbol.invoke(&mut ctx))
    }
}

/// A handler running on its own thread.
#[derive(Debug)]
pub struct ChildTask {
    id: u64,
    sym: String,
    done: oneshot::Receiver<Result<i32, ExecError>>,
}

impl ChildTask {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the handler's return code. A child that dies without
    /// reporting one counts as a failed handler.
    pub async fn wait(self) -> Result<i32, ExecError> {
        match self.done.await {
            Ok(result) => {
                log::debug!("Child {} ('{}') finished: {:?}", self.id, self.sym, result);
                result
            }
            Err(_) => {
                log::warn!("Child {} running '{}' terminated abnormally.", self.id, self.sym);
                Ok(EXEC_FAILURE_RETCODE)
            }
        }
    }
}

/// Runs pipeline stages and nested service executions.
#[derive(Debug)]
pub struct Executor {
    registry: Arc<PluginRegistry>,
    locks: Arc<dyn LockProvider>,
    max_children: usize,
    live_children: Arc<AtomicUsize>,
    next_child_id: AtomicU64,
    dry_run: bool,
}

impl Executor {
    pub fn new(registry: Arc<PluginRegistry>, locks: Arc<dyn LockProvider>) -> Self {
        Self {
            registry,
            locks,
            max_children: DEFAULT_MAX_CHILDREN,
            live_children: Arc::new(AtomicUsize::new(0)),
            next_child_id: AtomicU64::new(1),
            dry_run: false,
        }
    }

    /// Caps the number of child tasks alive at the same time.
    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    /// In a dry run only permanent actions are invoked.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn live_children(&self) -> usize {
        self.live_children.load(Ordering::SeqCst)
    }

    /// Runs every action of a stage and returns the stage's return code.
    ///
    /// Executor-level failures (unresolved symbol, spawn, lock or stream
    /// errors) abort the rest of the stage and are returned as `Err`; the
    /// caller reports them with [`ExecError::retcode`].
    pub async fn run_stage(
        self: Arc<Self>,
        run: StageRun,
        session: Rc<RefCell<Session>>,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<StageEvent>,
    ) -> Result<i32, ExecError> {
        let mut retcode = 0;
        for (position, action) in run.stage.actions().iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(ExecError::Canceled);
            }
            if !action.meets_condition(retcode) {
                log::trace!("Skipping '{}': condition not met (retcode {})", action.sym_ref(), retcode);
                continue;
            }
            let binding = action.bind(&self.registry)?.clone();

            let result = if self.dry_run && !action.is_permanent() {
                log::debug!("Dry run: not invoking '{}'", action.sym_ref());
                0
            } else if action.is_sync() {
                let lock = self.acquire_lock(action).await?;
                if cancel.load(Ordering::Relaxed) {
                    return Err(ExecError::Canceled);
                }
                let (code, capture) =
                    self.invoke_in_process(&run, position, action, &binding, retcode, &session, &cancel)?;
                drop(lock);
                if !capture.is_empty() {
                    Self::hand_over(run.index, capture, &events).await;
                }
                code
            } else {
                self.spawn_child(&run, position, action, &binding, retcode, &session, &cancel)?
                    .wait()
                    .await?
            };

            if action.update_retcode() {
                retcode = result;
            }
        }
        Ok(retcode)
    }

    /// Waits for the action's lock on the blocking pool, so the loop keeps
    /// moving the holder's output meanwhile.
    async fn acquire_lock(&self, action: &Action) -> Result<Option<LockGuard>, ExecError> {
        let Some(name) = action.lock() else {
            return Ok(None);
        };
        let locks = Arc::clone(&self.locks);
        let owned = name.to_string();
        let guard = tokio::task::spawn_blocking(move || locks.acquire(&owned))
            .await
            .map_err(|e| {
                log::warn!("Waiting for lock '{}' failed: {}", name, e);
                LockError::Unavailable(name.to_string())
            })??;
        Ok(Some(guard))
    }

    /// Passes deferred output to the transport and waits until it went out,
    /// so nothing a later action writes can overtake it.
    async fn hand_over(stage: usize, capture: Capture, events: &mpsc::UnboundedSender<StageEvent>) {
        let (flushed, sent) = oneshot::channel();
        let event = StageEvent::Captured {
            stage,
            capture,
            flushed,
        };
        if events.send(event).is_err() {
            log::debug!("Captured output of stage {} dropped, nobody listens.", stage);
            return;
        }
        // Err means the transport went away, which leaves nothing to order against.
        let _ = sent.await;
    }

    fn invoke_in_process(
        &self,
        run: &StageRun,
        position: usize,
        action: &Action,
        binding: &Binding,
        retcode: i32,
        session: &Rc<RefCell<Session>>,
        cancel: &CancellationToken,
    ) -> Result<(i32, Capture), ExecError> {
        let capturing = run.is_last && action.is_silent();
        let mut capture = Capture::default();

        let result = {
            let mut session = session
                .try_borrow_mut()
                .map_err(|_| ExecError::SessionBusy(action.sym_ref().to_string()))?;
            let mut ctx = Context::new(ContextKind::Action, Arc::clone(cancel))
                .with_action(position, action, binding)
                .with_retcode(retcode)
                .with_pargv(Some(&**run.stage.pargv()))
                .with_session(SessionRef::Exclusive(&mut *session))
                .with_io(run.io.try_clone()?)
                .with_stage(run.index, run.is_last)
                .with_line(&run.line);
            if capturing {
                ctx = ctx.with_capture(&mut capture);
            }
            binding.symbol.invoke(&mut ctx)
        };
        Ok((result, capture))
    }

    fn spawn_child(
        &self,
        run: &StageRun,
        position: usize,
        action: &Arc<Action>,
        binding: &Binding,
        retcode: i32,
        session: &Rc<RefCell<Session>>,
        cancel: &CancellationToken,
    ) -> Result<ChildTask, ExecError> {
        let sym = action.sym_ref().to_string();
        let slot = ChildSlot::reserve(&self.live_children, self.max_children).ok_or_else(|| {
            ExecError::Spawn {
                sym: sym.clone(),
                reason: format!("limit of {} concurrent children reached", self.max_children),
            }
        })?;
        let snapshot = session
            .try_borrow()
            .map_err(|_| ExecError::SessionBusy(sym.clone()))?
            .clone();

        let job = ChildJob {
            action: Arc::clone(action),
            binding: binding.clone(),
            pargv: Arc::clone(run.stage.pargv()),
            line: Arc::clone(&run.line),
            stage_index: run.index,
            is_last: run.is_last,
            position,
            retcode,
            io: run.io.try_clone()?,
            session: snapshot,
            cancel: Arc::clone(cancel),
            locks: Arc::clone(&self.locks),
        };

        let id = self.next_child_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        thread::Builder::new()
            .name(format!("kshell-child-{id}"))
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(job.run());
            })
            .map_err(|e| ExecError::Spawn {
                sym: sym.clone(),
                reason: e.to_string(),
            })?;

        log::debug!(
            "Started child {} for '{}' (stage {}, action {})",
            id,
            sym,
            run.index,
            position
        );
        Ok(ChildTask { id, sym, done: rx })
    }

    /// Runs a nested service chain in-process with its output captured.
    ///
    /// Conditions and `update_retcode` apply as in a stage. Sync and
    /// permanent policies are ignored: services never fork and run in dry
    /// runs too. The session, if any, is only readable. A lock another
    /// action holds fails the query at once instead of stalling the loop.
    pub fn run_service(
        &self,
        kind: ContextKind,
        actions: &[Arc<Action>],
        request: ServiceRequest<'_>,
    ) -> Result<ServiceOutcome, ExecError> {
        let cancel: CancellationToken = Arc::new(AtomicBool::new(false));
        let mut capture = Capture::default();
        let mut retcode = 0;

        for (position, action) in actions.iter().enumerate() {
            if !action.meets_condition(retcode) {
                continue;
            }
            let binding = action.bind(&self.registry)?;
            let _lock = action.lock().map(|name| self.locks.try_acquire(name)).transpose()?;
            let session = request
                .session
                .map_or(SessionRef::Detached, SessionRef::Shared);
            let mut ctx = Context::new(kind, Arc::clone(&cancel))
                .with_action(position, action, binding)
                .with_retcode(retcode)
                .with_pargv(request.pargv)
                .with_parent_pargv(request.parent)
                .with_session(session)
                .with_capture(&mut capture);
            let result = binding.symbol.invoke(&mut ctx);
            if action.update_retcode() {
                retcode = result;
            }
        }

        Ok(ServiceOutcome { retcode, capture })
    }

    /// Runs every plugin's init hook. Returns the names of plugins whose
    /// init failed.
    pub fn init_plugins(&self) -> Vec<String> {
        self.run_lifecycle(ContextKind::PluginInit)
    }

    /// Runs every plugin's fini hook. Returns the names of plugins whose
    /// fini failed.
    pub fn fini_plugins(&self) -> Vec<String> {
        self.run_lifecycle(ContextKind::PluginFini)
    }

    fn run_lifecycle(&self, kind: ContextKind) -> Vec<String> {
        let mut failed = Vec::new();
        for plugin in self.registry.plugins() {
            let hook = if kind == ContextKind::PluginInit {
                plugin.init()
            } else {
                plugin.fini()
            };
            let Some(hook) = hook else {
                continue;
            };

            let binding = Binding {
                symbol: Arc::new(Symbol::new(format!("{kind:?}"), hook)),
                plugin: Arc::from(plugin.name()),
                plugin_data: plugin.data().cloned(),
            };
            let mut capture = Capture::default();
            let result = {
                let mut ctx = Context::new(kind, Arc::new(AtomicBool::new(false)))
                    .with_binding(&binding)
                    .with_capture(&mut capture);
                hook(&mut ctx)
            };

            for line in String::from_utf8_lossy(&capture.stdout).lines() {
                log::info!("[{}] {}", plugin.name(), line);
            }
            for line in String::from_utf8_lossy(&capture.stderr).lines() {
                log::warn!("[{}] {}", plugin.name(), line);
            }
            if result != 0 {
                log::warn!("{:?} of plugin '{}' returned {}", kind, plugin.name(), result);
                failed.push(plugin.name().to_string());
            }
        }
        failed
    }
}

// MARK: --- UNIT TESTS ---
#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::{ExecOn, Tri};
    use crate::core::locks::LockTable;
    use crate::core::pipeline::{self, PipelineIo};
    use crate::core::scheme::Scheme;
    use crate::core::symbol::Plugin;
    use crate::models::SchemeConfig;
    use std::io::Read;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use std::time::{Duration, Instant};

    // --- Test handlers ---

    fn ok(_ctx: &mut Context<'_>) -> i32 {
        0
    }

    fn fail(_ctx: &mut Context<'_>) -> i32 {
        1
    }

    /// Prints its script, returns the number in its script's first word if any.
    fn echo(ctx: &mut Context<'_>) -> i32 {
        let script = ctx.script();
        ctx.print(script);
        script
            .split_whitespace()
            .next()
            .and_then(|w| w.parse().ok())
            .unwrap_or(0)
    }

    fn where_am_i(ctx: &mut Context<'_>) -> i32 {
        let name = thread::current().name().unwrap_or("unnamed").to_string();
        ctx.print(&name);
        0
    }

    fn finish_session(ctx: &mut Context<'_>) -> i32 {
        match ctx.session_mut() {
            Some(session) => {
                session.set_done(true);
                0
            }
            None => 1,
        }
    }

    #[allow(clippy::panic)]
    fn boom(_ctx: &mut Context<'_>) -> i32 {
        panic!("handler crashed");
    }

    const FLOOD_BYTES: usize = 1_000_000;

    /// Writes more than a socket buffer holds, so it only finishes while
    /// someone drains its stdout.
    fn flood(ctx: &mut Context<'_>) -> i32 {
        thread::sleep(Duration::from_millis(200));
        match ctx.write_out(&vec![b'x'; FLOOD_BYTES]) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }

    /// Runs until the pipeline is interrupted, or gives up after a while.
    fn spin(ctx: &mut Context<'_>) -> i32 {
        let started = Instant::now();
        while started.elapsed() < Duration::from_secs(5) {
            if ctx.is_canceled() {
                return CANCELED_RETCODE;
            }
            thread::sleep(Duration::from_millis(10));
        }
        0
    }

    static LOCKED_INTERVALS: Mutex<Vec<(Instant, Instant)>> = Mutex::new(Vec::new());

    fn hold_lock(_ctx: &mut Context<'_>) -> i32 {
        let start = Instant::now();
        thread::sleep(Duration::from_millis(150));
        LOCKED_INTERVALS.lock().unwrap().push((start, Instant::now()));
        0
    }

    fn registry() -> Arc<PluginRegistry> {
        let mut registry = PluginRegistry::new();
        registry.register(
            Plugin::new("test")
                .with_symbol(Symbol::new("ok", ok))
                .with_symbol(Symbol::new("fail", fail))
                .with_symbol(Symbol::new("echo", echo))
                .with_symbol(Symbol::new("silent_echo", echo).with_silent(true).with_sync(Tri::True))
                .with_symbol(Symbol::new("where", where_am_i))
                .with_symbol(Symbol::new("finish", finish_session))
                .with_symbol(Symbol::new("boom", boom))
                .with_symbol(Symbol::new("hold", hold_lock))
                .with_symbol(Symbol::new("flood", flood))
                .with_symbol(Symbol::new("spin", spin))
                .with_symbol(Symbol::new("safe", echo).with_permanent(Tri::True)),
        );
        Arc::new(registry)
    }

    fn executor() -> Executor {
        Executor::new(registry(), Arc::new(LockTable::new(Duration::from_secs(5))))
    }

    fn session() -> Rc<RefCell<Session>> {
        let config: SchemeConfig = toml::from_str("[[view]]\nname = \"main\"").unwrap();
        let scheme = Arc::new(Scheme::from_config(&config).unwrap());
        Rc::new(RefCell::new(Session::new(scheme, None).unwrap()))
    }

    fn sync(sym: &str) -> Action {
        Action::new(sym).with_sync(Tri::True)
    }

    /// Wires a single-stage pipeline around `actions`.
    fn single_stage(actions: Vec<Action>) -> (StageRun, PipelineIo) {
        let mut io = pipeline::wire(1).unwrap();
        let stage_io = io.stages.pop().unwrap();
        let stage = Stage::new(ParsedArgs::default(), actions.into_iter().map(Arc::new).collect());
        let run = StageRun {
            index: 0,
            is_last: true,
            stage,
            io: stage_io,
            line: Arc::from("test"),
        };
        (run, io)
    }

    /// Runs one stage, acknowledging captured output as the transport would.
    async fn run(
        executor: Executor,
        actions: Vec<Action>,
    ) -> (Result<i32, ExecError>, String, Vec<(usize, Capture)>) {
        let (run, mut io) = single_stage(actions);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let collect = async {
            let mut captures = Vec::new();
            while let Some(StageEvent::Captured { stage, capture, flushed }) = rx.recv().await {
                captures.push((stage, capture));
                let _ = flushed.send(());
            }
            captures
        };
        let (result, captures) = tokio::join!(Arc::new(executor).run_stage(run, session(), cancel, tx), collect);
        let mut out = String::new();
        io.stdout.read_to_string(&mut out).unwrap();
        (result, out, captures)
    }

    #[tokio::test]
    async fn test_condition_chain_runs_success_branch_only() {
        // Setup: A1 always -> 0, A2 on success, A3 on failure.
        let actions = vec![
            sync("ok").with_exec_on(ExecOn::Always),
            sync("echo").with_script("0 two"),
            sync("echo").with_script("three").with_exec_on(ExecOn::Failure),
        ];

        // Execute
        let (result, out, _) = run(executor(), actions).await;

        // Assert
        assert_eq!(result.unwrap(), 0);
        assert_eq!(out, "0 two");
    }

    #[tokio::test]
    async fn test_retained_retcode_feeds_next_condition() {
        // Setup: a check that does not update the retcode sits between a
        // failure and an on-failure handler.
        let actions = vec![
            sync("fail"),
            sync("echo")
                .with_script("0 check ")
                .with_exec_on(ExecOn::Always)
                .with_update_retcode(false),
            sync("echo").with_script("recovered").with_exec_on(ExecOn::Failure),
        ];

        // Execute
        let (result, out, _) = run(executor(), actions).await;

        // Assert: the failure survived the check and triggered the recovery.
        assert_eq!(out, "0 check recovered");
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_silent_last_stage_output_is_captured_as_one_block() {
        // Setup
        let actions = vec![
            sync("echo").with_script("streamed "),
            Action::new("silent_echo").with_script("captured"),
        ];

        // Execute
        let (result, out, captures) = run(executor(), actions).await;

        // Assert
        assert_eq!(result.unwrap(), 0);
        assert_eq!(out, "streamed ");
        assert_eq!(captures.len(), 1);
        let (stage, capture) = captures.into_iter().next().unwrap();
        assert_eq!(stage, 0);
        assert_eq!(capture.stdout, b"captured");
    }

    #[tokio::test]
    async fn test_stage_waits_until_captured_output_is_flushed() {
        // Setup: the capture is acknowledged only after a pause.
        let (run, _io) = single_stage(vec![
            Action::new("silent_echo").with_script("captured"),
            sync("echo").with_script("after"),
        ]);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let finished = std::cell::Cell::new(false);

        // Execute
        let stage = async {
            let result = Arc::new(executor())
                .run_stage(run, session(), Arc::new(AtomicBool::new(false)), tx)
                .await;
            finished.set(true);
            result
        };
        let acknowledge = async {
            let Some(StageEvent::Captured { flushed, .. }) = rx.recv().await else {
                return None;
            };
            tokio::time::sleep(Duration::from_millis(50)).await;
            let finished_early = finished.get();
            flushed.send(()).unwrap();
            Some(finished_early)
        };
        let (result, finished_early) = tokio::join!(stage, acknowledge);

        // Assert
        assert_eq!(finished_early, Some(false));
        assert_eq!(result.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_aborts_stage_with_sentinel() {
        // Setup: no child may start.
        let executor = executor().with_max_children(0);
        let actions = vec![Action::new("ok"), sync("echo").with_script("unreachable")];

        // Execute
        let (result, out, _) = run(executor, actions).await;

        // Assert
        let error = result.unwrap_err();
        assert!(matches!(error, ExecError::Spawn { .. }));
        assert_eq!(error.retcode(), EXEC_FAILURE_RETCODE);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_unresolved_symbol_aborts_stage() {
        let actions = vec![sync("missing"), sync("echo").with_script("unreachable")];
        let (result, out, _) = run(executor(), actions).await;
        assert!(matches!(result, Err(ExecError::Resolve(_))));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_forked_child_output_and_retcode() {
        // Setup
        let actions = vec![Action::new("echo").with_script("3 from child")];

        // Execute
        let (result, out, _) = run(executor(), actions).await;

        // Assert
        assert_eq!(result.unwrap(), 3);
        assert_eq!(out, "3 from child");
    }

    #[tokio::test]
    async fn test_forked_child_cannot_change_session() {
        // Setup
        let executor = Arc::new(executor());
        let session = session();
        let (run, _io) = single_stage(vec![Action::new("finish")]);
        let (tx, _rx) = mpsc::unbounded_channel();

        // Execute
        let result = executor
            .run_stage(run, Rc::clone(&session), Arc::new(AtomicBool::new(false)), tx)
            .await;

        // Assert: the child saw a session, but the parent's is untouched.
        assert_eq!(result.unwrap(), 0);
        assert!(!session.borrow().is_done());
    }

    #[tokio::test]
    async fn test_in_process_action_changes_session() {
        let executor = Arc::new(executor());
        let session = session();
        let (run, _io) = single_stage(vec![sync("finish")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = executor
            .run_stage(run, Rc::clone(&session), Arc::new(AtomicBool::new(false)), tx)
            .await;
        assert_eq!(result.unwrap(), 0);
        assert!(session.borrow().is_done());
    }

    #[tokio::test]
    async fn test_crashed_child_counts_as_failed_handler() {
        let actions = vec![
            Action::new("boom"),
            sync("echo").with_script("after").with_exec_on(ExecOn::Failure),
        ];
        let (result, out, _) = run(executor(), actions).await;
        assert_eq!(result.unwrap(), 0);
        assert_eq!(out, "after");
    }

    #[tokio::test]
    async fn test_dry_run_skips_non_permanent_actions() {
        // Setup
        let executor = executor().with_dry_run(true);
        let actions = vec![
            sync("fail"),
            sync("echo").with_script("skipped"),
            sync("safe").with_script("permanent"),
        ];

        // Execute
        let (result, out, _) = run(executor, actions).await;

        // Assert: "fail" counted as 0, so "safe" ran.
        assert_eq!(result.unwrap(), 0);
        assert_eq!(out, "permanent");
    }

    #[tokio::test]
    async fn test_canceled_stage_stops_before_next_action() {
        let (run, _io) = single_stage(vec![sync("ok")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(true));
        let result = Arc::new(executor()).run_stage(run, session(), cancel, tx).await;
        assert!(matches!(result, Err(ExecError::Canceled)));
    }

    #[tokio::test]
    async fn test_running_handler_sees_the_interrupt() {
        // Setup
        let (run, _io) = single_stage(vec![Action::new("spin")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        // Execute
        let started = Instant::now();
        let (result, ()) = tokio::join!(
            Arc::new(executor()).run_stage(run, session(), Arc::clone(&cancel), tx),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.store(true, Ordering::Relaxed);
            },
        );

        // Assert
        assert_eq!(result.unwrap(), CANCELED_RETCODE);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_shared_lock_serializes_children_of_two_sessions() {
        // Setup: two independent sessions each run a child holding "L".
        let executor = Arc::new(executor());
        let (first, _io1) = single_stage(vec![Action::new("hold").with_lock("L")]);
        let (second, _io2) = single_stage(vec![Action::new("hold").with_lock("L")]);
        let (tx, _rx) = mpsc::unbounded_channel();

        // Execute
        let (a, b) = tokio::join!(
            Arc::clone(&executor).run_stage(first, session(), Arc::new(AtomicBool::new(false)), tx.clone()),
            Arc::clone(&executor).run_stage(second, session(), Arc::new(AtomicBool::new(false)), tx),
        );

        // Assert
        assert_eq!(a.unwrap(), 0);
        assert_eq!(b.unwrap(), 0);
        let mut intervals = LOCKED_INTERVALS.lock().unwrap().clone();
        intervals.sort();
        assert_eq!(intervals.len(), 2);
        assert!(intervals.last().unwrap().0 >= intervals.first().unwrap().1);
    }

    #[tokio::test]
    async fn test_sync_lock_waiter_keeps_the_loop_running() {
        // Setup: a child of one session holds "L" while flooding a pipe that
        // only a task on this loop drains. The other session's sync action
        // wants the same lock shortly after.
        let executor = Arc::new(Executor::new(registry(), Arc::new(LockTable::new(Duration::from_secs(2)))));
        let (holder, holder_io) = single_stage(vec![Action::new("flood").with_lock("L")]);
        let (waiter, _waiter_io) = single_stage(vec![sync("echo").with_lock("L").with_script("after")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        holder_io.stdout.set_nonblocking(true).unwrap();
        let mut drain = tokio::net::UnixStream::from_std(holder_io.stdout).unwrap();

        // Execute
        let (held, waited, drained) = tokio::join!(
            Arc::clone(&executor).run_stage(holder, session(), Arc::new(AtomicBool::new(false)), tx.clone()),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Arc::clone(&executor)
                    .run_stage(waiter, session(), Arc::new(AtomicBool::new(false)), tx)
                    .await
            },
            async {
                let mut bytes = Vec::new();
                drain.read_to_end(&mut bytes).await.unwrap();
                bytes.len()
            },
        );

        // Assert: the holder finished, then the waiter got the lock in time.
        assert_eq!(held.unwrap(), 0);
        assert_eq!(waited.unwrap(), 0);
        assert_eq!(drained, FLOOD_BYTES);
    }

    #[test]
    fn test_service_fails_fast_on_a_held_lock() {
        // Setup
        let table = LockTable::new(Duration::from_secs(5));
        let executor = Executor::new(registry(), Arc::new(table.clone()));
        let _held = table.acquire("L").unwrap();
        let actions = vec![Arc::new(Action::new("ok").with_lock("L"))];

        // Execute
        let started = Instant::now();
        let result = executor.run_service(ContextKind::Ptype, &actions, ServiceRequest::default());

        // Assert
        assert!(matches!(result, Err(ExecError::Lock(LockError::Unavailable(_)))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_service_never_leaves_the_calling_thread() {
        // Setup: "where" is neither sync nor permanent.
        let executor = executor().with_dry_run(true);
        let actions = vec![Arc::new(Action::new("where"))];

        // Execute
        let outcome = executor
            .run_service(ContextKind::Completion, &actions, ServiceRequest::default())
            .unwrap();

        // Assert
        let here = thread::current().name().unwrap_or("unnamed").to_string();
        assert_eq!(outcome.capture.stdout_text(), here);
        assert_eq!(executor.live_children(), 0);
    }

    #[test]
    fn test_plugin_lifecycle_reports_failures() {
        let mut registry = PluginRegistry::new();
        registry.register(Plugin::new("good").with_init(ok).with_fini(ok));
        registry.register(Plugin::new("bad").with_init(fail));
        let executor = Executor::new(Arc::new(registry), Arc::new(LockTable::new(Duration::from_secs(1))));

        assert_eq!(executor.init_plugins(), vec!["bad".to_string()]);
        assert!(executor.fini_plugins().is_empty());
    }
}
