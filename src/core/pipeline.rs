// src/core/pipeline.rs

//! Pipelines and the pipe wiring between their stages.

use crate::core::action::Action;
use crate::core::context::ContextIo;
use crate::core::parser::ParsedArgs;
use std::io;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

/// One segment of a piped command line.
#[derive(Debug, Clone)]
pub struct Stage {
    pargv: Arc<ParsedArgs>,
    actions: Vec<Arc<Action>>,
}

impl Stage {
    pub fn new(pargv: ParsedArgs, actions: Vec<Arc<Action>>) -> Self {
        Self {
            pargv: Arc::new(pargv),
            actions,
        }
    }

    pub fn pargv(&self) -> &Arc<ParsedArgs> {
        &self.pargv
    }

    pub fn actions(&self) -> &[Arc<Action>] {
        &self.actions
    }

    /// Some action of the stage reads the upstream output.
    pub fn accepts_input(&self) -> bool {
        self.actions.iter().any(|a| a.input().is_enabled())
    }

    /// Some action of the stage writes output downstream.
    pub fn produces_output(&self) -> bool {
        self.actions.iter().any(|a| a.output().is_enabled())
    }
}

/// The stages of one command line, left to right.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    line: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(line: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            line: line.into(),
            stages,
        }
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn into_stages(self) -> Vec<Stage> {
        self.stages
    }

    /// An empty or comment-only line yields an empty pipeline.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Index of the first stage that breaks the chain: a stage after the first
    /// that accepts no input, or one before the last that produces no output.
    pub fn first_broken_link(&self) -> Option<usize> {
        let last = self.stages.len().checked_sub(1)?;
        self.stages.iter().enumerate().find_map(|(index, stage)| {
            let bad_input = index > 0 && !stage.accepts_input();
            let bad_output = index < last && !stage.produces_output();
            (bad_input || bad_output).then_some(index)
        })
    }
}

/// The streams of a wired pipeline: one set per stage, plus the read ends of
/// the last stage's stdout and the shared stderr.
#[derive(Debug)]
pub struct PipelineIo {
    pub stages: Vec<ContextIo>,
    pub stdout: UnixStream,
    pub stderr: UnixStream,
}

/// Connects `stage_count` stages like a shell pipe: stage *i*'s stdout is
/// stage *i+1*'s stdin. The first stage reads an empty stream and every
/// stage shares one stderr.
pub fn wire(stage_count: usize) -> io::Result<PipelineIo> {
    let (stderr_read, stderr_write) = UnixStream::pair()?;
    stderr_read.shutdown(Shutdown::Write)?;

    // Dropping the peer immediately makes the first stdin read as EOF.
    let (mut upstream, closed) = UnixStream::pair()?;
    drop(closed);

    let mut stages = Vec::with_capacity(stage_count);
    for _ in 0..stage_count {
        let (read, write) = UnixStream::pair()?;
        read.shutdown(Shutdown::Write)?;
        write.shutdown(Shutdown::Read)?;
        stages.push(ContextIo {
            stdin: Some(upstream),
            stdout: Some(write),
            stderr: Some(stderr_write.try_clone()?),
        });
        upstream = read;
    }

    Ok(PipelineIo {
        stages,
        stdout: upstream,
        stderr: stderr_read,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::action::IoMode;
    use std::io::{Read, Write};

    fn stage(input: IoMode, output: IoMode) -> Stage {
        Stage::new(
            ParsedArgs::default(),
            vec![Arc::new(Action::new("nop").with_io(input, output))],
        )
    }

    #[test]
    fn test_wire_chains_stages() {
        // Setup
        let mut io = wire(2).unwrap();
        let mut second = io.stages.pop().unwrap();
        let mut first = io.stages.pop().unwrap();

        // Execute: stage 0 writes, stage 1 forwards what it reads.
        first.stdout.as_mut().unwrap().write_all(b"abc").unwrap();
        drop(first);
        let mut forwarded = Vec::new();
        second.stdin.as_mut().unwrap().read_to_end(&mut forwarded).unwrap();
        second.stdout.as_mut().unwrap().write_all(&forwarded).unwrap();
        drop(second);

        // Assert
        let mut out = Vec::new();
        io.stdout.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_first_stage_reads_eof() {
        let mut io = wire(1).unwrap();
        let mut stage = io.stages.pop().unwrap();
        let mut buffer = Vec::new();
        stage.stdin.as_mut().unwrap().read_to_end(&mut buffer).unwrap();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_first_broken_link() {
        let ok = Pipeline::new(
            "a | b",
            vec![stage(IoMode::False, IoMode::True), stage(IoMode::True, IoMode::True)],
        );
        assert_eq!(ok.first_broken_link(), None);

        let no_input = Pipeline::new(
            "a | b",
            vec![stage(IoMode::False, IoMode::True), stage(IoMode::False, IoMode::True)],
        );
        assert_eq!(no_input.first_broken_link(), Some(1));

        let no_output = Pipeline::new(
            "a | b",
            vec![stage(IoMode::False, IoMode::False), stage(IoMode::True, IoMode::True)],
        );
        assert_eq!(no_output.first_broken_link(), Some(0));

        assert_eq!(Pipeline::default().first_broken_link(), None);
    }
}
