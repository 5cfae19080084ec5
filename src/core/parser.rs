// src/core/parser.rs

//! # Parser
//!
//! Turns a typed line into a [`Pipeline`]: one [`ParsedArgs`] per stage plus
//! the actions of the command each stage names. The first stage resolves
//! against the session's location, innermost view first; later stages
//! resolve against the scheme's filters.
//!
//! Words are matched by running the entry's ptype actions in a nested
//! context that sees the word as the *candidate* of the parent parse state.
//! The same walk positions completion and help on the last word of a line.

use crate::core::context::ContextKind;
use crate::core::executor::{ExecError, Executor, ServiceRequest};
use crate::core::pipeline::{Pipeline, Stage};
use crate::core::scheme::{Entry, EntryKind};
use crate::core::session::{Level, Session};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const PIPE: &str = "|";

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Unbalanced quotes in command line.")]
    Tokenize,
    #[error("Unknown command '{0}'.")]
    NotFound(String),
    #[error("Incomplete command.")]
    Incomplete,
    #[error("Illegal argument '{0}'.")]
    IllegalArgument(String),
    #[error("Illegal pipeline at stage {0}.")]
    IllegalPipeline(usize),
    /// A ptype could not be run at all.
    #[error(transparent)]
    Exec(#[from] ExecError),
}

impl ParseError {
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Self::Incomplete)
    }
}

/// One typed word bound to the entry it matched.
#[derive(Debug, Clone)]
pub struct Parg {
    entry: Arc<Entry>,
    value: String,
}

impl Parg {
    pub fn new(entry: Arc<Entry>, value: impl Into<String>) -> Self {
        Self {
            entry,
            value: value.into(),
        }
    }

    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// The parse state of one stage.
#[derive(Debug, Clone, Default)]
pub struct ParsedArgs {
    pargs: Vec<Parg>,
    command: Option<Arc<Entry>>,
    candidate: Option<Parg>,
}

impl ParsedArgs {
    pub fn pargs(&self) -> &[Parg] {
        &self.pargs
    }

    /// The deepest command matched so far.
    pub fn command(&self) -> Option<&Arc<Entry>> {
        self.command.as_ref()
    }

    /// The word under examination by a nested sub-query.
    pub fn candidate(&self) -> Option<&Parg> {
        self.candidate.as_ref()
    }

    /// Value of the last argument matched by an entry named `name`.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.pargs
            .iter()
            .rev()
            .find(|p| p.entry().name() == name)
            .map(Parg::value)
    }

    /// Parameters only, in typed order.
    pub fn params(&self) -> impl Iterator<Item = &Parg> {
        self.pargs
            .iter()
            .filter(|p| p.entry().kind() == EntryKind::Param)
    }

    pub fn push(&mut self, parg: Parg) {
        self.pargs.push(parg);
    }

    pub fn set_command(&mut self, command: Arc<Entry>) {
        self.command = Some(command);
    }

    pub fn set_candidate(&mut self, candidate: Option<Parg>) {
        self.candidate = candidate;
    }
}

/// One line of help output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HelpItem {
    pub item: String,
    pub text: String,
}

/// Candidates for the word under the cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub prefix: String,
    pub candidates: Vec<String>,
}

/// Help for the word under the cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Help {
    pub prefix: String,
    pub items: Vec<HelpItem>,
}

/// Where the cursor of a line sits.
#[derive(Debug)]
struct Cursor {
    stage_index: usize,
    words: Vec<String>,
    prefix: String,
}

/// Result of walking the words of one stage.
#[derive(Debug)]
struct Walk {
    pargv: ParsedArgs,
    /// Sub-commands still acceptable at this point.
    alternatives: Vec<Arc<Entry>>,
    /// The parameter expected next, if any.
    next_param: Option<Arc<Entry>>,
}

/// Splits a line into the words of each stage. Blank and comment lines
/// yield no stages.
fn split_stages(line: &str) -> Result<Vec<Vec<String>>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Vec::new());
    }
    let words = shlex::split(trimmed).ok_or(ParseError::Tokenize)?;
    let stages: Vec<Vec<String>> = words
        .split(|w| w == PIPE)
        .map(<[String]>::to_vec)
        .collect();
    if let Some(index) = stages.iter().position(Vec::is_empty) {
        return Err(ParseError::IllegalPipeline(index));
    }
    Ok(stages)
}

fn locate(line: &str) -> Result<Cursor, ParseError> {
    let mut words = shlex::split(line).ok_or(ParseError::Tokenize)?;
    let inside_word = !line.is_empty() && !line.ends_with(char::is_whitespace);
    let mut prefix = String::new();
    if inside_word && words.last().is_some_and(|w| w != PIPE) {
        prefix = words.pop().unwrap_or_default();
    }
    let stage_index = words.iter().filter(|w| *w == PIPE).count();
    let words = words
        .rsplit(|w| w == PIPE)
        .next()
        .map(<[String]>::to_vec)
        .unwrap_or_default();
    Ok(Cursor {
        stage_index,
        words,
        prefix,
    })
}

fn starts_with_ignore_case(word: &str, prefix: &str) -> bool {
    word.to_lowercase().starts_with(&prefix.to_lowercase())
}

/// Parses lines for one session.
#[derive(Debug)]
pub struct Parser<'a> {
    executor: &'a Executor,
    session: &'a Session,
}

impl<'a> Parser<'a> {
    pub fn new(executor: &'a Executor, session: &'a Session) -> Self {
        Self { executor, session }
    }

    /// Parses a line to execute. Every stage must name an executable
    /// command with all its parameters, and adjacent stages must be
    /// able to pipe into each other.
    pub fn parse_line(&self, line: &str) -> Result<Pipeline, ParseError> {
        let mut stages = Vec::new();
        for (index, words) in split_stages(line)?.iter().enumerate() {
            let walk = self.walk(words, self.roots(index))?;
            let command = walk
                .pargv
                .command()
                .cloned()
                .ok_or(ParseError::Incomplete)?;
            if walk.next_param.is_some() || !command.is_executable() {
                return Err(ParseError::Incomplete);
            }
            stages.push(Stage::new(walk.pargv, command.actions().to_vec()));
        }

        let pipeline = Pipeline::new(line.trim(), stages);
        if let Some(index) = pipeline.first_broken_link() {
            return Err(ParseError::IllegalPipeline(index));
        }
        Ok(pipeline)
    }

    /// Completion candidates for the last word of `line`.
    pub fn complete(&self, line: &str) -> Result<Completion, ParseError> {
        let cursor = locate(line)?;
        let walk = self.walk(&cursor.words, self.roots(cursor.stage_index))?;
        let mut parent = walk.pargv.clone();
        let mut candidates: Vec<String> = Vec::new();

        for entry in walk.alternatives.iter().chain(walk.next_param.iter()) {
            if entry.completion().is_empty() {
                continue;
            }
            parent.set_candidate(Some(Parg::new(Arc::clone(entry), cursor.prefix.as_str())));
            let outcome = self.executor.run_service(
                ContextKind::Completion,
                entry.completion(),
                ServiceRequest {
                    pargv: None,
                    parent: Some(&parent),
                    session: Some(self.session),
                },
            );
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::warn!("Completion for '{}' failed: {}", entry.name(), e);
                    continue;
                }
            };
            for word in outcome.capture.stdout_text().lines().map(str::trim) {
                if !word.is_empty()
                    && starts_with_ignore_case(word, &cursor.prefix)
                    && !candidates.iter().any(|c| c == word)
                {
                    candidates.push(word.to_string());
                }
            }
        }

        Ok(Completion {
            prefix: cursor.prefix,
            candidates,
        })
    }

    /// Help for the last word of `line`. Adds `<cr>` when the line is
    /// already an executable command.
    pub fn help(&self, line: &str) -> Result<Help, ParseError> {
        let cursor = locate(line)?;
        let walk = self.walk(&cursor.words, self.roots(cursor.stage_index))?;
        let mut parent = walk.pargv.clone();
        let mut items = Vec::new();

        for entry in &walk.alternatives {
            parent.set_candidate(Some(Parg::new(Arc::clone(entry), cursor.prefix.as_str())));
            let outcome = self.executor.run_service(
                ContextKind::Help,
                entry.help_actions(),
                ServiceRequest {
                    pargv: None,
                    parent: Some(&parent),
                    session: Some(self.session),
                },
            );
            match outcome {
                Ok(outcome) if outcome.retcode == 0 => {
                    let text = outcome.capture.stdout_text();
                    let mut lines = text.lines();
                    let item = lines.next().unwrap_or(entry.name()).trim().to_string();
                    let text = lines.collect::<Vec<_>>().join(" ").trim().to_string();
                    if starts_with_ignore_case(&item, &cursor.prefix) {
                        items.push(HelpItem { item, text });
                    }
                }
                Ok(_) => {}
                Err(e) => log::warn!("Help for '{}' failed: {}", entry.name(), e),
            }
        }

        if let Some(param) = &walk.next_param {
            items.push(HelpItem {
                item: format!("<{}>", param.name()),
                text: param.help().unwrap_or_default().to_string(),
            });
        }

        let complete = walk
            .pargv
            .command()
            .is_some_and(|command| command.is_executable());
        if cursor.prefix.is_empty() && walk.next_param.is_none() && complete {
            items.push(HelpItem {
                item: "<cr>".to_string(),
                text: String::new(),
            });
        }

        Ok(Help {
            prefix: cursor.prefix,
            items,
        })
    }

    /// Commands acceptable as the first word of a stage.
    fn roots(&self, stage_index: usize) -> Vec<Arc<Entry>> {
        if stage_index > 0 {
            return self.session.scheme().filters().to_vec();
        }
        self.session
            .path()
            .innermost_first()
            .map(Level::entry)
            .flat_map(|view| view.commands().iter().cloned())
            .collect()
    }

    fn walk(&self, words: &[String], roots: Vec<Arc<Entry>>) -> Result<Walk, ParseError> {
        let mut pargv = ParsedArgs::default();
        let mut alternatives = roots;
        let mut param_index = 0;

        for word in words {
            if let Some(entry) = self.match_command(&alternatives, word, &mut pargv)? {
                alternatives = entry.commands().to_vec();
                pargv.push(Parg::new(Arc::clone(&entry), word.as_str()));
                pargv.set_command(entry);
                param_index = 0;
                continue;
            }

            let Some(command) = pargv.command().cloned() else {
                return Err(ParseError::NotFound(word.clone()));
            };
            let Some(param) = command.params().get(param_index).cloned() else {
                return Err(ParseError::IllegalArgument(word.clone()));
            };
            if !self.accepts(&param, word, &mut pargv)? {
                return Err(ParseError::IllegalArgument(word.clone()));
            }
            pargv.push(Parg::new(param, word.as_str()));
            param_index += 1;
            // Sub-commands are only reachable before the first parameter.
            alternatives.clear();
        }

        let next_param = pargv
            .command()
            .and_then(|command| command.params().get(param_index).cloned());
        Ok(Walk {
            pargv,
            alternatives,
            next_param,
        })
    }

    fn match_command(
        &self,
        alternatives: &[Arc<Entry>],
        word: &str,
        pargv: &mut ParsedArgs,
    ) -> Result<Option<Arc<Entry>>, ParseError> {
        for entry in alternatives {
            if self.accepts(entry, word, pargv)? {
                return Ok(Some(Arc::clone(entry)));
            }
        }
        Ok(None)
    }

    /// Runs the entry's ptype against `word` with `pargv` as parent state.
    fn accepts(&self, entry: &Arc<Entry>, word: &str, pargv: &mut ParsedArgs) -> Result<bool, ParseError> {
        if entry.ptype().is_empty() {
            return Ok(true);
        }
        pargv.set_candidate(Some(Parg::new(Arc::clone(entry), word)));
        let outcome = self.executor.run_service(
            ContextKind::Ptype,
            entry.ptype(),
            ServiceRequest {
                pargv: None,
                parent: Some(&*pargv),
                session: Some(self.session),
            },
        );
        pargv.set_candidate(None);
        Ok(outcome?.retcode == 0)
    }
}
