// src/core/session.rs

//! # Session
//!
//! Per-client state: where in the command tree the client stands, who is on
//! the other end of the socket, the terminal size and whether the session is
//! finished. Only in-process actions of the owning connection mutate it.

use crate::core::scheme::{Entry, Scheme, SchemeError};
use std::fs;
use std::sync::Arc;
use thiserror::Error;

const PASSWD_PATH: &str = "/etc/passwd";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavError {
    #[error("View '{0}' does not exist.")]
    UnknownView(String),
}

/// One element of the location stack.
#[derive(Debug, Clone)]
pub struct Level {
    entry: Arc<Entry>,
}

impl Level {
    pub fn new(entry: Arc<Entry>) -> Self {
        Self { entry }
    }

    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }
}

/// The location stack. The first level is the root, the last the current one.
#[derive(Debug, Clone, Default)]
pub struct Path {
    levels: Vec<Level>,
}

impl Path {
    pub fn push(&mut self, level: Level) {
        self.levels.push(level);
    }

    pub fn pop(&mut self) -> Option<Level> {
        self.levels.pop()
    }

    pub fn current(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Levels from the root to the current one.
    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Levels from the current one outward, the order commands resolve in.
    pub fn innermost_first(&self) -> impl Iterator<Item = &Level> {
        self.levels.iter().rev()
    }

    pub fn truncate(&mut self, len: usize) {
        self.levels.truncate(len);
    }
}

/// The connecting peer as reported by the socket credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    pub pid: Option<i32>,
    pub uid: Option<u32>,
    pub user: Option<String>,
}

impl PeerIdentity {
    /// Builds the identity and resolves the user name. An uid missing from
    /// the passwd database is kept in numeric form.
    pub fn resolve(pid: Option<i32>, uid: Option<u32>) -> Self {
        let user = uid.map(|uid| lookup_user_name(uid).unwrap_or_else(|| uid.to_string()));
        Self { pid, uid, user }
    }
}

/// Looks `uid` up in the system passwd database.
pub fn lookup_user_name(uid: u32) -> Option<String> {
    let content = fs::read_to_string(PASSWD_PATH)
        .map_err(|e| log::debug!("Could not read {}: {}", PASSWD_PATH, e))
        .ok()?;
    find_user_in_passwd(&content, uid)
}

/// `name:password:uid:gid:gecos:home:shell`
fn find_user_in_passwd(content: &str, uid: u32) -> Option<String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .find_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let line_uid = fields.nth(1)?.parse::<u32>().ok()?;
            (line_uid == uid && !name.is_empty()).then(|| name.to_string())
        })
}

/// State of one connected client.
#[derive(Debug, Clone)]
pub struct Session {
    scheme: Arc<Scheme>,
    path: Path,
    done: bool,
    term_width: u16,
    term_height: u16,
    peer: PeerIdentity,
}

impl Session {
    /// Opens a session positioned on the starting view.
    pub fn new(scheme: Arc<Scheme>, start_entry: Option<&str>) -> Result<Self, SchemeError> {
        let start = Arc::clone(scheme.start_view(start_entry)?);
        let mut path = Path::default();
        path.push(Level::new(start));
        Ok(Self {
            scheme,
            path,
            done: false,
            term_width: 80,
            term_height: 25,
            peer: PeerIdentity::default(),
        })
    }

    pub fn scheme(&self) -> &Arc<Scheme> {
        &self.scheme
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_mut(&mut self) -> &mut Path {
        &mut self.path
    }

    /// The view the client currently stands in.
    pub fn current_view(&self) -> Option<&Arc<Entry>> {
        self.path.current().map(Level::entry)
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn set_done(&mut self, done: bool) {
        self.done = done;
    }

    pub fn term_size(&self) -> (u16, u16) {
        (self.term_width, self.term_height)
    }

    pub fn set_term_size(&mut self, width: u16, height: u16) {
        self.term_width = width;
        self.term_height = height;
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn set_peer(&mut self, peer: PeerIdentity) {
        self.peer = peer;
    }

    pub fn user(&self) -> Option<&str> {
        self.peer.user.as_deref()
    }

    // --- Navigation ---

    fn find_view(&self, name: &str) -> Result<Arc<Entry>, NavError> {
        self.scheme
            .view(name)
            .cloned()
            .ok_or_else(|| NavError::UnknownView(name.to_string()))
    }

    pub fn push_view(&mut self, name: &str) -> Result<(), NavError> {
        let view = self.find_view(name)?;
        self.path.push(Level::new(view));
        Ok(())
    }

    /// Leaves the current level. Leaving the last one ends the session.
    pub fn pop_view(&mut self) {
        self.path.pop();
        if self.path.is_empty() {
            self.done = true;
        }
    }

    /// Returns to the root level.
    pub fn top_view(&mut self) {
        self.path.truncate(1);
    }

    pub fn replace_view(&mut self, name: &str) -> Result<(), NavError> {
        let view = self.find_view(name)?;
        self.path.pop();
        self.path.push(Level::new(view));
        Ok(())
    }

    /// `/root/.../current`
    pub fn pwd(&self) -> String {
        self.path
            .levels()
            .iter()
            .map(|level| format!("/{}", level.entry().name()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SchemeConfig;

    fn scheme() -> Arc<Scheme> {
        let config: SchemeConfig = toml::from_str(
            r#"
            [[view]]
            name = "main"
            [[view]]
            name = "config"
            [[view]]
            name = "interface"
            "#,
        )
        .unwrap();
        Arc::new(Scheme::from_config(&config).unwrap())
    }

    #[test]
    fn test_new_session_starts_on_main() {
        let session = Session::new(scheme(), None).unwrap();
        assert_eq!(session.pwd(), "/main");
        assert!(!session.is_done());
    }

    #[test]
    fn test_push_replace_top() {
        // Setup
        let mut session = Session::new(scheme(), None).unwrap();

        // Execute & Assert
        session.push_view("config").unwrap();
        session.push_view("interface").unwrap();
        assert_eq!(session.pwd(), "/main/config/interface");

        session.replace_view("config").unwrap();
        assert_eq!(session.pwd(), "/main/config/config");

        session.top_view();
        assert_eq!(session.pwd(), "/main");
    }

    #[test]
    fn test_push_unknown_view_keeps_path() {
        let mut session = Session::new(scheme(), None).unwrap();
        let result = session.push_view("nowhere");
        assert_eq!(result, Err(NavError::UnknownView("nowhere".to_string())));
        assert_eq!(session.path().len(), 1);
    }

    #[test]
    fn test_popping_last_level_ends_session() {
        let mut session = Session::new(scheme(), Some("config")).unwrap();
        session.pop_view();
        assert!(session.is_done());
        assert!(session.path().is_empty());
    }

    #[test]
    fn test_find_user_in_passwd() {
        let passwd = "# comment\nroot:x:0:0:root:/root:/bin/sh\nalice:x:1000:1000::/home/alice:/bin/sh\n";
        assert_eq!(find_user_in_passwd(passwd, 1000), Some("alice".to_string()));
        assert_eq!(find_user_in_passwd(passwd, 0), Some("root".to_string()));
        assert_eq!(find_user_in_passwd(passwd, 42), None);
    }

    #[test]
    fn test_peer_identity_falls_back_to_numeric_uid() {
        let peer = PeerIdentity::resolve(Some(7), Some(4_000_000_000));
        assert_eq!(peer.user.as_deref(), Some("4000000000"));
    }
}
