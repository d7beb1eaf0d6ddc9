// crates/island/src/live/store.rs
//! The `id → Session` map and every rule that keeps it consistent.
//!
//! The store is synchronous and owned by exactly one task (the manager
//! actor). Each mutation records the [`SessionEvent`]s it caused; the owner
//! drains them with [`SessionStore::take_events`] and broadcasts them.
//!
//! Invariant: no two entities share a backing file. Live entities win; a
//! historical entity whose file is claimed by a live one is dropped by
//! [`SessionStore::enforce_dedup`], which runs after every change to the
//! live set.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use pi_island_core::{ClientEvent, Session};
use tracing::{debug, info};
use uuid::Uuid;

use super::state::{ManagerError, SessionEvent, SessionSummary};

/// What the owner should do after a resume request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    /// A live session already covers this directory; nothing to start.
    ReuseLive(String),
    /// A new live entity was registered; connect it to `session_file`.
    Started {
        session_id: String,
        session_file: PathBuf,
    },
}

/// What the owner should do about a modified file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    Ignore,
    /// Re-parse off the owner task, then call [`SessionStore::merge_reparsed`].
    Reparse { session_id: String },
    /// Not indexed yet; handle like a created file.
    TreatAsCreated,
}

#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    selected: Option<String>,
    activity_window: Duration,
    events: Vec<SessionEvent>,
}

impl SessionStore {
    pub fn new(activity_window: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            selected: None,
            activity_window,
            events: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn summary(&self, id: &str) -> Option<SessionSummary> {
        self.sessions
            .get(id)
            .map(|s| SessionSummary::from_session(s, Utc::now(), self.activity_window))
    }

    /// All sessions, most recently active first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let now = Utc::now();
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        sessions
            .into_iter()
            .map(|s| SessionSummary::from_session(s, now, self.activity_window))
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether any entity (live or historical) is backed by `path`.
    pub fn is_claimed(&self, path: &Path) -> bool {
        self.sessions.values().any(|s| s.backs(path))
    }

    fn live_backing(&self, path: &Path) -> Option<&Session> {
        self.sessions.values().find(|s| s.is_live() && s.backs(path))
    }

    // ------------------------------------------------------------------
    // Explicit user actions
    // ------------------------------------------------------------------

    /// Register a live entity. The first session ever registered is selected.
    pub fn insert_live(&mut self, session: Session) {
        let id = session.id.clone();
        info!(session_id = %id, cwd = %session.working_directory.display(), "live session registered");
        self.sessions.insert(id.clone(), session);
        self.push_added(&id);
        if self.selected.is_none() {
            self.set_selected(Some(id));
        }
        self.enforce_dedup();
    }

    /// Allocate a fresh live entity for `cwd` and return its id.
    pub fn create_live(&mut self, cwd: PathBuf, now: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut session = Session::live(id.clone(), cwd);
        session.last_activity = now;
        self.insert_live(session);
        id
    }

    /// Turn a historical entity into a live one seeded with its content.
    pub fn begin_resume(&mut self, id: &str) -> Result<ResumePlan, ManagerError> {
        let historical = self
            .sessions
            .get(id)
            .ok_or_else(|| ManagerError::SessionNotFound(id.to_string()))?;

        if historical.is_live() {
            self.set_selected(Some(id.to_string()));
            return Ok(ResumePlan::ReuseLive(id.to_string()));
        }

        let file = historical
            .session_file
            .clone()
            .ok_or_else(|| ManagerError::NoBackingFile(id.to_string()))?;

        let cwd = historical.working_directory.clone();
        if let Some(existing) = self
            .sessions
            .values()
            .find(|s| s.is_live() && s.working_directory == cwd)
        {
            let existing = existing.id.clone();
            debug!(session_id = %existing, cwd = %cwd.display(), "reusing live session for directory");
            self.set_selected(Some(existing.clone()));
            return Ok(ResumePlan::ReuseLive(existing));
        }

        let Some(historical) = self.sessions.remove(id) else {
            return Err(ManagerError::SessionNotFound(id.to_string()));
        };
        self.events.push(SessionEvent::SessionRemoved {
            session_id: id.to_string(),
        });

        let new_id = Uuid::new_v4().to_string();
        let mut live = Session::live(new_id.clone(), historical.working_directory);
        live.set_messages(historical.messages);
        live.model = historical.model;
        live.thinking_level = historical.thinking_level;
        live.session_file = Some(file.clone());
        live.last_activity = historical.last_activity;

        info!(from = %id, session_id = %new_id, file = %file.display(), "resuming session");
        self.sessions.insert(new_id.clone(), live);
        self.push_added(&new_id);
        self.set_selected(Some(new_id.clone()));
        self.enforce_dedup();

        Ok(ResumePlan::Started {
            session_id: new_id,
            session_file: file,
        })
    }

    pub fn select(&mut self, id: &str) -> Result<(), ManagerError> {
        if !self.sessions.contains_key(id) {
            return Err(ManagerError::SessionNotFound(id.to_string()));
        }
        self.set_selected(Some(id.to_string()));
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let removed = self.sessions.remove(id)?;
        self.events.push(SessionEvent::SessionRemoved {
            session_id: id.to_string(),
        });
        self.repair_selection();
        Some(removed)
    }

    /// Record a prompt on a live session before it reaches the agent.
    pub fn begin_prompt(
        &mut self,
        id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ManagerError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| ManagerError::SessionNotFound(id.to_string()))?;
        if !session.is_live() {
            return Err(ManagerError::NotConnected(id.to_string()));
        }
        if session.begin_prompt(text, now) {
            self.push_updated(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // RPC client events
    // ------------------------------------------------------------------

    /// Feed one client event to its session. Unknown ids are ignored.
    pub fn apply_client_event(&mut self, id: &str, event: &ClientEvent, now: DateTime<Utc>) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!(session_id = %id, "event for unknown session dropped");
            return;
        };
        let file_before = session.session_file.clone();
        if !session.apply(event, now) {
            return;
        }
        let file_changed = session.session_file != file_before;
        self.push_updated(id);
        if file_changed {
            self.enforce_dedup();
        }
    }

    // ------------------------------------------------------------------
    // File notifier events
    // ------------------------------------------------------------------

    /// Created file: parse only when nobody claims the path yet.
    pub fn should_parse(&self, path: &Path) -> bool {
        if let Some(live) = self.live_backing(path) {
            debug!(session_id = %live.id, path = %path.display(), "file owned by live session");
            return false;
        }
        !self.is_claimed(path)
    }

    /// Register a freshly parsed historical session. Returns false when the
    /// path got claimed meanwhile or the id is already taken.
    pub fn register_parsed(&mut self, mut session: Session, modified: Option<DateTime<Utc>>) -> bool {
        let claimed = session
            .session_file
            .as_deref()
            .is_some_and(|file| self.is_claimed(file));
        if claimed || self.sessions.contains_key(&session.id) {
            debug!(session_id = %session.id, "parsed session already known; skipped");
            return false;
        }
        if modified.is_some() {
            session.file_modified_at = modified;
        }
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        self.push_added(&id);
        true
    }

    /// Modified file. Live sessions mid-turn are authoritative and ignore it.
    pub fn on_file_modified(&mut self, path: &Path, modified: DateTime<Utc>) -> FileAction {
        let Some(id) = self
            .sessions
            .values()
            .find(|s| s.backs(path))
            .map(|s| s.id.clone())
        else {
            return FileAction::TreatAsCreated;
        };

        let Some(session) = self.sessions.get_mut(&id) else {
            return FileAction::Ignore;
        };

        if session.is_active_turn() {
            debug!(session_id = %id, "live session mid-turn; file change ignored");
            return FileAction::Ignore;
        }

        session.file_modified_at = Some(modified);
        self.push_updated(&id);
        FileAction::Reparse { session_id: id }
    }

    /// Merge a full re-parse into the entity backed by the same file.
    ///
    /// Skipped when a live owner started a turn while the parse was running.
    pub fn merge_reparsed(&mut self, id: &str, parsed: Session) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if session.session_file != parsed.session_file {
            return false;
        }
        if session.is_active_turn() {
            debug!(session_id = %id, "turn started during re-parse; merge skipped");
            return false;
        }

        let before = session.messages.len();
        session.set_messages(parsed.messages);
        if parsed.model.is_some() {
            session.model = parsed.model;
        }
        if parsed.thinking_level.is_some() {
            session.thinking_level = parsed.thinking_level;
        }
        if parsed.last_activity > session.last_activity {
            session.last_activity = parsed.last_activity;
        }
        let after = session.messages.len();

        self.push_updated(id);
        if after > before {
            self.events.push(SessionEvent::ExternallyUpdated {
                session_id: id.to_string(),
                new_messages: after - before,
            });
        }
        true
    }

    /// Removed file. Only historical entities go away.
    pub fn on_file_removed(&mut self, path: &Path) -> Vec<String> {
        let doomed: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_live() && s.backs(path))
            .map(|s| s.id.clone())
            .collect();
        for id in &doomed {
            self.sessions.remove(id);
            self.events.push(SessionEvent::SessionRemoved {
                session_id: id.clone(),
            });
        }
        if !doomed.is_empty() {
            self.repair_selection();
        }
        doomed
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Drop historical entities whose file is claimed by a live one.
    pub fn enforce_dedup(&mut self) {
        let live_files: HashSet<PathBuf> = self
            .sessions
            .values()
            .filter(|s| s.is_live())
            .filter_map(|s| s.session_file.clone())
            .collect();
        if live_files.is_empty() {
            return;
        }

        let duplicates: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.is_live())
            .filter(|s| s.session_file.as_ref().is_some_and(|f| live_files.contains(f)))
            .map(|s| s.id.clone())
            .collect();

        for id in &duplicates {
            debug!(session_id = %id, "historical duplicate of live session removed");
            self.sessions.remove(id);
            self.events.push(SessionEvent::SessionRemoved {
                session_id: id.clone(),
            });
        }
        if !duplicates.is_empty() {
            self.repair_selection();
        }
    }

    fn repair_selection(&mut self) {
        if self
            .selected
            .as_ref()
            .is_some_and(|id| self.sessions.contains_key(id))
        {
            return;
        }
        let fallback = self
            .sessions
            .values()
            .max_by(|a, b| {
                a.last_activity
                    .cmp(&b.last_activity)
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|s| s.id.clone());
        self.set_selected(fallback);
    }

    fn set_selected(&mut self, id: Option<String>) {
        if self.selected == id {
            return;
        }
        self.selected.clone_from(&id);
        self.events
            .push(SessionEvent::SelectionChanged { session_id: id });
    }

    fn push_added(&mut self, id: &str) {
        if let Some(session) = self.summary(id) {
            self.events.push(SessionEvent::SessionAdded { session });
        }
    }

    fn push_updated(&mut self, id: &str) {
        if let Some(session) = self.summary(id) {
            self.events.push(SessionEvent::SessionUpdated { session });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_island_core::{ChatMessage, ModelInfo, RpcEvent, SessionPhase};
    use pretty_assertions::assert_eq;

    fn store() -> SessionStore {
        SessionStore::new(Duration::seconds(10))
    }

    fn historical(id: &str, cwd: &str, file: &str, messages: Vec<ChatMessage>) -> Session {
        let mut s = Session::historical(id, cwd, file);
        s.set_messages(messages);
        s
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn assert_unique_files(store: &SessionStore) {
        let files: Vec<&PathBuf> = store
            .sessions
            .values()
            .filter_map(|s| s.session_file.as_ref())
            .collect();
        let unique: HashSet<&PathBuf> = files.iter().copied().collect();
        assert_eq!(files.len(), unique.len(), "duplicate backing files: {files:?}");
    }

    #[test]
    fn test_first_created_session_is_selected() {
        let mut store = store();
        let first = store.create_live("/a".into(), ts(1));
        let second = store.create_live("/b".into(), ts(2));
        assert_ne!(first, second);
        assert_eq!(store.selected(), Some(first.as_str()));
        assert_eq!(store.get(&first).unwrap().phase, SessionPhase::Starting);

        let events = store.take_events();
        assert!(matches!(events[0], SessionEvent::SessionAdded { .. }));
        assert!(matches!(
            &events[1],
            SessionEvent::SelectionChanged { session_id: Some(id) } if *id == first
        ));
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn test_resume_round_trip() {
        let mut store = store();
        let mut h = historical(
            "old",
            "/proj",
            "/s/p/1_old.jsonl",
            vec![ChatMessage::user("m1"), ChatMessage::assistant("m2")],
        );
        h.model = Some(ModelInfo::new("anthropic", "claude-sonnet-4"));
        assert!(store.register_parsed(h, None));

        let plan = store.begin_resume("old").unwrap();
        let ResumePlan::Started {
            session_id,
            session_file,
        } = plan
        else {
            panic!("expected a new live session");
        };

        assert_ne!(session_id, "old");
        assert!(store.get("old").is_none());
        assert_eq!(session_file, PathBuf::from("/s/p/1_old.jsonl"));

        let live = store.get(&session_id).unwrap();
        assert!(live.is_live());
        assert_eq!(
            live.messages,
            vec![ChatMessage::user("m1"), ChatMessage::assistant("m2")]
        );
        assert_eq!(live.model.as_ref().unwrap().id, "claude-sonnet-4");
        assert_eq!(store.selected(), Some(session_id.as_str()));
        assert_unique_files(&store);
    }

    #[test]
    fn test_resume_reuses_live_session_in_same_directory() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.register_parsed(historical("old", "/proj", "/s/p/1_old.jsonl", vec![]), None);

        let plan = store.begin_resume("old").unwrap();
        assert_eq!(plan, ResumePlan::ReuseLive(live));
        assert!(store.get("old").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_resume_errors() {
        let mut store = store();
        assert!(matches!(
            store.begin_resume("missing"),
            Err(ManagerError::SessionNotFound(_))
        ));

        let mut h = Session::historical("nofile", "/p", "/s/p/1_nofile.jsonl");
        h.session_file = None;
        store.sessions.insert("nofile".into(), h);
        assert!(matches!(
            store.begin_resume("nofile"),
            Err(ManagerError::NoBackingFile(_))
        ));
    }

    #[test]
    fn test_dedup_when_live_session_claims_file() {
        let mut store = store();
        store.register_parsed(historical("h", "/x", "/s/p/1_h.jsonl", vec![]), None);
        let live = store.create_live("/proj".into(), ts(1));
        store.take_events();

        let state = pi_island_core::RpcState {
            session_file: Some("/s/p/1_h.jsonl".into()),
            ..Default::default()
        };
        store.apply_client_event(&live, &ClientEvent::StateLoaded(state), ts(2));

        assert!(store.get("h").is_none());
        assert!(store.get(&live).unwrap().is_live());
        assert_unique_files(&store);
        let events = store.take_events();
        assert!(events.iter().any(
            |e| matches!(e, SessionEvent::SessionRemoved { session_id } if session_id == "h")
        ));
    }

    #[test]
    fn test_created_file_claimed_or_indexed_is_skipped() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        store.register_parsed(historical("h", "/x", "/s/p/1_h.jsonl", vec![]), None);

        assert!(!store.should_parse(Path::new("/s/p/1_live.jsonl")));
        assert!(!store.should_parse(Path::new("/s/p/1_h.jsonl")));
        assert!(store.should_parse(Path::new("/s/p/1_new.jsonl")));

        // A parse racing with a claim is rejected at registration.
        let racing = historical("other", "/x", "/s/p/1_live.jsonl", vec![]);
        assert!(!store.register_parsed(racing, None));
        let same_id = historical("h", "/x", "/s/p/2_h.jsonl", vec![]);
        assert!(!store.register_parsed(same_id, None));
        assert_unique_files(&store);
    }

    #[test]
    fn test_modified_file_ignored_while_live_session_thinking() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        store.apply_client_event(&live, &ClientEvent::Ready, ts(3));
        store.begin_prompt(&live, "hi", ts(4)).unwrap();
        assert_eq!(store.get(&live).unwrap().phase, SessionPhase::Thinking);
        let before = store.get(&live).unwrap().clone();

        let action = store.on_file_modified(Path::new("/s/p/1_live.jsonl"), ts(5));
        assert_eq!(action, FileAction::Ignore);
        assert_eq!(store.get(&live).unwrap(), &before);
    }

    #[test]
    fn test_modified_file_on_idle_live_session_reparses_and_merges() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        store.apply_client_event(&live, &ClientEvent::Ready, ts(3));
        store.take_events();

        let action = store.on_file_modified(Path::new("/s/p/1_live.jsonl"), ts(5));
        assert_eq!(
            action,
            FileAction::Reparse {
                session_id: live.clone()
            }
        );
        assert_eq!(store.get(&live).unwrap().file_modified_at, Some(ts(5)));

        let mut parsed = historical(
            "ignored",
            "/proj",
            "/s/p/1_live.jsonl",
            vec![ChatMessage::user("from"), ChatMessage::assistant("terminal")],
        );
        parsed.model = Some(ModelInfo::new("openai", "gpt-5"));
        assert!(store.merge_reparsed(&live, parsed));

        let merged = store.get(&live).unwrap();
        assert!(merged.is_live());
        assert_eq!(merged.phase, SessionPhase::Idle);
        assert_eq!(merged.messages.len(), 2);
        assert_eq!(merged.model.as_ref().unwrap().id, "gpt-5");
        assert!(store.take_events().contains(&SessionEvent::ExternallyUpdated {
            session_id: live.clone(),
            new_messages: 2
        }));
    }

    #[test]
    fn test_reparse_not_merged_once_live_turn_starts() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        store.apply_client_event(&live, &ClientEvent::Ready, ts(3));
        assert!(matches!(
            store.on_file_modified(Path::new("/s/p/1_live.jsonl"), ts(4)),
            FileAction::Reparse { .. }
        ));

        store.begin_prompt(&live, "go", ts(5)).unwrap();
        let parsed = historical(
            "ignored",
            "/proj",
            "/s/p/1_live.jsonl",
            vec![ChatMessage::user("stale")],
        );
        assert!(!store.merge_reparsed(&live, parsed));
        assert_eq!(store.get(&live).unwrap().messages[0].text, "go");
    }

    #[test]
    fn test_modified_historical_file_reparses_and_merges() {
        let mut store = store();
        store.register_parsed(
            historical("h", "/x", "/s/p/1_h.jsonl", vec![ChatMessage::user("one")]),
            Some(ts(1)),
        );
        store.take_events();

        let action = store.on_file_modified(Path::new("/s/p/1_h.jsonl"), ts(9));
        assert_eq!(
            action,
            FileAction::Reparse {
                session_id: "h".into()
            }
        );
        assert_eq!(store.get("h").unwrap().file_modified_at, Some(ts(9)));

        let mut parsed = historical(
            "h",
            "/x",
            "/s/p/1_h.jsonl",
            vec![
                ChatMessage::user("one"),
                ChatMessage::assistant("two"),
                ChatMessage::user("three"),
            ],
        );
        parsed.last_activity = ts(8);
        parsed.model = Some(ModelInfo::new("openai", "gpt-5"));
        assert!(store.merge_reparsed("h", parsed));

        let merged = store.get("h").unwrap();
        assert_eq!(merged.messages.len(), 3);
        assert_eq!(merged.last_activity, ts(8));
        assert_eq!(merged.model.as_ref().unwrap().provider, "openai");

        let events = store.take_events();
        assert!(events.contains(&SessionEvent::ExternallyUpdated {
            session_id: "h".into(),
            new_messages: 2
        }));
    }

    #[test]
    fn test_modified_unknown_file_is_treated_as_created() {
        let mut store = store();
        assert_eq!(
            store.on_file_modified(Path::new("/s/p/9_new.jsonl"), ts(1)),
            FileAction::TreatAsCreated
        );
    }

    #[test]
    fn test_deleted_file_keeps_live_session() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        let before = store.get(&live).unwrap().clone();

        let removed = store.on_file_removed(Path::new("/s/p/1_live.jsonl"));
        assert!(removed.is_empty());
        assert_eq!(store.get(&live).unwrap(), &before);
    }

    #[test]
    fn test_deleted_file_removes_historical_and_repairs_selection() {
        let mut store = store();
        let mut older = historical("older", "/a", "/s/a/1_older.jsonl", vec![]);
        older.last_activity = ts(5);
        let mut newer = historical("newer", "/b", "/s/b/1_newer.jsonl", vec![]);
        newer.last_activity = ts(10);
        store.register_parsed(older, None);
        store.register_parsed(newer, None);
        store.select("newer").unwrap();

        assert_eq!(
            store.on_file_removed(Path::new("/s/b/1_newer.jsonl")),
            vec!["newer".to_string()]
        );
        assert_eq!(store.selected(), Some("older"));
    }

    #[test]
    fn test_exited_session_becomes_historical_and_is_reparsable() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_live.jsonl".into(),
            },
            ts(2),
        );
        store.apply_client_event(&live, &ClientEvent::Exited { code: Some(0) }, ts(3));

        let session = store.get(&live).unwrap();
        assert!(!session.is_live());
        assert_eq!(session.phase, SessionPhase::Disconnected);
        assert_eq!(
            store.on_file_modified(Path::new("/s/p/1_live.jsonl"), ts(4)),
            FileAction::Reparse { session_id: live }
        );
    }

    #[test]
    fn test_list_sorted_by_activity() {
        let mut store = store();
        let mut a = historical("a", "/a", "/s/a/1_a.jsonl", vec![]);
        a.last_activity = ts(1);
        let mut b = historical("b", "/b", "/s/b/1_b.jsonl", vec![]);
        b.last_activity = ts(3);
        store.register_parsed(a, None);
        store.register_parsed(b, None);
        let live = store.create_live("/c".into(), ts(2));

        let ids: Vec<String> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["b".to_string(), live, "a".to_string()]);
    }

    #[test]
    fn test_begin_prompt_requires_live() {
        let mut store = store();
        store.register_parsed(historical("h", "/x", "/s/p/1_h.jsonl", vec![]), None);
        assert!(matches!(
            store.begin_prompt("h", "hi", ts(1)),
            Err(ManagerError::NotConnected(_))
        ));
    }

    #[test]
    fn test_rpc_events_update_live_session() {
        let mut store = store();
        let live = store.create_live("/proj".into(), ts(1));
        store.apply_client_event(&live, &ClientEvent::Ready, ts(2));
        store.take_events();

        store.apply_client_event(&live, &ClientEvent::Rpc(RpcEvent::AgentStart), ts(3));
        assert!(store.get(&live).unwrap().is_active_turn());
        let events = store.take_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::SessionUpdated { .. }));

        // Events for a session that is gone are dropped.
        store.apply_client_event("gone", &ClientEvent::Ready, ts(4));
        assert!(store.take_events().is_empty());
    }

    #[test]
    fn test_dedup_holds_across_operation_sequence() {
        let mut store = store();
        for i in 0..4 {
            store.register_parsed(
                historical(&format!("h{i}"), &format!("/p{i}"), &format!("/s/p/{i}_h{i}.jsonl"), vec![]),
                None,
            );
            assert_unique_files(&store);
        }
        let resumed = store.begin_resume("h0").unwrap();
        assert_unique_files(&store);
        let live = store.create_live("/p1".into(), ts(1));
        store.apply_client_event(
            &live,
            &ClientEvent::SessionSwitched {
                path: "/s/p/1_h1.jsonl".into(),
            },
            ts(2),
        );
        assert_unique_files(&store);
        assert!(!store.should_parse(Path::new("/s/p/0_h0.jsonl")));
        store.on_file_modified(Path::new("/s/p/2_h2.jsonl"), ts(3));
        assert_unique_files(&store);
        assert!(matches!(resumed, ResumePlan::Started { .. }));
        assert_eq!(store.len(), 4);
    }
}
