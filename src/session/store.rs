//! Durable session store.
//!
//! In-memory sessions behind per-session locks, with an append-only JSONL
//! log per session under `session.persist_dir`. Appends run on the blocking
//! offload while the session lock is held, so a session's log is written in
//! the order its state changed; at most one trailing unflushed record can be
//! lost on crash.

use std::{
    fs,
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{ChatMessage, MessageRole, Session};
use crate::{
    blocking::offload,
    config::SessionConfig,
    error::{GatewayError, GatewayResult},
    router::RoutingDecision,
};

/// One session behind its writer lock.
pub struct SessionSlot {
    state: Mutex<Session>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            state: Mutex::new(session),
        }
    }

    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.clone()
    }
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionSlot>>,
    persist_dir: Option<PathBuf>,
    max_history: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SessionRecord {
    Created {
        session_id: String,
        created_at: DateTime<Utc>,
    },
    Message {
        role: MessageRole,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Outcome {
        tool: String,
        success: bool,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SessionStore {
    /// Open the store, replaying any session logs found in the persist dir.
    pub fn open(config: &SessionConfig) -> GatewayResult<Self> {
        let store = Self {
            sessions: DashMap::new(),
            persist_dir: config.persist_dir.clone(),
            max_history: config.max_history,
        };

        if let Some(dir) = &store.persist_dir {
            fs::create_dir_all(dir)?;
            store.replay_dir(dir)?;
        }
        Ok(store)
    }

    /// In-memory store, used by tests and by `check-config` paths.
    pub fn in_memory(max_history: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            persist_dir: None,
            max_history,
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.sessions.get(session_id) {
            return Arc::clone(slot.value());
        }
        let slot = Arc::new(SessionSlot::new(Session::new(session_id)));
        let entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::clone(&slot));
        let slot = Arc::clone(entry.value());
        drop(entry);

        if self.persist_dir.is_some() {
            let record = SessionRecord::Created {
                session_id: session_id.to_string(),
                created_at: Utc::now(),
            };
            self.append_sync_best_effort(session_id, &record);
        }
        slot
    }

    pub async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: impl Into<String>,
    ) -> GatewayResult<()> {
        let slot = self.get_or_create(session_id);
        let message = ChatMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        };
        let mut session = slot.state.lock().await;
        session.push_message(message.clone(), self.max_history);
        self.append(
            session_id,
            &SessionRecord::Message {
                role: message.role,
                content: message.content,
                timestamp: message.timestamp,
            },
        )
        .await
    }

    pub async fn record_tool_outcome(
        &self,
        session_id: &str,
        qualified_name: &str,
        success: bool,
        latency_ms: u64,
    ) -> GatewayResult<()> {
        let slot = self.get_or_create(session_id);
        let mut session = slot.state.lock().await;
        session.record_tool_outcome(qualified_name, success, latency_ms);
        self.append(
            session_id,
            &SessionRecord::Outcome {
                tool: qualified_name.to_string(),
                success,
                latency_ms,
                timestamp: Utc::now(),
            },
        )
        .await
    }

    /// Adaptive-learning update after a successful call: symmetric
    /// co-occurrence bumps across the last selected set. In-memory only.
    pub async fn record_co_selection(&self, session_id: &str, qualified_name: &str) {
        let slot = self.get_or_create(session_id);
        let mut session = slot.state.lock().await;
        let others: Vec<String> = session
            .last_routing
            .as_ref()
            .map(|d| d.selected.clone())
            .unwrap_or_default();
        for other in others {
            session.record_co_occurrence(qualified_name, &other);
        }
    }

    pub async fn set_last_routing(&self, session_id: &str, decision: RoutingDecision) {
        let slot = self.get_or_create(session_id);
        let mut session = slot.state.lock().await;
        session.last_routing = Some(decision);
        session.updated_at = Utc::now();
    }

    pub async fn last_routing(&self, session_id: &str) -> Option<RoutingDecision> {
        let slot = self.sessions.get(session_id)?.value().clone();
        let session = slot.state.lock().await;
        session.last_routing.clone()
    }

    pub async fn snapshot(&self, session_id: &str) -> Session {
        self.get_or_create(session_id).snapshot().await
    }

    /// Drop sessions untouched since `cutoff`, deleting their logs.
    /// Returns the number of evicted sessions.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        // Snapshot first so no map guard is held across an await.
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut stale = Vec::new();
        for (session_id, slot) in slots {
            if slot.state.lock().await.updated_at < cutoff {
                stale.push(session_id);
            }
        }
        for session_id in &stale {
            self.sessions.remove(session_id);
            if let Some(dir) = &self.persist_dir {
                let path = Self::log_path(dir, session_id);
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("failed to remove session log {}: {}", path.display(), e);
                    }
                }
            }
        }
        stale.len()
    }

    /// Session ids ordered by most recent activity.
    pub async fn list_recent(&self, n: usize) -> Vec<String> {
        let slots: Vec<(String, Arc<SessionSlot>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut entries = Vec::new();
        for (session_id, slot) in slots {
            let updated_at = slot.state.lock().await.updated_at;
            entries.push((session_id, updated_at));
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.into_iter().take(n).map(|(id, _)| id).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    async fn append(&self, session_id: &str, record: &SessionRecord) -> GatewayResult<()> {
        let Some(dir) = &self.persist_dir else {
            return Ok(());
        };
        let path = Self::log_path(dir, session_id);
        let line = serde_json::to_string(record)
            .map_err(|e| GatewayError::Persistence(format!("encode session record: {}", e)))?;
        offload(move || {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            Ok(())
        })
        .await
    }

    /// Synchronous best-effort append for the creation marker; called from
    /// non-async paths where losing the marker only costs replay fidelity.
    fn append_sync_best_effort(&self, session_id: &str, record: &SessionRecord) {
        let Some(dir) = &self.persist_dir else {
            return;
        };
        let path = Self::log_path(dir, session_id);
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")
            });
        if let Err(e) = result {
            warn!("failed to append session marker {}: {}", path.display(), e);
        }
    }

    fn log_path(dir: &Path, session_id: &str) -> PathBuf {
        dir.join(format!("{}.jsonl", session_id))
    }

    fn replay_dir(&self, dir: &Path) -> GatewayResult<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.replay_file(session_id, &path) {
                Ok(session) => {
                    debug!(
                        session_id,
                        messages = session.messages.len(),
                        "replayed session log"
                    );
                    self.sessions.insert(
                        session_id.to_string(),
                        Arc::new(SessionSlot::new(session)),
                    );
                }
                Err(e) => warn!("skipping corrupt session log {}: {}", path.display(), e),
            }
        }
        Ok(())
    }

    fn replay_file(&self, session_id: &str, path: &Path) -> GatewayResult<Session> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut session = Session::new(session_id);
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            // A torn trailing line (crash mid-write) is dropped, matching the
            // at-most-one-lost-record guarantee.
            let Ok(record) = serde_json::from_str::<SessionRecord>(&line) else {
                continue;
            };
            match record {
                SessionRecord::Created { created_at, .. } => {
                    session.created_at = created_at;
                    session.updated_at = created_at;
                }
                SessionRecord::Message {
                    role,
                    content,
                    timestamp,
                } => {
                    session.push_message(
                        ChatMessage {
                            role,
                            content,
                            timestamp,
                        },
                        self.max_history,
                    );
                    session.updated_at = timestamp;
                }
                SessionRecord::Outcome {
                    tool,
                    success,
                    latency_ms,
                    timestamp,
                } => {
                    session.record_tool_outcome(&tool, success, latency_ms);
                    session.updated_at = timestamp;
                }
            }
        }
        Ok(session)
    }
}
