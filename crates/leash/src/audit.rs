//! Audit logging for policy decisions
//!
//! Every pass, block, and sensitive-surface touch is recorded for
//! accountability. Events carry a per-(actor, kind) sequence number so
//! tests and operators can assert on ordering without trusting clocks.
//! Default storage: ~/.local/share/leash/audit.log (JSON lines)

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A sensitive API surface was touched
    Concern,
    /// An outbound call was allowed through
    CallAllowed,
    /// A candidate was blocked during list filtering
    CallDeniedByFilter,
    /// A service start was allowed through
    CallStarted,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::Concern => "concern",
            AuditKind::CallAllowed => "call_allowed",
            AuditKind::CallDeniedByFilter => "call_denied_by_filter",
            AuditKind::CallStarted => "call_started",
        }
    }
}

/// A single audit event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event was recorded
    pub timestamp: DateTime<Utc>,

    /// Identity of the engine instance that recorded it
    pub actor: String,

    /// Host-chosen label for this engine instance
    pub tag: String,

    /// Event kind
    pub kind: AuditKind,

    /// Monotonic sequence number within (actor, kind)
    pub seq: u64,

    /// Event arguments (target identity, stringified request, ...)
    pub args: Vec<String>,
}

/// Where events go. Implementations must tolerate concurrent appends
/// without interleaving one event's fields.
pub trait AuditSink: Send + Sync {
    fn append(&self, event: &AuditEvent);
}

/// Front-end that assigns sequence numbers and stamps events before they
/// reach the sink
pub struct AuditLog {
    actor: String,
    tag: String,
    sink: Arc<dyn AuditSink>,
    // Sequence assignment and the append happen under this one lock, so
    // sink order matches sequence order per kind.
    seqs: Mutex<HashMap<AuditKind, u64>>,
}

impl AuditLog {
    pub fn new(actor: impl Into<String>, tag: impl Into<String>, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            actor: actor.into(),
            tag: tag.into(),
            sink,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Record one event
    pub fn record(&self, kind: AuditKind, args: &[&str]) {
        let mut seqs = self.seqs.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = seqs.entry(kind).or_insert(0);
        let event = AuditEvent {
            timestamp: Utc::now(),
            actor: self.actor.clone(),
            tag: self.tag.clone(),
            kind,
            seq: *seq,
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        *seq += 1;
        self.sink.append(&event);
    }
}

/// In-memory sink for tests and host introspection
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events, in append order
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events of one kind, in append order
    pub fn of_kind(&self, kind: AuditKind) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.of_kind(kind).len()
    }
}

impl AuditSink for MemorySink {
    fn append(&self, event: &AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// JSON-lines file sink
pub struct JsonlSink {
    log_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSink {
    /// Create a sink at the default location
    pub fn new() -> Self {
        let log_path = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("leash")
            .join("audit.log");
        Self::with_path(log_path)
    }

    /// Create with custom path
    pub fn with_path(log_path: PathBuf) -> Self {
        Self {
            log_path,
            write_lock: Mutex::new(()),
        }
    }

    fn try_append(&self, event: &AuditEvent) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .with_context(|| format!("Failed to open audit log at {:?}", self.log_path))?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json)?;
        Ok(())
    }

    /// Query recent entries
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        self.query(AuditQuery::default().limit(limit))
    }

    /// Query with custom filter
    pub fn query(&self, query: AuditQuery) -> Result<Vec<AuditEvent>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.log_path)?;
        let reader = BufReader::new(file);

        let mut events: Vec<AuditEvent> = reader
            .lines()
            .filter_map(|line| line.ok().and_then(|l| serde_json::from_str(&l).ok()))
            .filter(|event: &AuditEvent| query.matches(event))
            .collect();

        // Most recent first
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        if let Some(limit) = query.limit {
            events.truncate(limit);
        }

        Ok(events)
    }

    /// Get statistics
    pub fn stats(&self) -> Result<AuditStats> {
        let events = self.query(AuditQuery::default())?;

        let mut stats = AuditStats::default();
        for event in events {
            stats.total += 1;
            match event.kind {
                AuditKind::Concern => stats.concerns += 1,
                AuditKind::CallAllowed => stats.allowed += 1,
                AuditKind::CallDeniedByFilter => stats.filtered += 1,
                AuditKind::CallStarted => stats.started += 1,
            }
        }

        Ok(stats)
    }
}

impl Default for JsonlSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditSink for JsonlSink {
    fn append(&self, event: &AuditEvent) {
        if let Err(err) = self.try_append(event) {
            warn!(error = %err, "failed to append audit event");
        }
    }
}

/// Query parameters for the JSON-lines sink
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    actor: Option<String>,
    kind: Option<AuditKind>,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl AuditQuery {
    /// Filter by actor
    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    /// Filter by kind
    pub fn kind(mut self, kind: AuditKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Filter by time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Limit results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(ref actor) = self.actor {
            if event.actor != *actor {
                return false;
            }
        }

        if let Some(kind) = self.kind {
            if event.kind != kind {
                return false;
            }
        }

        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }

        true
    }
}

/// Audit statistics
#[derive(Debug, Clone, Default)]
pub struct AuditStats {
    pub total: usize,
    pub concerns: usize,
    pub allowed: usize,
    pub started: usize,
    pub filtered: usize,
}
