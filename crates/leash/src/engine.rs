//! The outbound-call policy engine
//!
//! One decision pipeline per intercepted call: self-target shortcut, judge
//! consultation, attribute mutation with guaranteed restoration, and audit.
//! The engine is stateless per call apart from the shared config; it can be
//! driven from any thread.

use crate::audit::{AuditKind, AuditLog, AuditSink, JsonlSink};
use crate::config::PolicyConfig;
use crate::filter::{Candidate, FilterPass};
use crate::judge::OutboundJudge;
use crate::liveness::{ProcessSource, SysinfoSource};
use crate::request::{CallFlags, CallKind, FlagCell, OutboundRequest};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// What `evaluate` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome<T> {
    /// The underlying call ran; here is its result
    Invoked(T),
    /// Policy denied the call; nothing was invoked. The call site maps
    /// this to the operation's canonical negative value.
    Denied,
}

impl<T> EvalOutcome<T> {
    pub fn invoked(self) -> Option<T> {
        match self {
            EvalOutcome::Invoked(value) => Some(value),
            EvalOutcome::Denied => None,
        }
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, EvalOutcome::Denied)
    }
}

/// Failures surfacing from `evaluate`
#[derive(Debug, Error)]
pub enum EvalError<E: std::error::Error> {
    /// The configured judge failed. Nothing was invoked; callers that must
    /// stay transparent forward the original call unmodified.
    #[error("outbound judge failed: {0}")]
    Judge(anyhow::Error),
    /// The underlying call itself failed; passed through unchanged
    #[error("outbound call failed: {0}")]
    Call(E),
}

/// The policy engine. One instance per guarded surface, bound to a fixed
/// self identity/uid and one [`PolicyConfig`].
pub struct PolicyEngine {
    identity: String,
    uid: u32,
    config: Arc<PolicyConfig>,
    audit: AuditLog,
    source: Arc<dyn ProcessSource>,
}

impl PolicyEngine {
    /// Create an engine with defaults for everything but the identity
    pub fn new(identity: impl Into<String>) -> Self {
        Self::builder(identity).build()
    }

    pub fn builder(identity: impl Into<String>) -> PolicyEngineBuilder {
        PolicyEngineBuilder {
            identity: identity.into(),
            uid: None,
            tag: None,
            config: None,
            sink: None,
            source: None,
        }
    }

    /// The engine's own identity; calls targeting it are never altered
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Evaluate one outbound call.
    ///
    /// `invoke` performs the real underlying call and is run at most once.
    /// The request's flag word is restored to its entry value on every
    /// exit path, including an error or unwind out of `invoke`.
    pub fn evaluate<T, E>(
        &self,
        request: &OutboundRequest,
        invoke: impl FnOnce() -> Result<T, E>,
    ) -> Result<EvalOutcome<T>, EvalError<E>>
    where
        E: std::error::Error,
    {
        // Self-target shortcut: intra-app calls pass through untouched,
        // unjudged, and unaudited.
        if request.target() == Some(self.identity.as_str()) {
            return invoke().map(EvalOutcome::Invoked).map_err(EvalError::Call);
        }

        let snapshot = self.config.snapshot();

        if request.kind().is_sensitive_lookup() {
            self.audit.record(
                AuditKind::Concern,
                &[request.kind().as_str(), request.target().unwrap_or("*")],
            );
        }

        if let (Some(target), Some(judge)) = (request.target(), snapshot.judge.as_ref()) {
            let allowed = judge
                .should_allow(request.kind(), request, target)
                .map_err(EvalError::Judge)?;
            if !allowed {
                if snapshot.dry_run {
                    debug!(target_identity = target, request = %request,
                        "dry-run: judge denial recorded, not enforced");
                } else {
                    debug!(target_identity = target, request = %request,
                        "outbound call denied by judge");
                    return Ok(EvalOutcome::Denied);
                }
            }
        }

        let result = if snapshot.dry_run || !request.kind().carries_flags() {
            invoke()
        } else {
            let flags = request.flags();
            let entry = flags.get();

            let mut tuned = entry
                .with(CallFlags::EXCLUDE_STOPPED)
                .without(CallFlags::INCLUDE_STOPPED);
            if self.config.exclude_background_receivers()
                && request.kind().background_flag_applies()
            {
                tuned = tuned.with(CallFlags::EXCLUDE_BACKGROUND);
            }

            let _restore = RestoreFlags {
                cell: flags,
                saved: entry,
            };
            flags.set(tuned);
            invoke()
        };

        let value = result.map_err(EvalError::Call)?;

        if let Some(target) = request.target() {
            let kind = match request.kind() {
                CallKind::StartService => AuditKind::CallStarted,
                _ => AuditKind::CallAllowed,
            };
            self.audit.record(kind, &[target, &request.to_string()]);
        }

        Ok(EvalOutcome::Invoked(value))
    }

    /// Filter a discovery query's candidates, dropping the blocked ones.
    /// Returns a new sequence; the input is consumed, never mutated in
    /// place.
    pub fn retain_allowed(
        &self,
        kind: CallKind,
        request: &OutboundRequest,
        candidates: Vec<Candidate>,
    ) -> Vec<Candidate> {
        self.filter_pass().retain_allowed(kind, request, candidates)
    }

    /// Pick the first candidate, in original order, that is not blocked
    pub fn first_allowed(
        &self,
        kind: CallKind,
        request: &OutboundRequest,
        candidates: &[Candidate],
    ) -> Option<Candidate> {
        self.filter_pass().first_allowed(kind, request, candidates)
    }

    fn filter_pass(&self) -> FilterPass<'_> {
        FilterPass::new(
            self.uid,
            self.config.exclude_background_services(),
            self.config.snapshot(),
            &self.audit,
            self.source.as_ref(),
        )
    }
}

/// Restores the flag word on drop, so restoration runs on normal return,
/// error return, and unwind alike.
struct RestoreFlags<'a> {
    cell: &'a FlagCell,
    saved: CallFlags,
}

impl Drop for RestoreFlags<'_> {
    fn drop(&mut self) {
        self.cell.set(self.saved);
    }
}

/// Builder for [`PolicyEngine`]
pub struct PolicyEngineBuilder {
    identity: String,
    uid: Option<u32>,
    tag: Option<String>,
    config: Option<Arc<PolicyConfig>>,
    sink: Option<Arc<dyn AuditSink>>,
    source: Option<Arc<dyn ProcessSource>>,
}

impl PolicyEngineBuilder {
    /// Override the self uid (defaults to the current process owner)
    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Label audit events from this engine instance
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn config(mut self, config: Arc<PolicyConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn process_source(mut self, source: Arc<dyn ProcessSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> PolicyEngine {
        let tag = self.tag.unwrap_or_else(|| "leash".to_string());
        let sink = self
            .sink
            .unwrap_or_else(|| Arc::new(JsonlSink::new()) as Arc<dyn AuditSink>);

        PolicyEngine {
            uid: self.uid.unwrap_or_else(current_uid),
            config: self.config.unwrap_or_default(),
            audit: AuditLog::new(self.identity.clone(), tag, sink),
            source: self
                .source
                .unwrap_or_else(|| Arc::new(SysinfoSource) as Arc<dyn ProcessSource>),
            identity: self.identity,
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid cannot fail and touches no memory.
    unsafe { libc::getuid() as u32 }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
