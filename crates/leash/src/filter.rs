//! Candidate-list filtering for discovery queries
//!
//! Multi-candidate queries (service/receiver discovery) do not get a single
//! allow/deny: every candidate is judged on its own, and candidates whose
//! owner is not currently live can be dropped as well. Filtering never
//! mutates the platform's result list - it consumes and rebuilds it.

use crate::audit::{AuditKind, AuditLog};
use crate::config::ConfigSnapshot;
use crate::judge::OutboundJudge;
use crate::liveness::{LivenessSnapshot, ProcessSource};
use crate::request::{CallKind, OutboundRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One entry of a multi-result discovery query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Application/package identity the entry resolves to
    pub identity: String,
    /// Numeric identity of the owning process space
    pub owner_uid: u32,
}

impl Candidate {
    pub fn new(identity: impl Into<String>, owner_uid: u32) -> Self {
        Self {
            identity: identity.into(),
            owner_uid,
        }
    }
}

/// One filtering pass over one query's candidates.
///
/// Holds the config snapshot taken at entry and the lazily-captured
/// liveness snapshot, so the platform is queried at most once per pass no
/// matter how many candidates there are.
pub(crate) struct FilterPass<'e> {
    self_uid: u32,
    exclude_background_services: bool,
    judge: Option<Arc<dyn OutboundJudge>>,
    dry_run: bool,
    audit: &'e AuditLog,
    source: &'e dyn ProcessSource,
    liveness: Option<LivenessSnapshot>,
}

impl<'e> FilterPass<'e> {
    pub fn new(
        self_uid: u32,
        exclude_background_services: bool,
        snapshot: ConfigSnapshot,
        audit: &'e AuditLog,
        source: &'e dyn ProcessSource,
    ) -> Self {
        Self {
            self_uid,
            exclude_background_services,
            judge: snapshot.judge,
            dry_run: snapshot.dry_run,
            audit,
            source,
            liveness: None,
        }
    }

    /// Remove-blocked mode: return a new sequence without the blocked
    /// candidates. Under dry-run nothing is removed, but every would-be
    /// removal is still audited.
    pub fn retain_allowed(
        mut self,
        kind: CallKind,
        request: &OutboundRequest,
        candidates: Vec<Candidate>,
    ) -> Vec<Candidate> {
        if self.dry_run {
            for candidate in &candidates {
                self.blocked(kind, request, candidate);
            }
            return candidates;
        }

        candidates
            .into_iter()
            .filter(|candidate| !self.blocked(kind, request, candidate))
            .collect()
    }

    /// First-match mode: the first candidate, in original order, that is
    /// not blocked. Under dry-run the first candidate is returned
    /// regardless of verdicts; the verdicts are still computed and audited.
    pub fn first_allowed(
        mut self,
        kind: CallKind,
        request: &OutboundRequest,
        candidates: &[Candidate],
    ) -> Option<Candidate> {
        if self.dry_run {
            for candidate in candidates {
                self.blocked(kind, request, candidate);
            }
            return candidates.first().cloned();
        }

        candidates
            .iter()
            .find(|candidate| !self.blocked(kind, request, candidate))
            .cloned()
    }

    /// The blocking predicate, in precedence order: self-owned candidates
    /// are never blocked, the judge outranks liveness, liveness only
    /// applies when background services are excluded.
    fn blocked(&mut self, kind: CallKind, request: &OutboundRequest, candidate: &Candidate) -> bool {
        if candidate.owner_uid == self.self_uid {
            return false;
        }

        if let Some(judge) = self.judge.clone() {
            match judge.should_allow(kind, request, &candidate.identity) {
                Ok(false) => {
                    self.audit_denial(request, candidate);
                    return true;
                }
                Ok(true) => {}
                Err(err) => {
                    // A broken judge must not fail a live query pass.
                    warn!(
                        error = %err,
                        identity = %candidate.identity,
                        "judge failed during candidate filtering, treating as allowed"
                    );
                }
            }
        }

        if self.exclude_background_services {
            let live = self
                .liveness
                .get_or_insert_with(|| LivenessSnapshot::capture(self.source))
                .is_live(candidate.owner_uid);
            if !live {
                debug!(
                    identity = %candidate.identity,
                    owner_uid = candidate.owner_uid,
                    "candidate owner not live, blocking"
                );
                self.audit_denial(request, candidate);
                return true;
            }
        }

        false
    }

    fn audit_denial(&self, request: &OutboundRequest, candidate: &Candidate) {
        self.audit.record(
            AuditKind::CallDeniedByFilter,
            &[&candidate.identity, &request.to_string()],
        );
    }
}
