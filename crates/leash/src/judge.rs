//! The outbound judge protocol
//!
//! A judge is host-supplied policy: one synchronous predicate consulted per
//! call, or once per candidate for discovery operations. The engine treats
//! it as untrusted code - a faulting judge never takes the real call down
//! with it.

use crate::request::{CallKind, OutboundRequest};
use anyhow::Result;

/// External allow/deny predicate for outbound calls.
///
/// Implementations must not block indefinitely; the engine calls them on
/// whatever thread the intercepted call arrived on.
pub trait OutboundJudge: Send + Sync {
    /// Decide whether an outbound call to `target` may proceed.
    ///
    /// `target` is the explicit target identity for single-target calls,
    /// or one candidate's identity during a discovery filtering pass.
    fn should_allow(&self, kind: CallKind, request: &OutboundRequest, target: &str)
        -> Result<bool>;
}

/// Plain closures work as judges.
impl<F> OutboundJudge for F
where
    F: Fn(CallKind, &OutboundRequest, &str) -> bool + Send + Sync,
{
    fn should_allow(
        &self,
        kind: CallKind,
        request: &OutboundRequest,
        target: &str,
    ) -> Result<bool> {
        Ok(self(kind, request, target))
    }
}
