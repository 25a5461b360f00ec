//! Transport interception adapter
//!
//! Generic wrapper around a process-wide call dispatcher keyed by operation
//! name. Known operations are routed through the policy engine and the
//! candidate filter; everything else is forwarded unmodified. A failure
//! inside a hook is never allowed to fail a host call that would otherwise
//! have succeeded - the hook logs and forwards the original call.

use crate::engine::{EvalError, EvalOutcome, PolicyEngine};
use crate::filter::Candidate;
use crate::request::{CallKind, FlagCell, OutboundRequest};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// One call through the dispatcher
#[derive(Debug, Clone)]
pub struct Call {
    /// Operation name the dispatcher keys on
    pub op: String,
    /// Explicit target identity, if the operation has one
    pub target: Option<String>,
    /// The request object's flag word
    pub flags: FlagCell,
}

impl Call {
    pub fn new(op: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            target: None,
            flags: FlagCell::default(),
        }
    }

    pub fn to_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_flags(mut self, flags: FlagCell) -> Self {
        self.flags = flags;
        self
    }
}

/// What a dispatched call returns
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Resolved component handle for a start/bind
    Component(String),
    /// A broadcast was accepted for delivery
    Delivered,
    /// Result of a permission check
    Granted(bool),
    /// Opaque info record for a lookup
    Record(String),
    /// Candidate list from a discovery query
    Candidates(Vec<Candidate>),
    /// Single resolved candidate
    Resolved(Option<Candidate>),
    /// The canonical "nothing there" result
    None,
}

impl Reply {
    /// The canonical negative value a denied call of this kind returns -
    /// indistinguishable from the platform's own "no result".
    fn negative(kind: CallKind) -> Reply {
        match kind {
            CallKind::StartService | CallKind::BindService => Reply::None,
            // A broadcast caller cannot observe delivery; denial reports
            // success.
            CallKind::Broadcast => Reply::Delivered,
            CallKind::ContentAccess => Reply::None,
            CallKind::QueryServices | CallKind::QueryReceivers | CallKind::QueryPackages => {
                Reply::Candidates(Vec::new())
            }
            CallKind::GetApplicationInfo | CallKind::GetPackageInfo => Reply::None,
            CallKind::CheckPermission => Reply::Granted(false),
        }
    }
}

/// Errors a dispatcher can raise
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No handler for this operation name
    #[error("unknown operation: {0}")]
    UnknownOp(String),
    /// The call reached the platform and failed there
    #[error("{0}")]
    Failed(String),
}

/// A process-wide call dispatcher keyed by operation name.
///
/// The host's real transport implements this; `Interceptor` wraps it.
pub trait Dispatcher: Send + Sync + std::fmt::Debug {
    fn dispatch(&self, call: &Call) -> Result<Reply, DispatchError>;

    /// Interception layers return true so installs can detect an existing
    /// installation instead of double-wrapping.
    fn is_interceptor(&self) -> bool {
        false
    }
}

/// Errors rejected at interceptor setup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SetupError {
    /// Extension kits and the process-level interceptor are mutually
    /// exclusive by design; this is fatal, never a silent fallback.
    #[error("extension kits are registered ({0}); the process-level interceptor cannot be combined with kits")]
    KitsActive(String),
}

/// How one operation name is handled
enum OpRoute {
    Single(CallKind),
    RemoveBlocked(CallKind),
    FirstMatch(CallKind),
    Forward,
}

fn route(op: &str) -> OpRoute {
    match op {
        "start_service" => OpRoute::Single(CallKind::StartService),
        "bind_service" => OpRoute::Single(CallKind::BindService),
        "broadcast" | "broadcast_ordered" | "broadcast_sticky" => {
            OpRoute::Single(CallKind::Broadcast)
        }
        "content_access" => OpRoute::Single(CallKind::ContentAccess),
        "check_permission" => OpRoute::Single(CallKind::CheckPermission),
        "get_application_info" => OpRoute::Single(CallKind::GetApplicationInfo),
        "get_package_info" => OpRoute::Single(CallKind::GetPackageInfo),
        "query_packages" => OpRoute::Single(CallKind::QueryPackages),
        "query_services" => OpRoute::RemoveBlocked(CallKind::QueryServices),
        "query_receivers" => OpRoute::RemoveBlocked(CallKind::QueryReceivers),
        "resolve_service" => OpRoute::FirstMatch(CallKind::QueryServices),
        _ => OpRoute::Forward,
    }
}

/// The interception layer. Installed once over the host's dispatcher;
/// implements the same trait so the host swaps it in transparently.
pub struct Interceptor {
    inner: Arc<dyn Dispatcher>,
    engine: Arc<PolicyEngine>,
}

impl std::fmt::Debug for Interceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interceptor").finish_non_exhaustive()
    }
}

impl Interceptor {
    /// Wrap a dispatcher. Idempotent: an already-intercepted dispatcher is
    /// returned unchanged. Fails if the engine's config has extension kits
    /// registered - the two mechanisms are mutually exclusive.
    pub fn install(
        inner: Arc<dyn Dispatcher>,
        engine: Arc<PolicyEngine>,
    ) -> Result<Arc<dyn Dispatcher>, SetupError> {
        if !engine.config().kits().is_empty() {
            return Err(SetupError::KitsActive(engine.config().kits().join(", ")));
        }

        if inner.is_interceptor() {
            debug!("interceptor already installed, leaving dispatcher untouched");
            return Ok(inner);
        }

        Ok(Arc::new(Self { inner, engine }))
    }

    fn dispatch_single(&self, kind: CallKind, call: &Call) -> Result<Reply, DispatchError> {
        let request = self.request_for(kind, call);

        match self.engine.evaluate(&request, || self.inner.dispatch(call)) {
            Ok(EvalOutcome::Invoked(reply)) => Ok(reply),
            Ok(EvalOutcome::Denied) => Ok(Reply::negative(kind)),
            Err(EvalError::Call(err)) => Err(err),
            Err(EvalError::Judge(err)) => {
                warn!(error = %err, op = %call.op,
                    "policy hook failed, forwarding call unmodified");
                self.inner.dispatch(call)
            }
        }
    }

    fn dispatch_query(
        &self,
        kind: CallKind,
        call: &Call,
        first_match: bool,
    ) -> Result<Reply, DispatchError> {
        let request = self.request_for(kind, call);

        // A resolve-style lookup launders through the underlying list
        // query so first-match filtering has the full candidate set.
        let inner_call = if first_match {
            Call {
                op: "query_services".to_string(),
                target: call.target.clone(),
                flags: call.flags.clone(),
            }
        } else {
            call.clone()
        };

        match self
            .engine
            .evaluate(&request, || self.inner.dispatch(&inner_call))
        {
            Ok(EvalOutcome::Invoked(Reply::Candidates(list))) => {
                if first_match {
                    Ok(Reply::Resolved(
                        self.engine.first_allowed(kind, &request, &list),
                    ))
                } else {
                    Ok(Reply::Candidates(
                        self.engine.retain_allowed(kind, &request, list),
                    ))
                }
            }
            // Unexpected reply shape: not ours to interpret.
            Ok(EvalOutcome::Invoked(other)) => Ok(other),
            Ok(EvalOutcome::Denied) => {
                if first_match {
                    Ok(Reply::Resolved(None))
                } else {
                    Ok(Reply::negative(kind))
                }
            }
            Err(EvalError::Call(err)) => Err(err),
            Err(EvalError::Judge(err)) => {
                warn!(error = %err, op = %call.op,
                    "policy hook failed, forwarding call unmodified");
                self.inner.dispatch(call)
            }
        }
    }

    fn request_for(&self, kind: CallKind, call: &Call) -> OutboundRequest {
        let request = OutboundRequest::new(kind, call.flags.clone());
        match &call.target {
            Some(target) => request.to_target(target.clone()),
            None => request,
        }
    }
}

impl Dispatcher for Interceptor {
    fn dispatch(&self, call: &Call) -> Result<Reply, DispatchError> {
        match route(&call.op) {
            OpRoute::Forward => self.inner.dispatch(call),
            OpRoute::Single(kind) => self.dispatch_single(kind, call),
            OpRoute::RemoveBlocked(kind) => self.dispatch_query(kind, call, false),
            OpRoute::FirstMatch(kind) => self.dispatch_query(kind, call, true),
        }
    }

    fn is_interceptor(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditKind, MemorySink};
    use crate::config::PolicyConfig;
    use crate::judge::OutboundJudge;
    use crate::liveness::{ProcessSource, ServiceEntry};
    use crate::request::CallFlags;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SELF: &str = "com.example.host";
    const SELF_UID: u32 = 1000;
    const LIVE_UID: u32 = 1010;
    const DEAD_UID: u32 = 999_999_999;

    /// Scriptable fake platform transport. Flag words are snapshotted at
    /// dispatch time, since the live cell is restored before the caller
    /// can look at it.
    struct FakeTransport {
        replies: Mutex<HashMap<String, Reply>>,
        calls: Mutex<Vec<(String, CallFlags)>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                replies: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_reply(self, op: &str, reply: Reply) -> Self {
            self.replies.lock().unwrap().insert(op.to_string(), reply);
            self
        }

        fn calls(&self) -> Vec<(String, CallFlags)> {
            self.calls.lock().unwrap().clone()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl std::fmt::Debug for FakeTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("FakeTransport").finish_non_exhaustive()
        }
    }

    impl Dispatcher for FakeTransport {
        fn dispatch(&self, call: &Call) -> Result<Reply, DispatchError> {
            self.calls
                .lock()
                .unwrap()
                .push((call.op.clone(), call.flags.get()));
            self.replies
                .lock()
                .unwrap()
                .get(&call.op)
                .cloned()
                .ok_or_else(|| DispatchError::UnknownOp(call.op.clone()))
        }
    }

    struct ServicesUp;

    impl ProcessSource for ServicesUp {
        fn running_services(&self) -> anyhow::Result<Vec<ServiceEntry>> {
            Ok(vec![ServiceEntry {
                owner_uid: LIVE_UID,
                pid: 42,
            }])
        }

        fn running_processes(&self) -> anyhow::Result<Vec<crate::liveness::ProcessEntry>> {
            anyhow::bail!("unused in these tests")
        }
    }

    fn engine(config: PolicyConfig, sink: Arc<MemorySink>) -> Arc<PolicyEngine> {
        Arc::new(
            PolicyEngine::builder(SELF)
                .uid(SELF_UID)
                .config(Arc::new(config))
                .audit_sink(sink)
                .process_source(Arc::new(ServicesUp))
                .build(),
        )
    }

    fn deny(target: &'static str) -> impl OutboundJudge {
        move |_: CallKind, _: &OutboundRequest, identity: &str| identity != target
    }

    fn discovery_candidates() -> Reply {
        Reply::Candidates(vec![
            Candidate::new(SELF, SELF_UID),
            Candidate::new("com.dead.app", DEAD_UID),
            Candidate::new("com.live.app", LIVE_UID),
        ])
    }

    #[test]
    fn test_unknown_ops_forwarded_unmodified() {
        let transport = Arc::new(FakeTransport::new().with_reply("frobnicate", Reply::Delivered));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(transport.clone(), engine(PolicyConfig::default(), sink))
            .unwrap();

        let reply = wrapped.dispatch(&Call::new("frobnicate")).unwrap();
        assert_eq!(reply, Reply::Delivered);
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_denied_broadcast_reports_success() {
        let transport = Arc::new(FakeTransport::new().with_reply("broadcast", Reply::Delivered));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::builder().judge(deny("a.b.c")).build(), sink.clone()),
        )
        .unwrap();

        let reply = wrapped
            .dispatch(&Call::new("broadcast").to_target("a.b.c"))
            .unwrap();

        // Denial is indistinguishable from delivery, but nothing reached
        // the platform and nothing was audited as allowed.
        assert_eq!(reply, Reply::Delivered);
        assert_eq!(transport.call_count(), 0);
        assert_eq!(sink.count(AuditKind::CallAllowed), 0);
    }

    #[test]
    fn test_denied_start_returns_negative() {
        let transport = Arc::new(
            FakeTransport::new().with_reply("start_service", Reply::Component("svc".into())),
        );
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::builder().judge(deny("a.b.c")).build(), sink),
        )
        .unwrap();

        let reply = wrapped
            .dispatch(&Call::new("start_service").to_target("a.b.c"))
            .unwrap();
        assert_eq!(reply, Reply::None);
        assert_eq!(transport.call_count(), 0);
    }

    #[test]
    fn test_allowed_call_passes_and_audits() {
        let transport = Arc::new(
            FakeTransport::new().with_reply("start_service", Reply::Component("svc".into())),
        );
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::builder().judge(deny("a.b.c")).build(), sink.clone()),
        )
        .unwrap();

        let reply = wrapped
            .dispatch(&Call::new("start_service").to_target("com.ok.app"))
            .unwrap();
        assert_eq!(reply, Reply::Component("svc".into()));
        assert_eq!(sink.count(AuditKind::CallStarted), 1);
    }

    #[test]
    fn test_query_services_removes_blocked() {
        let transport =
            Arc::new(FakeTransport::new().with_reply("query_services", discovery_candidates()));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::default(), sink.clone()),
        )
        .unwrap();

        let reply = wrapped.dispatch(&Call::new("query_services")).unwrap();
        let Reply::Candidates(kept) = reply else {
            panic!("expected candidates");
        };

        let identities: Vec<&str> = kept.iter().map(|c| c.identity.as_str()).collect();
        assert_eq!(identities, vec![SELF, "com.live.app"]);
        assert_eq!(sink.count(AuditKind::CallDeniedByFilter), 1);
    }

    #[test]
    fn test_resolve_service_picks_first_allowed() {
        let transport =
            Arc::new(FakeTransport::new().with_reply("query_services", Reply::Candidates(vec![
                Candidate::new("com.dead.app", DEAD_UID),
                Candidate::new("com.live.app", LIVE_UID),
            ])));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::default(), sink),
        )
        .unwrap();

        let reply = wrapped.dispatch(&Call::new("resolve_service")).unwrap();
        assert_eq!(
            reply,
            Reply::Resolved(Some(Candidate::new("com.live.app", LIVE_UID)))
        );
        // The lookup was laundered through the list query.
        assert_eq!(transport.calls()[0].0, "query_services");
    }

    #[test]
    fn test_dry_run_query_keeps_everything_but_audits() {
        let transport =
            Arc::new(FakeTransport::new().with_reply("query_services", discovery_candidates()));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::builder().dry_run(true).build(), sink.clone()),
        )
        .unwrap();

        let Reply::Candidates(kept) = wrapped.dispatch(&Call::new("query_services")).unwrap()
        else {
            panic!("expected candidates");
        };
        assert_eq!(kept.len(), 3);

        let Reply::Resolved(first) = wrapped.dispatch(&Call::new("resolve_service")).unwrap()
        else {
            panic!("expected resolved");
        };
        // First in original order, verdicts notwithstanding.
        assert_eq!(first.unwrap().identity, SELF);

        // One would-be removal per pass, still audited.
        assert_eq!(sink.count(AuditKind::CallDeniedByFilter), 2);
    }

    #[test]
    fn test_judge_fault_fails_open() {
        struct FaultyJudge;
        impl OutboundJudge for FaultyJudge {
            fn should_allow(
                &self,
                _kind: CallKind,
                _request: &OutboundRequest,
                _target: &str,
            ) -> anyhow::Result<bool> {
                anyhow::bail!("judge exploded")
            }
        }

        let transport = Arc::new(FakeTransport::new().with_reply("broadcast", Reply::Delivered));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::builder().judge(FaultyJudge).build(), sink),
        )
        .unwrap();

        let reply = wrapped
            .dispatch(&Call::new("broadcast").to_target("a.b.c"))
            .unwrap();

        // The call went through unmodified despite the broken judge.
        assert_eq!(reply, Reply::Delivered);
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_platform_error_passes_through() {
        // No reply scripted for the op: the fake raises UnknownOp from the
        // platform side.
        let transport = Arc::new(FakeTransport::new());
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::default(), sink),
        )
        .unwrap();

        let err = wrapped
            .dispatch(&Call::new("broadcast").to_target("a.b.c"))
            .unwrap_err();
        assert_eq!(err, DispatchError::UnknownOp("broadcast".into()));
        assert_eq!(transport.call_count(), 1);
    }

    #[test]
    fn test_install_is_idempotent() {
        let transport: Arc<dyn Dispatcher> = Arc::new(FakeTransport::new());
        let sink = Arc::new(MemorySink::new());
        let eng = engine(PolicyConfig::default(), sink);

        let once = Interceptor::install(transport, eng.clone()).unwrap();
        let twice = Interceptor::install(once.clone(), eng).unwrap();

        // Exactly one active interception layer.
        assert!(Arc::ptr_eq(&once, &twice));
    }

    #[test]
    fn test_install_rejects_registered_kits() {
        let transport: Arc<dyn Dispatcher> = Arc::new(FakeTransport::new());
        let sink = Arc::new(MemorySink::new());
        let eng = engine(
            PolicyConfig::builder().kit("permission-spoof").build(),
            sink,
        );

        let err = Interceptor::install(transport, eng).unwrap_err();
        assert_eq!(err, SetupError::KitsActive("permission-spoof".into()));
    }

    #[test]
    fn test_flags_restored_after_intercepted_broadcast() {
        let transport = Arc::new(FakeTransport::new().with_reply("broadcast", Reply::Delivered));
        let sink = Arc::new(MemorySink::new());
        let wrapped = Interceptor::install(
            transport.clone(),
            engine(PolicyConfig::default(), sink),
        )
        .unwrap();

        let flags = FlagCell::new(CallFlags::INCLUDE_STOPPED);
        wrapped
            .dispatch(
                &Call::new("broadcast")
                    .to_target("com.other.app")
                    .with_flags(flags.clone()),
            )
            .unwrap();

        // The platform saw the tuned word; the caller gets the original
        // back.
        let seen = transport.calls()[0].1;
        assert!(seen.contains(CallFlags::EXCLUDE_STOPPED));
        assert!(!seen.contains(CallFlags::INCLUDE_STOPPED));
        assert_eq!(flags.get(), CallFlags::INCLUDE_STOPPED);
    }
}
