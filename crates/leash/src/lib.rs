//! Leash - Outbound-call policy layer
//!
//! "Your process, your rules - even for the code you didn't write."
//!
//! Leash sits between a host application and its inter-process call surface
//! and lets the host selectively suppress or launder outbound calls made by
//! embedded third-party code, without that code's cooperation, while staying
//! otherwise transparent:
//!
//! - Calls targeting the host itself always pass through untouched.
//! - A host-supplied judge decides allow/deny per target identity.
//! - Discovery queries get per-candidate filtering, with a liveness
//!   heuristic keeping background-owned candidates out.
//! - Request attributes tuned for a call are restored on every exit path.
//! - Dry-run computes and audits every decision without enforcing any.
//!
//! The policy is cooperative, not a security boundary against a hostile
//! process.

pub mod audit;
pub mod config;
pub mod engine;
pub mod filter;
pub mod judge;
pub mod liveness;
pub mod request;
pub mod transport;

pub use audit::{AuditEvent, AuditKind, AuditLog, AuditSink, JsonlSink, MemorySink};
pub use config::{PolicyConfig, PolicyConfigBuilder};
pub use engine::{EvalError, EvalOutcome, PolicyEngine, PolicyEngineBuilder};
pub use filter::Candidate;
pub use judge::OutboundJudge;
pub use liveness::{Importance, LivenessSnapshot, ProcessSource, SysinfoSource};
pub use request::{CallFlags, CallKind, FlagCell, OutboundRequest};
pub use transport::{Call, DispatchError, Dispatcher, Interceptor, Reply, SetupError};
