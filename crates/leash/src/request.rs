//! Outbound request descriptors
//!
//! Everything the policy engine needs to know about one outbound call:
//! what kind of call it is, who it targets, and the flag word of the
//! underlying platform request object.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Kinds of outbound calls the policy layer can intercept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    /// Start a service component in another process
    StartService,
    /// Bind to a service component in another process
    BindService,
    /// Deliver a broadcast (plain, ordered, or sticky)
    Broadcast,
    /// Open a resource provider
    ContentAccess,
    /// Discovery query for matching services
    QueryServices,
    /// Discovery query for matching receivers
    QueryReceivers,
    /// Enumerate installed packages
    QueryPackages,
    /// Look up another application's info record
    GetApplicationInfo,
    /// Look up another package's info record
    GetPackageInfo,
    /// Check a permission held by another package
    CheckPermission,
}

impl CallKind {
    /// Get the string name
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::StartService => "start_service",
            CallKind::BindService => "bind_service",
            CallKind::Broadcast => "broadcast",
            CallKind::ContentAccess => "content_access",
            CallKind::QueryServices => "query_services",
            CallKind::QueryReceivers => "query_receivers",
            CallKind::QueryPackages => "query_packages",
            CallKind::GetApplicationInfo => "get_application_info",
            CallKind::GetPackageInfo => "get_package_info",
            CallKind::CheckPermission => "check_permission",
        }
    }

    /// Whether this kind of call has a flag word on the wire at all.
    /// The info and permission lookups carry no flags, so attribute
    /// mutation is a no-op for them by construction.
    pub fn carries_flags(&self) -> bool {
        matches!(
            self,
            CallKind::StartService
                | CallKind::BindService
                | CallKind::Broadcast
                | CallKind::QueryServices
                | CallKind::QueryReceivers
        )
    }

    /// Whether the exclude-background marker is meaningful for this kind
    pub fn background_flag_applies(&self) -> bool {
        matches!(self, CallKind::Broadcast | CallKind::QueryReceivers)
    }

    /// Lookups that touch sensitive surface and get a concern event
    pub fn is_sensitive_lookup(&self) -> bool {
        matches!(
            self,
            CallKind::QueryPackages
                | CallKind::GetApplicationInfo
                | CallKind::GetPackageInfo
                | CallKind::CheckPermission
        )
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flag word markers the engine manipulates.
///
/// The word itself belongs to the platform request object; these are the
/// only bits the engine ever touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CallFlags(u32);

impl CallFlags {
    /// Deliver only to foreground-relevant receivers
    pub const EXCLUDE_BACKGROUND: CallFlags = CallFlags(1);
    /// Skip targets in force-stopped packages
    pub const EXCLUDE_STOPPED: CallFlags = CallFlags(1 << 1);
    /// Include targets in force-stopped packages
    pub const INCLUDE_STOPPED: CallFlags = CallFlags(1 << 2);

    pub const fn empty() -> Self {
        CallFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        CallFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: CallFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: CallFlags) -> Self {
        CallFlags(self.0 | other.0)
    }

    pub const fn without(self, other: CallFlags) -> Self {
        CallFlags(self.0 & !other.0)
    }
}

impl fmt::Display for CallFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Shared handle to the flag word of the underlying platform request object.
///
/// The caller and the engine see the same word; the engine snapshots it,
/// tunes it for the duration of one invocation, and restores the snapshot
/// on every exit path.
#[derive(Debug, Clone, Default)]
pub struct FlagCell(Arc<AtomicU32>);

impl FlagCell {
    pub fn new(flags: CallFlags) -> Self {
        FlagCell(Arc::new(AtomicU32::new(flags.bits())))
    }

    pub fn get(&self) -> CallFlags {
        CallFlags::from_bits(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, flags: CallFlags) {
        self.0.store(flags.bits(), Ordering::SeqCst);
    }
}

/// Descriptor of a single outbound call.
///
/// Built by a call-site adapter per invocation, handed to the engine, and
/// discarded. Immutable by contract: only the engine touches `flags`, and
/// only inside its mutate-invoke-restore window.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    kind: CallKind,
    target: Option<String>,
    flags: FlagCell,
}

impl OutboundRequest {
    pub fn new(kind: CallKind, flags: FlagCell) -> Self {
        Self {
            kind,
            target: None,
            flags,
        }
    }

    /// Set the explicit target component/package identity
    pub fn to_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// Explicit target identity, absent for implicit/broadcast-style calls
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn flags(&self) -> &FlagCell {
        &self.flags
    }
}

impl fmt::Display for OutboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} target={} flags={}",
            self.kind,
            self.target.as_deref().unwrap_or("<implicit>"),
            self.flags.get()
        )
    }
}
