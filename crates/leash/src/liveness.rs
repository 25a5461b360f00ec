//! Background-liveness oracle
//!
//! Answers "is this owner identity currently a live, foreground-relevant
//! target?" from a point-in-time snapshot. One snapshot is captured per
//! filtering pass and discarded afterwards; staleness beyond one call is
//! out of scope. Fails closed: if the platform cannot be queried, nothing
//! is considered live.

use anyhow::{bail, Result};
use std::collections::HashSet;
use sysinfo::System;
use tracing::{debug, warn};

/// How relevant a process is to the user right now. Ordered from least to
/// most relevant; liveness requires strictly better than `Background`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Importance {
    Background,
    Service,
    Visible,
    Foreground,
}

/// One entry of a running-services listing
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub owner_uid: u32,
    pub pid: u32,
}

/// One entry of a running-processes listing
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub owner_uid: u32,
    pub pid: u32,
    pub importance: Importance,
}

/// Access to the platform's process-listing facility.
///
/// `running_services` is the preferred listing (cheaper, more precise for
/// service-oriented liveness); implementations return an error where the
/// platform does not expose it, and the snapshot falls back to
/// `running_processes`.
pub trait ProcessSource: Send + Sync {
    fn running_services(&self) -> Result<Vec<ServiceEntry>>;
    fn running_processes(&self) -> Result<Vec<ProcessEntry>>;
}

/// One-shot cache of live owner uids
pub struct LivenessSnapshot {
    live: HashSet<u32>,
}

impl LivenessSnapshot {
    /// Capture a snapshot from the source.
    ///
    /// A service entry counts as live with a nonzero pid; a process entry
    /// additionally needs importance strictly better than background. The
    /// same uid across multiple processes is not merged - one live entry
    /// with the uid suffices.
    pub fn capture(source: &dyn ProcessSource) -> Self {
        let live = match source.running_services() {
            Ok(services) => services
                .into_iter()
                .filter(|s| s.pid != 0)
                .map(|s| s.owner_uid)
                .collect(),
            Err(err) => {
                debug!(error = %err, "service listing unavailable, using process listing");
                match source.running_processes() {
                    Ok(processes) => processes
                        .into_iter()
                        .filter(|p| p.pid != 0 && p.importance > Importance::Background)
                        .map(|p| p.owner_uid)
                        .collect(),
                    Err(err) => {
                        // Fail closed: treat every identity as background.
                        warn!(error = %err, "process listing failed, treating all identities as background");
                        HashSet::new()
                    }
                }
            }
        };

        Self { live }
    }

    pub fn is_live(&self, owner_uid: u32) -> bool {
        self.live.contains(&owner_uid)
    }
}

/// Production source backed by the sysinfo crate.
///
/// There is no native service listing on the platforms sysinfo covers, so
/// snapshots always take the process fallback.
pub struct SysinfoSource;

impl ProcessSource for SysinfoSource {
    fn running_services(&self) -> Result<Vec<ServiceEntry>> {
        bail!("no native service listing on this platform")
    }

    fn running_processes(&self) -> Result<Vec<ProcessEntry>> {
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        Ok(sys
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let owner_uid = process_uid(process)?;
                Some(ProcessEntry {
                    owner_uid,
                    pid: pid.as_u32(),
                    importance: importance_of(process.status()),
                })
            })
            .collect())
    }
}

#[cfg(unix)]
fn process_uid(process: &sysinfo::Process) -> Option<u32> {
    process.user_id().map(|uid| **uid)
}

#[cfg(not(unix))]
fn process_uid(_process: &sysinfo::Process) -> Option<u32> {
    None
}

fn importance_of(status: sysinfo::ProcessStatus) -> Importance {
    use sysinfo::ProcessStatus;

    match status {
        ProcessStatus::Zombie | ProcessStatus::Stop | ProcessStatus::Dead => {
            Importance::Background
        }
        _ => Importance::Service,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        services: Result<Vec<ServiceEntry>, String>,
        processes: Result<Vec<ProcessEntry>, String>,
    }

    impl ProcessSource for FixedSource {
        fn running_services(&self) -> Result<Vec<ServiceEntry>> {
            match &self.services {
                Ok(entries) => Ok(entries.clone()),
                Err(msg) => bail!("{}", msg),
            }
        }

        fn running_processes(&self) -> Result<Vec<ProcessEntry>> {
            match &self.processes {
                Ok(entries) => Ok(entries.clone()),
                Err(msg) => bail!("{}", msg),
            }
        }
    }

    #[test]
    fn test_prefers_service_listing() {
        let source = FixedSource {
            services: Ok(vec![
                ServiceEntry {
                    owner_uid: 1001,
                    pid: 42,
                },
                ServiceEntry {
                    owner_uid: 1002,
                    pid: 0,
                },
            ]),
            processes: Ok(vec![ProcessEntry {
                owner_uid: 1003,
                pid: 7,
                importance: Importance::Foreground,
            }]),
        };

        let snapshot = LivenessSnapshot::capture(&source);
        assert!(snapshot.is_live(1001));
        // Zero pid is not live.
        assert!(!snapshot.is_live(1002));
        // The process listing was never consulted.
        assert!(!snapshot.is_live(1003));
    }

    #[test]
    fn test_process_fallback_requires_better_than_background() {
        let source = FixedSource {
            services: Err("restricted".into()),
            processes: Ok(vec![
                ProcessEntry {
                    owner_uid: 2001,
                    pid: 10,
                    importance: Importance::Service,
                },
                ProcessEntry {
                    owner_uid: 2002,
                    pid: 11,
                    importance: Importance::Background,
                },
                ProcessEntry {
                    owner_uid: 2003,
                    pid: 0,
                    importance: Importance::Foreground,
                },
            ]),
        };

        let snapshot = LivenessSnapshot::capture(&source);
        assert!(snapshot.is_live(2001));
        assert!(!snapshot.is_live(2002));
        assert!(!snapshot.is_live(2003));
    }

    #[test]
    fn test_fails_closed() {
        let source = FixedSource {
            services: Err("restricted".into()),
            processes: Err("also restricted".into()),
        };

        let snapshot = LivenessSnapshot::capture(&source);
        assert!(!snapshot.is_live(1001));
        assert!(!snapshot.is_live(0));
    }

    #[test]
    fn test_empty_service_listing_is_authoritative() {
        // An empty Ok listing means "nothing is running", not "fall back".
        let source = FixedSource {
            services: Ok(vec![]),
            processes: Ok(vec![ProcessEntry {
                owner_uid: 3001,
                pid: 5,
                importance: Importance::Foreground,
            }]),
        };

        let snapshot = LivenessSnapshot::capture(&source);
        assert!(!snapshot.is_live(3001));
    }

    #[test]
    fn test_importance_ordering() {
        assert!(Importance::Service > Importance::Background);
        assert!(Importance::Visible > Importance::Service);
        assert!(Importance::Foreground > Importance::Visible);
    }
}
