//! Policy configuration
//!
//! The `exclude_*` switches and the registered kit names are fixed when the
//! config is built; the judge and the dry-run flag may be swapped while
//! calls are in flight. Evaluations take one consistent snapshot of the
//! mutable fields at entry instead of re-reading them mid-call.

use crate::judge::OutboundJudge;
use std::sync::{Arc, PoisonError, RwLock};

/// Instance-scoped policy configuration
pub struct PolicyConfig {
    exclude_background_receivers: bool,
    exclude_background_services: bool,
    kits: Vec<String>,
    runtime: RwLock<Runtime>,
}

/// The runtime-swappable fields, kept behind one lock so a snapshot is
/// always internally consistent
#[derive(Clone, Default)]
struct Runtime {
    judge: Option<Arc<dyn OutboundJudge>>,
    dry_run: bool,
}

/// Point-in-time view of the mutable fields, taken once per evaluation
#[derive(Clone)]
pub(crate) struct ConfigSnapshot {
    pub judge: Option<Arc<dyn OutboundJudge>>,
    pub dry_run: bool,
}

impl PolicyConfig {
    pub fn builder() -> PolicyConfigBuilder {
        PolicyConfigBuilder::default()
    }

    pub fn exclude_background_receivers(&self) -> bool {
        self.exclude_background_receivers
    }

    pub fn exclude_background_services(&self) -> bool {
        self.exclude_background_services
    }

    /// Names of registered extension kits. Only consulted for the
    /// process-level interceptor's mutual-exclusion check.
    pub fn kits(&self) -> &[String] {
        &self.kits
    }

    /// Swap the judge at runtime; `None` removes it (allow everything)
    pub fn set_judge(&self, judge: Option<Arc<dyn OutboundJudge>>) {
        self.write().judge = judge;
    }

    /// Toggle dry-run at runtime
    pub fn set_dry_run(&self, dry_run: bool) {
        self.write().dry_run = dry_run;
    }

    pub fn dry_run(&self) -> bool {
        self.read().dry_run
    }

    pub(crate) fn snapshot(&self) -> ConfigSnapshot {
        let runtime = self.read();
        ConfigSnapshot {
            judge: runtime.judge.clone(),
            dry_run: runtime.dry_run,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Runtime> {
        self.runtime.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Runtime> {
        self.runtime.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`PolicyConfig`]
#[derive(Default)]
pub struct PolicyConfigBuilder {
    exclude_background_receivers: Option<bool>,
    exclude_background_services: Option<bool>,
    kits: Vec<String>,
    judge: Option<Arc<dyn OutboundJudge>>,
    dry_run: bool,
}

impl PolicyConfigBuilder {
    /// Keep broadcasts and receiver queries away from background targets
    /// (default true)
    pub fn exclude_background_receivers(mut self, exclude: bool) -> Self {
        self.exclude_background_receivers = Some(exclude);
        self
    }

    /// Drop service candidates whose owner is not currently live
    /// (default true)
    pub fn exclude_background_services(mut self, exclude: bool) -> Self {
        self.exclude_background_services = Some(exclude);
        self
    }

    pub fn judge(mut self, judge: impl OutboundJudge + 'static) -> Self {
        self.judge = Some(Arc::new(judge));
        self
    }

    pub fn shared_judge(mut self, judge: Arc<dyn OutboundJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Compute and audit decisions without enforcing them (default false)
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Register an extension kit by name. Kits and the process-level
    /// interceptor are mutually exclusive; see `Interceptor::install`.
    pub fn kit(mut self, name: impl Into<String>) -> Self {
        self.kits.push(name.into());
        self
    }

    pub fn build(self) -> PolicyConfig {
        PolicyConfig {
            exclude_background_receivers: self.exclude_background_receivers.unwrap_or(true),
            exclude_background_services: self.exclude_background_services.unwrap_or(true),
            kits: self.kits,
            runtime: RwLock::new(Runtime {
                judge: self.judge,
                dry_run: self.dry_run,
            }),
        }
    }
}
