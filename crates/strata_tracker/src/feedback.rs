//! Feedback aggregation contract.
//!
//! Two roles share one interface: a *worker* produces per-simulation
//! artifacts into the object store, a *manager* loads them, aggregates,
//! reports, and checkpoints its own state. Concrete aggregators are
//! downstream; only the contract lives in the core.

use anyhow::Result;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackRole {
    Worker,
    Manager,
}

impl FeedbackRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackRole::Worker => "worker",
            FeedbackRole::Manager => "manager",
        }
    }
}

/// Identity of one feedback participant.
#[derive(Debug, Clone)]
pub struct FeedbackContext {
    pub role: FeedbackRole,
    pub name: String,
    pub hostname: String,
}

impl FeedbackContext {
    pub fn new(role: FeedbackRole, name: impl Into<String>) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let hostname = hostname
            .split('.')
            .next()
            .unwrap_or(hostname.as_str())
            .to_string();
        Self { role, name: name.into(), hostname }
    }
}

impl fmt::Display for FeedbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Feedback (role = {}; name = {}; host = {})",
            self.role.as_str(),
            self.name,
            self.hostname
        )
    }
}

/// Abstract aggregation lifecycle.
pub trait Feedback {
    fn context(&self) -> &FeedbackContext;

    /// Pull worker artifacts from the store.
    fn load(&mut self) -> Result<()>;

    /// Fold loaded artifacts into the aggregate.
    fn aggregate(&mut self) -> Result<()>;

    /// Publish the aggregate for downstream consumers.
    fn report(&mut self) -> Result<()>;

    fn checkpoint(&mut self) -> Result<()>;

    fn restore(&mut self) -> Result<()>;

    /// Cheap internal consistency check.
    fn self_test(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_carries_short_hostname() {
        let ctx = FeedbackContext::new(FeedbackRole::Manager, "density");
        assert_eq!(ctx.role, FeedbackRole::Manager);
        assert!(!ctx.hostname.contains('.'));
        assert!(ctx.to_string().contains("name = density"));
    }
}
