//! Collected configuration and runtime issues
//!
//! Problems the cache can live with (a degraded shard, a suspicious option,
//! a dropped write) are recorded here instead of failing requests. Each
//! distinct issue is logged once, when first reported.

use parking_lot::Mutex;
use rendercache_common::{Issue, Severity};
use tracing::{error, info, warn};

/// Oldest issues are discarded beyond this many
const MAX_ISSUES: usize = 256;

#[derive(Debug, Default)]
pub struct IssueSink {
    issues: Mutex<Vec<Issue>>,
}

impl IssueSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an issue; exact duplicates are ignored
    pub fn report(&self, issue: Issue) {
        let mut issues = self.issues.lock();
        if issues.contains(&issue) {
            return;
        }
        match issue.severity {
            Severity::Info => info!("{}", issue),
            Severity::Warning => warn!("{}", issue),
            Severity::Error | Severity::Critical => error!("{}", issue),
        }
        if issues.len() >= MAX_ISSUES {
            issues.remove(0);
        }
        issues.push(issue);
    }

    pub fn extend(&self, issues: impl IntoIterator<Item = Issue>) {
        for issue in issues {
            self.report(issue);
        }
    }

    /// Copy of every recorded issue, oldest first
    pub fn snapshot(&self) -> Vec<Issue> {
        self.issues.lock().clone()
    }

    /// Highest recorded severity, if any
    pub fn worst(&self) -> Option<Severity> {
        self.issues.lock().iter().map(|i| i.severity).max()
    }

    pub fn len(&self) -> usize {
        self.issues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_collapsed() {
        let sink = IssueSink::new();
        sink.report(Issue::warning("shard 3", "log unreadable"));
        sink.report(Issue::warning("shard 3", "log unreadable"));
        sink.report(Issue::error("shard 4", "log unreadable"));
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.worst(), Some(Severity::Error));
    }

    #[test]
    fn test_bounded() {
        let sink = IssueSink::new();
        for n in 0..(MAX_ISSUES + 10) {
            sink.report(Issue::info("test", format!("issue {n}")));
        }
        assert_eq!(sink.len(), MAX_ISSUES);
        assert_eq!(sink.snapshot()[0].message, "issue 10");
    }
}
