//! Review decisions
//!
//! A [`Decision`] can only be built through its constructors, which keep
//! the verdict, reasons and score consistent with each other.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Approve or reject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// No reason fired
    Approve,
    /// At least one reason fired
    Reject,
}

impl Verdict {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }
}

/// Category of a rejection reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonKind {
    /// Empty or whitespace-only code
    Empty,
    /// Too many lines or bytes
    Oversize,
    /// Target path missing, escaping the root or not a file
    TargetPath,
    /// Code does not parse
    Syntax,
    /// Imports a banned module
    BannedImport,
    /// Calls a banned function
    BannedCall,
    /// Opens a file with a dynamic or out-of-root path
    UnsafeOpen,
    /// Looks like it embeds a credential
    Secret,
    /// Complexity estimate above the limit
    Complexity,
    /// Compile/load check in the sandbox failed
    MicroCheck,
    /// The review itself failed
    Internal,
}

impl ReasonKind {
    /// Critical reasons suppress the micro check: code known to be
    /// disqualified is never executed.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(
            self,
            Self::Empty
                | Self::Oversize
                | Self::TargetPath
                | Self::Syntax
                | Self::BannedImport
                | Self::BannedCall
                | Self::UnsafeOpen
                | Self::Secret
                | Self::Internal
        )
    }
}

/// One human-readable rejection reason
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reason {
    /// Category
    pub kind: ReasonKind,
    /// Explanation shown to operators
    pub message: String,
}

impl Reason {
    /// Create a reason
    #[must_use]
    pub fn new(kind: ReasonKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of the sandboxed compile/load check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroCheckOutcome {
    /// Exited zero within the limit
    pub passed: bool,
    /// Process exit code, if it exited
    pub exit_code: Option<i32>,
    /// Killed by the timeout
    pub timed_out: bool,
}

/// Measurements collected during review
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMetrics {
    /// Line count
    pub lines: usize,
    /// Byte count
    pub bytes: usize,
    /// Imported modules, sorted
    pub imports: Vec<String>,
    /// Resolved call names, sorted and deduplicated
    pub calls: Vec<String>,
    /// Cyclomatic complexity estimate
    pub complexity: u32,
    /// `None` when the micro check was skipped
    pub micro_check: Option<MicroCheckOutcome>,
}

/// Result of a curator review
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    verdict: Verdict,
    reasons: Vec<Reason>,
    score: u8,
    metrics: ReviewMetrics,
}

impl Decision {
    /// Judge from accumulated reasons.
    ///
    /// Rejects iff `reasons` is non-empty; score is `max(0, 100 - 10n)`.
    #[must_use]
    pub fn from_reasons(reasons: Vec<Reason>, metrics: ReviewMetrics) -> Self {
        let penalty = reasons.len().saturating_mul(10);
        let score = u8::try_from(100usize.saturating_sub(penalty)).unwrap_or(0);
        let verdict = if reasons.is_empty() {
            Verdict::Approve
        } else {
            Verdict::Reject
        };
        Self {
            verdict,
            reasons,
            score,
            metrics,
        }
    }

    /// Immediate rejection with score 0, used for empty and unparseable
    /// input where no partial credit makes sense.
    #[must_use]
    pub fn fail_fast(mut reasons: Vec<Reason>, reason: Reason, metrics: ReviewMetrics) -> Self {
        reasons.push(reason);
        Self {
            verdict: Verdict::Reject,
            reasons,
            score: 0,
            metrics,
        }
    }

    /// Rejection caused by a failure of the review itself
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::from_reasons(
            vec![Reason::new(ReasonKind::Internal, message)],
            ReviewMetrics::default(),
        )
    }

    /// Approve or reject
    #[inline]
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// Whether the code may proceed
    #[inline]
    #[must_use]
    pub fn is_approved(&self) -> bool {
        self.verdict == Verdict::Approve
    }

    /// Ordered reasons
    #[inline]
    #[must_use]
    pub fn reasons(&self) -> &[Reason] {
        &self.reasons
    }

    /// Reason messages only
    #[must_use]
    pub fn reason_messages(&self) -> Vec<String> {
        self.reasons.iter().map(|r| r.message.clone()).collect()
    }

    /// Whether any reason has the given kind
    #[must_use]
    pub fn has_reason(&self, kind: ReasonKind) -> bool {
        self.reasons.iter().any(|r| r.kind == kind)
    }

    /// Whether the rejection came from a failure of the review itself
    /// rather than from the code. Such decisions are never remembered.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.has_reason(ReasonKind::Internal)
    }

    /// Score in `0..=100`
    #[inline]
    #[must_use]
    pub fn score(&self) -> u8 {
        self.score
    }

    /// Review measurements
    #[inline]
    #[must_use]
    pub fn metrics(&self) -> &ReviewMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reasons(n: usize) -> Vec<Reason> {
        (0..n)
            .map(|i| Reason::new(ReasonKind::BannedImport, format!("r{i}")))
            .collect()
    }

    #[test]
    fn no_reasons_approves_with_full_score() {
        let d = Decision::from_reasons(Vec::new(), ReviewMetrics::default());
        assert!(d.is_approved());
        assert_eq!(d.score(), 100);
    }

    #[test]
    fn score_drops_ten_per_reason_and_floors_at_zero() {
        assert_eq!(Decision::from_reasons(reasons(1), ReviewMetrics::default()).score(), 90);
        assert_eq!(Decision::from_reasons(reasons(3), ReviewMetrics::default()).score(), 70);
        assert_eq!(Decision::from_reasons(reasons(12), ReviewMetrics::default()).score(), 0);
    }

    #[test]
    fn fail_fast_is_zero() {
        let d = Decision::fail_fast(
            Vec::new(),
            Reason::new(ReasonKind::Empty, "empty code"),
            ReviewMetrics::default(),
        );
        assert_eq!(d.verdict(), Verdict::Reject);
        assert_eq!(d.score(), 0);
        assert_eq!(d.reason_messages(), vec!["empty code".to_string()]);
    }

    #[test]
    fn critical_kinds() {
        assert!(ReasonKind::BannedCall.is_critical());
        assert!(ReasonKind::Secret.is_critical());
        assert!(!ReasonKind::Complexity.is_critical());
        assert!(!ReasonKind::MicroCheck.is_critical());
    }

    #[test]
    fn serializes_snake_case() {
        let d = Decision::internal("boom");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["verdict"], "reject");
        assert_eq!(json["reasons"][0]["kind"], "internal");
        assert_eq!(json["score"], 90);
    }
}
