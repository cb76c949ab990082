//! Warden Curator
//!
//! The security and quality gate every candidate file passes before it may
//! touch the live tree.
//!
//! # Review pipeline
//!
//! ```text
//! code ─► empty? ─► size ─► target in root ─► parse ─► imports / calls / complexity
//!                                                  └─► secrets ─► micro check (sandbox)
//!                                                                     │
//!                                                        Decision { verdict, reasons, score }
//! ```
//!
//! Empty input and unparseable input reject immediately with score 0.
//! Every other check accumulates reasons; the verdict is `Reject` exactly
//! when at least one reason fired.
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_curator::{CuratorGate, CuratorPolicy};
//!
//! let gate = CuratorGate::new(CuratorPolicy::default(), root, sandbox)?;
//! let decision = gate.review("add route", code, "src/app.py", Some("job-7")).await;
//! if decision.is_approved() { /* apply */ }
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

pub mod cache;
pub mod decision;
pub mod error;
pub mod gate;
pub mod parsers;
pub mod policy;

pub use cache::{CacheStats, DecisionCache};
pub use decision::{Decision, MicroCheckOutcome, Reason, ReasonKind, ReviewMetrics, Verdict};
pub use error::{CuratorError, ParseError};
pub use gate::{CuratorGate, MICRO_CHECK_HARNESS};
pub use policy::CuratorPolicy;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for reviewing candidate code
    pub use crate::decision::{Decision, Reason, ReasonKind, Verdict};
    pub use crate::gate::CuratorGate;
    pub use crate::policy::CuratorPolicy;
}
