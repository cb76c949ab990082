//! Source parsers
//!
//! Tree-sitter based analysis of candidate code. Parsing never executes
//! anything; it is safe to run on untrusted input.

pub mod python;

pub use python::{
    analyze, check_syntax, normalize_source, CallArgument, CallSite, SourceAnalysis,
};
