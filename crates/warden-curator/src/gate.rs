//! The curator gate

use crate::cache::DecisionCache;
use crate::decision::{Decision, MicroCheckOutcome, Reason, ReasonKind, ReviewMetrics};
use crate::error::{CuratorError, ParseError};
use crate::parsers::{self, CallArgument};
use crate::policy::CuratorPolicy;
use futures::FutureExt;
use regex::Regex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use warden_artifact::{ConfinedRoot, ContentHash};
use warden_sandbox::{Program, Sandbox, SandboxRequest, SandboxStage};

/// Byte-compiles the candidate and builds an import spec for it without
/// executing its body. `argv[1]` is the candidate file.
pub const MICRO_CHECK_HARNESS: &str = r#"import importlib.util, py_compile, sys
py_compile.compile(sys.argv[1], doraise=True)
spec = importlib.util.spec_from_file_location("candidate", sys.argv[1])
sys.exit(0 if spec is not None and spec.loader is not None else 2)
"#;

const STDERR_EXCERPT: usize = 200;

/// Static plus micro-dynamic review of candidate code.
///
/// Holds an immutable policy, the confinement root and a sandbox for the
/// micro check. Cheap to clone.
#[derive(Clone)]
pub struct CuratorGate {
    policy: Arc<CuratorPolicy>,
    secrets: Arc<Vec<Regex>>,
    root: ConfinedRoot,
    sandbox: Arc<dyn Sandbox>,
    cache: Option<DecisionCache>,
}

impl std::fmt::Debug for CuratorGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuratorGate")
            .field("policy", &self.policy)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CuratorGate {
    /// Build a gate.
    ///
    /// # Errors
    /// [`CuratorError::InvalidPattern`] if a secret pattern does not compile.
    pub fn new(
        policy: CuratorPolicy,
        root: ConfinedRoot,
        sandbox: Arc<dyn Sandbox>,
    ) -> Result<Self, CuratorError> {
        let secrets = policy
            .secret_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| CuratorError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            policy: Arc::new(policy),
            secrets: Arc::new(secrets),
            root,
            sandbox,
            cache: None,
        })
    }

    /// Memoize decisions per (target, code)
    #[inline]
    #[must_use]
    pub fn with_cache(mut self, cache: DecisionCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &CuratorPolicy {
        &self.policy
    }

    /// Confinement root
    #[inline]
    #[must_use]
    pub fn root(&self) -> &ConfinedRoot {
        &self.root
    }

    /// Review candidate `code` destined for `target_path`.
    ///
    /// Never fails: any internal error, including a panic in the analysis,
    /// yields a rejecting decision.
    pub async fn review(
        &self,
        task_text: &str,
        code: &str,
        target_path: &str,
        job_id: Option<&str>,
    ) -> Decision {
        let key = ContentHash::compute_fields(
            "warden.curator.decision",
            &[target_path.trim().as_bytes(), code.as_bytes()],
        );
        if let Some(cache) = &self.cache {
            if let Some(decision) = cache.get(&key).await {
                tracing::debug!(target_path, "curator decision served from cache");
                return decision;
            }
        }

        let decision = AssertUnwindSafe(self.review_uncached(code, target_path))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Decision::internal("curator review panicked"));

        tracing::info!(
            target_path,
            job_id = job_id.unwrap_or(""),
            task_len = task_text.len(),
            verdict = decision.verdict().as_str(),
            score = decision.score(),
            reasons = decision.reasons().len(),
            "curator review finished"
        );

        if let Some(cache) = &self.cache {
            if !decision.is_transient() {
                cache.insert(key, decision.clone()).await;
            }
        }
        decision
    }

    async fn review_uncached(&self, code: &str, target_path: &str) -> Decision {
        let code = parsers::normalize_source(code);
        let code = code.as_ref();
        let mut metrics = ReviewMetrics {
            lines: code.lines().count(),
            bytes: code.len(),
            ..ReviewMetrics::default()
        };

        if code.trim().is_empty() {
            return Decision::fail_fast(
                Vec::new(),
                Reason::new(ReasonKind::Empty, "empty code"),
                metrics,
            );
        }

        let mut reasons = Vec::new();
        if metrics.lines > self.policy.max_lines {
            reasons.push(Reason::new(
                ReasonKind::Oversize,
                format!("too many lines: {} > {}", metrics.lines, self.policy.max_lines),
            ));
        }
        if metrics.bytes > self.policy.max_bytes {
            reasons.push(Reason::new(
                ReasonKind::Oversize,
                format!("too large: {} bytes > {}", metrics.bytes, self.policy.max_bytes),
            ));
        }
        if let Err(e) = self.root.resolve(target_path) {
            reasons.push(Reason::new(
                ReasonKind::TargetPath,
                format!("invalid target path: {e}"),
            ));
        }

        let analysis = match parsers::analyze(code) {
            Ok(analysis) => analysis,
            Err(e @ ParseError::Syntax { .. }) => {
                return Decision::fail_fast(
                    reasons,
                    Reason::new(ReasonKind::Syntax, e.to_string()),
                    metrics,
                );
            }
            Err(e) => {
                reasons.push(Reason::new(ReasonKind::Internal, e.to_string()));
                return Decision::from_reasons(reasons, metrics);
            }
        };
        metrics.imports = analysis.imports.iter().cloned().collect();
        metrics.calls = analysis.call_names();
        metrics.complexity = analysis.complexity;

        for module in &analysis.imports {
            if self.policy.is_banned_import(module) {
                reasons.push(Reason::new(
                    ReasonKind::BannedImport,
                    format!("banned import: {module}"),
                ));
            }
        }
        for name in &metrics.calls {
            if self.policy.is_banned_call(name) {
                reasons.push(Reason::new(
                    ReasonKind::BannedCall,
                    format!("banned call: {name}()"),
                ));
            }
        }
        for call in analysis
            .calls
            .iter()
            .filter(|c| self.policy.is_guarded_open(&c.name))
        {
            let problem = match &call.first_arg {
                CallArgument::Literal(path) if self.root.contains(path) => None,
                CallArgument::Literal(path) => Some(format!("path {path:?} is outside the root")),
                CallArgument::Dynamic => Some("path is not a string literal".to_string()),
                CallArgument::Missing => Some("no path argument".to_string()),
            };
            if let Some(problem) = problem {
                reasons.push(Reason::new(
                    ReasonKind::UnsafeOpen,
                    format!("unsafe {}() on line {}: {problem}", call.name, call.line),
                ));
            }
        }
        for (index, pattern) in self.secrets.iter().enumerate() {
            if pattern.is_match(code) {
                reasons.push(Reason::new(
                    ReasonKind::Secret,
                    format!("possible hardcoded secret (pattern #{})", index + 1),
                ));
            }
        }
        if analysis.complexity > self.policy.max_complexity {
            reasons.push(Reason::new(
                ReasonKind::Complexity,
                format!(
                    "complexity too high: {} > {}",
                    analysis.complexity, self.policy.max_complexity
                ),
            ));
        }

        if !reasons.iter().any(|r| r.kind.is_critical()) {
            match self.micro_check(code).await {
                Ok((outcome, None)) => metrics.micro_check = Some(outcome),
                Ok((outcome, Some(reason))) => {
                    metrics.micro_check = Some(outcome);
                    reasons.push(reason);
                }
                Err(reason) => reasons.push(reason),
            }
        }

        Decision::from_reasons(reasons, metrics)
    }

    async fn micro_check(&self, code: &str) -> Result<(MicroCheckOutcome, Option<Reason>), Reason> {
        let request = SandboxRequest::new(
            SandboxStage::MicroCheck,
            Program::Source(code.to_string()),
            self.policy.sandbox_timeout(),
        )
        .with_harness(MICRO_CHECK_HARNESS);

        let output = self.sandbox.run(request).await.map_err(|e| {
            Reason::new(
                ReasonKind::Internal,
                format!("micro check could not run: {e}"),
            )
        })?;
        let outcome = MicroCheckOutcome {
            passed: output.succeeded(),
            exit_code: output.exit_code,
            timed_out: output.timed_out,
        };
        let reason = if output.timed_out {
            Some(Reason::new(
                ReasonKind::MicroCheck,
                format!(
                    "micro check timed out after {}ms",
                    self.policy.sandbox_timeout_ms
                ),
            ))
        } else if !output.succeeded() {
            let excerpt: String = output.stderr.trim().chars().take(STDERR_EXCERPT).collect();
            Some(Reason::new(
                ReasonKind::MicroCheck,
                format!(
                    "micro check failed (exit {}): {excerpt}",
                    output
                        .exit_code
                        .map_or_else(|| "signal".to_string(), |c| c.to_string())
                ),
            ))
        } else {
            None
        };
        Ok((outcome, reason))
    }
}
