//! Identical policy and identical code always yield an identical decision.

use proptest::prelude::*;
use std::sync::Arc;
use warden_artifact::ConfinedRoot;
use warden_curator::{CuratorGate, CuratorPolicy, Decision, ReasonKind, Verdict};
use warden_test_utils::ScriptedSandbox;

const FRAGMENTS: &[&str] = &[
    "import os",
    "import subprocess",
    "import json",
    "from pickle import loads",
    "x = 1",
    "y = [i for i in range(3)]",
    "def handler(a):\n    return a and not a",
    "if x:\n    x = 2\nelse:\n    x = 3",
    "eval('1')",
    "os.system('ls')",
    "open('data.txt')",
    "open('/etc/passwd')",
    "open(path)",
    "api_key = 'ABCDEFGHIJKLMNOPQRSTUV'",
    "for i in range(2):\n    pass",
    "app = (1,",
    "",
];

fn gate(root: &ConfinedRoot, policy: CuratorPolicy) -> CuratorGate {
    CuratorGate::new(policy, root.clone(), Arc::new(ScriptedSandbox::passing())).unwrap()
}

fn review(gate: &CuratorGate, code: &str) -> Decision {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(gate.review("task", code, "app.py", None))
}

fn source() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(FRAGMENTS), 0..8).prop_map(|lines| lines.join("\n"))
}

fn policy() -> impl Strategy<Value = CuratorPolicy> {
    (1usize..40, 1u32..6, any::<bool>()).prop_map(|(max_lines, max_complexity, allow_httpx)| {
        CuratorPolicy::default()
            .with_max_lines(max_lines)
            .with_max_complexity(max_complexity)
            .with_allow_httpx(allow_httpx)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn equal_policies_judge_alike(code in source(), policy in policy()) {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        let first = review(&gate(&root, policy.clone()), &code);
        let second = review(&gate(&root, policy), &code);

        prop_assert_eq!(first.verdict(), second.verdict());
        prop_assert_eq!(first.reasons(), second.reasons());
        prop_assert_eq!(first.score(), second.score());
    }

    #[test]
    fn verdict_follows_reasons(code in source(), policy in policy()) {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        let decision = review(&gate(&root, policy), &code);

        prop_assert_eq!(decision.verdict() == Verdict::Reject, !decision.reasons().is_empty());
        let fail_fast = decision.has_reason(ReasonKind::Empty) || decision.has_reason(ReasonKind::Syntax);
        if fail_fast {
            prop_assert_eq!(decision.score(), 0);
        } else {
            let expected = 100usize.saturating_sub(10 * decision.reasons().len());
            prop_assert_eq!(usize::from(decision.score()), expected);
        }
    }

    #[test]
    fn unparseable_code_is_always_rejected(code in source()) {
        let dir = tempfile::tempdir().unwrap();
        let root = ConfinedRoot::new(dir.path()).unwrap();
        let broken = format!("{code}\napp = (1,\n");
        let decision = review(&gate(&root, CuratorPolicy::default()), &broken);

        prop_assert!(!decision.is_approved());
        prop_assert!(decision.has_reason(ReasonKind::Syntax));
        prop_assert_eq!(decision.score(), 0);
    }
}
