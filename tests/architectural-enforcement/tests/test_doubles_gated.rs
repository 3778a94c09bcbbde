//! Integration Test: Test Doubles Stay Out of Release Builds
//!
//! The scripted agent and the memory store's failure injection exist for
//! tests. Their declarations and re-exports must sit behind
//! `#[cfg(any(test, feature = "test-util"))]` so the daemon never links them.

use architectural_enforcement::{assert_clean, rust_sources, Violation};

const GATE: &str = r#"feature = "test-util""#;

/// Statements that declare or expose a test double
fn exposes_test_double(code: &str) -> bool {
    let code = code.trim();
    code.starts_with("mod scripted")
        || code.starts_with("pub enum FailurePoint")
        || code.starts_with("pub fn inject_failure")
        || (code.starts_with("pub use")
            && ["ScriptedAgent", "ScriptStep", "FailurePoint"]
                .iter()
                .any(|name| code.contains(name)))
}

#[test]
fn test_test_doubles_are_feature_gated() {
    let mut violations: Vec<Violation> = Vec::new();
    let mut seen = 0;

    for file in rust_sources("relay/core/src") {
        let lines: Vec<&str> = file.content.lines().collect();
        for (idx, code) in file.production_lines() {
            if !exposes_test_double(code) {
                continue;
            }
            seen += 1;
            let gated = lines[idx.saturating_sub(3)..idx]
                .iter()
                .any(|line| line.contains(GATE));
            if !gated {
                violations.push(file.violation(idx, "Ungated test double"));
            }
        }
    }

    assert!(seen >= 5, "expected gated declarations, found {seen}");
    assert_clean("Test doubles must be behind the test-util feature", &violations);
}
