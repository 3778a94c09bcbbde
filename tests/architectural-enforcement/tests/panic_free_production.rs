//! Integration Test: Panic-Free Production Code
//!
//! A misbehaving agent or client must end one query, never the daemon.
//! Production code propagates errors with `?` or maps them to an abort
//! reason; `unwrap`, `expect` and explicit panics are for tests only.

use architectural_enforcement::{assert_clean, rust_sources, Violation, PRODUCTION_DIRS};

const PANICKING: &[(&str, &str)] = &[
    (".unwrap()", "unwrap() in production code"),
    (".expect(", "expect() in production code"),
    ("panic!(", "panic! in production code"),
    ("unimplemented!(", "unimplemented! in production code"),
    ("todo!(", "todo! in production code"),
];

#[test]
fn test_no_panics_in_production_code() {
    let mut violations: Vec<Violation> = Vec::new();

    for dir in PRODUCTION_DIRS {
        for file in rust_sources(dir) {
            for (idx, code) in file.production_lines() {
                for (needle, what) in PANICKING {
                    if code.contains(needle) {
                        violations.push(file.violation(idx, what));
                    }
                }
            }
        }
    }

    assert_clean("Panicking calls found in production code", &violations);
}
