//! Integration Test: Pure Core Modules
//!
//! Frame decoding, aggregation, error classification, the query lifecycle
//! and the client message types are plain data transformations. They must
//! not reach for the runtime, the network or storage, so they can be driven
//! byte by byte from unit tests.

use architectural_enforcement::{assert_clean, load, Violation};

const PURE_MODULES: &[&str] = &[
    "relay/core/src/frame.rs",
    "relay/core/src/aggregate.rs",
    "relay/core/src/error.rs",
    "relay/core/src/lifecycle.rs",
    "relay/core/src/messages.rs",
];

const FORBIDDEN: &[(&str, &str)] = &[
    ("tokio", "Async runtime"),
    ("reqwest", "HTTP client"),
    ("sqlx", "Database access"),
    ("std::fs", "File system"),
    ("std::net", "Network"),
    ("std::io", "Blocking I/O"),
    ("crate::upstream", "Upstream agent"),
    ("crate::store", "Turn storage"),
    ("crate::connection", "Connection handling"),
];

#[test]
fn test_pure_modules_do_no_io() {
    let mut violations: Vec<Violation> = Vec::new();

    for module in PURE_MODULES {
        let Some(file) = load(module) else {
            panic!("{module} is missing");
        };
        for (idx, code) in file.production_lines() {
            for (needle, what) in FORBIDDEN {
                if code.contains(needle) {
                    violations.push(file.violation(idx, what));
                }
            }
        }
    }

    assert_clean("Pure core modules must not perform I/O", &violations);
}
