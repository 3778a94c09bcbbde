//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: Async production code in the relay MUST NOT block the runtime.
//! **Required**: `tokio::net`, `tokio::time::sleep`, async `reqwest`.
//!
//! Synchronous functions that run before the server starts (configuration
//! loading) may use `std::fs`.

use architectural_enforcement::{assert_clean, rust_sources, Violation, PRODUCTION_DIRS};

const ALWAYS_FORBIDDEN: &[(&str, &str)] = &[
    ("std::net::TcpStream", "Blocking network I/O"),
    ("std::net::TcpListener", "Blocking network I/O"),
    ("std::net::UdpSocket", "Blocking network I/O"),
    ("reqwest::blocking", "Blocking HTTP client"),
    ("std::thread::sleep", "Blocking sleep"),
    ("std::process::Command", "Blocking process I/O"),
];

const FORBIDDEN_IN_ASYNC: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O in async code"),
    ("std::io::stdin()", "Blocking stdin in async code"),
    ("std::io::stdout()", "Blocking stdout in async code"),
];

#[test]
fn test_no_blocking_io_in_production_code() {
    let mut violations: Vec<Violation> = Vec::new();

    for dir in PRODUCTION_DIRS {
        for file in rust_sources(dir) {
            for (idx, code) in file.production_lines() {
                for (needle, what) in ALWAYS_FORBIDDEN {
                    if code.contains(needle) {
                        violations.push(file.violation(idx, what));
                    }
                }
                for (needle, what) in FORBIDDEN_IN_ASYNC {
                    if code.contains(needle) && file.in_async_fn(idx) {
                        violations.push(file.violation(idx, what));
                    }
                }
            }
        }
    }

    assert_clean("Blocking I/O calls found in production code", &violations);
}

#[test]
fn test_production_sources_are_scanned() {
    let count: usize = PRODUCTION_DIRS.iter().map(|dir| rust_sources(dir).len()).sum();
    assert!(count >= 10, "expected relay sources, found {count}");
}
