//! Architectural Enforcement Helpers
//!
//! Source scanning shared by the integration tests in this package. The
//! tests enforce the relay's layering rules:
//! - Frame decoding, aggregation and lifecycle logic stay free of I/O
//! - Production code never blocks the runtime
//! - Production code propagates errors instead of panicking
//! - Test doubles are only compiled for tests or the `test-util` feature
//!
//! Scanning is line based. Everything from the first `#[cfg(test)]` to the
//! end of a file counts as test code, and `//` comments are ignored.

use std::fs;
use std::path::{Path, PathBuf};

/// Directories holding production sources, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// A Rust source file loaded for scanning
pub struct SourceFile {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// File contents
    pub content: String,
}

/// A rule violation found in a source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Path relative to the workspace root
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// What was found
    pub reason: String,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.reason,
            self.text
        )
    }
}

/// The workspace root (two levels above this package)
pub fn workspace_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest
        .ancestors()
        .nth(2)
        .map_or_else(|| manifest.to_path_buf(), Path::to_path_buf)
}

/// Load one file, relative to the workspace root
pub fn load(relative: &str) -> Option<SourceFile> {
    let content = fs::read_to_string(workspace_root().join(relative)).ok()?;
    Some(SourceFile {
        path: PathBuf::from(relative),
        content,
    })
}

/// Every `.rs` file under a directory, relative to the workspace root
pub fn rust_sources(relative_dir: &str) -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files: Vec<SourceFile> = walkdir::WalkDir::new(root.join(relative_dir))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            let path = e.path().strip_prefix(&root).ok()?.to_path_buf();
            Some(SourceFile { path, content })
        })
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

impl SourceFile {
    /// Production lines as `(index, code)`, comments stripped
    ///
    /// Stops at the first `#[cfg(test)]`.
    pub fn production_lines(&self) -> Vec<(usize, &str)> {
        self.content
            .lines()
            .enumerate()
            .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
            .map(|(idx, line)| (idx, strip_comment(line)))
            .filter(|(_, code)| !code.trim().is_empty())
            .collect()
    }

    /// Whether the function enclosing line `idx` is `async`
    ///
    /// Lines outside any function count as synchronous.
    pub fn in_async_fn(&self, idx: usize) -> bool {
        let lines: Vec<&str> = self.content.lines().collect();
        for line in lines[..=idx.min(lines.len().saturating_sub(1))].iter().rev() {
            let code = strip_comment(line).trim();
            if code.contains("fn ") && !code.contains("Fn(") {
                return code.contains("async fn ");
            }
        }
        false
    }

    /// Build a violation for line `idx`
    pub fn violation(&self, idx: usize, reason: &str) -> Violation {
        let text = self.content.lines().nth(idx).unwrap_or_default().trim();
        Violation {
            path: self.path.clone(),
            line: idx + 1,
            reason: reason.to_string(),
            text: text.to_string(),
        }
    }
}

/// The code part of a line, before any `//` comment
///
/// `//` inside a string literal (e.g. a URL) is kept.
pub fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

/// Panic with a readable report if `violations` is non-empty
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!("\nFound {} violation(s): {rule}", violations.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment_keeps_urls() {
        assert_eq!(strip_comment("let x = 1; // note"), "let x = 1; ");
        assert_eq!(
            strip_comment(r#"let url = "http://localhost:8001";"#),
            r#"let url = "http://localhost:8001";"#
        );
        assert_eq!(strip_comment("/// docs"), "");
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let file = SourceFile {
            path: PathBuf::from("x.rs"),
            content: "fn a() {}\n// comment\n#[cfg(test)]\nmod tests { fn b() {} }\n".to_string(),
        };
        let lines = file.production_lines();
        assert_eq!(lines, vec![(0, "fn a() {}")]);
    }

    #[test]
    fn test_in_async_fn() {
        let file = SourceFile {
            path: PathBuf::from("x.rs"),
            content: "async fn run() {\n    work();\n}\nfn load() {\n    read();\n}\n".to_string(),
        };
        assert!(file.in_async_fn(1));
        assert!(!file.in_async_fn(4));
    }

    #[test]
    fn test_workspace_root_contains_relay() {
        assert!(workspace_root().join("relay/core/Cargo.toml").exists());
    }
}
