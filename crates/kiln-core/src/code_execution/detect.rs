//! Heuristic language classification.
//!
//! Checks run in a fixed order and the first hit wins:
//!
//! 1. a shebang naming an interpreter (`python`, `node`, otherwise shell);
//! 2. Python tokens: `def`, `import`/`from .. import`, `print(`, `class ..:`;
//! 3. JavaScript tokens: `function`, `const`/`let`/`var`, `=>`, `console.log`;
//! 4. shell tokens: `echo`, `export`;
//! 5. a leading `#` comment, which reads as Python;
//! 6. JavaScript.
//!
//! ES module `import` lines therefore classify as Python.

use regex::Regex;
use std::sync::LazyLock;

use super::Language;

static PYTHON_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?m)^\s*def\s+\w+\s*\(",
        r"(?m)^\s*import\s+\w",
        r"(?m)^\s*from\s+[\w.]+\s+import\s",
        r"\bprint\(",
        r"(?m)^\s*class\s+\w+.*:\s*$",
    ])
});

static JAVASCRIPT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\bfunction\b",
        r"\b(const|let|var)\s+[\w$\[{]",
        r"=>",
        r"\bconsole\.log\b",
        r"\brequire\(",
    ])
});

static SHELL_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(&[r"(?m)^\s*echo\b", r"(?m)^\s*export\s+\w"]));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

fn any_match(patterns: &[Regex], code: &str) -> bool {
    patterns.iter().any(|re| re.is_match(code))
}

/// Classifies source text into a [`Language`]. Pure; never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LanguageDetector;

impl LanguageDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, code: &str) -> Language {
        detect_language(code)
    }
}

pub fn detect_language(code: &str) -> Language {
    let first_line = code.trim_start().lines().next().unwrap_or_default();

    if let Some(interpreter) = first_line.strip_prefix("#!") {
        let interpreter = interpreter.to_ascii_lowercase();
        return if interpreter.contains("python") {
            Language::Python
        } else if interpreter.contains("node") || interpreter.contains("deno") {
            Language::JavaScript
        } else {
            Language::Shell
        };
    }

    if any_match(&PYTHON_PATTERNS, code) {
        Language::Python
    } else if any_match(&JAVASCRIPT_PATTERNS, code) {
        Language::JavaScript
    } else if any_match(&SHELL_PATTERNS, code) {
        Language::Shell
    } else if first_line.starts_with('#') {
        Language::Python
    } else {
        Language::JavaScript
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_cases() {
        assert_eq!(detect_language("def f():\n    return 1"), Language::Python);
        assert_eq!(detect_language("const f = () => 1"), Language::JavaScript);
        assert_eq!(detect_language("#!/bin/bash\necho hi"), Language::Shell);
        assert_eq!(detect_language(""), Language::JavaScript);
    }

    #[test]
    fn shebang_names_interpreter() {
        assert_eq!(
            detect_language("#!/usr/bin/env python3\nx = 1"),
            Language::Python
        );
        assert_eq!(
            detect_language("#!/usr/bin/env node\nprocess.exit(0)"),
            Language::JavaScript
        );
    }

    #[test]
    fn python_wins_ties() {
        assert_eq!(
            detect_language("import os\nconst x = 1"),
            Language::Python
        );
        assert_eq!(
            detect_language("from collections import deque"),
            Language::Python
        );
        assert_eq!(detect_language("print(\"hi\")"), Language::Python);
    }

    #[test]
    fn javascript_tokens() {
        assert_eq!(
            detect_language("function add(a, b) { return a + b }"),
            Language::JavaScript
        );
        assert_eq!(detect_language("console.log(42)"), Language::JavaScript);
        assert_eq!(detect_language("let x = [1, 2]"), Language::JavaScript);
    }

    #[test]
    fn shell_tokens_without_shebang() {
        assert_eq!(detect_language("echo hello"), Language::Shell);
        assert_eq!(detect_language("export FOO=1\nls"), Language::Shell);
    }

    #[test]
    fn leading_comment_reads_as_python() {
        assert_eq!(detect_language("# sum\nx = 1 + 2"), Language::Python);
    }

    #[test]
    fn unknown_falls_back_to_javascript() {
        assert_eq!(detect_language("x = 1 + 2"), Language::JavaScript);
        assert_eq!(LanguageDetector::new().detect("   \n  "), Language::JavaScript);
    }
}
