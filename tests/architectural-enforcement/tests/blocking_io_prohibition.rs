//! Integration Test: Blocking I/O Prohibition
//!
//! Production code in the scheduling core and the daemon binary must not
//! use blocking I/O: the dispatcher workers and the HTTP surface both run
//! on the same Tokio runtime, and a blocking call on that runtime stalls
//! every other in-flight request.
//!
//! Required: `tokio::fs`, `tokio::net`, `tokio::process`, not `std::fs`,
//! `std::net`, `std::process::Command::output`, or `reqwest::blocking`.

use std::fs;
use std::path::Path;

#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!(
            "\nUse tokio::fs / tokio::net / tokio::process / reqwest's async client instead.\
             \nAcceptable: non-async functions (before the runtime starts) and test code."
        );
        panic!(
            "Found {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();
    check_directory("core/src", &mut violations);
    check_directory("daemon/src", &mut violations);
    violations
}

fn check_directory(dir: &str, violations: &mut Vec<String>) {
    let path = Path::new(dir);
    if !path.exists() {
        return;
    }

    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
            check_file(entry.path(), violations);
        }
    }
}

fn check_file(path: &Path, violations: &mut Vec<String>) {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return,
    };

    let lines: Vec<&str> = content.lines().collect();

    for (idx, line) in lines.iter().enumerate() {
        let line_number = idx + 1;
        let code_part = line.split("//").next().unwrap_or(line);

        if is_in_test_function(&lines, idx) || is_in_non_async_function(&lines, idx) {
            continue;
        }

        if code_part.contains("std::fs::") || code_part.contains("use std::fs") {
            violations.push(format!(
                "{}:{} - blocking file I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("std::net::") || code_part.contains("use std::net") {
            violations.push(format!(
                "{}:{} - blocking network I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("std::process::Command") && !code_part.contains("tokio::process") {
            violations.push(format!(
                "{}:{} - blocking process I/O: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if code_part.contains("reqwest::blocking") {
            violations.push(format!(
                "{}:{} - blocking HTTP client: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }

        if (code_part.contains("std::io::stdin()") || code_part.contains("std::io::stdout()"))
            && is_in_async_function(&lines, idx)
        {
            violations.push(format!(
                "{}:{} - blocking stdin/stdout in async context: {}",
                path.display(),
                line_number,
                line.trim()
            ));
        }
    }
}

/// Check if line is inside a `#[test]`/`#[tokio::test]` function.
fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    let mut found_fn_idx = None;
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("fn ") || line.contains(" fn ") {
            found_fn_idx = Some(i);
            break;
        }
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }

    if let Some(fn_idx) = found_fn_idx {
        for i in (0..fn_idx).rev() {
            let line = lines[i].trim();
            if line.starts_with("#[test]")
                || line.starts_with("#[tokio::test")
                || line.starts_with("#[cfg(test)]")
            {
                return true;
            }
            if line.starts_with("fn ") || line.starts_with("mod ") || line.starts_with("impl ") {
                break;
            }
        }
    }
    false
}

fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();
        if line.contains("async fn ") {
            return true;
        }
        if line.starts_with("fn ") && !line.contains("async") {
            return false;
        }
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

/// Check if line is inside a non-async function: blocking I/O there runs
/// before the Tokio runtime starts (CLI parsing, `default_pid_path`, ...)
/// and is not a violation.
fn is_in_non_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("fn ") && !line.contains("async") {
            return true;
        }
        if line.contains("async fn ") {
            return false;
        }
        if line.starts_with("mod ") || (line.starts_with("impl ") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_async_function() {
        let test_code = vec![
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(is_in_async_function(&test_code, 1));
        assert!(!is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn detects_non_async_function() {
        let test_code = vec![
            "fn main() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert!(is_in_non_async_function(&test_code, 1));
    }

    #[test]
    fn detects_test_function() {
        let test_code = vec![
            "#[test]",
            "fn test_something() {",
            "    let contents = std::fs::read_to_string(\"test.txt\")?;",
            "}",
        ];
        assert!(is_in_test_function(&test_code, 2));
    }
}
