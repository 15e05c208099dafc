//! Integration Test: Sleep Prohibition
//!
//! Production code must not use `sleep()` as a substitute for waiting on
//! I/O or an event. Exceptions: exponential backoff in `InferenceClient`'s
//! reconnect logic, and `tokio::time::interval`-driven polling loops such
//! as `GpuGuard::poll_loop`.

use std::fs;
use std::path::Path;

#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!(
            "\nAcceptable: exponential backoff in retry logic, tokio::time::interval polling, test code."
        );
        panic!("Found {} sleep violation(s) in production code.", violations.len());
    }
}

fn find_sleep_violations() -> Vec<String> {
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

        if !(code_part.contains("::sleep(") || code_part.contains(".sleep(")) {
            continue;
        }

        if is_in_test_function(&lines, idx) {
            continue;
        }
        if is_backoff_context(&lines, idx) {
            continue;
        }
        if is_interval_pattern(&lines, idx) {
            continue;
        }

        violations.push(format!("{}:{} - {}", path.display(), line_number, line.trim()));
    }
}

fn is_in_test_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();
        if line.starts_with("fn ") && !line.contains("test") {
            return false;
        }
        if line.starts_with("#[test]") || line.starts_with("#[tokio::test") {
            return true;
        }
        if line.starts_with("mod ") || line.starts_with("impl ") {
            return false;
        }
    }
    false
}

/// Backoff is recognisable either as a delay computed inline from an
/// attempt counter (bit shift, `pow`, doubling) or as a call into a
/// dedicated backoff helper (e.g. `backoff_for_attempt`), near a
/// retry/reconnect/backoff mention.
fn is_backoff_context(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(15)..std::cmp::min(current_idx + 5, lines.len());

    let mut has_backoff_calc = false;
    let mut has_retry_context = false;

    for i in context_range {
        let line = lines[i].to_lowercase();
        if line.contains("<<")
            || line.contains("pow")
            || line.contains("* 2")
            || line.contains("backoff_for")
        {
            has_backoff_calc = true;
        }
        if line.contains("retry") || line.contains("reconnect") || line.contains("backoff") || line.contains("attempt")
        {
            has_retry_context = true;
        }
    }

    has_backoff_calc && has_retry_context
}

fn is_interval_pattern(lines: &[&str], current_idx: usize) -> bool {
    let context_range = current_idx.saturating_sub(20)..current_idx;
    for i in context_range {
        let line = lines[i];
        if line.contains("interval.tick()") || line.contains("tokio::time::interval") {
            return true;
        }
    }
    let forward_range = current_idx..std::cmp::min(current_idx + 5, lines.len());
    for i in forward_range {
        if lines[i].contains("interval.tick()") {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_backoff_pattern() {
        let test_code = vec![
            "fn reconnect() {",
            "    let delay = base_delay * (1 << attempt);",
            "    println!(\"retry attempt {}\", attempt);",
            "    tokio::time::sleep(Duration::from_millis(delay)).await;",
            "}",
        ];
        assert!(is_backoff_context(&test_code, 3));
    }

    #[test]
    fn rejects_bare_sleep_outside_test_or_backoff() {
        let test_code = vec!["fn poll() {", "    tokio::time::sleep(Duration::from_millis(10)).await;", "}"];
        assert!(!is_in_test_function(&test_code, 1));
        assert!(!is_backoff_context(&test_code, 1));
    }
}
