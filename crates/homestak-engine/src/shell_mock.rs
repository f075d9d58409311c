//! Test interception for SSH commands.
//!
//! Actions shell out over SSH; tests register expected command
//! substrings and canned `(rc, stdout, stderr)` responses instead of
//! touching the network. Rules are thread-local so tests stay
//! independent under the parallel test runner.

use std::cell::RefCell;

struct MockRule {
    pattern: String,
    rc: i32,
    stdout: String,
    stderr: String,
    /// None = unlimited matches.
    remaining: Option<u32>,
}

thread_local! {
    static RULES: RefCell<Vec<MockRule>> = const { RefCell::new(Vec::new()) };
    static ACTIVE: RefCell<bool> = const { RefCell::new(false) };
    static SEEN: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Guard that activates mocking on this thread and clears all rules
/// when dropped.
pub struct MockGuard;

impl Drop for MockGuard {
    fn drop(&mut self) {
        ACTIVE.with(|a| *a.borrow_mut() = false);
        RULES.with(|r| r.borrow_mut().clear());
        SEEN.with(|s| s.borrow_mut().clear());
    }
}

pub fn install() -> MockGuard {
    ACTIVE.with(|a| *a.borrow_mut() = true);
    MockGuard
}

/// Register an unlimited-use rule matched by substring.
pub fn expect(pattern: &str, rc: i32, stdout: &str, stderr: &str) {
    RULES.with(|rules| {
        rules.borrow_mut().push(MockRule {
            pattern: pattern.to_string(),
            rc,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            remaining: None,
        });
    });
}

/// Register a rule consumed after `count` matches; later rules with
/// the same pattern then take over (e.g. not-ready, then ready).
pub fn expect_times(pattern: &str, count: u32, rc: i32, stdout: &str, stderr: &str) {
    RULES.with(|rules| {
        rules.borrow_mut().push(MockRule {
            pattern: pattern.to_string(),
            rc,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            remaining: Some(count),
        });
    });
}

/// Commands intercepted so far, in order.
pub fn commands_seen() -> Vec<String> {
    SEEN.with(|s| s.borrow().clone())
}

/// True while a guard is installed on this thread.
pub fn active() -> bool {
    ACTIVE.with(|a| *a.borrow())
}

pub fn intercept(command: &str) -> Option<(i32, String, String)> {
    if !ACTIVE.with(|a| *a.borrow()) {
        return None;
    }
    SEEN.with(|s| s.borrow_mut().push(command.to_string()));

    RULES.with(|rules| {
        let mut rules = rules.borrow_mut();
        let index = rules
            .iter()
            .position(|rule| command.contains(&rule.pattern))?;
        let rule = &mut rules[index];
        let response = (rule.rc, rule.stdout.clone(), rule.stderr.clone());
        if let Some(remaining) = &mut rule.remaining {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        Some(response)
    })
}
