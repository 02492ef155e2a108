// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Deny,
    Ask,
}

/// One rule of a ruleset, matched against `<tool>:<key>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Glob pattern; `*` matches any run of characters, `?` exactly one.
    pub pattern: String,
    pub action: PermissionAction,
}

impl PermissionRule {
    pub fn new(pattern: impl Into<String>, action: PermissionAction) -> Self {
        Self {
            pattern: pattern.into(),
            action,
        }
    }

    fn matches(&self, key: &str) -> bool {
        glob_match(&self.pattern, key)
    }
}

/// Ordered rule list; first match wins.  Rulesets attach to sessions,
/// agents, and projects; callers chain `evaluate` in that order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ruleset(pub Vec<PermissionRule>);

impl Ruleset {
    pub fn evaluate(&self, key: &str) -> Option<PermissionAction> {
        self.0.iter().find(|r| r.matches(key)).map(|r| r.action)
    }

    pub fn push(&mut self, rule: PermissionRule) {
        self.0.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Simple glob match supporting `*` and `?` only.  No allocation, no
/// regex compilation per call.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    // Classic two-pointer glob with backtracking over the last `*`.
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut mark) = (usize::MAX, 0usize);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = pi;
            mark = ti;
            pi += 1;
        } else if star != usize::MAX {
            pi = star + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let rs = Ruleset(vec![
            PermissionRule::new("bash:rm *", PermissionAction::Deny),
            PermissionRule::new("bash:*", PermissionAction::Allow),
        ]);
        assert_eq!(rs.evaluate("bash:rm -rf /"), Some(PermissionAction::Deny));
        assert_eq!(rs.evaluate("bash:ls"), Some(PermissionAction::Allow));
    }

    #[test]
    fn no_match_returns_none() {
        let rs = Ruleset(vec![PermissionRule::new("read:*", PermissionAction::Allow)]);
        assert_eq!(rs.evaluate("write:/etc/passwd"), None);
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(glob_match("ls ?", "ls -"));
        assert!(!glob_match("ls ?", "ls --"));
    }

    #[test]
    fn star_matches_empty_and_long_runs() {
        assert!(glob_match("read:*", "read:"));
        assert!(glob_match("read:*", "read:/very/long/path.txt"));
        assert!(glob_match("*", "anything at all"));
    }

    #[test]
    fn literal_patterns_need_exact_match() {
        assert!(glob_match("bash:git status", "bash:git status"));
        assert!(!glob_match("bash:git status", "bash:git status --short"));
    }

    #[test]
    fn multiple_stars_backtrack() {
        assert!(glob_match("bash:git * --force*", "bash:git push origin --force"));
        assert!(!glob_match("bash:git * --force*", "bash:git push origin"));
    }

    #[test]
    fn ruleset_serializes_transparently() {
        let rs = Ruleset(vec![PermissionRule::new("a:*", PermissionAction::Ask)]);
        let v = serde_json::to_value(&rs).unwrap();
        assert!(v.is_array());
        assert_eq!(v[0]["action"], "ask");
    }
}
