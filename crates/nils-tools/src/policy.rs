// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
use nils_session::{PermissionAction, Ruleset};

/// Decide the action for `(tool, key)` against a precedence chain of
/// rulesets: session override, then agent, then project.  Within one
/// ruleset the first matching rule wins; across rulesets the first ruleset
/// with any match wins.  No match anywhere defaults to `ask`.
pub fn evaluate(tool: &str, key: &str, chain: &[&Ruleset]) -> PermissionAction {
    let full_key = format!("{tool}:{key}");
    for ruleset in chain {
        if let Some(action) = ruleset.evaluate(&full_key) {
            return action;
        }
    }
    PermissionAction::Ask
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nils_session::PermissionRule;

    fn rs(rules: &[(&str, PermissionAction)]) -> Ruleset {
        Ruleset(
            rules
                .iter()
                .map(|(p, a)| PermissionRule::new(*p, *a))
                .collect(),
        )
    }

    #[test]
    fn default_is_ask() {
        assert_eq!(evaluate("bash", "ls", &[]), PermissionAction::Ask);
        let empty = Ruleset::default();
        assert_eq!(
            evaluate("bash", "ls", &[&empty, &empty]),
            PermissionAction::Ask
        );
    }

    #[test]
    fn session_overrides_agent_overrides_project() {
        let session = rs(&[("bash:*", PermissionAction::Allow)]);
        let agent = rs(&[("bash:*", PermissionAction::Deny)]);
        let project = rs(&[("bash:*", PermissionAction::Ask)]);
        assert_eq!(
            evaluate("bash", "ls", &[&session, &agent, &project]),
            PermissionAction::Allow
        );
        assert_eq!(
            evaluate("bash", "ls", &[&agent, &project]),
            PermissionAction::Deny
        );
    }

    #[test]
    fn first_match_wins_within_a_ruleset() {
        let rules = rs(&[
            ("bash:rm *", PermissionAction::Deny),
            ("bash:*", PermissionAction::Allow),
        ]);
        assert_eq!(
            evaluate("bash", "rm -rf /", &[&rules]),
            PermissionAction::Deny
        );
        assert_eq!(evaluate("bash", "ls", &[&rules]), PermissionAction::Allow);
    }

    #[test]
    fn key_includes_tool_prefix() {
        let rules = rs(&[("read:*", PermissionAction::Allow)]);
        assert_eq!(
            evaluate("read", "/etc/hosts", &[&rules]),
            PermissionAction::Allow
        );
        assert_eq!(
            evaluate("write", "/etc/hosts", &[&rules]),
            PermissionAction::Ask
        );
    }
}
