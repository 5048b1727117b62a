//! Conventional-commit message generation.
//!
//! The advisory (agent-written) path is optional; when it is unavailable
//! the heuristic below maps issue labels to a commit type and builds the
//! message deterministically from the issue title.

/// Label → conventional commit type. First match wins; unmatched labels
/// fall back to `chore`.
const COMMIT_TYPES: &[(&str, &str)] = &[
    ("bug", "fix"),
    ("fix", "fix"),
    ("enhancement", "feat"),
    ("feature", "feat"),
    ("documentation", "docs"),
    ("docs", "docs"),
    ("refactor", "refactor"),
    ("test", "test"),
    ("chore", "chore"),
    ("ci", "ci"),
    ("perf", "perf"),
    ("style", "style"),
];

const MAX_MESSAGE_LEN: usize = 500;
const MAX_SUBJECT_LEN: usize = 72;

pub fn detect_commit_type(labels: &[String]) -> &'static str {
    for (label, commit_type) in COMMIT_TYPES {
        if labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
            return commit_type;
        }
    }
    "chore"
}

/// Build the commit message: `<type>(<scope>): <title>` subject (scope
/// omitted when unknown), blank line, `Fixes #N` reference. Hard-capped at
/// 500 characters.
pub fn generate_commit_message(
    labels: &[String],
    issue_title: &str,
    issue_number: i64,
    scope: Option<&str>,
) -> String {
    let commit_type = detect_commit_type(labels);

    // Strip any self-reference to the issue from the title.
    let mut title = issue_title
        .replace(&format!("Issue #{issue_number}"), "")
        .replace(&format!("#{issue_number}"), "")
        .trim()
        .to_string();
    if let Some(first) = title.chars().next() {
        if first.is_uppercase() {
            title = first.to_lowercase().collect::<String>() + &title[first.len_utf8()..];
        }
    }
    if title.is_empty() {
        title = format!("resolve issue {issue_number}");
    }
    if title.chars().count() > MAX_SUBJECT_LEN {
        title = title.chars().take(MAX_SUBJECT_LEN - 3).collect::<String>() + "...";
    }

    let subject = match scope {
        Some(scope) if !scope.is_empty() => format!("{commit_type}({scope}): {title}"),
        _ => format!("{commit_type}: {title}"),
    };

    let message = format!("{subject}\n\nFixes #{issue_number}");
    if message.chars().count() > MAX_MESSAGE_LEN {
        message.chars().take(MAX_MESSAGE_LEN).collect()
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_detect_commit_type() {
        assert_eq!(detect_commit_type(&labels(&["bug"])), "fix");
        assert_eq!(detect_commit_type(&labels(&["Enhancement"])), "feat");
        assert_eq!(detect_commit_type(&labels(&["documentation"])), "docs");
        assert_eq!(detect_commit_type(&labels(&["backend"])), "chore");
        assert_eq!(detect_commit_type(&[]), "chore");
    }

    #[test]
    fn test_first_label_match_wins() {
        assert_eq!(detect_commit_type(&labels(&["refactor", "bug"])), "fix");
    }

    #[test]
    fn test_message_shape_with_scope() {
        let msg = generate_commit_message(&labels(&["bug"]), "Retry loop hangs", 42, Some("widgets"));
        assert_eq!(msg, "fix(widgets): retry loop hangs\n\nFixes #42");
    }

    #[test]
    fn test_message_without_scope() {
        let msg = generate_commit_message(&labels(&["feature"]), "Add safe-git guard", 7, None);
        assert!(msg.starts_with("feat: add safe-git guard"));
        assert!(msg.ends_with("Fixes #7"));
    }

    #[test]
    fn test_title_self_reference_stripped() {
        let msg = generate_commit_message(&[], "Issue #9 cleanup dangling worktrees", 9, None);
        assert!(msg.starts_with("chore: cleanup dangling worktrees"));
    }

    #[test]
    fn test_empty_title_fallback() {
        let msg = generate_commit_message(&[], "#3", 3, None);
        assert!(msg.starts_with("chore: resolve issue 3"));
    }

    #[test]
    fn test_long_title_truncated_and_message_capped() {
        let long_title = "x".repeat(300);
        let msg = generate_commit_message(&labels(&["bug"]), &long_title, 1, Some("core"));
        let subject = msg.lines().next().unwrap();
        assert!(subject.chars().count() <= MAX_SUBJECT_LEN + "fix(core): ".len());
        assert!(subject.ends_with("..."));
        assert!(msg.chars().count() <= MAX_MESSAGE_LEN);
    }
}
