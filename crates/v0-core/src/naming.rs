//! Identifier sanitization shared by operation names and branch names.

const MAX_NAME_LENGTH: usize = 64;

/// Validate and normalize a user-chosen operation name into a filesystem-safe
/// identifier: ASCII alphanumeric, hyphen, and underscore only, lowercased,
/// truncated to 64 characters. Falls back to `"unnamed"` if nothing
/// survives filtering.
pub fn sanitize_name(raw: &str) -> String {
    let filtered: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let truncated: String = filtered.chars().take(MAX_NAME_LENGTH).collect();
    if truncated.is_empty() {
        "unnamed".to_string()
    } else {
        truncated
    }
}

/// Replace path separators with hyphens so a branch name can be used as a
/// filesystem path component (e.g. worktree directory naming).
pub fn sanitize_branch_name(branch: &str) -> String {
    branch.replace('/', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_lowercases_and_strips_invalid_chars() {
        assert_eq!(sanitize_name("My Feature!"), "myfeature");
        assert_eq!(sanitize_name("add-new_thing"), "add-new_thing");
    }

    #[test]
    fn sanitize_name_truncates_to_max_length() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_name(&long).len(), MAX_NAME_LENGTH);
    }

    #[test]
    fn sanitize_name_falls_back_when_empty_after_filtering() {
        assert_eq!(sanitize_name("!!!"), "unnamed");
        assert_eq!(sanitize_name(""), "unnamed");
    }

    #[test]
    fn sanitize_branch_name_replaces_slashes() {
        assert_eq!(sanitize_branch_name("feature/auth"), "feature-auth");
        assert_eq!(sanitize_branch_name("a/b/c"), "a-b-c");
    }
}
