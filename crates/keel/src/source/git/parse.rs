//! Git output helpers.

use std::process::Output;

/// Formats a failed git invocation from its stderr and stdout.
pub fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}

/// True for a full 40 character hex object id.
pub fn is_commit_sha(revision: &str) -> bool {
    revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit())
}

/// Directory name under the cache for a repository URL.
pub fn cache_key(url: &str) -> String {
    let trimmed = url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .split("://")
        .last()
        .unwrap_or(url);
    let mut key: String = trimmed
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    key = key.trim_matches(|c| c == '_' || c == '.').to_string();
    if key.is_empty() {
        key = "repo".to_string();
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_commit_sha() {
        assert!(is_commit_sha("0123456789abcdef0123456789abcdef01234567"));
        assert!(!is_commit_sha("main"));
        assert!(!is_commit_sha("0123456"));
    }

    #[test]
    fn test_cache_key() {
        assert_eq!(
            cache_key("https://git.example.com/team/infra.git"),
            "git.example.com_team_infra"
        );
        assert_eq!(cache_key("git@git.example.com:infra.git"), "git_git.example.com_infra");
        assert_eq!(cache_key("/srv/repos/infra/"), "srv_repos_infra");
    }
}
