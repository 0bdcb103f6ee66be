//! Shallow validity check for agent proposals.
//!
//! A proposal is valid when the agent exited 0 and its output, after leading
//! whitespace, starts with `diff`. Nothing else about the diff is checked here;
//! whether it applies is decided by `git apply`.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{PatchProposal, ProposalFailure};

const DIFF_MARKER: &str = "diff";

static DIFF_GIT_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^diff --git a/(\S+) b/(\S+)$").expect("valid diff header regex")
});

pub fn looks_like_diff(exit_code: i32, logs: &str) -> bool {
    exit_code == 0 && logs.trim_start().starts_with(DIFF_MARKER)
}

/// Classify a finished sandbox job's output into a proposal.
pub fn proposal_from_output(step_id: &str, exit_code: i32, logs: String) -> PatchProposal {
    if looks_like_diff(exit_code, &logs) {
        let diff = normalize_diff(&logs);
        return PatchProposal {
            step_id: step_id.to_string(),
            exit_code,
            logs,
            diff: Some(diff),
            failure: None,
        };
    }
    PatchProposal {
        step_id: step_id.to_string(),
        exit_code,
        logs,
        diff: None,
        failure: Some(ProposalFailure::NotADiff { exit_code }),
    }
}

/// Strip leading whitespace and guarantee a trailing newline (`git apply` needs it).
fn normalize_diff(logs: &str) -> String {
    let mut diff = logs.trim_start().to_string();
    if !diff.ends_with('\n') {
        diff.push('\n');
    }
    diff
}

/// Paths named by `diff --git` headers, in order of appearance (target side).
pub fn touched_paths(diff: &str) -> Vec<String> {
    DIFF_GIT_HEADER_RE
        .captures_iter(diff)
        .map(|caps| caps[2].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_diff_prefix_after_whitespace() {
        assert!(looks_like_diff(0, "\n  diff --git a/x b/x\n"));
        assert!(looks_like_diff(0, "diffstat is not a diff"));
    }

    #[test]
    fn rejects_prose_or_nonzero_exit() {
        assert!(!looks_like_diff(0, "Here is the patch:\ndiff --git a/x b/x"));
        assert!(!looks_like_diff(1, "diff --git a/x b/x"));
        assert!(!looks_like_diff(0, ""));
    }

    #[test]
    fn valid_proposal_carries_normalized_diff() {
        let proposal = proposal_from_output("lint", 0, "\ndiff --git a/x b/x".to_string());
        assert!(proposal.is_valid());
        assert_eq!(proposal.diff.as_deref(), Some("diff --git a/x b/x\n"));
        assert_eq!(proposal.failure, None);
    }

    #[test]
    fn invalid_proposal_has_no_diff() {
        let proposal = proposal_from_output("lint", 2, "error: no api key".to_string());
        assert!(!proposal.is_valid());
        assert_eq!(
            proposal.failure,
            Some(ProposalFailure::NotADiff { exit_code: 2 })
        );
        assert_eq!(proposal.logs, "error: no api key");
    }

    #[test]
    fn touched_paths_reads_git_headers() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n@@ -1 +1 @@\n-a\n+b\n\
                    diff --git a/old.txt b/new.txt\n";
        assert_eq!(touched_paths(diff), vec!["src/lib.rs", "new.txt"]);
    }
}
