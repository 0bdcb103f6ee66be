//! Patch application through `git apply --index`.
//!
//! The repository is passed as `current_dir` and the diff on stdin, so nothing
//! is ever shell-quoted.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Result of `git apply`. Non-zero means nothing was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub exit_code: i32,
    pub stderr: String,
}

impl ApplyOutcome {
    pub fn applied(&self) -> bool {
        self.exit_code == 0
    }
}

/// Applies a unified diff to a repository, all or nothing.
pub trait PatchApplier {
    fn apply(&self, repo: &Path, diff: &str) -> Result<ApplyOutcome>;
}

/// [`PatchApplier`] backed by `git apply --index`, updating worktree and index
/// together.
///
/// `--unidiff-zero` accepts the context-free hunks the agent is asked for.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitPatchApplier;

impl PatchApplier for GitPatchApplier {
    #[instrument(skip_all, fields(repo = %repo.display(), diff_bytes = diff.len()))]
    fn apply(&self, repo: &Path, diff: &str) -> Result<ApplyOutcome> {
        let mut child = Command::new("git")
            .args(["apply", "--index", "--unidiff-zero", "-"])
            .current_dir(repo)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn git apply")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("git apply stdin was not piped"))?;
        if let Err(err) = stdin.write_all(diff.as_bytes()) {
            // git exits early on a malformed patch; its status tells the story.
            warn!(err = %err, "git apply closed stdin early");
        }
        drop(stdin);

        let output = child.wait_with_output().context("wait for git apply")?;
        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if exit_code == 0 {
            debug!("patch applied");
        } else {
            warn!(exit_code, stderr = %stderr, "git apply rejected the patch");
        }
        Ok(ApplyOutcome { exit_code, stderr })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::test_support::TestRepo;

    const FIX: &str = "\
diff --git a/status.txt b/status.txt
--- a/status.txt
+++ b/status.txt
@@ -1 +1 @@
-broken
+fixed
";

    #[test]
    fn applies_to_worktree_and_index() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("status.txt", "broken\n").expect("commit");

        let outcome = GitPatchApplier.apply(repo.path(), FIX).expect("apply");
        assert!(outcome.applied(), "{}", outcome.stderr);
        assert_eq!(
            fs::read_to_string(repo.path().join("status.txt")).expect("read"),
            "fixed\n"
        );
        assert_eq!(repo.status().expect("status"), vec!["M  status.txt"]);
    }

    #[test]
    fn zero_context_hunks_apply() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("status.txt", "a\nbroken\nc\n").expect("commit");
        let diff = "\
diff --git a/status.txt b/status.txt
--- a/status.txt
+++ b/status.txt
@@ -2 +2 @@
-broken
+fixed
";
        let outcome = GitPatchApplier.apply(repo.path(), diff).expect("apply");
        assert!(outcome.applied(), "{}", outcome.stderr);
        assert_eq!(
            fs::read_to_string(repo.path().join("status.txt")).expect("read"),
            "a\nfixed\nc\n"
        );
    }

    #[test]
    fn rejected_patch_changes_nothing() {
        let repo = TestRepo::new().expect("repo");
        repo.commit_file("status.txt", "something else\n").expect("commit");

        let outcome = GitPatchApplier.apply(repo.path(), FIX).expect("apply");
        assert!(!outcome.applied());
        assert!(!outcome.stderr.is_empty());
        assert!(repo.status().expect("status").is_empty());
    }

    #[test]
    fn repo_path_with_spaces_is_safe() {
        let repo = TestRepo::with_dir_name("my repo (copy)").expect("repo");
        repo.commit_file("status.txt", "broken\n").expect("commit");
        let outcome = GitPatchApplier.apply(repo.path(), FIX).expect("apply");
        assert!(outcome.applied(), "{}", outcome.stderr);
    }
}
