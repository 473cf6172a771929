//! Plain `git` command wrappers for the report repository clone.
//!
//! Everything shells out; no libgit2. Errors carry git's stderr, which
//! may embed the authenticated remote URL; callers must keep these
//! messages out of user-facing replies.

use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Context, Result, anyhow, bail};

use crate::{info, serde_types::git_hash::GitHash};

#[derive(Debug, Clone)]
pub struct GitWorkingDir {
    path: PathBuf,
}

impl GitWorkingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `path` as an existing clone, or clone `url` there first.
    pub fn clone_or_open(url: &str, path: &Path) -> Result<Self> {
        if path.join(".git").is_dir() {
            return Ok(Self { path: path.into() });
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| anyhow!("create_dir_all {parent:?}"))?;
        }
        info!("cloning the report repository to {path:?}");
        let output = Command::new("git")
            .args(["clone", url])
            .arg(path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("running git clone")?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            bail!("git clone into {path:?} failed: {err}")
        }
        Ok(Self { path: path.into() })
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let in_directory = &self.path;
        let output = Command::new("git")
            .args(args)
            .current_dir(in_directory)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| anyhow!("running git {args:?} in {in_directory:?}"))?;
        if !output.status.success() {
            let err = String::from_utf8_lossy(&output.stderr);
            bail!("git {args:?} in {in_directory:?} failed: {err}")
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    pub fn fetch(&self) -> Result<()> {
        self.git(&["fetch", "origin"])?;
        Ok(())
    }

    pub fn rev_parse(&self, reference: &str) -> Result<GitHash> {
        let out = self.git(&["rev-parse", reference])?;
        out.parse()
            .with_context(|| anyhow!("rev-parse output for {reference:?}"))
    }

    pub fn detach_head(&self) -> Result<()> {
        self.git(&["checkout", "--quiet", "--detach"])?;
        Ok(())
    }

    pub fn checkout(&self, branch: &str) -> Result<()> {
        self.git(&["checkout", "--quiet", branch])?;
        Ok(())
    }

    pub fn reset_hard(&self, to: &str) -> Result<()> {
        self.git(&["reset", "--quiet", "--hard", to])?;
        Ok(())
    }

    /// Stage everything and commit; returns the commit hash. Empty
    /// commits are allowed: re-publication of identical content must
    /// still go through the push protocol.
    pub fn commit_all(&self, message: &str) -> Result<GitHash> {
        self.git(&["add", "--all"])?;
        self.git(&["commit", "--quiet", "--allow-empty", "-m", message])?;
        self.rev_parse("HEAD")
    }

    /// Cherry-pick with an "ours" merge preference, so unrelated
    /// report additions that landed concurrently survive. Redundant
    /// picks (re-publication of identical content) are kept as empty
    /// commits instead of failing.
    pub fn cherry_pick_ours(&self, commit: &GitHash) -> Result<()> {
        self.git(&[
            "cherry-pick",
            "--strategy=recursive",
            "-X",
            "ours",
            "--keep-redundant-commits",
            &commit.to_string(),
        ])?;
        Ok(())
    }

    pub fn push(&self, branch: &str) -> Result<()> {
        self.git(&["push", "--quiet", "origin", branch])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(dir: &Path, cmd: &str, args: &[&str]) {
        let status = Command::new(cmd)
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "{cmd} {args:?}");
    }

    fn init_repo(dir: &Path) {
        sh(dir, "git", &["init", "--quiet", "-b", "master"]);
        sh(dir, "git", &["config", "user.email", "test@example.com"]);
        sh(dir, "git", &["config", "user.name", "test"]);
    }

    #[test]
    fn t_commit_and_rev_parse() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        init_repo(tmp.path());
        std::fs::write(tmp.path().join("file"), "contents")?;
        let dir = GitWorkingDir {
            path: tmp.path().into(),
        };
        let sha = dir.commit_all("initial")?;
        assert_eq!(dir.rev_parse("HEAD")?, sha);

        dir.detach_head()?;
        std::fs::write(tmp.path().join("file2"), "more")?;
        let detached = dir.commit_all("second")?;
        assert_ne!(detached, sha);

        dir.checkout("master")?;
        dir.cherry_pick_ours(&detached)?;
        assert!(tmp.path().join("file2").exists());
        Ok(())
    }
}
