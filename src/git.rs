//! Commit metadata used to tag images and fill ledger entries.

use std::path::PathBuf;

use crate::command::{CommandError, DualCommand};

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git: {0}. Is this a git repository with at least one commit?")]
    Command(#[from] CommandError),

    #[error("git {0} printed nothing")]
    Empty(&'static str),
}

pub trait VersionSource {
    fn latest_commit_hash(&self) -> Result<String, GitError>;
    fn latest_commit_message(&self) -> Result<String, GitError>;
}

/// Reads HEAD of the repository at `dir` with the `git` CLI.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Git { dir: dir.into() }
    }

    fn run(&self, what: &'static str, args: &[&str]) -> Result<String, GitError> {
        let dir = self.dir.to_string_lossy();
        let argv = ["-C", &*dir].into_iter().chain(args.iter().copied());
        let out = DualCommand::new("git", argv).run_local()?;
        let text = out.stdout.trim().to_string();
        if text.is_empty() {
            return Err(GitError::Empty(what));
        }
        Ok(text)
    }
}

impl VersionSource for Git {
    // short hash, it ends up in image tags
    fn latest_commit_hash(&self) -> Result<String, GitError> {
        self.run("rev-parse", &["rev-parse", "--short", "HEAD"])
    }

    fn latest_commit_message(&self) -> Result<String, GitError> {
        self.run("log", &["log", "-1", "--pretty=%B"])
    }
}
