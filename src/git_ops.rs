//! Git operations for publishing a completed output file
//!
//! Branch, stage and commit go through git2; push shells out to `git` so the
//! user's credential helpers apply.

use crate::config::PublishConfig;
use anyhow::{anyhow, Context, Result};
use chrono::{Local, NaiveDate};
use git2::{BranchType, Repository, Signature};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCommit {
    pub branch: String,
    pub commit: String,
}

/// `<prefix>_<YYYY_MM_DD>`
pub fn branch_name(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}", prefix, date.format("%Y_%m_%d"))
}

/// Commit the output on a dated branch, push it and return to the base branch.
pub fn publish(config: &PublishConfig, output: &Path) -> Result<PublishedCommit> {
    let date = Local::now().date_naive();
    let published = commit_output(config, output, date)?;

    let pushed = push_branch(&config.repo_path, &config.remote, &published.branch);
    checkout_branch(&config.repo_path, &config.base_branch)?;
    pushed?;

    info!(branch = %published.branch, commit = %published.commit, "published output");
    Ok(published)
}

/// Create (or reuse) the dated branch from the base branch, stage `output`
/// and commit it. Leaves the new branch checked out.
pub fn commit_output(config: &PublishConfig, output: &Path, date: NaiveDate) -> Result<PublishedCommit> {
    let repo = Repository::open(&config.repo_path)
        .with_context(|| format!("Failed to open git repository '{}'", config.repo_path.display()))?;
    let relative = relative_to_workdir(&repo, output)?;
    let branch = branch_name(&config.branch_prefix, date);

    if repo.find_branch(&branch, BranchType::Local).is_err() {
        let base = repo
            .find_branch(&config.base_branch, BranchType::Local)
            .with_context(|| format!("Base branch '{}' not found", config.base_branch))?;
        let base_commit = base
            .get()
            .peel_to_commit()
            .context("Failed to get commit from base branch")?;
        repo.branch(&branch, &base_commit, false)
            .with_context(|| format!("Failed to create branch '{}'", branch))?;
    }
    checkout(&repo, &branch)?;

    let mut index = repo.index()?;
    index
        .add_path(&relative)
        .with_context(|| format!("Failed to stage '{}'", relative.display()))?;
    index.write()?;
    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let parent = repo.head()?.peel_to_commit()?;

    let git_config = repo.config()?;
    let name = git_config
        .get_string("user.name")
        .unwrap_or_else(|_| "chunkwise".to_string());
    let email = git_config
        .get_string("user.email")
        .unwrap_or_else(|_| "chunkwise@local".to_string());
    let sig = Signature::now(&name, &email)?;

    let message = format!("Update {} ({})", relative.display(), date.format("%Y-%m-%d"));
    let oid = repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;

    Ok(PublishedCommit {
        branch,
        commit: oid.to_string(),
    })
}

/// Checkout an existing branch
pub fn checkout_branch(repo_path: &Path, name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    checkout(&repo, name)
}

fn checkout(repo: &Repository, name: &str) -> Result<()> {
    let (object, reference) = repo
        .revparse_ext(name)
        .with_context(|| format!("Branch '{}' not found", name))?;

    repo.checkout_tree(&object, None)?;

    match reference {
        Some(r) => repo.set_head(r.name().unwrap_or("HEAD"))?,
        None => repo.set_head_detached(object.id())?,
    }

    Ok(())
}

/// Push a branch and set its upstream (shells out to git)
pub fn push_branch(repo_path: &Path, remote: &str, branch: &str) -> Result<String> {
    let output = Command::new("git")
        .current_dir(repo_path)
        .args(["push", "-u", remote, branch])
        .output()
        .context("Failed to execute git push")?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(anyhow!(
            "git push failed: {}",
            String::from_utf8_lossy(&output.stderr)
        ))
    }
}

fn relative_to_workdir(repo: &Repository, output: &Path) -> Result<PathBuf> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| anyhow!("Repository has no working directory"))?;
    if output.is_relative() {
        return Ok(output.to_path_buf());
    }
    let workdir = workdir.canonicalize()?;
    let output = output
        .canonicalize()
        .with_context(|| format!("Output '{}' does not exist", output.display()))?;
    output
        .strip_prefix(&workdir)
        .map(Path::to_path_buf)
        .map_err(|_| anyhow!("Output '{}' is outside the repository", output.display()))
}
