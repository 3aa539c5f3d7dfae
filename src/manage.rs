//! `repohost repo ...` administration commands.
//!
//! These run against the repository root directly and never talk to a
//! running server.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use tracing::info;

use crate::git::{self, Repository};
use crate::mirror::worker::validate_remote;

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Create a bare repository.
    New {
        name: String,
        /// Make it a mirror of this http(s) URL.
        #[arg(long)]
        mirror: Option<String>,
        #[arg(long)]
        private: bool,
    },
    /// Toggle whether a repository is private.
    Private { name: String },
    /// Print the description, or set it when `text` is given.
    Description { name: String, text: Option<String> },
}

pub async fn run(root: &Path, command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::New {
            name,
            mirror,
            private,
        } => {
            new_repo(root, &name, mirror.as_deref(), private).await?;
            Ok(())
        }
        RepoCommand::Private { name } => {
            let private = toggle_private(root, &name).await?;
            println!("{}", if private { "private" } else { "public" });
            Ok(())
        }
        RepoCommand::Description { name, text } => {
            let description = description(root, &name, text.as_deref()).await?;
            println!("{description}");
            Ok(())
        }
    }
}

async fn open(root: &Path, name: &str) -> Result<Repository> {
    let path = git::resolve(root, name)?;
    Repository::open(&path, "")
        .await
        .with_context(|| format!("failed to open repository {name}"))
}

pub async fn new_repo(
    root: &Path,
    name: &str,
    mirror: Option<&str>,
    private: bool,
) -> Result<Repository> {
    // Checked first so a bad URL leaves nothing behind.
    if let Some(url) = mirror {
        validate_remote(url)?;
    }

    let path = git::resolve(root, name)?;
    if path.exists() {
        bail!("repository already exists: {name}");
    }
    let repo = Repository::init(&path).await?;
    repo.set_private(private).await?;
    if let Some(url) = mirror {
        repo.set_mirror_remote(url).await?;
    }

    info!(repo = %repo.name(), private, mirror = ?mirror, "repository created");
    Ok(repo)
}

/// Returns the new visibility.
pub async fn toggle_private(root: &Path, name: &str) -> Result<bool> {
    let repo = open(root, name).await?;
    let private = !repo.is_private().await?;
    repo.set_private(private).await?;
    info!(repo = %repo.name(), private, "repository visibility changed");
    Ok(private)
}

pub async fn description(root: &Path, name: &str, text: Option<&str>) -> Result<String> {
    let repo = open(root, name).await?;
    if let Some(text) = text {
        repo.set_description(text).await?;
        info!(repo = %repo.name(), description = %text, "repository description changed");
    }
    Ok(repo.description().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::require_git;

    #[tokio::test]
    async fn new_mirror_repository() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        let repo = new_repo(root.path(), "tools.git", Some("https://example.com/tools.git"), true)
            .await
            .unwrap();
        assert_eq!(repo.name(), "tools");
        assert!(repo.is_private().await.unwrap());
        assert!(repo.is_mirror().await.unwrap());
        assert!(root.path().join("tools.git").is_dir());

        assert!(new_repo(root.path(), "tools", None, false).await.is_err());
    }

    #[tokio::test]
    async fn bad_mirror_url_creates_nothing() {
        let root = tempfile::tempdir().unwrap();
        assert!(new_repo(root.path(), "x", Some("git@github.com:a/b.git"), false)
            .await
            .is_err());
        assert!(!root.path().join("x.git").exists());
    }

    #[tokio::test]
    async fn traversal_names_are_refused() {
        let root = tempfile::tempdir().unwrap();
        assert!(new_repo(root.path(), "../escape", None, false).await.is_err());
    }

    #[tokio::test]
    async fn private_toggles_and_description_round_trips() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        new_repo(root.path(), "demo", None, false).await.unwrap();

        assert!(toggle_private(root.path(), "demo").await.unwrap());
        assert!(!toggle_private(root.path(), "demo").await.unwrap());

        assert_eq!(description(root.path(), "demo", None).await.unwrap(), "");
        assert_eq!(
            description(root.path(), "demo", Some("Small tools")).await.unwrap(),
            "Small tools"
        );
    }

    #[tokio::test]
    async fn run_dispatches_each_command() {
        require_git!();
        let root = tempfile::tempdir().unwrap();
        run(
            root.path(),
            RepoCommand::New {
                name: "demo".into(),
                mirror: None,
                private: false,
            },
        )
        .await
        .unwrap();
        run(root.path(), RepoCommand::Private { name: "demo".into() })
            .await
            .unwrap();
        run(
            root.path(),
            RepoCommand::Description {
                name: "demo".into(),
                text: Some("Demo".into()),
            },
        )
        .await
        .unwrap();

        let repo = Repository::open(&root.path().join("demo.git"), "").await.unwrap();
        assert!(repo.is_private().await.unwrap());
        assert_eq!(repo.description().await.unwrap(), "Demo");
    }
}
