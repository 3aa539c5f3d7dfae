//! Helpers for tests that need real bare repositories on disk.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

macro_rules! require_git {
    () => {
        if !$crate::test_support::git_available() {
            eprintln!("skipping: git binary not available");
            return;
        }
    };
}
pub(crate) use require_git;

fn git(repo: &Path, args: &[&str], stdin: Option<&[u8]>) -> String {
    let mut child = Command::new("git")
        .args(args)
        .env("GIT_DIR", repo)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn git");
    {
        let mut pipe = child.stdin.take().expect("stdin");
        if let Some(input) = stdin {
            pipe.write_all(input).expect("write stdin");
        }
    }
    let out = child.wait_with_output().expect("wait git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// `git init --bare <root>/<name>.git` with `main` as the default branch.
pub fn init_bare(root: &Path, name: &str) -> PathBuf {
    let path = root.join(format!("{name}.git"));
    let status = Command::new("git")
        .args(["init", "--bare", "--quiet"])
        .arg(&path)
        .env("GIT_CONFIG_GLOBAL", "/dev/null")
        .env("GIT_CONFIG_SYSTEM", "/dev/null")
        .status()
        .expect("spawn git init");
    assert!(status.success());
    git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"], None);
    path
}

/// Add a commit on `main` containing a single `README` file.
pub fn commit(repo: &Path, contents: &str) -> String {
    let blob = git(repo, &["hash-object", "-w", "--stdin"], Some(contents.as_bytes()));
    let tree = git(
        repo,
        &["mktree"],
        Some(format!("100644 blob {blob}\tREADME\n").as_bytes()),
    );
    let parent = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", "refs/heads/main"])
        .env("GIT_DIR", repo)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string());

    let mut args = vec!["commit-tree", tree.as_str(), "-m", contents];
    if let Some(parent) = parent.as_deref() {
        args.extend(["-p", parent]);
    }
    let commit = git(repo, &args, None);
    git(repo, &["update-ref", "refs/heads/main", &commit], None);
    commit
}

pub fn set_config(repo: &Path, key: &str, value: &str) {
    git(repo, &["config", key, value], None);
}

/// Flag a repository as a mirror of `url` without fetching it.
pub fn make_mirror(repo: &Path, url: &str) {
    set_config(repo, "remote.origin.url", url);
    set_config(repo, "remote.origin.fetch", "+refs/*:refs/*");
    set_config(repo, "remote.origin.mirror", "true");
}

/// Point `refs/heads/<name>` at `target`.
pub fn branch(repo: &Path, name: &str, target: &str) {
    git(repo, &["update-ref", &format!("refs/heads/{name}"), target], None);
}

/// Lightweight tag when `message` is `None`, annotated otherwise.
pub fn tag(repo: &Path, name: &str, target: &str, message: Option<&str>) {
    match message {
        Some(message) => git(repo, &["tag", "-a", name, "-m", message, target], None),
        None => git(repo, &["update-ref", &format!("refs/tags/{name}"), target], None),
    };
}
