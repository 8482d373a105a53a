//! Code-repository fetcher: shallow git acquisition into a scoped temp
//! workspace, concatenated text tree with per-file markers.
//!
//! Bandwidth ladder: path-scoped sparse checkout of the usual documentation
//! and source directories (≤60s), full shallow clone fallback (≤120s), 180s
//! absolute ceiling. The temp workspace is dropped on every exit path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::process::Command;

use crate::chunk::REPO_FILE_MARKER;
use crate::core::error::FetchError;
use crate::core::types::{DocumentValidators, FetchedDocument, SourceKind};

const SPARSE_TIMEOUT: Duration = Duration::from_secs(60);
const FULL_TIMEOUT: Duration = Duration::from_secs(120);
const ABSOLUTE_CEILING: Duration = Duration::from_secs(180);
const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Directories worth pulling in the sparse pass.
const SPARSE_DIRS: &[&str] = &[
    "docs",
    "doc",
    "documentation",
    "src",
    "lib",
    "examples",
    "samples",
    "scripts",
    "bin",
    "notebooks",
    "tests",
    "test",
];

/// Build, vendor, and VCS directories skipped during the tree walk.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "target",
    "dist",
    "build",
    "out",
    "third_party",
    ".venv",
    "__pycache__",
];

const MAX_FILE_BYTES: u64 = 1_000_000;
const MAX_TOTAL_BYTES: usize = 24_000_000;

pub struct RepoFetcher {
    workspace_root: PathBuf,
}

impl RepoFetcher {
    pub fn new(workspace_root: PathBuf) -> RepoFetcher {
        RepoFetcher { workspace_root }
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedDocument, FetchError> {
        let started = Instant::now();
        let workspace = tempfile::Builder::new()
            .prefix("lorebase-repo-")
            .tempdir_in(&self.workspace_root)
            .map_err(|e| FetchError::Transient(format!("creating repo workspace: {e}")))?;
        let dest = workspace.path().join("checkout");

        // Sparse first; any failure (old git, server without filter support,
        // timeout) falls back to a plain shallow clone.
        let sparse = self.clone_sparse(url, &dest).await;
        if let Err(e) = &sparse {
            tracing::debug!("sparse acquisition of {} failed ({}), going full shallow", url, e);
            let _ = tokio::fs::remove_dir_all(&dest).await;
            let remaining = ABSOLUTE_CEILING
                .checked_sub(started.elapsed())
                .ok_or_else(|| {
                    FetchError::Transient(format!("repo acquisition ceiling hit for {url}"))
                })?;
            self.clone_full(url, &dest, FULL_TIMEOUT.min(remaining)).await?;
        }

        let commit_id = git_stdout(&dest, &["rev-parse", "HEAD"], LS_REMOTE_TIMEOUT)
            .await
            .map_err(|e| FetchError::Transient(format!("reading tip of {url}: {e}")))?;

        let dest_for_walk = dest.clone();
        let (text, file_count) = tokio::task::spawn_blocking(move || collect_tree(&dest_for_walk))
            .await
            .map_err(|e| FetchError::Transient(format!("tree walk task: {e}")))?
            .map_err(|e| FetchError::Permanent(format!("reading tree of {url}: {e}")))?;

        if text.trim().is_empty() {
            return Err(FetchError::Permanent(format!("repository {url} has no readable text")));
        }

        let title = repo_title(url);
        Ok(FetchedDocument {
            url: url.to_string(),
            kind: SourceKind::Repo,
            title,
            language: None,
            text,
            validators: DocumentValidators {
                commit_id: Some(commit_id),
                ..Default::default()
            },
            attributes: serde_json::json!({ "file_count": file_count }),
        })
        // `workspace` drops here, removing the checkout on success and
        // failure alike.
    }

    /// Remote tip without any checkout; the refresher's cheap check.
    pub async fn remote_tip(&self, url: &str) -> Result<String, FetchError> {
        let output = run_git(
            &["ls-remote", url, "HEAD"],
            None,
            LS_REMOTE_TIMEOUT,
        )
        .await
        .map_err(FetchError::Transient)?;
        output
            .split_whitespace()
            .next()
            .filter(|tip| !tip.is_empty())
            .map(|tip| tip.to_string())
            .ok_or_else(|| FetchError::Permanent(format!("no HEAD ref at {url}")))
    }

    async fn clone_sparse(&self, url: &str, dest: &Path) -> Result<(), String> {
        let dest_str = dest.to_string_lossy().to_string();
        run_git(
            &[
                "clone",
                "--depth",
                "1",
                "--filter=blob:none",
                "--sparse",
                url,
                &dest_str,
            ],
            None,
            SPARSE_TIMEOUT,
        )
        .await?;

        let mut args = vec!["sparse-checkout", "set"];
        args.extend_from_slice(SPARSE_DIRS);
        run_git(&args, Some(dest), SPARSE_TIMEOUT).await?;
        Ok(())
    }

    async fn clone_full(&self, url: &str, dest: &Path, timeout: Duration) -> Result<(), FetchError> {
        let dest_str = dest.to_string_lossy().to_string();
        run_git(&["clone", "--depth", "1", url, &dest_str], None, timeout)
            .await
            .map(|_| ())
            .map_err(|e| classify_clone_error(url, &e))
    }
}

fn classify_clone_error(url: &str, stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found")
        || lower.contains("repository does not exist")
        || lower.contains("authentication")
        || lower.contains("access denied")
    {
        FetchError::Permanent(format!("repository unavailable: {url}: {stderr}"))
    } else {
        FetchError::Transient(format!("clone failed for {url}: {stderr}"))
    }
}

async fn run_git(args: &[&str], cwd: Option<&Path>, timeout: Duration) -> Result<String, String> {
    let mut cmd = Command::new("git");
    cmd.args([
        "-c",
        "credential.helper=",
        "-c",
        "core.sshCommand=ssh -o BatchMode=yes",
    ]);
    if let Some(dir) = cwd {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args);
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| format!("git {} timed out after {:?}", args.first().unwrap_or(&""), timeout))?
        .map_err(|e| format!("spawning git: {e}"))?;

    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn git_stdout(dir: &Path, args: &[&str], timeout: Duration) -> Result<String, String> {
    run_git(args, Some(dir), timeout).await
}

/// Deterministic walk: relative paths sorted, binaries and oversized files
/// skipped, everything concatenated under per-file markers.
fn collect_tree(root: &Path) -> std::io::Result<(String, usize)> {
    let mut files: Vec<PathBuf> = Vec::new();
    walk(root, root, &mut files)?;
    files.sort();

    let mut out = String::new();
    let mut kept = 0usize;
    for rel in &files {
        let abs = root.join(rel);
        let meta = std::fs::metadata(&abs)?;
        if meta.len() > MAX_FILE_BYTES {
            continue;
        }
        let bytes = std::fs::read(&abs)?;
        if looks_binary(&bytes) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes);
        if out.len() + content.len() > MAX_TOTAL_BYTES {
            tracing::warn!("repo text budget reached, truncating tree at {} files", kept);
            break;
        }
        out.push_str(REPO_FILE_MARKER);
        out.push_str(&rel.to_string_lossy());
        out.push_str(" ---\n");
        out.push_str(content.trim_end());
        out.push_str("\n\n");
        kept += 1;
    }
    Ok((out, kept))
}

fn walk(root: &Path, dir: &Path, files: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if EXCLUDED_DIRS.contains(&name.as_str()) {
                continue;
            }
            walk(root, &path, files)?;
        } else if path.is_file() {
            if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}

fn repo_title(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments().map(|s| {
                s.filter(|p| !p.is_empty())
                    .take(2)
                    .collect::<Vec<_>>()
                    .join("/")
            })
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_sniffing() {
        assert!(looks_binary(&[0x7f, b'E', b'L', b'F', 0x00]));
        assert!(!looks_binary(b"fn main() {}\n"));
    }

    #[test]
    fn repo_title_is_owner_slash_name() {
        assert_eq!(repo_title("https://github.com/tokio-rs/tokio"), "tokio-rs/tokio");
        assert_eq!(repo_title("https://gitlab.com/group/project"), "group/project");
    }

    #[test]
    fn clone_error_classification() {
        assert!(!classify_clone_error("u", "remote: Repository not found.").is_transient());
        assert!(classify_clone_error("u", "connection reset by peer").is_transient());
    }

    #[test]
    fn collect_tree_writes_markers_and_skips_binaries() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "# Readme\n").unwrap();
        std::fs::write(dir.path().join("blob.bin"), [0u8, 1, 2, 3]).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        std::fs::write(dir.path().join("node_modules/x/idx.js"), "ignored").unwrap();

        let (text, kept) = collect_tree(dir.path()).unwrap();
        assert_eq!(kept, 2);
        assert!(text.contains(&format!("{}README.md ---", REPO_FILE_MARKER)));
        assert!(text.contains(&format!("{}src/lib.rs ---", REPO_FILE_MARKER)));
        assert!(!text.contains("idx.js"));
        assert!(!text.contains("blob.bin"));
    }
}
