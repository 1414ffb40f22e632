//! File discovery: walks the configured roots and produces a sorted list of
//! [`FileDescriptor`]s.
//!
//! Directories whose name is on the exclude list are pruned (never walked),
//! as is the indexer's own data directory. Only files with an allowed
//! extension are kept. Each kept file is stat'ed and hashed on the blocking
//! pool, at most `workers` at a time. A file that cannot be hashed still gets
//! a descriptor with the fallback fingerprint; discovery itself never fails
//! because of one file or one root.

use std::collections::{BTreeSet, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::Config;
use crate::error::{PipelineError, RunIssue};
use crate::extract::{extension_of, media_type_for};
use crate::fingerprint::{fallback_fingerprint, hash_file};
use crate::models::FileDescriptor;

/// Files found by one discovery pass plus the per-root/per-file problems seen.
#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<FileDescriptor>,
    pub issues: Vec<RunIssue>,
}

#[derive(Debug, Clone)]
pub struct Discoverer {
    allow_extensions: HashSet<String>,
    exclude_dirs: HashSet<String>,
    exclude_globs: GlobSet,
    follow_symlinks: bool,
    data_dir: Option<PathBuf>,
    workers: usize,
}

impl Discoverer {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            allow_extensions: config
                .index
                .allow_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            exclude_dirs: config.index.exclude_dirs.iter().cloned().collect(),
            exclude_globs: build_globset(&config.index.exclude_globs)?,
            follow_symlinks: config.index.follow_symlinks,
            data_dir: Some(absolute(&config.storage.data_dir)),
            workers: config.index.workers.max(1),
        })
    }

    /// Walks every root and describes each candidate file.
    ///
    /// Relative roots are resolved against the working directory. A root may
    /// be a single file. Paths reachable from more than one root are
    /// reported once.
    pub async fn discover(&self, roots: &[PathBuf]) -> Result<Discovery, PipelineError> {
        let walker = self.clone();
        let roots: Vec<PathBuf> = roots.iter().map(|r| absolute(r)).collect();
        let (candidates, mut issues) =
            tokio::task::spawn_blocking(move || walker.collect_candidates(&roots)).await?;

        let described: Vec<_> = stream::iter(candidates)
            .map(|path| tokio::task::spawn_blocking(move || describe(&path)))
            .buffered(self.workers)
            .collect()
            .await;

        let mut files = Vec::with_capacity(described.len());
        for result in described {
            match result? {
                Ok(file) => files.push(file),
                Err(issue) => issues.push(issue),
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        debug!(files = files.len(), issues = issues.len(), "discovery finished");
        Ok(Discovery { files, issues })
    }

    fn collect_candidates(&self, roots: &[PathBuf]) -> (BTreeSet<PathBuf>, Vec<RunIssue>) {
        let mut candidates = BTreeSet::new();
        let mut issues = Vec::new();

        for root in roots {
            if !root.exists() {
                warn!(root = %root.display(), "root does not exist, skipping");
                issues.push(RunIssue::ReadFailure {
                    path: root.to_string_lossy().to_string(),
                    detail: "root does not exist".to_string(),
                });
                continue;
            }

            if root.is_file() {
                if self.is_allowed(root) {
                    candidates.insert(root.clone());
                }
                continue;
            }

            let walker = WalkDir::new(root)
                .follow_links(self.follow_symlinks)
                .into_iter()
                .filter_entry(|entry| entry.depth() == 0 || !self.is_excluded(entry, root));

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| p.to_string_lossy().to_string())
                            .unwrap_or_else(|| root.to_string_lossy().to_string());
                        warn!(path = %path, error = %e, "failed to walk entry");
                        issues.push(RunIssue::ReadFailure {
                            path,
                            detail: e.to_string(),
                        });
                        continue;
                    }
                };
                if entry.file_type().is_file() && self.is_allowed(entry.path()) {
                    candidates.insert(entry.into_path());
                }
            }
        }

        (candidates, issues)
    }

    fn is_allowed(&self, path: &Path) -> bool {
        self.allow_extensions.contains(&extension_of(path))
    }

    fn is_excluded(&self, entry: &DirEntry, root: &Path) -> bool {
        let path = entry.path();
        if entry.file_type().is_dir() {
            let name = entry.file_name().to_string_lossy();
            if self.exclude_dirs.contains(name.as_ref()) {
                return true;
            }
            if self.data_dir.as_deref() == Some(path) {
                return true;
            }
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        self.exclude_globs.is_match(relative)
    }
}

/// Stats and fingerprints one file.
fn describe(path: &Path) -> Result<FileDescriptor, RunIssue> {
    let path_str = path.to_string_lossy().to_string();
    let metadata = std::fs::metadata(path).map_err(|e| RunIssue::ReadFailure {
        path: path_str.clone(),
        detail: e.to_string(),
    })?;

    let mtime_ns = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    let extension = extension_of(path);

    let fingerprint = match hash_file(path) {
        Ok(digest) => digest,
        Err(e) => {
            warn!(path = %path_str, error = %e, "cannot hash file, using fallback fingerprint");
            fallback_fingerprint(&extension, metadata.len(), mtime_ns)
        }
    };

    Ok(FileDescriptor {
        path: path_str,
        byte_size: metadata.len(),
        mtime_ns,
        fingerprint,
        media_type: media_type_for(&extension).to_string(),
        extension,
    })
}

/// Resolves a path against the working directory without touching the
/// filesystem. `.` components are dropped so that `./docs` and `docs` map to
/// the same stored paths.
pub fn absolute(path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn discoverer(data_dir: &Path, globs: &[&str]) -> Discoverer {
        let mut config = Config::default();
        config.storage.data_dir = data_dir.to_path_buf();
        config.index.exclude_globs = globs.iter().map(|g| g.to_string()).collect();
        Discoverer::from_config(&config).unwrap()
    }

    fn paths(discovery: &Discovery) -> Vec<String> {
        discovery.files.iter().map(|f| f.path.clone()).collect()
    }

    #[tokio::test]
    async fn walks_allowed_files_and_prunes_excluded_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("corpus");
        fs::create_dir_all(root.join("docs/deep")).unwrap();
        fs::create_dir_all(root.join("node_modules/pkg")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("docs/a.TXT"), "a").unwrap();
        fs::write(root.join("docs/deep/c.py"), "c").unwrap();
        fs::write(root.join("docs/image.png"), "png").unwrap();
        fs::write(root.join("node_modules/pkg/readme.md"), "x").unwrap();
        fs::write(root.join(".git/HEAD.txt"), "x").unwrap();

        let d = discoverer(&tmp.path().join("state"), &[]);
        let found = d.discover(&[root.clone()]).await.unwrap();

        let root_str = root.to_string_lossy().to_string();
        assert_eq!(
            paths(&found),
            vec![
                format!("{}/b.md", root_str),
                format!("{}/docs/a.TXT", root_str),
                format!("{}/docs/deep/c.py", root_str),
            ]
        );
        assert!(found.issues.is_empty());

        let a = &found.files[1];
        assert_eq!(a.extension, ".txt");
        assert_eq!(a.byte_size, 1);
        assert_eq!(a.fingerprint, crate::fingerprint::hash_bytes(b"a"));
        assert!(a.mtime_ns > 0);
    }

    #[tokio::test]
    async fn data_dir_inside_root_is_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("state")).unwrap();
        fs::write(root.join("state/cache.md"), "x").unwrap();
        fs::write(root.join("keep.md"), "y").unwrap();

        let d = discoverer(&root.join("state"), &[]);
        let found = d.discover(&[root.clone()]).await.unwrap();
        assert_eq!(found.files.len(), 1);
        assert!(found.files[0].path.ends_with("keep.md"));
    }

    #[tokio::test]
    async fn exclude_globs_apply_relative_to_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        fs::create_dir_all(root.join("drafts")).unwrap();
        fs::write(root.join("drafts/wip.md"), "x").unwrap();
        fs::write(root.join("final.md"), "y").unwrap();
        fs::write(root.join("final.rst"), "z").unwrap();

        let d = discoverer(&root.join("state"), &["drafts", "*.rst"]);
        let found = d.discover(&[root.clone()]).await.unwrap();
        assert_eq!(found.files.len(), 1);
        assert!(found.files[0].path.ends_with("final.md"));
    }

    #[tokio::test]
    async fn missing_root_is_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("one.md"), "1").unwrap();

        let d = discoverer(&tmp.path().join("state"), &[]);
        let found = d
            .discover(&[tmp.path().join("nope"), tmp.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(found.files.len(), 1);
        assert_eq!(found.issues.len(), 1);
        assert!(matches!(found.issues[0], RunIssue::ReadFailure { .. }));
    }

    #[test]
    fn absolute_drops_cur_dir_components() {
        assert_eq!(absolute(Path::new("/srv/./docs/.")), PathBuf::from("/srv/docs"));
        assert!(absolute(Path::new("./docs")).is_absolute());
        assert!(absolute(Path::new("./docs")).ends_with("docs"));
    }

    #[tokio::test]
    async fn file_root_and_overlapping_roots_are_deduplicated() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("solo.md");
        fs::write(&file, "solo").unwrap();

        let d = discoverer(&tmp.path().join("state"), &[]);
        let found = d
            .discover(&[file.clone(), tmp.path().to_path_buf()])
            .await
            .unwrap();
        assert_eq!(paths(&found), vec![file.to_string_lossy().to_string()]);
    }
}
