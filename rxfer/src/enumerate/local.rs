use super::{Enumerator, Selection, Sink, unix_secs};
use crate::operation::SymlinkPolicy;
use anyhow::Context;
use async_recursion::async_recursion;
use std::collections::HashSet;
use tracing::instrument;

/// Walks a local directory tree
///
/// A root given with a trailing separator maps its contents (`dir/` yields `a.txt`); without it
/// the directory itself is part of the keys (`dir` yields `dir/a.txt`).
#[derive(Debug)]
pub struct LocalWalker {
    root: std::path::PathBuf,
    /// directory string the relative keys are joined onto
    prefix: String,
    /// relative key of the root itself, empty or ending with `/`
    base: String,
    selection: Selection,
}

fn with_separator(path: &std::path::Path) -> String {
    let text = path.to_string_lossy();
    if text.is_empty() || text.ends_with('/') {
        text.into_owned()
    } else {
        format!("{text}/")
    }
}

impl LocalWalker {
    pub fn new(root: std::path::PathBuf, selection: Selection) -> Self {
        let text = root.to_string_lossy();
        let keep_name = !(text.ends_with('/') || text.ends_with(std::path::MAIN_SEPARATOR));
        match (keep_name, root.file_name(), root.parent()) {
            (true, Some(name), Some(parent)) => {
                let base = format!("{}/", name.to_string_lossy());
                let prefix = with_separator(parent);
                Self {
                    root,
                    prefix,
                    base,
                    selection,
                }
            }
            _ => Self::contents_of(root, selection),
        }
    }

    /// Walker whose keys are relative to `root` regardless of how it was spelled
    pub fn contents_of(root: std::path::PathBuf, selection: Selection) -> Self {
        Self {
            prefix: with_separator(&root),
            base: String::new(),
            root,
            selection,
        }
    }

    fn follow_dirs(&self) -> bool {
        self.selection.symlinks == SymlinkPolicy::FollowAll
    }

    /// Returns false once enumeration should stop early
    #[async_recursion]
    async fn walk(
        &self,
        dir: &std::path::Path,
        rel_dir: &str,
        sink: &Sink,
        visited: &mut HashSet<std::path::PathBuf>,
    ) -> anyhow::Result<bool> {
        let mut reader = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", dir))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", dir))?
        {
            entries.push(entry);
        }
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            if self.selection.cancel.is_cancelled() {
                return Ok(false);
            }
            let path = entry.path();
            let rel = format!("{}{}", rel_dir, entry.file_name().to_string_lossy());
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("failed reading file type of {:?}", path))?;
            let metadata = if file_type.is_symlink() {
                if self.selection.symlinks == SymlinkPolicy::Skip {
                    tracing::debug!("skipping symlink {:?}", path);
                    continue;
                }
                match tokio::fs::metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(err) => {
                        tracing::warn!("skipping broken symlink {:?}: {}", path, err);
                        continue;
                    }
                }
            } else {
                entry
                    .metadata()
                    .await
                    .with_context(|| format!("failed reading metadata of {:?}", path))?
            };
            let mtime = metadata.modified().map(unix_secs).unwrap_or_default();
            if metadata.is_dir() {
                if self.selection.only_current_dir {
                    continue;
                }
                if file_type.is_symlink() {
                    if !self.follow_dirs() {
                        continue;
                    }
                    let canonical = tokio::fs::canonicalize(&path)
                        .await
                        .with_context(|| format!("failed resolving {:?}", path))?;
                    if !visited.insert(canonical) {
                        tracing::warn!("skipping {:?}, it loops back into the tree", path);
                        continue;
                    }
                }
                let rel_dir = format!("{rel}/");
                if !self.selection.descend(&rel_dir) {
                    continue;
                }
                if self.selection.accepts(&rel_dir, true) {
                    let item = self
                        .selection
                        .descriptor(&self.prefix, &rel_dir, 0, mtime, true);
                    if !sink.deliver(item).await {
                        return Ok(false);
                    }
                }
                if !self.walk(&path, &rel_dir, sink, visited).await? {
                    return Ok(false);
                }
            } else if metadata.is_file() {
                if !self.selection.accepts(&rel, false) {
                    continue;
                }
                let item = self
                    .selection
                    .descriptor(&self.prefix, &rel, metadata.len(), mtime, false);
                if !sink.deliver(item).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Enumerator for LocalWalker {
    #[instrument(skip(self, sink), fields(root = ?self.root))]
    async fn enumerate(&self, sink: &Sink) -> anyhow::Result<()> {
        let mut visited = HashSet::new();
        if self.follow_dirs() {
            let canonical = tokio::fs::canonicalize(&self.root)
                .await
                .with_context(|| format!("failed resolving {:?}", self.root))?;
            visited.insert(canonical);
        }
        self.walk(&self.root, &self.base, sink, &mut visited).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{self, collect, keys};
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn contents_with_trailing_separator() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let root = format!("{}/", tmp.path().join("src").display());
        let walker = LocalWalker::new(root.into(), Selection::default());
        let items = collect(&walker).await?;
        assert_eq!(
            keys(&items),
            vec!["0.txt", "bar/", "bar/1.txt", "bar/2.txt", "baz/", "baz/3.txt"]
        );
        let file = items.iter().find(|i| i.relative_key == "bar/1.txt").unwrap();
        assert_eq!(file.size, 1);
        assert!(std::path::Path::new(&file.source_key()).exists());
        assert!(items.iter().find(|i| i.relative_key == "bar/").unwrap().is_dir);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn directory_name_kept_without_separator() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let walker = LocalWalker::new(tmp.path().join("src"), Selection::default());
        let items = collect(&walker).await?;
        assert_eq!(items[0].relative_key, "src/0.txt");
        assert!(std::path::Path::new(&items[0].source_key()).exists());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn only_current_dir() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let selection = Selection {
            only_current_dir: true,
            ..Default::default()
        };
        let walker = LocalWalker::contents_of(tmp.path().join("src"), selection);
        assert_eq!(keys(&collect(&walker).await?), vec!["0.txt"]);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn filters_prune_the_walk() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let mut selection = Selection::default();
        selection.filters.add_exclude("bar/")?;
        let walker = LocalWalker::contents_of(tmp.path().join("src"), selection);
        assert_eq!(
            keys(&collect(&walker).await?),
            vec!["0.txt", "baz/", "baz/3.txt"]
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn symlink_policies() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let src = tmp.path().join("src");
        std::os::unix::fs::symlink(src.join("0.txt"), src.join("link.txt"))?;
        std::os::unix::fs::symlink(src.join("bar"), src.join("linkdir"))?;
        // loops back to the root
        std::os::unix::fs::symlink(&src, src.join("baz").join("up"))?;
        let walk = |symlinks| {
            let selection = Selection {
                symlinks,
                ..Default::default()
            };
            LocalWalker::contents_of(src.clone(), selection)
        };
        let skipped = collect(&walk(SymlinkPolicy::Skip)).await?;
        assert!(!keys(&skipped).contains(&"link.txt"));
        let files = collect(&walk(SymlinkPolicy::FollowFiles)).await?;
        assert!(keys(&files).contains(&"link.txt"));
        assert!(!keys(&files).contains(&"linkdir/1.txt"));
        let all = collect(&walk(SymlinkPolicy::FollowAll)).await?;
        assert!(keys(&all).contains(&"linkdir/1.txt"));
        assert!(!keys(&all).iter().any(|k| k.starts_with("baz/up/")));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_root_is_an_error() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let walker = LocalWalker::contents_of(tmp.path().join("nope"), Selection::default());
        assert!(collect(&walker).await.is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_walk_stops_quietly() -> anyhow::Result<()> {
        let tmp = testutils::local_tree()?;
        let selection = Selection::default();
        selection.cancel.cancel();
        let walker = LocalWalker::contents_of(tmp.path().join("src"), selection);
        assert!(collect(&walker).await?.is_empty());
        Ok(())
    }
}
