//! Removal of destination entries that no longer exist at the source
//!
//! Runs after all transfers of a `sync --delete`. Files go first, `routines` at a time;
//! directories follow one by one, deepest first, so a directory is only removed once it is
//! empty. With `--backup-dir` every entry is copied there before it is removed and an entry
//! whose backup failed is left in place.

use crate::diff::DiffEntry;
use crate::location::{Location, dir_key};
use crate::pipeline::PipelineContext;
use crate::process_log::line_time;
use anyhow::{Context, anyhow};
use futures::StreamExt;

fn entry_location(destination: &Location, entry: &DiffEntry) -> Location {
    match destination {
        Location::Local(_) => Location::Local(std::path::PathBuf::from(&entry.path)),
        Location::Remote { bucket, .. } => Location::Remote {
            bucket: bucket.clone(),
            key: entry.path.clone(),
        },
    }
}

fn backup_location(backup: &Location, key: &str) -> anyhow::Result<Location> {
    match backup {
        Location::Local(root) => Ok(Location::Local(crate::worker::local_join(root, key)?)),
        Location::Remote { bucket, key: prefix } => Ok(Location::Remote {
            bucket: bucket.clone(),
            key: format!("{}{}", dir_key(prefix), key),
        }),
    }
}

async fn backup(
    ctx: &PipelineContext,
    location: &Location,
    target: &Location,
    is_dir: bool,
) -> anyhow::Result<()> {
    match (location, target) {
        (Location::Local(path), Location::Local(target)) => {
            if is_dir {
                tokio::fs::create_dir_all(target)
                    .await
                    .with_context(|| format!("cannot create backup directory {:?}", target))?;
                return Ok(());
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("cannot create backup directory {:?}", parent))?;
            }
            tokio::fs::copy(path, target)
                .await
                .with_context(|| format!("cannot back up {:?} to {:?}", path, target))?;
        }
        (
            Location::Remote { bucket, key },
            Location::Remote {
                bucket: backup_bucket,
                key: backup_key,
            },
        ) => {
            if is_dir {
                ctx.store
                    .put_empty(backup_bucket, &dir_key(backup_key), &store::PutOptions::default())
                    .await?;
            } else {
                ctx.store
                    .copy(
                        bucket,
                        key,
                        backup_bucket,
                        backup_key,
                        &store::CopyOptions::default(),
                        &store::NoProgress,
                    )
                    .await?;
            }
        }
        _ => return Err(anyhow!("backup of {location} to {target} is not possible")),
    }
    Ok(())
}

/// Ok(false) when a directory was left because it still has content
async fn remove(ctx: &PipelineContext, location: &Location, is_dir: bool) -> anyhow::Result<bool> {
    match location {
        Location::Local(path) if is_dir => match tokio::fs::remove_dir(path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::DirectoryNotEmpty => Ok(false),
            Err(error) => {
                Err(error).with_context(|| format!("cannot remove directory {:?}", path))
            }
        },
        Location::Local(path) => {
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("cannot remove {:?}", path))?;
            Ok(true)
        }
        Location::Remote { bucket, key } => {
            let key = if is_dir { dir_key(key) } else { key.clone() };
            ctx.store.delete(bucket, &key).await?;
            Ok(true)
        }
    }
}

async fn delete_one(ctx: &PipelineContext, key: &str, entry: &DiffEntry) {
    let location = entry_location(&ctx.operation.destination, entry);
    let message = format!("Delete {location}");
    let started = std::time::Instant::now();
    let result = async {
        if let Some(backup_dir) = &ctx.operation.backup_dir {
            let target = backup_location(backup_dir, key)?;
            backup(ctx, &location, &target, entry.is_dir).await?;
        }
        remove(ctx, &location, entry.is_dir).await
    }
    .await;
    let cost = started.elapsed().as_millis();
    match result {
        Ok(true) => {
            ctx.monitor.record_delete(true);
            ctx.process_log.line(format!(
                "[{}] {} successed,cost {}ms",
                line_time(),
                message,
                cost
            ));
        }
        Ok(false) => {
            tracing::warn!("{} left in place, it is not empty", location);
        }
        Err(error) => {
            tracing::error!("{} failed: {:#}", message, error);
            ctx.monitor.record_delete(false);
            let line = format!("[{}] {} failed: {:#}", line_time(), message, error);
            ctx.process_log.line(format!("{line},cost {cost}ms"));
            ctx.fail_log.line(line);
        }
    }
}

/// Remove `entries` from the destination; failures are counted, never returned
#[tracing::instrument(skip_all, fields(count = entries.len()))]
pub async fn delete_entries(ctx: &PipelineContext, entries: Vec<(String, DiffEntry)>) {
    let (mut dirs, files): (Vec<_>, Vec<_>) =
        entries.into_iter().partition(|(_, entry)| entry.is_dir);
    futures::stream::iter(files)
        .for_each_concurrent(ctx.operation.routines.max(1), |(key, entry)| async move {
            if !ctx.cancel.is_cancelled() {
                delete_one(ctx, &key, &entry).await;
            }
        })
        .await;
    dirs.sort_by(|a, b| {
        let depth = |key: &str| key.trim_end_matches('/').matches('/').count();
        depth(&b.0).cmp(&depth(&a.0)).then_with(|| b.0.cmp(&a.0))
    });
    for (key, entry) in dirs {
        if ctx.cancel.is_cancelled() {
            break;
        }
        delete_one(ctx, &key, &entry).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Command, TransferOperation};
    use common::progress::Monitor;
    use std::sync::Arc;
    use store::memory::{Fault, MemoryStore, Op};
    use tracing_test::traced_test;

    fn file(path: &str) -> DiffEntry {
        DiffEntry {
            path: path.to_string(),
            size: 1,
            last_modified: 0,
            is_dir: false,
        }
    }

    fn dir(path: &str) -> DiffEntry {
        DiffEntry {
            is_dir: true,
            size: 0,
            ..file(path)
        }
    }

    fn context(
        destination: Location,
        backup_dir: Option<Location>,
        store: Arc<MemoryStore>,
    ) -> PipelineContext {
        let mut operation =
            TransferOperation::new(Command::Sync, Location::parse("s3://src/").unwrap(), destination)
                .unwrap();
        operation.delete = true;
        operation.backup_dir = backup_dir;
        PipelineContext::new(operation, store, Arc::new(Monitor::new()))
    }

    fn bucket() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.create_bucket("bkt");
        Arc::new(store)
    }

    #[tokio::test]
    #[traced_test]
    async fn local_files_then_directories() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("dst");
        std::fs::create_dir_all(root.join("old/deeper"))?;
        std::fs::write(root.join("old/deeper/x.txt"), "x")?;
        std::fs::write(root.join("old/y.txt"), "y")?;
        let ctx = context(Location::Local(root.clone()), None, bucket());
        let at = |rel: &str| root.join(rel).display().to_string();
        delete_entries(
            &ctx,
            vec![
                ("old/".to_string(), dir(&at("old/"))),
                ("old/deeper/".to_string(), dir(&at("old/deeper/"))),
                ("old/deeper/x.txt".to_string(), file(&at("old/deeper/x.txt"))),
                ("old/y.txt".to_string(), file(&at("old/y.txt"))),
            ],
        )
        .await;
        assert!(!root.join("old").exists());
        assert!(root.exists());
        let counters = ctx.monitor.snapshot();
        assert_eq!(counters.deleted_count, 4);
        assert_eq!(counters.delete_error_count, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn non_empty_directories_stay() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("dst");
        std::fs::create_dir_all(root.join("kept"))?;
        std::fs::write(root.join("kept/excluded.log"), "x")?;
        let ctx = context(Location::Local(root.clone()), None, bucket());
        let path = root.join("kept/").display().to_string();
        delete_entries(&ctx, vec![("kept/".to_string(), dir(&path))]).await;
        assert!(root.join("kept/excluded.log").exists());
        let counters = ctx.monitor.snapshot();
        assert_eq!(counters.deleted_count, 0);
        assert_eq!(counters.delete_error_count, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn remote_backup_before_delete() -> anyhow::Result<()> {
        let store = bucket();
        store.insert("bkt", "dst/a.txt", b"a", 10);
        store.insert("bkt", "dst/b.txt", b"b", 10);
        store.inject(Op::Write, "bkt", "backup/b.txt", Fault::Always);
        let ctx = context(
            Location::parse("s3://bkt/dst/")?,
            Some(Location::parse("s3://bkt/backup")?),
            store.clone(),
        );
        delete_entries(
            &ctx,
            vec![
                ("a.txt".to_string(), file("dst/a.txt")),
                ("b.txt".to_string(), file("dst/b.txt")),
            ],
        )
        .await;
        assert!(store.object("bkt", "dst/a.txt").is_none());
        assert_eq!(store.object("bkt", "backup/a.txt").unwrap().data, b"a");
        // backup failed, the original stays
        assert!(store.object("bkt", "dst/b.txt").is_some());
        let counters = ctx.monitor.snapshot();
        assert_eq!(counters.deleted_count, 1);
        assert_eq!(counters.delete_error_count, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn local_backup_never_leaves_its_root() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let root = tmp.path().join("dst");
        std::fs::create_dir_all(&root)?;
        std::fs::write(root.join("a.txt"), "a")?;
        std::fs::write(root.join("b.txt"), "b")?;
        let ctx = context(
            Location::Local(root.clone()),
            Some(Location::Local(tmp.path().join("backup"))),
            bucket(),
        );
        let at = |rel: &str| root.join(rel).display().to_string();
        delete_entries(
            &ctx,
            vec![
                ("../escaped.txt".to_string(), file(&at("a.txt"))),
                ("/abs.txt".to_string(), file(&at("b.txt"))),
            ],
        )
        .await;
        assert!(root.join("a.txt").exists());
        assert!(!tmp.path().join("escaped.txt").exists());
        assert_eq!(std::fs::read(tmp.path().join("backup/abs.txt"))?, b"b");
        assert!(!root.join("b.txt").exists());
        let counters = ctx.monitor.snapshot();
        assert_eq!(counters.deleted_count, 1);
        assert_eq!(counters.delete_error_count, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn cancelled_run_deletes_nothing() -> anyhow::Result<()> {
        let store = bucket();
        store.insert("bkt", "a.txt", b"a", 10);
        let ctx = context(Location::parse("s3://bkt/")?, None, store.clone());
        ctx.cancel.cancel();
        delete_entries(&ctx, vec![("a.txt".to_string(), file("a.txt"))]).await;
        assert_eq!(ctx.monitor.snapshot().deleted_count, 0);
        assert!(store.object("bkt", "a.txt").is_some());
        Ok(())
    }
}
