//! Transfer orchestration
//!
//! One run wires together:
//!
//! - enumerator tasks: a scan pass counting the source into the monitor and an emit pass
//!   feeding a bounded channel (single item mode only has the emit pass)
//! - `routines` worker tasks, each taking descriptors off the channel until it is closed and
//!   drained or the run is cancelled
//! - the aggregator (the calling task) which counts completions of enumerators and workers
//!   separately, writes list and item failures to the fail report and cancels the run on the
//!   first failure when `--fail-fast` is set
//!
//! For `sync --delete` the mirror plan is built before anything is transferred and the deletions
//! run after all workers are done.

use crate::decision::DecisionPolicy;
use crate::diff::{self, DiffOutcome};
use crate::enumerate::{
    self, CHANNEL_CAPACITY, Enumerator, Selection, Sink, local::LocalWalker, split_prefix,
    unix_secs,
};
use crate::location::{Location, dir_key};
use crate::operation::TransferOperation;
use crate::process_log::{LogSink, line_time};
use crate::snapshot::SnapshotStore;
use crate::worker::{JitterSource, Target, ThreadRngJitter, Worker, thread_count};
use anyhow::{Context, anyhow};
use common::progress::{ItemOutcome, Monitor, Summary};
use std::sync::{Arc, Mutex, PoisonError};

/// Everything shared by the tasks of one run
pub struct PipelineContext {
    pub operation: TransferOperation,
    pub store: Arc<dyn store::ObjectStore>,
    pub monitor: Arc<Monitor>,
    pub snapshot: Option<SnapshotStore>,
    pub process_log: LogSink,
    pub fail_log: LogSink,
    pub cancel: tokio_util::sync::CancellationToken,
    pub jitter: Arc<dyn JitterSource>,
    pub throttle: Option<Arc<throttle::Throttle>>,
    pub policy: DecisionPolicy,
    fatal: Mutex<Option<String>>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("operation", &self.operation)
            .field("snapshot", &self.snapshot)
            .field("policy", &self.policy)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineContext {
    pub fn new(
        operation: TransferOperation,
        store: Arc<dyn store::ObjectStore>,
        monitor: Arc<Monitor>,
    ) -> Self {
        let policy = DecisionPolicy::from_operation(&operation);
        Self {
            operation,
            store,
            monitor,
            snapshot: None,
            process_log: LogSink::disabled(),
            fail_log: LogSink::disabled(),
            cancel: tokio_util::sync::CancellationToken::new(),
            jitter: Arc::new(ThreadRngJitter),
            throttle: None,
            policy,
            fatal: Mutex::new(None),
        }
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotStore) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_logs(mut self, process_log: LogSink, fail_log: LogSink) -> Self {
        self.process_log = process_log;
        self.fail_log = fail_log;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_throttle(mut self, throttle: Arc<throttle::Throttle>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    pub fn with_cancel(mut self, cancel: tokio_util::sync::CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Record an error the run cannot continue after and cancel everything
    ///
    /// Only the first fatal error is kept; the error is handed back for the caller to propagate.
    pub fn set_fatal(&self, error: anyhow::Error) -> anyhow::Error {
        {
            let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
            if fatal.is_none() {
                tracing::error!("stopping the run: {:#}", error);
                *fatal = Some(format!("{error:#}"));
            }
        }
        self.cancel.cancel();
        error
    }

    pub fn take_fatal(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn part_policy(&self, size: u64) -> store::PartPolicy {
        let part_size = self.operation.part_size;
        store::PartPolicy {
            part_size,
            thread_num: self
                .operation
                .thread_num
                .unwrap_or_else(|| thread_count(size, part_size)),
        }
    }

    pub fn put_options(&self, size: u64) -> store::PutOptions {
        let operation = &self.operation;
        store::PutOptions {
            storage_class: operation.storage_class.clone(),
            acl: operation.acl.clone(),
            grants: operation.grants.clone(),
            tagging: operation.tags.clone(),
            metadata: operation.metadata.clone(),
            encryption: operation.encryption.clone(),
            forbid_overwrite: operation.forbid_overwrite,
            part: self.part_policy(size),
        }
    }

    pub fn get_options(&self, size: u64) -> store::GetOptions {
        store::GetOptions {
            version_id: self.operation.version_id.clone(),
            encryption: self.operation.encryption.clone(),
            part: self.part_policy(size),
        }
    }

    pub fn copy_options(&self, size: u64) -> store::CopyOptions {
        store::CopyOptions {
            source_version_id: self.operation.version_id.clone(),
            source_encryption: self.operation.encryption.clone(),
            put: self.put_options(size),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Scan,
    Emit,
}

enum EnumeratorEvent {
    Finished,
    /// fail report line
    Failed(String),
}

enum WorkerEvent {
    /// fail report line
    ItemFailed(String),
    Finished,
}

/// The one item of a non-recursive transfer
struct SingleItem {
    store: Arc<dyn store::ObjectStore>,
    source: Location,
    monitor: Arc<Monitor>,
}

impl SingleItem {
    async fn stat(&self) -> anyhow::Result<(String, u64, i64)> {
        match &self.source {
            Location::Local(path) => {
                let metadata = tokio::fs::metadata(path)
                    .await
                    .with_context(|| format!("cannot access {:?}", path))?;
                if metadata.is_dir() {
                    return Err(anyhow!("{:?} is a directory, use --recursive", path));
                }
                let mtime = metadata.modified().map(unix_secs).unwrap_or_default();
                Ok((path.to_string_lossy().into_owned(), metadata.len(), mtime))
            }
            Location::Remote { bucket, key } => {
                let meta = self
                    .store
                    .head(bucket, key)
                    .await?
                    .ok_or_else(|| anyhow!("{} does not exist", self.source))?;
                Ok((key.clone(), meta.size, meta.last_modified))
            }
        }
    }
}

#[async_trait::async_trait]
impl Enumerator for SingleItem {
    async fn enumerate(&self, sink: &Sink) -> anyhow::Result<()> {
        let (text, size, last_modified) = match self.stat().await {
            Ok(stat) => stat,
            Err(error) => {
                self.monitor.finish_scan(true);
                return Err(error);
            }
        };
        self.monitor.add_scanned(1, size);
        self.monitor.finish_scan(false);
        let (prefix, name) = split_prefix(&text);
        let item = Selection::default().descriptor(prefix, name, size, last_modified, false);
        sink.deliver(item).await;
        Ok(())
    }

    fn describe(&self) -> String {
        self.source.to_string()
    }
}

/// Final name of the single item: a destination that is a directory gets the source name
async fn single_destination(operation: &TransferOperation) -> anyhow::Result<Location> {
    let name = match &operation.source {
        Location::Local(path) => path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()),
        Location::Remote { key, .. } => Some(split_prefix(key).1.to_string()),
    }
    .filter(|name| !name.is_empty())
    .ok_or_else(|| anyhow!("{} names a directory, use --recursive", operation.source))?;
    let destination = &operation.destination;
    Ok(match destination {
        Location::Local(path) => {
            let is_dir = tokio::fs::metadata(path)
                .await
                .is_ok_and(|metadata| metadata.is_dir());
            if is_dir || destination.has_trailing_separator() {
                Location::Local(path.join(name))
            } else {
                destination.clone()
            }
        }
        Location::Remote { bucket, key } if destination.has_trailing_separator() => {
            Location::Remote {
                bucket: bucket.clone(),
                key: format!("{key}{name}"),
            }
        }
        Location::Remote { .. } => destination.clone(),
    })
}

async fn source_enumerator(
    ctx: &PipelineContext,
    selection: Selection,
) -> anyhow::Result<Box<dyn Enumerator>> {
    match &ctx.operation.source {
        Location::Local(path) => Ok(Box::new(LocalWalker::new(path.clone(), selection))),
        Location::Remote { bucket, key } => {
            enumerate::remote(ctx.store.clone(), bucket, key, selection).await
        }
    }
}

/// How the source contributes to relative keys
enum SourceRoot {
    /// keys are relative to the source itself
    Contents,
    /// every key starts with this directory name (`name/`)
    Directory(String),
    /// every key starts with this raw key prefix
    Prefix(String),
}

fn source_root(source: &Location) -> SourceRoot {
    match source {
        Location::Local(_) if source.has_trailing_separator() => SourceRoot::Contents,
        Location::Local(path) => match path.file_name() {
            Some(name) => SourceRoot::Directory(format!("{}/", name.to_string_lossy())),
            None => SourceRoot::Contents,
        },
        Location::Remote { key, .. } => match split_prefix(key).1 {
            "" => SourceRoot::Contents,
            name => SourceRoot::Prefix(name.to_string()),
        },
    }
}

/// Enumerator covering the part of the destination the source maps onto, with the key prefix
/// its relative keys need; `None` when that part does not exist yet
async fn destination_enumerator(
    ctx: &PipelineContext,
    selection: Selection,
) -> anyhow::Result<Option<(Box<dyn Enumerator>, String)>> {
    let root = source_root(&ctx.operation.source);
    match &ctx.operation.destination {
        Location::Local(path) => {
            let (root_path, walker) = match root {
                SourceRoot::Contents => (
                    path.clone(),
                    LocalWalker::contents_of(path.clone(), selection),
                ),
                SourceRoot::Directory(name) | SourceRoot::Prefix(name) => {
                    let root_path = path.join(name.trim_end_matches('/'));
                    (root_path.clone(), LocalWalker::new(root_path, selection))
                }
            };
            if !tokio::fs::try_exists(&root_path).await.unwrap_or(false) {
                return Ok(None);
            }
            let walker: Box<dyn Enumerator> = Box::new(walker);
            Ok(Some((walker, String::new())))
        }
        Location::Remote { bucket, key } => {
            let (prefix, key_prefix) = match root {
                SourceRoot::Contents => (dir_key(key), String::new()),
                SourceRoot::Directory(name) => (format!("{}{}", dir_key(key), name), name),
                SourceRoot::Prefix(name) => (format!("{}{}", dir_key(key), name), String::new()),
            };
            let lister = enumerate::remote(ctx.store.clone(), bucket, &prefix, selection).await?;
            Ok(Some((lister, key_prefix)))
        }
    }
}

/// Full listing of both sides for `sync --delete`
async fn plan_mirror(ctx: &PipelineContext, selection: &Selection) -> anyhow::Result<DiffOutcome> {
    let source = source_enumerator(ctx, selection.clone()).await?;
    let destination = destination_enumerator(ctx, selection.clone()).await?;
    let destination = destination
        .as_ref()
        .map(|(enumerator, key_prefix)| (enumerator.as_ref(), key_prefix.as_str()));
    let outcome = diff::plan(
        source.as_ref(),
        destination,
        ctx.operation.max_sync_entries,
        &ctx.cancel,
    )
    .await
    .context("cannot plan the mirror, nothing was transferred or deleted")?;
    Ok(outcome)
}

/// Run enumerators and workers to completion
async fn dispatch(
    ctx: &Arc<PipelineContext>,
    passes: Vec<(Arc<dyn Enumerator>, Pass)>,
    target: Target,
) {
    let (items_tx, items_rx) = async_channel::bounded(CHANNEL_CAPACITY);
    let (enumerator_tx, mut enumerator_rx) = tokio::sync::mpsc::unbounded_channel();
    let (worker_tx, mut worker_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut tasks = tokio::task::JoinSet::new();
    let mut enumerators_left = passes.len();
    for (enumerator, pass) in passes {
        let sink = match pass {
            Pass::Scan => Sink::Scan(ctx.monitor.clone()),
            Pass::Emit => Sink::Emit(items_tx.clone()),
        };
        let events = enumerator_tx.clone();
        let monitor = ctx.monitor.clone();
        tasks.spawn(async move {
            let result = enumerator.enumerate(&sink).await;
            // closes the worker channel once the last emitting sender is gone
            drop(sink);
            let event = match result {
                Ok(()) => {
                    if pass == Pass::Scan {
                        monitor.finish_scan(false);
                    }
                    EnumeratorEvent::Finished
                }
                Err(error) if pass == Pass::Scan => {
                    tracing::warn!("scan of {} failed: {:#}", enumerator.describe(), error);
                    monitor.finish_scan(true);
                    EnumeratorEvent::Finished
                }
                Err(error) => EnumeratorEvent::Failed(format!(
                    "[{}] List {} failed: {:#}",
                    line_time(),
                    enumerator.describe(),
                    error
                )),
            };
            let _ = events.send(event);
        });
    }
    drop(items_tx);
    drop(enumerator_tx);
    let mut workers_left = ctx.operation.routines;
    for _ in 0..workers_left {
        let worker = Worker::new(ctx.clone(), target.clone());
        let items = items_rx.clone();
        let events = worker_tx.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => break,
                    item = items.recv() => match item {
                        Ok(item) => item,
                        Err(_) => break,
                    },
                };
                match worker.process(&item).await {
                    Ok(outcome) => ctx.monitor.record(outcome),
                    Err(failure) => {
                        ctx.monitor.record(ItemOutcome::Failed);
                        // the aggregator only runs once this worker yields
                        if ctx.operation.fail_fast && !ctx.cancel.is_cancelled() {
                            tracing::error!("an item failed and --fail-fast is set, cancelling");
                            ctx.cancel.cancel();
                        }
                        let _ = events.send(WorkerEvent::ItemFailed(failure.to_string()));
                    }
                }
            }
            let _ = events.send(WorkerEvent::Finished);
        });
    }
    drop(items_rx);
    drop(worker_tx);
    while enumerators_left + workers_left > 0 {
        tokio::select! {
            Some(event) = enumerator_rx.recv(), if enumerators_left > 0 => {
                enumerators_left -= 1;
                if let EnumeratorEvent::Failed(line) = event {
                    tracing::error!("{}", line);
                    ctx.monitor.record_list_error();
                    ctx.process_log.line(line.clone());
                    ctx.fail_log.line(line);
                    if ctx.operation.fail_fast {
                        ctx.cancel.cancel();
                    }
                }
            }
            Some(event) = worker_rx.recv(), if workers_left > 0 => match event {
                WorkerEvent::ItemFailed(line) => {
                    ctx.fail_log.line(line);
                    if ctx.operation.fail_fast {
                        ctx.cancel.cancel();
                    }
                }
                WorkerEvent::Finished => workers_left -= 1,
            },
            else => break,
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(error) = joined {
            tracing::error!("pipeline task failed: {}", error);
        }
    }
}

async fn transfer(ctx: &Arc<PipelineContext>) -> anyhow::Result<()> {
    let operation = &ctx.operation;
    let mut selection = Selection::from_operation(operation, ctx.cancel.clone());
    let mut deletions = None;
    let (passes, target): (Vec<(Arc<dyn Enumerator>, Pass)>, Target) = if operation.recursive {
        if operation.is_sync() && operation.delete {
            let outcome = plan_mirror(ctx, &selection).await?;
            selection = selection.with_marked_skip(Arc::new(outcome.skip));
            deletions = Some(outcome.delete);
        }
        let enumerator: Arc<dyn Enumerator> = Arc::from(source_enumerator(ctx, selection).await?);
        (
            vec![(enumerator.clone(), Pass::Scan), (enumerator, Pass::Emit)],
            Target::Directory(operation.destination.clone()),
        )
    } else {
        let enumerator: Arc<dyn Enumerator> = Arc::new(SingleItem {
            store: ctx.store.clone(),
            source: operation.source.clone(),
            monitor: ctx.monitor.clone(),
        });
        let destination = single_destination(operation).await?;
        (
            vec![(enumerator, Pass::Emit)],
            Target::Exact(destination),
        )
    };
    dispatch(ctx, passes, target).await;
    if let Some(entries) = deletions {
        if ctx.cancel.is_cancelled() {
            tracing::warn!(
                "run was cancelled, not deleting {} destination entries",
                entries.len()
            );
        } else {
            crate::delete::delete_entries(ctx, entries).await;
        }
    }
    Ok(())
}

/// Run the operation described by `ctx` to completion
///
/// Item, listing and delete failures are counted into the monitor and reported through the
/// summary. An error is returned when the run could not start or had to be aborted; it is a
/// [`common::Aborted`] carrying the summary of what happened until then.
pub async fn run(ctx: Arc<PipelineContext>) -> anyhow::Result<Summary> {
    let replenish = ctx.throttle.clone().map(|throttle| {
        tokio::spawn(async move {
            throttle.run_replenish().await;
        })
    });
    let result = transfer(&ctx).await;
    if let Some(replenish) = replenish {
        replenish.abort();
    }
    if let Some(path) = ctx.process_log.finish().await {
        tracing::info!("process log written to {:?}", path);
    }
    let fail_report = ctx.fail_log.finish().await;
    if let Some(snapshot) = &ctx.snapshot {
        snapshot.close().await;
    }
    let fail_output = fail_report
        .as_deref()
        .and_then(std::path::Path::parent)
        .map(crate::operation::normalize);
    let summary = Summary::from_monitor(&ctx.monitor, fail_output);
    let error = match (result, ctx.take_fatal()) {
        (Err(error), _) => error,
        (Ok(()), Some(fatal)) => anyhow!("run aborted: {fatal}"),
        (Ok(()), None) => return Ok(summary),
    };
    Err(anyhow::Error::new(common::Aborted::new(error, summary)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Command;
    use crate::worker::FixedJitter;
    use store::memory::{Fault, MemoryStore, Op};
    use tracing_test::traced_test;

    fn context(operation: TransferOperation, store: Arc<MemoryStore>) -> Arc<PipelineContext> {
        Arc::new(
            PipelineContext::new(operation, store, Arc::new(Monitor::new()))
                .with_jitter(Arc::new(FixedJitter(std::time::Duration::ZERO))),
        )
    }

    fn upload(source: &std::path::Path, destination: &str) -> TransferOperation {
        let mut operation = TransferOperation::new(
            Command::Copy,
            Location::Local(source.to_path_buf()),
            Location::parse(destination).unwrap(),
        )
        .unwrap();
        operation.recursive = true;
        operation.err_retry_num = 0;
        operation
    }

    fn bucket(name: &str) -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        store.create_bucket(name);
        Arc::new(store)
    }

    #[tokio::test]
    #[traced_test]
    async fn recursive_upload_keeps_directory_name() -> anyhow::Result<()> {
        let tmp = crate::testutils::local_tree()?;
        let store = bucket("bkt");
        let ctx = context(upload(&tmp.path().join("src"), "s3://bkt/dst"), store.clone());
        let summary = run(ctx.clone()).await?;
        assert_eq!(
            store.keys("bkt"),
            vec![
                "dst/src/0.txt",
                "dst/src/bar/",
                "dst/src/bar/1.txt",
                "dst/src/bar/2.txt",
                "dst/src/baz/",
                "dst/src/baz/3.txt",
            ]
        );
        let counters = summary.counters;
        assert_eq!(counters.transferred_count, 6);
        assert_eq!(counters.directory_count, 2);
        assert_eq!(counters.scanned_count, 6);
        assert_eq!(counters.completed(), counters.scanned_count);
        assert!(!counters.has_failures());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failures_are_reported_and_counted() -> anyhow::Result<()> {
        let tmp = crate::testutils::local_tree()?;
        let store = bucket("bkt");
        store.inject(Op::Write, "bkt", "bar/1.txt", Fault::Always);
        let mut operation = upload(&tmp.path().join("src/"), "s3://bkt/");
        operation.fail_output = Some(tmp.path().join("out"));
        let ctx = Arc::new(
            PipelineContext::new(operation, store.clone(), Arc::new(Monitor::new()))
                .with_jitter(Arc::new(FixedJitter(std::time::Duration::ZERO)))
                .with_logs(
                    LogSink::disabled(),
                    LogSink::start(
                        &tmp.path().join("out"),
                        "stamp",
                        crate::process_log::FAIL_REPORT_FILE,
                    ),
                ),
        );
        let summary = run(ctx).await?;
        assert_eq!(summary.counters.error_count, 1);
        assert!(summary.counters.has_failures());
        assert_eq!(
            summary.counters.completed(),
            summary.counters.scanned_count
        );
        let report = std::fs::read_to_string(tmp.path().join("out/stamp/error.report"))?;
        assert_eq!(report.lines().count(), 1);
        assert!(report.contains("bar/1.txt failed"));
        assert_eq!(
            summary.fail_output,
            Some(crate::operation::normalize(&tmp.path().join("out/stamp")))
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn single_object_download() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = bucket("bkt");
        store.insert("bkt", "dir/report.csv", b"a,b", 100);
        let operation = TransferOperation::new(
            Command::Copy,
            Location::parse("s3://bkt/dir/report.csv")?,
            Location::Local(tmp.path().to_path_buf()),
        )?;
        let summary = run(context(operation, store)).await?;
        assert_eq!(summary.counters.transferred_count, 1);
        assert_eq!(std::fs::read(tmp.path().join("report.csv"))?, b"a,b");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn single_missing_object_is_a_list_failure() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let operation = TransferOperation::new(
            Command::Copy,
            Location::parse("s3://bkt/missing.txt")?,
            Location::Local(tmp.path().join("out.txt")),
        )?;
        let summary = run(context(operation, bucket("bkt"))).await?;
        assert_eq!(summary.counters.list_error_count, 1);
        assert!(summary.counters.has_failures());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn fail_fast_stops_early() -> anyhow::Result<()> {
        let store = bucket("src");
        store.create_bucket("dst");
        for i in 0..200 {
            store.insert("src", &format!("k{i:04}"), b"x", 100);
            store.inject(Op::Write, "dst", &format!("k{i:04}"), Fault::Always);
        }
        let mut operation = TransferOperation::new(
            Command::Copy,
            Location::parse("s3://src/")?,
            Location::parse("s3://dst/")?,
        )?;
        operation.recursive = true;
        operation.fail_fast = true;
        operation.routines = 1;
        operation.err_retry_num = 0;
        let ctx = context(operation, store);
        let summary = run(ctx.clone()).await?;
        assert!(ctx.cancel.is_cancelled());
        assert_eq!(summary.counters.error_count, 1);
        assert_eq!(summary.counters.completed(), 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn mirror_deletes_only_below_the_source_name() -> anyhow::Result<()> {
        let tmp = crate::testutils::local_tree()?;
        let store = bucket("bkt");
        store.insert("bkt", "dst/src/stale.txt", b"old", 100);
        store.insert("bkt", "dst/src2/keep.txt", b"keep", 100);
        store.insert("bkt", "dst/other.txt", b"keep", 100);
        let mut operation = upload(&tmp.path().join("src"), "s3://bkt/dst/");
        operation.command = Command::Sync;
        operation.delete = true;
        let summary = run(context(operation, store.clone())).await?;
        assert_eq!(summary.counters.deleted_count, 1);
        assert!(store.object("bkt", "dst/src/stale.txt").is_none());
        assert!(store.object("bkt", "dst/src2/keep.txt").is_some());
        assert!(store.object("bkt", "dst/other.txt").is_some());
        assert!(store.object("bkt", "dst/src/bar/1.txt").is_some());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_mirror_plan_touches_nothing() -> anyhow::Result<()> {
        let tmp = crate::testutils::local_tree()?;
        let store = Arc::new(MemoryStore::new().with_page_size(1));
        store.create_bucket("bkt");
        store.insert("bkt", "stale.txt", b"old", 100);
        store.insert("bkt", "stale2.txt", b"old", 100);
        store.fail_list_after(1);
        let mut operation = upload(&tmp.path().join("src/"), "s3://bkt/");
        operation.command = Command::Sync;
        operation.delete = true;
        assert!(run(context(operation, store.clone())).await.is_err());
        assert!(store.object("bkt", "stale.txt").is_some());
        assert!(store.object("bkt", "0.txt").is_none());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn snapshot_failure_aborts_the_run() -> anyhow::Result<()> {
        let tmp = crate::testutils::local_tree()?;
        let store = bucket("bkt");
        let snapshot = SnapshotStore::in_memory().await?;
        snapshot.close().await;
        let mut operation = upload(&tmp.path().join("src/"), "s3://bkt/");
        operation.command = Command::Sync;
        let ctx = Arc::new(
            PipelineContext::new(operation, store, Arc::new(Monitor::new()))
                .with_snapshot(snapshot),
        );
        let error = run(ctx.clone()).await.unwrap_err();
        assert!(ctx.cancel.is_cancelled());
        let aborted = error
            .downcast_ref::<common::Aborted<Summary>>()
            .expect("aborted runs carry their summary");
        assert!(format!("{error:#}").starts_with("run aborted:"));
        let counters = &aborted.report.counters;
        assert!(counters.error_count >= 1);
        assert!(counters.completed() >= 1);
        Ok(())
    }

    #[test]
    fn option_builders_follow_the_operation() {
        let mut operation = TransferOperation::new(
            Command::Copy,
            Location::parse("s3://a/k").unwrap(),
            Location::parse("s3://b/k").unwrap(),
        )
        .unwrap();
        operation.storage_class = Some("ARCHIVE".to_string());
        operation.version_id = Some("v1".to_string());
        operation.thread_num = Some(7);
        operation.grants.read = Some(r#"id="100000000001""#.to_string());
        operation.grants.full_control = Some(r#"id="100000000002""#.to_string());
        let ctx = PipelineContext::new(operation, bucket("a"), Arc::new(Monitor::new()));
        let copy = ctx.copy_options(1 << 30);
        assert_eq!(copy.source_version_id.as_deref(), Some("v1"));
        assert_eq!(copy.put.storage_class.as_deref(), Some("ARCHIVE"));
        assert_eq!(copy.put.grants.read.as_deref(), Some(r#"id="100000000001""#));
        assert_eq!(copy.put.grants.read_acp, None);
        assert_eq!(ctx.put_options(1).grants, copy.put.grants);
        assert_eq!(copy.put.part.thread_num, 7);
        let mut ctx = ctx;
        ctx.operation.thread_num = None;
        assert_eq!(ctx.get_options(0).part.thread_num, 1);
    }
}
