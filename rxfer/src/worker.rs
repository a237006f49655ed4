//! Single-item transfer
//!
//! A [`Worker`] takes one [`ItemDescriptor`] to a terminal [`ItemOutcome`]:
//!
//! 1. map the descriptor onto its source and destination [`Location`]s
//! 2. decide whether the item can be skipped (sync only, see [`crate::decision`])
//! 3. run the upload, download or copy, retrying failed attempts up to `err_retry_num` more
//!    times with a fixed or randomized pause in between
//! 4. record the result in the snapshot store and, for moves, delete the source
//!
//! Every attempt adds a line to the process log. Bytes reported by an attempt that later fails
//! are taken back out of the monitor so the transferred size only counts confirmed data.

use crate::decision::{self, DestinationState, SourceState};
use crate::enumerate::ItemDescriptor;
use crate::location::{Location, TransferKind, dir_key};
use crate::pipeline::PipelineContext;
use crate::process_log::line_time;
use crate::snapshot;
use anyhow::{Context, anyhow};
use common::progress::{ItemOutcome, Monitor};
use md5::Digest;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;

/// Part-level parallelism for an object of `size` bytes
pub fn thread_count(size: u64, part_size: u64) -> usize {
    let policy = store::PartPolicy {
        part_size,
        thread_num: 1,
    };
    match policy.part_count(size) {
        0..=1 => 1,
        2..=4 => 2,
        5..=20 => 4,
        21..=300 => 8,
        301..=500 => 10,
        _ => 12,
    }
}

/// Source of the pause between two attempts of an item
pub trait JitterSource: Send + Sync + std::fmt::Debug {
    /// A duration within `low..=high`
    fn delay(&self, low: std::time::Duration, high: std::time::Duration) -> std::time::Duration;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn delay(&self, low: std::time::Duration, high: std::time::Duration) -> std::time::Duration {
        use rand::Rng;
        if high <= low {
            return low;
        }
        let millis = rand::thread_rng().gen_range(low.as_millis() as u64..=high.as_millis() as u64);
        std::time::Duration::from_millis(millis)
    }
}

/// Always the same pause, whatever the range
#[derive(Debug, Default, Clone, Copy)]
pub struct FixedJitter(pub std::time::Duration);

impl JitterSource for FixedJitter {
    fn delay(&self, _low: std::time::Duration, _high: std::time::Duration) -> std::time::Duration {
        self.0
    }
}

const RANDOM_BACKOFF_MIN: std::time::Duration = std::time::Duration::from_secs(1);
const RANDOM_BACKOFF_MAX: std::time::Duration = std::time::Duration::from_secs(10);

/// Pause before the next attempt: the configured interval, or 1-10s picked by `jitter`
pub fn backoff(interval_secs: u64, jitter: &dyn JitterSource) -> std::time::Duration {
    if interval_secs == 0 {
        jitter.delay(RANDOM_BACKOFF_MIN, RANDOM_BACKOFF_MAX)
    } else {
        std::time::Duration::from_secs(interval_secs)
    }
}

/// Counts the bytes of one attempt while forwarding them to the monitor
struct AttemptListener {
    monitor: Arc<Monitor>,
    bytes: AtomicU64,
}

impl AttemptListener {
    fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            bytes: AtomicU64::new(0),
        }
    }

    fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl store::TransferListener for AttemptListener {
    fn on_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.monitor.add_transferred_bytes(bytes);
    }
}

/// Where items land
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// relative keys are joined onto this location
    Directory(Location),
    /// single item mode, the destination is final
    Exact(Location),
}

impl Target {
    /// Fails for local destinations when the relative key would climb out of the root
    pub fn resolve(&self, item: &ItemDescriptor) -> anyhow::Result<Location> {
        match self {
            Target::Exact(location) => Ok(location.clone()),
            Target::Directory(Location::Local(path)) => {
                Ok(Location::Local(local_join(path, &item.relative_key)?))
            }
            Target::Directory(Location::Remote { bucket, key }) => Ok(Location::Remote {
                bucket: bucket.clone(),
                key: format!("{}{}", dir_key(key), item.relative_key),
            }),
        }
    }
}

/// Join an object key below `root`
///
/// Leading and repeated separators are dropped, so `a//b` and `/a/b` both land at `root/a/b`.
/// A `..` segment is an error: object keys may contain one but a download must never leave
/// `root`.
pub fn local_join(
    root: &std::path::Path,
    relative_key: &str,
) -> anyhow::Result<std::path::PathBuf> {
    use std::path::Component;
    let mut joined = root.to_path_buf();
    for component in std::path::Path::new(relative_key).components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(anyhow!(
                    "key {relative_key:?} points outside of {}",
                    root.display()
                ));
            }
        }
    }
    Ok(joined)
}

/// Location of the item on its own side
pub fn source_location(source: &Location, item: &ItemDescriptor) -> Location {
    match source {
        Location::Local(_) => Location::Local(std::path::PathBuf::from(item.source_key())),
        Location::Remote { bucket, .. } => Location::Remote {
            bucket: bucket.clone(),
            key: item.source_key(),
        },
    }
}

/// Terminal failure of one item, formatted as a fail report line
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{time}] {message} failed: {error}")]
pub struct ItemFailure {
    pub time: String,
    pub message: String,
    pub error: String,
}

impl ItemFailure {
    fn new(message: &str, error: &anyhow::Error) -> Self {
        Self {
            time: line_time(),
            message: message.to_string(),
            error: format!("{error:#}"),
        }
    }
}

/// Decided before any data moves
enum Plan {
    Skip,
    Transfer { snapshot_key: Option<String> },
}

fn snapshot_side(location: &Location) -> String {
    match location {
        Location::Local(path) => crate::operation::normalize(path).display().to_string(),
        remote => remote.to_string(),
    }
}

async fn file_md5(path: &std::path::Path) -> anyhow::Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {:?} for checksum", path))?;
    let mut hasher = md5::Md5::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("failed reading {:?}", path))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub struct Worker {
    ctx: Arc<PipelineContext>,
    target: Target,
}

impl Worker {
    pub fn new(ctx: Arc<PipelineContext>, target: Target) -> Self {
        Self { ctx, target }
    }

    /// Bring one item to a terminal state; the caller records the outcome
    #[tracing::instrument(skip(self), fields(key = %item.relative_key))]
    pub async fn process(&self, item: &ItemDescriptor) -> Result<ItemOutcome, ItemFailure> {
        let operation = &self.ctx.operation;
        let source = source_location(&operation.source, item);
        let destination = match self.target.resolve(item) {
            Ok(destination) => destination,
            Err(error) => {
                let message = format!("{} {}", operation.kind.verb(), source);
                self.ctx.process_log.line(format!(
                    "[{}] {} failed: {:#},cost 0ms",
                    line_time(),
                    message,
                    error
                ));
                tracing::error!("{} failed: {:#}", message, error);
                return Err(ItemFailure::new(&message, &error));
            }
        };
        let message = format!("{} {} to {}", operation.kind.verb(), source, destination);
        let mut log = Vec::new();
        let started = std::time::Instant::now();
        let snapshot_key = match self.plan(item, &source, &destination).await {
            Ok(Plan::Skip) => {
                log.push(format!(
                    "[{}] {} successed(skip),cost {}ms",
                    line_time(),
                    message,
                    started.elapsed().as_millis()
                ));
                self.ctx.process_log.write(log);
                tracing::debug!("skipped {}", message);
                return Ok(ItemOutcome::Skipped { size: item.size });
            }
            Ok(Plan::Transfer { snapshot_key }) => snapshot_key,
            Err(error) => {
                log.push(format!(
                    "[{}] {} failed: {:#},cost {}ms",
                    line_time(),
                    message,
                    error,
                    started.elapsed().as_millis()
                ));
                self.ctx.process_log.write(log);
                return Err(ItemFailure::new(&message, &error));
            }
        };
        let result = self
            .transfer_with_retry(item, &source, &destination, &message, &mut log)
            .await;
        let result = match result {
            Ok(()) => self.finish(item, &source, snapshot_key, &mut log).await,
            Err(error) => Err((message.clone(), error)),
        };
        self.ctx.process_log.write(log);
        match result {
            Ok(()) if item.is_dir => Ok(ItemOutcome::Directory),
            Ok(()) => Ok(ItemOutcome::Transferred),
            Err((message, error)) => {
                tracing::error!("{} failed: {:#}", message, error);
                Err(ItemFailure::new(&message, &error))
            }
        }
    }

    async fn plan(
        &self,
        item: &ItemDescriptor,
        source: &Location,
        destination: &Location,
    ) -> anyhow::Result<Plan> {
        let ctx = &self.ctx;
        let operation = &ctx.operation;
        if item.skip {
            return Ok(Plan::Skip);
        }
        if item.is_dir {
            if operation.skip_dir && operation.kind == TransferKind::Upload {
                return Ok(Plan::Skip);
            }
            return Ok(Plan::Transfer { snapshot_key: None });
        }
        if operation.ignore_empty_file && item.size == 0 && operation.kind == TransferKind::Download
        {
            return Ok(Plan::Skip);
        }
        if !operation.is_sync() {
            return Ok(Plan::Transfer { snapshot_key: None });
        }
        let snapshot_key = ctx
            .snapshot
            .as_ref()
            .map(|_| snapshot::fingerprint(&snapshot_side(source), &snapshot_side(destination)));
        let previous = match (&ctx.snapshot, &snapshot_key) {
            (Some(store), Some(key)) => store
                .get(key)
                .await
                .map_err(|error| ctx.set_fatal(error.into()))?,
            _ => None,
        };
        let mut source_state = SourceState {
            size: item.size,
            last_modified: item.last_modified,
            checksum: None,
            is_dir: false,
            marked_skip: false,
        };
        let destination_state = if decision::needs_destination(previous, &source_state, &ctx.policy)
        {
            self.probe(destination, item.size)
                .await
                .with_context(|| format!("cannot inspect destination {destination}"))?
        } else {
            DestinationState::Unchecked
        };
        let comparable = matches!(
            &destination_state,
            DestinationState::Present { size, checksum: Some(_), .. } if *size == item.size
        );
        if comparable {
            source_state.checksum = self.checksum_of(source).await?;
        }
        let decision = decision::decide(previous, &source_state, &destination_state, &ctx.policy);
        tracing::debug!("{} -> {:?}", destination, decision);
        if !decision.is_skip() {
            return Ok(Plan::Transfer { snapshot_key });
        }
        if let (true, Some(store), Some(key)) =
            (decision.updates_snapshot(), &ctx.snapshot, &snapshot_key)
        {
            store
                .put(key, item.last_modified)
                .await
                .map_err(|error| ctx.set_fatal(error.into()))?;
        }
        Ok(Plan::Skip)
    }

    /// Current state of the destination; local content is only hashed when a comparison needs it
    async fn probe(&self, destination: &Location, size: u64) -> anyhow::Result<DestinationState> {
        let wants_checksum = decision::needs_checksum(&self.ctx.policy);
        match destination {
            Location::Remote { bucket, key } => {
                Ok(match self.ctx.store.head(bucket, key).await? {
                    Some(meta) => DestinationState::Present {
                        size: meta.size,
                        last_modified: meta.last_modified,
                        checksum: decision::usable_checksum(meta.etag.as_deref()),
                    },
                    None => DestinationState::Missing,
                })
            }
            Location::Local(path) => {
                let metadata = match tokio::fs::metadata(path).await {
                    Ok(metadata) => metadata,
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                        return Ok(DestinationState::Missing);
                    }
                    Err(error) => return Err(error.into()),
                };
                let checksum = if wants_checksum && metadata.is_file() && metadata.len() == size {
                    Some(file_md5(path).await?)
                } else {
                    None
                };
                Ok(DestinationState::Present {
                    size: metadata.len(),
                    last_modified: metadata
                        .modified()
                        .map(crate::enumerate::unix_secs)
                        .unwrap_or_default(),
                    checksum,
                })
            }
        }
    }

    async fn checksum_of(&self, source: &Location) -> anyhow::Result<Option<String>> {
        match source {
            Location::Local(path) => Ok(Some(file_md5(path).await?)),
            Location::Remote { bucket, key } => {
                let meta = self.ctx.store.head(bucket, key).await?;
                Ok(meta.and_then(|meta| decision::usable_checksum(meta.etag.as_deref())))
            }
        }
    }

    async fn transfer_with_retry(
        &self,
        item: &ItemDescriptor,
        source: &Location,
        destination: &Location,
        message: &str,
        log: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let attempts = ctx.operation.err_retry_num + 1;
        let mut sleep = std::time::Duration::ZERO;
        let mut last_error = anyhow!("cancelled before the first attempt");
        for attempt in 0..attempts {
            if ctx.cancel.is_cancelled() {
                return Err(last_error.context("run cancelled"));
            }
            if let Some(throttle) = &ctx.throttle {
                throttle.consume_bytes(item.size).await;
            }
            let listener = AttemptListener::new(ctx.monitor.clone());
            let started = std::time::Instant::now();
            let result = self
                .transfer_once(item, source, destination, &listener)
                .await;
            let cost = started.elapsed().as_millis();
            let prefix = if attempt == 0 {
                format!("[{}]", line_time())
            } else {
                format!(
                    "[{}] retry[{}] with sleep[{}]",
                    line_time(),
                    attempt,
                    sleep.as_secs_f64()
                )
            };
            match result {
                Ok(()) => {
                    log.push(format!("{prefix} {message} successed,cost {cost}ms"));
                    return Ok(());
                }
                Err(error) => {
                    log.push(format!("{prefix} {message} failed: {error:#},cost {cost}ms"));
                    ctx.monitor.sub_transferred_bytes(listener.bytes());
                    tracing::warn!(
                        "attempt {}/{} of {} failed: {:#}",
                        attempt + 1,
                        attempts,
                        message,
                        error
                    );
                    last_error = error;
                }
            }
            if attempt + 1 < attempts {
                sleep = backoff(ctx.operation.err_retry_interval, ctx.jitter.as_ref());
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Err(last_error.context("run cancelled"));
                    }
                }
            }
        }
        Err(last_error)
    }

    async fn transfer_once(
        &self,
        item: &ItemDescriptor,
        source: &Location,
        destination: &Location,
        listener: &AttemptListener,
    ) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let store = ctx.store.as_ref();
        match (source, destination) {
            (Location::Local(path), Location::Remote { bucket, key }) => {
                if item.is_dir {
                    store
                        .put_empty(bucket, &dir_key(key), &ctx.put_options(0))
                        .await?;
                } else {
                    store
                        .put_file(bucket, key, path, &ctx.put_options(item.size), listener)
                        .await?;
                }
            }
            (Location::Remote { bucket, key }, Location::Local(path)) => {
                if item.is_dir {
                    tokio::fs::create_dir_all(path)
                        .await
                        .with_context(|| format!("cannot create directory {:?}", path))?;
                } else {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .with_context(|| format!("cannot create directory {:?}", parent))?;
                    }
                    store
                        .get_to_file(bucket, key, path, &ctx.get_options(item.size), listener)
                        .await?;
                }
            }
            (
                Location::Remote {
                    bucket: src_bucket,
                    key: src_key,
                },
                Location::Remote {
                    bucket: dst_bucket,
                    key: dst_key,
                },
            ) => {
                if item.is_dir {
                    store
                        .put_empty(dst_bucket, &dir_key(dst_key), &ctx.put_options(0))
                        .await?;
                } else {
                    store
                        .copy(
                            src_bucket,
                            src_key,
                            dst_bucket,
                            dst_key,
                            &ctx.copy_options(item.size),
                            listener,
                        )
                        .await?;
                }
            }
            (Location::Local(_), Location::Local(_)) => {
                return Err(anyhow!("local to local transfers are not supported"));
            }
        }
        Ok(())
    }

    /// Work that follows a confirmed transfer
    async fn finish(
        &self,
        item: &ItemDescriptor,
        source: &Location,
        snapshot_key: Option<String>,
        log: &mut Vec<String>,
    ) -> Result<(), (String, anyhow::Error)> {
        let ctx = &self.ctx;
        if let (Some(store), Some(key)) = (&ctx.snapshot, snapshot_key) {
            let recorded = store.put(&key, item.last_modified).await;
            if let Err(error) = recorded {
                let error = ctx.set_fatal(error.into());
                return Err((format!("Record snapshot of {source}"), error));
            }
        }
        if !ctx.operation.move_source {
            return Ok(());
        }
        let Location::Remote { bucket, key } = source else {
            return Ok(());
        };
        let message = format!("Delete {source}");
        let started = std::time::Instant::now();
        match ctx.store.delete(bucket, key).await {
            Ok(()) => {
                log.push(format!(
                    "[{}] {} successed,cost {}ms",
                    line_time(),
                    message,
                    started.elapsed().as_millis()
                ));
                Ok(())
            }
            Err(error) => {
                let error = anyhow::Error::from(error);
                log.push(format!(
                    "[{}] {} failed: {:#},cost {}ms",
                    line_time(),
                    message,
                    error,
                    started.elapsed().as_millis()
                ));
                Err((message, error))
            }
        }
    }
}
