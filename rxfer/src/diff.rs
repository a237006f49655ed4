//! Mirror planning for `sync --delete`
//!
//! Both sides are enumerated in full into key maps before anything is deleted. Each side runs
//! one enumerator feeding a pool of collectors, which batch descriptors and hand them to a single
//! aggregator that owns the map, so map insertion never contends on a lock. A map growing past
//! the configured ceiling aborts the whole plan: deletions must never act on a partial view.

use crate::enumerate::{CHANNEL_CAPACITY, Enumerator, ItemDescriptor, Sink};
use std::collections::{HashMap, HashSet};

/// Descriptors handed from a collector to the aggregator at once
const BATCH_SIZE: usize = 1000;
/// Collectors flush partial batches this often
const FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    /// full key or path of the entry on its own side
    pub path: String,
    pub size: u64,
    pub last_modified: i64,
    pub is_dir: bool,
}

impl DiffEntry {
    fn from_descriptor(key_prefix: &str, item: ItemDescriptor) -> (String, Self) {
        (
            format!("{}{}", key_prefix, item.relative_key),
            Self {
                path: item.source_key(),
                size: item.size,
                last_modified: item.last_modified,
                is_dir: item.is_dir,
            },
        )
    }
}

pub type DiffKeyMap = HashMap<String, DiffEntry>;

#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    #[error(
        "{side} has more than {limit} entries, refusing to delete anything (raise --max-sync-entries)"
    )]
    OverLimit { side: &'static str, limit: usize },
    #[error("cannot list {side}: {message}")]
    Listing { side: &'static str, message: String },
    #[error("mirror planning was cancelled")]
    Cancelled,
}

/// What the transfer phase may skip and what has to go afterwards
#[derive(Debug, Default)]
pub struct DiffOutcome {
    /// relative keys already identical at the destination
    pub skip: HashSet<String>,
    /// destination-only entries, ordered by key
    pub delete: Vec<(String, DiffEntry)>,
}

pub fn default_collectors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}

async fn collect(
    items: async_channel::Receiver<ItemDescriptor>,
    batches: tokio::sync::mpsc::Sender<Vec<ItemDescriptor>>,
) {
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    loop {
        match tokio::time::timeout(FLUSH_INTERVAL, items.recv()).await {
            Ok(Ok(item)) => {
                batch.push(item);
                if batch.len() >= BATCH_SIZE && batches.send(std::mem::take(&mut batch)).await.is_err()
                {
                    return;
                }
            }
            Ok(Err(_)) => break,
            Err(_) if !batch.is_empty() => {
                if batches.send(std::mem::take(&mut batch)).await.is_err() {
                    return;
                }
            }
            Err(_) => {}
        }
    }
    if !batch.is_empty() {
        // the aggregator only stops listening once it gave up on the whole map
        let _ = batches.send(batch).await;
    }
}

async fn aggregate(
    mut batches: tokio::sync::mpsc::Receiver<Vec<ItemDescriptor>>,
    key_prefix: &str,
    side: &'static str,
    limit: usize,
) -> Result<DiffKeyMap, DiffError> {
    let mut map = DiffKeyMap::new();
    while let Some(batch) = batches.recv().await {
        map.extend(
            batch
                .into_iter()
                .map(|item| DiffEntry::from_descriptor(key_prefix, item)),
        );
        if map.len() > limit {
            tracing::error!("{} exceeds {} entries, aborting the mirror plan", side, limit);
            return Err(DiffError::OverLimit { side, limit });
        }
    }
    Ok(map)
}

/// Enumerate one side completely into a key map
///
/// `key_prefix` is prepended to every relative key, lining up a side enumerated from below the
/// transfer root with the other one.
#[tracing::instrument(skip(enumerator, cancel), fields(source = %enumerator.describe()))]
pub async fn build_key_map(
    enumerator: &dyn Enumerator,
    key_prefix: &str,
    side: &'static str,
    limit: usize,
    collectors: usize,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<DiffKeyMap, DiffError> {
    let (items_tx, items_rx) = async_channel::bounded(CHANNEL_CAPACITY);
    let (batches_tx, batches_rx) = tokio::sync::mpsc::channel(collectors.max(1) * 2);
    let producer = async move {
        let sink = Sink::Emit(items_tx);
        enumerator.enumerate(&sink).await
    };
    let pool = futures::future::join_all(
        (0..collectors.max(1)).map(|_| collect(items_rx.clone(), batches_tx.clone())),
    );
    drop(items_rx);
    drop(batches_tx);
    let (listing, _, map) = tokio::join!(producer, pool, aggregate(batches_rx, key_prefix, side, limit));
    let map = map?;
    if let Err(error) = listing {
        return Err(DiffError::Listing {
            side,
            message: format!("{error:#}"),
        });
    }
    if cancel.is_cancelled() {
        return Err(DiffError::Cancelled);
    }
    tracing::debug!("{} has {} entries", side, map.len());
    Ok(map)
}

/// Entries present on both sides with the same size and a destination that is not older are
/// skipped; destination-only entries are deleted
pub fn compare(source: &DiffKeyMap, destination: &DiffKeyMap) -> DiffOutcome {
    let mut outcome = DiffOutcome::default();
    for (key, dst) in destination {
        match source.get(key) {
            Some(src) if src.is_dir && dst.is_dir => {
                outcome.skip.insert(key.clone());
            }
            Some(src)
                if !src.is_dir
                    && !dst.is_dir
                    && src.size == dst.size
                    && dst.last_modified >= src.last_modified =>
            {
                outcome.skip.insert(key.clone());
            }
            Some(_) => {}
            None => outcome.delete.push((key.clone(), dst.clone())),
        }
    }
    outcome.delete.sort_by(|a, b| a.0.cmp(&b.0));
    outcome
}

/// Build both maps concurrently and compare them
///
/// A missing destination (`None`) has no entries. The destination comes with the key prefix its
/// relative keys need, see [`build_key_map`].
pub async fn plan(
    source: &dyn Enumerator,
    destination: Option<(&dyn Enumerator, &str)>,
    limit: usize,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<DiffOutcome, DiffError> {
    let collectors = default_collectors();
    let destination_map = async {
        match destination {
            Some((destination, key_prefix)) => {
                build_key_map(
                    destination,
                    key_prefix,
                    "destination",
                    limit,
                    collectors,
                    cancel,
                )
                .await
            }
            None => Ok(DiffKeyMap::new()),
        }
    };
    let (source_map, destination_map) = tokio::join!(
        build_key_map(source, "", "source", limit, collectors, cancel),
        destination_map
    );
    let (source_map, destination_map) = (source_map?, destination_map?);
    let outcome = compare(&source_map, &destination_map);
    tracing::info!(
        "mirror plan: {} identical, {} to delete",
        outcome.skip.len(),
        outcome.delete.len()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enumerate::Selection;
    use crate::enumerate::remote::RemoteLister;
    use std::sync::Arc;
    use tracing_test::traced_test;

    fn entry(size: u64, last_modified: i64) -> DiffEntry {
        DiffEntry {
            path: String::new(),
            size,
            last_modified,
            is_dir: false,
        }
    }

    #[test]
    fn compare_splits_skip_and_delete() {
        let source: DiffKeyMap = [
            ("same".to_string(), entry(1, 10)),
            ("resized".to_string(), entry(2, 10)),
            ("newer".to_string(), entry(1, 30)),
            ("new".to_string(), entry(1, 10)),
        ]
        .into_iter()
        .collect();
        let destination: DiffKeyMap = [
            ("same".to_string(), entry(1, 20)),
            ("resized".to_string(), entry(1, 20)),
            ("newer".to_string(), entry(1, 20)),
            ("z-stale".to_string(), entry(1, 20)),
            ("a-stale".to_string(), entry(1, 20)),
        ]
        .into_iter()
        .collect();
        let outcome = compare(&source, &destination);
        assert_eq!(outcome.skip, ["same".to_string()].into_iter().collect());
        let deleted: Vec<&str> = outcome.delete.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(deleted, vec!["a-stale", "z-stale"]);
    }

    fn lister(store: &Arc<store::memory::MemoryStore>, prefix: &str) -> RemoteLister {
        RemoteLister::new(
            store.clone(),
            "bkt".to_string(),
            prefix.to_string(),
            Selection::default(),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn maps_cover_every_entry() -> anyhow::Result<()> {
        let store = Arc::new(store::memory::MemoryStore::new().with_page_size(7));
        store.create_bucket("bkt");
        for i in 0..2500 {
            store.insert("bkt", &format!("src/{i:05}"), b"x", 10);
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        let map =
            build_key_map(&lister(&store, "src/"), "", "source", 10_000, 3, &cancel).await?;
        assert_eq!(map.len(), 2500);
        assert_eq!(map["00042"].path, "src/00042");
        let nested =
            build_key_map(&lister(&store, "src/"), "top/", "source", 10_000, 3, &cancel).await?;
        assert!(nested.contains_key("top/00042"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn over_limit_aborts() -> anyhow::Result<()> {
        let store = Arc::new(store::memory::MemoryStore::new());
        store.create_bucket("bkt");
        for i in 0..3000 {
            store.insert("bkt", &format!("dst/{i:05}"), b"x", 10);
        }
        let cancel = tokio_util::sync::CancellationToken::new();
        let destination = lister(&store, "dst/");
        let destination: &dyn Enumerator = &destination;
        let result = plan(
            &lister(&store, "src/"),
            Some((destination, "")),
            1000,
            &cancel,
        )
        .await;
        assert!(matches!(
            result,
            Err(DiffError::OverLimit {
                side: "destination",
                limit: 1000
            })
        ));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn listing_failure_aborts() -> anyhow::Result<()> {
        let store = Arc::new(store::memory::MemoryStore::new().with_page_size(10));
        store.create_bucket("bkt");
        for i in 0..100 {
            store.insert("bkt", &format!("src/{i:05}"), b"x", 10);
        }
        store.fail_list_after(2);
        let cancel = tokio_util::sync::CancellationToken::new();
        let result = plan(&lister(&store, "src/"), None, 1000, &cancel).await;
        assert!(matches!(result, Err(DiffError::Listing { side: "source", .. })));
        Ok(())
    }
}
