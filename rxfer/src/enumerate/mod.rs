//! Enumerators turn a source (local tree or remote prefix) into a stream of [`ItemDescriptor`]s
//!
//! Each enumerator is run twice per side in a batch transfer:
//!
//! - with [`Sink::Scan`] descriptors are only counted into the monitor, which sizes the progress
//!   display before the bulk of the work starts
//! - with [`Sink::Emit`] descriptors are sent into the bounded worker channel
//!
//! An emit sink owns the only sender of its channel. The channel therefore closes exactly once,
//! when the enumerator returns and the sink is dropped, whether the listing finished or failed.
//! Listing failures are returned to the caller and end that enumerator; there is no retry at
//! this level.

use crate::operation::{SymlinkPolicy, TransferOperation};
use common::filter::{FilterResult, FilterSettings};
use common::progress::Monitor;
use std::collections::HashSet;
use std::sync::Arc;

pub mod hierarchical;
pub mod local;
pub mod remote;

/// Capacity of the channel between enumerators and workers
pub const CHANNEL_CAPACITY: usize = 1000;
/// Keys requested per listing page
pub const PAGE_SIZE: i32 = 1000;

/// One unit of work, consumed by exactly one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    /// local directory (ending with `/`) or remote key prefix the relative key hangs off
    pub prefix: String,
    /// `/`-separated key relative to the transfer root, directories end with `/`
    pub relative_key: String,
    pub size: u64,
    /// unix seconds
    pub last_modified: i64,
    /// set when the diff pass already found an identical destination entry
    pub skip: bool,
    pub is_dir: bool,
}

impl ItemDescriptor {
    /// Full key (or path string) of the item on its own side
    pub fn source_key(&self) -> String {
        format!("{}{}", self.prefix, self.relative_key)
    }
}

pub enum Sink {
    Scan(Arc<Monitor>),
    Emit(async_channel::Sender<ItemDescriptor>),
}

impl Sink {
    /// Hand over one descriptor; false once nobody consumes the stream anymore
    pub async fn deliver(&self, item: ItemDescriptor) -> bool {
        match self {
            Sink::Scan(monitor) => {
                monitor.add_scanned(1, item.size);
                true
            }
            Sink::Emit(sender) => sender.send(item).await.is_ok(),
        }
    }
}

/// What to enumerate and what to leave out
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub filters: FilterSettings,
    pub only_current_dir: bool,
    pub symlinks: SymlinkPolicy,
    /// relative keys the diff pass found identical on both sides
    pub marked_skip: Option<Arc<HashSet<String>>>,
    pub cancel: tokio_util::sync::CancellationToken,
}

impl Selection {
    pub fn from_operation(
        operation: &TransferOperation,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        Self {
            filters: operation.filters.clone(),
            only_current_dir: operation.only_current_dir,
            symlinks: operation.symlinks,
            marked_skip: None,
            cancel,
        }
    }

    pub fn with_marked_skip(mut self, keys: Arc<HashSet<String>>) -> Self {
        self.marked_skip = Some(keys);
        self
    }

    fn excluded_ancestor(&self, key: &str) -> bool {
        let mut end = 0;
        while let Some(pos) = key[end..].find('/') {
            end += pos;
            if matches!(
                self.filters.should_include(&key[..end], true),
                FilterResult::ExcludedByPattern(_)
            ) {
                return true;
            }
            end += 1;
        }
        false
    }

    /// Whether the walk should look inside directory `key`
    pub fn descend(&self, key: &str) -> bool {
        let key = key.trim_end_matches('/');
        !self.excluded_ancestor(key) && self.filters.should_include(key, true).is_included()
    }

    /// Whether `key` should be handed to workers
    pub fn accepts(&self, key: &str, is_dir: bool) -> bool {
        let key = key.trim_end_matches('/');
        if key.is_empty() || self.excluded_ancestor(key) {
            return false;
        }
        if !is_dir {
            return self.filters.should_include(key, false).is_included();
        }
        // directories that only lead to matches are walked but not transferred
        self.filters.should_include(key, true).is_included()
            && (self.filters.includes.is_empty()
                || self.filters.includes.iter().any(|p| p.matches(key, true)))
    }

    pub fn descriptor(
        &self,
        prefix: &str,
        relative_key: &str,
        size: u64,
        last_modified: i64,
        is_dir: bool,
    ) -> ItemDescriptor {
        let skip = self
            .marked_skip
            .as_ref()
            .is_some_and(|keys| keys.contains(relative_key));
        ItemDescriptor {
            prefix: prefix.to_string(),
            relative_key: relative_key.to_string(),
            size,
            last_modified,
            skip,
            is_dir,
        }
    }
}

#[async_trait::async_trait]
pub trait Enumerator: Send + Sync {
    /// Deliver every selected item to `sink`; returns early without error when cancelled or
    /// when the consumers went away
    async fn enumerate(&self, sink: &Sink) -> anyhow::Result<()>;

    fn describe(&self) -> String;
}

/// Split a remote key at its last `/`: the directory part and the name part
pub fn split_prefix(key: &str) -> (&str, &str) {
    match key.rfind('/') {
        Some(pos) => key.split_at(pos + 1),
        None => ("", key),
    }
}

pub fn unix_secs(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => since.as_secs() as i64,
        Err(before) => -(before.duration().as_secs() as i64),
    }
}

/// Enumerator for a remote prefix, picking the listing strategy the bucket needs
pub async fn remote(
    store: Arc<dyn store::ObjectStore>,
    bucket: &str,
    key: &str,
    selection: Selection,
) -> anyhow::Result<Box<dyn Enumerator>> {
    use anyhow::Context;
    let layout = store
        .bucket_layout(bucket)
        .await
        .with_context(|| format!("failed to query layout of bucket {bucket}"))?;
    Ok(match layout {
        store::BucketLayout::Flat => Box::new(remote::RemoteLister::new(
            store,
            bucket.to_string(),
            key.to_string(),
            selection,
        )),
        store::BucketLayout::Hierarchical => Box::new(hierarchical::HierarchicalLister::new(
            store,
            bucket.to_string(),
            key.to_string(),
            selection,
        )),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_split() {
        assert_eq!(split_prefix("a/b/c.txt"), ("a/b/", "c.txt"));
        assert_eq!(split_prefix("dir/"), ("dir/", ""));
        assert_eq!(split_prefix("dir"), ("", "dir"));
        assert_eq!(split_prefix(""), ("", ""));
    }

    #[test]
    fn excluded_directories_hide_their_contents() {
        let mut selection = Selection::default();
        selection.filters.add_exclude("tmp/").unwrap();
        assert!(!selection.accepts("tmp/a.txt", false));
        assert!(!selection.accepts("x/tmp/a.txt", false));
        assert!(selection.accepts("x/a.txt", false));
        assert!(!selection.descend("tmp/"));
    }

    #[test]
    fn directories_leading_to_matches_are_not_transferred() {
        let mut selection = Selection::default();
        selection.filters.add_include("*.csv").unwrap();
        assert!(selection.descend("nested/"));
        assert!(!selection.accepts("nested/", true));
        assert!(selection.accepts("nested/a.csv", false));
        let plain = Selection::default();
        assert!(plain.accepts("nested/", true));
    }

    #[test]
    fn marked_keys_are_flagged() {
        let keys: HashSet<String> = ["a.txt".to_string()].into_iter().collect();
        let selection = Selection::default().with_marked_skip(Arc::new(keys));
        assert!(selection.descriptor("p/", "a.txt", 1, 1, false).skip);
        assert!(!selection.descriptor("p/", "b.txt", 1, 1, false).skip);
    }

    #[tokio::test]
    async fn scan_sink_counts() {
        let monitor = Arc::new(Monitor::new());
        let sink = Sink::Scan(monitor.clone());
        let item = Selection::default().descriptor("", "a", 10, 0, false);
        assert!(sink.deliver(item.clone()).await);
        assert!(sink.deliver(item).await);
        let counters = monitor.snapshot();
        assert_eq!(counters.scanned_count, 2);
        assert_eq!(counters.scanned_size, 20);
    }

    #[tokio::test]
    async fn emit_sink_reports_gone_consumers() {
        let (tx, rx) = async_channel::bounded(1);
        let sink = Sink::Emit(tx);
        drop(rx);
        let item = Selection::default().descriptor("", "a", 10, 0, false);
        assert!(!sink.deliver(item).await);
    }
}
