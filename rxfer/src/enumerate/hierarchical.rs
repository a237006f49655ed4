use super::{Enumerator, PAGE_SIZE, Selection, Sink, split_prefix};
use anyhow::Context;
use std::sync::Arc;
use tracing::instrument;

/// Listing for buckets with a directory-structured namespace
///
/// Such buckets only return one level per request, so the walk issues a delimited listing for
/// every directory it descends into. Subdirectories show up as common prefixes and are emitted
/// as zero-size directory descriptors.
pub struct HierarchicalLister {
    store: Arc<dyn store::ObjectStore>,
    bucket: String,
    prefix: String,
    selection: Selection,
}

impl HierarchicalLister {
    pub fn new(
        store: Arc<dyn store::ObjectStore>,
        bucket: String,
        prefix: String,
        selection: Selection,
    ) -> Self {
        Self {
            store,
            bucket,
            prefix,
            selection,
        }
    }

    /// List one level; returns the subdirectories to visit, or `None` when the walk should stop
    async fn level(
        &self,
        level_prefix: &str,
        dir_prefix: &str,
        sink: &Sink,
    ) -> anyhow::Result<Option<Vec<String>>> {
        let mut request = store::ListRequest {
            prefix: level_prefix.to_string(),
            delimiter: "/".to_string(),
            marker: None,
            max_keys: PAGE_SIZE,
        };
        let mut subdirs = Vec::new();
        loop {
            if self.selection.cancel.is_cancelled() {
                return Ok(None);
            }
            let page = self
                .store
                .list(&self.bucket, &request)
                .await
                .with_context(|| format!("failed listing s3://{}/{}", self.bucket, level_prefix))?;
            for object in &page.objects {
                if object.key == level_prefix {
                    continue;
                }
                let Some(rel) = object.key.strip_prefix(dir_prefix) else {
                    continue;
                };
                let is_dir = object.is_dir_marker();
                if rel.is_empty() || !self.selection.accepts(rel, is_dir) {
                    continue;
                }
                let item = self.selection.descriptor(
                    dir_prefix,
                    rel,
                    object.size,
                    object.last_modified,
                    is_dir,
                );
                if !sink.deliver(item).await {
                    return Ok(None);
                }
            }
            for common_prefix in page.common_prefixes {
                if self.selection.only_current_dir {
                    continue;
                }
                let Some(rel) = common_prefix.strip_prefix(dir_prefix) else {
                    continue;
                };
                if !self.selection.descend(rel) {
                    continue;
                }
                if self.selection.accepts(rel, true) {
                    let item = self.selection.descriptor(dir_prefix, rel, 0, 0, true);
                    if !sink.deliver(item).await {
                        return Ok(None);
                    }
                }
                subdirs.push(common_prefix);
            }
            match page.next_marker {
                Some(marker) => request.marker = Some(marker),
                None => return Ok(Some(subdirs)),
            }
        }
    }
}

#[async_trait::async_trait]
impl Enumerator for HierarchicalLister {
    #[instrument(skip(self, sink), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn enumerate(&self, sink: &Sink) -> anyhow::Result<()> {
        let (dir_prefix, _) = split_prefix(&self.prefix);
        let mut pending = vec![self.prefix.clone()];
        while let Some(level_prefix) = pending.pop() {
            match self.level(&level_prefix, dir_prefix, sink).await? {
                Some(subdirs) => pending.extend(subdirs.into_iter().rev()),
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
