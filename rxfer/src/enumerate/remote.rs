use super::{Enumerator, PAGE_SIZE, Selection, Sink, split_prefix};
use anyhow::Context;
use std::sync::Arc;
use tracing::instrument;

/// Flat paginated listing of everything under a key prefix
///
/// The prefix is used as given: `dir/` lists the contents of `dir`, while `dir` also matches
/// `dir2/...`. Relative keys start after the last `/` of the prefix.
pub struct RemoteLister {
    store: Arc<dyn store::ObjectStore>,
    bucket: String,
    prefix: String,
    selection: Selection,
}

impl RemoteLister {
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
}

#[async_trait::async_trait]
impl Enumerator for RemoteLister {
    #[instrument(skip(self, sink), fields(bucket = %self.bucket, prefix = %self.prefix))]
    async fn enumerate(&self, sink: &Sink) -> anyhow::Result<()> {
        let (dir_prefix, _) = split_prefix(&self.prefix);
        let mut request = store::ListRequest {
            prefix: self.prefix.clone(),
            delimiter: if self.selection.only_current_dir {
                "/".to_string()
            } else {
                String::new()
            },
            marker: None,
            max_keys: PAGE_SIZE,
        };
        loop {
            if self.selection.cancel.is_cancelled() {
                return Ok(());
            }
            let page = self
                .store
                .list(&self.bucket, &request)
                .await
                .with_context(|| format!("failed listing {}", self.describe()))?;
            tracing::debug!(
                "listed {} objects after {:?}",
                page.objects.len(),
                request.marker
            );
            for object in &page.objects {
                let Some(rel) = object.key.strip_prefix(dir_prefix) else {
                    continue;
                };
                if rel.is_empty() {
                    continue;
                }
                let is_dir = object.is_dir_marker();
                if !self.selection.accepts(rel, is_dir) {
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
                    return Ok(());
                }
            }
            match page.next_marker {
                Some(marker) => request.marker = Some(marker),
                None => return Ok(()),
            }
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}
