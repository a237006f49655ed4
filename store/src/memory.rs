//! In-process object store
//!
//! Keeps objects in ordered maps so listings paginate exactly like a real store. Failures can be
//! injected per key and per kind of operation, and every attempt is counted, which lets tests
//! observe retry bounds and delivery guarantees without a network.

use crate::{
    BucketLayout, CopyOptions, Error, GetOptions, ListPage, ListRequest, ObjectMeta, ObjectStore,
    PutOptions, Result, TransferListener,
};
use md5::Digest;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemObject {
    pub data: Vec<u8>,
    pub last_modified: i64,
    pub etag: String,
}

impl MemObject {
    pub fn new(data: Vec<u8>, last_modified: i64) -> Self {
        let etag = hex::encode(md5::Md5::digest(&data));
        Self {
            data,
            last_modified,
            etag,
        }
    }

    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            etag: Some(self.etag.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// get
    Read,
    /// put, put_empty and the destination side of copy
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// fail the next n attempts, then succeed
    Times(u32),
    Always,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, BTreeMap<String, MemObject>>,
    faults: HashMap<(Op, String, String), Fault>,
    attempts: HashMap<(Op, String, String), u32>,
    list_calls: usize,
    fail_list_after: Option<usize>,
    clock: Option<i64>,
}

impl State {
    fn now(&self) -> i64 {
        self.clock.unwrap_or_else(unix_now)
    }

    /// Count the attempt and consume one injected failure if any is pending
    fn attempt(&mut self, op: Op, bucket: &str, key: &str) -> Result<()> {
        let id = (op, bucket.to_string(), key.to_string());
        *self.attempts.entry(id.clone()).or_default() += 1;
        match self.faults.get_mut(&id) {
            Some(Fault::Always) => Err(Error::Injected(format!("{op:?} s3://{bucket}/{key}"))),
            Some(Fault::Times(n)) if *n > 0 => {
                *n -= 1;
                Err(Error::Injected(format!("{op:?} s3://{bucket}/{key}")))
            }
            _ => Ok(()),
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    page_size: usize,
    layout: BucketLayout,
    write_delay: Option<std::time::Duration>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            page_size: 1000,
            layout: BucketLayout::Flat,
            write_delay: None,
        }
    }

    /// Cap listing pages at `page_size` entries regardless of the requested `max_keys`
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_layout(mut self, layout: BucketLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Slow every write down, used to make workers lag behind enumerators
    pub fn with_write_delay(mut self, delay: std::time::Duration) -> Self {
        self.write_delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_bucket(&self, bucket: &str) {
        self.lock().buckets.entry(bucket.to_string()).or_default();
    }

    pub fn insert(&self, bucket: &str, key: &str, data: &[u8], last_modified: i64) {
        self.lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), MemObject::new(data.to_vec(), last_modified));
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<MemObject> {
        self.lock()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.lock()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Fix the modification time given to newly written objects
    pub fn set_clock(&self, unix_secs: i64) {
        self.lock().clock = Some(unix_secs);
    }

    pub fn inject(&self, op: Op, bucket: &str, key: &str, fault: Fault) {
        self.lock()
            .faults
            .insert((op, bucket.to_string(), key.to_string()), fault);
    }

    /// Let `pages` listing calls succeed, fail every one after that
    pub fn fail_list_after(&self, pages: usize) {
        self.lock().fail_list_after = Some(pages);
    }

    pub fn attempts(&self, op: Op, bucket: &str, key: &str) -> u32 {
        self.lock()
            .attempts
            .get(&(op, bucket.to_string(), key.to_string()))
            .copied()
            .unwrap_or_default()
    }

    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    async fn delay_write(&self) {
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn store_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        forbid_overwrite: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        let now = state.now();
        let objects = state.buckets.entry(bucket.to_string()).or_default();
        if forbid_overwrite && objects.contains_key(key) {
            return Err(Error::Service {
                op: "put".to_string(),
                message: format!("s3://{bucket}/{key} already exists"),
            });
        }
        objects.insert(key.to_string(), MemObject::new(data, now));
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage> {
        let mut state = self.lock();
        state.list_calls += 1;
        let calls = state.list_calls;
        if state.fail_list_after.is_some_and(|limit| calls > limit) {
            return Err(Error::Injected(format!("list s3://{bucket}/{}", request.prefix)));
        }
        let Some(objects) = state.buckets.get(bucket) else {
            return Err(Error::Service {
                op: "list".to_string(),
                message: format!("bucket {bucket} does not exist"),
            });
        };
        let max_keys = if request.max_keys > 0 {
            (request.max_keys as usize).min(self.page_size)
        } else {
            self.page_size
        };
        let marker = request.marker.as_deref().unwrap_or("");
        let mut page = ListPage::default();
        let mut seen_prefixes = BTreeSet::new();
        let mut emitted = 0;
        let mut last = None;
        for (key, object) in objects.range(request.prefix.clone()..) {
            if !key.starts_with(&request.prefix) {
                break;
            }
            if key.as_str() <= marker {
                continue;
            }
            let rest = &key[request.prefix.len()..];
            let common = match request.delimiter.is_empty() {
                true => None,
                false => rest.find(&request.delimiter).map(|idx| {
                    format!(
                        "{}{}",
                        request.prefix,
                        &rest[..idx + request.delimiter.len()]
                    )
                }),
            };
            if emitted == max_keys {
                page.next_marker = last;
                return Ok(page);
            }
            match common {
                Some(prefix) => {
                    if prefix.as_str() <= marker || seen_prefixes.contains(&prefix) {
                        continue;
                    }
                    seen_prefixes.insert(prefix.clone());
                    page.common_prefixes.push(prefix.clone());
                    last = Some(prefix);
                }
                None => {
                    page.objects.push(object.meta(key));
                    last = Some(key.clone());
                }
            }
            emitted += 1;
        }
        Ok(page)
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        Ok(self.object(bucket, key).map(|object| object.meta(key)))
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        options: &PutOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        self.delay_write().await;
        let data = tokio::fs::read(path)
            .await
            .map_err(|err| Error::io(format!("failed reading {}", path.display()), err))?;
        if let Err(err) = self.lock().attempt(Op::Write, bucket, key) {
            // part of the payload made it before the connection dropped
            listener.on_bytes(data.len() as u64 / 2);
            return Err(err);
        }
        listener.on_bytes(data.len() as u64);
        self.store_object(bucket, key, data, options.forbid_overwrite)
    }

    async fn put_empty(&self, bucket: &str, key: &str, options: &PutOptions) -> Result<()> {
        self.delay_write().await;
        self.lock().attempt(Op::Write, bucket, key)?;
        self.store_object(bucket, key, Vec::new(), options.forbid_overwrite)
    }

    async fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        _options: &GetOptions,
        listener: &dyn TransferListener,
    ) -> Result<ObjectMeta> {
        let object = {
            let mut state = self.lock();
            let attempt = state.attempt(Op::Read, bucket, key);
            let object = state
                .buckets
                .get(bucket)
                .and_then(|objects| objects.get(key))
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })?;
            if let Err(err) = attempt {
                listener.on_bytes(object.data.len() as u64 / 2);
                return Err(err);
            }
            object
        };
        let partial = crate::partial_path(path);
        tokio::fs::write(&partial, &object.data)
            .await
            .map_err(|err| Error::io(format!("failed writing {}", partial.display()), err))?;
        tokio::fs::rename(&partial, path)
            .await
            .map_err(|err| Error::io(format!("failed renaming into {}", path.display()), err))?;
        listener.on_bytes(object.data.len() as u64);
        Ok(object.meta(key))
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        options: &CopyOptions,
        listener: &dyn TransferListener,
    ) -> Result<()> {
        self.delay_write().await;
        let source = self.object(src_bucket, src_key).ok_or_else(|| Error::NotFound {
            bucket: src_bucket.to_string(),
            key: src_key.to_string(),
        })?;
        if let Err(err) = self.lock().attempt(Op::Write, dst_bucket, dst_key) {
            listener.on_bytes(source.data.len() as u64 / 2);
            return Err(err);
        }
        listener.on_bytes(source.data.len() as u64);
        self.store_object(dst_bucket, dst_key, source.data, options.put.forbid_overwrite)
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let mut state = self.lock();
        state.attempt(Op::Delete, bucket, key)?;
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn bucket_layout(&self, _bucket: &str) -> Result<BucketLayout> {
        Ok(self.layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoProgress;
    use tracing_test::traced_test;

    fn store_with(keys: &[&str]) -> MemoryStore {
        let store = MemoryStore::new().with_page_size(2);
        for key in keys {
            store.insert("bkt", key, b"data", 100);
        }
        store
    }

    async fn list_all(store: &MemoryStore, prefix: &str, delimiter: &str) -> Vec<String> {
        let mut request = ListRequest {
            prefix: prefix.to_string(),
            delimiter: delimiter.to_string(),
            marker: None,
            max_keys: 1000,
        };
        let mut out = Vec::new();
        loop {
            let page = store.list("bkt", &request).await.unwrap();
            out.extend(page.common_prefixes);
            out.extend(page.objects.into_iter().map(|o| o.key));
            match page.next_marker {
                Some(marker) => request.marker = Some(marker),
                None => return out,
            }
        }
    }

    #[tokio::test]
    async fn flat_listing_paginates() {
        let store = store_with(&["a/1", "a/2", "a/b/3", "c"]);
        let keys = list_all(&store, "a/", "").await;
        assert_eq!(keys, vec!["a/1", "a/2", "a/b/3"]);
        assert_eq!(store.list_calls(), 2);
    }

    #[tokio::test]
    async fn delimited_listing_groups_prefixes() {
        let store = store_with(&["a/1", "a/b/2", "a/b/3", "a/c/4", "a/d"]);
        let mut keys = list_all(&store, "a/", "/").await;
        keys.sort();
        assert_eq!(keys, vec!["a/1", "a/b/", "a/c/", "a/d"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn injected_faults_are_consumed() {
        let store = MemoryStore::new();
        store.create_bucket("bkt");
        store.inject(Op::Write, "bkt", "k", Fault::Times(1));
        let opts = PutOptions::default();
        assert!(store.put_empty("bkt", "k", &opts).await.is_err());
        assert!(store.put_empty("bkt", "k", &opts).await.is_ok());
        assert_eq!(store.attempts(Op::Write, "bkt", "k"), 2);
    }

    #[tokio::test]
    async fn failing_listing_after_pages() {
        let store = store_with(&["1", "2", "3"]);
        store.fail_list_after(1);
        let mut request = ListRequest::default();
        let page = store.list("bkt", &request).await.unwrap();
        request.marker = page.next_marker;
        assert!(store.list("bkt", &request).await.is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn download_writes_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let store = store_with(&["k"]);
        let dst = tmp.path().join("k");
        let meta = store
            .get_to_file("bkt", "k", &dst, &GetOptions::default(), &NoProgress)
            .await?;
        assert_eq!(meta.size, 4);
        assert_eq!(std::fs::read(&dst)?, b"data");
        assert!(!crate::partial_path(&dst).exists());
        Ok(())
    }

    #[tokio::test]
    async fn forbid_overwrite_rejects_existing() {
        let store = store_with(&["k"]);
        let opts = PutOptions {
            forbid_overwrite: true,
            ..Default::default()
        };
        assert!(store.put_empty("bkt", "k", &opts).await.is_err());
    }
}
