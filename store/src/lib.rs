//! Narrow interface between the transfer pipeline and a remote object store
//!
//! The pipeline never talks to an SDK directly. Every remote call goes through [`ObjectStore`],
//! which has two implementations:
//!
//! - [`s3::S3Store`]: an S3-compatible backend built on `aws-sdk-s3`, responsible for the wire
//!   protocol, multipart layout and the rate-limited ("SlowDown") retry budget
//! - [`memory::MemoryStore`]: an in-process store with fault injection, used by tests
//!
//! [`session`] resolves credentials and turns the run configuration into a connected
//! [`s3::S3Store`].

pub mod memory;
pub mod s3;
pub mod session;

/// Largest number of parts a single multipart upload may use
pub const MAX_PARTS: u64 = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object s3://{bucket}/{key} does not exist")]
    NotFound { bucket: String, key: String },
    #[error("{op}: request rate limited by the server")]
    Throttled { op: String },
    #[error("{op}: endpoint unreachable: {message}")]
    Unreachable { op: String, message: String },
    #[error("{op}: {message}")]
    Service { op: String, message: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("credentials: {0}")]
    Credentials(String),
    #[error("injected failure: {0}")]
    Injected(String),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Object attributes as reported by a listing or a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    /// unix seconds
    pub last_modified: i64,
    /// entity tag without surrounding quotes
    pub etag: Option<String>,
}

impl ObjectMeta {
    /// Zero byte objects whose key ends with `/` stand for directories
    pub fn is_dir_marker(&self) -> bool {
        self.size == 0 && self.key.ends_with('/')
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListRequest {
    pub prefix: String,
    /// empty for a flat listing, `/` to stop at the next level
    pub delimiter: String,
    /// continuation marker returned by the previous page
    pub marker: Option<String>,
    pub max_keys: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    /// `None` once the listing is exhausted
    pub next_marker: Option<String>,
}

/// How a bucket organises its keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BucketLayout {
    /// plain key space, one flat paginated listing returns everything under a prefix
    #[default]
    Flat,
    /// directory-structured namespace, listings must descend prefix by prefix
    Hierarchical,
}

/// Receives byte counts while a transfer is in flight
pub trait TransferListener: Send + Sync {
    fn on_bytes(&self, bytes: u64);
}

/// Listener for callers that do not track progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl TransferListener for NoProgress {
    fn on_bytes(&self, _bytes: u64) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// user defined `x-*-meta-` headers, keys without the prefix
    pub user: std::collections::HashMap<String, String>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Encryption {
    #[default]
    None,
    /// keys managed by the service, e.g. `AES256`
    ServerManaged { algorithm: String },
    /// customer provided key, base64 encoded key and key digest
    CustomerKey {
        algorithm: String,
        key: String,
        key_md5: String,
    },
}

/// Multipart policy for a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPolicy {
    pub part_size: u64,
    /// number of parts moved concurrently
    pub thread_num: usize,
}

impl Default for PartPolicy {
    fn default() -> Self {
        Self {
            part_size: 32 * 1024 * 1024,
            thread_num: 1,
        }
    }
}

impl PartPolicy {
    /// Part size grown as needed so that `size` never needs more than [`MAX_PARTS`] parts
    pub fn effective_part_size(&self, size: u64) -> u64 {
        let part_size = self.part_size.max(1);
        let minimum = size.div_ceil(MAX_PARTS);
        part_size.max(minimum)
    }

    pub fn part_count(&self, size: u64) -> u64 {
        if size == 0 {
            return 1;
        }
        size.div_ceil(self.effective_part_size(size))
    }
}

/// Explicit ACL grants on written objects
///
/// Each value is passed through as the matching `x-*-grant-*` header: a comma separated grantee
/// list such as `id="100000000001",id="100000000002"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grants {
    pub read: Option<String>,
    pub read_acp: Option<String>,
    pub write_acp: Option<String>,
    pub full_control: Option<String>,
}

/// Attributes applied to objects written by the tool
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub storage_class: Option<String>,
    /// canned ACL
    pub acl: Option<String>,
    pub grants: Grants,
    /// url-encoded `k1=v1&k2=v2`
    pub tagging: Option<String>,
    pub metadata: Metadata,
    pub encryption: Encryption,
    /// refuse to replace an existing object
    pub forbid_overwrite: bool,
    pub part: PartPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub version_id: Option<String>,
    /// required to read objects stored with a customer key
    pub encryption: Encryption,
    pub part: PartPolicy,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub source_version_id: Option<String>,
    pub source_encryption: Encryption,
    pub put: PutOptions,
}

/// Operations the pipeline needs from a remote store
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, bucket: &str, request: &ListRequest) -> Result<ListPage>;

    /// `Ok(None)` when the object does not exist
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        options: &PutOptions,
        listener: &dyn TransferListener,
    ) -> Result<()>;

    /// Zero byte object, used for directory markers
    async fn put_empty(&self, bucket: &str, key: &str, options: &PutOptions) -> Result<()>;

    /// Download into `path`, the file is only replaced once the object was fully read
    async fn get_to_file(
        &self,
        bucket: &str,
        key: &str,
        path: &std::path::Path,
        options: &GetOptions,
        listener: &dyn TransferListener,
    ) -> Result<ObjectMeta>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        options: &CopyOptions,
        listener: &dyn TransferListener,
    ) -> Result<()>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    async fn bucket_layout(&self, bucket: &str) -> Result<BucketLayout>;
}

/// Temporary sibling used while a download is in flight
pub fn partial_path(path: &std::path::Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".rxfer-partial");
    path.with_file_name(name)
}

/// Strip the quotes servers put around entity tags
pub fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}
