//! The transfer operation: every tunable of one command invocation
//!
//! A [`TransferOperation`] is built once from the command line, validated before any listing
//! starts and never modified afterwards.

use crate::location::{Location, TransferKind};
use common::filter::FilterSettings;
use store::{Encryption, Grants, Metadata};

pub const DEFAULT_PART_SIZE: u64 = 32 * 1024 * 1024;
pub const MIN_PART_SIZE: u64 = 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
pub const DEFAULT_MAX_SYNC_ENTRIES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Copy,
    Sync,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Copy => "cp",
            Command::Sync => "sync",
        }
    }
}

/// How symbolic links met while walking a local tree are treated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SymlinkPolicy {
    /// links are not enumerated at all
    #[default]
    Skip,
    /// links to files are transferred as regular files, links to directories are skipped
    FollowFiles,
    /// links to directories are walked as well
    FollowAll,
}

impl SymlinkPolicy {
    pub fn from_flags(disable_all_symlink: bool, enable_symlink_dir: bool) -> Self {
        match (disable_all_symlink, enable_symlink_dir) {
            (_, true) => SymlinkPolicy::FollowAll,
            (true, false) => SymlinkPolicy::Skip,
            (false, false) => SymlinkPolicy::FollowFiles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("copying between two local paths is not supported, one side must be s3://bucket/key")]
    LocalToLocal,
    #[error("--move only applies to copies between two remote locations")]
    MoveNeedsRemote,
    #[error("--move needs different source and destination")]
    MoveOntoItself,
    #[error("--include, --exclude and --filter-file require --recursive")]
    FiltersNeedRecursive,
    #[error("{flag} must be within {range}, got {value}")]
    OutOfRange {
        flag: &'static str,
        range: &'static str,
        value: String,
    },
    #[error("{0} is only supported by sync")]
    SyncOnly(&'static str),
    #[error("--backup-dir requires --delete")]
    BackupNeedsDelete,
    #[error("--storage-class cannot be used when downloading")]
    StorageClassOnDownload,
    #[error("invalid encryption settings: {0}")]
    Encryption(String),
    #[error("{flag} {path} must not be inside the local path being transferred")]
    InsideLocalPath { flag: &'static str, path: String },
    #[error("{0}")]
    Invalid(String),
}

fn out_of_range(flag: &'static str, range: &'static str, value: impl ToString) -> ValidationError {
    ValidationError::OutOfRange {
        flag,
        range,
        value: value.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct TransferOperation {
    pub command: Command,
    pub source: Location,
    pub destination: Location,
    pub kind: TransferKind,
    // selection
    pub recursive: bool,
    pub filters: FilterSettings,
    pub only_current_dir: bool,
    pub symlinks: SymlinkPolicy,
    pub skip_dir: bool,
    pub ignore_existing: bool,
    pub ignore_empty_file: bool,
    pub version_id: Option<String>,
    // concurrency
    pub routines: usize,
    pub thread_num: Option<usize>,
    pub part_size: u64,
    pub rate_limit: common::RateLimitConfig,
    // retry
    pub retry_num: u32,
    pub err_retry_num: u32,
    /// seconds, 0 picks a random 1-10s pause per retry
    pub err_retry_interval: u64,
    pub fail_fast: bool,
    // integrity
    pub disable_crc64: bool,
    pub disable_checksum: bool,
    // sync
    pub snapshot_path: Option<std::path::PathBuf>,
    pub delete: bool,
    pub backup_dir: Option<Location>,
    pub update: bool,
    pub move_source: bool,
    pub max_sync_entries: usize,
    // object attributes
    pub storage_class: Option<String>,
    pub acl: Option<String>,
    pub grants: Grants,
    pub tags: Option<String>,
    pub metadata: Metadata,
    pub encryption: Encryption,
    pub forbid_overwrite: bool,
    // output
    pub fail_output: Option<std::path::PathBuf>,
    pub process_log: Option<std::path::PathBuf>,
}

impl TransferOperation {
    /// Operation with default tunables for the given locations
    pub fn new(
        command: Command,
        source: Location,
        destination: Location,
    ) -> Result<Self, ValidationError> {
        let kind =
            TransferKind::between(&source, &destination).ok_or(ValidationError::LocalToLocal)?;
        Ok(Self {
            command,
            source,
            destination,
            kind,
            recursive: false,
            filters: FilterSettings::default(),
            only_current_dir: false,
            symlinks: SymlinkPolicy::Skip,
            skip_dir: false,
            ignore_existing: false,
            ignore_empty_file: false,
            version_id: None,
            routines: 3,
            thread_num: None,
            part_size: DEFAULT_PART_SIZE,
            rate_limit: common::RateLimitConfig::default(),
            retry_num: 0,
            err_retry_num: 5,
            err_retry_interval: 0,
            fail_fast: false,
            disable_crc64: false,
            disable_checksum: false,
            snapshot_path: None,
            delete: false,
            backup_dir: None,
            update: false,
            move_source: false,
            max_sync_entries: DEFAULT_MAX_SYNC_ENTRIES,
            storage_class: None,
            acl: None,
            grants: Grants::default(),
            tags: None,
            metadata: Metadata::default(),
            encryption: Encryption::None,
            forbid_overwrite: false,
            fail_output: None,
            process_log: None,
        })
    }

    pub fn is_sync(&self) -> bool {
        self.command == Command::Sync
    }

    /// The local side of the transfer, if any
    pub fn local_path(&self) -> Option<&std::path::Path> {
        self.source.as_local().or(self.destination.as_local())
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.move_source {
            if self.kind != TransferKind::Copy {
                return Err(ValidationError::MoveNeedsRemote);
            }
            if self.source == self.destination {
                return Err(ValidationError::MoveOntoItself);
            }
        }
        if !self.filters.is_empty() && !self.recursive {
            return Err(ValidationError::FiltersNeedRecursive);
        }
        if self.retry_num > 100 {
            return Err(out_of_range("--retry-num", "0..=100", self.retry_num));
        }
        if self.err_retry_num > 100 {
            return Err(out_of_range("--err-retry-num", "0..=100", self.err_retry_num));
        }
        if self.err_retry_interval > 10 {
            return Err(out_of_range(
                "--err-retry-interval",
                "0..=10",
                self.err_retry_interval,
            ));
        }
        if self.routines == 0 {
            return Err(out_of_range("--routines", "1..", self.routines));
        }
        if self.thread_num == Some(0) {
            return Err(out_of_range("--thread-num", "1..", 0));
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.part_size) {
            return Err(out_of_range(
                "--part-size",
                "1..=5120 MB",
                bytesize::ByteSize(self.part_size),
            ));
        }
        if self.max_sync_entries == 0 {
            return Err(out_of_range("--max-sync-entries", "1..", 0));
        }
        self.rate_limit
            .validate()
            .map_err(ValidationError::Invalid)?;
        if self.storage_class.is_some() && self.kind == TransferKind::Download {
            return Err(ValidationError::StorageClassOnDownload);
        }
        if self.version_id.is_some() && self.recursive {
            return Err(ValidationError::Invalid(
                "--version-id selects a single object and cannot be combined with --recursive"
                    .to_string(),
            ));
        }
        if !self.is_sync() {
            let sync_only = [
                (self.delete, "--delete"),
                (self.snapshot_path.is_some(), "--snapshot-path"),
                (self.update, "--update"),
                (self.ignore_existing, "--ignore-existing"),
                (self.backup_dir.is_some(), "--backup-dir"),
            ];
            if let Some((_, flag)) = sync_only.iter().find(|(set, _)| *set) {
                return Err(ValidationError::SyncOnly(*flag));
            }
        }
        if self.delete && !self.recursive {
            return Err(ValidationError::Invalid(
                "--delete mirrors a whole tree and requires --recursive".to_string(),
            ));
        }
        self.validate_backup_dir()?;
        self.validate_output_paths()
    }

    fn validate_backup_dir(&self) -> Result<(), ValidationError> {
        let Some(backup) = &self.backup_dir else {
            return Ok(());
        };
        if !self.delete {
            return Err(ValidationError::BackupNeedsDelete);
        }
        match (backup, &self.destination) {
            (Location::Local(backup), Location::Local(destination)) => {
                if is_within(backup, destination) {
                    return Err(ValidationError::InsideLocalPath {
                        flag: "--backup-dir",
                        path: backup.display().to_string(),
                    });
                }
                Ok(())
            }
            (Location::Remote { .. }, Location::Remote { .. }) => Ok(()),
            _ => Err(ValidationError::Invalid(
                "--backup-dir must be of the same kind (local or remote) as the destination"
                    .to_string(),
            )),
        }
    }

    fn validate_output_paths(&self) -> Result<(), ValidationError> {
        if !self.recursive {
            return Ok(());
        }
        let Some(local) = self.local_path() else {
            return Ok(());
        };
        let outputs = [
            ("--fail-output-path", &self.fail_output),
            ("--process-log-path", &self.process_log),
        ];
        for (flag, path) in outputs {
            if let Some(path) = path.as_ref().filter(|path| is_within(path, local)) {
                return Err(ValidationError::InsideLocalPath {
                    flag,
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically
pub fn normalize(path: &std::path::Path) -> std::path::PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = std::path::PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

pub fn is_within(child: &std::path::Path, parent: &std::path::Path) -> bool {
    normalize(child).starts_with(normalize(parent))
}

/// Parse `--meta`: `Header:value` pairs separated by `#`
///
/// Standard headers are recognised case-insensitively; `x-cos-meta-*` and `x-amz-meta-*` go to
/// the user metadata with the prefix removed.
pub fn parse_meta(value: &str) -> Result<Metadata, ValidationError> {
    let mut metadata = Metadata::default();
    for pair in value.split('#').filter(|pair| !pair.trim().is_empty()) {
        let (name, content) = pair.split_once(':').ok_or_else(|| {
            ValidationError::Invalid(format!("--meta entry '{pair}' is not in Name:value form"))
        })?;
        let name = name.trim().to_ascii_lowercase();
        let content = content.trim().to_string();
        match name.as_str() {
            "content-type" => metadata.content_type = Some(content),
            "cache-control" => metadata.cache_control = Some(content),
            "content-disposition" => metadata.content_disposition = Some(content),
            "content-encoding" => metadata.content_encoding = Some(content),
            "content-language" => metadata.content_language = Some(content),
            other => {
                let user = ["x-cos-meta-", "x-amz-meta-"]
                    .iter()
                    .find_map(|prefix| other.strip_prefix(prefix))
                    .filter(|user| !user.is_empty())
                    .ok_or_else(|| {
                        ValidationError::Invalid(format!("--meta: unsupported header '{other}'"))
                    })?;
                metadata.user.insert(user.to_string(), content);
            }
        }
    }
    Ok(metadata)
}

/// Check `--tags`: `k1=v1&k2=v2`
pub fn parse_tags(value: &str) -> Result<String, ValidationError> {
    for pair in value.split('&') {
        match pair.split_once('=') {
            Some((key, _)) if !key.is_empty() => {}
            _ => {
                return Err(ValidationError::Invalid(format!(
                    "--tags entry '{pair}' is not in key=value form"
                )));
            }
        }
    }
    Ok(value.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct EncryptionArgs {
    pub encryption_type: Option<String>,
    pub server_side_encryption: Option<String>,
    pub sse_customer_algo: Option<String>,
    pub sse_customer_key: Option<String>,
    pub sse_customer_key_md5: Option<String>,
}

pub fn parse_encryption(args: &EncryptionArgs) -> Result<Encryption, ValidationError> {
    match args.encryption_type.as_deref().unwrap_or("") {
        "" => Ok(Encryption::None),
        "SSE-COS" | "SSE-S3" => Ok(Encryption::ServerManaged {
            algorithm: args
                .server_side_encryption
                .clone()
                .unwrap_or_else(|| "AES256".to_string()),
        }),
        "SSE-C" => {
            let (Some(key), Some(key_md5)) = (&args.sse_customer_key, &args.sse_customer_key_md5)
            else {
                return Err(ValidationError::Encryption(
                    "SSE-C needs --sse-customer-key and --sse-customer-key-md5".to_string(),
                ));
            };
            Ok(Encryption::CustomerKey {
                algorithm: args
                    .sse_customer_algo
                    .clone()
                    .unwrap_or_else(|| "AES256".to_string()),
                key: key.clone(),
                key_md5: key_md5.clone(),
            })
        }
        other => Err(ValidationError::Encryption(format!(
            "unknown encryption type '{other}', expected SSE-COS or SSE-C"
        ))),
    }
}
