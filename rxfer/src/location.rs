//! Source and destination addressing
//!
//! A location is either a local path or a `s3://bucket/key` object address (`cos://` is accepted
//! as an alias). The pair of locations given to a command selects the transfer kind.

use anyhow::anyhow;

/// Recognised remote schemes
pub const SCHEMES: [&str; 2] = ["s3://", "cos://"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Local(std::path::PathBuf),
    Remote { bucket: String, key: String },
}

impl Location {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        let Some(rest) = SCHEMES
            .iter()
            .find_map(|scheme| value.strip_prefix(scheme))
        else {
            if value.is_empty() {
                return Err(anyhow!("empty path"));
            }
            return Ok(Location::Local(std::path::PathBuf::from(value)));
        };
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(anyhow!("missing bucket name in {value}"));
        }
        Ok(Location::Remote {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    pub fn as_local(&self) -> Option<&std::path::Path> {
        match self {
            Location::Local(path) => Some(path),
            Location::Remote { .. } => None,
        }
    }

    pub fn as_remote(&self) -> Option<(&str, &str)> {
        match self {
            Location::Remote { bucket, key } => Some((bucket, key)),
            Location::Local(_) => None,
        }
    }

    /// Whether the location names a directory-like container rather than a single item
    pub fn has_trailing_separator(&self) -> bool {
        match self {
            Location::Local(path) => {
                let text = path.as_os_str().to_string_lossy();
                text.ends_with(std::path::MAIN_SEPARATOR) || text.ends_with('/')
            }
            Location::Remote { key, .. } => key.is_empty() || key.ends_with('/'),
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { bucket, key } => write!(f, "s3://{bucket}/{key}"),
        }
    }
}

/// Behaviour selected by the kinds of the source and destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Upload,
    Download,
    Copy,
}

impl TransferKind {
    /// `None` for local to local, which is not a transfer this tool performs
    pub fn between(source: &Location, destination: &Location) -> Option<Self> {
        match (source.is_remote(), destination.is_remote()) {
            (false, true) => Some(TransferKind::Upload),
            (true, false) => Some(TransferKind::Download),
            (true, true) => Some(TransferKind::Copy),
            (false, false) => None,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            TransferKind::Upload => "Upload",
            TransferKind::Download => "Download",
            TransferKind::Copy => "Copy",
        }
    }
}

/// Key used as a directory prefix: empty or ending with `/`
pub fn dir_key(key: &str) -> String {
    if key.is_empty() || key.ends_with('/') {
        key.to_string()
    } else {
        format!("{key}/")
    }
}
