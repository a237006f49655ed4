//! Credential resolution and client construction
//!
//! Credentials are resolved with a fixed precedence, highest first:
//!
//! 1. per-invocation values (command line flags or `RXFER_*` environment variables)
//! 2. temporary credentials obtained for the configured role
//! 3. static credentials from the profile file
//!
//! An explicit secret id or key discards any session token coming from a lower level so that
//! credentials from different sources are never mixed.

use crate::s3::{S3Store, S3StoreConfig};
use crate::{Error, Result};
use aws_config::{BehaviorVersion, SdkConfig, retry::RetryConfig, timeout::TimeoutConfig};
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sdk_s3::config::{
    Region, RequestChecksumCalculation, ResponseChecksumValidation,
    StalledStreamProtectionConfig,
};

const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthMode {
    #[default]
    SecretKey,
    /// temporary credentials from the environment's default provider chain
    Role,
}

/// Contents of the JSON profile file
#[derive(Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Profile {
    pub secret_id: String,
    pub secret_key: String,
    pub session_token: String,
    pub region: String,
    pub endpoint: Option<String>,
    /// endpoint used once the primary one stops answering
    pub fallback_endpoint: Option<String>,
    pub mode: AuthMode,
    /// automatic host switching is only enabled when this is explicitly `false`
    pub close_auto_switch_host: Option<bool>,
    pub path_style: bool,
    pub hierarchical_buckets: Vec<String>,
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("fallback_endpoint", &self.fallback_endpoint)
            .field("mode", &self.mode)
            .field("close_auto_switch_host", &self.close_auto_switch_host)
            .field("path_style", &self.path_style)
            .field("hierarchical_buckets", &self.hierarchical_buckets)
            .finish()
    }
}

impl Profile {
    /// `~/.rxfer.json`
    pub fn default_path() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(|home| std::path::PathBuf::from(home).join(".rxfer.json"))
    }

    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|err| Error::Invalid(format!("malformed profile: {err}")))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::io(format!("failed reading profile {}", path.display()), err))?;
        Self::parse(&content)
    }

    /// Load the profile if it exists, fall back to an empty one otherwise
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(path) if path.exists() => Self::load(path),
            Some(path) => {
                tracing::debug!("profile {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    pub fn region(&self) -> &str {
        if self.region.is_empty() {
            DEFAULT_REGION
        } else {
            &self.region
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
    pub session_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Credentials given for this invocation only
#[derive(Clone, Default)]
pub struct ExplicitCredentials {
    pub secret_id: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
}

impl ExplicitCredentials {
    /// Fill gaps left by the command line from `RXFER_SECRET_ID`, `RXFER_SECRET_KEY` and
    /// `RXFER_SESSION_TOKEN`
    pub fn with_env(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
        self.secret_id = self.secret_id.or_else(|| var("RXFER_SECRET_ID"));
        self.secret_key = self.secret_key.or_else(|| var("RXFER_SECRET_KEY"));
        self.session_token = self.session_token.or_else(|| var("RXFER_SESSION_TOKEN"));
        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

/// Combine the credential sources, see the module docs for the precedence
pub fn resolve_credentials(
    profile: &Profile,
    role: Option<Credentials>,
    explicit: &ExplicitCredentials,
) -> Result<Credentials> {
    let mut credentials = match profile.mode {
        AuthMode::Role => role.ok_or_else(|| {
            Error::Credentials("profile uses role mode but no role credentials are available".into())
        })?,
        AuthMode::SecretKey => Credentials {
            secret_id: profile.secret_id.clone(),
            secret_key: profile.secret_key.clone(),
            session_token: non_empty(&profile.session_token),
        },
    };
    if explicit.secret_id.is_some() || explicit.secret_key.is_some() {
        credentials.session_token = None;
    }
    if let Some(secret_id) = &explicit.secret_id {
        credentials.secret_id = secret_id.clone();
    }
    if let Some(secret_key) = &explicit.secret_key {
        credentials.secret_key = secret_key.clone();
    }
    if let Some(token) = &explicit.session_token {
        credentials.session_token = Some(token.clone());
    }
    if credentials.secret_id.is_empty() || credentials.secret_key.is_empty() {
        return Err(Error::Credentials(
            "secret id and secret key are required, set them in the profile, with \
             --secret-id/--secret-key or through RXFER_SECRET_ID/RXFER_SECRET_KEY"
                .into(),
        ));
    }
    Ok(credentials)
}

/// Temporary credentials from the default provider chain (instance role, web identity, ...)
pub async fn role_credentials() -> Result<Credentials> {
    let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let provider = config
        .credentials_provider()
        .ok_or_else(|| Error::Credentials("no role credential provider available".into()))?;
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|err| Error::Credentials(format!("failed to obtain role credentials: {err}")))?;
    Ok(Credentials {
        secret_id: credentials.access_key_id().to_string(),
        secret_key: credentials.secret_access_key().to_string(),
        session_token: credentials.session_token().map(str::to_string),
    })
}

/// Run settings that shape the client
#[derive(Debug, Clone, Default)]
pub struct PolicyInputs {
    pub routines: usize,
    pub long_links_nums: usize,
    pub disable_long_links: bool,
    pub retry_num: u32,
    pub err_retry_num: u32,
    pub err_retry_interval: u64,
    pub close_auto_switch_host: Option<bool>,
    pub disable_checksum: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientPolicy {
    /// simultaneous requests per client, `None` when long-lived connections are disabled
    pub pool_size: Option<usize>,
    pub retry_attempts: u32,
    pub retry_interval: std::time::Duration,
    pub auto_switch_host: bool,
    pub throttle_retries: u32,
    pub request_checksums: bool,
}

impl ClientPolicy {
    pub fn new(inputs: &PolicyInputs) -> Self {
        let pool_size = match (inputs.disable_long_links, inputs.long_links_nums) {
            (true, _) => None,
            (false, 0) => Some(inputs.routines.max(1)),
            (false, nums) => Some(nums),
        };
        let (retry_attempts, retry_interval) = match inputs.err_retry_num {
            0 => (10, 1),
            n => (n, inputs.err_retry_interval.max(1)),
        };
        Self {
            pool_size,
            retry_attempts,
            retry_interval: std::time::Duration::from_secs(retry_interval),
            auto_switch_host: inputs.close_auto_switch_host == Some(false),
            throttle_retries: inputs.retry_num,
            request_checksums: !inputs.disable_checksum,
        }
    }

    fn client(
        &self,
        credentials: &Credentials,
        profile: &Profile,
        endpoint: Option<&str>,
    ) -> aws_sdk_s3::Client {
        let timeout = TimeoutConfig::builder()
            .connect_timeout(std::time::Duration::from_secs(180))
            .read_timeout(std::time::Duration::from_secs(180))
            .build();
        let mut shared = SdkConfig::builder()
            .credentials_provider(SharedCredentialsProvider::new(
                aws_credential_types::Credentials::new(
                    credentials.secret_id.clone(),
                    credentials.secret_key.clone(),
                    credentials.session_token.clone(),
                    None,
                    "rxfer",
                ),
            ))
            .region(Region::new(profile.region().to_string()))
            .behavior_version(BehaviorVersion::latest())
            .timeout_config(timeout)
            .retry_config(
                RetryConfig::standard()
                    .with_max_attempts(self.retry_attempts)
                    .with_initial_backoff(self.retry_interval),
            )
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled());
        if let Some(endpoint) = endpoint {
            shared = shared.endpoint_url(endpoint);
        }
        let shared = shared.build();
        let mut builder =
            aws_sdk_s3::config::Builder::from(&shared).force_path_style(profile.path_style);
        if !self.request_checksums {
            builder = builder
                .request_checksum_calculation(RequestChecksumCalculation::WhenRequired)
                .response_checksum_validation(ResponseChecksumValidation::WhenRequired);
        }
        aws_sdk_s3::Client::from_conf(builder.build())
    }

    /// Build the store every worker of this run shares
    pub fn connect(&self, credentials: &Credentials, profile: &Profile) -> S3Store {
        let primary = self.client(credentials, profile, profile.endpoint.as_deref());
        let fallback = match (self.auto_switch_host, profile.fallback_endpoint.as_deref()) {
            (true, Some(endpoint)) => Some(self.client(credentials, profile, Some(endpoint))),
            (true, None) => {
                tracing::warn!("automatic host switching requested but no fallback endpoint set");
                None
            }
            (false, _) => None,
        };
        tracing::info!(
            "client: region {}, pool {:?}, {} attempts, host switching {}",
            profile.region(),
            self.pool_size,
            self.retry_attempts,
            fallback.is_some()
        );
        S3Store::new(
            primary,
            fallback,
            S3StoreConfig {
                pool_size: self.pool_size,
                throttle_retries: self.throttle_retries,
                hierarchical_buckets: profile.hierarchical_buckets.clone(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile {
            secret_id: "cfg-id".to_string(),
            secret_key: "cfg-key".to_string(),
            session_token: "cfg-token".to_string(),
            ..Default::default()
        }
    }

    fn role() -> Credentials {
        Credentials {
            secret_id: "role-id".to_string(),
            secret_key: "role-key".to_string(),
            session_token: Some("role-token".to_string()),
        }
    }

    #[test]
    fn configured_credentials_by_default() {
        let creds =
            resolve_credentials(&profile(), Some(role()), &ExplicitCredentials::default()).unwrap();
        assert_eq!(creds.secret_id, "cfg-id");
        assert_eq!(creds.session_token.as_deref(), Some("cfg-token"));
    }

    #[test]
    fn role_overrides_configured() {
        let mut profile = profile();
        profile.mode = AuthMode::Role;
        let creds =
            resolve_credentials(&profile, Some(role()), &ExplicitCredentials::default()).unwrap();
        assert_eq!(creds, role());
        assert!(resolve_credentials(&profile, None, &ExplicitCredentials::default()).is_err());
    }

    #[test]
    fn explicit_keys_drop_the_session_token() {
        let mut profile = profile();
        profile.mode = AuthMode::Role;
        let explicit = ExplicitCredentials {
            secret_id: Some("cli-id".to_string()),
            secret_key: Some("cli-key".to_string()),
            session_token: None,
        };
        let creds = resolve_credentials(&profile, Some(role()), &explicit).unwrap();
        assert_eq!(creds.secret_id, "cli-id");
        assert_eq!(creds.secret_key, "cli-key");
        assert_eq!(creds.session_token, None);
    }

    #[test]
    fn explicit_token_wins() {
        let explicit = ExplicitCredentials {
            secret_id: Some("cli-id".to_string()),
            secret_key: None,
            session_token: Some("cli-token".to_string()),
        };
        let creds = resolve_credentials(&profile(), None, &explicit).unwrap();
        assert_eq!(creds.secret_key, "cfg-key");
        assert_eq!(creds.session_token.as_deref(), Some("cli-token"));
    }

    #[test]
    fn missing_keys_are_rejected() {
        let err = resolve_credentials(&Profile::default(), None, &ExplicitCredentials::default())
            .unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
    }

    #[test]
    fn secrets_are_not_printed() {
        let text = format!("{:?} {:?}", profile(), role());
        assert!(!text.contains("cfg-key"));
        assert!(!text.contains("role-key"));
        assert!(!text.contains("role-token"));
    }

    #[test]
    fn pool_follows_routines_unless_overridden() {
        let mut inputs = PolicyInputs {
            routines: 3,
            ..Default::default()
        };
        assert_eq!(ClientPolicy::new(&inputs).pool_size, Some(3));
        inputs.long_links_nums = 64;
        assert_eq!(ClientPolicy::new(&inputs).pool_size, Some(64));
        inputs.disable_long_links = true;
        assert_eq!(ClientPolicy::new(&inputs).pool_size, None);
    }

    #[test]
    fn retry_settings() {
        let mut inputs = PolicyInputs::default();
        let policy = ClientPolicy::new(&inputs);
        assert_eq!(policy.retry_attempts, 10);
        assert_eq!(policy.retry_interval, std::time::Duration::from_secs(1));
        inputs.err_retry_num = 5;
        inputs.err_retry_interval = 0;
        let policy = ClientPolicy::new(&inputs);
        assert_eq!(policy.retry_attempts, 5);
        assert_eq!(policy.retry_interval, std::time::Duration::from_secs(1));
        inputs.err_retry_interval = 4;
        assert_eq!(
            ClientPolicy::new(&inputs).retry_interval,
            std::time::Duration::from_secs(4)
        );
    }

    #[test]
    fn host_switching_needs_explicit_opt_in() {
        let mut inputs = PolicyInputs::default();
        assert!(!ClientPolicy::new(&inputs).auto_switch_host);
        inputs.close_auto_switch_host = Some(true);
        assert!(!ClientPolicy::new(&inputs).auto_switch_host);
        inputs.close_auto_switch_host = Some(false);
        assert!(ClientPolicy::new(&inputs).auto_switch_host);
    }

    #[test]
    fn profile_from_json() {
        let profile = Profile::parse(
            r#"{"secret_id":"id","secret_key":"key","region":"eu-west-1",
                "endpoint":"http://localhost:9000","mode":"Role","path_style":true}"#,
        )
        .unwrap();
        assert_eq!(profile.mode, AuthMode::Role);
        assert_eq!(profile.region(), "eu-west-1");
        assert!(profile.path_style);
        assert!(Profile::parse("{not json").is_err());
        assert_eq!(Profile::default().region(), DEFAULT_REGION);
    }
}
