//! `tallyset.toml` configuration and the feed factory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use tallyset_core::aggregate::AggregatorConfig;
use tallyset_core::cache::CachePolicy;
use tallyset_core::fetch::{AdaptiveFetcher, RetryPolicy};
use tallyset_core::merge::IdentityConfig;
use tallyset_core::model::SourceTag;
use tallyset_core::traits::SubmissionFeed;

use crate::feed::DualSourceFeed;
use crate::jotform::{parse_utc_offset, JotformClient};
use crate::mock::MockPageSource;
use crate::qualtrics::{ExportPolicy, QualtricsClient};

/// Configuration for one remote back-end.
///
/// Note: Custom Debug impl masks API keys to prevent accidental exposure in logs.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    Jotform {
        api_key: String,
        form_id: String,
        #[serde(default)]
        base_url: Option<String>,
        /// Offset of the account timezone, e.g. `+08:00`; UTC when absent.
        #[serde(default)]
        utc_offset: Option<String>,
    },
    Qualtrics {
        api_key: String,
        survey_id: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        export: ExportPolicy,
    },
    /// Submissions read from a local JSON file.
    File { path: PathBuf },
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceConfig::Jotform {
                api_key: _,
                form_id,
                base_url,
                utc_offset,
            } => f
                .debug_struct("Jotform")
                .field("api_key", &"***")
                .field("form_id", form_id)
                .field("base_url", base_url)
                .field("utc_offset", utc_offset)
                .finish(),
            SourceConfig::Qualtrics {
                api_key: _,
                survey_id,
                base_url,
                export,
            } => f
                .debug_struct("Qualtrics")
                .field("api_key", &"***")
                .field("survey_id", survey_id)
                .field("base_url", base_url)
                .field("export", export)
                .finish(),
            SourceConfig::File { path } => f.debug_struct("File").field("path", path).finish(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub primary: Option<SourceConfig>,
    #[serde(default)]
    pub secondary: Option<SourceConfig>,
}

/// Adaptive fetch tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub baseline: usize,
    pub floor: usize,
    pub reductions: Vec<f64>,
    pub recovery_successes: u32,
    pub page_delay_ms: u64,
    pub retry_delay_ms: u64,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            baseline: policy.baseline,
            floor: policy.floor,
            reductions: policy.reductions,
            recovery_successes: policy.recovery_successes,
            page_delay_ms: policy.page_delay.as_millis() as u64,
            retry_delay_ms: policy.retry_delay.as_millis() as u64,
            timeout_secs: 30,
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let policy = RetryPolicy {
            baseline: self.baseline,
            reductions: self.reductions.clone(),
            floor: self.floor,
            recovery_successes: self.recovery_successes,
            page_delay: Duration::from_millis(self.page_delay_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        };
        policy.validate().context("invalid [fetch] settings")?;
        Ok(policy)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Zero means entries never expire.
    pub ttl_secs: u64,
    pub version: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.tallyset-cache"),
            ttl_secs: 0,
            version: CachePolicy::default().version,
        }
    }
}

impl CacheConfig {
    pub fn policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(self.ttl_secs),
            version: self.version.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub parallelism: usize,
    pub include_orphans: bool,
    pub identity_field: String,
    pub identity_prefix: String,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        let aggregator = AggregatorConfig::default();
        let identity = IdentityConfig::default();
        Self {
            parallelism: aggregator.parallelism,
            include_orphans: aggregator.include_orphans,
            identity_field: identity.field,
            identity_prefix: identity.prefix,
        }
    }
}

impl AggregateConfig {
    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            parallelism: self.parallelism.max(1),
            include_orphans: self.include_orphans,
        }
    }

    pub fn identity(&self) -> IdentityConfig {
        IdentityConfig {
            field: self.identity_field.clone(),
            prefix: self.identity_prefix.clone(),
        }
    }
}

/// Locations of the catalogue, field map, roster and JotForm question map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    pub catalogue: PathBuf,
    pub field_map: PathBuf,
    pub roster: PathBuf,
    pub question_map: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            catalogue: PathBuf::from("catalogue.toml"),
            field_map: PathBuf::from("field-map.toml"),
            roster: PathBuf::from("roster.json"),
            question_map: PathBuf::from("jotform-questions.json"),
        }
    }
}

/// Top-level tallyset configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TallysetConfig {
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub files: FilesConfig,
}

impl TallysetConfig {
    /// Resolve relative file, cache and source paths against `base`.
    pub fn rebase(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.cache.dir);
        join(&mut self.files.catalogue);
        join(&mut self.files.field_map);
        join(&mut self.files.roster);
        join(&mut self.files.question_map);
        for source in [&mut self.sources.primary, &mut self.sources.secondary]
            .into_iter()
            .flatten()
        {
            if let SourceConfig::File { path } = source {
                join(path);
            }
        }
    }
}

/// Resolve environment variable references like `${VAR_NAME}` in a string.
fn resolve_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    while let Some(start) = result.find("${") {
        let Some(end) = result[start..].find('}') else {
            break;
        };
        let var_name = &result[start + 2..start + end];
        let value = std::env::var(var_name).unwrap_or_default();
        result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
    }
    result
}

fn resolve_source_config(config: &mut SourceConfig) {
    match config {
        SourceConfig::Jotform {
            api_key,
            form_id,
            base_url,
            utc_offset,
        } => {
            *api_key = resolve_env_vars(api_key);
            *form_id = resolve_env_vars(form_id);
            for value in [base_url, utc_offset].into_iter().flatten() {
                *value = resolve_env_vars(value);
            }
        }
        SourceConfig::Qualtrics {
            api_key,
            survey_id,
            base_url,
            ..
        } => {
            *api_key = resolve_env_vars(api_key);
            *survey_id = resolve_env_vars(survey_id);
            if let Some(url) = base_url {
                *url = resolve_env_vars(url);
            }
        }
        SourceConfig::File { .. } => {}
    }
}

/// Load configuration from well-known paths.
///
/// Search order:
/// 1. `tallyset.toml` in the current directory
/// 2. `~/.config/tallyset/config.toml`
///
/// Environment variable overrides: `TALLYSET_JOTFORM_KEY`, `TALLYSET_QUALTRICS_KEY`.
pub fn load_config() -> Result<TallysetConfig> {
    load_config_from(None)
}

/// Load config from an explicit path, or search the default locations.
///
/// Relative paths inside a config file are taken relative to that file.
pub fn load_config_from(path: Option<&Path>) -> Result<TallysetConfig> {
    let config_path = match path {
        Some(p) if p.exists() => Some(p.to_path_buf()),
        Some(p) => anyhow::bail!("config file not found: {}", p.display()),
        None => {
            let local = PathBuf::from("tallyset.toml");
            if local.exists() {
                Some(local)
            } else {
                dirs_path()
                    .map(|home| home.join("config.toml"))
                    .filter(|global| global.exists())
            }
        }
    };

    let mut config = match &config_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config: {}", path.display()))?;
            let mut config = toml::from_str::<TallysetConfig>(&content)
                .with_context(|| format!("failed to parse config: {}", path.display()))?;
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                config.rebase(dir);
            }
            config
        }
        None => TallysetConfig::default(),
    };

    // Apply env var overrides
    if let Ok(key) = std::env::var("TALLYSET_JOTFORM_KEY") {
        if let Some(SourceConfig::Jotform { api_key, .. }) = config.sources.primary.as_mut() {
            *api_key = key;
        }
    }
    if let Ok(key) = std::env::var("TALLYSET_QUALTRICS_KEY") {
        if let Some(SourceConfig::Qualtrics { api_key, .. }) = config.sources.secondary.as_mut() {
            *api_key = key;
        }
    }

    for source in [&mut config.sources.primary, &mut config.sources.secondary]
        .into_iter()
        .flatten()
    {
        resolve_source_config(source);
    }

    tracing::debug!(path = ?config_path, "configuration loaded");
    Ok(config)
}

fn dirs_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".config").join("tallyset"))
}

fn jotform_client(config: &SourceConfig, fetch: &FetchConfig) -> Result<Option<JotformClient>> {
    let SourceConfig::Jotform {
        api_key,
        form_id,
        base_url,
        utc_offset,
    } = config
    else {
        return Ok(None);
    };
    anyhow::ensure!(!api_key.is_empty(), "JotForm api_key is empty");
    let mut client = JotformClient::new(api_key, form_id, base_url.clone(), fetch.timeout())?;
    if let Some(offset) = utc_offset {
        client = client.with_utc_offset(parse_utc_offset(offset)?);
    }
    Ok(Some(client))
}

/// The JotForm client of the primary source, for lookups and question maps.
pub fn create_jotform_client(config: &TallysetConfig) -> Result<JotformClient> {
    let primary = config
        .sources
        .primary
        .as_ref()
        .context("no [sources.primary] configured")?;
    jotform_client(primary, &config.fetch)?
        .context("[sources.primary] is not a JotForm source")
}

/// Create the feed for one source slot.
pub fn create_source_feed(
    config: &SourceConfig,
    tag: SourceTag,
    fetch: &FetchConfig,
) -> Result<Arc<dyn SubmissionFeed>> {
    let feed: Arc<dyn SubmissionFeed> = match config {
        SourceConfig::Jotform { .. } => {
            let client = jotform_client(config, fetch)?.context("expected a JotForm source")?;
            Arc::new(AdaptiveFetcher::new(Arc::new(client), fetch.retry_policy()?))
        }
        SourceConfig::Qualtrics {
            api_key,
            survey_id,
            base_url,
            export,
        } => {
            anyhow::ensure!(!api_key.is_empty(), "Qualtrics api_key is empty");
            Arc::new(QualtricsClient::new(
                api_key,
                survey_id,
                base_url.clone(),
                fetch.timeout(),
                export.clone(),
            )?)
        }
        SourceConfig::File { path } => {
            let source = MockPageSource::from_json_file(tag, path)?;
            Arc::new(AdaptiveFetcher::new(Arc::new(source), fetch.retry_policy()?))
        }
    };
    Ok(feed)
}

/// Build the dual-source feed described by `config`.
pub fn create_feed(config: &TallysetConfig) -> Result<DualSourceFeed> {
    let primary = config
        .sources
        .primary
        .as_ref()
        .context("no [sources.primary] configured")?;
    let primary = create_source_feed(primary, SourceTag::Primary, &config.fetch)?;
    let secondary = config
        .sources
        .secondary
        .as_ref()
        .map(|s| create_source_feed(s, SourceTag::Secondary, &config.fetch))
        .transpose()?;
    Ok(DualSourceFeed::new(primary, secondary))
}
