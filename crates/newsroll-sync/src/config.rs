use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use newsroll_core::{parse_timezone, DEFAULT_REFERENCE_TIMEZONE};
use newsroll_feed::{ImageDimensions, DEFAULT_FEED_BASE_URL};
use newsroll_storage::BackoffPolicy;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub api_keys: Vec<String>,
    pub feed_base_url: String,
    pub reference_timezone: String,
    pub http_timeout_secs: u64,
    pub target_articles: usize,
    pub max_requests: usize,
    pub user_agent: String,
    pub registration_settle_ms: u64,
    pub web_port: u16,
    pub workspace_root: PathBuf,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("NEWSROLL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            api_keys: std::env::var("NEWSDATA_API_KEYS")
                .map(|v| parse_key_pool(&v))
                .unwrap_or_default(),
            feed_base_url: std::env::var("NEWSDATA_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_FEED_BASE_URL.to_string()),
            reference_timezone: std::env::var("NEWSROLL_TIMEZONE")
                .unwrap_or_else(|_| DEFAULT_REFERENCE_TIMEZONE.to_string()),
            http_timeout_secs: env_parse("NEWSROLL_HTTP_TIMEOUT_SECS", 60),
            target_articles: env_parse("NEWSROLL_TARGET_ARTICLES", 20),
            max_requests: env_parse("NEWSROLL_MAX_REQUESTS", 15),
            user_agent: std::env::var("NEWSROLL_USER_AGENT")
                .unwrap_or_else(|_| "newsroll/0.1".to_string()),
            registration_settle_ms: env_parse("NEWSROLL_REGISTRATION_SETTLE_MS", 2000),
            web_port: env_parse("NEWSROLL_WEB_PORT", 8000),
            workspace_root: std::env::var("NEWSROLL_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn registration_settle(&self) -> Duration {
        Duration::from_millis(self.registration_settle_ms)
    }

    pub fn refresh_config(&self, rules: FeedRules) -> Result<RefreshConfig> {
        let reference = parse_timezone(&self.reference_timezone)
            .context("resolving NEWSROLL_TIMEZONE")?;
        Ok(RefreshConfig {
            reference,
            fetch: FetchLoopConfig {
                target_valid: self.target_articles,
                max_requests: self.max_requests,
                request_timeout: Duration::from_secs(self.http_timeout_secs),
                allowed_languages: rules.allowed_languages,
                min_image: rules.min_image,
                backoff: BackoffPolicy::default(),
            },
        })
    }
}

pub fn parse_key_pool(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Content acceptance rules, read from `rules/feed.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedRules {
    #[allow(dead_code)]
    #[serde(default)]
    version: u32,
    #[serde(default = "default_languages")]
    pub allowed_languages: Vec<String>,
    #[serde(default = "default_min_image")]
    pub min_image: ImageDimensions,
}

fn default_languages() -> Vec<String> {
    ["english", "italian", "finnish"]
        .into_iter()
        .map(ToString::to_string)
        .collect()
}

fn default_min_image() -> ImageDimensions {
    ImageDimensions {
        width: 320,
        height: 200,
    }
}

impl Default for FeedRules {
    fn default() -> Self {
        Self {
            version: 1,
            allowed_languages: default_languages(),
            min_image: default_min_image(),
        }
    }
}

impl FeedRules {
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("feed.yaml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct FetchLoopConfig {
    pub target_valid: usize,
    pub max_requests: usize,
    pub request_timeout: Duration,
    pub allowed_languages: Vec<String>,
    pub min_image: ImageDimensions,
    pub backoff: BackoffPolicy,
}

impl Default for FetchLoopConfig {
    fn default() -> Self {
        let rules = FeedRules::default();
        Self {
            target_valid: 20,
            max_requests: 15,
            request_timeout: Duration::from_secs(60),
            allowed_languages: rules.allowed_languages,
            min_image: rules.min_image,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl FetchLoopConfig {
    pub fn allows_language(&self, language: Option<&str>) -> bool {
        language.is_some_and(|lang| {
            self.allowed_languages
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(lang.trim()))
        })
    }
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub reference: Tz,
    pub fetch: FetchLoopConfig,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            reference: chrono_tz::Europe::Helsinki,
            fetch: FetchLoopConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_pool_ignores_blanks() {
        assert_eq!(parse_key_pool(" k1, ,k2,,"), vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn rules_fall_back_to_defaults_when_missing() {
        let dir = tempdir().expect("tempdir");
        let rules = FeedRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules.allowed_languages.len(), 3);
        assert_eq!(rules.min_image.width, 320);
    }

    #[test]
    fn rules_load_from_yaml() {
        let dir = tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("rules")).unwrap();
        std::fs::write(
            dir.path().join("rules/feed.yaml"),
            "version: 1\nallowed_languages: [english]\nmin_image:\n  width: 640\n  height: 360\n",
        )
        .unwrap();
        let rules = FeedRules::from_workspace_root(dir.path()).unwrap();
        assert_eq!(rules.allowed_languages, vec!["english".to_string()]);
        assert_eq!(rules.min_image.height, 360);
    }

    #[test]
    fn repository_rules_file_parses() {
        let root = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
        let rules = FeedRules::from_workspace_root(&root).unwrap();
        assert!(rules.allowed_languages.contains(&"finnish".to_string()));
    }

    #[test]
    fn language_check_is_case_insensitive() {
        let config = FetchLoopConfig::default();
        assert!(config.allows_language(Some("English")));
        assert!(!config.allows_language(Some("german")));
        assert!(!config.allows_language(None));
    }
}
