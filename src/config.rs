//! Environment configuration loader and validator for the GitLab→Notion sync job.
use thiserror::Error;

use crate::gitlab::MergeRequestFilter;

/// Default Notion API version sent in the `Notion-Version` header.
pub const DEFAULT_NOTION_VERSION: &str = "2022-06-28";
/// Default name of the Notion title property holding the sync key.
pub const DEFAULT_KEY_PROPERTY: &str = "MR ID";
/// Default GitLab instance when `GITLAB_BASE_URL` is unset.
pub const DEFAULT_GITLAB_BASE_URL: &str = "https://gitlab.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Resolved configuration for one sync run, immutable after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub gitlab: GitlabSettings,
    pub notion: NotionSettings,
    pub app: AppSettings,
}

/// GitLab API settings and record filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitlabSettings {
    pub base_url: String,
    pub token: String,
    pub author_username: Option<String>,
    pub project_id: Option<String>,
}

/// Notion API settings and target database mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotionSettings {
    pub token: String,
    pub version: String,
    pub database_id: String,
    pub key_property: String,
}

/// App-level settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub environment: String,
}

impl Config {
    /// Load configuration from environment variables.
    /// Loads `.env` if present, then reads the variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary lookup function. Tests use this
    /// to avoid mutating process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let get_or = |key: &str, default: &str| -> String {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| default.to_owned())
        };
        let get_opt =
            |key: &str| -> Option<String> { lookup(key).filter(|v| !v.trim().is_empty()) };

        let cfg = Config {
            gitlab: GitlabSettings {
                base_url: get_or("GITLAB_BASE_URL", DEFAULT_GITLAB_BASE_URL),
                token: get("GITLAB_TOKEN")?,
                author_username: get_opt("GITLAB_AUTHOR_USERNAME"),
                project_id: get_opt("GITLAB_PROJECT_ID"),
            },
            notion: NotionSettings {
                token: get("NOTION_TOKEN")?,
                version: get_or("NOTION_VERSION", DEFAULT_NOTION_VERSION),
                database_id: get("NOTION_DATABASE_ID")?,
                key_property: get_or("NOTION_MR_KEY_PROPERTY", DEFAULT_KEY_PROPERTY),
            },
            app: AppSettings {
                environment: get_or("APP_ENV", "development"),
            },
        };
        validate(&cfg)?;
        Ok(cfg)
    }

    /// Build the merge request filter from the configured dimensions.
    /// An author filter may additionally be scoped to one project.
    pub fn filter(&self) -> MergeRequestFilter {
        match (&self.gitlab.author_username, &self.gitlab.project_id) {
            (Some(username), project) => MergeRequestFilter::Author {
                username: username.clone(),
                project: project.clone(),
            },
            (None, Some(project)) => MergeRequestFilter::Project {
                id: project.clone(),
            },
            // validate() rejects this combination at load time.
            (None, None) => unreachable!("config validated without a filter dimension"),
        }
    }
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.gitlab.author_username.is_none() && cfg.gitlab.project_id.is_none() {
        return Err(ConfigError::Invalid(
            "at least one of GITLAB_AUTHOR_USERNAME or GITLAB_PROJECT_ID must be set",
        ));
    }
    Ok(())
}
