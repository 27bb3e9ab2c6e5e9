//! Configuration of a cache coordinator instance

use crate::constants::{AUTO_GROUP, DEFAULT_PAGE_SIZE, DIRECT_GROUP};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Main configuration structure for one model instance
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Service root; request URLs are relative to it
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Group for reads when the caller passes none
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Group for writes when the caller passes none
    #[serde(default = "default_group_id")]
    pub update_group_id: String,

    /// Submit mode per application group
    #[serde(default)]
    pub groups: HashMap<String, SubmitMode>,

    /// Add `$count=true` to collection reads
    #[serde(default)]
    pub request_count: bool,

    /// Send `If-Match: *` instead of the cached ETag
    #[serde(default)]
    pub ignore_etags: bool,

    /// Default `$top` of collection reads
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            group_id: default_group_id(),
            update_group_id: default_group_id(),
            groups: HashMap::new(),
            request_count: false,
            ignore_etags: false,
            page_size: default_page_size(),
        }
    }
}

/// When the requests of a group leave the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    /// Wait for an explicit `submit_batch`
    Api,
    /// Collect everything enqueued in one tick, then send
    Auto,
    /// Send every request immediately and alone
    Direct,
}

impl FromStr for SubmitMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "api" => Ok(SubmitMode::Api),
            "auto" => Ok(SubmitMode::Auto),
            "direct" => Ok(SubmitMode::Direct),
            other => anyhow::bail!("Unknown submit mode: {}", other),
        }
    }
}

// Default value functions for serde
fn default_service_url() -> String {
    "/".to_string()
}

fn default_group_id() -> String {
    AUTO_GROUP.to_string()
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

impl CacheConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables and/or default values
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `ODATA_*` variables looked up by `var`.
    /// `ODATA_GROUPS` lists submit modes as `group=mode` pairs separated by commas.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = CacheConfig::default();
        if let Some(url) = var("ODATA_SERVICE_URL") {
            config.service_url = url;
        }
        if let Some(group_id) = var("ODATA_GROUP_ID") {
            config.group_id = group_id;
        }
        if let Some(group_id) = var("ODATA_UPDATE_GROUP_ID") {
            config.update_group_id = group_id;
        }
        if let Some(groups) = var("ODATA_GROUPS") {
            for entry in groups.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
                let (group_id, mode) = entry
                    .split_once('=')
                    .with_context(|| format!("Invalid ODATA_GROUPS entry '{}', expected group=mode", entry))?;
                config
                    .groups
                    .insert(group_id.trim().to_string(), mode.trim().parse()?);
            }
        }
        if let Some(flag) = var("ODATA_REQUEST_COUNT") {
            config.request_count = flag
                .parse()
                .with_context(|| format!("Invalid ODATA_REQUEST_COUNT '{}'", flag))?;
        }
        if let Some(flag) = var("ODATA_IGNORE_ETAGS") {
            config.ignore_etags = flag
                .parse()
                .with_context(|| format!("Invalid ODATA_IGNORE_ETAGS '{}'", flag))?;
        }
        if let Some(size) = var("ODATA_PAGE_SIZE") {
            config.page_size = size
                .parse()
                .with_context(|| format!("Invalid ODATA_PAGE_SIZE '{}'", size))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for group_id in [&self.group_id, &self.update_group_id] {
            validate_group_id(group_id)?;
        }
        for group_id in self.groups.keys() {
            if group_id.starts_with('$') {
                anyhow::bail!("Group '{}' is reserved and cannot be configured", group_id);
            }
            validate_group_id(group_id)?;
        }
        if self.page_size == 0 {
            anyhow::bail!("page_size must be positive");
        }
        Ok(())
    }

    pub fn submit_mode(&self, group_id: &str) -> SubmitMode {
        match group_id {
            AUTO_GROUP => SubmitMode::Auto,
            DIRECT_GROUP => SubmitMode::Direct,
            other => self.groups.get(other).copied().unwrap_or(SubmitMode::Api),
        }
    }
}

/// Group ids are identifiers or one of the reserved `$` groups
pub fn validate_group_id(group_id: &str) -> anyhow::Result<()> {
    if group_id == AUTO_GROUP || group_id == DIRECT_GROUP {
        return Ok(());
    }
    let valid = !group_id.is_empty()
        && group_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if !valid {
        anyhow::bail!("Invalid group ID: {}", group_id);
    }
    Ok(())
}
