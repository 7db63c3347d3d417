use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::providers::Provider;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct AppConfig {
    pub(crate) provider: Provider,
    pub(crate) transcript: bool,
    pub(crate) log_filter: String,
    pub(crate) session_id: String,
    pub(crate) simulated_delay_ms: u64,
    pub(crate) stream: StreamConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Simulated,
            transcript: true,
            log_filter: "info".to_string(),
            session_id: default_session_id(),
            simulated_delay_ms: 12,
            stream: StreamConfig::default(),
        }
    }
}

fn default_session_id() -> String {
    "default".to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct StreamConfig {
    /// Minimum spacing between append notifications for an open prose block.
    pub(crate) throttle_ms: u64,
    pub(crate) tick_ms: u64,
    pub(crate) channel_capacity: usize,
    /// Exempt the session's first prose block from the empty-block sweep.
    pub(crate) keep_first_prose: bool,
    pub(crate) languages: LanguageTable,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 100,
            tick_ms: 16,
            channel_capacity: 256,
            keep_first_prose: true,
            languages: LanguageTable::default(),
        }
    }
}

impl StreamConfig {
    pub(crate) fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub(crate) fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LanguageTable {
    pub(crate) default_language: String,
    pub(crate) aliases: BTreeMap<String, String>,
    pub(crate) known: Vec<String>,
}

impl Default for LanguageTable {
    fn default() -> Self {
        let aliases = [("py", "python"), ("sh", "bash"), ("shell", "bash")]
            .into_iter()
            .map(|(alias, name)| (alias.to_string(), name.to_string()))
            .collect();
        Self {
            default_language: "python".to_string(),
            aliases,
            known: vec!["python".to_string(), "bash".to_string()],
        }
    }
}

impl LanguageTable {
    /// Normalizes a fence tag: trim, lower-case, alias, then fall back to the
    /// default language when the tag is empty or not a known language.
    pub(crate) fn resolve(&self, tag: &str) -> String {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            return self.default_language.clone();
        }
        let name = self.aliases.get(&tag).cloned().unwrap_or(tag);
        if self.known.iter().any(|known| *known == name) {
            name
        } else {
            self.default_language.clone()
        }
    }
}

pub(crate) fn data_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HOME") {
        PathBuf::from(home).join(".fencestream")
    } else {
        PathBuf::from(".fencestream")
    }
}

fn config_file_path() -> PathBuf {
    data_dir().join("config.json")
}

impl AppConfig {
    /// Reads `~/.fencestream/config.json` (defaults when absent), then applies
    /// `FENCESTREAM_*` overrides from the environment.
    pub(crate) fn load() -> Result<Self> {
        let mut config = Self::load_from(&config_file_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub(crate) fn load_from(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(err).with_context(|| format!("read config {}", path.display()))
            }
        };
        Self::from_json(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub(crate) fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw).context("invalid config json")?;
        Ok(config.normalized())
    }

    pub(crate) fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| {
            var(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(raw) = get("FENCESTREAM_PROVIDER") {
            match Provider::parse(&raw) {
                Some(provider) => self.provider = provider,
                None => tracing::warn!(value = %raw, "ignoring unknown FENCESTREAM_PROVIDER"),
            }
        }
        if let Some(raw) = get("FENCESTREAM_TRANSCRIPT") {
            self.transcript = parse_flag(&raw);
        }
        if let Some(raw) = get("FENCESTREAM_LOG") {
            self.log_filter = raw;
        }
        if let Some(raw) = get("FENCESTREAM_SESSION") {
            self.session_id = raw;
        }
        if let Some(ms) = get("FENCESTREAM_DELAY_MS").and_then(|raw| raw.parse().ok()) {
            self.simulated_delay_ms = ms;
        }
        if let Some(ms) = get("FENCESTREAM_THROTTLE_MS").and_then(|raw| raw.parse().ok()) {
            self.stream.throttle_ms = ms;
        }
        if let Some(ms) = get("FENCESTREAM_TICK_MS").and_then(|raw| raw.parse().ok()) {
            self.stream.tick_ms = ms;
        }
        if let Some(raw) = get("FENCESTREAM_KEEP_FIRST_PROSE") {
            self.stream.keep_first_prose = parse_flag(&raw);
        }
        if let Some(raw) = get("FENCESTREAM_DEFAULT_LANGUAGE") {
            self.stream.languages.default_language = raw.to_lowercase();
        }
        *self = std::mem::take(self).normalized();
    }

    fn normalized(mut self) -> Self {
        if self.session_id.trim().is_empty() {
            self.session_id = default_session_id();
        }
        let languages = &mut self.stream.languages;
        languages.default_language = languages.default_language.trim().to_lowercase();
        if languages.default_language.is_empty() {
            languages.default_language = LanguageTable::default().default_language;
        }
        self
    }
}

pub(crate) fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
