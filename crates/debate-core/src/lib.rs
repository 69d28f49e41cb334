use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "./config/settings.yaml";
pub const DEFAULT_MODELS_PATH: &str = "./config/models.yaml";

/// Settings key whose mapping keys are the selectable helper types.
const VARIANTS_KEY: &str = "agent_configurations";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings {path} has no `{key}` mapping")]
    MissingVariants { path: PathBuf, key: String },
    #[error("settings {path} declares a non-string helper type: {key}")]
    InvalidVariantName { path: PathBuf, key: String },
}

/// A named helper configuration selectable per debate invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant(String);

impl Variant {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One scheduled invocation. `sub_index == None` lets the debate program run
/// every claim it knows about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanEntry {
    pub variant: Variant,
    pub sub_index: Option<u32>,
}

impl PlanEntry {
    pub fn new(variant: impl Into<Variant>, sub_index: Option<u32>) -> Self {
        Self {
            variant: variant.into(),
            sub_index,
        }
    }

    /// `claim 3` or `all claims`.
    pub fn claim_label(&self) -> String {
        match self.sub_index {
            Some(idx) => format!("claim {}", idx),
            None => "all claims".to_string(),
        }
    }
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.variant, self.claim_label())
    }
}

/// Debate verdict as stored in the `result` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum OutcomeCode {
    NotConvinced,
    Convinced,
    Other,
}

impl OutcomeCode {
    pub fn code(self) -> u8 {
        match self {
            OutcomeCode::NotConvinced => 0,
            OutcomeCode::Convinced => 1,
            OutcomeCode::Other => 2,
        }
    }
}

impl TryFrom<u8> for OutcomeCode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OutcomeCode::NotConvinced),
            1 => Ok(OutcomeCode::Convinced),
            2 => Ok(OutcomeCode::Other),
            other => Err(format!("invalid outcome code {} (expected 0, 1 or 2)", other)),
        }
    }
}

impl From<OutcomeCode> for u8 {
    fn from(value: OutcomeCode) -> Self {
        value.code()
    }
}

/// One row of the shared results table. Field order is the column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub topic_id: String,
    #[serde(rename = "claim")]
    pub claim_text: String,
    #[serde(rename = "helper_type")]
    pub variant: Variant,
    #[serde(rename = "result")]
    pub outcome: OutcomeCode,
    pub rounds: u32,
    #[serde(rename = "chat_id")]
    pub run_id: String,
}

impl ResultRecord {
    pub const COLUMNS: [&'static str; 6] =
        ["topic_id", "claim", "helper_type", "result", "rounds", "chat_id"];
}

/// Helper types declared by a settings file, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KnownVariants {
    variants: Vec<Variant>,
}

impl KnownVariants {
    pub fn new<I, V>(variants: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Variant>,
    {
        Self {
            variants: variants.into_iter().map(Into::into).collect(),
        }
    }

    pub fn load(settings_path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(settings_path).map_err(|source| ConfigError::Read {
            path: settings_path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw, settings_path)
    }

    pub fn from_yaml_str(raw: &str, origin: &Path) -> Result<Self, ConfigError> {
        let yaml_value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        // serde_yaml mappings keep insertion order; serde_json maps would not.
        let configs = yaml_value
            .get(VARIANTS_KEY)
            .and_then(|v| v.as_mapping())
            .ok_or_else(|| ConfigError::MissingVariants {
                path: origin.to_path_buf(),
                key: VARIANTS_KEY.to_string(),
            })?;
        let mut variants = Vec::with_capacity(configs.len());
        for key in configs.keys() {
            let name = key.as_str().ok_or_else(|| ConfigError::InvalidVariantName {
                path: origin.to_path_buf(),
                key: format!("{:?}", key),
            })?;
            variants.push(Variant::new(name));
        }
        Ok(Self { variants })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variants.iter().any(|v| v.as_str() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.variants.iter().map(|v| v.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.variants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Writes `bytes` to a sibling temp file, syncs it, then renames it over
/// `path`. Readers see either the old contents or the new ones, and no temp
/// file outlives a failed attempt.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    let staged = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    });
    if let Err(e) = staged {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "table".to_string());
    path.with_file_name(format!(
        ".{}.{}-{}.partial",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ))
}
