//! YAML description of the log channels, read once at startup.
//!
//! ```yaml
//! channels:
//!   - name: main_debate
//!     path: logs/main_debate.jsonl
//!     filter: { tag: "main debate" }
//!     fmt_keys:
//!       level: levelname
//!       message: message
//!       timestamp: timestamp
//!   - name: helper_html
//!     path: logs/helper.html
//!     filter: { tag: persuador_helper }
//!     format: html
//! ```
//!
//! A channel without `path` writes to stderr; a channel without `filter`
//! accepts every event.

use crate::{
    Channel, FieldOrder, FileSink, Formatter, HtmlFormatter, JsonFormatter, Multiplexer,
    StderrSink, TagFilter,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogConfigError {
    #[error("failed to read log config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse log config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("channel '{channel}': fmt_keys entries must map strings to strings")]
    InvalidFieldOrder { channel: String },
    #[error("duplicate channel name '{0}'")]
    DuplicateChannel(String),
    #[error("channel '{channel}': cannot open {path}: {source}")]
    OpenSink {
        channel: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub format: FormatKind,
    // Mapping rather than a map type: declaration order is the output order.
    #[serde(default)]
    pub fmt_keys: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    pub tag: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FormatKind {
    #[default]
    Json,
    Html,
}

impl LogConfig {
    pub fn load(path: &Path) -> Result<Self, LogConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| LogConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, LogConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Opens every sink and assembles the multiplexer. Relative sink paths
    /// are resolved against `base_dir`.
    pub fn build(&self, base_dir: &Path) -> Result<Multiplexer, LogConfigError> {
        let mut seen = BTreeSet::new();
        let mut mux = Multiplexer::default();
        for channel in &self.channels {
            if !seen.insert(channel.name.as_str()) {
                return Err(LogConfigError::DuplicateChannel(channel.name.clone()));
            }
            mux.add_channel(channel.build(base_dir)?);
        }
        Ok(mux)
    }
}

impl ChannelConfig {
    pub fn field_order(&self) -> Result<FieldOrder, LogConfigError> {
        let mut order = FieldOrder::new();
        for (key, source) in &self.fmt_keys {
            match (key.as_str(), source.as_str()) {
                (Some(key), Some(source)) => order = order.field(key, source),
                _ => {
                    return Err(LogConfigError::InvalidFieldOrder {
                        channel: self.name.clone(),
                    })
                }
            }
        }
        Ok(order)
    }

    pub fn tag_filter(&self) -> TagFilter {
        match &self.filter {
            Some(f) => TagFilter::equals(f.tag.clone()),
            None => TagFilter::Any,
        }
    }

    fn build(&self, base_dir: &Path) -> Result<Channel, LogConfigError> {
        let formatter: Box<dyn Formatter> = match self.format {
            FormatKind::Json => Box::new(JsonFormatter::new(self.field_order()?)),
            FormatKind::Html => Box::new(HtmlFormatter),
        };
        let filter = self.tag_filter();
        match &self.path {
            Some(path) => {
                let resolved = if path.is_absolute() {
                    path.clone()
                } else {
                    base_dir.join(path)
                };
                let sink = FileSink::open(&resolved).map_err(|source| LogConfigError::OpenSink {
                    channel: self.name.clone(),
                    path: resolved.clone(),
                    source,
                })?;
                Ok(Channel::new(self.name.clone(), filter, formatter, sink))
            }
            None => Ok(Channel::new(self.name.clone(), filter, formatter, StderrSink)),
        }
    }
}

impl Formatter for Box<dyn Formatter> {
    fn format(&self, event: &crate::StructuredEvent) -> String {
        (**self).format(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StructuredEvent, MAIN_DEBATE};

    const SAMPLE: &str = r#"
channels:
  - name: main_debate
    path: logs/main.jsonl
    filter: { tag: "main debate" }
    fmt_keys:
      level: levelname
      message: message
  - name: helper
    path: logs/helper.html
    filter:
      tag: persuador_helper
    format: html
  - name: console
"#;

    #[test]
    fn parses_channels_in_order() {
        let cfg = LogConfig::from_yaml_str(SAMPLE).expect("parse");
        let names: Vec<_> = cfg.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["main_debate", "helper", "console"]);
        assert_eq!(cfg.channels[1].format, FormatKind::Html);
        assert_eq!(cfg.channels[2].tag_filter(), TagFilter::Any);
        assert_eq!(cfg.channels[0].tag_filter(), TagFilter::main_debate());
        let order = cfg.channels[0].field_order().expect("order");
        let keys: Vec<_> = order.entries().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["level", "message"]);
    }

    #[test]
    fn built_channels_write_relative_to_base_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = LogConfig::from_yaml_str(SAMPLE).expect("parse");
        let mux = cfg.build(dir.path()).expect("build");
        assert_eq!(mux.channel_names(), vec!["main_debate", "helper", "console"]);

        let delivery = mux.dispatch(&StructuredEvent::new("opening").tagged(MAIN_DEBATE));
        assert_eq!(
            delivery.delivered,
            vec!["main_debate".to_string(), "console".to_string()]
        );
        let written =
            std::fs::read_to_string(dir.path().join("logs/main.jsonl")).expect("main log");
        assert!(written.starts_with("{\"level\":\"INFO\",\"message\":\"opening\",\"msg_type\":\"main debate\""));
        assert!(dir.path().join("logs/helper.html").exists());
    }

    #[test]
    fn rejects_duplicate_names_and_bad_fmt_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dup = LogConfig::from_yaml_str("channels:\n  - name: a\n  - name: a\n").expect("parse");
        assert!(matches!(
            dup.build(dir.path()),
            Err(LogConfigError::DuplicateChannel(_))
        ));

        let bad = LogConfig::from_yaml_str("channels:\n  - name: a\n    fmt_keys:\n      k: [1]\n")
            .expect("parse");
        assert!(matches!(
            bad.channels[0].field_order(),
            Err(LogConfigError::InvalidFieldOrder { .. })
        ));
    }

    #[test]
    fn unknown_format_is_a_parse_error() {
        let err = LogConfig::from_yaml_str("channels:\n  - name: a\n    format: xml\n")
            .expect_err("xml is not supported");
        assert!(matches!(err, LogConfigError::Parse(_)));
    }
}
