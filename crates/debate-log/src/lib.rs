//! Structured, multi-channel debate logging.
//!
//! A [`StructuredEvent`] carries a message, an optional channel tag
//! (`msg_type`), the actor fields of the debate and a timestamp. The
//! [`Multiplexer`] renders each event once per accepting [`Channel`] and hands
//! the line to that channel's sink. Events usually arrive through the
//! `tracing` bridge in [`layer`], but callers may dispatch directly.

pub mod config;
pub mod layer;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::Level;

pub use config::{ChannelConfig, FormatKind, LogConfig, LogConfigError};
pub use layer::{init_logging, LoggingOptions, MultiplexLayer};

pub const MAIN_DEBATE: &str = "main debate";
pub const PERSUADOR_HELPER: &str = "persuador_helper";
pub const SYSTEM: &str = "system";

/// Attribute name of the channel tag.
pub const TAG_FIELD: &str = "msg_type";
/// Actor attributes, in the order they are appended to an envelope.
pub const ACTOR_FIELDS: [&str; 5] = ["speaker", "receiver", "sender", "round", "topic"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorFields {
    pub speaker: Option<Value>,
    pub receiver: Option<Value>,
    pub sender: Option<Value>,
    pub round: Option<Value>,
    pub topic: Option<Value>,
}

impl ActorFields {
    pub fn get(&self, name: &str) -> Option<&Value> {
        match name {
            "speaker" => self.speaker.as_ref(),
            "receiver" => self.receiver.as_ref(),
            "sender" => self.sender.as_ref(),
            "round" => self.round.as_ref(),
            "topic" => self.topic.as_ref(),
            _ => None,
        }
    }

    /// Returns false when `name` is not an actor field.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        let slot = match name {
            "speaker" => &mut self.speaker,
            "receiver" => &mut self.receiver,
            "sender" => &mut self.sender,
            "round" => &mut self.round,
            "topic" => &mut self.topic,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// One diagnostic occurrence inside a debate run.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredEvent {
    pub message: String,
    pub level: Level,
    pub channel_tag: Option<String>,
    pub actors: ActorFields,
    pub extra: BTreeMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StructuredEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            level: Level::INFO,
            channel_tag: None,
            actors: ActorFields::default(),
            extra: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn tagged(mut self, tag: impl Into<String>) -> Self {
        self.channel_tag = Some(tag.into());
        self
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn speaker(mut self, value: impl Into<Value>) -> Self {
        self.actors.speaker = Some(value.into());
        self
    }

    pub fn receiver(mut self, value: impl Into<Value>) -> Self {
        self.actors.receiver = Some(value.into());
        self
    }

    pub fn sender(mut self, value: impl Into<Value>) -> Self {
        self.actors.sender = Some(value.into());
        self
    }

    pub fn round(mut self, value: impl Into<Value>) -> Self {
        self.actors.round = Some(value.into());
        self
    }

    pub fn topic(mut self, value: impl Into<Value>) -> Self {
        self.actors.topic = Some(value.into());
        self
    }

    /// Sets any attribute by name; actor names and `msg_type` land in their
    /// dedicated slots.
    pub fn attr(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if name == TAG_FIELD {
            self.channel_tag = Some(value_as_text(&value));
        } else if !self.actors.set(name, value.clone()) {
            self.extra.insert(name.to_string(), value);
        }
        self
    }

    /// Looks up an attribute as it would appear in an envelope.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            TAG_FIELD => self.channel_tag.clone().map(Value::String),
            "level" => Some(Value::String(self.level.to_string())),
            "levelname" => Some(Value::String(levelname(self.level).to_string())),
            _ => self
                .actors
                .get(name)
                .or_else(|| self.extra.get(name))
                .cloned(),
        }
    }

    pub fn rendered_timestamp(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, false)
    }
}

/// Level spelled the way `levelname` log configs expect it.
fn levelname(level: Level) -> &'static str {
    if level == Level::ERROR {
        "ERROR"
    } else if level == Level::WARN {
        "WARNING"
    } else if level == Level::INFO {
        "INFO"
    } else {
        "DEBUG"
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSource {
    Message,
    Timestamp,
    Attribute(String),
}

impl FieldSource {
    pub fn parse(name: &str) -> Self {
        match name {
            "message" => FieldSource::Message,
            "timestamp" => FieldSource::Timestamp,
            other => FieldSource::Attribute(other.to_string()),
        }
    }
}

/// Declared output keys and where each one draws its value from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldOrder {
    entries: Vec<(String, FieldSource)>,
}

impl FieldOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, source: &str) -> Self {
        self.entries.push((key.into(), FieldSource::parse(source)));
        self
    }

    pub fn entries(&self) -> &[(String, FieldSource)] {
        &self.entries
    }
}

/// Ordered key/value rendering of one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    fields: Vec<(String, Value)>,
}

impl Envelope {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.fields.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn push(&mut self, key: &str, value: Value) {
        if !self.contains(key) {
            self.fields.push((key.to_string(), value));
        }
    }

    /// Replaces the value in place when `key` is present, appends otherwise.
    fn set(&mut self, key: &str, value: Value) {
        match self.fields.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((key.to_string(), value)),
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Builds the canonical envelope: declared keys, then present tag/actor
/// fields, then whichever computed values were not drawn on. An undrawn
/// computed value overwrites a same-named key in place.
pub fn build_envelope(event: &StructuredEvent, order: &FieldOrder) -> Envelope {
    let mut envelope = Envelope::default();
    let mut message_used = false;
    let mut timestamp_used = false;

    for (key, source) in order.entries() {
        if envelope.contains(key) {
            continue;
        }
        let value = match source {
            FieldSource::Message => {
                message_used = true;
                Some(Value::String(event.message.clone()))
            }
            FieldSource::Timestamp => {
                timestamp_used = true;
                Some(Value::String(event.rendered_timestamp()))
            }
            FieldSource::Attribute(name) => event.attribute(name),
        };
        if let Some(value) = value {
            envelope.push(key, value);
        }
    }

    for name in std::iter::once(TAG_FIELD).chain(ACTOR_FIELDS) {
        if let Some(value) = event.attribute(name) {
            envelope.push(name, value);
        }
    }

    // Computed values nobody drew on always win their own key.
    if !message_used {
        envelope.set("message", Value::String(event.message.clone()));
    }
    if !timestamp_used {
        envelope.set("timestamp", Value::String(event.rendered_timestamp()));
    }
    envelope
}

pub trait Formatter: Send + Sync {
    fn format(&self, event: &StructuredEvent) -> String;
}

/// One JSON object per line.
#[derive(Debug, Clone, Default)]
pub struct JsonFormatter {
    order: FieldOrder,
}

impl JsonFormatter {
    pub fn new(order: FieldOrder) -> Self {
        Self { order }
    }
}

impl Formatter for JsonFormatter {
    fn format(&self, event: &StructuredEvent) -> String {
        let envelope = build_envelope(event, &self.order);
        match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(_) => "{\"message\":\"failed to serialize log envelope\"}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlFormatter;

impl Formatter for HtmlFormatter {
    fn format(&self, event: &StructuredEvent) -> String {
        format!("<div>{}</div>", escape_html(&event.message))
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Predicate over an event's channel tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Any,
    Equals(String),
}

impl TagFilter {
    pub fn equals(tag: impl Into<String>) -> Self {
        TagFilter::Equals(tag.into())
    }

    pub fn main_debate() -> Self {
        Self::equals(MAIN_DEBATE)
    }

    pub fn persuador_helper() -> Self {
        Self::equals(PERSUADOR_HELPER)
    }

    pub fn accepts(&self, tag: Option<&str>) -> bool {
        match self {
            TagFilter::Any => true,
            TagFilter::Equals(expected) => tag == Some(expected.as_str()),
        }
    }
}

pub trait Sink: Send + Sync {
    fn write_line(&self, line: &str) -> io::Result<()>;
}

/// Appends lines to a file, creating parent directories on open.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            debate_core::ensure_dir(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for FileSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log file lock poisoned"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSink;

impl Sink for StderrSink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        let mut err = io::stderr().lock();
        writeln!(err, "{}", line)
    }
}

/// Keeps delivered lines in memory; clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl Sink for MemorySink {
    fn write_line(&self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}

pub struct Channel {
    name: String,
    filter: TagFilter,
    formatter: Box<dyn Formatter>,
    sink: Box<dyn Sink>,
}

impl Channel {
    pub fn new(
        name: impl Into<String>,
        filter: TagFilter,
        formatter: impl Formatter + 'static,
        sink: impl Sink + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            filter,
            formatter: Box::new(formatter),
            sink: Box::new(sink),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter(&self) -> &TagFilter {
        &self.filter
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// What happened to one dispatched event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

impl Delivery {
    pub fn matched(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug, Default)]
pub struct Multiplexer {
    channels: Vec<Channel>,
}

impl Multiplexer {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn add_channel(&mut self, channel: Channel) {
        self.channels.push(channel);
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    /// Delivers `event` to every channel whose filter accepts its tag. A
    /// failing sink is reported and skipped; it never stops the others.
    pub fn dispatch(&self, event: &StructuredEvent) -> Delivery {
        let mut delivery = Delivery::default();
        let tag = event.channel_tag.as_deref();
        for channel in self.channels.iter().filter(|c| c.filter.accepts(tag)) {
            let line = channel.formatter.format(event);
            match channel.sink.write_line(&line) {
                Ok(()) => delivery.delivered.push(channel.name.clone()),
                Err(e) => {
                    // Not through tracing: this runs inside the tracing layer.
                    eprintln!("log channel '{}' dropped an event: {}", channel.name, e);
                    delivery.failed.push(channel.name.clone());
                }
            }
        }
        delivery
    }
}
