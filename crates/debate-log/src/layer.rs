//! Bridge from `tracing` events to the multiplexer, and process-wide logging
//! initialization.

use crate::{Multiplexer, StructuredEvent, TAG_FIELD};
use serde_json::Value;
use std::fmt::Debug;
use std::sync::{Arc, Once};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Routes every `tracing` event through a [`Multiplexer`].
///
/// Field conventions: `msg_type` is the channel tag, `speaker`, `receiver`,
/// `sender`, `round` and `topic` are actor fields, anything else becomes an
/// extra attribute.
#[derive(Debug, Clone)]
pub struct MultiplexLayer {
    mux: Arc<Multiplexer>,
}

impl MultiplexLayer {
    pub fn new(mux: Arc<Multiplexer>) -> Self {
        Self { mux }
    }
}

impl<S: Subscriber> Layer<S> for MultiplexLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = EventVisitor {
            event: StructuredEvent::new(String::new()).level(*event.metadata().level()),
        };
        event.record(&mut visitor);
        self.mux.dispatch(&visitor.event);
    }
}

struct EventVisitor {
    event: StructuredEvent,
}

impl EventVisitor {
    fn put(&mut self, name: &str, value: Value) {
        match name {
            "message" => {
                self.event.message = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                }
            }
            TAG_FIELD => {
                self.event.channel_tag = Some(match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
            }
            _ => {
                if !self.event.actors.set(name, value.clone()) {
                    self.event.extra.insert(name.to_string(), value);
                }
            }
        }
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field.name(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field.name(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.put(field.name(), Value::String(format!("{:?}", value)));
    }
}

#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Used when `RUST_LOG` is unset or invalid.
    pub default_filter: String,
    pub multiplexer: Option<Arc<Multiplexer>>,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            multiplexer: None,
        }
    }
}

/// Installs the global subscriber: env filter, human-readable stderr output
/// and, when configured, the channel multiplexer.
///
/// Only the first call in a process has any effect; it returns `true` when
/// this call installed the subscriber.
pub fn init_logging(options: LoggingOptions) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&options.default_filter));
        let mux_layer = options.multiplexer.clone().map(MultiplexLayer::new);
        installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(mux_layer)
            .try_init()
            .is_ok();
    });
    installed
}
