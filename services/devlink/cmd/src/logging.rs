//! Console log format for the devlink binary.
//!
//! Lines look like
//!
//! ```text
//! [2024-05-01 12:00:00.123] [devlink-session ] [⚠ WARN   ] Device error on req=4: code 2: not found
//! ```
//!
//! The middle column is the `component` field when an event carries one,
//! otherwise the crate the event came from. Any other structured fields are
//! appended as `key=value`.

use std::fmt::{self, Write as _};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const SOURCE_WIDTH: usize = 16;
const LEVEL_WIDTH: usize = 9;

/// Event formatter for console output
pub struct LinkLogFormatter {
    color_enabled: bool,
}

impl LinkLogFormatter {
    pub fn new(color_enabled: bool) -> Self {
        Self { color_enabled }
    }

    fn format_source(&self, component: Option<&str>, target: &str) -> String {
        let name = match component {
            Some(component) => format!("devlink-{}", component),
            None => target
                .split("::")
                .next()
                .unwrap_or(target)
                .replace('_', "-"),
        };

        if name.chars().count() > SOURCE_WIDTH {
            let cut: String = name.chars().take(SOURCE_WIDTH - 1).collect();
            format!("{}…", cut)
        } else {
            format!("{:<width$}", name, width = SOURCE_WIDTH)
        }
    }

    fn format_level(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LEVEL_WIDTH)
    }

    fn color_for(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }

    fn render(&self, timestamp: &str, level: &Level, target: &str, fields: &FieldVisitor) -> String {
        let (color, reset, cyan) = if self.color_enabled {
            (self.color_for(level), COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "", "")
        };

        let mut line = format!(
            "{}[{}]{} [{}] [{}{}{}] {}",
            cyan,
            timestamp,
            reset,
            self.format_source(fields.component.as_deref(), target),
            color,
            Self::format_level(level),
            reset,
            fields.message
        );
        for (key, value) in &fields.extra {
            let _ = write!(line, " {}={}", key, value);
        }
        line
    }
}

impl<S, N> FormatEvent<S, N> for LinkLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now()
            .format("%Y-%m-%d %H:%M:%S%.3f")
            .to_string();

        let mut fields = FieldVisitor::default();
        event.record(&mut fields);

        let metadata = event.metadata();
        writeln!(
            writer,
            "{}",
            self.render(&timestamp, metadata.level(), metadata.target(), &fields)
        )
    }
}

/// Collects the message, the component, and any other fields of an event
#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => {
                self.component = Some(format!("{:?}", value).trim_matches('"').to_string())
            }
            name => self.extra.push((name, format!("{:?}", value))),
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.extra.push((name, value.to_string())),
        }
    }
}

/// Whether stderr looks like a color-capable terminal
pub fn color_supported() -> bool {
    match std::env::var("TERM") {
        Ok(term) => term != "dumb" && std::env::var_os("NO_COLOR").is_none(),
        Err(_) => false,
    }
}
