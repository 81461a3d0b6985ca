use owo_colors::{OwoColorize, Stream};
use std::fmt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const TIMESTAMP: &[FormatItem<'static>] =
    format_description!("[hour]:[minute]:[second].[subsecond digits:3]");

/// Compact single-line event format: local time, level, message and fields.
/// Debug and trace lines also carry the event target.
pub struct PipelineFormatter {
    offset: UtcOffset,
}

impl PipelineFormatter {
    pub fn new() -> Self {
        // Must be resolved before the runtime spawns threads.
        let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
        Self { offset }
    }
}

impl Default for PipelineFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn level_label(level: Level, ansi: bool) -> String {
    let label = match level {
        Level::ERROR => "ERROR",
        Level::WARN => " WARN",
        Level::INFO => " INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    };
    if !ansi {
        return label.to_string();
    }
    match level {
        Level::ERROR => label.if_supports_color(Stream::Stdout, |l| l.red()).to_string(),
        Level::WARN => label.if_supports_color(Stream::Stdout, |l| l.yellow()).to_string(),
        Level::INFO => label.if_supports_color(Stream::Stdout, |l| l.green()).to_string(),
        Level::DEBUG => label.if_supports_color(Stream::Stdout, |l| l.blue()).to_string(),
        Level::TRACE => label.if_supports_color(Stream::Stdout, |l| l.purple()).to_string(),
    }
}

impl<S, N> FormatEvent<S, N> for PipelineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let ansi = writer.has_ansi_escapes();
        let metadata = event.metadata();

        let timestamp = OffsetDateTime::now_utc()
            .to_offset(self.offset)
            .format(TIMESTAMP)
            .unwrap_or_default();
        if ansi {
            write!(writer, "{} ", timestamp.dimmed())?;
        } else {
            write!(writer, "{} ", timestamp)?;
        }

        write!(writer, "{} ", level_label(*metadata.level(), ansi))?;

        if *metadata.level() >= Level::DEBUG {
            write!(writer, "{}: ", metadata.target())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
