use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Targets,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Target of the per-bundle result lines. Always shown on the console and
/// always written to the log file, whatever the verbosity.
pub const SPAM_RESULT_TARGET: &str = "spam_result";

/// Installs the global subscriber: a colored console layer and an hourly
/// rolling file under `logs/`.
///
/// `verbose` lowers the default console level from WARN to DEBUG. The returned
/// guard flushes the file writer and must be kept alive by the caller.
pub fn setup_logger(verbose: bool) -> Option<WorkerGuard> {
    std::fs::create_dir_all("logs").ok();

    let file_appender = tracing_appender::rolling::hourly("logs", "tangle-spammer");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter = Targets::new()
        .with_target(SPAM_RESULT_TARGET, Level::INFO)
        .with_default(Level::INFO);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let console_default = if verbose { Level::DEBUG } else { Level::WARN };
    let console_filter = Targets::new()
        .with_target(SPAM_RESULT_TARGET, Level::INFO)
        .with_target("sqlx", Level::WARN)
        .with_target("hyper", Level::WARN)
        .with_target("reqwest", Level::WARN)
        .with_default(console_default);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(true)
        .event_format(TerminalFormatter)
        .with_filter(console_filter);

    // A second init (tests, embedding) keeps the first subscriber.
    if tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_err()
    {
        return None;
    }

    Some(guard)
}

struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

fn event_message(event: &Event<'_>) -> String {
    let mut visitor = MessageVisitor {
        message: String::new(),
    };
    event.record(&mut visitor);
    visitor.message
}

/// Highlights the status word of a result line.
fn colorize(msg: &str) -> String {
    const MARKERS: [(&str, Color); 3] = [
        ("SUCCESS", Color::LightGreen),
        ("FAILED", Color::LightRed),
        ("BAD TIPS", Color::Yellow),
    ];

    for (marker, color) in MARKERS {
        if msg.contains(marker) {
            let painted = Style::new().fg(color).bold().paint(marker).to_string();
            return msg.replace(marker, &painted);
        }
    }
    msg.to_string()
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
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
        let msg = event_message(event);
        let level = *event.metadata().level();

        if event.metadata().target() == SPAM_RESULT_TARGET {
            writeln!(writer, "{}", colorize(&msg))
        } else if level <= Level::WARN {
            let color = if level == Level::ERROR {
                Color::Red
            } else {
                Color::Yellow
            };
            writeln!(writer, "{} {}", color.paint(level.as_str()), msg)
        } else {
            writeln!(writer, "{}", msg)
        }
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
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
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let meta = event.metadata();
        writeln!(
            writer,
            "{} [{}] {}: {}",
            timestamp,
            meta.level(),
            meta.target(),
            event_message(event)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colorize_marks_status_word() {
        let line = colorize("SUCCESS bundle ABC");
        assert!(line.contains("bundle ABC"));
        assert_ne!(line, "SUCCESS bundle ABC");
        assert_eq!(colorize("plain line"), "plain line");
    }
}
