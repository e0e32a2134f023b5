use crate::term::{style, ColorMode, OutputOptions, OwoColorize, Style};
use std::fmt;
use tracing::{field::Field, Event, Level, Subscriber};
use tracing_subscriber::{
    field::Visit,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    registry::LookupSpan,
};

impl OutputOptions {
    pub fn trace_init(&self) -> color_eyre::Result<()> {
        use tracing_subscriber::prelude::*;
        let fmt = tracing_subscriber::fmt::layer()
            .event_format(CargoFormatter {
                styles: Styles::new(self.color),
            })
            .with_writer(std::io::stderr);

        tracing_subscriber::registry()
            .with(fmt)
            .with(tracing_error::ErrorLayer::default())
            .with(self.filter()?)
            .try_init()?;
        Ok(())
    }
}

/// Formats events the way `cargo` formats its status lines.
///
/// An `INFO` event whose message starts with a capitalized word of at most
/// [`INDENT`](Visitor::INDENT) characters (`"Soaking 8 producers..."`) is
/// printed with that word right-aligned as a tag. Everything else gets a
/// level prefix.
#[derive(Debug)]
struct CargoFormatter {
    styles: Styles,
}

struct Visitor<'styles, 'writer> {
    level: Level,
    writer: Writer<'writer>,
    is_empty: bool,
    styles: &'styles Styles,
}

#[derive(Debug)]
struct Styles {
    error: Style,
    warn: Style,
    info: Style,
    debug: Style,
    trace: Style,
    bold: Style,
}

impl<S, N> FormatEvent<S, N> for CargoFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();
        let mut visitor = Visitor {
            level,
            writer: writer.by_ref(),
            is_empty: true,
            styles: &self.styles,
        };
        event.record(&mut visitor);
        writer.write_char('\n')
    }
}

// === impl Visitor ===

impl Visitor<'_, '_> {
    const MESSAGE: &'static str = "message";
    const INDENT: usize = 12;

    fn cargo_tag<'msg>(&self, message: &'msg str) -> Option<(&'msg str, &'msg str)> {
        if self.level != Level::INFO {
            return None;
        }
        let (tag, rest) = message.split_once(' ')?;
        let capitalized = tag.chars().next().map_or(false, char::is_uppercase);
        (capitalized && tag.len() <= Self::INDENT).then_some((tag, rest))
    }

    fn level_tag(&mut self) -> fmt::Result {
        let (tag, style) = match self.level {
            Level::ERROR => ("error", self.styles.error),
            Level::WARN => ("warning", self.styles.warn),
            Level::INFO => ("info", self.styles.info),
            Level::DEBUG => ("debug", self.styles.debug),
            Level::TRACE => ("trace", self.styles.trace),
        };
        write!(
            self.writer,
            "{}{} ",
            tag.style(style),
            ":".style(self.styles.bold)
        )
    }
}

impl Visit for Visitor<'_, '_> {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if self.is_empty {
            self.is_empty = false;
            if field.name() == Self::MESSAGE {
                let message = format!("{value:?}");
                if let Some((tag, rest)) = self.cargo_tag(&message) {
                    let _ = write!(
                        self.writer,
                        "{:>indent$} {}",
                        tag.style(self.styles.info),
                        rest,
                        indent = Self::INDENT
                    );
                    return;
                }
            }
            let _ = self.level_tag();
        } else {
            let _ = self.writer.write_str(", ");
        }

        if field.name() == Self::MESSAGE {
            let _ = write!(self.writer, "{:?}", value.style(self.styles.bold));
        } else {
            let _ = write!(
                self.writer,
                "{}{} {:?}",
                field.name().style(self.styles.bold),
                ":".style(self.styles.bold),
                value
            );
        }
    }
}

// === impl Styles ===

impl Styles {
    fn new(colors: ColorMode) -> Self {
        Self {
            error: colors.if_color(style().red().bold()),
            warn: colors.if_color(style().yellow().bold()),
            info: colors.if_color(style().green().bold()),
            debug: colors.if_color(style().blue().bold()),
            trace: colors.if_color(style().purple().bold()),
            bold: colors.if_color(style().bold()),
        }
    }
}
