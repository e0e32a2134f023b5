use clap::{ArgGroup, Args};
use color_eyre::eyre::{Result, WrapErr};
use std::fmt;
use tracing_subscriber::EnvFilter;

pub use owo_colors::{style, OwoColorize, Style};

#[derive(Debug, Args)]
#[command(
    next_help_heading = "Output Options",
    group = ArgGroup::new("output-opts").multiple(true),
)]
pub struct OutputOptions {
    /// Whether to emit colors in output.
    #[clap(
        long,
        env = "CARGO_TERM_COLORS",
        default_value_t = ColorMode::Auto,
        group = "output-opts",
    )]
    pub color: ColorMode,

    /// Configures soak logging, using `tracing-subscriber`'s `EnvFilter`
    /// syntax (such as `sporulate[consume]=debug`).
    ///
    /// Setting `hyphae=trace` only has an effect if `hyphae` was built with
    /// its `tracing` feature.
    #[clap(
        short,
        long,
        env = "RUST_LOG",
        default_value = "sporulate=info,warn",
        group = "output-opts",
    )]
    pub log: String,
}

/// When to color output.
#[derive(Copy, Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
#[clap(rename_all = "lower")]
pub enum ColorMode {
    /// Color a stream only if it is a TTY.
    Auto,
    /// Always color output.
    Always,
    /// Never color output.
    Never,
}

// === impl OutputOptions ===

impl OutputOptions {
    pub fn init(&self) -> Result<()> {
        self.trace_init()
    }

    /// Parses the `--log` directives.
    pub fn filter(&self) -> Result<EnvFilter> {
        self.log
            .parse::<EnvFilter>()
            .wrap_err_with(|| format!("invalid log filter `{}`", self.log))
    }
}

// === impl ColorMode ===

impl ColorMode {
    /// Returns `style` if log output (stderr) is colored, or a plain style if
    /// it isn't.
    pub fn if_color(self, style: Style) -> Style {
        if self.colors(atty::Stream::Stderr) {
            style
        } else {
            owo_colors::style()
        }
    }

    /// Returns `true` if the report printed to stdout should be colored.
    pub fn should_color_stdout(self) -> bool {
        self.colors(atty::Stream::Stdout)
    }

    fn colors(self, stream: atty::Stream) -> bool {
        match self {
            ColorMode::Auto => atty::is(stream),
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ColorMode::Auto => "auto",
            ColorMode::Always => "always",
            ColorMode::Never => "never",
        })
    }
}
