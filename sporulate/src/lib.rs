use clap::Parser;
use std::time::Duration;

pub use color_eyre::eyre::Result;

pub mod soak;
pub mod term;
mod trace;

pub use self::soak::{Report, Soak, Violation};

#[derive(Debug, Parser)]
#[command(
    name = "sporulate",
    about = "soak a `hyphae` queue with lots of threads and check that nothing got lost",
    version
)]
pub struct Options {
    /// Number of threads enqueueing items.
    #[clap(
        short,
        long,
        env = "SPORULATE_PRODUCERS",
        default_value_t = 8,
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub producers: u32,

    /// Number of threads dequeueing items.
    #[clap(
        short,
        long,
        env = "SPORULATE_CONSUMERS",
        default_value_t = 8,
        value_parser = clap::value_parser!(u32).range(1..),
    )]
    pub consumers: u32,

    /// How long producers keep enqueueing, such as `10s`, `500ms` or `2m`.
    ///
    /// Producers stop early if they reach `--items`.
    #[clap(short, long, default_value = "5s", value_parser = parse_duration)]
    pub duration: Duration,

    /// The most items any one producer will enqueue.
    #[clap(short = 'n', long, default_value_t = 1_000_000)]
    pub items: u32,

    /// How many retired queue nodes may pile up before the queue scans for
    /// ones that are safe to free.
    ///
    /// Defaults to the queue's own default.
    #[clap(long)]
    pub reclaim_threshold: Option<usize>,

    #[clap(flatten)]
    pub output: term::OutputOptions,
}

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseDurationError {
    #[error("missing a unit (`ms`, `s` or `m`)")]
    NoUnit,
    #[error("unknown unit `{0}`, expected `ms`, `s` or `m`")]
    UnknownUnit(String),
    #[error("invalid number: {0}")]
    Number(#[from] std::num::ParseIntError),
}

// === impl Options ===

impl Options {
    pub fn soak(&self) -> Soak {
        Soak {
            producers: self.producers,
            consumers: self.consumers,
            duration: self.duration,
            items: self.items,
            reclaim_threshold: self.reclaim_threshold,
        }
    }
}

/// Parses durations like `500ms`, `10s` and `2m`.
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or(ParseDurationError::NoUnit)?;
    let (amount, unit) = s.split_at(split);
    let amount: u64 = amount.parse()?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        unit => Err(ParseDurationError::UnknownUnit(unit.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("10s"), Ok(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
        assert_eq!(parse_duration(" 3 s "), Ok(Duration::from_secs(3)));
    }

    #[test]
    fn rejects_bad_durations() {
        assert_eq!(parse_duration("10"), Err(ParseDurationError::NoUnit));
        assert_eq!(
            parse_duration("10h"),
            Err(ParseDurationError::UnknownUnit("h".to_string()))
        );
        assert!(matches!(
            parse_duration("ms"),
            Err(ParseDurationError::Number(_))
        ));
    }

    #[test]
    fn defaults() {
        let opts = Options::try_parse_from(["sporulate"]).unwrap();
        assert_eq!(opts.producers, 8);
        assert_eq!(opts.consumers, 8);
        assert_eq!(opts.duration, Duration::from_secs(5));
        assert_eq!(opts.items, 1_000_000);
        assert_eq!(opts.reclaim_threshold, None);
    }

    #[test]
    fn flags() {
        let opts = Options::try_parse_from([
            "sporulate",
            "-p",
            "2",
            "--consumers",
            "3",
            "-d",
            "250ms",
            "-n",
            "100",
            "--reclaim-threshold",
            "0",
            "--color",
            "never",
        ])
        .unwrap();
        let soak = opts.soak();
        assert_eq!(soak.producers, 2);
        assert_eq!(soak.consumers, 3);
        assert_eq!(soak.duration, Duration::from_millis(250));
        assert_eq!(soak.items, 100);
        assert_eq!(soak.reclaim_threshold, Some(0));
        assert_eq!(opts.output.color, term::ColorMode::Never);
    }

    #[test]
    fn log_takes_span_directives() {
        let opts =
            Options::try_parse_from(["sporulate", "-l", "sporulate[consume]=debug"]).unwrap();
        let filter = opts.output.filter().unwrap();
        let directives = filter.to_string();
        assert!(
            directives.contains("sporulate[consume]=debug"),
            "span directive was not kept: {directives}"
        );
    }

    #[test]
    fn bad_log_filter_is_an_error() {
        let opts = Options::try_parse_from(["sporulate", "-l", "sporulate=loudly"]).unwrap();
        assert!(opts.output.filter().is_err());
    }

    #[test]
    fn zero_threads_is_an_error() {
        assert!(Options::try_parse_from(["sporulate", "-p", "0"]).is_err());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Options::command().debug_assert();
    }
}
