use clap::{Arg, ArgAction, ArgMatches, Command, builder::ValueParser};
use tracing::Level;

pub const ARG_VERBOSITY: &str = "verbosity";
pub const ARG_LOG_FORMAT: &str = "log-format";
pub const ARG_NO_AUDIT_LOG: &str = "no-audit-log";
pub const ARG_OTLP_ENDPOINT: &str = "otlp-endpoint";
pub const ARG_OTLP_HEADERS: &str = "otlp-headers";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line, for log shippers.
    Json,
}

/// Console and span export settings.
#[derive(Debug)]
pub struct Options {
    /// `None` keeps the ERROR default unless `RUST_LOG` says otherwise.
    pub level: Option<Level>,
    pub format: LogFormat,
    /// Emit `audit` events (logins, factor changes, certificate decisions)
    /// at INFO whatever the verbosity.
    pub audit: bool,
    pub otlp_endpoint: Option<String>,
    /// `key=value` pairs, comma separated.
    pub otlp_headers: Option<String>,
}

impl Options {
    #[must_use]
    pub fn parse(matches: &ArgMatches) -> Self {
        let non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let format = match matches.get_one::<String>(ARG_LOG_FORMAT).map(String::as_str) {
            Some(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Self {
            level: level_for(matches.get_one::<u8>(ARG_VERBOSITY).copied().unwrap_or(0)),
            format,
            audit: !matches.get_flag(ARG_NO_AUDIT_LOG),
            otlp_endpoint: non_empty(ARG_OTLP_ENDPOINT),
            otlp_headers: non_empty(ARG_OTLP_HEADERS),
        }
    }
}

/// Map verbosity count to tracing level
const fn level_for(verbosity: u8) -> Option<Level> {
    match verbosity {
        0 => None,
        1 => Some(Level::WARN),
        2 => Some(Level::INFO),
        3 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

#[must_use]
pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>()
            && parsed <= 5
        {
            return Ok(parsed);
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VERBOSITY)
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("ZEROGATE_LOG_LEVEL")
                .global(true)
                .action(ArgAction::Count)
                .value_parser(validator_log_level()),
        )
        .arg(
            Arg::new(ARG_LOG_FORMAT)
                .long(ARG_LOG_FORMAT)
                .help("Console log format")
                .env("ZEROGATE_LOG_FORMAT")
                .default_value("pretty")
                .ignore_case(true)
                .value_parser(["pretty", "json"]),
        )
        .arg(
            Arg::new(ARG_NO_AUDIT_LOG)
                .long(ARG_NO_AUDIT_LOG)
                .help("Drop audit events unless the verbosity already shows INFO")
                .env("ZEROGATE_NO_AUDIT_LOG")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_OTLP_ENDPOINT)
                .long(ARG_OTLP_ENDPOINT)
                .help("OTLP/gRPC collector for request spans, e.g. http://localhost:4317")
                .env("OTEL_EXPORTER_OTLP_ENDPOINT"),
        )
        .arg(
            Arg::new(ARG_OTLP_HEADERS)
                .long(ARG_OTLP_HEADERS)
                .help("Extra collector metadata as key=value pairs; keys ending in -bin take base64")
                .env("OTEL_EXPORTER_OTLP_HEADERS"),
        )
}
