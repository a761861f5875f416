use anyhow::{Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};

pub const ARG_STORE_TIMEOUT: &str = "store-timeout-seconds";
pub const ARG_RATE_LIMIT: &str = "rate-limit";
pub const ARG_RATE_LIMIT_WINDOW: &str = "rate-limit-window-seconds";
pub const ARG_TRUST_PROXY: &str = "trust-proxy";
pub const ARG_PRUNE_INTERVAL: &str = "prune-interval-seconds";

#[derive(Debug)]
pub struct Options {
    pub store_timeout_seconds: u64,
    /// Requests per client per window; zero disables the limiter.
    pub rate_limit: u32,
    pub rate_limit_window_seconds: u64,
    pub trust_proxy: bool,
    pub prune_interval_seconds: u64,
}

impl Options {
    /// Parse store and rate limit arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the store timeout, window or prune interval is zero.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let store_timeout_seconds = matches
            .get_one::<u64>(ARG_STORE_TIMEOUT)
            .copied()
            .unwrap_or(5);
        if store_timeout_seconds == 0 {
            bail!("--{ARG_STORE_TIMEOUT} must be greater than zero");
        }

        let rate_limit_window_seconds = matches
            .get_one::<u64>(ARG_RATE_LIMIT_WINDOW)
            .copied()
            .unwrap_or(60);
        if rate_limit_window_seconds == 0 {
            bail!("--{ARG_RATE_LIMIT_WINDOW} must be greater than zero");
        }

        let prune_interval_seconds = matches
            .get_one::<u64>(ARG_PRUNE_INTERVAL)
            .copied()
            .unwrap_or(60);
        if prune_interval_seconds == 0 {
            bail!("--{ARG_PRUNE_INTERVAL} must be greater than zero");
        }

        Ok(Self {
            store_timeout_seconds,
            rate_limit: matches.get_one::<u32>(ARG_RATE_LIMIT).copied().unwrap_or(300),
            rate_limit_window_seconds,
            trust_proxy: matches.get_flag(ARG_TRUST_PROXY),
            prune_interval_seconds,
        })
    }
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_STORE_TIMEOUT)
                .long(ARG_STORE_TIMEOUT)
                .help("Upper bound for a single store call, in seconds")
                .env("ZEROGATE_STORE_TIMEOUT_SECONDS")
                .default_value("5")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT)
                .long(ARG_RATE_LIMIT)
                .help("Requests allowed per client per window (0 disables)")
                .env("ZEROGATE_RATE_LIMIT")
                .default_value("300")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_RATE_LIMIT_WINDOW)
                .long(ARG_RATE_LIMIT_WINDOW)
                .help("Rate limit window in seconds")
                .env("ZEROGATE_RATE_LIMIT_WINDOW_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY)
                .long(ARG_TRUST_PROXY)
                .help("Key rate limits by X-Forwarded-For/X-Real-IP (only behind a proxy that sets them)")
                .env("ZEROGATE_TRUST_PROXY")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_PRUNE_INTERVAL)
                .long(ARG_PRUNE_INTERVAL)
                .help("How often expired sessions, challenges and tokens are deleted, in seconds")
                .env("ZEROGATE_PRUNE_INTERVAL_SECONDS")
                .default_value("60")
                .value_parser(clap::value_parser!(u64)),
        )
}
