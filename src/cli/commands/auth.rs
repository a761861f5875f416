use anyhow::{Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_APP_ID: &str = "app-id";
pub const ARG_SERVICE_NAME: &str = "service-name";
pub const ARG_COOKIE_INSECURE: &str = "cookie-insecure";
pub const ARG_SESSION_TTL: &str = "session-ttl-seconds";
pub const ARG_CHALLENGE_TTL: &str = "challenge-ttl-seconds";
pub const ARG_ASSOCIATION_TTL: &str = "association-ttl-seconds";
pub const ARG_BOOTSTRAP_USER: &str = "bootstrap-user";
pub const ARG_BOOTSTRAP_PASSWORD: &str = "bootstrap-password";

#[derive(Debug)]
pub struct Options {
    pub app_id: String,
    pub service_name: String,
    pub cookie_secure: bool,
    pub session_ttl_seconds: u64,
    pub challenge_ttl_seconds: u64,
    pub association_ttl_seconds: u64,
    pub bootstrap: Option<(String, SecretString)>,
}

impl Options {
    /// Parse auth arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a TTL is zero or the bootstrap pair is incomplete.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };
        let ttl = |id: &str| -> Result<u64> {
            match matches.get_one::<u64>(id).copied() {
                Some(0) => bail!("--{id} must be greater than zero"),
                Some(value) => Ok(value),
                None => bail!("missing required argument: --{id}"),
            }
        };

        let bootstrap = match (
            get_non_empty(ARG_BOOTSTRAP_USER),
            get_non_empty(ARG_BOOTSTRAP_PASSWORD),
        ) {
            (Some(user), Some(password)) => Some((user, SecretString::from(password))),
            (None, None) => None,
            _ => bail!("--{ARG_BOOTSTRAP_USER} and --{ARG_BOOTSTRAP_PASSWORD} must be set together"),
        };

        Ok(Self {
            app_id: get_non_empty(ARG_APP_ID)
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_APP_ID}"))?,
            service_name: get_non_empty(ARG_SERVICE_NAME).ok_or_else(|| {
                anyhow::anyhow!("missing required argument: --{ARG_SERVICE_NAME}")
            })?,
            cookie_secure: !matches.get_flag(ARG_COOKIE_INSECURE),
            session_ttl_seconds: ttl(ARG_SESSION_TTL)?,
            challenge_ttl_seconds: ttl(ARG_CHALLENGE_TTL)?,
            association_ttl_seconds: ttl(ARG_ASSOCIATION_TTL)?,
            bootstrap,
        })
    }
}

pub fn with_args(command: Command) -> Command {
    let command = with_relying_party_args(command);
    let command = with_session_args(command);
    with_bootstrap_args(command)
}

fn with_relying_party_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_APP_ID)
                .long(ARG_APP_ID)
                .help("Application id bound into every factor signature")
                .env("ZEROGATE_APP_ID")
                .default_value("https://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_SERVICE_NAME)
                .long(ARG_SERVICE_NAME)
                .help("Service name shown to clients during registration")
                .env("ZEROGATE_SERVICE_NAME")
                .default_value("zerogate"),
        )
}

fn with_session_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_COOKIE_INSECURE)
                .long(ARG_COOKIE_INSECURE)
                .help("Drop the Secure attribute from the session cookie (plain HTTP development only)")
                .env("ZEROGATE_COOKIE_INSECURE")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Session lifetime in seconds")
                .env("ZEROGATE_SESSION_TTL_SECONDS")
                .default_value("43200")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_CHALLENGE_TTL)
                .long(ARG_CHALLENGE_TTL)
                .help("Registration and validation challenge lifetime in seconds")
                .env("ZEROGATE_CHALLENGE_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ASSOCIATION_TTL)
                .long(ARG_ASSOCIATION_TTL)
                .help("Linked-account association token lifetime in seconds")
                .env("ZEROGATE_ASSOCIATION_TTL_SECONDS")
                .default_value("300")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_bootstrap_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BOOTSTRAP_USER)
                .long(ARG_BOOTSTRAP_USER)
                .help("Administrator created at startup when it does not exist yet")
                .env("ZEROGATE_BOOTSTRAP_USER"),
        )
        .arg(
            Arg::new(ARG_BOOTSTRAP_PASSWORD)
                .long(ARG_BOOTSTRAP_PASSWORD)
                .help("Password for the bootstrap administrator")
                .env("ZEROGATE_BOOTSTRAP_PASSWORD")
                .hide_env_values(true),
        )
}
