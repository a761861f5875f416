use anyhow::{Result, bail};
use clap::{Arg, ArgMatches, Command};

pub const ARG_SSH_CA_KEY: &str = "ssh-ca-key";
pub const ARG_SSH_REQUEST_TTL: &str = "ssh-request-ttl-seconds";
pub const ARG_SSH_CERT_TTL: &str = "ssh-cert-ttl-seconds";
pub const ARG_SSH_HOST_CERT_TTL: &str = "ssh-host-cert-ttl-seconds";

#[derive(Debug)]
pub struct Options {
    pub ca_key_path: Option<String>,
    pub request_ttl_seconds: u64,
    pub cert_ttl_seconds: u64,
    pub host_cert_ttl_seconds: u64,
}

impl Options {
    /// Parse SSH certificate arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a TTL is zero or missing.
    pub fn parse(matches: &ArgMatches) -> Result<Self> {
        let ttl = |id: &str| -> Result<u64> {
            match matches.get_one::<u64>(id).copied() {
                Some(0) => bail!("--{id} must be greater than zero"),
                Some(value) => Ok(value),
                None => bail!("missing required argument: --{id}"),
            }
        };

        Ok(Self {
            ca_key_path: matches
                .get_one::<String>(ARG_SSH_CA_KEY)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            request_ttl_seconds: ttl(ARG_SSH_REQUEST_TTL)?,
            cert_ttl_seconds: ttl(ARG_SSH_CERT_TTL)?,
            host_cert_ttl_seconds: ttl(ARG_SSH_HOST_CERT_TTL)?,
        })
    }
}

pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SSH_CA_KEY)
                .long(ARG_SSH_CA_KEY)
                .help("OpenSSH private key of the certificate authority")
                .long_help(
                    "OpenSSH private key of the certificate authority. When unset an ephemeral Ed25519 key is generated at startup and certificates do not survive a restart.",
                )
                .env("ZEROGATE_SSH_CA_KEY"),
        )
        .arg(
            Arg::new(ARG_SSH_REQUEST_TTL)
                .long(ARG_SSH_REQUEST_TTL)
                .help("How long an SSH certificate request waits for approval, in seconds")
                .env("ZEROGATE_SSH_REQUEST_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SSH_CERT_TTL)
                .long(ARG_SSH_CERT_TTL)
                .help("User certificate validity in seconds")
                .env("ZEROGATE_SSH_CERT_TTL_SECONDS")
                .default_value("57600")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SSH_HOST_CERT_TTL)
                .long(ARG_SSH_HOST_CERT_TTL)
                .help("Host certificate validity in seconds")
                .env("ZEROGATE_SSH_HOST_CERT_TTL_SECONDS")
                .default_value("2592000")
                .value_parser(clap::value_parser!(u64)),
        )
}
