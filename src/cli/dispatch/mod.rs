//! Map validated CLI matches to an action.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_PORT, auth, limits, ssh};
use anyhow::Result;

/// # Errors
/// Returns an error if arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .filter(|v| !v.trim().is_empty());

    let auth_opts = auth::Options::parse(matches)?;
    let ssh_opts = ssh::Options::parse(matches)?;
    let limit_opts = limits::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        app_id: auth_opts.app_id,
        service_name: auth_opts.service_name,
        cookie_secure: auth_opts.cookie_secure,
        session_ttl_seconds: auth_opts.session_ttl_seconds,
        challenge_ttl_seconds: auth_opts.challenge_ttl_seconds,
        association_ttl_seconds: auth_opts.association_ttl_seconds,
        bootstrap: auth_opts.bootstrap,
        ssh_ca_key_path: ssh_opts.ca_key_path,
        ssh_request_ttl_seconds: ssh_opts.request_ttl_seconds,
        ssh_cert_ttl_seconds: ssh_opts.cert_ttl_seconds,
        ssh_host_cert_ttl_seconds: ssh_opts.host_cert_ttl_seconds,
        store_timeout_seconds: limit_opts.store_timeout_seconds,
        rate_limit: limit_opts.rate_limit,
        rate_limit_window_seconds: limit_opts.rate_limit_window_seconds,
        trust_proxy: limit_opts.trust_proxy,
        prune_interval_seconds: limit_opts.prune_interval_seconds,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    fn dispatch(args: &[&str]) -> Result<Action> {
        let matches = commands::new().try_get_matches_from(args)?;
        handler(&matches)
    }

    fn cleared<F: FnOnce()>(f: F) {
        temp_env::with_vars(
            [
                ("ZEROGATE_DSN", None::<&str>),
                ("ZEROGATE_BOOTSTRAP_USER", None),
                ("ZEROGATE_BOOTSTRAP_PASSWORD", None),
                ("ZEROGATE_SESSION_TTL_SECONDS", None),
                ("ZEROGATE_COOKIE_INSECURE", None),
                ("ZEROGATE_RATE_LIMIT", None),
                ("ZEROGATE_TRUST_PROXY", None),
                ("ZEROGATE_PRUNE_INTERVAL_SECONDS", None),
            ],
            f,
        );
    }

    #[test]
    fn defaults_use_memory_store() {
        cleared(|| {
            let result = dispatch(&["zerogate"]);
            assert!(result.is_ok());
            if let Ok(Action::Server(args)) = result {
                assert_eq!(args.port, 8080);
                assert!(args.dsn.is_none());
                assert!(args.cookie_secure);
                assert_eq!(args.session_ttl_seconds, 43_200);
                assert_eq!(args.rate_limit, 300);
                assert!(!args.trust_proxy);
                assert_eq!(args.prune_interval_seconds, 60);
                assert!(args.bootstrap.is_none());
                assert!(args.ssh_ca_key_path.is_none());
            }
        });
    }

    #[test]
    fn bootstrap_requires_both_values() {
        cleared(|| {
            let result = dispatch(&["zerogate", "--bootstrap-user", "admin"]);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("must be set together"));
            }
        });
    }

    #[test]
    fn bootstrap_from_env() {
        temp_env::with_vars(
            [
                ("ZEROGATE_BOOTSTRAP_USER", Some("admin")),
                ("ZEROGATE_BOOTSTRAP_PASSWORD", Some("correct horse")),
                ("ZEROGATE_COOKIE_INSECURE", Some("true")),
            ],
            || {
                let result = dispatch(&["zerogate"]);
                assert!(result.is_ok());
                if let Ok(Action::Server(args)) = result {
                    assert!(!args.cookie_secure);
                    let Some((user, password)) = args.bootstrap else {
                        panic!("bootstrap credentials missing");
                    };
                    assert_eq!(user, "admin");
                    assert_eq!(password.expose_secret(), "correct horse");
                }
            },
        );
    }

    #[test]
    fn zero_ttl_is_rejected() {
        cleared(|| {
            let result = dispatch(&["zerogate", "--session-ttl-seconds", "0"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn trust_proxy_is_opt_in() {
        temp_env::with_vars([("ZEROGATE_TRUST_PROXY", Some("true"))], || {
            let result = dispatch(&["zerogate"]);
            assert!(matches!(result, Ok(Action::Server(ref args)) if args.trust_proxy));
        });
    }

    #[test]
    fn zero_prune_interval_is_rejected() {
        cleared(|| {
            let result = dispatch(&["zerogate", "--prune-interval-seconds", "0"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn empty_dsn_means_memory() {
        temp_env::with_vars([("ZEROGATE_DSN", Some(""))], || {
            let result = dispatch(&["zerogate"]);
            assert!(matches!(result, Ok(Action::Server(ref args)) if args.dsn.is_none()));
        });
    }
}
