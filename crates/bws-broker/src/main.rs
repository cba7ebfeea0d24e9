//! bws-broker: hands out Secrets Manager values over a Unix socket.

use std::path::PathBuf;

use anyhow::Context;
use bws_broker::config::{BrokerConfig, ReadEnv, SystemEnv};
use bws_broker::credential;
use clap::Parser;

/// Bitwarden Secrets Manager socket broker.
#[derive(Parser, Debug)]
#[command(name = "bws-broker", version, about)]
struct Args {
    /// Listen on this socket instead of `<runtime dir>/bws.sock`.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Verify the access token signature against the identity provider's JWKS.
    #[arg(long)]
    verify_signature: bool,
}

/// Environment configuration with command-line overrides applied.
fn config_from(args: Args, env: &impl ReadEnv) -> BrokerConfig {
    let mut config = BrokerConfig::from_env(env);
    if let Some(socket) = args.socket {
        config = config.with_socket_path(socket);
    }
    if args.verify_signature {
        config = config.with_signature_verification();
    }
    config
}

// Errors are reported once, by anyhow, when `main` returns.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise structured logging (controlled via RUST_LOG env var).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config_from(Args::parse(), &SystemEnv);

    let credential =
        credential::resolve(&SystemEnv).context("failed to load BWS access token")?;
    bws_broker::run(&config, credential)
        .await
        .context("broker stopped")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env() -> HashMap<String, String> {
        HashMap::from([("RUNTIME_DIRECTORY".to_string(), "/run/bws-test".to_string())])
    }

    #[test]
    fn defaults_come_from_environment() {
        let args = Args::try_parse_from(["bws-broker"]).unwrap();
        let config = config_from(args, &env());
        assert_eq!(config.socket_path, PathBuf::from("/run/bws-test/bws.sock"));
        assert!(!config.verify_signature);
    }

    #[test]
    fn flags_override_environment() {
        let args = Args::try_parse_from([
            "bws-broker",
            "--socket",
            "/tmp/other.sock",
            "--verify-signature",
        ])
        .unwrap();
        let config = config_from(args, &env());
        assert_eq!(config.socket_path, PathBuf::from("/tmp/other.sock"));
        assert!(config.verify_signature);
    }
}
