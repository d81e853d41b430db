use crate::server::generator::{KeyAlgorithm, parse_distinguished_name};
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use keyserve_core::types::DEFAULT_MAX_NAME_LEN;
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::PathBuf,
};

/// Upper bound accepted for `--max-name-len`.
const MAX_NAME_LEN_CEILING: usize = 64 * 1024;

/// Runtime configuration for the `keyserve-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a `.env`
/// file is honoured), with defaults suitable for a single host.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "keyserve-server",
    version,
    about = "Issues one key pair and certificate per subject name, shared by every client that asks"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Example: "0.0.0.0:5555" or "localhost:5555"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:5555"))]
    pub server_addr: String,

    /// Number of worker threads generating credentials concurrently.
    ///
    /// Generation is CPU-bound, so this defaults to the number of logical
    /// CPUs. It never affects how many clients can be connected.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Maximum number of subject name bytes buffered per connection.
    ///
    /// A client that sends more before the terminator is disconnected.
    ///
    /// Environment variable: `MAX_NAME_LEN`
    #[arg(long, env = "MAX_NAME_LEN", default_value_t = DEFAULT_MAX_NAME_LEN)]
    pub max_name_len: usize,

    /// Number of readiness events fetched per reactor iteration.
    ///
    /// Environment variable: `EVENTS_CAPACITY`
    #[arg(long, env = "EVENTS_CAPACITY", default_value_t = 1024)]
    pub events_capacity: usize,

    /// Seconds to wait for workers to acknowledge shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// PEM file holding the issuer's private signing key.
    ///
    /// Environment variable: `ISSUER_KEY`
    #[arg(long, env = "ISSUER_KEY")]
    pub issuer_key: PathBuf,

    /// Issuer distinguished name, e.g. "CN=MyIssuer,O=Org,C=US".
    ///
    /// Environment variable: `ISSUER_NAME`
    #[arg(long, env = "ISSUER_NAME")]
    pub issuer_name: String,

    /// Algorithm used for the key pairs handed out to clients.
    ///
    /// Environment variable: `KEY_ALGORITHM`
    #[arg(long, env = "KEY_ALGORITHM", value_enum, default_value_t = KeyAlgorithm::EcdsaP256)]
    pub key_algorithm: KeyAlgorithm,

    /// Validity period of issued certificates, in days.
    ///
    /// Environment variable: `VALIDITY_DAYS`
    #[arg(long, env = "VALIDITY_DAYS", default_value_t = 3650)]
    pub validity_days: u32,
}

/// Settings for the reactor and the worker pool.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: SocketAddr,
    pub num_workers: usize,
    pub max_name_len: usize,
    pub events_capacity: usize,
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// A config listening on `server_addr` with `num_workers` workers and
    /// every other setting at its default.
    pub fn new(server_addr: SocketAddr, num_workers: usize) -> Self {
        Self {
            server_addr,
            num_workers,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            events_capacity: 1024,
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

/// Settings for the issuer-backed credential generator.
#[derive(Debug, Clone)]
pub struct IssuerConfig {
    pub key_path: PathBuf,
    pub distinguished_name: String,
    pub key_algorithm: KeyAlgorithm,
    pub validity_days: u32,
}

/// Everything the binary needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub issuer: IssuerConfig,
}

impl TryFrom<CliArgs> for Settings {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_name_len == 0 || args.max_name_len > MAX_NAME_LEN_CEILING {
            bail!(
                "MAX_NAME_LEN ({}) must be between 1 and {}",
                args.max_name_len,
                MAX_NAME_LEN_CEILING
            );
        }

        if args.events_capacity == 0 {
            bail!("EVENTS_CAPACITY must be greater than 0");
        }

        if args.validity_days == 0 {
            bail!("VALIDITY_DAYS must be greater than 0");
        }

        // Fail fast on a bad issuer name rather than on the first request.
        parse_distinguished_name(&args.issuer_name)
            .with_context(|| format!("invalid ISSUER_NAME '{}'", args.issuer_name))?;

        let server_addr = args
            .server_addr
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve SERVER_ADDR '{}'", args.server_addr))?
            .next()
            .ok_or_else(|| anyhow::anyhow!("SERVER_ADDR '{}' resolved to nothing", args.server_addr))?;

        Ok(Self {
            server: ServerConfig {
                server_addr,
                num_workers: args.num_workers,
                max_name_len: args.max_name_len,
                events_capacity: args.events_capacity,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            },
            issuer: IssuerConfig {
                key_path: args.issuer_key,
                distinguished_name: args.issuer_name,
                key_algorithm: args.key_algorithm,
                validity_days: args.validity_days,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<Settings> {
        let mut argv = vec![
            "keyserve-server",
            "--issuer-key",
            "issuer_key.pem",
            "--issuer-name",
            "CN=MyIssuer,O=Org,C=US",
        ];
        argv.extend_from_slice(extra);
        Settings::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_are_valid() {
        let settings = parse(&["--server-addr", "127.0.0.1:5555", "--num-workers", "4"]).unwrap();
        assert_eq!(settings.server.server_addr, "127.0.0.1:5555".parse().unwrap());
        assert_eq!(settings.server.num_workers, 4);
        assert_eq!(settings.server.max_name_len, DEFAULT_MAX_NAME_LEN);
        assert_eq!(settings.server.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(settings.issuer.key_algorithm, KeyAlgorithm::EcdsaP256);
        assert_eq!(settings.issuer.validity_days, 3650);
    }

    #[test]
    fn rejects_zero_workers() {
        let err = parse(&["--server-addr", "127.0.0.1:0", "--num-workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("NUM_WORKERS"));
    }

    #[test]
    fn rejects_out_of_range_name_len() {
        assert!(parse(&["--server-addr", "127.0.0.1:0", "--max-name-len", "0"]).is_err());
        assert!(parse(&["--server-addr", "127.0.0.1:0", "--max-name-len", "65537"]).is_err());
    }

    #[test]
    fn rejects_bad_issuer_name() {
        let args = CliArgs::try_parse_from([
            "keyserve-server",
            "--server-addr",
            "127.0.0.1:0",
            "--issuer-key",
            "issuer_key.pem",
            "--issuer-name",
            "MyIssuer",
        ])
        .unwrap();
        assert!(Settings::try_from(args).is_err());
    }

    #[test]
    fn parses_key_algorithm() {
        let settings = parse(&["--server-addr", "127.0.0.1:0", "--key-algorithm", "ed25519"]).unwrap();
        assert_eq!(settings.issuer.key_algorithm, KeyAlgorithm::Ed25519);
    }
}
