#![doc = include_str!("../README.md")]

use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use keyserve_core::{Credential, encode_request, read_response, types::DEFAULT_MAX_BLOB_LEN};
use std::{
    io::Write,
    net::TcpStream,
    path::{Path, PathBuf},
    thread,
};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(
    name = "keyserve-client",
    version,
    about = "Requests a key pair and certificate for a subject name"
)]
struct ClientArgs {
    /// Subject name to request.
    name: String,

    /// Server host name or address.
    host: String,

    /// Server port.
    port: u16,

    /// Seconds to wait after sending before reading the response.
    #[arg(long, default_value_t = 0)]
    delay: u64,

    /// Disconnect right after sending the name, without reading.
    #[arg(long)]
    exit_after_send: bool,

    /// Directory the `.key` and `.crt` files are written to.
    #[arg(long, env = "KEYSERVE_OUT_DIR", default_value = ".")]
    out_dir: PathBuf,

    /// Largest key or certificate accepted from the server, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_BLOB_LEN)]
    max_blob_len: usize,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = ClientArgs::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()?;

    let request = encode_request(&args.name)
        .with_context(|| format!("cannot request name '{}'", args.name))?;

    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
    stream
        .write_all(&request)
        .context("failed to send request")?;
    tracing::info!(name = %args.name, "Request sent");

    if args.exit_after_send {
        tracing::info!("Exiting without reading the response");
        return Ok(());
    }

    if args.delay > 0 {
        tracing::info!("Waiting {}s before reading", args.delay);
        thread::sleep(Duration::from_secs(args.delay));
    }

    let credential = match read_response(&mut stream, args.max_blob_len) {
        Ok(credential) => credential,
        Err(e) => bail!("server closed without a credential for '{}': {e}", args.name),
    };

    let (key_path, cert_path) = write_credential(&args.out_dir, &args.name, &credential)?;
    tracing::info!(
        key = %key_path.display(),
        cert = %cert_path.display(),
        "Credential written"
    );
    Ok(())
}

fn write_credential(
    out_dir: &Path,
    name: &str,
    credential: &Credential,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        bail!("name '{name}' cannot be used as a file name");
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let key_path = out_dir.join(format!("{name}.key"));
    let cert_path = out_dir.join(format!("{name}.crt"));
    std::fs::write(&key_path, &credential.key_pem)
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    std::fs::write(&cert_path, &credential.cert_pem)
        .with_context(|| format!("failed to write {}", cert_path.display()))?;

    Ok((key_path, cert_path))
}
