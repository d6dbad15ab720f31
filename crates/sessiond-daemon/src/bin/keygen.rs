//! sessiond-keygen - one-shot owner-key generation worker.
//!
//! Forked by the daemon as the session user's uid. Creates a keypair in the
//! user's keystore, writes the public half atomically to the output file,
//! and exits 0; the daemon imports the file when the child exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sessiond_core::crypto::{Crypto, OwnerKeystore};
use sessiond_core::keygen::generate_owner_key;
use sessiond_core::system::{RealSystem, SystemOps};

/// sessiond-keygen - owner key generation worker
#[derive(Parser, Debug)]
#[command(name = "sessiond-keygen")]
#[command(version, about, long_about = None)]
struct Args {
    /// File to write the public key to
    #[arg(long)]
    file: PathBuf,

    /// Home directory holding the user's keystore
    #[arg(long)]
    homedir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&args.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let system: Arc<dyn SystemOps> = Arc::new(RealSystem::new());
    let crypto: Arc<dyn Crypto> = Arc::new(OwnerKeystore::new());

    match generate_owner_key(&args.file, &args.homedir, &system, &crypto) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "owner key generation failed");
            ExitCode::FAILURE
        },
    }
}
