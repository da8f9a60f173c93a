use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

use quantumshield_core::pqc::{kem_keygen, sig_keygen};
use quantumshield_relay::{
    init_observability, MemoryDirectory, MemoryFriendStore, RelayConfig, RelayServer, UserRecord,
};

#[derive(Parser, Debug)]
#[command(name = "quantumshield-relay", about = "QuantumShield realtime relay server", version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "QUANTUMSHIELD_CONFIG")]
    config: Option<String>,

    /// Register demo users (alice=10, bob=11) and log their tokens.
    /// Development only.
    #[arg(long, default_value_t = false)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_observability()?;

    if let Some(path) = &args.config {
        std::env::set_var("QUANTUMSHIELD_CONFIG", path);
    }

    let config = match RelayConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    // Fatal misconfiguration refuses to start.
    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        std::process::exit(1);
    }
    info!("✅ configuration loaded");

    let directory = Arc::new(MemoryDirectory::new());
    let friends = Arc::new(MemoryFriendStore::new());

    if args.seed_demo {
        seed_demo_users(&directory, &config)?;
    }

    let server = RelayServer::new(config, directory, friends);

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!("server error: {e}");
                std::process::exit(1);
            }
        }
        _ = signal::ctrl_c() => {
            info!("🛑 shutdown signal received");
        }
    }
    info!("relay stopped");
    Ok(())
}

fn seed_demo_users(directory: &MemoryDirectory, config: &RelayConfig) -> Result<()> {
    let jwt = quantumshield_relay::JwtService::new(config.auth.jwt_secret.as_bytes());
    for (user_id, username) in [(10u64, "alice"), (11u64, "bob")] {
        let (kem_pk, _) = kem_keygen();
        let (sig_pk, _) = sig_keygen();
        directory
            .register(UserRecord {
                user_id,
                username: username.to_string(),
                kem_public_key: kem_pk,
                sig_public_key: sig_pk,
            })
            .map_err(|e| anyhow::anyhow!("seed failed: {e}"))?;
        let token = jwt
            .issue_token(user_id, username, chrono::Duration::hours(24))
            .map_err(|e| anyhow::anyhow!("seed token failed: {e}"))?;
        info!(user_id, username = %username, token = %token, "demo user seeded");
    }
    Ok(())
}
