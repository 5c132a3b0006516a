//! `hemocalc` - command-line companion to the request service
//!
//! - `estimate` runs the blood-loss engine offline, with the same fallback
//!   rule the service applies at completion
//! - `token` mints an access token with the server's configured secret

use anyhow::Context;
use clap::{Parser, Subcommand};
use hemocalc_engine::EstimateInput;
use hemocalc_server::{
    auth::{AuthGate, Identity, MemoryRevocationList},
    logging,
    models::UserId,
    Config,
};
use serde_json::json;
use std::{sync::Arc, time::Duration};

#[derive(Parser)]
#[command(name = "hemocalc")]
#[command(about = "Blood-loss estimation tools", version)]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate blood loss for one operation
    Estimate {
        #[arg(long)]
        height_cm: f64,
        #[arg(long)]
        weight_kg: f64,
        /// Hemoglobin before surgery (g/L)
        #[arg(long)]
        hb_before: i32,
        /// Hemoglobin after surgery (g/L)
        #[arg(long)]
        hb_after: i32,
        #[arg(long)]
        duration_hours: f64,
        /// Operation blood-loss coefficient
        #[arg(long)]
        coeff: f64,
        /// Operation average blood loss (mL); enables the fallback on rejected input
        #[arg(long)]
        avg_blood_loss: Option<i32>,
        /// Print a JSON object instead of plain text
        #[arg(long)]
        json: bool,
    },
    /// Mint an access token signed with `auth.jwt_secret`
    Token {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        username: String,
        #[arg(long)]
        moderator: bool,
        /// Lifetime in seconds (defaults to `auth.token_ttl_seconds`)
        #[arg(long)]
        ttl_seconds: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_simple_logging(&cli.log_level);

    match cli.command {
        Commands::Estimate {
            height_cm,
            weight_kg,
            hb_before,
            hb_after,
            duration_hours,
            coeff,
            avg_blood_loss,
            json,
        } => {
            let input = EstimateInput {
                height_cm,
                weight_kg,
                hb_before,
                hb_after,
                duration_hours,
                coeff,
            };
            let (ml, source) = match (hemocalc_engine::estimate(&input), avg_blood_loss) {
                (Ok(ml), _) => (ml, "estimated"),
                (Err(err), Some(avg)) => {
                    tracing::warn!(field = err.field(), error = %err, "Input rejected, using fallback");
                    (hemocalc_engine::fallback_ml(coeff, avg), "fallback")
                }
                (Err(err), None) => {
                    let field = err.field();
                    return Err(anyhow::Error::new(err).context(format!("invalid {field}")));
                }
            };

            if json {
                let blood_volume = hemocalc_engine::blood_volume_ml(height_cm, weight_kg);
                println!(
                    "{}",
                    json!({
                        "total_blood_loss_ml": ml,
                        "source": source,
                        "blood_volume_ml": blood_volume,
                    })
                );
            } else {
                println!("{ml} mL ({source})");
            }
        }
        Commands::Token {
            user_id,
            username,
            moderator,
            ttl_seconds,
        } => {
            let config = Config::load().context("Failed to load configuration")?;
            config
                .validate()
                .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

            let gate = AuthGate::new(config.auth, Arc::new(MemoryRevocationList::new()));
            let identity = Identity {
                user_id: UserId(user_id),
                username,
                is_moderator: moderator,
            };
            let token = gate
                .issue(&identity, ttl_seconds.map(Duration::from_secs))
                .map_err(|e| anyhow::anyhow!("{e:?}"))?;
            println!("{token}");
        }
    }

    Ok(())
}
