use std::path::PathBuf;
use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use bitcoin::{Address, FeeRate, OutPoint, Txid};
use clap::{Parser as _, Subcommand};
use ln_chain_swap::EngineConfig;
use ln_chain_swap::chain::htlc::SpendPath;
use ln_chain_swap::swap::escrow::{fallback_path, spend_preview};
use ln_chain_swap::swap::recovery;
use serde_json::json;

#[derive(Debug, clap::Parser)]
struct Args {
    /// Engine configuration (JSON). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the fields stored in a recovery token.
    DecodeRecovery {
        #[arg(long)]
        token: String,
    },
    /// Build the unsigned fallback spend of the escrow in a recovery token.
    RefundPreview {
        #[arg(long)]
        token: String,

        #[arg(long)]
        deposit_txid: String,

        #[arg(long)]
        deposit_vout: u32,

        #[arg(long)]
        deposit_tokens: u64,

        #[arg(long)]
        address: String,

        /// sat/vB. Defaults to the configured minimum sweep fee rate.
        #[arg(long)]
        fee_rate: Option<u64>,
    },
    /// Print the effective engine configuration.
    ShowConfig,
}

fn main() -> Result<()> {
    ln_chain_swap::logging::init().ok();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let out = match args.command {
        Command::DecodeRecovery { token } => {
            let recovery = recovery::decode(&token).context("decode recovery token")?;
            let swap = &recovery.swap;
            let escrow = swap.escrow()?;

            json!({
              "id": swap.id_hex(),
              "direction": swap.direction,
              "status": swap.status,
              "network": recovery.network.to_string(),
              "tokens": swap.tokens,
              "service_fee": swap.service_fee,
              "prepay_tokens": swap.prepay_tokens,
              "fee_budget": swap.fee_budget,
              "funding_confirmations": swap.funding_confirmations,
              "escrow": {
                "version": escrow.version,
                "address": escrow.address.to_string(),
                "witness_script": hex::encode(escrow.script.as_bytes()),
                "claim_public_key": escrow.claim_public_key.to_string(),
                "refund_public_key": escrow.refund_public_key.to_string(),
                "timeout_height": escrow.timeout_height,
                "start_height": escrow.start_height,
                "key_family": escrow.key.family,
                "key_index": escrow.key.index,
                "has_secret": escrow.secret.is_some(),
              },
              "refund_address": swap.refund_address.as_ref().map(ToString::to_string),
              "deposit": swap.deposit,
              "settlement": swap.settlement,
              "sweeps": swap.sweeps,
              "swept": swap.swept,
            })
        }
        Command::RefundPreview {
            token,
            deposit_txid,
            deposit_vout,
            deposit_tokens,
            address,
            fee_rate,
        } => {
            let recovery = recovery::decode(&token).context("decode recovery token")?;
            let swap = &recovery.swap;
            let escrow = swap.escrow()?;

            let txid = Txid::from_str(&deposit_txid).context("parse deposit txid")?;
            let destination = Address::from_str(&address)
                .context("parse address")?
                .require_network(recovery.network)
                .context("address network")?;
            let fee_rate = FeeRate::from_sat_per_vb_unchecked(
                fee_rate.unwrap_or(config.min_sweep_fee_rate_sat_vb),
            );

            let preview = spend_preview(
                escrow,
                swap.id,
                OutPoint {
                    txid,
                    vout: deposit_vout,
                },
                deposit_tokens,
                &destination,
                fee_rate,
            )?;
            let path = match fallback_path(escrow) {
                SpendPath::Claim { .. } => "claim",
                SpendPath::Refund => "refund",
            };

            json!({
              "path": path,
              "txid": preview.transaction.compute_txid().to_string(),
              "locktime": preview.transaction.lock_time.to_consensus_u32(),
              "chain_fee": preview.chain_fee,
              "output_tokens": deposit_tokens - preview.chain_fee,
              "transaction": bitcoin::consensus::encode::serialize_hex(&preview.transaction),
            })
        }
        Command::ShowConfig => serde_json::to_value(&config).context("encode config")?,
    };

    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
