use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bitcoin::{FeeRate, Network};
use serde::{Deserialize, Serialize};

/// Tunables of the swap engine.
///
/// None of these are protocol constants. Defaults are conservative mainnet
/// values and every field may be overridden from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub network: Network,

    /// Key family handed to the node when deriving escrow keys.
    pub key_family: u32,

    pub block_time_secs: u64,
    pub min_swap_duration_secs: u64,

    pub funding_confirmations: u32,
    pub sweep_confirmations: u32,
    pub safety_buffer_blocks: u32,

    pub mempool_check_attempts: u32,
    pub funding_poll_interval_ms: u64,
    pub funding_poll_attempts: u32,
    pub funding_timeout_secs: u64,
    pub settlement_timeout_secs: u64,
    pub invoice_expiry_secs: u32,

    pub sweep_conf_target: u32,
    pub min_sweep_fee_rate_sat_vb: u64,
    pub max_fee_multiplier: u64,
    /// Block heights a dry run builds sweep candidates for.
    pub dry_run_blocks: u32,

    pub max_service_fee_ppm: u64,
    pub max_routing_fee_ppm: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            key_family: 42069,
            block_time_secs: 600,
            min_swap_duration_secs: 2 * 60 * 60,
            funding_confirmations: 1,
            sweep_confirmations: 2,
            safety_buffer_blocks: 6,
            mempool_check_attempts: 3,
            funding_poll_interval_ms: 5_000,
            funding_poll_attempts: 720,
            funding_timeout_secs: 60 * 60,
            settlement_timeout_secs: 60 * 60,
            invoice_expiry_secs: 24 * 60 * 60,
            sweep_conf_target: 6,
            min_sweep_fee_rate_sat_vb: 2,
            max_fee_multiplier: 50,
            dry_run_blocks: 6,
            max_service_fee_ppm: 50_000,
            max_routing_fee_ppm: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.block_time_secs > 0, "block_time_secs must be > 0");
        anyhow::ensure!(
            self.funding_confirmations > 0,
            "funding_confirmations must be > 0"
        );
        anyhow::ensure!(
            self.sweep_confirmations > 0,
            "sweep_confirmations must be > 0"
        );
        anyhow::ensure!(self.max_fee_multiplier > 0, "max_fee_multiplier must be > 0");
        anyhow::ensure!(
            self.min_sweep_fee_rate_sat_vb > 0,
            "min_sweep_fee_rate_sat_vb must be > 0"
        );
        anyhow::ensure!(self.funding_poll_attempts > 0, "funding_poll_attempts must be > 0");
        anyhow::ensure!(self.dry_run_blocks > 0, "dry_run_blocks must be > 0");
        anyhow::ensure!(
            self.max_service_fee_ppm <= 1_000_000,
            "max_service_fee_ppm must be <= 1000000"
        );
        Ok(())
    }

    /// Expected wall time for `blocks` blocks.
    pub fn blocks_duration(&self, blocks: u32) -> Duration {
        Duration::from_secs(u64::from(blocks).saturating_mul(self.block_time_secs))
    }

    pub fn min_swap_duration(&self) -> Duration {
        Duration::from_secs(self.min_swap_duration_secs)
    }

    pub fn funding_poll_interval(&self) -> Duration {
        Duration::from_millis(self.funding_poll_interval_ms)
    }

    pub fn funding_timeout(&self) -> Duration {
        Duration::from_secs(self.funding_timeout_secs)
    }

    pub fn settlement_timeout(&self) -> Duration {
        Duration::from_secs(self.settlement_timeout_secs)
    }

    pub fn min_sweep_fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_vb_unchecked(self.min_sweep_fee_rate_sat_vb)
    }

    /// Blocks the escrow must stay open for beyond its start height.
    pub fn required_escrow_blocks(&self, funding_confirmations: u32) -> u32 {
        funding_confirmations
            .saturating_add(self.sweep_confirmations)
            .saturating_add(self.safety_buffer_blocks)
    }

    pub fn max_routing_fee(&self, tokens: u64) -> u64 {
        tokens.saturating_mul(self.max_routing_fee_ppm) / 1_000_000
    }
}
