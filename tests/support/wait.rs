use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

pub async fn wait_for<T, F, Fut>(description: &str, timeout: Duration, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut sleep_for = Duration::from_millis(10);

    loop {
        let now = Instant::now();
        if now >= deadline {
            anyhow::bail!("timeout waiting for {description}");
        }

        if let Some(value) = f().await.with_context(|| format!("poll {description}"))? {
            return Ok(value);
        }

        tokio::time::sleep(sleep_for).await;
        sleep_for = (sleep_for * 2).min(Duration::from_millis(250));
    }
}

/// Mines a block every `interval` until `task` finishes.
pub async fn mine_until<T>(
    harness: &super::harness::Harness,
    task: &mut tokio::task::JoinHandle<T>,
    interval: Duration,
    max_blocks: u32,
) -> Result<T> {
    for _ in 0..max_blocks {
        harness.mine_block();
        tokio::select! {
            res = &mut *task => return res.context("join swap task"),
            _ = tokio::time::sleep(interval) => {}
        }
    }
    anyhow::bail!("swap did not finish within {max_blocks} blocks")
}
