use rand::Rng;

use crate::config::ReconnectCfg;

/// Delay before reconnect attempt `attempt` (1-based): exponential, capped, plus jitter.
pub fn backoff_ms(attempt: u32, cfg: &ReconnectCfg) -> u64 {
    let pow = cfg.backoff_factor.powi((attempt.saturating_sub(1)) as i32);
    let core = ((cfg.backoff_base_ms as f64 * pow).round() as u64).min(cfg.max_backoff_ms);
    let jitter = if cfg.backoff_jitter_ms > 0 { rand::rng().random_range(0..=cfg.backoff_jitter_ms) } else { 0 };
    core + jitter
}
