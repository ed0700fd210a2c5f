//! Scan driver: per task invocation, builds one two-hop circuit per selected
//! exit at a throttled pace and hands each registration (or build failure)
//! to the running [`Engine`](crate::engine::Engine).
//!
//! Grounded on `examples/original_source/src/exitmap.py`'s per-module loop in
//! `main()`: shuffle the exit list, pick a first hop per circuit, call
//! `new_circuit`, then sleep `build_delay ± uniform(0, delay_noise)` clamped
//! at zero before the next one. The engine owns everything downstream of
//! `new_circuit`; the driver's only job is pacing the builds and reporting
//! outcomes through `EngineHandle` (spec.md §4.5).

use crate::descriptors::Fingerprint;
use crate::engine::EngineHandle;
use crate::relay_selector::ExitCandidate;
use crate::tor_control::Controller;
use rand::Rng;
use rand::seq::SliceRandom;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub build_delay: Duration,
    pub delay_noise: Duration,
    pub first_hop: Option<Fingerprint>,
}

/// Builds one circuit per exit in `exits`, in random order. `consensus_fprs`
/// is the pool a random first hop is drawn from when `config.first_hop` is
/// unset; the exit itself is always excluded from that pool so a circuit is
/// never built with the same relay in both hops.
pub async fn run(
    controller: &Controller,
    engine: &EngineHandle,
    mut exits: Vec<ExitCandidate>,
    consensus_fprs: &[Fingerprint],
    config: &DriverConfig,
) {
    let mut rng = rand::thread_rng();
    exits.shuffle(&mut rng);

    let last = exits.len().saturating_sub(1);
    for (i, exit) in exits.into_iter().enumerate() {
        let first_hop = match &config.first_hop {
            Some(fpr) => fpr.clone(),
            None => match random_first_hop(consensus_fprs, &exit.fingerprint, &mut rng) {
                Some(fpr) => fpr,
                None => {
                    tracing::warn!(
                        "no candidate first hop available for exit {} (consensus too small)",
                        exit.fingerprint
                    );
                    engine.build_failed();
                    continue;
                }
            },
        };

        let path = vec![first_hop, exit.fingerprint.clone()];
        match controller.new_circuit(&path).await {
            Ok(circuit_id) => {
                tracing::debug!("building circuit {circuit_id} over {path:?}");
                engine.registered(circuit_id, exit);
            }
            Err(err) => {
                tracing::warn!("new_circuit({path:?}) failed: {err}");
                engine.build_failed();
            }
        }

        if i != last {
            sleep_with_jitter(config.build_delay, config.delay_noise, &mut rng).await;
        }
    }
}

fn random_first_hop(pool: &[Fingerprint], exclude: &str, rng: &mut impl Rng) -> Option<Fingerprint> {
    let candidates: Vec<&Fingerprint> = pool.iter().filter(|fpr| fpr.as_str() != exclude).collect();
    candidates.choose(rng).map(|fpr| (*fpr).clone())
}

async fn sleep_with_jitter(build_delay: Duration, delay_noise: Duration, rng: &mut impl Rng) {
    let noise = if delay_noise.is_zero() {
        Duration::ZERO
    } else {
        let secs = rng.gen_range(0.0..=delay_noise.as_secs_f64());
        Duration::from_secs_f64(secs)
    };
    // spec.md §4.5: `build_delay ± uniform(0, delay_noise)`, clamped at 0.
    // The sign is picked with equal probability each call, matching
    // `exitmap.py`'s `sleep()`; `saturating_sub` covers the clamp since
    // `Duration` has no negative values to begin with.
    let delay = if rng.gen_bool(0.5) {
        build_delay.saturating_add(noise)
    } else {
        build_delay.saturating_sub(noise)
    };
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_first_hop_excludes_the_exit() {
        let pool = vec!["A".to_string(), "B".to_string()];
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let hop = random_first_hop(&pool, "A", &mut rng).unwrap();
            assert_eq!(hop, "B");
        }
    }

    #[test]
    fn random_first_hop_none_when_pool_exhausted() {
        let pool = vec!["A".to_string()];
        let mut rng = rand::thread_rng();
        assert_eq!(random_first_hop(&pool, "A", &mut rng), None);
    }
}
