use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng, RngCore};
use serde::{Deserialize, Serialize};

/// How many eligible entries leave the incoming pool on each tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MixStrategy {
    /// Everything eligible goes.
    Flush,
    /// Each eligible entry goes independently with this probability.
    Binomial { probability: f64 },
    /// Keep `min_pool` entries back; send `send_fraction` of the rest.
    Dynamic { min_pool: usize, send_fraction: f64 },
}

impl Default for MixStrategy {
    fn default() -> Self {
        MixStrategy::Dynamic {
            min_pool: 5,
            send_fraction: 0.6,
        }
    }
}

impl MixStrategy {
    pub fn validate(&self) -> Result<(), &'static str> {
        match *self {
            MixStrategy::Flush => Ok(()),
            MixStrategy::Binomial { probability } => {
                if (0.0..=1.0).contains(&probability) {
                    Ok(())
                } else {
                    Err("binomial probability must be within [0, 1]")
                }
            }
            MixStrategy::Dynamic { send_fraction, .. } => {
                if (0.0..=1.0).contains(&send_fraction) {
                    Ok(())
                } else {
                    Err("send fraction must be within [0, 1]")
                }
            }
        }
    }

    /// Picks the entries to release, in a random order. `pool_len` counts
    /// every entry in the pool, eligible or not.
    pub fn select<T, R: RngCore + CryptoRng>(
        &self,
        pool_len: usize,
        mut eligible: Vec<T>,
        rng: &mut R,
    ) -> Vec<T> {
        eligible.shuffle(rng);
        match *self {
            MixStrategy::Flush => eligible,
            MixStrategy::Binomial { probability } => {
                let probability = probability.clamp(0.0, 1.0);
                eligible
                    .into_iter()
                    .filter(|_| rng.gen_bool(probability))
                    .collect()
            }
            MixStrategy::Dynamic {
                min_pool,
                send_fraction,
            } => {
                let surplus = pool_len.saturating_sub(min_pool) as f64;
                let count = (surplus * send_fraction.clamp(0.0, 1.0)).floor() as usize;
                eligible.truncate(count);
                eligible
            }
        }
    }
}
