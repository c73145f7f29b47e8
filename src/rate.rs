//! PCR-locked rate controller.
//!
//! Converts the Program Clock References observed in the stream into a
//! continuously refined byte-rate estimate and assigns every closed ring
//! item a target send time on a microsecond timeline.
//!
//! Rates are smoothed through a credit pool of (bytes, time): each PCR
//! interval deposits its bytes and their cost at the current rate estimate,
//! and each item withdraws its bytes and a proportional share of the pooled
//! time. A single noisy PCR therefore cannot distort pacing by more than
//! its share of the pool.

use log::{debug, warn};

use crate::config::PacingConfig;
use crate::TS_PACKET_SIZE;

/// A PCR observation: the 27 MHz tick value and the sequence number of the
/// packet that carried it.
#[derive(Debug, Clone, Copy)]
pub struct PcrSample {
    /// Packet sequence number since the start of the stream
    pub index: u64,
    /// PCR in 27 MHz ticks, already scaled
    pub pcr: u64,
}

#[derive(Debug, Default)]
struct RateState {
    available_bytes: f64,
    available_time_us: f64,
    last_pcr: u64,
    last_pcr_index: u64,
    had_first_pcr: bool,
    had_second_pcr: bool,
    pcr_rate_bps: f64,
    last_timestamp_us: f64,
    last_timestamp_near_pcr_us: i64,
    initial_prime_bytes: f64,
    initial_prime_time_us: f64,
}

/// Assigns send times to items as they close.
pub struct RateController {
    item_size: usize,
    prime_size: usize,
    prime_speedup: u32,
    byterate: u32,
    use_pcrs: bool,
    state: RateState,
}

impl RateController {
    pub fn new(cfg: &PacingConfig) -> Self {
        Self {
            item_size: cfg.item_size(),
            prime_size: cfg.prime_size,
            prime_speedup: cfg.prime_speedup,
            byterate: cfg.byterate,
            use_pcrs: cfg.use_pcrs,
            state: RateState::default(),
        }
    }

    /// Close an item of `num_bytes`, carrying the first PCR seen in it (if
    /// any). Returns the item's send time in microseconds and whether a PCR
    /// rollback was detected; on rollback the caller marks the *next* item
    /// discontinuous, since the pool re-primes from there.
    pub fn close_item(&mut self, num_bytes: usize, pcr: Option<PcrSample>) -> (i64, bool) {
        if !self.use_pcrs {
            let delta = num_bytes as f64 * 1e6 / self.byterate as f64;
            self.state.last_timestamp_us += delta;
            return (self.state.last_timestamp_us.round() as i64, false);
        }

        let s = &mut self.state;

        // Prime the credit pool when exhausted.
        if s.available_bytes <= 0.0 || s.available_time_us <= 0.0 {
            let rate = if s.had_first_pcr {
                s.pcr_rate_bps
            } else {
                self.byterate as f64
            };
            s.available_bytes = (self.item_size * self.prime_size) as f64;
            s.available_time_us =
                s.available_bytes * 1e6 / (rate * self.prime_speedup as f64 / 100.0);
            if !s.had_first_pcr {
                // Remember the guess so it can be undone once the true rate
                // is known.
                s.initial_prime_bytes = s.available_bytes;
                s.initial_prime_time_us = s.available_time_us;
            }
            debug!(
                "rate: primed pool, {:.0} bytes / {:.0} us at {:.0} B/s",
                s.available_bytes,
                s.available_time_us,
                rate
            );
        }

        // Charge this item against the pool.
        let num = num_bytes as f64;
        let delta = num / s.available_bytes * s.available_time_us;
        s.last_timestamp_us += delta;
        s.available_bytes -= num;
        s.available_time_us -= delta;
        let timestamp = s.last_timestamp_us.round() as i64;

        let mut rollback = false;
        if let Some(sample) = pcr {
            if s.had_first_pcr && sample.pcr < s.last_pcr {
                // PCR went backwards: discontinuity. Forget the rate history
                // and force a re-prime on the next item.
                warn!(
                    "rate: PCR rollback ({} < {}), timeline restarts",
                    sample.pcr, s.last_pcr
                );
                s.had_first_pcr = false;
                s.had_second_pcr = false;
                s.available_bytes = 0.0;
                s.available_time_us = 0.0;
                rollback = true;
            } else if !s.had_first_pcr {
                s.had_first_pcr = true;
                s.last_pcr = sample.pcr;
                s.last_pcr_index = sample.index;
                s.last_timestamp_near_pcr_us = timestamp;
            } else if sample.pcr > s.last_pcr {
                let delta_pcr = (sample.pcr - s.last_pcr) as f64;
                let delta_bytes =
                    ((sample.index - s.last_pcr_index) * TS_PACKET_SIZE as u64) as f64;
                s.pcr_rate_bps = delta_bytes * 27e6 / delta_pcr;
                s.available_bytes += delta_bytes;
                s.available_time_us += delta_bytes * 1e6 / s.pcr_rate_bps;
                if !s.had_second_pcr {
                    // Replace the initial guess with credit at the true rate.
                    s.available_time_us -= s.initial_prime_time_us;
                    s.available_time_us += s.initial_prime_bytes * 1e6 / s.pcr_rate_bps;
                    s.had_second_pcr = true;
                }
                s.last_pcr = sample.pcr;
                s.last_pcr_index = sample.index;
                s.last_timestamp_near_pcr_us = timestamp;
                debug!(
                    "rate: {:.0} B/s over {} bytes, pool {:.0} bytes / {:.0} us, stamp {} us",
                    s.pcr_rate_bps,
                    delta_bytes,
                    s.available_bytes,
                    s.available_time_us,
                    s.last_timestamp_near_pcr_us
                );
            }
            // A repeated PCR value carries no rate information; ignore it.
        }

        (timestamp, rollback)
    }

    /// Current rate estimate in bytes per second (the configured seed rate
    /// until two PCRs have been seen).
    pub fn rate_bps(&self) -> f64 {
        if self.state.had_first_pcr && self.state.pcr_rate_bps > 0.0 {
            self.state.pcr_rate_bps
        } else {
            self.byterate as f64
        }
    }

    /// Send time assigned to the most recently closed item.
    pub fn last_timestamp_us(&self) -> i64 {
        self.state.last_timestamp_us.round() as i64
    }

    #[cfg(test)]
    fn pool(&self) -> (f64, f64) {
        (self.state.available_bytes, self.state.available_time_us)
    }
}
