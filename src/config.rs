//! Pacing engine configuration.
//! All tunables live here; the engine keeps no process-wide state, so two
//! independently configured writers can coexist in one process.

use std::time::Duration;

use crate::error::Error;
use crate::MAX_PACKETS_PER_ITEM;

/// Configuration for the ring buffer and pacing engine.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Usable ring slots (the ring allocates one extra, kept empty)
    pub ring_slots: usize,
    /// TS packets per ring item (max 7, one Ethernet MTU)
    pub packets_per_item: usize,
    /// Max back-to-back sends without a pacing sleep; None disables the cap
    pub max_nowait: Option<u32>,
    /// Gap imposed after the burst cap is hit, in microseconds
    pub burst_gap_us: u64,
    /// Initial byte rate, used until the first PCR is seen (bytes/second)
    pub byterate: u32,
    /// Lock item timestamps to the stream's PCRs
    pub use_pcrs: bool,
    /// Items' worth of bytes credited when the rate pool is primed
    pub prime_size: usize,
    /// Prime-rate percentage (100 = nominal, 200 = prime at double speed)
    pub prime_speedup: u32,
    /// Multiply incoming PCRs by this before use
    pub pcr_scale: f64,
    /// Producer poll interval while the ring is full
    pub producer_poll: Duration,
    /// Pacer poll interval while the ring is empty
    pub consumer_poll: Duration,
    /// Full-ring polls before the producer declares the pacer dead
    pub producer_give_up_after: u32,
    /// Artificial clock jitter for desynchronization testing
    pub perturb: Option<PerturbConfig>,
}

/// Test knob: perturb the pacer's view of its own clock by a uniform random
/// offset each item, to exercise timeline-drift handling.
#[derive(Debug, Clone, Copy)]
pub struct PerturbConfig {
    /// RNG seed (0 is mapped to a fixed nonzero seed)
    pub seed: u32,
    /// Offset range in milliseconds; each item sees [-range, +range]
    pub range_ms: u32,
    /// Log every applied offset
    pub verbose: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            ring_slots: 100,
            packets_per_item: MAX_PACKETS_PER_ITEM,
            max_nowait: Some(30),
            burst_gap_us: 1000,
            byterate: 250_000,
            use_pcrs: true,
            prime_size: 10,
            prime_speedup: 100,
            pcr_scale: 1.0,
            producer_poll: Duration::from_millis(50),
            consumer_poll: Duration::from_millis(10),
            producer_give_up_after: 1000,
            perturb: None,
        }
    }
}

impl PacingConfig {
    /// Set the initial rate in bits per second.
    pub fn with_bitrate(mut self, bits_per_second: u32) -> Self {
        self.byterate = bits_per_second / 8;
        self
    }

    /// Bytes held by one ring item.
    pub fn item_size(&self) -> usize {
        self.packets_per_item * crate::TS_PACKET_SIZE
    }

    /// Reject nonsensical settings up front.
    pub fn validate(&self) -> Result<(), Error> {
        if self.ring_slots < 2 {
            return Err(Error::Config("ring needs at least 2 slots"));
        }
        if self.packets_per_item == 0 || self.packets_per_item > MAX_PACKETS_PER_ITEM {
            return Err(Error::Config("packets per item must be 1..=7"));
        }
        if self.byterate == 0 {
            return Err(Error::Config("byterate must be nonzero"));
        }
        if self.prime_size == 0 {
            return Err(Error::Config("prime size must be nonzero"));
        }
        if self.prime_speedup == 0 {
            return Err(Error::Config("prime speedup must be nonzero"));
        }
        if self.producer_poll.is_zero() || self.consumer_poll.is_zero() {
            return Err(Error::Config("poll intervals must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PacingConfig::default().validate().is_ok());
        assert_eq!(PacingConfig::default().item_size(), 1316);
    }

    #[test]
    fn rejects_zero_sizes() {
        let cfg = PacingConfig {
            ring_slots: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PacingConfig {
            prime_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PacingConfig {
            packets_per_item: 8,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bitrate_helper_converts_to_bytes() {
        let cfg = PacingConfig::default().with_bitrate(2_000_000);
        assert_eq!(cfg.byterate, 250_000);
    }
}
