//! The pacing consumer.
//!
//! Runs on its own thread, draining stamped items from the ring and sending
//! each one when its target time comes up on the pacer's monotonic clock.
//! The producer's timeline and ours drift, so the loop re-anchors whenever
//! it finds itself hopelessly behind, and a burst cap keeps back-to-back
//! sends from flooding downstream hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::command::CommandState;
use crate::config::{PacingConfig, PerturbConfig};
use crate::error::Error;
use crate::ring::RingConsumer;
use crate::sink::Sink;
use crate::TS_SYNC_BYTE;

/// Lateness beyond which the pacer gives up catching up and re-anchors.
const RESET_THRESHOLD_US: i64 = 200_000;

/// Pacing knobs the consumer thread needs.
#[derive(Debug, Clone)]
pub struct PacerSettings {
    pub max_nowait: Option<u32>,
    pub burst_gap_us: u64,
    pub perturb: Option<PerturbConfig>,
}

impl PacerSettings {
    pub fn from_config(cfg: &PacingConfig) -> Self {
        Self {
            max_nowait: cfg.max_nowait,
            burst_gap_us: cfg.burst_gap_us,
            perturb: cfg.perturb,
        }
    }
}

/// Counters kept by the pacer thread (lock-free snapshot access).
#[derive(Default)]
struct SharedStats {
    items_sent: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    timeline_resets: AtomicU64,
    items_dropped: AtomicU64,
}

/// Statistics snapshot for external access.
#[derive(Debug, Default, Clone)]
pub struct PacerStats {
    /// Ring items delivered to the sink
    pub items_sent: u64,
    /// TS packets delivered to the sink
    pub packets_sent: u64,
    /// Bytes delivered to the sink
    pub bytes_sent: u64,
    /// Failed UDP sends (payload discarded, pipeline kept going)
    pub send_errors: u64,
    /// Times the pacer re-anchored after falling behind
    pub timeline_resets: u64,
    /// Items skipped by the sync-byte guard or the drop knob
    pub items_dropped: u64,
}

/// Deliberate degradation: after every `every` items sent, skip `count`.
#[derive(Debug, Clone, Copy)]
struct PacketDrop {
    every: u32,
    count: u32,
}

/// State shared between the pacer thread and the producer-side API:
/// command channel state, statistics, and the packet-drop test knob.
pub struct PacerShared {
    commands: CommandState,
    stats: SharedStats,
    drop: Mutex<Option<PacketDrop>>,
}

impl PacerShared {
    pub fn new() -> Self {
        Self {
            commands: CommandState::new(),
            stats: SharedStats::default(),
            drop: Mutex::new(None),
        }
    }

    pub fn commands(&self) -> &CommandState {
        &self.commands
    }

    pub fn stats(&self) -> PacerStats {
        PacerStats {
            items_sent: self.stats.items_sent.load(Ordering::Relaxed),
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.stats.send_errors.load(Ordering::Relaxed),
            timeline_resets: self.stats.timeline_resets.load(Ordering::Relaxed),
            items_dropped: self.stats.items_dropped.load(Ordering::Relaxed),
        }
    }

    /// Drop `count` items after every `every` sent; `every == 0` disables.
    pub fn set_packet_drop(&self, every: u32, count: u32) {
        let mut drop = self.drop.lock();
        *drop = if every == 0 || count == 0 {
            None
        } else {
            Some(PacketDrop { every, count })
        };
    }
}

impl Default for PacerShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Seeded xorshift for the clock-perturbation test knob.
struct Perturb {
    state: u32,
    range_ms: u32,
    verbose: bool,
}

impl Perturb {
    fn new(cfg: &PerturbConfig) -> Self {
        Self {
            state: if cfg.seed == 0 { 0x2545_F491 } else { cfg.seed },
            range_ms: cfg.range_ms,
            verbose: cfg.verbose,
        }
    }

    /// Uniform offset in [-range_ms, +range_ms], in microseconds.
    fn next_offset_us(&mut self) -> i64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        let span = 2 * self.range_ms as i64 + 1;
        (x as i64 % span - self.range_ms as i64) * 1000
    }
}

/// Consumer-local pacing state.
struct PacerState {
    /// True until the ring has filled once
    starting: bool,
    /// Re-anchor the timeline at the next item
    reset: bool,
    /// Monotonic anchor chosen at the last reset
    start_wall: Option<Instant>,
    /// Producer-timeline offset at the anchor
    delta_start_us: i64,
    last_packet_time_us: i64,
    sent_without_delay: u32,
}

impl PacerState {
    fn new() -> Self {
        Self {
            starting: true,
            reset: true,
            start_wall: None,
            delta_start_us: 0,
            last_packet_time_us: 0,
            sent_without_delay: 0,
        }
    }

    /// Decide how long to wait before sending an item stamped `t_pkt`.
    /// Returns the wait in microseconds and whether a drift reset was taken.
    fn wait_for(
        &mut self,
        t_pkt: i64,
        discontinuity: bool,
        now: Instant,
        perturb: &mut Option<Perturb>,
        settings: &PacerSettings,
    ) -> (u64, bool) {
        let gap = t_pkt - self.last_packet_time_us;
        let anchor = *self.start_wall.get_or_insert(now);
        let mut our_time_now = now.saturating_duration_since(anchor).as_micros() as i64;
        if let Some(p) = perturb.as_mut() {
            let offset = p.next_offset_us();
            our_time_now += offset;
            if p.verbose {
                debug!("pacer: perturbing clock by {offset} us");
            }
        }

        let mut took_reset = false;
        let mut waitfor: i64;
        if self.reset || discontinuity {
            self.start_wall = Some(now);
            self.delta_start_us = t_pkt;
            waitfor = 0;
            self.reset = false;
        } else {
            let adjusted_now = our_time_now + self.delta_start_us;
            waitfor = t_pkt - adjusted_now;
        }

        if waitfor <= -RESET_THRESHOLD_US {
            // Hopelessly behind the producer timeline. Re-anchor at the next
            // item instead of blasting a catch-up burst -- unless the clock
            // is being perturbed on purpose.
            let perturbed = perturb.as_ref().is_some_and(|p| p.range_ms > 0);
            if !perturbed {
                self.reset = true;
                took_reset = true;
            }
            waitfor = 0;
        } else if waitfor < 0 {
            // Small lateness is tolerated.
            waitfor = 0;
        }

        // Hardware-protection rule: at most max_nowait sends back-to-back.
        // The send behind the forced gap opens the next window, so the gap
        // comes around every max_nowait items while the backlog lasts.
        if waitfor == 0 {
            if let Some(cap) = settings.max_nowait {
                if self.sent_without_delay < cap {
                    self.sent_without_delay += 1;
                } else {
                    waitfor = settings.burst_gap_us as i64;
                    self.sent_without_delay = 1;
                }
            }
        } else {
            self.sent_without_delay = 0;
        }

        debug!("pacer: item at {t_pkt} us, gap {gap} us, waiting {waitfor} us");
        self.last_packet_time_us = t_pkt;
        (waitfor as u64, took_reset)
    }
}

/// Spawn the pacer thread.
pub fn spawn(
    ring: RingConsumer,
    sink: Sink,
    shared: Arc<PacerShared>,
    settings: PacerSettings,
) -> Result<JoinHandle<Result<(), Error>>, Error> {
    thread::Builder::new()
        .name("ts-pacer".to_string())
        .spawn(move || run(ring, sink, shared, settings))
        .map_err(Error::Spawn)
}

/// Pacer thread body: drain the ring, realize each item's timestamp, stop
/// at the EOF sentinel. The sink is owned (and closed) here.
fn run(
    mut ring: RingConsumer,
    mut sink: Sink,
    shared: Arc<PacerShared>,
    settings: PacerSettings,
) -> Result<(), Error> {
    let mut state = PacerState::new();
    let mut perturb = settings.perturb.as_ref().map(Perturb::new);
    let mut run_sent = 0u32;
    let mut run_drop = 0u32;
    let mut outcome = Ok(());

    loop {
        if state.starting {
            info!("pacer: waiting for the ring to fill");
            ring.wait_full();
            info!("pacer: running");
            state.starting = false;
        }

        let slot = ring.wait_item();
        if slot.is_eof() {
            slot.release();
            info!("pacer: end of stream");
            break;
        }

        let header = slot.header();
        let (wait_us, took_reset) = state.wait_for(
            header.time_us,
            header.discontinuity,
            Instant::now(),
            &mut perturb,
            &settings,
        );
        if took_reset {
            shared.stats.timeline_resets.fetch_add(1, Ordering::Relaxed);
            warn!(
                "pacer: over {} ms behind, re-anchoring timeline",
                RESET_THRESHOLD_US / 1000
            );
        }
        if wait_us > 0 {
            thread::sleep(Duration::from_micros(wait_us));
        }

        let payload = slot.payload();

        // Guard against ring corruption: never emit bytes that cannot be a
        // TS packet.
        if payload.first() != Some(&TS_SYNC_BYTE) {
            warn!(
                "pacer: payload does not start with 0x47, skipping {} bytes",
                payload.len()
            );
            shared.stats.items_dropped.fetch_add(1, Ordering::Relaxed);
            slot.release();
            continue;
        }

        // Deliberate degradation for soak testing.
        let mut dropped = false;
        if let Some(d) = *shared.drop.lock() {
            if run_drop > 0 {
                run_drop -= 1;
                dropped = true;
            } else {
                run_sent += 1;
                if run_sent >= d.every {
                    run_sent = 0;
                    run_drop = d.count;
                }
            }
        }
        if dropped {
            debug!("pacer: dropping item on purpose");
            shared.stats.items_dropped.fetch_add(1, Ordering::Relaxed);
            slot.release();
            continue;
        }

        match sink.send_all(payload) {
            Ok(()) => {
                let len = payload.len() as u64;
                shared.stats.items_sent.fetch_add(1, Ordering::Relaxed);
                shared
                    .stats
                    .packets_sent
                    .fetch_add(len / crate::TS_PACKET_SIZE as u64, Ordering::Relaxed);
                shared.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
            }
            Err(e) if sink.is_udp() => {
                // Losing a datagram is better than stalling the producer.
                shared.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("pacer: udp send failed ({e}), payload discarded");
            }
            Err(e) => {
                error!("pacer: sink write failed: {e}");
                slot.release();
                outcome = Err(e);
                break;
            }
        }

        slot.release();

        if shared.commands.quit_requested() {
            info!("pacer: quit requested, stopping");
            break;
        }
    }

    match sink.flush() {
        Ok(()) => outcome,
        Err(e) => outcome.and(Err(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(max_nowait: Option<u32>) -> PacerSettings {
        PacerSettings {
            max_nowait,
            burst_gap_us: 1000,
            perturb: None,
        }
    }

    #[test]
    fn first_item_anchors_the_timeline() {
        let mut state = PacerState::new();
        state.starting = false;
        let now = Instant::now();
        let (wait, reset) = state.wait_for(5_000_000, false, now, &mut None, &settings(None));
        assert_eq!(wait, 0);
        assert!(!reset);
        assert_eq!(state.delta_start_us, 5_000_000);
        assert!(!state.reset);
    }

    #[test]
    fn future_items_wait_their_turn() {
        let mut state = PacerState::new();
        state.starting = false;
        let now = Instant::now();
        state.wait_for(1_000_000, false, now, &mut None, &settings(None));
        let (wait, _) = state.wait_for(1_050_000, false, Instant::now(), &mut None, &settings(None));
        assert!(
            (30_000..=50_000).contains(&wait),
            "expected ~50 ms wait, got {wait} us"
        );
    }

    #[test]
    fn small_lateness_is_tolerated() {
        let mut state = PacerState::new();
        state.starting = false;
        let now = Instant::now();
        state.wait_for(1_000_000, false, now, &mut None, &settings(None));
        let (wait, reset) = state.wait_for(900_000, false, now, &mut None, &settings(None));
        assert_eq!(wait, 0);
        assert!(!reset);
        assert!(!state.reset);
    }

    #[test]
    fn large_lateness_takes_a_reset() {
        let mut state = PacerState::new();
        state.starting = false;
        let now = Instant::now();
        state.wait_for(1_000_000, false, now, &mut None, &settings(None));

        let (wait, reset) = state.wait_for(700_000, false, now, &mut None, &settings(None));
        assert_eq!(wait, 0, "the late item goes out immediately");
        assert!(reset);
        assert!(state.reset);

        // The next item re-anchors rather than catching up.
        let (wait, reset) = state.wait_for(710_000, false, Instant::now(), &mut None, &settings(None));
        assert_eq!(wait, 0);
        assert!(!reset);
        assert_eq!(state.delta_start_us, 710_000);
    }

    #[test]
    fn perturbation_suppresses_resets() {
        let mut state = PacerState::new();
        state.starting = false;
        let mut perturb = Some(Perturb::new(&PerturbConfig {
            seed: 7,
            range_ms: 1,
            verbose: false,
        }));
        let now = Instant::now();
        state.wait_for(1_000_000, false, now, &mut perturb, &settings(None));
        let (_, reset) = state.wait_for(600_000, false, now, &mut perturb, &settings(None));
        assert!(!reset);
        assert!(!state.reset, "intentional lateness must not re-anchor");
    }

    #[test]
    fn discontinuity_re_anchors() {
        let mut state = PacerState::new();
        state.starting = false;
        let now = Instant::now();
        state.wait_for(1_000_000, false, now, &mut None, &settings(None));
        let (wait, _) = state.wait_for(9_000_000, true, now, &mut None, &settings(None));
        assert_eq!(wait, 0);
        assert_eq!(state.delta_start_us, 9_000_000);
    }

    #[test]
    fn burst_cap_inserts_gaps() {
        // All items due immediately; with a cap of 3 every fourth decision
        // must impose the configured gap.
        let mut state = PacerState::new();
        state.starting = false;
        let cfg = settings(Some(3));
        let now = Instant::now();
        let mut forced = Vec::new();
        for i in 1..=10 {
            let (wait, _) = state.wait_for(0, false, now, &mut None, &cfg);
            if wait > 0 {
                assert_eq!(wait, 1000);
                forced.push(i);
            }
        }
        assert_eq!(forced, vec![4, 7, 10]);
    }

    #[test]
    fn uncapped_pacer_never_forces_gaps() {
        let mut state = PacerState::new();
        state.starting = false;
        let cfg = settings(None);
        let now = Instant::now();
        for _ in 0..100 {
            let (wait, _) = state.wait_for(0, false, now, &mut None, &cfg);
            assert_eq!(wait, 0);
        }
    }

    #[test]
    fn perturb_offsets_stay_in_range() {
        let mut p = Perturb::new(&PerturbConfig {
            seed: 12345,
            range_ms: 250,
            verbose: false,
        });
        for _ in 0..1000 {
            let offset = p.next_offset_us();
            assert!(offset.abs() <= 250_000);
            assert_eq!(offset % 1000, 0);
        }
    }

    #[test]
    fn perturb_is_deterministic_per_seed() {
        let cfg = PerturbConfig {
            seed: 99,
            range_ms: 100,
            verbose: false,
        };
        let a: Vec<i64> = {
            let mut p = Perturb::new(&cfg);
            (0..16).map(|_| p.next_offset_us()).collect()
        };
        let b: Vec<i64> = {
            let mut p = Perturb::new(&cfg);
            (0..16).map(|_| p.next_offset_us()).collect()
        };
        assert_eq!(a, b);
    }
}
