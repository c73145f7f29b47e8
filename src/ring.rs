//! Bounded single-producer single-consumer ring of fixed-size TS items.
//!
//! The producer stamps and commits items; the pacer thread drains them.
//! Both sides poll with a configurable interval instead of using condition
//! variables, so the pacer can fold ring waits into the same loop that
//! multiplexes command input with sink readiness.
//!
//! Synchronization protocol: `end` (last written slot) is advanced only by
//! the producer with a Release store after the payload and header are in
//! place; `start` (next read slot) is advanced only by the consumer with a
//! Release store once it is done with a slot. Each side Acquire-loads the
//! index owned by the other. One slot is always kept empty, so a slot is
//! never written and read concurrently.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::PacingConfig;
use crate::error::Error;
use crate::EOF_MARKER;

/// Per-slot metadata, published together with the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemHeader {
    /// Payload bytes currently in the slot
    pub length: usize,
    /// Target send time in microseconds on the producer's timeline
    pub time_us: i64,
    /// Tells the pacer to re-anchor its timeline at this item
    pub discontinuity: bool,
}

struct Shared {
    /// Next slot to read; written only by the consumer
    start: AtomicUsize,
    /// Last slot written; written only by the producer
    end: AtomicUsize,
    /// Set once the EOF sentinel has been committed
    eof_posted: AtomicBool,
    /// Slot count; one above usable capacity
    size: usize,
    /// Payload bytes per slot
    item_size: usize,
    headers: Box<[UnsafeCell<ItemHeader>]>,
    payload: Box<[UnsafeCell<u8>]>,
}

// Safety: slots are handed to exactly one side at a time by the start/end
// protocol above; headers and payload are only touched through that window.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn is_empty(&self, start: usize, end: usize) -> bool {
        start == (end + 1) % self.size
    }

    fn is_full(&self, start: usize, end: usize) -> bool {
        (end + 2) % self.size == start
    }

    fn len(&self, start: usize, end: usize) -> usize {
        (end + 1 + self.size - start) % self.size
    }

    fn payload_ptr(&self, index: usize) -> *mut u8 {
        self.payload[index * self.item_size].get()
    }
}

/// Fixed-capacity SPSC item ring. Build one from a [`PacingConfig`] and
/// split it into its producer and consumer halves.
pub struct ItemRing {
    shared: Arc<Shared>,
    producer_poll: Duration,
    consumer_poll: Duration,
    give_up_after: u32,
}

impl ItemRing {
    pub fn new(cfg: &PacingConfig) -> Self {
        let size = cfg.ring_slots + 1;
        let item_size = cfg.item_size();
        let mut headers = Vec::with_capacity(size);
        headers.resize_with(size, || UnsafeCell::new(ItemHeader::default()));
        let mut payload = Vec::with_capacity(size * item_size);
        payload.resize_with(size * item_size, || UnsafeCell::new(0u8));

        let shared = Shared {
            start: AtomicUsize::new(0),
            // One behind `start`: the ring starts out empty.
            end: AtomicUsize::new(size - 1),
            eof_posted: AtomicBool::new(false),
            size,
            item_size,
            headers: headers.into_boxed_slice(),
            payload: payload.into_boxed_slice(),
        };

        Self {
            shared: Arc::new(shared),
            producer_poll: cfg.producer_poll,
            consumer_poll: cfg.consumer_poll,
            give_up_after: cfg.producer_give_up_after,
        }
    }

    pub fn split(self) -> (RingProducer, RingConsumer) {
        let producer = RingProducer {
            shared: self.shared.clone(),
            poll: self.producer_poll,
            give_up_after: self.give_up_after,
        };
        let consumer = RingConsumer {
            shared: self.shared,
            poll: self.consumer_poll,
        };
        (producer, consumer)
    }
}

/// Producer half: reserve a slot, fill it, commit it.
pub struct RingProducer {
    shared: Arc<Shared>,
    poll: Duration,
    give_up_after: u32,
}

impl RingProducer {
    /// Reserve the next slot, polling while the ring is full. Gives up after
    /// the configured number of polls: a ring that stays full that long means
    /// the pacer has died.
    pub fn reserve(&mut self) -> Result<WriteSlot<'_>, Error> {
        let mut polls = 0u32;
        loop {
            let start = self.shared.start.load(Ordering::Acquire);
            let end = self.shared.end.load(Ordering::Relaxed);
            if !self.shared.is_full(start, end) {
                let index = (end + 1) % self.shared.size;
                return Ok(WriteSlot {
                    shared: &self.shared,
                    index,
                });
            }
            if polls >= self.give_up_after {
                return Err(Error::PacerStalled { polls });
            }
            polls += 1;
            thread::sleep(self.poll);
        }
    }

    /// Note that the EOF sentinel has been committed. Lets a pacer blocked in
    /// [`RingConsumer::wait_full`] proceed on streams too short to fill the
    /// ring.
    pub fn note_eof(&self) {
        self.shared.eof_posted.store(true, Ordering::Release);
    }

    pub fn item_size(&self) -> usize {
        self.shared.item_size
    }

    pub fn len(&self) -> usize {
        let start = self.shared.start.load(Ordering::Acquire);
        let end = self.shared.end.load(Ordering::Relaxed);
        self.shared.len(start, end)
    }

    pub fn is_empty(&self) -> bool {
        let start = self.shared.start.load(Ordering::Acquire);
        let end = self.shared.end.load(Ordering::Relaxed);
        self.shared.is_empty(start, end)
    }

    pub fn is_full(&self) -> bool {
        let start = self.shared.start.load(Ordering::Acquire);
        let end = self.shared.end.load(Ordering::Relaxed);
        self.shared.is_full(start, end)
    }
}

/// Exclusive access to a reserved slot. [`WriteSlot::commit`] publishes the
/// item; dropping without committing leaves the slot unpublished and the
/// producer hands it out again.
pub struct WriteSlot<'a> {
    shared: &'a Shared,
    index: usize,
}

impl WriteSlot<'_> {
    pub fn header_mut(&mut self) -> &mut ItemHeader {
        // Safety: the slot is outside the consumer's visible window until
        // commit, and only one WriteSlot exists at a time.
        unsafe { &mut *self.shared.headers[self.index].get() }
    }

    /// Full item-sized payload buffer for this slot.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        // Safety: as for header_mut; the region belongs to this slot only.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.shared.payload_ptr(self.index),
                self.shared.item_size,
            )
        }
    }

    /// Publish the item to the consumer.
    pub fn commit(self) {
        self.shared.end.store(self.index, Ordering::Release);
    }
}

/// Consumer half: wait for items and release them once sent.
pub struct RingConsumer {
    shared: Arc<Shared>,
    poll: Duration,
}

impl RingConsumer {
    /// Block until an item is available. Never gives up: upstream may
    /// legitimately pause for an arbitrarily long time.
    pub fn wait_item(&mut self) -> ReadSlot<'_> {
        loop {
            if self.peek_ready() {
                let index = self.shared.start.load(Ordering::Relaxed);
                return ReadSlot {
                    shared: &self.shared,
                    index,
                };
            }
            thread::sleep(self.poll);
        }
    }

    /// Non-blocking variant of [`RingConsumer::wait_item`].
    pub fn try_item(&mut self) -> Option<ReadSlot<'_>> {
        if self.peek_ready() {
            let index = self.shared.start.load(Ordering::Relaxed);
            Some(ReadSlot {
                shared: &self.shared,
                index,
            })
        } else {
            None
        }
    }

    /// Start-up barrier: block until the ring has filled once, or until
    /// end-of-stream was posted (a short stream may never fill the ring).
    pub fn wait_full(&self) {
        loop {
            let start = self.shared.start.load(Ordering::Relaxed);
            let end = self.shared.end.load(Ordering::Acquire);
            if self.shared.is_full(start, end)
                || self.shared.eof_posted.load(Ordering::Acquire)
            {
                return;
            }
            thread::sleep(self.poll);
        }
    }

    fn peek_ready(&self) -> bool {
        let start = self.shared.start.load(Ordering::Relaxed);
        let end = self.shared.end.load(Ordering::Acquire);
        !self.shared.is_empty(start, end)
    }

    pub fn len(&self) -> usize {
        let start = self.shared.start.load(Ordering::Relaxed);
        let end = self.shared.end.load(Ordering::Acquire);
        self.shared.len(start, end)
    }

    pub fn is_empty(&self) -> bool {
        !self.peek_ready()
    }
}

/// Read access to the oldest committed item. [`ReadSlot::release`] frees the
/// slot for the producer.
pub struct ReadSlot<'a> {
    shared: &'a Shared,
    index: usize,
}

impl ReadSlot<'_> {
    pub fn header(&self) -> ItemHeader {
        // Safety: the producer wrote this header before publishing `end`
        // and will not touch the slot again until it is released.
        unsafe { *self.shared.headers[self.index].get() }
    }

    /// Payload bytes of the item (only the filled prefix of the slot).
    pub fn payload(&self) -> &[u8] {
        let length = self.header().length;
        // Safety: as for header().
        unsafe {
            std::slice::from_raw_parts(self.shared.payload_ptr(self.index), length)
        }
    }

    /// True for the in-band end-of-stream sentinel.
    pub fn is_eof(&self) -> bool {
        let header = self.header();
        header.length == 1 && self.payload()[0] == EOF_MARKER
    }

    /// Free the slot for the producer.
    pub fn release(self) {
        self.shared
            .start
            .store((self.index + 1) % self.shared.size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_ring(slots: usize) -> ItemRing {
        let cfg = PacingConfig {
            ring_slots: slots,
            packets_per_item: 1,
            producer_poll: Duration::from_millis(1),
            consumer_poll: Duration::from_millis(1),
            producer_give_up_after: 5,
            ..Default::default()
        };
        ItemRing::new(&cfg)
    }

    fn commit_tagged(producer: &mut RingProducer, tag: u8, time_us: i64) {
        let mut slot = producer.reserve().unwrap();
        slot.payload_mut()[0] = tag;
        *slot.header_mut() = ItemHeader {
            length: 1,
            time_us,
            discontinuity: false,
        };
        slot.commit();
    }

    #[test]
    fn starts_empty() {
        let (producer, consumer) = small_ring(4).split();
        assert!(producer.is_empty());
        assert!(consumer.is_empty());
        assert_eq!(producer.len(), 0);
    }

    #[test]
    fn full_and_empty_never_coincide() {
        let (mut producer, consumer) = small_ring(3).split();
        for tag in 0..3 {
            assert!(!producer.is_full());
            commit_tagged(&mut producer, tag, 0);
            assert!(!(producer.is_full() && producer.is_empty()));
        }
        assert!(producer.is_full());
        assert!(!producer.is_empty());
        assert_eq!(consumer.len(), 3);
    }

    #[test]
    fn producer_gives_up_when_ring_stays_full() {
        let (mut producer, _consumer) = small_ring(2).split();
        commit_tagged(&mut producer, 0, 0);
        commit_tagged(&mut producer, 1, 0);
        match producer.reserve() {
            Err(Error::PacerStalled { polls }) => assert_eq!(polls, 5),
            other => panic!("expected PacerStalled, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn fifo_order_across_threads() {
        let (mut producer, mut consumer) = small_ring(8).split();
        let reader = std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                let slot = consumer.wait_item();
                if slot.is_eof() {
                    slot.release();
                    break;
                }
                seen.push(slot.payload()[0]);
                slot.release();
            }
            seen
        });

        for tag in 0..100u8 {
            commit_tagged(&mut producer, tag.wrapping_add(2), 0);
        }
        commit_tagged(&mut producer, EOF_MARKER, 0);
        producer.note_eof();

        let seen = reader.join().unwrap();
        let expected: Vec<u8> = (0..100u8).map(|t| t.wrapping_add(2)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn wait_full_returns_once_eof_posted() {
        let (mut producer, consumer) = small_ring(16).split();
        commit_tagged(&mut producer, 0x47, 0);
        commit_tagged(&mut producer, EOF_MARKER, 0);
        producer.note_eof();
        // Two items in a 16-slot ring: only the EOF flag lets this return.
        consumer.wait_full();
    }

    #[test]
    fn sentinel_is_unambiguous() {
        let (mut producer, mut consumer) = small_ring(4).split();
        commit_tagged(&mut producer, 0x47, 0);
        commit_tagged(&mut producer, EOF_MARKER, 0);
        let first = consumer.wait_item();
        assert!(!first.is_eof());
        first.release();
        let second = consumer.wait_item();
        assert!(second.is_eof());
        second.release();
        assert!(consumer.is_empty());
    }

    #[test]
    fn headers_travel_with_payload() {
        let (mut producer, mut consumer) = small_ring(4).split();
        commit_tagged(&mut producer, 0x47, 123_456);
        let slot = consumer.wait_item();
        assert_eq!(slot.header().time_us, 123_456);
        assert_eq!(slot.header().length, 1);
        assert!(!slot.header().discontinuity);
        slot.release();
    }
}
