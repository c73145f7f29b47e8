//! Paced MPEG transport-stream writer.
//!
//! Accepts a sequence of 188-byte TS packets from an upstream source and
//! emits them to a sink (stdout, file, TCP, or UDP unicast/multicast) at a
//! rate locked to the Program Clock References carried in the stream.
//!
//! The engine is a producer/consumer pair around a bounded ring of fixed-size
//! items. The producer accumulates packets into items and stamps each item
//! with a target send time derived from the PCRs; a dedicated pacer thread
//! realizes those timestamps against its own monotonic clock, bounding
//! back-to-back bursts so downstream hardware is never flooded.
//!
//! ```no_run
//! use tscast::{PacingConfig, TsWriter};
//!
//! let mut writer = TsWriter::open_udp("239.100.1.1:5004".parse().unwrap(), None).unwrap();
//! writer.start_pacing(PacingConfig::default()).unwrap();
//! let packet = [0x47u8; 188];
//! writer.write_packet(&packet, 0x100, false, 0).unwrap();
//! writer.close().unwrap();
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod m2ts;
pub mod pacer;
pub mod rate;
pub mod ring;
pub mod sink;
pub mod writer;

pub use command::{Command, CommandState};
pub use config::{PacingConfig, PerturbConfig};
pub use error::Error;
pub use m2ts::M2tsReorderer;
pub use pacer::PacerStats;
pub use sink::{Sink, Target};
pub use writer::TsWriter;

/// Size of an MPEG transport-stream packet in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// Sync byte beginning every TS packet.
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Payload byte of the in-band end-of-stream sentinel item. A real TS packet
/// always starts 0x47, so a one-byte 0x01 item is unambiguous.
pub const EOF_MARKER: u8 = 0x01;

/// Upper bound on packets per ring item; 7 * 188 bytes fits one Ethernet MTU.
pub const MAX_PACKETS_PER_ITEM: usize = 7;
