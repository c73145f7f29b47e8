//! Error type for the paced writer.

use thiserror::Error;

/// Errors surfaced by the writer and its pacing engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Sink creation, bind or connect failure.
    #[error("failed to open sink: {0}")]
    SinkSetup(#[source] std::io::Error),

    /// Could not spawn the pacer thread.
    #[error("failed to spawn pacer thread: {0}")]
    Spawn(#[source] std::io::Error),

    /// The ring stayed full for the whole give-up window; the pacer is
    /// assumed dead.
    #[error("ring full for {polls} polls, giving up on the pacer")]
    PacerStalled { polls: u32 },

    /// Write to a file, stdout or TCP sink failed. UDP send failures are
    /// logged and skipped instead.
    #[error("sink write failed: {0}")]
    SinkWrite(#[source] std::io::Error),

    /// Command-channel multiplexing failed at the readiness primitive.
    #[error("readiness wait failed: {0}")]
    Poll(#[source] std::io::Error),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    /// Packet handed to the writer is not a TS packet.
    #[error("invalid TS packet: {0}")]
    InvalidPacket(&'static str),

    /// Malformed M2TS record.
    #[error("invalid M2TS record: {0}")]
    InvalidRecord(&'static str),

    /// A quit command was received; no further packets are accepted.
    #[error("quit command received")]
    Terminated,
}
