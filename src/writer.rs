//! Top-level TS writer.
//!
//! Open a sink, optionally start the pacing engine over it, then feed
//! 188-byte packets. Unpaced sinks (stdout, file, TCP) take packets on the
//! caller's thread; a UDP sink gets the full producer/pacer pipeline so
//! datagrams leave at the stream's own rate.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{debug, info};

use crate::command::{Command, CommandMux, CommandSource};
use crate::config::PacingConfig;
use crate::error::Error;
use crate::pacer::{self, PacerSettings, PacerShared, PacerStats};
use crate::rate::{PcrSample, RateController};
use crate::ring::{ItemHeader, ItemRing, RingProducer};
use crate::sink::{Sink, Target};
use crate::{EOF_MARKER, TS_PACKET_SIZE, TS_SYNC_BYTE};

/// Producer-side half of a running pacing engine.
struct Pacing {
    producer: RingProducer,
    rate: RateController,
    /// Payload of the item currently being accumulated
    item: Vec<u8>,
    item_packets: usize,
    /// First PCR seen in the open item; cleared at every item open so a
    /// stale value can never masquerade as a PCR
    item_first_pcr: Option<PcrSample>,
    packets_per_item: usize,
    /// Packet sequence number since the start of the stream
    packet_index: u64,
    /// Mark the next committed item discontinuous
    pending_discontinuity: bool,
    pcr_scale: f64,
    handle: Option<JoinHandle<Result<(), Error>>>,
    eof_sent: bool,
}

impl Pacing {
    fn push_packet(&mut self, packet: &[u8], pid: u16, has_pcr: bool, pcr: u64) -> Result<(), Error> {
        if self.eof_sent {
            return Err(Error::Config("stream already finished"));
        }
        if has_pcr && self.item_first_pcr.is_none() {
            self.item_first_pcr = Some(PcrSample {
                index: self.packet_index,
                pcr: (pcr as f64 * self.pcr_scale) as u64,
            });
        }
        debug!(
            "packet {} pid {:#06x}{}",
            self.packet_index,
            pid,
            if has_pcr { " (pcr)" } else { "" }
        );
        self.item.extend_from_slice(packet);
        self.item_packets += 1;
        self.packet_index += 1;

        if self.item_packets == self.packets_per_item {
            self.close_item()?;
        }
        Ok(())
    }

    /// Stamp and commit the open item.
    fn close_item(&mut self) -> Result<(), Error> {
        if self.item.is_empty() {
            return Ok(());
        }
        let pcr = self.item_first_pcr.take();
        let (time_us, rollback) = self.rate.close_item(self.item.len(), pcr);
        let discontinuity = std::mem::take(&mut self.pending_discontinuity);
        if rollback {
            // The pool re-primes at the next item; that is where the pacer
            // must re-anchor.
            self.pending_discontinuity = true;
        }

        let length = self.item.len();
        let mut slot = self.producer.reserve()?;
        slot.payload_mut()[..length].copy_from_slice(&self.item);
        *slot.header_mut() = ItemHeader {
            length,
            time_us,
            discontinuity,
        };
        slot.commit();

        self.item.clear();
        self.item_packets = 0;
        Ok(())
    }

    /// Flush the partial item and commit the EOF sentinel.
    fn finish(&mut self) -> Result<(), Error> {
        if self.eof_sent {
            return Ok(());
        }
        self.close_item()?;

        let (time_us, _) = self.rate.close_item(1, None);
        let mut slot = self.producer.reserve()?;
        slot.payload_mut()[0] = EOF_MARKER;
        *slot.header_mut() = ItemHeader {
            length: 1,
            time_us,
            discontinuity: false,
        };
        slot.commit();
        self.producer.note_eof();
        self.eof_sent = true;
        info!("writer: end of stream committed");
        Ok(())
    }
}

/// Writes a TS stream to a sink, paced or not.
pub struct TsWriter {
    sink: Option<Sink>,
    pacing: Option<Pacing>,
    shared: Arc<PacerShared>,
    mux: Option<CommandMux>,
}

impl TsWriter {
    fn new(sink: Sink) -> Self {
        Self {
            sink: Some(sink),
            pacing: None,
            shared: Arc::new(PacerShared::new()),
            mux: None,
        }
    }

    /// Open a sink from a parsed [`Target`].
    pub fn open(target: &Target) -> Result<Self, Error> {
        Ok(Self::new(Sink::open(target)?))
    }

    /// Open a sink from a destination spec string (see [`Target`]).
    pub fn open_spec(spec: &str) -> Result<Self, Error> {
        Self::open(&spec.parse()?)
    }

    pub fn open_stdout() -> Self {
        Self::new(Sink::open_stdout())
    }

    pub fn open_file(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(Sink::open_file(path)?))
    }

    pub fn open_tcp(hostport: &str) -> Result<Self, Error> {
        Ok(Self::new(Sink::open_tcp(hostport)?))
    }

    pub fn open_udp(dest: SocketAddrV4, interface: Option<Ipv4Addr>) -> Result<Self, Error> {
        Ok(Self::new(Sink::open_udp(dest, interface)?))
    }

    /// Start the pacing engine: create the ring and hand the sink to a
    /// freshly spawned pacer thread. UDP only; paced output makes no sense
    /// on sinks with their own flow control.
    pub fn start_pacing(&mut self, cfg: PacingConfig) -> Result<(), Error> {
        cfg.validate()?;
        if self.pacing.is_some() {
            return Err(Error::Config("pacing already started"));
        }
        match self.sink.as_ref() {
            Some(sink) if sink.is_udp() => {}
            Some(_) => return Err(Error::Config("pacing is only for udp sinks")),
            None => return Err(Error::Config("no sink to pace")),
        }
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Err(Error::Config("no sink to pace")),
        };

        let (producer, consumer) = ItemRing::new(&cfg).split();
        let handle = pacer::spawn(
            consumer,
            sink,
            self.shared.clone(),
            PacerSettings::from_config(&cfg),
        )?;

        self.pacing = Some(Pacing {
            producer,
            rate: RateController::new(&cfg),
            item: Vec::with_capacity(cfg.item_size()),
            item_packets: 0,
            item_first_pcr: None,
            packets_per_item: cfg.packets_per_item,
            packet_index: 0,
            pending_discontinuity: false,
            pcr_scale: cfg.pcr_scale,
            handle: Some(handle),
            eof_sent: false,
        });
        info!("writer: pacing engine started");
        Ok(())
    }

    /// Attach the command channel. The sink must be TCP; it goes
    /// non-blocking, and every subsequent send multiplexes command reads
    /// with the write.
    pub fn start_input(&mut self, source: Box<dyn CommandSource>) -> Result<(), Error> {
        let sink = self
            .sink
            .as_mut()
            .ok_or(Error::Config("command input needs a tcp sink"))?;
        sink.set_nonblocking()?;
        self.mux = Some(CommandMux::new(source));
        info!("writer: command input enabled");
        Ok(())
    }

    /// Write one TS packet. `pcr` is in 27 MHz ticks and only meaningful
    /// when `has_pcr` is set.
    pub fn write_packet(
        &mut self,
        packet: &[u8],
        pid: u16,
        has_pcr: bool,
        pcr: u64,
    ) -> Result<(), Error> {
        if packet.len() != TS_PACKET_SIZE {
            return Err(Error::InvalidPacket("length must be 188 bytes"));
        }
        if packet[0] != TS_SYNC_BYTE {
            return Err(Error::InvalidPacket("missing 0x47 sync byte"));
        }
        if self.shared.commands().quit_requested() {
            return Err(Error::Terminated);
        }

        match self.pacing.as_mut() {
            Some(pacing) => pacing.push_packet(packet, pid, has_pcr, pcr),
            None => self.send_direct(packet),
        }
    }

    /// Write arbitrary bytes straight to the sink, outside the pacing
    /// pipeline. Only available before pacing starts.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.pacing.is_some() {
            return Err(Error::Config("raw writes would bypass the pacing engine"));
        }
        self.send_direct(data)
    }

    fn send_direct(&mut self, data: &[u8]) -> Result<(), Error> {
        let sink = self
            .sink
            .as_mut()
            .ok_or(Error::Config("sink has been handed to the pacer"))?;
        if sink.is_udp() {
            return Err(Error::Config("udp output must be paced; call start_pacing"));
        }
        match (sink, self.mux.as_mut()) {
            (Sink::Tcp(stream), Some(mux)) => mux.send(stream, data, self.shared.commands()),
            (sink, _) => sink.send_all(data),
        }
    }

    /// Mark a splice point: the next committed item tells the pacer to
    /// re-anchor its timeline.
    pub fn signal_discontinuity(&mut self) {
        if let Some(pacing) = self.pacing.as_mut() {
            pacing.pending_discontinuity = true;
        }
    }

    /// Flush the pipeline and wait for the pacer to drain and exit. The
    /// pacer's own outcome (e.g. a fatal sink error) is surfaced here.
    pub fn write_eof(&mut self) -> Result<(), Error> {
        match self.pacing.as_mut() {
            Some(pacing) => {
                pacing.finish()?;
                match pacing.handle.take() {
                    Some(handle) => match handle.join() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::Spawn(io::Error::new(
                            io::ErrorKind::Other,
                            "pacer thread panicked",
                        ))),
                    },
                    None => Ok(()),
                }
            }
            None => match self.sink.as_mut() {
                Some(sink) => sink.flush(),
                None => Ok(()),
            },
        }
    }

    /// Shut the writer down in order: flush, sentinel, join, close sink.
    pub fn close(mut self) -> Result<(), Error> {
        self.write_eof()?;
        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }

    // --- command channel state -------------------------------------------

    /// The most recently received command, if any.
    pub fn command(&self) -> Option<Command> {
        self.shared.commands().command()
    }

    /// True when a new command is waiting and no atomic command is held.
    pub fn command_changed(&self) -> bool {
        self.shared.commands().changed()
    }

    /// Acknowledge the pending command.
    pub fn clear_command_changed(&self) {
        self.shared.commands().clear_changed()
    }

    /// Raise or release the atomic-command guard.
    pub fn set_command_atomic(&self, on: bool) {
        self.shared.commands().set_atomic(on)
    }

    pub fn quit_requested(&self) -> bool {
        self.shared.commands().quit_requested()
    }

    /// Command state and statistics shared with the pacer, for callers that
    /// poll or steer from another thread.
    pub fn pacer_shared(&self) -> Arc<PacerShared> {
        self.shared.clone()
    }

    // --- diagnostics ------------------------------------------------------

    /// Drop `count` items after every `every` sent (UDP soak testing);
    /// `every == 0` disables.
    pub fn set_packet_drop(&self, every: u32, count: u32) {
        self.shared.set_packet_drop(every, count);
    }

    pub fn pacer_stats(&self) -> PacerStats {
        self.shared.stats()
    }
}

impl Drop for TsWriter {
    fn drop(&mut self) {
        // Best effort: a writer dropped without close() still drains the
        // pipeline and joins the pacer.
        let _ = self.write_eof();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandState;
    use std::net::UdpSocket;
    use std::time::Duration;

    fn ts_packet(tag: u8) -> [u8; TS_PACKET_SIZE] {
        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = TS_SYNC_BYTE;
        packet[1] = tag;
        packet
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tscast-{}-{}", std::process::id(), name))
    }

    #[test]
    fn rejects_malformed_packets() {
        let path = temp_path("reject.ts");
        let mut writer = TsWriter::open_file(&path).unwrap();
        assert!(matches!(
            writer.write_packet(&[0u8; 10], 0, false, 0),
            Err(Error::InvalidPacket(_))
        ));
        let mut bad = ts_packet(0);
        bad[0] = 0x48;
        assert!(matches!(
            writer.write_packet(&bad, 0, false, 0),
            Err(Error::InvalidPacket(_))
        ));
        writer.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unpaced_file_writes_pass_through() {
        let path = temp_path("plain.ts");
        let mut writer = TsWriter::open_file(&path).unwrap();
        for tag in 0..4 {
            writer.write_packet(&ts_packet(tag), 0x100, false, 0).unwrap();
        }
        writer.close().unwrap();

        let written = std::fs::read(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(written.len(), 4 * TS_PACKET_SIZE);
        for tag in 0..4u8 {
            let offset = tag as usize * TS_PACKET_SIZE;
            assert_eq!(written[offset], TS_SYNC_BYTE);
            assert_eq!(written[offset + 1], tag);
        }
    }

    #[test]
    fn pacing_requires_udp() {
        let path = temp_path("nopace.ts");
        let mut writer = TsWriter::open_file(&path).unwrap();
        assert!(matches!(
            writer.start_pacing(PacingConfig::default()),
            Err(Error::Config(_))
        ));
        writer.close().unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn udp_requires_pacing() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match receiver.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("unexpected addr {other}"),
        };
        let mut writer = TsWriter::open_udp(dest, None).unwrap();
        assert!(matches!(
            writer.write_packet(&ts_packet(0), 0, false, 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn paced_udp_delivers_full_items() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let dest = match receiver.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("unexpected addr {other}"),
        };

        let mut writer = TsWriter::open_udp(dest, None).unwrap();
        let cfg = PacingConfig {
            ring_slots: 8,
            byterate: 1_000_000,
            use_pcrs: false,
            ..Default::default()
        };
        writer.start_pacing(cfg).unwrap();

        // Three full items plus a partial one.
        for tag in 0..23u8 {
            writer.write_packet(&ts_packet(tag), 0x100, false, 0).unwrap();
        }
        writer.close().unwrap();

        let mut buf = [0u8; 2048];
        let mut tags = Vec::new();
        for expected in [7 * TS_PACKET_SIZE, 7 * TS_PACKET_SIZE, 7 * TS_PACKET_SIZE, 2 * TS_PACKET_SIZE] {
            let n = receiver.recv(&mut buf).unwrap();
            assert_eq!(n, expected);
            for packet in buf[..n].chunks(TS_PACKET_SIZE) {
                assert_eq!(packet[0], TS_SYNC_BYTE);
                tags.push(packet[1]);
            }
        }
        let expected: Vec<u8> = (0..23).collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn quit_stops_the_producer() {
        let path = temp_path("quit.ts");
        let mut writer = TsWriter::open_file(&path).unwrap();
        writer.write_packet(&ts_packet(0), 0, false, 0).unwrap();
        writer.pacer_shared().commands().post(Command::Quit);
        assert!(matches!(
            writer.write_packet(&ts_packet(1), 0, false, 0),
            Err(Error::Terminated)
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn raw_writes_only_before_pacing() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match receiver.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            other => panic!("unexpected addr {other}"),
        };
        let mut writer = TsWriter::open_udp(dest, None).unwrap();
        writer.start_pacing(PacingConfig::default()).unwrap();
        assert!(matches!(
            writer.write_raw(&[0u8; 4]),
            Err(Error::Config(_))
        ));
        writer.close().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn atomic_command_masks_until_released() {
        use std::io::Write as _;
        use std::net::TcpListener;
        use std::os::unix::net::UnixStream;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut writer = TsWriter::open_tcp(&addr.to_string()).unwrap();
        let (_server, _) = listener.accept().unwrap();

        let (cmd_rx, mut cmd_tx) = UnixStream::pair().unwrap();
        writer.start_input(Box::new(cmd_rx)).unwrap();

        // A big skip arrives and raises the atomic guard by itself.
        cmd_tx.write_all(b"]").unwrap();
        writer.write_packet(&ts_packet(0), 0, false, 0).unwrap();
        assert_eq!(writer.command(), Some(Command::SkipForwardLots));
        assert!(!writer.command_changed(), "atomic command must stay hidden");

        // Quit is queued but deferred while the skip is unacknowledged.
        cmd_tx.write_all(b"q").unwrap();
        writer.write_packet(&ts_packet(1), 0, false, 0).unwrap();
        assert_eq!(writer.command(), Some(Command::SkipForwardLots));

        // Caller finishes the skip and releases the guard.
        writer.set_command_atomic(false);
        writer.clear_command_changed();
        assert!(!writer.command_changed());

        writer.write_packet(&ts_packet(2), 0, false, 0).unwrap();
        assert!(writer.command_changed());
        assert_eq!(writer.command(), Some(Command::Quit));
        assert!(matches!(
            writer.write_packet(&ts_packet(3), 0, false, 0),
            Err(Error::Terminated)
        ));
    }

    // Exercised here rather than through a socket so the shared state is
    // observable without a live pacer.
    #[test]
    fn shared_state_exposes_commands() {
        let state = CommandState::new();
        state.post(Command::Pause);
        assert!(state.changed());
        assert_eq!(state.command(), Some(Command::Pause));
    }
}
