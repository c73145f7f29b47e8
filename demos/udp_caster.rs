//! Cast a TS file to UDP at the stream's own rate.
//!
//! Usage: udp_caster <file.ts> <udp://ADDR:PORT[?iface=IP]> [byterate]
//!
//! PCRs found in the stream lock the send rate; until the first PCR the
//! optional byterate argument (default 250000 B/s) seeds the pacing.

use std::env;
use std::fs::File;
use std::io::{BufReader, Read};
use std::process;

use tscast::{PacingConfig, Target, TsWriter, TS_PACKET_SIZE};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!("usage: udp_caster <file.ts> <udp://ADDR:PORT[?iface=IP]> [byterate]");
        process::exit(1);
    }

    let byterate = match args.get(3) {
        Some(arg) => match arg.parse() {
            Ok(rate) => rate,
            Err(_) => {
                eprintln!("bad byterate: {arg}");
                process::exit(1);
            }
        },
        None => 250_000,
    };

    if let Err(e) = run(&args[1], &args[2], byterate) {
        eprintln!("udp_caster: {e}");
        process::exit(1);
    }
}

fn run(path: &str, spec: &str, byterate: u32) -> Result<(), Box<dyn std::error::Error>> {
    let target: Target = spec.parse()?;
    let mut writer = TsWriter::open(&target)?;
    writer.start_pacing(PacingConfig {
        byterate,
        ..Default::default()
    })?;

    let mut reader = BufReader::new(File::open(path)?);
    let mut packet = [0u8; TS_PACKET_SIZE];
    let mut count = 0u64;
    loop {
        match reader.read_exact(&mut packet) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let pcr = read_pcr(&packet);
        writer.write_packet(&packet, read_pid(&packet), pcr.is_some(), pcr.unwrap_or(0))?;
        count += 1;
    }

    let shared = writer.pacer_shared();
    writer.close()?;
    let stats = shared.stats();
    eprintln!(
        "{count} packets in, {} packets sent, {} send errors",
        stats.packets_sent, stats.send_errors
    );
    Ok(())
}

fn read_pid(packet: &[u8; TS_PACKET_SIZE]) -> u16 {
    u16::from(packet[1] & 0x1F) << 8 | u16::from(packet[2])
}

/// Pull the PCR out of the adaptation field, if this packet carries one.
/// Returns 27 MHz ticks: 33-bit base * 300 + 9-bit extension.
fn read_pcr(packet: &[u8; TS_PACKET_SIZE]) -> Option<u64> {
    let has_adaptation = packet[3] & 0x20 != 0;
    if !has_adaptation || packet[4] < 7 {
        return None;
    }
    if packet[5] & 0x10 == 0 {
        return None;
    }
    let b = &packet[6..12];
    let base = (u64::from(b[0]) << 25)
        | (u64::from(b[1]) << 17)
        | (u64::from(b[2]) << 9)
        | (u64::from(b[3]) << 1)
        | (u64::from(b[4]) >> 7);
    let ext = (u64::from(b[4]) & 1) << 8 | u64::from(b[5]);
    Some(base * 300 + ext)
}
