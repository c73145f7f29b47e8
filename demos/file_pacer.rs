//! Pace a TS file into another file at a fixed byte rate, using the engine
//! directly. Mostly useful for watching the pacing behave without a network.
//!
//! Usage: file_pacer <in.ts> <out.ts> [byterate]

use std::env;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::process;
use std::sync::Arc;

use tscast::config::PacingConfig;
use tscast::pacer::{self, PacerSettings, PacerShared};
use tscast::rate::RateController;
use tscast::ring::{ItemHeader, ItemRing};
use tscast::sink::Sink;
use tscast::{EOF_MARKER, TS_PACKET_SIZE};

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 || args.len() > 4 {
        eprintln!("usage: file_pacer <in.ts> <out.ts> [byterate]");
        process::exit(1);
    }
    let byterate = args
        .get(3)
        .and_then(|a| a.parse().ok())
        .unwrap_or(250_000u32);

    if let Err(e) = run(&args[1], &args[2], byterate) {
        eprintln!("file_pacer: {e}");
        process::exit(1);
    }
}

fn run(input: &str, output: &str, byterate: u32) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = PacingConfig {
        byterate,
        use_pcrs: false,
        ..Default::default()
    };
    let item_size = cfg.item_size();

    let (mut producer, consumer) = ItemRing::new(&cfg).split();
    let mut rate = RateController::new(&cfg);
    let sink = Sink::open_file(Path::new(output))?;
    let shared = Arc::new(PacerShared::new());
    let handle = pacer::spawn(
        consumer,
        sink,
        shared.clone(),
        PacerSettings::from_config(&cfg),
    )?;

    let mut reader = BufReader::new(File::open(input)?);
    let mut item = vec![0u8; item_size];
    loop {
        let filled = fill_item(&mut reader, &mut item)?;
        if filled == 0 {
            break;
        }
        let (time_us, _) = rate.close_item(filled, None);
        let mut slot = producer.reserve()?;
        slot.payload_mut()[..filled].copy_from_slice(&item[..filled]);
        *slot.header_mut() = ItemHeader {
            length: filled,
            time_us,
            discontinuity: false,
        };
        slot.commit();
    }

    let (time_us, _) = rate.close_item(1, None);
    let mut slot = producer.reserve()?;
    slot.payload_mut()[0] = EOF_MARKER;
    *slot.header_mut() = ItemHeader {
        length: 1,
        time_us,
        discontinuity: false,
    };
    slot.commit();
    producer.note_eof();

    handle.join().map_err(|_| "pacer thread panicked")??;

    let stats = shared.stats();
    eprintln!(
        "{} items / {} bytes paced out, {} timeline resets",
        stats.items_sent, stats.bytes_sent, stats.timeline_resets
    );
    Ok(())
}

/// Read up to one item of whole packets; returns bytes read (0 at EOF).
fn fill_item(reader: &mut impl Read, item: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled + TS_PACKET_SIZE <= item.len() {
        match reader.read_exact(&mut item[filled..filled + TS_PACKET_SIZE]) {
            Ok(()) => filled += TS_PACKET_SIZE,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
