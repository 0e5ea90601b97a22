//! Echo frames across a pair of cross-wired loopback devices.
//!
//! `dev0` sends numbered IPv4 frames to `dev1`, which echoes each one back from its delivery
//! callback. Once the echoes stop arriving, the statistics of both devices and the exported
//! metrics are printed.

use bytes::Bytes;
use clap::{value_parser, Arg, ArgAction, Command};
use commonware_loopback::{
    frame::{checksum, ETHERTYPE_IPV4, HEADER_LEN},
    Config, Device, Engine, Transmit,
};
use futures::{channel::mpsc, StreamExt};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::{
    num::NonZeroU64,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info, warn, Level};

/// Length of the IPv4 header placed before the sequence number.
const IPV4_HEADER_LEN: usize = 20;

/// Build an IPv4 packet from 192.168.0.1 to 192.168.1.1 carrying `seq`.
fn packet(seq: u32) -> Vec<u8> {
    let total = (IPV4_HEADER_LEN + 4) as u16;
    let mut packet = vec![
        0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 192, 168, 0, 1,
        192, 168, 1, 1,
    ];
    packet[2..4].copy_from_slice(&total.to_be_bytes());
    let sum = checksum(&packet);
    packet[10..12].copy_from_slice(&sum.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet
}

fn sequence(frame: &[u8]) -> u32 {
    let start = HEADER_LEN + IPV4_HEADER_LEN;
    u32::from_be_bytes(frame[start..start + 4].try_into().unwrap())
}

fn main() {
    // Create logger
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    // Parse arguments
    let matches = Command::new("commonware-pingpong")
        .about("echo frames across a pair of loopback devices")
        .arg(
            Arg::new("packets")
                .long("packets")
                .default_value("100")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("pool-size")
                .long("pool-size")
                .default_value("8")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("timeout-ms")
                .long("timeout-ms")
                .default_value("20")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("lockup")
                .long("lockup")
                .value_parser(value_parser!(NonZeroU64)),
        )
        .arg(
            Arg::new("rewrite")
                .long("rewrite")
                .action(ArgAction::SetTrue),
        )
        .get_matches();
    let packets = *matches.get_one::<u32>("packets").unwrap();
    let timeout = Duration::from_millis(*matches.get_one::<u64>("timeout-ms").unwrap());
    let registry = Arc::new(Mutex::new(Registry::default()));
    let cfg = Config {
        registry: registry.clone(),
        pool_size: *matches.get_one::<usize>("pool-size").unwrap(),
        timeout,
        lockup: matches.get_one::<NonZeroU64>("lockup").copied(),
        rewrite: matches.get_flag("rewrite"),
        ..Default::default()
    };
    info!(
        packets,
        pool_size = cfg.pool_size,
        ?timeout,
        lockup = ?cfg.lockup,
        rewrite = cfg.rewrite,
        "loaded config"
    );

    // Start runtime
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("Could not create runtime");
    runtime.block_on(async move {
        let (engine, handler) = Engine::new(cfg).expect("Could not create engine");
        let (ping, pong) = (Device::new(0), Device::new(1));

        // Echo everything received by pong
        let (sender, mut echoes) = mpsc::unbounded();
        let responder = engine.clone();
        tokio::spawn(handler.run(move |device: Device, frame: Bytes| {
            if device != pong {
                let _ = sender.unbounded_send(frame);
                return;
            }
            let echo = match responder.compose(pong, ETHERTYPE_IPV4, &frame[HEADER_LEN..]) {
                Ok(echo) => echo,
                Err(err) => {
                    warn!(?err, "could not build echo");
                    return;
                }
            };
            match responder.transmit(pong, &echo) {
                Ok(Transmit::Accepted) => {}
                Ok(result) => debug!(?result, seq = sequence(&frame), "echo not sent"),
                Err(err) => warn!(?err, "echo failed"),
            }
        }));
        engine.open(ping).expect("Could not open ping");
        engine.open(pong).expect("Could not open pong");
        info!(
            ping = %engine.address(ping).unwrap(),
            pong = %engine.address(pong).unwrap(),
            "opened devices"
        );

        // Send every packet, waiting for a buffer whenever ping is blocked
        let mut blocked = 0;
        for seq in 0..packets {
            let frame = engine
                .compose(ping, ETHERTYPE_IPV4, &packet(seq))
                .expect("Could not build frame");
            loop {
                match engine.transmit(ping, &frame).expect("Could not transmit") {
                    Transmit::Accepted => break,
                    Transmit::Blocked => {
                        blocked += 1;
                        engine.unblocked(ping).await.expect("Engine closed");
                    }
                    Transmit::Dropped => panic!("ping closed"),
                }
            }
            tokio::task::yield_now().await;
        }
        info!(packets, blocked, "sent packets");

        // Collect echoes until they stop arriving
        let mut received = 0;
        let mut last = None;
        while let Ok(Some(echo)) = tokio::time::timeout(timeout * 4, echoes.next()).await {
            let seq = sequence(&echo);
            if last.is_some_and(|last| seq <= last) {
                warn!(seq, ?last, "echo out of order");
            }
            last = Some(seq);
            received += 1;
        }
        info!(packets, received, "collected echoes");

        // Report
        for device in engine.devices() {
            let stats = engine.stats(device).expect("Could not read stats");
            let census = engine.census(device).expect("Could not read census");
            info!(
                %device,
                rx_packets = stats.rx_packets,
                tx_packets = stats.tx_packets,
                rx_bytes = stats.rx_bytes,
                tx_bytes = stats.tx_bytes,
                rx_dropped = stats.rx_dropped,
                tx_errors = stats.tx_errors,
                free = census.free,
                "device stats"
            );
        }
        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).expect("Could not encode metrics");
        println!("{buffer}");

        let reclaimed = engine.shutdown();
        info!(reclaimed, "shut down");
    });
}
