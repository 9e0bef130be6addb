//! `fastpass-shaperd`: the per-host traffic shaper daemon. Talks to a single
//! arbiter over UDP (see `fastpass-arbiterd`'s note on the protocol-222
//! substitution) and paces a synthetic local traffic generator's packets
//! through the timeslot schedule it negotiates.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use socket2::{Domain, Socket, Type};

use fastpass_endpoint::config::ShaperConfig;
use fastpass_endpoint::EndpointConnection;
use fastpass_shared::config::ProtocolConfig;
use fastpass_shared::{NodeId, Timestamp, MAX_NODES};

#[derive(Parser, Debug)]
#[command(name = "fastpass-shaperd", about = "Per-host Fastpass traffic shaper")]
struct Args {
    /// Local UDP address to bind for control traffic with the arbiter.
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// The arbiter's address.
    #[arg(long)]
    arbiter: SocketAddr,

    #[arg(long, default_value_t = ShaperConfig::default().miss_threshold)]
    miss_threshold: u64,

    #[arg(long, default_value_t = ShaperConfig::default().timeslot_len_ns)]
    timeslot_len_ns: u64,
}

/// Spawns a thread that manufactures demand for a handful of destinations,
/// standing in for the real packet path a kernel module or userspace
/// networking stack would feed in. Bounded so a stalled shaper applies
/// backpressure rather than letting synthetic demand run away.
fn spawn_demo_traffic() -> Receiver<NodeId> {
    let (tx, rx) = bounded(1024);
    std::thread::spawn(move || {
        let mut next = 0u16;
        loop {
            let dst = NodeId::new(next % (MAX_NODES - 1));
            next = next.wrapping_add(1);
            if tx.send(dst).is_err() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    });
    rx
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).expect("failed to create socket");
    socket.set_nonblocking(true).expect("failed to set socket nonblocking");
    socket.bind(&args.bind.into()).expect("failed to bind local address");
    socket.connect(&args.arbiter.into()).expect("failed to connect to arbiter");
    let socket: UdpSocket = socket.into();

    let now = Timestamp::try_now_ns().unwrap_or(0);
    let shaper_config = ShaperConfig {
        miss_threshold: args.miss_threshold,
        timeslot_len_ns: args.timeslot_len_ns,
        ..ShaperConfig::default()
    };
    let conn = Arc::new(EndpointConnection::new(
        ProtocolConfig::default(),
        shaper_config,
        0,
        0,
        now,
        0,
    ));

    let traffic = spawn_demo_traffic();

    log::info!("fastpass-shaperd connecting to arbiter at {}", args.arbiter);

    let mut last_timeslot_tick = now;
    let mut rx_buf = [0u8; 1500];
    let mut tx_buf = [0u8; 1500];
    loop {
        while let Ok(dst) = traffic.try_recv() {
            let now = Timestamp::try_now_ns().unwrap_or(0);
            conn.enqueue_packet(dst, now);
        }

        match socket.recv(&mut rx_buf) {
            Ok(n) => {
                let now = Timestamp::try_now_ns().unwrap_or(0);
                if let Err(e) = conn.handle_rx_packet(&rx_buf[..n], now) {
                    log::warn!("malformed packet from arbiter: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => log::error!("recv failed: {e}"),
        }

        let now = Timestamp::try_now_ns().unwrap_or(0);
        match conn.send_request_if_due(now, &mut tx_buf, 0) {
            Ok(Some(n)) => {
                conn.take_wants_send();
                if let Err(e) = socket.send(&tx_buf[..n]) {
                    log::warn!("send failed: {e}");
                }
            }
            Ok(None) => {
                if conn.take_wants_send() {
                    match conn.send_control_packet(now, &mut tx_buf, 0) {
                        Ok(n) => {
                            if let Err(e) = socket.send(&tx_buf[..n]) {
                                log::warn!("send failed: {e}");
                            }
                        }
                        Err(e) => log::warn!("failed to encode control packet: {e}"),
                    }
                }
            }
            Err(e) => log::warn!("failed to encode A-REQ: {e}"),
        }

        if now.saturating_sub(last_timeslot_tick) >= shaper_config.timeslot_len_ns {
            let elapsed_tslots = (now - last_timeslot_tick) / shaper_config.timeslot_len_ns;
            last_timeslot_tick += elapsed_tslots * shaper_config.timeslot_len_ns;
            let current = conn.current_timeslot() + elapsed_tslots;
            conn.tick(current);
        }

        if conn.next_timer_deadline_ns().is_some_and(|d| now >= d) {
            conn.handle_timeout(now);
        }

        std::thread::sleep(Duration::from_micros(200));
    }
}
