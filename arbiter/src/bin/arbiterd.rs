//! `fastpass-arbiterd`: runs the admission pipeline and the per-endpoint
//! control connections over a UDP transport.
//!
//! The reference arbiter speaks directly over IP protocol 222 via a raw
//! socket; this binary instead binds a UDP socket (still via `socket2`, for
//! the same non-blocking/buffer-size control the reference gets from raw
//! sockets) so the demo runs without elevated privileges. See `DESIGN.md`.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::RwLock;
use socket2::{Domain, Socket, Type};

use fastpass_arbiter::config::AdmissionConfig;
use fastpass_arbiter::connection::ArbiterConnection;
use fastpass_arbiter::pipeline::{AdmittedTraffic, Pipeline};
use fastpass_shared::config::{ProtocolConfig, ALLOC_REPORT_INTERVAL_NS};
use fastpass_shared::protocol::build_alloc_tslots;
use fastpass_shared::{NodeId, Timestamp, MAX_NODES};

#[derive(Parser, Debug)]
#[command(name = "fastpass-arbiterd", about = "Centralized timeslot arbiter")]
struct Args {
    /// UDP address to listen for endpoint control traffic on.
    #[arg(long, default_value = "0.0.0.0:9876")]
    listen: SocketAddr,

    #[arg(long, default_value_t = AdmissionConfig::default().n_admission_cores)]
    admission_cores: usize,

    #[arg(long, default_value_t = AdmissionConfig::default().batch_size)]
    batch_size: u32,

    #[arg(long, default_value_t = AdmissionConfig::default().num_bins)]
    num_bins: usize,

    #[arg(long)]
    oversubscribed: bool,
}

/// Derives a node id from a peer's source address. A real deployment
/// resolves this from switch-port topology; that resolution is explicitly
/// out of scope here (§1 Non-goals: topology discovery), so this binary
/// uses the low byte of the source address as a stand-in.
fn node_for_addr(addr: SocketAddr) -> NodeId {
    let low_byte = match addr {
        SocketAddr::V4(v4) => v4.ip().octets()[3],
        SocketAddr::V6(v6) => v6.ip().octets()[15],
    };
    NodeId::new(u16::from(low_byte) % MAX_NODES)
}

type ConnTable = Arc<RwLock<HashMap<NodeId, Arc<ArbiterConnection>>>>;

fn connection_for(
    connections: &ConnTable,
    node: NodeId,
    pipeline: &Pipeline,
    protocol_config: ProtocolConfig,
    now: u64,
) -> Arc<ArbiterConnection> {
    if let Some(existing) = connections.read().get(&node) {
        return Arc::clone(existing);
    }
    let conn = Arc::new(ArbiterConnection::new(
        node,
        protocol_config,
        0,
        0,
        now,
        Arc::clone(&pipeline.flow_table),
        pipeline.q_head_tx.clone(),
    ));
    connections.write().insert(node, Arc::clone(&conn));
    conn
}

/// Folds one timeslot's admitted `(src, dst)` pairs into the per-source
/// pending-grant buffers (§6: the arbiter sends grants, not per-timeslot
/// packets, so grants accumulate until the pacer or a size limit flushes
/// them).
fn accumulate_admitted(
    pending: &mut HashMap<NodeId, Vec<(NodeId, u64)>>,
    admitted: &AdmittedTraffic,
) {
    for &(src, dst) in admitted.pairs() {
        pending.entry(src).or_default().push((dst, admitted.timeslot));
    }
}

/// Sends every connected endpoint its periodic alloc-report (§4.4.5).
fn flush_alloc_reports(
    connections: &ConnTable,
    socket: &UdpSocket,
    peer_addrs: &HashMap<NodeId, SocketAddr>,
    now: u64,
) {
    for (node, conn) in connections.read().iter() {
        let Some(&peer) = peer_addrs.get(node) else { continue };
        let mut buf = [0u8; 1500];
        match conn.commit_alloc_report(now, &mut buf, 0) {
            Ok(Some(n)) => {
                if let Err(e) = socket.send_to(&buf[..n], peer) {
                    log::warn!("node {node:?}: alloc-report send failed: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("node {node:?}: failed to encode alloc-report: {e}"),
        }
    }
}

/// Flushes every source's pending grants as an ALLOC packet, capping at 15
/// distinct destinations and `MAX_ALLOC_DESCRIPTORS` grants per packet per
/// the wire format (§4.2.1).
fn flush_pending(
    pending: &mut HashMap<NodeId, Vec<(NodeId, u64)>>,
    connections: &ConnTable,
    socket: &UdpSocket,
    peer_addrs: &HashMap<NodeId, SocketAddr>,
    now: u64,
) {
    for (src, grants) in pending.drain() {
        if grants.is_empty() {
            continue;
        }
        let Some(conn) = connections.read().get(&src).cloned() else { continue };
        let Some(&peer) = peer_addrs.get(&src) else { continue };

        // `base_tslot` only has 16 bits of precision on the wire (the low 4
        // bits are implied zero and restored with `<<4` on decode), so the
        // cursor `build_alloc_tslots` computes gaps against must already be
        // rounded down to a multiple of 16.
        let base = grants.iter().map(|(_, t)| *t).min().unwrap_or(0);
        let base = base - (base % 16);
        let mut dsts: Vec<u16> = Vec::new();
        let mut indexed: Vec<(u8, u64)> = Vec::with_capacity(grants.len());
        for (dst, tslot) in grants {
            let dst_wire = u16::from(dst);
            let index = match dsts.iter().position(|&d| d == dst_wire) {
                Some(i) => i,
                None if dsts.len() < 15 => {
                    dsts.push(dst_wire);
                    dsts.len() - 1
                }
                None => {
                    log::warn!("node {src:?}: ALLOC packet full, dropping grant to {dst:?}");
                    continue;
                }
            };
            indexed.push((index as u8, tslot));
        }
        indexed.sort_by_key(|(_, t)| *t);

        let tslots = build_alloc_tslots(base, &indexed);
        let mut buf = [0u8; 1500];
        match conn.commit_alloc(base as u32, dsts, tslots, now, &mut buf, 0) {
            Ok(n) => {
                if let Err(e) = socket.send_to(&buf[..n], peer) {
                    log::warn!("node {src:?}: send failed: {e}");
                }
            }
            Err(e) => log::warn!("node {src:?}: failed to encode ALLOC: {e}"),
        }
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let admission_config = AdmissionConfig {
        n_admission_cores: args.admission_cores,
        batch_size: args.batch_size,
        num_bins: args.num_bins,
        oversubscribed: args.oversubscribed,
        ..AdmissionConfig::default()
    };
    let pipeline = Pipeline::spawn(admission_config);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).expect("failed to create socket");
    socket.set_nonblocking(true).expect("failed to set socket nonblocking");
    socket.bind(&args.listen.into()).expect("failed to bind listen address");
    let socket: UdpSocket = socket.into();

    let connections: ConnTable = Arc::new(RwLock::new(HashMap::new()));
    let mut peer_addrs: HashMap<NodeId, SocketAddr> = HashMap::new();
    let mut pending: HashMap<NodeId, Vec<(NodeId, u64)>> = HashMap::new();
    let protocol_config = ProtocolConfig::default();
    let mut next_alloc_report_ns = 0u64;

    log::info!("fastpass-arbiterd listening on {}", args.listen);

    let mut rx_buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut rx_buf) {
            Ok((n, peer)) => {
                let now = Timestamp::try_now_ns().unwrap_or(0);
                let node = node_for_addr(peer);
                peer_addrs.insert(node, peer);
                let conn = connection_for(&connections, node, &pipeline, protocol_config, now);
                if let Err(e) = conn.handle_rx_packet(&rx_buf[..n], now) {
                    log::warn!("node {node:?}: malformed packet: {e}");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => log::error!("recv_from failed: {e}"),
        }

        while let Ok(admitted) = pipeline.q_admitted_rx.try_recv() {
            accumulate_admitted(&mut pending, &admitted);
        }
        let now = Timestamp::try_now_ns().unwrap_or(0);
        if !pending.is_empty() {
            flush_pending(&mut pending, &connections, &socket, &peer_addrs, now);
        }

        for conn in connections.read().values() {
            if conn.next_timer_deadline_ns().is_some_and(|d| now >= d) {
                conn.handle_timeout(now);
            }
        }

        if now >= next_alloc_report_ns {
            flush_alloc_reports(&connections, &socket, &peer_addrs, now);
            next_alloc_report_ns = now + ALLOC_REPORT_INTERVAL_NS;
        }
    }
}
