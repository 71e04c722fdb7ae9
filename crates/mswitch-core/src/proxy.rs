//! UDP Proxy (C5).
//!
//! One non-blocking receive socket per source, one send socket, fanned in
//! through a single `tokio::select!` over every source's `recv_from`
//! future — the same shape a single-socket OSC listener loop uses,
//! generalized from one socket to N racing branches. `active_index` is
//! read from the state's atomic mirror so the hot path never takes a lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::Controller;
use crate::error::ControllerError;
use crate::source::SourceTable;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

const RECV_BUF_LEN: usize = 2048;

/// One bound receive socket paired with the source index it serves.
pub struct SourceSocket {
    index: usize,
    socket: UdpSocket,
}

impl SourceSocket {
    /// The source index this socket forwards on behalf of.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The socket's bound local address, for tests and diagnostics that
    /// need to address it without reaching into the struct's private field.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Bind one UDP receive socket per source at `base_port + i`, and the
/// single output socket bound ephemeral but connected to `output_addr`.
pub async fn bind_sockets(
    sources: &SourceTable,
    base_port: u16,
    output_port: u16,
) -> Result<(Vec<SourceSocket>, UdpSocket), ControllerError> {
    let mut receivers = Vec::with_capacity(sources.len());
    for i in 0..sources.len() {
        let addr: SocketAddr = format!("127.0.0.1:{}", base_port + i as u16)
            .parse()
            .expect("formatted loopback address is always valid");
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ControllerError::SocketBindFailed {
                addr: addr.to_string(),
                source,
            })?;
        receivers.push(SourceSocket { index: i, socket });
    }

    let output_bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let output_socket =
        UdpSocket::bind(output_bind)
            .await
            .map_err(|source| ControllerError::SocketBindFailed {
                addr: output_bind.to_string(),
                source,
            })?;

    let output_addr: SocketAddr = format!("127.0.0.1:{output_port}")
        .parse()
        .expect("formatted loopback address is always valid");
    output_socket
        .connect(output_addr)
        .await
        .map_err(|source| ControllerError::SocketBindFailed {
            addr: output_addr.to_string(),
            source,
        })?;

    Ok((receivers, output_socket))
}

/// Run the fan-in loop until `shutdown` is triggered. Every received
/// datagram stamps its source's arrival timestamp, active or not — the
/// proxy thread is one of the two components the health block's arrival
/// fields are allowed to mutate. Packets received on the active source's
/// socket are forwarded verbatim to the output socket; everything else is
/// discarded. Never reorders within one source, never retries a partial
/// send.
pub async fn run(
    receivers: Vec<SourceSocket>,
    output: UdpSocket,
    controller: Arc<Controller>,
    shutdown: CancellationToken,
) {
    let mut buf = [0u8; RECV_BUF_LEN];

    info!(target: crate::LOG_TARGET, sources = receivers.len(), "udp proxy started");

    loop {
        let active = controller.state.active_index();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!(target: crate::LOG_TARGET, "udp proxy shutting down");
                return;
            }

            result = recv_any(&receivers, &mut buf) => {
                let (index, len) = match result {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(target: crate::LOG_TARGET, error = %err, "udp receive error");
                        continue;
                    }
                };

                // Arrival timestamps are stamped for every source, active or
                // not, since a standby source's liveness still needs to be
                // tracked for failover candidate selection.
                controller.record_packet_arrival(index, now_ms());

                if index != active {
                    continue;
                }

                if let Err(err) = output.send(&buf[..len]).await {
                    warn!(target: crate::LOG_TARGET, error = %err, "partial or failed send to output socket");
                }
            }
        }
    }
}

/// Race every receive socket's `recv` call, returning the first to yield
/// data along with which source index it came from. `receivers` is bounded
/// by `MSW_MAX_SOURCES`, so a fixed-arity `select!` covers every shape
/// without pulling in a dynamic-future combinator for a handful of
/// branches — avoiding a dynamic-future combinator for a handful of
/// statically bounded sockets.
async fn recv_any(receivers: &[SourceSocket], buf: &mut [u8]) -> std::io::Result<(usize, usize)> {
    debug_assert!(receivers.len() <= crate::MSW_MAX_SOURCES);

    // Each select! branch needs its own receive buffer: two futures
    // mutably borrowing the same slice cannot be polled concurrently.
    let mut b0 = [0u8; RECV_BUF_LEN];
    let mut b1 = [0u8; RECV_BUF_LEN];
    let mut b2 = [0u8; RECV_BUF_LEN];

    let (index, len, local): (usize, usize, &[u8]) = match receivers.len() {
        1 => {
            let len = receivers[0].socket.recv(&mut b0).await?;
            (receivers[0].index, len, &b0[..len])
        }
        2 => {
            tokio::select! {
                r = receivers[0].socket.recv(&mut b0) => { let len = r?; (receivers[0].index, len, &b0[..len]) }
                r = receivers[1].socket.recv(&mut b1) => { let len = r?; (receivers[1].index, len, &b1[..len]) }
            }
        }
        3 => {
            tokio::select! {
                r = receivers[0].socket.recv(&mut b0) => { let len = r?; (receivers[0].index, len, &b0[..len]) }
                r = receivers[1].socket.recv(&mut b1) => { let len = r?; (receivers[1].index, len, &b1[..len]) }
                r = receivers[2].socket.recv(&mut b2) => { let len = r?; (receivers[2].index, len, &b2[..len]) }
            }
        }
        n => unreachable!("source count {n} exceeds MSW_MAX_SOURCES"),
    };

    buf[..len].copy_from_slice(local);
    Ok((index, len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AutoFailoverConfig, RevertConfig, Thresholds};
    use crate::controller::ControllerConfig;
    use crate::filter_adapter::NullFilterAdapter;
    use crate::state::ControllerStateConfig;

    fn test_controller(sources: SourceTable) -> Arc<Controller> {
        Controller::new(ControllerConfig {
            sources,
            state: ControllerStateConfig::default(),
            queue_capacity: 8,
            thresholds: Thresholds::default(),
            auto_failover: AutoFailoverConfig::default(),
            revert: RevertConfig::default(),
            filter: Box::new(NullFilterAdapter),
            startup_grace_ms: 0,
        })
    }

    #[tokio::test]
    async fn binds_one_socket_per_source_plus_output() {
        let sources = SourceTable::parse("s0=udp://a;s1=udp://b").unwrap();
        // port 0 asks the OS for an ephemeral port, keeping the test
        // independent of whatever base_port a real deployment picks.
        let (receivers, _output) = bind_sockets(&sources, 0, 0).await.unwrap();
        assert_eq!(receivers.len(), 2);
    }

    #[tokio::test]
    async fn forwards_only_active_source_traffic() {
        let sources = SourceTable::parse("s0=udp://a;s1=udp://b").unwrap();
        let (receivers, output) = bind_sockets(&sources, 0, 0).await.unwrap();

        let send_addrs: Vec<SocketAddr> = receivers
            .iter()
            .map(|r| r.socket.local_addr().unwrap())
            .collect();

        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_addr = sink.local_addr().unwrap();
        output.connect(sink_addr).await.unwrap();

        let controller = test_controller(sources);
        let shutdown = CancellationToken::new();

        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(run(receivers, output, controller, task_shutdown));

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"active", send_addrs[0]).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(std::time::Duration::from_secs(1), sink.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"active");

        shutdown.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }

    #[tokio::test]
    async fn stamps_arrival_on_every_source_even_when_inactive() {
        let sources = SourceTable::parse("s0=udp://a;s1=udp://b").unwrap();
        let (receivers, output) = bind_sockets(&sources, 0, 0).await.unwrap();

        let send_addrs: Vec<SocketAddr> = receivers
            .iter()
            .map(|r| r.socket.local_addr().unwrap())
            .collect();

        let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        output.connect(sink.local_addr().unwrap()).await.unwrap();

        let controller = test_controller(sources);
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let task_controller = Arc::clone(&controller);
        let handle = tokio::spawn(run(receivers, output, task_controller, task_shutdown));

        // active_index defaults to 0; source 1 is the inactive standby.
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"standby-traffic", send_addrs[1]).await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        loop {
            if controller.sources.get(1).unwrap().health_snapshot().last_packet_time_ms > 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("standby source arrival was never stamped");
            }
            tokio::task::yield_now().await;
        }

        shutdown.cancel();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
    }
}
