use std::{
    io,
    net::UdpSocket,
    sync::Arc,
    thread,
};

use peerd_api::Message;
use tracing::{info, trace, warn};

use super::{PeerShared, SHUTDOWN_CHECK_PERIOD};
use crate::task::AutoJoinHandle;

/// Big enough for any UDP datagram
const RECV_BUF_SIZE: usize = 65_536;

/// Drains the outgoing queue onto the network, one datagram per message
pub struct UdpSender {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl UdpSender {
    pub fn new(
        shared: Arc<PeerShared>,
        socket: UdpSocket,
        outgoing_rx: flume::Receiver<Message>,
    ) -> io::Result<Self> {
        Ok(Self {
            join_handle: AutoJoinHandle::spawn("udp-sender", move || {
                let _guard = scopeguard::guard((), |_| {
                    info!("UdpSender is done");
                });
                let panic_guard = shared.panic_guard("udp-sender");

                while !shared.is_node_shutting_down() {
                    let msg = match outgoing_rx.recv_timeout(SHUTDOWN_CHECK_PERIOD) {
                        Ok(msg) => msg,
                        Err(flume::RecvTimeoutError::Timeout) => continue,
                        Err(flume::RecvTimeoutError::Disconnected) => break,
                    };

                    let Some(target) = msg.receiver_addr() else {
                        warn!(receiver = %msg.receiver, "Unresolvable receiver, dropping message");
                        continue;
                    };

                    trace!(%target, kind = ?msg.kind, "Sending");
                    if let Err(e) = socket.send_to(&msg.to_bytes(), target) {
                        warn!(%target, error = %e, "Failed to send datagram");
                    }
                }

                panic_guard.done();
            })?,
        })
    }
}

/// Reads datagrams off the socket into the incoming queue
///
/// The socket must have a read timeout set, so shutdown is noticed.
pub struct UdpReceiver {
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl UdpReceiver {
    pub fn new(
        shared: Arc<PeerShared>,
        socket: UdpSocket,
        incoming_tx: flume::Sender<Message>,
    ) -> io::Result<Self> {
        Ok(Self {
            join_handle: AutoJoinHandle::spawn("udp-receiver", move || {
                let _guard = scopeguard::guard((), |_| {
                    info!("UdpReceiver is done");
                });
                let panic_guard = shared.panic_guard("udp-receiver");
                let mut buf = vec![0u8; RECV_BUF_SIZE];

                while !shared.is_node_shutting_down() {
                    let (len, from) = match socket.recv_from(&mut buf) {
                        Ok(o) => o,
                        Err(e)
                            if matches!(
                                e.kind(),
                                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                            ) =>
                        {
                            // just the read timeout
                            continue;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to receive datagram");
                            thread::sleep(SHUTDOWN_CHECK_PERIOD);
                            continue;
                        }
                    };

                    match Message::from_bytes(&buf[..len]) {
                        Ok(msg) => {
                            trace!(%from, kind = ?msg.kind, "Received");
                            if incoming_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%from, len, error = %e, "Invalid datagram");
                        }
                    }
                }

                panic_guard.done();
            })?,
        })
    }
}
