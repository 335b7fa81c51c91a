//! Submitting tasks to a `peerd` cluster leader over UDP
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use peerd_api::{
    Blob, Message, MessageKind, RequestId, WorkRequest, WorkResult, MAX_DATAGRAM_SIZE,
};
use tracing::{debug, trace};

pub use peerd_api::TaskOutcome;

mod error {
    use ::std::io;
    use thiserror::Error;
    #[derive(Error, Debug)]
    pub enum Error {
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("data decoding error: {0}")]
        Decoding(#[from] binrw::Error),
        #[error("task of {size} bytes does not fit in a datagram")]
        TooLarge { size: usize },
        #[error("no result before the deadline")]
        Timeout,
    }
}

pub use self::error::Error;
pub type Result<T> = ::std::result::Result<T, Error>;

/// Submits tasks to a leader and waits for their outcomes
///
/// Delivery over UDP is best effort: a lost request or result shows up
/// as [`Error::Timeout`], and it's up to the caller whether to retry.
pub struct Client {
    conn: UdpSocket,
    leader: SocketAddr,
    local_addr: SocketAddr,
    timeout: Duration,
    next_request_id: u64,
}

impl Client {
    pub fn connect(leader: SocketAddr, timeout: Duration) -> Result<Self> {
        let bind: IpAddr = if leader.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        };
        let conn = UdpSocket::bind(SocketAddr::new(bind, 0))?;
        // pins the local address to the interface routing to the leader,
        // which is what the leader will reply to
        conn.connect(leader)?;
        let local_addr = conn.local_addr()?;
        debug!(%leader, %local_addr, "Client ready");

        Ok(Self {
            conn,
            leader,
            local_addr,
            timeout,
            next_request_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Submit a task and wait for its outcome
    ///
    /// A task that ran but failed is still `Ok`, check
    /// [`TaskOutcome::is_success`].
    pub fn submit(&mut self, task: &[u8]) -> Result<TaskOutcome> {
        let request_id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        let payload = WorkRequest {
            request_id,
            task: Blob::from(task),
        }
        .to_bytes();
        let size = Message::header_len(self.local_addr, self.leader) + payload.len();
        if MAX_DATAGRAM_SIZE < size {
            return Err(Error::TooLarge { size });
        }

        let msg = Message::new(MessageKind::Work, self.local_addr, self.leader, payload);
        trace!(%request_id, leader = %self.leader, "Submitting");
        self.conn.send(&msg.to_bytes())?;

        self.wait_for_result(request_id)
    }

    fn wait_for_result(&mut self, request_id: RequestId) -> Result<TaskOutcome> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            self.conn.set_read_timeout(Some(remaining))?;

            let len = match self.conn.recv(&mut buf) {
                Ok(len) => len,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(Error::Timeout);
                }
                Err(e) => return Err(e.into()),
            };

            let msg = Message::from_bytes(&buf[..len])?;
            if msg.kind != MessageKind::CompletedWork {
                trace!(kind = ?msg.kind, "Ignoring unexpected message");
                continue;
            }
            let result = WorkResult::from_bytes(msg.payload.as_slice())?;
            if result.request_id != request_id {
                debug!(got = %result.request_id, %request_id, "Ignoring stale result");
                continue;
            }
            return Ok(result.outcome);
        }
    }
}
