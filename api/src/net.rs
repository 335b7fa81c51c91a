use binrw::{binrw, BinRead, BinWrite};
use convi::ExpectFrom;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::Blob;

/// Biggest payload of a single UDP datagram over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Message type
///
/// Every message starts with a one byte type.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum MessageKind {
    /// Vote notification, payload: [`crate::ElectionNotification`]
    Election = 0,
    /// Task submission or assignment, payload: [`crate::WorkRequest`]
    Work = 1,
    /// Task result, payload: [`crate::WorkResult`]
    CompletedWork = 2,
}

/// Host and port as carried in a message header
///
/// The host is kept in its textual form, the way it was given to us.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireAddress {
    #[br(temp)]
    #[bw(calc = u8::expect_from(host.len()))]
    host_len: u8,
    #[br(count = host_len)]
    host: Vec<u8>,
    pub port: u16,
}

impl WireAddress {
    pub fn host(&self) -> Option<&str> {
        std::str::from_utf8(&self.host).ok()
    }

    /// Resolve to a socket address, if the host is a literal IP
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        let ip: IpAddr = self.host()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for WireAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            host: addr.ip().to_string().into_bytes(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for WireAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            String::from_utf8_lossy(&self.host),
            self.port
        )
    }
}

/// The unit of the transport
///
/// One message is one datagram. Messages carry no session or sequence
/// information: they can get lost, duplicated and reordered.
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: WireAddress,
    pub receiver: WireAddress,
    pub payload: Blob,
}

impl Message {
    pub fn new(
        kind: MessageKind,
        sender: SocketAddr,
        receiver: SocketAddr,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            sender: sender.into(),
            receiver: receiver.into(),
            payload: payload.into(),
        }
    }

    /// Size of the encoded header, not counting the payload bytes
    pub fn header_len(sender: SocketAddr, receiver: SocketAddr) -> usize {
        fn addr_len(addr: SocketAddr) -> usize {
            1 + addr.ip().to_string().len() + 2
        }
        1 + addr_len(sender) + addr_len(receiver) + Blob::LEN_BYTE_SIZE
    }

    pub fn sender_addr(&self) -> Option<SocketAddr> {
        self.sender.to_socket_addr()
    }

    pub fn receiver_addr(&self) -> Option<SocketAddr> {
        self.receiver.to_socket_addr()
    }
}

#[test]
fn message_layout() {
    let msg = Message::new(
        MessageKind::Work,
        "10.0.0.1:7000".parse().unwrap(),
        "10.0.0.2:258".parse().unwrap(),
        vec![0xaa, 0xbb],
    );

    let bytes = msg.to_bytes();
    let mut expected = vec![1u8];
    expected.push(8);
    expected.extend_from_slice(b"10.0.0.1");
    expected.extend_from_slice(&7000u16.to_be_bytes());
    expected.push(8);
    expected.extend_from_slice(b"10.0.0.2");
    expected.extend_from_slice(&[1, 2]);
    expected.extend_from_slice(&[0, 0, 0, 2, 0xaa, 0xbb]);
    assert_eq!(bytes, expected);
    assert_eq!(
        bytes.len(),
        Message::header_len(msg.sender_addr().unwrap(), msg.receiver_addr().unwrap()) + 2
    );

    let decoded = Message::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, msg);
    assert_eq!(decoded.receiver_addr(), Some("10.0.0.2:258".parse().unwrap()));
}

#[test]
fn message_unknown_kind_is_rejected() {
    let mut bytes = Message::new(
        MessageKind::Election,
        "[::1]:1".parse().unwrap(),
        "[::1]:2".parse().unwrap(),
        vec![],
    )
    .to_bytes();
    bytes[0] = 7;
    assert!(Message::from_bytes(&bytes).is_err());
}
