use binrw::{binrw, BinRead, BinWrite};
use derive_more::Display;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{PeerId, Vote};

/// Phase of a peer's lifecycle
#[derive(IntoPrimitive, TryFromPrimitive, Debug, Display, PartialEq, Eq, Clone, Copy, Hash)]
#[repr(u8)]
#[binrw]
#[brw(repr = u8)]
pub enum ServerState {
    /// Looking for a leader
    Looking = 0,
    /// Distributing work to followers
    Leading = 1,
    /// Executing work assigned by the leader
    Following = 2,
}

impl Default for ServerState {
    /// The only legal initial state
    fn default() -> Self {
        Self::Looking
    }
}

/// Vote notification exchanged during leader election
///
/// Besides the vote itself carries the identity and state of
/// the peer that sent it, so peers that already decided can be told
/// apart from peers still looking.
#[derive(BinRead, BinWrite, Debug, Copy, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct ElectionNotification {
    pub vote: Vote,
    pub sender_id: PeerId,
    pub sender_state: ServerState,
}

impl ElectionNotification {
    pub const BYTE_SIZE: usize = 8 + 8 + 8 + 1;
}

#[test]
fn election_notification_layout() {
    use crate::Epoch;

    let n = ElectionNotification {
        vote: Vote::new(PeerId(3), Epoch(1)),
        sender_id: PeerId(2),
        sender_state: ServerState::Following,
    };
    let bytes = n.to_bytes();
    assert_eq!(bytes.len(), ElectionNotification::BYTE_SIZE);
    assert_eq!(&bytes[0..8], &3u64.to_be_bytes());
    assert_eq!(&bytes[8..16], &1u64.to_be_bytes());
    assert_eq!(&bytes[16..24], &2u64.to_be_bytes());
    assert_eq!(bytes[24], 2);
    assert_eq!(ElectionNotification::from_bytes(&bytes).unwrap(), n);
}

#[test]
fn server_state_primitive() {
    assert_eq!(u8::from(ServerState::Leading), 1);
    assert_eq!(ServerState::try_from(2u8).ok(), Some(ServerState::Following));
    assert!(ServerState::try_from(3u8).is_err());
    assert_eq!(ServerState::default(), ServerState::Looking);
}
