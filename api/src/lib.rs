use binrw::{binrw, BinRead, BinWrite};
use convi::ExpectFrom;
use derive_more::Display;
use std::cmp::Ordering;
use std::io::Cursor;

mod net;
pub use self::net::*;

mod peer;
pub use self::peer::*;

mod work;
pub use self::work::*;

/// Identifier of a cluster member
///
/// Stable for the lifetime of the process. Higher ids win ties
/// between votes of the same [`Epoch`].
#[derive(
    Copy, Clone, Debug, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct PeerId(pub u64);

/// Leadership term
#[derive(
    Copy, Clone, Debug, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display,
)]
#[br(big)]
#[bw(big)]
pub struct Epoch(pub u64);

/// A proposal for who should lead, scoped to an [`Epoch`]
///
/// Votes are totally ordered: a vote with a higher epoch is greater,
/// and within the same epoch the one proposing the higher `PeerId`
/// is greater. The greater vote "defeats" the lesser.
#[derive(Copy, Clone, Debug, BinRead, BinWrite, PartialEq, Eq, Hash, Display)]
#[br(big)]
#[bw(big)]
#[display(fmt = "{}@{}", leader, epoch)]
pub struct Vote {
    pub leader: PeerId,
    pub epoch: Epoch,
}

impl Vote {
    pub fn new(leader: PeerId, epoch: Epoch) -> Self {
        Self { leader, epoch }
    }

    /// Does `self` win against `other`
    pub fn defeats(&self, other: &Vote) -> bool {
        self > other
    }
}

impl Ord for Vote {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| self.leader.cmp(&other.leader))
    }
}

impl PartialOrd for Vote {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Length-prefixed byte string
///
/// Used for all variable size data on the wire: message payloads,
/// tasks, task outputs and diagnostics.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    #[br(temp)]
    #[bw(calc = u32::expect_from(data.len()))]
    len: u32,
    #[br(count = len)]
    pub data: Vec<u8>,
}

impl Blob {
    pub const LEN_BYTE_SIZE: usize = 4;

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Blob {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<&[u8]> for Blob {
    fn from(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }
}

macro_rules! impl_wire_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $ty {
                /// Encode into a new buffer
                pub fn to_bytes(&self) -> Vec<u8> {
                    let mut buf = Cursor::new(Vec::new());
                    self.write(&mut buf).expect("can't fail");
                    buf.into_inner()
                }

                /// Decode from `bytes`
                pub fn from_bytes(bytes: &[u8]) -> binrw::BinResult<Self> {
                    Self::read(&mut Cursor::new(bytes))
                }
            }
        )*
    };
}

impl_wire_codec!(
    Message,
    ElectionNotification,
    WorkRequest,
    WorkResult,
    Vote
);

#[test]
fn vote_ordering() {
    let a = Vote::new(PeerId(2), Epoch(5));
    let b = Vote::new(PeerId(7), Epoch(5));
    let c = Vote::new(PeerId(1), Epoch(6));

    assert!(c.defeats(&a));
    assert!(c.defeats(&b));
    assert!(b.defeats(&a));
    assert!(!a.defeats(&b));
    assert!(!a.defeats(&a));
    assert_eq!([a, b, c].iter().max(), Some(&c));
}

#[test]
fn blob_layout() {
    let blob = Blob::from(&b"abc"[..]);
    let mut buf = Cursor::new(Vec::new());
    blob.write(&mut buf).unwrap();
    assert_eq!(buf.into_inner(), [0, 0, 0, 3, b'a', b'b', b'c']);

    let truncated = [0u8, 0, 0, 9, 1, 2];
    assert!(Blob::read(&mut Cursor::new(&truncated[..])).is_err());
}
