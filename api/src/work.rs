use binrw::{BinRead, BinWrite};
use derive_more::Display;
use std::borrow::Cow;

use crate::Blob;

/// Correlation token of a task
///
/// Chosen by the client when submitting to the leader, and by the
/// leader when assigning the task to a follower. Results echo it back.
#[derive(Copy, Clone, Debug, BinRead, BinWrite, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[br(big)]
#[bw(big)]
pub struct RequestId(pub u64);

/// Payload of [`crate::MessageKind::Work`]
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct WorkRequest {
    pub request_id: RequestId,
    /// Opaque to the coordination layer; interpreted by the executor only
    pub task: Blob,
}

/// Result of executing a task
///
/// A failed execution is still a result: it travels back to the
/// requester like any other.
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub enum TaskOutcome {
    /// Output produced by the task
    #[brw(magic(0u8))]
    Success(Blob),
    /// Diagnostic describing why the task failed
    #[brw(magic(1u8))]
    Failure(Blob),
}

impl TaskOutcome {
    pub fn success(output: impl Into<Vec<u8>>) -> Self {
        Self::Success(Blob::from(output.into()))
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self::Failure(Blob::from(diagnostic.into().into_bytes()))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Raw bytes: the output on success, the diagnostic on failure
    pub fn data(&self) -> &[u8] {
        match self {
            Self::Success(blob) | Self::Failure(blob) => blob.as_slice(),
        }
    }

    pub fn diagnostic(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(blob) => Some(String::from_utf8_lossy(blob.as_slice())),
        }
    }
}

/// Payload of [`crate::MessageKind::CompletedWork`]
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[br(big)]
#[bw(big)]
pub struct WorkResult {
    pub request_id: RequestId,
    pub outcome: TaskOutcome,
}

#[test]
fn work_result_layout() {
    let res = WorkResult {
        request_id: RequestId(0x0102),
        outcome: TaskOutcome::failure("boom"),
    };
    let bytes = res.to_bytes();
    assert_eq!(&bytes[0..8], &0x0102u64.to_be_bytes());
    assert_eq!(bytes[8], 1);
    assert_eq!(&bytes[9..13], &[0, 0, 0, 4]);
    assert_eq!(&bytes[13..], b"boom");

    let decoded = WorkResult::from_bytes(&bytes).unwrap();
    assert_eq!(decoded.outcome.diagnostic().as_deref(), Some("boom"));
    assert!(!decoded.outcome.is_success());
}

#[test]
fn work_result_rejects_bad_outcome_tag() {
    let mut bytes = WorkResult {
        request_id: RequestId(1),
        outcome: TaskOutcome::success(b"ok".to_vec()),
    }
    .to_bytes();
    assert!(WorkResult::from_bytes(&bytes).unwrap().outcome.is_success());
    bytes[8] = 9;
    assert!(WorkResult::from_bytes(&bytes).is_err());
}
