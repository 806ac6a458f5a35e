pub mod local;

use crate::comm::error::Result;
use crate::comm::packet::PacketBuf;
use crate::comm::{Rank, Tag};

/// opaque handle for a pending operation, unique per transport instance
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RequestId(pub u64);

/// A completed operation reported by [Transport::test_some] / [Transport::wait_some].
///
/// For receives, `data` is the filled buffer; ownership moves to the caller. For sends
///  `data` is `None`: the transport has drained the packet and dropped its buffer.
#[derive(Debug)]
pub struct Completion {
    pub request: RequestId,
    pub data: Option<PacketBuf>,
}

/// The capability set the messaging core consumes from the underlying message-passing
///  system: identity in the communicator, non-blocking tagged send/receive with
///  pre-posted fixed-capacity receive buffers, batch completion testing, and
///  best-effort cancellation.
///
/// Buffers are owned by the transport while an operation is pinned: `post_send` consumes
///  the packet, `post_recv` allocates the receive slot, and completions (or `cancel`)
///  release them again. All operations either succeed or report a fatal
///  [crate::comm::error::CommError::Transport]; there are no partial or degraded modes.
pub trait Transport {
    fn rank(&self) -> Rank;

    fn num_ranks(&self) -> usize;

    /// non-blocking send of one packet; the buffer stays pinned until the transport
    ///  drains it
    fn post_send(&mut self, dest: Rank, tag: Tag, packet: PacketBuf) -> Result<RequestId>;

    /// posts a receive of `capacity` bytes for `tag`, from a specific rank or from any
    ///  rank when `source` is `None`
    fn post_recv(&mut self, tag: Tag, capacity: usize, source: Option<Rank>) -> Result<RequestId>;

    /// non-blocking poll of the given requests; returns zero or more completions
    fn test_some(&mut self, requests: &[RequestId]) -> Result<Vec<Completion>>;

    /// blocks until at least one of the given requests completes; an empty `requests`
    ///  slice returns immediately with no completions
    fn wait_some(&mut self, requests: &[RequestId]) -> Result<Vec<Completion>>;

    /// best-effort cancellation of a posted receive; frees the pinned buffer
    fn cancel(&mut self, request: RequestId) -> Result<()>;
}
