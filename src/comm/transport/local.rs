//! In-process transport: all ranks live in one process, one driver thread per rank,
//!  exchanging packets through shared mailboxes. This is the transport used by the
//!  scenario tests and by single-host embeddings; semantics mirror the MPI-style
//!  matching the messenger is written against:
//!
//! * a packet is delivered into the oldest posted receive at the destination whose
//!   `(tag, source-or-any)` matches; with no match it queues until a receive is posted
//! * sends complete eagerly once the packet is handed off
//! * `wait_some` parks on a condition variable until a matching completion exists

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::comm::error::{CommError, Result};
use crate::comm::packet::PacketBuf;
use crate::comm::transport::{Completion, RequestId, Transport};
use crate::comm::{Rank, Tag};

struct PostedRecv {
    request: RequestId,
    tag: Tag,
    source: Option<Rank>,
    capacity: usize,
    /// filled once a matching packet has been delivered
    data: Option<PacketBuf>,
}

struct Delivery {
    source: Rank,
    tag: Tag,
    data: PacketBuf,
}

struct RankState {
    /// receives posted at this rank, in post order
    posted: Vec<PostedRecv>,
    /// packets that arrived before a matching receive was posted
    unexpected: VecDeque<Delivery>,
    /// sends originated at this rank that have been handed off but not yet reaped
    drained_sends: FxHashSet<RequestId>,
}

struct ClusterState {
    next_request: u64,
    ranks: Vec<RankState>,
}

struct Shared {
    state: Mutex<ClusterState>,
    completed: Condvar,
}

/// Creates the transports of an in-process cluster: one [LocalTransport] per rank, all
///  connected through the same shared mailbox state. The mailbox state is scoped to the
///  cluster instance, so independent clusters in one process do not interfere.
pub struct LocalCluster;

impl LocalCluster {
    pub fn new(num_ranks: usize) -> Vec<LocalTransport> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ClusterState {
                next_request: 0,
                ranks: (0..num_ranks)
                    .map(|_| RankState {
                        posted: Vec::new(),
                        unexpected: VecDeque::new(),
                        drained_sends: FxHashSet::default(),
                    })
                    .collect(),
            }),
            completed: Condvar::new(),
        });

        (0..num_ranks)
            .map(|rank| LocalTransport {
                rank: rank as Rank,
                num_ranks,
                shared: shared.clone(),
            })
            .collect()
    }
}

pub struct LocalTransport {
    rank: Rank,
    num_ranks: usize,
    shared: Arc<Shared>,
}

impl LocalTransport {
    fn lock(&self) -> Result<MutexGuard<'_, ClusterState>> {
        self.shared
            .state
            .lock()
            .map_err(|_: PoisonError<_>| CommError::Transport("mailbox state poisoned".to_string()))
    }

    fn poll_completions(state: &mut ClusterState, rank: Rank, requests: &[RequestId]) -> Vec<Completion> {
        let rank_state = &mut state.ranks[rank as usize];
        let mut completions = Vec::new();

        for &request in requests {
            if rank_state.drained_sends.remove(&request) {
                completions.push(Completion { request, data: None });
            }
        }

        let mut i = 0;
        while i < rank_state.posted.len() {
            let slot = &rank_state.posted[i];
            if slot.data.is_some() && requests.contains(&slot.request) {
                let slot = rank_state.posted.remove(i);
                completions.push(Completion {
                    request: slot.request,
                    data: slot.data,
                });
            } else {
                i += 1;
            }
        }

        completions
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.num_ranks
    }

    fn post_send(&mut self, dest: Rank, tag: Tag, packet: PacketBuf) -> Result<RequestId> {
        let mut state = self.lock()?;
        let request = RequestId(state.next_request);
        state.next_request += 1;

        let dest_state = state
            .ranks
            .get_mut(dest as usize)
            .ok_or_else(|| CommError::Transport(format!("destination rank {} out of range", dest)))?;

        let slot = dest_state.posted.iter_mut().find(|slot| {
            slot.data.is_none() && slot.tag == tag && slot.source.map_or(true, |s| s == self.rank)
        });
        match slot {
            Some(slot) => {
                if packet.len() > slot.capacity {
                    return Err(CommError::Transport(format!(
                        "packet of {} bytes exceeds the {} byte receive posted for tag {}",
                        packet.len(),
                        slot.capacity,
                        tag
                    )));
                }
                debug!(from = self.rank, to = dest, tag, bytes = packet.len(), "delivered into posted receive");
                slot.data = Some(packet);
            }
            None => {
                debug!(from = self.rank, to = dest, tag, bytes = packet.len(), "queued as unexpected");
                dest_state.unexpected.push_back(Delivery {
                    source: self.rank,
                    tag,
                    data: packet,
                });
            }
        }

        state.ranks[self.rank as usize].drained_sends.insert(request);
        self.shared.completed.notify_all();
        Ok(request)
    }

    fn post_recv(&mut self, tag: Tag, capacity: usize, source: Option<Rank>) -> Result<RequestId> {
        let mut state = self.lock()?;
        let request = RequestId(state.next_request);
        state.next_request += 1;

        let mut slot = PostedRecv {
            request,
            tag,
            source,
            capacity,
            data: None,
        };

        let rank_state = &mut state.ranks[self.rank as usize];
        let mut i = 0;
        while i < rank_state.unexpected.len() {
            let matches = {
                let delivery = &rank_state.unexpected[i];
                delivery.tag == tag && source.map_or(true, |s| s == delivery.source)
            };
            if !matches {
                i += 1;
                continue;
            }

            let delivery = rank_state
                .unexpected
                .remove(i)
                .ok_or_else(|| CommError::Transport("unexpected-queue index vanished".to_string()))?;
            if delivery.data.len() > capacity {
                warn!(
                    tag,
                    source = delivery.source,
                    bytes = delivery.data.len(),
                    capacity,
                    "dropping queued packet larger than the posted receive"
                );
                continue;
            }

            slot.data = Some(delivery.data);
            break;
        }

        let matched = slot.data.is_some();
        rank_state.posted.push(slot);
        if matched {
            self.shared.completed.notify_all();
        }
        Ok(request)
    }

    fn test_some(&mut self, requests: &[RequestId]) -> Result<Vec<Completion>> {
        let mut state = self.lock()?;
        Ok(Self::poll_completions(&mut state, self.rank, requests))
    }

    fn wait_some(&mut self, requests: &[RequestId]) -> Result<Vec<Completion>> {
        let mut state = self.lock()?;
        loop {
            let completions = Self::poll_completions(&mut state, self.rank, requests);
            if !completions.is_empty() || requests.is_empty() {
                return Ok(completions);
            }
            state = self
                .shared
                .completed
                .wait(state)
                .map_err(|_| CommError::Transport("mailbox state poisoned".to_string()))?;
        }
    }

    fn cancel(&mut self, request: RequestId) -> Result<()> {
        let mut state = self.lock()?;
        let rank_state = &mut state.ranks[self.rank as usize];
        match rank_state.posted.iter().position(|slot| slot.request == request) {
            Some(i) => {
                // a packet already delivered into the slot is dropped with it
                rank_state.posted.remove(i);
            }
            None => {
                debug!(?request, "cancel for a request that is no longer posted");
            }
        }
        Ok(())
    }
}
