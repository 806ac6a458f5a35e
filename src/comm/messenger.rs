use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

use crate::comm::error::{CommError, Result};
use crate::comm::fragment::{split_into_packets, Reassembler};
use crate::comm::header::PacketHeader;
use crate::comm::transport::{RequestId, Transport};
use crate::comm::{Rank, Tag};
use crate::util::byte_stream::ByteStream;

/// pool key for pending operations; the request handle alone is unique, the tag rides
///  along so pools can be filtered per channel
type RequestKey = (RequestId, Tag);

struct TagInfo {
    /// receive buffers kept pre-posted for this tag
    num_recvs: usize,
    /// per-packet user-data capacity; the posted buffer adds the header on top
    max_data_len: usize,
}

/// The messaging core: owns the tag registry, the posted-receive pool, the in-flight
///  send pool and the reassembly state, on top of a [Transport].
///
/// One instance per driver thread; nothing here is thread-safe, parallelism lives
///  across ranks. Progress is driven by the caller polling [Messenger::recv_data] and
///  [Messenger::check_pending_send_requests].
///
/// Shutdown is `cleanup_requests(None)` followed by `check_pending_send_requests` until
///  [Messenger::pending_send_count] drains to zero.
pub struct Messenger<T: Transport> {
    transport: T,
    tag_info: FxHashMap<Tag, TagInfo>,
    /// posted receives; at steady state this holds `num_recvs` entries per registered tag.
    ///  The buffers themselves are pinned inside the transport until completion.
    recv_pool: FxHashMap<RequestKey, usize>,
    /// submitted packet sends, keyed until the transport reports them drained
    send_pool: FxHashMap<RequestKey, usize>,
    reassembler: Reassembler,
    /// bumped once per outgoing logical message. Scoped to this instance: message ids
    ///  are only unique together with the sending rank, and only as long as each rank
    ///  sends through a single messenger per tag space.
    next_message_id: u64,
}

impl<T: Transport> Messenger<T> {
    pub fn new(transport: T) -> Messenger<T> {
        Messenger {
            transport,
            tag_info: FxHashMap::default(),
            recv_pool: FxHashMap::default(),
            send_pool: FxHashMap::default(),
            reassembler: Reassembler::new(),
            next_message_id: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.transport.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.transport.num_ranks()
    }

    /// Declares a channel: `num_recvs` pre-posted receives of `max_data_len` user bytes
    ///  each. Re-registering a tag overwrites the previous registration but does not
    ///  resize buffers that are already posted.
    pub fn register_tag(&mut self, tag: Tag, num_recvs: usize, max_data_len: usize) {
        if self.tag_info.insert(tag, TagInfo { num_recvs, max_data_len }).is_some() {
            warn!(tag, "tag already registered, overwriting");
        }
    }

    /// Fills the posted-receive pool: for every registered tag, posts its configured
    ///  number of any-source receives. Called once after all tags are registered.
    pub fn initialize_buffers(&mut self) -> Result<()> {
        let tags: Vec<(Tag, usize)> = self
            .tag_info
            .iter()
            .map(|(&tag, info)| (tag, info.num_recvs))
            .collect();

        for (tag, num_recvs) in tags {
            for _ in 0..num_recvs {
                self.post_recv(tag)?;
            }
        }
        Ok(())
    }

    /// posts one fresh receive for `tag`; transport failures are logged, the slot is lost
    fn post_recv(&mut self, tag: Tag) -> Result<()> {
        let info = self.tag_info.get(&tag).ok_or(CommError::UnregisteredTag(tag))?;
        let capacity = info.max_data_len + PacketHeader::SERIALIZED_SIZE;

        match self.transport.post_recv(tag, capacity, None) {
            Ok(request) => {
                self.recv_pool.insert((request, tag), capacity);
            }
            Err(e) => {
                error!(tag, "failed to post receive: {}", e);
            }
        }
        Ok(())
    }

    /// Sends a payload to `dest` on `tag`, consuming the payload. The payload is split
    ///  into packets which are submitted as individual non-blocking sends; their buffers
    ///  are reaped by [Messenger::check_pending_send_requests]. There is no send
    ///  completion event visible to callers: fire and forget.
    pub fn send_data(&mut self, dest: Rank, tag: Tag, payload: ByteStream) -> Result<()> {
        let info = self.tag_info.get(&tag).ok_or(CommError::UnregisteredTag(tag))?;

        let id = self.next_message_id;
        self.next_message_id += 1;

        let packets = split_into_packets(&payload, tag, self.transport.rank(), id, info.max_data_len);
        debug!(dest, tag, id, bytes = payload.len(), packets = packets.len(), "sending payload");
        drop(payload);

        for packet in packets {
            let bytes = packet.len();
            match self.transport.post_send(dest, tag, packet) {
                Ok(request) => {
                    self.send_pool.insert((request, tag), bytes);
                }
                Err(e) => {
                    error!(dest, tag, "failed to submit packet send: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Drains completed receives whose tag is in `tags` and reassembles them into
    ///  payloads, appended to `out` as `(tag, payload)`. With `block_and_wait` the call
    ///  suspends until at least one matching receive completes; without it, it polls.
    ///  Each drained slot is re-posted so the pool stays at its configured size.
    ///
    /// Returns whether any complete payloads were produced. `false` does not mean
    ///  nothing happened: fragments of larger messages may have been consumed. With no
    ///  matching receives posted at all, returns `false` immediately even when blocking.
    pub fn recv_data(
        &mut self,
        tags: &[Tag],
        out: &mut Vec<(Tag, ByteStream)>,
        block_and_wait: bool,
    ) -> Result<bool> {
        out.clear();

        let matching: FxHashMap<RequestId, Tag> = self
            .recv_pool
            .keys()
            .filter(|(_, tag)| tags.contains(tag))
            .map(|&(request, tag)| (request, tag))
            .collect();
        if matching.is_empty() {
            return Ok(false);
        }
        let requests: Vec<RequestId> = matching.keys().copied().collect();

        let completions = if block_and_wait {
            self.transport.wait_some(&requests)
        } else {
            self.transport.test_some(&requests)
        };
        let completions = match completions {
            Ok(completions) => completions,
            Err(e) => {
                error!("transport failure while draining receives: {}", e);
                return Ok(false);
            }
        };

        let mut drained_tags = Vec::with_capacity(completions.len());
        for completion in completions {
            let tag = *matching
                .get(&completion.request)
                .ok_or(CommError::UnknownRequest(completion.request))?;
            self.recv_pool
                .remove(&(completion.request, tag))
                .ok_or(CommError::UnknownRequest(completion.request))?;
            let data = completion
                .data
                .ok_or(CommError::UnknownRequest(completion.request))?;

            if let Some(assembled) = self.reassembler.on_packet(data)? {
                out.push(assembled);
            }
            drained_tags.push(tag);
        }

        for tag in drained_tags {
            self.post_recv(tag)?;
        }

        Ok(!out.is_empty())
    }

    /// single-tag convenience wrapper around [Messenger::recv_data]
    pub fn recv_data_for_tag(
        &mut self,
        tag: Tag,
        out: &mut Vec<ByteStream>,
        block_and_wait: bool,
    ) -> Result<bool> {
        let mut tagged = Vec::new();
        let any = self.recv_data(&[tag], &mut tagged, block_and_wait)?;
        out.clear();
        out.extend(tagged.into_iter().map(|(_, payload)| payload));
        Ok(any)
    }

    /// Reaps completed sends, releasing their packet buffers. Must be called
    ///  periodically by the driver; in-flight send memory is bounded only by how often
    ///  this runs.
    pub fn check_pending_send_requests(&mut self) {
        if self.send_pool.is_empty() {
            return;
        }

        let keys: Vec<RequestKey> = self.send_pool.keys().copied().collect();
        let requests: Vec<RequestId> = keys.iter().map(|&(request, _)| request).collect();

        let completions = match self.transport.test_some(&requests) {
            Ok(completions) => completions,
            Err(e) => {
                error!("transport failure while testing pending sends: {}", e);
                return;
            }
        };

        for completion in completions {
            if let Some(&(request, tag)) = keys.iter().find(|&&(request, _)| request == completion.request) {
                if let Some(bytes) = self.send_pool.remove(&(request, tag)) {
                    debug!(tag, bytes, "send drained");
                }
            }
        }
    }

    /// Cancels and discards posted receives for `tag`, or for all tags with `None`.
    ///  A full cleanup also drops any partially reassembled messages. Called before
    ///  shutdown and to tear down individual channels.
    pub fn cleanup_requests(&mut self, tag: Option<Tag>) {
        let keys: Vec<RequestKey> = self
            .recv_pool
            .keys()
            .filter(|&&(_, t)| tag.map_or(true, |wanted| wanted == t))
            .copied()
            .collect();

        debug!(?tag, count = keys.len(), "cancelling posted receives");
        for (request, t) in keys {
            if let Err(e) = self.transport.cancel(request) {
                error!(tag = t, "failed to cancel posted receive: {}", e);
            }
            self.recv_pool.remove(&(request, t));
        }

        if tag.is_none() {
            self.reassembler.clear();
        }
    }

    /// packet sends submitted but not yet reaped
    pub fn pending_send_count(&self) -> usize {
        self.send_pool.len()
    }

    /// receives currently posted for `tag`
    pub fn posted_recv_count(&self, tag: Tag) -> usize {
        self.recv_pool.keys().filter(|&&(_, t)| t == tag).count()
    }

    /// incomplete multi-packet messages currently parked in the reassembler
    pub fn partial_message_count(&self) -> usize {
        self.reassembler.partial_message_count()
    }
}


#[cfg(test)]
mod test {
    use std::sync::Barrier;

    use crate::comm::transport::local::{LocalCluster, LocalTransport};

    use super::*;

    const TAG: Tag = 7;

    fn messenger_pair() -> (Messenger<LocalTransport>, Messenger<LocalTransport>) {
        let mut cluster = LocalCluster::new(2);
        let t1 = cluster.pop().unwrap();
        let t0 = cluster.pop().unwrap();
        (Messenger::new(t0), Messenger::new(t1))
    }

    fn register(messenger: &mut Messenger<LocalTransport>, num_recvs: usize, max_data_len: usize) {
        messenger.register_tag(TAG, num_recvs, max_data_len);
        messenger.initialize_buffers().unwrap();
    }

    fn payload_of_len(len: usize) -> ByteStream {
        let data: Vec<u8> = (0..len).map(|i| (i % 249) as u8).collect();
        ByteStream::from_slice(&data)
    }

    fn drain_sends(messenger: &mut Messenger<LocalTransport>) {
        while messenger.pending_send_count() > 0 {
            messenger.check_pending_send_requests();
        }
    }

    #[test]
    fn test_single_packet_round_trip() {
        let (mut sender, mut receiver) = messenger_pair();
        register(&mut sender, 4, 100);
        register(&mut receiver, 4, 100);

        let payload = payload_of_len(50);
        let expected = payload.as_slice().to_vec();
        sender.send_data(1, TAG, payload).unwrap();
        drain_sends(&mut sender);

        let mut out = Vec::new();
        assert!(receiver.recv_data(&[TAG], &mut out, true).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, TAG);
        assert_eq!(out[0].1.as_slice(), expected);

        // the pool is restored to its configured size
        assert_eq!(receiver.posted_recv_count(TAG), 4);
    }

    #[test]
    fn test_fragmented_round_trip() {
        let (mut sender, mut receiver) = messenger_pair();
        register(&mut sender, 4, 100);
        register(&mut receiver, 4, 100);

        let payload = payload_of_len(350);
        let expected = payload.as_slice().to_vec();
        sender.send_data(1, TAG, payload).unwrap();
        drain_sends(&mut sender);

        let mut out = Vec::new();
        let mut assembled = Vec::new();
        while assembled.is_empty() {
            receiver.recv_data(&[TAG], &mut out, true).unwrap();
            assembled.extend(out.drain(..));
        }
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0].1.as_slice(), expected);
        assert_eq!(receiver.posted_recv_count(TAG), 4);
        assert_eq!(receiver.partial_message_count(), 0);
    }

    #[test]
    fn test_back_to_back_messages_stay_distinct() {
        let (mut sender, mut receiver) = messenger_pair();
        register(&mut sender, 8, 100);
        register(&mut receiver, 8, 100);

        let p1 = payload_of_len(250);
        let p2 = ByteStream::from_slice(&vec![0xABu8; 180]);
        let expected1 = p1.as_slice().to_vec();
        let expected2 = p2.as_slice().to_vec();

        sender.send_data(1, TAG, p1).unwrap();
        sender.send_data(1, TAG, p2).unwrap();
        drain_sends(&mut sender);

        let mut out = Vec::new();
        let mut assembled = Vec::new();
        while assembled.len() < 2 {
            receiver.recv_data(&[TAG], &mut out, true).unwrap();
            assembled.extend(out.drain(..));
            assert_eq!(receiver.posted_recv_count(TAG), 8);
        }

        let bytes: Vec<Vec<u8>> = assembled.into_iter().map(|(_, s)| s.as_slice().to_vec()).collect();
        assert!(bytes.contains(&expected1));
        assert!(bytes.contains(&expected2));
    }

    #[test]
    fn test_tag_routing() {
        const OTHER: Tag = 8;
        let (mut sender, mut receiver) = messenger_pair();
        for messenger in [&mut sender, &mut receiver] {
            messenger.register_tag(TAG, 2, 100);
            messenger.register_tag(OTHER, 2, 100);
            messenger.initialize_buffers().unwrap();
        }

        sender.send_data(1, TAG, payload_of_len(10)).unwrap();
        sender.send_data(1, OTHER, payload_of_len(20)).unwrap();
        drain_sends(&mut sender);

        let mut out = Vec::new();
        assert!(receiver.recv_data(&[TAG], &mut out, true).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, TAG);

        assert!(receiver.recv_data(&[OTHER], &mut out, true).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, OTHER);
    }

    #[test]
    fn test_recv_nonblocking_with_nothing_arrived() {
        let (_sender, mut receiver) = messenger_pair();
        register(&mut receiver, 2, 100);

        let mut out = Vec::new();
        assert!(!receiver.recv_data(&[TAG], &mut out, false).unwrap());
        assert!(out.is_empty());
        assert_eq!(receiver.posted_recv_count(TAG), 2);
    }

    #[test]
    fn test_recv_blocking_without_posted_receives_returns_immediately() {
        let (_sender, mut receiver) = messenger_pair();

        let mut out = Vec::new();
        assert!(!receiver.recv_data(&[TAG], &mut out, true).unwrap());
    }

    #[test]
    fn test_send_on_unregistered_tag() {
        let (mut sender, _receiver) = messenger_pair();
        let result = sender.send_data(1, 99, payload_of_len(5));
        assert!(matches!(result, Err(CommError::UnregisteredTag(99))));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let (mut sender, _receiver) = messenger_pair();
        sender.register_tag(TAG, 2, 100);
        sender.register_tag(TAG, 2, 200);
        sender.initialize_buffers().unwrap();

        // the later registration wins
        sender.send_data(1, TAG, payload_of_len(150)).unwrap();
        assert_eq!(sender.pending_send_count(), 1);
    }

    #[test]
    fn test_cleanup_empties_pool_with_data_in_flight() {
        let (mut sender, mut receiver) = messenger_pair();
        register(&mut sender, 4, 100);
        register(&mut receiver, 4, 100);

        sender.send_data(1, TAG, payload_of_len(300)).unwrap();
        drain_sends(&mut sender);

        // receiver never polls; shutdown must still be clean
        receiver.cleanup_requests(None);
        assert_eq!(receiver.posted_recv_count(TAG), 0);
        assert_eq!(receiver.partial_message_count(), 0);

        let mut out = Vec::new();
        assert!(!receiver.recv_data(&[TAG], &mut out, true).unwrap());
    }

    #[test]
    fn test_cleanup_single_tag() {
        const OTHER: Tag = 8;
        let (mut messenger, _other) = messenger_pair();
        messenger.register_tag(TAG, 2, 100);
        messenger.register_tag(OTHER, 3, 100);
        messenger.initialize_buffers().unwrap();

        messenger.cleanup_requests(Some(TAG));
        assert_eq!(messenger.posted_recv_count(TAG), 0);
        assert_eq!(messenger.posted_recv_count(OTHER), 3);
    }

    #[test]
    fn test_send_pool_drains() {
        let (mut sender, mut _receiver) = messenger_pair();
        register(&mut sender, 2, 100);
        register(&mut _receiver, 2, 100);

        sender.send_data(1, TAG, payload_of_len(350)).unwrap();
        assert_eq!(sender.pending_send_count(), 4);

        drain_sends(&mut sender);
        assert_eq!(sender.pending_send_count(), 0);
    }

    #[test]
    fn test_concurrent_ranks_with_blocking_recv() {
        let mut cluster = LocalCluster::new(2);
        let t1 = cluster.pop().unwrap();
        let t0 = cluster.pop().unwrap();
        let barrier = Barrier::new(2);

        let payload: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();
        let expected = payload.clone();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                let mut messenger = Messenger::new(t0);
                register(&mut messenger, 4, 512);
                barrier.wait();

                messenger.send_data(1, TAG, ByteStream::from_slice(&payload)).unwrap();
                drain_sends(&mut messenger);
                messenger.cleanup_requests(None);
            });

            scope.spawn(|| {
                let mut messenger = Messenger::new(t1);
                register(&mut messenger, 4, 512);
                barrier.wait();

                let mut out = Vec::new();
                let mut assembled = Vec::new();
                while assembled.is_empty() {
                    messenger.recv_data(&[TAG], &mut out, true).unwrap();
                    assembled.extend(out.drain(..));
                    assert_eq!(messenger.posted_recv_count(TAG), 4);
                }
                assert_eq!(assembled.len(), 1);
                assert_eq!(assembled[0].1.as_slice(), expected);

                messenger.cleanup_requests(None);
                assert_eq!(messenger.posted_recv_count(TAG), 0);
            });
        });
    }

    #[test]
    fn test_recv_data_for_tag_wrapper() {
        let (mut sender, mut receiver) = messenger_pair();
        register(&mut sender, 2, 100);
        register(&mut receiver, 2, 100);

        sender.send_data(1, TAG, payload_of_len(30)).unwrap();

        let mut out = Vec::new();
        assert!(receiver.recv_data_for_tag(TAG, &mut out, true).unwrap());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 30);
    }
}
