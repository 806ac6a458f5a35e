use rustc_hash::FxHashMap;
use tracing::debug;

use crate::comm::error::Result;
use crate::comm::header::PacketHeader;
use crate::comm::packet::PacketBuf;
use crate::comm::{Rank, Tag};
use crate::util::byte_stream::ByteStream;

/// Splits a payload into packets of at most `max_data_len` user bytes, each prefixed
///  with a [PacketHeader]. All packets share the same `(rank, id)` and `num_packets`.
///
/// The packet count is `1 + len / max_data_len` whenever the payload exceeds a single
///  packet. When the payload length is an exact multiple of `max_data_len` this emits a
///  final packet with `data_sz == 0`; receivers in the same deployment count on that
///  packet to complete the message, so the formula must not be "improved".
pub fn split_into_packets(
    payload: &ByteStream,
    tag: Tag,
    rank: Rank,
    id: u64,
    max_data_len: usize,
) -> Vec<PacketBuf> {
    let data = payload.as_slice();

    let mut num_packets = 1u32;
    if data.len() > max_data_len {
        num_packets += (data.len() / max_data_len) as u32;
    }

    let mut packets = Vec::with_capacity(num_packets as usize);
    let mut pos = 0usize;
    for packet in 0..num_packets {
        let data_sz = if packet == num_packets - 1 {
            data.len() - pos
        } else {
            max_data_len
        };

        let header = PacketHeader {
            tag,
            rank,
            id,
            num_packets,
            packet,
            packet_sz: (data_sz + PacketHeader::SERIALIZED_SIZE) as u32,
            data_sz: data_sz as u32,
        };

        packets.push(PacketBuf::assemble(&header, &data[pos..pos + data_sz]));
        pos += data_sz;
    }

    packets
}

/// Rebuilds logical messages from completed receive buffers.
///
/// Single-packet messages are yielded immediately. Packets of multi-packet messages are
///  parked per `(sender rank, message id)` until all of them have arrived, then sorted
///  by packet index and concatenated; arrival order is immaterial. Every buffer fed in
///  is either consumed here or owned by the partial-message table until its message
///  completes.
pub struct Reassembler {
    partial: FxHashMap<(Rank, u64), Vec<(PacketHeader, PacketBuf)>>,
}

impl Reassembler {
    pub fn new() -> Reassembler {
        Reassembler {
            partial: FxHashMap::default(),
        }
    }

    /// number of incomplete multi-packet messages currently parked
    pub fn partial_message_count(&self) -> usize {
        self.partial.len()
    }

    /// drops all parked packets, e.g. at shutdown
    pub fn clear(&mut self) {
        self.partial.clear();
    }

    pub fn on_packet(&mut self, packet: PacketBuf) -> Result<Option<(Tag, ByteStream)>> {
        let header = packet.try_header()?;

        if header.num_packets == 1 {
            let payload = ByteStream::from_slice(packet.try_payload(&header)?);
            return Ok(Some((header.tag, payload)));
        }

        // reject lying headers before the packet is parked
        packet.try_payload(&header)?;

        let key = (header.rank, header.id);
        let parked = self.partial.entry(key).or_default();
        parked.push((header, packet));

        if parked.len() < header.num_packets as usize {
            return Ok(None);
        }

        let mut parked = self.partial.remove(&key).expect("entry was just filled");
        parked.sort_by_key(|(h, _)| h.packet);

        let total: usize = parked.iter().map(|(h, _)| h.data_sz as usize).sum();
        let mut payload = ByteStream::with_capacity(total);
        for (h, packet) in &parked {
            payload.write_bytes(packet.try_payload(h)?);
        }

        debug!(
            sender = header.rank,
            id = header.id,
            packets = header.num_packets,
            bytes = total,
            "assembled multi-packet message"
        );
        Ok(Some((header.tag, payload)))
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Reassembler::new()
    }
}
