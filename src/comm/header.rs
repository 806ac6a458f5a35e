use bytes::{Buf, BufMut};

use crate::comm::error::Result;
use crate::comm::{Rank, Tag};

/// The self-describing header written at the front of every packet.
///
/// `(rank, id)` identifies the logical message a packet belongs to: `id` is a counter
///  that is monotonic per sender, so it is unique only in combination with the sender's
///  rank. `packet` is the zero-based index of this packet within the message's
///  `num_packets` fragments.
///
/// The encoding is explicit field-by-field big-endian; packets are only ever exchanged
///  between ranks of the same deployment.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct PacketHeader {
    pub tag: Tag,
    pub rank: Rank,
    pub id: u64,
    /// total number of packets composing the logical message, >= 1
    pub num_packets: u32,
    /// zero-based index of this packet within the message
    pub packet: u32,
    /// total size of this packet including the header
    pub packet_sz: u32,
    /// bytes of user payload carried by this packet
    pub data_sz: u32,
}

impl PacketHeader {
    pub const SERIALIZED_SIZE: usize = 5 * size_of::<u32>() + size_of::<u64>() + size_of::<Tag>();

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.tag);
        buf.put_u32(self.rank);
        buf.put_u64(self.id);
        buf.put_u32(self.num_packets);
        buf.put_u32(self.packet);
        buf.put_u32(self.packet_sz);
        buf.put_u32(self.data_sz);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<PacketHeader> {
        let tag = buf.try_get_u32()?;
        let rank = buf.try_get_u32()?;
        let id = buf.try_get_u64()?;
        let num_packets = buf.try_get_u32()?;
        let packet = buf.try_get_u32()?;
        let packet_sz = buf.try_get_u32()?;
        let data_sz = buf.try_get_u32()?;

        Ok(PacketHeader {
            tag,
            rank,
            id,
            num_packets,
            packet,
            packet_sz,
            data_sz,
        })
    }
}


#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::single_packet(PacketHeader { tag: 1, rank: 0, id: 0, num_packets: 1, packet: 0, packet_sz: 82, data_sz: 50 })]
    #[case::middle_packet(PacketHeader { tag: 7, rank: 3, id: 12, num_packets: 4, packet: 2, packet_sz: 132, data_sz: 100 })]
    #[case::empty_tail(PacketHeader { tag: 2, rank: 1, id: u64::MAX, num_packets: 3, packet: 2, packet_sz: 32, data_sz: 0 })]
    fn test_ser_deser_round_trip(#[case] header: PacketHeader) {
        let mut buf = BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_SIZE);

        let mut slice = &buf[..];
        let deser = PacketHeader::try_deser(&mut slice).unwrap();
        assert_eq!(deser, header);
        assert!(slice.is_empty());
    }

    #[test]
    fn test_deser_remainder_untouched() {
        let mut buf = BytesMut::new();
        PacketHeader { tag: 1, rank: 2, id: 3, num_packets: 1, packet: 0, packet_sz: 35, data_sz: 3 }.ser(&mut buf);
        buf.extend_from_slice(b"abc");

        let mut slice = &buf[..];
        let header = PacketHeader::try_deser(&mut slice).unwrap();
        assert_eq!(header.data_sz, 3);
        assert_eq!(slice, b"abc");
    }

    #[rstest]
    #[case::empty(b"" as &[u8])]
    #[case::partial(b"\0\0\0\x01\0\0" as &[u8])]
    #[case::one_byte_short(&[0u8; PacketHeader::SERIALIZED_SIZE - 1])]
    fn test_deser_too_short(#[case] data: &[u8]) {
        let mut slice = data;
        assert!(PacketHeader::try_deser(&mut slice).is_err());
    }
}
