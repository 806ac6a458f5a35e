use std::fmt::{Debug, Formatter};

use bytes::BufMut;

use crate::comm::error::{CommError, Result};
use crate::comm::header::PacketHeader;

/// One packet as it travels through the transport: a [PacketHeader] followed by the
///  run of user payload bytes it carries, in a single allocation whose size is fixed
///  when the packet is assembled.
///
/// A packet is written exactly once, by [PacketBuf::assemble] on the sending side;
///  after that it only moves between owners (send pool, transport, reassembly table)
///  and is read back through [PacketBuf::try_header] and [PacketBuf::try_payload].
pub struct PacketBuf {
    data: Box<[u8]>,
}

impl PacketBuf {
    /// assembles an outgoing packet from its header and the payload slice it carries
    pub fn assemble(header: &PacketHeader, payload: &[u8]) -> PacketBuf {
        debug_assert_eq!(header.data_sz as usize, payload.len());

        let mut data = vec![0u8; PacketHeader::SERIALIZED_SIZE + payload.len()].into_boxed_slice();
        let mut cursor = &mut data[..];
        header.ser(&mut cursor);
        cursor.put_slice(payload);

        PacketBuf { data }
    }

    /// This is a convenience function for test code: it wraps raw bytes without going
    ///  through the fragmenter, e.g. to exercise transports with opaque data or to
    ///  craft malformed packets.
    #[cfg(test)]
    pub fn from_bytes(data: &[u8]) -> PacketBuf {
        PacketBuf {
            data: data.to_vec().into_boxed_slice(),
        }
    }

    /// total packet size, header included
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// the header at the front of the packet
    pub fn try_header(&self) -> Result<PacketHeader> {
        let mut slice = &self.data[..];
        PacketHeader::try_deser(&mut slice)
    }

    /// The payload region announced by `header`. Headers announcing more data than the
    ///  packet actually holds are rejected rather than read out of bounds.
    pub fn try_payload(&self, header: &PacketHeader) -> Result<&[u8]> {
        let start = PacketHeader::SERIALIZED_SIZE;
        let end = start + header.data_sz as usize;
        self.data.get(start..end).ok_or(CommError::TruncatedRead {
            needed: end,
            available: self.data.len(),
        })
    }
}

impl Debug for PacketBuf {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PacketBuf{{len:{}}}", self.data.len())
    }
}
