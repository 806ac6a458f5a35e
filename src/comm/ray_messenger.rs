use rustc_hash::FxHashMap;
use tracing::warn;

use crate::comm::config::RayCommConfig;
use crate::comm::error::Result;
use crate::comm::messenger::Messenger;
use crate::comm::transport::Transport;
use crate::comm::{Rank, Tag};
use crate::util::byte_stream::ByteStream;

pub const MESSAGE_TAG: Tag = 1;
pub const RAY_TAG: Tag = 2;

/// bytes reserved per ray when sizing the ray channel; generous relative to the
///  serialized record so a full burst always fits one packet
pub const RAY_SLOT_BYTES: usize = 256;
/// rays per posted receive, sized so a full burst fits a single packet
pub const RAYS_PER_RECV: usize = 639;

/// One unit of render work in flight between ranks.
#[derive(Debug, Clone, PartialEq)]
pub struct Ray {
    pub pixel_id: i32,
    pub depth: i32,
    pub origin: [f64; 3],
    pub dir: [f64; 3],
    pub t_min: f64,
    pub t_max: f64,
    pub color: [f32; 4],
    pub terminated: bool,
}

impl Ray {
    fn ser(&self, buf: &mut ByteStream) {
        buf.write_i32(self.pixel_id);
        buf.write_i32(self.depth);
        for v in self.origin {
            buf.write_f64(v);
        }
        for v in self.dir {
            buf.write_f64(v);
        }
        buf.write_f64(self.t_min);
        buf.write_f64(self.t_max);
        for v in self.color {
            buf.write_f32(v);
        }
        buf.write_u8(self.terminated as u8);
    }

    fn try_deser(buf: &mut ByteStream) -> Result<Ray> {
        let pixel_id = buf.try_read_i32()?;
        let depth = buf.try_read_i32()?;
        let mut origin = [0.0; 3];
        for v in &mut origin {
            *v = buf.try_read_f64()?;
        }
        let mut dir = [0.0; 3];
        for v in &mut dir {
            *v = buf.try_read_f64()?;
        }
        let t_min = buf.try_read_f64()?;
        let t_max = buf.try_read_f64()?;
        let mut color = [0.0; 4];
        for v in &mut color {
            *v = buf.try_read_f32()?;
        }
        let terminated = buf.try_read_u8()? != 0;

        Ok(Ray {
            pixel_id,
            depth,
            origin,
            dir,
            t_min,
            t_max,
            color,
            terminated,
        })
    }
}

/// A control message as received: the sender's rank and the message body.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MsgCommData {
    pub rank: Rank,
    pub message: Vec<i32>,
}

/// The typed messenger of the renderer: binds the control message channel and the ray
///  channel on top of the generic [Messenger] and owns their payload encodings.
///
/// Control messages may be sent to one's own rank; ray batches may not (a self-send of
///  rays is logged and ignored, the rays stay with the caller).
pub struct RayMessenger<T: Transport> {
    messenger: Messenger<T>,
}

impl<T: Transport> RayMessenger<T> {
    pub fn new(transport: T) -> RayMessenger<T> {
        RayMessenger {
            messenger: Messenger::new(transport),
        }
    }

    pub fn rank(&self) -> Rank {
        self.messenger.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.messenger.num_ranks()
    }

    /// Registers both channels and fills their receive pools. The control channel is
    ///  sized so a message of `max_msg_len` ints fits one packet; the ray channel so a
    ///  burst of [RAYS_PER_RECV] rays does.
    pub fn register_messages(&mut self, config: &RayCommConfig) -> Result<()> {
        let msg_size = size_of::<u64>() + size_of::<u32>() + config.max_msg_len * size_of::<i32>();
        self.messenger.register_tag(MESSAGE_TAG, config.num_msg_recvs, msg_size);
        self.messenger.register_tag(RAY_TAG, config.num_ray_recvs, RAY_SLOT_BYTES * RAYS_PER_RECV);
        self.messenger.initialize_buffers()
    }

    pub fn send_msg(&mut self, dest: Rank, msg: &[i32]) -> Result<()> {
        let mut buff = ByteStream::new();
        buff.write_u32(self.messenger.rank());
        buff.write_i32_vec(msg);
        self.messenger.send_data(dest, MESSAGE_TAG, buff)
    }

    /// sends `msg` to every peer except this rank
    pub fn send_all_msg(&mut self, msg: &[i32]) -> Result<()> {
        for peer in 0..self.messenger.num_ranks() as Rank {
            if peer != self.messenger.rank() {
                self.send_msg(peer, msg)?;
            }
        }
        Ok(())
    }

    /// non-blocking poll of the control message channel
    pub fn recv_msg(&mut self, msgs: &mut Vec<MsgCommData>) -> Result<bool> {
        self.recv_any(Some(msgs), None, false)
    }

    /// Sends a batch of rays to `dest` and clears `rays` on success. Empty batches are
    ///  not sent. Sending rays to one's own rank is a logged no-op.
    pub fn send_rays(&mut self, dest: Rank, rays: &mut Vec<Ray>) -> Result<()> {
        if dest == self.messenger.rank() {
            warn!(rank = dest, "ignoring attempt to send rays to own rank");
            return Ok(());
        }
        if rays.is_empty() {
            return Ok(());
        }

        let mut buff = ByteStream::new();
        buff.write_u32(self.messenger.rank());
        buff.write_u32(rays.len() as u32);
        for ray in rays.iter() {
            ray.ser(&mut buff);
        }

        self.messenger.send_data(dest, RAY_TAG, buff)?;
        rays.clear();
        Ok(())
    }

    /// sends each non-empty batch in the map to its destination rank
    pub fn send_ray_map(&mut self, ray_map: &mut FxHashMap<Rank, Vec<Ray>>) -> Result<()> {
        for (&dest, rays) in ray_map.iter_mut() {
            if !rays.is_empty() {
                self.send_rays(dest, rays)?;
            }
        }
        Ok(())
    }

    /// non-blocking poll of the ray channel
    pub fn recv_rays(&mut self, rays: &mut Vec<Ray>) -> Result<bool> {
        self.recv_any(None, Some(rays), false)
    }

    /// Receives whatever is pending on the channels for which an output was passed,
    ///  decoded into that output. Passing `None` for a channel leaves its payloads
    ///  posted for later calls. Returns whether anything was received.
    pub fn recv_any(
        &mut self,
        mut msgs: Option<&mut Vec<MsgCommData>>,
        mut rays: Option<&mut Vec<Ray>>,
        block_and_wait: bool,
    ) -> Result<bool> {
        let mut tags = Vec::new();
        if let Some(msgs) = msgs.as_deref_mut() {
            msgs.clear();
            tags.push(MESSAGE_TAG);
        }
        if let Some(rays) = rays.as_deref_mut() {
            rays.clear();
            tags.push(RAY_TAG);
        }
        if tags.is_empty() {
            return Ok(false);
        }

        let mut buffers = Vec::new();
        if !self.messenger.recv_data(&tags, &mut buffers, block_and_wait)? {
            return Ok(false);
        }

        for (tag, mut payload) in buffers {
            match tag {
                MESSAGE_TAG => {
                    let sender = payload.try_read_u32()?;
                    let message = payload.try_read_i32_vec()?;
                    if let Some(msgs) = msgs.as_deref_mut() {
                        msgs.push(MsgCommData { rank: sender, message });
                    }
                }
                RAY_TAG => {
                    let _sender = payload.try_read_u32()?;
                    let num = payload.try_read_u32()?;
                    if let Some(rays) = rays.as_deref_mut() {
                        for _ in 0..num {
                            rays.push(Ray::try_deser(&mut payload)?);
                        }
                    }
                }
                other => {
                    warn!(tag = other, "dropping payload for unexpected tag");
                }
            }
        }
        Ok(true)
    }

    /// reaps completed ray/message sends; must run periodically in the driver loop
    pub fn check_pending_send_requests(&mut self) {
        self.messenger.check_pending_send_requests();
    }

    /// cancels all posted receives of both channels, see
    ///  [Messenger::cleanup_requests]
    pub fn cleanup_requests(&mut self) {
        self.messenger.cleanup_requests(None);
    }

    pub fn pending_send_count(&self) -> usize {
        self.messenger.pending_send_count()
    }
}
