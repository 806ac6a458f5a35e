//! Tagged, fragmented point-to-point messaging on top of a rank-based
//!  transport with pre-posted receive buffers.
//!
//! The [messenger::Messenger] owns a pool of receive buffers per registered
//!  tag, splits arbitrary-size payloads into fixed-capacity packets on send,
//!  and reassembles out-of-order packets on receive. [ray_messenger::RayMessenger]
//!  binds the two well-known channels of the renderer (control messages and
//!  ray batches) on top of it.

pub mod config;
pub mod error;
pub mod fragment;
pub mod header;
pub mod messenger;
pub mod packet;
pub mod ray_messenger;
pub mod transport;

/// logical channel identifier, matched by the transport between sends and posted receives
pub type Tag = u32;

/// process identity within the transport's communicator
pub type Rank = u32;
