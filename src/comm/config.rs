/// Sizing of the two well-known channels registered by
///  [crate::comm::ray_messenger::RayMessenger::register_messages].
#[derive(Debug, Clone)]
pub struct RayCommConfig {
    /// longest control message body, in i32 elements; longer messages still work but
    ///  are split into multiple packets
    pub max_msg_len: usize,
    /// receive buffers kept pre-posted on the control message channel
    pub num_msg_recvs: usize,
    /// receive buffers kept pre-posted on the ray channel
    pub num_ray_recvs: usize,
}

impl RayCommConfig {
    pub fn new() -> RayCommConfig {
        RayCommConfig {
            max_msg_len: 64,
            num_msg_recvs: 64,
            num_ray_recvs: 64,
        }
    }
}

impl Default for RayCommConfig {
    fn default() -> Self {
        RayCommConfig::new()
    }
}
