//! Reply handles: a thin `(Channel, operation id)` pair that lets a
//! server answer a request without learning the requester's channel
//! identity beyond what it was handed.

use crate::channel::Channel;

#[derive(Clone)]
pub struct Reply {
    channel: Channel,
    id: usize,
}

impl Reply {
    pub fn new(channel: Channel, id: usize) -> Self {
        Self { channel, id }
    }

    /// Sends `value` back to the originating channel under this
    /// reply's id.
    pub fn send<T: std::any::Any + Send>(&self, value: T) -> bool {
        self.channel.send(self.id, value)
    }

    /// Sends back an id-only message (no payload).
    pub fn send_empty(&self) -> bool {
        self.channel.send_id(self.id)
    }

    pub fn id(&self) -> usize {
        self.id
    }
}
