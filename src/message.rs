//! Messages: an operation id paired with an optional [`Payload`].

use crate::payload::Payload;

/// An operation id plus an optional type-erased payload.
///
/// A default-constructed `Message` is the sentinel "no message" value
/// used internally by [`crate::channel::Channel`] to fill an out
/// parameter before a blocking receive completes; `Message::is_set`
/// distinguishes it from a real message carrying id `0`.
pub struct Message {
    id: Option<usize>,
    payload: Payload,
}

impl Message {
    /// The sentinel, unset message.
    pub fn none() -> Self {
        Self {
            id: None,
            payload: Payload::none(),
        }
    }

    /// A message with `id` and no payload.
    pub fn with_id(id: usize) -> Self {
        Self {
            id: Some(id),
            payload: Payload::none(),
        }
    }

    /// A message with `id` and a payload built from `value`.
    pub fn make<T: std::any::Any + Send>(id: usize, value: T) -> Self {
        Self {
            id: Some(id),
            payload: Payload::make(value),
        }
    }

    /// A message with `id` and an already-constructed payload.
    pub fn with_payload(id: usize, payload: Payload) -> Self {
        Self {
            id: Some(id),
            payload,
        }
    }

    /// `true` if this message was constructed with an id (i.e. is not
    /// the sentinel value).
    pub fn is_set(&self) -> bool {
        self.id.is_some()
    }

    /// The operation id. Panics on the sentinel message; callers
    /// should check [`Message::is_set`] first, which every channel
    /// operation in this crate does before handing a `Message` out.
    pub fn id(&self) -> usize {
        self.id.expect("Message::id called on an unset message")
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

impl Default for Message {
    fn default() -> Self {
        Self::none()
    }
}
