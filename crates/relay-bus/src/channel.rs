//! Typed notification channels.

use crate::error::BusError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use std::marker::PhantomData;

/// Maximum length of a channel name before the store prefix is applied.
pub const MAX_CHANNEL_NAME_LEN: usize = 48;

/// Validated channel name: lowercase ASCII letters, digits and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(name: impl Into<String>) -> Result<Self, BusError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_CHANNEL_NAME_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_');
        if valid {
            Ok(Self(name))
        } else {
            Err(BusError::InvalidChannel(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A channel carrying payloads of type `P`.
///
/// Binding the payload type to the channel keeps `notify` and `listen` on
/// the same channel agreeing about the wire shape.
pub struct Channel<P> {
    name: ChannelName,
    _payload: PhantomData<fn() -> P>,
}

impl<P> Channel<P> {
    pub fn new(name: ChannelName) -> Self {
        Self {
            name,
            _payload: PhantomData,
        }
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }
}

impl<P: Serialize> Channel<P> {
    pub(crate) fn encode(&self, payload: &P) -> Result<String, BusError> {
        serde_json::to_string(payload).map_err(|e| BusError::Payload {
            channel: self.name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<P: DeserializeOwned> Channel<P> {
    pub(crate) fn decode(name: &ChannelName, payload: &serde_json::Value) -> Result<P, BusError> {
        serde_json::from_value(payload.clone()).map_err(|e| BusError::Payload {
            channel: name.to_string(),
            reason: e.to_string(),
        })
    }
}

impl<P> Clone for Channel<P> {
    fn clone(&self) -> Self {
        Self::new(self.name.clone())
    }
}

impl<P> fmt::Debug for Channel<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Channel").field(&self.name).finish()
    }
}
