//! Event types for routing
//!
//! This module defines the type tag used for filtering and the event that is
//! published to muxers.

use bytes::Bytes;

/// Runtime type tag of an event
///
/// The upper 16 bits hold the category (the emitting subsystem), the lower 16
/// bits the element inside that category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventType(pub u32);

impl EventType {
    /// Build a type tag from its category and element
    pub const fn new(category: u16, element: u16) -> Self {
        Self(((category as u32) << 16) | element as u32)
    }

    /// Category part of the tag
    pub const fn category(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Element part of the tag
    pub const fn element(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    /// Raw tag value
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for EventType {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A unit of monitoring data routed through the broker
///
/// Immutable once built and cheap to clone: the payload is a `Bytes`, so the
/// publisher, every muxer holding the event and the queue file writer share
/// one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_type: EventType,
    source_id: u32,
    destination_id: u32,
    data: Bytes,
}

impl Event {
    /// Create an event of the given type carrying `data`
    pub fn new(event_type: impl Into<EventType>, data: impl Into<Bytes>) -> Self {
        Self {
            event_type: event_type.into(),
            source_id: 0,
            destination_id: 0,
            data: data.into(),
        }
    }

    /// Set the id of the poller that produced this event
    #[must_use]
    pub fn with_source(mut self, source_id: u32) -> Self {
        self.source_id = source_id;
        self
    }

    /// Set the id of the peer this event is addressed to
    #[must_use]
    pub fn with_destination(mut self, destination_id: u32) -> Self {
        self.destination_id = destination_id;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Raw type tag, shorthand for `event_type().value()`
    pub fn type_id(&self) -> u32 {
        self.event_type.0
    }

    pub fn source_id(&self) -> u32 {
        self.source_id
    }

    pub fn destination_id(&self) -> u32 {
        self.destination_id
    }

    /// Serialized payload (opaque to the core)
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "event {} from {} to {} ({} bytes)",
            self.event_type,
            self.source_id,
            self.destination_id,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_parts() {
        let t = EventType::new(1, 24);
        assert_eq!(t.value(), 0x10018);
        assert_eq!(t.category(), 1);
        assert_eq!(t.element(), 24);
        assert_eq!(t.to_string(), "0x10018");
    }

    #[test]
    fn test_event_shares_payload() {
        let e = Event::new(0x10001, Bytes::from_static(b"host up")).with_source(3);
        let clone = e.clone();

        assert_eq!(clone.source_id(), 3);
        assert_eq!(clone.type_id(), 0x10001);
        // Cloning only bumps the reference count of the payload
        assert_eq!(e.data().as_ptr(), clone.data().as_ptr());
    }
}
