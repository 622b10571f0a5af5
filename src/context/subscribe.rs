//! Server change-notification subscriptions.
//!
//! After [`Context::subscribe`](super::Context::subscribe) declares an
//! interest mask, the daemon pushes `SUBSCRIBE_EVENT` packets whenever a
//! matching entity appears, changes, or goes away. The event payload
//! packs a [`Facility`] and an [`EventOperation`] into one `u32`.

use bitflags::bitflags;

/// Which facility value occupies the low bits of an event.
pub const FACILITY_MASK: u32 = 0x0F;
/// Which operation value occupies bits 4–5 of an event.
pub const OPERATION_MASK: u32 = 0x30;

const OPERATION_SHIFT: u32 = 4;

/// The kind of server-side entity an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Facility {
    Sink = 0,
    Source = 1,
    SinkInput = 2,
    SourceOutput = 3,
    Module = 4,
    Client = 5,
    Server = 6,
    Card = 7,
}

impl Facility {
    pub fn from_wire(raw: u32) -> Option<Facility> {
        Some(match raw & FACILITY_MASK {
            0 => Facility::Sink,
            1 => Facility::Source,
            2 => Facility::SinkInput,
            3 => Facility::SourceOutput,
            4 => Facility::Module,
            5 => Facility::Client,
            6 => Facility::Server,
            7 => Facility::Card,
            _ => return None,
        })
    }

    /// The interest-mask bit covering this facility.
    pub fn to_interest_mask(self) -> InterestMaskSet {
        InterestMaskSet::from_bits_truncate(1 << (self as u32))
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EventOperation {
    New = 0,
    Changed = 1,
    Removed = 2,
}

impl EventOperation {
    pub fn from_wire(raw: u32) -> Option<EventOperation> {
        Some(match (raw & OPERATION_MASK) >> OPERATION_SHIFT {
            0 => EventOperation::New,
            1 => EventOperation::Changed,
            2 => EventOperation::Removed,
            _ => return None,
        })
    }
}

/// Packs an event's facility and operation for the wire. Used by the
/// test daemon and by servers; clients normally only decode.
pub fn pack_event(facility: Facility, operation: EventOperation) -> u32 {
    (facility as u32) | ((operation as u32) << OPERATION_SHIFT)
}

bitflags! {
    /// Facilities a client declares interest in via
    /// [`Context::subscribe`](super::Context::subscribe).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterestMaskSet: u32 {
        const SINK = 1 << 0;
        const SOURCE = 1 << 1;
        const SINK_INPUT = 1 << 2;
        const SOURCE_OUTPUT = 1 << 3;
        const MODULE = 1 << 4;
        const CLIENT = 1 << 5;
        const SERVER = 1 << 6;
        const CARD = 1 << 7;
        const ALL = 0xFF;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bits_round_trip() {
        let bits = pack_event(Facility::SourceOutput, EventOperation::Removed);
        assert_eq!(Facility::from_wire(bits), Some(Facility::SourceOutput));
        assert_eq!(
            EventOperation::from_wire(bits),
            Some(EventOperation::Removed)
        );
    }

    #[test]
    fn facility_maps_to_its_interest_bit() {
        assert_eq!(
            Facility::Card.to_interest_mask(),
            InterestMaskSet::CARD
        );
        assert!(InterestMaskSet::ALL.contains(Facility::Module.to_interest_mask()));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert_eq!(Facility::from_wire(0x0C), None);
        assert_eq!(EventOperation::from_wire(3 << 4), None);
    }
}
