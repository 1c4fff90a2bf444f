//! MIDI event model and the non-blocking event queue which feeds the audio thread.

use crossbeam_queue::ArrayQueue;

// -------------------------------------------------------------------------------------------------

/// A single, immutable MIDI event.
///
/// `channel` is the MIDI channel in `0..16`. Events which can occur mid-block carry a
/// `sample_offset` locating them within the processing block they were scheduled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEvent {
    NoteOn {
        note: u8,
        velocity: u8,
        channel: u8,
        sample_offset: u32,
    },
    NoteOff {
        note: u8,
        channel: u8,
        sample_offset: u32,
    },
    ControlChange {
        controller: u8,
        value: u8,
        channel: u8,
    },
    /// Pitch bend with a signed 14 bit value in `-8192..=8191`.
    PitchBend {
        value: i16,
        channel: u8,
    },
    Aftertouch {
        note: u8,
        pressure: u8,
        channel: u8,
        sample_offset: u32,
    },
    ChannelAftertouch {
        pressure: u8,
        channel: u8,
        sample_offset: u32,
    },
}

impl MidiEvent {
    /// The MIDI channel this event addresses.
    pub fn channel(&self) -> u8 {
        match self {
            Self::NoteOn { channel, .. }
            | Self::NoteOff { channel, .. }
            | Self::ControlChange { channel, .. }
            | Self::PitchBend { channel, .. }
            | Self::Aftertouch { channel, .. }
            | Self::ChannelAftertouch { channel, .. } => *channel,
        }
    }
}

// -------------------------------------------------------------------------------------------------

/// Bounded multi-producer queue for [`MidiEvent`]s.
///
/// Producers (host callbacks, a MIDI input thread, UIs) push without ever blocking; when the
/// queue is full the event is dropped and the push reports failure. The audio thread drains all
/// pending events once per block with [`Self::process_events`] before synthesizing.
pub struct MidiEventQueue {
    queue: ArrayQueue<MidiEvent>,
}

impl MidiEventQueue {
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a queue with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Push an event without blocking. Returns false when the queue is full and the event
    /// got dropped.
    #[must_use]
    pub fn push(&self, event: MidiEvent) -> bool {
        self.queue.push(event).is_ok()
    }

    /// Pop a single pending event, if any.
    pub fn pop(&self) -> Option<MidiEvent> {
        self.queue.pop()
    }

    /// Drain and handle all currently pending events in submission order.
    pub fn process_events(&self, mut handler: impl FnMut(MidiEvent)) {
        while let Some(event) = self.queue.pop() {
            handler(event);
        }
    }

    /// Drop all pending events.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for MidiEventQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

// -------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_order() {
        let queue = MidiEventQueue::new(8);
        let on = MidiEvent::NoteOn {
            note: 60,
            velocity: 100,
            channel: 0,
            sample_offset: 0,
        };
        let off = MidiEvent::NoteOff {
            note: 60,
            channel: 0,
            sample_offset: 16,
        };
        assert!(queue.push(on));
        assert!(queue.push(off));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(on));
        assert_eq!(queue.pop(), Some(off));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn drops_when_full() {
        let queue = MidiEventQueue::new(2);
        let event = MidiEvent::PitchBend {
            value: 1024,
            channel: 3,
        };
        assert!(queue.push(event));
        assert!(queue.push(event));
        // full: the event is dropped, not blocked on
        assert!(!queue.push(event));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drains_all_events() {
        let queue = MidiEventQueue::default();
        for note in 0..16 {
            let pushed = queue.push(MidiEvent::NoteOn {
                note,
                velocity: 127,
                channel: 1,
                sample_offset: 0,
            });
            assert!(pushed);
        }
        let mut seen = Vec::new();
        queue.process_events(|event| seen.push(event));
        assert_eq!(seen.len(), 16);
        assert!(queue.is_empty());
    }

    #[test]
    fn channel_accessor() {
        let event = MidiEvent::ChannelAftertouch {
            pressure: 64,
            channel: 9,
            sample_offset: 4,
        };
        assert_eq!(event.channel(), 9);
    }
}
