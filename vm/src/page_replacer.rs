use std::collections::VecDeque;

use log::trace;

use crate::physmem::FrameId;

pub enum FrameEvent {
    /// The frame entered the frame table.
    Registered(FrameId),
    /// The frame left the frame table (evicted or freed).
    Released(FrameId),
}

/// Answers "was this frame used recently?" for the replacer.
///
/// `Some(accessed)` reports the accessed bit and clears it as a side effect.
/// `None` marks a frame that cannot be evicted right now.
pub type ReferenceProbe<'a> = dyn FnMut(FrameId) -> Option<bool> + 'a;

pub trait PageReplacer {
    fn page_event(&mut self, _event: FrameEvent) {}

    fn pick_victim(&mut self, probe: &mut ReferenceProbe<'_>) -> Option<FrameId>;
}

/// Second-chance replacement over the frames in registration order.
///
/// The front of the ring is the clock hand. A referenced frame has its bit
/// cleared and moves behind the hand; the first unreferenced one is the victim.
pub struct ClockReplacer {
    ring: VecDeque<FrameId>,
}

impl ClockReplacer {
    pub fn new() -> Self {
        ClockReplacer {
            ring: VecDeque::new(),
        }
    }
}

impl Default for ClockReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageReplacer for ClockReplacer {
    fn page_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Registered(frame) => self.ring.push_back(frame),
            FrameEvent::Released(frame) => self.ring.retain(|f| *f != frame),
        }
    }

    fn pick_victim(&mut self, probe: &mut ReferenceProbe<'_>) -> Option<FrameId> {
        // one pass clears every bit, so a second pass finds a victim unless
        // nothing in the ring is evictable
        let budget = 2 * self.ring.len();

        for _ in 0..budget {
            let frame = *self.ring.front()?;
            match probe(frame) {
                Some(false) => {
                    self.ring.pop_front();
                    return Some(frame);
                }
                Some(true) => trace!("clock: {} gets a second chance", frame),
                None => trace!("clock: {} is not evictable", frame),
            }
            self.ring.rotate_left(1);
        }

        None
    }
}

/// Evicts frames in the order they were registered, ignoring accessed bits.
pub struct FIFOPageReplacer {
    fifo: VecDeque<FrameId>,
}

impl FIFOPageReplacer {
    pub fn new() -> Self {
        FIFOPageReplacer {
            fifo: VecDeque::new(),
        }
    }
}

impl Default for FIFOPageReplacer {
    fn default() -> Self {
        Self::new()
    }
}

impl PageReplacer for FIFOPageReplacer {
    fn page_event(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Registered(frame) => self.fifo.push_back(frame),
            FrameEvent::Released(frame) => self.fifo.retain(|f| *f != frame),
        }
    }

    fn pick_victim(&mut self, probe: &mut ReferenceProbe<'_>) -> Option<FrameId> {
        let position = self.fifo.iter().position(|frame| probe(*frame).is_some())?;
        self.fifo.remove(position)
    }
}
