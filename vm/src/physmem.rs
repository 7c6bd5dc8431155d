//! The user pool: a fixed number of page-sized physical frames.

use std::{collections::VecDeque, fmt, ops::Range};

use crate::page_table::PAGE_SIZE;

/// Handle to one physical frame (its frame number in the user pool).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame#{}", self.0)
    }
}

pub struct PhysicalMemory {
    memory: Vec<u8>,
    free_frames: VecDeque<FrameId>,
    allocated: Vec<bool>,
}

impl PhysicalMemory {
    pub fn new(frame_count: usize) -> Self {
        PhysicalMemory {
            memory: vec![0; frame_count * PAGE_SIZE],
            free_frames: (0..frame_count).map(FrameId).collect(),
            allocated: vec![false; frame_count],
        }
    }

    fn frame_range(frame: FrameId) -> Range<usize> {
        Range {
            start: frame.0 * PAGE_SIZE,
            end: (frame.0 + 1) * PAGE_SIZE,
        }
    }

    /// Takes a zero-filled frame out of the pool.
    pub fn acquire(&mut self) -> Option<FrameId> {
        let frame = self.free_frames.pop_front()?;
        self.allocated[frame.0] = true;
        self.frame_mut(frame).fill(0);
        Some(frame)
    }

    /// Puts `frame` back into the pool.
    pub fn release(&mut self, frame: FrameId) {
        assert!(
            self.allocated[frame.0],
            "releasing {} which is not allocated",
            frame
        );
        self.allocated[frame.0] = false;
        self.free_frames.push_back(frame);
    }

    pub fn frame(&self, frame: FrameId) -> &[u8] {
        &self.memory[Self::frame_range(frame)]
    }

    pub fn frame_mut(&mut self, frame: FrameId) -> &mut [u8] {
        &mut self.memory[Self::frame_range(frame)]
    }

    pub fn frame_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_frames.len()
    }
}
