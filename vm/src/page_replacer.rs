use std::collections::VecDeque;

use crate::frame::FrameId;

pub enum PageEvent {
    /// A page was made resident in the frame.
    Loaded(FrameId),
    /// The frame went back to the free pool.
    Released(FrameId),
}

/// How a frame looks to the replacement policy at the moment it is probed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// Free, or pinned while its contents are in flight. Never a victim.
    Unavailable,
    /// The accessed bit was set. Probing cleared it.
    Referenced,
    /// Resident and not accessed since the last probe.
    Idle,
}

/// Victim selection for the frame allocator.
///
/// `probe` classifies a frame and clears its accessed bit as a side effect.
/// Implementations must terminate after a bounded number of probes and never
/// return a frame classified as [`Candidate::Unavailable`].
pub trait PageReplacer: Send {
    fn page_event(&mut self, _event: PageEvent) {}

    fn pick_replacement_frame(
        &mut self,
        frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Candidate,
    ) -> Option<FrameId>;
}

/// Second-chance replacement over the whole frame table.
///
/// When two sweeps find no idle frame, the first referenced frame seen is
/// evicted rather than the frame under the hand.
#[derive(Debug, Default)]
pub struct ClockReplacer {
    hand: usize,
}

impl ClockReplacer {
    pub fn new() -> Self {
        ClockReplacer::default()
    }
}

impl PageReplacer for ClockReplacer {
    fn pick_replacement_frame(
        &mut self,
        frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Candidate,
    ) -> Option<FrameId> {
        if frame_count == 0 {
            return None;
        }

        let mut fallback = None;

        // Two sweeps: the first clears every accessed bit, so the second
        // finds an idle frame unless everything is unavailable.
        for _ in 0..2 * frame_count {
            let frame = FrameId::new(self.hand % frame_count);
            self.hand = (self.hand + 1) % frame_count;

            match probe(frame) {
                Candidate::Idle => return Some(frame),
                Candidate::Referenced => {
                    fallback.get_or_insert(frame);
                }
                Candidate::Unavailable => {}
            }
        }

        fallback
    }
}

/// Evicts frames in the order their pages were loaded.
#[derive(Debug, Default)]
pub struct FifoReplacer {
    fifo: VecDeque<FrameId>,
}

impl FifoReplacer {
    pub fn new() -> Self {
        FifoReplacer::default()
    }
}

impl PageReplacer for FifoReplacer {
    fn page_event(&mut self, event: PageEvent) {
        match event {
            PageEvent::Loaded(frame) => self.fifo.push_back(frame),
            PageEvent::Released(frame) => self.fifo.retain(|f| *f != frame),
        }
    }

    fn pick_replacement_frame(
        &mut self,
        _frame_count: usize,
        probe: &mut dyn FnMut(FrameId) -> Candidate,
    ) -> Option<FrameId> {
        // The victim is rotated to the back instead of popped: if its
        // eviction fails it is still resident and must stay queued.
        for _ in 0..self.fifo.len() {
            let frame = self.fifo.pop_front()?;
            self.fifo.push_back(frame);

            if probe(frame) != Candidate::Unavailable {
                return Some(frame);
            }
        }

        None
    }
}
