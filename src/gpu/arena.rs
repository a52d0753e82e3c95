//! Generation-tagged storage for device-resident frame data
//!
//! Every device frame owns exactly one slot. Slots are recycled once the last
//! `Frame` clone referencing them is dropped; the generation counter makes a
//! handle to a recycled slot detectably stale instead of aliasing new data.

use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHandle {
    pub index: u32,
    pub generation: u32,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    occupied: bool,
    data: Option<Bytes>,
}

#[derive(Default)]
struct ArenaInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Default)]
pub struct FrameArena {
    inner: Mutex<ArenaInner>,
}

impl FrameArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot whose contents will be written later by GPU work.
    pub fn allocate_pending(&self) -> FrameHandle {
        let mut inner = self.lock();
        inner.live += 1;
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.occupied = true;
            slot.data = None;
            return FrameHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            occupied: true,
            data: None,
        });
        FrameHandle {
            index,
            generation: 0,
        }
    }

    pub fn allocate(&self, data: Bytes) -> FrameHandle {
        let handle = self.allocate_pending();
        // freshly allocated, cannot be stale
        let _ = self.fill(handle, data);
        handle
    }

    pub fn fill(&self, handle: FrameHandle, data: Bytes) -> Result<()> {
        let mut inner = self.lock();
        let slot = Self::slot_mut(&mut inner, handle)?;
        slot.data = Some(data);
        Ok(())
    }

    /// Returns the slot contents, `ResourceBusy` while still unwritten.
    pub fn get(&self, handle: FrameHandle) -> Result<Bytes> {
        let mut inner = self.lock();
        let slot = Self::slot_mut(&mut inner, handle)?;
        slot.data.clone().ok_or_else(|| {
            PipelineError::ResourceBusy(format!(
                "slot {}#{} has not been written yet",
                handle.index, handle.generation
            ))
        })
    }

    /// Frees the slot and bumps its generation. Returns false for stale handles.
    pub fn release(&self, handle: FrameHandle) -> bool {
        let mut inner = self.lock();
        if Self::slot_mut(&mut inner, handle).is_err() {
            return false;
        }
        let slot = &mut inner.slots[handle.index as usize];
        slot.occupied = false;
        slot.data = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(handle.index);
        inner.live -= 1;
        true
    }

    pub fn live_count(&self) -> usize {
        self.lock().live
    }

    fn slot_mut(inner: &mut ArenaInner, handle: FrameHandle) -> Result<&mut Slot> {
        match inner.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => Ok(slot),
            _ => Err(PipelineError::StaleHandle {
                index: handle.index,
                generation: handle.generation,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycled_slot_rejects_old_handle() {
        let arena = FrameArena::new();
        let first = arena.allocate(Bytes::from_static(b"abc"));
        assert!(arena.release(first));

        let second = arena.allocate(Bytes::from_static(b"xyz"));
        assert_eq!(second.index, first.index);
        assert_ne!(second.generation, first.generation);

        assert!(matches!(
            arena.get(first),
            Err(PipelineError::StaleHandle { .. })
        ));
        assert_eq!(&arena.get(second).unwrap()[..], b"xyz");
        assert!(!arena.release(first));
        assert_eq!(arena.live_count(), 1);
    }

    #[test]
    fn test_pending_slot_is_busy_until_filled() {
        let arena = FrameArena::new();
        let handle = arena.allocate_pending();
        assert!(matches!(arena.get(handle), Err(PipelineError::ResourceBusy(_))));
        arena.fill(handle, Bytes::from_static(&[1, 2, 3])).unwrap();
        assert_eq!(arena.get(handle).unwrap().len(), 3);
    }
}
