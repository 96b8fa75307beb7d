use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use crate::{
    btree::page::{Page, PageRef, RefState},
    error::{TimberError, TimberResult},
};

/// Hazard slots per session; overflowing is a programming error
/// (cursor leak), not a runtime condition.
pub const HAZARD_MAX: usize = 32;

/// A session's published page pointers. A reader stores the page's
/// address before dereferencing it; the eviction server scans every
/// session's array and treats any match as conclusive "in use".
pub struct HazardArray {
    slots: Vec<AtomicUsize>,
}

impl HazardArray {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(HAZARD_MAX);
        for _ in 0..HAZARD_MAX {
            slots.push(AtomicUsize::new(0));
        }
        Self { slots }
    }

    fn publish(&self, ptr: usize) -> TimberResult<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, ptr, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Ok(idx);
            }
        }
        Err(TimberError::panic("session out of hazard pointer slots"))
    }

    pub fn release_slot(&self, slot: usize) {
        self.slots[slot].store(0, Ordering::SeqCst);
    }

    /// Is `page` pinned by this session?
    pub fn holds(&self, page: &Arc<Page>) -> bool {
        let ptr = Arc::as_ptr(page) as usize;
        self.slots.iter().any(|s| s.load(Ordering::SeqCst) == ptr)
    }

    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::SeqCst);
        }
    }

    /// Publish a hazard pointer for the page behind `ref_`, then
    /// re-verify the ref still points at it in `Mem` state. The
    /// re-check closes the race with an eviction that locked the ref
    /// between our read and our publish.
    pub fn acquire(&self, ref_: &PageRef) -> TimberResult<Option<HazardSlot>> {
        let page = match ref_.page() {
            Some(p) => p,
            None => return Ok(None),
        };
        let ptr = Arc::as_ptr(&page) as usize;
        let slot = self.publish(ptr)?;

        if ref_.state() != RefState::Mem || !ref_.page().map_or(false, |p| Arc::ptr_eq(&p, &page)) {
            self.release_slot(slot);
            return Ok(None);
        }
        Ok(Some(HazardSlot { slot, page }))
    }
}

/// A held hazard pointer. Dropping it without `release` is a bug the
/// scoped guard in the session layer prevents; this type stays dumb so
/// it can be stored in cursors across calls.
pub struct HazardSlot {
    pub slot: usize,
    pub page: Arc<Page>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::io::PageType;
    use crate::btree::page::{PageData, RefKey, RowLeafData};

    fn leaf() -> Arc<Page> {
        Page::new(
            PageType::RowLeaf,
            PageData::RowLeaf(RowLeafData::empty()),
            None,
        )
    }

    #[test]
    fn test_acquire_release() {
        let hazards = HazardArray::new();
        let page = leaf();
        let ref_ = PageRef::new_mem(RefKey::Recno(0), Arc::clone(&page));

        let held = hazards.acquire(&ref_).unwrap().unwrap();
        assert!(hazards.holds(&page));

        hazards.release_slot(held.slot);
        assert!(!hazards.holds(&page));
    }

    #[test]
    fn test_acquire_fails_against_locked_ref() {
        let hazards = HazardArray::new();
        let page = leaf();
        let ref_ = PageRef::new_mem(RefKey::Recno(0), Arc::clone(&page));

        assert!(ref_.cas_state(RefState::Mem, RefState::Locked));
        let held = hazards.acquire(&ref_).unwrap();
        assert!(held.is_none());
        assert!(!hazards.holds(&page));
    }

    #[test]
    fn test_slots_exhaust() {
        let hazards = HazardArray::new();
        let page = leaf();
        let ref_ = PageRef::new_mem(RefKey::Recno(0), Arc::clone(&page));

        let mut held = Vec::new();
        for _ in 0..HAZARD_MAX {
            held.push(hazards.acquire(&ref_).unwrap().unwrap());
        }
        assert!(hazards.acquire(&ref_).is_err());
    }
}
