use core::ptr::NonNull;

/// Magic index that indicates "no slot".
pub(crate) const NIL: usize = usize::MAX;

/// One window: an active mapping of a single segment.
pub(crate) struct WindowSlot {
    /// index of the segment mapped by this window, valid while `base` is set
    pub segment: usize,

    /// base address of the mapping
    pub base: Option<NonNull<u8>>,

    /// reference count; a referenced window is never on the LRU list
    pub refcnt: usize,

    prev: usize,
    next: usize,
}

/// Dense slot array with an index-linked LRU list of idle windows.
///
/// Linking by slot index instead of by pointer keeps unlink and append O(1)
/// without aliasing into the slot storage, and makes the list trivial to
/// dump when debugging.
pub(crate) struct SlotList {
    slots: Vec<WindowSlot>,

    /// least recently idled end, eviction takes from here
    lru_head: usize,

    /// most recently idled end
    lru_tail: usize,
}

impl SlotList {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            lru_head: NIL,
            lru_tail: NIL,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn slot(&self, ix: usize) -> &WindowSlot {
        &self.slots[ix]
    }

    pub(crate) fn slot_mut(&mut self, ix: usize) -> &mut WindowSlot {
        &mut self.slots[ix]
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &WindowSlot> {
        self.slots.iter()
    }

    /// Appends a fresh, unlinked slot and returns its index.
    pub(crate) fn push_slot(&mut self) -> usize {
        self.slots.push(WindowSlot {
            segment: 0,
            base: None,
            refcnt: 0,
            prev: NIL,
            next: NIL,
        });

        self.slots.len() - 1
    }

    /// Unlinks `ix` from the LRU list. The slot must be idle and linked.
    pub(crate) fn unlink(&mut self, ix: usize) {
        let (prev, next) = {
            let slot = &self.slots[ix];
            debug_assert_eq!(slot.refcnt, 0);
            debug_assert!(self.lru_head == ix || slot.prev != NIL, "slot not linked");
            (slot.prev, slot.next)
        };

        if prev == NIL {
            self.lru_head = next;
        } else {
            self.slots[prev].next = next;
        }
        if next == NIL {
            self.lru_tail = prev;
        } else {
            self.slots[next].prev = prev;
        }

        let slot = &mut self.slots[ix];
        slot.prev = NIL;
        slot.next = NIL;
    }

    /// Appends `ix` to the tail (the most recently idled end).
    pub(crate) fn push_tail(&mut self, ix: usize) {
        {
            let slot = &self.slots[ix];
            debug_assert_eq!(slot.refcnt, 0);
            debug_assert!(slot.prev == NIL && slot.next == NIL);
        }

        if self.lru_tail == NIL {
            debug_assert_eq!(self.lru_head, NIL);
            self.lru_head = ix;
        } else {
            self.slots[self.lru_tail].next = ix;
            self.slots[ix].prev = self.lru_tail;
        }
        self.lru_tail = ix;
    }

    /// Removes and returns the least recently idled slot.
    pub(crate) fn pop_head(&mut self) -> Option<usize> {
        match self.lru_head {
            NIL => None,
            head => {
                self.unlink(head);
                Some(head)
            }
        }
    }

    /// Return `true` if no window is idle.
    #[allow(unused)]
    pub(crate) fn lru_is_empty(&self) -> bool {
        self.lru_head == NIL
    }
}
