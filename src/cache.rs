//! The virtual file descriptor cache: slot arena, free list and LRU ring.
//!
//! Slots are addressed by index so the arena can grow (the backing `Vec`
//! reallocates) without invalidating outstanding [`File`] handles or ring
//! links. Slot 0 is the ring sentinel and never a usable VFD.
//!
//! The LRU ring is a doubly linked list threaded through the slots,
//! beginning and ending at the sentinel: `slots[0].lru_less_recently` is
//! the most recently used member, `slots[0].lru_more_recently` the least.
//! Only slots that currently hold an open kernel descriptor are members;
//! remote slots stay out of the ring entirely, since they cost no kernel
//! descriptor here. Slots that are merely "virtually" open are recognized
//! by a present `path`.

use std::fmt;

use tracing::debug;

use crate::backend::local;
use crate::backend::remote::RemoteHandle;
use crate::error::FdResult;
use crate::flags::{OpenFlags, VfdState};
use crate::manager::SubXactId;

/// Opaque handle to a virtual file descriptor.
///
/// Valid handles are always non-zero; they stay valid across evictions and
/// cache growth until the file is closed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct File(pub(crate) usize);

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "File({})", self.0)
    }
}

/// One entry in the VFD arena.
#[derive(Default)]
pub(crate) struct Vfd {
    /// Open kernel file, or `None` while kernel-closed. Always `None` for
    /// remote slots.
    pub fd: Option<std::fs::File>,
    /// Open remote handle. Always `None` for local slots, and `None` for
    /// remote slots that are physically closed.
    pub remote: Option<RemoteHandle>,
    /// Remote protocol. `None` iff the slot is local; survives physical
    /// close so the slot keeps its backend identity.
    pub protocol: Option<String>,
    pub state: VfdState,
    /// Subtransaction that created the slot; meaningful only with
    /// `CLOSE_AT_EOXACT` set.
    pub create_subid: SubXactId,
    pub next_free: usize,
    pub lru_more_recently: usize,
    pub lru_less_recently: usize,
    /// Logical byte offset; `None` once the position is unknown.
    /// Authoritative while the slot is virtually open but kernel-closed.
    pub seek_pos: Option<i64>,
    /// Path the slot was opened with. `None` iff the slot is free.
    pub path: Option<String>,
    /// Flags sanitized for re-opening.
    pub open_flags: OpenFlags,
    pub open_mode: u32,
}

impl Vfd {
    pub fn is_free(&self) -> bool {
        self.path.is_none()
    }

    pub fn is_local(&self) -> bool {
        self.protocol.is_none()
    }

    pub fn physically_open(&self) -> bool {
        self.fd.is_some() || self.remote.is_some()
    }
}

pub(crate) struct VfdCache {
    slots: Vec<Vfd>,
    /// Kernel descriptors currently held by VFD slots; equals the size of
    /// the LRU ring.
    pub nfile: usize,
}

/// Smallest arena size allocated once the free list first runs dry.
const MIN_CACHE_SIZE: usize = 32;

impl VfdCache {
    /// A cache holding only the sentinel. The first allocation grows it.
    pub fn new() -> Self {
        Self {
            slots: vec![Vfd::default()],
            nfile: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, file: File) -> &Vfd {
        &self.slots[file.0]
    }

    pub fn slot_mut(&mut self, file: File) -> &mut Vfd {
        &mut self.slots[file.0]
    }

    /// Whether `file` names a live (virtually open) slot.
    pub fn is_valid(&self, file: File) -> bool {
        file.0 > 0 && file.0 < self.slots.len() && !self.slots[file.0].is_free()
    }

    /// Grab a free slot, doubling the arena when the free list is empty.
    /// Growth preserves existing slots and links the new tail into the
    /// free list.
    pub fn allocate_vfd(&mut self) -> File {
        if self.slots[0].next_free == 0 {
            let old_size = self.slots.len();
            let new_size = (old_size * 2).max(MIN_CACHE_SIZE);
            debug!(old_size, new_size, "growing VFD cache");

            self.slots.resize_with(new_size, Vfd::default);
            for i in old_size..new_size {
                self.slots[i].next_free = i + 1;
            }
            self.slots[new_size - 1].next_free = 0;
            self.slots[0].next_free = old_size;
        }

        let file = self.slots[0].next_free;
        self.slots[0].next_free = self.slots[file].next_free;
        File(file)
    }

    /// Return a slot to the free list, dropping its path and any leftover
    /// backend state.
    pub fn free_vfd(&mut self, file: File) {
        let head_next_free = self.slots[0].next_free;
        let slot = &mut self.slots[file.0];
        debug!(?file, path = slot.path.as_deref(), "freeing VFD slot");

        slot.path = None;
        slot.protocol = None;
        slot.state = VfdState::empty();
        slot.fd = None;
        slot.remote = None;
        slot.seek_pos = None;

        slot.next_free = head_next_free;
        self.slots[0].next_free = file.0;
    }

    /// Unlink a slot from the LRU ring.
    pub fn ring_unlink(&mut self, file: File) {
        debug_assert!(file.0 != 0);
        let less = self.slots[file.0].lru_less_recently;
        let more = self.slots[file.0].lru_more_recently;
        self.slots[less].lru_more_recently = more;
        self.slots[more].lru_less_recently = less;
    }

    /// Link a slot in at the most-recently-used end of the ring.
    pub fn ring_insert(&mut self, file: File) {
        debug_assert!(file.0 != 0);
        let prev_mru = self.slots[0].lru_less_recently;
        self.slots[file.0].lru_more_recently = 0;
        self.slots[file.0].lru_less_recently = prev_mru;
        self.slots[0].lru_less_recently = file.0;
        self.slots[prev_mru].lru_more_recently = file.0;
    }

    /// The most recently used ring member, if any.
    pub fn ring_head(&self) -> Option<File> {
        match self.slots[0].lru_less_recently {
            0 => None,
            i => Some(File(i)),
        }
    }

    /// Close the kernel descriptor of a ring member, keeping the slot
    /// virtually open. The seek position is captured from the kernel first
    /// so a later access can restore it.
    pub fn lru_delete(&mut self, file: File) -> FdResult<()> {
        debug_assert!(self.is_valid(file) && self.slots[file.0].is_local());
        debug!(?file, path = self.slots[file.0].path.as_deref(), "evicting kernel descriptor");

        // Capture the position before touching the ring, so a failed tell
        // leaves the slot fully intact.
        let pos = {
            let fd = self.slots[file.0]
                .fd
                .as_mut()
                .expect("ring member must hold a kernel fd");
            local::tell(fd)?
        };

        self.ring_unlink(file);
        let slot = &mut self.slots[file.0];
        slot.seek_pos = Some(pos);
        let kernel = slot.fd.take().expect("just observed");
        self.nfile -= 1;
        local::close_reporting(kernel)?;
        Ok(())
    }

    /// Evict the least recently used ring member. Returns `false` iff the
    /// ring is empty.
    pub fn release_lru_file(&mut self) -> FdResult<bool> {
        if self.nfile == 0 {
            return Ok(false);
        }
        let least = self.slots[0].lru_more_recently;
        debug_assert!(least != 0, "nonzero nfile implies a nonempty ring");
        self.lru_delete(File(least))?;
        Ok(true)
    }

    /// Indices of all non-sentinel slots, for sweep-style passes.
    pub fn files(&self) -> impl Iterator<Item = File> + use<> {
        (1..self.slots.len()).map(File)
    }

    /// Walk the LRU ring from most to least recent, bounded so a corrupted
    /// ring cannot loop forever.
    pub fn ring_members(&self) -> Vec<File> {
        let mut members = Vec::new();
        let mut cur = self.slots[0].lru_less_recently;
        while cur != 0 && members.len() <= self.slots.len() {
            members.push(File(cur));
            cur = self.slots[cur].lru_less_recently;
        }
        members
    }

    /// Walk the free list, bounded like [`ring_members`](Self::ring_members).
    pub fn free_list(&self) -> Vec<usize> {
        let mut free = Vec::new();
        let mut cur = self.slots[0].next_free;
        while cur != 0 && free.len() <= self.slots.len() {
            free.push(cur);
            cur = self.slots[cur].next_free;
        }
        free
    }
}
