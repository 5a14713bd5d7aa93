//! The heap region itself: block storage, boundary-tag accessors, and the
//! segregated free-list index.
//!
//! Spec §9 invites implementations in languages that disallow raw pointer
//! arithmetic to "model blocks as opaque byte offsets into a `Vec<u8>`-shaped
//! heap and define accessor functions for header/footer/link reads and
//! writes. The 'pointer' in free-list links is an intra-heap offset." That is
//! exactly what [`Heap`] does: every block is named by the `usize` byte
//! offset of its header, and every accessor goes through this module instead
//! of raw pointers. This sidesteps a real hazard that a literal translation
//! of a C malloc lab would hit: the backing store here is a growable
//! [`Vec<u8>`], and growing a `Vec` can relocate its buffer, which would
//! invalidate any raw pointer taken before the growth. Offsets survive
//! relocation unchanged.
//!
//! The 13 free-list roots are kept as a plain Rust array rather than as bytes
//! at a fixed heap prefix (spec §6.4 describes the prefix layout a C
//! implementation would use for in-process pointer arithmetic); the
//! *semantics* of "13 roots, one per size class, searched smallest-class
//! first" are unchanged, only the encoding of the roots themselves.

use super::block::{self, Tag, LINK_SIZE, MIN_BLOCK, NUM_CLASSES, TAG_SIZE};

/// Size, in bytes, requested from the heap-extension primitive when no free
/// block satisfies a request. Spec §4.1 cites the reference value of 168 and
/// explicitly permits tuning; 4096 (a single typical page) cuts down on the
/// number of extension calls for realistic workloads.
pub const CHUNKSIZE: usize = 4096;

/// Decides whether the heap may grow by `additional_bytes` more.
///
/// This is the "budget" half of spec's opaque `heap_extend(nbytes) -> base`
/// primitive. [`Heap`] owns the actual contiguous storage (a `Vec<u8>`, which
/// always hands back a base immediately following the previous tail), so the
/// only thing left for an external collaborator to decide is whether to
/// permit the growth at all -- this is what lets tests simulate ENOMEM.
pub trait HeapExtender {
    /// Return `true` to permit growing the heap by `additional_bytes`.
    fn extend(&mut self, additional_bytes: usize) -> bool;
}

/// The production extender: the heap may always grow, limited only by the
/// process's real memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

impl HeapExtender for Unbounded {
    fn extend(&mut self, _additional_bytes: usize) -> bool {
        true
    }
}

/// A test extender that simulates running out of memory after a fixed
/// number of bytes have been handed out in total.
#[derive(Debug, Clone, Copy)]
pub struct Bounded {
    remaining: usize,
}

impl Bounded {
    pub fn new(remaining: usize) -> Self {
        Self { remaining }
    }
}

impl HeapExtender for Bounded {
    fn extend(&mut self, additional_bytes: usize) -> bool {
        if additional_bytes > self.remaining {
            false
        } else {
            self.remaining -= additional_bytes;
            true
        }
    }
}

/// Offset of a free block's `prev` link, relative to its header offset.
fn prev_link_offset(header_off: usize) -> usize {
    header_off + TAG_SIZE
}

/// Offset of a free block's `next` link, relative to its header offset.
fn next_link_offset(header_off: usize) -> usize {
    header_off + TAG_SIZE + LINK_SIZE
}

/// The heap: prologue, regular blocks, epilogue, plus the free-list roots.
pub struct Heap<E: HeapExtender = Unbounded> {
    bytes: Vec<u8>,
    epilogue_offset: usize,
    list_roots: [usize; NUM_CLASSES],
    extender: E,
}

/// Padding, in bytes, placed before the prologue (spec §6.4's `pad:4` word
/// between the list-root prefix and the prologue).
///
/// With the prologue's 8-byte block starting right at offset 0, the first
/// regular block -- whose header always lands where the epilogue used to be
/// -- would sit at offset 8, an offset that is a multiple of 8. Since every
/// block's size is itself a multiple of 8, that parity never changes as the
/// heap grows: every regular block header would be aligned `≡0 mod 8`
/// forever, which puts every payload (header + `TAG_SIZE`) at `≡4 mod 8`
/// instead of the required 8-byte alignment. This pad word shifts the whole
/// prologue/epilogue/block region over by 4 bytes so the first regular block
/// lands at `≡4 mod 8` and its payload at `≡0 mod 8`, exactly as spec §3.1
/// and §6.1 require.
const PAD: usize = 4;

impl<E: HeapExtender> Heap<E> {
    /// Build a fresh heap: just prologue and epilogue, no usable free space
    /// yet (the first allocation will trigger an extension).
    pub fn new(extender: E) -> Self {
        let mut bytes = vec![0u8; PAD + 8 + TAG_SIZE];
        write_tag(&mut bytes, PAD, Tag::allocated(8));
        write_tag(&mut bytes, PAD + TAG_SIZE, Tag::allocated(8));
        write_tag(&mut bytes, PAD + TAG_SIZE + TAG_SIZE, Tag::allocated(0));
        Self {
            bytes,
            epilogue_offset: PAD + TAG_SIZE + TAG_SIZE,
            list_roots: [0; NUM_CLASSES],
            extender,
        }
    }

    /// Offset of the prologue header: the first live byte of the heap proper,
    /// after [`PAD`].
    pub fn heap_lo(&self) -> usize {
        PAD
    }

    pub fn heap_hi(&self) -> usize {
        self.bytes.len()
    }

    pub fn epilogue_offset(&self) -> usize {
        self.epilogue_offset
    }

    pub fn list_root(&self, class: usize) -> Option<usize> {
        let off = self.list_roots[class];
        (off != 0).then_some(off)
    }

    /// The raw free-list roots, one per size class, 0 meaning an empty list.
    pub(crate) fn list_roots(&self) -> &[usize; NUM_CLASSES] {
        &self.list_roots
    }

    pub fn tag_at(&self, header_off: usize) -> Tag {
        Tag::from_bytes(self.bytes[header_off..header_off + TAG_SIZE].try_into().unwrap())
    }

    fn set_tag_at(&mut self, off: usize, tag: Tag) {
        self.bytes[off..off + TAG_SIZE].copy_from_slice(&tag.to_bytes());
    }

    /// Write the same tag to both a block's header and footer.
    fn write_block(&mut self, header_off: usize, tag: Tag) {
        let size = tag.size();
        self.set_tag_at(header_off, tag);
        if size >= TAG_SIZE {
            self.set_tag_at(header_off + size - TAG_SIZE, tag);
        }
    }

    fn read_link(&self, off: usize) -> usize {
        u64::from_le_bytes(self.bytes[off..off + LINK_SIZE].try_into().unwrap()) as usize
    }

    fn write_link(&mut self, off: usize, value: usize) {
        self.bytes[off..off + LINK_SIZE].copy_from_slice(&(value as u64).to_le_bytes());
    }

    /// The `prev` link of the free block at `header_off` (0 = null). Exposed
    /// for [`super::checker`], which needs to walk raw list structure to
    /// validate it rather than trusting [`Heap`]'s own list operations.
    pub(crate) fn free_prev(&self, header_off: usize) -> usize {
        self.read_link(prev_link_offset(header_off))
    }

    /// The `next` link of the free block at `header_off` (0 = null).
    pub(crate) fn free_next(&self, header_off: usize) -> usize {
        self.read_link(next_link_offset(header_off))
    }

    /// Byte length of the whole heap-prefix region holding the free-list
    /// roots, for the checker's "list-root region is valid" check.
    pub(crate) fn list_root_region_len(&self) -> usize {
        self.list_roots.len() * 8
    }

    /// Directly overwrite a free block's `next` link, bypassing all
    /// list-consistency bookkeeping. Used only by the checker's own test
    /// suite to induce a cycle and confirm it is detected.
    #[cfg(test)]
    pub(crate) fn corrupt_free_next_for_test(&mut self, header_off: usize, value: usize) {
        self.write_link(next_link_offset(header_off), value);
    }

    /// The payload bytes of the block whose header is at `header_off`.
    pub fn payload_mut(&mut self, header_off: usize) -> &mut [u8] {
        let size = self.tag_at(header_off).size();
        &mut self.bytes[header_off + TAG_SIZE..header_off + size - TAG_SIZE]
    }

    pub fn payload(&self, header_off: usize) -> &[u8] {
        let size = self.tag_at(header_off).size();
        &self.bytes[header_off + TAG_SIZE..header_off + size - TAG_SIZE]
    }

    /// Offset of the block that directly follows the one at `header_off`, if
    /// any (`None` once we reach the epilogue).
    pub fn next_block_offset(&self, header_off: usize) -> Option<usize> {
        let next = header_off + self.tag_at(header_off).size();
        (next < self.epilogue_offset).then_some(next)
    }

    /// Header offsets of every regular block (i.e. excluding the prologue and
    /// epilogue sentinels) in address order.
    pub fn blocks(&self) -> Blocks<'_, E> {
        let first_block = self.heap_lo() + 8;
        Blocks {
            heap: self,
            next: (self.epilogue_offset > first_block).then_some(first_block),
        }
    }

    /// Offset of the block that directly precedes the one at `header_off`,
    /// found via its boundary-tag footer. `None` once we'd read before the
    /// prologue; the prologue's own tag is always allocated, so callers never
    /// need to special-case it beyond this bounds check.
    pub fn prev_block_offset(&self, header_off: usize) -> Option<usize> {
        if header_off <= self.heap_lo() + 8 {
            return None;
        }
        let prev_footer = self.tag_at(header_off - TAG_SIZE);
        Some(header_off - prev_footer.size())
    }

    /// Remove the free block at `header_off` (of the given `class`) from its
    /// free list.
    fn remove_free(&mut self, class: usize, header_off: usize) {
        let prev = self.read_link(prev_link_offset(header_off));
        let next = self.read_link(next_link_offset(header_off));
        if prev == 0 {
            self.list_roots[class] = next;
        } else {
            self.write_link(next_link_offset(prev), next);
        }
        if next != 0 {
            self.write_link(prev_link_offset(next), prev);
        }
    }

    /// Insert the free block at `header_off` (of the given `class`) at the
    /// head of its free list (MRU-first insertion order).
    fn insert_free(&mut self, class: usize, header_off: usize) {
        let old_root = self.list_roots[class];
        self.write_link(prev_link_offset(header_off), 0);
        self.write_link(next_link_offset(header_off), old_root);
        if old_root != 0 {
            self.write_link(prev_link_offset(old_root), header_off);
        }
        self.list_roots[class] = header_off;
    }

    /// Scan free lists from `class_of(size)` upward for the first block whose
    /// size is at least `size` (first-fit within an ascending class scan).
    pub fn find_fit(&self, size: usize) -> Option<usize> {
        for class in block::class_of(size)..NUM_CLASSES {
            let mut cursor = self.list_root(class);
            while let Some(off) = cursor {
                if self.tag_at(off).size() >= size {
                    return Some(off);
                }
                let next = self.read_link(next_link_offset(off));
                cursor = (next != 0).then_some(next);
            }
        }
        None
    }

    /// Mark the block at `header_off` as free and merge it with whichever of
    /// its neighbors are also free, per the four cases in spec §4.1. Returns
    /// the header offset of the (possibly merged) resulting free block,
    /// which has already been inserted into the appropriate free list.
    pub fn coalesce(&mut self, header_off: usize) -> usize {
        let size = self.tag_at(header_off).size();
        let prev = self
            .prev_block_offset(header_off)
            .filter(|&p| self.tag_at(p).is_free());
        let next = self
            .next_block_offset(header_off)
            .filter(|&n| self.tag_at(n).is_free());

        match (prev, next) {
            (None, None) => {
                self.write_block(header_off, Tag::free(size));
                let class = block::class_of(size);
                self.insert_free(class, header_off);
                header_off
            }
            (None, Some(next_off)) => {
                let next_size = self.tag_at(next_off).size();
                self.remove_free(block::class_of(next_size), next_off);
                let merged = size + next_size;
                self.write_block(header_off, Tag::free(merged));
                self.insert_free(block::class_of(merged), header_off);
                header_off
            }
            (Some(prev_off), None) => {
                let prev_size = self.tag_at(prev_off).size();
                self.remove_free(block::class_of(prev_size), prev_off);
                let merged = prev_size + size;
                self.write_block(prev_off, Tag::free(merged));
                self.insert_free(block::class_of(merged), prev_off);
                prev_off
            }
            (Some(prev_off), Some(next_off)) => {
                let prev_size = self.tag_at(prev_off).size();
                let next_size = self.tag_at(next_off).size();
                self.remove_free(block::class_of(prev_size), prev_off);
                self.remove_free(block::class_of(next_size), next_off);
                let merged = prev_size + size + next_size;
                self.write_block(prev_off, Tag::free(merged));
                self.insert_free(block::class_of(merged), prev_off);
                prev_off
            }
        }
    }

    /// Mark the free block at `header_off` as allocated, splitting off a
    /// trailing free remainder if it is large enough to be useful. Returns
    /// the header offset to hand back to the caller (unchanged: a split
    /// never moves the front of the block).
    pub fn place(&mut self, header_off: usize, requested: usize) -> usize {
        let size = self.tag_at(header_off).size();
        self.remove_free(block::class_of(size), header_off);

        if size - requested >= MIN_BLOCK {
            self.write_block(header_off, Tag::allocated(requested));
            let remainder_off = header_off + requested;
            self.write_block(remainder_off, Tag::free(size - requested));
            self.coalesce(remainder_off);
        } else {
            self.write_block(header_off, Tag::allocated(size));
        }
        header_off
    }

    /// Mark the allocated block at `header_off` as free and coalesce it.
    pub fn free_block(&mut self, header_off: usize) {
        let size = self.tag_at(header_off).size();
        self.write_block(header_off, Tag::free(size));
        self.coalesce(header_off);
    }

    /// Shrink the allocated block at `header_off` to `new_size`, re-emitting
    /// the trailing remainder as a (possibly further-coalesced) free block.
    /// Caller must have already checked `old_size - new_size >= MIN_BLOCK`.
    pub fn shrink_in_place(&mut self, header_off: usize, new_size: usize) -> usize {
        let old_size = self.tag_at(header_off).size();
        self.write_block(header_off, Tag::allocated(new_size));
        let tail_off = header_off + new_size;
        self.write_block(tail_off, Tag::free(old_size - new_size));
        self.coalesce(tail_off);
        header_off
    }

    /// Attempt to grow the allocated block at `header_off` to `new_size` by
    /// absorbing its free successor, per spec §4.1 realloc growth rules.
    /// Returns `false` (no change made) if the successor isn't free or isn't
    /// large enough, in which case the caller must relocate instead.
    pub fn try_grow_in_place(&mut self, header_off: usize, new_size: usize) -> bool {
        let old_size = self.tag_at(header_off).size();
        let needed = new_size - old_size;

        let Some(next_off) = self.next_block_offset(header_off) else {
            return false;
        };
        let next_tag = self.tag_at(next_off);
        if !next_tag.is_free() || next_tag.size() <= needed {
            return false;
        }

        let next_size = next_tag.size();
        self.remove_free(block::class_of(next_size), next_off);
        if next_size - needed >= MIN_BLOCK {
            self.write_block(header_off, Tag::allocated(new_size));
            let remainder_off = header_off + new_size;
            let remainder_size = next_size - needed;
            self.write_block(remainder_off, Tag::free(remainder_size));
            self.insert_free(block::class_of(remainder_size), remainder_off);
        } else {
            self.write_block(header_off, Tag::allocated(old_size + next_size));
        }
        true
    }

    /// Grow the heap by at least `min_bytes`, round up to alignment, write
    /// the new region as a single free block, coalesce it with the previous
    /// tail block if that was free, and return the header offset of the
    /// resulting free block (already inserted into its free list, exactly
    /// like any other result of [`Heap::coalesce`]).
    ///
    /// Returns `None` if the extender refuses to grow the heap (ENOMEM).
    pub fn extend(&mut self, min_bytes: usize) -> Option<usize> {
        let words = block::align_up(min_bytes.max(CHUNKSIZE)).max(MIN_BLOCK);
        if !self.extender.extend(words) {
            return None;
        }

        let new_block_off = self.epilogue_offset;
        let new_epilogue_off = new_block_off + words;
        self.bytes.resize(new_epilogue_off + TAG_SIZE, 0);

        self.write_block(new_block_off, Tag::free(words));
        self.set_tag_at(new_epilogue_off, Tag::allocated(0));
        self.epilogue_offset = new_epilogue_off;

        Some(self.coalesce(new_block_off))
    }
}

fn write_tag(bytes: &mut [u8], offset: usize, tag: Tag) {
    bytes[offset..offset + TAG_SIZE].copy_from_slice(&tag.to_bytes());
}

/// Iterator over the regular (non-sentinel) blocks of a [`Heap`], in address
/// order, used by [`super::checker`]'s full heap walk.
pub struct Blocks<'a, E: HeapExtender> {
    heap: &'a Heap<E>,
    next: Option<usize>,
}

impl<'a, E: HeapExtender> Iterator for Blocks<'a, E> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let current = self.next?;
        self.next = self.heap.next_block_offset(current);
        Some(current)
    }
}
