//! Heap integrity checker (spec §4.2).
//!
//! Invoked on demand, typically from a debug build or a test, to verify the
//! allocator's structural invariants. A violation here means the allocator
//! itself has a bug -- it is not a recoverable runtime condition the way
//! ENOMEM is, so [`check_heap`] logs every violation it finds (so that
//! several independent problems in one heap are all visible at once) and
//! then panics, terminating the process.

use std::collections::HashSet;

use thiserror::Error;

use super::block::{self, Tag, ALIGNMENT, MIN_BLOCK, NUM_CLASSES, TAG_SIZE};
use super::heap::{Heap, HeapExtender};

/// How chatty [`check_heap`] is about blocks/lists it finds to be fine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Only violations are logged.
    Quiet,
    /// Violations are logged at error level, and every walked block/list
    /// entry is additionally logged at debug level.
    Verbose,
}

/// A single structural violation found by [`check_heap`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("list-root region extends past the heap start")]
    ListRootRegionInvalid,
    #[error("prologue at heap base is corrupt: {0:?}")]
    PrologueCorrupt(Tag),
    #[error("epilogue at heap tail is corrupt: {0:?}")]
    EpilogueCorrupt(Tag),
    #[error("block at offset {offset} lies outside the heap")]
    BlockOutOfBounds { offset: usize },
    #[error("block at offset {offset} is not {alignment}-byte aligned")]
    Misaligned { offset: usize, alignment: usize },
    #[error("block at offset {offset} has header {header:?} but footer {footer:?}")]
    HeaderFooterMismatch { offset: usize, header: Tag, footer: Tag },
    #[error("block at offset {offset} has size {size}, smaller than MIN_BLOCK")]
    BelowMinBlock { offset: usize, size: usize },
    #[error("free block at offset {offset} is adjacent to another free block")]
    AdjacentFreeBlocks { offset: usize },
    #[error("a cycle was detected in free list for class {class}")]
    FreeListCycle { class: usize },
    #[error("free list root for class {class} has a non-null prev link")]
    RootHasPrev { class: usize },
    #[error("free list for class {class}: next.prev != self at offset {offset}")]
    BrokenBackLink { class: usize, offset: usize },
    #[error("block at offset {offset} (size {size}) is in class {class}'s list but out of its range")]
    WrongClass { offset: usize, size: usize, class: usize },
    #[error("block at offset {offset} appears free but is marked allocated in the free list walk")]
    ListedBlockNotFree { offset: usize },
    #[error("free block count mismatch: heap walk found {walked}, free-list walk found {listed}")]
    FreeCountMismatch { walked: usize, listed: usize },
}

/// Run all of spec §4.2's structural checks against `heap`. Logs every
/// violation found via the `log` facade and panics if any were found.
pub fn check_heap<E: HeapExtender>(heap: &Heap<E>, verbosity: Verbosity) {
    let mut violations = Vec::new();

    check_list_root_region(heap, &mut violations);
    check_sentinels(heap, &mut violations);
    let walked_free_count = walk_blocks(heap, verbosity, &mut violations);

    if let Some(class) = detect_cycle(heap) {
        violations.push(CheckError::FreeListCycle { class });
        report_and_abort(&violations);
        unreachable!("report_and_abort always panics when violations is non-empty");
    }

    let listed_free_count = walk_free_lists(heap, verbosity, &mut violations);

    if walked_free_count != listed_free_count {
        violations.push(CheckError::FreeCountMismatch {
            walked: walked_free_count,
            listed: listed_free_count,
        });
    }

    if !violations.is_empty() {
        report_and_abort(&violations);
    }
}

fn report_and_abort(violations: &[CheckError]) -> ! {
    for violation in violations {
        log::error!("heap check failed: {violation}");
    }
    panic!(
        "heap_checker: {} invariant violation(s) found, see log for details",
        violations.len()
    );
}

fn check_list_root_region<E: HeapExtender>(heap: &Heap<E>, violations: &mut Vec<CheckError>) {
    if heap.list_root_region_len() % ALIGNMENT != 0 {
        violations.push(CheckError::ListRootRegionInvalid);
    }
}

fn check_sentinels<E: HeapExtender>(heap: &Heap<E>, violations: &mut Vec<CheckError>) {
    let prologue = heap.tag_at(heap.heap_lo());
    if prologue.size() != 8 || prologue.is_free() {
        violations.push(CheckError::PrologueCorrupt(prologue));
    }
    let epilogue = heap.tag_at(heap.epilogue_offset());
    if epilogue.size() != 0 || epilogue.is_free() {
        violations.push(CheckError::EpilogueCorrupt(epilogue));
    }
}

/// Walk every regular block via next-block arithmetic, running the per-block
/// and coalesce checks from spec §4.2 step 3. Returns the number of free
/// blocks found.
fn walk_blocks<E: HeapExtender>(
    heap: &Heap<E>,
    verbosity: Verbosity,
    violations: &mut Vec<CheckError>,
) -> usize {
    let mut free_count = 0;

    for offset in heap.blocks() {
        if offset >= heap.heap_hi() {
            violations.push(CheckError::BlockOutOfBounds { offset });
            continue;
        }
        if offset % ALIGNMENT != 0 {
            violations.push(CheckError::Misaligned { offset, alignment: ALIGNMENT });
            continue;
        }

        let header = heap.tag_at(offset);
        let footer = heap.tag_at(offset + header.size() - TAG_SIZE);
        if header != footer {
            violations.push(CheckError::HeaderFooterMismatch { offset, header, footer });
        }
        if header.size() < MIN_BLOCK {
            violations.push(CheckError::BelowMinBlock { offset, size: header.size() });
        }
        if (offset + TAG_SIZE) % ALIGNMENT != 0 {
            violations.push(CheckError::Misaligned {
                offset: offset + TAG_SIZE,
                alignment: ALIGNMENT,
            });
        }

        if header.is_free() {
            free_count += 1;
            let prev_free = heap.prev_block_offset(offset).is_some_and(|p| heap.tag_at(p).is_free());
            let next_free = heap.next_block_offset(offset).is_some_and(|n| heap.tag_at(n).is_free());
            if prev_free || next_free {
                violations.push(CheckError::AdjacentFreeBlocks { offset });
            }
        }

        if verbosity == Verbosity::Verbose {
            log::debug!("heap walk: block at {offset}, {header:?}");
        }
    }

    free_count
}

/// Floyd's cycle-detection algorithm (tortoise and hare) applied to each free
/// list in turn. Must run, and must find nothing, before any other free-list
/// traversal runs, since any other traversal would infinite-loop on a cycle.
fn detect_cycle<E: HeapExtender>(heap: &Heap<E>) -> Option<usize> {
    for class in 0..NUM_CLASSES {
        let Some(start) = heap.list_root(class) else { continue };

        let mut slow = start;
        let mut fast = start;
        loop {
            let fast_next = heap.free_next(fast);
            if fast_next == 0 {
                break;
            }
            let fast_next2 = heap.free_next(fast_next);
            if fast_next2 == 0 {
                break;
            }
            slow = heap.free_next(slow);
            fast = fast_next2;
            if slow == fast {
                return Some(class);
            }
        }
    }
    None
}

/// Walk each free list after [`detect_cycle`] has certified there is no
/// cycle to loop on, validating spec §4.2 step 5. Returns the total number
/// of free blocks found across all lists.
fn walk_free_lists<E: HeapExtender>(
    heap: &Heap<E>,
    verbosity: Verbosity,
    violations: &mut Vec<CheckError>,
) -> usize {
    let mut total = 0;
    let mut seen = HashSet::new();

    for class in 0..NUM_CLASSES {
        let Some(root) = heap.list_root(class) else { continue };

        if heap.free_prev(root) != 0 {
            violations.push(CheckError::RootHasPrev { class });
        }

        let mut cursor = Some(root);
        let mut prev_offset = 0usize;
        while let Some(offset) = cursor {
            if !seen.insert(offset) {
                // Already part of a cycle-free walk of another class list;
                // detect_cycle ran first, so reaching here twice means the
                // same block is linked into two lists, a distinct bug from a
                // cycle but still worth surfacing as a back-link break.
                violations.push(CheckError::BrokenBackLink { class, offset });
                break;
            }

            let tag = heap.tag_at(offset);
            if tag.is_allocated() {
                violations.push(CheckError::ListedBlockNotFree { offset });
            }
            if offset % ALIGNMENT != 0 {
                violations.push(CheckError::Misaligned { offset, alignment: ALIGNMENT });
            }
            if block::class_of(tag.size()) != class {
                violations.push(CheckError::WrongClass { offset, size: tag.size(), class });
            }
            if prev_offset != 0 && heap.free_prev(offset) != prev_offset {
                violations.push(CheckError::BrokenBackLink { class, offset });
            }

            let prev_free = heap.prev_block_offset(offset).is_some_and(|p| heap.tag_at(p).is_free());
            let next_free = heap.next_block_offset(offset).is_some_and(|n| heap.tag_at(n).is_free());
            if prev_free || next_free {
                violations.push(CheckError::AdjacentFreeBlocks { offset });
            }

            if verbosity == Verbosity::Verbose {
                log::debug!("free-list walk: class {class}, block at {offset}");
            }

            total += 1;
            prev_offset = offset;
            let next = heap.free_next(offset);
            cursor = (next != 0).then_some(next);
        }
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::heap::Unbounded;

    #[test]
    fn clean_heap_passes() {
        let mut heap = Heap::new(Unbounded);
        let off = heap.extend(4096).unwrap();
        heap.place(off, 32);
        check_heap(&heap, Verbosity::Quiet);
    }

    #[test]
    fn clean_heap_after_alloc_and_free_passes() {
        let mut heap = Heap::new(Unbounded);
        let off = heap.extend(4096).unwrap();
        let a = heap.place(off, 32);
        heap.free_block(a);
        check_heap(&heap, Verbosity::Verbose);
    }

    #[test]
    #[should_panic(expected = "invariant violation")]
    fn induced_cycle_is_detected_and_aborts() {
        let mut heap = Heap::new(Unbounded);
        let off = heap.extend(4096).unwrap();
        let a = heap.place(off, 32);
        let b = heap.place(heap.next_block_offset(a).unwrap(), 32);
        let c = heap.place(heap.next_block_offset(b).unwrap(), 32);
        heap.free_block(a);
        heap.free_block(b);
        heap.free_block(c);

        // `a`, `b`, `c` just got coalesced into one free block; find three
        // distinct free blocks to wire into a cycle by allocating fresh ones.
        let off2 = heap.extend(4096).unwrap();
        let x = heap.place(off2, 32);
        let y = heap.place(heap.next_block_offset(x).unwrap(), 32);
        let z = heap.place(heap.next_block_offset(y).unwrap(), 32);
        heap.free_block(x);
        heap.free_block(y);
        heap.free_block(z);

        // At this point x/y/z have also merged into one block (both
        // neighbors free by construction). Corrupt that single free block's
        // own next-link to point at itself, inducing a 1-node cycle.
        let class = block::class_of(heap.tag_at(x).size());
        let root = heap.list_root(class).unwrap();
        heap.corrupt_free_next_for_test(root, root);

        check_heap(&heap, Verbosity::Quiet);
    }
}
