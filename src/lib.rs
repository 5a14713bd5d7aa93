//! `labcore`: two small, independent systems-programming exercises bundled
//! into one crate.
//!
//! - [`alloc`] is a segregated free-list heap allocator: boundary-tag block
//!   layout, 13 size-class free lists, first-fit placement, split-on-place
//!   and immediate bidirectional coalescing, plus a structural heap checker.
//! - [`cache`] is a bounded-capacity LRU object cache built for a
//!   multi-threaded caching HTTP/1.0 forward proxy: reader-preferring
//!   concurrent access over an intrusive MRU-ordered entry list.
//!
//! The two modules share no code; they are grouped here because both come
//! out of the same systems-programming coursework lineage (a malloc lab and
//! a concurrent proxy lab), not because one depends on the other.

pub mod alloc;
pub mod cache;
