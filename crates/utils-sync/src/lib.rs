#![no_std]

//! Concurrency primitives shared by the Pulse runtime crates.
//!
//! Everything in this crate is runtime-agnostic: the [`gsnzi`] tree reports
//! zero/non-zero transitions and hands back an opaque annotation word, and
//! the [`bag`] collects pointer-sized items until it is sealed. Wiring those
//! transitions to an actual scheduler (releasing a vertex, draining an
//! outset) happens in `pulse-runtime`.

extern crate alloc;

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod backoff;
pub mod bag;
pub mod gsnzi;
pub mod pad;
pub mod tagged;

pub use pad::CachePadded;
