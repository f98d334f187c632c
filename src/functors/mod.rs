//! Reference functors
//!
//! Concrete pair functors are application territory; the two here exist so the
//! crate can exercise and test itself: [`LennardJones`] is the canonical
//! short-range interaction, [`PairCounter`] records every visited pair and is
//! the instrument behind the coverage invariants.

mod counting;
mod lj;

pub use counting::{PairCounter, Visit};
pub use lj::LennardJones;
