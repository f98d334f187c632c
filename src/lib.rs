//! Crate root: public surface, core aliases, and engine-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the scalar and vector aliases, the shared error
//! categories, and re-exports the submodules that implement the pair-iteration
//! engine.
//!
//! ## Invariants (engine-wide)
//!
//! - **Pair coverage.** For every particle pair closer than the cutoff at the
//!   start of an interaction step, the driven functor is invoked on that pair
//!   exactly once when Newton-3 reciprocity is exploited, and exactly twice
//!   (once per ordering) when it is not — regardless of which container,
//!   traversal and data layout were selected.
//! - **Race freedom without unsafe.** We **forbid unsafe** throughout the
//!   crate. Parallel force writes go through cell- or slot-granular locks
//!   whose contention is eliminated by the coloring and slicing schemes; a
//!   poisoned lock is an engine invariant violation and is fatal.
//! - **Candidate soundness.** Neighbor lists built with a skin radius remain a
//!   sound over-approximation of the true interaction pairs for as long as no
//!   particle has moved farther than half the skin since the build.
//!
//! These invariants are enforced across the submodules. If any is violated at
//! runtime, the failure mode is a **precise error** (never UB).

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Small 3-vector helpers and lexicographic 3D index arithmetic.
pub mod geometry;
/// Particle capability trait, ownership states, SoA attribute enumeration.
pub mod particle;
/// Columnar particle storage and attribute-driven gather/scatter.
pub mod soa;
/// Particle cells: full storage and reduced-memory-mode storage.
pub mod cell;
/// Domain-to-grid mapping with halo layer and border flags.
pub mod cell_block;
/// The functor seam the engine drives, plus per-thread scalar accumulators.
pub mod functor;
/// Reference functors used by the test-suite (Lennard-Jones, pair counting).
pub mod functors;
/// Pair enumeration inside one cell and between two cells.
pub mod cell_functor;
/// Coloring and slicing traversal schemes over the linked-cell grid.
pub mod traversal;
/// Particle containers (direct sum, linked cells) and the container seam.
pub mod container;
/// Verlet neighbor lists, cell-pair lists and cluster lists.
pub mod verlet;
/// Container/traversal/layout/N3 configuration space and applicability.
pub mod selector;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// Scalar type used for all coordinates, distances and accumulated globals.
pub type Real = f64;

/// A point or displacement in 3-space.
pub type V3 = [Real; 3];

pub use crate::cell::{FullCell, ParticleCell, RmmCell};
pub use crate::cell_block::{CellBlock, CellBorderAndFlagManager, GridError};
pub use crate::container::{ContainerError, IteratorBehavior, ParticleContainer};
pub use crate::container::{DirectSum, LinkedCells};
pub use crate::functor::{DataLayout, Functor, FunctorError, Scalars};
pub use crate::particle::{Attr, Ownership, Particle, PointParticle};
pub use crate::selector::{
    Configuration, ContainerKind, Newton3Mode, SelectorError, TraversalPlan,
};
pub use crate::soa::SoaBuffer;
pub use crate::traversal::TraversalKind;
pub use crate::verlet::{
    ParticleHandle, VerletClusterLists, VerletLists, VerletListsCells,
};
