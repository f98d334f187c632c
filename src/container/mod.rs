//! Particle containers
//!
//! A container owns the particles of one subdomain and knows how to run a
//! pairwise interaction step over them. The operations exposed upward are
//! deliberately small: insert owned and halo particles, purge and return the
//! particles that left the box, visit particles (optionally region-bound),
//! and `iterate_pairwise` with a selected [`TraversalPlan`].
//!
//! Iteration is closure-based visitation: the references handed to the
//! closure are valid for that call only, and a structural mutation through
//! any other entry point invalidates nothing the caller could still hold.

use crate::particle::{Ownership, Particle};
use crate::traversal::TraversalKind;
use crate::V3;

mod direct_sum;
mod linked_cells;

pub use direct_sum::DirectSum;
pub use linked_cells::LinkedCells;

/// Which ownership classes a visitation pass yields.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IteratorBehavior {
    /// Only particles owned by this container.
    OwnedOnly,
    /// Only halo copies.
    HaloOnly,
    /// Owned and halo particles (never dummies).
    OwnedAndHalo,
}

impl IteratorBehavior {
    /// Whether a particle with ownership `o` is yielded.
    #[inline]
    pub fn accepts(&self, o: Ownership) -> bool {
        match self {
            IteratorBehavior::OwnedOnly => o == Ownership::Owned,
            IteratorBehavior::HaloOnly => o == Ownership::Halo,
            IteratorBehavior::OwnedAndHalo => o != Ownership::Dummy,
        }
    }
}

/// Errors surfaced by container entry points.
///
/// `TraversalNotApplicable` is recoverable (the driver may re-tune);
/// `InvariantViolation` is fatal: the engine's internal state can no longer
/// be trusted and must be rebuilt from scratch.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The selected combination fails applicability on this container.
    #[error("traversal {kind:?} not applicable: {reason}")]
    TraversalNotApplicable {
        /// The rejected traversal.
        kind: TraversalKind,
        /// Why it was rejected.
        reason: String,
    },
    /// An owned particle was inserted outside the container's box.
    #[error("owned particle {id} at {position:?} is outside the container box")]
    OutOfDomain {
        /// Particle id.
        id: u64,
        /// Offending position.
        position: V3,
    },
    /// Internal consistency failure. Fatal.
    #[error("engine invariant violated: {0}")]
    InvariantViolation(String),
}

/// Operations every container exposes upward.
pub trait ParticleContainer<P: Particle> {
    /// Insert an owned particle. It must lie inside the box.
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError>;

    /// Insert a halo copy, or update the existing copy with the same id.
    fn add_or_update_halo_particle(&mut self, p: P);

    /// Purge particles that left the box and return them, together with a
    /// flag telling whether structural changes require a neighbor-list
    /// rebuild.
    fn update_container(&mut self) -> (Vec<P>, bool);

    /// Number of stored particles (owned + halo).
    fn num_particles(&self) -> usize;

    /// Visit all particles matching `behavior`.
    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P));

    /// Visit particles inside `[min, max]` (component-wise, inclusive)
    /// matching `behavior`.
    fn for_each_in_region(
        &mut self,
        min: V3,
        max: V3,
        behavior: IteratorBehavior,
        f: &mut dyn FnMut(&mut P),
    );
}

/// Enforce the functor's Newton-3 capability against the selected mode.
pub(crate) fn check_functor_mode<P, F>(
    functor: &F,
    newton3: bool,
    kind: TraversalKind,
) -> Result<(), ContainerError>
where
    P: Particle,
    F: crate::functor::Functor<P>,
{
    if newton3 && !functor.allows_newton3() {
        return Err(ContainerError::TraversalNotApplicable {
            kind,
            reason: "functor does not allow newton3".into(),
        });
    }
    if !newton3 && !functor.allows_non_newton3() {
        return Err(ContainerError::TraversalNotApplicable {
            kind,
            reason: "functor does not allow non-newton3".into(),
        });
    }
    Ok(())
}

/// Component-wise inclusive box membership used by region visitation.
#[inline]
pub(crate) fn in_region(r: V3, min: V3, max: V3) -> bool {
    (0..3).all(|d| r[d] >= min[d] && r[d] <= max[d])
}
