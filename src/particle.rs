//! Particle capability surface
//!
//! The engine never defines what a particle *is*; it only requires the small
//! capability set the traversals and the SoA gather/scatter consume: readable
//! and writable position and force, a stable id, an ownership flag, and
//! copy-by-value. Concrete particle types live with the application —
//! [`PointParticle`] here is the reference implementation the test-suite and
//! the cluster padding use.

use serde::{Deserialize, Serialize};

use crate::{geometry, Real, V3};

/// Who a particle belongs to.
///
/// - `Owned`: lives in this container's box and receives forces.
/// - `Halo`: copy of a neighbor subdomain's particle, present only so the
///   cutoff is satisfied at the local boundary; forces on it are discarded.
/// - `Dummy`: padding (cluster slots); must never contribute to physics.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ownership {
    /// Particle owned by this container.
    Owned,
    /// Boundary copy owned by a neighboring subdomain.
    Halo,
    /// Padding slot, placed far outside every cutoff sphere.
    Dummy,
}

/// Named columns of the SoA layout.
///
/// The set is compile-time fixed so gather/scatter reduces to column writes
/// with no per-particle dispatch. Functors declare which columns they read
/// (`needed_attrs`) and which they produce (`computed_attrs`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Attr {
    PosX,
    PosY,
    PosZ,
    ForceX,
    ForceY,
    ForceZ,
    Id,
    Ownership,
}

/// Capability set the engine requires of a particle type.
///
/// `Clone` covers add-by-copy into cells; `Send + Sync` let references cross
/// the parallel color phases.
pub trait Particle: Clone + Send + Sync + 'static {
    /// Current position.
    fn position(&self) -> V3;
    /// Overwrite the position.
    fn set_position(&mut self, r: V3);
    /// Current accumulated force.
    fn force(&self) -> V3;
    /// Overwrite the force.
    fn set_force(&mut self, f: V3);
    /// Stable identifier, unique per physical particle.
    fn id(&self) -> u64;
    /// Ownership flag.
    fn ownership(&self) -> Ownership;
    /// Set the ownership flag.
    fn set_ownership(&mut self, o: Ownership);

    /// Accumulate `df` onto the force.
    #[inline]
    fn add_force(&mut self, df: V3) {
        self.set_force(geometry::add(self.force(), df));
    }

    /// Subtract `df` from the force (the Newton-3 reaction write).
    #[inline]
    fn sub_force(&mut self, df: V3) {
        self.set_force(geometry::sub(self.force(), df));
    }

    /// Whether this particle may contribute to physics at all.
    #[inline]
    fn is_dummy(&self) -> bool {
        self.ownership() == Ownership::Dummy
    }
}

/// Reference particle: position, velocity, force, id, ownership.
///
/// The engine itself only consumes the [`Particle`] surface; the velocity is
/// carried for the integrating driver above.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PointParticle {
    /// Position.
    pub r: V3,
    /// Velocity (untouched by the engine).
    pub v: V3,
    /// Accumulated force.
    pub f: V3,
    /// Stable id.
    pub id: u64,
    /// Ownership flag.
    pub ownership: Ownership,
}

impl PointParticle {
    /// An owned particle at rest at `r`.
    pub fn new(r: V3, id: u64) -> Self {
        Self { r, v: [0.0; 3], f: [0.0; 3], id, ownership: Ownership::Owned }
    }

    /// A halo copy at `r`.
    pub fn halo(r: V3, id: u64) -> Self {
        Self { ownership: Ownership::Halo, ..Self::new(r, id) }
    }

    /// A dummy padding particle at `r`.
    pub fn dummy(r: V3) -> Self {
        Self { ownership: Ownership::Dummy, ..Self::new(r, u64::MAX) }
    }
}

impl Default for PointParticle {
    fn default() -> Self {
        Self::new([0.0; 3], 0)
    }
}

impl Particle for PointParticle {
    #[inline]
    fn position(&self) -> V3 {
        self.r
    }
    #[inline]
    fn set_position(&mut self, r: V3) {
        self.r = r;
    }
    #[inline]
    fn force(&self) -> V3 {
        self.f
    }
    #[inline]
    fn set_force(&mut self, f: V3) {
        self.f = f;
    }
    #[inline]
    fn id(&self) -> u64 {
        self.id
    }
    #[inline]
    fn ownership(&self) -> Ownership {
        self.ownership
    }
    #[inline]
    fn set_ownership(&mut self, o: Ownership) {
        self.ownership = o;
    }
}
