//! Particle cells
//!
//! A cell owns the particles that currently fall into one box of the grid and
//! carries a side-car [`SoaBuffer`] that SoA traversals refill. Two storage
//! schemes implement the same contract:
//!
//! - [`FullCell`] keeps whole particles and hands out real references.
//! - [`RmmCell`] (reduced memory mode) keeps only positions and forces and
//!   materializes a particle value on access, writing the mutated position
//!   and force back afterwards.
//!
//! Access is **closure-based visitation**: a lazy, non-restartable pass over a
//! borrowed cell. References handed to the closures are valid only inside the
//! call; any structural mutation (add / clear / swap-delete) invalidates the
//! side-car SoA buffer.

use crate::particle::{Attr, Particle};
use crate::soa::{self, SoaBuffer};
use crate::V3;

/// Contract every cell storage scheme satisfies.
pub trait ParticleCell<P: Particle>: Send {
    /// Fresh empty cell; the side length is fixed for the cell's lifetime and
    /// carried for geometry.
    fn new(cell_length: V3) -> Self;

    /// Side lengths of this cell's box.
    fn cell_length(&self) -> V3;

    /// Number of stored particles.
    fn len(&self) -> usize;

    /// Whether the cell is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a particle by copy.
    fn add(&mut self, p: P);

    /// Remove all particles.
    fn clear(&mut self);

    /// Delete the particle at `index` by swapping the last one into its slot
    /// and popping. Returns the removed particle.
    fn swap_delete(&mut self, index: usize) -> P;

    /// Read-only visit of one particle.
    fn read<R>(&self, index: usize, f: impl FnOnce(&P) -> R) -> R;

    /// Mutating visit of one particle.
    fn with_particle<R>(&mut self, index: usize, f: impl FnOnce(&mut P) -> R) -> R;

    /// Mutating visit of two distinct particles, passed in argument order
    /// `(index_i, index_j)` regardless of which index is smaller.
    fn with_pair<R>(&mut self, i: usize, j: usize, f: impl FnOnce(&mut P, &mut P) -> R) -> R;

    /// Visit every particle mutably, in storage order.
    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut P));

    /// The side-car SoA buffer.
    fn soa_mut(&mut self) -> &mut SoaBuffer;

    /// Refill the side-car buffer with the declared columns.
    fn load_soa(&mut self, attrs: &[Attr]);

    /// Write the declared (computed) columns of the side-car back.
    fn extract_soa(&mut self, attrs: &[Attr]);

    /// Gather the declared columns into an external buffer at `offset`
    /// (global-buffer concatenation).
    fn gather_into(&self, soa: &mut SoaBuffer, offset: usize, attrs: &[Attr]);

    /// Scatter the declared columns back from an external buffer at `offset`.
    fn scatter_from(&mut self, soa: &SoaBuffer, offset: usize, attrs: &[Attr]);
}

// ============================================================================
// Full cell: whole particles
// ============================================================================

/// Cell keeping all particle attributes.
#[derive(Debug, Clone)]
pub struct FullCell<P> {
    particles: Vec<P>,
    soa: SoaBuffer,
    cell_length: V3,
}

impl<P: Particle> FullCell<P> {
    /// Borrow the stored particles.
    pub fn particles(&self) -> &[P] {
        &self.particles
    }

    /// Borrow the stored particles mutably.
    pub fn particles_mut(&mut self) -> &mut [P] {
        &mut self.particles
    }
}

impl<P: Particle> ParticleCell<P> for FullCell<P> {
    fn new(cell_length: V3) -> Self {
        Self { particles: Vec::new(), soa: SoaBuffer::default(), cell_length }
    }

    fn cell_length(&self) -> V3 {
        self.cell_length
    }

    fn len(&self) -> usize {
        self.particles.len()
    }

    fn add(&mut self, p: P) {
        self.particles.push(p);
    }

    fn clear(&mut self) {
        self.particles.clear();
        self.soa.clear();
    }

    fn swap_delete(&mut self, index: usize) -> P {
        self.soa.clear();
        self.particles.swap_remove(index)
    }

    fn read<R>(&self, index: usize, f: impl FnOnce(&P) -> R) -> R {
        f(&self.particles[index])
    }

    fn with_particle<R>(&mut self, index: usize, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.particles[index])
    }

    fn with_pair<R>(&mut self, i: usize, j: usize, f: impl FnOnce(&mut P, &mut P) -> R) -> R {
        assert_ne!(i, j, "pair visit requires two distinct particles");
        let (lo, hi) = if i < j { (i, j) } else { (j, i) };
        let (head, tail) = self.particles.split_at_mut(hi);
        let (a, b) = (&mut head[lo], &mut tail[0]);
        if i < j {
            f(a, b)
        } else {
            f(b, a)
        }
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut P)) {
        for p in &mut self.particles {
            f(p);
        }
    }

    fn soa_mut(&mut self) -> &mut SoaBuffer {
        &mut self.soa
    }

    fn load_soa(&mut self, attrs: &[Attr]) {
        let n = self.particles.len();
        self.soa.clear();
        self.soa.resize(n);
        soa::gather(&self.particles, &mut self.soa, 0, attrs);
    }

    fn extract_soa(&mut self, attrs: &[Attr]) {
        soa::scatter(&mut self.particles, &self.soa, 0, attrs);
    }

    fn gather_into(&self, soa: &mut SoaBuffer, offset: usize, attrs: &[Attr]) {
        soa::gather(&self.particles, soa, offset, attrs);
    }

    fn scatter_from(&mut self, soa: &SoaBuffer, offset: usize, attrs: &[Attr]) {
        soa::scatter(&mut self.particles, soa, offset, attrs);
    }
}

// ============================================================================
// Reduced-memory-mode cell: positions and forces only
// ============================================================================

/// Cell keeping only positions and forces.
///
/// Ids and ownership are not stored; accessed particles are materialized from
/// `P::default()` with position and force patched in, and both are written
/// back after a mutating visit. Suited to memory-bound runs where the functor
/// consumes geometry only.
#[derive(Debug, Clone)]
pub struct RmmCell<P> {
    r: Vec<V3>,
    f: Vec<V3>,
    soa: SoaBuffer,
    cell_length: V3,
    _marker: std::marker::PhantomData<P>,
}

impl<P: Particle + Default> RmmCell<P> {
    fn materialize(&self, index: usize) -> P {
        let mut p = P::default();
        p.set_position(self.r[index]);
        p.set_force(self.f[index]);
        p
    }

    fn write_back(&mut self, index: usize, p: &P) {
        self.r[index] = p.position();
        self.f[index] = p.force();
    }
}

impl<P: Particle + Default> ParticleCell<P> for RmmCell<P> {
    fn new(cell_length: V3) -> Self {
        Self {
            r: Vec::new(),
            f: Vec::new(),
            soa: SoaBuffer::default(),
            cell_length,
            _marker: std::marker::PhantomData,
        }
    }

    fn cell_length(&self) -> V3 {
        self.cell_length
    }

    fn len(&self) -> usize {
        self.r.len()
    }

    fn add(&mut self, p: P) {
        self.r.push(p.position());
        self.f.push(p.force());
    }

    fn clear(&mut self) {
        self.r.clear();
        self.f.clear();
        self.soa.clear();
    }

    fn swap_delete(&mut self, index: usize) -> P {
        let out = self.materialize(index);
        self.soa.clear();
        self.r.swap_remove(index);
        self.f.swap_remove(index);
        out
    }

    fn read<R>(&self, index: usize, f: impl FnOnce(&P) -> R) -> R {
        f(&self.materialize(index))
    }

    fn with_particle<R>(&mut self, index: usize, f: impl FnOnce(&mut P) -> R) -> R {
        let mut p = self.materialize(index);
        let out = f(&mut p);
        self.write_back(index, &p);
        out
    }

    fn with_pair<R>(&mut self, i: usize, j: usize, f: impl FnOnce(&mut P, &mut P) -> R) -> R {
        assert_ne!(i, j, "pair visit requires two distinct particles");
        let mut pi = self.materialize(i);
        let mut pj = self.materialize(j);
        let out = f(&mut pi, &mut pj);
        self.write_back(i, &pi);
        self.write_back(j, &pj);
        out
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut P)) {
        for index in 0..self.r.len() {
            let mut p = self.materialize(index);
            f(&mut p);
            self.write_back(index, &p);
        }
    }

    fn soa_mut(&mut self) -> &mut SoaBuffer {
        &mut self.soa
    }

    fn load_soa(&mut self, attrs: &[Attr]) {
        let n = self.r.len();
        self.soa.clear();
        self.soa.resize(n);
        for attr in attrs {
            match attr {
                Attr::PosX => {
                    for (k, r) in self.r.iter().enumerate() {
                        self.soa.x[k] = r[0];
                    }
                }
                Attr::PosY => {
                    for (k, r) in self.r.iter().enumerate() {
                        self.soa.y[k] = r[1];
                    }
                }
                Attr::PosZ => {
                    for (k, r) in self.r.iter().enumerate() {
                        self.soa.z[k] = r[2];
                    }
                }
                Attr::ForceX => {
                    for (k, f) in self.f.iter().enumerate() {
                        self.soa.fx[k] = f[0];
                    }
                }
                Attr::ForceY => {
                    for (k, f) in self.f.iter().enumerate() {
                        self.soa.fy[k] = f[1];
                    }
                }
                Attr::ForceZ => {
                    for (k, f) in self.f.iter().enumerate() {
                        self.soa.fz[k] = f[2];
                    }
                }
                // Not stored in reduced memory mode; rows keep their defaults.
                Attr::Id | Attr::Ownership => {}
            }
        }
        // Without a stored flag every slot is a live particle.
        for o in &mut self.soa.ownership {
            *o = crate::particle::Ownership::Owned;
        }
    }

    fn extract_soa(&mut self, attrs: &[Attr]) {
        for attr in attrs {
            match attr {
                Attr::ForceX => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[0] = self.soa.fx[k];
                    }
                }
                Attr::ForceY => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[1] = self.soa.fy[k];
                    }
                }
                Attr::ForceZ => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[2] = self.soa.fz[k];
                    }
                }
                _ => debug_assert!(false, "attribute {attr:?} is not writable"),
            }
        }
    }

    fn gather_into(&self, soa: &mut SoaBuffer, offset: usize, attrs: &[Attr]) {
        for attr in attrs {
            match attr {
                Attr::PosX => {
                    for (k, r) in self.r.iter().enumerate() {
                        soa.x[offset + k] = r[0];
                    }
                }
                Attr::PosY => {
                    for (k, r) in self.r.iter().enumerate() {
                        soa.y[offset + k] = r[1];
                    }
                }
                Attr::PosZ => {
                    for (k, r) in self.r.iter().enumerate() {
                        soa.z[offset + k] = r[2];
                    }
                }
                Attr::ForceX => {
                    for (k, f) in self.f.iter().enumerate() {
                        soa.fx[offset + k] = f[0];
                    }
                }
                Attr::ForceY => {
                    for (k, f) in self.f.iter().enumerate() {
                        soa.fy[offset + k] = f[1];
                    }
                }
                Attr::ForceZ => {
                    for (k, f) in self.f.iter().enumerate() {
                        soa.fz[offset + k] = f[2];
                    }
                }
                Attr::Id | Attr::Ownership => {
                    for k in 0..self.r.len() {
                        soa.ownership[offset + k] = crate::particle::Ownership::Owned;
                    }
                }
            }
        }
    }

    fn scatter_from(&mut self, soa: &SoaBuffer, offset: usize, attrs: &[Attr]) {
        for attr in attrs {
            match attr {
                Attr::ForceX => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[0] = soa.fx[offset + k];
                    }
                }
                Attr::ForceY => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[1] = soa.fy[offset + k];
                    }
                }
                Attr::ForceZ => {
                    for (k, f) in self.f.iter_mut().enumerate() {
                        f[2] = soa.fz[offset + k];
                    }
                }
                _ => debug_assert!(false, "attribute {attr:?} is not writable"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::{Ownership, PointParticle};

    #[test]
    fn full_cell_swap_delete_keeps_last() {
        let mut c: FullCell<PointParticle> = FullCell::new([1.0; 3]);
        for id in 0..4 {
            c.add(PointParticle::new([id as f64, 0.0, 0.0], id));
        }
        let gone = c.swap_delete(1);
        assert_eq!(gone.id, 1);
        assert_eq!(c.len(), 3);
        // The former last particle now sits at index 1.
        assert_eq!(c.read(1, |p| p.id), 3);
    }

    #[test]
    fn full_cell_pair_visit_is_argument_ordered() {
        let mut c: FullCell<PointParticle> = FullCell::new([1.0; 3]);
        c.add(PointParticle::new([0.0; 3], 10));
        c.add(PointParticle::new([1.0; 3], 20));
        let (a, b) = c.with_pair(1, 0, |i, j| (i.id, j.id));
        assert_eq!((a, b), (20, 10));
    }

    #[test]
    fn rmm_cell_round_trips_position_and_force() {
        let mut c: RmmCell<PointParticle> = RmmCell::new([1.0; 3]);
        c.add(PointParticle::new([1.0, 2.0, 3.0], 42));
        c.with_particle(0, |p| {
            p.add_force([0.5, 0.0, -0.5]);
            p.set_position([9.0, 9.0, 9.0]);
        });
        assert_eq!(c.read(0, |p| (p.position(), p.force())), ([9.0, 9.0, 9.0], [0.5, 0.0, -0.5]));
        // Ids are not retained in reduced memory mode.
        assert_eq!(c.read(0, |p| p.id()), 0);
    }

    #[test]
    fn rmm_cell_soa_ownership_defaults_to_owned() {
        let mut c: RmmCell<PointParticle> = RmmCell::new([1.0; 3]);
        c.add(PointParticle::new([0.0; 3], 1));
        c.load_soa(&[Attr::PosX, Attr::PosY, Attr::PosZ]);
        assert_eq!(c.soa_mut().ownership[0], Ownership::Owned);
    }
}
