//! Truncated-and-shifted Lennard-Jones pair functor
//!
//! The 12-6 potential with a hard cutoff and a constant energy shift. The
//! interaction parameters live on the functor instance — never in static
//! state — so concurrent tuning runs can drive differently parameterized
//! copies side by side.
//!
//! Global scalars follow the ownership-weighted convention: each kernel
//! invocation contributes `(owned_i + owned_j) / 2` of the pair's potential
//! and virial, so a pair split across two subdomains (owned here, halo there)
//! sums to exactly one full contribution across both sides.

use std::ops::Range;

use crate::functor::{Functor, FunctorError, Scalars, ThreadScalars};
use crate::geometry;
use crate::particle::{Attr, Ownership, Particle};
use crate::soa::{SoaBuffer, SoaView};
use crate::{Real, V3};

const NEEDED: &[Attr] = &[
    Attr::PosX,
    Attr::PosY,
    Attr::PosZ,
    Attr::ForceX,
    Attr::ForceY,
    Attr::ForceZ,
    Attr::Ownership,
];
const COMPUTED: &[Attr] = &[Attr::ForceX, Attr::ForceY, Attr::ForceZ];

/// Lennard-Jones 12-6 functor with cutoff and energy shift.
#[derive(Debug)]
pub struct LennardJones {
    cutoff2: Real,
    epsilon24: Real,
    epsilon4: Real,
    sigma6: Real,
    shift: Real,
    scalars: ThreadScalars,
    processed: bool,
    order_violation: bool,
    reduced: Scalars,
}

impl LennardJones {
    /// New functor; `shift` is added to every in-range pair's potential.
    pub fn new(cutoff: Real, epsilon: Real, sigma: Real, shift: Real) -> Self {
        let sigma2 = sigma * sigma;
        Self {
            cutoff2: cutoff * cutoff,
            epsilon24: 24.0 * epsilon,
            epsilon4: 4.0 * epsilon,
            sigma6: sigma2 * sigma2 * sigma2,
            shift,
            scalars: ThreadScalars::new(),
            processed: false,
            order_violation: false,
            reduced: Scalars::default(),
        }
    }

    /// Force on `i`, pair potential and pair virial for displacement
    /// `dr = r_i - r_j`, or `None` beyond the cutoff (or at zero distance,
    /// which only coinciding dummy padding produces).
    #[inline]
    fn kernel(&self, dr: V3) -> Option<(V3, Real, Real)> {
        let r2 = geometry::norm2(dr);
        if r2 > self.cutoff2 || r2 == 0.0 {
            return None;
        }
        let inv2 = 1.0 / r2;
        let lj6 = self.sigma6 * inv2 * inv2 * inv2;
        let lj12 = lj6 * lj6;
        let fac = self.epsilon24 * (2.0 * lj12 - lj6) * inv2;
        let f = geometry::scale(dr, fac);
        let upot = self.epsilon4 * (lj12 - lj6) + self.shift;
        let virial = geometry::dot(f, dr);
        Some((f, upot, virial))
    }

    #[inline]
    fn weight(oi: Ownership, oj: Ownership) -> Real {
        let w = |o: Ownership| if o == Ownership::Owned { 0.5 } else { 0.0 };
        w(oi) + w(oj)
    }

    fn check_processed(&self) -> Result<(), FunctorError> {
        if self.order_violation {
            return Err(FunctorError::PostProcessingOrder(
                "end_traversal called twice without init_traversal",
            ));
        }
        if !self.processed {
            return Err(FunctorError::PostProcessingOrder(
                "globals accessed before end_traversal",
            ));
        }
        Ok(())
    }

    /// Total potential energy of the last traversal.
    pub fn potential_energy(&self) -> Result<Real, FunctorError> {
        self.check_processed()?;
        Ok(self.reduced.potential)
    }

    /// Total virial of the last traversal.
    pub fn virial(&self) -> Result<Real, FunctorError> {
        self.check_processed()?;
        Ok(self.reduced.virial)
    }
}

impl<P: Particle> Functor<P> for LennardJones {
    fn aos(&self, i: &mut P, j: &mut P, newton3: bool) {
        let Some((f, upot, virial)) = self.kernel(geometry::sub(i.position(), j.position()))
        else {
            return;
        };
        i.add_force(f);
        if newton3 {
            j.sub_force(f);
        }
        let w = Self::weight(i.ownership(), j.ownership());
        if w > 0.0 {
            self.scalars.add(w * upot, w * virial);
        }
    }

    fn soa_single(&self, mut soa: SoaView<'_>, newton3: bool) {
        let n = soa.len();
        if newton3 {
            for i in 0..n {
                for j in (i + 1)..n {
                    let Some((f, upot, virial)) =
                        self.kernel(geometry::sub(soa.position(i), soa.position(j)))
                    else {
                        continue;
                    };
                    soa.add_force(i, f);
                    soa.sub_force(j, f);
                    let w = Self::weight(soa.ownership[i], soa.ownership[j]);
                    if w > 0.0 {
                        self.scalars.add(w * upot, w * virial);
                    }
                }
            }
        } else {
            for i in 0..n {
                for j in 0..n {
                    if i == j {
                        continue;
                    }
                    let Some((f, upot, virial)) =
                        self.kernel(geometry::sub(soa.position(i), soa.position(j)))
                    else {
                        continue;
                    };
                    soa.add_force(i, f);
                    let w = Self::weight(soa.ownership[i], soa.ownership[j]);
                    if w > 0.0 {
                        self.scalars.add(w * upot, w * virial);
                    }
                }
            }
        }
    }

    fn soa_pair(&self, mut a: SoaView<'_>, mut b: SoaView<'_>, newton3: bool, _r_hat: Option<V3>) {
        for i in 0..a.len() {
            for j in 0..b.len() {
                let Some((f, upot, virial)) =
                    self.kernel(geometry::sub(a.position(i), b.position(j)))
                else {
                    continue;
                };
                a.add_force(i, f);
                if newton3 {
                    b.sub_force(j, f);
                }
                let w = Self::weight(a.ownership[i], b.ownership[j]);
                if w > 0.0 {
                    self.scalars.add(w * upot, w * virial);
                }
            }
        }
    }

    fn soa_verlet(
        &self,
        soa: &mut SoaBuffer,
        neighbors: &[Vec<u32>],
        rows: Range<usize>,
        newton3: bool,
    ) {
        for i in rows {
            for &j in &neighbors[i] {
                let j = j as usize;
                let Some((f, upot, virial)) =
                    self.kernel(geometry::sub(soa.position(i), soa.position(j)))
                else {
                    continue;
                };
                soa.fx[i] += f[0];
                soa.fy[i] += f[1];
                soa.fz[i] += f[2];
                if newton3 {
                    soa.fx[j] -= f[0];
                    soa.fy[j] -= f[1];
                    soa.fz[j] -= f[2];
                }
                let w = Self::weight(soa.ownership[i], soa.ownership[j]);
                if w > 0.0 {
                    self.scalars.add(w * upot, w * virial);
                }
            }
        }
    }

    fn init_traversal(&mut self) {
        self.scalars.reset();
        self.processed = false;
        self.order_violation = false;
        self.reduced = Scalars::default();
    }

    fn end_traversal(&mut self, newton3: bool) {
        if self.processed {
            self.order_violation = true;
            return;
        }
        self.processed = true;
        let mut s = self.scalars.reduce();
        if !newton3 {
            // Every pair was visited in both orderings.
            s.potential *= 0.5;
            s.virial *= 0.5;
        }
        self.reduced = s;
    }

    fn needed_attrs(&self) -> &'static [Attr] {
        NEEDED
    }

    fn computed_attrs(&self) -> &'static [Attr] {
        COMPUTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::PointParticle;

    // At r = 0.5 with epsilon = sigma = 1: lj6 = 64, lj12 = 4096,
    // |F| = 24 * (2*4096 - 64) / 0.25 * 0.5 = 390144,
    // upot = 4 * (4096 - 64) = 16128, virial = |F| * r = 195072.
    #[test]
    fn kernel_matches_hand_values() {
        let lj = LennardJones::new(1.0, 1.0, 1.0, 0.1);
        let (f, upot, virial) = lj.kernel([0.0, 0.5, 0.0]).unwrap();
        assert!((f[1] - 390144.0).abs() < 1e-6);
        assert_eq!(f[0], 0.0);
        assert!((upot - 16128.1).abs() < 1e-9);
        assert!((virial - 195072.0).abs() < 1e-6);
    }

    #[test]
    fn kernel_is_zero_beyond_cutoff() {
        let lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
        assert!(lj.kernel([1.001, 0.0, 0.0]).is_none());
        assert!(lj.kernel([0.0; 3]).is_none());
    }

    #[test]
    fn newton3_writes_the_reaction_force() {
        let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
        let mut i = PointParticle::new([0.0, 0.0, 0.0], 0);
        let mut j = PointParticle::new([0.0, 0.5, 0.0], 1);
        Functor::<PointParticle>::init_traversal(&mut lj);
        lj.aos(&mut i, &mut j, true);
        assert!((i.force()[1] + 390144.0).abs() < 1e-6);
        assert!((j.force()[1] - 390144.0).abs() < 1e-6);
    }

    #[test]
    fn non_newton3_totals_are_halved() {
        let run = |newton3: bool| {
            let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
            let mut i = PointParticle::new([0.0, 0.0, 0.0], 0);
            let mut j = PointParticle::new([0.0, 0.5, 0.0], 1);
            Functor::<PointParticle>::init_traversal(&mut lj);
            if newton3 {
                lj.aos(&mut i, &mut j, true);
            } else {
                lj.aos(&mut i, &mut j, false);
                lj.aos(&mut j, &mut i, false);
            }
            Functor::<PointParticle>::end_traversal(&mut lj, newton3);
            lj.potential_energy().unwrap()
        };
        assert!((run(true) - run(false)).abs() < 1e-9);
    }

    #[test]
    fn post_processing_order_is_enforced() {
        let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
        Functor::<PointParticle>::init_traversal(&mut lj);
        assert!(lj.potential_energy().is_err());
        Functor::<PointParticle>::end_traversal(&mut lj, true);
        assert!(lj.potential_energy().is_ok());
        Functor::<PointParticle>::end_traversal(&mut lj, true);
        assert!(matches!(
            lj.potential_energy(),
            Err(FunctorError::PostProcessingOrder(_))
        ));
    }

    #[test]
    fn halo_pairs_contribute_half_weight() {
        let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
        let mut i = PointParticle::new([0.0, 0.0, 0.0], 0);
        let mut j = PointParticle::halo([0.0, 0.5, 0.0], 1);
        Functor::<PointParticle>::init_traversal(&mut lj);
        lj.aos(&mut i, &mut j, true);
        Functor::<PointParticle>::end_traversal(&mut lj, true);
        assert!((lj.potential_energy().unwrap() - 0.5 * 16128.0).abs() < 1e-9);
    }
}
