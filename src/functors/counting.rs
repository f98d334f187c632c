//! Pair-visit recording functor
//!
//! Records every (id_i, id_j) ordered pair a traversal feeds it, together
//! with the squared distance at visit time. This is the instrument behind
//! the coverage invariants: with Newton-3 each in-range unordered pair must
//! appear exactly once (in either order), without it exactly twice (once per
//! ordering), and nothing farther than the candidate radius may ever appear.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::functor::Functor;
use crate::geometry;
use crate::particle::{Attr, Particle};
use crate::soa::{SoaBuffer, SoaView};
use crate::Real;

const NEEDED: &[Attr] =
    &[Attr::PosX, Attr::PosY, Attr::PosZ, Attr::Id, Attr::Ownership];
const COMPUTED: &[Attr] = &[];

/// One recorded kernel visit.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Visit {
    /// Id of the first-argument particle.
    pub i: u64,
    /// Id of the second-argument particle.
    pub j: u64,
    /// Squared distance at visit time.
    pub r2: Real,
}

/// Functor that records visits instead of computing forces.
#[derive(Debug)]
pub struct PairCounter {
    record_radius2: Real,
    visits: Mutex<Vec<Visit>>,
    soa_single_calls: AtomicUsize,
    soa_pair_calls: AtomicUsize,
}

impl PairCounter {
    /// Record every visit within `record_radius` (pass `f64::INFINITY` to
    /// record everything the engine feeds the functor).
    pub fn new(record_radius: Real) -> Self {
        Self {
            record_radius2: record_radius * record_radius,
            visits: Mutex::new(Vec::new()),
            soa_single_calls: AtomicUsize::new(0),
            soa_pair_calls: AtomicUsize::new(0),
        }
    }

    /// How often the single-buffer SoA entry point ran.
    pub fn soa_single_calls(&self) -> usize {
        self.soa_single_calls.load(Ordering::Relaxed)
    }

    /// How often the two-buffer SoA entry point ran.
    pub fn soa_pair_calls(&self) -> usize {
        self.soa_pair_calls.load(Ordering::Relaxed)
    }

    #[inline]
    fn record(&self, i: u64, j: u64, r2: Real) {
        if r2 <= self.record_radius2 && i != u64::MAX && j != u64::MAX {
            self.visits.lock().expect("visit log poisoned").push(Visit { i, j, r2 });
        }
    }

    /// All recorded visits, in no particular order.
    pub fn visits(&self) -> Vec<Visit> {
        self.visits.lock().expect("visit log poisoned").clone()
    }

    /// Visit count per ordered pair.
    pub fn ordered_counts(&self) -> HashMap<(u64, u64), usize> {
        let mut out = HashMap::new();
        for v in self.visits().iter() {
            *out.entry((v.i, v.j)).or_insert(0) += 1;
        }
        out
    }

    /// Visit count per unordered pair (key sorted ascending).
    pub fn unordered_counts(&self) -> HashMap<(u64, u64), usize> {
        let mut out = HashMap::new();
        for v in self.visits().iter() {
            let key = (v.i.min(v.j), v.i.max(v.j));
            *out.entry(key).or_insert(0) += 1;
        }
        out
    }

    /// Largest squared distance seen.
    pub fn max_r2(&self) -> Real {
        self.visits().iter().map(|v| v.r2).fold(0.0, Real::max)
    }

    /// Drop all recorded visits and call counts.
    pub fn clear(&self) {
        self.visits.lock().expect("visit log poisoned").clear();
        self.soa_single_calls.store(0, Ordering::Relaxed);
        self.soa_pair_calls.store(0, Ordering::Relaxed);
    }
}

impl<P: Particle> Functor<P> for PairCounter {
    fn aos(&self, i: &mut P, j: &mut P, _newton3: bool) {
        if i.is_dummy() || j.is_dummy() {
            return;
        }
        let r2 = geometry::norm2(geometry::sub(i.position(), j.position()));
        self.record(i.id(), j.id(), r2);
    }

    fn soa_single(&self, soa: SoaView<'_>, newton3: bool) {
        self.soa_single_calls.fetch_add(1, Ordering::Relaxed);
        let n = soa.len();
        for i in 0..n {
            let j_start = if newton3 { i + 1 } else { 0 };
            for j in j_start..n {
                if i == j || soa.ownership[i].is_dummy_flag() || soa.ownership[j].is_dummy_flag() {
                    continue;
                }
                let r2 = geometry::norm2(geometry::sub(soa.position(i), soa.position(j)));
                self.record(soa.id[i], soa.id[j], r2);
            }
        }
    }

    fn soa_pair(
        &self,
        a: SoaView<'_>,
        b: SoaView<'_>,
        _newton3: bool,
        _r_hat: Option<crate::V3>,
    ) {
        self.soa_pair_calls.fetch_add(1, Ordering::Relaxed);
        for i in 0..a.len() {
            for j in 0..b.len() {
                if a.ownership[i].is_dummy_flag() || b.ownership[j].is_dummy_flag() {
                    continue;
                }
                let r2 = geometry::norm2(geometry::sub(a.position(i), b.position(j)));
                self.record(a.id[i], b.id[j], r2);
            }
        }
    }

    fn soa_verlet(
        &self,
        soa: &mut SoaBuffer,
        neighbors: &[Vec<u32>],
        rows: Range<usize>,
        _newton3: bool,
    ) {
        for i in rows {
            for &j in &neighbors[i] {
                let j = j as usize;
                if soa.ownership[i].is_dummy_flag() || soa.ownership[j].is_dummy_flag() {
                    continue;
                }
                let r2 = geometry::norm2(geometry::sub(soa.position(i), soa.position(j)));
                self.record(soa.id[i], soa.id[j], r2);
            }
        }
    }

    fn init_traversal(&mut self) {
        self.clear();
    }

    fn is_relevant_for_tuning(&self) -> bool {
        false
    }

    fn needed_attrs(&self) -> &'static [Attr] {
        NEEDED
    }

    fn computed_attrs(&self) -> &'static [Attr] {
        COMPUTED
    }
}

/// Small helper so SoA kernels can test the flag column directly.
trait DummyFlag {
    fn is_dummy_flag(&self) -> bool;
}

impl DummyFlag for crate::particle::Ownership {
    #[inline]
    fn is_dummy_flag(&self) -> bool {
        matches!(self, crate::particle::Ownership::Dummy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::PointParticle;

    #[test]
    fn aos_visits_are_recorded_with_distance() {
        let c = PairCounter::new(f64::INFINITY);
        let mut a = PointParticle::new([0.0; 3], 1);
        let mut b = PointParticle::new([3.0, 0.0, 0.0], 2);
        c.aos(&mut a, &mut b, true);
        c.aos(&mut b, &mut a, false);
        let counts = c.ordered_counts();
        assert_eq!(counts[&(1, 2)], 1);
        assert_eq!(counts[&(2, 1)], 1);
        assert!((c.max_r2() - 9.0).abs() < 1e-12);
    }

    #[test]
    fn probe_radius_filters_far_pairs() {
        let c = PairCounter::new(1.0);
        let mut a = PointParticle::new([0.0; 3], 1);
        let mut b = PointParticle::new([3.0, 0.0, 0.0], 2);
        c.aos(&mut a, &mut b, true);
        assert!(c.visits().is_empty());
    }

    #[test]
    fn dummies_are_never_recorded() {
        let c = PairCounter::new(f64::INFINITY);
        let mut a = PointParticle::new([0.0; 3], 1);
        let mut d = PointParticle::dummy([0.1, 0.0, 0.0]);
        c.aos(&mut a, &mut d, true);
        assert!(c.visits().is_empty());
    }
}
