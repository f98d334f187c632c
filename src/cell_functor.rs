//! Pair enumeration over cells
//!
//! The cell functor turns "process this cell (pair)" into the right sequence
//! of functor invocations for the active `(layout, newton3)` combination. The
//! dispatch is runtime data — two tagged flags — rather than a compile-time
//! fan-out, so every traversal drives the same code paths.
//!
//! Enumeration rules:
//!
//! - AoS, Newton-3, intra-cell: each unordered pair `(i < j)` once.
//! - AoS, no Newton-3, intra-cell: each ordered pair `(i, j ≠ i)` once, i.e.
//!   each unordered pair twice.
//! - AoS, Newton-3, cell pair: every cross pair once.
//! - AoS, no Newton-3, cell pair: every cross pair in both orderings — unless
//!   the traversal is **one-sided** (c01-style), which visits every neighbor
//!   relation from the anchor side only and therefore writes only the first
//!   cell.
//! - SoA delegates to the functor's single- respectively two-buffer entry
//!   point; without Newton-3 the two-buffer form is called once per
//!   orientation (one orientation when one-sided).

use std::marker::PhantomData;

use crate::cell::ParticleCell;
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::V3;

/// Drives one functor over cells for a fixed `(layout, newton3)` combination.
pub struct CellFunctor<'f, P, F> {
    functor: &'f F,
    layout: DataLayout,
    newton3: bool,
    /// One-sided pair processing: only the first cell's particles are
    /// updated, and only the `(first, second)` orientation is visited.
    one_sided: bool,
    _marker: PhantomData<P>,
}

impl<'f, P: Particle, F: Functor<P>> CellFunctor<'f, P, F> {
    /// Bidirectional cell functor (the default for colored traversals).
    pub fn new(functor: &'f F, layout: DataLayout, newton3: bool) -> Self {
        Self { functor, layout, newton3, one_sided: false, _marker: PhantomData }
    }

    /// One-sided variant used by c01-style traversals, which visit every
    /// neighbor relation from the anchor cell and must not write neighbors.
    pub fn one_sided(functor: &'f F, layout: DataLayout) -> Self {
        Self { functor, layout, newton3: false, one_sided: true, _marker: PhantomData }
    }

    /// Whether Newton-3 reciprocity is exploited.
    pub fn newton3(&self) -> bool {
        self.newton3
    }

    /// Active data layout.
    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    /// All pairs within one cell.
    pub fn process_cell<C: ParticleCell<P>>(&self, cell: &mut C) {
        if cell.len() < 2 {
            return;
        }
        match self.layout {
            DataLayout::Aos => self.cell_aos(cell),
            DataLayout::Soa => self.functor.soa_single(cell.soa_mut().view(), self.newton3),
            DataLayout::Cuda => debug_assert!(false, "cuda layout is never executable"),
        }
    }

    /// All cross pairs between two distinct cells. `r_hat`, when given, is
    /// the unit vector from `cell1`'s center towards `cell2`'s and is handed
    /// to the functor unchanged.
    pub fn process_cell_pair<C: ParticleCell<P>>(
        &self,
        cell1: &mut C,
        cell2: &mut C,
        r_hat: Option<V3>,
    ) {
        if cell1.is_empty() || cell2.is_empty() {
            return;
        }
        match self.layout {
            DataLayout::Aos => self.cell_pair_aos(cell1, cell2),
            DataLayout::Soa => {
                if self.newton3 || self.one_sided {
                    self.functor.soa_pair(
                        cell1.soa_mut().view(),
                        cell2.soa_mut().view(),
                        self.newton3,
                        r_hat,
                    );
                } else {
                    self.functor.soa_pair(
                        cell1.soa_mut().view(),
                        cell2.soa_mut().view(),
                        false,
                        r_hat,
                    );
                    self.functor.soa_pair(
                        cell2.soa_mut().view(),
                        cell1.soa_mut().view(),
                        false,
                        r_hat.map(|v| geometry::scale(v, -1.0)),
                    );
                }
            }
            DataLayout::Cuda => debug_assert!(false, "cuda layout is never executable"),
        }
    }

    fn cell_aos<C: ParticleCell<P>>(&self, cell: &mut C) {
        let n = cell.len();
        if self.newton3 {
            for i in 0..n {
                for j in (i + 1)..n {
                    cell.with_pair(i, j, |pi, pj| self.functor.aos(pi, pj, true));
                }
            }
        } else {
            for i in 0..n {
                for j in 0..n {
                    if i != j {
                        cell.with_pair(i, j, |pi, pj| self.functor.aos(pi, pj, false));
                    }
                }
            }
        }
    }

    fn cell_pair_aos<C: ParticleCell<P>>(&self, cell1: &mut C, cell2: &mut C) {
        for i in 0..cell1.len() {
            for j in 0..cell2.len() {
                cell1.with_particle(i, |pi| {
                    cell2.with_particle(j, |pj| {
                        if self.newton3 {
                            self.functor.aos(pi, pj, true);
                        } else {
                            self.functor.aos(pi, pj, false);
                            if !self.one_sided {
                                self.functor.aos(pj, pi, false);
                            }
                        }
                    })
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::FullCell;
    use crate::functors::PairCounter;
    use crate::particle::PointParticle;

    fn cell_with(n: u64, base: f64) -> FullCell<PointParticle> {
        let mut c = FullCell::new([1.0; 3]);
        for k in 0..n {
            c.add(PointParticle::new([base + 0.01 * k as f64, 0.0, 0.0], base as u64 * 100 + k));
        }
        c
    }

    #[test]
    fn intra_cell_newton3_visits_each_pair_once() {
        let mut cell = cell_with(4, 0.0);
        let counter = PairCounter::new(f64::INFINITY);
        let cf = CellFunctor::new(&counter, DataLayout::Aos, true);
        cf.process_cell(&mut cell);
        let counts = counter.unordered_counts();
        assert_eq!(counts.len(), 6);
        assert!(counts.values().all(|&c| c == 1));
    }

    #[test]
    fn intra_cell_no_newton3_visits_both_orderings() {
        let mut cell = cell_with(3, 0.0);
        let counter = PairCounter::new(f64::INFINITY);
        let cf = CellFunctor::new(&counter, DataLayout::Aos, false);
        cf.process_cell(&mut cell);
        let ordered = counter.ordered_counts();
        assert_eq!(ordered.len(), 6);
        assert!(ordered.values().all(|&c| c == 1));
    }

    #[test]
    fn cell_pair_counts_match_layouts() {
        for layout in [DataLayout::Aos, DataLayout::Soa] {
            for newton3 in [true, false] {
                let mut c1 = cell_with(3, 0.0);
                let mut c2 = cell_with(2, 1.0);
                let counter = PairCounter::new(f64::INFINITY);
                if layout == DataLayout::Soa {
                    let attrs = Functor::<PointParticle>::needed_attrs(&counter);
                    c1.load_soa(attrs);
                    c2.load_soa(attrs);
                }
                let cf = CellFunctor::new(&counter, layout, newton3);
                cf.process_cell_pair(&mut c1, &mut c2, None);
                let expect = if newton3 { 6 } else { 12 };
                assert_eq!(counter.visits().len(), expect, "{layout:?} n3={newton3}");
            }
        }
    }

    #[test]
    fn one_sided_pair_visits_single_orientation() {
        let mut c1 = cell_with(2, 0.0);
        let mut c2 = cell_with(2, 1.0);
        let counter = PairCounter::new(f64::INFINITY);
        let cf = CellFunctor::one_sided(&counter, DataLayout::Aos);
        cf.process_cell_pair(&mut c1, &mut c2, None);
        // Only (c1, c2) orientations: ids of c1 always first.
        let visits = counter.visits();
        assert_eq!(visits.len(), 4);
        assert!(visits.iter().all(|v| v.i < 100 && v.j >= 100));
    }
}
