//! Direct-sum container
//!
//! Two cells — one for owned particles, one for halo copies — and no spatial
//! index at all: every owned pair plus every owned-halo cross pair is
//! evaluated. Quadratic, but exact and unbeatable for small particle counts;
//! it also serves as the reference the spatial containers are validated
//! against. Halo-halo pairs are never visited (both forces would be
//! discarded anyway).

use crate::cell::{FullCell, ParticleCell};
use crate::cell_functor::CellFunctor;
use crate::container::{check_functor_mode, in_region, ContainerError, IteratorBehavior, ParticleContainer};
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::selector::TraversalPlan;
use crate::traversal::TraversalKind;
use crate::V3;

/// Container evaluating all pairs directly.
pub struct DirectSum<P: Particle, C: ParticleCell<P> = FullCell<P>> {
    box_min: V3,
    box_max: V3,
    cutoff: f64,
    owned: C,
    halo: C,
    _marker: std::marker::PhantomData<P>,
}

impl<P: Particle, C: ParticleCell<P>> DirectSum<P, C> {
    /// New empty container over `[box_min, box_max]`.
    pub fn new(box_min: V3, box_max: V3, cutoff: f64) -> Self {
        let extent = geometry::sub(box_max, box_min);
        Self {
            box_min,
            box_max,
            cutoff,
            owned: C::new(extent),
            halo: C::new(extent),
            _marker: std::marker::PhantomData,
        }
    }

    /// Interaction cutoff.
    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    fn position_in_box(&self, r: V3) -> bool {
        (0..3).all(|d| r[d] >= self.box_min[d] && r[d] < self.box_max[d])
    }

    /// Run one interaction step with the selected plan.
    pub fn iterate_pairwise<F: Functor<P>>(
        &mut self,
        functor: &mut F,
        plan: &TraversalPlan,
    ) -> Result<(), ContainerError> {
        if plan.traversal != TraversalKind::DirectSum {
            return Err(ContainerError::TraversalNotApplicable {
                kind: plan.traversal,
                reason: "direct sum only runs the direct-sum traversal".into(),
            });
        }
        if plan.layout == DataLayout::Cuda {
            return Err(ContainerError::TraversalNotApplicable {
                kind: plan.traversal,
                reason: "no cuda device available".into(),
            });
        }
        check_functor_mode(functor, plan.newton3, plan.traversal)?;

        functor.init_traversal();
        if plan.layout == DataLayout::Soa {
            let needed = functor.needed_attrs();
            self.owned.load_soa(needed);
            self.halo.load_soa(needed);
        }
        {
            let cf = CellFunctor::new(&*functor, plan.layout, plan.newton3);
            cf.process_cell(&mut self.owned);
            if !self.halo.is_empty() && !self.owned.is_empty() {
                cf.process_cell_pair(&mut self.owned, &mut self.halo, None);
            }
        }
        if plan.layout == DataLayout::Soa {
            let computed = functor.computed_attrs();
            self.owned.extract_soa(computed);
            self.halo.extract_soa(computed);
        }
        functor.end_traversal(plan.newton3);
        Ok(())
    }
}

impl<P: Particle, C: ParticleCell<P>> ParticleContainer<P> for DirectSum<P, C> {
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError> {
        if !self.position_in_box(p.position()) {
            return Err(ContainerError::OutOfDomain { id: p.id(), position: p.position() });
        }
        self.owned.add(p);
        Ok(())
    }

    fn add_or_update_halo_particle(&mut self, p: P) {
        for i in 0..self.halo.len() {
            if self.halo.read(i, |q| q.id()) == p.id() {
                let replacement = p.clone();
                self.halo.with_particle(i, move |q| *q = replacement);
                return;
            }
        }
        self.halo.add(p);
    }

    fn update_container(&mut self) -> (Vec<P>, bool) {
        let mut leavers = Vec::new();
        let mut i = 0;
        while i < self.owned.len() {
            let pos = self.owned.read(i, |p| p.position());
            if self.position_in_box(pos) {
                i += 1;
            } else {
                leavers.push(self.owned.swap_delete(i));
            }
        }
        let structural = !leavers.is_empty() || !self.halo.is_empty();
        self.halo.clear();
        (leavers, structural)
    }

    fn num_particles(&self) -> usize {
        self.owned.len() + self.halo.len()
    }

    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P)) {
        self.owned.for_each_mut(&mut |p| {
            if behavior.accepts(p.ownership()) {
                f(p);
            }
        });
        self.halo.for_each_mut(&mut |p| {
            if behavior.accepts(p.ownership()) {
                f(p);
            }
        });
    }

    fn for_each_in_region(
        &mut self,
        min: V3,
        max: V3,
        behavior: IteratorBehavior,
        f: &mut dyn FnMut(&mut P),
    ) {
        self.for_each(behavior, &mut |p| {
            if in_region(p.position(), min, max) {
                f(p);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functors::PairCounter;
    use crate::particle::PointParticle;
    use crate::selector::TraversalPlan;

    fn plan(layout: DataLayout, newton3: bool) -> TraversalPlan {
        TraversalPlan {
            container: crate::selector::ContainerKind::DirectSum,
            traversal: TraversalKind::DirectSum,
            layout,
            newton3,
            cell_size_factor: 1.0,
        }
    }

    fn filled() -> DirectSum<PointParticle> {
        let mut ds = DirectSum::new([0.0; 3], [10.0; 3], 3.0);
        for k in 0..20 {
            ds.add_particle(PointParticle::new([0.1 + 0.01 * k as f64, 1.0, 1.0], k)).unwrap();
        }
        for k in 0..10 {
            ds.add_or_update_halo_particle(PointParticle::halo([0.1 + 0.01 * k as f64, 1.2, 1.0], 100 + k));
        }
        ds
    }

    #[test]
    fn aos_newton3_call_count_is_390() {
        let mut ds = filled();
        let mut counter = PairCounter::new(f64::INFINITY);
        ds.iterate_pairwise(&mut counter, &plan(DataLayout::Aos, true)).unwrap();
        // 20*19/2 intra + 20*10 cross.
        assert_eq!(counter.visits().len(), 390);
    }

    #[test]
    fn aos_without_newton3_doubles_the_visits() {
        let mut ds = filled();
        let mut counter = PairCounter::new(f64::INFINITY);
        ds.iterate_pairwise(&mut counter, &plan(DataLayout::Aos, false)).unwrap();
        assert_eq!(counter.visits().len(), 780);
    }

    #[test]
    fn soa_layout_matches_aos_coverage() {
        let mut ds = filled();
        let mut counter = PairCounter::new(f64::INFINITY);
        ds.iterate_pairwise(&mut counter, &plan(DataLayout::Soa, true)).unwrap();
        assert_eq!(counter.visits().len(), 390);
    }

    #[test]
    fn update_container_returns_leavers() {
        let mut ds = filled();
        ds.for_each(IteratorBehavior::OwnedOnly, &mut |p| {
            if p.id() < 3 {
                p.set_position([42.0, 0.0, 0.0]);
            }
        });
        let (leavers, structural) = ds.update_container();
        assert_eq!(leavers.len(), 3);
        assert!(structural);
        assert_eq!(ds.num_particles(), 17);
    }

    #[test]
    fn reduced_memory_cells_drive_the_same_pairs() {
        use crate::cell::RmmCell;
        use crate::functors::LennardJones;

        // The same two-particle step through full and reduced-memory cells
        // must produce identical forces.
        let run = |full: bool| {
            let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
            let a = PointParticle::new([1.0, 1.0, 1.0], 0);
            let b = PointParticle::new([1.5, 1.0, 1.0], 1);
            let p = plan(DataLayout::Aos, true);
            let mut forces = Vec::new();
            if full {
                let mut ds: DirectSum<PointParticle> = DirectSum::new([0.0; 3], [4.0; 3], 1.0);
                ds.add_particle(a).unwrap();
                ds.add_particle(b).unwrap();
                ds.iterate_pairwise(&mut lj, &p).unwrap();
                ds.for_each(IteratorBehavior::OwnedOnly, &mut |q| forces.push(q.force()));
            } else {
                let mut ds: DirectSum<PointParticle, RmmCell<PointParticle>> =
                    DirectSum::new([0.0; 3], [4.0; 3], 1.0);
                ds.add_particle(a).unwrap();
                ds.add_particle(b).unwrap();
                ds.iterate_pairwise(&mut lj, &p).unwrap();
                ds.for_each(IteratorBehavior::OwnedOnly, &mut |q| forces.push(q.force()));
            }
            forces
        };
        assert_eq!(run(true), run(false));
    }

    #[test]
    fn rejects_out_of_box_owned_particles() {
        let mut ds: DirectSum<PointParticle> = DirectSum::new([0.0; 3], [1.0; 3], 0.5);
        assert!(matches!(
            ds.add_particle(PointParticle::new([2.0, 0.0, 0.0], 0)),
            Err(ContainerError::OutOfDomain { .. })
        ));
    }
}
