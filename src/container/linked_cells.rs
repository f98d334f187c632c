//! Linked-cells container
//!
//! The workhorse: a [`CellBlock`] bins particles into cells of at least the
//! interaction length, so all partners of a particle live in the 3x3x3 cell
//! shell around it. Which coloring or slicing scheme walks that grid is the
//! plan's choice; the container loads SoA side-cars before and extracts them
//! after when the plan asks for the SoA layout.
//!
//! Cells are stored behind per-cell mutexes so the color phases can hand out
//! mutable access without unsafe; see the traversal module for the locking
//! discipline.

use std::sync::Mutex;

use crate::cell::{FullCell, ParticleCell};
use crate::cell_block::{CellBlock, GridError};
use crate::container::{
    check_functor_mode, in_region, ContainerError, IteratorBehavior, ParticleContainer,
};
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::{Ownership, Particle};
use crate::selector::TraversalPlan;
use crate::traversal::{
    lock, C01Traversal, C04Traversal, C08Traversal, C18Traversal, SlicedTraversal, TraversalKind,
};
use crate::{Real, V3};

/// Cell-grid container over `[box_min, box_max]`.
pub struct LinkedCells<P: Particle, C: ParticleCell<P> = FullCell<P>> {
    block: CellBlock,
    cells: Vec<Mutex<C>>,
    _marker: std::marker::PhantomData<P>,
}

impl<P: Particle, C: ParticleCell<P>> LinkedCells<P, C> {
    /// Lay out the grid and allocate its (empty) cells.
    pub fn new(
        box_min: V3,
        box_max: V3,
        cutoff: Real,
        skin: Real,
        cell_size_factor: Real,
    ) -> Result<Self, GridError> {
        let block = CellBlock::new(box_min, box_max, cutoff, skin, cell_size_factor)?;
        let cells = (0..block.num_cells())
            .map(|_| Mutex::new(C::new(block.cell_length())))
            .collect();
        Ok(Self { block, cells, _marker: std::marker::PhantomData })
    }

    /// The grid geometry.
    pub fn block(&self) -> &CellBlock {
        &self.block
    }

    /// The cell storage (shared with the Verlet cell-pair container).
    pub fn cells(&self) -> &[Mutex<C>] {
        &self.cells
    }

    /// Run one interaction step with the selected plan.
    pub fn iterate_pairwise<F: Functor<P>>(
        &mut self,
        functor: &mut F,
        plan: &TraversalPlan,
    ) -> Result<(), ContainerError> {
        check_functor_mode(functor, plan.newton3, plan.traversal)?;
        functor.init_traversal();
        if plan.layout == DataLayout::Soa {
            self.load_all_soa(functor.needed_attrs());
        }
        self.run_traversal(&*functor, plan)?;
        if plan.layout == DataLayout::Soa {
            self.extract_all_soa(functor.computed_attrs());
        }
        functor.end_traversal(plan.newton3);
        Ok(())
    }

    fn run_traversal<F: Functor<P>>(
        &self,
        functor: &F,
        plan: &TraversalPlan,
    ) -> Result<(), ContainerError> {
        let not_applicable = |reason: &'static str| ContainerError::TraversalNotApplicable {
            kind: plan.traversal,
            reason: reason.into(),
        };
        match plan.traversal {
            TraversalKind::C01 => C01Traversal::new(&self.block, plan.layout, plan.newton3)
                .map_err(not_applicable)?
                .traverse(&self.cells, functor),
            TraversalKind::C04 | TraversalKind::C04Soa => {
                C04Traversal::new(&self.block, plan.layout, plan.newton3, plan.traversal)
                    .map_err(not_applicable)?
                    .traverse(&self.cells, functor)
            }
            TraversalKind::C08 => C08Traversal::new(&self.block, plan.layout, plan.newton3)
                .map_err(not_applicable)?
                .traverse(&self.cells, functor),
            TraversalKind::C18 => C18Traversal::new(&self.block, plan.layout, plan.newton3)
                .map_err(not_applicable)?
                .traverse(&self.cells, functor),
            TraversalKind::Sliced => SlicedTraversal::new(&self.block, plan.layout, plan.newton3)
                .map_err(not_applicable)?
                .traverse(&self.cells, functor),
            _ => {
                return Err(not_applicable("linked cells runs c01/c04/c04SoA/c08/c18/sliced only"))
            }
        }
        Ok(())
    }

    pub(crate) fn load_all_soa(&self, attrs: &[crate::particle::Attr]) {
        for i in 0..self.cells.len() {
            lock(&self.cells, i).load_soa(attrs);
        }
    }

    pub(crate) fn extract_all_soa(&self, attrs: &[crate::particle::Attr]) {
        for i in 0..self.cells.len() {
            lock(&self.cells, i).extract_soa(attrs);
        }
    }
}

impl<P: Particle, C: ParticleCell<P>> ParticleContainer<P> for LinkedCells<P, C> {
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError> {
        if !self.block.position_in_box(p.position()) {
            return Err(ContainerError::OutOfDomain { id: p.id(), position: p.position() });
        }
        let idx = self.block.index_of_position(p.position());
        lock(&self.cells, idx).add(p);
        Ok(())
    }

    fn add_or_update_halo_particle(&mut self, p: P) {
        let idx = self.block.index_of_position(p.position());
        let mut cell = lock(&self.cells, idx);
        for i in 0..cell.len() {
            let matches = cell.read(i, |q| q.id() == p.id() && q.ownership() == Ownership::Halo);
            if matches {
                let replacement = p.clone();
                cell.with_particle(i, move |q| *q = replacement);
                return;
            }
        }
        cell.add(p);
    }

    fn update_container(&mut self) -> (Vec<P>, bool) {
        let mut leavers = Vec::new();
        let mut movers: Vec<(usize, P)> = Vec::new();
        let mut structural = false;

        for idx in 0..self.cells.len() {
            let mut cell = lock(&self.cells, idx);
            let mut i = 0;
            while i < cell.len() {
                let (pos, ownership) = cell.read(i, |p| (p.position(), p.ownership()));
                if ownership == Ownership::Halo {
                    cell.swap_delete(i);
                    structural = true;
                    continue;
                }
                if !self.block.position_in_box(pos) {
                    leavers.push(cell.swap_delete(i));
                    structural = true;
                    continue;
                }
                let home = self.block.index_of_position(pos);
                if home != idx {
                    movers.push((home, cell.swap_delete(i)));
                    structural = true;
                    continue;
                }
                i += 1;
            }
        }
        for (home, p) in movers {
            lock(&self.cells, home).add(p);
        }
        if structural {
            tracing::debug!(leavers = leavers.len(), "container update changed cell structure");
        }
        (leavers, structural)
    }

    fn num_particles(&self) -> usize {
        (0..self.cells.len()).map(|i| lock(&self.cells, i).len()).sum()
    }

    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P)) {
        for i in 0..self.cells.len() {
            lock(&self.cells, i).for_each_mut(&mut |p| {
                if behavior.accepts(p.ownership()) {
                    f(p);
                }
            });
        }
    }

    fn for_each_in_region(
        &mut self,
        min: V3,
        max: V3,
        behavior: IteratorBehavior,
        f: &mut dyn FnMut(&mut P),
    ) {
        let lo = self.block.coord_of_position(min);
        let hi = self.block.coord_of_position(max);
        let dims = self.block.dims();
        for z in lo[2]..=hi[2] {
            for y in lo[1]..=hi[1] {
                for x in lo[0]..=hi[0] {
                    let idx = geometry::flat_index([x, y, z], dims);
                    lock(&self.cells, idx).for_each_mut(&mut |p| {
                        if behavior.accepts(p.ownership()) && in_region(p.position(), min, max) {
                            f(p);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::PointParticle;

    fn container() -> LinkedCells<PointParticle> {
        LinkedCells::new([0.0; 3], [10.0; 3], 1.0, 0.2, 1.0).unwrap()
    }

    #[test]
    fn particles_land_in_their_cells() {
        let mut lc = container();
        lc.add_particle(PointParticle::new([0.5, 0.5, 0.5], 0)).unwrap();
        lc.add_or_update_halo_particle(PointParticle::halo([-0.1, 0.5, 0.5], 1));
        assert_eq!(lc.num_particles(), 2);
        let mut owned = 0;
        lc.for_each(IteratorBehavior::OwnedOnly, &mut |_| owned += 1);
        assert_eq!(owned, 1);
        let mut halo = 0;
        lc.for_each(IteratorBehavior::HaloOnly, &mut |_| halo += 1);
        assert_eq!(halo, 1);
    }

    #[test]
    fn halo_update_replaces_by_id() {
        let mut lc = container();
        lc.add_or_update_halo_particle(PointParticle::halo([-0.1, 0.5, 0.5], 7));
        lc.add_or_update_halo_particle(PointParticle::halo([-0.2, 0.5, 0.5], 7));
        assert_eq!(lc.num_particles(), 1);
        let mut pos = [0.0; 3];
        lc.for_each(IteratorBehavior::HaloOnly, &mut |p| pos = p.position());
        assert_eq!(pos, [-0.2, 0.5, 0.5]);
    }

    #[test]
    fn update_rebins_movers_and_returns_leavers() {
        let mut lc = container();
        lc.add_particle(PointParticle::new([0.5, 0.5, 0.5], 0)).unwrap();
        lc.add_particle(PointParticle::new([5.0, 5.0, 5.0], 1)).unwrap();
        lc.add_or_update_halo_particle(PointParticle::halo([-0.1, 5.0, 5.0], 2));
        // Move one particle across cells, one out of the box.
        lc.for_each(IteratorBehavior::OwnedOnly, &mut |p| match p.id() {
            0 => p.set_position([9.5, 9.5, 9.5]),
            1 => p.set_position([11.0, 5.0, 5.0]),
            _ => {}
        });
        let (leavers, structural) = lc.update_container();
        assert!(structural);
        assert_eq!(leavers.len(), 1);
        assert_eq!(leavers[0].id(), 1);
        // Halo was purged, the mover survived in its new cell.
        assert_eq!(lc.num_particles(), 1);
        let expected_cell = lc.block().index_of_position([9.5, 9.5, 9.5]);
        assert_eq!(lock(lc.cells(), expected_cell).len(), 1);
    }

    #[test]
    fn region_visitation_is_inclusive_and_filtered() {
        let mut lc = container();
        for k in 0..10 {
            lc.add_particle(PointParticle::new([k as f64 + 0.5, 5.0, 5.0], k as u64)).unwrap();
        }
        let mut seen = Vec::new();
        lc.for_each_in_region([2.0, 0.0, 0.0], [5.0, 10.0, 10.0], IteratorBehavior::OwnedOnly, &mut |p| {
            seen.push(p.id())
        });
        seen.sort_unstable();
        assert_eq!(seen, vec![2, 3, 4]);
    }
}
