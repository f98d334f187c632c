//! Cell-pair Verlet lists
//!
//! Neighbor lists anchored at the linked-cell structure: each cell keeps, per
//! particle, the list of `(cell, index)` partners found within the candidate
//! radius. Because list entries stay cell-addressed, the linked-cell color
//! machinery carries over to list traversal: c18 coloring for Newton-3 runs,
//! a colorless c01-style pass when reciprocity is off, and a sliced variant
//! with slab-edge locks.
//!
//! Entries are plain indices into cells, so *any* structural change (add,
//! remove, rebinning) invalidates the lists; the rebuild policy treats it as
//! dirt, alongside the frequency counter and the half-skin displacement
//! trigger.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::cell::{FullCell, ParticleCell};
use crate::cell_block::GridError;
use crate::container::{
    check_functor_mode, ContainerError, IteratorBehavior, ParticleContainer,
};
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::Particle;
use crate::selector::TraversalPlan;
use crate::traversal::{lock, lock_two, partition_colors, TraversalKind};
use crate::{LinkedCells, Real, V3};

/// Partner address: (flat cell index, particle index within that cell).
type Entry = (u32, u32);

struct Built {
    newton3: bool,
    /// lists[cell][particle] = partner entries.
    lists: Vec<Vec<Vec<Entry>>>,
    /// Positions at build time, mirroring the cell structure.
    build_pos: Vec<Vec<V3>>,
}

/// Linked-cells container with per-cell-particle neighbor lists.
pub struct VerletListsCells<P: Particle> {
    cells: LinkedCells<P, FullCell<P>>,
    policy: super::RebuildPolicy,
    built: Option<Built>,
}

impl<P: Particle> VerletListsCells<P> {
    /// New empty container.
    pub fn new(
        box_min: V3,
        box_max: V3,
        cutoff: Real,
        skin: Real,
        rebuild_frequency: usize,
    ) -> Result<Self, GridError> {
        Ok(Self {
            cells: LinkedCells::new(box_min, box_max, cutoff, skin, 1.0)?,
            policy: super::RebuildPolicy::new(rebuild_frequency),
            built: None,
        })
    }

    /// How often the lists have been (re)built.
    pub fn rebuilds(&self) -> usize {
        self.policy.rebuilds()
    }

    fn moved_too_far(&self) -> bool {
        let Some(built) = &self.built else { return false };
        let skin = self.cells.block().skin();
        let limit2 = (skin * 0.5) * (skin * 0.5);
        let cells = self.cells.cells();
        for (c, cell_pos) in built.build_pos.iter().enumerate() {
            let cell = lock(cells, c);
            debug_assert_eq!(cell.len(), cell_pos.len(), "structure changed without dirt");
            for (i, &r0) in cell_pos.iter().enumerate() {
                let r = cell.read(i, |p| p.position());
                if geometry::norm2(geometry::sub(r, r0)) > limit2 {
                    return true;
                }
            }
        }
        false
    }

    fn build(&mut self, newton3: bool) {
        let block = self.cells.block();
        let dims = block.dims();
        let cells = self.cells.cells();
        let il2 = block.interaction_length() * block.interaction_length();

        let mut lists: Vec<Vec<Vec<Entry>>> = Vec::with_capacity(cells.len());
        let mut build_pos: Vec<Vec<V3>> = Vec::with_capacity(cells.len());
        for c in 0..cells.len() {
            let cell = lock(cells, c);
            let n = cell.len();
            lists.push(vec![Vec::new(); n]);
            build_pos.push((0..n).map(|i| cell.read(i, |p| p.position())).collect());
        }

        let offsets = crate::traversal::half_shell_offsets(
            block.overlap(),
            block.cell_length(),
            block.interaction_length(),
        );
        let mut pairs = 0usize;
        for c1 in 0..cells.len() {
            let coord = geometry::coord_of(c1, dims);
            // Intra-cell candidates.
            for i in 0..build_pos[c1].len() {
                for j in (i + 1)..build_pos[c1].len() {
                    let d2 = geometry::norm2(geometry::sub(build_pos[c1][i], build_pos[c1][j]));
                    if d2 <= il2 {
                        lists[c1][i].push((c1 as u32, j as u32));
                        if !newton3 {
                            lists[c1][j].push((c1 as u32, i as u32));
                        }
                        pairs += 1;
                    }
                }
            }
            // Half-shell cross candidates.
            for off in &offsets {
                let Some(c2_coord) = geometry::offset_coord(coord, *off, dims) else {
                    continue;
                };
                let c2 = geometry::flat_index(c2_coord, dims);
                for i in 0..build_pos[c1].len() {
                    for j in 0..build_pos[c2].len() {
                        let d2 =
                            geometry::norm2(geometry::sub(build_pos[c1][i], build_pos[c2][j]));
                        if d2 <= il2 {
                            lists[c1][i].push((c2 as u32, j as u32));
                            if !newton3 {
                                lists[c2][j].push((c1 as u32, i as u32));
                            }
                            pairs += 1;
                        }
                    }
                }
            }
        }

        tracing::debug!(pairs, newton3, "rebuilt cell-pair verlet lists");
        self.built = Some(Built { newton3, lists, build_pos });
        self.policy.note_built(newton3);
    }

    /// Process every list entry of one cell. Without Newton-3 the lists hold
    /// both directions, so a single one-sided call per entry suffices; with
    /// Newton-3 each entry is the pair's only representative.
    fn process_cell_entries<F: Functor<P>>(
        &self,
        built: &Built,
        c1: usize,
        functor: &F,
        newton3: bool,
    ) {
        let cells = self.cells.cells();
        for (i, partners) in built.lists[c1].iter().enumerate() {
            for &(c2, j) in partners {
                let c2 = c2 as usize;
                let j = j as usize;
                if c2 == c1 {
                    let mut cell = lock(cells, c1);
                    cell.with_pair(i, j, |pi, pj| functor.aos(pi, pj, newton3));
                } else {
                    let (mut g1, mut g2) = lock_two(cells, c1, c2);
                    g1.with_particle(i, |pi| {
                        g2.with_particle(j, |pj| functor.aos(pi, pj, newton3))
                    });
                }
            }
        }
    }

    /// Run one interaction step with the selected plan.
    pub fn iterate_pairwise<F: Functor<P>>(
        &mut self,
        functor: &mut F,
        plan: &TraversalPlan,
    ) -> Result<(), ContainerError> {
        let not_applicable = |reason: &str| ContainerError::TraversalNotApplicable {
            kind: plan.traversal,
            reason: reason.into(),
        };
        if !matches!(
            plan.traversal,
            TraversalKind::C01Verlet | TraversalKind::C18Verlet | TraversalKind::SlicedVerlet
        ) {
            return Err(not_applicable(
                "verlet cell lists run c01Verlet/c18Verlet/slicedVerlet only",
            ));
        }
        if plan.layout != DataLayout::Aos {
            return Err(not_applicable("cell-pair list traversals support the aos layout only"));
        }
        if plan.traversal == TraversalKind::C01Verlet && plan.newton3 {
            return Err(not_applicable("c01Verlet writes only the anchor cell side"));
        }
        check_functor_mode(functor, plan.newton3, plan.traversal)?;

        if let Some(reason) = self.policy.rebuild_reason(plan.newton3, || self.moved_too_far()) {
            tracing::debug!(reason, "cell-pair verlet list rebuild triggered");
            self.build(plan.newton3);
        }
        self.policy.note_step();

        functor.init_traversal();
        {
            let shared: &F = &*functor;
            let built = self.built.as_ref().expect("lists built above");
            match plan.traversal {
                TraversalKind::C01Verlet => {
                    // One-sided lists (both directions present): any number
                    // of concurrent cells is safe, no coloring needed.
                    (0..built.lists.len())
                        .into_par_iter()
                        .for_each(|c| self.process_cell_entries(built, c, shared, false));
                }
                TraversalKind::C18Verlet => {
                    let dims = self.cells.block().dims();
                    for color in partition_colors(dims, dims, [3, 3, 2]) {
                        color.par_iter().for_each(|&c| {
                            self.process_cell_entries(built, c, shared, plan.newton3)
                        });
                    }
                }
                TraversalKind::SlicedVerlet => {
                    self.traverse_sliced(built, shared, plan.newton3)
                }
                _ => unreachable!("validated above"),
            }
        }
        functor.end_traversal(plan.newton3);
        Ok(())
    }

    /// Slab-per-thread list traversal along the longest axis, with one lock
    /// per slab edge (same protocol as the linked-cells sliced traversal; the
    /// list entries of a layer reach one layer up at most).
    fn traverse_sliced<F: Functor<P>>(&self, built: &Built, functor: &F, newton3: bool) {
        let dims = self.cells.block().dims();
        let cut_axis = (0..3).max_by_key(|&d| dims[d]).expect("three axes always present");
        let layers = dims[cut_axis];
        let workers = rayon::current_num_threads().max(1);
        let num_slabs = workers.min(layers).max(1);

        let mut slabs = Vec::with_capacity(num_slabs);
        let mut start = 0usize;
        for s in 0..num_slabs {
            let end = start + layers / num_slabs + usize::from(s < layers % num_slabs);
            slabs.push((start, end));
            start = end;
        }
        let edges: Vec<Mutex<()>> =
            (0..num_slabs.saturating_sub(1)).map(|_| Mutex::new(())).collect();

        let (a1, a2) = match cut_axis {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        };

        rayon::scope(|scope| {
            for (s, &(lo, hi)) in slabs.iter().enumerate() {
                let edges = &edges;
                let slabs_len = slabs.len();
                scope.spawn(move |_| {
                    let mut lower_guard = if s > 0 {
                        Some(edges[s - 1].lock().expect("slab edge lock poisoned"))
                    } else {
                        None
                    };
                    let mut upper_guard = None;
                    for layer in lo..hi {
                        if layer + 1 == hi && s + 1 < slabs_len {
                            upper_guard = Some(edges[s].lock().expect("slab edge lock poisoned"));
                        }
                        for c2 in 0..dims[a2] {
                            for c1 in 0..dims[a1] {
                                let mut coord = [0usize; 3];
                                coord[cut_axis] = layer;
                                coord[a1] = c1;
                                coord[a2] = c2;
                                let cell = geometry::flat_index(coord, dims);
                                self.process_cell_entries(built, cell, functor, newton3);
                            }
                        }
                        if layer == lo {
                            lower_guard = None;
                        }
                    }
                    drop(lower_guard);
                    drop(upper_guard);
                });
            }
        });
    }
}

impl<P: Particle> ParticleContainer<P> for VerletListsCells<P> {
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError> {
        self.cells.add_particle(p)?;
        self.policy.mark_dirty();
        Ok(())
    }

    fn add_or_update_halo_particle(&mut self, p: P) {
        self.cells.add_or_update_halo_particle(p);
        self.policy.mark_dirty();
    }

    fn update_container(&mut self) -> (Vec<P>, bool) {
        let (leavers, structural) = self.cells.update_container();
        if structural {
            self.policy.mark_dirty();
        }
        (leavers, structural)
    }

    fn num_particles(&self) -> usize {
        self.cells.num_particles()
    }

    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P)) {
        self.cells.for_each(behavior, f);
    }

    fn for_each_in_region(
        &mut self,
        min: V3,
        max: V3,
        behavior: IteratorBehavior,
        f: &mut dyn FnMut(&mut P),
    ) {
        self.cells.for_each_in_region(min, max, behavior, f);
    }
}
