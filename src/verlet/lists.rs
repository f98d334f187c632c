//! Per-particle Verlet neighbor lists
//!
//! Candidate partners within `cutoff + skin` are collected per particle by
//! replaying the c08 candidate sweep over a throwaway cell grid. Two list
//! representations stay in sync once built:
//!
//! - the AoS list maps each particle (by handle) to its partner handles;
//! - the SoA list concatenates all particles into one global [`SoaBuffer`]
//!   row order and rewrites every AoS entry as a row index, in a second pass.
//!
//! The as-build variant partitions the same candidate pairs into per-builder
//! buckets whose traversal needs no coloring.
//!
//! Lists stay valid while no particle moved farther than `skin / 2`; the
//! rebuild policy also fires on structural changes, on the configured
//! frequency, and when the Newton-3 mode flips (a list built for one mode
//! encodes its pair directions).

use std::collections::HashMap;

use rayon::prelude::*;

use crate::cell_block::{CellBlock, GridError};
use crate::container::{
    check_functor_mode, in_region, ContainerError, IteratorBehavior, ParticleContainer,
};
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::{Attr, Ownership, Particle};
use crate::selector::TraversalPlan;
use crate::soa::SoaBuffer;
use crate::traversal::TraversalKind;
use crate::verlet::{for_each_candidate_pair, Arena, ParticleHandle, RebuildPolicy};
use crate::{Real, V3};

struct Built {
    newton3: bool,
    /// Row order of the global SoA buffer: handle of each row.
    rows: Vec<ParticleHandle>,
    /// AoS representation: partner handles per row.
    aos: Vec<Vec<ParticleHandle>>,
    /// SoA representation: partner rows per row.
    neighbor_rows: Vec<Vec<u32>>,
    /// Forward (unordered, i < j) candidate pairs bucketed per builder.
    var_buckets: Vec<Vec<(u32, u32)>>,
    /// Positions at build time, per row.
    build_pos: Vec<V3>,
}

/// Container with per-particle neighbor lists over a slot arena.
pub struct VerletLists<P: Particle> {
    box_min: V3,
    box_max: V3,
    cutoff: Real,
    skin: Real,
    arena: Arena<P>,
    halo_ids: HashMap<u64, ParticleHandle>,
    policy: RebuildPolicy,
    built: Option<Built>,
    soa: SoaBuffer,
}

impl<P: Particle> VerletLists<P> {
    /// New empty container. The parameters are validated by laying out the
    /// build grid once.
    pub fn new(
        box_min: V3,
        box_max: V3,
        cutoff: Real,
        skin: Real,
        rebuild_frequency: usize,
    ) -> Result<Self, GridError> {
        CellBlock::new(box_min, box_max, cutoff, skin, 1.0)?;
        Ok(Self {
            box_min,
            box_max,
            cutoff,
            skin,
            arena: Arena::new(),
            halo_ids: HashMap::new(),
            policy: RebuildPolicy::new(rebuild_frequency),
            built: None,
            soa: SoaBuffer::default(),
        })
    }

    /// How often the lists have been (re)built.
    pub fn rebuilds(&self) -> usize {
        self.policy.rebuilds()
    }

    /// Force a rebuild before the next traversal, irrespective of the
    /// frequency counter.
    pub fn invalidate_lists(&mut self) {
        self.policy.mark_dirty();
    }

    fn position_in_box(&self, r: V3) -> bool {
        (0..3).all(|d| r[d] >= self.box_min[d] && r[d] < self.box_max[d])
    }

    fn moved_too_far(&self) -> bool {
        let Some(built) = &self.built else { return false };
        let limit2 = (self.skin * 0.5) * (self.skin * 0.5);
        built.rows.iter().zip(&built.build_pos).any(|(&h, &r0)| {
            let r = self.arena.read(h, |p| p.position());
            geometry::norm2(geometry::sub(r, r0)) > limit2
        })
    }

    fn build(&mut self, newton3: bool) -> Result<(), ContainerError> {
        let rows = self.arena.handles();
        let positions: Vec<V3> =
            rows.iter().map(|&h| self.arena.read(h, |p| p.position())).collect();

        let il2 = (self.cutoff + self.skin) * (self.cutoff + self.skin);
        let mut aos: Vec<Vec<ParticleHandle>> = vec![Vec::new(); rows.len()];
        let mut forward: Vec<(u32, u32)> = Vec::new();
        for_each_candidate_pair(
            &positions,
            self.box_min,
            self.box_max,
            self.cutoff,
            self.skin,
            |i, j| {
                let r2 = geometry::norm2(geometry::sub(positions[i], positions[j]));
                if r2 <= il2 {
                    aos[i].push(rows[j]);
                    if !newton3 {
                        aos[j].push(rows[i]);
                    }
                    forward.push((i as u32, j as u32));
                }
            },
        )
        .map_err(|e| ContainerError::InvariantViolation(format!("list build grid failed: {e}")))?;

        // Second pass: rewrite handle entries as rows of the global buffer.
        let mut row_of = vec![u32::MAX; self.arena.capacity()];
        for (r, h) in rows.iter().enumerate() {
            row_of[h.index()] = r as u32;
        }
        let neighbor_rows: Vec<Vec<u32>> = aos
            .iter()
            .map(|partners| partners.iter().map(|h| row_of[h.index()]).collect())
            .collect();

        let num_buckets = rayon::current_num_threads().max(1);
        let mut var_buckets: Vec<Vec<(u32, u32)>> = vec![Vec::new(); num_buckets];
        for &(i, j) in &forward {
            var_buckets[i as usize % num_buckets].push((i, j));
        }

        tracing::debug!(
            particles = rows.len(),
            pairs = forward.len(),
            newton3,
            "rebuilt verlet neighbor lists"
        );
        self.built =
            Some(Built { newton3, rows, aos, neighbor_rows, var_buckets, build_pos: positions });
        self.policy.note_built(newton3);
        Ok(())
    }

    /// Validity sweep: every pair currently within the cutoff must be in the
    /// AoS list. A missing pair drops the list and is an invariant violation.
    pub fn check_neighbor_lists(&mut self) -> Result<(), ContainerError> {
        let Some(built) = &self.built else { return Ok(()) };
        let positions: Vec<V3> =
            built.rows.iter().map(|&h| self.arena.read(h, |p| p.position())).collect();
        let rc2 = self.cutoff * self.cutoff;
        let mut missing = None;
        for_each_candidate_pair(
            &positions,
            self.box_min,
            self.box_max,
            self.cutoff,
            self.skin,
            |i, j| {
                if missing.is_some() {
                    return;
                }
                let r2 = geometry::norm2(geometry::sub(positions[i], positions[j]));
                if r2 < rc2 {
                    let hi = built.rows[i];
                    let hj = built.rows[j];
                    if !built.aos[i].contains(&hj) && !built.aos[j].contains(&hi) {
                        missing = Some((i, j));
                    }
                }
            },
        )
        .map_err(|e| ContainerError::InvariantViolation(format!("list check grid failed: {e}")))?;

        if let Some((i, j)) = missing {
            self.built = None;
            return Err(ContainerError::InvariantViolation(format!(
                "in-range pair ({i}, {j}) missing from verlet list"
            )));
        }
        Ok(())
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
        match plan.traversal {
            TraversalKind::Verlet => {}
            TraversalKind::VarVerletAsBuild => {
                if plan.layout != DataLayout::Aos {
                    return Err(not_applicable("as-build traversal supports the aos layout only"));
                }
            }
            _ => {
                return Err(not_applicable(
                    "verlet lists run verletTraversal/varVerletTraversalAsBuild only",
                ))
            }
        }
        if plan.layout == DataLayout::Cuda {
            return Err(not_applicable("no cuda device available"));
        }
        check_functor_mode(functor, plan.newton3, plan.traversal)?;

        if let Some(reason) =
            self.policy.rebuild_reason(plan.newton3, || self.moved_too_far())
        {
            tracing::debug!(reason, "verlet list rebuild triggered");
            self.build(plan.newton3)?;
        }
        self.policy.note_step();

        functor.init_traversal();
        match (plan.traversal, plan.layout) {
            (TraversalKind::Verlet, DataLayout::Aos) => self.traverse_aos(&*functor, plan.newton3),
            (TraversalKind::Verlet, DataLayout::Soa) => self.traverse_soa(&*functor, plan.newton3),
            (TraversalKind::VarVerletAsBuild, _) => {
                self.traverse_var(&*functor, plan.newton3)
            }
            _ => unreachable!("validated above"),
        }
        functor.end_traversal(plan.newton3);
        Ok(())
    }

    fn traverse_aos<F: Functor<P>>(&self, functor: &F, newton3: bool) {
        let built = self.built.as_ref().expect("lists built above");
        for (i, &hi) in built.rows.iter().enumerate() {
            for &hj in &built.aos[i] {
                self.arena.with_pair(hi, hj, |pi, pj| functor.aos(pi, pj, newton3));
            }
        }
    }

    fn traverse_soa<F: Functor<P>>(&mut self, functor: &F, newton3: bool) {
        let built = self.built.as_ref().expect("lists built above");
        let n = built.rows.len();
        self.soa.clear();
        self.soa.resize(n);
        for (r, &h) in built.rows.iter().enumerate() {
            self.arena.read(h, |p| {
                for attr in functor.needed_attrs() {
                    match attr {
                        Attr::PosX => self.soa.x[r] = p.position()[0],
                        Attr::PosY => self.soa.y[r] = p.position()[1],
                        Attr::PosZ => self.soa.z[r] = p.position()[2],
                        Attr::ForceX => self.soa.fx[r] = p.force()[0],
                        Attr::ForceY => self.soa.fy[r] = p.force()[1],
                        Attr::ForceZ => self.soa.fz[r] = p.force()[2],
                        Attr::Id => self.soa.id[r] = p.id(),
                        Attr::Ownership => self.soa.ownership[r] = p.ownership(),
                    }
                }
            });
        }

        functor.soa_verlet(&mut self.soa, &built.neighbor_rows, 0..n, newton3);

        for (r, &h) in built.rows.iter().enumerate() {
            self.arena.with(h, |p| {
                let mut f = p.force();
                for attr in functor.computed_attrs() {
                    match attr {
                        Attr::ForceX => f[0] = self.soa.fx[r],
                        Attr::ForceY => f[1] = self.soa.fy[r],
                        Attr::ForceZ => f[2] = self.soa.fz[r],
                        _ => debug_assert!(false, "attribute {attr:?} is not writable"),
                    }
                }
                p.set_force(f);
            });
        }
    }

    /// As-build traversal: one task per builder bucket, pair writes guarded
    /// by the slot locks (no coloring).
    fn traverse_var<F: Functor<P>>(&self, functor: &F, newton3: bool) {
        let built = self.built.as_ref().expect("lists built above");
        built.var_buckets.par_iter().for_each(|bucket| {
            for &(i, j) in bucket {
                let hi = built.rows[i as usize];
                let hj = built.rows[j as usize];
                self.arena.with_pair(hi, hj, |pi, pj| {
                    if newton3 {
                        functor.aos(pi, pj, true);
                    } else {
                        functor.aos(pi, pj, false);
                        functor.aos(pj, pi, false);
                    }
                });
            }
        });
    }
}

impl<P: Particle> ParticleContainer<P> for VerletLists<P> {
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError> {
        if !self.position_in_box(p.position()) {
            return Err(ContainerError::OutOfDomain { id: p.id(), position: p.position() });
        }
        self.arena.insert(p);
        self.policy.mark_dirty();
        Ok(())
    }

    fn add_or_update_halo_particle(&mut self, p: P) {
        if let Some(&h) = self.halo_ids.get(&p.id()) {
            self.arena.with(h, move |q| *q = p);
            return;
        }
        let id = p.id();
        let h = self.arena.insert(p);
        self.halo_ids.insert(id, h);
        self.policy.mark_dirty();
    }

    fn update_container(&mut self) -> (Vec<P>, bool) {
        let mut leavers = Vec::new();
        let mut structural = false;
        for h in self.arena.handles() {
            let (pos, ownership) = self.arena.read(h, |p| (p.position(), p.ownership()));
            if ownership == Ownership::Halo {
                self.arena.remove(h);
                structural = true;
            } else if !self.position_in_box(pos) {
                if let Some(p) = self.arena.remove(h) {
                    leavers.push(p);
                }
                structural = true;
            }
        }
        self.halo_ids.clear();
        if structural {
            self.policy.mark_dirty();
        }
        (leavers, structural)
    }

    fn num_particles(&self) -> usize {
        self.arena.len()
    }

    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P)) {
        for h in self.arena.handles() {
            self.arena.with(h, |p| {
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
    use crate::selector::ContainerKind;

    fn plan(traversal: TraversalKind, layout: DataLayout, newton3: bool) -> TraversalPlan {
        TraversalPlan {
            container: ContainerKind::VerletLists,
            traversal,
            layout,
            newton3,
            cell_size_factor: 1.0,
        }
    }

    fn two_particle_container() -> VerletLists<PointParticle> {
        let mut vl = VerletLists::new([0.0; 3], [10.0; 3], 1.0, 0.2, 5).unwrap();
        vl.add_particle(PointParticle::new([5.0, 5.0, 5.0], 0)).unwrap();
        vl.add_particle(PointParticle::new([5.5, 5.0, 5.0], 1)).unwrap();
        vl
    }

    #[test]
    fn lists_are_built_lazily_and_cover_the_pair() {
        let mut vl = two_particle_container();
        assert_eq!(vl.rebuilds(), 0);
        let mut counter = PairCounter::new(f64::INFINITY);
        vl.iterate_pairwise(&mut counter, &plan(TraversalKind::Verlet, DataLayout::Aos, true))
            .unwrap();
        assert_eq!(vl.rebuilds(), 1);
        assert_eq!(counter.unordered_counts()[&(0, 1)], 1);
        vl.check_neighbor_lists().unwrap();
    }

    #[test]
    fn newton3_flip_forces_a_rebuild() {
        let mut vl = two_particle_container();
        let mut counter = PairCounter::new(f64::INFINITY);
        vl.iterate_pairwise(&mut counter, &plan(TraversalKind::Verlet, DataLayout::Aos, true))
            .unwrap();
        vl.iterate_pairwise(&mut counter, &plan(TraversalKind::Verlet, DataLayout::Aos, false))
            .unwrap();
        assert_eq!(vl.rebuilds(), 2);
        // Without Newton-3 both orderings are visited.
        let ordered = counter.ordered_counts();
        assert_eq!(ordered[&(0, 1)], 1);
        assert_eq!(ordered[&(1, 0)], 1);
    }

    #[test]
    fn skin_motion_triggers_rebuild_only_past_half_skin() {
        let mut vl = two_particle_container();
        let mut counter = PairCounter::new(f64::INFINITY);
        let p = plan(TraversalKind::Verlet, DataLayout::Aos, true);
        vl.iterate_pairwise(&mut counter, &p).unwrap();
        // Move less than skin/2: no rebuild.
        vl.for_each(IteratorBehavior::OwnedOnly, &mut |q| {
            if q.id() == 0 {
                q.set_position([5.05, 5.0, 5.0]);
            }
        });
        vl.iterate_pairwise(&mut counter, &p).unwrap();
        assert_eq!(vl.rebuilds(), 1);
        // Cross the half-skin displacement: rebuild.
        vl.for_each(IteratorBehavior::OwnedOnly, &mut |q| {
            if q.id() == 0 {
                q.set_position([5.15, 5.0, 5.0]);
            }
        });
        vl.iterate_pairwise(&mut counter, &p).unwrap();
        assert_eq!(vl.rebuilds(), 2);
    }

    #[test]
    fn soa_and_var_traversals_match_aos_coverage() {
        for (traversal, layout) in [
            (TraversalKind::Verlet, DataLayout::Soa),
            (TraversalKind::VarVerletAsBuild, DataLayout::Aos),
        ] {
            for newton3 in [true, false] {
                let mut vl = two_particle_container();
                let mut counter = PairCounter::new(f64::INFINITY);
                vl.iterate_pairwise(&mut counter, &plan(traversal, layout, newton3)).unwrap();
                let expected = if newton3 { 1 } else { 2 };
                assert_eq!(
                    counter.unordered_counts()[&(0, 1)],
                    expected,
                    "{traversal:?} {layout:?} n3={newton3}"
                );
            }
        }
    }

    #[test]
    fn halo_particles_partner_with_owned_ones() {
        let mut vl = VerletLists::new([0.0; 3], [10.0; 3], 1.0, 0.2, 5).unwrap();
        vl.add_particle(PointParticle::new([0.1, 5.0, 5.0], 0)).unwrap();
        vl.add_or_update_halo_particle(PointParticle::halo([-0.3, 5.0, 5.0], 1));
        let mut counter = PairCounter::new(f64::INFINITY);
        vl.iterate_pairwise(&mut counter, &plan(TraversalKind::Verlet, DataLayout::Aos, true))
            .unwrap();
        assert_eq!(counter.unordered_counts()[&(0, 1)], 1);
        let (leavers, structural) = vl.update_container();
        assert!(leavers.is_empty());
        assert!(structural);
        assert_eq!(vl.num_particles(), 1);
    }
}
