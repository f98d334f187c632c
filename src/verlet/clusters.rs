//! Verlet-cluster lists
//!
//! Particles project onto an XY tower grid; inside a tower they are sorted by
//! z and grouped into clusters of a fixed size (4). The last cluster of a
//! tower is padded with dummy particles parked far above the box, so cluster
//! kernels run the full 4x4 pair block without ownership branches — a functor
//! honoring its cutoff annihilates every dummy contribution by distance.
//!
//! Each cluster stores the clusters within the candidate radius (itself
//! included). An unordered cluster pair lives in exactly one list, owned by
//! the smaller `(tower, cluster)` address; intra-cluster pairs ride on the
//! self entry. The coverage guarantee is therefore *cluster-pair* coverage:
//! every particle pair inside a visited cluster pair reaches the functor,
//! dummies included.
//!
//! Traversals: `verletClusters` runs colorless without Newton-3;
//! `verletClustersColoring` colors the tower grid (stride 3, nine colors) so
//! reciprocal writes stay conflict-free. Tower locks back both.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::container::{
    check_functor_mode, in_region, ContainerError, IteratorBehavior, ParticleContainer,
};
use crate::functor::{DataLayout, Functor};
use crate::geometry;
use crate::particle::{Ownership, Particle};
use crate::selector::TraversalPlan;
use crate::traversal::TraversalKind;
use crate::verlet::RebuildPolicy;
use crate::{Real, V3};

/// Particles per cluster.
const CLUSTER_SIZE: usize = 4;

/// Neighbor address: (tower flat index, cluster index within the tower).
type ClusterRef = (u32, u32);

struct Tower<P> {
    /// Padded to a multiple of the cluster size; cluster `c` owns rows
    /// `c * CLUSTER_SIZE ..`.
    particles: Vec<P>,
    /// Per cluster: neighbor clusters this cluster owns the pair with.
    neighbors: Vec<Vec<ClusterRef>>,
}

/// Tower-grid container with fixed-size particle clusters.
pub struct VerletClusterLists<P: Particle> {
    box_min: V3,
    box_max: V3,
    cutoff: Real,
    skin: Real,
    tower_dims: [usize; 2],
    tower_len: [Real; 2],
    towers: Vec<Mutex<Tower<P>>>,
    /// Particles waiting for the next build.
    pending: Vec<P>,
    policy: RebuildPolicy,
    built: bool,
    build_pos: Vec<V3>,
}

impl<P: Particle> VerletClusterLists<P> {
    /// New empty container.
    pub fn new(
        box_min: V3,
        box_max: V3,
        cutoff: Real,
        skin: Real,
        rebuild_frequency: usize,
    ) -> Result<Self, crate::cell_block::GridError> {
        if !(cutoff > 0.0) || skin < 0.0 {
            return Err(crate::cell_block::GridError::BadParameters { cutoff, skin, csf: 1.0 });
        }
        for d in 0..3 {
            if !(box_max[d] > box_min[d]) {
                return Err(crate::cell_block::GridError::DegenerateBox {
                    min: box_min,
                    max: box_max,
                });
            }
        }
        let il = cutoff + skin;
        let mut tower_dims = [0usize; 2];
        let mut tower_len = [0.0; 2];
        for d in 0..2 {
            // One halo ring of towers per side, like the cell block.
            let len = box_max[d] - box_min[d];
            let interior = ((len / il).floor() as usize).max(1);
            tower_len[d] = len / interior as Real;
            tower_dims[d] = interior + 2;
        }
        let towers = (0..tower_dims[0] * tower_dims[1])
            .map(|_| Mutex::new(Tower { particles: Vec::new(), neighbors: Vec::new() }))
            .collect();
        Ok(Self {
            box_min,
            box_max,
            cutoff,
            skin,
            tower_dims,
            tower_len,
            towers,
            pending: Vec::new(),
            policy: RebuildPolicy::new(rebuild_frequency),
            built: false,
            build_pos: Vec::new(),
        })
    }

    /// How often the clusters have been (re)built.
    pub fn rebuilds(&self) -> usize {
        self.policy.rebuilds()
    }

    fn position_in_box(&self, r: V3) -> bool {
        (0..3).all(|d| r[d] >= self.box_min[d] && r[d] < self.box_max[d])
    }

    fn tower_of(&self, r: V3) -> usize {
        let mut coord = [0usize; 2];
        for d in 0..2 {
            let rel = (r[d] - self.box_min[d]) / self.tower_len[d];
            let c = rel.floor() as isize + 1;
            coord[d] = c.clamp(0, self.tower_dims[d] as isize - 1) as usize;
        }
        coord[0] + self.tower_dims[0] * coord[1]
    }

    fn lock_tower(&self, t: usize) -> std::sync::MutexGuard<'_, Tower<P>> {
        self.towers[t].lock().expect("tower lock poisoned")
    }

    fn drain_real_particles(&mut self) -> Vec<P> {
        let mut all = std::mem::take(&mut self.pending);
        for t in 0..self.towers.len() {
            let mut tower = self.lock_tower(t);
            all.extend(tower.particles.drain(..).filter(|p| !p.is_dummy()));
            tower.neighbors.clear();
        }
        self.built = false;
        all
    }

    /// Squared minimum distance between two towers' XY boxes plus two
    /// clusters' z intervals.
    fn cluster_dist2(
        &self,
        t1: [usize; 2],
        t2: [usize; 2],
        z1: (Real, Real),
        z2: (Real, Real),
    ) -> Real {
        let mut d2 = 0.0;
        for d in 0..2 {
            let off = t2[d] as isize - t1[d] as isize;
            let gap = (off.unsigned_abs() as Real - 1.0).max(0.0) * self.tower_len[d];
            d2 += gap * gap;
        }
        let dz = (z1.0 - z2.1).max(z2.0 - z1.1).max(0.0);
        d2 + dz * dz
    }

    fn build(&mut self) {
        let particles = self.drain_real_particles();
        let num_real = particles.len();

        // Bin into towers, sort by z, pad to whole clusters.
        let mut binned: Vec<Vec<P>> = (0..self.towers.len()).map(|_| Vec::new()).collect();
        for p in particles {
            binned[self.tower_of(p.position())].push(p);
        }
        let il = self.cutoff + self.skin;
        let pad_base = self.box_max[2] + 2.0 * il;
        // Global pad counter: consecutive dummies sit 3 interaction lengths
        // apart in z, so no dummy is ever within the cutoff of anything —
        // real particles or other dummies, across all towers.
        let mut pad = 0usize;
        let mut z_ranges: Vec<Vec<(Real, Real)>> = Vec::with_capacity(self.towers.len());
        for (t, mut ps) in binned.into_iter().enumerate() {
            ps.sort_by(|a, b| {
                a.position()[2].partial_cmp(&b.position()[2]).expect("positions are finite")
            });
            let mut ranges = Vec::new();
            for chunk in ps.chunks(CLUSTER_SIZE) {
                let lo = chunk.first().map(|p| p.position()[2]).expect("chunk non-empty");
                let hi = chunk.last().map(|p| p.position()[2]).expect("chunk non-empty");
                ranges.push((lo, hi));
            }
            let mut tower = self.lock_tower(t);
            tower.particles = ps;
            while tower.particles.len() % CLUSTER_SIZE != 0 {
                let z = pad_base + 3.0 * il * pad as Real;
                let mut dummy = tower.particles[0].clone();
                dummy.set_position([self.box_min[0], self.box_min[1], z]);
                dummy.set_force([0.0; 3]);
                dummy.set_ownership(Ownership::Dummy);
                tower.particles.push(dummy);
                pad += 1;
            }
            tower.neighbors = vec![Vec::new(); tower.particles.len() / CLUSTER_SIZE];
            z_ranges.push(ranges);
        }

        // Neighbor lists: the pair lives with the smaller (tower, cluster).
        let il2 = il * il;
        let mut pairs = 0usize;
        for t1 in 0..self.towers.len() {
            let c1_count = z_ranges[t1].len();
            if c1_count == 0 {
                continue;
            }
            let t1_coord = [t1 % self.tower_dims[0], t1 / self.tower_dims[0]];
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    let x = t1_coord[0] as isize + dx;
                    let y = t1_coord[1] as isize + dy;
                    if x < 0
                        || y < 0
                        || x as usize >= self.tower_dims[0]
                        || y as usize >= self.tower_dims[1]
                    {
                        continue;
                    }
                    let t2 = x as usize + self.tower_dims[0] * y as usize;
                    if t2 < t1 {
                        continue;
                    }
                    let t2_coord = [x as usize, y as usize];
                    for c1 in 0..c1_count {
                        let c2_start = if t2 == t1 { c1 } else { 0 };
                        for c2 in c2_start..z_ranges[t2].len() {
                            let d2 = self.cluster_dist2(
                                t1_coord,
                                t2_coord,
                                z_ranges[t1][c1],
                                z_ranges[t2][c2],
                            );
                            if d2 <= il2 {
                                self.lock_tower(t1).neighbors[c1].push((t2 as u32, c2 as u32));
                                pairs += 1;
                            }
                        }
                    }
                }
            }
        }

        let mut build_pos = Vec::with_capacity(num_real);
        for t in 0..self.towers.len() {
            let tower = self.lock_tower(t);
            build_pos
                .extend(tower.particles.iter().filter(|p| !p.is_dummy()).map(|p| p.position()));
        }
        self.build_pos = build_pos;

        tracing::debug!(particles = num_real, cluster_pairs = pairs, "rebuilt cluster lists");
        self.built = true;
        // Cluster traversal direction is encoded in the visit, not the list,
        // so one build serves both Newton-3 modes; the policy still pins the
        // mode so a flip re-times the rebuild like the other containers.
        self.policy.note_built(true);
    }

    fn moved_too_far(&self) -> bool {
        if !self.built {
            return false;
        }
        let limit2 = (self.skin * 0.5) * (self.skin * 0.5);
        let mut row = 0usize;
        for t in 0..self.towers.len() {
            let tower = self.lock_tower(t);
            for p in tower.particles.iter().filter(|p| !p.is_dummy()) {
                let r0 = self.build_pos[row];
                if geometry::norm2(geometry::sub(p.position(), r0)) > limit2 {
                    return true;
                }
                row += 1;
            }
        }
        false
    }

    /// Visit one owned cluster pair entry. Intra-cluster (self entries) and
    /// cross-cluster blocks both run the plain AoS kernel; without Newton-3
    /// each ordered direction is visited here since the pair has no second
    /// owner.
    fn process_entry<F: Functor<P>>(
        &self,
        functor: &F,
        newton3: bool,
        t1: usize,
        c1: usize,
        t2: usize,
        c2: usize,
    ) {
        let lo1 = c1 * CLUSTER_SIZE;
        let lo2 = c2 * CLUSTER_SIZE;
        if t1 == t2 {
            let mut tower = self.lock_tower(t1);
            if c1 == c2 {
                for i in lo1..lo1 + CLUSTER_SIZE {
                    let j_start = if newton3 { i + 1 } else { lo1 };
                    for j in j_start..lo1 + CLUSTER_SIZE {
                        if i == j {
                            continue;
                        }
                        let (head, tail) = tower.particles.split_at_mut(i.max(j));
                        let (a, b) = (&mut head[i.min(j)], &mut tail[0]);
                        if i < j {
                            functor.aos(a, b, newton3);
                        } else {
                            functor.aos(b, a, newton3);
                        }
                    }
                }
            } else {
                for i in lo1..lo1 + CLUSTER_SIZE {
                    for j in lo2..lo2 + CLUSTER_SIZE {
                        let (head, tail) = tower.particles.split_at_mut(i.max(j));
                        let (a, b) = (&mut head[i.min(j)], &mut tail[0]);
                        let (pi, pj) = if i < j { (a, b) } else { (b, a) };
                        functor.aos(pi, pj, newton3);
                        if !newton3 {
                            functor.aos(pj, pi, newton3);
                        }
                    }
                }
            }
            return;
        }
        // Distinct towers: ascending lock order.
        let (mut g1, mut g2) = if t1 < t2 {
            let g1 = self.lock_tower(t1);
            let g2 = self.lock_tower(t2);
            (g1, g2)
        } else {
            let g2 = self.lock_tower(t2);
            let g1 = self.lock_tower(t1);
            (g1, g2)
        };
        for i in lo1..lo1 + CLUSTER_SIZE {
            for j in lo2..lo2 + CLUSTER_SIZE {
                let pi = &mut g1.particles[i];
                let pj = &mut g2.particles[j];
                functor.aos(pi, pj, newton3);
                if !newton3 {
                    functor.aos(pj, pi, newton3);
                }
            }
        }
    }

    fn process_tower<F: Functor<P>>(&self, functor: &F, newton3: bool, t1: usize) {
        let entries: Vec<(usize, Vec<ClusterRef>)> = {
            let tower = self.lock_tower(t1);
            tower.neighbors.iter().cloned().enumerate().collect()
        };
        for (c1, partners) in entries {
            for (t2, c2) in partners {
                self.process_entry(functor, newton3, t1, c1, t2 as usize, c2 as usize);
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
        match plan.traversal {
            TraversalKind::VerletClusters => {
                if plan.newton3 {
                    return Err(not_applicable("verletClusters runs without newton3 only"));
                }
            }
            TraversalKind::VerletClustersColoring => {}
            _ => {
                return Err(not_applicable(
                    "cluster lists run verletClusters/verletClustersColoring only",
                ))
            }
        }
        if plan.layout != DataLayout::Aos {
            return Err(not_applicable("cluster traversals support the aos layout only"));
        }
        check_functor_mode(functor, plan.newton3, plan.traversal)?;

        let stale = !self.built
            || !self.pending.is_empty()
            || self.policy.rebuild_reason(true, || self.moved_too_far()).is_some();
        if stale {
            tracing::debug!("cluster list rebuild triggered");
            self.build();
        }
        self.policy.note_step();

        functor.init_traversal();
        {
            let shared: &F = &*functor;
            match plan.traversal {
                TraversalKind::VerletClusters => {
                    (0..self.towers.len())
                        .into_par_iter()
                        .for_each(|t| self.process_tower(shared, false, t));
                }
                TraversalKind::VerletClustersColoring => {
                    // Stride 3 per axis: a tower's entries reach one tower
                    // out, so write sets of same-color towers stay disjoint.
                    let mut colors: Vec<Vec<usize>> = vec![Vec::new(); 9];
                    for t in 0..self.towers.len() {
                        let x = t % self.tower_dims[0];
                        let y = t / self.tower_dims[0];
                        colors[(x % 3) + 3 * (y % 3)].push(t);
                    }
                    for color in colors.into_iter().filter(|c| !c.is_empty()) {
                        color
                            .par_iter()
                            .for_each(|&t| self.process_tower(shared, plan.newton3, t));
                    }
                }
                _ => unreachable!("validated above"),
            }
        }
        functor.end_traversal(plan.newton3);
        Ok(())
    }
}

impl<P: Particle> ParticleContainer<P> for VerletClusterLists<P> {
    fn add_particle(&mut self, p: P) -> Result<(), ContainerError> {
        if !self.position_in_box(p.position()) {
            return Err(ContainerError::OutOfDomain { id: p.id(), position: p.position() });
        }
        self.pending.push(p);
        self.policy.mark_dirty();
        Ok(())
    }

    fn add_or_update_halo_particle(&mut self, p: P) {
        for q in &mut self.pending {
            if q.id() == p.id() && q.ownership() == Ownership::Halo {
                *q = p;
                return;
            }
        }
        for t in 0..self.towers.len() {
            let mut tower = self.lock_tower(t);
            for q in &mut tower.particles {
                if q.id() == p.id() && q.ownership() == Ownership::Halo {
                    *q = p;
                    return;
                }
            }
        }
        self.pending.push(p);
        self.policy.mark_dirty();
    }

    fn update_container(&mut self) -> (Vec<P>, bool) {
        let all = self.drain_real_particles();
        let mut leavers = Vec::new();
        let mut kept = Vec::new();
        let mut structural = false;
        for p in all {
            match p.ownership() {
                Ownership::Halo => structural = true,
                _ if !self.position_in_box(p.position()) => {
                    leavers.push(p);
                    structural = true;
                }
                _ => kept.push(p),
            }
        }
        self.pending = kept;
        self.policy.mark_dirty();
        (leavers, structural)
    }

    fn num_particles(&self) -> usize {
        let towered: usize = (0..self.towers.len())
            .map(|t| self.lock_tower(t).particles.iter().filter(|p| !p.is_dummy()).count())
            .sum();
        towered + self.pending.len()
    }

    fn for_each(&mut self, behavior: IteratorBehavior, f: &mut dyn FnMut(&mut P)) {
        for p in &mut self.pending {
            if behavior.accepts(p.ownership()) {
                f(p);
            }
        }
        for t in 0..self.towers.len() {
            let mut tower = self.towers[t].lock().expect("tower lock poisoned");
            for p in &mut tower.particles {
                if behavior.accepts(p.ownership()) {
                    f(p);
                }
            }
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
