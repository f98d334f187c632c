//! Verlet-list machinery shared by the three list containers
//!
//! Neighbor lists need particle references that stay valid while particles
//! move: a raw index into a cell dies with the first rebinning. The engine
//! therefore keys lists by **generational handles** into a slot arena — the
//! arena index names the slot, the generation detects reuse, and a stale
//! handle is an invariant violation, never a silent wrong particle.
//!
//! The arena wraps each slot in its own mutex so traversals can lock exactly
//! the two particles of a pair visit, in ascending slot order. Sequential
//! passes pay one uncontended lock per access.
//!
//! Also here: the rebuild bookkeeping every list container shares (frequency
//! counter, structural dirt, Newton-3 pinning, displacement trigger), and the
//! candidate-pair sweep that replays a c08-ordered pass over a temporary cell
//! grid — the list builders and the validity checker both ride on it.

use std::sync::{Mutex, MutexGuard};

use crate::cell_block::{CellBlock, GridError};
use crate::geometry;
use crate::particle::Particle;
use crate::traversal::c08_base_pairs;
use crate::{Real, V3};

mod cells;
mod clusters;
mod lists;

pub use cells::VerletListsCells;
pub use clusters::VerletClusterLists;
pub use lists::VerletLists;

/// Stable reference to a particle in a slot arena.
///
/// Remains valid across position updates and cell moves; dies (detectably)
/// when the particle is removed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParticleHandle {
    index: u32,
    generation: u32,
}

impl ParticleHandle {
    /// Slot index within the arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

struct Slot<P> {
    generation: u32,
    particle: Option<P>,
}

/// Generational slot arena with per-slot locks.
pub(crate) struct Arena<P> {
    slots: Vec<Mutex<Slot<P>>>,
    free: Vec<u32>,
    live: usize,
}

impl<P: Particle> Arena<P> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn insert(&mut self, p: P) -> ParticleHandle {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let mut slot = self.slots[index as usize].lock().expect("arena slot poisoned");
            debug_assert!(slot.particle.is_none());
            slot.particle = Some(p);
            return ParticleHandle { index, generation: slot.generation };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Mutex::new(Slot { generation: 0, particle: Some(p) }));
        ParticleHandle { index, generation: 0 }
    }

    pub fn remove(&mut self, h: ParticleHandle) -> Option<P> {
        let mut slot = self.slots.get(h.index())?.lock().expect("arena slot poisoned");
        if slot.generation != h.generation || slot.particle.is_none() {
            return None;
        }
        let p = slot.particle.take();
        slot.generation = slot.generation.wrapping_add(1);
        drop(slot);
        self.free.push(h.index);
        self.live -= 1;
        p
    }

    fn guard(&self, h: ParticleHandle) -> MutexGuard<'_, Slot<P>> {
        let slot = self.slots[h.index()].lock().expect("arena slot poisoned");
        assert!(
            slot.generation == h.generation && slot.particle.is_some(),
            "stale particle handle {h:?}"
        );
        slot
    }

    /// Read-only visit through a handle.
    pub fn read<R>(&self, h: ParticleHandle, f: impl FnOnce(&P) -> R) -> R {
        let slot = self.guard(h);
        f(slot.particle.as_ref().expect("checked live above"))
    }

    /// Mutating visit through a handle.
    pub fn with<R>(&self, h: ParticleHandle, f: impl FnOnce(&mut P) -> R) -> R {
        let mut slot = self.guard(h);
        f(slot.particle.as_mut().expect("checked live above"))
    }

    /// Mutating visit of two distinct particles. Locks are taken in ascending
    /// slot order so concurrent pair visits cannot form a circular wait; the
    /// closure receives the particles in argument order.
    pub fn with_pair<R>(
        &self,
        a: ParticleHandle,
        b: ParticleHandle,
        f: impl FnOnce(&mut P, &mut P) -> R,
    ) -> R {
        assert_ne!(a.index, b.index, "pair visit requires two distinct slots");
        let (mut ga, mut gb) = if a.index < b.index {
            let ga = self.guard(a);
            let gb = self.guard(b);
            (ga, gb)
        } else {
            let gb = self.guard(b);
            let ga = self.guard(a);
            (ga, gb)
        };
        f(
            ga.particle.as_mut().expect("checked live above"),
            gb.particle.as_mut().expect("checked live above"),
        )
    }

    /// Handles of all live slots, in slot order.
    pub fn handles(&self) -> Vec<ParticleHandle> {
        let mut out = Vec::with_capacity(self.live);
        for (index, slot) in self.slots.iter().enumerate() {
            let slot = slot.lock().expect("arena slot poisoned");
            if slot.particle.is_some() {
                out.push(ParticleHandle { index: index as u32, generation: slot.generation });
            }
        }
        out
    }

    /// Number of slots ever allocated (for dense per-slot side tables).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

// ============================================================================
// Rebuild policy
// ============================================================================

/// The rebuild triggers every Verlet container shares.
pub(crate) struct RebuildPolicy {
    frequency: usize,
    steps_since_build: usize,
    dirty: bool,
    built_newton3: Option<bool>,
    rebuilds: usize,
}

impl RebuildPolicy {
    pub fn new(frequency: usize) -> Self {
        Self {
            frequency: frequency.max(1),
            steps_since_build: 0,
            dirty: false,
            built_newton3: None,
            rebuilds: 0,
        }
    }

    /// Why a rebuild is due before the next traversal, if it is.
    /// `moved_too_far` is the "max displacement since build exceeds skin/2"
    /// predicate, evaluated lazily by the caller (it needs the positions).
    pub fn rebuild_reason(
        &self,
        newton3: bool,
        moved_too_far: impl FnOnce() -> bool,
    ) -> Option<&'static str> {
        match self.built_newton3 {
            None => return Some("no list built yet"),
            Some(n3) if n3 != newton3 => return Some("newton3 mode changed"),
            _ => {}
        }
        if self.dirty {
            return Some("particles were added or removed");
        }
        if self.steps_since_build >= self.frequency {
            return Some("rebuild frequency reached");
        }
        if moved_too_far() {
            return Some("particle moved more than half the skin");
        }
        None
    }

    pub fn note_built(&mut self, newton3: bool) {
        self.built_newton3 = Some(newton3);
        self.steps_since_build = 0;
        self.dirty = false;
        self.rebuilds += 1;
    }

    pub fn note_step(&mut self) {
        self.steps_since_build += 1;
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn rebuilds(&self) -> usize {
        self.rebuilds
    }
}

// ============================================================================
// Candidate-pair sweep
// ============================================================================

/// Replay a c08-ordered sweep over a temporary cell grid of the given
/// positions, visiting every candidate row pair from adjacent cells exactly
/// once (unordered). Distance filtering is the visitor's business — the
/// sweep only prunes by cell adjacency.
///
/// The list builders drive this with an appending visitor, the validity
/// checker with an asserting one.
pub(crate) fn for_each_candidate_pair(
    positions: &[V3],
    box_min: V3,
    box_max: V3,
    cutoff: Real,
    skin: Real,
    mut visit: impl FnMut(usize, usize),
) -> Result<(), GridError> {
    let block = CellBlock::new(box_min, box_max, cutoff, skin, 1.0)?;
    let dims = block.dims();

    let mut rows_by_cell: Vec<Vec<u32>> = vec![Vec::new(); block.num_cells()];
    for (row, &r) in positions.iter().enumerate() {
        rows_by_cell[block.index_of_position(r)].push(row as u32);
    }

    let pairs = c08_base_pairs(block.cell_length(), block.interaction_length());
    for z in 0..dims[2] - 1 {
        for y in 0..dims[1] - 1 {
            for x in 0..dims[0] - 1 {
                let base = geometry::flat_index([x, y, z], dims);
                let own = &rows_by_cell[base];
                for (k, &i) in own.iter().enumerate() {
                    for &j in &own[k + 1..] {
                        visit(i as usize, j as usize);
                    }
                }
                for bp in &pairs {
                    let c1 = geometry::flat_index(
                        [
                            (x as isize + bp.first[0]) as usize,
                            (y as isize + bp.first[1]) as usize,
                            (z as isize + bp.first[2]) as usize,
                        ],
                        dims,
                    );
                    let c2 = geometry::flat_index(
                        [
                            (x as isize + bp.second[0]) as usize,
                            (y as isize + bp.second[1]) as usize,
                            (z as isize + bp.second[2]) as usize,
                        ],
                        dims,
                    );
                    for &i in &rows_by_cell[c1] {
                        for &j in &rows_by_cell[c2] {
                            visit(i as usize, j as usize);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
