//! End-to-end scenarios
//!
//! Concrete seed cases: the near-wall Lennard-Jones pair driven through the
//! Verlet container across moves inside the skin, force cancellation on a
//! lattice interior, direct-sum call counts, the sliced fallback on a tiny
//! grid, rebuild accounting, and the two-subdomain split that must reproduce
//! the single-domain scalars.

use std::ops::Range;

use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};

use pairgrid::functors::{LennardJones, PairCounter};
use pairgrid::selector::{ContainerKind, TraversalPlan};
use pairgrid::soa::{SoaBuffer, SoaView};
use pairgrid::{
    geometry, Attr, CellBlock, DataLayout, DirectSum, Functor, IteratorBehavior, LinkedCells,
    Particle, ParticleContainer, PointParticle, TraversalKind, VerletLists, V3,
};

fn plan(
    container: ContainerKind,
    traversal: TraversalKind,
    layout: DataLayout,
    newton3: bool,
) -> TraversalPlan {
    TraversalPlan { container, traversal, layout, newton3, cell_size_factor: 1.0 }
}

// ============================================================================
// S1: near-wall LJ pair through the Verlet container, moving inside the skin
// ============================================================================

#[test]
fn s1_near_wall_lj_pair_across_skin_moves() -> Result<()> {
    let cutoff = 1.0;
    let skin = 0.2;
    let mut vl = VerletLists::<PointParticle>::new([0.0; 3], [10.0; 3], cutoff, skin, 20)?;
    vl.add_particle(PointParticle::new([9.99, 5.0, 5.0], 0))?;
    vl.add_particle(PointParticle::new([9.99, 5.5, 5.0], 1))?;

    let mut lj = LennardJones::new(cutoff, 1.0, 1.0, 0.1);
    let p = plan(ContainerKind::VerletLists, TraversalKind::Verlet, DataLayout::Aos, true);

    for step in 0..3 {
        if step > 0 {
            // Shift both particles by skin/3 in -x; the separation stays 0.5
            // and the displacement stays legal for the list.
            vl.for_each(IteratorBehavior::OwnedOnly, &mut |q| {
                let mut r = q.position();
                r[0] -= skin / 3.0;
                q.set_position(r);
            });
        }
        // The integrating driver clears forces between steps.
        vl.for_each(IteratorBehavior::OwnedOnly, &mut |q| q.set_force([0.0; 3]));
        vl.iterate_pairwise(&mut lj, &p)?;
    }

    // At r = 0.5 with epsilon = sigma = 1: |F| = 390144, U = 16128.1 (with
    // the 0.1 shift), virial = 195072.
    let mut forces = Vec::new();
    vl.for_each(IteratorBehavior::OwnedOnly, &mut |q| forces.push((q.id(), q.force())));
    forces.sort_by_key(|(id, _)| *id);
    for (_, f) in &forces {
        assert!((geometry::norm2(*f).sqrt() - 390144.0).abs() < 1e-5);
        assert_eq!(f[0], 0.0);
        assert_eq!(f[2], 0.0);
    }
    assert!((forces[0].1[1] + forces[1].1[1]).abs() < 1e-9, "reaction forces must cancel");
    assert!((lj.potential_energy()? - 16128.1).abs() < 1e-7);
    assert!((lj.virial()? - 195072.0).abs() < 1e-5);
    Ok(())
}

// ============================================================================
// S2: lattice interior force cancellation
// ============================================================================

/// Symmetric unit functor: the force on `i` is the displacement `r_i - r_j`.
/// Interior lattice sites see mirror-image neighbors and must cancel exactly.
struct UnitFunctor;

const UNIT_NEEDED: &[Attr] = &[
    Attr::PosX,
    Attr::PosY,
    Attr::PosZ,
    Attr::ForceX,
    Attr::ForceY,
    Attr::ForceZ,
    Attr::Ownership,
];

impl<P: Particle> Functor<P> for UnitFunctor {
    fn aos(&self, i: &mut P, j: &mut P, newton3: bool) {
        let dr = geometry::sub(i.position(), j.position());
        if geometry::norm2(dr) > 1.1 * 1.1 {
            return;
        }
        i.add_force(dr);
        if newton3 {
            j.sub_force(dr);
        }
    }

    fn soa_single(&self, _soa: SoaView<'_>, _newton3: bool) {
        unreachable!("aos-only test functor");
    }

    fn soa_pair(&self, _a: SoaView<'_>, _b: SoaView<'_>, _newton3: bool, _r_hat: Option<V3>) {
        unreachable!("aos-only test functor");
    }

    fn soa_verlet(
        &self,
        _soa: &mut SoaBuffer,
        _neighbors: &[Vec<u32>],
        _rows: Range<usize>,
        _newton3: bool,
    ) {
        unreachable!("aos-only test functor");
    }

    fn needed_attrs(&self) -> &'static [Attr] {
        UNIT_NEEDED
    }

    fn computed_attrs(&self) -> &'static [Attr] {
        &[Attr::ForceX, Attr::ForceY, Attr::ForceZ]
    }
}

#[test]
fn s2_lattice_interior_forces_cancel() -> Result<()> {
    const N: usize = 30;
    let mut lc =
        LinkedCells::<PointParticle>::new([-0.5; 3], [N as f64 - 0.5; 3], 1.1, 0.0, 1.0)?;
    let mut id = 0u64;
    for z in 0..N {
        for y in 0..N {
            for x in 0..N {
                lc.add_particle(PointParticle::new([x as f64, y as f64, z as f64], id))?;
                id += 1;
            }
        }
    }

    let mut functor = UnitFunctor;
    lc.iterate_pairwise(
        &mut functor,
        &plan(ContainerKind::LinkedCells, TraversalKind::C08, DataLayout::Aos, true),
    )?;

    let interior = |c: f64| c >= 1.0 && c <= (N - 2) as f64;
    let mut checked_interior = 0usize;
    let mut boundary_nonzero = 0usize;
    lc.for_each(IteratorBehavior::OwnedOnly, &mut |p| {
        let r = p.position();
        if interior(r[0]) && interior(r[1]) && interior(r[2]) {
            assert_eq!(p.force(), [0.0; 3], "interior particle at {r:?}");
            checked_interior += 1;
        } else if p.force() != [0.0; 3] {
            boundary_nonzero += 1;
        }
    });
    assert_eq!(checked_interior, (N - 2) * (N - 2) * (N - 2));
    assert!(boundary_nonzero > 0);
    Ok(())
}

// ============================================================================
// S3: direct-sum call counts
// ============================================================================

#[test]
fn s3_direct_sum_call_counts() -> Result<()> {
    let mut ds = DirectSum::<PointParticle>::new([0.0; 3], [10.0; 3], 3.0);
    for k in 0..20 {
        ds.add_particle(PointParticle::new([1.0 + 0.01 * k as f64, 1.0, 1.0], k))?;
    }
    for k in 0..10 {
        ds.add_or_update_halo_particle(PointParticle::halo([1.0 + 0.01 * k as f64, 1.3, 1.0], 100 + k));
    }

    let mut counter = PairCounter::new(f64::INFINITY);
    ds.iterate_pairwise(
        &mut counter,
        &plan(ContainerKind::DirectSum, TraversalKind::DirectSum, DataLayout::Aos, true),
    )?;
    assert_eq!(counter.visits().len(), 20 * 19 / 2 + 20 * 10);

    let mut counter = PairCounter::new(f64::INFINITY);
    ds.iterate_pairwise(
        &mut counter,
        &plan(ContainerKind::DirectSum, TraversalKind::DirectSum, DataLayout::Soa, true),
    )?;
    assert_eq!(counter.soa_single_calls(), 1, "one self call");
    assert_eq!(counter.soa_pair_calls(), 1, "one cross call");
    Ok(())
}

// ============================================================================
// S4: sliced fallback on a tiny grid
// ============================================================================

#[test]
fn s4_sliced_falls_back_and_matches_c08() -> Result<()> {
    // One interior cell per axis: at most two anchor layers, so at most two
    // slabs regardless of the worker count.
    let block = CellBlock::new([0.0; 3], [1.0; 3], 0.8, 0.2, 1.0)?;
    assert_eq!(block.dims(), [3, 3, 3]);
    let sliced = pairgrid::traversal::SlicedTraversal::new(&block, DataLayout::Aos, true)
        .map_err(|e| anyhow::anyhow!(e))?;
    assert!(sliced.planned_slabs() <= 2);

    let mut rng = StdRng::seed_from_u64(4);
    let particles: Vec<PointParticle> = (0..40)
        .map(|id| {
            PointParticle::new(
                [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)],
                id,
            )
        })
        .collect();

    let mut counts = Vec::new();
    for traversal in [TraversalKind::Sliced, TraversalKind::C08] {
        let mut lc = LinkedCells::<PointParticle>::new([0.0; 3], [1.0; 3], 0.8, 0.2, 1.0)?;
        for p in &particles {
            lc.add_particle(*p)?;
        }
        let mut counter = PairCounter::new(f64::INFINITY);
        lc.iterate_pairwise(
            &mut counter,
            &plan(ContainerKind::LinkedCells, traversal, DataLayout::Aos, true),
        )?;
        counts.push(counter.unordered_counts());
    }
    assert_eq!(counts[0], counts[1]);
    Ok(())
}

// ============================================================================
// S5: rebuild accounting
// ============================================================================

#[test]
fn s5_rebuild_frequency_accounting() -> Result<()> {
    let k = 4usize;
    let mut vl = VerletLists::<PointParticle>::new([0.0; 3], [10.0; 3], 1.0, 0.2, k)?;
    vl.add_particle(PointParticle::new([5.0, 5.0, 5.0], 0))?;
    vl.add_particle(PointParticle::new([5.4, 5.0, 5.0], 1))?;

    let p = plan(ContainerKind::VerletLists, TraversalKind::Verlet, DataLayout::Aos, true);
    let mut counter = PairCounter::new(f64::INFINITY);
    for _ in 0..k {
        vl.iterate_pairwise(&mut counter, &p)?;
    }
    assert_eq!(vl.rebuilds(), 1, "exactly the initial build within one period");
    vl.iterate_pairwise(&mut counter, &p)?;
    assert_eq!(vl.rebuilds(), 2, "the counter expires after k steps");

    // Forcing invalidation rebuilds regardless of the counter.
    vl.invalidate_lists();
    vl.iterate_pairwise(&mut counter, &p)?;
    assert_eq!(vl.rebuilds(), 3);
    Ok(())
}

// ============================================================================
// S6: split domain must reproduce the single-domain scalars
// ============================================================================

fn jittered_cloud(seed: u64) -> Vec<PointParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = Vec::new();
    let mut id = 0u64;
    for z in 0..12 {
        for y in 0..12 {
            for x in 0..12 {
                let r = [
                    0.4 + 0.8 * x as f64 + rng.gen_range(-0.1..0.1),
                    0.4 + 0.8 * y as f64 + rng.gen_range(-0.1..0.1),
                    0.4 + 0.8 * z as f64 + rng.gen_range(-0.1..0.1),
                ];
                out.push(PointParticle::new(r, id));
                id += 1;
            }
        }
    }
    out
}

#[test]
fn s6_split_domain_matches_single_domain() -> Result<()> {
    let cutoff = 1.0;
    let skin = 0.2;
    let cloud = jittered_cloud(0x51);
    let box_max = [10.0, 10.0, 10.0];
    let split_x = 5.0;
    let p = plan(ContainerKind::LinkedCells, TraversalKind::C08, DataLayout::Aos, true);

    // Single domain.
    let mut single = LinkedCells::<PointParticle>::new([0.0; 3], box_max, cutoff, skin, 1.0)?;
    for q in &cloud {
        single.add_particle(*q)?;
    }
    let mut lj = LennardJones::new(cutoff, 1.0, 1.0, 0.0);
    single.iterate_pairwise(&mut lj, &p)?;
    let u_single = lj.potential_energy()?;
    let v_single = lj.virial()?;
    let mut f_single: Vec<(u64, V3)> = Vec::new();
    single.for_each(IteratorBehavior::OwnedOnly, &mut |q| f_single.push((q.id(), q.force())));
    f_single.sort_by_key(|(id, _)| *id);

    // Two subdomains split at x = 5, exchanging halos across the plane.
    let mut left =
        LinkedCells::<PointParticle>::new([0.0; 3], [split_x, 10.0, 10.0], cutoff, skin, 1.0)?;
    let mut right =
        LinkedCells::<PointParticle>::new([split_x, 0.0, 0.0], box_max, cutoff, skin, 1.0)?;
    for q in &cloud {
        if q.position()[0] < split_x {
            left.add_particle(*q)?;
            if q.position()[0] >= split_x - cutoff {
                right.add_or_update_halo_particle(PointParticle::halo(q.position(), q.id()));
            }
        } else {
            right.add_particle(*q)?;
            if q.position()[0] < split_x + cutoff {
                left.add_or_update_halo_particle(PointParticle::halo(q.position(), q.id()));
            }
        }
    }

    let mut lj_left = LennardJones::new(cutoff, 1.0, 1.0, 0.0);
    let mut lj_right = LennardJones::new(cutoff, 1.0, 1.0, 0.0);
    left.iterate_pairwise(&mut lj_left, &p)?;
    right.iterate_pairwise(&mut lj_right, &p)?;

    let u_split = lj_left.potential_energy()? + lj_right.potential_energy()?;
    let v_split = lj_left.virial()? + lj_right.virial()?;
    assert!((u_split - u_single).abs() < 1e-6, "{u_split} vs {u_single}");
    assert!((v_split - v_single).abs() < 1e-6, "{v_split} vs {v_single}");

    let mut f_split: Vec<(u64, V3)> = Vec::new();
    left.for_each(IteratorBehavior::OwnedOnly, &mut |q| f_split.push((q.id(), q.force())));
    right.for_each(IteratorBehavior::OwnedOnly, &mut |q| f_split.push((q.id(), q.force())));
    f_split.sort_by_key(|(id, _)| *id);

    assert_eq!(f_single.len(), f_split.len());
    for ((id_a, fa), (id_b, fb)) in f_single.iter().zip(&f_split) {
        assert_eq!(id_a, id_b);
        let diff = geometry::norm2(geometry::sub(*fa, *fb)).sqrt();
        assert!(diff < 1e-6, "force mismatch on particle {id_a}: {fa:?} vs {fb:?}");
    }
    Ok(())
}

// ============================================================================
// Invariant 5: traversal-independent scalars
// ============================================================================

#[test]
fn scalars_agree_across_traversals_and_layouts() -> Result<()> {
    let cloud = jittered_cloud(0x99);
    let combos = [
        (TraversalKind::C08, DataLayout::Aos, true),
        (TraversalKind::C08, DataLayout::Soa, true),
        (TraversalKind::C08, DataLayout::Aos, false),
        (TraversalKind::C18, DataLayout::Aos, true),
        (TraversalKind::C18, DataLayout::Soa, false),
        (TraversalKind::C01, DataLayout::Aos, false),
        (TraversalKind::C04, DataLayout::Aos, true),
        (TraversalKind::C04Soa, DataLayout::Soa, true),
        (TraversalKind::Sliced, DataLayout::Aos, true),
    ];

    let mut reference: Option<(f64, f64)> = None;
    for (traversal, layout, newton3) in combos {
        let mut lc = LinkedCells::<PointParticle>::new([0.0; 3], [10.0; 3], 1.0, 0.2, 1.0)?;
        for q in &cloud {
            lc.add_particle(*q)?;
        }
        let mut lj = LennardJones::new(1.0, 1.0, 1.0, 0.0);
        lc.iterate_pairwise(
            &mut lj,
            &plan(ContainerKind::LinkedCells, traversal, layout, newton3),
        )?;
        let scalars = (lj.potential_energy()?, lj.virial()?);
        match reference {
            None => reference = Some(scalars),
            Some((u0, v0)) => {
                assert!(
                    (scalars.0 - u0).abs() < 1e-8 * u0.abs().max(1.0),
                    "{traversal:?} {layout:?} n3={newton3}: potential {} vs {u0}",
                    scalars.0
                );
                assert!(
                    (scalars.1 - v0).abs() < 1e-8 * v0.abs().max(1.0),
                    "{traversal:?} {layout:?} n3={newton3}: virial {} vs {v0}",
                    scalars.1
                );
            }
        }
    }
    Ok(())
}
