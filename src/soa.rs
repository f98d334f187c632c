//! Columnar particle storage
//!
//! One [`SoaBuffer`] holds one column per [`Attr`]. Cells carry a buffer as a
//! side-car that is refilled at the start of every SoA traversal; the Verlet
//! SoA representation concatenates *all* cells into one global buffer. The
//! gather/scatter helpers here are driven by the attribute sets a functor
//! declares, so loading reduces to straight column writes.

use crate::particle::{Attr, Ownership, Particle};
use crate::{Real, V3};

/// Structure-of-arrays buffer: one column per attribute, all of equal length.
#[derive(Debug, Clone, Default)]
pub struct SoaBuffer {
    /// Position columns.
    pub x: Vec<Real>,
    /// Position columns.
    pub y: Vec<Real>,
    /// Position columns.
    pub z: Vec<Real>,
    /// Force columns.
    pub fx: Vec<Real>,
    /// Force columns.
    pub fy: Vec<Real>,
    /// Force columns.
    pub fz: Vec<Real>,
    /// Particle ids.
    pub id: Vec<u64>,
    /// Ownership flags.
    pub ownership: Vec<Ownership>,
}

/// Borrowed view of a buffer (or buffer range) handed to SoA kernels:
/// positions, ids and ownership are read-only, forces are writable.
pub struct SoaView<'a> {
    /// Position columns.
    pub x: &'a [Real],
    /// Position columns.
    pub y: &'a [Real],
    /// Position columns.
    pub z: &'a [Real],
    /// Force columns (written by the kernel).
    pub fx: &'a mut [Real],
    /// Force columns (written by the kernel).
    pub fy: &'a mut [Real],
    /// Force columns (written by the kernel).
    pub fz: &'a mut [Real],
    /// Particle ids.
    pub id: &'a [u64],
    /// Ownership flags.
    pub ownership: &'a [Ownership],
}

impl SoaBuffer {
    /// Number of rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the buffer has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Drop all rows, keeping capacity.
    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
        self.z.clear();
        self.fx.clear();
        self.fy.clear();
        self.fz.clear();
        self.id.clear();
        self.ownership.clear();
    }

    /// Resize every column to `n` rows (new rows zeroed / dummy-flagged).
    pub fn resize(&mut self, n: usize) {
        self.x.resize(n, 0.0);
        self.y.resize(n, 0.0);
        self.z.resize(n, 0.0);
        self.fx.resize(n, 0.0);
        self.fy.resize(n, 0.0);
        self.fz.resize(n, 0.0);
        self.id.resize(n, u64::MAX);
        self.ownership.resize(n, Ownership::Dummy);
    }

    /// Full-buffer mutable view.
    pub fn view(&mut self) -> SoaView<'_> {
        SoaView {
            x: &self.x,
            y: &self.y,
            z: &self.z,
            fx: &mut self.fx,
            fy: &mut self.fy,
            fz: &mut self.fz,
            id: &self.id,
            ownership: &self.ownership,
        }
    }

    /// Position of row `i`.
    #[inline]
    pub fn position(&self, i: usize) -> V3 {
        [self.x[i], self.y[i], self.z[i]]
    }
}

impl SoaView<'_> {
    /// Number of rows in the view.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the view has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Position of row `i`.
    #[inline]
    pub fn position(&self, i: usize) -> V3 {
        [self.x[i], self.y[i], self.z[i]]
    }

    /// Accumulate a force onto row `i`.
    #[inline]
    pub fn add_force(&mut self, i: usize, f: V3) {
        self.fx[i] += f[0];
        self.fy[i] += f[1];
        self.fz[i] += f[2];
    }

    /// Subtract a force from row `i` (Newton-3 reaction write).
    #[inline]
    pub fn sub_force(&mut self, i: usize, f: V3) {
        self.fx[i] -= f[0];
        self.fy[i] -= f[1];
        self.fz[i] -= f[2];
    }
}

// ============================================================================
// Attribute-driven gather / scatter
// ============================================================================

/// Gather the declared columns of `particles` into `soa` starting at `offset`.
///
/// The buffer must already span `offset + particles.len()` rows; the Verlet
/// builder uses the offset to concatenate all cells into one global buffer,
/// cell side-cars load with `offset = 0`.
pub fn gather<P: Particle>(particles: &[P], soa: &mut SoaBuffer, offset: usize, attrs: &[Attr]) {
    debug_assert!(soa.len() >= offset + particles.len(), "soa buffer too short");
    for attr in attrs {
        match attr {
            Attr::PosX => {
                for (k, p) in particles.iter().enumerate() {
                    soa.x[offset + k] = p.position()[0];
                }
            }
            Attr::PosY => {
                for (k, p) in particles.iter().enumerate() {
                    soa.y[offset + k] = p.position()[1];
                }
            }
            Attr::PosZ => {
                for (k, p) in particles.iter().enumerate() {
                    soa.z[offset + k] = p.position()[2];
                }
            }
            Attr::ForceX => {
                for (k, p) in particles.iter().enumerate() {
                    soa.fx[offset + k] = p.force()[0];
                }
            }
            Attr::ForceY => {
                for (k, p) in particles.iter().enumerate() {
                    soa.fy[offset + k] = p.force()[1];
                }
            }
            Attr::ForceZ => {
                for (k, p) in particles.iter().enumerate() {
                    soa.fz[offset + k] = p.force()[2];
                }
            }
            Attr::Id => {
                for (k, p) in particles.iter().enumerate() {
                    soa.id[offset + k] = p.id();
                }
            }
            Attr::Ownership => {
                for (k, p) in particles.iter().enumerate() {
                    soa.ownership[offset + k] = p.ownership();
                }
            }
        }
    }
}

/// Scatter the declared columns back into `particles` from `soa[offset..]`.
///
/// Only force columns are writable on a particle; requesting a read-only
/// column here is a programming error caught in debug builds.
pub fn scatter<P: Particle>(particles: &mut [P], soa: &SoaBuffer, offset: usize, attrs: &[Attr]) {
    debug_assert!(soa.len() >= offset + particles.len(), "soa buffer too short");
    for attr in attrs {
        match attr {
            Attr::ForceX => {
                for (k, p) in particles.iter_mut().enumerate() {
                    let mut f = p.force();
                    f[0] = soa.fx[offset + k];
                    p.set_force(f);
                }
            }
            Attr::ForceY => {
                for (k, p) in particles.iter_mut().enumerate() {
                    let mut f = p.force();
                    f[1] = soa.fy[offset + k];
                    p.set_force(f);
                }
            }
            Attr::ForceZ => {
                for (k, p) in particles.iter_mut().enumerate() {
                    let mut f = p.force();
                    f[2] = soa.fz[offset + k];
                    p.set_force(f);
                }
            }
            _ => debug_assert!(false, "attribute {attr:?} is not writable"),
        }
    }
}
