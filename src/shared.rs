//! Particle data shared by the tree, the walk engine and the gravity policy.

use nalgebra::SVector;

pub type Vec3 = SVector<f64, 3>;

/// Particle species. The discriminant is the index into per-type tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ParticleType {
    Gas = 0,
    Halo = 1,
    Disk = 2,
    Bulge = 3,
    Star = 4,
    Boundary = 5,
}

impl ParticleType {
    pub const COUNT: usize = 6;

    pub const ALL: [ParticleType; Self::COUNT] = [
        ParticleType::Gas,
        ParticleType::Halo,
        ParticleType::Disk,
        ParticleType::Bulge,
        ParticleType::Star,
        ParticleType::Boundary,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Read access the walk engine needs from whatever it walks for.
pub trait Particle {
    fn position(&self) -> &Vec3;
}

/// A mass-bearing particle as the gravity core sees it.
///
/// Position, mass, type and the gas smoothing length are inputs. `grav_pm` and
/// `pm_potential` are supplied by the long-range solver before a force pass.
/// The remaining fields are written by the pass itself.
#[derive(Clone, Debug, PartialEq)]
pub struct GravParticle {
    pub id: u64,
    pub position: Vec3,
    pub mass: f64,
    pub ptype: ParticleType,
    pub hsml: f64,
    pub old_acc: f64,
    pub grav_accel: Vec3,
    pub total_accel: Vec3,
    pub potential: f64,
    pub grav_pm: Vec3,
    pub pm_potential: f64,
    pub grav_cost: u64,
}

impl GravParticle {
    pub fn new(id: u64, position: Vec3, mass: f64, ptype: ParticleType) -> Self {
        Self {
            id,
            position,
            mass,
            ptype,
            hsml: 0.0,
            old_acc: 0.0,
            grav_accel: Vec3::zeros(),
            total_accel: Vec3::zeros(),
            potential: 0.0,
            grav_pm: Vec3::zeros(),
            pm_potential: 0.0,
            grav_cost: 0,
        }
    }

    pub fn with_hsml(mut self, hsml: f64) -> Self {
        self.hsml = hsml;
        self
    }

    /// Clears the fields a force pass writes. `old_acc` survives, it is an input.
    pub fn reset_gravity(&mut self) {
        self.grav_accel = Vec3::zeros();
        self.total_accel = Vec3::zeros();
        self.potential = 0.0;
        self.grav_cost = 0;
    }
}

impl Particle for GravParticle {
    fn position(&self) -> &Vec3 {
        &self.position
    }
}

/// Nearest-image mapping for a cubic periodic box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeriodicBox {
    size: f64,
    periodic: bool,
}

impl PeriodicBox {
    pub fn new(size: f64, periodic: bool) -> Self {
        Self { size, periodic }
    }

    pub fn open() -> Self {
        Self {
            size: 0.0,
            periodic: false,
        }
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    /// Wraps one displacement component into (-L/2, L/2].
    pub fn nearest(&self, d: f64) -> f64 {
        if !self.periodic {
            return d;
        }
        let half = 0.5 * self.size;
        let mut w = d - self.size * (d / self.size).round();
        if w <= -half {
            w += self.size;
        } else if w > half {
            w -= self.size;
        }
        w
    }

    pub fn nearest_vec(&self, d: Vec3) -> Vec3 {
        d.map(|c| self.nearest(c))
    }
}
