//! Force kernels: the tabulated short-range split factors and the softened pair force.
//!
//! The tree computes only the short-range part of gravity when a mesh solver
//! handles the long range. The split multiplies the Newtonian pair force by
//! `erfc(u) + 2u/sqrt(pi) exp(-u^2)` and the potential by `erfc(u)`, with
//! `u = r / (2 asmth)`. Both are tabulated once per process.

use std::{f64::consts::PI, sync::OnceLock};

use log::debug;

use crate::settings::ShortRangeSettings;

/// Length of the short-range lookup tables.
pub const NTAB: usize = 1000;

static SHORTRANGE_TABLE: OnceLock<ShortRangeTable> = OnceLock::new();

#[derive(Clone, Debug, PartialEq)]
pub struct ShortRangeTable {
    force: Vec<f64>,
    potential: Vec<f64>,
    tidal: Vec<f64>,
}

impl ShortRangeTable {
    /// Tabulates the split factors at bucket midpoints `u = 3 (i + 0.5) / size`.
    pub fn new(size: usize) -> Self {
        let mut force = Vec::with_capacity(size);
        let mut potential = Vec::with_capacity(size);
        let mut tidal = Vec::with_capacity(size);
        for i in 0..size {
            let u = 3.0 / size as f64 * (i as f64 + 0.5);
            let gauss = (-u * u).exp();
            force.push(libm::erfc(u) + 2.0 * u / PI.sqrt() * gauss);
            potential.push(libm::erfc(u));
            tidal.push(4.0 * u * u * u / PI.sqrt() * gauss);
        }
        Self {
            force,
            potential,
            tidal,
        }
    }

    /// The process-wide table. Built on first use, shared read-only afterwards.
    pub fn global() -> &'static ShortRangeTable {
        SHORTRANGE_TABLE.get_or_init(|| {
            debug!("Tabulating short-range force split with {NTAB} buckets");
            Self::new(NTAB)
        })
    }

    pub fn len(&self) -> usize {
        self.force.len()
    }

    pub fn is_empty(&self) -> bool {
        self.force.is_empty()
    }

    /// Multiplier turning a distance into a bucket index for split scale `asmth`.
    pub fn bucket_scale(&self, asmth: f64) -> f64 {
        0.5 / asmth * (self.len() as f64 / 3.0)
    }

    /// Out-of-range buckets suppress the pair completely.
    pub fn force_factor(&self, bucket: usize) -> f64 {
        self.force.get(bucket).copied().unwrap_or(0.0)
    }

    pub fn potential_factor(&self, bucket: usize) -> f64 {
        self.potential.get(bucket).copied().unwrap_or(0.0)
    }

    pub fn tidal_factor(&self, bucket: usize) -> f64 {
        self.tidal.get(bucket).copied().unwrap_or(0.0)
    }
}

/// The short-range split bound to a concrete box and mesh.
#[derive(Clone, Copy, Debug)]
pub struct ShortRangeSplit {
    table: &'static ShortRangeTable,
    bucket_scale: f64,
    rcut: f64,
    rcut2: f64,
}

impl ShortRangeSplit {
    pub fn new(settings: &ShortRangeSettings, box_size: f64) -> Self {
        let table = ShortRangeTable::global();
        let rcut = settings.cutoff_radius(box_size);
        Self {
            table,
            bucket_scale: table.bucket_scale(settings.smoothing_scale(box_size)),
            rcut,
            rcut2: rcut * rcut,
        }
    }

    pub fn rcut(&self) -> f64 {
        self.rcut
    }

    pub fn rcut2(&self) -> f64 {
        self.rcut2
    }

    pub fn bucket(&self, r: f64) -> usize {
        (self.bucket_scale * r) as usize
    }

    /// Force and potential multipliers at distance `r`, `None` beyond the table.
    pub fn factors(&self, r: f64) -> Option<(f64, f64)> {
        let bucket = self.bucket(r);
        (bucket < self.table.len()).then(|| {
            (
                self.table.force_factor(bucket),
                self.table.potential_factor(bucket),
            )
        })
    }
}

/// Pair contribution per unit displacement (`force`) and the pair potential.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PairTerms {
    pub force: f64,
    pub potential: f64,
}

/// Newtonian pair terms beyond `h`, cubic-spline softened terms inside.
///
/// The acceleration on the query is `dx * force` where `dx` points from the
/// query to the source.
pub fn softened_pair(mass: f64, r: f64, h: f64) -> PairTerms {
    if r >= h {
        return PairTerms {
            force: mass / (r * r * r),
            potential: -mass / r,
        };
    }

    let h_inv = 1.0 / h;
    let h3_inv = h_inv * h_inv * h_inv;
    let u = r * h_inv;
    let (fac, wp) = if u < 0.5 {
        (
            32.0 / 3.0 + u * u * (32.0 * u - 38.4),
            -2.8 + u * u * (16.0 / 3.0 + u * u * (6.4 * u - 9.6)),
        )
    } else {
        (
            64.0 / 3.0 - 48.0 * u + 38.4 * u * u
                - 32.0 / 3.0 * u * u * u
                - 1.0 / 15.0 / (u * u * u),
            -3.2 + 1.0 / 15.0 / u
                + u * u * (32.0 / 3.0 + u * (-16.0 + u * (9.6 - 32.0 / 15.0 * u))),
        )
    };
    PairTerms {
        force: mass * h3_inv * fac,
        potential: mass * h_inv * wp,
    }
}

/// Pair kernel shared by the tree walk and direct summation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PairKernel {
    split: Option<ShortRangeSplit>,
}

impl PairKernel {
    pub fn new(split: Option<ShortRangeSplit>) -> Self {
        Self { split }
    }

    pub fn newtonian() -> Self {
        Self { split: None }
    }

    pub fn split(&self) -> Option<&ShortRangeSplit> {
        self.split.as_ref()
    }

    /// Returns `None` when the short-range cutoff excludes the pair.
    pub fn evaluate(&self, mass: f64, r2: f64, h: f64) -> Option<PairTerms> {
        let r = r2.sqrt();
        let terms = softened_pair(mass, r, h);
        match &self.split {
            None => Some(terms),
            Some(split) => split.factors(r).map(|(f, p)| PairTerms {
                force: terms.force * f,
                potential: terms.potential * p,
            }),
        }
    }
}
