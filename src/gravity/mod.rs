//! Tree gravity: the short-range visitor, its finalisation step and the per-step driver.

pub mod postprocess;
pub mod shortrange;

use std::time::{Duration, Instant};

use log::{debug, info};

pub use postprocess::GravityPostProcess;
pub use shortrange::{GravityPolicy, GravityQuery, GravityResult, OpeningCriterion};

use crate::{
    comm::Communicator,
    error::{GravityError, Result},
    kernel::{PairKernel, ShortRangeSplit},
    settings::{GravitySettings, OpeningCriterionKind},
    shared::{GravParticle, ParticleType},
    softening::SofteningTable,
    tree::SpatialTree,
    treewalk::{TreeWalk, TreeWalkReport, TreeWalkSettings, TreeWalkTimings, TreeWalkVisitor},
};

#[derive(Clone, Debug, PartialEq)]
pub struct GravityReport {
    pub criterion: OpeningCriterion,
    /// Particle-node and particle-particle interactions summed over all ranks.
    pub interactions: u64,
    pub walk: TreeWalkReport,
    /// Time spent outside the walk phases: setup, reset and bookkeeping.
    pub misc: Duration,
}

/// Computes tree forces step after step, carrying the state that outlives one pass.
#[derive(Clone, Debug)]
pub struct GravityTree {
    settings: GravitySettings,
    /// The relative criterion needs an acceleration from a previous pass.
    has_old_acc: bool,
    step: u64,
    timings: TreeWalkTimings,
    misc: Duration,
    total_interactions: u64,
}

impl GravityTree {
    pub fn new(settings: GravitySettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            has_old_acc: false,
            step: 0,
            timings: TreeWalkTimings::default(),
            misc: Duration::ZERO,
            total_interactions: 0,
        })
    }

    pub fn settings(&self) -> &GravitySettings {
        &self.settings
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Cumulative walk timings over every pass so far.
    pub fn timings(&self) -> &TreeWalkTimings {
        &self.timings
    }

    pub fn misc_time(&self) -> Duration {
        self.misc
    }

    pub fn total_interactions(&self) -> u64 {
        self.total_interactions
    }

    /// Softening for the current scale factor. Trees must be built with the same table.
    pub fn softening_table(&self) -> SofteningTable {
        SofteningTable::new(&self.settings.softening, self.settings.time)
    }

    pub fn set_time(&mut self, time: f64) -> Result<()> {
        if !(time > 0.0) {
            return Err(GravityError::InvalidSettings(format!(
                "scale factor must be positive, got {time}"
            )));
        }
        self.settings.time = time;
        Ok(())
    }

    /// The criterion the next pass will use. The first pass under the relative
    /// criterion falls back to the geometric one.
    pub fn current_criterion(&self) -> OpeningCriterion {
        match self.settings.opening {
            OpeningCriterionKind::Relative if self.has_old_acc => OpeningCriterion::Relative {
                err_tol_force_acc: self.settings.err_tol_force_acc,
            },
            _ => OpeningCriterion::Geometric {
                theta: self.settings.theta,
            },
        }
    }

    pub fn policy(&self) -> GravityPolicy {
        let softening = self.softening_table();
        let split = self
            .settings
            .short_range
            .map(|s| ShortRangeSplit::new(&s, self.settings.box_size));
        GravityPolicy::new(
            self.current_criterion(),
            softening.clone(),
            PairKernel::new(split),
            self.settings.periodic_box(),
            self.settings.softening.adaptive_gas,
            GravityPostProcess::new(&self.settings, softening),
        )
    }

    /// Computes acceleration and potential of the particles listed in `active`.
    ///
    /// `grav_pm` and `pm_potential` must already hold the long-range part.
    /// Collective: every rank calls this with its own particles and tree.
    pub fn compute_forces<C: Communicator>(
        &mut self,
        tree: &SpatialTree,
        comm: &C,
        particles: &mut [GravParticle],
        active: &[usize],
    ) -> Result<GravityReport> {
        let start = Instant::now();
        let rank = comm.rank();

        if self.settings.softening.adaptive_gas {
            let bad = active
                .iter()
                .map(|&i| &particles[i])
                .find(|p| p.ptype == ParticleType::Gas && !(p.hsml > 0.0));
            // Every rank has to bail out together, or the others would wait in the walk.
            if comm.all_reduce_or(bad.is_some()) {
                let detail = match bad {
                    Some(p) => format!("particle {} has {}", p.id, p.hsml),
                    None => "found on another rank".to_string(),
                };
                return Err(GravityError::InvalidSettings(format!(
                    "adaptive gas softening needs a positive smoothing length, {detail}"
                )));
            }
        }

        let policy = self.policy();
        for &i in active {
            if policy.is_active(&particles[i]) {
                particles[i].reset_gravity();
            }
        }

        if rank == 0 {
            info!(
                "Begin tree force. step {} criterion {:?}",
                self.step,
                policy.criterion()
            );
        }

        let walk = TreeWalk::new(
            &policy,
            tree,
            comm,
            TreeWalkSettings {
                export_buffer_size: self.settings.export_buffer_size,
                step: self.step,
            },
        )
        .run(particles, active)?;

        if self.settings.opening == OpeningCriterionKind::Relative {
            self.has_old_acc = true;
        }

        let local: u64 = active.iter().map(|&i| particles[i].grav_cost).sum();
        let interactions = comm.all_reduce_sum(local);
        self.total_interactions += interactions;

        let misc = start.elapsed().saturating_sub(walk.timings.total());
        self.timings += walk.timings;
        self.misc += misc;
        self.step += 1;

        if rank == 0 {
            info!(
                "tree is done. {} interactions ({:.1} per particle)",
                interactions,
                interactions as f64 / walk.processed.max(1) as f64
            );
        }
        debug!(
            "Rank {rank}: walk {:?} import {:?} post {:?} wait {:?} comm {:?} misc {:?}",
            walk.timings.local,
            walk.timings.import,
            walk.timings.postprocess,
            walk.timings.wait,
            walk.timings.comm,
            misc
        );

        Ok(GravityReport {
            criterion: policy.criterion(),
            interactions,
            walk,
            misc,
        })
    }
}
