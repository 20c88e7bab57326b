#![allow(dead_code)]

use gravtree::{
    comm::LocalCluster,
    direct::DirectSummation,
    error::Result,
    gravity::{GravityReport, GravityTree},
    settings::GravitySettings,
    shared::{GravParticle, ParticleType, Vec3},
    tree::{
        build::TreeBuilder,
        domain::{DomainDecomposition, DomainSettings, Region},
    },
};
use rand::{Rng, SeedableRng, rngs::StdRng};

pub fn random_particles(n: usize, seed: u64, box_size: f64) -> Vec<GravParticle> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n as u64)
        .map(|id| {
            let position = Vec3::new(rng.random(), rng.random(), rng.random()) * box_size;
            let mass = rng.random_range(0.5..1.5) / n as f64;
            let ptype = if id % 5 == 0 {
                ParticleType::Disk
            } else {
                ParticleType::Halo
            };
            GravParticle::new(id, position, mass, ptype)
        })
        .collect()
}

pub fn decompose(
    particles: &[GravParticle],
    settings: &GravitySettings,
    leaf: usize,
    ranks: usize,
) -> DomainDecomposition {
    let positions: Vec<Vec3> = particles.iter().map(|p| p.position).collect();
    let region = if settings.periodic {
        Region::periodic(settings.box_size)
    } else {
        Region::enclosing(&positions)
    };
    DomainDecomposition::new(
        &positions,
        region,
        &DomainSettings {
            max_leaf_particles: leaf,
            ..Default::default()
        },
        ranks,
    )
}

pub struct Run {
    /// All particles after the last pass, ordered by id.
    pub particles: Vec<GravParticle>,
    /// Reports of rank 0, one per pass.
    pub reports: Vec<GravityReport>,
}

/// Builds the trees and runs `steps` force passes on `ranks` in-process ranks.
pub fn run_tree(
    particles: &[GravParticle],
    settings: &GravitySettings,
    ranks: usize,
    leaf: usize,
    steps: usize,
) -> Result<Run> {
    run_tree_on(LocalCluster::new(ranks), particles, settings, leaf, steps)
}

pub fn run_tree_on(
    cluster: LocalCluster,
    particles: &[GravParticle],
    settings: &GravitySettings,
    leaf: usize,
    steps: usize,
) -> Result<Run> {
    let domain = decompose(particles, settings, leaf, cluster.size());
    let inputs = domain.distribute(particles.to_vec());
    let outputs = cluster.run(inputs, |comm, mut local| -> Result<_> {
        let mut gravity = GravityTree::new(settings.clone())?;
        let softening = gravity.softening_table();
        let tree = TreeBuilder::new(&domain, &softening, settings.softening.adaptive_gas)
            .build(&local, comm)?;
        let active: Vec<usize> = (0..local.len()).collect();
        let mut reports = Vec::new();
        for _ in 0..steps {
            reports.push(gravity.compute_forces(&tree, comm, &mut local, &active)?);
        }
        Ok((local, reports))
    });

    let mut all = Vec::with_capacity(particles.len());
    let mut first = None;
    for output in outputs {
        let (local, reports) = output?;
        all.extend(local);
        first.get_or_insert(reports);
    }
    all.sort_by_key(|p| p.id);
    Ok(Run {
        particles: all,
        reports: first.unwrap_or_default(),
    })
}

pub fn direct(particles: &[GravParticle], settings: &GravitySettings) -> Vec<GravParticle> {
    let mut reference = particles.to_vec();
    let gravity = GravityTree::new(settings.clone()).expect("valid settings");
    DirectSummation::new(&gravity).compute(&mut reference);
    reference
}

/// `sqrt(sum |a - b|^2 / sum |b|^2)` over the accelerations.
pub fn force_error(result: &[GravParticle], reference: &[GravParticle]) -> f64 {
    let (diff, norm) = result
        .iter()
        .zip(reference)
        .fold((0.0, 0.0), |(diff, norm), (a, b)| {
            assert_eq!(a.id, b.id);
            (
                diff + (a.grav_accel - b.grav_accel).norm_squared(),
                norm + b.grav_accel.norm_squared(),
            )
        });
    (diff / norm).sqrt()
}

/// Largest acceleration or potential difference, relative to the largest magnitude in `reference`.
pub fn max_difference(result: &[GravParticle], reference: &[GravParticle]) -> f64 {
    let acc_scale = reference.iter().map(|p| p.grav_accel.norm()).fold(0.0, f64::max);
    let pot_scale = reference.iter().map(|p| p.potential.abs()).fold(0.0, f64::max);
    result
        .iter()
        .zip(reference)
        .map(|(a, b)| {
            assert_eq!(a.id, b.id);
            let acc = (a.grav_accel - b.grav_accel).norm() / acc_scale;
            let pot = (a.potential - b.potential).abs() / pot_scale;
            acc.max(pot)
        })
        .fold(0.0, f64::max)
}
