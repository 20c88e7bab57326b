use std::time::{Duration, Instant};

use clap::Parser;
use gravtree::{
    comm::{Communicator, LocalCluster},
    direct::DirectSummation,
    error::{GravityError, Result},
    gravity::{GravityReport, GravityTree},
    settings::{GravitySettings, OpeningCriterionKind, ShortRangeSettings, SofteningSettings},
    shared::{GravParticle, ParticleType, Vec3},
    tree::{
        build::TreeBuilder,
        domain::{DomainDecomposition, DomainSettings, Region},
    },
    treewalk::TreeWalkTimings,
    units::UnitSystem,
};
use log::{error, info, warn};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Tree gravity for a random particle set on a group of ranks.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(short = 'n', long, default_value_t = 4096)]
    particles: usize,
    #[arg(short, long, default_value_t = 4)]
    ranks: usize,
    /// Force passes over the same positions; later passes may use the relative criterion.
    #[arg(long, default_value_t = 2)]
    steps: usize,
    #[arg(long, value_enum, default_value_t = OpeningCriterionKind::Geometric)]
    opening: OpeningCriterionKind,
    #[arg(long, default_value_t = 0.5)]
    theta: f64,
    #[arg(long, default_value_t = 0.005)]
    err_tol: f64,
    #[arg(long, default_value_t = 0.002)]
    softening: f64,
    /// Fraction of particles created as gas.
    #[arg(long, default_value_t = 0.1)]
    gas_fraction: f64,
    #[arg(long)]
    adaptive_gas: bool,
    #[arg(long, default_value_t = 1.0)]
    box_size: f64,
    #[arg(long)]
    periodic: bool,
    /// Enables the short-range force split for a mesh of this many cells per side.
    #[arg(long)]
    pm_grid: Option<usize>,
    #[arg(long, default_value_t = 1.25)]
    asmth: f64,
    #[arg(long, default_value_t = 4.5)]
    rcut: f64,
    #[arg(short, long, default_value_t = 1.0)]
    g: f64,
    /// Use G and H0 in kpc/h, 1e10 Msun/h, km/s units instead of --g.
    #[arg(long)]
    code_units: bool,
    #[arg(long, default_value_t = 4096)]
    export_buffer: usize,
    /// Particles per top-level leaf before it is split.
    #[arg(long, default_value_t = 64)]
    top_leaf: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Check the result against direct summation.
    #[arg(long)]
    compare: bool,
    /// One rank per MPI process; start under mpirun. --ranks is ignored.
    #[cfg(feature = "mpi")]
    #[arg(long)]
    mpi: bool,
}

impl Args {
    fn settings(&self) -> GravitySettings {
        let mut softening = SofteningSettings::uniform(self.softening);
        softening.adaptive_gas = self.adaptive_gas;
        let settings = GravitySettings {
            theta: self.theta,
            err_tol_force_acc: self.err_tol,
            opening: self.opening,
            softening,
            short_range: self.pm_grid.map(|pm_grid| ShortRangeSettings {
                pm_grid,
                asmth: self.asmth,
                rcut: self.rcut,
            }),
            g: self.g,
            box_size: self.box_size,
            periodic: self.periodic,
            export_buffer_size: self.export_buffer,
            ..Default::default()
        };
        if self.code_units {
            settings.with_units(&UnitSystem::default())
        } else {
            settings
        }
    }
}

fn init_logger() {
    env_logger::init();
}

fn random_particles(args: &Args) -> Vec<GravParticle> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mass = 1.0 / args.particles.max(1) as f64;
    (0..args.particles as u64)
        .map(|id| {
            let position = Vec3::new(rng.random(), rng.random(), rng.random()) * args.box_size;
            if rng.random_bool(args.gas_fraction.clamp(0.0, 1.0)) {
                GravParticle::new(id, position, mass, ParticleType::Gas)
                    .with_hsml(2.0 * args.softening)
            } else {
                GravParticle::new(id, position, mass, ParticleType::Halo)
            }
        })
        .collect()
}

struct RankOutput {
    particles: Vec<GravParticle>,
    reports: Vec<GravityReport>,
    timings: TreeWalkTimings,
    misc: Duration,
}

fn decompose(args: &Args, particles: &[GravParticle], ranks: usize) -> DomainDecomposition {
    let positions: Vec<Vec3> = particles.iter().map(|p| p.position).collect();
    let region = if args.periodic {
        Region::periodic(args.box_size)
    } else {
        Region::enclosing(&positions)
    };
    let domain = DomainDecomposition::new(
        &positions,
        region,
        &DomainSettings {
            max_leaf_particles: args.top_leaf,
            ..Default::default()
        },
        ranks,
    );
    info!(
        "{} particles, {} top-level leaves on {} ranks",
        particles.len(),
        domain.leaves().len(),
        domain.ntask()
    );
    domain
}

/// Builds this rank's tree and runs every force pass on it. Collective.
fn run_rank<C: Communicator>(
    args: &Args,
    settings: &GravitySettings,
    domain: &DomainDecomposition,
    comm: &C,
    mut local: Vec<GravParticle>,
) -> Result<RankOutput> {
    let mut gravity = GravityTree::new(settings.clone())?;
    let softening = gravity.softening_table();
    let tree = TreeBuilder::new(domain, &softening, settings.softening.adaptive_gas)
        .build(&local, comm)?;
    let active: Vec<usize> = (0..local.len()).collect();
    let mut reports = Vec::with_capacity(args.steps);
    for _ in 0..args.steps {
        reports.push(gravity.compute_forces(&tree, comm, &mut local, &active)?);
    }
    Ok(RankOutput {
        particles: local,
        reports,
        timings: *gravity.timings(),
        misc: gravity.misc_time(),
    })
}

fn print_rank(rank: usize, output: &RankOutput) {
    let timings = &output.timings;
    println!(
        "rank {rank}: {} particles, walk {:?}, import {:?}, postprocess {:?}, \
         wait {:?}, comm {:?}, misc {:?}",
        output.particles.len(),
        timings.local,
        timings.import,
        timings.postprocess,
        timings.wait,
        timings.comm,
        output.misc
    );
}

fn print_summary(reports: &[GravityReport], elapsed: Duration) {
    for (step, report) in reports.iter().enumerate() {
        println!(
            "step {step}: {:?}, {} interactions, {} rounds",
            report.criterion, report.interactions, report.walk.rounds
        );
    }
    println!("Elapsed: {:?}", elapsed);
}

/// Compares tree accelerations, given as `(id, acceleration)`, with direct summation.
fn compare(
    settings: &GravitySettings,
    particles: Vec<GravParticle>,
    mut accelerations: Vec<(u64, Vec3)>,
) -> Result<()> {
    if settings.short_range.is_some() {
        warn!("Direct summation keeps pairs the tree cuts off; expect small differences");
    }
    let mut reference = particles;
    let start = Instant::now();
    DirectSummation::new(&GravityTree::new(settings.clone())?).compute(&mut reference);
    println!("Direct summation: {:?}", start.elapsed());

    accelerations.sort_by_key(|&(id, _)| id);
    let errors: Vec<f64> = accelerations
        .iter()
        .zip(&reference)
        .filter(|(_, r)| r.grav_accel.norm() > 0.0)
        .map(|((_, acc), r)| (acc - r.grav_accel).norm() / r.grav_accel.norm())
        .collect();
    let rms = (errors.iter().map(|e| e * e).sum::<f64>() / errors.len().max(1) as f64).sqrt();
    let max = errors.iter().copied().fold(0.0, f64::max);
    println!("Relative force error: rms {rms:.3e}, max {max:.3e}");
    Ok(())
}

fn accelerations(particles: &[GravParticle]) -> Vec<(u64, Vec3)> {
    particles.iter().map(|p| (p.id, p.grav_accel)).collect()
}

fn run_threads(
    args: &Args,
    settings: &GravitySettings,
    particles: Vec<GravParticle>,
) -> Result<()> {
    let domain = decompose(args, &particles, args.ranks);
    let inputs = domain.distribute(particles.clone());

    let start = Instant::now();
    let outputs = LocalCluster::new(args.ranks).run(inputs, |comm, local| {
        run_rank(args, settings, &domain, comm, local)
    });
    let elapsed = start.elapsed();

    let mut result = Vec::with_capacity(particles.len());
    let mut summary: Option<Vec<GravityReport>> = None;
    for (rank, output) in outputs.into_iter().enumerate() {
        let output = output?;
        print_rank(rank, &output);
        result.extend(accelerations(&output.particles));
        summary.get_or_insert(output.reports);
    }
    print_summary(&summary.unwrap_or_default(), elapsed);

    if args.compare {
        compare(settings, particles, result)?;
    }
    Ok(())
}

/// Every process generates the same particles and keeps the ones its rank owns.
#[cfg(feature = "mpi")]
fn run_mpi(args: &Args, settings: &GravitySettings, particles: Vec<GravParticle>) -> Result<()> {
    use gravtree::comm::MpiComm;

    let universe = mpi::initialize()
        .ok_or_else(|| GravityError::InvalidSettings("MPI was already initialised".to_string()))?;
    let comm = MpiComm::world(&universe);
    let rank = comm.rank();
    let domain = decompose(args, &particles, comm.size());
    let local = domain.distribute(particles.clone()).swap_remove(rank);

    let start = Instant::now();
    let output = run_rank(args, settings, &domain, &comm, local)?;
    comm.barrier();
    let elapsed = start.elapsed();
    print_rank(rank, &output);

    let result: Vec<(u64, Vec3)> = comm
        .all_gather(accelerations(&output.particles))
        .into_iter()
        .flatten()
        .collect();
    if rank == 0 {
        print_summary(&output.reports, elapsed);
        if args.compare {
            compare(settings, particles, result)?;
        }
    }
    Ok(())
}

fn run(args: &Args) -> Result<()> {
    let settings = args.settings();
    settings.validate()?;
    if args.ranks == 0 || args.top_leaf == 0 {
        return Err(GravityError::InvalidSettings(
            "need at least one rank and one particle per top-level leaf".to_string(),
        ));
    }
    let particles = random_particles(args);

    #[cfg(feature = "mpi")]
    if args.mpi {
        return run_mpi(args, &settings, particles);
    }
    run_threads(args, &settings, particles)
}

fn main() {
    init_logger();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
