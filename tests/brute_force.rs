mod common;

use approx::assert_relative_eq;
use common::{direct, force_error, max_difference, random_particles, run_tree};
use gravtree::{
    gravity::OpeningCriterion,
    settings::{GravitySettings, OpeningCriterionKind, SofteningSettings},
    shared::{GravParticle, ParticleType, Vec3},
};

fn settings(theta: f64, periodic: bool) -> GravitySettings {
    GravitySettings {
        theta,
        softening: SofteningSettings::uniform(0.01),
        periodic,
        box_size: 1.0,
        ..Default::default()
    }
}

#[test]
fn opening_every_node_reproduces_direct_summation() {
    let particles = random_particles(600, 11, 1.0);
    for periodic in [false, true] {
        let settings = settings(0.0, periodic);
        let reference = direct(&particles, &settings);
        for ranks in [1, 3] {
            let run = run_tree(&particles, &settings, ranks, 40, 1).unwrap();
            let diff = max_difference(&run.particles, &reference);
            assert!(diff < 1e-10, "periodic {periodic}, {ranks} ranks: {diff}");
            for (t, d) in run.particles.iter().zip(&reference) {
                assert_eq!(t.grav_cost, d.grav_cost);
            }
        }
    }
}

#[test]
fn barnes_hut_error_is_small() {
    let particles = random_particles(1000, 12, 1.0);
    let settings = settings(0.5, false);
    let reference = direct(&particles, &settings);
    let run = run_tree(&particles, &settings, 2, 64, 1).unwrap();

    let error = force_error(&run.particles, &reference);
    assert!(error < 0.02, "force error {error}");

    let tree_cost: u64 = run.particles.iter().map(|p| p.grav_cost).sum();
    let direct_cost: u64 = reference.iter().map(|p| p.grav_cost).sum();
    assert!(tree_cost < direct_cost);
    assert_eq!(run.reports[0].interactions, tree_cost);
}

#[test]
fn two_bodies_attract_symmetrically() {
    let settings = GravitySettings {
        g: 2.0,
        softening: SofteningSettings::uniform(0.001),
        ..Default::default()
    };
    let particles = vec![
        GravParticle::new(0, Vec3::new(0.0, 0.0, 0.0), 3.0, ParticleType::Halo),
        GravParticle::new(1, Vec3::new(0.0, 2.0, 0.0), 3.0, ParticleType::Halo),
    ];
    let run = run_tree(&particles, &settings, 2, 1, 1).unwrap();
    let (a, b) = (&run.particles[0], &run.particles[1]);

    // G m / d^2 = 2 * 3 / 4
    assert_relative_eq!(a.grav_accel.y, 1.5, max_relative = 1e-12);
    assert_relative_eq!(b.grav_accel.y, -1.5, max_relative = 1e-12);
    assert_relative_eq!(a.grav_accel.x, 0.0);
    assert_relative_eq!(a.total_accel, a.grav_accel);
    // -G m / d with the self term removed
    assert_relative_eq!(a.potential, -3.0, max_relative = 1e-9);
    assert_relative_eq!(b.potential, -3.0, max_relative = 1e-9);
}

#[test]
fn relative_criterion_starts_geometric_and_stays_accurate() {
    let particles = random_particles(800, 13, 1.0);
    let settings = GravitySettings {
        opening: OpeningCriterionKind::Relative,
        err_tol_force_acc: 0.005,
        ..settings(0.6, false)
    };
    let reference = direct(&particles, &settings);
    let run = run_tree(&particles, &settings, 2, 64, 2).unwrap();

    assert_eq!(run.reports[0].criterion, OpeningCriterion::Geometric { theta: 0.6 });
    assert_eq!(
        run.reports[1].criterion,
        OpeningCriterion::Relative {
            err_tol_force_acc: 0.005
        }
    );
    let error = force_error(&run.particles, &reference);
    assert!(error < 0.02, "force error {error}");
    assert!(run.particles.iter().all(|p| p.old_acc > 0.0));
}

#[test]
fn tracers_source_gravity_but_are_not_updated() {
    let settings = settings(0.0, false);
    let mut particles = random_particles(200, 14, 1.0);
    for p in particles.iter_mut().filter(|p| p.id % 10 == 3) {
        p.ptype = ParticleType::Boundary;
        p.potential = 7.0;
    }
    let reference = direct(&particles, &settings);
    let run = run_tree(&particles, &settings, 2, 20, 1).unwrap();

    assert_eq!(run.reports[0].walk.processed, 180);
    for (t, d) in run.particles.iter().zip(&reference) {
        if t.ptype == ParticleType::Boundary {
            assert_eq!(t.potential, 7.0);
            assert_eq!(t.grav_accel, Vec3::zeros());
        } else {
            assert!((t.grav_accel - d.grav_accel).norm() <= 1e-10 * d.grav_accel.norm());
        }
    }
}
