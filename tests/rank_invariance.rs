mod common;

use common::{max_difference, random_particles, run_tree, run_tree_on};
use gravtree::{
    comm::LocalCluster,
    error::{GravityError, Result},
    gravity::GravityTree,
    settings::{GravitySettings, OpeningCriterionKind, ShortRangeSettings, SofteningSettings},
    tree::build::TreeBuilder,
    treewalk::{TreeWalk, TreeWalkSettings},
};

fn settings() -> GravitySettings {
    GravitySettings {
        theta: 0.6,
        softening: SofteningSettings::uniform(0.01),
        ..Default::default()
    }
}

#[test]
fn results_do_not_depend_on_rank_count() {
    let particles = random_particles(1500, 21, 1.0);
    let settings = settings();
    let serial = run_tree(&particles, &settings, 1, 48, 1).unwrap();

    for ranks in [2, 4, 8] {
        let run = run_tree(&particles, &settings, ranks, 48, 1).unwrap();
        let diff = max_difference(&run.particles, &serial.particles);
        assert!(diff < 1e-9, "{ranks} ranks differ by {diff}");
        assert_eq!(run.reports[0].interactions, serial.reports[0].interactions);
        assert_eq!(run.reports[0].walk.processed, 1500);
        for (a, b) in run.particles.iter().zip(&serial.particles) {
            assert_eq!(a.grav_cost, b.grav_cost, "particle {}", a.id);
        }
    }
}

#[test]
fn periodic_short_range_is_rank_invariant() {
    let particles = random_particles(1200, 22, 10.0);
    let settings = GravitySettings {
        box_size: 10.0,
        periodic: true,
        short_range: Some(ShortRangeSettings {
            pm_grid: 16,
            asmth: 1.25,
            rcut: 4.5,
        }),
        softening: SofteningSettings::uniform(0.05),
        ..settings()
    };
    let serial = run_tree(&particles, &settings, 1, 32, 1).unwrap();
    let parallel = run_tree(&particles, &settings, 4, 32, 1).unwrap();

    assert!(max_difference(&parallel.particles, &serial.particles) < 1e-9);
    assert_eq!(parallel.reports[0].interactions, serial.reports[0].interactions);

    let newtonian = GravitySettings {
        short_range: None,
        ..settings
    };
    let full = run_tree(&particles, &newtonian, 4, 32, 1).unwrap();
    assert!(serial.reports[0].interactions < full.reports[0].interactions);
}

#[test]
fn export_buffer_size_only_changes_the_number_of_rounds() {
    let particles = random_particles(400, 23, 1.0);
    let mut settings = settings();
    // Eight top-level leaves: a particle never needs more than one record per remote rank.
    let leaf = 128;

    settings.export_buffer_size = 4096;
    let roomy = run_tree(&particles, &settings, 4, leaf, 1).unwrap();
    assert_eq!(roomy.reports[0].walk.rounds, 1);
    assert_eq!(roomy.reports[0].walk.retries, 0);

    for size in [3, 5, 17] {
        settings.export_buffer_size = size;
        let tight = run_tree(&particles, &settings, 4, leaf, 1).unwrap();
        assert!(tight.reports[0].walk.rounds > 1, "buffer {size}");
        assert!(tight.reports[0].walk.retries > 0);
        assert_eq!(tight.reports[0].interactions, roomy.reports[0].interactions);
        assert!(max_difference(&tight.particles, &roomy.particles) < 1e-12);
    }
}

#[test]
fn empty_export_buffer_fails_on_every_rank() {
    let particles = random_particles(300, 24, 1.0);
    let settings = GravitySettings {
        theta: 0.0,
        ..settings()
    };
    let domain = common::decompose(&particles, &settings, 32, 2);

    let inputs = domain.distribute(particles);
    let results = LocalCluster::new(2).run(inputs, |comm, mut local| -> Result<usize> {
        let gravity = GravityTree::new(settings.clone())?;
        let softening = gravity.softening_table();
        let tree = TreeBuilder::new(&domain, &softening, false).build(&local, comm)?;
        let policy = gravity.policy();
        let active: Vec<usize> = (0..local.len()).collect();
        TreeWalk::new(
            &policy,
            &tree,
            comm,
            TreeWalkSettings {
                export_buffer_size: 0,
                step: 0,
            },
        )
        .run(&mut local, &active)
        .map(|report| report.rounds)
    });

    for result in results {
        assert!(matches!(
            result,
            Err(GravityError::ExportBufferTooSmall { capacity: 0, .. })
        ));
    }
}

#[test]
fn ranks_without_particles_take_part() {
    // Everything sits in one corner, so most ranks own nothing.
    let particles: Vec<_> = random_particles(64, 25, 0.1);
    let settings = settings();
    let serial = run_tree(&particles, &settings, 1, 64, 1).unwrap();
    let run = run_tree(&particles, &settings, 4, 64, 1).unwrap();
    assert_eq!(run.particles.len(), 64);
    assert!(max_difference(&run.particles, &serial.particles) < 1e-12);
}

#[test]
fn byte_encoded_exchange_gives_identical_forces() {
    let particles = random_particles(600, 26, 1.0);
    let settings = GravitySettings {
        opening: OpeningCriterionKind::Relative,
        export_buffer_size: 17,
        ..settings()
    };
    let moved = run_tree(&particles, &settings, 3, 48, 2).unwrap();
    let cluster = LocalCluster::new(3).encoded();
    let encoded = run_tree_on(cluster, &particles, &settings, 48, 2).unwrap();

    // Forces do not depend on which particles happened to be retried.
    assert_eq!(encoded.particles, moved.particles);
    for (a, b) in encoded.reports.iter().zip(&moved.reports) {
        assert_eq!(a.criterion, b.criterion);
        assert_eq!(a.interactions, b.interactions);
    }
    assert!(encoded.reports[1].walk.rounds > 1);
}
