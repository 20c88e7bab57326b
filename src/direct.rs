// O(N^2) reference summation over a complete particle set held by one process.

use rayon::prelude::*;

use crate::{
    gravity::{GravityPolicy, GravityResult, GravityTree},
    shared::GravParticle,
    tree::Leaf,
    treewalk::{TreeWalkVisitor, WalkMode},
};

/// Pairwise summation with the same kernel, softening and periodic images as the tree.
///
/// Every pair inside the short-range table is counted. The tree additionally
/// drops whole cells beyond the cutoff box, so with a force split the two
/// only agree up to those far pairs.
pub struct DirectSummation {
    policy: GravityPolicy,
}

impl DirectSummation {
    pub fn new(gravity: &GravityTree) -> Self {
        Self {
            policy: gravity.policy(),
        }
    }

    fn sum_for(&self, target: &GravParticle, sources: &[Leaf]) -> GravityResult {
        let query = self.policy.fill(target);
        let h_query = self.policy.query_softening(&query);
        let kernel = self.policy.kernel();
        let periodic = self.policy.periodic();

        let mut out = GravityResult::default();
        for source in sources {
            let dx = periodic.nearest_vec(source.position - target.position);
            let h = self.policy.leaf_softening(h_query, source);
            if let Some(terms) = kernel.evaluate(source.mass, dx.norm_squared(), h) {
                out.acc += dx * terms.force;
                out.potential += terms.potential;
                out.ninteractions += 1;
            }
        }
        out
    }

    /// Overwrites acceleration, potential and cost of every particle that receives gravity.
    pub fn compute(&self, particles: &mut [GravParticle]) {
        let sources: Vec<Leaf> = particles.iter().map(Leaf::from).collect();

        let results: Vec<Option<GravityResult>> = particles
            .par_iter()
            .map(|p| self.policy.is_active(p).then(|| self.sum_for(p, &sources)))
            .collect();

        particles
            .par_iter_mut()
            .zip(results)
            .for_each(|(p, result)| {
                if let Some(result) = result {
                    p.reset_gravity();
                    self.policy.reduce(p, result, WalkMode::Local);
                    self.policy.postprocess(p);
                }
            });
    }
}
