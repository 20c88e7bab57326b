use bytemuck::{Pod, Zeroable};

use crate::{
    comm::{
        Payload,
        payload::{decode_pod, encode_pod},
    },
    gravity::postprocess::GravityPostProcess,
    kernel::PairKernel,
    shared::{GravParticle, ParticleType, PeriodicBox, Vec3},
    softening::SofteningTable,
    tree::{Leaf, Node, NodeKind},
    treewalk::{LocalTreeWalk, TreeWalkQuery, TreeWalkVisitor, Visit, WalkMode},
};

/// Within this fraction of a cell's side length on every axis the relative
/// criterion always opens the cell.
pub const RELATIVE_CONTAINMENT_FRACTION: f64 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OpeningCriterion {
    /// Open when `len > r * theta`.
    Geometric { theta: f64 },
    /// Open when the estimated error of the node force exceeds
    /// `err_tol_force_acc` times the particle's previous acceleration.
    Relative { err_tol_force_acc: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GravityQuery {
    pub ptype: ParticleType,
    /// Own smoothing length, only meaningful for gas under adaptive softening.
    pub soft: f64,
    pub old_acc: f64,
}

impl Payload for GravityQuery {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.ptype.encode(buf);
        self.soft.encode(buf);
        self.old_acc.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        Some(Self {
            ptype: ParticleType::decode(buf)?,
            soft: f64::decode(buf)?,
            old_acc: f64::decode(buf)?,
        })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct GravityResult {
    pub acc: Vec3,
    pub potential: f64,
    pub ninteractions: u64,
}

impl Payload for GravityResult {
    fn encode(&self, buf: &mut Vec<u8>) {
        encode_pod(self, buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        decode_pod(buf)
    }
}

/// Short-range gravity visitor: opening criterion, softening and cutoff.
#[derive(Clone, Debug)]
pub struct GravityPolicy {
    criterion: OpeningCriterion,
    softening: SofteningTable,
    kernel: PairKernel,
    periodic: PeriodicBox,
    adaptive_gas: bool,
    postprocess: GravityPostProcess,
}

impl GravityPolicy {
    pub fn new(
        criterion: OpeningCriterion,
        softening: SofteningTable,
        kernel: PairKernel,
        periodic: PeriodicBox,
        adaptive_gas: bool,
        postprocess: GravityPostProcess,
    ) -> Self {
        Self {
            criterion,
            softening,
            kernel,
            periodic,
            adaptive_gas,
            postprocess,
        }
    }

    pub fn criterion(&self) -> OpeningCriterion {
        self.criterion
    }

    pub fn kernel(&self) -> &PairKernel {
        &self.kernel
    }

    pub fn periodic(&self) -> &PeriodicBox {
        &self.periodic
    }

    fn adaptive(&self, ptype: ParticleType) -> bool {
        self.adaptive_gas && ptype == ParticleType::Gas
    }

    pub fn query_softening(&self, query: &GravityQuery) -> f64 {
        if self.adaptive(query.ptype) {
            query.soft
        } else {
            self.softening.force_softening(query.ptype)
        }
    }

    pub fn leaf_softening(&self, h: f64, leaf: &Leaf) -> f64 {
        let own = if self.adaptive(leaf.ptype) {
            leaf.hsml
        } else {
            self.softening.force_softening(leaf.ptype)
        };
        h.max(own)
    }

    /// Softening for using `node` as a whole, or `None` if the node must be opened instead.
    pub fn node_softening(&self, h: f64, node: &Node, r2: f64) -> Option<f64> {
        if self.adaptive_gas {
            if h < node.max_soft {
                let h = node.max_soft;
                return (r2 >= h * h).then_some(h);
            }
            return Some(h);
        }

        let node_soft = self.softening.force_softening(node.flags.max_softening_type());
        if h < node_soft {
            if r2 < node_soft * node_soft && node.flags.has_mixed_softening() {
                return None;
            }
            return Some(node_soft);
        }
        Some(h)
    }

    /// True when no part of `node` can lie within the short-range cutoff of `pos`.
    pub fn outside_cutoff(&self, node: &Node, pos: &Vec3, r2: f64) -> bool {
        let Some(split) = self.kernel.split() else {
            return false;
        };
        if r2 <= split.rcut2() {
            return false;
        }
        let eff_dist = split.rcut() + 0.5 * node.len;
        (0..3).any(|k| self.periodic.nearest(node.center[k] - pos[k]).abs() > eff_dist)
    }

    /// `aold` is the error tolerance times the previous acceleration.
    pub fn must_open(&self, node: &Node, pos: &Vec3, r2: f64, aold: f64) -> bool {
        match self.criterion {
            OpeningCriterion::Geometric { theta } => node.len * node.len > r2 * theta * theta,
            OpeningCriterion::Relative { .. } => {
                if node.mass * node.len * node.len > r2 * r2 * aold {
                    return true;
                }
                let limit = RELATIVE_CONTAINMENT_FRACTION * node.len;
                (0..3).all(|k| self.periodic.nearest(node.center[k] - pos[k]).abs() < limit)
            }
        }
    }

    fn accumulate(&self, out: &mut GravityResult, dx: Vec3, r2: f64, mass: f64, h: f64) {
        if let Some(terms) = self.kernel.evaluate(mass, r2, h) {
            out.acc += dx * terms.force;
            out.potential += terms.potential;
            out.ninteractions += 1;
        }
    }
}

impl TreeWalkVisitor for GravityPolicy {
    type Particle = GravParticle;
    type Query = GravityQuery;
    type Result = GravityResult;

    fn label(&self) -> &'static str {
        "FORCETREE_SHORTRANGE"
    }

    /// Boundary particles are tracers: they source gravity but receive none.
    fn is_active(&self, particle: &GravParticle) -> bool {
        particle.ptype != ParticleType::Boundary
    }

    fn fill(&self, particle: &GravParticle) -> GravityQuery {
        GravityQuery {
            ptype: particle.ptype,
            soft: if self.adaptive(particle.ptype) {
                particle.hsml
            } else {
                0.0
            },
            old_acc: particle.old_acc,
        }
    }

    fn visit(
        &self,
        query: &TreeWalkQuery<GravityQuery>,
        lv: &mut LocalTreeWalk<'_>,
    ) -> Visit<GravityResult> {
        let tree = lv.tree();
        let pos = query.position;
        let h_query = self.query_softening(&query.data);
        let aold = match self.criterion {
            OpeningCriterion::Relative { err_tol_force_acc } => {
                err_tol_force_acc * query.data.old_acc
            }
            OpeningCriterion::Geometric { .. } => 0.0,
        };
        let mut out = GravityResult::default();

        for &top in &query.node_list {
            let mut no = tree.node(top).nextnode;
            while let Some(kind) = tree.classify(no) {
                match kind {
                    NodeKind::Particle(i) => {
                        let leaf = tree.leaf(i);
                        no = tree.particle_next(i);
                        let dx = self.periodic.nearest_vec(leaf.position - pos);
                        let h = self.leaf_softening(h_query, leaf);
                        self.accumulate(&mut out, dx, dx.norm_squared(), leaf.mass, h);
                    }
                    NodeKind::Pseudo(k) => {
                        if lv.export_particle(k).is_err() {
                            return Visit::Retry;
                        }
                        no = tree.pseudo_next(k);
                    }
                    NodeKind::Internal(n) => {
                        let node = tree.node(n);
                        // Back at the domain boundary: this branch is finished.
                        if lv.mode() == WalkMode::Import && node.flags.is_top_level() {
                            break;
                        }
                        if !node.flags.has_multiple_particles() {
                            no = node.nextnode;
                            continue;
                        }

                        let dx = self.periodic.nearest_vec(node.com - pos);
                        let r2 = dx.norm_squared();
                        if self.outside_cutoff(node, &pos, r2) {
                            no = node.sibling;
                            continue;
                        }
                        if self.must_open(node, &pos, r2, aold) {
                            no = node.nextnode;
                            continue;
                        }
                        let Some(h) = self.node_softening(h_query, node, r2) else {
                            no = node.nextnode;
                            continue;
                        };
                        no = node.sibling;
                        self.accumulate(&mut out, dx, r2, node.mass, h);
                    }
                }
            }
        }

        Visit::Done(out)
    }

    fn reduce(&self, particle: &mut GravParticle, result: GravityResult, mode: WalkMode) {
        mode.reduce(&mut particle.grav_accel, result.acc);
        mode.reduce(&mut particle.potential, result.potential);
        mode.reduce(&mut particle.grav_cost, result.ninteractions);
    }

    fn postprocess(&self, particle: &mut GravParticle) {
        self.postprocess.apply(particle);
    }
}
