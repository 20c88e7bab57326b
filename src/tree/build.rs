use log::debug;

use crate::{
    comm::{Communicator, Payload},
    error::{GravityError, Result},
    shared::{GravParticle, ParticleType, Vec3},
    softening::SofteningTable,
    tree::{
        Leaf, Node, NodeFlags, NodeId, PseudoParticle, SpatialTree,
        domain::{DomainDecomposition, Region},
    },
};

/// Below this depth coincident particles are chained under one node instead of split further.
pub const MAX_TREE_DEPTH: usize = 48;

#[derive(Clone, Copy, Debug)]
enum Slot {
    Particle(usize),
    Node(usize),
    Pseudo(usize),
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct Moments {
    mass: f64,
    weighted: Vec3,
    count: usize,
    soft_min: f64,
    soft_max: f64,
    max_type: ParticleType,
    max_soft: f64,
}

impl Moments {
    fn empty() -> Self {
        Self {
            mass: 0.0,
            weighted: Vec3::zeros(),
            count: 0,
            soft_min: f64::INFINITY,
            soft_max: f64::NEG_INFINITY,
            max_type: ParticleType::Gas,
            max_soft: 0.0,
        }
    }

    fn of_leaf(leaf: &Leaf, softening: &SofteningTable, adaptive_gas: bool) -> Self {
        let soft = softening.force_softening(leaf.ptype);
        Self {
            mass: leaf.mass,
            weighted: leaf.position * leaf.mass,
            count: 1,
            soft_min: soft,
            soft_max: soft,
            max_type: leaf.ptype,
            max_soft: if adaptive_gas && leaf.ptype == ParticleType::Gas {
                leaf.hsml
            } else {
                soft
            },
        }
    }

    fn add(&mut self, other: &Moments) {
        self.mass += other.mass;
        self.weighted += other.weighted;
        self.count += other.count;
        self.soft_min = self.soft_min.min(other.soft_min);
        if other.soft_max > self.soft_max {
            self.soft_max = other.soft_max;
            self.max_type = other.max_type;
        }
        self.max_soft = self.max_soft.max(other.max_soft);
    }

    fn apply(&self, node: &mut Node) {
        node.mass = self.mass;
        node.com = if self.mass > 0.0 {
            self.weighted / self.mass
        } else {
            node.center
        };
        node.count = self.count;
        node.max_soft = self.max_soft;
        if self.count > 1 {
            node.flags.insert(NodeFlags::MULTIPLE_PARTICLES);
        }
        if self.count > 0 && self.soft_min != self.soft_max {
            node.flags.insert(NodeFlags::MIXED_SOFTENING);
        }
        node.flags.set_max_softening_type(self.max_type);
    }
}

impl Payload for Moments {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.mass.encode(buf);
        self.weighted.encode(buf);
        self.count.encode(buf);
        self.soft_min.encode(buf);
        self.soft_max.encode(buf);
        self.max_type.encode(buf);
        self.max_soft.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        Some(Self {
            mass: f64::decode(buf)?,
            weighted: Vec3::decode(buf)?,
            count: usize::decode(buf)?,
            soft_min: f64::decode(buf)?,
            soft_max: f64::decode(buf)?,
            max_type: ParticleType::decode(buf)?,
            max_soft: f64::decode(buf)?,
        })
    }
}

/// Builds each rank's tree over the shared top-level decomposition.
///
/// Top-level nodes come first in the arena and carry moments summed over all
/// ranks, so any of them can be used as a whole by every rank. Below a
/// top-level leaf a rank either holds its own particles or, if another rank
/// owns the leaf, a single pseudo-particle.
pub struct TreeBuilder<'a> {
    domain: &'a DomainDecomposition,
    softening: &'a SofteningTable,
    adaptive_gas: bool,
}

struct Arena<'a> {
    nodes: Vec<Node>,
    children: Vec<Vec<Slot>>,
    moments: Vec<Moments>,
    leaves: Vec<Leaf>,
    pseudo: Vec<PseudoParticle>,
    builder: &'a TreeBuilder<'a>,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(
        domain: &'a DomainDecomposition,
        softening: &'a SofteningTable,
        adaptive_gas: bool,
    ) -> Self {
        Self {
            domain,
            softening,
            adaptive_gas,
        }
    }

    /// Collective: every rank must build at the same time.
    pub fn build<C: Communicator>(
        &self,
        particles: &[GravParticle],
        comm: &C,
    ) -> Result<SpatialTree> {
        let rank = comm.rank();
        let misplaced = self.domain.find_misplaced(particles, rank).map(|p| p.id);
        if let Some((rank, id)) = comm
            .all_gather(misplaced)
            .into_iter()
            .enumerate()
            .find_map(|(r, id)| id.map(|id| (r, id)))
        {
            return Err(GravityError::ParticleOutsideDomain { id, rank });
        }

        let top = self.domain.nodes();
        let mut arena = Arena {
            nodes: Vec::with_capacity(top.len() + particles.len()),
            children: Vec::with_capacity(top.len() + particles.len()),
            moments: Vec::with_capacity(top.len() + particles.len()),
            leaves: particles.iter().map(Leaf::from).collect(),
            pseudo: Vec::new(),
            builder: self,
        };
        for node in top {
            let n = arena.push_node(&node.region);
            arena.nodes[n].flags.insert(NodeFlags::TOP_LEVEL);
        }

        let mut buckets = vec![Vec::new(); self.domain.leaves().len()];
        for (i, p) in particles.iter().enumerate() {
            buckets[self.domain.top_leaf_of(&p.position)].push(i);
        }

        for (t, node) in top.iter().enumerate() {
            if let Some(children) = node.children {
                arena.children[t] = children.iter().map(|&c| Slot::Node(c)).collect();
            } else if let Some(l) = node.leaf {
                let leaf = &self.domain.leaves()[l];
                if leaf.owner == rank {
                    let slots = arena.subdivide(&node.region, node.depth, &buckets[l]);
                    arena.children[t] = slots;
                } else if leaf.count > 0 {
                    arena.pseudo.push(PseudoParticle {
                        task: leaf.owner,
                        top_node: t,
                    });
                    arena.children[t] = vec![Slot::Pseudo(arena.pseudo.len() - 1)];
                }
            }
        }

        let owned: Vec<(usize, Moments)> = top
            .iter()
            .enumerate()
            .filter_map(|(t, node)| {
                node.leaf
                    .filter(|&l| self.domain.leaves()[l].owner == rank)
                    .map(|_| (t, arena.node_moments(t)))
            })
            .collect();
        for (t, moments) in comm.all_gather(owned).into_iter().flatten() {
            arena.moments[t] = moments;
        }
        // Daughters follow their parent in depth-first order.
        for t in (0..top.len()).rev() {
            if let Some(children) = top[t].children {
                let mut moments = Moments::empty();
                for c in children {
                    moments.add(&arena.moments[c]);
                }
                arena.moments[t] = moments;
            }
        }
        for (node, moments) in arena.nodes.iter_mut().zip(&arena.moments) {
            moments.apply(node);
        }

        let mut particle_next = vec![NodeId::NONE; arena.leaves.len()];
        let mut pseudo_next = vec![NodeId::NONE; arena.pseudo.len()];
        arena.link(Slot::Node(0), NodeId::NONE, &mut particle_next, &mut pseudo_next);

        debug!(
            "Rank {rank}: tree with {} particles, {} nodes ({} top-level), {} pseudo-particles",
            arena.leaves.len(),
            arena.nodes.len(),
            top.len(),
            arena.pseudo.len()
        );

        Ok(SpatialTree::from_parts(
            arena.nodes,
            arena.leaves,
            particle_next,
            arena.pseudo,
            pseudo_next,
            top.len(),
        ))
    }
}

impl Arena<'_> {
    fn push_node(&mut self, region: &Region) -> usize {
        self.nodes.push(Node {
            center: region.center,
            len: region.len,
            mass: 0.0,
            com: region.center,
            count: 0,
            max_soft: 0.0,
            flags: NodeFlags::default(),
            sibling: NodeId::NONE,
            nextnode: NodeId::NONE,
        });
        self.children.push(Vec::new());
        self.moments.push(Moments::empty());
        self.nodes.len() - 1
    }

    fn subdivide(&mut self, region: &Region, depth: usize, indices: &[usize]) -> Vec<Slot> {
        if indices.len() <= 1 || depth >= MAX_TREE_DEPTH {
            return indices.iter().map(|&i| Slot::Particle(i)).collect();
        }

        let mut orthants = vec![Vec::new(); 8];
        for &i in indices {
            orthants[region.octant(&self.leaves[i].position)].push(i);
        }

        let mut slots = Vec::new();
        for (octant, members) in orthants.iter().enumerate() {
            match members.len() {
                0 => {}
                1 => slots.push(Slot::Particle(members[0])),
                _ => {
                    let child = region.child(octant);
                    let n = self.push_node(&child);
                    let grandchildren = self.subdivide(&child, depth + 1, members);
                    self.children[n] = grandchildren;
                    slots.push(Slot::Node(n));
                }
            }
        }
        slots
    }

    fn node_moments(&mut self, n: usize) -> Moments {
        let mut moments = Moments::empty();
        for slot in self.children[n].clone() {
            match slot {
                Slot::Particle(i) => moments.add(&Moments::of_leaf(
                    &self.leaves[i],
                    self.builder.softening,
                    self.builder.adaptive_gas,
                )),
                Slot::Node(c) => moments.add(&self.node_moments(c)),
                Slot::Pseudo(_) => {}
            }
        }
        self.moments[n] = moments;
        moments
    }

    fn handle(&self, slot: Slot) -> NodeId {
        let max_part = self.leaves.len();
        match slot {
            Slot::Particle(i) => NodeId::new(i),
            Slot::Node(n) => NodeId::new(max_part + n),
            Slot::Pseudo(k) => NodeId::new(max_part + self.nodes.len() + k),
        }
    }

    /// Threads `slot` and everything below it, continuing at `after` once done.
    fn link(
        &mut self,
        slot: Slot,
        after: NodeId,
        particle_next: &mut [NodeId],
        pseudo_next: &mut [NodeId],
    ) {
        match slot {
            Slot::Particle(i) => particle_next[i] = after,
            Slot::Pseudo(k) => pseudo_next[k] = after,
            Slot::Node(n) => {
                let children = std::mem::take(&mut self.children[n]);
                let first = children.first().map_or(after, |&c| self.handle(c));
                self.nodes[n].sibling = after;
                self.nodes[n].nextnode = first;
                for (j, &child) in children.iter().enumerate() {
                    let next = children.get(j + 1).map_or(after, |&c| self.handle(c));
                    self.link(child, next, particle_next, pseudo_next);
                }
            }
        }
    }
}
