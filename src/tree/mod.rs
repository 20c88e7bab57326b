//! Flattened octree used by one force pass.
//!
//! Every tree element lives in one of three flat arrays and is addressed by a
//! single [`NodeId`]:
//!
//! * `[0, max_part)` are the rank's own particles,
//! * `[max_part, max_part + num_nodes)` are internal nodes, top-level nodes first,
//! * `max_part + num_nodes` and up are pseudo-particles, each standing in for
//!   a top-level leaf owned by another rank.
//!
//! Traversal follows two links per element: `nextnode` descends into the
//! first child, `sibling` skips the whole subtree. Particles and
//! pseudo-particles only have the skip link.

pub mod build;
pub mod domain;

use crate::shared::{GravParticle, ParticleType, Vec3};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const NONE: NodeId = NodeId(u32::MAX);

    pub fn new(index: usize) -> Self {
        debug_assert!(index < u32::MAX as usize);
        NodeId(index as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

/// What a handle refers to, with the index into the matching array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Particle(usize),
    Internal(usize),
    Pseudo(usize),
}

/// Node bit flags. Bits 2..=4 hold the particle type with the largest softening.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags(u8);

impl NodeFlags {
    pub const TOP_LEVEL: NodeFlags = NodeFlags(1 << 0);
    pub const MIXED_SOFTENING: NodeFlags = NodeFlags(1 << 5);
    pub const MULTIPLE_PARTICLES: NodeFlags = NodeFlags(1 << 7);

    const SOFTENING_TYPE_SHIFT: u8 = 2;
    const SOFTENING_TYPE_MASK: u8 = 0b111 << Self::SOFTENING_TYPE_SHIFT;

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn is_top_level(self) -> bool {
        self.contains(Self::TOP_LEVEL)
    }

    pub fn has_multiple_particles(self) -> bool {
        self.contains(Self::MULTIPLE_PARTICLES)
    }

    pub fn has_mixed_softening(self) -> bool {
        self.contains(Self::MIXED_SOFTENING)
    }

    pub fn max_softening_type(self) -> ParticleType {
        let index = (self.0 & Self::SOFTENING_TYPE_MASK) >> Self::SOFTENING_TYPE_SHIFT;
        ParticleType::from_index(index as usize).unwrap_or(ParticleType::Gas)
    }

    pub fn set_max_softening_type(&mut self, ptype: ParticleType) {
        self.0 = (self.0 & !Self::SOFTENING_TYPE_MASK)
            | ((ptype as u8) << Self::SOFTENING_TYPE_SHIFT);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Geometric centre of the cell.
    pub center: Vec3,
    /// Cell side length.
    pub len: f64,
    pub mass: f64,
    pub com: Vec3,
    /// Particles below this node, summed over all ranks.
    pub count: usize,
    /// Largest kernel softening of any particle below this node.
    pub max_soft: f64,
    pub flags: NodeFlags,
    pub sibling: NodeId,
    pub nextnode: NodeId,
}

/// The part of a particle the walk reads when it meets it as a leaf.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Leaf {
    pub position: Vec3,
    pub mass: f64,
    pub ptype: ParticleType,
    pub hsml: f64,
}

impl From<&GravParticle> for Leaf {
    fn from(p: &GravParticle) -> Self {
        Self {
            position: p.position,
            mass: p.mass,
            ptype: p.ptype,
            hsml: p.hsml,
        }
    }
}

/// Placeholder for a top-level leaf whose particles live on rank `task`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PseudoParticle {
    pub task: usize,
    pub top_node: usize,
}

#[derive(Clone, Debug)]
pub struct SpatialTree {
    max_part: usize,
    nodes: Vec<Node>,
    leaves: Vec<Leaf>,
    particle_next: Vec<NodeId>,
    pseudo: Vec<PseudoParticle>,
    pseudo_next: Vec<NodeId>,
    num_top_nodes: usize,
}

impl SpatialTree {
    pub(crate) fn from_parts(
        nodes: Vec<Node>,
        leaves: Vec<Leaf>,
        particle_next: Vec<NodeId>,
        pseudo: Vec<PseudoParticle>,
        pseudo_next: Vec<NodeId>,
        num_top_nodes: usize,
    ) -> Self {
        debug_assert_eq!(leaves.len(), particle_next.len());
        debug_assert_eq!(pseudo.len(), pseudo_next.len());
        debug_assert!(num_top_nodes >= 1 && num_top_nodes <= nodes.len());
        Self {
            max_part: leaves.len(),
            nodes,
            leaves,
            particle_next,
            pseudo,
            pseudo_next,
            num_top_nodes,
        }
    }

    pub fn max_part(&self) -> usize {
        self.max_part
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_pseudo(&self) -> usize {
        self.pseudo.len()
    }

    pub fn num_top_nodes(&self) -> usize {
        self.num_top_nodes
    }

    pub fn root(&self) -> NodeId {
        self.top_node(0)
    }

    /// Handle of top-level node `t`. Top-level nodes share their numbering on every rank.
    pub fn top_node(&self, t: usize) -> NodeId {
        debug_assert!(t < self.num_top_nodes);
        self.node_handle(t)
    }

    pub fn classify(&self, id: NodeId) -> Option<NodeKind> {
        if id.is_none() {
            return None;
        }
        let i = id.index();
        if i < self.max_part {
            Some(NodeKind::Particle(i))
        } else if i < self.max_part + self.nodes.len() {
            Some(NodeKind::Internal(i - self.max_part))
        } else {
            let k = i - self.max_part - self.nodes.len();
            (k < self.pseudo.len()).then_some(NodeKind::Pseudo(k))
        }
    }

    pub fn node(&self, index: usize) -> &Node {
        &self.nodes[index]
    }

    pub fn leaf(&self, index: usize) -> &Leaf {
        &self.leaves[index]
    }

    pub fn pseudo(&self, index: usize) -> &PseudoParticle {
        &self.pseudo[index]
    }

    pub fn particle_next(&self, index: usize) -> NodeId {
        self.particle_next[index]
    }

    pub fn pseudo_next(&self, index: usize) -> NodeId {
        self.pseudo_next[index]
    }

    pub fn node_handle(&self, index: usize) -> NodeId {
        NodeId::new(self.max_part + index)
    }

    pub fn pseudo_handle(&self, index: usize) -> NodeId {
        NodeId::new(self.max_part + self.nodes.len() + index)
    }

    /// Element visited after `id` when `id` is not descended into.
    pub fn skip(&self, id: NodeId) -> NodeId {
        match self.classify(id) {
            Some(NodeKind::Particle(i)) => self.particle_next[i],
            Some(NodeKind::Internal(n)) => self.nodes[n].sibling,
            Some(NodeKind::Pseudo(k)) => self.pseudo_next[k],
            None => NodeId::NONE,
        }
    }

    /// Depth-first order over every element reachable from the root.
    pub fn iter(&self) -> TreeIter<'_> {
        TreeIter {
            tree: self,
            next: self.root(),
        }
    }
}

pub struct TreeIter<'a> {
    tree: &'a SpatialTree,
    next: NodeId,
}

impl Iterator for TreeIter<'_> {
    type Item = NodeKind;

    fn next(&mut self) -> Option<Self::Item> {
        let kind = self.tree.classify(self.next)?;
        self.next = match kind {
            NodeKind::Internal(n) => self.tree.nodes[n].nextnode,
            _ => self.tree.skip(self.next),
        };
        Some(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_pack_softening_type_between_other_bits() {
        let mut flags = NodeFlags::default();
        flags.insert(NodeFlags::TOP_LEVEL);
        flags.insert(NodeFlags::MULTIPLE_PARTICLES);
        flags.set_max_softening_type(ParticleType::Boundary);
        assert!(flags.is_top_level());
        assert!(flags.has_multiple_particles());
        assert!(!flags.has_mixed_softening());
        assert_eq!(flags.max_softening_type(), ParticleType::Boundary);

        flags.set_max_softening_type(ParticleType::Halo);
        assert_eq!(flags.max_softening_type(), ParticleType::Halo);
        assert_eq!(flags.bits(), 0b1000_0101);
    }

    #[test]
    fn handles_classify_by_range() {
        let node = Node {
            center: Vec3::zeros(),
            len: 1.0,
            mass: 0.0,
            com: Vec3::zeros(),
            count: 0,
            max_soft: 0.0,
            flags: NodeFlags::TOP_LEVEL,
            sibling: NodeId::NONE,
            nextnode: NodeId::NONE,
        };
        let leaf = Leaf {
            position: Vec3::zeros(),
            mass: 1.0,
            ptype: ParticleType::Halo,
            hsml: 0.0,
        };
        let tree = SpatialTree::from_parts(
            vec![node.clone(), node],
            vec![leaf; 3],
            vec![NodeId::NONE; 3],
            vec![PseudoParticle {
                task: 1,
                top_node: 1,
            }],
            vec![NodeId::NONE],
            2,
        );

        assert_eq!(tree.classify(NodeId::new(2)), Some(NodeKind::Particle(2)));
        assert_eq!(tree.classify(tree.root()), Some(NodeKind::Internal(0)));
        assert_eq!(tree.classify(tree.top_node(1)), Some(NodeKind::Internal(1)));
        assert_eq!(tree.classify(NodeId::new(5)), Some(NodeKind::Pseudo(0)));
        assert_eq!(tree.node_handle(1), tree.top_node(1));
        assert_eq!(tree.classify(NodeId::new(6)), None);
        assert_eq!(tree.classify(NodeId::NONE), None);
        assert_eq!(tree.pseudo_handle(0), NodeId::new(5));
    }
}
