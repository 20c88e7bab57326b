// Top-level octree shared by all ranks and the assignment of its leaves to ranks.

use log::debug;

use crate::shared::{GravParticle, Vec3};

/// Axis-aligned cubic cell.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Region {
    pub center: Vec3,
    /// Side length.
    pub len: f64,
}

impl Region {
    const OCTANTS: [(f64, f64, f64); 8] = [
        (-1.0, -1.0, -1.0), // index 0: x<, y<, z<
        (1.0, -1.0, -1.0),  // index 1: x>=, y<, z<
        (-1.0, 1.0, -1.0),  // index 2: x<, y>=, z<
        (1.0, 1.0, -1.0),   // index 3: x>=, y>=, z<
        (-1.0, -1.0, 1.0),  // index 4: x<, y<, z>=
        (1.0, -1.0, 1.0),   // index 5: x>=, y<, z>=
        (-1.0, 1.0, 1.0),   // index 6: x<, y>=, z>=
        (1.0, 1.0, 1.0),    // index 7: x>=, y>=, z>=
    ];

    pub fn new(center: Vec3, len: f64) -> Self {
        Self { center, len }
    }

    /// The whole periodic box `[0, size)^3`.
    pub fn periodic(size: f64) -> Self {
        Self::new(Vec3::repeat(0.5 * size), size)
    }

    /// Smallest cube around `positions`, padded slightly so no particle sits on its faces.
    pub fn enclosing<'a>(positions: impl IntoIterator<Item = &'a Vec3>) -> Self {
        let mut min = Vec3::repeat(f64::INFINITY);
        let mut max = Vec3::repeat(f64::NEG_INFINITY);
        for p in positions {
            min = min.inf(p);
            max = max.sup(p);
        }
        if min.x > max.x {
            return Self::new(Vec3::zeros(), 1.0);
        }
        let extent = (max - min).max();
        let len = if extent > 0.0 { 1.001 * extent } else { 1.0 };
        Self::new(0.5 * (min + max), len)
    }

    pub fn contains(&self, point: &Vec3) -> bool {
        let half = 0.5 * self.len;
        (0..3).all(|k| {
            point[k] >= self.center[k] - half && point[k] <= self.center[k] + half
        })
    }

    pub fn octant(&self, pos: &Vec3) -> usize {
        let mut index = 0;
        if pos.x >= self.center.x {
            index |= 1
        }
        if pos.y >= self.center.y {
            index |= 2
        }
        if pos.z >= self.center.z {
            index |= 4
        }
        index
    }

    pub fn child(&self, octant: usize) -> Self {
        let (dx, dy, dz) = Self::OCTANTS[octant];
        let quarter = 0.25 * self.len;
        Self::new(
            self.center + Vec3::new(dx, dy, dz) * quarter,
            0.5 * self.len,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainSettings {
    /// A top-level cell holding more particles than this is split.
    pub max_leaf_particles: usize,
    pub max_depth: usize,
}

impl Default for DomainSettings {
    fn default() -> Self {
        Self {
            max_leaf_particles: 64,
            max_depth: 12,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopNode {
    pub region: Region,
    pub depth: usize,
    /// Top-node indices of the eight daughters, in octant order.
    pub children: Option<[usize; 8]>,
    /// Index into the top-leaf list when this node is not split.
    pub leaf: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TopLeaf {
    pub node: usize,
    pub owner: usize,
    pub count: usize,
}

/// The top-level tree every rank agrees on.
///
/// Nodes are stored in depth-first order with the root at index 0, so a
/// parent always precedes its daughters. Leaves appear in the same order,
/// which follows the octant (Morton) ordering of space, and are handed to
/// ranks in contiguous runs of roughly equal particle count.
#[derive(Clone, Debug)]
pub struct DomainDecomposition {
    ntask: usize,
    nodes: Vec<TopNode>,
    leaves: Vec<TopLeaf>,
}

impl DomainDecomposition {
    pub fn new(
        positions: &[Vec3],
        region: Region,
        settings: &DomainSettings,
        ntask: usize,
    ) -> Self {
        assert!(ntask > 0);
        let mut domain = Self {
            ntask,
            nodes: Vec::new(),
            leaves: Vec::new(),
        };
        let points: Vec<&Vec3> = positions.iter().collect();
        domain.refine(region, 0, points, settings);
        domain.assign_owners(positions.len());
        debug!(
            "Domain decomposition: {} top nodes, {} top leaves over {} ranks",
            domain.nodes.len(),
            domain.leaves.len(),
            ntask
        );
        domain
    }

    fn refine(
        &mut self,
        region: Region,
        depth: usize,
        points: Vec<&Vec3>,
        settings: &DomainSettings,
    ) -> usize {
        let index = self.nodes.len();
        self.nodes.push(TopNode {
            region,
            depth,
            children: None,
            leaf: None,
        });

        if points.len() <= settings.max_leaf_particles || depth >= settings.max_depth {
            self.nodes[index].leaf = Some(self.leaves.len());
            self.leaves.push(TopLeaf {
                node: index,
                owner: 0,
                count: points.len(),
            });
            return index;
        }

        let mut orthants = vec![Vec::new(); 8];
        for point in points {
            orthants[region.octant(point)].push(point);
        }
        let mut children = [0; 8];
        for (octant, points) in orthants.into_iter().enumerate() {
            children[octant] = self.refine(region.child(octant), depth + 1, points, settings);
        }
        self.nodes[index].children = Some(children);
        index
    }

    fn assign_owners(&mut self, total: usize) {
        let ntask = self.ntask;
        let mut before = 0;
        for leaf in &mut self.leaves {
            leaf.owner = if total == 0 {
                0
            } else {
                ((2 * before + leaf.count) * ntask / (2 * total)).min(ntask - 1)
            };
            before += leaf.count;
        }
    }

    pub fn ntask(&self) -> usize {
        self.ntask
    }

    pub fn nodes(&self) -> &[TopNode] {
        &self.nodes
    }

    pub fn leaves(&self) -> &[TopLeaf] {
        &self.leaves
    }

    pub fn region(&self) -> &Region {
        &self.nodes[0].region
    }

    pub fn top_leaf_of(&self, pos: &Vec3) -> usize {
        let mut node = &self.nodes[0];
        loop {
            match (node.leaf, node.children) {
                (Some(leaf), _) => return leaf,
                (None, Some(children)) => node = &self.nodes[children[node.region.octant(pos)]],
                (None, None) => unreachable!("top node without leaf or daughters"),
            }
        }
    }

    pub fn owner_of(&self, pos: &Vec3) -> usize {
        self.leaves[self.top_leaf_of(pos)].owner
    }

    /// Splits a global particle set into per-rank sets, each ordered by id.
    pub fn distribute(&self, particles: Vec<GravParticle>) -> Vec<Vec<GravParticle>> {
        let mut ranks = vec![Vec::new(); self.ntask];
        for p in particles {
            ranks[self.owner_of(&p.position)].push(p);
        }
        for rank in &mut ranks {
            rank.sort_by_key(|p| p.id);
        }
        ranks
    }

    /// First particle lying in a top-level leaf owned by a rank other than `rank`.
    pub fn find_misplaced<'p>(
        &self,
        particles: &'p [GravParticle],
        rank: usize,
    ) -> Option<&'p GravParticle> {
        particles.iter().find(|p| self.owner_of(&p.position) != rank)
    }
}
