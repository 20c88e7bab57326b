//! Distributed tree walk driven by a pluggable visitor.
//!
//! Each rank walks the tree for its active particles. Reaching a
//! pseudo-particle queues the query for the rank owning that branch. Queued
//! queries are exchanged once the local phase is over, walked by their target
//! rank in import mode, and the partial results are sent back and reduced
//! into the originating particle. A particle whose exports do not fit in the
//! export buffer is rolled back and walked again in the next round.

use std::{
    ops::AddAssign,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use log::{Level, debug, log};
use rayon::prelude::*;
use smallvec::{SmallVec, smallvec};

use crate::{
    comm::{Communicator, Payload},
    error::{GravityError, Result},
    shared::{Particle, Vec3},
    tree::SpatialTree,
};

/// Top-level nodes one export record can carry.
pub const NODE_LIST_LENGTH: usize = 8;

/// Top-level node indices a walk starts from, in order.
pub type NodeList = SmallVec<[usize; NODE_LIST_LENGTH]>;

pub const ROOT_TOP_NODE: usize = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WalkMode {
    /// Walking an owned particle from the root.
    Local,
    /// Walking a query received from another rank, restricted to its node list.
    Import,
}

impl WalkMode {
    /// Local results overwrite, imported partial results accumulate.
    ///
    /// A particle rolled back for lack of export space is walked again from
    /// scratch, so assigning in local mode keeps that repeat harmless.
    pub fn reduce<T: AddAssign>(self, target: &mut T, value: T) {
        match self {
            WalkMode::Local => *target = value,
            WalkMode::Import => *target += value,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TreeWalkQuery<Q> {
    pub position: Vec3,
    pub node_list: NodeList,
    pub data: Q,
}

impl<Q: Payload> Payload for TreeWalkQuery<Q> {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.position.encode(buf);
        self.node_list.encode(buf);
        self.data.encode(buf);
    }

    fn decode(buf: &mut &[u8]) -> Option<Self> {
        Some(Self {
            position: Vec3::decode(buf)?,
            node_list: NodeList::decode(buf)?,
            data: Q::decode(buf)?,
        })
    }
}

/// Outcome of one visit.
#[derive(Clone, Debug, PartialEq)]
pub enum Visit<R> {
    Done(R),
    /// The export buffer filled up; walk this particle again next round.
    Retry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferFull;

pub trait TreeWalkVisitor: Sync {
    type Particle: Particle + Send + Sync;
    /// Queries and results cross rank boundaries, so both must encode to bytes.
    type Query: Payload + Clone + Sync;
    type Result: Payload;

    /// Name used in log messages and errors.
    fn label(&self) -> &'static str;

    /// Further restricts the active set handed to [`TreeWalk::run`].
    fn is_active(&self, _particle: &Self::Particle) -> bool {
        true
    }

    fn fill(&self, particle: &Self::Particle) -> Self::Query;

    /// Walks the tree for one query, calling [`LocalTreeWalk::export_particle`]
    /// for every pseudo-particle it reaches.
    fn visit(
        &self,
        query: &TreeWalkQuery<Self::Query>,
        lv: &mut LocalTreeWalk<'_>,
    ) -> Visit<Self::Result>;

    fn reduce(&self, particle: &mut Self::Particle, result: Self::Result, mode: WalkMode);

    fn postprocess(&self, _particle: &mut Self::Particle) {}
}

/// Export record slots shared by all threads of one rank.
#[derive(Debug)]
pub struct ExportSlots {
    capacity: usize,
    used: AtomicUsize,
}

impl ExportSlots {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn try_reserve(&self) -> std::result::Result<(), BufferFull> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < self.capacity).then_some(used + 1)
            })
            .map(|_| ())
            .map_err(|_| BufferFull)
    }

    fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
    }

    fn reset(&mut self) {
        *self.used.get_mut() = 0;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Export {
    task: usize,
    node_list: NodeList,
}

/// Per-visit state: the walk mode, the tree and the exports of the particle being walked.
pub struct LocalTreeWalk<'a> {
    mode: WalkMode,
    tree: &'a SpatialTree,
    slots: &'a ExportSlots,
    exports: Vec<Export>,
}

impl<'a> LocalTreeWalk<'a> {
    pub fn new(mode: WalkMode, tree: &'a SpatialTree, slots: &'a ExportSlots) -> Self {
        Self {
            mode,
            tree,
            slots,
            exports: Vec::new(),
        }
    }

    pub fn mode(&self) -> WalkMode {
        self.mode
    }

    pub fn tree(&self) -> &'a SpatialTree {
        self.tree
    }

    /// Queues the current particle for the rank owning pseudo-particle `pseudo`.
    ///
    /// The branch joins the particle's open record for that rank while the
    /// record has room, otherwise a new record is reserved. Import walks never
    /// forward work, so this is a no-op for them.
    pub fn export_particle(&mut self, pseudo: usize) -> std::result::Result<(), BufferFull> {
        if self.mode == WalkMode::Import {
            return Ok(());
        }
        let target = self.tree.pseudo(pseudo);

        if let Some(open) = self
            .exports
            .iter_mut()
            .rev()
            .find(|e| e.task == target.task)
            .filter(|e| e.node_list.len() < NODE_LIST_LENGTH)
        {
            open.node_list.push(target.top_node);
            return Ok(());
        }

        self.slots.try_reserve()?;
        self.exports.push(Export {
            task: target.task,
            node_list: smallvec![target.top_node],
        });
        Ok(())
    }

    pub fn num_exports(&self) -> usize {
        self.exports.len()
    }

    fn abandon(self) {
        self.slots.release(self.exports.len());
    }

    fn into_exports(self) -> Vec<Export> {
        self.exports
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TreeWalkTimings {
    pub local: Duration,
    pub import: Duration,
    pub postprocess: Duration,
    pub wait: Duration,
    pub comm: Duration,
}

impl TreeWalkTimings {
    pub fn total(&self) -> Duration {
        self.local + self.import + self.postprocess + self.wait + self.comm
    }
}

impl AddAssign for TreeWalkTimings {
    fn add_assign(&mut self, other: Self) {
        self.local += other.local;
        self.import += other.import;
        self.postprocess += other.postprocess;
        self.wait += other.wait;
        self.comm += other.comm;
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeWalkReport {
    pub rounds: usize,
    /// Particles fully processed, summed over all ranks.
    pub processed: u64,
    /// Export records this rank sent.
    pub exported: usize,
    /// Queries this rank walked for other ranks.
    pub imported: usize,
    /// Local walks this rank rolled back for lack of export space.
    pub retries: usize,
    pub timings: TreeWalkTimings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TreeWalkSettings {
    pub export_buffer_size: usize,
    /// Reported in the consistency error.
    pub step: u64,
}

enum LocalOutcome<R> {
    Done { place: usize, result: R, exports: Vec<Export> },
    Retry { place: usize },
}

/// The visitor and tree, shared by the worker threads of one rank.
struct Walker<'a, V> {
    visitor: &'a V,
    tree: &'a SpatialTree,
}

impl<V: TreeWalkVisitor> Walker<'_, V> {
    fn query(&self, particle: &V::Particle, node_list: NodeList) -> TreeWalkQuery<V::Query> {
        TreeWalkQuery {
            position: *particle.position(),
            node_list,
            data: self.visitor.fill(particle),
        }
    }

    fn walk_local(
        &self,
        particles: &[V::Particle],
        place: usize,
        slots: &ExportSlots,
    ) -> LocalOutcome<V::Result> {
        let query = self.query(&particles[place], smallvec![ROOT_TOP_NODE]);
        let mut lv = LocalTreeWalk::new(WalkMode::Local, self.tree, slots);
        match self.visitor.visit(&query, &mut lv) {
            Visit::Done(result) => LocalOutcome::Done {
                place,
                result,
                exports: lv.into_exports(),
            },
            Visit::Retry => {
                lv.abandon();
                LocalOutcome::Retry { place }
            }
        }
    }

    /// `None` if the visitor gave up on an imported query.
    fn walk_import(&self, query: &TreeWalkQuery<V::Query>) -> Option<V::Result> {
        let empty = ExportSlots::new(0);
        let mut lv = LocalTreeWalk::new(WalkMode::Import, self.tree, &empty);
        match self.visitor.visit(query, &mut lv) {
            Visit::Done(result) => Some(result),
            Visit::Retry => None,
        }
    }
}

pub struct TreeWalk<'a, V, C> {
    walker: Walker<'a, V>,
    comm: &'a C,
    settings: TreeWalkSettings,
}

impl<'a, V, C> TreeWalk<'a, V, C>
where
    V: TreeWalkVisitor,
    C: Communicator,
{
    pub fn new(
        visitor: &'a V,
        tree: &'a SpatialTree,
        comm: &'a C,
        settings: TreeWalkSettings,
    ) -> Self {
        Self {
            walker: Walker { visitor, tree },
            comm,
            settings,
        }
    }

    fn log_level(&self) -> Level {
        if self.comm.rank() == 0 {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Walks the active particles among `active`, exchanging work with the
    /// other ranks until every one of them has been processed everywhere.
    ///
    /// Collective: every rank must call it, possibly with an empty active set.
    pub fn run(&self, particles: &mut [V::Particle], active: &[usize]) -> Result<TreeWalkReport> {
        let walker = &self.walker;
        let visitor = walker.visitor;
        let label = visitor.label();
        let ntask = self.comm.size();
        let mut report = TreeWalkReport::default();
        let mut slots = ExportSlots::new(self.settings.export_buffer_size);

        let mut queue: Vec<usize> = active
            .iter()
            .copied()
            .filter(|&i| visitor.is_active(&particles[i]))
            .collect();
        let expected = self.comm.all_reduce_sum(queue.len() as u64);
        let mut mask = vec![false; particles.len()];
        for &i in &queue {
            mask[i] = true;
        }
        let mut completed = 0u64;
        let mut lost = vec![false; particles.len()];

        log!(
            self.log_level(),
            "{label}: walking {expected} particles on {ntask} ranks, {} export records",
            slots.capacity()
        );

        loop {
            report.rounds += 1;
            slots.reset();

            let start = Instant::now();
            let mut outcomes: Vec<LocalOutcome<V::Result>> = {
                let particles = &*particles;
                queue
                    .par_iter()
                    .map(|&place| walker.walk_local(particles, place, &slots))
                    .collect()
            };
            let all_retry = outcomes
                .iter()
                .all(|o| matches!(o, LocalOutcome::Retry { .. }));
            if !queue.is_empty() && all_retry {
                // Threads racing for slots may starve each other. One particle
                // alone on an empty buffer either fits or never will.
                slots.reset();
                outcomes[0] = walker.walk_local(particles, queue[0], &slots);
            }
            let stuck = outcomes
                .first()
                .is_some_and(|o| matches!(o, LocalOutcome::Retry { .. }))
                && outcomes.iter().all(|o| matches!(o, LocalOutcome::Retry { .. }));
            report.timings.local += start.elapsed();

            if self.comm.all_reduce_or(stuck) {
                return Err(GravityError::ExportBufferTooSmall {
                    label,
                    capacity: slots.capacity(),
                });
            }

            let mut retry = Vec::new();
            let mut outgoing: Vec<Vec<(usize, TreeWalkQuery<V::Query>)>> =
                (0..ntask).map(|_| Vec::new()).collect();
            for outcome in outcomes {
                match outcome {
                    LocalOutcome::Done {
                        place,
                        result,
                        exports,
                    } => {
                        visitor.reduce(&mut particles[place], result, WalkMode::Local);
                        completed += 1;
                        report.exported += exports.len();
                        for export in exports {
                            let query = walker.query(&particles[place], export.node_list);
                            outgoing[export.task].push((place, query));
                        }
                    }
                    LocalOutcome::Retry { place } => retry.push(place),
                }
            }
            report.retries += retry.len();

            let start = Instant::now();
            self.comm.barrier();
            report.timings.wait += start.elapsed();

            let start = Instant::now();
            let incoming = self.comm.all_to_all(outgoing);
            report.timings.comm += start.elapsed();

            let start = Instant::now();
            report.imported += incoming.iter().map(Vec::len).sum::<usize>();
            let results: Vec<Vec<(usize, Option<V::Result>)>> = incoming
                .into_par_iter()
                .map(|queries| {
                    queries
                        .into_par_iter()
                        .map(|(place, query)| (place, walker.walk_import(&query)))
                        .collect()
                })
                .collect();
            report.timings.import += start.elapsed();

            let start = Instant::now();
            self.comm.barrier();
            report.timings.wait += start.elapsed();

            let start = Instant::now();
            let returned = self.comm.all_to_all(results);
            report.timings.comm += start.elapsed();

            for (place, result) in returned.into_iter().flatten() {
                match result {
                    Some(result) => visitor.reduce(&mut particles[place], result, WalkMode::Import),
                    None => lost[place] = true,
                }
            }

            let remaining = self.comm.all_reduce_sum(retry.len() as u64);
            debug!(
                "{label}: rank {} round {}: {} exported, {} retried, {remaining} left globally",
                self.comm.rank(),
                report.rounds,
                report.exported,
                retry.len()
            );
            queue = retry;
            if remaining == 0 {
                break;
            }
        }

        let lost = lost.iter().filter(|&&l| l).count() as u64;
        report.processed = self.comm.all_reduce_sum(completed - lost);
        if report.processed != expected {
            return Err(GravityError::ParticleCountMismatch {
                label,
                step: self.settings.step,
                expected,
                processed: report.processed,
            });
        }

        let start = Instant::now();
        particles
            .par_iter_mut()
            .zip(mask.par_iter())
            .filter(|(_, active)| **active)
            .for_each(|(p, _)| visitor.postprocess(p));
        report.timings.postprocess += start.elapsed();

        log!(
            self.log_level(),
            "{label}: {} particles done in {} rounds (rank {}: {} out, {} in, {} retries)",
            report.processed,
            report.rounds,
            self.comm.rank(),
            report.exported,
            report.imported,
            report.retries
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Leaf, Node, NodeFlags, NodeId, PseudoParticle};
    use crate::shared::ParticleType;

    fn tree_with_remote_leaves(tasks: &[usize]) -> SpatialTree {
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
        let pseudo: Vec<PseudoParticle> = tasks
            .iter()
            .enumerate()
            .map(|(k, &task)| PseudoParticle { task, top_node: k + 1 })
            .collect();
        SpatialTree::from_parts(
            vec![node; tasks.len() + 1],
            vec![Leaf {
                position: Vec3::zeros(),
                mass: 1.0,
                ptype: ParticleType::Halo,
                hsml: 0.0,
            }],
            vec![NodeId::NONE],
            pseudo,
            vec![NodeId::NONE; tasks.len()],
            tasks.len() + 1,
        )
    }

    #[test]
    fn exports_to_one_rank_share_a_record_until_full() {
        let tree = tree_with_remote_leaves(&[1; 10]);
        let slots = ExportSlots::new(10);
        let mut lv = LocalTreeWalk::new(WalkMode::Local, &tree, &slots);
        for k in 0..10 {
            lv.export_particle(k).unwrap();
        }
        assert_eq!(lv.num_exports(), 2);
        assert_eq!(slots.used(), 2);
        let exports = lv.into_exports();
        assert_eq!(exports[0].node_list.len(), NODE_LIST_LENGTH);
        assert_eq!(exports[1].node_list.as_slice(), &[9, 10]);
    }

    #[test]
    fn full_buffer_is_reported_and_released() {
        let tree = tree_with_remote_leaves(&[1, 2, 3]);
        let slots = ExportSlots::new(2);
        let mut lv = LocalTreeWalk::new(WalkMode::Local, &tree, &slots);
        assert!(lv.export_particle(0).is_ok());
        assert!(lv.export_particle(1).is_ok());
        assert_eq!(lv.export_particle(2), Err(BufferFull));
        lv.abandon();
        assert_eq!(slots.used(), 0);
    }

    #[test]
    fn import_walks_never_export() {
        let tree = tree_with_remote_leaves(&[1]);
        let slots = ExportSlots::new(0);
        let mut lv = LocalTreeWalk::new(WalkMode::Import, &tree, &slots);
        assert!(lv.export_particle(0).is_ok());
        assert_eq!(lv.num_exports(), 0);
    }

    #[test]
    fn reduce_assigns_locally_and_accumulates_imports() {
        let mut x = 5.0;
        WalkMode::Local.reduce(&mut x, 2.0);
        assert_eq!(x, 2.0);
        WalkMode::Import.reduce(&mut x, 3.0);
        assert_eq!(x, 5.0);
    }
}
