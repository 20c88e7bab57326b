//! Collective operations between ranks.
//!
//! Ranks are the unit of data ownership. Each holds its own particles and
//! tree and exchanges data only through the [`Communicator`] it is handed.
//! [`LocalCluster`] runs a group of ranks as threads of one process; with the
//! `mpi` feature, [`MpiComm`] runs one rank per MPI process.

#[cfg(feature = "mpi")]
mod mpi;
pub mod payload;

use std::{
    any::Any,
    sync::{Barrier, Mutex},
    thread,
};

#[cfg(feature = "mpi")]
pub use self::mpi::MpiComm;
pub use payload::Payload;

pub trait Communicator {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    fn barrier(&self);

    /// Sends `outgoing[r]` to rank `r` and returns what every rank sent here,
    /// indexed by source rank. Collective: all ranks must call it.
    fn all_to_all<T: Payload>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>>;

    fn all_gather<T: Payload + Clone>(&self, item: T) -> Vec<T> {
        let outgoing = vec![vec![item]; self.size()];
        self.all_to_all(outgoing).into_iter().flatten().collect()
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        self.all_gather(value).into_iter().sum()
    }

    fn all_reduce_or(&self, flag: bool) -> bool {
        self.all_gather(flag).into_iter().any(|f| f)
    }
}

/// A single rank owning the whole domain.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn all_to_all<T: Payload>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        assert_eq!(outgoing.len(), 1, "one destination per rank");
        outgoing
    }
}

type Cell = Mutex<Option<Box<dyn Any + Send>>>;

struct Exchange {
    size: usize,
    /// Messages travel as bytes instead of moved values.
    encoded: bool,
    barrier: Barrier,
    /// `cells[src * size + dst]` carries one message per collective.
    cells: Vec<Cell>,
}

impl Exchange {
    fn new(size: usize, encoded: bool) -> Self {
        Self {
            size,
            encoded,
            barrier: Barrier::new(size),
            cells: (0..size * size).map(|_| Mutex::new(None)).collect(),
        }
    }
}

/// Communicator handed to one rank thread of a [`LocalCluster`].
pub struct ThreadComm<'a> {
    rank: usize,
    exchange: &'a Exchange,
}

impl Communicator for ThreadComm<'_> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.exchange.size
    }

    fn barrier(&self) {
        self.exchange.barrier.wait();
    }

    fn all_to_all<T: Payload>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let size = self.exchange.size;
        assert_eq!(outgoing.len(), size, "one destination per rank");

        for (dst, data) in outgoing.into_iter().enumerate() {
            let message: Box<dyn Any + Send> = if self.exchange.encoded {
                Box::new(payload::to_bytes(&data))
            } else {
                Box::new(data)
            };
            let mut cell = self.exchange.cells[self.rank * size + dst]
                .lock()
                .expect("exchange cell poisoned");
            *cell = Some(message);
        }
        self.barrier();

        let incoming = (0..size)
            .map(|src| {
                let message = self.exchange.cells[src * size + self.rank]
                    .lock()
                    .expect("exchange cell poisoned")
                    .take()
                    .expect("rank skipped a collective");
                if self.exchange.encoded {
                    let bytes = message
                        .downcast::<Vec<u8>>()
                        .expect("encoded exchange carries bytes");
                    payload::from_bytes::<Vec<T>>(&bytes)
                        .expect("ranks exchanged different payload types")
                } else {
                    *message
                        .downcast::<Vec<T>>()
                        .expect("ranks exchanged different payload types")
                }
            })
            .collect();
        // Nobody may refill a cell before every rank has drained its own.
        self.barrier();
        incoming
    }
}

/// A group of ranks run as threads of the current process.
#[derive(Clone, Copy, Debug)]
pub struct LocalCluster {
    size: usize,
    encoded: bool,
}

impl LocalCluster {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "a cluster needs at least one rank");
        Self {
            size,
            encoded: false,
        }
    }

    /// Sends every message as bytes, exactly as it would travel between
    /// processes, instead of moving values between threads.
    pub fn encoded(self) -> Self {
        Self {
            encoded: true,
            ..self
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `f` once per rank with that rank's input and collects the results in rank order.
    pub fn run<I, R, F>(&self, inputs: Vec<I>, f: F) -> Vec<R>
    where
        I: Send,
        R: Send,
        F: Fn(&ThreadComm<'_>, I) -> R + Sync,
    {
        assert_eq!(inputs.len(), self.size, "one input per rank");
        let exchange = Exchange::new(self.size, self.encoded);
        let exchange = &exchange;
        let f = &f;

        thread::scope(|s| {
            let handles: Vec<_> = inputs
                .into_iter()
                .enumerate()
                .map(|(rank, input)| {
                    thread::Builder::new()
                        .name(format!("rank-{rank}"))
                        .spawn_scoped(s, move || {
                            let comm = ThreadComm { rank, exchange };
                            f(&comm, input)
                        })
                        .expect("failed to spawn rank thread")
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
                .collect()
        })
    }
}
