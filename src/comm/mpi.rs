//! One rank per MPI process.

use mpi::{
    Count,
    collective::SystemOperation,
    datatype::{Partition, PartitionMut},
    environment::Universe,
    topology::SimpleCommunicator,
    traits::{Communicator as _, CommunicatorCollectives},
};

use super::{Communicator, Payload, payload};

/// Communicator over an MPI communicator, usually the world of the running job.
pub struct MpiComm {
    world: SimpleCommunicator,
}

fn count(len: usize) -> Count {
    Count::try_from(len).expect("message exceeds the MPI count range")
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |offset, &c| {
            let start = *offset;
            *offset += c;
            Some(start)
        })
        .collect()
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }

    pub fn world(universe: &Universe) -> Self {
        Self::new(universe.world())
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn all_to_all<T: Payload>(&self, outgoing: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let size = self.size();
        assert_eq!(outgoing.len(), size, "one destination per rank");

        let mut send = Vec::new();
        let mut send_counts = Vec::with_capacity(size);
        for data in &outgoing {
            let start = send.len();
            data.encode(&mut send);
            send_counts.push(count(send.len() - start));
        }
        let mut recv_counts: Vec<Count> = vec![0; size];
        self.world.all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let send_displs = displacements(&send_counts);
        let recv_displs = displacements(&recv_counts);
        let total = recv_counts.iter().map(|&c| c as usize).sum();
        let mut recv = vec![0u8; total];
        {
            let partition = Partition::new(&send[..], &send_counts[..], &send_displs[..]);
            let mut partition_mut =
                PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
            self.world.all_to_all_varcount_into(&partition, &mut partition_mut);
        }

        recv_displs
            .iter()
            .zip(&recv_counts)
            .map(|(&start, &len)| {
                let bytes = &recv[start as usize..(start + len) as usize];
                payload::from_bytes::<Vec<T>>(bytes)
                    .expect("ranks exchanged different payload types")
            })
            .collect()
    }

    fn all_reduce_sum(&self, value: u64) -> u64 {
        let mut sum = 0u64;
        self.world.all_reduce_into(&value, &mut sum, SystemOperation::sum());
        sum
    }

    fn all_reduce_or(&self, flag: bool) -> bool {
        let mut any = 0u8;
        self.world
            .all_reduce_into(&u8::from(flag), &mut any, SystemOperation::max());
        any != 0
    }
}
