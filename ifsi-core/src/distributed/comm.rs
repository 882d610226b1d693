//! Rank-to-rank communication for the thread-SPMD deployment.
//!
//! A full mesh of mpsc channels plus a shared barrier. Collectives are
//! simple and synchronous: reductions go through rank 0, all-to-all
//! exchanges send point-to-point and close with a barrier so consecutive
//! collectives cannot interleave. Every rank must call every collective.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};

/// Payload of a rank-to-rank message.
pub enum Message {
    Sum(f64),
    Values(Vec<f64>),
    Indices(Vec<usize>),
    Triplets(Vec<(usize, usize, f64)>),
}

/// Per-rank handle to the communication mesh.
pub struct Communicator {
    rank: usize,
    size: usize,
    /// txs[r] sends to rank r.
    txs: Vec<Sender<Message>>,
    /// rxs[r] receives what rank r sent here.
    rxs: Vec<Receiver<Message>>,
    barrier: Arc<Barrier>,
}

impl Communicator {
    /// Build communicators for `size` ranks.
    pub fn create(size: usize) -> Vec<Communicator> {
        assert!(size > 0, "communicator needs at least one rank");
        let barrier = Arc::new(Barrier::new(size));

        // channels[from][to]
        let mut senders: Vec<Vec<Option<Sender<Message>>>> = Vec::with_capacity(size);
        let mut receivers: Vec<Vec<Option<Receiver<Message>>>> = (0..size)
            .map(|_| (0..size).map(|_| None).collect())
            .collect();
        for from in 0..size {
            let mut row = Vec::with_capacity(size);
            for to in 0..size {
                let (tx, rx) = channel();
                row.push(Some(tx));
                receivers[to][from] = Some(rx);
            }
            senders.push(row);
        }

        let mut comms = Vec::with_capacity(size);
        for rank in 0..size {
            let txs = (0..size)
                .map(|to| senders[rank][to].take().expect("sender taken once"))
                .collect();
            let rxs = receivers[rank]
                .iter_mut()
                .map(|rx| rx.take().expect("receiver taken once"))
                .collect();
            comms.push(Communicator {
                rank,
                size,
                txs,
                rxs,
                barrier: Arc::clone(&barrier),
            });
        }
        comms
    }

    /// This rank's id.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Synchronize all ranks.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Global sum, identical on every rank (rank 0 accumulates in rank
    /// order and broadcasts, so the result is bitwise reproducible).
    pub fn all_reduce_sum(&self, value: f64) -> f64 {
        if self.size == 1 {
            return value;
        }
        let result = if self.rank == 0 {
            let mut sum = value;
            for r in 1..self.size {
                match self.rxs[r].recv() {
                    Ok(Message::Sum(v)) => sum += v,
                    _ => panic!("all_reduce_sum: unexpected message from rank {}", r),
                }
            }
            for r in 1..self.size {
                self.txs[r]
                    .send(Message::Sum(sum))
                    .expect("broadcast failed");
            }
            sum
        } else {
            self.txs[0].send(Message::Sum(value)).expect("send failed");
            match self.rxs[0].recv() {
                Ok(Message::Sum(v)) => v,
                _ => panic!("all_reduce_sum: unexpected broadcast"),
            }
        };
        self.barrier();
        result
    }

    /// Gather every rank's values; result is indexed by rank, identical
    /// everywhere.
    pub fn all_gather_values(&self, local: Vec<f64>) -> Vec<Vec<f64>> {
        let mut gathered: Vec<Vec<f64>> = (0..self.size).map(|_| Vec::new()).collect();
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            self.txs[r]
                .send(Message::Values(local.clone()))
                .expect("send failed");
        }
        for (r, slot) in gathered.iter_mut().enumerate() {
            if r == self.rank {
                *slot = local.clone();
                continue;
            }
            match self.rxs[r].recv() {
                Ok(Message::Values(v)) => *slot = v,
                _ => panic!("all_gather_values: unexpected message from rank {}", r),
            }
        }
        self.barrier();
        gathered
    }

    /// Gather every rank's triplets, identical everywhere.
    pub fn all_gather_triplets(
        &self,
        local: Vec<(usize, usize, f64)>,
    ) -> Vec<Vec<(usize, usize, f64)>> {
        let mut gathered: Vec<Vec<(usize, usize, f64)>> =
            (0..self.size).map(|_| Vec::new()).collect();
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            self.txs[r]
                .send(Message::Triplets(local.clone()))
                .expect("send failed");
        }
        for (r, slot) in gathered.iter_mut().enumerate() {
            if r == self.rank {
                *slot = local.clone();
                continue;
            }
            match self.rxs[r].recv() {
                Ok(Message::Triplets(t)) => *slot = t,
                _ => panic!("all_gather_triplets: unexpected message from rank {}", r),
            }
        }
        self.barrier();
        gathered
    }

    /// All-to-all exchange of index lists: `outgoing[r]` goes to rank r,
    /// the result slot r holds what rank r sent here.
    pub fn exchange_indices(&self, outgoing: &[Vec<usize>]) -> Vec<Vec<usize>> {
        debug_assert_eq!(outgoing.len(), self.size);
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            self.txs[r]
                .send(Message::Indices(outgoing[r].clone()))
                .expect("send failed");
        }
        let mut incoming: Vec<Vec<usize>> = (0..self.size).map(|_| Vec::new()).collect();
        incoming[self.rank] = outgoing[self.rank].clone();
        for (r, slot) in incoming.iter_mut().enumerate() {
            if r == self.rank {
                continue;
            }
            match self.rxs[r].recv() {
                Ok(Message::Indices(ids)) => *slot = ids,
                _ => panic!("exchange_indices: unexpected message from rank {}", r),
            }
        }
        self.barrier();
        incoming
    }

    /// All-to-all exchange of value lists.
    pub fn exchange_values(&self, outgoing: &[Vec<f64>]) -> Vec<Vec<f64>> {
        debug_assert_eq!(outgoing.len(), self.size);
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            self.txs[r]
                .send(Message::Values(outgoing[r].clone()))
                .expect("send failed");
        }
        let mut incoming: Vec<Vec<f64>> = (0..self.size).map(|_| Vec::new()).collect();
        incoming[self.rank] = outgoing[self.rank].clone();
        for (r, slot) in incoming.iter_mut().enumerate() {
            if r == self.rank {
                continue;
            }
            match self.rxs[r].recv() {
                Ok(Message::Values(v)) => *slot = v,
                _ => panic!("exchange_values: unexpected message from rank {}", r),
            }
        }
        self.barrier();
        incoming
    }

    /// All-to-all exchange of matrix triplets.
    pub fn exchange_triplets(
        &self,
        outgoing: &[Vec<(usize, usize, f64)>],
    ) -> Vec<Vec<(usize, usize, f64)>> {
        debug_assert_eq!(outgoing.len(), self.size);
        for r in 0..self.size {
            if r == self.rank {
                continue;
            }
            self.txs[r]
                .send(Message::Triplets(outgoing[r].clone()))
                .expect("send failed");
        }
        let mut incoming: Vec<Vec<(usize, usize, f64)>> =
            (0..self.size).map(|_| Vec::new()).collect();
        incoming[self.rank] = outgoing[self.rank].clone();
        for (r, slot) in incoming.iter_mut().enumerate() {
            if r == self.rank {
                continue;
            }
            match self.rxs[r].recv() {
                Ok(Message::Triplets(t)) => *slot = t,
                _ => panic!("exchange_triplets: unexpected message from rank {}", r),
            }
        }
        self.barrier();
        incoming
    }
}
