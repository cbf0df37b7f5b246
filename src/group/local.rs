use std::{collections::HashMap, fmt, sync::Arc};

use log::{debug, warn};
use ndarray::ArrayD;
use parking_lot::Mutex;

use super::{ProcessGroup, ReduceOp};
use crate::{
    error::CommErr,
    future::{CommFuture, Completion, Outcome},
    tensor::{self, Tensor},
};

/// An in-process group whose ranks live in the same address space.
///
/// Each rank's n-th collective is matched with every other rank's n-th collective.
/// The last rank to contribute computes the result and resolves every rank's future.
#[derive(Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Rendezvous>,
}

struct Rendezvous {
    world_size: usize,
    state: Mutex<State>,
}

struct State {
    closed: Option<CommErr>,
    next_seq: Vec<u64>,
    in_flight: HashMap<u64, Collective>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    AllReduce(ReduceOp),
    Broadcast { root: usize },
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::AllReduce(_) => "allreduce",
            Kind::Broadcast { .. } => "broadcast",
        }
    }
}

/// One collective while ranks are still joining it.
struct Collective {
    kind: Kind,
    inputs: Vec<Option<Vec<Tensor>>>,
    completions: Vec<Completion>,
    mismatch: Option<String>,
}

impl LocalGroup {
    /// Creates the handles of every rank of a new group.
    ///
    /// # Arguments
    /// * `world_size` - The amount of ranks.
    ///
    /// # Returns
    /// One handle per rank, indexed by rank.
    pub fn new_group(world_size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Rendezvous {
            world_size,
            state: Mutex::new(State {
                closed: None,
                next_seq: vec![0; world_size],
                in_flight: HashMap::new(),
            }),
        });

        (0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Tears the whole group down.
    ///
    /// Pending collectives fail with `CommErr::Aborted` and later launches are rejected.
    pub fn abort(&self, reason: impl Into<String>) {
        self.close(CommErr::Aborted(reason.into()));
    }

    /// Removes this rank from the group, as if its host became unreachable.
    ///
    /// Every rank's pending and later collectives fail with `CommErr::PeerUnreachable`.
    pub fn leave(&self) {
        self.close(CommErr::PeerUnreachable { rank: self.rank });
    }

    fn close(&self, err: CommErr) {
        let pending: Vec<_> = {
            let mut state = self.shared.state.lock();
            if state.closed.is_some() {
                return;
            }

            state.closed = Some(err.clone());
            state.in_flight.drain().map(|(_, c)| c).collect()
        };

        warn!(rank = self.rank, pending = pending.len(); "closing group: {err}");

        for collective in pending {
            for completion in collective.completions {
                completion.fail(err.clone());
            }
        }
    }

    fn launch(&self, kind: Kind, tensors: Vec<Tensor>) -> Result<CommFuture, CommErr> {
        let (completion, fut) = CommFuture::pending();
        let world_size = self.shared.world_size;

        let ready = {
            let mut state = self.shared.state.lock();
            if let Some(err) = &state.closed {
                return Err(err.clone());
            }

            let seq = state.next_seq[self.rank];
            state.next_seq[self.rank] += 1;

            let collective = state
                .in_flight
                .entry(seq)
                .or_insert_with(|| Collective::new(kind, world_size));

            collective.join(self.rank, kind, tensors, completion);
            debug!(rank = self.rank, seq = seq; "joined {}", kind.name());

            if collective.completions.len() == world_size {
                state.in_flight.remove(&seq)
            } else {
                None
            }
        };

        // The last rank in resolves everyone, outside the lock.
        if let Some(collective) = ready {
            collective.resolve();
        }

        Ok(fut)
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn allreduce(&self, tensors: Vec<Tensor>, op: ReduceOp) -> Result<CommFuture, CommErr> {
        self.launch(Kind::AllReduce(op), tensors)
    }

    fn broadcast(&self, tensors: Vec<Tensor>, root: usize) -> Result<CommFuture, CommErr> {
        if root >= self.shared.world_size {
            return Err(CommErr::InvalidInput(format!(
                "broadcast root {root} is out of range for world size {}",
                self.shared.world_size
            )));
        }

        self.launch(Kind::Broadcast { root }, tensors)
    }
}

impl fmt::Debug for LocalGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalGroup")
            .field("rank", &self.rank)
            .field("world_size", &self.shared.world_size)
            .finish()
    }
}

impl Collective {
    fn new(kind: Kind, world_size: usize) -> Self {
        Self {
            kind,
            inputs: vec![None; world_size],
            completions: Vec::with_capacity(world_size),
            mismatch: None,
        }
    }

    fn join(&mut self, rank: usize, kind: Kind, tensors: Vec<Tensor>, completion: Completion) {
        if kind != self.kind && self.mismatch.is_none() {
            self.mismatch = Some(format!(
                "rank {rank} launched {kind:?} while others launched {:?}",
                self.kind
            ));
        }

        self.inputs[rank] = Some(tensors);
        self.completions.push(completion);
    }

    fn resolve(self) {
        let op = self.kind.name();
        let outcome = match self.mismatch {
            Some(detail) => Err(CommErr::CollectiveMismatch { op, detail }),
            None => compute(self.kind, self.inputs),
        };

        for completion in self.completions {
            completion.finish(outcome.clone());
        }
    }
}

fn compute(kind: Kind, inputs: Vec<Option<Vec<Tensor>>>) -> Outcome {
    let inputs: Vec<Vec<Tensor>> = inputs.into_iter().flatten().collect();
    let Some(first) = inputs.first() else {
        return Ok(Vec::new());
    };

    if let Some(rank) = inputs.iter().position(|ts| !tensor::same_layout(first, ts)) {
        return Err(CommErr::CollectiveMismatch {
            op: kind.name(),
            detail: format!("rank {rank} contributed a different tensor layout than rank 0"),
        });
    }

    match kind {
        Kind::Broadcast { root } => Ok(inputs[root].clone()),
        Kind::AllReduce(op) => {
            let mut acc: Vec<ArrayD<f32>> = first.iter().map(|t| t.to_owned()).collect();

            for contribution in &inputs[1..] {
                for (a, b) in acc.iter_mut().zip(contribution) {
                    a.zip_mut_with(b, |x, &y| *x = op.combine(*x, y));
                }
            }

            Ok(acc.into_iter().map(|a| a.into_shared()).collect())
        }
    }
}
