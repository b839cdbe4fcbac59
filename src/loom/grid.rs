//! Process grids and the communicators they are built on.
//!
//! Every distributed operation is collective: all members of a grid must call it with
//! matching arguments and in the same order. This is a caller contract; it is only verified
//! when the communicator has consistency checks enabled.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use super::{ErrorKind, layout};

#[derive(Debug, Error)]
pub enum GridError {
    #[error("process grids are not congruent")]
    NotCongruent,
    #[error("[rank {rank}] collective call arguments differ across processes")]
    Inconsistent { rank: usize },
    #[error("communicator peer disconnected")]
    Disconnected,
    #[error("grid shape {shape:?} does not cover {size} processes")]
    Shape { size: usize, shape: Vec<usize> },
}

impl GridError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GridError::Disconnected => ErrorKind::Fatal,
            _ => ErrorKind::Precondition,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommId;

#[derive(Debug, Clone, Copy)]
struct Message {
    from: usize,
    seq: u64,
    value: u64,
}

#[derive(Debug)]
struct Channels {
    senders: Vec<flume::Sender<Message>>,
    receiver: flume::Receiver<Message>,
    /// Messages of later collectives that arrived early.
    pending: Mutex<Vec<Message>>,
    seq: AtomicU64,
}

/// One process's handle to a group of cooperating processes.
#[derive(Debug, Clone)]
pub struct Comm {
    id: uid::Id<CommId>,
    rank: usize,
    members: Arc<[usize]>,
    channels: Option<Arc<Channels>>,
    consistency_checks: bool,
}

impl Comm {
    /// A communicator with this process as its only member.
    pub fn single() -> Self {
        Self {
            id: uid::Id::new(),
            rank: 0,
            members: Arc::new([0]),
            channels: None,
            consistency_checks: false,
        }
    }

    #[inline]
    pub fn id(&self) -> uid::Id<CommId> {
        self.id
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Global process indices of the members, in rank order.
    #[inline]
    pub fn members(&self) -> &[usize] {
        &self.members
    }

    /// Whether collective calls verify that all members pass the same arguments.
    #[inline]
    pub fn consistency_checks(&self) -> bool {
        self.consistency_checks
    }

    /// Gathers one value from every member, in rank order.
    pub fn all_gather_u64(&self, value: u64) -> Result<Vec<u64>, GridError> {
        let Some(channels) = &self.channels else {
            return Ok(vec![value]);
        };
        let seq = channels.seq.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            from: self.rank,
            seq,
            value,
        };
        for (rank, sender) in channels.senders.iter().enumerate() {
            if rank != self.rank {
                sender.send(message).map_err(|_| GridError::Disconnected)?;
            }
        }

        let mut values = vec![None; self.size()];
        values[self.rank] = Some(value);

        let mut pending = channels.pending.lock().expect("failed to lock pending messages");
        pending.retain(|message| match message.seq == seq {
            true => {
                values[message.from] = Some(message.value);
                false
            }
            false => true,
        });
        while values.iter().any(Option::is_none) {
            let message = channels
                .receiver
                .recv()
                .map_err(|_| GridError::Disconnected)?;
            match message.seq == seq {
                true => values[message.from] = Some(message.value),
                false => pending.push(message),
            }
        }
        Ok(values.into_iter().flatten().collect())
    }

    /// Blocks until every member reaches the barrier.
    #[inline]
    pub fn barrier(&self) -> Result<(), GridError> {
        self.all_gather_u64(0).map(|_| ())
    }

    /// Fails on every member if any member passed a different `fingerprint`.
    pub fn check_consistent(&self, fingerprint: u64) -> Result<(), GridError> {
        let fingerprints = self.all_gather_u64(fingerprint)?;
        match fingerprints.iter().all(|&x| x == fingerprint) {
            true => Ok(()),
            false => {
                log::error!(
                    "[rank {}] inconsistent collective call: {fingerprints:x?}",
                    self.rank
                );
                Err(GridError::Inconsistent { rank: self.rank })
            }
        }
    }
}

/// Builds an in-process world: one connected [`Comm`] per simulated process.
///
/// Hand each communicator to its own thread.
#[derive(Debug, Clone, Copy)]
pub struct LocalWorld {
    size: usize,
    consistency_checks: bool,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            consistency_checks: false,
        }
    }

    pub fn consistency_checks(mut self, consistency_checks: bool) -> Self {
        self.consistency_checks = consistency_checks;
        self
    }

    pub fn build(self) -> Vec<Comm> {
        let Self {
            size,
            consistency_checks,
        } = self;
        let id = uid::Id::new();
        let members: Arc<[usize]> = (0..size).collect();
        let (senders, receivers): (Vec<_>, Vec<_>) =
            (0..size).map(|_| flume::unbounded()).unzip();
        log::debug!("create local world of {size} processes");

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| {
                let channels = Channels {
                    senders: senders.clone(),
                    receiver,
                    pending: Default::default(),
                    seq: Default::default(),
                };
                Comm {
                    id,
                    rank,
                    members: members.clone(),
                    channels: Some(Arc::new(channels)),
                    consistency_checks,
                }
            })
            .collect()
    }
}

/// A logical arrangement of the members of a communicator.
///
/// Ranks map to grid coordinates in column-major order.
#[derive(Debug, Clone)]
pub struct ProcessGrid {
    comm: Comm,
    shape: Vec<usize>,
}

impl ProcessGrid {
    pub fn new(comm: Comm, shape: &[usize]) -> Result<Self, GridError> {
        if layout::product(shape) != comm.size() {
            return Err(GridError::Shape {
                size: comm.size(),
                shape: shape.to_vec(),
            });
        }
        let shape = shape.to_vec();
        Ok(Self { comm, shape })
    }

    #[inline]
    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Grid coordinates of `rank`.
    pub fn coords_of(&self, rank: usize) -> Vec<usize> {
        let mut rest = rank;
        self.shape
            .iter()
            .map(|&n| {
                let coord = rest % n;
                rest /= n;
                coord
            })
            .collect()
    }

    /// Rank at grid coordinates `coords`.
    pub fn rank_of(&self, coords: &[usize]) -> usize {
        layout::offset(coords, &layout::prefix_product(&self.shape))
    }

    /// Grid coordinates of this process.
    #[inline]
    pub fn coords(&self) -> Vec<usize> {
        self.coords_of(self.rank())
    }

    /// Checks if both grids have the same shape and the same members.
    pub fn is_congruent_to(&self, other: &Self) -> bool {
        self.shape == other.shape && self.comm.members() == other.comm.members()
    }
}
