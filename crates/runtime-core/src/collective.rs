//! Collective transport between the ranks of a process group
//!
//! Every collective in the orchestration layer reduces to one round of
//! opaque byte payloads, keyed by a sequence number that all ranks advance
//! in lockstep. A round's [`RoundKind`] decides what each rank receives:
//! everything, nothing, or its own slot. Results are always ordered by
//! rank, never by arrival, so anything derived from them is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{Error, Rank, Result};

/// Data movement of one round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundKind {
    /// Each rank contributes one payload and receives all of them
    AllGather,
    /// Each rank contributes one payload; only `root` receives them
    Gather { root: Rank },
    /// `root` contributes one payload per rank; each rank receives its own
    Scatter { root: Rank },
}

impl RoundKind {
    fn root(self) -> Option<Rank> {
        match self {
            RoundKind::AllGather => None,
            RoundKind::Gather { root } | RoundKind::Scatter { root } => Some(root),
        }
    }

    /// Number of payloads `rank` must contribute
    pub fn contribution_len(self, rank: Rank, world_size: usize) -> usize {
        match self {
            RoundKind::Scatter { root } if rank == root => world_size,
            RoundKind::Scatter { .. } => 0,
            _ => 1,
        }
    }

    /// Number of payloads `rank` receives when the round completes
    pub fn delivery_len(self, rank: Rank, world_size: usize) -> usize {
        match self {
            RoundKind::AllGather => world_size,
            RoundKind::Gather { root } if rank == root => world_size,
            RoundKind::Gather { .. } => 0,
            RoundKind::Scatter { .. } => 1,
        }
    }
}

/// Transport used by [`crate::WorkerCoordinator`]
#[async_trait]
pub trait ProcessGroup: Send + Sync {
    /// This process's rank
    fn rank(&self) -> Rank;

    /// Number of ranks in the group
    fn world_size(&self) -> usize;

    /// Contribute `payloads` to round `seq` and receive this rank's share
    /// of the result, ordered by rank
    async fn exchange(&self, seq: u64, kind: RoundKind, payloads: Vec<Bytes>)
        -> Result<Vec<Bytes>>;

    /// Contribute `payload` to round `seq` and receive every rank's payload
    async fn all_gather(&self, seq: u64, payload: Bytes) -> Result<Vec<Bytes>> {
        self.exchange(seq, RoundKind::AllGather, vec![payload]).await
    }
}

/// Outcome delivered to one waiting rank
type RoundOutcome = std::result::Result<Vec<Bytes>, String>;

/// One in-flight collective round
struct RoundState {
    kind: RoundKind,
    /// Contribution per rank, filled as ranks arrive
    contributions: Vec<Option<Vec<Bytes>>>,
    /// Number of ranks that arrived
    arrived: usize,
    /// Channels to notify waiting ranks
    waiters: Vec<(Rank, oneshot::Sender<RoundOutcome>)>,
}

impl RoundState {
    fn new(kind: RoundKind, world_size: usize) -> Self {
        Self {
            kind,
            contributions: vec![None; world_size],
            arrived: 0,
            waiters: Vec::new(),
        }
    }

    /// Split the contributions into what each rank receives
    fn deliveries(&mut self) -> Vec<Vec<Bytes>> {
        let world_size = self.contributions.len();
        let mut contributions: Vec<Vec<Bytes>> = self
            .contributions
            .iter_mut()
            .map(|c| c.take().unwrap_or_default())
            .collect();

        match self.kind {
            RoundKind::AllGather => {
                let all: Vec<Bytes> = contributions.into_iter().flatten().collect();
                vec![all; world_size]
            }
            RoundKind::Gather { root } => {
                let mut deliveries = vec![Vec::new(); world_size];
                deliveries[root] = contributions.into_iter().flatten().collect();
                deliveries
            }
            RoundKind::Scatter { root } => std::mem::take(&mut contributions[root])
                .into_iter()
                .map(|payload| vec![payload])
                .collect(),
        }
    }
}

/// Shared round table used to complete collectives
///
/// A round completes when all `world_size` ranks contributed; the last
/// arrival releases every waiter with its own share and removes the round.
/// Once the group is failed (a rank timed out, a peer died, or ranks
/// disagreed on a round) every pending and future round fails immediately,
/// so no rank is left blocked behind a broken peer.
pub struct Rendezvous {
    world_size: usize,
    rounds: Mutex<HashMap<u64, RoundState>>,
    failure: Mutex<Option<String>>,
}

impl Rendezvous {
    pub fn new(world_size: usize) -> Self {
        Self {
            world_size,
            rounds: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of rounds waiting for stragglers
    pub fn pending_rounds(&self) -> usize {
        self.rounds.lock().len()
    }

    /// Reason the group failed, if it did
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Mark the group as failed and release every waiter with an error
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(reason.clone());
        }

        warn!(reason = %reason, "Process group failed");

        let rounds: Vec<_> = self.rounds.lock().drain().collect();
        for (_, round) in rounds {
            for (_, waiter) in round.waiters {
                let _ = waiter.send(Err(reason.clone()));
            }
        }
    }

    /// Contribute `payloads` from `rank` to round `seq`
    pub async fn exchange(
        &self,
        rank: Rank,
        seq: u64,
        kind: RoundKind,
        payloads: Vec<Bytes>,
        timeout: Duration,
    ) -> Result<Vec<Bytes>> {
        if let Some(reason) = self.check_contribution(rank, seq, kind, &payloads) {
            // A malformed contribution would leave peers waiting forever
            self.fail(reason.clone());
            return Err(Error::coordination("exchange", reason));
        }

        let rx = {
            // Checked under the rounds lock so a concurrent fail() cannot
            // slip between the check and the waiter registration
            let mut rounds = self.rounds.lock();
            if let Some(reason) = self.failure() {
                return Err(Error::coordination("exchange", reason));
            }

            let round = rounds
                .entry(seq)
                .or_insert_with(|| RoundState::new(kind, self.world_size));

            let conflict = if round.kind != kind {
                Some(format!(
                    "rank {} issued {:?} for round {}, peers issued {:?}",
                    rank, kind, seq, round.kind
                ))
            } else if round.contributions[rank].is_some() {
                Some(format!("rank {} contributed twice to round {}", rank, seq))
            } else {
                None
            };

            match conflict {
                Some(reason) => Err(reason),
                None => {
                    round.contributions[rank] = Some(payloads);
                    round.arrived += 1;

                    debug!(
                        seq = seq,
                        rank = rank,
                        arrived = round.arrived,
                        expected = self.world_size,
                        "Rank arrived at round"
                    );

                    if round.arrived == self.world_size {
                        // Last rank to arrive - release all waiters
                        let mut round = rounds.remove(&seq).ok_or_else(|| Error::Internal {
                            message: format!("round {} vanished while completing", seq),
                        })?;
                        let mut deliveries = round.deliveries();
                        for (waiter_rank, waiter) in round.waiters {
                            let _ = waiter.send(Ok(std::mem::take(&mut deliveries[waiter_rank])));
                        }
                        return Ok(std::mem::take(&mut deliveries[rank]));
                    }

                    let (tx, rx) = oneshot::channel();
                    round.waiters.push((rank, tx));
                    Ok(rx)
                }
            }
        };

        let rx = match rx {
            Ok(rx) => rx,
            Err(reason) => {
                self.fail(reason.clone());
                return Err(Error::coordination("exchange", reason));
            }
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(reason))) => Err(Error::coordination("exchange", reason)),
            Ok(Err(_)) => Err(Error::coordination("exchange", "round channel closed")),
            Err(_) => {
                let missing = self.missing_ranks(seq);
                let reason = format!(
                    "round {} timed out after {:?} waiting for ranks {:?}",
                    seq, timeout, missing
                );
                self.fail(reason.clone());
                Err(Error::coordination("exchange", reason))
            }
        }
    }

    fn check_contribution(
        &self,
        rank: Rank,
        seq: u64,
        kind: RoundKind,
        payloads: &[Bytes],
    ) -> Option<String> {
        if rank >= self.world_size {
            return Some(format!(
                "rank {} out of range for world_size {}",
                rank, self.world_size
            ));
        }
        if let Some(root) = kind.root().filter(|&root| root >= self.world_size) {
            return Some(format!("round {} names root {} out of range", seq, root));
        }
        let expected = kind.contribution_len(rank, self.world_size);
        if payloads.len() != expected {
            return Some(format!(
                "rank {} contributed {} payloads to {:?} round {}, expected {}",
                rank,
                payloads.len(),
                kind,
                seq,
                expected
            ));
        }
        None
    }

    fn missing_ranks(&self, seq: u64) -> Vec<Rank> {
        self.rounds
            .lock()
            .get(&seq)
            .map(|round| {
                round
                    .contributions
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.is_none())
                    .map(|(rank, _)| rank)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Thread-safe handle to a rendezvous table
pub type RendezvousHandle = Arc<Rendezvous>;

/// In-process group: one handle per rank sharing one [`Rendezvous`]
pub struct LocalProcessGroup {
    rank: Rank,
    rendezvous: RendezvousHandle,
    timeout: Duration,
}

impl LocalProcessGroup {
    /// Create handles for every rank of a `world_size` group
    pub fn new_group(world_size: usize, timeout: Duration) -> Vec<LocalProcessGroup> {
        let rendezvous = Arc::new(Rendezvous::new(world_size));
        (0..world_size)
            .map(|rank| LocalProcessGroup {
                rank,
                rendezvous: rendezvous.clone(),
                timeout,
            })
            .collect()
    }

    /// Shared round table
    pub fn rendezvous(&self) -> &RendezvousHandle {
        &self.rendezvous
    }
}

#[async_trait]
impl ProcessGroup for LocalProcessGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.rendezvous.world_size()
    }

    async fn exchange(
        &self,
        seq: u64,
        kind: RoundKind,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<Bytes>> {
        self.rendezvous
            .exchange(self.rank, seq, kind, payloads, self.timeout)
            .await
    }
}
