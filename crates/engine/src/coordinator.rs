//! Two-phase commit coordinator
//!
//! The coordinator drives a multi-shard transaction to a single outcome:
//!
//! 1. Persist the coordinator document naming the participants.
//! 2. Send prepareTransaction to every writing participant in parallel.
//!    All succeed: the decision is commit at the largest prepare
//!    timestamp. Any refuses: the decision is abort. Unreachable
//!    participants are retried, never voted against.
//! 3. Persist the decision.
//! 4. Broadcast it until every participant acknowledges.
//! 5. Delete the document.
//!
//! The decision is durable before any participant hears it, so a
//! coordinator that fails over resumes from the stored document in
//! `step_up`: undecided documents are aborted, decided ones are
//! re-broadcast. Every store write is fenced by the replication term, so a
//! deposed coordinator can never record a decision.
//!
//! # Memory Ordering
//!
//! The metric counters use Relaxed ordering; they synchronize nothing.

use crate::client::ShardRegistry;
use crate::retry::RetryPolicy;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{CancelReason, CancellationToken, Deadline, Decision, Error, Result, ShardId, Timestamp, TxnId};
use tessera_durability::{CoordinatorDocument, CoordinatorStore};
use tracing::{debug, error, info, warn};

const RECENT_DECISIONS: usize = 1024;

/// Decisions of documents already deleted, for retried commits
#[derive(Debug, Default)]
struct RecentDecisions {
    by_txn: HashMap<TxnId, Decision>,
    order: VecDeque<TxnId>,
}

impl RecentDecisions {
    fn remember(&mut self, txn: TxnId, decision: Decision) {
        if self.by_txn.insert(txn, decision).is_none() {
            self.order.push_back(txn);
        }
        while self.order.len() > RECENT_DECISIONS {
            if let Some(old) = self.order.pop_front() {
                self.by_txn.remove(&old);
            }
        }
    }
}

/// Commit coordinator for multi-shard transactions
pub struct CoordinatorService {
    store: Arc<CoordinatorStore>,
    registry: Arc<ShardRegistry>,
    retry: RetryPolicy,
    cancel: RwLock<CancellationToken>,
    recent: Mutex<RecentDecisions>,
    active: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    recovered: AtomicU64,
}

impl std::fmt::Debug for CoordinatorService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorService")
            .field("store", &self.store)
            .field("retry", &self.retry)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl CoordinatorService {
    /// Create a coordinator over `store`, reaching shards through `registry`
    ///
    /// `retry` sets the backoff. Prepare and decision delivery both retry
    /// until the coordinator steps down.
    pub fn new(store: Arc<CoordinatorStore>, registry: Arc<ShardRegistry>, retry: RetryPolicy) -> Self {
        Self {
            store,
            registry,
            retry,
            cancel: RwLock::new(CancellationToken::new()),
            recent: Mutex::new(RecentDecisions::default()),
            active: AtomicU64::new(0),
            started: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
        }
    }

    /// Durable store of coordinator documents
    pub fn store(&self) -> &Arc<CoordinatorStore> {
        &self.store
    }

    /// coordinateCommitTransaction
    ///
    /// `participants` must prepare; `read_only` shards only hear the
    /// outcome. A retry for a transaction whose document still exists joins
    /// it; one whose document is gone gets the remembered decision.
    /// `cluster_time` is the commit timestamp when nothing was written.
    pub fn coordinate_commit(
        &self,
        txn: TxnId,
        participants: Vec<ShardId>,
        read_only: Vec<ShardId>,
        cluster_time: Timestamp,
    ) -> Result<Decision> {
        if let Some(decision) = self.recent.lock().by_txn.get(&txn) {
            return Ok(decision.clone());
        }
        let term = self.store.term().current();
        self.store.term().ensure_primary()?;
        let doc = self.store.create(term, txn, participants, read_only)?;

        self.active.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "tessera::2pc",
            lsid = %txn.lsid,
            txn_number = %txn.txn_number,
            participants = doc.participants.len(),
            read_only = doc.read_only.len(),
            "Coordinating commit"
        );
        let result = self.drive(term, doc, Some(cluster_time));
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| Some(x.saturating_sub(1)));
        result
    }

    /// Decision for `txn` if this coordinator knows it
    pub fn decision_of(&self, txn: &TxnId) -> Option<Decision> {
        if let Some(doc) = self.store.get(txn) {
            return doc.decision;
        }
        self.recent.lock().by_txn.get(txn).cloned()
    }

    fn drive(&self, term: u64, doc: CoordinatorDocument, cluster_time: Option<Timestamp>) -> Result<Decision> {
        let cancel = self.cancel.read().clone();
        let decision = match doc.decision.clone() {
            Some(decision) => decision,
            None => {
                let decided = match cluster_time {
                    Some(ts) => self.decide(&doc, ts, &cancel)?,
                    None => Decision::Abort {
                        reason: "coordinator failed over before deciding".into(),
                    },
                };
                self.store.record_decision(term, &doc.txn, decided)?
            }
        };
        debug!(
            target: "tessera::2pc",
            lsid = %doc.txn.lsid,
            txn_number = %doc.txn.txn_number,
            decision = %decision,
            "Decision persisted"
        );

        self.broadcast(&doc, &decision, &cancel)?;
        self.store.remove(term, &doc.txn)?;
        self.recent.lock().remember(doc.txn, decision.clone());
        match decision {
            Decision::Commit { .. } => self.committed.fetch_add(1, Ordering::Relaxed),
            Decision::Abort { .. } => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
        info!(
            target: "tessera::2pc",
            lsid = %doc.txn.lsid,
            txn_number = %doc.txn.txn_number,
            decision = %decision,
            "Transaction decided and acknowledged"
        );
        Ok(decision)
    }

    fn decide(&self, doc: &CoordinatorDocument, cluster_time: Timestamp, cancel: &CancellationToken) -> Result<Decision> {
        if doc.participants.is_empty() {
            return Ok(Decision::Commit {
                commit_timestamp: cluster_time,
            });
        }
        let txn = doc.txn;
        // Only a vote or a stepdown ends the prepare loop.
        let policy = self.retry.unbounded();
        let votes: Vec<(ShardId, Result<Timestamp>)> = doc
            .participants
            .par_iter()
            .map(|shard| {
                let vote = self.registry.get(shard).and_then(|client| {
                    policy.run("prepareTransaction", cancel, Deadline::none(), || {
                        client.prepare(&txn, Some(cluster_time))
                    })
                });
                (shard.clone(), vote)
            })
            .collect();
        cancel.check("coordinateCommitTransaction")?;

        let mut commit_ts = Timestamp::ZERO;
        let mut committed_on = Vec::new();
        let mut refusal = None;
        for (shard, vote) in votes {
            match vote {
                Ok(ts) => commit_ts = commit_ts.max(ts),
                Err(Error::TransactionCommitted(_)) => committed_on.push(shard),
                Err(e) => {
                    warn!(
                        target: "tessera::2pc",
                        lsid = %txn.lsid,
                        txn_number = %txn.txn_number,
                        shard = %shard,
                        error = %e,
                        "Participant refused to prepare"
                    );
                    refusal.get_or_insert_with(|| format!("shard {} failed to prepare: {}", shard, e));
                }
            }
        }

        if committed_on.is_empty() {
            return Ok(match refusal {
                Some(reason) => Decision::Abort { reason },
                None => Decision::Commit {
                    commit_timestamp: commit_ts,
                },
            });
        }

        // Some participant already committed, so the outcome is commit at a
        // timestamp no earlier than any commit already made.
        for shard in &committed_on {
            let client = self.registry.get(shard)?;
            let ts = policy.run("commitTransaction", cancel, Deadline::none(), || client.commit(&txn, None))?;
            commit_ts = commit_ts.max(ts);
        }
        if let Some(reason) = refusal {
            error!(
                target: "tessera::2pc",
                lsid = %txn.lsid,
                txn_number = %txn.txn_number,
                reason = %reason,
                "Participant refused a transaction that committed elsewhere"
            );
        }
        info!(
            target: "tessera::2pc",
            lsid = %txn.lsid,
            txn_number = %txn.txn_number,
            committed = committed_on.len(),
            commit_ts = %commit_ts,
            "Resuming commit already applied on some participants"
        );
        Ok(Decision::Commit {
            commit_timestamp: commit_ts,
        })
    }

    fn broadcast(&self, doc: &CoordinatorDocument, decision: &Decision, cancel: &CancellationToken) -> Result<()> {
        let txn = doc.txn;
        let policy = self.retry.unbounded();
        let targets: Vec<(&ShardId, bool)> = doc
            .participants
            .iter()
            .map(|s| (s, true))
            .chain(doc.read_only.iter().map(|s| (s, false)))
            .collect();

        let acks: Vec<Result<()>> = targets
            .par_iter()
            .map(|(shard, prepared)| {
                let client = self.registry.get(shard)?;
                policy.run("deliverDecision", cancel, Deadline::none(), || {
                    let sent = match decision {
                        Decision::Commit { commit_timestamp } => {
                            let ts = prepared.then_some(*commit_timestamp);
                            client.commit(&txn, ts).map(|_| ())
                        }
                        Decision::Abort { reason } => client.abort(&txn, reason),
                    };
                    match sent {
                        Err(Error::NoSuchTransaction { .. }) if !decision.is_commit() || !prepared => Ok(()),
                        other => other,
                    }
                })
            })
            .collect();
        acks.into_iter().collect()
    }

    // ========================================================================
    // Failover
    // ========================================================================

    /// Lose primaryship: refuse new work and interrupt in-flight commits
    ///
    /// In-flight documents stay in the store for the next primary.
    pub fn step_down(&self) {
        self.store.term().step_down();
        self.cancel.read().cancel(CancelReason::StepDown);
        warn!(target: "tessera::2pc", term = self.store.term().current(), "Coordinator stepped down");
    }

    /// Become primary and finish every unfinished document
    ///
    /// Undecided documents are aborted; decided ones are re-broadcast.
    /// Returns the number of documents finished.
    pub fn step_up(&self) -> usize {
        let term = self.store.term().step_up();
        *self.cancel.write() = CancellationToken::new();
        let unfinished = self.store.unfinished();
        info!(
            target: "tessera::2pc",
            term,
            unfinished = unfinished.len(),
            "Coordinator stepped up"
        );
        let mut finished = 0;
        for doc in unfinished {
            let txn = doc.txn;
            match self.drive(term, doc, None) {
                Ok(decision) => {
                    finished += 1;
                    self.recovered.fetch_add(1, Ordering::Relaxed);
                    info!(
                        target: "tessera::2pc",
                        lsid = %txn.lsid,
                        txn_number = %txn.txn_number,
                        decision = %decision,
                        "Recovered coordinator document"
                    );
                }
                Err(e) => warn!(
                    target: "tessera::2pc",
                    lsid = %txn.lsid,
                    txn_number = %txn.txn_number,
                    error = %e,
                    "Could not finish coordinator document"
                ),
            }
        }
        finished
    }

    /// True while this coordinator accepts work
    pub fn is_primary(&self) -> bool {
        self.store.term().is_primary()
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Snapshot of the counters
    pub fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            active: self.active.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
        }
    }

    /// Wait until no commit is in flight; false on timeout
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.active.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Coordinator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoordinatorMetrics {
    /// Commits currently being coordinated
    pub active: u64,
    /// coordinateCommit calls that created or joined a document
    pub started: u64,
    /// Commit decisions acknowledged
    pub committed: u64,
    /// Abort decisions acknowledged
    pub aborted: u64,
    /// Documents finished after a failover
    pub recovered: u64,
}

impl CoordinatorMetrics {
    /// Committed plus aborted
    pub fn total_completed(&self) -> u64 {
        self.committed + self.aborted
    }
}
