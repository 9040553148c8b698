//! Follower synchronization decider.
//!
//! Given the last zxid a reconnecting follower reports, pick the cheapest
//! correct recovery strategy (DIFF, TRUNC(+DIFF) or SNAP) and produce the
//! exact packet sequence to enqueue, plus the zxid from which the broadcast
//! layer must resume live forwarding. A wrong choice here silently corrupts
//! the follower's replica, so the decision is taken under the log view's
//! shared lock, over a stable snapshot of leader state.

use failure::{Error, Fail};
use std::borrow::Borrow;

use super::database::{LogReadGuard, LogView};
use crate::proto::{PacketType, Proposal, QuorumPacket};
use crate::Zxid;

/// Errors the decider escalates to its caller. Recoverable conditions (log
/// gaps, epoch-crossing truncations, size budget overruns) are not errors:
/// they silently downgrade the plan to a snapshot.
#[derive(Debug, Fail)]
pub enum SyncError {
    /// The peer reported a zxid outside the reachable epoch space. The
    /// learner connection should be dropped.
    #[fail(display = "peer zxid {} has the epoch sign bit set", _0)]
    InconsistentInput(Zxid),

    /// The transaction log failed mid-scan; the plan cannot be trusted.
    #[fail(display = "transaction log unreadable while planning sync: {}", _0)]
    LogUnreadable(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncStrategy {
    /// The follower's state is a prefix of ours: send the missing proposals.
    Diff,
    /// The follower holds proposals we never committed: roll it back, then
    /// send ours.
    TruncDiff,
    /// Too far gone; the caller streams a full snapshot out-of-band.
    Snap,
}

/// A complete, ordered synchronization plan.
///
/// Either `packets` is a non-empty sequence headed by a DIFF or TRUNC packet,
/// or the strategy is [`SyncStrategy::Snap`] and `packets` is empty. There is
/// no partial or speculative in-between.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncPlan {
    pub strategy: SyncStrategy,
    /// Rollback point sent in a TRUNC packet, when one is part of the plan.
    pub trunc_to: Option<Zxid>,
    /// The zxid the follower's log reaches once the plan is applied.
    pub diff_to: Zxid,
    /// Handoff to the broadcast layer: it must forward every committed
    /// proposal with a zxid strictly greater than this, in commit order.
    pub forward_from: Zxid,
    pub packets: Vec<QuorumPacket>,
}

impl SyncPlan {
    pub fn needs_snap(&self) -> bool {
        self.strategy == SyncStrategy::Snap
    }

    /// A snapshot plan: no packets; the snapshot's embedded last-processed
    /// zxid is the forwarding point.
    fn snapshot(last_processed: Zxid) -> SyncPlan {
        SyncPlan {
            strategy: SyncStrategy::Snap,
            trunc_to: None,
            diff_to: last_processed,
            forward_from: last_processed,
            packets: Vec::new(),
        }
    }
}

/// Accumulates the packet sequence of a non-snapshot plan.
///
/// `op_queued` is the first-packet sentinel: the head of any plan must be
/// exactly one DIFF or TRUNC packet, and proposals may only follow it.
struct PlanBuilder {
    packets: Vec<QuorumPacket>,
    trunc_to: Option<Zxid>,
    anchor: Zxid,
    op_queued: bool,
    last_queued: Option<Zxid>,
    shipped: u64,
}

impl PlanBuilder {
    fn new() -> PlanBuilder {
        PlanBuilder {
            packets: Vec::new(),
            trunc_to: None,
            anchor: Zxid::ZERO,
            op_queued: false,
            last_queued: None,
            shipped: 0,
        }
    }

    fn op_queued(&self) -> bool {
        self.op_queued
    }

    fn last_queued(&self) -> Option<Zxid> {
        self.last_queued
    }

    /// Total proposal payload bytes queued so far.
    fn shipped_bytes(&self) -> u64 {
        self.shipped
    }

    fn lead_diff(&mut self, anchor: Zxid) {
        debug_assert!(!self.op_queued, "a plan has exactly one leading packet");
        self.packets.push(QuorumPacket::op(PacketType::Diff, anchor));
        self.anchor = anchor;
        self.op_queued = true;
    }

    fn lead_trunc(&mut self, trunc_to: Zxid) {
        debug_assert!(!self.op_queued, "a plan has exactly one leading packet");
        self.packets.push(QuorumPacket::op(PacketType::Trunc, trunc_to));
        self.trunc_to = Some(trunc_to);
        self.anchor = trunc_to;
        self.op_queued = true;
    }

    fn queue_proposal(&mut self, proposal: &Proposal) {
        debug_assert!(self.op_queued, "proposals must follow the leading packet");
        self.shipped += proposal.data.len() as u64;
        self.packets.push(QuorumPacket::proposal(proposal));
        self.packets.push(QuorumPacket::commit(proposal.zxid));
        self.last_queued = Some(proposal.zxid);
    }

    fn finish(self) -> SyncPlan {
        let reached = self.last_queued.unwrap_or(self.anchor);
        SyncPlan {
            strategy: if self.trunc_to.is_some() {
                SyncStrategy::TruncDiff
            } else {
                SyncStrategy::Diff
            },
            trunc_to: self.trunc_to,
            diff_to: reached,
            forward_from: reached,
            packets: self.packets,
        }
    }
}

/// Outcome of scanning one proposal source.
enum Scan {
    /// The source was walked; the largest zxid it produced, if any.
    Covered(Option<Zxid>),
    /// No safe DIFF/TRUNC plan exists from this source.
    Snapshot,
}

/// Walks proposals in zxid order, queueing a `(PROPOSAL, COMMIT)` pair for
/// everything past the peer and deciding the leading DIFF/TRUNC packet on
/// the way.
///
/// Entries below the peer are skipped but remembered: the last one becomes
/// the rollback point if the peer turns out to hold a zxid we never saw.
/// Entries above `bound` are not consumed; a second call with the same
/// builder picks up from there (used to hand over from the disk log to the
/// in-memory window).
fn scan_proposals<I, P>(
    builder: &mut PlanBuilder,
    proposals: I,
    peer_zxid: Zxid,
    bound: Option<Zxid>,
    anchor: Zxid,
) -> Result<Scan, Error>
where
    I: IntoIterator<Item = Result<P, Error>>,
    P: Borrow<Proposal>,
{
    let peer_is_epoch_start = peer_zxid.is_epoch_start();
    let mut prev_zxid: Option<Zxid> = None;
    let mut last_seen: Option<Zxid> = None;

    for item in proposals {
        let item = item.map_err(|e| SyncError::LogUnreadable(e.to_string()))?;
        let proposal = item.borrow();

        if let Some(bound) = bound {
            if proposal.zxid > bound {
                break;
            }
        }
        last_seen = Some(proposal.zxid);

        if proposal.zxid < peer_zxid {
            prev_zxid = Some(proposal.zxid);
            continue;
        }

        if !builder.op_queued() {
            if proposal.zxid == peer_zxid {
                // The peer's zxid is in our history: its state is a prefix
                builder.lead_diff(anchor);
                continue;
            }
            if peer_is_epoch_start {
                // An epoch-start marker has no proposal of its own; there is
                // nothing to roll back across it
                builder.lead_diff(anchor);
            } else if proposal.zxid.epoch() != peer_zxid.epoch() {
                // The peer forked in an epoch absent from our history. A
                // truncation across an epoch boundary cannot be replayed on
                // the follower.
                warn!(
                    "peer at {} forked before our next record {}, in another epoch",
                    peer_zxid, proposal.zxid
                );
                return Ok(Scan::Snapshot);
            } else {
                match prev_zxid {
                    Some(trunc_to) => builder.lead_trunc(trunc_to),
                    // No record below the peer to roll back to
                    None => return Ok(Scan::Snapshot),
                }
            }
        }

        let floor = builder.last_queued().unwrap_or(peer_zxid);
        if proposal.zxid <= floor {
            if proposal.zxid != peer_zxid {
                warn!("skipping duplicate proposal {} while planning sync", proposal.zxid);
            }
            continue;
        }

        builder.queue_proposal(proposal);
    }

    // A peer sitting exactly on an epoch boundary past everything we walked
    // is still a clean prefix of our history
    if !builder.op_queued() && peer_is_epoch_start && last_seen.is_some() {
        builder.lead_diff(anchor);
    }

    Ok(Scan::Covered(last_seen))
}

/// The synchronization decision point. Borrows the log view and takes its
/// shared lock once per decision, for the whole decision.
pub struct SyncDecider<'a> {
    view: &'a LogView,
}

impl<'a> SyncDecider<'a> {
    pub fn new(view: &'a LogView) -> SyncDecider<'a> {
        SyncDecider { view }
    }

    /// Decides how to bring a follower reporting `peer_zxid` up to date.
    ///
    /// On success the plan is complete: either a packet sequence headed by
    /// DIFF or TRUNC, or a snapshot marker with no packets (the caller then
    /// streams a snapshot whose embedded last-processed zxid equals the
    /// plan's `forward_from`).
    pub fn decide(&self, peer_zxid: Zxid) -> Result<SyncPlan, Error> {
        if peer_zxid.0 < 0 {
            error!("dropping learner reporting invalid zxid {}", peer_zxid);
            return Err(SyncError::InconsistentInput(peer_zxid).into());
        }

        let guard = self.view.read();
        let last_processed = guard.last_processed_zxid();
        let min_committed = guard.committed_min();
        let max_committed = guard.committed_max();
        let window_empty = guard.committed_is_empty();

        debug!(
            "sync request from peer at {}: last processed {}, window [{}, {}]",
            peer_zxid, last_processed, min_committed, max_committed
        );

        // Already in sync with the leader's applied state. This includes a
        // follower sitting on the freshly elected epoch's start marker.
        if peer_zxid == last_processed {
            let mut builder = PlanBuilder::new();
            builder.lead_diff(last_processed);
            info!("synchronizing peer at {} using an empty DIFF", peer_zxid);
            return Ok(builder.finish());
        }

        // Ahead of the leader: the follower rolls its log back to our
        // applied state and accepts forward from there.
        if peer_zxid > last_processed {
            let mut builder = PlanBuilder::new();
            builder.lead_trunc(last_processed);
            info!(
                "peer at {} is ahead of the leader, truncating to {}",
                peer_zxid, last_processed
            );
            return Ok(builder.finish());
        }

        // Within the committed window: plan from memory alone.
        if !window_empty && min_committed <= peer_zxid && peer_zxid <= max_committed {
            let mut builder = PlanBuilder::new();
            let items = guard.committed_iter().map(Ok::<_, Error>);
            match scan_proposals(&mut builder, items, peer_zxid, None, max_committed)? {
                Scan::Snapshot => return Ok(self.snapshot(last_processed, "window not truncatable")),
                Scan::Covered(_) => {}
            }
            if !builder.op_queued() {
                return Ok(self.snapshot(last_processed, "peer not anchored in the window"));
            }
            let plan = builder.finish();
            info!(
                "synchronizing peer at {} from the window using {:?} up to {}",
                peer_zxid, plan.strategy, plan.forward_from
            );
            return Ok(plan);
        }

        // Below the window (or no window at all): try the disk log, merging
        // into the window where the two overlap.
        if (!window_empty && peer_zxid < min_committed)
            || (window_empty && guard.txn_log_enabled())
        {
            if let Some(plan) = self.plan_from_txn_log(
                &guard,
                peer_zxid,
                last_processed,
                min_committed,
                max_committed,
                window_empty,
            )? {
                return Ok(plan);
            }
        }

        Ok(self.snapshot(last_processed, "history not coverable by DIFF"))
    }

    /// Attempts a plan sourced from the disk log. Returns `None` when the
    /// log is disabled and `Some(snapshot)` when it is unusable, so the plan
    /// returned is always final.
    fn plan_from_txn_log(
        &self,
        guard: &LogReadGuard,
        peer_zxid: Zxid,
        last_processed: Zxid,
        min_committed: Zxid,
        max_committed: Zxid,
        window_empty: bool,
    ) -> Result<Option<SyncPlan>, Error> {
        let cursor = match guard.open_txn_log_from(peer_zxid)? {
            Some(cursor) => cursor,
            None => return Ok(None),
        };

        let anchor = if window_empty { last_processed } else { max_committed };
        let bound = if window_empty { None } else { Some(min_committed) };
        let mut builder = PlanBuilder::new();

        let covered = match scan_proposals(&mut builder, cursor, peer_zxid, bound, anchor)? {
            Scan::Snapshot => {
                return Ok(Some(self.snapshot(last_processed, "truncation not replayable")));
            }
            Scan::Covered(covered) => covered,
        };

        // The disk log does not reach back to the peer at all
        let covered = match covered {
            Some(covered) => covered,
            None => return Ok(Some(self.snapshot(last_processed, "txn log does not cover the peer"))),
        };

        if !window_empty {
            // The window must take over exactly where the disk log left off;
            // proposals missing in between are gone for good
            if (covered.0 as u64) + 1 < min_committed.0 as u64 {
                warn!(
                    "disk log ends at {} below the window start {}",
                    covered, min_committed
                );
                return Ok(Some(self.snapshot(last_processed, "gap between txn log and window")));
            }

            let resume = builder.last_queued().unwrap_or(covered);
            let items = guard.committed_iter().map(Ok::<_, Error>);
            if let Scan::Snapshot = scan_proposals(&mut builder, items, resume, None, anchor)? {
                return Ok(Some(self.snapshot(last_processed, "window not truncatable")));
            }
        }

        if !builder.op_queued() {
            return Ok(Some(self.snapshot(last_processed, "peer not anchored in the txn log")));
        }

        let budget = guard.txn_log_size_budget();
        if budget > 0 && builder.shipped_bytes() > budget {
            info!(
                "diff of {} bytes for peer at {} exceeds the {} byte budget",
                builder.shipped_bytes(),
                peer_zxid,
                budget
            );
            return Ok(Some(self.snapshot(last_processed, "size budget exceeded")));
        }

        let plan = builder.finish();
        info!(
            "synchronizing peer at {} from the txn log using {:?} up to {}",
            peer_zxid, plan.strategy, plan.forward_from
        );
        Ok(Some(plan))
    }

    fn snapshot(&self, last_processed: Zxid, reason: &str) -> SyncPlan {
        info!(
            "synchronizing peer with a full snapshot at {}: {}",
            last_processed, reason
        );
        SyncPlan::snapshot(last_processed)
    }
}
