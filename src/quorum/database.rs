//! Read view over the leader's replicated log: the bounded in-memory window
//! of recently committed proposals, the last zxid applied to the data tree,
//! and a handle onto the on-disk transaction log.

use failure::Error;
use std::collections::VecDeque;
use std::sync::{RwLock, RwLockReadGuard};

use crate::persistence::{TxnLogCursor, TxnLogSource};
use crate::proto::Proposal;
use crate::Zxid;

/// How many committed proposals the in-memory window retains by default.
pub const DEFAULT_WINDOW_CAPACITY: usize = 500;

/// Bounded in-memory window of recently committed proposals, strictly
/// increasing by zxid. Followers close enough to the leader are synchronized
/// from here without touching the disk log.
pub struct CommittedLog {
    proposals: VecDeque<Proposal>,
    capacity: usize,
}

impl CommittedLog {
    pub fn new(capacity: usize) -> CommittedLog {
        CommittedLog {
            proposals: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a committed proposal, evicting the oldest entry once the
    /// retention window is full.
    ///
    /// A proposal that does not advance the window's max zxid should not
    /// occur, but has been observed in the wild; it is kept and flagged.
    pub fn add(&mut self, proposal: Proposal) {
        if let Some(last) = self.proposals.back() {
            if proposal.zxid <= last.zxid {
                warn!(
                    "committed proposal {} does not advance the window (max is {})",
                    proposal.zxid,
                    last.zxid
                );
            }
        }
        if self.proposals.len() == self.capacity {
            self.proposals.pop_front();
        }
        self.proposals.push_back(proposal);
    }

    pub fn is_empty(&self) -> bool {
        self.proposals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.proposals.len()
    }

    /// Smallest retained zxid, `Zxid::ZERO` when empty.
    pub fn min_zxid(&self) -> Zxid {
        self.proposals.front().map_or(Zxid::ZERO, |p| p.zxid)
    }

    /// Largest retained zxid, `Zxid::ZERO` when empty.
    pub fn max_zxid(&self) -> Zxid {
        self.proposals.back().map_or(Zxid::ZERO, |p| p.zxid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.iter()
    }

    /// Proposals with zxid strictly greater than `zxid`, in order.
    pub fn iter_from(&self, zxid: Zxid) -> impl Iterator<Item = &Proposal> {
        self.proposals.iter().skip_while(move |p| p.zxid <= zxid)
    }
}

struct LogState {
    window: CommittedLog,
    last_processed_zxid: Zxid,
}

/// Facade over the committed window, the data tree's last-processed zxid and
/// the on-disk transaction log.
///
/// The window and the last-processed zxid live behind one shared/exclusive
/// lock: plan construction holds it shared for its whole duration, the
/// broadcast pipeline takes it exclusively to append. The transaction log is
/// append-only and safe to read under the shared lock.
pub struct LogView {
    state: RwLock<LogState>,
    txn_log: Option<Box<dyn TxnLogSource>>,
    txn_log_size_budget: u64,
}

impl LogView {
    pub fn new(window_capacity: usize) -> LogView {
        LogView {
            state: RwLock::new(LogState {
                window: CommittedLog::new(window_capacity),
                last_processed_zxid: Zxid::ZERO,
            }),
            txn_log: None,
            txn_log_size_budget: 0,
        }
    }

    /// Attaches the on-disk log. `size_budget` is the largest total byte size
    /// the leader is willing to ship from it in a DIFF; 0 disables
    /// txn-log-based sync entirely.
    pub fn with_txn_log(mut self, source: Box<dyn TxnLogSource>, size_budget: u64) -> LogView {
        self.txn_log = Some(source);
        self.txn_log_size_budget = size_budget;
        self
    }

    /// Takes the shared lock for the duration of the returned guard.
    pub fn read(&self) -> LogReadGuard {
        LogReadGuard {
            state: self.state.read().expect("log lock poisoned"),
            view: self,
        }
    }

    /// Appends a proposal committed by the broadcast pipeline, advancing the
    /// last-processed zxid. Takes the exclusive lock.
    pub fn append_committed(&self, proposal: Proposal) {
        let mut state = self.state.write().expect("log lock poisoned");
        if proposal.zxid > state.last_processed_zxid {
            state.last_processed_zxid = proposal.zxid;
        }
        state.window.add(proposal);
    }

    /// Installs the last-processed zxid directly; after an election this is
    /// the `(new_epoch, 0)` marker, which has no proposal of its own.
    pub fn set_last_processed_zxid(&self, zxid: Zxid) {
        let mut state = self.state.write().expect("log lock poisoned");
        state.last_processed_zxid = zxid;
    }

    pub fn last_processed_zxid(&self) -> Zxid {
        self.state
            .read()
            .expect("log lock poisoned")
            .last_processed_zxid
    }
}

/// Shared-lock view used while building a sync plan. Appenders are blocked
/// until this is dropped, so the window and the last-processed zxid cannot
/// shift underneath the decision.
pub struct LogReadGuard<'a> {
    state: RwLockReadGuard<'a, LogState>,
    view: &'a LogView,
}

impl<'a> LogReadGuard<'a> {
    pub fn last_processed_zxid(&self) -> Zxid {
        self.state.last_processed_zxid
    }

    pub fn committed_is_empty(&self) -> bool {
        self.state.window.is_empty()
    }

    pub fn committed_min(&self) -> Zxid {
        self.state.window.min_zxid()
    }

    pub fn committed_max(&self) -> Zxid {
        self.state.window.max_zxid()
    }

    pub fn committed_iter(&self) -> impl Iterator<Item = &Proposal> {
        self.state.window.iter()
    }

    pub fn committed_iter_from(&self, zxid: Zxid) -> impl Iterator<Item = &Proposal> {
        self.state.window.iter_from(zxid)
    }

    pub fn txn_log_size_budget(&self) -> u64 {
        self.view.txn_log_size_budget
    }

    /// Whether txn-log-based sync is available at all.
    pub fn txn_log_enabled(&self) -> bool {
        self.view.txn_log.is_some() && self.view.txn_log_size_budget > 0
    }

    /// Opens a scoped cursor on the disk log, `None` when txn-log sync is
    /// disabled. The cursor must not outlive the guard.
    pub fn open_txn_log_from(&self, zxid: Zxid) -> Result<Option<TxnLogCursor>, Error> {
        match self.view.txn_log.as_ref() {
            Some(source) if self.view.txn_log_size_budget > 0 => {
                Ok(Some(source.open_from(zxid, self.view.txn_log_size_budget)?))
            }
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(zxid: Zxid) -> Proposal {
        Proposal {
            zxid,
            data: vec![0u8; 8],
        }
    }

    #[test]
    fn window_tracks_min_and_max() {
        let mut window = CommittedLog::new(10);
        assert_eq!(window.min_zxid(), Zxid::ZERO);
        assert_eq!(window.max_zxid(), Zxid::ZERO);

        for c in 2..=5 {
            window.add(proposal(Zxid::new(1, c)));
        }
        assert_eq!(window.min_zxid(), Zxid::new(1, 2));
        assert_eq!(window.max_zxid(), Zxid::new(1, 5));
    }

    #[test]
    fn window_evicts_oldest_when_full() {
        let mut window = CommittedLog::new(3);
        for c in 1..=5 {
            window.add(proposal(Zxid::new(1, c)));
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.min_zxid(), Zxid::new(1, 3));
        assert_eq!(window.max_zxid(), Zxid::new(1, 5));
    }

    #[test]
    fn window_keeps_duplicates() {
        let mut window = CommittedLog::new(10);
        window.add(proposal(Zxid::new(1, 1)));
        window.add(proposal(Zxid::new(1, 2)));
        window.add(proposal(Zxid::new(1, 2)));
        assert_eq!(window.len(), 3);
        assert_eq!(window.max_zxid(), Zxid::new(1, 2));
    }

    #[test]
    fn iter_from_is_exclusive() {
        let mut window = CommittedLog::new(10);
        for c in [2u32, 3, 5].iter() {
            window.add(proposal(Zxid::new(1, *c)));
        }
        let zxids: Vec<Zxid> = window.iter_from(Zxid::new(1, 3)).map(|p| p.zxid).collect();
        assert_eq!(zxids, vec![Zxid::new(1, 5)]);
    }

    #[test]
    fn append_advances_last_processed() {
        let view = LogView::new(10);
        view.set_last_processed_zxid(Zxid::new(1, 0));
        view.append_committed(proposal(Zxid::new(1, 1)));
        view.append_committed(proposal(Zxid::new(1, 2)));

        let guard = view.read();
        assert_eq!(guard.last_processed_zxid(), Zxid::new(1, 2));
        assert_eq!(guard.committed_min(), Zxid::new(1, 1));
        assert_eq!(guard.committed_max(), Zxid::new(1, 2));
        assert!(!guard.txn_log_enabled());
    }
}
