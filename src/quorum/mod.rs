//! Leader-resident quorum logic: the committed proposal window, the
//! replicated log view over it, and the follower synchronization decider.

pub mod database;
pub mod sync;

pub use database::{CommittedLog, LogView};
pub use sync::{SyncDecider, SyncPlan, SyncStrategy};

use failure::Error;
use std::sync::mpsc::Sender;

use crate::proto::QuorumPacket;
use crate::Zxid;

/// Messages accepted by a learner handler.
///
/// The leader side holds only a [`LearnerHandle`]; the handler owns the
/// receiving end and the follower socket. This keeps the handler and the
/// leader free of references to each other.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnerMessage {
    /// Serialize this packet out to the follower.
    EnqueuePacket(QuorumPacket),
    /// The sync plan is complete; live forwarding must resume with the first
    /// committed proposal whose zxid is greater than this.
    NotifyForwardFrom(Zxid),
}

/// Sending half of a learner handler's packet queue. Single producer (the
/// sync decider's caller), single consumer (the handler's transport thread).
pub struct LearnerHandle {
    tx: Sender<LearnerMessage>,
}

impl LearnerHandle {
    pub fn new(tx: Sender<LearnerMessage>) -> LearnerHandle {
        LearnerHandle { tx }
    }

    /// Sends a complete plan: every packet in order, then the forward-from
    /// handoff. For a snapshot plan there are no packets and only the
    /// handoff is sent; the snapshot itself travels out-of-band.
    pub fn dispatch(&self, plan: &SyncPlan) -> Result<(), Error> {
        for packet in &plan.packets {
            self.send(LearnerMessage::EnqueuePacket(packet.clone()))?;
        }
        self.send(LearnerMessage::NotifyForwardFrom(plan.forward_from))
    }

    fn send(&self, msg: LearnerMessage) -> Result<(), Error> {
        self.tx
            .send(msg)
            .map_err(|_| failure::err_msg("learner handler is gone"))
    }
}
