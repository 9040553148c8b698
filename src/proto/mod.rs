pub mod txn;

use serde_derive::Deserialize;
use serde_derive::Serialize;

use failure::Error;

use crate::Zxid;
use self::txn::Txn;

// See ZooDefs.java

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[derive(ToPrimitive)]
#[derive(IntoStaticStr, EnumIter)]
pub enum OpCode {
    Notification = 0,
    Create = 1,
    Delete = 2,
    SetData = 5,
    CreateContainer = 19,
    DeleteContainer = 20,
    CreateTTL = 21,
    CreateSession = -10,
    CloseSession = -11,
    Error = -1,
}

/// Quorum packet type tags.
///
/// The numeric values are defined by the surrounding ZAB implementation (see
/// `Leader.java`); they are interface constants, not choices of this crate.
/// Sync plans only ever contain `Diff`, `Trunc`, `Snap`, `Proposal` and
/// `Commit`; `NewLeader` and `UpToDate` are emitted by the surrounding
/// handshake logic.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
#[derive(ToPrimitive)]
#[derive(IntoStaticStr, EnumIter)]
pub enum PacketType {
    Proposal = 2,
    Commit = 4,
    NewLeader = 10,
    UpToDate = 12,
    Diff = 13,
    Trunc = 14,
    Snap = 15,
}

/// A packet exchanged between the leader and a learner.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct QuorumPacket {
    #[serde(rename = "type")]
    pub kind: PacketType,
    pub zxid: Zxid,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl QuorumPacket {
    /// A data-less control packet (DIFF, TRUNC, COMMIT, ...).
    pub fn op(kind: PacketType, zxid: Zxid) -> QuorumPacket {
        QuorumPacket {
            kind,
            zxid,
            data: Vec::new(),
        }
    }

    pub fn proposal(proposal: &Proposal) -> QuorumPacket {
        QuorumPacket {
            kind: PacketType::Proposal,
            zxid: proposal.zxid,
            data: proposal.data.clone(),
        }
    }

    pub fn commit(zxid: Zxid) -> QuorumPacket {
        QuorumPacket::op(PacketType::Commit, zxid)
    }
}

/// An accepted transaction: its zxid and the encoded transaction record.
///
/// The payload is opaque to the synchronization logic; it is produced once
/// when the proposal is accepted and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct Proposal {
    pub zxid: Zxid,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Proposal {
    pub fn new(txn: &Txn) -> Result<Proposal, Error> {
        Ok(Proposal {
            zxid: txn.header.zxid,
            data: bincode::serialize(txn)?,
        })
    }

    /// Decodes the transaction record carried by this proposal.
    pub fn txn(&self) -> Result<Txn, Error> {
        Ok(bincode::deserialize(&self.data)?)
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::proto::txn::{DeleteTxn, TxnHeader, TxnOperation};
    use crate::{SessionId, Timestamp, Xid};

    /// Test that the additional derives on enums behave as expected
    #[test]
    pub fn test_opcode_derives() {
        use num_traits::cast::ToPrimitive;
        use strum::IntoEnumIterator;

        // Use CloseSession as its value is different from its position in the variants

        let x = OpCode::CloseSession;

        // ToPrimitive
        assert_eq!(x.to_i32(), Some(-11));

        // IntoStaticStr
        let x: &'static str = OpCode::Create.into();
        assert_eq!(x, "Create");

        // EnumIter
        let v = OpCode::iter().collect::<Vec<_>>();
        assert_eq!(&v[0..3], &[OpCode::Notification, OpCode::Create, OpCode::Delete]);
    }

    #[test]
    pub fn test_packet_type_values() {
        use num_traits::cast::ToPrimitive;

        assert_eq!(PacketType::Proposal.to_i32(), Some(2));
        assert_eq!(PacketType::Commit.to_i32(), Some(4));
        assert_eq!(PacketType::NewLeader.to_i32(), Some(10));
        assert_eq!(PacketType::UpToDate.to_i32(), Some(12));
        assert_eq!(PacketType::Diff.to_i32(), Some(13));
        assert_eq!(PacketType::Trunc.to_i32(), Some(14));
        assert_eq!(PacketType::Snap.to_i32(), Some(15));
    }

    #[test]
    pub fn proposal_payload_roundtrip() {
        let txn = Txn {
            header: TxnHeader {
                client_id: SessionId(1),
                cxid: Xid(7),
                zxid: crate::Zxid::new(1, 3),
                time: Timestamp(1_000),
            },
            op: TxnOperation::Delete(DeleteTxn {
                path: "/app/queue".to_string(),
            }),
        };

        let proposal = Proposal::new(&txn).unwrap();
        assert_eq!(proposal.zxid, crate::Zxid::new(1, 3));

        let decoded = proposal.txn().unwrap();
        assert_eq!(decoded.header.zxid, txn.header.zxid);
        match decoded.op {
            TxnOperation::Delete(d) => assert_eq!(d.path, "/app/queue"),
            other => panic!("unexpected operation: {:?}", other),
        }
    }
}
