use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::{Duration, SessionId, Timestamp, Version, Xid, Zxid, ACL};

/// Transaction header.
///
/// Compared to `ZooKeeper.jute` it doesn't contain the operation type, which is
/// handled in a type-safe way in `TxnOperation`.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct TxnHeader {
    pub client_id: SessionId,
    pub cxid: Xid,
    pub zxid: Zxid,
    pub time: Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CreateTxn {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub acl: Vec<ACL>,
    pub ephemeral: bool,
    pub parent_c_version: Version,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CreateContainerTxn {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub acl: Vec<ACL>,
    pub parent_c_version: Version,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CreateTTLTxn {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub acl: Vec<ACL>,
    pub parent_c_version: Version,
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct DeleteTxn {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct SetDataTxn {
    pub path: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct CreateSessionTxn {
    pub time_out: Duration,
}

#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct ErrorTxn {
    pub err: i32,
}

/// A transaction, composed of its header and operation
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub struct Txn {
    pub header: TxnHeader,
    pub op: TxnOperation,
}

/// A transaction operation.
#[derive(Debug, Clone, PartialEq)]
#[derive(Serialize, Deserialize)]
pub enum TxnOperation {
    CreateSession(CreateSessionTxn),
    CloseSession,
    Create(CreateTxn),
    CreateTTL(CreateTTLTxn),
    CreateContainer(CreateContainerTxn),
    Delete(DeleteTxn),
    DeleteContainer(DeleteTxn),
    SetData(SetDataTxn),
    Error(ErrorTxn),
}
