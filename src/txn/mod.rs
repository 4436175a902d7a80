//! Journaled transactions: staging, replay on commit, recovery, and
//! replication slots that stream committed transactions out of the journal.

mod manager;
mod replication;
mod transaction;

pub use manager::{RecoveryReport, TransactionManager};
pub use replication::{ReplicationManager, ReplicationMessage, ReplicationSlot, SlotStorage};
pub use transaction::Transaction;
