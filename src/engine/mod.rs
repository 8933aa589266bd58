//! Backup/restore engine: orchestration on top of the kintone client, the
//! metadata index and the archive codec.

pub mod attachments;
pub mod audit;
pub mod backup;
pub mod restore;
