//! Record shapes shared by the cache, the journal, and backing stores.

pub mod codec;
mod journal;
mod path;
mod record;

pub use journal::{now_unix_nanos, JournalEntry, JournalOp};
pub use path::{EdgeKey, Path, PathElement};
pub use record::{EdgeFlags, NodeFlags, SerializedEdge, SerializedNode, XMAX_OPEN};
