//! Types shared by every part of payproc: the ordered key-value list that
//! underlies both the wire protocol and the journal's in-memory record
//! construction, the numeric error taxonomy, identifier formats (session,
//! alias, account, SEPA-ref), and the static currency metadata table.

pub mod clock;
pub mod currency;
pub mod error;
pub mod ids;
pub mod kv;

pub use clock::Clock;
pub use error::{ErrorKind, PayprocError, Result};
pub use kv::{KvList, Name};
