//! Software transactional memory over a shared, dynamically allocated
//! memory region.
//!
//! Transactions are optimistic and deferred-update: reads and writes are
//! staged against a private cache, and conflicts are only detected when a
//! peer commits. Read-only transactions get snapshot isolation from a
//! private, ever-growing cache of everything they've observed; read-write
//! transactions get serializability, aborting as soon as a committed peer
//! touches something they've read or written.
//!
//! ## Example
//!
//! ```rust,no_run
//! use omen_stm::abi::{region_create, region_start, tx_begin, tx_end, tx_write};
//!
//! let region = region_create(4096, 8).expect("valid region size/alignment");
//! let tx = tx_begin(&region, false).expect("region accepting transactions");
//! tx_write(&region, tx, &[1, 2, 3, 4], region_start(&region));
//! tx_end(&region, tx, false);
//! ```

pub mod abi;
pub mod block;
pub mod config;
pub mod error;
pub mod region;
pub mod segment;
pub mod transaction;

pub use block::{Block, BlockData, BlockSet};
pub use config::RegionConfig;
pub use error::{Result, StmError};
pub use region::Region;
pub use segment::{Segment, SegmentTable};
pub use transaction::{AllocResult, Transaction, TxId};
