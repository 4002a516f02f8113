//! # Fork-shared memory cells
//!
//! Single-word shared memory values for supervisor/worker coordination.
//! A [`SharedWord`] is a 64-bit atomic integer backed by a `MAP_SHARED`
//! mapping, so a value stored by a forked child is observed by the parent
//! and vice versa. The supervisor uses these cells for worker heartbeats,
//! in-step flags, lease ids and cross-process signal delivery.
//!
//! Cells must be created **before** `fork(2)`: the child inherits the
//! mapping, and from then on both processes address the same physical
//! page. Handles are cheaply cloneable; all access is atomic (SeqCst),
//! no cell is ever held locked across a user-code call.
//!
//! ```no_run
//! use herd_shm::SharedWord;
//!
//! let heartbeat = SharedWord::new(0)?;
//! let reader = heartbeat.clone();
//! heartbeat.store(1_700_000_000);
//! assert_eq!(reader.load(), 1_700_000_000);
//! # Ok::<(), herd_shm::ShmError>(())
//! ```

pub mod error;
pub mod word;

pub use error::{ShmError, ShmResult};
pub use word::{CELL_SIZE, SharedFlag, SharedWord};
