//! The upload scheduling engine.
//!
//! - [`upload`]: the job state, its partitions and snapshots
//! - [`admission`]: chooses which queued items go into flight
//! - [`reconcile`]: refreshes in-flight items from the target
//! - [`uploader`]: the step-driven loop tying them together
//!
//! # Item lifecycle
//!
//! ```text
//! queued --submit--> pending --mined--> mined --confirmations--> complete
//!    ^                  |                 |
//!    +---- not found ---+-----------------+
//! ```

pub mod admission;
pub mod reconcile;
pub mod record;
pub mod upload;
pub mod uploader;

pub use record::{ItemRecord, ObservedState, Stage};
pub use upload::Upload;
pub use uploader::{Phase, Progress, UploadHandle, Uploader};
