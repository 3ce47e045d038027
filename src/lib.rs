pub mod config;
pub mod environment;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod sim;

pub use config::{OptionOverrides, UploadOptions};
pub use environment::{Payload, SourceEnvironment, TargetEnvironment, TargetStatus};
pub use error::{Result, UploadError};
pub use scheduler::{Phase, Progress, Upload, Uploader};
