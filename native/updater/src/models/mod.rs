mod build_info;
pub use build_info::*;
mod job_handle;
pub use job_handle::*;
pub mod notification;
pub use notification::{FailureReason, LogNotifier, Notification, Notifier};
mod preferences;
pub use preferences::*;
mod progress;
pub use progress::*;
mod status;
pub use status::*;
