pub mod config;
pub mod file_handles;
pub mod governor;

pub use config::GovernorConfig;
pub use file_handles::{FileHandlePermit, FileHandleSemaphore};
pub use governor::ResourceGovernor;
