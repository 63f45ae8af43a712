pub mod config;
pub mod deployment;
pub mod error;
pub mod fs_ops;
pub mod instance;
pub mod layout;
pub mod logger;
pub mod orchestrator;
pub mod plugins;
pub mod procfile;
pub mod registry;
pub mod schema;
pub mod supervisor;

pub use error::{SargeError, SargeResult};
pub use orchestrator::Sarge;
