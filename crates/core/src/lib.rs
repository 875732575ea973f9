pub mod config;
pub mod error;
pub mod identity;
pub mod record;

pub use config::{Credential, Settings, SourceDisposition, WatchMode};
pub use error::{ConfigError, ErrorKind};
pub use identity::Identity;
pub use record::*;
