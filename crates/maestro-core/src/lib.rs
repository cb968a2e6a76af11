pub mod config;
pub mod error;
pub mod event;
pub mod template;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CapabilityError, ExecutorError, MaestroError, Result, ValidationError};
pub use event::{EventBus, ExecutionEvent};
pub use types::*;
