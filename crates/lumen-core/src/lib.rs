pub mod cancellation;
pub mod config;
pub mod delivery;
pub mod error_classifier;
pub mod event_bus;
pub mod metrics;
pub mod orchestrator;
pub mod quota;
pub mod recovery;
pub mod session_title;
pub mod storage;
pub mod storage_paths;
pub mod timeout;
pub mod turn;

pub use cancellation::*;
pub use config::*;
pub use delivery::*;
pub use error_classifier::*;
pub use event_bus::*;
pub use metrics::*;
pub use orchestrator::*;
pub use quota::*;
pub use recovery::*;
pub use session_title::*;
pub use storage::*;
pub use storage_paths::*;
pub use timeout::*;
pub use turn::*;
