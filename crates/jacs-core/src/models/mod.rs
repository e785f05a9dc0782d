pub mod error;
pub mod metadata;
pub mod page;
pub mod service;
pub mod stats;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use metadata::{ServiceArgDescriptor, ServiceMetaData};
pub use page::{DEFAULT_PAGE_SIZE, PageRequest, PageResult};
pub use service::{ServiceEvent, ServiceEventType, ServiceId, ServiceRecord, ServiceState};
pub use stats::ServerStats;
