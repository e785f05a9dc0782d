pub mod cancellation;
pub mod dispatcher;

pub use cancellation::CancellationToken;
pub use dispatcher::{DispatchPass, ServiceDispatcher, prepare_submission};
