pub mod endpoint;
pub mod pool;

pub use endpoint::{Endpoint, EndpointIdentity, ModificationTag, Protocol};
pub use pool::Pool;
