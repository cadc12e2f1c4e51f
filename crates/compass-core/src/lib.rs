pub mod service;
pub mod instance;
pub mod status;
pub mod protocol;
pub mod version;
pub mod version_rule;
pub mod registry;
pub mod errors;
pub mod time;
pub mod auth;

pub use service::ServiceDescriptor;
pub use instance::InstanceDescriptor;
pub use status::{InstanceStatus, ServiceStatus};
pub use protocol::{Endpoint, Protocol};
pub use version::Version;
pub use version_rule::VersionRule;
pub use registry::{FindOutcome, RegistryStore};
pub use errors::{RegistryError, RegistryResult, TransportError, TransportErrorKind};
pub use auth::{Identity, Role, Permission, Claims};
