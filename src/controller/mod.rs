//! Controller for the Consul unit
//!
//! Hook dispatch, the reconcile loop, exposure, endpoint resolution and
//! the certificate lifecycle.

pub mod certificates;
pub mod context;
pub mod dispatch;
pub mod endpoints;
pub mod exposure;
mod reconciler;
pub mod status;
#[cfg(test)]
mod test_support;

pub use certificates::{CertificateLifecycle, Outcome};
pub use context::{CharmContext, ControllerState, UnitIdentity};
pub use dispatch::{DeferredStore, Dispatcher, Trigger};
pub use endpoints::{EndpointResolver, HealthcheckLocator};
pub use exposure::{ExposurePlan, ServiceExposer};
pub use reconciler::{PublishTarget, ReconcileLoop};
pub use status::Phase;
