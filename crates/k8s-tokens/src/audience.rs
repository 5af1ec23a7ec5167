//! Well-known token audience names.
//!
//! An audience identifies the trust boundary a credential is scoped to and
//! keys the token cache. The platform materializes one projected-volume
//! token per audience; these constants name the audiences the platform
//! provisions for every workload.

/// Reserved audience under which the default cluster service-account token
/// is cached. It is the bootstrap credential used for requests to the
/// cluster API and to the identity provider itself.
pub const DEFAULT: &str = "kubernetes";

/// Audience for requests to the DBaaS infra service.
pub const DBAAS: &str = "dbaas";

/// Audience for requests to the MaaS infra service.
pub const MAAS: &str = "maas";
