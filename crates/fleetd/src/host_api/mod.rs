//! HTTP access to host APIs.

mod client;
mod credentials;
mod error;

pub use client::{HealthProbe, HostApi, HostApiClient, HostApiTimeouts, VmAction};
pub use credentials::{AuthHeader, CredentialResolver, HostCredentialResolver};
pub use error::{HostApiError, HostApiResult};
