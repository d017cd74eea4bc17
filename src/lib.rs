//! TPM 2.0 authorization policies.
//!
//! A [`Policy`] describes a TPM2_Policy* assertion sequence, optionally with
//! alternative branches, that can be executed against a policy session on a TPM,
//! or whose digest can be computed without one. Branches are selected by path or
//! automatically, based on how the session will be used and on the current TPM state.

pub mod auth;
pub mod auth_session;
pub mod branch;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod params;
pub mod policy;
pub mod policy_builder;
pub mod policy_or_tree;
mod policy_runner;
pub mod resources;
pub mod tpm2_helpers;
pub mod tpm_buffer;
pub mod tpm_structure;
pub mod tpm_type_extensions;
pub mod tpm_types;

#[cfg(test)]
mod test_support;

pub use auth::{PolicyAuthorization, PolicySignedAuthorization, SigningKey};
pub use branch::{PolicyBranchDetails, PolicyBranchPath};
pub use connection::{ResourceContext, SessionContext, TpmConnection, TpmState};
pub use error::{PolicyError, TpmError};
pub use params::{CpHash, PolicyAuthorizationID, PolicyExecuteParams, PolicySecretParams, PolicySessionUsage, PolicyTicket};
pub use policy::{Policy, PolicyBranch, PolicyElement};
pub use policy_builder::PolicyBuilder;
pub use resources::{PolicyResourceLoader, PolicyResources, TpmPolicyResources};
