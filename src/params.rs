//! Per-call parameters for policy execution.

use crate::auth::PolicySignedAuthorization;
use crate::connection::ResourceContext;
use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm2_helpers::{compute_cp_hash, compute_name_hash};
use crate::tpm_types::*;

/// Identifies an authorization by the name of the authorizing entity and a policy reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PolicyAuthorizationID {
    pub auth_name: Name,
    pub policy_ref: Vec<u8>,
}

impl PolicyAuthorizationID {
    pub fn new(auth_name: impl Into<Name>, policy_ref: impl Into<Vec<u8>>) -> Self {
        Self { auth_name: auth_name.into(), policy_ref: policy_ref.into() }
    }

    /// The key that tickets for this authorization are stored under.
    pub(crate) fn ticket_key(&self) -> Result<Digest, TpmError> {
        Crypto::hash_all(TPM_ALG_ID::SHA256, &[&self.auth_name, &self.policy_ref])
    }
}

/// Parameters for a TPM2_PolicySecret assertion, matched by auth name and policy reference.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicySecretParams {
    pub auth_name: Name,
    pub policy_ref: Vec<u8>,
    /// Command parameter hash to bind the assertion (and any ticket) to.
    pub cp_hash: Option<CpHash>,
    /// Expiration in seconds. A negative value requests a ticket.
    pub expiration: i32,
}

/// A ticket produced by TPM2_PolicySecret or TPM2_PolicySigned, redeemable with
/// TPM2_PolicyTicket until it expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTicket {
    pub auth_name: Name,
    pub policy_ref: Vec<u8>,
    pub cp_hash: Digest,
    pub timeout: Timeout,
    pub ticket: TPMT_TK_AUTH,
}

impl PolicyTicket {
    pub fn id(&self) -> PolicyAuthorizationID {
        PolicyAuthorizationID::new(self.auth_name.clone(), self.policy_ref.clone())
    }
}

/// A command parameter hash, either given directly or computed from the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpHash {
    Digest(TaggedHash),
    Command { command_code: TPM_CC, handles: Vec<Name>, params: Vec<u8> },
}

impl CpHash {
    pub fn digest(&self, alg: TPM_ALG_ID) -> Result<Digest, TpmError> {
        match self {
            CpHash::Digest(ha) if ha.hashAlg == alg => Ok(ha.digest.clone()),
            CpHash::Digest(ha) => Err(TpmError::NotSupported(format!(
                "cpHash digest is {} rather than {}",
                ha.hashAlg, alg
            ))),
            CpHash::Command { command_code, handles, params } => compute_cp_hash(alg, *command_code, handles, params),
        }
    }
}

/// Describes how a policy session is going to be used, so that automatic branch
/// selection can pick a path that is compatible with the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySessionUsage {
    pub command_code: TPM_CC,
    pub handles: Vec<ResourceContext>,
    pub params: Vec<u8>,
    /// The index of the handle that the session authorizes.
    pub auth_index: usize,
    /// The authorization value of the authorized resource won't be available.
    pub no_auth_value: bool,
}

impl PolicySessionUsage {
    pub fn new(command_code: TPM_CC, handles: Vec<ResourceContext>, params: impl Into<Vec<u8>>) -> Self {
        Self { command_code, handles, params: params.into(), auth_index: 0, no_auth_value: false }
    }

    pub fn with_auth_index(mut self, index: usize) -> Self {
        self.auth_index = index;
        self
    }

    pub fn with_no_auth_value(mut self) -> Self {
        self.no_auth_value = true;
        self
    }

    pub fn auth_handle(&self) -> Option<&ResourceContext> {
        self.handles.get(self.auth_index)
    }

    fn handle_names(&self) -> Vec<Name> {
        self.handles.iter().map(|h| h.name.clone()).collect()
    }

    pub fn cp_hash(&self, alg: TPM_ALG_ID) -> Result<Digest, TpmError> {
        compute_cp_hash(alg, self.command_code, &self.handle_names(), &self.params)
    }

    pub fn name_hash(&self, alg: TPM_ALG_ID) -> Result<Digest, TpmError> {
        compute_name_hash(alg, &self.handle_names())
    }
}

/// Parameters for [`Policy::execute`](crate::policy::Policy::execute).
#[derive(Debug, Clone, Default)]
pub struct PolicyExecuteParams {
    pub secret_params: Vec<PolicySecretParams>,
    /// Tickets from earlier runs.
    pub tickets: Vec<PolicyTicket>,
    /// Signed authorizations for TPM2_PolicySigned assertions.
    pub authorizations: Vec<PolicySignedAuthorization>,
    /// Explicit branch path. Components that are empty or `$auto` select automatically.
    pub path: String,
    pub usage: Option<PolicySessionUsage>,
    /// Paths containing any of these authorizations are not selected automatically.
    pub ignore_authorizations: Vec<PolicyAuthorizationID>,
    /// Paths containing TPM2_PolicyNV assertions for these indices are not selected automatically.
    pub ignore_nv: Vec<Name>,
}

impl PolicyExecuteParams {
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_usage(mut self, usage: PolicySessionUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_tickets(mut self, tickets: Vec<PolicyTicket>) -> Self {
        self.tickets = tickets;
        self
    }

    pub fn with_authorization(mut self, auth: PolicySignedAuthorization) -> Self {
        self.authorizations.push(auth);
        self
    }

    pub fn with_secret_params(mut self, params: PolicySecretParams) -> Self {
        self.secret_params.push(params);
        self
    }

    pub(crate) fn find_secret_params(&self, auth_name: &[u8], policy_ref: &[u8]) -> Option<&PolicySecretParams> {
        self.secret_params
            .iter()
            .find(|p| p.auth_name == auth_name && p.policy_ref == policy_ref)
    }

    pub(crate) fn find_authorization(&self, auth_name: &[u8], policy_ref: &[u8]) -> Option<&PolicySignedAuthorization> {
        self.authorizations.iter().find(|a| {
            a.authorization.policy_ref == policy_ref
                && a.authorization.auth_key.get_name().is_ok_and(|name| name == auth_name)
        })
    }
}
