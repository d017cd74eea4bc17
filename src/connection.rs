//! Contracts for the TPM that policies are executed against.
//!
//! Command transport, session HMACs and parameter encryption live behind these
//! traits. Authorization for commands that take an authorization handle is
//! supplied either as a session, or as the `auth_value` of the resource context
//! when no session is supplied.

use crate::error::TpmError;
use crate::tpm_structure::TpmEnum;
use crate::tpm_types::*;

/// A TPM entity (object, NV index, PCR or permanent handle) loaded for use by a command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResourceContext {
    pub handle: TPM_HANDLE,
    pub name: Name,
    pub auth_value: Vec<u8>,
}

impl ResourceContext {
    pub fn new(handle: TPM_HANDLE, name: Name) -> Self {
        Self { handle, name, auth_value: Vec::new() }
    }

    /// A context for a handle whose name is the handle (a PCR or a permanent handle).
    pub fn from_handle(handle: TPM_HANDLE) -> Self {
        Self::new(handle, handle.get_name())
    }

    pub fn with_auth_value(mut self, auth_value: impl Into<Vec<u8>>) -> Self {
        self.auth_value = auth_value.into();
        self
    }
}

/// A started authorization session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub handle: TPM_HANDLE,
    pub session_type: TPM_SE,
    pub hash_alg: TPM_ALG_ID,
    pub nonce_tpm: Nonce,
}

/// Read access to TPM state that automatic branch selection inspects.
pub trait TpmState {
    /// Read the selected PCR values.
    fn pcr_read(&self, pcrs: &PcrSelectionList) -> Result<PcrValues, TpmError>;

    fn read_clock(&self) -> Result<TPMS_TIME_INFO, TpmError>;

    fn nv_read_public(&self, index: TPM_HANDLE) -> Result<TPMS_NV_PUBLIC, TpmError>;
}

/// A connection to a TPM.
///
/// Every method is a synchronous request/response exchange. Failures reported by
/// the TPM are returned as [`TpmError::Tpm`].
pub trait TpmConnection: TpmState {
    fn start_auth_session(&self, session_type: TPM_SE, hash_alg: TPM_ALG_ID) -> Result<SessionContext, TpmError>;

    fn flush_context(&self, handle: TPM_HANDLE) -> Result<(), TpmError>;

    /// Create a context for the entity at the specified handle, reading its public area
    /// to determine its name. Fails with [`TpmError::ResourceUnavailable`] if there is
    /// no entity at the handle.
    fn new_resource_context(&self, handle: TPM_HANDLE) -> Result<ResourceContext, TpmError>;

    /// Create a context for a permanent handle or PCR.
    fn get_permanent_context(&self, handle: TPM_HANDLE) -> Result<ResourceContext, TpmError> {
        match handle.get_type() {
            TPM_HT::PERMANENT | TPM_HT::PCR => Ok(ResourceContext::from_handle(handle)),
            _ => Err(TpmError::GenericError(format!("{} is not a permanent handle", handle))),
        }
    }

    /// Return up to `max` handles of the type of `first`, starting at `first`.
    fn get_capability_handles(&self, first: TPM_HANDLE, max: u32) -> Result<Vec<TPM_HANDLE>, TpmError>;

    fn load_external(&self, public: &TPMT_PUBLIC, hierarchy: TPM_HANDLE) -> Result<ResourceContext, TpmError>;

    fn load(
        &self,
        parent: &ResourceContext,
        private: &[u8],
        public: &TPMT_PUBLIC,
        auth_session: Option<&SessionContext>,
    ) -> Result<ResourceContext, TpmError>;

    fn context_save(&self, handle: TPM_HANDLE) -> Result<Vec<u8>, TpmError>;

    fn context_load(&self, context: &[u8]) -> Result<TPM_HANDLE, TpmError>;

    fn verify_signature(
        &self,
        key: &ResourceContext,
        digest: &[u8],
        signature: &TPMT_SIGNATURE,
    ) -> Result<TPMT_TK_VERIFIED, TpmError>;

    fn nv_read(
        &self,
        auth: &ResourceContext,
        index: &ResourceContext,
        size: u16,
        offset: u16,
        auth_session: Option<&SessionContext>,
    ) -> Result<Vec<u8>, TpmError>;

    fn policy_get_digest(&self, session: &SessionContext) -> Result<Digest, TpmError>;

    #[allow(clippy::too_many_arguments)]
    fn policy_nv(
        &self,
        auth: &ResourceContext,
        index: &ResourceContext,
        session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
        auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError>;

    #[allow(clippy::too_many_arguments)]
    fn policy_secret(
        &self,
        auth_object: &ResourceContext,
        session: &SessionContext,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth_session: Option<&SessionContext>,
    ) -> Result<(Timeout, TPMT_TK_AUTH), TpmError>;

    #[allow(clippy::too_many_arguments)]
    fn policy_signed(
        &self,
        auth_key: &ResourceContext,
        session: &SessionContext,
        include_nonce_tpm: bool,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth: &TPMT_SIGNATURE,
    ) -> Result<(Timeout, TPMT_TK_AUTH), TpmError>;

    #[allow(clippy::too_many_arguments)]
    fn policy_ticket(
        &self,
        session: &SessionContext,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TPMT_TK_AUTH,
    ) -> Result<(), TpmError>;

    fn policy_authorize(
        &self,
        session: &SessionContext,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        check_ticket: &TPMT_TK_VERIFIED,
    ) -> Result<(), TpmError>;

    fn policy_auth_value(&self, session: &SessionContext) -> Result<(), TpmError>;

    fn policy_command_code(&self, session: &SessionContext, code: TPM_CC) -> Result<(), TpmError>;

    fn policy_counter_timer(
        &self,
        session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
    ) -> Result<(), TpmError>;

    fn policy_cp_hash(&self, session: &SessionContext, cp_hash_a: &[u8]) -> Result<(), TpmError>;

    fn policy_name_hash(&self, session: &SessionContext, name_hash: &[u8]) -> Result<(), TpmError>;

    fn policy_or(&self, session: &SessionContext, digests: &[Digest]) -> Result<(), TpmError>;

    fn policy_pcr(&self, session: &SessionContext, pcr_digest: &[u8], pcrs: &PcrSelectionList) -> Result<(), TpmError>;

    fn policy_duplication_select(
        &self,
        session: &SessionContext,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<(), TpmError>;

    fn policy_password(&self, session: &SessionContext) -> Result<(), TpmError>;

    fn policy_nv_written(&self, session: &SessionContext, written_set: bool) -> Result<(), TpmError>;
}

/// The hierarchy that authorizes TPM2_PolicyNV reads of an NV index. A hierarchy
/// with read access takes precedence over the index itself, so `None` means the
/// index authorizes its own reads.
pub(crate) fn nv_read_auth_handle(public: &TPMS_NV_PUBLIC) -> Option<TPM_HANDLE> {
    if public.attributes.contains(TPMA_NV::OWNERREAD) {
        Some(TPM_HANDLE::new(TPM_RH::OWNER.get_value()))
    } else if public.attributes.contains(TPMA_NV::PPREAD) {
        Some(TPM_HANDLE::new(TPM_RH::PLATFORM.get_value()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv_public(attributes: TPMA_NV) -> TPMS_NV_PUBLIC {
        TPMS_NV_PUBLIC {
            nvIndex: TPM_HANDLE::new(0x01800000),
            nameAlg: TPM_ALG_ID::SHA256,
            attributes,
            authPolicy: Vec::new(),
            dataSize: 8,
        }
    }

    #[test]
    fn test_nv_read_auth_handle() {
        let owner = Some(TPM_HANDLE::new(TPM_RH::OWNER.get_value()));
        let platform = Some(TPM_HANDLE::new(TPM_RH::PLATFORM.get_value()));

        assert_eq!(nv_read_auth_handle(&nv_public(TPMA_NV::OWNERREAD | TPMA_NV::AUTHREAD)), owner);
        assert_eq!(nv_read_auth_handle(&nv_public(TPMA_NV::OWNERREAD | TPMA_NV::POLICYREAD)), owner);
        assert_eq!(nv_read_auth_handle(&nv_public(TPMA_NV::PPREAD | TPMA_NV::AUTHREAD)), platform);
        assert_eq!(nv_read_auth_handle(&nv_public(TPMA_NV::OWNERREAD | TPMA_NV::PPREAD)), owner);
        assert_eq!(nv_read_auth_handle(&nv_public(TPMA_NV::AUTHREAD | TPMA_NV::POLICYREAD)), None);
    }
}
