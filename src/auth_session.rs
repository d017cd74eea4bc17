//! Policy sessions: the receivers of TPM2_Policy* assertions.
//!
//! [`TpmPolicySession`] forwards each assertion to a TPM. [`ComputePolicySession`]
//! reproduces the TPM's policy digest update rules in memory, for computing
//! policy digests and for trial evaluation.

use crate::connection::{ResourceContext, SessionContext, TpmConnection};
use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm_structure::{TpmEnum, TpmMarshaller};
use crate::tpm_types::*;

/// Something that can receive policy assertions and report its running digest.
pub trait PolicySession {
    fn hash_alg(&self) -> TPM_ALG_ID;

    /// The nonce that signed authorizations for this session are bound to.
    fn nonce_tpm(&self) -> Nonce;

    fn policy_get_digest(&mut self) -> Result<Digest, TpmError>;

    fn policy_nv(
        &mut self,
        auth: &ResourceContext,
        index: &ResourceContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
        auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError>;

    /// Returns the timeout and ticket produced by the TPM, if any.
    fn policy_secret(
        &mut self,
        auth_object: &ResourceContext,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth_session: Option<&SessionContext>,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError>;

    /// Returns the timeout and ticket produced by the TPM, if any.
    fn policy_signed(
        &mut self,
        auth_key: &ResourceContext,
        include_nonce_tpm: bool,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth: &TPMT_SIGNATURE,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError>;

    fn policy_ticket(
        &mut self,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TPMT_TK_AUTH,
    ) -> Result<(), TpmError>;

    fn policy_authorize(
        &mut self,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        check_ticket: Option<&TPMT_TK_VERIFIED>,
    ) -> Result<(), TpmError>;

    fn policy_auth_value(&mut self) -> Result<(), TpmError>;

    fn policy_command_code(&mut self, code: TPM_CC) -> Result<(), TpmError>;

    fn policy_counter_timer(&mut self, operand_b: &[u8], offset: u16, operation: TPM_EO) -> Result<(), TpmError>;

    fn policy_cp_hash(&mut self, cp_hash_a: &[u8]) -> Result<(), TpmError>;

    fn policy_name_hash(&mut self, name_hash: &[u8]) -> Result<(), TpmError>;

    fn policy_or(&mut self, digests: &[Digest]) -> Result<(), TpmError>;

    fn policy_pcr(&mut self, pcr_digest: &[u8], pcrs: &PcrSelectionList) -> Result<(), TpmError>;

    fn policy_duplication_select(
        &mut self,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<(), TpmError>;

    fn policy_password(&mut self) -> Result<(), TpmError>;

    fn policy_nv_written(&mut self, written_set: bool) -> Result<(), TpmError>;
}

/// A policy session on a TPM.
pub struct TpmPolicySession<'a> {
    tpm: &'a dyn TpmConnection,
    session: SessionContext,
}

impl<'a> TpmPolicySession<'a> {
    pub fn new(tpm: &'a dyn TpmConnection, session: SessionContext) -> Self {
        Self { tpm, session }
    }

    pub fn context(&self) -> &SessionContext {
        &self.session
    }
}

impl PolicySession for TpmPolicySession<'_> {
    fn hash_alg(&self) -> TPM_ALG_ID {
        self.session.hash_alg
    }

    fn nonce_tpm(&self) -> Nonce {
        self.session.nonce_tpm.clone()
    }

    fn policy_get_digest(&mut self) -> Result<Digest, TpmError> {
        self.tpm.policy_get_digest(&self.session)
    }

    fn policy_nv(
        &mut self,
        auth: &ResourceContext,
        index: &ResourceContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
        auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError> {
        self.tpm
            .policy_nv(auth, index, &self.session, operand_b, offset, operation, auth_session)
    }

    fn policy_secret(
        &mut self,
        auth_object: &ResourceContext,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth_session: Option<&SessionContext>,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError> {
        let (timeout, ticket) =
            self.tpm
                .policy_secret(auth_object, &self.session, cp_hash_a, policy_ref, expiration, auth_session)?;
        Ok((timeout, Some(ticket)))
    }

    fn policy_signed(
        &mut self,
        auth_key: &ResourceContext,
        include_nonce_tpm: bool,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth: &TPMT_SIGNATURE,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError> {
        let (timeout, ticket) = self.tpm.policy_signed(
            auth_key,
            &self.session,
            include_nonce_tpm,
            cp_hash_a,
            policy_ref,
            expiration,
            auth,
        )?;
        Ok((timeout, Some(ticket)))
    }

    fn policy_ticket(
        &mut self,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TPMT_TK_AUTH,
    ) -> Result<(), TpmError> {
        self.tpm
            .policy_ticket(&self.session, timeout, cp_hash_a, policy_ref, auth_name, ticket)
    }

    fn policy_authorize(
        &mut self,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        check_ticket: Option<&TPMT_TK_VERIFIED>,
    ) -> Result<(), TpmError> {
        let Some(check_ticket) = check_ticket else {
            return Err(TpmError::GenericError(
                "TPM2_PolicyAuthorize requires a verification ticket".to_string(),
            ));
        };
        self.tpm
            .policy_authorize(&self.session, approved_policy, policy_ref, key_sign, check_ticket)
    }

    fn policy_auth_value(&mut self) -> Result<(), TpmError> {
        self.tpm.policy_auth_value(&self.session)
    }

    fn policy_command_code(&mut self, code: TPM_CC) -> Result<(), TpmError> {
        self.tpm.policy_command_code(&self.session, code)
    }

    fn policy_counter_timer(&mut self, operand_b: &[u8], offset: u16, operation: TPM_EO) -> Result<(), TpmError> {
        self.tpm.policy_counter_timer(&self.session, operand_b, offset, operation)
    }

    fn policy_cp_hash(&mut self, cp_hash_a: &[u8]) -> Result<(), TpmError> {
        self.tpm.policy_cp_hash(&self.session, cp_hash_a)
    }

    fn policy_name_hash(&mut self, name_hash: &[u8]) -> Result<(), TpmError> {
        self.tpm.policy_name_hash(&self.session, name_hash)
    }

    fn policy_or(&mut self, digests: &[Digest]) -> Result<(), TpmError> {
        self.tpm.policy_or(&self.session, digests)
    }

    fn policy_pcr(&mut self, pcr_digest: &[u8], pcrs: &PcrSelectionList) -> Result<(), TpmError> {
        self.tpm.policy_pcr(&self.session, pcr_digest, pcrs)
    }

    fn policy_duplication_select(
        &mut self,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<(), TpmError> {
        self.tpm
            .policy_duplication_select(&self.session, object_name, new_parent_name, include_object)
    }

    fn policy_password(&mut self) -> Result<(), TpmError> {
        self.tpm.policy_password(&self.session)
    }

    fn policy_nv_written(&mut self, written_set: bool) -> Result<(), TpmError> {
        self.tpm.policy_nv_written(&self.session, written_set)
    }
}

/// Computes policy digests in memory using the TPM's update rules.
#[derive(Debug, Clone)]
pub struct ComputePolicySession {
    digest: TPMT_HA,
}

impl ComputePolicySession {
    /// Begin at the all-zero digest, as a freshly started policy session does.
    pub fn new(alg: TPM_ALG_ID) -> Result<Self, TpmError> {
        Ok(Self { digest: TPMT_HA::zero(alg)? })
    }

    /// Continue from the specified digest.
    pub fn with_digest(digest: TPMT_HA) -> Result<Self, TpmError> {
        let digest = TPMT_HA::new(digest.hashAlg, digest.digest)?;
        Ok(Self { digest })
    }

    pub fn digest(&self) -> &TPMT_HA {
        &self.digest
    }

    /// Extend the digest: digest = H(digest || data...)
    fn extend(&mut self, data: &[&[u8]]) -> Result<(), TpmError> {
        let mut to_hash = self.digest.digest.clone();
        for d in data {
            to_hash.extend_from_slice(d);
        }
        self.digest.digest = Crypto::hash(self.digest.hashAlg, &to_hash)?;
        Ok(())
    }

    /// The PolicyUpdate() function of the TPM reference implementation
    fn policy_update(&mut self, command_code: TPM_CC, arg2: &[u8], arg3: &[u8]) -> Result<(), TpmError> {
        self.extend(&[&command_code.get_value().to_be_bytes(), arg2])?;
        self.extend(&[arg3])
    }

    fn reset(&mut self) {
        self.digest.digest = vec![0u8; self.digest.hashAlg.size()];
    }

    fn operand_args(&self, operand_b: &[u8], offset: u16, operation: TPM_EO) -> Result<Digest, TpmError> {
        let mut args = operand_b.to_vec();
        args.extend_from_slice(&offset.to_be_bytes());
        args.extend_from_slice(&operation.get_value().to_be_bytes());
        Crypto::hash(self.digest.hashAlg, &args)
    }
}

impl PolicySession for ComputePolicySession {
    fn hash_alg(&self) -> TPM_ALG_ID {
        self.digest.hashAlg
    }

    fn nonce_tpm(&self) -> Nonce {
        Vec::new()
    }

    fn policy_get_digest(&mut self) -> Result<Digest, TpmError> {
        Ok(self.digest.digest.clone())
    }

    fn policy_nv(
        &mut self,
        _auth: &ResourceContext,
        index: &ResourceContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
        _auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError> {
        let args = self.operand_args(operand_b, offset, operation)?;
        self.extend(&[&TPM_CC::PolicyNV.get_value().to_be_bytes(), &args, &index.name])
    }

    fn policy_secret(
        &mut self,
        auth_object: &ResourceContext,
        _cp_hash_a: &[u8],
        policy_ref: &[u8],
        _expiration: i32,
        _auth_session: Option<&SessionContext>,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError> {
        self.policy_update(TPM_CC::PolicySecret, &auth_object.name, policy_ref)?;
        Ok((Vec::new(), None))
    }

    fn policy_signed(
        &mut self,
        auth_key: &ResourceContext,
        _include_nonce_tpm: bool,
        _cp_hash_a: &[u8],
        policy_ref: &[u8],
        _expiration: i32,
        _auth: &TPMT_SIGNATURE,
    ) -> Result<(Timeout, Option<TPMT_TK_AUTH>), TpmError> {
        self.policy_update(TPM_CC::PolicySigned, &auth_key.name, policy_ref)?;
        Ok((Vec::new(), None))
    }

    fn policy_ticket(
        &mut self,
        _timeout: &[u8],
        _cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TPMT_TK_AUTH,
    ) -> Result<(), TpmError> {
        let command_code = match ticket.tag {
            TPM_ST::AUTH_SECRET => TPM_CC::PolicySecret,
            TPM_ST::AUTH_SIGNED => TPM_CC::PolicySigned,
            tag => return Err(TpmError::IncorrectTag(TPM_ST::AUTH_SECRET.0 as u32, tag.0 as u32)),
        };
        self.policy_update(command_code, auth_name, policy_ref)
    }

    fn policy_authorize(
        &mut self,
        _approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        _check_ticket: Option<&TPMT_TK_VERIFIED>,
    ) -> Result<(), TpmError> {
        self.reset();
        self.policy_update(TPM_CC::PolicyAuthorize, key_sign, policy_ref)
    }

    fn policy_auth_value(&mut self) -> Result<(), TpmError> {
        self.extend(&[&TPM_CC::PolicyAuthValue.get_value().to_be_bytes()])
    }

    fn policy_command_code(&mut self, code: TPM_CC) -> Result<(), TpmError> {
        self.extend(&[
            &TPM_CC::PolicyCommandCode.get_value().to_be_bytes(),
            &code.get_value().to_be_bytes(),
        ])
    }

    fn policy_counter_timer(&mut self, operand_b: &[u8], offset: u16, operation: TPM_EO) -> Result<(), TpmError> {
        let args = self.operand_args(operand_b, offset, operation)?;
        self.extend(&[&TPM_CC::PolicyCounterTimer.get_value().to_be_bytes(), &args])
    }

    fn policy_cp_hash(&mut self, cp_hash_a: &[u8]) -> Result<(), TpmError> {
        self.extend(&[&TPM_CC::PolicyCpHash.get_value().to_be_bytes(), cp_hash_a])
    }

    fn policy_name_hash(&mut self, name_hash: &[u8]) -> Result<(), TpmError> {
        self.extend(&[&TPM_CC::PolicyNameHash.get_value().to_be_bytes(), name_hash])
    }

    fn policy_or(&mut self, digests: &[Digest]) -> Result<(), TpmError> {
        if digests.len() < 2 || digests.len() > 8 {
            return Err(TpmError::InvalidArraySize(format!(
                "invalid number of digests for TPM2_PolicyOR: {}",
                digests.len()
            )));
        }
        let mut args = Vec::new();
        for d in digests {
            if d.len() != self.digest.hashAlg.size() {
                return Err(TpmError::InvalidArraySize(format!("invalid digest length {}", d.len())));
            }
            args.extend_from_slice(d);
        }
        self.reset();
        self.extend(&[&TPM_CC::PolicyOR.get_value().to_be_bytes(), &args])
    }

    fn policy_pcr(&mut self, pcr_digest: &[u8], pcrs: &PcrSelectionList) -> Result<(), TpmError> {
        let pcrs = pcrs.toBytes()?;
        self.extend(&[&TPM_CC::PolicyPCR.get_value().to_be_bytes(), &pcrs, pcr_digest])
    }

    fn policy_duplication_select(
        &mut self,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<(), TpmError> {
        let object_name: &[u8] = if include_object { object_name } else { &[] };
        self.extend(&[
            &TPM_CC::PolicyDuplicationSelect.get_value().to_be_bytes(),
            object_name,
            new_parent_name,
            &[include_object as u8],
        ])
    }

    fn policy_password(&mut self) -> Result<(), TpmError> {
        // TPM2_PolicyPassword and TPM2_PolicyAuthValue produce the same digest
        self.policy_auth_value()
    }

    fn policy_nv_written(&mut self, written_set: bool) -> Result<(), TpmError> {
        self.extend(&[&TPM_CC::PolicyNvWritten.get_value().to_be_bytes(), &[written_set as u8]])
    }
}
