//! An in-memory TPM for tests. Policy sessions follow the digest rules of
//! [`ComputePolicySession`] and enforce the checks a TPM makes for each assertion.

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::auth::{policy_authorization_digest, PolicySignedAuthorization};
use crate::auth_session::{ComputePolicySession, PolicySession};
use crate::branch::operand_matches;
use crate::connection::{ResourceContext, SessionContext, TpmConnection, TpmState};
use crate::crypto::Crypto;
use crate::error::{TpmError, TpmResponseError, TPM_RC_EXPIRED, TPM_RC_HANDLE, TPM_RC_POLICY_FAIL, TPM_RC_TICKET};
use crate::tpm2_helpers::compute_pcr_digest;
use crate::tpm_structure::TpmMarshaller;
use crate::tpm_type_extensions::name_alg;
use crate::tpm_types::*;

const TRANSIENT_FIRST: u32 = 0x80000000;
const POLICY_SESSION_FIRST: u32 = 0x03000000;

fn tpm_error(command_code: TPM_CC, response_code: u32) -> TpmError {
    TpmError::Tpm(TpmResponseError::new(command_code, response_code))
}

struct MockNvIndex {
    public: TPMS_NV_PUBLIC,
    data: Vec<u8>,
}

struct MockSession {
    session: ComputePolicySession,
    nonce: Nonce,
    command_code: Option<TPM_CC>,
}

#[derive(Default)]
struct MockTpmState {
    next_handle: u32,
    sessions: BTreeMap<u32, MockSession>,
    objects: BTreeMap<u32, TPMT_PUBLIC>,
    nv: BTreeMap<u32, MockNvIndex>,
    pcrs: PcrValues,
    time: u64,
    calls: Vec<TPM_CC>,
    asserted_command_codes: Vec<TPM_CC>,
    flushed: Vec<TPM_HANDLE>,
}

impl MockTpmState {
    fn next_handle(&mut self, first: u32) -> TPM_HANDLE {
        self.next_handle += 1;
        TPM_HANDLE::new(first + self.next_handle)
    }

    fn session(&mut self, command_code: TPM_CC, handle: TPM_HANDLE) -> Result<&mut MockSession, TpmError> {
        self.calls.push(command_code);
        self.sessions
            .get_mut(&handle.handle)
            .ok_or_else(|| tpm_error(command_code, TPM_RC_HANDLE))
    }

    /// Check the authorization of `command_code` with an NV index that authorizes
    /// reads with a policy session.
    fn check_nv_policy_auth(
        &self,
        command_code: TPM_CC,
        nv: &MockNvIndex,
        auth: &ResourceContext,
        auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError> {
        let attributes = nv.public.attributes;
        if auth.handle != nv.public.nvIndex
            || !attributes.contains(TPMA_NV::POLICYREAD)
            || (auth_session.is_none() && attributes.contains(TPMA_NV::AUTHREAD))
        {
            return Ok(());
        }
        match auth_session.and_then(|s| self.sessions.get(&s.handle.handle)) {
            Some(s)
                if s.session.digest().digest == nv.public.authPolicy
                    && s.command_code.map_or(true, |c| c == command_code) =>
            {
                Ok(())
            }
            _ => Err(tpm_error(command_code, TPM_RC_POLICY_FAIL)),
        }
    }

    fn object(&self, command_code: TPM_CC, handle: TPM_HANDLE) -> Result<&TPMT_PUBLIC, TpmError> {
        self.objects
            .get(&handle.handle)
            .ok_or_else(|| tpm_error(command_code, TPM_RC_HANDLE))
    }

    fn time_info(&self) -> TPMS_TIME_INFO {
        TPMS_TIME_INFO {
            time: self.time,
            clockInfo: TPMS_CLOCK_INFO { clock: self.time, resetCount: 0, restartCount: 0, safe: true },
        }
    }
}

/// A simulated TPM.
pub(crate) struct MockTpm {
    proof: Vec<u8>,
    state: RefCell<MockTpmState>,
}

impl MockTpm {
    pub(crate) fn new() -> Self {
        Self { proof: b"mock TPM proof value".to_vec(), state: RefCell::default() }
    }

    pub(crate) fn define_nv(&self, public: TPMS_NV_PUBLIC, data: Vec<u8>) {
        self.state
            .borrow_mut()
            .nv
            .insert(public.nvIndex.handle, MockNvIndex { public, data });
    }

    pub(crate) fn write_nv(&self, index: TPM_HANDLE, data: Vec<u8>) {
        if let Some(nv) = self.state.borrow_mut().nv.get_mut(&index.handle) {
            nv.public.attributes = nv.public.attributes | TPMA_NV::WRITTEN;
            nv.data = data;
        }
    }

    /// Make a persistent object available at `handle`.
    pub(crate) fn add_persistent(&self, handle: TPM_HANDLE, public: TPMT_PUBLIC) {
        self.state.borrow_mut().objects.insert(handle.handle, public);
    }

    pub(crate) fn set_pcr(&self, alg: TPM_ALG_ID, pcr: u32, value: Digest) {
        self.state.borrow_mut().pcrs.entry(alg).or_default().insert(pcr, value);
    }

    pub(crate) fn advance_time(&self, ms: u64) {
        self.state.borrow_mut().time += ms;
    }

    /// The command codes of every policy command executed, in order.
    pub(crate) fn calls(&self) -> Vec<TPM_CC> {
        self.state.borrow().calls.clone()
    }

    pub(crate) fn count(&self, command_code: TPM_CC) -> usize {
        self.state.borrow().calls.iter().filter(|c| **c == command_code).count()
    }

    /// The arguments of every TPM2_PolicyCommandCode assertion, in order.
    pub(crate) fn asserted_command_codes(&self) -> Vec<TPM_CC> {
        self.state.borrow().asserted_command_codes.clone()
    }

    pub(crate) fn flushed(&self) -> Vec<TPM_HANDLE> {
        self.state.borrow().flushed.clone()
    }

    /// The number of sessions and transient objects that are still loaded.
    pub(crate) fn loaded_transients(&self) -> usize {
        let state = self.state.borrow();
        state.sessions.len() + state.objects.keys().filter(|h| **h >= TRANSIENT_FIRST && **h < 0x81000000).count()
    }

    pub(crate) fn session_digest(&self, session: &SessionContext) -> Option<Digest> {
        self.state
            .borrow()
            .sessions
            .get(&session.handle.handle)
            .map(|s| s.session.digest().digest.clone())
    }

    fn ticket_digest(&self, parts: &[&[u8]]) -> Result<Digest, TpmError> {
        Crypto::hmac(TPM_ALG_ID::SHA256, &self.proof, &parts.concat())
    }

    /// Produce the timeout and ticket for an authorization with the specified expiration.
    fn make_ticket(
        &self,
        tag: TPM_ST,
        time: u64,
        expiration: i32,
        cp_hash: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
    ) -> Result<(Timeout, TPMT_TK_AUTH), TpmError> {
        if expiration >= 0 {
            let null = TPMT_TK_AUTH { tag, hierarchy: TPM_RH::NULL.into(), digest: Vec::new() };
            return Ok((Vec::new(), null));
        }
        let timeout = (time + expiration.unsigned_abs() as u64 * 1000).to_be_bytes().to_vec();
        let digest = self.ticket_digest(&[&timeout, cp_hash, policy_ref, auth_name])?;
        Ok((timeout, TPMT_TK_AUTH { tag, hierarchy: TPM_RH::OWNER.into(), digest }))
    }

    fn allocate(&self, public: &TPMT_PUBLIC) -> Result<ResourceContext, TpmError> {
        let mut state = self.state.borrow_mut();
        let handle = state.next_handle(TRANSIENT_FIRST);
        state.objects.insert(handle.handle, public.clone());
        Ok(ResourceContext::new(handle, public.get_name()?))
    }
}

impl TpmState for MockTpm {
    fn pcr_read(&self, pcrs: &PcrSelectionList) -> Result<PcrValues, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::PCR_Read);
        let mut out = PcrValues::new();
        for selection in pcrs {
            for pcr in selection.pcrs() {
                let value = state
                    .pcrs
                    .get(&selection.hash)
                    .and_then(|bank| bank.get(&pcr))
                    .cloned()
                    .unwrap_or_else(|| vec![0u8; selection.hash.size()]);
                out.entry(selection.hash).or_default().insert(pcr, value);
            }
        }
        Ok(out)
    }

    fn read_clock(&self) -> Result<TPMS_TIME_INFO, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::ReadClock);
        Ok(state.time_info())
    }

    fn nv_read_public(&self, index: TPM_HANDLE) -> Result<TPMS_NV_PUBLIC, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::NV_ReadPublic);
        state
            .nv
            .get(&index.handle)
            .map(|nv| nv.public.clone())
            .ok_or_else(|| tpm_error(TPM_CC::NV_ReadPublic, TPM_RC_HANDLE))
    }
}

impl TpmConnection for MockTpm {
    fn start_auth_session(&self, session_type: TPM_SE, hash_alg: TPM_ALG_ID) -> Result<SessionContext, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::StartAuthSession);
        let handle = state.next_handle(POLICY_SESSION_FIRST);
        let nonce = Crypto::hash(TPM_ALG_ID::SHA256, &handle.handle.to_be_bytes())?[..16].to_vec();
        state
            .sessions
            .insert(handle.handle, MockSession {
                session: ComputePolicySession::new(hash_alg)?,
                nonce: nonce.clone(),
                command_code: None,
            });
        Ok(SessionContext { handle, session_type, hash_alg, nonce_tpm: nonce })
    }

    fn flush_context(&self, handle: TPM_HANDLE) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::FlushContext);
        let removed = state.sessions.remove(&handle.handle).is_some()
            || (handle.get_type() == TPM_HT::TRANSIENT && state.objects.remove(&handle.handle).is_some());
        if !removed {
            return Err(tpm_error(TPM_CC::FlushContext, TPM_RC_HANDLE));
        }
        state.flushed.push(handle);
        Ok(())
    }

    fn new_resource_context(&self, handle: TPM_HANDLE) -> Result<ResourceContext, TpmError> {
        let state = self.state.borrow();
        if let Some(nv) = state.nv.get(&handle.handle) {
            return Ok(ResourceContext::new(handle, nv.public.get_name()?));
        }
        if let Some(public) = state.objects.get(&handle.handle) {
            return Ok(ResourceContext::new(handle, public.get_name()?));
        }
        Err(TpmError::ResourceUnavailable(handle))
    }

    fn get_capability_handles(&self, first: TPM_HANDLE, max: u32) -> Result<Vec<TPM_HANDLE>, TpmError> {
        let state = self.state.borrow();
        let ty = first.get_type();
        Ok(state
            .nv
            .keys()
            .chain(state.objects.keys())
            .map(|h| TPM_HANDLE::new(*h))
            .filter(|h| h.get_type() == ty && *h >= first)
            .take(max as usize)
            .collect())
    }

    fn load_external(&self, public: &TPMT_PUBLIC, _hierarchy: TPM_HANDLE) -> Result<ResourceContext, TpmError> {
        self.state.borrow_mut().calls.push(TPM_CC::LoadExternal);
        self.allocate(public)
    }

    fn load(
        &self,
        parent: &ResourceContext,
        _private: &[u8],
        public: &TPMT_PUBLIC,
        _auth_session: Option<&SessionContext>,
    ) -> Result<ResourceContext, TpmError> {
        {
            let mut state = self.state.borrow_mut();
            state.calls.push(TPM_CC::Load);
            state.object(TPM_CC::Load, parent.handle)?;
        }
        self.allocate(public)
    }

    fn context_save(&self, handle: TPM_HANDLE) -> Result<Vec<u8>, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::ContextSave);
        let public = state.object(TPM_CC::ContextSave, handle)?.toBytes()?;
        Ok(public)
    }

    fn context_load(&self, context: &[u8]) -> Result<TPM_HANDLE, TpmError> {
        self.state.borrow_mut().calls.push(TPM_CC::ContextLoad);
        let public = TPMT_PUBLIC::fromBytes(context)?;
        Ok(self.allocate(&public)?.handle)
    }

    fn verify_signature(
        &self,
        key: &ResourceContext,
        digest: &[u8],
        signature: &TPMT_SIGNATURE,
    ) -> Result<TPMT_TK_VERIFIED, TpmError> {
        let public = {
            let mut state = self.state.borrow_mut();
            state.calls.push(TPM_CC::VerifySignature);
            state.object(TPM_CC::VerifySignature, key.handle)?.clone()
        };
        if !Crypto::validate_signature(&public, digest, signature)? {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::VerifySignature, TPM_RC_POLICY_FAIL, 2)));
        }
        Ok(TPMT_TK_VERIFIED {
            tag: TPM_ST::VERIFIED,
            hierarchy: TPM_RH::OWNER.into(),
            digest: self.ticket_digest(&[digest, &key.name])?,
        })
    }

    fn nv_read(
        &self,
        auth: &ResourceContext,
        index: &ResourceContext,
        size: u16,
        offset: u16,
        auth_session: Option<&SessionContext>,
    ) -> Result<Vec<u8>, TpmError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(TPM_CC::NV_Read);
        let nv = state
            .nv
            .get(&index.handle.handle)
            .ok_or_else(|| tpm_error(TPM_CC::NV_Read, TPM_RC_HANDLE))?;
        state.check_nv_policy_auth(TPM_CC::NV_Read, nv, auth, auth_session)?;

        let (start, end) = (offset as usize, offset as usize + size as usize);
        if end > nv.data.len() {
            return Err(tpm_error(TPM_CC::NV_Read, TPM_RC_POLICY_FAIL));
        }
        Ok(nv.data[start..end].to_vec())
    }

    fn policy_get_digest(&self, session: &SessionContext) -> Result<Digest, TpmError> {
        let mut state = self.state.borrow_mut();
        Ok(state.session(TPM_CC::PolicyGetDigest, session.handle)?.session.digest().digest.clone())
    }

    fn policy_nv(
        &self,
        auth: &ResourceContext,
        index: &ResourceContext,
        session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
        auth_session: Option<&SessionContext>,
    ) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let nv = state
            .nv
            .get(&index.handle.handle)
            .ok_or_else(|| tpm_error(TPM_CC::PolicyNV, TPM_RC_HANDLE))?;
        state.check_nv_policy_auth(TPM_CC::PolicyNV, nv, auth, auth_session)?;
        let start = offset as usize;
        let end = start + operand_b.len();
        if end > nv.data.len() || !operand_matches(operation, &nv.data[start..end], operand_b) {
            return Err(tpm_error(TPM_CC::PolicyNV, TPM_RC_POLICY_FAIL));
        }
        state
            .session(TPM_CC::PolicyNV, session.handle)?
            .session
            .policy_nv(auth, index, operand_b, offset, operation, auth_session)
    }

    fn policy_secret(
        &self,
        auth_object: &ResourceContext,
        session: &SessionContext,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth_session: Option<&SessionContext>,
    ) -> Result<(Timeout, TPMT_TK_AUTH), TpmError> {
        let time = {
            let mut state = self.state.borrow_mut();
            state
                .session(TPM_CC::PolicySecret, session.handle)?
                .session
                .policy_secret(auth_object, cp_hash_a, policy_ref, expiration, auth_session)?;
            state.time
        };
        self.make_ticket(TPM_ST::AUTH_SECRET, time, expiration, cp_hash_a, policy_ref, &auth_object.name)
    }

    fn policy_signed(
        &self,
        auth_key: &ResourceContext,
        session: &SessionContext,
        include_nonce_tpm: bool,
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        auth: &TPMT_SIGNATURE,
    ) -> Result<(Timeout, TPMT_TK_AUTH), TpmError> {
        let time = {
            let mut state = self.state.borrow_mut();
            let public = state.object(TPM_CC::PolicySigned, auth_key.handle)?.clone();
            let s = state.session(TPM_CC::PolicySigned, session.handle)?;
            let nonce = if include_nonce_tpm { s.nonce.clone() } else { Vec::new() };
            let digest =
                PolicySignedAuthorization::signed_digest(auth.hash_alg(), &nonce, expiration, cp_hash_a, policy_ref)?;
            if !Crypto::validate_signature(&public, &digest, auth)? {
                return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicySigned, TPM_RC_POLICY_FAIL, 5)));
            }
            s.session
                .policy_signed(auth_key, include_nonce_tpm, cp_hash_a, policy_ref, expiration, auth)?;
            state.time
        };
        self.make_ticket(TPM_ST::AUTH_SIGNED, time, expiration, cp_hash_a, policy_ref, &auth_key.name)
    }

    fn policy_ticket(
        &self,
        session: &SessionContext,
        timeout: &[u8],
        cp_hash_a: &[u8],
        policy_ref: &[u8],
        auth_name: &[u8],
        ticket: &TPMT_TK_AUTH,
    ) -> Result<(), TpmError> {
        let expected = self.ticket_digest(&[timeout, cp_hash_a, policy_ref, auth_name])?;
        let mut state = self.state.borrow_mut();
        let time = state.time;
        let s = state.session(TPM_CC::PolicyTicket, session.handle)?;

        let Ok(expires) = <[u8; 8]>::try_from(timeout) else {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyTicket, TPM_RC_TICKET, 5)));
        };
        if time >= u64::from_be_bytes(expires) {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyTicket, TPM_RC_EXPIRED, 1)));
        }
        if ticket.digest != expected {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyTicket, TPM_RC_TICKET, 5)));
        }
        s.session
            .policy_ticket(timeout, cp_hash_a, policy_ref, auth_name, ticket)
    }

    fn policy_authorize(
        &self,
        session: &SessionContext,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &[u8],
        check_ticket: &TPMT_TK_VERIFIED,
    ) -> Result<(), TpmError> {
        let a_hash = policy_authorization_digest(name_alg(key_sign), approved_policy, policy_ref)?;
        let expected = self.ticket_digest(&[&a_hash, key_sign])?;

        let mut state = self.state.borrow_mut();
        let s = state.session(TPM_CC::PolicyAuthorize, session.handle)?;
        if s.session.digest().digest != approved_policy {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyAuthorize, TPM_RC_POLICY_FAIL, 1)));
        }
        if check_ticket.tag != TPM_ST::VERIFIED || check_ticket.digest != expected {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyAuthorize, TPM_RC_TICKET, 4)));
        }
        s.session
            .policy_authorize(approved_policy, policy_ref, key_sign, Some(check_ticket))
    }

    fn policy_auth_value(&self, session: &SessionContext) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state.session(TPM_CC::PolicyAuthValue, session.handle)?.session.policy_auth_value()
    }

    fn policy_command_code(&self, session: &SessionContext, code: TPM_CC) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        let s = state.session(TPM_CC::PolicyCommandCode, session.handle)?;
        s.session.policy_command_code(code)?;
        s.command_code = Some(code);
        state.asserted_command_codes.push(code);
        Ok(())
    }

    fn policy_counter_timer(
        &self,
        session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TPM_EO,
    ) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        let time = state.time_info().toBytes()?;
        let start = offset as usize;
        let end = start + operand_b.len();
        if end > time.len() || !operand_matches(operation, &time[start..end], operand_b) {
            return Err(tpm_error(TPM_CC::PolicyCounterTimer, TPM_RC_POLICY_FAIL));
        }
        state
            .session(TPM_CC::PolicyCounterTimer, session.handle)?
            .session
            .policy_counter_timer(operand_b, offset, operation)
    }

    fn policy_cp_hash(&self, session: &SessionContext, cp_hash_a: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state.session(TPM_CC::PolicyCpHash, session.handle)?.session.policy_cp_hash(cp_hash_a)
    }

    fn policy_name_hash(&self, session: &SessionContext, name_hash: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state.session(TPM_CC::PolicyNameHash, session.handle)?.session.policy_name_hash(name_hash)
    }

    fn policy_or(&self, session: &SessionContext, digests: &[Digest]) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        let s = state.session(TPM_CC::PolicyOR, session.handle)?;
        if !digests.contains(&s.session.digest().digest) {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyOR, TPM_RC_POLICY_FAIL, 1)));
        }
        s.session.policy_or(digests)
    }

    fn policy_pcr(&self, session: &SessionContext, pcr_digest: &[u8], pcrs: &PcrSelectionList) -> Result<(), TpmError> {
        let current = self.pcr_read(pcrs)?;
        let mut state = self.state.borrow_mut();
        let s = state.session(TPM_CC::PolicyPCR, session.handle)?;
        let alg = s.session.hash_alg();
        if compute_pcr_digest(alg, pcrs, &current)? != pcr_digest {
            return Err(TpmError::Tpm(TpmResponseError::parameter(TPM_CC::PolicyPCR, TPM_RC_POLICY_FAIL, 1)));
        }
        s.session.policy_pcr(pcr_digest, pcrs)
    }

    fn policy_duplication_select(
        &self,
        session: &SessionContext,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state
            .session(TPM_CC::PolicyDuplicationSelect, session.handle)?
            .session
            .policy_duplication_select(object_name, new_parent_name, include_object)
    }

    fn policy_password(&self, session: &SessionContext) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state.session(TPM_CC::PolicyPassword, session.handle)?.session.policy_password()
    }

    fn policy_nv_written(&self, session: &SessionContext, written_set: bool) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        state
            .session(TPM_CC::PolicyNvWritten, session.handle)?
            .session
            .policy_nv_written(written_set)
    }
}
