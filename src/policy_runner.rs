//! Runs the elements of a policy against a session.
//!
//! Elements are queued as tasks. A task may queue more tasks to run immediately
//! after it, which is how a branch node or an authorized policy is descended into
//! before the remaining elements of the enclosing policy are resumed.

use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, trace};

use crate::auth::{policy_authorization_digest, PolicyAuthorization};
use crate::auth_session::{ComputePolicySession, PolicySession, TpmPolicySession};
use crate::branch::{self, authorized_policies, join_path, PathSelector, PolicyBranchCandidate, PolicyBranchPath};
use crate::connection::{nv_read_auth_handle, SessionContext, TpmConnection};
use crate::error::{PolicyError, TPM_RC_EXPIRED, TPM_RC_TICKET};
use crate::params::{PolicyAuthorizationID, PolicyExecuteParams, PolicySessionUsage, PolicyTicket};
use crate::policy::{
    find_digest, pcr_values, Policy, PolicyAuthorize, PolicyBranch, PolicyElement, PolicyNV, PolicyOR, PolicySecret,
    PolicySigned,
};
use crate::policy_or_tree::PolicyOrTree;
use crate::resources::{MockPolicyResources, NullPolicyResources, PolicyResourceLoader};
use crate::tpm2_helpers::compute_pcr_digest;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::TpmMarshaller;
use crate::tpm_type_extensions::pcr_selection_from_values;
use crate::tpm_types::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunMode {
    /// Run against a TPM policy session.
    Execute,
    /// Compute the policy digest.
    Compute,
    /// Compute the policy digest, checking it against stored branch digests.
    Validate,
}

pub(crate) type PolicyTask<'r, 't> = Box<dyn FnOnce(&mut PolicyRunner<'r, 't>) -> Result<(), PolicyError> + 'r>;

pub(crate) struct PolicyRunner<'r, 't: 'r> {
    mode: RunMode,
    tpm: Option<&'t dyn TpmConnection>,
    session: Box<dyn PolicySession + 'r>,
    resources: &'r mut (dyn PolicyResourceLoader<'t> + 'r),
    has_resources: bool,
    params: &'r PolicyExecuteParams,
    path: PolicyBranchPath,
    /// Tickets supplied by the caller that haven't been rejected.
    supplied_tickets: BTreeMap<Digest, PolicyTicket>,
    /// Tickets issued during this run.
    tickets: BTreeMap<Digest, PolicyTicket>,
    tasks: VecDeque<PolicyTask<'r, 't>>,
    next: Vec<PolicyTask<'r, 't>>,
}

fn wrap_element_error(name: &'static str, path: &str, e: PolicyError) -> PolicyError {
    let e = PolicyError::element(name, e);
    if path.is_empty() {
        e
    } else {
        PolicyError::branch(path, e)
    }
}

impl<'r, 't: 'r> PolicyRunner<'r, 't> {
    fn new(
        mode: RunMode,
        tpm: Option<&'t dyn TpmConnection>,
        session: Box<dyn PolicySession + 'r>,
        resources: &'r mut (dyn PolicyResourceLoader<'t> + 'r),
        has_resources: bool,
        params: &'r PolicyExecuteParams,
    ) -> Result<Self, PolicyError> {
        let mut supplied_tickets = BTreeMap::new();
        for ticket in params.tickets.iter().filter(|t| !t.ticket.is_null()) {
            supplied_tickets.insert(ticket.id().ticket_key()?, ticket.clone());
        }

        Ok(Self {
            mode,
            tpm,
            session,
            resources,
            has_resources,
            params,
            path: PolicyBranchPath::new(params.path.clone()),
            supplied_tickets,
            tickets: BTreeMap::new(),
            tasks: VecDeque::new(),
            next: Vec::new(),
        })
    }

    pub(crate) fn hash_alg(&self) -> TPM_ALG_ID {
        self.session.hash_alg()
    }

    pub(crate) fn tpm(&self) -> Option<&'t dyn TpmConnection> {
        self.tpm
    }

    pub(crate) fn params(&self) -> &'r PolicyExecuteParams {
        self.params
    }

    /// Whether the caller supplied a resource loader.
    pub(crate) fn has_resources(&self) -> bool {
        self.has_resources
    }

    pub(crate) fn resources(&mut self) -> &mut (dyn PolicyResourceLoader<'t> + 'r) {
        &mut *self.resources
    }

    /// The remaining explicit branch path.
    pub(crate) fn path(&self) -> &PolicyBranchPath {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: PolicyBranchPath) {
        self.path = path;
    }

    fn pop_path_component(&mut self) -> Result<PathSelector, PolicyError> {
        let (component, rest) = self.path.pop_next_component();
        self.path = rest;
        PathSelector::parse(&component)
    }

    /// Queue a task to run once the current task completes, before any task that
    /// was already queued.
    pub(crate) fn run_next(&mut self, task: PolicyTask<'r, 't>) {
        self.next.push(task);
    }

    /// Queue a batch of tasks to run once the current task completes, followed by `done`.
    pub(crate) fn run_batch(&mut self, tasks: Vec<PolicyTask<'r, 't>>, done: PolicyTask<'r, 't>) {
        self.next.extend(tasks);
        self.next.push(done);
    }

    fn run(&mut self) -> Result<(), PolicyError> {
        while let Some(task) = self.tasks.pop_front() {
            task(self)?;
            let next = std::mem::take(&mut self.next);
            for task in next.into_iter().rev() {
                self.tasks.push_front(task);
            }
        }
        Ok(())
    }

    fn run_elements(&mut self, elements: &[PolicyElement], path: &str) -> Result<(), PolicyError> {
        for element in elements {
            self.tasks.push_back(Self::element_task(element.clone(), path.to_string()));
        }
        self.run()
    }

    fn element_task(element: PolicyElement, path: String) -> PolicyTask<'r, 't> {
        Box::new(move |runner: &mut PolicyRunner<'r, 't>| {
            trace!("running {} in branch \"{}\"", element.name(), path);
            runner
                .run_element(&element, &path)
                .map_err(|e| wrap_element_error(element.name(), &path, e))
        })
    }

    fn run_element(&mut self, element: &PolicyElement, path: &str) -> Result<(), PolicyError> {
        let alg = self.hash_alg();
        match element {
            PolicyElement::NV(nv) => self.run_nv(nv),
            PolicyElement::Secret(secret) => self.run_secret(secret),
            PolicyElement::Signed(signed) => self.run_signed(signed),
            PolicyElement::Authorize(authorize) => self.run_authorize(authorize, path),
            PolicyElement::AuthValue => Ok(self.session.policy_auth_value()?),
            PolicyElement::CommandCode(code) => Ok(self.session.policy_command_code(*code)?),
            PolicyElement::CounterTimer(ct) => {
                Ok(self.session.policy_counter_timer(&ct.operand_b, ct.offset, ct.operation)?)
            }
            PolicyElement::CpHash(digests) => {
                let digest = find_digest(digests, alg)?;
                Ok(self.session.policy_cp_hash(digest)?)
            }
            PolicyElement::NameHash(digests) => {
                let digest = find_digest(digests, alg)?;
                Ok(self.session.policy_name_hash(digest)?)
            }
            PolicyElement::OR(or) => {
                let digests = or
                    .hash_list
                    .iter()
                    .map(|list| find_digest(list, alg).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.session.policy_or(&digests)?)
            }
            PolicyElement::PCR(values) => {
                let values = pcr_values(values)?;
                let pcrs = pcr_selection_from_values(&values);
                let digest = compute_pcr_digest(alg, &pcrs, &values)?;
                Ok(self.session.policy_pcr(&digest, &pcrs)?)
            }
            PolicyElement::DuplicationSelect(ds) => {
                Ok(self
                    .session
                    .policy_duplication_select(&ds.object, &ds.new_parent, ds.include_object)?)
            }
            PolicyElement::Password => Ok(self.session.policy_password()?),
            PolicyElement::NvWritten(written) => Ok(self.session.policy_nv_written(*written)?),
            PolicyElement::BranchNode(branches) => self.run_branch_node(branches.clone(), path),
        }
    }

    fn run_nv(&mut self, nv: &PolicyNV) -> Result<(), PolicyError> {
        let name = nv.nv_index.get_name()?;
        let mut index = self
            .resources
            .load_name(&name)
            .map_err(|e| PolicyError::resource("load", &name, e))?;

        let mut auth = match nv_read_auth_handle(&nv.nv_index) {
            Some(handle) => Some(
                self.resources
                    .load_handle(handle)
                    .map_err(|e| PolicyError::resource("load", &handle.get_name(), e))?,
            ),
            None => None,
        };

        let mut params = TpmBuffer::new();
        params.write_sized(&nv.operand_b)?;
        params.write_u16(nv.offset);
        nv.operation.toTpm(&mut params)?;

        let auth_context = auth.as_ref().map_or(&index.context, |a| &a.context).clone();
        let usage = PolicySessionUsage::new(
            TPM_CC::PolicyNV,
            vec![auth_context.clone(), index.context.clone()],
            params.into_bytes(),
        );

        let auth_session = match auth.as_mut() {
            Some(a) => self.resources.authorize(&mut a.context, &usage),
            None => self.resources.authorize(&mut index.context, &usage),
        }
        .map_err(|e| PolicyError::resource("authorize", &auth_context.name, e))?;

        let auth_context = auth.as_ref().map_or(&index.context, |a| &a.context);
        self.session.policy_nv(
            auth_context,
            &index.context,
            &nv.operand_b,
            nv.offset,
            nv.operation,
            auth_session.as_ref().map(|s| &s.context),
        )?;
        Ok(())
    }

    /// Redeem a ticket for the authorization, if there is one. Returns false if there
    /// is no ticket or the TPM rejected it.
    fn try_ticket(&mut self, id: &PolicyAuthorizationID) -> Result<bool, PolicyError> {
        let key = id.ticket_key()?;
        let Some(ticket) = self.tickets.get(&key).or_else(|| self.supplied_tickets.get(&key)).cloned() else {
            return Ok(false);
        };

        match self.session.policy_ticket(
            &ticket.timeout,
            &ticket.cp_hash,
            &ticket.policy_ref,
            &ticket.auth_name,
            &ticket.ticket,
        ) {
            Ok(()) => Ok(true),
            Err(e) if e.is_tpm_parameter_error(TPM_RC_EXPIRED, TPM_CC::PolicyTicket, 1) => {
                debug!("ticket for {} has expired", hex::encode(&id.auth_name));
                self.discard_ticket(&key);
                Ok(false)
            }
            Err(e) if e.is_tpm_parameter_error(TPM_RC_TICKET, TPM_CC::PolicyTicket, 5) => {
                debug!("ticket for {} is invalid", hex::encode(&id.auth_name));
                self.discard_ticket(&key);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn discard_ticket(&mut self, key: &[u8]) {
        self.tickets.remove(key);
        self.supplied_tickets.remove(key);
    }

    fn add_ticket(
        &mut self,
        id: PolicyAuthorizationID,
        cp_hash: Digest,
        timeout: Timeout,
        ticket: Option<TPMT_TK_AUTH>,
    ) -> Result<(), PolicyError> {
        let Some(ticket) = ticket.filter(|t| !t.is_null()) else {
            return Ok(());
        };
        let key = id.ticket_key()?;
        self.tickets.insert(
            key,
            PolicyTicket { auth_name: id.auth_name, policy_ref: id.policy_ref, cp_hash, timeout, ticket },
        );
        Ok(())
    }

    fn run_secret(&mut self, secret: &PolicySecret) -> Result<(), PolicyError> {
        let id = PolicyAuthorizationID::new(secret.auth_object_name.clone(), secret.policy_ref.clone());
        if self.try_ticket(&id)? {
            return Ok(());
        }

        let params = self.params.find_secret_params(&secret.auth_object_name, &secret.policy_ref);
        let cp_hash = match params.and_then(|p| p.cp_hash.as_ref()) {
            Some(cp_hash) => cp_hash.digest(self.hash_alg())?,
            None => Vec::new(),
        };
        let expiration = params.map_or(0, |p| p.expiration);

        let name = &secret.auth_object_name;
        let mut auth_object = self
            .resources
            .load_name(name)
            .map_err(|e| PolicyError::resource("load", name, e))?;

        let mut usage_params = TpmBuffer::new();
        usage_params.write_sized(&self.session.nonce_tpm())?;
        usage_params.write_sized(&cp_hash)?;
        usage_params.write_sized(&secret.policy_ref)?;
        usage_params.write_i32(expiration);
        let usage = PolicySessionUsage::new(
            TPM_CC::PolicySecret,
            vec![auth_object.context.clone()],
            usage_params.into_bytes(),
        );
        let auth_session = self
            .resources
            .authorize(&mut auth_object.context, &usage)
            .map_err(|e| PolicyError::resource("authorize", name, e))?;

        let (timeout, ticket) = self.session.policy_secret(
            &auth_object.context,
            &cp_hash,
            &secret.policy_ref,
            expiration,
            auth_session.as_ref().map(|s| &s.context),
        )?;
        self.add_ticket(id, cp_hash, timeout, ticket)
    }

    fn run_signed(&mut self, signed: &PolicySigned) -> Result<(), PolicyError> {
        let auth_key = self.resources.load_external(&signed.auth_key).map_err(|e| {
            let name = signed.auth_key.get_name().unwrap_or_default();
            PolicyError::resource("load", &name, e)
        })?;
        let auth_name = auth_key.context.name.clone();

        let id = PolicyAuthorizationID::new(auth_name.clone(), signed.policy_ref.clone());
        if self.try_ticket(&id)? {
            return Ok(());
        }

        if self.mode != RunMode::Execute {
            let null = TPMT_SIGNATURE { sigAlg: TPM_ALG_ID::NULL, signature: None };
            self.session
                .policy_signed(&auth_key.context, false, &[], &signed.policy_ref, 0, &null)?;
            return Ok(());
        }

        let Some(auth) = self.params.find_authorization(&auth_name, &signed.policy_ref) else {
            return Err(PolicyError::AuthorizationNotFound { auth_name, policy_ref: signed.policy_ref.clone() });
        };

        let (timeout, ticket) = self.session.policy_signed(
            &auth_key.context,
            auth.include_nonce_tpm(),
            &auth.cp_hash,
            &signed.policy_ref,
            auth.expiration,
            &auth.authorization.signature,
        )?;
        self.add_ticket(id, auth.cp_hash.clone(), timeout, ticket)
    }

    fn run_authorize(&mut self, authorize: &PolicyAuthorize, path: &str) -> Result<(), PolicyError> {
        if self.mode != RunMode::Execute {
            let key_name = authorize.key_sign.get_name()?;
            self.session
                .policy_authorize(&[], &authorize.policy_ref, &key_name, None)?;
            return Ok(());
        }

        let alg = self.hash_alg();
        let policies = authorized_policies(&mut *self.resources, alg, &authorize.key_sign, &authorize.policy_ref)?;
        if policies.is_empty() {
            debug!("no authorized policies for {}", hex::encode(authorize.key_sign.get_name()?));
            return Err(PolicyError::NoAppropriatePaths);
        }

        let parent = path.to_string();
        let authorize = authorize.clone();
        match self.pop_path_component()? {
            PathSelector::Index(i) => {
                let Some((name, policy)) = policies.into_iter().nth(i) else {
                    return Err(PolicyError::InvalidBranchPath(format!("authorized policy index {} out of range", i)));
                };
                self.run_authorized_policy(authorize, name, policy, &parent)
            }
            PathSelector::Name(name) => {
                let Some((name, policy)) = policies.into_iter().find(|(n, _)| *n == name) else {
                    return Err(PolicyError::InvalidBranchPath(format!("no authorized policy with digest {}", name)));
                };
                self.run_authorized_policy(authorize, name, policy, &parent)
            }
            PathSelector::Auto => {
                let candidates = policies
                    .iter()
                    .map(|(name, policy)| PolicyBranchCandidate {
                        name: name.clone(),
                        elements: Rc::from(policy.elements.clone()),
                    })
                    .collect();
                branch::select_branch(
                    self,
                    candidates,
                    Box::new(move |runner: &mut PolicyRunner<'r, 't>, i: usize| {
                        let Some((name, policy)) = policies.into_iter().nth(i) else {
                            return Err(PolicyError::NoAppropriatePaths);
                        };
                        runner.run_authorized_policy(authorize, name, policy, &parent)
                    }),
                )
            }
        }
    }

    fn run_authorized_policy(
        &mut self,
        authorize: PolicyAuthorize,
        name: String,
        policy: Policy,
        parent: &str,
    ) -> Result<(), PolicyError> {
        let alg = self.hash_alg();
        let approved = policy.digest(alg).ok_or(PolicyError::MissingDigest)?.digest.clone();
        let key_name = authorize.key_sign.get_name()?;
        let Some(authorization) = policy
            .authorizations
            .iter()
            .find(|a| a.policy_ref == authorize.policy_ref && a.auth_name().is_ok_and(|n| n == key_name))
            .cloned()
        else {
            return Err(PolicyError::AuthorizationNotFound { auth_name: key_name, policy_ref: authorize.policy_ref });
        };

        let policy_path = join_path(parent, &name);
        debug!("running authorized policy {}", policy_path);
        for element in policy.elements {
            self.run_next(Self::element_task(element, policy_path.clone()));
        }

        let parent = parent.to_string();
        self.run_next(Box::new(move |runner: &mut PolicyRunner<'r, 't>| {
            runner
                .complete_authorize(&authorize, &approved, &authorization)
                .map_err(|e| wrap_element_error("TPM2_PolicyAuthorize assertion", &parent, e))
        }));
        Ok(())
    }

    fn complete_authorize(
        &mut self,
        authorize: &PolicyAuthorize,
        approved: &[u8],
        authorization: &PolicyAuthorization,
    ) -> Result<(), PolicyError> {
        let Some(tpm) = self.tpm else {
            return Err(PolicyError::Other("TPM2_PolicyAuthorize requires a TPM".to_string()));
        };

        let key_name = authorize.key_sign.get_name()?;
        let key = self
            .resources
            .load_external(&authorize.key_sign)
            .map_err(|e| PolicyError::resource("load", &key_name, e))?;

        let digest = policy_authorization_digest(authorize.key_sign.nameAlg, approved, &authorize.policy_ref)?;
        let ticket = tpm.verify_signature(&key.context, &digest, &authorization.signature)?;
        self.session
            .policy_authorize(approved, &authorize.policy_ref, &key.context.name, Some(&ticket))?;
        Ok(())
    }

    /// Compute the digest of each branch, starting from the current session digest.
    fn branch_digests(&mut self, branches: &[PolicyBranch], path: &str) -> Result<Vec<Digest>, PolicyError> {
        let alg = self.hash_alg();
        let seed = TPMT_HA::new(alg, self.session.policy_get_digest()?)?;
        let mode = if self.mode == RunMode::Validate { RunMode::Validate } else { RunMode::Compute };

        let mut digests = Vec::with_capacity(branches.len());
        for (i, branch) in branches.iter().enumerate() {
            let branch_path = join_path(path, &branch.path_component(i));
            let digest = compute(mode, &branch.elements, seed.clone(), &branch_path)?;
            if mode == RunMode::Validate {
                if let Some(expected) = branch.digest(alg) {
                    if expected.digest != digest {
                        return Err(PolicyError::branch(
                            branch_path,
                            PolicyError::DigestMismatch { computed: digest, expected: expected.digest.clone() },
                        ));
                    }
                }
            }
            digests.push(digest);
        }
        Ok(digests)
    }

    fn run_branch_node(&mut self, branches: Vec<PolicyBranch>, path: &str) -> Result<(), PolicyError> {
        if branches.is_empty() {
            return Err(PolicyError::InvalidPolicy("branch node with no branches".to_string()));
        }

        if self.mode != RunMode::Execute {
            let digests = self.branch_digests(&branches, path)?;
            let tree = PolicyOrTree::new(self.hash_alg(), &digests)?;
            for digests in tree.select_branch(0)? {
                self.session.policy_or(&digests)?;
            }
            return Ok(());
        }

        let parent = path.to_string();
        match self.pop_path_component()? {
            PathSelector::Index(i) if i < branches.len() => self.enter_branch(branches, i, &parent),
            PathSelector::Index(i) => Err(PolicyError::InvalidBranchPath(format!("branch index {} out of range", i))),
            PathSelector::Name(name) => match branches.iter().position(|b| b.name.as_str() == name) {
                Some(i) => self.enter_branch(branches, i, &parent),
                None => Err(PolicyError::InvalidBranchPath(format!("no branch with name \"{}\"", name))),
            },
            PathSelector::Auto => {
                let candidates = branches
                    .iter()
                    .enumerate()
                    .map(|(i, b)| PolicyBranchCandidate {
                        name: b.path_component(i),
                        elements: Rc::from(b.elements.clone()),
                    })
                    .collect();
                branch::select_branch(
                    self,
                    candidates,
                    Box::new(move |runner: &mut PolicyRunner<'r, 't>, i: usize| {
                        runner.enter_branch(branches, i, &parent)
                    }),
                )
            }
        }
    }

    /// Queue the elements of the selected branch, followed by the TPM2_PolicyOR
    /// assertions that prove its digest is one of the branch node's digests.
    fn enter_branch(&mut self, branches: Vec<PolicyBranch>, index: usize, parent: &str) -> Result<(), PolicyError> {
        let alg = self.hash_alg();
        let seed = TPMT_HA::new(alg, self.session.policy_get_digest()?)?;
        let digests = branches
            .iter()
            .map(|b| compute(RunMode::Compute, &b.elements, seed.clone(), ""))
            .collect::<Result<Vec<_>, _>>()?;
        let or_digests = PolicyOrTree::new(alg, &digests)?.select_branch(index)?;

        let Some(branch) = branches.into_iter().nth(index) else {
            return Err(PolicyError::InvalidBranchPath(format!("branch index {} out of range", index)));
        };
        let branch_path = join_path(parent, &branch.path_component(index));
        debug!("entering branch {}", branch_path);

        for element in branch.elements {
            self.run_next(Self::element_task(element, branch_path.clone()));
        }
        for digests in or_digests {
            let hash_list = digests
                .into_iter()
                .map(|d| TPMT_HA::new(alg, d).map(|ha| vec![ha]))
                .collect::<Result<Vec<_>, _>>()?;
            self.run_next(Self::element_task(PolicyElement::OR(PolicyOR { hash_list }), branch_path.clone()));
        }
        Ok(())
    }

    fn into_tickets(self) -> Vec<PolicyTicket> {
        self.tickets.into_values().collect()
    }
}

/// Run `elements` against a TPM policy session, returning the tickets issued
/// during the run.
pub(crate) fn execute<'t>(
    tpm: &'t dyn TpmConnection,
    session: &SessionContext,
    resources: Option<&mut dyn PolicyResourceLoader<'t>>,
    params: &PolicyExecuteParams,
    elements: &[PolicyElement],
) -> Result<Vec<PolicyTicket>, PolicyError> {
    debug!("executing policy with session {}", session.handle);
    let mut null_resources = NullPolicyResources;
    let has_resources = resources.is_some();
    let resources: &mut dyn PolicyResourceLoader<'t> = match resources {
        Some(resources) => resources,
        None => &mut null_resources,
    };

    let mut runner = PolicyRunner::new(
        RunMode::Execute,
        Some(tpm),
        Box::new(TpmPolicySession::new(tpm, session.clone())),
        resources,
        has_resources,
        params,
    )?;
    runner.run_elements(elements, "")?;
    Ok(runner.into_tickets())
}

fn compute(mode: RunMode, elements: &[PolicyElement], seed: TPMT_HA, path: &str) -> Result<Digest, PolicyError> {
    let mut resources = MockPolicyResources;
    let params = PolicyExecuteParams::default();
    let mut runner = PolicyRunner::new(
        mode,
        None,
        Box::new(ComputePolicySession::with_digest(seed)?),
        &mut resources,
        false,
        &params,
    )?;
    runner.run_elements(elements, path)?;
    Ok(runner.session.policy_get_digest()?)
}

/// Compute the digest of `elements` starting from `seed`. In validate mode, the
/// computed digest of every branch is checked against its stored digest.
pub(crate) fn compute_digest(mode: RunMode, elements: &[PolicyElement], seed: TPMT_HA) -> Result<Digest, PolicyError> {
    compute(mode, elements, seed, "")
}
