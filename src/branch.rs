//! Branch paths, the requirements of each path through a policy, and automatic
//! selection of a path through a branch node.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::connection::nv_read_auth_handle;
use crate::error::PolicyError;
use crate::params::{PolicyAuthorizationID, PolicySessionUsage};
use crate::policy::{find_digest, pcr_values, Policy, PolicyElement};
use crate::policy_runner::{PolicyRunner, PolicyTask};
use crate::resources::PolicyResourceLoader;
use crate::tpm2_helpers::compute_pcr_digest;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::TpmMarshaller;
use crate::tpm_type_extensions::{merge_pcr_selections, pcr_selection_from_values};
use crate::tpm_types::*;

/// The path component that requests automatic selection.
pub const AUTO_SELECT: &str = "$auto";

/// Marks a path through a TPM2_PolicyAuthorize assertion with no usable authorized policies.
const UNSATISFIABLE_COMPONENT: &str = "…";

/// A `/` separated path through the branch nodes of a policy, in the order they
/// are encountered. Each component is a branch name, `$[n]` to select a branch
/// by index, or empty or `$auto` to select automatically.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyBranchPath(String);

impl PolicyBranchPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    fn from_components(components: &[String]) -> Self {
        Self(components.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim_start_matches('/').is_empty()
    }

    /// Split off the first component.
    pub fn pop_next_component(&self) -> (String, PolicyBranchPath) {
        let path = self.0.trim_start_matches('/');
        match path.split_once('/') {
            Some((component, rest)) => (component.to_string(), Self(rest.to_string())),
            None => (path.to_string(), Self::default()),
        }
    }

    pub fn components(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut path = self.clone();
        while !path.is_empty() {
            let (component, rest) = path.pop_next_component();
            out.push(component);
            path = rest;
        }
        out
    }

    /// Append `component` to this path.
    pub fn concat(&self, component: &str) -> Self {
        Self(join_path(&self.0, component))
    }
}

impl fmt::Display for PolicyBranchPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn join_path(parent: &str, component: &str) -> String {
    if parent.is_empty() {
        component.to_string()
    } else {
        format!("{}/{}", parent, component)
    }
}

/// How a single path component selects a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PathSelector {
    Auto,
    Index(usize),
    Name(String),
}

impl PathSelector {
    pub(crate) fn parse(component: &str) -> Result<Self, PolicyError> {
        if component.is_empty() || component == AUTO_SELECT {
            return Ok(PathSelector::Auto);
        }
        if let Some(index) = component.strip_prefix("$[").and_then(|c| c.strip_suffix(']')) {
            return index
                .parse::<usize>()
                .map(PathSelector::Index)
                .map_err(|_| PolicyError::InvalidBranchPath(format!("invalid index in component \"{}\"", component)));
        }
        if component.starts_with('$') || component.starts_with(UNSATISFIABLE_COMPONENT) {
            return Err(PolicyError::InvalidBranchPath(format!("invalid component \"{}\"", component)));
        }
        Ok(PathSelector::Name(component.to_string()))
    }

    fn matches(&self, name: &str, index: usize) -> bool {
        match self {
            PathSelector::Auto => true,
            PathSelector::Index(i) => *i == index,
            PathSelector::Name(n) => n == name,
        }
    }
}

/// A TPM2_PolicyNV assertion on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNVDetails {
    /// The hierarchy that authorizes reads, if the index doesn't.
    pub auth: Option<TPM_HANDLE>,
    pub public: TPMS_NV_PUBLIC,
    pub name: Name,
    pub operand_b: Operand,
    pub offset: u16,
    pub operation: TPM_EO,
}

impl PolicyNVDetails {
    fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            hex::encode(&self.name),
            hex::encode(&self.operand_b),
            self.offset,
            self.operation.0
        )
    }
}

/// A TPM2_PolicyCounterTimer assertion on a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyCounterTimerDetails {
    pub operand_b: Operand,
    pub offset: u16,
    pub operation: TPM_EO,
}

/// The requirements of a path through a policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyBranchDetails {
    pub nv: Vec<PolicyNVDetails>,
    pub secret: Vec<PolicyAuthorizationID>,
    pub signed: Vec<PolicyAuthorizationID>,
    pub authorize: Vec<PolicyAuthorizationID>,
    /// The authorization value of the resource is needed, for TPM2_PolicyAuthValue
    /// or TPM2_PolicyPassword.
    pub auth_value_needed: bool,
    pub policy_command_code: Vec<TPM_CC>,
    pub counter_timer: Vec<PolicyCounterTimerDetails>,
    pub policy_cp_hash: Vec<TaggedHashList>,
    pub policy_name_hash: Vec<TaggedHashList>,
    pub pcr: Vec<PcrValues>,
    pub nv_written: Vec<bool>,
    /// An assertion on the path couldn't be decoded.
    pub malformed: bool,
}

fn single_value<T: PartialEq + Clone>(values: impl IntoIterator<Item = T>, what: &str) -> Result<Option<T>, PolicyError> {
    let mut out: Option<T> = None;
    for v in values {
        match &out {
            Some(existing) if *existing != v => {
                return Err(PolicyError::InvalidPolicy(format!("conflicting {} assertions", what)))
            }
            _ => out = Some(v),
        }
    }
    Ok(out)
}

impl PolicyBranchDetails {
    fn add(&mut self, element: &PolicyElement) -> Result<(), PolicyError> {
        match element {
            PolicyElement::NV(nv) => self.nv.push(PolicyNVDetails {
                auth: nv_read_auth_handle(&nv.nv_index),
                public: nv.nv_index.clone(),
                name: nv.nv_index.get_name()?,
                operand_b: nv.operand_b.clone(),
                offset: nv.offset,
                operation: nv.operation,
            }),
            PolicyElement::Secret(secret) => self.secret.push(PolicyAuthorizationID::new(
                secret.auth_object_name.clone(),
                secret.policy_ref.clone(),
            )),
            PolicyElement::Signed(signed) => self
                .signed
                .push(PolicyAuthorizationID::new(signed.auth_key.get_name()?, signed.policy_ref.clone())),
            PolicyElement::Authorize(authorize) => self
                .authorize
                .push(PolicyAuthorizationID::new(authorize.key_sign.get_name()?, authorize.policy_ref.clone())),
            PolicyElement::AuthValue | PolicyElement::Password => self.auth_value_needed = true,
            PolicyElement::CommandCode(code) => self.policy_command_code.push(*code),
            PolicyElement::CounterTimer(ct) => self.counter_timer.push(PolicyCounterTimerDetails {
                operand_b: ct.operand_b.clone(),
                offset: ct.offset,
                operation: ct.operation,
            }),
            PolicyElement::CpHash(digests) => self.policy_cp_hash.push(digests.clone()),
            PolicyElement::NameHash(digests) => self.policy_name_hash.push(digests.clone()),
            PolicyElement::PCR(values) => self.pcr.push(pcr_values(values)?),
            PolicyElement::DuplicationSelect(_) => self.policy_command_code.push(TPM_CC::Duplicate),
            PolicyElement::NvWritten(written) => self.nv_written.push(*written),
            PolicyElement::OR(_) | PolicyElement::BranchNode(_) => {}
        }
        Ok(())
    }

    /// The command code this path is restricted to, if any.
    pub fn command_code(&self) -> Result<Option<TPM_CC>, PolicyError> {
        single_value(self.policy_command_code.iter().copied(), "TPM2_PolicyCommandCode")
    }

    /// The command parameter digest this path is restricted to, if any.
    pub fn cp_hash(&self, alg: TPM_ALG_ID) -> Result<Option<Digest>, PolicyError> {
        let digests = self
            .policy_cp_hash
            .iter()
            .map(|list| find_digest(list, alg).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        single_value(digests, "TPM2_PolicyCpHash")
    }

    /// The handle name digest this path is restricted to, if any.
    pub fn name_hash(&self, alg: TPM_ALG_ID) -> Result<Option<Digest>, PolicyError> {
        let digests = self
            .policy_name_hash
            .iter()
            .map(|list| find_digest(list, alg).cloned())
            .collect::<Result<Vec<_>, _>>()?;
        single_value(digests, "TPM2_PolicyNameHash")
    }

    pub fn nv_written(&self) -> Result<Option<bool>, PolicyError> {
        single_value(self.nv_written.iter().copied(), "TPM2_PolicyNvWritten")
    }

    /// Whether this path could succeed for a session with the specified algorithm.
    pub fn is_valid(&self, alg: TPM_ALG_ID) -> bool {
        !self.malformed
            && self.command_code().is_ok()
            && self.cp_hash(alg).is_ok()
            && self.name_hash(alg).is_ok()
            && self.nv_written().is_ok()
    }

    fn needs_authorization(&self) -> bool {
        self.auth_value_needed || !self.secret.is_empty() || !self.signed.is_empty()
    }
}

/// A candidate branch for automatic selection.
pub(crate) struct PolicyBranchCandidate {
    pub name: String,
    pub elements: Rc<[PolicyElement]>,
}

/// A path component: the name used in a path and the index of the branch.
type PathComponent = (String, usize);

#[derive(Clone)]
struct WalkFrame {
    components: Vec<PathComponent>,
    details: PolicyBranchDetails,
    pending: Vec<(Rc<[PolicyElement]>, usize)>,
}

struct WalkedPath {
    components: Vec<PathComponent>,
    details: PolicyBranchDetails,
}

impl WalkedPath {
    fn name(&self) -> String {
        self.components.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>().join("/")
    }
}

/// The policies approved for a TPM2_PolicyAuthorize assertion that can be used with
/// a session of the specified algorithm, named by the hex encoding of their digest.
pub(crate) fn authorized_policies<'t>(
    resources: &mut (dyn PolicyResourceLoader<'t> + '_),
    alg: TPM_ALG_ID,
    key_sign: &TPMT_PUBLIC,
    policy_ref: &[u8],
) -> Result<Vec<(String, Policy)>, PolicyError> {
    let key_name = key_sign.get_name()?;
    let policies = resources.load_authorized_policies(&key_name, policy_ref)?;
    Ok(policies
        .into_iter()
        .filter_map(|policy| {
            let digest = policy.digest(alg)?.digest.clone();
            let approved = policy
                .authorizations
                .iter()
                .any(|a| a.policy_ref == policy_ref && a.auth_name().is_ok_and(|n| n == key_name));
            approved.then(|| (hex::encode(digest), policy))
        })
        .collect())
}

/// Walk every path through the supplied roots, collecting the requirements of each.
/// Paths through TPM2_PolicyAuthorize assertions descend into the authorized
/// policies when a loader is supplied. A path whose authorized policies can't be
/// loaded is marked unsatisfiable.
fn walk<'t>(
    alg: TPM_ALG_ID,
    roots: Vec<WalkFrame>,
    mut resources: Option<&mut (dyn PolicyResourceLoader<'t> + '_)>,
) -> Vec<WalkedPath> {
    let mut stack = roots;
    stack.reverse();
    let mut out = Vec::new();

    while let Some(mut frame) = stack.pop() {
        loop {
            let Some(top) = frame.pending.last_mut() else {
                out.push(WalkedPath { components: frame.components, details: frame.details });
                break;
            };
            if top.1 >= top.0.len() {
                frame.pending.pop();
                continue;
            }
            let elements = Rc::clone(&top.0);
            let element = &elements[top.1];
            top.1 += 1;

            match element {
                PolicyElement::BranchNode(branches) => {
                    for (i, branch) in branches.iter().enumerate().rev() {
                        let mut child = frame.clone();
                        child.components.push((branch.path_component(i), i));
                        child.pending.push((Rc::from(branch.elements.clone()), 0));
                        stack.push(child);
                    }
                    break;
                }
                PolicyElement::Authorize(authorize) => {
                    if frame.details.add(element).is_err() {
                        frame.details.malformed = true;
                    }
                    let Some(resources) = resources.as_deref_mut() else {
                        continue;
                    };
                    let policies = authorized_policies(resources, alg, &authorize.key_sign, &authorize.policy_ref)
                        .unwrap_or_else(|e| {
                            debug!("cannot load authorized policies: {}", e);
                            Vec::new()
                        });
                    if policies.is_empty() {
                        frame.components.push((UNSATISFIABLE_COMPONENT.to_string(), 0));
                        continue;
                    }
                    for (i, (name, policy)) in policies.into_iter().enumerate().rev() {
                        let mut child = frame.clone();
                        child.components.push((name, i));
                        child.pending.push((Rc::from(policy.elements), 0));
                        stack.push(child);
                    }
                    break;
                }
                element => {
                    if let Err(e) = frame.details.add(element) {
                        trace!("malformed {}: {}", element.name(), e);
                        frame.details.malformed = true;
                    }
                }
            }
        }
    }

    out
}

fn path_matches(components: &[PathComponent], selectors: &[PathSelector]) -> bool {
    components
        .iter()
        .zip(selectors)
        .all(|((name, index), selector)| selector.matches(name, *index))
}

/// The requirements of every path through `elements` that matches `path`.
pub(crate) fn policy_details(
    alg: TPM_ALG_ID,
    elements: &[PolicyElement],
    path: &PolicyBranchPath,
) -> Result<BTreeMap<String, PolicyBranchDetails>, PolicyError> {
    let selectors = path
        .components()
        .iter()
        .map(|c| PathSelector::parse(c))
        .collect::<Result<Vec<_>, _>>()?;
    let root = WalkFrame {
        components: Vec::new(),
        details: PolicyBranchDetails::default(),
        pending: vec![(Rc::from(elements.to_vec()), 0)],
    };
    Ok(walk(alg, vec![root], None)
        .into_iter()
        .filter(|p| path_matches(&p.components, &selectors))
        .map(|p| (p.name(), p.details))
        .collect())
}

fn compare(a: &[u8], b: &[u8], signed: bool) -> Ordering {
    if signed {
        let a_negative = a.first().is_some_and(|x| x & 0x80 != 0);
        let b_negative = b.first().is_some_and(|x| x & 0x80 != 0);
        if a_negative != b_negative {
            return if a_negative { Ordering::Less } else { Ordering::Greater };
        }
    }
    a.cmp(b)
}

/// Evaluate `a <operation> b` as TPM2_PolicyNV and TPM2_PolicyCounterTimer do, for
/// big-endian operands of the same length.
pub(crate) fn operand_matches(operation: TPM_EO, a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    match operation {
        TPM_EO::EQ => a == b,
        TPM_EO::NEQ => a != b,
        TPM_EO::SIGNED_GT => compare(a, b, true) == Ordering::Greater,
        TPM_EO::UNSIGNED_GT => compare(a, b, false) == Ordering::Greater,
        TPM_EO::SIGNED_LT => compare(a, b, true) == Ordering::Less,
        TPM_EO::UNSIGNED_LT => compare(a, b, false) == Ordering::Less,
        TPM_EO::SIGNED_GE => compare(a, b, true) != Ordering::Less,
        TPM_EO::UNSIGNED_GE => compare(a, b, false) != Ordering::Less,
        TPM_EO::SIGNED_LE => compare(a, b, true) != Ordering::Greater,
        TPM_EO::UNSIGNED_LE => compare(a, b, false) != Ordering::Greater,
        TPM_EO::BITSET => a.iter().zip(b).all(|(x, y)| x & y == *y),
        TPM_EO::BITCLEAR => a.iter().zip(b).all(|(x, y)| x & y == 0),
        _ => false,
    }
}

fn counter_timer_matches(ct: &PolicyCounterTimerDetails, time: &[u8]) -> bool {
    let start = ct.offset as usize;
    let end = start + ct.operand_b.len();
    end <= time.len() && operand_matches(ct.operation, &time[start..end], &ct.operand_b)
}

fn pcr_values_match(alg: TPM_ALG_ID, expected: &PcrValues, current: &PcrValues) -> bool {
    let selection = pcr_selection_from_values(expected);
    match (
        compute_pcr_digest(alg, &selection, expected),
        compute_pcr_digest(alg, &selection, current),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Whether `command` could be authorized for an NV index with its policy without any
/// interaction.
fn can_auth_nv(policy: Option<&Policy>, public: &TPMS_NV_PUBLIC, command: TPM_CC) -> bool {
    if !public.attributes.contains(TPMA_NV::POLICYREAD) {
        return false;
    }
    let Some(policy) = policy else {
        return false;
    };

    let alg = public.nameAlg;
    let Ok(paths) = policy_details(alg, &policy.elements, &PolicyBranchPath::default()) else {
        return false;
    };
    paths.values().any(|d| {
        d.is_valid(alg)
            && d.nv.is_empty()
            && d.secret.is_empty()
            && d.signed.is_empty()
            && d.authorize.is_empty()
            && !d.auth_value_needed
            && matches!(d.command_code(), Ok(code) if code.map_or(true, |c| c == command))
            && d.counter_timer.is_empty()
            && d.policy_cp_hash.is_empty()
            && d.policy_name_hash.is_empty()
            && d.pcr.is_empty()
            && !matches!(d.nv_written(), Ok(Some(false)))
    })
}

/// What reading an NV index showed about a TPM2_PolicyNV assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NVAssertionResult {
    /// The assertion can't succeed.
    Fails,
    /// The index couldn't be read.
    Unknown,
    /// The assertion succeeds. `authorizable` is set if the index can also be
    /// authorized for TPM2_PolicyNV without any interaction.
    Succeeds { authorizable: bool },
}

fn read_nv<'r, 't: 'r>(runner: &mut PolicyRunner<'r, 't>, nv: &PolicyNVDetails) -> Result<NVAssertionResult, PolicyError> {
    let Some(tpm) = runner.tpm() else {
        return Ok(NVAssertionResult::Unknown);
    };

    let mut index = match runner.resources().load_name(&nv.name) {
        Ok(index) => index,
        Err(e) => {
            debug!("NV index {} is not available: {}", nv.public.nvIndex, e);
            return Ok(NVAssertionResult::Fails);
        }
    };
    let public = tpm.nv_read_public(index.context.handle)?;
    if usize::from(nv.offset) + nv.operand_b.len() > usize::from(public.dataSize) {
        return Ok(NVAssertionResult::Fails);
    }

    let policy = index.policy.clone();
    if !can_auth_nv(policy.as_ref(), &public, TPM_CC::NV_Read) {
        return Ok(NVAssertionResult::Unknown);
    }

    let size = u16::try_from(nv.operand_b.len())
        .map_err(|_| PolicyError::InvalidPolicy("NV operand too large".to_string()))?;
    let mut params = TpmBuffer::new();
    params.write_u16(size);
    params.write_u16(nv.offset);
    let usage = PolicySessionUsage::new(
        TPM_CC::NV_Read,
        vec![index.context.clone(), index.context.clone()],
        params.into_bytes(),
    )
    .with_no_auth_value();

    let session = runner.resources().authorize(&mut index.context, &usage)?;
    let data = tpm.nv_read(
        &index.context,
        &index.context,
        size,
        nv.offset,
        session.as_ref().map(|s| &s.context),
    )?;
    if !operand_matches(nv.operation, &data, &nv.operand_b) {
        return Ok(NVAssertionResult::Fails);
    }
    Ok(NVAssertionResult::Succeeds { authorizable: can_auth_nv(policy.as_ref(), &public, TPM_CC::PolicyNV) })
}

/// Read an NV index to determine whether a TPM2_PolicyNV assertion would succeed.
fn check_nv_assertion<'r, 't: 'r>(runner: &mut PolicyRunner<'r, 't>, nv: &PolicyNVDetails) -> NVAssertionResult {
    read_nv(runner, nv).unwrap_or_else(|e| {
        debug!("cannot read NV index {} for branch selection: {}", nv.public.nvIndex, e);
        NVAssertionResult::Unknown
    })
}

/// Called with the index of the selected candidate.
pub(crate) type BranchSelected<'r, 't> =
    Box<dyn FnOnce(&mut PolicyRunner<'r, 't>, usize) -> Result<(), PolicyError> + 'r>;

struct CandidatePath {
    components: Vec<PathComponent>,
    details: PolicyBranchDetails,
    nv_keys: Vec<String>,
}

fn log_candidates(stage: &str, paths: &[CandidatePath]) {
    debug!("{} candidate paths remaining after filtering on {}", paths.len(), stage);
}

/// Select one of `candidates` automatically, by walking every path through them and
/// discarding paths that can't succeed. The remaining branch path of the runner
/// restricts the paths considered. Once a path has been selected, the runner's
/// branch path is updated to follow it and `done` is called.
///
/// TPM2_PolicyNV assertions are checked by reading the NV index in a batch of tasks,
/// so `done` might not be called before this returns.
pub(crate) fn select_branch<'r, 't: 'r>(
    runner: &mut PolicyRunner<'r, 't>,
    candidates: Vec<PolicyBranchCandidate>,
    done: BranchSelected<'r, 't>,
) -> Result<(), PolicyError> {
    let alg = runner.hash_alg();
    let params = runner.params();
    let has_resources = runner.has_resources();

    let selectors = runner
        .path()
        .components()
        .iter()
        .map(|c| PathSelector::parse(c))
        .collect::<Result<Vec<_>, _>>()?;

    let roots = candidates
        .into_iter()
        .enumerate()
        .map(|(i, c)| WalkFrame {
            components: vec![(c.name, i)],
            details: PolicyBranchDetails::default(),
            pending: vec![(c.elements, 0)],
        })
        .collect();
    let walked = walk(alg, roots, if has_resources { Some(runner.resources()) } else { None });

    let mut paths: Vec<CandidatePath> = walked
        .into_iter()
        .filter(|p| path_matches(&p.components[1..], &selectors))
        .map(|p| CandidatePath { components: p.components, details: p.details, nv_keys: Vec::new() })
        .collect();
    log_candidates("explicit path", &paths);

    paths.retain(|p| p.details.is_valid(alg));
    log_candidates("validity", &paths);

    if !has_resources {
        paths.retain(|p| {
            p.details.nv.is_empty()
                && p.details.secret.is_empty()
                && p.details.signed.is_empty()
                && p.details.authorize.is_empty()
        });
        log_candidates("resources", &paths);
    }

    paths.retain(|p| !p.components.iter().any(|(c, _)| c == UNSATISFIABLE_COMPONENT));
    log_candidates("authorized policies", &paths);

    paths.retain(|p| {
        let ignored_auth = p
            .details
            .secret
            .iter()
            .chain(&p.details.signed)
            .chain(&p.details.authorize)
            .any(|id| params.ignore_authorizations.contains(id));
        let ignored_nv = p.details.nv.iter().any(|nv| params.ignore_nv.contains(&nv.name));
        !ignored_auth && !ignored_nv
    });
    log_candidates("ignore lists", &paths);

    if let Some(usage) = &params.usage {
        let cp_hash = usage.cp_hash(alg)?;
        let name_hash = usage.name_hash(alg)?;
        let written = match (runner.tpm(), usage.auth_handle()) {
            (Some(tpm), Some(auth))
                if auth.handle.get_type() == TPM_HT::NV_INDEX
                    && paths.iter().any(|p| !p.details.nv_written.is_empty()) =>
            {
                Some(tpm.nv_read_public(auth.handle)?.is_written())
            }
            _ => None,
        };

        paths.retain(|p| {
            let d = &p.details;
            if matches!(d.command_code(), Ok(Some(code)) if code != usage.command_code) {
                return false;
            }
            if matches!(d.cp_hash(alg), Ok(Some(digest)) if digest != cp_hash) {
                return false;
            }
            if matches!(d.name_hash(alg), Ok(Some(digest)) if digest != name_hash) {
                return false;
            }
            if usage.no_auth_value && d.auth_value_needed {
                return false;
            }
            !matches!((d.nv_written(), written), (Ok(Some(expected)), Some(actual)) if expected != actual)
        });
        log_candidates("usage", &paths);
    }

    if let Some(tpm) = runner.tpm() {
        if paths.iter().any(|p| !p.details.pcr.is_empty()) {
            let selections: Vec<PcrSelectionList> = paths
                .iter()
                .flat_map(|p| p.details.pcr.iter().map(pcr_selection_from_values))
                .collect();
            let current = tpm.pcr_read(&merge_pcr_selections(&selections))?;
            paths.retain(|p| p.details.pcr.iter().all(|values| pcr_values_match(alg, values, &current)));
            log_candidates("PCR values", &paths);
        }

        if paths.iter().any(|p| !p.details.counter_timer.is_empty()) {
            let time = tpm.read_clock()?.toBytes()?;
            paths.retain(|p| p.details.counter_timer.iter().all(|ct| counter_timer_matches(ct, &time)));
            log_candidates("counter and timer values", &paths);
        }
    }

    let mut assertions: BTreeMap<String, PolicyNVDetails> = BTreeMap::new();
    for path in &mut paths {
        for nv in &path.details.nv {
            let key = nv.key();
            path.nv_keys.push(key.clone());
            assertions.entry(key).or_insert_with(|| nv.clone());
        }
    }

    if assertions.is_empty() || runner.tpm().is_none() {
        return finish_selection(runner, paths, &BTreeMap::new(), done);
    }

    let results: Rc<RefCell<BTreeMap<String, NVAssertionResult>>> = Rc::default();
    let tasks: Vec<PolicyTask<'r, 't>> = assertions
        .into_iter()
        .map(|(key, nv)| {
            let results = Rc::clone(&results);
            Box::new(move |runner: &mut PolicyRunner<'r, 't>| {
                let result = check_nv_assertion(runner, &nv);
                trace!("NV assertion {}: {:?}", key, result);
                results.borrow_mut().insert(key, result);
                Ok(())
            }) as PolicyTask<'r, 't>
        })
        .collect();

    runner.run_batch(
        tasks,
        Box::new(move |runner: &mut PolicyRunner<'r, 't>| {
            let results = results.take();
            finish_selection(runner, paths, &results, done)
        }),
    );
    Ok(())
}

fn finish_selection<'r, 't: 'r>(
    runner: &mut PolicyRunner<'r, 't>,
    mut paths: Vec<CandidatePath>,
    nv_results: &BTreeMap<String, NVAssertionResult>,
    done: BranchSelected<'r, 't>,
) -> Result<(), PolicyError> {
    let nv_result = |key: &String| nv_results.get(key).copied().unwrap_or(NVAssertionResult::Unknown);

    paths.retain(|p| p.nv_keys.iter().all(|k| nv_result(k) != NVAssertionResult::Fails));
    log_candidates("NV contents", &paths);

    // Prefer a path that needs no authorization and whose TPM2_PolicyNV assertions
    // are known to succeed with an index that can be authorized non-interactively.
    let preferred = paths.iter().position(|p| {
        !p.details.needs_authorization()
            && p
                .nv_keys
                .iter()
                .all(|k| nv_result(k) == NVAssertionResult::Succeeds { authorizable: true })
    });
    let chosen = match preferred {
        Some(i) => i,
        None if !paths.is_empty() => 0,
        None => return Err(PolicyError::NoAppropriatePaths),
    };
    let path = paths.swap_remove(chosen);
    debug!(
        "selected path {}",
        path.components.iter().map(|(c, _)| c.as_str()).collect::<Vec<_>>().join("/")
    );

    // Follow the selected path through nested branch nodes, then whatever the
    // caller specified beyond it.
    let mut components: Vec<String> = path.components[1..].iter().map(|(c, _)| c.clone()).collect();
    let depth = components.len();
    components.extend(runner.path().components().into_iter().skip(depth));
    runner.set_path(PolicyBranchPath::from_components(&components));

    done(runner, path.components[0].1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyBranch, PolicyBranchName, PolicyCounterTimer, PolicyNV, PolicySecret};

    #[test]
    fn test_path_components() {
        let path = PolicyBranchPath::new("/foo/$[1]//bar");
        let (first, rest) = path.pop_next_component();
        assert_eq!(first, "foo");
        assert_eq!(rest.as_str(), "$[1]//bar");
        assert_eq!(path.components(), vec!["foo", "$[1]", "", "bar"]);
        assert!(PolicyBranchPath::default().is_empty());
        assert_eq!(PolicyBranchPath::default().concat("a").concat("b").as_str(), "a/b");
    }

    #[test]
    fn test_path_selectors() {
        assert_eq!(PathSelector::parse("").unwrap(), PathSelector::Auto);
        assert_eq!(PathSelector::parse("$auto").unwrap(), PathSelector::Auto);
        assert_eq!(PathSelector::parse("$[12]").unwrap(), PathSelector::Index(12));
        assert_eq!(PathSelector::parse("foo").unwrap(), PathSelector::Name("foo".to_string()));
        assert!(PathSelector::parse("$[x]").is_err());
        assert!(PathSelector::parse("$foo").is_err());
        assert!(PathSelector::parse("…").is_err());
    }

    #[test]
    fn test_operand_matches() {
        assert!(operand_matches(TPM_EO::EQ, &[1, 2], &[1, 2]));
        assert!(operand_matches(TPM_EO::NEQ, &[1, 2], &[1, 3]));
        assert!(!operand_matches(TPM_EO::EQ, &[1, 2], &[1, 2, 3]));

        // 0xff80 is negative when signed
        assert!(operand_matches(TPM_EO::UNSIGNED_GT, &[0xff, 0x80], &[0x00, 0x01]));
        assert!(operand_matches(TPM_EO::SIGNED_LT, &[0xff, 0x80], &[0x00, 0x01]));
        assert!(operand_matches(TPM_EO::SIGNED_GT, &[0xff, 0x80], &[0xff, 0x00]));
        assert!(operand_matches(TPM_EO::SIGNED_GE, &[0x00, 0x01], &[0x00, 0x01]));
        assert!(operand_matches(TPM_EO::UNSIGNED_LE, &[0x00, 0x01], &[0x00, 0x02]));

        assert!(operand_matches(TPM_EO::BITSET, &[0b1110], &[0b0110]));
        assert!(!operand_matches(TPM_EO::BITSET, &[0b1010], &[0b0110]));
        assert!(operand_matches(TPM_EO::BITCLEAR, &[0b1001], &[0b0110]));
        assert!(!operand_matches(TPM_EO::BITCLEAR, &[0b1011], &[0b0110]));
    }

    fn nv_public() -> TPMS_NV_PUBLIC {
        TPMS_NV_PUBLIC {
            nvIndex: TPM_HANDLE::new(0x01800000),
            nameAlg: TPM_ALG_ID::SHA256,
            attributes: TPMA_NV::OWNERREAD | TPMA_NV::AUTHWRITE,
            authPolicy: Vec::new(),
            dataSize: 8,
        }
    }

    fn branch(name: &str, elements: Vec<PolicyElement>) -> PolicyBranch {
        PolicyBranch { name: PolicyBranchName::new(name).unwrap(), digests: vec![], elements }
    }

    #[test]
    fn test_policy_details() {
        let owner = TPM_HANDLE::from(TPM_RH::OWNER).get_name();
        let elements = vec![
            PolicyElement::CommandCode(TPM_CC::NV_Read),
            PolicyElement::BranchNode(vec![
                branch(
                    "nv",
                    vec![PolicyElement::NV(PolicyNV {
                        nv_index: nv_public(),
                        operand_b: vec![1],
                        offset: 0,
                        operation: TPM_EO::EQ,
                    })],
                ),
                branch(
                    "",
                    vec![
                        PolicyElement::AuthValue,
                        PolicyElement::BranchNode(vec![
                            branch("a", vec![PolicyElement::NvWritten(true)]),
                            branch(
                                "b",
                                vec![PolicyElement::Secret(PolicySecret {
                                    auth_object_name: owner.clone(),
                                    policy_ref: vec![],
                                })],
                            ),
                        ]),
                    ],
                ),
            ]),
        ];

        let details = policy_details(TPM_ALG_ID::SHA256, &elements, &PolicyBranchPath::default()).unwrap();
        assert_eq!(details.keys().collect::<Vec<_>>(), vec!["$[1]/a", "$[1]/b", "nv"]);

        let nv = &details["nv"];
        assert_eq!(nv.nv.len(), 1);
        assert_eq!(nv.nv[0].auth, Some(TPM_RH::OWNER.into()));
        assert_eq!(nv.command_code().unwrap(), Some(TPM_CC::NV_Read));
        assert!(!nv.auth_value_needed);

        let b = &details["$[1]/b"];
        assert!(b.auth_value_needed);
        assert_eq!(b.secret, vec![PolicyAuthorizationID::new(owner, vec![])]);
        assert_eq!(details["$[1]/a"].nv_written().unwrap(), Some(true));

        let filtered = policy_details(TPM_ALG_ID::SHA256, &elements, &PolicyBranchPath::new("$[1]/b")).unwrap();
        assert_eq!(filtered.keys().collect::<Vec<_>>(), vec!["$[1]/b"]);
    }

    #[test]
    fn test_conflicting_details() {
        let mut details = PolicyBranchDetails::default();
        details.add(&PolicyElement::CommandCode(TPM_CC::Unseal)).unwrap();
        details.add(&PolicyElement::CommandCode(TPM_CC::Unseal)).unwrap();
        assert!(details.is_valid(TPM_ALG_ID::SHA256));
        details.add(&PolicyElement::CommandCode(TPM_CC::NV_Read)).unwrap();
        assert!(!details.is_valid(TPM_ALG_ID::SHA256));

        let mut details = PolicyBranchDetails::default();
        details
            .add(&PolicyElement::CpHash(vec![TPMT_HA::zero(TPM_ALG_ID::SHA1).unwrap()]))
            .unwrap();
        assert!(details.is_valid(TPM_ALG_ID::SHA1));
        assert!(!details.is_valid(TPM_ALG_ID::SHA256));
    }

    #[test]
    fn test_counter_timer_matches() {
        let time = TPMS_TIME_INFO { time: 1000, ..Default::default() }.toBytes().unwrap();
        let ct = PolicyCounterTimerDetails {
            operand_b: 500u64.to_be_bytes().to_vec(),
            offset: 0,
            operation: TPM_EO::UNSIGNED_GT,
        };
        assert!(counter_timer_matches(&ct, &time));
        let ct = PolicyCounterTimerDetails { offset: 20, ..ct };
        assert!(!counter_timer_matches(&ct, &time));
    }

    #[test]
    fn test_can_auth_nv() {
        let public = TPMS_NV_PUBLIC {
            attributes: TPMA_NV::POLICYREAD | TPMA_NV::AUTHWRITE | TPMA_NV::WRITTEN,
            ..nv_public()
        };

        let read = Policy::new(vec![PolicyElement::CommandCode(TPM_CC::NV_Read)]);
        assert!(can_auth_nv(Some(&read), &public, TPM_CC::NV_Read));
        assert!(!can_auth_nv(Some(&read), &public, TPM_CC::PolicyNV));

        let any = Policy::new(vec![PolicyElement::NvWritten(true)]);
        assert!(can_auth_nv(Some(&any), &public, TPM_CC::NV_Read));
        assert!(can_auth_nv(Some(&any), &public, TPM_CC::PolicyNV));
        assert!(!can_auth_nv(None, &public, TPM_CC::NV_Read));
        assert!(!can_auth_nv(Some(&any), &nv_public(), TPM_CC::NV_Read));

        let zero = vec![TPMT_HA::zero(TPM_ALG_ID::SHA256).unwrap()];
        let interactive = [
            PolicyElement::AuthValue,
            PolicyElement::Password,
            PolicyElement::NvWritten(false),
            PolicyElement::CpHash(zero.clone()),
            PolicyElement::NameHash(zero),
            PolicyElement::CounterTimer(PolicyCounterTimer {
                operand_b: vec![0; 8],
                offset: 0,
                operation: TPM_EO::UNSIGNED_GE,
            }),
            PolicyElement::NV(PolicyNV { nv_index: nv_public(), operand_b: vec![1], offset: 0, operation: TPM_EO::EQ }),
            PolicyElement::Secret(PolicySecret {
                auth_object_name: TPM_HANDLE::from(TPM_RH::OWNER).get_name(),
                policy_ref: vec![],
            }),
        ];
        for element in interactive {
            let policy = Policy::new(vec![element]);
            assert!(!can_auth_nv(Some(&policy), &public, TPM_CC::NV_Read));
        }

        // One usable path is enough.
        let branches = Policy::new(vec![PolicyElement::BranchNode(vec![
            branch("auth", vec![PolicyElement::AuthValue]),
            branch("nv", vec![PolicyElement::CommandCode(TPM_CC::PolicyNV)]),
        ])]);
        assert!(can_auth_nv(Some(&branches), &public, TPM_CC::PolicyNV));
        assert!(!can_auth_nv(Some(&branches), &public, TPM_CC::NV_Read));
    }
}
