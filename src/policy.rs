/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! The policy element model.
//!
//! A [`Policy`] is a sequence of [`PolicyElement`]s, one per TPM2_Policy* assertion,
//! where a [`PolicyElement::BranchNode`] holds alternative sequences of elements.
//! Each branch node is reduced to a chain of TPM2_PolicyOR assertions when the
//! policy is executed or its digest is computed.

use std::collections::BTreeMap;
use std::fmt;

use crate::auth::{policy_authorization_digest, PolicyAuthorization, SigningKey};
use crate::branch::{PolicyBranchDetails, PolicyBranchPath};
use crate::connection::{SessionContext, TpmConnection};
use crate::error::{PolicyError, TpmError};
use crate::params::{PolicyExecuteParams, PolicyTicket};
use crate::policy_runner::{self, RunMode};
use crate::resources::PolicyResourceLoader;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::{TpmEnum, TpmMarshaller};
use crate::tpm_type_extensions::is_valid_name;
use crate::tpm_types::*;

const POLICY_VERSION: u32 = 0;

/// The prefix that is reserved for branch selectors in a [`PolicyBranchPath`].
const BRANCH_SELECTOR_PREFIX: char = '$';

/// Find the digest for `alg` in a list of tagged hashes.
pub(crate) fn find_digest(list: &[TPMT_HA], alg: TPM_ALG_ID) -> Result<&Digest, PolicyError> {
    list.iter()
        .find(|ha| ha.hashAlg == alg)
        .map(|ha| &ha.digest)
        .ok_or(PolicyError::MissingDigest)
}

fn read_name(buffer: &mut TpmBuffer) -> Result<Name, TpmError> {
    let name = buffer.read_sized()?;
    if !is_valid_name(&name) {
        return Err(TpmError::GenericError(format!("invalid name {}", hex::encode(&name))));
    }
    Ok(name)
}

/// A TPM2_PolicyNV assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNV {
    pub nv_index: TPMS_NV_PUBLIC,
    pub operand_b: Operand,
    pub offset: u16,
    pub operation: TPM_EO,
}

/// A TPM2_PolicySecret assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySecret {
    pub auth_object_name: Name,
    pub policy_ref: Vec<u8>,
}

/// A TPM2_PolicySigned assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySigned {
    pub auth_key: TPMT_PUBLIC,
    pub policy_ref: Vec<u8>,
}

/// A TPM2_PolicyAuthorize assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyAuthorize {
    pub policy_ref: Vec<u8>,
    pub key_sign: TPMT_PUBLIC,
}

/// A TPM2_PolicyCounterTimer assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyCounterTimer {
    pub operand_b: Operand,
    pub offset: u16,
    pub operation: TPM_EO,
}

/// A TPM2_PolicyOR assertion. Each entry of `hash_list` holds one digest per
/// algorithm. This is only produced when a branch node is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOR {
    pub hash_list: Vec<TaggedHashList>,
}

/// The expected value of a single PCR
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyPCRValue {
    pub pcr: TPM_HANDLE,
    pub digest: TPMT_HA,
}

impl TpmMarshaller for PolicyPCRValue {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        self.pcr.toTpm(buffer)?;
        self.digest.toTpm(buffer)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self { pcr: TPM_HANDLE::fromTpm(buffer)?, digest: TPMT_HA::fromTpm(buffer)? })
    }
}

/// Convert PCR assertion values into a set of PCR values, checking that each handle is a PCR.
pub(crate) fn pcr_values(values: &[PolicyPCRValue]) -> Result<PcrValues, PolicyError> {
    let mut out = PcrValues::new();
    for value in values {
        if value.pcr.get_type() != TPM_HT::PCR {
            return Err(PolicyError::InvalidPolicy(format!("invalid PCR handle {}", value.pcr)));
        }
        let digest = TPMT_HA::new(value.digest.hashAlg, value.digest.digest.clone())?;
        out.entry(digest.hashAlg).or_default().insert(value.pcr.handle, digest.digest);
    }
    Ok(out)
}

/// A TPM2_PolicyDuplicationSelect assertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDuplicationSelect {
    pub object: Name,
    pub new_parent: Name,
    pub include_object: bool,
}

/// The name of a branch. Names starting with `$` are reserved.
#[derive(Debug, Clone, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct PolicyBranchName(String);

impl PolicyBranchName {
    pub fn new(name: impl Into<String>) -> Result<Self, TpmError> {
        let name = name.into();
        if name.starts_with(BRANCH_SELECTOR_PREFIX) {
            return Err(TpmError::GenericError(format!("invalid branch name \"{}\"", name)));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TpmMarshaller for PolicyBranchName {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_sized(self.0.as_bytes())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let name = String::from_utf8(buffer.read_sized()?)
            .map_err(|_| TpmError::GenericError("branch name is not valid UTF-8".to_string()))?;
        Self::new(name)
    }
}

impl fmt::Display for PolicyBranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One of the alternatives of a branch node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicyBranch {
    pub name: PolicyBranchName,
    /// The digest of this branch for each algorithm it was computed for.
    pub digests: TaggedHashList,
    pub elements: Vec<PolicyElement>,
}

impl PolicyBranch {
    pub fn digest(&self, alg: TPM_ALG_ID) -> Option<&TPMT_HA> {
        self.digests.iter().find(|d| d.hashAlg == alg)
    }

    /// The path component that selects this branch, which is its index if it is unnamed.
    pub fn path_component(&self, index: usize) -> String {
        if self.name.is_empty() {
            format!("$[{}]", index)
        } else {
            self.name.to_string()
        }
    }
}

impl TpmMarshaller for PolicyBranch {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        self.name.toTpm(buffer)?;
        self.digests.toTpm(buffer)?;
        self.elements.toTpm(buffer)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self {
            name: PolicyBranchName::fromTpm(buffer)?,
            digests: TaggedHashList::fromTpm(buffer)?,
            elements: Vec::<PolicyElement>::fromTpm(buffer)?,
        })
    }
}

/// A single policy assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyElement {
    NV(PolicyNV),
    Secret(PolicySecret),
    Signed(PolicySigned),
    Authorize(PolicyAuthorize),
    AuthValue,
    CommandCode(TPM_CC),
    CounterTimer(PolicyCounterTimer),
    CpHash(TaggedHashList),
    NameHash(TaggedHashList),
    OR(PolicyOR),
    PCR(Vec<PolicyPCRValue>),
    DuplicationSelect(PolicyDuplicationSelect),
    Password,
    NvWritten(bool),
    BranchNode(Vec<PolicyBranch>),
}

impl PolicyElement {
    /// The command code that tags this element in the wire format.
    pub fn command_code(&self) -> TPM_CC {
        match self {
            PolicyElement::NV(_) => TPM_CC::PolicyNV,
            PolicyElement::Secret(_) => TPM_CC::PolicySecret,
            PolicyElement::Signed(_) => TPM_CC::PolicySigned,
            PolicyElement::Authorize(_) => TPM_CC::PolicyAuthorize,
            PolicyElement::AuthValue => TPM_CC::PolicyAuthValue,
            PolicyElement::CommandCode(_) => TPM_CC::PolicyCommandCode,
            PolicyElement::CounterTimer(_) => TPM_CC::PolicyCounterTimer,
            PolicyElement::CpHash(_) => TPM_CC::PolicyCpHash,
            PolicyElement::NameHash(_) => TPM_CC::PolicyNameHash,
            PolicyElement::OR(_) | PolicyElement::BranchNode(_) => TPM_CC::PolicyOR,
            PolicyElement::PCR(_) => TPM_CC::PolicyPCR,
            PolicyElement::DuplicationSelect(_) => TPM_CC::PolicyDuplicationSelect,
            PolicyElement::Password => TPM_CC::PolicyPassword,
            PolicyElement::NvWritten(_) => TPM_CC::PolicyNvWritten,
        }
    }

    /// A human readable name, used in errors.
    pub fn name(&self) -> &'static str {
        match self {
            PolicyElement::NV(_) => "TPM2_PolicyNV assertion",
            PolicyElement::Secret(_) => "TPM2_PolicySecret assertion",
            PolicyElement::Signed(_) => "TPM2_PolicySigned assertion",
            PolicyElement::Authorize(_) => "TPM2_PolicyAuthorize assertion",
            PolicyElement::AuthValue => "TPM2_PolicyAuthValue assertion",
            PolicyElement::CommandCode(_) => "TPM2_PolicyCommandCode assertion",
            PolicyElement::CounterTimer(_) => "TPM2_PolicyCounterTimer assertion",
            PolicyElement::CpHash(_) => "TPM2_PolicyCpHash assertion",
            PolicyElement::NameHash(_) => "TPM2_PolicyNameHash assertion",
            PolicyElement::OR(_) => "TPM2_PolicyOR assertion",
            PolicyElement::PCR(_) => "TPM2_PolicyPCR assertion",
            PolicyElement::DuplicationSelect(_) => "TPM2_PolicyDuplicationSelect assertion",
            PolicyElement::Password => "TPM2_PolicyPassword assertion",
            PolicyElement::NvWritten(_) => "TPM2_PolicyNvWritten assertion",
            PolicyElement::BranchNode(_) => "branch node",
        }
    }
}

impl TpmMarshaller for PolicyElement {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        self.command_code().toTpm(buffer)?;
        match self {
            PolicyElement::NV(nv) => {
                buffer.write_sized(&nv.nv_index.toBytes()?)?;
                buffer.write_sized(&nv.operand_b)?;
                buffer.write_u16(nv.offset);
                nv.operation.toTpm(buffer)?;
            }
            PolicyElement::Secret(secret) => {
                buffer.write_sized(&secret.auth_object_name)?;
                buffer.write_sized(&secret.policy_ref)?;
            }
            PolicyElement::Signed(signed) => {
                buffer.write_sized(&signed.auth_key.toBytes()?)?;
                buffer.write_sized(&signed.policy_ref)?;
            }
            PolicyElement::Authorize(authorize) => {
                buffer.write_sized(&authorize.policy_ref)?;
                buffer.write_sized(&authorize.key_sign.toBytes()?)?;
            }
            PolicyElement::AuthValue | PolicyElement::Password => {}
            PolicyElement::CommandCode(code) => code.toTpm(buffer)?,
            PolicyElement::CounterTimer(ct) => {
                buffer.write_sized(&ct.operand_b)?;
                buffer.write_u16(ct.offset);
                ct.operation.toTpm(buffer)?;
            }
            PolicyElement::CpHash(digests) | PolicyElement::NameHash(digests) => digests.toTpm(buffer)?,
            PolicyElement::OR(_) => {
                return Err(TpmError::GenericError(
                    "TPM2_PolicyOR assertions cannot be serialized, use a branch node".to_string(),
                ))
            }
            PolicyElement::PCR(values) => values.toTpm(buffer)?,
            PolicyElement::DuplicationSelect(ds) => {
                buffer.write_sized(&ds.object)?;
                buffer.write_sized(&ds.new_parent)?;
                ds.include_object.toTpm(buffer)?;
            }
            PolicyElement::NvWritten(written) => written.toTpm(buffer)?,
            PolicyElement::BranchNode(branches) => branches.toTpm(buffer)?,
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let code = TPM_CC::try_from_trait(buffer.read_u32()? as u64)?;
        let element = match code {
            TPM_CC::PolicyNV => PolicyElement::NV(PolicyNV {
                nv_index: TPMS_NV_PUBLIC::fromBytes(&buffer.read_sized()?)?,
                operand_b: buffer.read_sized()?,
                offset: buffer.read_u16()?,
                operation: TPM_EO::try_from_trait(buffer.read_u16()? as u64)?,
            }),
            TPM_CC::PolicySecret => PolicyElement::Secret(PolicySecret {
                auth_object_name: read_name(buffer)?,
                policy_ref: buffer.read_sized()?,
            }),
            TPM_CC::PolicySigned => PolicyElement::Signed(PolicySigned {
                auth_key: TPMT_PUBLIC::fromBytes(&buffer.read_sized()?)?,
                policy_ref: buffer.read_sized()?,
            }),
            TPM_CC::PolicyAuthorize => PolicyElement::Authorize(PolicyAuthorize {
                policy_ref: buffer.read_sized()?,
                key_sign: TPMT_PUBLIC::fromBytes(&buffer.read_sized()?)?,
            }),
            TPM_CC::PolicyAuthValue => PolicyElement::AuthValue,
            TPM_CC::PolicyCommandCode => PolicyElement::CommandCode(TPM_CC::fromTpm(buffer)?),
            TPM_CC::PolicyCounterTimer => PolicyElement::CounterTimer(PolicyCounterTimer {
                operand_b: buffer.read_sized()?,
                offset: buffer.read_u16()?,
                operation: TPM_EO::try_from_trait(buffer.read_u16()? as u64)?,
            }),
            TPM_CC::PolicyCpHash => PolicyElement::CpHash(TaggedHashList::fromTpm(buffer)?),
            TPM_CC::PolicyNameHash => PolicyElement::NameHash(TaggedHashList::fromTpm(buffer)?),
            TPM_CC::PolicyOR => PolicyElement::BranchNode(Vec::<PolicyBranch>::fromTpm(buffer)?),
            TPM_CC::PolicyPCR => PolicyElement::PCR(Vec::<PolicyPCRValue>::fromTpm(buffer)?),
            TPM_CC::PolicyDuplicationSelect => PolicyElement::DuplicationSelect(PolicyDuplicationSelect {
                object: read_name(buffer)?,
                new_parent: read_name(buffer)?,
                include_object: bool::fromTpm(buffer)?,
            }),
            TPM_CC::PolicyPassword => PolicyElement::Password,
            TPM_CC::PolicyNvWritten => PolicyElement::NvWritten(bool::fromTpm(buffer)?),
            other => return Err(TpmError::InvalidUnion(other.get_value() as u64)),
        };
        Ok(element)
    }
}

/// An authorization policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Policy {
    /// The digest of this policy for each algorithm it was computed for.
    pub digests: TaggedHashList,
    /// Signatures that approve this policy for TPM2_PolicyAuthorize.
    pub authorizations: Vec<PolicyAuthorization>,
    pub elements: Vec<PolicyElement>,
}

impl Policy {
    pub fn new(elements: Vec<PolicyElement>) -> Self {
        Self { digests: Vec::new(), authorizations: Vec::new(), elements }
    }

    /// The stored digest for the specified algorithm.
    pub fn digest(&self, alg: TPM_ALG_ID) -> Option<&TPMT_HA> {
        self.digests.iter().find(|d| d.hashAlg == alg)
    }

    /// Store a digest, replacing any existing digest for the same algorithm.
    pub fn set_digest(&mut self, digest: TPMT_HA) {
        self.digests.retain(|d| d.hashAlg != digest.hashAlg);
        self.digests.push(digest);
    }

    /// Execute this policy on the supplied policy session.
    ///
    /// Branches are selected using the path in `params`, and automatically
    /// where the path doesn't specify one. Resources for TPM2_PolicyNV,
    /// TPM2_PolicySecret, TPM2_PolicySigned and TPM2_PolicyAuthorize assertions
    /// are obtained from `resources`. Paths that require them are not selected
    /// automatically if no loader is supplied.
    ///
    /// On success, returns the tickets issued during execution. Tickets supplied
    /// in `params` are not returned.
    pub fn execute<'t>(
        &self,
        tpm: &'t dyn TpmConnection,
        session: &SessionContext,
        resources: Option<&mut dyn PolicyResourceLoader<'t>>,
        params: &PolicyExecuteParams,
    ) -> Result<Vec<PolicyTicket>, PolicyError> {
        policy_runner::execute(tpm, session, resources, params, &self.elements)
    }

    /// Compute the digest of this policy for `alg`, checking it and the digest
    /// of every branch against the stored digests.
    pub fn validate(&self, alg: TPM_ALG_ID) -> Result<TaggedHash, PolicyError> {
        let digest = policy_runner::compute_digest(RunMode::Validate, &self.elements, TPMT_HA::zero(alg)?)?;
        if let Some(expected) = self.digest(alg) {
            if expected.digest != digest {
                return Err(PolicyError::DigestMismatch { computed: digest, expected: expected.digest.clone() });
            }
        }
        Ok(TPMT_HA::new(alg, digest)?)
    }

    /// Compute the digest of this policy for `alg`, without checking stored digests.
    pub fn compute_digest(&self, alg: TPM_ALG_ID) -> Result<TaggedHash, PolicyError> {
        let digest = policy_runner::compute_digest(RunMode::Compute, &self.elements, TPMT_HA::zero(alg)?)?;
        Ok(TPMT_HA::new(alg, digest)?)
    }

    /// The requirements of each path through this policy that matches `path`,
    /// keyed by the full path.
    pub fn details(&self, alg: TPM_ALG_ID, path: &str) -> Result<BTreeMap<String, PolicyBranchDetails>, PolicyError> {
        crate::branch::policy_details(alg, &self.elements, &PolicyBranchPath::new(path))
    }

    /// Sign this policy with `key` so that it can be used with TPM2_PolicyAuthorize
    /// assertions that name `auth_key` and `policy_ref`. The policy must have a
    /// stored digest for the name algorithm of `auth_key`.
    pub fn authorize(&mut self, key: &SigningKey, auth_key: &TPMT_PUBLIC, policy_ref: &[u8]) -> Result<(), PolicyError> {
        let alg = auth_key.nameAlg;
        let Some(approved) = self.digest(alg) else {
            return Err(PolicyError::MissingDigest);
        };
        let digest = policy_authorization_digest(alg, &approved.digest, policy_ref)?;
        let signature = key.sign(alg, &digest)?;

        let auth_name = auth_key.get_name()?;
        self.authorizations
            .retain(|a| !(a.policy_ref == policy_ref && a.auth_name().is_ok_and(|n| n == auth_name)));
        self.authorizations.push(PolicyAuthorization {
            auth_key: auth_key.clone(),
            policy_ref: policy_ref.to_vec(),
            signature,
        });
        Ok(())
    }
}

impl TpmMarshaller for Policy {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u32(POLICY_VERSION);
        self.digests.toTpm(buffer)?;
        self.authorizations.toTpm(buffer)?;
        self.elements.toTpm(buffer)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let version = buffer.read_u32()?;
        if version != POLICY_VERSION {
            return Err(TpmError::NotSupported(format!("policy version {}", version)));
        }
        Ok(Self {
            digests: TaggedHashList::fromTpm(buffer)?,
            authorizations: Vec::<PolicyAuthorization>::fromTpm(buffer)?,
            elements: Vec::<PolicyElement>::fromTpm(buffer)?,
        })
    }
}

fn write_indent(f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    write!(f, "{:width$}", "", width = depth)
}

fn write_digests(f: &mut fmt::Formatter<'_>, digests: &[TPMT_HA], depth: usize) -> fmt::Result {
    for d in digests {
        write_indent(f, depth)?;
        writeln!(f, "# digest {}:{:#x}", d.hashAlg, HexDigest(&d.digest))?;
    }
    Ok(())
}

struct HexDigest<'a>(&'a [u8]);

impl fmt::LowerHex for HexDigest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            f.write_str("0x")?;
        }
        f.write_str(&hex::encode(self.0))
    }
}

fn write_element(f: &mut fmt::Formatter<'_>, element: &PolicyElement, depth: usize) -> fmt::Result {
    write_indent(f, depth)?;
    match element {
        PolicyElement::NV(nv) => writeln!(
            f,
            "PolicyNV(index:{}, operandB:{:#x}, offset:{}, operation:{})",
            nv.nv_index.nvIndex,
            HexDigest(&nv.operand_b),
            nv.offset,
            nv.operation
        ),
        PolicyElement::Secret(secret) => writeln!(
            f,
            "PolicySecret(authObject:{:#x}, policyRef:{:#x})",
            HexDigest(&secret.auth_object_name),
            HexDigest(&secret.policy_ref)
        ),
        PolicyElement::Signed(signed) => writeln!(
            f,
            "PolicySigned(authKey:{:#x}, policyRef:{:#x})",
            HexDigest(&signed.auth_key.get_name().unwrap_or_default()),
            HexDigest(&signed.policy_ref)
        ),
        PolicyElement::Authorize(authorize) => writeln!(
            f,
            "PolicyAuthorize(policyRef:{:#x}, keySign:{:#x})",
            HexDigest(&authorize.policy_ref),
            HexDigest(&authorize.key_sign.get_name().unwrap_or_default())
        ),
        PolicyElement::AuthValue => writeln!(f, "PolicyAuthValue()"),
        PolicyElement::CommandCode(code) => writeln!(f, "PolicyCommandCode({})", code),
        PolicyElement::CounterTimer(ct) => writeln!(
            f,
            "PolicyCounterTimer(operandB:{:#x}, offset:{}, operation:{})",
            HexDigest(&ct.operand_b),
            ct.offset,
            ct.operation
        ),
        PolicyElement::CpHash(digests) | PolicyElement::NameHash(digests) => {
            let name = if matches!(element, PolicyElement::CpHash(_)) { "PolicyCpHash" } else { "PolicyNameHash" };
            writeln!(f, "{}(", name)?;
            write_digests(f, digests, depth + 1)?;
            write_indent(f, depth)?;
            writeln!(f, ")")
        }
        PolicyElement::OR(or) => {
            writeln!(f, "PolicyOR(")?;
            for list in &or.hash_list {
                write_digests(f, list, depth + 1)?;
            }
            write_indent(f, depth)?;
            writeln!(f, ")")
        }
        PolicyElement::PCR(values) => {
            writeln!(f, "PolicyPCR(")?;
            for value in values {
                write_indent(f, depth + 1)?;
                writeln!(
                    f,
                    "PCR{},{}: {:#x}",
                    value.pcr.handle,
                    value.digest.hashAlg,
                    HexDigest(&value.digest.digest)
                )?;
            }
            write_indent(f, depth)?;
            writeln!(f, ")")
        }
        PolicyElement::DuplicationSelect(ds) => writeln!(
            f,
            "PolicyDuplicationSelect(objectName:{:#x}, newParentName:{:#x}, includeObject:{})",
            HexDigest(&ds.object),
            HexDigest(&ds.new_parent),
            ds.include_object
        ),
        PolicyElement::Password => writeln!(f, "PolicyPassword()"),
        PolicyElement::NvWritten(written) => writeln!(f, "PolicyNvWritten({})", written),
        PolicyElement::BranchNode(branches) => {
            writeln!(f, "BranchNode {{")?;
            for (i, branch) in branches.iter().enumerate() {
                write_indent(f, depth + 1)?;
                if branch.name.is_empty() {
                    writeln!(f, "Branch {} {{", i)?;
                } else {
                    writeln!(f, "Branch {} ({}) {{", i, branch.name)?;
                }
                write_digests(f, &branch.digests, depth + 2)?;
                for element in &branch.elements {
                    write_element(f, element, depth + 2)?;
                }
                write_indent(f, depth + 1)?;
                writeln!(f, "}}")?;
            }
            write_indent(f, depth)?;
            writeln!(f, "}}")
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Policy {{")?;
        write_digests(f, &self.digests, 1)?;
        for auth in &self.authorizations {
            writeln!(
                f,
                " # auth authName:{:#x}, policyRef:{:#x}, sigAlg:{}",
                HexDigest(&auth.auth_name().unwrap_or_default()),
                HexDigest(&auth.policy_ref),
                auth.signature.sigAlg
            )?;
        }
        for element in &self.elements {
            write_element(f, element, 1)?;
        }
        write!(f, "}}")
    }
}
