//! Construction of policies, with the digests of every branch computed for a set
//! of algorithms.

use crate::error::PolicyError;
use crate::params::CpHash;
use crate::policy::*;
use crate::policy_runner::{compute_digest, RunMode};
use crate::tpm2_helpers::compute_name_hash;
use crate::tpm_types::*;

#[derive(Debug, Clone)]
enum BuilderElement {
    Element(PolicyElement),
    CpHash(CpHash),
    NameHash(Vec<Name>),
    BranchNode(Vec<PolicyBuilder>),
}

/// Builds a [`Policy`], or a branch of one.
///
/// ```ignore
/// let policy = PolicyBuilder::new()
///     .policy_command_code(TPM_CC::NV_Read)
///     .branch_node(vec![
///         PolicyBuilder::branch("owner").policy_secret(owner_name, vec![]),
///         PolicyBuilder::branch("pin").policy_auth_value(),
///     ])
///     .build(&[TPM_ALG_ID::SHA256])?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    name: String,
    elements: Vec<BuilderElement>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a branch for use with [`PolicyBuilder::branch_node`]. The name may be empty,
    /// in which case the branch can only be selected by index.
    pub fn branch(name: impl Into<String>) -> Self {
        Self { name: name.into(), elements: Vec::new() }
    }

    fn push(mut self, element: PolicyElement) -> Self {
        self.elements.push(BuilderElement::Element(element));
        self
    }

    pub fn policy_nv(self, nv_index: TPMS_NV_PUBLIC, operand_b: impl Into<Operand>, offset: u16, operation: TPM_EO) -> Self {
        self.push(PolicyElement::NV(PolicyNV { nv_index, operand_b: operand_b.into(), offset, operation }))
    }

    pub fn policy_secret(self, auth_object_name: impl Into<Name>, policy_ref: impl Into<Vec<u8>>) -> Self {
        self.push(PolicyElement::Secret(PolicySecret {
            auth_object_name: auth_object_name.into(),
            policy_ref: policy_ref.into(),
        }))
    }

    pub fn policy_signed(self, auth_key: TPMT_PUBLIC, policy_ref: impl Into<Vec<u8>>) -> Self {
        self.push(PolicyElement::Signed(PolicySigned { auth_key, policy_ref: policy_ref.into() }))
    }

    /// Defer the rest of the policy to policies approved by `key_sign`. This resets
    /// the policy digest, so it is normally the first assertion.
    pub fn policy_authorize(self, policy_ref: impl Into<Vec<u8>>, key_sign: TPMT_PUBLIC) -> Self {
        self.push(PolicyElement::Authorize(PolicyAuthorize { policy_ref: policy_ref.into(), key_sign }))
    }

    pub fn policy_auth_value(self) -> Self {
        self.push(PolicyElement::AuthValue)
    }

    pub fn policy_command_code(self, code: TPM_CC) -> Self {
        self.push(PolicyElement::CommandCode(code))
    }

    pub fn policy_counter_timer(self, operand_b: impl Into<Operand>, offset: u16, operation: TPM_EO) -> Self {
        self.push(PolicyElement::CounterTimer(PolicyCounterTimer { operand_b: operand_b.into(), offset, operation }))
    }

    /// Bind the policy to a command and its parameters. The digest is computed for
    /// each algorithm the policy is built for.
    pub fn policy_cp_hash(mut self, cp_hash: CpHash) -> Self {
        self.elements.push(BuilderElement::CpHash(cp_hash));
        self
    }

    /// Bind the policy to the names of a command's handles.
    pub fn policy_name_hash(mut self, handles: Vec<Name>) -> Self {
        self.elements.push(BuilderElement::NameHash(handles));
        self
    }

    pub fn policy_pcr(self, values: &PcrValues) -> Self {
        let values = values
            .iter()
            .flat_map(|(alg, bank)| {
                bank.iter().map(move |(pcr, digest)| PolicyPCRValue {
                    pcr: TPM_HANDLE::pcr(*pcr),
                    digest: TPMT_HA { hashAlg: *alg, digest: digest.clone() },
                })
            })
            .collect();
        self.push(PolicyElement::PCR(values))
    }

    pub fn policy_duplication_select(self, object: Option<Name>, new_parent: Name, include_object: bool) -> Self {
        self.push(PolicyElement::DuplicationSelect(PolicyDuplicationSelect {
            object: object.unwrap_or_default(),
            new_parent,
            include_object,
        }))
    }

    pub fn policy_password(self) -> Self {
        self.push(PolicyElement::Password)
    }

    pub fn policy_nv_written(self, written_set: bool) -> Self {
        self.push(PolicyElement::NvWritten(written_set))
    }

    /// Add a branch node. Exactly one of the branches must be satisfied when the
    /// policy is executed.
    pub fn branch_node(mut self, branches: Vec<PolicyBuilder>) -> Self {
        self.elements.push(BuilderElement::BranchNode(branches));
        self
    }

    fn into_elements(self, algs: &[TPM_ALG_ID]) -> Result<Vec<PolicyElement>, PolicyError> {
        let mut out = Vec::with_capacity(self.elements.len());
        for element in self.elements {
            let element = match element {
                BuilderElement::Element(element) => element,
                BuilderElement::CpHash(cp_hash) => {
                    let mut digests = Vec::new();
                    for alg in algs {
                        digests.push(TPMT_HA::new(*alg, cp_hash.digest(*alg)?)?);
                    }
                    PolicyElement::CpHash(digests)
                }
                BuilderElement::NameHash(handles) => {
                    let mut digests = Vec::new();
                    for alg in algs {
                        digests.push(TPMT_HA::new(*alg, compute_name_hash(*alg, &handles)?)?);
                    }
                    PolicyElement::NameHash(digests)
                }
                BuilderElement::BranchNode(builders) => {
                    if builders.is_empty() {
                        return Err(PolicyError::InvalidPolicy("branch node with no branches".to_string()));
                    }
                    let mut branches: Vec<PolicyBranch> = Vec::with_capacity(builders.len());
                    for builder in builders {
                        let name = PolicyBranchName::new(builder.name.clone())?;
                        if !name.is_empty() && branches.iter().any(|b| b.name == name) {
                            return Err(PolicyError::InvalidPolicy(format!("duplicate branch name \"{}\"", name)));
                        }
                        branches.push(PolicyBranch { name, digests: Vec::new(), elements: builder.into_elements(algs)? });
                    }
                    PolicyElement::BranchNode(branches)
                }
            };
            out.push(element);
        }
        Ok(out)
    }

    /// Build the policy, storing its digest and the digest of every branch for each
    /// of `algs`.
    pub fn build(self, algs: &[TPM_ALG_ID]) -> Result<Policy, PolicyError> {
        let mut policy = Policy::new(self.into_elements(algs)?);
        for alg in algs {
            let seed = TPMT_HA::zero(*alg)?;
            fill_branch_digests(&mut policy.elements, &seed)?;
            let digest = compute_digest(RunMode::Compute, &policy.elements, seed)?;
            policy.set_digest(TPMT_HA::new(*alg, digest)?);
        }
        Ok(policy)
    }
}

/// Store the digest of each branch in `elements` for the algorithm of `seed`, which
/// is the digest at the start of `elements`.
fn fill_branch_digests(elements: &mut [PolicyElement], seed: &TPMT_HA) -> Result<(), PolicyError> {
    let alg = seed.hashAlg;
    for i in 0..elements.len() {
        if !matches!(elements[i], PolicyElement::BranchNode(_)) {
            continue;
        }
        let node_seed = TPMT_HA::new(alg, compute_digest(RunMode::Compute, &elements[..i], seed.clone())?)?;

        let PolicyElement::BranchNode(branches) = &mut elements[i] else {
            continue;
        };
        for branch in branches {
            fill_branch_digests(&mut branch.elements, &node_seed)?;
            let digest = compute_digest(RunMode::Compute, &branch.elements, node_seed.clone())?;
            branch.digests.retain(|d| d.hashAlg != alg);
            branch.digests.push(TPMT_HA::new(alg, digest)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_session::{ComputePolicySession, PolicySession};
    use crate::tpm2_helpers::compute_cp_hash;

    fn command_code_digest(seed: TPMT_HA, code: TPM_CC) -> Digest {
        let mut session = ComputePolicySession::with_digest(seed).unwrap();
        session.policy_command_code(code).unwrap();
        session.digest().digest.clone()
    }

    #[test]
    fn test_build_branches() {
        let policy = PolicyBuilder::new()
            .policy_auth_value()
            .branch_node(vec![
                PolicyBuilder::branch("read").policy_command_code(TPM_CC::NV_Read),
                PolicyBuilder::branch("").policy_command_code(TPM_CC::NV_ChangeAuth),
            ])
            .build(&[TPM_ALG_ID::SHA1, TPM_ALG_ID::SHA256])
            .unwrap();

        for alg in [TPM_ALG_ID::SHA1, TPM_ALG_ID::SHA256] {
            let mut prefix = ComputePolicySession::new(alg).unwrap();
            prefix.policy_auth_value().unwrap();
            let seed = prefix.digest().clone();

            let PolicyElement::BranchNode(branches) = &policy.elements[1] else {
                panic!("expected a branch node");
            };
            let d1 = command_code_digest(seed.clone(), TPM_CC::NV_Read);
            let d2 = command_code_digest(seed.clone(), TPM_CC::NV_ChangeAuth);
            assert_eq!(branches[0].digest(alg).unwrap().digest, d1);
            assert_eq!(branches[1].digest(alg).unwrap().digest, d2);

            let mut expected = ComputePolicySession::new(alg).unwrap();
            expected.policy_or(&[d1, d2]).unwrap();
            assert_eq!(policy.digest(alg), Some(expected.digest()));
            assert_eq!(&policy.validate(alg).unwrap(), expected.digest());
        }
    }

    #[test]
    fn test_build_nested_branches() {
        let mut policy = PolicyBuilder::new()
            .branch_node(vec![
                PolicyBuilder::branch("a")
                    .policy_command_code(TPM_CC::Unseal)
                    .branch_node(vec![
                        PolicyBuilder::branch("x").policy_auth_value(),
                        PolicyBuilder::branch("y").policy_password(),
                    ]),
                PolicyBuilder::branch("b").policy_nv_written(true),
            ])
            .build(&[TPM_ALG_ID::SHA256])
            .unwrap();
        let digest = policy.validate(TPM_ALG_ID::SHA256).unwrap();
        assert_eq!(policy.digest(TPM_ALG_ID::SHA256), Some(&digest));

        // Corrupt the stored digest of a nested branch.
        let PolicyElement::BranchNode(outer) = &mut policy.elements[0] else {
            panic!("expected a branch node");
        };
        let PolicyElement::BranchNode(inner) = &mut outer[0].elements[1] else {
            panic!("expected a branch node");
        };
        inner[1].digests[0].digest[0] ^= 0xff;

        let err = policy.validate(TPM_ALG_ID::SHA256).unwrap_err();
        assert!(matches!(err.root_cause(), PolicyError::DigestMismatch { .. }));
        assert!(err.to_string().contains("a/y"), "{}", err);
    }

    #[test]
    fn test_build_cp_hash() {
        let handles = vec![TPM_HANDLE::from(TPM_RH::OWNER).get_name()];
        let policy = PolicyBuilder::new()
            .policy_cp_hash(CpHash::Command {
                command_code: TPM_CC::NV_Read,
                handles: handles.clone(),
                params: vec![0, 8, 0, 0],
            })
            .policy_name_hash(handles.clone())
            .build(&[TPM_ALG_ID::SHA1, TPM_ALG_ID::SHA256])
            .unwrap();

        let PolicyElement::CpHash(digests) = &policy.elements[0] else {
            panic!("expected a cpHash assertion");
        };
        assert_eq!(digests.len(), 2);
        assert_eq!(
            digests[1].digest,
            compute_cp_hash(TPM_ALG_ID::SHA256, TPM_CC::NV_Read, &handles, &[0, 8, 0, 0]).unwrap()
        );
        let PolicyElement::NameHash(digests) = &policy.elements[1] else {
            panic!("expected a nameHash assertion");
        };
        assert_eq!(digests[0].hashAlg, TPM_ALG_ID::SHA1);
    }

    #[test]
    fn test_build_invalid_branches() {
        let err = PolicyBuilder::new()
            .branch_node(vec![PolicyBuilder::branch("$foo").policy_auth_value()])
            .build(&[TPM_ALG_ID::SHA256]);
        assert!(err.is_err());

        let err = PolicyBuilder::new()
            .branch_node(vec![
                PolicyBuilder::branch("a").policy_auth_value(),
                PolicyBuilder::branch("a").policy_password(),
            ])
            .build(&[TPM_ALG_ID::SHA256]);
        assert!(matches!(err, Err(PolicyError::InvalidPolicy(_))));

        let err = PolicyBuilder::new().branch_node(vec![]).build(&[TPM_ALG_ID::SHA256]);
        assert!(matches!(err, Err(PolicyError::InvalidPolicy(_))));
    }
}
