//! A tree of TPM2_PolicyOR assertions for branch nodes with more than 8 branches.

use crate::auth_session::{ComputePolicySession, PolicySession};
use crate::error::TpmError;
use crate::tpm_types::*;

/// The maximum number of digests a single TPM2_PolicyOR assertion accepts.
pub const POLICY_OR_MAX_DIGESTS: usize = 8;

/// The maximum number of leaf digests, which keeps the tree depth at 4 or less.
pub const POLICY_OR_TREE_MAX_DIGESTS: usize = 4096;

#[derive(Debug, Clone)]
struct PolicyOrNode {
    parent: Option<usize>,
    digests: Vec<Digest>,
}

impl PolicyOrNode {
    /// The digests to pass to TPM2_PolicyOR. A node with a single digest gets it
    /// duplicated, as the TPM requires at least 2.
    fn or_digests(&self) -> Vec<Digest> {
        if self.digests.len() == 1 {
            vec![self.digests[0].clone(), self.digests[0].clone()]
        } else {
            self.digests.clone()
        }
    }
}

/// A tree of digests where each node holds up to 8 digests and is reduced to a
/// single digest in its parent with TPM2_PolicyOR.
#[derive(Debug, Clone)]
pub struct PolicyOrTree {
    alg: TPM_ALG_ID,
    nodes: Vec<PolicyOrNode>,
    len: usize,
}

impl PolicyOrTree {
    pub fn new(alg: TPM_ALG_ID, digests: &[Digest]) -> Result<Self, TpmError> {
        if digests.is_empty() {
            return Err(TpmError::InvalidArraySize("no digests".to_string()));
        }
        if digests.len() > POLICY_OR_TREE_MAX_DIGESTS {
            return Err(TpmError::InvalidArraySize("too many digests".to_string()));
        }

        let mut nodes: Vec<PolicyOrNode> = Vec::new();
        let mut level_start = 0;
        let mut current: Vec<Digest> = digests.to_vec();

        loop {
            let mut next = Vec::new();
            for chunk in current.chunks(POLICY_OR_MAX_DIGESTS) {
                let node = PolicyOrNode { parent: None, digests: chunk.to_vec() };

                let mut session = ComputePolicySession::new(alg)?;
                session.policy_or(&node.or_digests())?;
                next.push(session.digest().digest.clone());

                nodes.push(node);
            }

            let level_len = nodes.len() - level_start;
            if level_len == 1 {
                break;
            }

            let next_start = nodes.len();
            for i in 0..level_len {
                nodes[level_start + i].parent = Some(next_start + (i >> 3));
            }
            level_start = next_start;
            current = next;
        }

        Ok(Self { alg, nodes, len: digests.len() })
    }

    pub fn hash_alg(&self) -> TPM_ALG_ID {
        self.alg
    }

    /// The number of TPM2_PolicyOR assertions needed to prove membership of any leaf.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut node = &self.nodes[0];
        while let Some(parent) = node.parent {
            depth += 1;
            node = &self.nodes[parent];
        }
        depth
    }

    /// The digest lists to pass to each TPM2_PolicyOR assertion, from the leaf to the root,
    /// to prove that the session digest is the digest at the specified index.
    pub fn select_branch(&self, index: usize) -> Result<Vec<Vec<Digest>>, TpmError> {
        if index >= self.len {
            return Err(TpmError::InvalidArraySize(format!("branch index {} out of range", index)));
        }

        let mut out = Vec::new();
        let mut node = Some(index >> 3);
        while let Some(n) = node {
            out.push(self.nodes[n].or_digests());
            node = self.nodes[n].parent;
        }
        Ok(out)
    }
}
