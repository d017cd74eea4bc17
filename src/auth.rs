//! Signed authorizations for TPM2_PolicySigned and TPM2_PolicyAuthorize.

use rsa::RsaPrivateKey;

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::TpmMarshaller;
use crate::tpm_types::*;

/// A key used to sign authorizations.
#[derive(Clone)]
pub enum SigningKey {
    Rsa(RsaPrivateKey),
    /// An HMAC key, for authorizations verified by a loaded TPM keyed hash object.
    Hmac(Vec<u8>),
}

impl SigningKey {
    pub fn sign(&self, hash_alg: TPM_ALG_ID, digest: &[u8]) -> Result<TPMT_SIGNATURE, TpmError> {
        match self {
            SigningKey::Rsa(key) => Crypto::sign_rsassa(key, hash_alg, digest),
            SigningKey::Hmac(key) => Ok(TPMT_SIGNATURE {
                sigAlg: TPM_ALG_ID::HMAC,
                signature: Some(TPMU_SIGNATURE::hmac(TPMT_HA::new(
                    hash_alg,
                    Crypto::hmac(hash_alg, key, digest)?,
                )?)),
            }),
        }
    }

    /// Check a signature made by [`SigningKey::sign`].
    pub fn verify(&self, digest: &[u8], signature: &TPMT_SIGNATURE) -> Result<bool, TpmError> {
        match (self, &signature.signature) {
            (SigningKey::Rsa(key), _) => {
                let public = Crypto::rsa_public_area(&key.to_public_key(), TPM_ALG_ID::SHA256, signature.hash_alg())?;
                Crypto::validate_signature(&public, digest, signature)
            }
            (SigningKey::Hmac(key), Some(TPMU_SIGNATURE::hmac(ha))) => {
                Ok(Crypto::hmac(ha.hashAlg, key, digest)? == ha.digest)
            }
            (SigningKey::Hmac(_), _) => Ok(false),
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SigningKey::Rsa(_) => f.write_str("SigningKey::Rsa(..)"),
            SigningKey::Hmac(_) => f.write_str("SigningKey::Hmac(..)"),
        }
    }
}

/// A signature by `auth_key` over a policy reference and some assertion-specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyAuthorization {
    pub auth_key: TPMT_PUBLIC,
    pub policy_ref: Vec<u8>,
    pub signature: TPMT_SIGNATURE,
}

impl PolicyAuthorization {
    pub fn auth_name(&self) -> Result<Name, TpmError> {
        self.auth_key.get_name()
    }

    /// Check this authorization's signature over `digest` with its public key.
    pub fn verify(&self, digest: &[u8]) -> Result<bool, TpmError> {
        Crypto::validate_signature(&self.auth_key, digest, &self.signature)
    }
}

impl TpmMarshaller for PolicyAuthorization {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_sized(&self.auth_key.toBytes()?)?;
        buffer.write_sized(&self.policy_ref)?;
        self.signature.toTpm(buffer)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self {
            auth_key: TPMT_PUBLIC::fromBytes(&buffer.read_sized()?)?,
            policy_ref: buffer.read_sized()?,
            signature: TPMT_SIGNATURE::fromTpm(buffer)?,
        })
    }
}

/// The digest signed to approve a policy for TPM2_PolicyAuthorize:
/// H(approvedPolicy || policyRef), using the name algorithm of the signing key.
pub fn policy_authorization_digest(
    hash_alg: TPM_ALG_ID,
    approved_policy: &[u8],
    policy_ref: &[u8],
) -> Result<Digest, TpmError> {
    Crypto::hash_all(hash_alg, &[approved_policy, policy_ref])
}

/// A signed authorization for a TPM2_PolicySigned assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySignedAuthorization {
    /// The nonce of the session this authorization is bound to, or empty.
    pub nonce_tpm: Nonce,
    pub cp_hash: Digest,
    pub expiration: i32,
    pub authorization: PolicyAuthorization,
}

impl PolicySignedAuthorization {
    /// The digest signed for TPM2_PolicySigned: H(nonceTPM || expiration || cpHashA || policyRef)
    pub fn signed_digest(
        hash_alg: TPM_ALG_ID,
        nonce_tpm: &[u8],
        expiration: i32,
        cp_hash: &[u8],
        policy_ref: &[u8],
    ) -> Result<Digest, TpmError> {
        Crypto::hash_all(hash_alg, &[nonce_tpm, &expiration.to_be_bytes(), cp_hash, policy_ref])
    }

    /// Sign an authorization with `key`, whose public area is `auth_key`.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        key: &SigningKey,
        auth_key: &TPMT_PUBLIC,
        hash_alg: TPM_ALG_ID,
        nonce_tpm: &[u8],
        cp_hash: &[u8],
        policy_ref: &[u8],
        expiration: i32,
    ) -> Result<Self, TpmError> {
        let digest = Self::signed_digest(hash_alg, nonce_tpm, expiration, cp_hash, policy_ref)?;
        Ok(Self {
            nonce_tpm: nonce_tpm.to_vec(),
            cp_hash: cp_hash.to_vec(),
            expiration,
            authorization: PolicyAuthorization {
                auth_key: auth_key.clone(),
                policy_ref: policy_ref.to_vec(),
                signature: key.sign(hash_alg, &digest)?,
            },
        })
    }

    pub fn include_nonce_tpm(&self) -> bool {
        !self.nonce_tpm.is_empty()
    }

    /// Check the signature of an authorization made with an asymmetric key.
    pub fn verify(&self) -> Result<bool, TpmError> {
        let hash_alg = self.authorization.signature.hash_alg();
        let digest = Self::signed_digest(
            hash_alg,
            &self.nonce_tpm,
            self.expiration,
            &self.cp_hash,
            &self.authorization.policy_ref,
        )?;
        self.authorization.verify(&digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_key() -> (SigningKey, TPMT_PUBLIC) {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = Crypto::rsa_public_area(&key.to_public_key(), TPM_ALG_ID::SHA256, TPM_ALG_ID::SHA256).unwrap();
        (SigningKey::Rsa(key), public)
    }

    #[test]
    fn test_signed_authorization() {
        let (key, public) = rsa_key();
        let auth = PolicySignedAuthorization::sign(
            &key,
            &public,
            TPM_ALG_ID::SHA256,
            &[0x01; 16],
            &[],
            b"foo",
            -100,
        )
        .unwrap();
        assert!(auth.include_nonce_tpm());
        assert!(auth.verify().unwrap());

        let mut tampered = auth.clone();
        tampered.expiration = 100;
        assert!(!tampered.verify().unwrap());
    }

    #[test]
    fn test_hmac_signature() {
        let key = SigningKey::Hmac(b"secret".to_vec());
        let digest = Crypto::hash(TPM_ALG_ID::SHA256, b"data").unwrap();
        let sig = key.sign(TPM_ALG_ID::SHA256, &digest).unwrap();
        assert_eq!(sig.sigAlg, TPM_ALG_ID::HMAC);
        assert!(key.verify(&digest, &sig).unwrap());
        assert!(!SigningKey::Hmac(b"other".to_vec()).verify(&digest, &sig).unwrap());
    }

    #[test]
    fn test_authorization_wire_form() {
        let (key, public) = rsa_key();
        let digest = policy_authorization_digest(TPM_ALG_ID::SHA256, &[0u8; 32], b"bar").unwrap();
        let auth = PolicyAuthorization {
            auth_key: public,
            policy_ref: b"bar".to_vec(),
            signature: key.sign(TPM_ALG_ID::SHA256, &digest).unwrap(),
        };
        assert!(auth.verify(&digest).unwrap());
        assert_eq!(PolicyAuthorization::fromBytes(&auth.toBytes().unwrap()).unwrap(), auth);
    }
}
