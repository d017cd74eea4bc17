use crate::{error::TpmError, tpm_types::*};
use hmac::{Hmac, Mac};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest as Sha2Digest, Sha256, Sha384, Sha512};
use sm3::Sm3;

pub struct Crypto;

fn hash_with<D: Sha2Digest>(data: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

fn hmac_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| TpmError::InvalidArraySize("invalid HMAC key length".to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl Crypto {
    #[allow(non_snake_case)]
    pub fn digestSize(alg: TPM_ALG_ID) -> usize {
        match alg {
            TPM_ALG_ID::SHA1 => 20,
            TPM_ALG_ID::SHA256 => 32,
            TPM_ALG_ID::SHA384 => 48,
            TPM_ALG_ID::SHA512 => 64,
            TPM_ALG_ID::SM3_256 => 32,
            _ => 0,
        }
    }

    /// Hash a byte buffer using the specified algorithm
    pub fn hash(alg: TPM_ALG_ID, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        let digest = match alg {
            TPM_ALG_ID::SHA1 => hash_with::<Sha1>(data),
            TPM_ALG_ID::SHA256 => hash_with::<Sha256>(data),
            TPM_ALG_ID::SHA384 => hash_with::<Sha384>(data),
            TPM_ALG_ID::SHA512 => hash_with::<Sha512>(data),
            TPM_ALG_ID::SM3_256 => hash_with::<Sm3>(data),
            _ => {
                return Err(TpmError::NotSupported(format!(
                    "Unsupported hash algorithm: {}",
                    alg
                )))
            }
        };

        let expected_size = Self::digestSize(alg);
        if (digest.len() != expected_size) {
            return Err(TpmError::InvalidArraySize(format!(
                "Hash output length mismatch: expected {}, got {}",
                expected_size,
                digest.len()
            )));
        }

        Ok(digest)
    }

    /// Hash the concatenation of the specified buffers
    pub fn hash_all(alg: TPM_ALG_ID, parts: &[&[u8]]) -> Result<Vec<u8>, TpmError> {
        Self::hash(alg, &parts.concat())
    }

    pub fn hmac(hash_alg: TPM_ALG_ID, key: &[u8], to_hash: &[u8]) -> Result<Vec<u8>, TpmError> {
        match hash_alg {
            TPM_ALG_ID::SHA1 => hmac_with::<Hmac<Sha1>>(key, to_hash),
            TPM_ALG_ID::SHA256 => hmac_with::<Hmac<Sha256>>(key, to_hash),
            TPM_ALG_ID::SHA384 => hmac_with::<Hmac<Sha384>>(key, to_hash),
            TPM_ALG_ID::SHA512 => hmac_with::<Hmac<Sha512>>(key, to_hash),
            TPM_ALG_ID::SM3_256 => hmac_with::<Hmac<Sm3>>(key, to_hash),
            _ => Err(TpmError::NotSupported(format!(
                "Unsupported hash algorithm: {}",
                hash_alg
            ))),
        }
    }

    fn pkcs1v15_scheme(hash_alg: TPM_ALG_ID) -> Result<Pkcs1v15Sign, TpmError> {
        match hash_alg {
            TPM_ALG_ID::SHA1 => Ok(Pkcs1v15Sign::new::<Sha1>()),
            TPM_ALG_ID::SHA256 => Ok(Pkcs1v15Sign::new::<Sha256>()),
            TPM_ALG_ID::SHA384 => Ok(Pkcs1v15Sign::new::<Sha384>()),
            TPM_ALG_ID::SHA512 => Ok(Pkcs1v15Sign::new::<Sha512>()),
            _ => Err(TpmError::NotSupported(format!(
                "RSASSA: unsupported digest algorithm {}",
                hash_alg
            ))),
        }
    }

    /// Create an RSASSA-PKCS1-v1_5 signature of a digest
    pub fn sign_rsassa(key: &RsaPrivateKey, hash_alg: TPM_ALG_ID, digest: &[u8]) -> Result<TPMT_SIGNATURE, TpmError> {
        let sig = key
            .sign(Self::pkcs1v15_scheme(hash_alg)?, digest)
            .map_err(|e| TpmError::GenericError(format!("cannot sign digest: {}", e)))?;
        Ok(TPMT_SIGNATURE::rsassa(hash_alg, sig))
    }

    /// Check a signature over a digest against an RSA public area
    pub fn validate_signature(
        public_key: &TPMT_PUBLIC,
        signed_blob_hash: &[u8],
        signature: &TPMT_SIGNATURE,
    ) -> Result<bool, TpmError> {
        let rsa_public_key = Self::rsa_public_key(public_key)?;

        let signature = if let Some(TPMU_SIGNATURE::rsassa(signature)) = &signature.signature {
            signature
        } else {
            return Err(TpmError::NotSupported(
                "ValidateSignature: Only RSASSA scheme is supported".to_string(),
            ));
        };

        Ok(rsa_public_key
            .verify(Self::pkcs1v15_scheme(signature.hash)?, signed_blob_hash, &signature.sig)
            .is_ok())
    }

    /// Extract the RSA public key from an RSA public area
    pub fn rsa_public_key(public_key: &TPMT_PUBLIC) -> Result<RsaPublicKey, TpmError> {
        let rsa_params = if let TPMU_PUBLIC_PARMS::rsaDetail(rsa_params) = &public_key.parameters {
            rsa_params
        } else {
            return Err(TpmError::NotSupported("Only RSA keys are supported".to_string()));
        };

        let modulus = if let TPMU_PUBLIC_ID::rsa(unique) = &public_key.unique {
            unique
        } else {
            return Err(TpmError::NotSupported("Only RSA public keys are supported".to_string()));
        };

        // An exponent of zero means the default exponent
        let exponent = if rsa_params.exponent == 0 { 65537 } else { rsa_params.exponent };

        RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from(exponent))
            .map_err(|_| TpmError::InvalidArraySize("Invalid RSA public key".to_string()))
    }

    /// Build the public area of an RSASSA signing key for use with TPM2_LoadExternal
    pub fn rsa_public_area(
        key: &RsaPublicKey,
        name_alg: TPM_ALG_ID,
        scheme_hash: TPM_ALG_ID,
    ) -> Result<TPMT_PUBLIC, TpmError> {
        let e = key.e().to_bytes_be();
        if e.len() > 4 {
            return Err(TpmError::NotSupported("RSA exponent is too large".to_string()));
        }
        let exponent = e.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32);
        let key_bits = u16::try_from(key.size() * 8)
            .map_err(|_| TpmError::NotSupported("RSA key is too large".to_string()))?;

        Ok(TPMT_PUBLIC {
            type_: TPM_ALG_ID::RSA,
            nameAlg: name_alg,
            objectAttributes: tpma_object::SIGN | tpma_object::USER_WITH_AUTH,
            authPolicy: Vec::new(),
            parameters: TPMU_PUBLIC_PARMS::rsaDetail(TPMS_RSA_PARMS {
                symmetric: TPMT_SYM_DEF_OBJECT::default(),
                scheme: TPMT_SCHEME { scheme: TPM_ALG_ID::RSASSA, hashAlg: scheme_hash },
                keyBits: key_bits,
                exponent: if exponent == 65537 { 0 } else { exponent },
            }),
            unique: TPMU_PUBLIC_ID::rsa(key.n().to_bytes_be()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash() {
        assert_eq!(
            hex::encode(Crypto::hash(TPM_ALG_ID::SHA256, b"foo").unwrap()),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
        // hashing nothing is not the same as a zero digest
        assert_eq!(
            hex::encode(Crypto::hash(TPM_ALG_ID::SHA1, &[]).unwrap()),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert!(Crypto::hash(TPM_ALG_ID::NULL, b"foo").is_err());
    }

    #[test]
    fn test_hmac() {
        // RFC 4231 test case 2
        let mac = Crypto::hmac(TPM_ALG_ID::SHA256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_rsassa_sign_and_validate() {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = Crypto::rsa_public_area(&key.to_public_key(), TPM_ALG_ID::SHA256, TPM_ALG_ID::SHA256).unwrap();
        assert_eq!(Crypto::rsa_public_key(&public).unwrap(), key.to_public_key());

        let digest = Crypto::hash(TPM_ALG_ID::SHA256, b"foo").unwrap();
        let sig = Crypto::sign_rsassa(&key, TPM_ALG_ID::SHA256, &digest).unwrap();
        assert!(Crypto::validate_signature(&public, &digest, &sig).unwrap());

        let other = Crypto::hash(TPM_ALG_ID::SHA256, b"bar").unwrap();
        assert!(!Crypto::validate_signature(&public, &other, &sig).unwrap());
    }
}
