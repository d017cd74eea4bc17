/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

//! TPM 2.0 constants and structures used by authorization policies.

use std::any::TypeId;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitAnd, BitOr};

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm2_helpers::enum_to_str;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::{TpmEnum, TpmMarshaller};

pub type Digest = Vec<u8>;
pub type Name = Vec<u8>;
pub type Nonce = Vec<u8>;
pub type Operand = Vec<u8>;
pub type Timeout = Vec<u8>;

/// PCR values, indexed by bank and then by PCR index
pub type PcrValues = BTreeMap<TPM_ALG_ID, BTreeMap<u32, Digest>>;

macro_rules! tpm_enum {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($variant:ident = $value:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $variant: Self = Self($value);)*

            pub(crate) const VARIANTS: &'static [(&'static str, u64)] = &[$((stringify!($variant), $value as u64)),*];
        }

        impl TpmEnum<$repr> for $name {
            fn get_value(&self) -> $repr {
                self.0
            }

            fn try_from_trait(value: u64) -> Result<Self, TpmError> {
                if Self::VARIANTS.iter().any(|(_, v)| *v == value) {
                    Self::new_from_trait(value)
                } else {
                    Err(TpmError::InvalidEnumValue(value))
                }
            }

            fn new_from_trait(value: u64) -> Result<Self, TpmError> {
                <$repr>::try_from(value)
                    .map(Self)
                    .map_err(|_| TpmError::InvalidEnumValue(value))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = enum_to_str(self.0 as u64, TypeId::of::<$name>());
                if s.is_empty() {
                    write!(f, "{:#x}", self.0)
                } else {
                    f.write_str(&s)
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

tpm_enum! {
    /// Algorithm identifiers
    TPM_ALG_ID(u16) {
        ERROR = 0x0000,
        RSA = 0x0001,
        SHA1 = 0x0004,
        HMAC = 0x0005,
        AES = 0x0006,
        KEYEDHASH = 0x0008,
        XOR = 0x000A,
        SHA256 = 0x000B,
        SHA384 = 0x000C,
        SHA512 = 0x000D,
        NULL = 0x0010,
        SM3_256 = 0x0012,
        RSASSA = 0x0014,
        RSAPSS = 0x0016,
        ECDSA = 0x0018,
        ECC = 0x0023,
        SYMCIPHER = 0x0025,
        CFB = 0x0043,
    }
}

impl TPM_ALG_ID {
    /// Whether this is a hash algorithm known to this library.
    pub fn is_hash(&self) -> bool {
        Crypto::digestSize(*self) > 0
    }

    /// Digest size of a hash algorithm, or 0 for anything else.
    pub fn size(&self) -> usize {
        Crypto::digestSize(*self)
    }
}

tpm_enum! {
    /// Command codes
    TPM_CC(u32) {
        NV_UndefineSpaceSpecial = 0x0000011F,
        EvictControl = 0x00000120,
        NV_UndefineSpace = 0x00000122,
        Clear = 0x00000126,
        HierarchyChangeAuth = 0x00000129,
        NV_DefineSpace = 0x0000012A,
        CreatePrimary = 0x00000131,
        NV_Increment = 0x00000134,
        NV_SetBits = 0x00000135,
        NV_Extend = 0x00000136,
        NV_Write = 0x00000137,
        NV_WriteLock = 0x00000138,
        NV_ChangeAuth = 0x0000013B,
        PCR_Event = 0x0000013C,
        PCR_Reset = 0x0000013D,
        ActivateCredential = 0x00000147,
        Certify = 0x00000148,
        PolicyNV = 0x00000149,
        Duplicate = 0x0000014B,
        NV_Read = 0x0000014E,
        NV_ReadLock = 0x0000014F,
        ObjectChangeAuth = 0x00000150,
        PolicySecret = 0x00000151,
        Create = 0x00000153,
        HMAC = 0x00000155,
        Import = 0x00000156,
        Load = 0x00000157,
        Quote = 0x00000158,
        RSA_Decrypt = 0x00000159,
        Sign = 0x0000015D,
        Unseal = 0x0000015E,
        PolicySigned = 0x00000160,
        ContextLoad = 0x00000161,
        ContextSave = 0x00000162,
        FlushContext = 0x00000165,
        LoadExternal = 0x00000167,
        NV_ReadPublic = 0x00000169,
        PolicyAuthorize = 0x0000016A,
        PolicyAuthValue = 0x0000016B,
        PolicyCommandCode = 0x0000016C,
        PolicyCounterTimer = 0x0000016D,
        PolicyCpHash = 0x0000016E,
        PolicyLocality = 0x0000016F,
        PolicyNameHash = 0x00000170,
        PolicyOR = 0x00000171,
        PolicyTicket = 0x00000172,
        ReadPublic = 0x00000173,
        StartAuthSession = 0x00000176,
        VerifySignature = 0x00000177,
        GetCapability = 0x0000017A,
        PCR_Read = 0x0000017E,
        PolicyPCR = 0x0000017F,
        PolicyRestart = 0x00000180,
        ReadClock = 0x00000181,
        PCR_Extend = 0x00000182,
        PolicyDuplicationSelect = 0x00000188,
        PolicyGetDigest = 0x00000189,
        PolicyPassword = 0x0000018C,
        PolicyNvWritten = 0x0000018F,
    }
}

tpm_enum! {
    /// Structure tags
    TPM_ST(u16) {
        NULL = 0x8000,
        VERIFIED = 0x8022,
        AUTH_SECRET = 0x8023,
        HASHCHECK = 0x8024,
        AUTH_SIGNED = 0x8025,
    }
}

tpm_enum! {
    /// Session types
    TPM_SE(u8) {
        HMAC = 0x00,
        POLICY = 0x01,
        TRIAL = 0x03,
    }
}

tpm_enum! {
    /// Arithmetic operations used by TPM2_PolicyNV and TPM2_PolicyCounterTimer
    TPM_EO(u16) {
        EQ = 0x0000,
        NEQ = 0x0001,
        SIGNED_GT = 0x0002,
        UNSIGNED_GT = 0x0003,
        SIGNED_LT = 0x0004,
        UNSIGNED_LT = 0x0005,
        SIGNED_GE = 0x0006,
        UNSIGNED_GE = 0x0007,
        SIGNED_LE = 0x0008,
        UNSIGNED_LE = 0x0009,
        BITSET = 0x000A,
        BITCLEAR = 0x000B,
    }
}

tpm_enum! {
    /// Handle types (the most significant octet of a handle)
    TPM_HT(u8) {
        PCR = 0x00,
        NV_INDEX = 0x01,
        HMAC_SESSION = 0x02,
        POLICY_SESSION = 0x03,
        PERMANENT = 0x40,
        TRANSIENT = 0x80,
        PERSISTENT = 0x81,
    }
}

tpm_enum! {
    /// Permanent handles
    TPM_RH(u32) {
        OWNER = 0x40000001,
        NULL = 0x40000007,
        PW = 0x40000009,
        LOCKOUT = 0x4000000A,
        ENDORSEMENT = 0x4000000B,
        PLATFORM = 0x4000000C,
    }
}

tpm_enum! {
    /// ECC curves
    TPM_ECC_CURVE(u16) {
        NONE = 0x0000,
        NIST_P256 = 0x0003,
        NIST_P384 = 0x0004,
        NIST_P521 = 0x0005,
    }
}

tpm_enum! {
    /// NV index attributes
    TPMA_NV(u32) {
        PPWRITE = 0x00000001_u32,
        OWNERWRITE = 0x00000002_u32,
        AUTHWRITE = 0x00000004_u32,
        POLICYWRITE = 0x00000008_u32,
        POLICY_DELETE = 0x00000400_u32,
        WRITELOCKED = 0x00000800_u32,
        WRITEALL = 0x00001000_u32,
        WRITEDEFINE = 0x00002000_u32,
        WRITE_STCLEAR = 0x00004000_u32,
        GLOBALLOCK = 0x00008000_u32,
        PPREAD = 0x00010000_u32,
        OWNERREAD = 0x00020000_u32,
        AUTHREAD = 0x00040000_u32,
        POLICYREAD = 0x00080000_u32,
        NO_DA = 0x02000000_u32,
        ORDERLY = 0x04000000_u32,
        CLEAR_STCLEAR = 0x08000000_u32,
        READLOCKED = 0x10000000_u32,
        WRITTEN = 0x20000000_u32,
        PLATFORMCREATE = 0x40000000_u32,
        READ_STCLEAR = 0x80000000_u32,
    }
}

impl TPMA_NV {
    pub fn contains(&self, other: TPMA_NV) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for TPMA_NV {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for TPMA_NV {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

/// A TPM handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TPM_HANDLE {
    pub handle: u32,
}

impl TPM_HANDLE {
    pub const fn new(handle: u32) -> Self {
        Self { handle }
    }

    /// Handle of the PCR with the specified index
    pub const fn pcr(index: u32) -> Self {
        Self::new(index)
    }

    pub fn get_type(&self) -> TPM_HT {
        TPM_HT((self.handle >> 24) as u8)
    }

    /// The name of a handle whose name is the handle itself (PCRs, permanent handles, sessions).
    pub fn get_name(&self) -> Name {
        self.handle.to_be_bytes().to_vec()
    }
}

impl From<TPM_RH> for TPM_HANDLE {
    fn from(rh: TPM_RH) -> Self {
        Self::new(rh.get_value())
    }
}

impl fmt::Display for TPM_HANDLE {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.handle)
    }
}

impl fmt::Debug for TPM_HANDLE {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TPM_HANDLE({})", self)
    }
}

impl TpmMarshaller for TPM_HANDLE {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u32(self.handle);
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self::new(buffer.read_u32()?))
    }
}

macro_rules! impl_marshal_enum {
    ($name:ident, $write:ident, $read:ident) => {
        impl TpmMarshaller for $name {
            fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
                buffer.$write(self.0);
                Ok(())
            }

            fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
                Ok(Self(buffer.$read()?))
            }
        }
    };
}

impl_marshal_enum!(TPM_ALG_ID, write_u16, read_u16);
impl_marshal_enum!(TPM_CC, write_u32, read_u32);
impl_marshal_enum!(TPM_ST, write_u16, read_u16);
impl_marshal_enum!(TPM_EO, write_u16, read_u16);
impl_marshal_enum!(TPMA_NV, write_u32, read_u32);

/// TPMT_HA: a digest tagged with its algorithm. The digest is not size-prefixed
/// on the wire; its length is implied by the algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TPMT_HA {
    pub hashAlg: TPM_ALG_ID,
    pub digest: Digest,
}

pub type TaggedHash = TPMT_HA;
pub type TaggedHashList = Vec<TPMT_HA>;

impl TPMT_HA {
    /// Create a tagged hash, checking that the digest length matches the algorithm.
    pub fn new(hash_alg: TPM_ALG_ID, digest: impl Into<Digest>) -> Result<Self, TpmError> {
        let digest = digest.into();
        if !hash_alg.is_hash() {
            return Err(TpmError::NotSupported(format!("invalid digest algorithm {}", hash_alg)));
        }
        if digest.len() != hash_alg.size() {
            return Err(TpmError::InvalidArraySize(format!(
                "invalid digest size {} for {}",
                digest.len(),
                hash_alg
            )));
        }
        Ok(Self { hashAlg: hash_alg, digest })
    }

    /// An all-zero digest, which is the initial value of every policy session digest.
    pub fn zero(hash_alg: TPM_ALG_ID) -> Result<Self, TpmError> {
        Self::new(hash_alg, vec![0u8; hash_alg.size()])
    }
}

impl TpmMarshaller for TPMT_HA {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.hashAlg.0);
        if self.hashAlg == TPM_ALG_ID::NULL {
            return Ok(());
        }
        if !self.hashAlg.is_hash() {
            return Err(TpmError::NotSupported(format!(
                "cannot determine digest size for unknown algorithm {}",
                self.hashAlg
            )));
        }
        if self.digest.len() != self.hashAlg.size() {
            return Err(TpmError::InvalidArraySize(format!("invalid digest size {}", self.digest.len())));
        }
        buffer.write_raw(&self.digest);
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let hashAlg = TPM_ALG_ID(buffer.read_u16()?);
        if hashAlg == TPM_ALG_ID::NULL {
            return Ok(Self { hashAlg, digest: Vec::new() });
        }
        if !hashAlg.is_hash() {
            return Err(TpmError::NotSupported(format!("invalid digest algorithm {}", hashAlg)));
        }
        let digest = buffer.read_raw(hashAlg.size())?;
        Ok(Self { hashAlg, digest })
    }
}

/// Selection of PCRs for a single bank
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TPMS_PCR_SELECTION {
    pub hash: TPM_ALG_ID,
    pub pcrSelect: Vec<u8>,
}

pub type PcrSelectionList = Vec<TPMS_PCR_SELECTION>;

/// The minimum size of a PCR select bitmap, covering PCRs 0-23.
pub const PCR_SELECT_MIN: usize = 3;

impl TPMS_PCR_SELECTION {
    pub fn new(hash: TPM_ALG_ID, pcrs: &[u32]) -> Self {
        let mut sel = Self { hash, pcrSelect: vec![0u8; PCR_SELECT_MIN] };
        for pcr in pcrs {
            sel.select(*pcr);
        }
        sel
    }

    pub fn select(&mut self, pcr: u32) {
        let octet = (pcr / 8) as usize;
        if self.pcrSelect.len() <= octet {
            self.pcrSelect.resize(octet + 1, 0);
        }
        self.pcrSelect[octet] |= 1 << (pcr % 8);
    }

    /// Selected PCR indices in ascending order
    pub fn pcrs(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, octet) in self.pcrSelect.iter().enumerate() {
            for bit in 0..8 {
                if octet & (1 << bit) != 0 {
                    out.push((i * 8 + bit) as u32);
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pcrSelect.iter().all(|b| *b == 0)
    }
}

impl TpmMarshaller for TPMS_PCR_SELECTION {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.hash.0);
        let size = u8::try_from(self.pcrSelect.len()).map_err(|_| TpmError::BufferOverflow)?;
        buffer.write_u8(size);
        buffer.write_raw(&self.pcrSelect);
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let hash = TPM_ALG_ID(buffer.read_u16()?);
        let size = buffer.read_u8()? as usize;
        let pcrSelect = buffer.read_raw(size)?;
        Ok(Self { hash, pcrSelect })
    }
}

/// Public area of an NV index
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_NV_PUBLIC {
    pub nvIndex: TPM_HANDLE,
    pub nameAlg: TPM_ALG_ID,
    pub attributes: TPMA_NV,
    pub authPolicy: Digest,
    pub dataSize: u16,
}

impl TpmMarshaller for TPMS_NV_PUBLIC {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        self.nvIndex.toTpm(buffer)?;
        self.nameAlg.toTpm(buffer)?;
        self.attributes.toTpm(buffer)?;
        buffer.write_sized(&self.authPolicy)?;
        buffer.write_u16(self.dataSize);
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self {
            nvIndex: TPM_HANDLE::fromTpm(buffer)?,
            nameAlg: TPM_ALG_ID::fromTpm(buffer)?,
            attributes: TPMA_NV::fromTpm(buffer)?,
            authPolicy: buffer.read_sized()?,
            dataSize: buffer.read_u16()?,
        })
    }
}

/// Symmetric algorithm of a storage key (TPMT_SYM_DEF_OBJECT)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_SYM_DEF_OBJECT {
    pub algorithm: TPM_ALG_ID,
    pub keyBits: u16,
    pub mode: TPM_ALG_ID,
}

impl Default for TPMT_SYM_DEF_OBJECT {
    fn default() -> Self {
        Self { algorithm: TPM_ALG_ID::NULL, keyBits: 0, mode: TPM_ALG_ID::NULL }
    }
}

impl TpmMarshaller for TPMT_SYM_DEF_OBJECT {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.algorithm.0);
        if self.algorithm != TPM_ALG_ID::NULL {
            buffer.write_u16(self.keyBits);
            buffer.write_u16(self.mode.0);
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let algorithm = TPM_ALG_ID(buffer.read_u16()?);
        if algorithm == TPM_ALG_ID::NULL {
            return Ok(Self::default());
        }
        Ok(Self { algorithm, keyBits: buffer.read_u16()?, mode: TPM_ALG_ID(buffer.read_u16()?) })
    }
}

/// A signing or HMAC scheme with its digest (TPMT_RSA_SCHEME, TPMT_ECC_SCHEME,
/// TPMT_KEYEDHASH_SCHEME restricted to schemes that carry only a hash algorithm).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_SCHEME {
    pub scheme: TPM_ALG_ID,
    pub hashAlg: TPM_ALG_ID,
}

impl Default for TPMT_SCHEME {
    fn default() -> Self {
        Self { scheme: TPM_ALG_ID::NULL, hashAlg: TPM_ALG_ID::NULL }
    }
}

impl TpmMarshaller for TPMT_SCHEME {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.scheme.0);
        if self.scheme != TPM_ALG_ID::NULL {
            buffer.write_u16(self.hashAlg.0);
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let scheme = TPM_ALG_ID(buffer.read_u16()?);
        if scheme == TPM_ALG_ID::NULL {
            return Ok(Self::default());
        }
        Ok(Self { scheme, hashAlg: TPM_ALG_ID(buffer.read_u16()?) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_KEYEDHASH_PARMS {
    pub scheme: TPMT_SCHEME,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_RSA_PARMS {
    pub symmetric: TPMT_SYM_DEF_OBJECT,
    pub scheme: TPMT_SCHEME,
    pub keyBits: u16,
    pub exponent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_ECC_PARMS {
    pub symmetric: TPMT_SYM_DEF_OBJECT,
    pub scheme: TPMT_SCHEME,
    pub curveID: TPM_ECC_CURVE,
    pub kdf: TPMT_SCHEME,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_PUBLIC_PARMS {
    keyedHashDetail(TPMS_KEYEDHASH_PARMS),
    rsaDetail(TPMS_RSA_PARMS),
    eccDetail(TPMS_ECC_PARMS),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_PUBLIC_ID {
    keyedHash(Digest),
    rsa(Vec<u8>),
    ecc { x: Vec<u8>, y: Vec<u8> },
}

/// Public area of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_PUBLIC {
    pub type_: TPM_ALG_ID,
    pub nameAlg: TPM_ALG_ID,
    pub objectAttributes: u32,
    pub authPolicy: Digest,
    pub parameters: TPMU_PUBLIC_PARMS,
    pub unique: TPMU_PUBLIC_ID,
}

/// Object attribute bits used by this crate
pub mod tpma_object {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN: u32 = 1 << 18;
}

impl TpmMarshaller for TPMT_PUBLIC {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.type_.0);
        buffer.write_u16(self.nameAlg.0);
        buffer.write_u32(self.objectAttributes);
        buffer.write_sized(&self.authPolicy)?;
        match (&self.parameters, &self.unique) {
            (TPMU_PUBLIC_PARMS::keyedHashDetail(parms), TPMU_PUBLIC_ID::keyedHash(unique))
                if self.type_ == TPM_ALG_ID::KEYEDHASH =>
            {
                parms.scheme.toTpm(buffer)?;
                buffer.write_sized(unique)?;
            }
            (TPMU_PUBLIC_PARMS::rsaDetail(parms), TPMU_PUBLIC_ID::rsa(unique)) if self.type_ == TPM_ALG_ID::RSA => {
                parms.symmetric.toTpm(buffer)?;
                parms.scheme.toTpm(buffer)?;
                buffer.write_u16(parms.keyBits);
                buffer.write_u32(parms.exponent);
                buffer.write_sized(unique)?;
            }
            (TPMU_PUBLIC_PARMS::eccDetail(parms), TPMU_PUBLIC_ID::ecc { x, y }) if self.type_ == TPM_ALG_ID::ECC => {
                parms.symmetric.toTpm(buffer)?;
                parms.scheme.toTpm(buffer)?;
                buffer.write_u16(parms.curveID.0);
                parms.kdf.toTpm(buffer)?;
                buffer.write_sized(x)?;
                buffer.write_sized(y)?;
            }
            _ => return Err(TpmError::InvalidUnion(self.type_.0 as u64)),
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let type_ = TPM_ALG_ID(buffer.read_u16()?);
        let nameAlg = TPM_ALG_ID(buffer.read_u16()?);
        let objectAttributes = buffer.read_u32()?;
        let authPolicy = buffer.read_sized()?;
        let (parameters, unique) = match type_ {
            TPM_ALG_ID::KEYEDHASH => {
                let scheme = TPMT_SCHEME::fromTpm(buffer)?;
                (
                    TPMU_PUBLIC_PARMS::keyedHashDetail(TPMS_KEYEDHASH_PARMS { scheme }),
                    TPMU_PUBLIC_ID::keyedHash(buffer.read_sized()?),
                )
            }
            TPM_ALG_ID::RSA => {
                let parms = TPMS_RSA_PARMS {
                    symmetric: TPMT_SYM_DEF_OBJECT::fromTpm(buffer)?,
                    scheme: TPMT_SCHEME::fromTpm(buffer)?,
                    keyBits: buffer.read_u16()?,
                    exponent: buffer.read_u32()?,
                };
                (TPMU_PUBLIC_PARMS::rsaDetail(parms), TPMU_PUBLIC_ID::rsa(buffer.read_sized()?))
            }
            TPM_ALG_ID::ECC => {
                let parms = TPMS_ECC_PARMS {
                    symmetric: TPMT_SYM_DEF_OBJECT::fromTpm(buffer)?,
                    scheme: TPMT_SCHEME::fromTpm(buffer)?,
                    curveID: TPM_ECC_CURVE(buffer.read_u16()?),
                    kdf: TPMT_SCHEME::fromTpm(buffer)?,
                };
                let x = buffer.read_sized()?;
                let y = buffer.read_sized()?;
                (TPMU_PUBLIC_PARMS::eccDetail(parms), TPMU_PUBLIC_ID::ecc { x, y })
            }
            other => return Err(TpmError::InvalidUnion(other.0 as u64)),
        };
        Ok(Self { type_, nameAlg, objectAttributes, authPolicy, parameters, unique })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMS_SIGNATURE_RSA {
    pub hash: TPM_ALG_ID,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMS_SIGNATURE_ECC {
    pub hash: TPM_ALG_ID,
    pub signatureR: Vec<u8>,
    pub signatureS: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TPMU_SIGNATURE {
    rsassa(TPMS_SIGNATURE_RSA),
    rsapss(TPMS_SIGNATURE_RSA),
    ecdsa(TPMS_SIGNATURE_ECC),
    hmac(TPMT_HA),
}

/// A signature, tagged with its scheme
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_SIGNATURE {
    pub sigAlg: TPM_ALG_ID,
    pub signature: Option<TPMU_SIGNATURE>,
}

impl TPMT_SIGNATURE {
    pub fn rsassa(hash: TPM_ALG_ID, sig: Vec<u8>) -> Self {
        Self {
            sigAlg: TPM_ALG_ID::RSASSA,
            signature: Some(TPMU_SIGNATURE::rsassa(TPMS_SIGNATURE_RSA { hash, sig })),
        }
    }

    /// The digest algorithm used to create this signature
    pub fn hash_alg(&self) -> TPM_ALG_ID {
        match &self.signature {
            Some(TPMU_SIGNATURE::rsassa(s)) | Some(TPMU_SIGNATURE::rsapss(s)) => s.hash,
            Some(TPMU_SIGNATURE::ecdsa(s)) => s.hash,
            Some(TPMU_SIGNATURE::hmac(ha)) => ha.hashAlg,
            None => TPM_ALG_ID::NULL,
        }
    }
}

impl TpmMarshaller for TPMT_SIGNATURE {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u16(self.sigAlg.0);
        match (&self.signature, self.sigAlg) {
            (None, TPM_ALG_ID::NULL) => {}
            (Some(TPMU_SIGNATURE::rsassa(s)), TPM_ALG_ID::RSASSA)
            | (Some(TPMU_SIGNATURE::rsapss(s)), TPM_ALG_ID::RSAPSS) => {
                buffer.write_u16(s.hash.0);
                buffer.write_sized(&s.sig)?;
            }
            (Some(TPMU_SIGNATURE::ecdsa(s)), TPM_ALG_ID::ECDSA) => {
                buffer.write_u16(s.hash.0);
                buffer.write_sized(&s.signatureR)?;
                buffer.write_sized(&s.signatureS)?;
            }
            (Some(TPMU_SIGNATURE::hmac(ha)), TPM_ALG_ID::HMAC) => ha.toTpm(buffer)?,
            _ => return Err(TpmError::InvalidUnion(self.sigAlg.0 as u64)),
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let sigAlg = TPM_ALG_ID(buffer.read_u16()?);
        let signature = match sigAlg {
            TPM_ALG_ID::NULL => None,
            TPM_ALG_ID::RSASSA => Some(TPMU_SIGNATURE::rsassa(TPMS_SIGNATURE_RSA {
                hash: TPM_ALG_ID(buffer.read_u16()?),
                sig: buffer.read_sized()?,
            })),
            TPM_ALG_ID::RSAPSS => Some(TPMU_SIGNATURE::rsapss(TPMS_SIGNATURE_RSA {
                hash: TPM_ALG_ID(buffer.read_u16()?),
                sig: buffer.read_sized()?,
            })),
            TPM_ALG_ID::ECDSA => Some(TPMU_SIGNATURE::ecdsa(TPMS_SIGNATURE_ECC {
                hash: TPM_ALG_ID(buffer.read_u16()?),
                signatureR: buffer.read_sized()?,
                signatureS: buffer.read_sized()?,
            })),
            TPM_ALG_ID::HMAC => Some(TPMU_SIGNATURE::hmac(TPMT_HA::fromTpm(buffer)?)),
            other => return Err(TpmError::InvalidUnion(other.0 as u64)),
        };
        Ok(Self { sigAlg, signature })
    }
}

/// Ticket produced by TPM2_PolicySigned or TPM2_PolicySecret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_TK_AUTH {
    pub tag: TPM_ST,
    pub hierarchy: TPM_HANDLE,
    pub digest: Digest,
}

impl TPMT_TK_AUTH {
    /// A null ticket carries no authorization and cannot be redeemed.
    pub fn is_null(&self) -> bool {
        self.hierarchy == TPM_HANDLE::from(TPM_RH::NULL) && self.digest.is_empty()
    }
}

impl TpmMarshaller for TPMT_TK_AUTH {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        self.tag.toTpm(buffer)?;
        self.hierarchy.toTpm(buffer)?;
        buffer.write_sized(&self.digest)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self {
            tag: TPM_ST::fromTpm(buffer)?,
            hierarchy: TPM_HANDLE::fromTpm(buffer)?,
            digest: buffer.read_sized()?,
        })
    }
}

/// Ticket produced by TPM2_VerifySignature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TPMT_TK_VERIFIED {
    pub tag: TPM_ST,
    pub hierarchy: TPM_HANDLE,
    pub digest: Digest,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_CLOCK_INFO {
    pub clock: u64,
    pub resetCount: u32,
    pub restartCount: u32,
    pub safe: bool,
}

/// Time information returned by TPM2_ReadClock. TPM2_PolicyCounterTimer
/// operands are compared against the marshalled form of this structure.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TPMS_TIME_INFO {
    pub time: u64,
    pub clockInfo: TPMS_CLOCK_INFO,
}

impl TpmMarshaller for TPMS_TIME_INFO {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u64(self.time);
        buffer.write_u64(self.clockInfo.clock);
        buffer.write_u32(self.clockInfo.resetCount);
        buffer.write_u32(self.clockInfo.restartCount);
        self.clockInfo.safe.toTpm(buffer)
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        Ok(Self {
            time: buffer.read_u64()?,
            clockInfo: TPMS_CLOCK_INFO {
                clock: buffer.read_u64()?,
                resetCount: buffer.read_u32()?,
                restartCount: buffer.read_u32()?,
                safe: bool::fromTpm(buffer)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_display() {
        assert_eq!(TPM_CC::PolicyOR.to_string(), "PolicyOR");
        assert_eq!(TPM_ALG_ID::SHA256.to_string(), "SHA256");
        assert_eq!(TPM_CC(0x12345).to_string(), "0x12345");
        assert_eq!((TPMA_NV::OWNERREAD | TPMA_NV::WRITTEN).to_string(), "OWNERREAD | WRITTEN");
    }

    #[test]
    fn test_try_from_trait() {
        assert_eq!(TPM_EO::try_from_trait(0xB).unwrap(), TPM_EO::BITCLEAR);
        assert!(matches!(TPM_EO::try_from_trait(0xC), Err(TpmError::InvalidEnumValue(0xC))));
    }

    #[test]
    fn test_tagged_hash_wire_form() {
        let ha = TPMT_HA::new(TPM_ALG_ID::SHA1, vec![0xAA; 20]).unwrap();
        let bytes = ha.toBytes().unwrap();
        assert_eq!(bytes.len(), 22);
        assert_eq!(&bytes[..2], &[0x00, 0x04]);
        assert_eq!(TPMT_HA::fromBytes(&bytes).unwrap(), ha);

        assert!(TPMT_HA::new(TPM_ALG_ID::SHA256, vec![0u8; 20]).is_err());
        assert!(TPMT_HA::fromBytes(&[0x00, 0x99, 0x00]).is_err());

        let null = TPMT_HA::fromBytes(&[0x00, 0x10]).unwrap();
        assert_eq!(null.hashAlg, TPM_ALG_ID::NULL);
        assert!(null.digest.is_empty());
    }

    #[test]
    fn test_pcr_selection() {
        let sel = TPMS_PCR_SELECTION::new(TPM_ALG_ID::SHA256, &[0, 7, 16]);
        assert_eq!(sel.pcrSelect, vec![0x81, 0x00, 0x01]);
        assert_eq!(sel.pcrs(), vec![0, 7, 16]);
        assert_eq!(sel.toBytes().unwrap(), vec![0x00, 0x0b, 0x03, 0x81, 0x00, 0x01]);
    }

    #[test]
    fn test_handle_type() {
        assert_eq!(TPM_HANDLE::new(0x01800000).get_type(), TPM_HT::NV_INDEX);
        assert_eq!(TPM_HANDLE::from(TPM_RH::OWNER).get_type(), TPM_HT::PERMANENT);
        assert_eq!(TPM_HANDLE::pcr(7).get_type(), TPM_HT::PCR);
        assert_eq!(TPM_HANDLE::from(TPM_RH::OWNER).get_name(), vec![0x40, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_time_info_size() {
        let info = TPMS_TIME_INFO::default();
        assert_eq!(info.toBytes().unwrap().len(), 25);
    }
}
