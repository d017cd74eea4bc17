//! Error types for TPM structures and policy operations

use thiserror::Error;

use crate::tpm_types::{TPM_CC, TPM_HANDLE};

/// Format-one response codes carry a parameter, handle or session number.
const RC_FMT1: u32 = 0x080;
const RC_P: u32 = 0x040;
const RC_N_SHIFT: u32 = 8;
const RC_N_MASK: u32 = 0xF00;
const RC_FMT1_ERROR_MASK: u32 = 0x03F;

/// TPM_RC_TICKET (format one)
pub const TPM_RC_TICKET: u32 = RC_FMT1 + 0x00C;
/// TPM_RC_EXPIRED (format one)
pub const TPM_RC_EXPIRED: u32 = RC_FMT1 + 0x023;
/// TPM_RC_POLICY_FAIL (format one)
pub const TPM_RC_POLICY_FAIL: u32 = RC_FMT1 + 0x01D;
/// TPM_RC_HANDLE (format one)
pub const TPM_RC_HANDLE: u32 = RC_FMT1 + 0x00B;

/// An error response returned by the TPM for a specific command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("TPM returned an error for {command_code}: 0x{response_code:08x}")]
pub struct TpmResponseError {
    pub command_code: TPM_CC,
    pub response_code: u32,
}

impl TpmResponseError {
    pub fn new(command_code: TPM_CC, response_code: u32) -> Self {
        Self { command_code, response_code }
    }

    /// Build the response code the TPM returns for `error` against parameter `index`.
    pub fn parameter(command_code: TPM_CC, error: u32, index: u32) -> Self {
        Self::new(command_code, error | RC_P | ((index & 0xF) << RC_N_SHIFT))
    }

    /// Whether this is a format-one parameter error with the specified code and parameter index.
    pub fn is_parameter_error(&self, error: u32, command_code: TPM_CC, index: u32) -> bool {
        let rc = self.response_code;
        if self.command_code != command_code {
            return false;
        }
        if rc & RC_FMT1 == 0 || rc & RC_P == 0 {
            return false;
        }
        (rc & RC_FMT1_ERROR_MASK) == (error & RC_FMT1_ERROR_MASK)
            && ((rc & RC_N_MASK) >> RC_N_SHIFT) == index
    }
}

/// TPM Error types
#[derive(Debug, Error)]
pub enum TpmError {
    /// Buffer underflow occurred during deserialization
    #[error("Buffer underflow during deserialization")]
    BufferUnderflow,

    /// Buffer overflow occurred during serialization
    #[error("Buffer overflow during serialization")]
    BufferOverflow,

    /// Invalid array size
    #[error("Invalid array size: {0}")]
    InvalidArraySize(String),

    /// Invalid enum value
    #[error("Invalid enum value {0:#x}")]
    InvalidEnumValue(u64),

    /// Invalid union type
    #[error("Invalid union selector {0:#x}")]
    InvalidUnion(u64),

    /// Incorrect tag value
    #[error("Incorrect tag: expected 0x{0:X}, got 0x{1:X}")]
    IncorrectTag(u32, u32), // expected, actual

    /// Algorithm or feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// The TPM rejected a command
    #[error(transparent)]
    Tpm(#[from] TpmResponseError),

    /// The handle does not correspond to an existing resource
    #[error("resource at handle {0} is not available")]
    ResourceUnavailable(TPM_HANDLE),

    /// Generic TPM error
    #[error("TPM error: {0}")]
    GenericError(String),
}

impl TpmError {
    /// Whether this is a TPM parameter error with the specified code and parameter index.
    pub fn is_tpm_parameter_error(&self, error: u32, command_code: TPM_CC, index: u32) -> bool {
        match self {
            Self::Tpm(e) => e.is_parameter_error(error, command_code, index),
            _ => false,
        }
    }
}

/// Errors returned from policy construction, validation and execution.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A TPM2_PolicyCpHash or TPM2_PolicyNameHash assertion (or a TPM2_PolicyOR hash list)
    /// has no digest for the session algorithm.
    #[error("missing digest for session algorithm")]
    MissingDigest,

    /// A TPM2_PolicySigned assertion has no signed authorization and no usable ticket.
    #[error("missing signed authorization for assertion with authName: {}, policyRef: {}", hex::encode(.auth_name), hex::encode(.policy_ref))]
    AuthorizationNotFound { auth_name: Vec<u8>, policy_ref: Vec<u8> },

    /// No resource with the indicated name could be found.
    #[error("missing resource with name {}", hex::encode(.0))]
    ResourceNotFound(Vec<u8>),

    /// Every candidate path through a branch node was filtered out.
    #[error("cannot select execution path: no appropriate paths found")]
    NoAppropriatePaths,

    /// A computed digest disagrees with the stored digest.
    #[error("stored and computed digest mismatch (computed: {}, stored: {})", hex::encode(.computed), hex::encode(.expected))]
    DigestMismatch { computed: Vec<u8>, expected: Vec<u8> },

    #[error("invalid branch path: {0}")]
    InvalidBranchPath(String),

    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// An assertion failed.
    #[error("cannot process {name}: {source}")]
    Element {
        name: &'static str,
        #[source]
        source: Box<PolicyError>,
    },

    /// Processing of a branch failed.
    #[error("cannot process branch \"{path}\": {source}")]
    Branch {
        path: String,
        #[source]
        source: Box<PolicyError>,
    },

    /// A resource could not be loaded or authorized.
    #[error("cannot {action} resource with name {}: {source}", hex::encode(.name))]
    Resource {
        action: &'static str,
        name: Vec<u8>,
        #[source]
        source: Box<PolicyError>,
    },

    #[error(transparent)]
    Tpm(#[from] TpmError),

    #[error("{0}")]
    Other(String),
}

impl PolicyError {
    pub(crate) fn element(name: &'static str, source: PolicyError) -> Self {
        Self::Element { name, source: Box::new(source) }
    }

    pub(crate) fn branch(path: impl Into<String>, source: PolicyError) -> Self {
        Self::Branch { path: path.into(), source: Box::new(source) }
    }

    pub(crate) fn resource(action: &'static str, name: &[u8], source: PolicyError) -> Self {
        Self::Resource { action, name: name.to_vec(), source: Box::new(source) }
    }

    /// Walk through the wrapping layers to find the innermost error.
    pub fn root_cause(&self) -> &PolicyError {
        match self {
            Self::Element { source, .. } | Self::Branch { source, .. } | Self::Resource { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// The TPM error at the root of this error, if there is one.
    pub fn tpm_error(&self) -> Option<&TpmError> {
        match self.root_cause() {
            Self::Tpm(e) => Some(e),
            _ => None,
        }
    }
}
