/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

use std::any::TypeId;
use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm_structure::TpmEnum;
use crate::tpm_types::*;

lazy_static! {
    /// Maps each TPM constant type to a table of its member names
    static ref ENUM_TO_STR_MAP: HashMap<TypeId, HashMap<u64, &'static str>> = {
        fn table(variants: &[(&'static str, u64)]) -> HashMap<u64, &'static str> {
            variants.iter().map(|(name, value)| (*value, *name)).collect()
        }

        let mut m = HashMap::new();
        m.insert(TypeId::of::<TPM_ALG_ID>(), table(TPM_ALG_ID::VARIANTS));
        m.insert(TypeId::of::<TPM_CC>(), table(TPM_CC::VARIANTS));
        m.insert(TypeId::of::<TPM_ST>(), table(TPM_ST::VARIANTS));
        m.insert(TypeId::of::<TPM_SE>(), table(TPM_SE::VARIANTS));
        m.insert(TypeId::of::<TPM_EO>(), table(TPM_EO::VARIANTS));
        m.insert(TypeId::of::<TPM_HT>(), table(TPM_HT::VARIANTS));
        m.insert(TypeId::of::<TPM_RH>(), table(TPM_RH::VARIANTS));
        m.insert(TypeId::of::<TPM_ECC_CURVE>(), table(TPM_ECC_CURVE::VARIANTS));
        m.insert(TypeId::of::<TPMA_NV>(), table(TPMA_NV::VARIANTS));
        m
    };

    /// Constant types whose values are bit fields
    static ref FLAG_TYPES: Vec<TypeId> = vec![TypeId::of::<TPMA_NV>()];
}

/// Convert a numeric enum value to its string representation
///
/// # Arguments
///
/// * `enum_val` - The numeric value of the enum
/// * `enum_id` - The identifier of the enum type
///
/// # Returns
///
/// The string representation of the enum value, a string of OR'd values for
/// bit field types, or an empty string if the value has no name.
pub fn enum_to_str(enum_val: u64, enum_id: TypeId) -> String {
    let mut res = String::new();

    let Some(enum_map) = ENUM_TO_STR_MAP.get(&enum_id) else {
        return res;
    };

    if let Some(name) = enum_map.get(&enum_val) {
        return name.to_string();
    }

    if !FLAG_TYPES.contains(&enum_id) {
        return res;
    }

    // Decompose as bit flags
    let mut cur_bit: u64 = 1;
    let mut found_bits: u64 = 0;

    while (found_bits != enum_val) {
        if (cur_bit & enum_val) != 0 {
            found_bits |= cur_bit;

            let Some(bit_name) = enum_map.get(&cur_bit) else {
                return String::new();
            };
            if !res.is_empty() {
                res.push_str(" | ");
            }
            res.push_str(bit_name);
        }

        cur_bit <<= 1;
    }

    res
}

/// Compute the command parameter hash for the specified command, handle names and
/// marshalled parameters, as used by TPM2_PolicyCpHash.
pub fn compute_cp_hash(
    hash_alg: TPM_ALG_ID,
    command_code: TPM_CC,
    handles: &[Name],
    params: &[u8],
) -> Result<Digest, TpmError> {
    let mut to_hash = command_code.get_value().to_be_bytes().to_vec();
    for name in handles {
        to_hash.extend_from_slice(name);
    }
    to_hash.extend_from_slice(params);
    Crypto::hash(hash_alg, &to_hash)
}

/// Compute the digest of the specified handle names, as used by TPM2_PolicyNameHash.
pub fn compute_name_hash(hash_alg: TPM_ALG_ID, handles: &[Name]) -> Result<Digest, TpmError> {
    Crypto::hash(hash_alg, &handles.concat())
}

/// Compute the digest of the selected PCR values, as used by TPM2_PolicyPCR. Values
/// are concatenated in the order of the selection list, in ascending PCR order within
/// each bank.
pub fn compute_pcr_digest(
    hash_alg: TPM_ALG_ID,
    pcrs: &PcrSelectionList,
    values: &PcrValues,
) -> Result<Digest, TpmError> {
    let mut to_hash = Vec::new();
    for selection in pcrs {
        for pcr in selection.pcrs() {
            let Some(value) = values.get(&selection.hash).and_then(|bank| bank.get(&pcr)) else {
                return Err(TpmError::GenericError(format!(
                    "missing value for PCR {} in bank {}",
                    pcr, selection.hash
                )));
            };
            to_hash.extend_from_slice(value);
        }
    }
    Crypto::hash(hash_alg, &to_hash)
}
