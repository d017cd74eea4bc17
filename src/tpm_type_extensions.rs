use std::collections::{BTreeMap, BTreeSet};

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm_structure::{TpmEnum, TpmMarshaller};
use crate::tpm_types::*;

/// Compute nameAlg || H(marshalled public area)
fn name_of(name_alg: TPM_ALG_ID, public: &[u8]) -> Result<Name, TpmError> {
    let mut pub_hash = Crypto::hash(name_alg, public)?;
    pub_hash.splice(0..0, name_alg.get_value().to_be_bytes());
    Ok(pub_hash)
}

impl TPMT_PUBLIC {
    pub fn get_name(&self) -> Result<Name, TpmError> {
        name_of(self.nameAlg, &self.toBytes()?)
    }
}

impl TPMS_NV_PUBLIC {
    pub fn get_name(&self) -> Result<Name, TpmError> {
        name_of(self.nameAlg, &self.toBytes()?)
    }

    pub fn is_written(&self) -> bool {
        self.attributes.contains(TPMA_NV::WRITTEN)
    }
}

/// Whether a name has a valid form: either a 4-byte handle or a digest tagged with its algorithm.
pub fn is_valid_name(name: &[u8]) -> bool {
    if name.len() == 4 {
        return true;
    }
    if name.len() < 2 {
        return false;
    }
    let alg = TPM_ALG_ID(u16::from_be_bytes([name[0], name[1]]));
    alg.is_hash() && name.len() == 2 + alg.size()
}

/// The digest algorithm of a name, or NULL if the name is a handle.
pub fn name_alg(name: &[u8]) -> TPM_ALG_ID {
    if name.len() < 2 || name.len() == 4 {
        return TPM_ALG_ID::NULL;
    }
    TPM_ALG_ID(u16::from_be_bytes([name[0], name[1]]))
}

/// The handle encoded by a handle-type name
pub fn name_handle(name: &[u8]) -> Option<TPM_HANDLE> {
    if name.len() != 4 {
        return None;
    }
    Some(TPM_HANDLE::new(u32::from_be_bytes([name[0], name[1], name[2], name[3]])))
}

/// The PCR selection that covers every value in `values`.
pub fn pcr_selection_from_values(values: &PcrValues) -> PcrSelectionList {
    values
        .iter()
        .map(|(alg, bank)| TPMS_PCR_SELECTION::new(*alg, &bank.keys().copied().collect::<Vec<_>>()))
        .collect()
}

/// Merge PCR selections so that each bank appears once.
pub fn merge_pcr_selections(selections: &[PcrSelectionList]) -> PcrSelectionList {
    let mut banks: BTreeMap<TPM_ALG_ID, BTreeSet<u32>> = BTreeMap::new();
    for list in selections {
        for selection in list {
            banks.entry(selection.hash).or_default().extend(selection.pcrs());
        }
    }
    banks
        .into_iter()
        .map(|(alg, pcrs)| TPMS_PCR_SELECTION::new(alg, &pcrs.into_iter().collect::<Vec<_>>()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nv_name() {
        let public = TPMS_NV_PUBLIC {
            nvIndex: TPM_HANDLE::new(0x01800000),
            nameAlg: TPM_ALG_ID::SHA256,
            attributes: TPMA_NV::AUTHWRITE | TPMA_NV::AUTHREAD,
            authPolicy: Vec::new(),
            dataSize: 8,
        };
        let name = public.get_name().unwrap();
        assert_eq!(name.len(), 34);
        assert_eq!(&name[..2], &[0x00, 0x0b]);
        assert_eq!(&name[2..], Crypto::hash(TPM_ALG_ID::SHA256, &public.toBytes().unwrap()).unwrap());
        assert!(is_valid_name(&name));
        assert_eq!(name_alg(&name), TPM_ALG_ID::SHA256);
        assert!(!public.is_written());
    }

    #[test]
    fn test_name_forms() {
        assert!(is_valid_name(&[0x40, 0x00, 0x00, 0x01]));
        assert_eq!(name_handle(&[0x40, 0x00, 0x00, 0x01]), Some(TPM_HANDLE::from(TPM_RH::OWNER)));
        assert!(!is_valid_name(&[0x00, 0x0b, 0x01]));
        assert!(!is_valid_name(&[]));
    }

    #[test]
    fn test_pcr_selections() {
        let mut values = PcrValues::new();
        values.entry(TPM_ALG_ID::SHA256).or_default().insert(7, vec![0u8; 32]);
        values.entry(TPM_ALG_ID::SHA256).or_default().insert(0, vec![0u8; 32]);
        let sel = pcr_selection_from_values(&values);
        assert_eq!(sel, vec![TPMS_PCR_SELECTION::new(TPM_ALG_ID::SHA256, &[0, 7])]);

        let merged = merge_pcr_selections(&[
            sel,
            vec![
                TPMS_PCR_SELECTION::new(TPM_ALG_ID::SHA1, &[4]),
                TPMS_PCR_SELECTION::new(TPM_ALG_ID::SHA256, &[16]),
            ],
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].hash, TPM_ALG_ID::SHA1);
        assert_eq!(merged[1].pcrs(), vec![0, 7, 16]);
    }
}
