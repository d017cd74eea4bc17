/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Traits shared by TPM constant types and wire structures

use crate::error::*;
use crate::tpm_buffer::*;

/// Common trait for all TPM enumeration types
pub trait TpmEnum<T> {
    /// Get the numeric value of the enum
    fn get_value(&self) -> T;

    /// Create enum from a numeric value, failing if the value is not a known member
    fn try_from_trait(value: u64) -> Result<Self, TpmError>
    where
        Self: Sized;

    /// Create enum from a numeric value without checking membership
    fn new_from_trait(value: u64) -> Result<Self, TpmError>
    where
        Self: Sized;
}

/// Trait for structures that can be marshaled to/from TPM wire format
pub trait TpmMarshaller {
    /// Serialize this structure into the buffer
    #[allow(non_snake_case)]
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError>;

    /// Deserialize an instance of this structure from the buffer
    #[allow(non_snake_case)]
    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError>
    where
        Self: Sized;

    /// Serialize to a new byte vector
    #[allow(non_snake_case)]
    fn toBytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut buffer = TpmBuffer::new();
        self.toTpm(&mut buffer)?;
        Ok(buffer.into_bytes())
    }

    /// Deserialize from a byte slice, requiring that every byte is consumed
    #[allow(non_snake_case)]
    fn fromBytes(bytes: &[u8]) -> Result<Self, TpmError>
    where
        Self: Sized,
    {
        let mut buffer = TpmBuffer::from_bytes(bytes.to_vec());
        let out = Self::fromTpm(&mut buffer)?;
        if buffer.remaining() != 0 {
            return Err(TpmError::InvalidArraySize(format!(
                "{} trailing bytes after structure",
                buffer.remaining()
            )));
        }
        Ok(out)
    }
}

impl<T: TpmMarshaller> TpmMarshaller for Vec<T> {
    /// Lists are marshalled with a 32-bit count prefix.
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u32(self.len() as u32);
        for item in self {
            item.toTpm(buffer)?;
        }
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        let count = buffer.read_u32()? as usize;
        // every element occupies at least one byte
        let mut out = Vec::with_capacity(count.min(buffer.remaining()));
        for _ in 0..count {
            out.push(T::fromTpm(buffer)?);
        }
        Ok(out)
    }
}

impl TpmMarshaller for bool {
    fn toTpm(&self, buffer: &mut TpmBuffer) -> Result<(), TpmError> {
        buffer.write_u8(*self as u8);
        Ok(())
    }

    fn fromTpm(buffer: &mut TpmBuffer) -> Result<Self, TpmError> {
        match buffer.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(TpmError::InvalidEnumValue(v as u64)),
        }
    }
}
