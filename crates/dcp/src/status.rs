// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status codes carried in service confirm primitives.
//!
//! Every confirm carries a 16-bit status drawn from its protocol's space.
//! Decoding an unknown value is an error, never a silent default: a wrong
//! code on the command socket means the peer speaks a different revision
//! and the exchange must fail loudly.

use std::fmt;

/// Error for an unrecognized status or service-type value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownCode {
    pub space: &'static str,
    pub value: u16,
}

impl fmt::Display for UnknownCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} code {:#06x}", self.space, self.value)
    }
}

impl std::error::Error for UnknownCode {}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident, $space:expr, { $($variant:ident = $value:expr => $text:expr,)+ }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u16)]
        pub enum $name {
            $($variant = $value,)+
        }

        impl $name {
            /// Canonical name of the enumerant.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }

            /// Wire value.
            #[inline]
            #[must_use]
            pub fn code(&self) -> u16 {
                *self as u16
            }
        }

        impl TryFrom<u16> for $name {
            type Error = UnknownCode;

            fn try_from(value: u16) -> Result<Self, UnknownCode> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    _ => Err(UnknownCode { space: $space, value }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// BP service status codes.
    BpStatus, "BP_STATUS", {
        Ok = 0x0000 => "BP_STATUS_OK",
        ProtocolAlreadyRegistered = 0x0001 => "BP_STATUS_PROTOCOL_ALREADY_REGISTERED",
        IllegalMaxPayloadSize = 0x0002 => "BP_STATUS_ILLEGAL_MAX_PAYLOAD_SIZE",
        UnknownProtocol = 0x0003 => "BP_STATUS_UNKNOWN_PROTOCOL",
        PayloadTooLarge = 0x0004 => "BP_STATUS_PAYLOAD_TOO_LARGE",
        EmptyPayload = 0x0005 => "BP_STATUS_EMPTY_PAYLOAD",
        IllegalDroppingQueueSize = 0x0006 => "BP_STATUS_ILLEGAL_DROPPING_QUEUE_SIZE",
        UnknownQueueingMode = 0x0007 => "BP_STATUS_UNKNOWN_QUEUEING_MODE",
        Inactive = 0x0008 => "BP_STATUS_INACTIVE",
        InternalError = 0x0100 => "BP_STATUS_INTERNAL_ERROR",
        InternalSharedMemoryError = 0x0101 => "BP_STATUS_INTERNAL_SHARED_MEMORY_ERROR",
        IllegalServiceType = 0x0102 => "BP_STATUS_ILLEGAL_SERVICE_TYPE",
    }
);

status_enum!(
    /// Vardis service status codes.
    VardisStatus, "VARDIS_STATUS", {
        Ok = 0x0000 => "VARDIS_STATUS_OK",
        VariableExists = 0x0001 => "VARDIS_STATUS_VARIABLE_EXISTS",
        VariableDescriptionTooLong = 0x0002 => "VARDIS_STATUS_VARIABLE_DESCRIPTION_TOO_LONG",
        ValueTooLong = 0x0003 => "VARDIS_STATUS_VALUE_TOO_LONG",
        EmptyValue = 0x0004 => "VARDIS_STATUS_EMPTY_VALUE",
        IllegalRepCount = 0x0005 => "VARDIS_STATUS_ILLEGAL_REPCOUNT",
        VariableDoesNotExist = 0x0006 => "VARDIS_STATUS_VARIABLE_DOES_NOT_EXIST",
        NotProducer = 0x0007 => "VARDIS_STATUS_NOT_PRODUCER",
        VariableBeingDeleted = 0x0008 => "VARDIS_STATUS_VARIABLE_BEING_DELETED",
        Inactive = 0x0009 => "VARDIS_STATUS_INACTIVE",
        InternalError = 0x0100 => "VARDIS_STATUS_INTERNAL_ERROR",
        ApplicationAlreadyRegistered = 0x0101 => "VARDIS_STATUS_APPLICATION_ALREADY_REGISTERED",
        InternalSharedMemoryError = 0x0102 => "VARDIS_STATUS_INTERNAL_SHARED_MEMORY_ERROR",
        UnknownApplication = 0x0103 => "VARDIS_STATUS_UNKNOWN_APPLICATION",
        IllegalServiceType = 0x0104 => "VARDIS_STATUS_ILLEGAL_SERVICE_TYPE",
    }
);

status_enum!(
    /// SRP service status codes.
    SrpStatus, "SRP_STATUS", {
        Ok = 0x0000 => "SRP_STATUS_OK",
        InternalError = 0x0100 => "SRP_STATUS_INTERNAL_ERROR",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_bp_codes() {
        for status in [
            BpStatus::Ok,
            BpStatus::ProtocolAlreadyRegistered,
            BpStatus::IllegalMaxPayloadSize,
            BpStatus::UnknownProtocol,
            BpStatus::PayloadTooLarge,
            BpStatus::EmptyPayload,
            BpStatus::IllegalDroppingQueueSize,
            BpStatus::UnknownQueueingMode,
            BpStatus::Inactive,
            BpStatus::InternalError,
            BpStatus::InternalSharedMemoryError,
            BpStatus::IllegalServiceType,
        ] {
            assert_eq!(BpStatus::try_from(status.code()).unwrap(), status);
            assert!(status.as_str().starts_with("BP_STATUS_"));
        }
    }

    #[test]
    fn test_roundtrip_all_vardis_codes() {
        for code in (0x0000..=0x0009).chain(0x0100..=0x0104) {
            let status = VardisStatus::try_from(code).unwrap();
            assert_eq!(status.code(), code);
            assert!(status.as_str().starts_with("VARDIS_STATUS_"));
        }
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(BpStatus::try_from(0xbeef).is_err());
        assert!(VardisStatus::try_from(0x0042).is_err());
        assert!(SrpStatus::try_from(0x0001).is_err());
        let err = BpStatus::try_from(0xbeef).unwrap_err();
        assert_eq!(err.to_string(), "unknown BP_STATUS code 0xbeef");
    }
}
