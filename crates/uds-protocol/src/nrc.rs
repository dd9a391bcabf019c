//! Negative response codes (ISO 14229-1 Annex A)

pub const GENERAL_REJECT: u8 = 0x10;
pub const SERVICE_NOT_SUPPORTED: u8 = 0x11;
pub const SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
pub const INCORRECT_MESSAGE_LENGTH: u8 = 0x13;
pub const RESPONSE_TOO_LONG: u8 = 0x14;
pub const BUSY_REPEAT_REQUEST: u8 = 0x21;
pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
pub const REQUEST_SEQUENCE_ERROR: u8 = 0x24;
pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
pub const SECURITY_ACCESS_DENIED: u8 = 0x33;
pub const INVALID_KEY: u8 = 0x35;
pub const EXCEEDED_NUMBER_OF_ATTEMPTS: u8 = 0x36;
pub const REQUIRED_TIME_DELAY_NOT_EXPIRED: u8 = 0x37;
pub const UPLOAD_DOWNLOAD_NOT_ACCEPTED: u8 = 0x70;
pub const TRANSFER_DATA_SUSPENDED: u8 = 0x71;
pub const GENERAL_PROGRAMMING_FAILURE: u8 = 0x72;
pub const WRONG_BLOCK_SEQUENCE_COUNTER: u8 = 0x73;
pub const RESPONSE_PENDING: u8 = 0x78;
pub const SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7E;
pub const SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7F;

pub fn name(code: u8) -> &'static str {
    match code {
        GENERAL_REJECT => "generalReject",
        SERVICE_NOT_SUPPORTED => "serviceNotSupported",
        SUB_FUNCTION_NOT_SUPPORTED => "subFunctionNotSupported",
        INCORRECT_MESSAGE_LENGTH => "incorrectMessageLengthOrInvalidFormat",
        RESPONSE_TOO_LONG => "responseTooLong",
        BUSY_REPEAT_REQUEST => "busyRepeatRequest",
        CONDITIONS_NOT_CORRECT => "conditionsNotCorrect",
        REQUEST_SEQUENCE_ERROR => "requestSequenceError",
        REQUEST_OUT_OF_RANGE => "requestOutOfRange",
        SECURITY_ACCESS_DENIED => "securityAccessDenied",
        INVALID_KEY => "invalidKey",
        EXCEEDED_NUMBER_OF_ATTEMPTS => "exceedNumberOfAttempts",
        REQUIRED_TIME_DELAY_NOT_EXPIRED => "requiredTimeDelayNotExpired",
        UPLOAD_DOWNLOAD_NOT_ACCEPTED => "uploadDownloadNotAccepted",
        TRANSFER_DATA_SUSPENDED => "transferDataSuspended",
        GENERAL_PROGRAMMING_FAILURE => "generalProgrammingFailure",
        WRONG_BLOCK_SEQUENCE_COUNTER => "wrongBlockSequenceCounter",
        RESPONSE_PENDING => "requestCorrectlyReceivedResponsePending",
        SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION => "subFunctionNotSupportedInActiveSession",
        SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION => "serviceNotSupportedInActiveSession",
        _ => "reserved",
    }
}
