//! Service identifiers (ISO 14229-1)

pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
pub const ECU_RESET: u8 = 0x11;
pub const CLEAR_DIAGNOSTIC_INFORMATION: u8 = 0x14;
pub const READ_DTC_INFORMATION: u8 = 0x19;
pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
pub const READ_SCALING_DATA_BY_IDENTIFIER: u8 = 0x24;
pub const SECURITY_ACCESS: u8 = 0x27;
pub const COMMUNICATION_CONTROL: u8 = 0x28;
pub const READ_DATA_BY_PERIODIC_IDENTIFIER: u8 = 0x2A;
pub const DYNAMICALLY_DEFINE_DATA_IDENTIFIER: u8 = 0x2C;
pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
pub const INPUT_OUTPUT_CONTROL_BY_IDENTIFIER: u8 = 0x2F;
pub const ROUTINE_CONTROL: u8 = 0x31;
pub const REQUEST_DOWNLOAD: u8 = 0x34;
pub const REQUEST_UPLOAD: u8 = 0x35;
pub const TRANSFER_DATA: u8 = 0x36;
pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
pub const REQUEST_FILE_TRANSFER: u8 = 0x38;
pub const WRITE_MEMORY_BY_ADDRESS: u8 = 0x3D;
pub const TESTER_PRESENT: u8 = 0x3E;
pub const ACCESS_TIMING_PARAMETER: u8 = 0x83;
pub const SECURED_DATA_TRANSMISSION: u8 = 0x84;
pub const CONTROL_DTC_SETTING: u8 = 0x85;
pub const RESPONSE_ON_EVENT: u8 = 0x86;
pub const LINK_CONTROL: u8 = 0x87;

/// Negative response service identifier
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// ReadDTCInformation sub-functions
pub mod dtc_report {
    pub const NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    pub const DTC_BY_STATUS_MASK: u8 = 0x02;
    pub const SUPPORTED_DTC: u8 = 0x0A;
    pub const MIRROR_MEMORY_DTC_BY_STATUS_MASK: u8 = 0x0F;
    pub const EMISSIONS_OBD_DTC_BY_STATUS_MASK: u8 = 0x13;
    pub const DTC_WITH_PERMANENT_STATUS: u8 = 0x15;
    pub const USER_DEF_MEMORY_DTC_BY_STATUS_MASK: u8 = 0x17;

    /// Sub-functions whose positive response is a list of 4-byte records
    pub fn lists_records(sub_function: u8) -> bool {
        matches!(
            sub_function,
            DTC_BY_STATUS_MASK
                | SUPPORTED_DTC
                | MIRROR_MEMORY_DTC_BY_STATUS_MASK
                | EMISSIONS_OBD_DTC_BY_STATUS_MASK
                | DTC_WITH_PERMANENT_STATUS
        )
    }
}

/// Data identifiers whose value is printable text
pub const ASCII_IDENTIFIERS: &[u16] = &[
    0xF187, // spare part number
    0xF188, // ECU software number
    0xF18A, // system supplier identifier
    0xF18C, // ECU serial number
    0xF190, // VIN
    0xF191, // ECU hardware number
    0xF192, // supplier hardware number
    0xF194, // supplier software number
    0xF197, // system name
];

pub const VIN_IDENTIFIER: u16 = 0xF190;

/// All request SIDs the gateway accepts
pub const KNOWN: &[u8] = &[
    DIAGNOSTIC_SESSION_CONTROL,
    ECU_RESET,
    CLEAR_DIAGNOSTIC_INFORMATION,
    READ_DTC_INFORMATION,
    READ_DATA_BY_IDENTIFIER,
    READ_MEMORY_BY_ADDRESS,
    READ_SCALING_DATA_BY_IDENTIFIER,
    SECURITY_ACCESS,
    COMMUNICATION_CONTROL,
    READ_DATA_BY_PERIODIC_IDENTIFIER,
    DYNAMICALLY_DEFINE_DATA_IDENTIFIER,
    WRITE_DATA_BY_IDENTIFIER,
    INPUT_OUTPUT_CONTROL_BY_IDENTIFIER,
    ROUTINE_CONTROL,
    REQUEST_DOWNLOAD,
    REQUEST_UPLOAD,
    TRANSFER_DATA,
    REQUEST_TRANSFER_EXIT,
    REQUEST_FILE_TRANSFER,
    WRITE_MEMORY_BY_ADDRESS,
    TESTER_PRESENT,
    ACCESS_TIMING_PARAMETER,
    SECURED_DATA_TRANSMISSION,
    CONTROL_DTC_SETTING,
    RESPONSE_ON_EVENT,
    LINK_CONTROL,
];

pub fn is_known(sid: u8) -> bool {
    KNOWN.contains(&sid)
}

/// Human-readable service name
pub fn name(sid: u8) -> &'static str {
    match sid {
        DIAGNOSTIC_SESSION_CONTROL => "DiagnosticSessionControl",
        ECU_RESET => "ECUReset",
        CLEAR_DIAGNOSTIC_INFORMATION => "ClearDiagnosticInformation",
        READ_DTC_INFORMATION => "ReadDTCInformation",
        READ_DATA_BY_IDENTIFIER => "ReadDataByIdentifier",
        READ_MEMORY_BY_ADDRESS => "ReadMemoryByAddress",
        READ_SCALING_DATA_BY_IDENTIFIER => "ReadScalingDataByIdentifier",
        SECURITY_ACCESS => "SecurityAccess",
        COMMUNICATION_CONTROL => "CommunicationControl",
        READ_DATA_BY_PERIODIC_IDENTIFIER => "ReadDataByPeriodicIdentifier",
        DYNAMICALLY_DEFINE_DATA_IDENTIFIER => "DynamicallyDefineDataIdentifier",
        WRITE_DATA_BY_IDENTIFIER => "WriteDataByIdentifier",
        INPUT_OUTPUT_CONTROL_BY_IDENTIFIER => "InputOutputControlByIdentifier",
        ROUTINE_CONTROL => "RoutineControl",
        REQUEST_DOWNLOAD => "RequestDownload",
        REQUEST_UPLOAD => "RequestUpload",
        TRANSFER_DATA => "TransferData",
        REQUEST_TRANSFER_EXIT => "RequestTransferExit",
        REQUEST_FILE_TRANSFER => "RequestFileTransfer",
        WRITE_MEMORY_BY_ADDRESS => "WriteMemoryByAddress",
        TESTER_PRESENT => "TesterPresent",
        ACCESS_TIMING_PARAMETER => "AccessTimingParameter",
        SECURED_DATA_TRANSMISSION => "SecuredDataTransmission",
        CONTROL_DTC_SETTING => "ControlDTCSetting",
        RESPONSE_ON_EVENT => "ResponseOnEvent",
        LINK_CONTROL => "LinkControl",
        NEGATIVE_RESPONSE => "NegativeResponse",
        _ => "Unknown",
    }
}
