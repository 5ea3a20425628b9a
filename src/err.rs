// ===== Types and Structures =====

use core::fmt;

use bitflags::bitflags;

/// Return code of every public card operation.
///
/// `Failed` is the generic failure: the reason is accumulated in the card's [`ErrorCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcError {
    Failed,
    InvalidArgument,
    Timeout,
    InvalidMode,
    Busy,
}

impl fmt::Display for MmcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MmcError::Failed => write!(f, "Operation failed, see error code"),
            MmcError::InvalidArgument => write!(f, "Invalid argument"),
            MmcError::Timeout => write!(f, "Command timeout"),
            MmcError::InvalidMode => write!(f, "Clock divider exceeds the speed mode ceiling"),
            MmcError::Busy => write!(f, "A transfer is already in flight"),
        }
    }
}

bitflags! {
    /// Error kinds accumulated over the most recent operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ErrorCode: u32 {
        const CMD_CRC_FAIL = 1 << 0;
        const DATA_CRC_FAIL = 1 << 1;
        const CMD_RSP_TIMEOUT = 1 << 2;
        const DATA_TIMEOUT = 1 << 3;
        const DATA_STOP_BIT = 1 << 4;
        const ADDR_MISALIGNED = 1 << 5;
        const BLOCK_LEN_ERR = 1 << 6;
        const ERASE_SEQ_ERR = 1 << 7;
        const BAD_ERASE_PARAM = 1 << 8;
        const WRITE_PROT_VIOLATION = 1 << 9;
        const LOCK_UNLOCK_FAILED = 1 << 10;
        const COM_CRC_FAILED = 1 << 11;
        const ILLEGAL_CMD = 1 << 12;
        const CARD_ECC_FAILED = 1 << 13;
        const CC_ERROR = 1 << 14;
        const GENERAL_UNKNOWN_ERROR = 1 << 15;
        const CID_CSD_OVERWRITE = 1 << 16;
        const SWITCH_ERROR = 1 << 17;
        const ADDR_OUT_OF_RANGE = 1 << 18;
        const INVALID_VOLTAGE_RANGE = 1 << 19;
        const REQUEST_NOT_APPLICABLE = 1 << 20;
        const UNSUPPORTED_FEATURE = 1 << 21;
        const CARD_NOT_PRESENT = 1 << 22;
        const DMA_UNAVAILABLE = 1 << 23;
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        bitflags::parser::to_writer(self, f)
    }
}
