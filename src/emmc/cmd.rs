use log::{debug, warn};

use crate::err::{ErrorCode, MmcError};

use super::{
    MmcCard, clock::{Clock, Deadline}, constant::*, irq::Completion,
    regs::{DmaEngine, HostController, IntFlags},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmcCommand {
    pub opcode: u8,
    pub arg: u32,
    pub resp_type: u32,
    pub data_present: bool,
    pub data_dir_read: bool,
    pub dma: bool,
    pub block_size: u16,
    pub block_count: u16,
}

impl MmcCommand {
    pub fn new(opcode: u8, arg: u32, resp_type: u32) -> Self {
        Self {
            opcode,
            arg,
            resp_type,
            data_present: false,
            data_dir_read: true,
            dma: false,
            block_size: 0,
            block_count: 0,
        }
    }

    pub fn with_data(mut self, block_size: u16, block_count: u16, is_read: bool) -> Self {
        self.data_present = true;
        self.data_dir_read = is_read;
        self.block_size = block_size;
        self.block_count = block_count;
        self
    }

    pub fn with_dma(mut self) -> Self {
        self.dma = true;
        self
    }

    /// CMD6 argument writing `value` into EXT_CSD byte `index`.
    pub fn switch(index: u8, value: u8) -> Self {
        let arg = ((MMC_SWITCH_MODE_WRITE_BYTE as u32) << 24)
            | ((index as u32) << 16)
            | ((value as u32) << 8);
        Self::new(MMC_SWITCH, arg, MMC_RSP_R1B)
    }
}

/// Rebuilds a 136-bit response from the controller's response registers.
///
/// The controller drops the CRC byte and stores bits 127..8 right-aligned across the four
/// registers, so each output word borrows the top byte of the next lower register. Word 0 ends
/// up holding bits 127..96 and the CRC position of word 3 reads as zero.
pub fn merge_r2(raw: [u32; 4]) -> [u32; 4] {
    [
        raw[3] << 8 | raw[2] >> 24,
        raw[2] << 8 | raw[1] >> 24,
        raw[1] << 8 | raw[0] >> 24,
        raw[0] << 8,
    ]
}

/// Error bits of an R1 card status, folded into the driver taxonomy.
pub fn r1_errors(status: u32) -> ErrorCode {
    const MAP: [(u32, ErrorCode); 14] = [
        (R1_OUT_OF_RANGE, ErrorCode::ADDR_OUT_OF_RANGE),
        (R1_ADDRESS_ERROR, ErrorCode::ADDR_MISALIGNED),
        (R1_BLOCK_LEN_ERROR, ErrorCode::BLOCK_LEN_ERR),
        (R1_ERASE_SEQ_ERROR, ErrorCode::ERASE_SEQ_ERR),
        (R1_ERASE_PARAM, ErrorCode::BAD_ERASE_PARAM),
        (R1_WP_VIOLATION, ErrorCode::WRITE_PROT_VIOLATION),
        (R1_LOCK_UNLOCK_FAILED, ErrorCode::LOCK_UNLOCK_FAILED),
        (R1_COM_CRC_ERROR, ErrorCode::COM_CRC_FAILED),
        (R1_ILLEGAL_COMMAND, ErrorCode::ILLEGAL_CMD),
        (R1_CARD_ECC_FAILED, ErrorCode::CARD_ECC_FAILED),
        (R1_CC_ERROR, ErrorCode::CC_ERROR),
        (R1_ERROR, ErrorCode::GENERAL_UNKNOWN_ERROR),
        (R1_CID_CSD_OVERWRITE, ErrorCode::CID_CSD_OVERWRITE),
        (R1_SWITCH_ERROR, ErrorCode::SWITCH_ERROR),
    ];

    MAP.iter()
        .filter(|(bit, _)| status & bit != 0)
        .fold(ErrorCode::empty(), |acc, (_, code)| acc | *code)
}

/// Data-path error flags of the controller, folded into the driver taxonomy.
pub fn data_errors(status: IntFlags) -> ErrorCode {
    let mut code = ErrorCode::empty();
    if status.contains(IntFlags::DATA_END_BIT) {
        code |= ErrorCode::DATA_STOP_BIT;
    }
    if status.contains(IntFlags::DATA_CRC) {
        code |= ErrorCode::DATA_CRC_FAIL;
    }
    if status.contains(IntFlags::DATA_TIMEOUT) {
        code |= ErrorCode::DATA_TIMEOUT;
    }
    code
}

impl<H, T, D, N> MmcCard<H, T, D, N>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    // Send a command to the card and wait for its response
    pub(crate) fn send_command(&mut self, cmd: &MmcCommand) -> Result<(), MmcError> {
        debug!(
            "Sending command: opcode={}, arg={:#x}, resp_type={:#x}",
            cmd.opcode, cmd.arg, cmd.resp_type
        );

        self.host
            .clear_int_status(IntFlags::COMMAND_COMPLETE | IntFlags::ERROR | IntFlags::CMD_ERRORS);
        self.host.send_command(cmd);

        let mut deadline = Deadline::after(&self.clock, self.config.command_timeout_ms);
        loop {
            let status = self.host.int_status();

            if status.contains(IntFlags::CMD_TIMEOUT) {
                debug!("Command {} timed out: status={:#x}", cmd.opcode, status.bits());
                self.host.clear_int_status(IntFlags::STATIC);
                self.error_code |= ErrorCode::CMD_RSP_TIMEOUT;
                return Err(MmcError::Timeout);
            }

            // R3 carries no CRC, the flag is meaningless there
            if status.contains(IntFlags::CMD_CRC) && cmd.resp_type & MMC_RSP_CRC != 0 {
                self.host.clear_int_status(IntFlags::STATIC);
                self.error_code |= ErrorCode::CMD_CRC_FAIL;
                return Err(MmcError::Failed);
            }

            if status.intersects(IntFlags::CMD_INDEX | IntFlags::CMD_END_BIT) {
                self.host.clear_int_status(IntFlags::STATIC);
                self.error_code |= ErrorCode::UNSUPPORTED_FEATURE;
                return Err(MmcError::Failed);
            }

            if status.contains(IntFlags::COMMAND_COMPLETE) {
                break;
            }

            if deadline.expired(&self.clock) {
                warn!("No response to command {}", cmd.opcode);
                self.host.clear_int_status(IntFlags::STATIC);
                self.error_code |= ErrorCode::CMD_RSP_TIMEOUT;
                return Err(MmcError::Timeout);
            }
        }

        self.host
            .clear_int_status(IntFlags::COMMAND_COMPLETE | IntFlags::ERROR | IntFlags::CMD_CRC);

        if cmd.resp_type & MMC_RSP_OPCODE != 0 {
            let status = self.host.response()[0];
            let errors = r1_errors(status);
            if !errors.is_empty() {
                debug!("Command {} card status {:#x}: {}", cmd.opcode, status, errors);
                self.host.clear_int_status(IntFlags::STATIC);
                self.error_code |= errors;
                return Err(MmcError::Failed);
            }
        }

        Ok(())
    }

    pub(crate) fn response_r1(&self) -> u32 {
        self.host.response()[0]
    }

    pub(crate) fn response_r2(&self) -> [u32; 4] {
        merge_r2(self.host.response())
    }

    pub(crate) fn send_status(&mut self) -> Result<u32, MmcError> {
        let rca = self.info.rel_card_addr as u32;
        let cmd = MmcCommand::new(MMC_SEND_STATUS, rca << 16, MMC_RSP_R1);
        self.send_command(&cmd)?;
        Ok(self.response_r1())
    }

    pub(crate) fn stop_transmission(&mut self) -> Result<(), MmcError> {
        let cmd = MmcCommand::new(MMC_STOP_TRANSMISSION, 0, MMC_RSP_R1B);
        self.send_command(&cmd)
    }

    pub(crate) fn set_block_len(&mut self) -> Result<(), MmcError> {
        let cmd = MmcCommand::new(MMC_SET_BLOCKLEN, MMC_BLOCK_SIZE as u32, MMC_RSP_R1);
        self.send_command(&cmd)
    }
}
