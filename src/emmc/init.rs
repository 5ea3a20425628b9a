use log::{debug, info, warn};

use crate::err::{ErrorCode, MmcError};

use super::{
    CardDetect, Context, MmcCard,
    block::TransferData,
    clock::{Clock, Deadline, card_clock_hz, divider_for, max_dtr},
    cmd::MmcCommand,
    constant::*,
    info::{CardInfo, CardState, CardVoltage, CsdRegister, geometry},
    irq::Completion,
    regs::{BusWidth, DmaEngine, HostController, IntFlags, SpeedMode},
};

impl<H, T, D, N> MmcCard<H, T, D, N>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    /// Bring the card from power-up to the Transfer state with the configured bus parameters.
    ///
    /// Every step aborts the sequence on failure and nothing already applied is rolled back,
    /// so a failed `init` leaves the handle unusable until the card is power cycled.
    pub fn init(&mut self) -> Result<(), MmcError> {
        info!("Init MMC card");

        self.error_code = ErrorCode::empty();
        self.context = Context::empty();

        let base = self.host.base_clock_hz();
        let card_clock = card_clock_hz(base, self.config.clock_divider);
        if card_clock > max_dtr(self.config.speed_mode) {
            warn!(
                "Divider {} gives {} Hz, over the {:?} speed ceiling",
                self.config.clock_divider, card_clock, self.config.speed_mode
            );
            return Err(MmcError::InvalidMode);
        }

        self.power_on()?;
        self.mmc_power_up_voltage()?;
        self.mmc_identify()?;

        // Select card with CMD7
        let rca = self.info.rel_card_addr as u32;
        let cmd7 = MmcCommand::new(MMC_SELECT_CARD, rca << 16, MMC_RSP_R1B);
        self.send_command(&cmd7)?;
        debug!("cmd7: {:#x}", self.response_r1());

        let csd = CsdRegister::from_words(&self.csd);
        if csd.spec_vers() >= 4 {
            self.mmc_read_ext_csd(&csd)?;
        }

        self.mmc_select_bus_width()?;
        self.mmc_select_speed()?;

        self.host.clear_int_status(IntFlags::STATIC);
        info!(
            "MMC card ready: {} blocks of {} bytes, {}-bit bus, {:?} speed",
            self.info.log_block_nbr,
            self.info.log_block_size,
            self.config.bus_width.bits(),
            self.config.speed_mode
        );
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), MmcError> {
        if self.config.card_detect == CardDetect::Required && !self.host.card_detect() {
            info!("No card in slot");
            self.error_code |= ErrorCode::CARD_NOT_PRESENT;
            return Err(MmcError::Failed);
        }

        let div = divider_for(self.host.base_clock_hz(), MMC_INIT_CLOCK_HZ);
        debug!("Identification clock divider {}", div);

        self.host.enable_clock(false);
        self.host.set_clock_divider(div);
        self.host.set_bus_width(BusWidth::One);
        self.host.set_speed_mode(SpeedMode::Default);
        self.host.power_on();
        self.host.enable_clock(true);
        self.host.clear_int_status(IntFlags::STATIC);
        Ok(())
    }

    fn mmc_power_up_voltage(&mut self) -> Result<(), MmcError> {
        let cmd0 = MmcCommand::new(MMC_GO_IDLE_STATE, 0, MMC_RSP_NONE);
        self.send_command(&cmd0)?;

        let arg = self.config.voltage.ocr_argument();
        let mut ocr = 0;
        let mut trials = 0;
        while ocr & OCR_BUSY == 0 {
            if trials >= self.config.op_cond_retries {
                info!("Card never left power-up busy after {} tries", trials);
                self.error_code |= ErrorCode::INVALID_VOLTAGE_RANGE;
                return Err(MmcError::Failed);
            }
            trials += 1;

            let cmd1 = MmcCommand::new(MMC_SEND_OP_COND, arg, MMC_RSP_R3);
            self.send_command(&cmd1)?;
            ocr = self.response_r1();
        }

        debug!("OCR {:#x} after {} tries", ocr, trials);
        self.ocr = ocr;
        self.info.voltage = CardVoltage::from_ocr(ocr);
        Ok(())
    }

    fn mmc_identify(&mut self) -> Result<(), MmcError> {
        // Send CMD2 to get CID
        let cmd2 = MmcCommand::new(MMC_ALL_SEND_CID, 0, MMC_RSP_R2);
        self.send_command(&cmd2)?;
        self.cid = self.response_r2();

        // Send CMD3 to hand out the RCA
        let cmd3 = MmcCommand::new(MMC_SET_RELATIVE_ADDR, (MMC_DEFAULT_RCA as u32) << 16, MMC_RSP_R1);
        self.send_command(&cmd3)?;
        self.info.rel_card_addr = MMC_DEFAULT_RCA;

        // Send CMD9 to get CSD
        let cmd9 = MmcCommand::new(MMC_SEND_CSD, (MMC_DEFAULT_RCA as u32) << 16, MMC_RSP_R2);
        self.send_command(&cmd9)?;
        self.csd = self.response_r2();

        let csd = CsdRegister::from_words(&self.csd);
        let (block_nbr, block_size, log_block_nbr) = geometry(&csd);
        self.info = CardInfo {
            voltage: self.info.voltage,
            class: csd.ccc(),
            rel_card_addr: MMC_DEFAULT_RCA,
            block_nbr,
            block_size,
            log_block_nbr,
            log_block_size: MMC_BLOCK_SIZE as u32,
        };

        debug!("CID {:x?}, CSD {:x?}", self.cid, self.csd);
        debug!("Card info {:?}", self.info);
        Ok(())
    }

    fn mmc_read_ext_csd(&mut self, csd: &CsdRegister) -> Result<(), MmcError> {
        let mut ext_csd = [0u8; MMC_BLOCK_SIZE];
        let cmd8 = MmcCommand::new(MMC_SEND_EXT_CSD, 0, MMC_RSP_R1).with_data(MMC_BLOCK_SIZE as u16, 1, true);
        self.polling_transfer(&cmd8, TransferData::Read(&mut ext_csd), self.config.data_timeout_ms)?;

        debug!("EXT_CSD rev {}, card type {:#x}", ext_csd[EXT_CSD_REV], ext_csd[EXT_CSD_CARD_TYPE]);
        self.ext_card_type = Some(ext_csd[EXT_CSD_CARD_TYPE]);

        if csd.extended_capacity() {
            let sectors = u32::from_le_bytes([
                ext_csd[EXT_CSD_SEC_CNT],
                ext_csd[EXT_CSD_SEC_CNT + 1],
                ext_csd[EXT_CSD_SEC_CNT + 2],
                ext_csd[EXT_CSD_SEC_CNT + 3],
            ]);
            info!("High capacity card, {} sectors", sectors);
            self.info.block_nbr = sectors;
            self.info.block_size = MMC_BLOCK_SIZE as u32;
            self.info.log_block_nbr = sectors;
        }
        Ok(())
    }

    fn mmc_select_bus_width(&mut self) -> Result<(), MmcError> {
        let width = self.config.bus_width;
        let value = match width {
            BusWidth::One => EXT_CSD_BUS_WIDTH_1,
            BusWidth::Four => EXT_CSD_BUS_WIDTH_4,
            BusWidth::Eight => EXT_CSD_BUS_WIDTH_8,
        };

        self.mmc_switch(EXT_CSD_BUS_WIDTH, value)?;

        // Card and controller must agree, so the controller follows only once the card did
        self.host.set_bus_width(width);
        debug!("Bus width set to {}", width.bits());
        Ok(())
    }

    fn mmc_select_speed(&mut self) -> Result<(), MmcError> {
        if self.config.speed_mode == SpeedMode::High {
            if let Some(card_type) = self.ext_card_type {
                if card_type & (EXT_CSD_CARD_TYPE_26 | EXT_CSD_CARD_TYPE_52) == 0 {
                    info!("Card does not support high speed timing");
                    self.error_code |= ErrorCode::REQUEST_NOT_APPLICABLE;
                    return Err(MmcError::Failed);
                }
            }
            self.mmc_switch(EXT_CSD_HS_TIMING, EXT_CSD_TIMING_HS)?;
        }

        self.host.set_clock_divider(self.config.clock_divider);
        self.host.set_speed_mode(self.config.speed_mode);
        Ok(())
    }

    /// CMD6 followed by the status poll that confirms the card took the new setting.
    fn mmc_switch(&mut self, index: u8, value: u8) -> Result<(), MmcError> {
        let cmd6 = MmcCommand::switch(index, value);
        self.send_command(&cmd6)?;
        debug!("cmd6 {:#x}", self.response_r1());

        let mut trials = 0;
        loop {
            if trials >= self.config.switch_retries {
                info!("Switch of EXT_CSD[{}] still busy after {} polls", index, trials);
                self.error_code |= ErrorCode::REQUEST_NOT_APPLICABLE;
                return Err(MmcError::Failed);
            }
            trials += 1;

            let status = self.send_status()?;
            if CardState::from_status(status) == CardState::Transfer && status & R1_READY_FOR_DATA != 0 {
                break;
            }
        }

        let mut deadline = Deadline::after(&self.clock, self.config.data_timeout_ms);
        while self.host.data_line_busy() {
            if deadline.expired(&self.clock) {
                self.error_code |= ErrorCode::DATA_TIMEOUT;
                return Err(MmcError::Timeout);
            }
        }
        Ok(())
    }
}
