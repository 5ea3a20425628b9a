use core::fmt::Display;

use log::{debug, info, warn};

use super::{
    cmd::MmcCommand,
    constant::*,
    regs::{BusWidth, HostController, IntFlags, SpeedMode},
};

const INHIBIT_SPINS: u32 = 100_000;
const CLOCK_STABLE_SPINS: u32 = 100_000;

/// SDHCI-compatible controller mapped at `base_addr`.
#[derive(Debug)]
pub struct SdhciHost {
    base_addr: usize,
    base_clock: u32,
}

impl Display for SdhciHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "SDHCI Controller {{ base_addr: {:#x}, base_clock: {} }}", self.base_addr, self.base_clock)
    }
}

impl SdhciHost {
    /// Base clock taken from the capabilities register.
    pub fn new(base_addr: usize) -> Self {
        let mut host = Self { base_addr, base_clock: 0 };
        let caps = host.read_reg(EMMC_CAPABILITIES1);
        host.base_clock = ((caps & EMMC_CLOCK_BASE_MASK) >> EMMC_CLOCK_BASE_SHIFT) * 1_000_000;
        info!("{} created", host);
        host
    }

    /// For controllers whose capabilities register leaves the base clock at zero.
    pub fn with_base_clock(base_addr: usize, base_clock: u32) -> Self {
        let host = Self { base_addr, base_clock };
        info!("{} created", host);
        host
    }

    // Read a 32-bit register
    fn read_reg(&self, offset: u32) -> u32 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u32) }
    }

    // Read a 16-bit register
    fn read_reg16(&self, offset: u32) -> u16 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u16) }
    }

    // Read an 8-bit register
    fn read_reg8(&self, offset: u32) -> u8 {
        unsafe { core::ptr::read_volatile((self.base_addr + offset as usize) as *const u8) }
    }

    // Write a 32-bit register
    fn write_reg(&self, offset: u32, value: u32) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u32, value) }
    }

    // Write a 16-bit register
    fn write_reg16(&self, offset: u32, value: u16) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u16, value) }
    }

    // Write an 8-bit register
    fn write_reg8(&self, offset: u32, value: u8) {
        unsafe { core::ptr::write_volatile((self.base_addr + offset as usize) as *mut u8, value) }
    }

    fn wait_clock_stable(&self) {
        let mut timeout = CLOCK_STABLE_SPINS;
        while self.read_reg16(EMMC_CLOCK_CONTROL) & EMMC_CLOCK_INT_STABLE == 0 {
            if timeout == 0 {
                warn!("Internal clock not stable");
                return;
            }
            timeout -= 1;
        }
    }
}

/// Command register value for `cmd`.
pub fn command_bits(cmd: &MmcCommand) -> u16 {
    let mut command = (cmd.opcode as u16) << 8;

    if cmd.resp_type & MMC_RSP_PRESENT != 0 {
        if cmd.resp_type & MMC_RSP_136 != 0 {
            command |= EMMC_CMD_RESP_LONG;
        } else if cmd.resp_type & MMC_RSP_BUSY != 0 {
            command |= EMMC_CMD_RESP_SHORT_BUSY;
        } else {
            command |= EMMC_CMD_RESP_SHORT;
        }
    }

    if cmd.resp_type & MMC_RSP_CRC != 0 {
        command |= EMMC_CMD_CRC;
    }

    if cmd.resp_type & MMC_RSP_OPCODE != 0 {
        command |= EMMC_CMD_INDEX;
    }

    if cmd.data_present {
        command |= EMMC_CMD_DATA;
    }

    command
}

/// Transfer mode register value for a data command.
pub fn transfer_mode_bits(cmd: &MmcCommand) -> u16 {
    let mut mode = EMMC_TRNS_BLK_CNT_EN;
    if cmd.block_count > 1 {
        mode |= EMMC_TRNS_MULTI;
    }
    if cmd.data_dir_read {
        mode |= EMMC_TRNS_READ;
    }
    if cmd.dma {
        mode |= EMMC_TRNS_DMA;
    }
    mode
}

/// 10-bit divider split over the clock control register: low byte at 15:8, high bits at 7:6.
pub fn divider_bits(divider: u16) -> u16 {
    let div = divider & 0x3FF;
    ((div & 0xFF) << EMMC_DIVIDER_SHIFT) | ((div >> 8) << EMMC_DIVIDER_HI_SHIFT)
}

/// Timeout control exponent: the smallest `n` with `2^(13 + n)` covering `cycles`.
pub fn data_timeout_value(cycles: u32) -> u8 {
    let mut n = 0u8;
    while n < EMMC_TIMEOUT_MAX && (1u64 << (13 + n as u32)) < cycles as u64 {
        n += 1;
    }
    n
}

impl HostController for SdhciHost {
    fn base_clock_hz(&self) -> u32 {
        self.base_clock
    }

    fn power_on(&mut self) {
        self.write_reg8(EMMC_POWER_CTRL, EMMC_POWER_330 | EMMC_POWER_ON);
        // Every status latches; signalling is armed per transfer
        self.write_reg(EMMC_NORMAL_INT_STAT_EN, (IntFlags::STATIC | IntFlags::TRANSFER).bits());
        self.write_reg(EMMC_SIGNAL_ENABLE, 0);
    }

    fn power_off(&mut self) {
        self.write_reg8(EMMC_POWER_CTRL, 0);
    }

    fn enable_clock(&mut self, enable: bool) {
        let clk = self.read_reg16(EMMC_CLOCK_CONTROL);
        if enable {
            self.write_reg16(EMMC_CLOCK_CONTROL, clk | EMMC_CLOCK_INT_EN);
            self.wait_clock_stable();
            let clk = self.read_reg16(EMMC_CLOCK_CONTROL);
            self.write_reg16(EMMC_CLOCK_CONTROL, clk | EMMC_CLOCK_CARD_EN);
        } else {
            self.write_reg16(EMMC_CLOCK_CONTROL, clk & !EMMC_CLOCK_CARD_EN);
        }
    }

    fn set_clock_divider(&mut self, divider: u16) {
        let clk = self.read_reg16(EMMC_CLOCK_CONTROL);
        let card_en = clk & EMMC_CLOCK_CARD_EN;

        self.write_reg16(EMMC_CLOCK_CONTROL, clk & !EMMC_CLOCK_CARD_EN);
        self.write_reg16(EMMC_CLOCK_CONTROL, divider_bits(divider) | EMMC_CLOCK_INT_EN);
        self.wait_clock_stable();

        let clk = self.read_reg16(EMMC_CLOCK_CONTROL);
        self.write_reg16(EMMC_CLOCK_CONTROL, clk | card_en);
        debug!("Clock divider {}", divider);
    }

    fn set_speed_mode(&mut self, mode: SpeedMode) {
        let ctrl = self.read_reg8(EMMC_HOST_CTRL1);
        let ctrl = match mode {
            SpeedMode::Default => ctrl & !EMMC_CTRL_HISPD,
            SpeedMode::High => ctrl | EMMC_CTRL_HISPD,
        };
        self.write_reg8(EMMC_HOST_CTRL1, ctrl);
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        let mut ctrl = self.read_reg8(EMMC_HOST_CTRL1) & !(EMMC_CTRL_4BITBUS | EMMC_CTRL_8BITBUS);
        match width {
            BusWidth::One => {}
            BusWidth::Four => ctrl |= EMMC_CTRL_4BITBUS,
            BusWidth::Eight => ctrl |= EMMC_CTRL_8BITBUS,
        }
        self.write_reg8(EMMC_HOST_CTRL1, ctrl);
    }

    fn set_data_timeout(&mut self, cycles: u32) {
        self.write_reg8(EMMC_TIMEOUT_CONTROL, data_timeout_value(cycles));
    }

    fn send_command(&mut self, cmd: &MmcCommand) {
        let mut inhibit = EMMC_CMD_INHIBIT;
        if cmd.data_present {
            inhibit |= EMMC_DATA_INHIBIT;
        }
        let mut timeout = INHIBIT_SPINS;
        while self.read_reg(EMMC_PRESENT_STATE) & inhibit != 0 {
            if timeout == 0 {
                warn!("Command {} issued with the bus still inhibited", cmd.opcode);
                break;
            }
            timeout -= 1;
        }

        self.write_reg(EMMC_ARGUMENT, cmd.arg);

        if cmd.data_present {
            self.write_reg16(EMMC_BLOCK_SIZE, cmd.block_size);
            self.write_reg16(EMMC_BLOCK_COUNT, cmd.block_count);
            self.write_reg16(EMMC_XFER_MODE, transfer_mode_bits(cmd));
        }

        self.write_reg16(EMMC_COMMAND, command_bits(cmd));
    }

    fn response(&self) -> [u32; 4] {
        [
            self.read_reg(EMMC_RESPONSE),
            self.read_reg(EMMC_RESPONSE + 4),
            self.read_reg(EMMC_RESPONSE + 8),
            self.read_reg(EMMC_RESPONSE + 12),
        ]
    }

    fn read_data(&mut self) -> u32 {
        self.read_reg(EMMC_BUF_DATA)
    }

    fn write_data(&mut self, word: u32) {
        self.write_reg(EMMC_BUF_DATA, word);
    }

    fn data_port_addr(&self) -> usize {
        self.base_addr + EMMC_BUF_DATA as usize
    }

    fn data_line_busy(&self) -> bool {
        self.read_reg(EMMC_PRESENT_STATE) & (EMMC_DATA_INHIBIT | EMMC_DATA_LINE_ACTIVE) != 0
    }

    fn int_status(&self) -> IntFlags {
        IntFlags::from_bits_truncate(self.read_reg(EMMC_NORMAL_INT_STAT))
    }

    fn clear_int_status(&mut self, flags: IntFlags) {
        // Write one to clear
        self.write_reg(EMMC_NORMAL_INT_STAT, flags.bits());
    }

    fn int_enabled(&self) -> IntFlags {
        IntFlags::from_bits_truncate(self.read_reg(EMMC_SIGNAL_ENABLE))
    }

    fn enable_interrupts(&mut self, flags: IntFlags) {
        let enabled = self.read_reg(EMMC_SIGNAL_ENABLE);
        self.write_reg(EMMC_SIGNAL_ENABLE, enabled | flags.bits());
    }

    fn disable_interrupts(&mut self, flags: IntFlags) {
        let enabled = self.read_reg(EMMC_SIGNAL_ENABLE);
        self.write_reg(EMMC_SIGNAL_ENABLE, enabled & !flags.bits());
    }

    fn card_detect(&self) -> bool {
        self.read_reg(EMMC_PRESENT_STATE) & EMMC_CARD_DETECT_PIN != 0
    }

    fn card_inserted(&self) -> bool {
        self.read_reg(EMMC_PRESENT_STATE) & EMMC_CARD_INSERTED != 0
    }
}
