//! Collaborator surface the card manager drives: the host controller and the DMA engine.

use bitflags::bitflags;

use super::cmd::MmcCommand;

bitflags! {
    /// Host controller interrupt status / enable bits.
    ///
    /// Laid out like the SDHCI normal (low half) and error (high half) interrupt registers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntFlags: u32 {
        const COMMAND_COMPLETE = 1 << 0;
        const TRANSFER_COMPLETE = 1 << 1;
        const BUFFER_WRITE_READY = 1 << 4;
        const BUFFER_READ_READY = 1 << 5;
        const ERROR = 1 << 15;
        const CMD_TIMEOUT = 1 << 16;
        const CMD_CRC = 1 << 17;
        const CMD_END_BIT = 1 << 18;
        const CMD_INDEX = 1 << 19;
        const DATA_TIMEOUT = 1 << 20;
        const DATA_CRC = 1 << 21;
        const DATA_END_BIT = 1 << 22;
    }
}

impl IntFlags {
    pub const CMD_ERRORS: Self = Self::CMD_TIMEOUT
        .union(Self::CMD_CRC)
        .union(Self::CMD_END_BIT)
        .union(Self::CMD_INDEX);

    pub const DATA_ERRORS: Self = Self::DATA_TIMEOUT
        .union(Self::DATA_CRC)
        .union(Self::DATA_END_BIT);

    /// Latched flags; the buffer-ready bits follow the FIFO level instead.
    pub const STATIC: Self = Self::COMMAND_COMPLETE
        .union(Self::TRANSFER_COMPLETE)
        .union(Self::ERROR)
        .union(Self::CMD_ERRORS)
        .union(Self::DATA_ERRORS);

    /// Every interrupt a data transfer may arm.
    pub const TRANSFER: Self = Self::TRANSFER_COMPLETE
        .union(Self::BUFFER_WRITE_READY)
        .union(Self::BUFFER_READ_READY)
        .union(Self::DATA_ERRORS);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusWidth {
    One,
    Four,
    Eight,
}

impl BusWidth {
    pub fn bits(self) -> u8 {
        match self {
            BusWidth::One => 1,
            BusWidth::Four => 4,
            BusWidth::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedMode {
    Default,
    High,
}

/// Register-level contract of an SD/MMC host controller.
pub trait HostController {
    /// Frequency feeding the card clock divider.
    fn base_clock_hz(&self) -> u32;

    fn power_on(&mut self);
    fn power_off(&mut self);
    fn enable_clock(&mut self, enable: bool);
    /// Card clock becomes `base / (2 * divider)`, or `base` for a zero divider.
    fn set_clock_divider(&mut self, divider: u16);
    fn set_speed_mode(&mut self, mode: SpeedMode);
    fn set_bus_width(&mut self, width: BusWidth);
    /// Data timeout in card clock cycles.
    fn set_data_timeout(&mut self, cycles: u32);

    /// Load argument, transfer mode and command registers; the command starts immediately.
    fn send_command(&mut self, cmd: &MmcCommand);
    /// The four raw response registers, lowest address first.
    fn response(&self) -> [u32; 4];

    fn read_data(&mut self) -> u32;
    fn write_data(&mut self, word: u32);
    /// Bus address of the data port, used as DMA source or destination.
    fn data_port_addr(&self) -> usize;
    fn data_line_busy(&self) -> bool;

    /// Latched interrupt status. Buffer-read-ready and buffer-write-ready are raised once per
    /// block and stay set until cleared; the driver clears them after moving a whole block.
    fn int_status(&self) -> IntFlags;
    /// Write-1-to-clear acknowledge of `flags`.
    fn clear_int_status(&mut self, flags: IntFlags);
    fn int_enabled(&self) -> IntFlags;
    fn enable_interrupts(&mut self, flags: IntFlags);
    fn disable_interrupts(&mut self, flags: IntFlags);

    fn card_detect(&self) -> bool;
    fn card_inserted(&self) -> bool;
}

pub type DmaChannel = u8;

/// One programmed burst: `blocks` repetitions of `units_per_block` 32-bit units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTransfer {
    pub src: usize,
    pub dst: usize,
    pub units_per_block: u32,
    pub blocks: u32,
}

pub trait DmaEngine {
    fn configure(&mut self, channel: DmaChannel, transfer: &DmaTransfer);
    fn enable(&mut self, channel: DmaChannel);
    fn disable(&mut self, channel: DmaChannel);
    fn clear_status(&mut self, channel: DmaChannel);
}

/// Placeholder for handles built without a DMA engine.
#[derive(Debug)]
pub enum NoDma {}

impl DmaEngine for NoDma {
    fn configure(&mut self, _channel: DmaChannel, _transfer: &DmaTransfer) {
        match *self {}
    }

    fn enable(&mut self, _channel: DmaChannel) {
        match *self {}
    }

    fn disable(&mut self, _channel: DmaChannel) {
        match *self {}
    }

    fn clear_status(&mut self, _channel: DmaChannel) {
        match *self {}
    }
}

#[derive(Debug)]
pub struct DmaLink<D> {
    pub engine: D,
    pub tx: DmaChannel,
    pub rx: DmaChannel,
}
