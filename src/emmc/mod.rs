mod block;
mod cmd;
mod info;
mod init;
mod irq;
mod regs;
mod sdhci;

pub mod clock;
pub mod constant;

use core::fmt::Display;

use bitflags::bitflags;
use log::{debug, info};

use crate::err::{ErrorCode, MmcError};
use clock::{Clock, TimeoutPolicy};
use constant::*;

pub use block::TransferBuffer;
pub use cmd::{MmcCommand, data_errors, merge_r2, r1_errors};
pub use info::{CardInfo, CardState, CardVoltage, CidRegister, CsdRegister, geometry};
pub use irq::{Completion, Event, InterruptController, NoCompletion, SharedCard, route_interrupt};
pub use regs::{
    BusWidth, DmaChannel, DmaEngine, DmaLink, DmaTransfer, HostController, IntFlags, NoDma,
    SpeedMode,
};
pub use sdhci::SdhciHost;

bitflags! {
    /// Which operation is in flight and what drives it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Context: u8 {
        const READ_SINGLE = 1 << 0;
        const READ_MULTI = 1 << 1;
        const WRITE_SINGLE = 1 << 2;
        const WRITE_MULTI = 1 << 3;
        const IT = 1 << 4;
        const DMA = 1 << 5;
    }
}

impl Context {
    pub const READ: Self = Self::READ_SINGLE.union(Self::READ_MULTI);
    pub const WRITE: Self = Self::WRITE_SINGLE.union(Self::WRITE_MULTI);
    pub const MULTI: Self = Self::READ_MULTI.union(Self::WRITE_MULTI);
    pub const ASYNC: Self = Self::IT.union(Self::DMA);

    pub fn operation(read: bool, blocks: u32) -> Self {
        match (read, blocks > 1) {
            (true, false) => Self::READ_SINGLE,
            (true, true) => Self::READ_MULTI,
            (false, false) => Self::WRITE_SINGLE,
            (false, true) => Self::WRITE_MULTI,
        }
    }
}

/// Operating voltage window offered to the card with CMD1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltageMode {
    High,
    Dual,
}

impl VoltageMode {
    pub fn ocr_argument(self) -> u32 {
        match self {
            VoltageMode::High => OCR_SECTOR_MODE | OCR_VDD_HIGH,
            VoltageMode::Dual => OCR_SECTOR_MODE | OCR_VDD_HIGH | OCR_VDD_LOW,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardDetect {
    Ignore,
    Required,
}

#[derive(Debug, Clone, Copy)]
pub struct MmcConfig {
    pub voltage: VoltageMode,
    pub card_detect: CardDetect,
    pub bus_width: BusWidth,
    pub clock_divider: u16,
    pub speed_mode: SpeedMode,
    pub timeout_policy: TimeoutPolicy,
    pub command_timeout_ms: u32,
    pub data_timeout_ms: u32,
    pub op_cond_retries: u32,
    pub switch_retries: u32,
}

impl Default for MmcConfig {
    fn default() -> Self {
        Self {
            voltage: VoltageMode::High,
            card_detect: CardDetect::Ignore,
            bus_width: BusWidth::One,
            clock_divider: 0,
            speed_mode: SpeedMode::Default,
            timeout_policy: TimeoutPolicy::Monotonic,
            command_timeout_ms: 5000,
            data_timeout_ms: 100,
            op_cond_retries: 0xFFFF,
            switch_retries: 1000,
        }
    }
}

/// A single MMC/eMMC card session bound to one host controller.
pub struct MmcCard<H, T, D = NoDma, N = NoCompletion> {
    host: H,
    clock: T,
    dma: Option<DmaLink<D>>,
    notify: N,
    config: MmcConfig,
    transfer: Option<TransferBuffer>,
    remaining: usize,
    context: Context,
    error_code: ErrorCode,
    info: CardInfo,
    cid: [u32; 4],
    csd: [u32; 4],
    ocr: u32,
    ext_card_type: Option<u8>,
}

impl<H, T, D, N> Display for MmcCard<H, T, D, N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "MMC card {{ rca: {}, blocks: {}, block_size: {}, context: {:?}, error: {} }}",
            self.info.rel_card_addr,
            self.info.log_block_nbr,
            self.info.log_block_size,
            self.context,
            self.error_code
        )
    }
}

impl<H: HostController, T: Clock> MmcCard<H, T> {
    pub fn new(host: H, clock: T, config: MmcConfig) -> Self {
        Self {
            host,
            clock,
            dma: None,
            notify: NoCompletion,
            config,
            transfer: None,
            remaining: 0,
            context: Context::empty(),
            error_code: ErrorCode::empty(),
            info: CardInfo::default(),
            cid: [0; 4],
            csd: [0; 4],
            ocr: 0,
            ext_card_type: None,
        }
    }
}

impl<H, T, D, N> MmcCard<H, T, D, N> {
    /// Attach a DMA engine; `tx` moves memory to the card, `rx` the card to memory.
    pub fn with_dma<E: DmaEngine>(self, engine: E, tx: DmaChannel, rx: DmaChannel) -> MmcCard<H, T, E, N> {
        MmcCard {
            host: self.host,
            clock: self.clock,
            dma: Some(DmaLink { engine, tx, rx }),
            notify: self.notify,
            config: self.config,
            transfer: self.transfer,
            remaining: self.remaining,
            context: self.context,
            error_code: self.error_code,
            info: self.info,
            cid: self.cid,
            csd: self.csd,
            ocr: self.ocr,
            ext_card_type: self.ext_card_type,
        }
    }

    pub fn with_completion<C: Completion>(self, notify: C) -> MmcCard<H, T, D, C> {
        MmcCard {
            host: self.host,
            clock: self.clock,
            dma: self.dma,
            notify,
            config: self.config,
            transfer: self.transfer,
            remaining: self.remaining,
            context: self.context,
            error_code: self.error_code,
            info: self.info,
            cid: self.cid,
            csd: self.csd,
            ocr: self.ocr,
            ext_card_type: self.ext_card_type,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn dma(&self) -> Option<&D> {
        self.dma.as_ref().map(|link| &link.engine)
    }

    pub fn completion(&self) -> &N {
        &self.notify
    }

    pub fn completion_mut(&mut self) -> &mut N {
        &mut self.notify
    }

    pub fn config(&self) -> &MmcConfig {
        &self.config
    }

    pub fn context(&self) -> Context {
        self.context
    }

    pub fn is_idle(&self) -> bool {
        self.context.is_empty()
    }

    pub fn get_error_code(&self) -> ErrorCode {
        self.error_code
    }

    pub fn get_card_info(&self) -> CardInfo {
        self.info
    }

    /// Raw CID words, word 0 holding bits 127..96.
    pub fn cid_raw(&self) -> [u32; 4] {
        self.cid
    }

    /// Raw CSD words, word 0 holding bits 127..96.
    pub fn csd_raw(&self) -> [u32; 4] {
        self.csd
    }

    pub fn get_cid(&self) -> CidRegister {
        CidRegister::from_words(&self.cid)
    }

    pub fn get_csd(&self) -> CsdRegister {
        CsdRegister::from_words(&self.csd)
    }

    pub fn ocr(&self) -> u32 {
        self.ocr
    }

    /// Hand back the buffer of the last interrupt or DMA transfer once it has retired.
    pub fn take_buffer(&mut self) -> Option<TransferBuffer> {
        if self.context.intersects(Context::ASYNC) {
            return None;
        }
        self.transfer.take()
    }
}

impl<H, T, D, N> MmcCard<H, T, D, N>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    pub fn get_card_state(&mut self) -> Result<CardState, MmcError> {
        let status = self.send_status()?;
        Ok(CardState::from_status(status))
    }

    /// Power the card down. The handle needs a fresh `init` before further use.
    pub fn deinit(&mut self) -> Result<(), MmcError> {
        info!("Deinit MMC card");
        self.host.disable_interrupts(IntFlags::TRANSFER);
        self.host.clear_int_status(IntFlags::STATIC);
        self.host.enable_clock(false);
        self.host.power_off();
        self.context = Context::empty();
        self.transfer = None;
        self.remaining = 0;
        self.error_code = ErrorCode::empty();
        debug!("{}", self);
        Ok(())
    }
}
