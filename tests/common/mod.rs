#![allow(dead_code)]

//! Simulated eMMC card wired behind a fake host controller and DMA engine.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
    time::Duration,
};

use mmc_card::{
    ErrorCode,
    emmc::{
        BusWidth, Completion, DmaChannel, DmaEngine, DmaTransfer, HostController, IntFlags,
        InterruptController, MmcCard, MmcCommand, MmcConfig, SpeedMode, clock::Clock, constant::*,
    },
};

pub const BASE_CLOCK: u32 = 200_000_000;
pub const PORT_ADDR: usize = 0x1000_0020;
pub const TX: DmaChannel = 4;
pub const RX: DmaChannel = 5;

/// CID as held in the four response registers.
pub const RAW_CID: [u32; 4] = [0x5678_9A0B, 0x4743_1234, 0x4D41_4732, 0x0015_0100];

const ERASED: u8 = 0xFF;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Config every test starts from: 25 MHz card clock, 4-bit bus.
pub fn config() -> MmcConfig {
    MmcConfig {
        bus_width: BusWidth::Four,
        clock_divider: 4,
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
pub struct CardModel {
    pub spec_vers: u8,
    pub ccc: u16,
    pub read_bl_len: u8,
    pub c_size: u16,
    pub c_size_mult: u8,
    pub sec_count: u32,
    pub card_type: u8,
    pub dual_voltage: bool,
}

impl CardModel {
    /// 512 MiB card, byte addressed.
    pub fn small() -> Self {
        Self {
            spec_vers: 4,
            ccc: 0x0F5,
            read_bl_len: 9,
            c_size: 2047,
            c_size_mult: 7,
            sec_count: 0,
            card_type: EXT_CSD_CARD_TYPE_26 | EXT_CSD_CARD_TYPE_52,
            dual_voltage: false,
        }
    }

    /// Pre-4.0 card without EXT_CSD, 2048 blocks.
    pub fn legacy() -> Self {
        Self {
            spec_vers: 3,
            c_size: 511,
            c_size_mult: 0,
            ..Self::small()
        }
    }

    pub fn high_capacity(sectors: u32) -> Self {
        Self {
            c_size: 0xFFF,
            sec_count: sectors,
            ..Self::small()
        }
    }

    pub fn csd_words(&self) -> [u32; 4] {
        let value = 3u128 << 126
            | (self.spec_vers as u128) << 122
            | 0x32u128 << 96
            | (self.ccc as u128) << 84
            | (self.read_bl_len as u128) << 80
            | (self.c_size as u128) << 62
            | (self.c_size_mult as u128) << 47
            | 9u128 << 22;
        [
            (value >> 96) as u32,
            (value >> 64) as u32,
            (value >> 32) as u32,
            value as u32,
        ]
    }

    pub fn capacity(&self) -> u32 {
        if self.spec_vers >= 4 && self.c_size == 0xFFF {
            return self.sec_count;
        }
        let block_nbr = (self.c_size as u32 + 1) << (self.c_size_mult as u32 + 2);
        let block_size = 1u32 << self.read_bl_len;
        block_nbr * (block_size / 512)
    }

    pub fn sector_addressing(&self) -> bool {
        self.capacity() >= HIGH_CAPACITY_THRESHOLD
    }

    fn ocr(&self) -> u32 {
        let mut ocr = OCR_SECTOR_MODE | OCR_VDD_HIGH;
        if self.dual_voltage {
            ocr |= OCR_VDD_LOW;
        }
        ocr
    }
}

/// Response registers the controller would show for a register value in `words`.
pub fn unmerge(words: [u32; 4]) -> [u32; 4] {
    [
        words[2] << 24 | words[3] >> 8,
        words[1] << 24 | words[2] >> 8,
        words[0] << 24 | words[1] >> 8,
        words[0] >> 8,
    ]
}

enum Phase {
    Idle,
    Read { fifo: VecDeque<u32>, multi: bool },
    Write { start: u32, blocks: u32, words: Vec<u32>, multi: bool },
    Stalled,
}

pub struct SimState {
    pub model: CardModel,
    storage: HashMap<u32, Vec<u8>>,
    pub card_state: u32,
    pub locked: bool,
    pub ext_csd: [u8; 512],
    pub ocr_busy_rounds: u32,
    pub switch_busy_polls: u32,
    switch_pending: u32,
    pub log: Vec<(u8, u32)>,
    latched: IntFlags,
    pub enabled: IntFlags,
    response: [u32; 4],
    phase: Phase,
    erase_start: Option<u32>,
    erase_end: Option<u32>,
    pub fail_data: Option<IntFlags>,
    pub fail_command: Option<(u8, IntFlags)>,
    pub r1_error: Option<(u8, u32)>,
    pub stall_data: bool,
    /// Buffer-ready latches per block and is write-1-to-clear, as on SDHCI.
    pub latched_buffer_ready: bool,
    window: usize,
    pub card_present: bool,
    pub powered: bool,
    pub clock_enabled: bool,
    pub divider: u16,
    pub bus_width: BusWidth,
    pub speed: SpeedMode,
    pub data_timeout: u32,
    pub dma: HashMap<DmaChannel, (DmaTransfer, bool)>,
    pub dma_ops: usize,
    pub dma_disabled: Vec<DmaChannel>,
}

pub type Sim = Rc<RefCell<SimState>>;

pub fn sim(model: CardModel) -> Sim {
    let mut ext_csd = [0u8; 512];
    ext_csd[EXT_CSD_REV] = 8;
    ext_csd[EXT_CSD_CARD_TYPE] = model.card_type;
    ext_csd[EXT_CSD_SEC_CNT..EXT_CSD_SEC_CNT + 4].copy_from_slice(&model.sec_count.to_le_bytes());

    Rc::new(RefCell::new(SimState {
        model,
        storage: HashMap::new(),
        card_state: 0,
        locked: false,
        ext_csd,
        ocr_busy_rounds: 2,
        switch_busy_polls: 1,
        switch_pending: 0,
        log: Vec::new(),
        latched: IntFlags::empty(),
        enabled: IntFlags::empty(),
        response: [0; 4],
        phase: Phase::Idle,
        erase_start: None,
        erase_end: None,
        fail_data: None,
        fail_command: None,
        r1_error: None,
        stall_data: false,
        latched_buffer_ready: false,
        window: 0,
        card_present: true,
        powered: false,
        clock_enabled: false,
        divider: 0,
        bus_width: BusWidth::One,
        speed: SpeedMode::Default,
        data_timeout: 0,
        dma: HashMap::new(),
        dma_ops: 0,
        dma_disabled: Vec::new(),
    }))
}

impl SimState {
    pub fn opcodes(&self) -> Vec<u8> {
        self.log.iter().map(|(op, _)| *op).collect()
    }

    pub fn block(&self, index: u32) -> Vec<u8> {
        self.storage
            .get(&index)
            .cloned()
            .unwrap_or_else(|| vec![ERASED; 512])
    }

    pub fn put_block(&mut self, index: u32, data: &[u8]) {
        self.storage.insert(index, data.to_vec());
    }

    fn status_word(&self) -> u32 {
        let mut status = self.card_state << R1_CURRENT_STATE_SHIFT;
        if self.card_state == 4 {
            status |= R1_READY_FOR_DATA;
        }
        if self.locked {
            status |= R1_CARD_IS_LOCKED;
        }
        status
    }

    fn block_of(&self, arg: u32) -> Result<u32, u32> {
        if self.model.sector_addressing() {
            Ok(arg)
        } else if arg % 512 != 0 {
            Err(R1_ADDRESS_ERROR)
        } else {
            Ok(arg / 512)
        }
    }

    fn level(&self) -> IntFlags {
        if self.latched_buffer_ready {
            return IntFlags::empty();
        }
        self.pending()
    }

    fn pending(&self) -> IntFlags {
        match &self.phase {
            Phase::Read { fifo, .. } if !fifo.is_empty() => IntFlags::BUFFER_READ_READY,
            Phase::Write { blocks, words, .. } if words.len() < *blocks as usize * 128 => {
                IntFlags::BUFFER_WRITE_READY
            }
            _ => IntFlags::empty(),
        }
    }

    /// Expose the next block of the data phase and latch its buffer-ready flag.
    fn present_block(&mut self) {
        let ready = self.pending();
        self.window = if ready.is_empty() { 0 } else { 128 };
        self.latched |= ready;
    }

    fn block_words(&self, index: u32) -> Vec<u32> {
        self.block(index)
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    fn commit(&mut self, start: u32, words: &[u32]) {
        for (i, block) in words.chunks(128).enumerate() {
            let bytes: Vec<u8> = block.iter().flat_map(|w| w.to_le_bytes()).collect();
            self.storage.insert(start + i as u32, bytes);
        }
    }

    fn dma_channel(&self, read: bool) -> Option<DmaTransfer> {
        self.dma.values().find_map(|(t, enabled)| {
            let port = if read { t.src } else { t.dst };
            (*enabled && port == PORT_ADDR).then_some(*t)
        })
    }

    fn start_read(&mut self, cmd: &MmcCommand, start: u32, blocks: u32) {
        let multi = cmd.opcode == MMC_READ_MULTIPLE_BLOCK;
        self.card_state = 5;
        if let Some(flags) = self.fail_data.take() {
            self.latched |= flags | IntFlags::ERROR;
            return;
        }
        if self.stall_data {
            self.phase = Phase::Stalled;
            return;
        }

        let words: Vec<u32> = (start..start + blocks).flat_map(|b| self.block_words(b)).collect();
        if cmd.dma {
            match self.dma_channel(true) {
                Some(t) => {
                    let len = (t.units_per_block * t.blocks) as usize;
                    let dst = unsafe { std::slice::from_raw_parts_mut(t.dst as *mut u32, len) };
                    dst.copy_from_slice(&words[..len]);
                    self.latched |= IntFlags::TRANSFER_COMPLETE;
                    if !multi {
                        self.card_state = 4;
                    }
                }
                None => self.latched |= IntFlags::DATA_TIMEOUT | IntFlags::ERROR,
            }
            return;
        }
        self.phase = Phase::Read {
            fifo: words.into(),
            multi,
        };
    }

    fn start_write(&mut self, cmd: &MmcCommand, start: u32, blocks: u32) {
        let multi = cmd.opcode == MMC_WRITE_MULTIPLE_BLOCK;
        self.card_state = 6;
        if let Some(flags) = self.fail_data.take() {
            self.latched |= flags | IntFlags::ERROR;
            return;
        }
        if self.stall_data {
            self.phase = Phase::Stalled;
            return;
        }

        if cmd.dma {
            match self.dma_channel(false) {
                Some(t) => {
                    let len = (t.units_per_block * t.blocks) as usize;
                    let src = unsafe { std::slice::from_raw_parts(t.src as *const u32, len) };
                    let words = src.to_vec();
                    self.commit(start, &words);
                    self.latched |= IntFlags::TRANSFER_COMPLETE;
                    if !multi {
                        self.card_state = 4;
                    }
                }
                None => self.latched |= IntFlags::DATA_TIMEOUT | IntFlags::ERROR,
            }
            return;
        }
        self.phase = Phase::Write {
            start,
            blocks,
            words: Vec::new(),
            multi,
        };
    }

    fn execute(&mut self, cmd: &MmcCommand) {
        self.log.push((cmd.opcode, cmd.arg));

        if let Some((opcode, flags)) = self.fail_command {
            if opcode == cmd.opcode {
                self.fail_command = None;
                self.latched |= flags | IntFlags::ERROR;
                return;
            }
        }

        let was_idle = matches!(self.phase, Phase::Idle);
        let before = self.status_word();
        let r1 = |errors: u32| [before | errors, 0, 0, 0];

        self.response = match cmd.opcode {
            MMC_GO_IDLE_STATE => {
                self.card_state = 0;
                self.phase = Phase::Idle;
                [0; 4]
            }
            MMC_SEND_OP_COND => {
                let ocr = self.model.ocr();
                if self.ocr_busy_rounds > 0 {
                    if self.ocr_busy_rounds != u32::MAX {
                        self.ocr_busy_rounds -= 1;
                    }
                    [ocr, 0, 0, 0]
                } else {
                    self.card_state = 1;
                    [ocr | OCR_BUSY, 0, 0, 0]
                }
            }
            MMC_ALL_SEND_CID => {
                self.card_state = 2;
                RAW_CID
            }
            MMC_SET_RELATIVE_ADDR => {
                self.card_state = 3;
                r1(0)
            }
            MMC_SEND_CSD => unmerge(self.model.csd_words()),
            MMC_SELECT_CARD => {
                if cmd.arg >> 16 == MMC_DEFAULT_RCA as u32 {
                    self.card_state = 4;
                }
                r1(0)
            }
            MMC_SWITCH => {
                let index = (cmd.arg >> 16) as u8 as usize;
                self.ext_csd[index] = (cmd.arg >> 8) as u8;
                self.card_state = 7;
                self.switch_pending = self.switch_busy_polls;
                r1(0)
            }
            MMC_SEND_EXT_CSD => {
                let words = self
                    .ext_csd
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                self.card_state = 5;
                self.phase = Phase::Read { fifo: words, multi: false };
                r1(0)
            }
            MMC_SEND_STATUS => {
                if self.switch_pending > 0 {
                    self.switch_pending -= 1;
                } else if self.card_state == 7 {
                    self.card_state = 4;
                }
                [self.status_word(), 0, 0, 0]
            }
            MMC_STOP_TRANSMISSION => {
                self.phase = Phase::Idle;
                self.card_state = 4;
                r1(0)
            }
            MMC_SET_BLOCKLEN => {
                if cmd.arg != 512 {
                    r1(R1_BLOCK_LEN_ERROR)
                } else {
                    r1(0)
                }
            }
            MMC_READ_SINGLE_BLOCK | MMC_READ_MULTIPLE_BLOCK | MMC_WRITE_BLOCK
            | MMC_WRITE_MULTIPLE_BLOCK => {
                let blocks = if cmd.opcode == MMC_READ_SINGLE_BLOCK || cmd.opcode == MMC_WRITE_BLOCK {
                    1
                } else {
                    cmd.block_count as u32
                };
                match self.block_of(cmd.arg) {
                    Err(err) => r1(err),
                    Ok(start) if start as u64 + blocks as u64 > self.model.capacity() as u64 => {
                        r1(R1_OUT_OF_RANGE)
                    }
                    Ok(start) => {
                        if cmd.data_dir_read {
                            self.start_read(cmd, start, blocks);
                        } else {
                            self.start_write(cmd, start, blocks);
                        }
                        r1(0)
                    }
                }
            }
            MMC_ERASE_GROUP_START => match self.block_of(cmd.arg) {
                Ok(block) => {
                    self.erase_start = Some(block);
                    r1(0)
                }
                Err(err) => r1(err),
            },
            MMC_ERASE_GROUP_END => match self.block_of(cmd.arg) {
                Ok(block) => {
                    self.erase_end = Some(block);
                    r1(0)
                }
                Err(err) => r1(err),
            },
            MMC_ERASE => match (self.erase_start.take(), self.erase_end.take()) {
                (Some(start), Some(end)) => {
                    self.storage.retain(|block, _| *block < start || *block > end);
                    r1(0)
                }
                _ => r1(R1_ERASE_SEQ_ERROR),
            },
            _ => r1(R1_ILLEGAL_COMMAND),
        };

        if let Some((opcode, bits)) = self.r1_error {
            if opcode == cmd.opcode {
                self.r1_error = None;
                self.response[0] |= bits;
            }
        }
        if self.latched_buffer_ready && was_idle {
            self.present_block();
        }

        self.latched |= IntFlags::COMMAND_COMPLETE;
    }

    fn pop_word(&mut self) -> u32 {
        if self.latched_buffer_ready {
            if self.window == 0 {
                return 0xDEAD_BEEF;
            }
            self.window -= 1;
        }
        let (word, done, multi) = match &mut self.phase {
            Phase::Read { fifo, multi } => {
                let word = fifo.pop_front().unwrap_or(0);
                (word, fifo.is_empty(), *multi)
            }
            _ => return 0,
        };
        if done {
            self.phase = Phase::Idle;
            self.latched |= IntFlags::TRANSFER_COMPLETE;
            if !multi {
                self.card_state = 4;
            }
        }
        word
    }

    fn push_word(&mut self, word: u32) {
        if self.latched_buffer_ready {
            // No room until the driver acknowledges the previous block
            if self.window == 0 {
                return;
            }
            self.window -= 1;
        }
        let full = match &mut self.phase {
            Phase::Write { blocks, words, .. } => {
                words.push(word);
                words.len() == *blocks as usize * 128
            }
            _ => return,
        };
        if full {
            if let Phase::Write { start, words, multi, .. } =
                std::mem::replace(&mut self.phase, Phase::Idle)
            {
                self.commit(start, &words);
                self.latched |= IntFlags::TRANSFER_COMPLETE;
                if !multi {
                    self.card_state = 4;
                }
            }
        }
    }
}

pub struct SimHost(pub Sim);

impl HostController for SimHost {
    fn base_clock_hz(&self) -> u32 {
        BASE_CLOCK
    }

    fn power_on(&mut self) {
        self.0.borrow_mut().powered = true;
    }

    fn power_off(&mut self) {
        self.0.borrow_mut().powered = false;
    }

    fn enable_clock(&mut self, enable: bool) {
        self.0.borrow_mut().clock_enabled = enable;
    }

    fn set_clock_divider(&mut self, divider: u16) {
        self.0.borrow_mut().divider = divider;
    }

    fn set_speed_mode(&mut self, mode: SpeedMode) {
        self.0.borrow_mut().speed = mode;
    }

    fn set_bus_width(&mut self, width: BusWidth) {
        self.0.borrow_mut().bus_width = width;
    }

    fn set_data_timeout(&mut self, cycles: u32) {
        self.0.borrow_mut().data_timeout = cycles;
    }

    fn send_command(&mut self, cmd: &MmcCommand) {
        self.0.borrow_mut().execute(cmd);
    }

    fn response(&self) -> [u32; 4] {
        self.0.borrow().response
    }

    fn read_data(&mut self) -> u32 {
        self.0.borrow_mut().pop_word()
    }

    fn write_data(&mut self, word: u32) {
        self.0.borrow_mut().push_word(word);
    }

    fn data_port_addr(&self) -> usize {
        PORT_ADDR
    }

    fn data_line_busy(&self) -> bool {
        false
    }

    fn int_status(&self) -> IntFlags {
        let state = self.0.borrow();
        state.latched | state.level()
    }

    fn clear_int_status(&mut self, flags: IntFlags) {
        let mut state = self.0.borrow_mut();
        state.latched.remove(flags);
        let buffer = IntFlags::BUFFER_READ_READY | IntFlags::BUFFER_WRITE_READY;
        if state.latched_buffer_ready && state.window == 0 && flags.intersects(buffer) {
            state.present_block();
        }
    }

    fn int_enabled(&self) -> IntFlags {
        self.0.borrow().enabled
    }

    fn enable_interrupts(&mut self, flags: IntFlags) {
        self.0.borrow_mut().enabled.insert(flags);
    }

    fn disable_interrupts(&mut self, flags: IntFlags) {
        self.0.borrow_mut().enabled.remove(flags);
    }

    fn card_detect(&self) -> bool {
        self.0.borrow().card_present
    }

    fn card_inserted(&self) -> bool {
        self.0.borrow().card_present
    }
}

pub struct SimDma(pub Sim);

impl DmaEngine for SimDma {
    fn configure(&mut self, channel: DmaChannel, transfer: &DmaTransfer) {
        let mut state = self.0.borrow_mut();
        state.dma_ops += 1;
        state.dma.insert(channel, (*transfer, false));
    }

    fn enable(&mut self, channel: DmaChannel) {
        let mut state = self.0.borrow_mut();
        state.dma_ops += 1;
        if let Some((_, enabled)) = state.dma.get_mut(&channel) {
            *enabled = true;
        }
    }

    fn disable(&mut self, channel: DmaChannel) {
        let mut state = self.0.borrow_mut();
        state.dma_ops += 1;
        state.dma_disabled.push(channel);
        if let Some((_, enabled)) = state.dma.get_mut(&channel) {
            *enabled = false;
        }
    }

    fn clear_status(&mut self, _channel: DmaChannel) {
        self.0.borrow_mut().dma_ops += 1;
    }
}

/// Each reading advances time by `step`.
pub struct TickClock {
    now: Cell<Duration>,
    step: Duration,
}

impl TickClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Duration::ZERO),
            step: Duration::from_micros(10),
        }
    }
}

impl Clock for TickClock {
    fn now(&self) -> Duration {
        let now = self.now.get();
        self.now.set(now + self.step);
        now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Note {
    Write,
    Read,
    Error(ErrorCode),
}

#[derive(Debug, Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Vec<Note>>>);

impl Recorder {
    pub fn notes(&self) -> Vec<Note> {
        self.0.borrow().clone()
    }
}

impl Completion for Recorder {
    fn write_complete(&mut self) {
        self.0.borrow_mut().push(Note::Write);
    }

    fn read_complete(&mut self) {
        self.0.borrow_mut().push(Note::Read);
    }

    fn error(&mut self, code: ErrorCode) {
        self.0.borrow_mut().push(Note::Error(code));
    }
}

pub type PlainCard = MmcCard<SimHost, TickClock>;
pub type FullCard = MmcCard<SimHost, TickClock, SimDma, Recorder>;

pub fn plain_card(sim: &Sim, config: MmcConfig) -> PlainCard {
    MmcCard::new(SimHost(sim.clone()), TickClock::new(), config)
}

pub fn full_card(sim: &Sim, config: MmcConfig, recorder: &Recorder) -> FullCard {
    MmcCard::new(SimHost(sim.clone()), TickClock::new(), config)
        .with_dma(SimDma(sim.clone()), TX, RX)
        .with_completion(recorder.clone())
}

/// Initialized card with DMA and a completion recorder.
pub fn ready_card(model: CardModel) -> (Sim, FullCard, Recorder) {
    init_logger();
    let sim = sim(model);
    let recorder = Recorder::default();
    let mut card = full_card(&sim, config(), &recorder);
    card.init().expect("init");
    sim.borrow_mut().log.clear();
    (sim, card, recorder)
}

/// Word aligned `'static` buffer.
pub fn aligned_buffer(len: usize) -> &'static mut [u8] {
    let words: &'static mut [u32] = Box::leak(vec![0u32; len.div_ceil(4) + 1].into_boxed_slice());
    unsafe { std::slice::from_raw_parts_mut(words.as_mut_ptr() as *mut u8, len) }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Drive the interrupt handler until the transfer retires.
pub fn run_interrupts(card: &mut FullCard) -> usize {
    let mut serviced = 0;
    while !card.is_idle() {
        card.on_interrupt();
        serviced += 1;
        assert!(serviced < 100_000, "transfer never retired");
    }
    serviced
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcCall {
    Register(u32),
    Priority(u32, u8),
    ClearPending(u32),
    Enable(u32),
}

#[derive(Default)]
pub struct SimIc {
    pub calls: Vec<IcCall>,
    pub handler: Option<fn()>,
}

impl InterruptController for SimIc {
    fn register(&mut self, irq: u32, handler: fn()) {
        self.calls.push(IcCall::Register(irq));
        self.handler = Some(handler);
    }

    fn set_priority(&mut self, irq: u32, priority: u8) {
        self.calls.push(IcCall::Priority(irq, priority));
    }

    fn clear_pending(&mut self, irq: u32) {
        self.calls.push(IcCall::ClearPending(irq));
    }

    fn enable(&mut self, irq: u32) {
        self.calls.push(IcCall::Enable(irq));
    }
}
