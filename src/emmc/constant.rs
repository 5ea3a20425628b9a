// EMMC register offsets
pub const EMMC_BLOCK_SIZE: u32 = 0x0004;                // Block Size Register
pub const EMMC_BLOCK_COUNT: u32 = 0x0006;               // 16-bit Block Count Register
pub const EMMC_ARGUMENT: u32 = 0x0008;                  // Command Argument Register
pub const EMMC_XFER_MODE: u32 = 0x000C;                 // Transfer Mode Register
pub const EMMC_COMMAND: u32 = 0x000E;                   // Command Register
pub const EMMC_RESPONSE: u32 = 0x0010;                  // 0x10-0x1F, 4 Response Registers
pub const EMMC_BUF_DATA: u32 = 0x0020;                  // Buffer Data Port Register
pub const EMMC_PRESENT_STATE: u32 = 0x0024;             // Present State Register
pub const EMMC_HOST_CTRL1: u32 = 0x0028;                // Host Control 1 Register
pub const EMMC_POWER_CTRL: u32 = 0x0029;                // Power Control Register
pub const EMMC_CLOCK_CONTROL: u32 = 0x002C;             // Clock Control Register
pub const EMMC_TIMEOUT_CONTROL: u32 = 0x002E;           // Timeout Control Register
pub const EMMC_NORMAL_INT_STAT: u32 = 0x0030;           // Normal Interrupt Status Register
pub const EMMC_NORMAL_INT_STAT_EN: u32 = 0x0034;        // Normal Interrupt Status Enable Register
pub const EMMC_SIGNAL_ENABLE: u32 = 0x0038;             // Normal Interrupt Signal Enable Register
pub const EMMC_CAPABILITIES1: u32 = 0x0040;             // Capabilities Register 1

// EMMC command register flags
pub const EMMC_CMD_CRC: u16 = 0x08;
pub const EMMC_CMD_INDEX: u16 = 0x10;
pub const EMMC_CMD_DATA: u16 = 0x20;

pub const EMMC_CMD_RESP_LONG: u16 = 0x01;
pub const EMMC_CMD_RESP_SHORT: u16 = 0x02;
pub const EMMC_CMD_RESP_SHORT_BUSY: u16 = 0x03;

// EMMC transfer mode flags
pub const EMMC_TRNS_DMA: u16 = 0x01;
pub const EMMC_TRNS_BLK_CNT_EN: u16 = 0x02;
pub const EMMC_TRNS_READ: u16 = 0x10;
pub const EMMC_TRNS_MULTI: u16 = 0x20;

// EMMC present state flags
pub const EMMC_DATA_INHIBIT: u32 = 0x00000001;
pub const EMMC_CMD_INHIBIT: u32 = 0x00000002;
pub const EMMC_DATA_LINE_ACTIVE: u32 = 0x00000004;
pub const EMMC_CARD_INSERTED: u32 = 0x00010000;
pub const EMMC_CARD_DETECT_PIN: u32 = 0x00040000;

// EMMC host control flags
pub const EMMC_CTRL_4BITBUS: u8 = 0x02;
pub const EMMC_CTRL_HISPD: u8 = 0x04;
pub const EMMC_CTRL_8BITBUS: u8 = 0x20;

// EMMC power control flags
pub const EMMC_POWER_ON: u8 = 0x01;
pub const EMMC_POWER_330: u8 = 0x0E;

// EMMC clock control flags
pub const EMMC_CLOCK_INT_EN: u16 = 0x0001;
pub const EMMC_CLOCK_INT_STABLE: u16 = 0x0002;
pub const EMMC_CLOCK_CARD_EN: u16 = 0x0004;
pub const EMMC_DIVIDER_SHIFT: u16 = 8;
pub const EMMC_DIVIDER_HI_SHIFT: u16 = 6;
pub const EMMC_CLOCK_BASE_MASK: u32 = 0x0000FF00;
pub const EMMC_CLOCK_BASE_SHIFT: u32 = 8;

// Data timeout counter value is 2^(13 + n) card clocks, n in 0..=14
pub const EMMC_TIMEOUT_MAX: u8 = 0x0E;

// SD/MMC Command definitions
// Basic commands (class 0 and class 1)
pub const MMC_GO_IDLE_STATE: u8 = 0;
pub const MMC_SEND_OP_COND: u8 = 1;
pub const MMC_ALL_SEND_CID: u8 = 2;
pub const MMC_SET_RELATIVE_ADDR: u8 = 3;
pub const MMC_SWITCH: u8 = 6;
pub const MMC_SELECT_CARD: u8 = 7;
pub const MMC_SEND_EXT_CSD: u8 = 8;
pub const MMC_SEND_CSD: u8 = 9;
pub const MMC_STOP_TRANSMISSION: u8 = 12;
pub const MMC_SEND_STATUS: u8 = 13;

// Block-oriented read commands (class 2)
pub const MMC_SET_BLOCKLEN: u8 = 16;
pub const MMC_READ_SINGLE_BLOCK: u8 = 17;
pub const MMC_READ_MULTIPLE_BLOCK: u8 = 18;

// Block-oriented write commands (class 4)
pub const MMC_WRITE_BLOCK: u8 = 24;
pub const MMC_WRITE_MULTIPLE_BLOCK: u8 = 25;

// Erase commands (class 5)
pub const MMC_ERASE_GROUP_START: u8 = 35;
pub const MMC_ERASE_GROUP_END: u8 = 36;
pub const MMC_ERASE: u8 = 38;

// Response types
pub const MMC_RSP_PRESENT: u32 = 1 << 0;
pub const MMC_RSP_136: u32 = 1 << 1; // 136-bit response
pub const MMC_RSP_CRC: u32 = 1 << 2; // Expect valid CRC
pub const MMC_RSP_BUSY: u32 = 1 << 3; // Card may send busy
pub const MMC_RSP_OPCODE: u32 = 1 << 4; // Response contains opcode

pub const MMC_RSP_NONE: u32 = 0;
pub const MMC_RSP_R1: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE;
pub const MMC_RSP_R1B: u32 = MMC_RSP_PRESENT | MMC_RSP_CRC | MMC_RSP_OPCODE | MMC_RSP_BUSY;
pub const MMC_RSP_R2: u32 = MMC_RSP_PRESENT | MMC_RSP_136 | MMC_RSP_CRC;
pub const MMC_RSP_R3: u32 = MMC_RSP_PRESENT;

// R1 card status bits
pub const R1_OUT_OF_RANGE: u32 = 1 << 31;
pub const R1_ADDRESS_ERROR: u32 = 1 << 30;
pub const R1_BLOCK_LEN_ERROR: u32 = 1 << 29;
pub const R1_ERASE_SEQ_ERROR: u32 = 1 << 28;
pub const R1_ERASE_PARAM: u32 = 1 << 27;
pub const R1_WP_VIOLATION: u32 = 1 << 26;
pub const R1_CARD_IS_LOCKED: u32 = 1 << 25;
pub const R1_LOCK_UNLOCK_FAILED: u32 = 1 << 24;
pub const R1_COM_CRC_ERROR: u32 = 1 << 23;
pub const R1_ILLEGAL_COMMAND: u32 = 1 << 22;
pub const R1_CARD_ECC_FAILED: u32 = 1 << 21;
pub const R1_CC_ERROR: u32 = 1 << 20;
pub const R1_ERROR: u32 = 1 << 19;
pub const R1_CID_CSD_OVERWRITE: u32 = 1 << 16;
pub const R1_CURRENT_STATE_SHIFT: u32 = 9;
pub const R1_CURRENT_STATE_MASK: u32 = 0xF;
pub const R1_READY_FOR_DATA: u32 = 1 << 8;
pub const R1_SWITCH_ERROR: u32 = 1 << 7;

// OCR register
pub const OCR_BUSY: u32 = 0x80000000;             // Power-up routine finished
pub const OCR_SECTOR_MODE: u32 = 0x40000000;      // Sector access mode
pub const OCR_VDD_HIGH: u32 = 0x00FF8000;         // 2.7 - 3.6 V
pub const OCR_VDD_LOW: u32 = 0x00000080;          // 1.70 - 1.95 V

// Relative card address handed out during identification
pub const MMC_DEFAULT_RCA: u16 = 1;

// Switch command access modes
pub const MMC_SWITCH_MODE_WRITE_BYTE: u8 = 0x03;

// EXT_CSD fields
pub const EXT_CSD_BUS_WIDTH: u8 = 183;      // 总线宽度索引
pub const EXT_CSD_HS_TIMING: u8 = 185;      // 高速时序索引
pub const EXT_CSD_REV: usize = 192;
pub const EXT_CSD_CARD_TYPE: usize = 196;
pub const EXT_CSD_SEC_CNT: usize = 212;

pub const EXT_CSD_BUS_WIDTH_1: u8 = 0;      // 1位模式
pub const EXT_CSD_BUS_WIDTH_4: u8 = 1;      // 4位模式
pub const EXT_CSD_BUS_WIDTH_8: u8 = 2;      // 8位模式

pub const EXT_CSD_TIMING_HS: u8 = 1;

pub const EXT_CSD_CARD_TYPE_26: u8 = 1 << 0;
pub const EXT_CSD_CARD_TYPE_52: u8 = 1 << 1;

// Command class carrying CMD35/36/38
pub const CCC_ERASE: u16 = 1 << 5;

pub const MMC_BLOCK_SIZE: usize = 512;
pub const MMC_BLOCK_WORDS: usize = MMC_BLOCK_SIZE / 4;

// Cards at or beyond this many logical blocks (2 GiB) are sector addressed
pub const HIGH_CAPACITY_THRESHOLD: u32 = 0x0040_0000;

// A saturated C_SIZE means the capacity lives in EXT_CSD
pub const CSD_C_SIZE_EXT: u16 = 0xFFF;

pub const MMC_INIT_CLOCK_HZ: u32 = 400_000;
pub const MMC_DEFAULT_MAX_DTR: u32 = 26_000_000;
pub const MMC_HIGH_52_MAX_DTR: u32 = 52_000_000;
