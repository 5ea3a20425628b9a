use bitfield::bitfield;

use super::constant::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardVoltage {
    #[default]
    Unknown,
    /// 2.7 - 3.6 V only.
    High,
    /// Also operates at 1.70 - 1.95 V.
    Dual,
}

impl CardVoltage {
    pub fn from_ocr(ocr: u32) -> Self {
        if ocr & OCR_VDD_LOW != 0 {
            CardVoltage::Dual
        } else {
            CardVoltage::High
        }
    }
}

/// Geometry and addressing data learnt during identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CardInfo {
    pub voltage: CardVoltage,
    /// Command classes supported by the card (CSD CCC field).
    pub class: u16,
    pub rel_card_addr: u16,
    pub block_nbr: u32,
    pub block_size: u32,
    /// Capacity in 512-byte logical blocks.
    pub log_block_nbr: u32,
    pub log_block_size: u32,
}

impl CardInfo {
    /// Byte addressing below the high capacity threshold, sector addressing above it.
    pub fn card_address(&self, block: u32) -> u32 {
        if self.log_block_nbr < HIGH_CAPACITY_THRESHOLD {
            block.wrapping_mul(MMC_BLOCK_SIZE as u32)
        } else {
            block
        }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.log_block_nbr as u64 * self.log_block_size as u64
    }
}

/// Physical block count, physical block size and logical (512 byte) block count.
///
/// Cards with blocks of at least 512 bytes scale the count up; smaller blocks are first
/// grouped by 512 and then scaled by the block size.
pub fn geometry(csd: &CsdRegister) -> (u32, u32, u32) {
    let block_nbr = (csd.c_size() as u32 + 1) << (csd.c_size_mult() as u32 + 2);
    let block_size = 1u32 << csd.read_bl_len();
    let log_block_nbr = if block_size >= MMC_BLOCK_SIZE as u32 {
        block_nbr * (block_size / MMC_BLOCK_SIZE as u32)
    } else {
        (block_nbr / MMC_BLOCK_SIZE as u32) * block_size
    };
    (block_nbr, block_size, log_block_nbr)
}

pub fn register_value(words: &[u32; 4]) -> u128 {
    (words[0] as u128) << 96 | (words[1] as u128) << 64 | (words[2] as u128) << 32 | words[3] as u128
}

bitfield! {
    /// Card-Specific Data, bit numbers as in the MMC register map.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CsdRegister(u128);
    impl Debug;
    pub u8, csd_structure, _: 127, 126;
    pub u8, spec_vers, _: 125, 122;
    pub u8, taac, _: 119, 112;
    pub u8, nsac, _: 111, 104;
    pub u8, tran_speed, _: 103, 96;
    pub u16, ccc, _: 95, 84;
    pub u8, read_bl_len, _: 83, 80;
    pub read_bl_partial, _: 79;
    pub write_blk_misalign, _: 78;
    pub read_blk_misalign, _: 77;
    pub dsr_imp, _: 76;
    pub u16, c_size, _: 73, 62;
    pub u8, vdd_r_curr_min, _: 61, 59;
    pub u8, vdd_r_curr_max, _: 58, 56;
    pub u8, vdd_w_curr_min, _: 55, 53;
    pub u8, vdd_w_curr_max, _: 52, 50;
    pub u8, c_size_mult, _: 49, 47;
    pub u8, erase_grp_size, _: 46, 42;
    pub u8, erase_grp_mult, _: 41, 37;
    pub u8, wp_grp_size, _: 36, 32;
    pub wp_grp_enable, _: 31;
    pub u8, default_ecc, _: 30, 29;
    pub u8, r2w_factor, _: 28, 26;
    pub u8, write_bl_len, _: 25, 22;
    pub write_bl_partial, _: 21;
    pub content_prot_app, _: 16;
    pub file_format_grp, _: 15;
    pub copy, _: 14;
    pub perm_write_protect, _: 13;
    pub tmp_write_protect, _: 12;
    pub u8, file_format, _: 11, 10;
    pub u8, ecc, _: 9, 8;
}

impl CsdRegister {
    pub fn from_words(words: &[u32; 4]) -> Self {
        CsdRegister(register_value(words))
    }

    /// Capacity is reported through EXT_CSD instead of C_SIZE.
    pub fn extended_capacity(&self) -> bool {
        self.c_size() == CSD_C_SIZE_EXT
    }
}

bitfield! {
    /// Card Identification register.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct CidRegister(u128);
    impl Debug;
    pub u8, manufacturer_id, _: 127, 120;
    pub u8, device_type, _: 113, 112;
    pub u8, oem_id, _: 111, 104;
    pub u64, product_name_raw, _: 103, 56;
    pub u8, product_rev, _: 55, 48;
    pub u32, serial_number, _: 47, 16;
    pub u8, manufacture_date, _: 15, 8;
}

impl CidRegister {
    pub fn from_words(words: &[u32; 4]) -> Self {
        CidRegister(register_value(words))
    }

    /// Six ASCII characters, most significant first.
    pub fn product_name(&self) -> [u8; 6] {
        let raw = self.product_name_raw().to_be_bytes();
        let mut name = [0u8; 6];
        name.copy_from_slice(&raw[2..]);
        name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Identify,
    Standby,
    Transfer,
    Sending,
    Receiving,
    Programming,
    Disconnected,
    Reserved(u8),
}

impl CardState {
    pub fn from_status(status: u32) -> Self {
        match (status >> R1_CURRENT_STATE_SHIFT) & R1_CURRENT_STATE_MASK {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Identify,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::Sending,
            6 => CardState::Receiving,
            7 => CardState::Programming,
            8 => CardState::Disconnected,
            other => CardState::Reserved(other as u8),
        }
    }

    /// The card is moving data and needs CMD12 to return to Transfer.
    pub fn in_transfer(self) -> bool {
        matches!(self, CardState::Sending | CardState::Receiving)
    }
}
