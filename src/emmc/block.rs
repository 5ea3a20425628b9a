// ===== Block Device Interface =====

use log::{debug, info};

use crate::err::{ErrorCode, MmcError};

use super::{
    Context, MmcCard,
    clock::{Clock, Deadline, card_clock_hz, timeout_cycles},
    cmd::MmcCommand,
    constant::*,
    irq::Completion,
    regs::{DmaEngine, DmaTransfer, HostController, IntFlags},
};

/// Caller buffer lent to an interrupt or DMA transfer, with the byte cursor of the FIFO pump.
#[derive(Debug)]
pub enum TransferBuffer {
    Read { buf: &'static mut [u8], pos: usize },
    Write { buf: &'static [u8], pos: usize },
}

impl TransferBuffer {
    pub fn into_read(self) -> Option<&'static mut [u8]> {
        match self {
            TransferBuffer::Read { buf, .. } => Some(buf),
            TransferBuffer::Write { .. } => None,
        }
    }

    pub fn into_write(self) -> Option<&'static [u8]> {
        match self {
            TransferBuffer::Write { buf, .. } => Some(buf),
            TransferBuffer::Read { .. } => None,
        }
    }

    /// Bytes already moved through the data port.
    pub fn position(&self) -> usize {
        match self {
            TransferBuffer::Read { pos, .. } | TransferBuffer::Write { pos, .. } => *pos,
        }
    }
}

pub(crate) enum TransferData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<H, T, D, N> MmcCard<H, T, D, N>
where
    H: HostController,
    T: Clock,
    D: DmaEngine,
    N: Completion,
{
    /// Read `count` blocks starting at `block`, polling the controller until done.
    pub fn read_blocks(&mut self, buf: &mut [u8], block: u32, count: u32, timeout_ms: u32) -> Result<(), MmcError> {
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        debug!("Polling read of {} blocks at {:#x}", count, addr);

        self.context = Context::operation(true, count);
        let result = self.set_block_len().and_then(|_| {
            let len = count as usize * MMC_BLOCK_SIZE;
            let cmd = MmcCommand::new(rw_opcode(true, count), addr, MMC_RSP_R1)
                .with_data(MMC_BLOCK_SIZE as u16, count as u16, true);
            self.polling_transfer(&cmd, TransferData::Read(&mut buf[..len]), timeout_ms)
        });
        self.context = Context::empty();
        result
    }

    /// Write `count` blocks starting at `block`, polling the controller until done.
    pub fn write_blocks(&mut self, buf: &[u8], block: u32, count: u32, timeout_ms: u32) -> Result<(), MmcError> {
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        debug!("Polling write of {} blocks at {:#x}", count, addr);

        self.context = Context::operation(false, count);
        let result = self.set_block_len().and_then(|_| {
            let len = count as usize * MMC_BLOCK_SIZE;
            let cmd = MmcCommand::new(rw_opcode(false, count), addr, MMC_RSP_R1)
                .with_data(MMC_BLOCK_SIZE as u16, count as u16, false);
            self.polling_transfer(&cmd, TransferData::Write(&buf[..len]), timeout_ms)
        });
        self.context = Context::empty();
        result
    }

    /// Start an interrupt driven read; the router finishes it.
    pub fn read_blocks_int(&mut self, buf: &'static mut [u8], block: u32, count: u32) -> Result<(), MmcError> {
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        self.set_block_len()?;

        let len = count as usize * MMC_BLOCK_SIZE;
        self.transfer = Some(TransferBuffer::Read { buf, pos: 0 });
        self.remaining = len;
        self.host
            .enable_interrupts(IntFlags::DATA_ERRORS | IntFlags::TRANSFER_COMPLETE | IntFlags::BUFFER_READ_READY);
        self.program_data_timeout();

        self.context = Context::operation(true, count) | Context::IT;
        let cmd = MmcCommand::new(rw_opcode(true, count), addr, MMC_RSP_R1)
            .with_data(MMC_BLOCK_SIZE as u16, count as u16, true);
        self.start_async(&cmd)
    }

    /// Start an interrupt driven write; the router finishes it.
    pub fn write_blocks_int(&mut self, buf: &'static [u8], block: u32, count: u32) -> Result<(), MmcError> {
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        self.set_block_len()?;

        let len = count as usize * MMC_BLOCK_SIZE;
        self.transfer = Some(TransferBuffer::Write { buf, pos: 0 });
        self.remaining = len;
        self.host
            .enable_interrupts(IntFlags::DATA_ERRORS | IntFlags::TRANSFER_COMPLETE | IntFlags::BUFFER_WRITE_READY);
        self.program_data_timeout();

        self.context = Context::operation(false, count) | Context::IT;
        let cmd = MmcCommand::new(rw_opcode(false, count), addr, MMC_RSP_R1)
            .with_data(MMC_BLOCK_SIZE as u16, count as u16, false);
        self.start_async(&cmd)
    }

    /// Start a DMA read from the data port into `buf`, which must be word aligned.
    pub fn read_blocks_dma(&mut self, buf: &'static mut [u8], block: u32, count: u32) -> Result<(), MmcError> {
        if buf.as_ptr() as usize % 4 != 0 {
            return Err(MmcError::InvalidArgument);
        }
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        self.require_dma()?;
        self.set_block_len()?;

        let transfer = DmaTransfer {
            src: self.host.data_port_addr(),
            dst: buf.as_mut_ptr() as usize,
            units_per_block: MMC_BLOCK_WORDS as u32,
            blocks: count,
        };
        debug!("DMA read {:x?}", transfer);

        self.transfer = Some(TransferBuffer::Read { buf, pos: 0 });
        self.remaining = 0;
        self.host
            .enable_interrupts(IntFlags::DATA_ERRORS | IntFlags::TRANSFER_COMPLETE);
        self.program_data_timeout();
        if let Some(link) = self.dma.as_mut() {
            link.engine.clear_status(link.rx);
            link.engine.configure(link.rx, &transfer);
            link.engine.enable(link.rx);
        }

        self.context = Context::operation(true, count) | Context::DMA;
        let cmd = MmcCommand::new(rw_opcode(true, count), addr, MMC_RSP_R1)
            .with_data(MMC_BLOCK_SIZE as u16, count as u16, true)
            .with_dma();
        self.start_async(&cmd)
    }

    /// Start a DMA write from `buf`, which must be word aligned, to the data port.
    pub fn write_blocks_dma(&mut self, buf: &'static [u8], block: u32, count: u32) -> Result<(), MmcError> {
        if buf.as_ptr() as usize % 4 != 0 {
            return Err(MmcError::InvalidArgument);
        }
        let addr = self.prepare_transfer(buf.len(), block, count)?;
        self.require_dma()?;
        self.set_block_len()?;

        let transfer = DmaTransfer {
            src: buf.as_ptr() as usize,
            dst: self.host.data_port_addr(),
            units_per_block: MMC_BLOCK_WORDS as u32,
            blocks: count,
        };
        debug!("DMA write {:x?}", transfer);

        self.transfer = Some(TransferBuffer::Write { buf, pos: 0 });
        self.remaining = 0;
        self.host
            .enable_interrupts(IntFlags::DATA_ERRORS | IntFlags::TRANSFER_COMPLETE);
        self.program_data_timeout();
        if let Some(link) = self.dma.as_mut() {
            link.engine.clear_status(link.tx);
            link.engine.configure(link.tx, &transfer);
            link.engine.enable(link.tx);
        }

        self.context = Context::operation(false, count) | Context::DMA;
        let cmd = MmcCommand::new(rw_opcode(false, count), addr, MMC_RSP_R1)
            .with_data(MMC_BLOCK_SIZE as u16, count as u16, false)
            .with_dma();
        self.start_async(&cmd)
    }

    /// Erase the groups covering blocks `start..=end`.
    ///
    /// Returns once CMD38 is accepted; the card stays in Programming until the erase is done.
    pub fn erase(&mut self, start: u32, end: u32) -> Result<(), MmcError> {
        if !self.is_idle() {
            return Err(MmcError::Busy);
        }
        if end < start || end >= self.info.log_block_nbr {
            return Err(MmcError::InvalidArgument);
        }
        self.error_code = ErrorCode::empty();

        if self.info.class & CCC_ERASE == 0 {
            info!("Card does not support erase commands");
            self.error_code |= ErrorCode::REQUEST_NOT_APPLICABLE;
            return Err(MmcError::Failed);
        }

        let status = self.send_status()?;
        if status & R1_CARD_IS_LOCKED != 0 {
            self.error_code |= ErrorCode::LOCK_UNLOCK_FAILED;
            return Err(MmcError::Failed);
        }

        let start_addr = self.info.card_address(start);
        let end_addr = self.info.card_address(end);
        debug!("Erase {:#x}..={:#x}", start_addr, end_addr);

        let steps = [
            MmcCommand::new(MMC_ERASE_GROUP_START, start_addr, MMC_RSP_R1),
            MmcCommand::new(MMC_ERASE_GROUP_END, end_addr, MMC_RSP_R1),
            MmcCommand::new(MMC_ERASE, 0, MMC_RSP_R1B),
        ];
        for cmd in steps.iter() {
            if let Err(err) = self.send_command(cmd) {
                self.host.clear_int_status(IntFlags::STATIC);
                return Err(err);
            }
        }
        Ok(())
    }

    // Checks shared by every transfer; returns the address to put on the bus
    fn prepare_transfer(&mut self, len: usize, block: u32, count: u32) -> Result<u32, MmcError> {
        if !self.is_idle() {
            return Err(MmcError::Busy);
        }
        if count == 0 || count > u16::MAX as u32 || len < count as usize * MMC_BLOCK_SIZE {
            return Err(MmcError::InvalidArgument);
        }
        self.error_code = ErrorCode::empty();

        if block as u64 + count as u64 > self.info.log_block_nbr as u64 {
            debug!(
                "Blocks {}+{} beyond card end {}",
                block, count, self.info.log_block_nbr
            );
            self.error_code |= ErrorCode::ADDR_OUT_OF_RANGE;
            return Err(MmcError::Failed);
        }
        Ok(self.info.card_address(block))
    }

    fn require_dma(&mut self) -> Result<(), MmcError> {
        if self.dma.is_none() {
            self.error_code |= ErrorCode::DMA_UNAVAILABLE;
            return Err(MmcError::InvalidArgument);
        }
        Ok(())
    }

    fn program_data_timeout(&mut self) {
        let hz = card_clock_hz(self.host.base_clock_hz(), self.config.clock_divider);
        self.host
            .set_data_timeout(timeout_cycles(self.config.data_timeout_ms, hz));
    }

    fn start_async(&mut self, cmd: &MmcCommand) -> Result<(), MmcError> {
        if let Err(err) = self.send_command(cmd) {
            let context = self.context;
            self.host.disable_interrupts(IntFlags::TRANSFER);
            self.release_dma(context);
            self.context = Context::empty();
            self.remaining = 0;
            return Err(err);
        }
        Ok(())
    }

    pub(crate) fn release_dma(&mut self, context: Context) {
        if !context.contains(Context::DMA) {
            return;
        }
        if let Some(link) = self.dma.as_mut() {
            let channel = if context.intersects(Context::READ) {
                link.rx
            } else {
                link.tx
            };
            link.engine.disable(channel);
        }
    }

    /// Issue a data command and pump whole blocks through the data port until the
    /// controller reports completion. Multi-block commands are closed with CMD12.
    pub(crate) fn polling_transfer(
        &mut self,
        cmd: &MmcCommand,
        mut data: TransferData<'_>,
        timeout_ms: u32,
    ) -> Result<(), MmcError> {
        self.host.clear_int_status(IntFlags::STATIC);
        self.send_command(cmd)?;

        let hz = card_clock_hz(self.host.base_clock_hz(), self.config.clock_divider);
        let mut deadline = Deadline::with_policy(self.config.timeout_policy, &self.clock, timeout_ms, hz);
        let blocks = cmd.block_count as usize;
        let mut done = 0usize;

        loop {
            let status = self.host.int_status();

            if status.intersects(IntFlags::DATA_ERRORS) {
                self.error_code |= super::cmd::data_errors(status);
                debug!("Data error {:#x}: {}", status.bits(), self.error_code);
                self.host.clear_int_status(IntFlags::STATIC);
                return Err(MmcError::Failed);
            }

            if done < blocks {
                match &mut data {
                    TransferData::Read(buf) if status.contains(IntFlags::BUFFER_READ_READY) => {
                        self.pump_read(&mut buf[done * MMC_BLOCK_SIZE..(done + 1) * MMC_BLOCK_SIZE]);
                        done += 1;
                        continue;
                    }
                    TransferData::Write(buf) if status.contains(IntFlags::BUFFER_WRITE_READY) => {
                        self.pump_write(&buf[done * MMC_BLOCK_SIZE..(done + 1) * MMC_BLOCK_SIZE]);
                        done += 1;
                        continue;
                    }
                    _ => {}
                }
            }

            if status.contains(IntFlags::TRANSFER_COMPLETE) {
                break;
            }

            if deadline.expired(&self.clock) {
                info!("Data transfer timeout after {} of {} blocks", done, blocks);
                self.error_code |= ErrorCode::DATA_TIMEOUT;
                self.host.clear_int_status(IntFlags::STATIC);
                return Err(MmcError::Timeout);
            }
        }

        // Residual words the controller still signals after completion
        if let TransferData::Read(buf) = &mut data {
            while done < blocks && self.host.int_status().contains(IntFlags::BUFFER_READ_READY) {
                if deadline.expired(&self.clock) {
                    self.error_code |= ErrorCode::DATA_TIMEOUT;
                    self.host.clear_int_status(IntFlags::STATIC);
                    return Err(MmcError::Timeout);
                }
                self.pump_read(&mut buf[done * MMC_BLOCK_SIZE..(done + 1) * MMC_BLOCK_SIZE]);
                done += 1;
            }
        }

        self.host.clear_int_status(IntFlags::STATIC);

        if blocks > 1 {
            self.stop_transmission()?;
        }
        Ok(())
    }

    fn pump_read(&mut self, block: &mut [u8]) {
        for chunk in block.chunks_exact_mut(4) {
            chunk.copy_from_slice(&self.host.read_data().to_le_bytes());
        }
        self.host.clear_int_status(IntFlags::BUFFER_READ_READY);
    }

    fn pump_write(&mut self, block: &[u8]) {
        for chunk in block.chunks_exact(4) {
            self.host
                .write_data(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self.host.clear_int_status(IntFlags::BUFFER_WRITE_READY);
    }
}

fn rw_opcode(read: bool, count: u32) -> u8 {
    match (read, count > 1) {
        (true, false) => MMC_READ_SINGLE_BLOCK,
        (true, true) => MMC_READ_MULTIPLE_BLOCK,
        (false, false) => MMC_WRITE_BLOCK,
        (false, true) => MMC_WRITE_MULTIPLE_BLOCK,
    }
}
