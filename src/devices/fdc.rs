/*
    upd765
    An emulation core for the NEC µPD765 / Intel 8272 Floppy Disk Controller

    Copyright 2026 the upd765 contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    devices::fdc.rs

    Implements the NEC µPD765 Floppy Disk Controller
*/

use anyhow::{bail, Error};

use crate::{
    bus::{DmaChannel, IoDevice, NullDma},
    device_types::fdc::{decode_sector_size, RecordingMode, SectorIdEntry, MAX_SECTOR_SIZE_CODE},
    devices::floppy_drive::{DiskImageStore, FloppyDiskDrive, SectorIoFlags},
    machine_config::FloppyControllerConfig,
};

pub const FDC_IRQ: u8 = 0x06;
pub const FDC_MAX_DRIVES: usize = 4;
/// The most sector IDs a format operation can lay down on one track
/// (26 sectors of 128 bytes on an 8" diskette).
pub const FDC_MAX_FORMAT_SECTORS: usize = 26;
/// Each format sector ID read from DMA is 4 bytes: C, H, R, N.
pub const FORMAT_ID_SIZE: usize = 4;

pub const FDC_DEFAULT_IO_BASE: u16 = 0x03F0;

/// Register offsets from the controller's io_base.
pub const FDC_STATUS_REGISTER: u16 = 0x00;
pub const FDC_DATA_REGISTER: u16 = 0x01;

// Main Status Register Bit Definitions
// --------------------------------------------------------------------------------
// Direction bit is checked by BIOS to tell it if the FDC is expecting a read
// or a write to the Data register.  If this bit is set wrong the BIOS will
// time out waiting for it.
pub const FDC_STATUS_DIO: u8 = 0b0100_0000;

// MRQ (Main Request) is used to determine if the data port is ready to be
// written to or read. If this bit is not set the BIOS will time out waiting for it.
pub const FDC_STATUS_MRQ: u8 = 0b1000_0000;

/// Value produced by a data register read outside the Result phase. Host
/// software polls the data port during Format; the read must stay benign.
pub const DATA_REGISTER_IDLE: u8 = 0x00;

pub const COMMAND_MASK: u8 = 0b0001_1111;
pub const COMMAND_MT_BIT: u8 = 0b1000_0000;
pub const COMMAND_MFM_BIT: u8 = 0b0100_0000;
pub const COMMAND_SKIP_BIT: u8 = 0b0010_0000;

pub const COMMAND_READ_TRACK: u8 = 0x02;
pub const COMMAND_SPECIFY: u8 = 0x03;
pub const COMMAND_SENSE_DRIVE_STATUS: u8 = 0x04;
pub const COMMAND_WRITE_DATA: u8 = 0x05;
pub const COMMAND_READ_DATA: u8 = 0x06;
pub const COMMAND_RECALIBRATE: u8 = 0x07;
pub const COMMAND_SENSE_INT_STATUS: u8 = 0x08;
pub const COMMAND_WRITE_DELETED_DATA: u8 = 0x09;
pub const COMMAND_READ_SECTOR_ID: u8 = 0x0A;
pub const COMMAND_READ_DELETED_DATA: u8 = 0x0C;
pub const COMMAND_FORMAT_TRACK: u8 = 0x0D;
pub const COMMAND_SEEK_HEAD: u8 = 0x0F;
pub const COMMAND_SCAN_EQUAL: u8 = 0x11;
pub const COMMAND_SCAN_LOW_OR_EQUAL: u8 = 0x19;
pub const COMMAND_SCAN_HIGH_OR_EQUAL: u8 = 0x1D;

pub const ST0_HEAD_ACTIVE: u8 = 0b0000_0100;
pub const ST0_NOT_READY: u8 = 0b0000_1000;
pub const ST0_UNIT_CHECK: u8 = 0b0001_0000;
pub const ST0_SEEK_END: u8 = 0b0010_0000;
pub const ST0_ABNORMAL_TERMINATION: u8 = 0b0100_0000;
pub const ST0_INVALID_OPCODE: u8 = 0b1000_0000;

pub const ST1_NO_ID: u8 = 0b0000_0001;
pub const ST1_WRITE_PROTECT: u8 = 0b0000_0010;
pub const ST1_NODATA: u8 = 0b0000_0100;
pub const ST1_CRC_ERROR: u8 = 0b0010_0000;

pub const ST2_SCAN_NOT_SATISFIED: u8 = 0b0000_0100;
pub const ST2_SCAN_EQUAL_HIT: u8 = 0b0000_1000;
pub const ST2_DATA_CRC_ERROR: u8 = 0b0010_0000;
pub const ST2_DELETED_MARK: u8 = 0b0100_0000;

pub const ST3_HEAD: u8 = 0b0000_0100;
pub const ST3_DOUBLESIDED: u8 = 0b0000_1000;
pub const ST3_TRACK0: u8 = 0b0001_0000;
pub const ST3_READY: u8 = 0b0010_0000;
pub const ST3_WRITE_PROTECT: u8 = 0b0100_0000;

/// Longest command is a transfer command: opcode plus 8 parameter bytes.
pub const CMD_BUFFER_SIZE: usize = 9;
/// Longest result is ST0 ST1 ST2 C H R N.
pub const RESULT_BUFFER_SIZE: usize = 7;

/// Phase of the command protocol. The cycle is Command → Execution →
/// (Result | Command); Execution never outlives the register write that
/// entered it, and the Result cursor lives in the variant so re-entering the
/// phase always starts it at zero.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Phase {
    Command,
    Execution,
    Result { cursor: usize },
}

/// Represent the various commands that the NEC FDC knows how to handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    ReadTrack,
    Specify,
    SenseDriveStatus,
    WriteData,
    ReadData,
    Recalibrate,
    SenseIntStatus,
    WriteDeletedData,
    ReadSectorId,
    ReadDeletedData,
    FormatTrack,
    SeekHead,
    ScanEqual,
    ScanLowOrEqual,
    ScanHighOrEqual,
    Invalid,
}

impl Command {
    /// Decode the 5-bit opcode field of a command byte.
    pub fn decode(opcode: u8) -> Command {
        match opcode & COMMAND_MASK {
            COMMAND_READ_TRACK => Command::ReadTrack,
            COMMAND_SPECIFY => Command::Specify,
            COMMAND_SENSE_DRIVE_STATUS => Command::SenseDriveStatus,
            COMMAND_WRITE_DATA => Command::WriteData,
            COMMAND_READ_DATA => Command::ReadData,
            COMMAND_RECALIBRATE => Command::Recalibrate,
            COMMAND_SENSE_INT_STATUS => Command::SenseIntStatus,
            COMMAND_WRITE_DELETED_DATA => Command::WriteDeletedData,
            COMMAND_READ_SECTOR_ID => Command::ReadSectorId,
            COMMAND_READ_DELETED_DATA => Command::ReadDeletedData,
            COMMAND_FORMAT_TRACK => Command::FormatTrack,
            COMMAND_SEEK_HEAD => Command::SeekHead,
            COMMAND_SCAN_EQUAL => Command::ScanEqual,
            COMMAND_SCAN_LOW_OR_EQUAL => Command::ScanLowOrEqual,
            COMMAND_SCAN_HIGH_OR_EQUAL => Command::ScanHighOrEqual,
            _ => Command::Invalid,
        }
    }

    /// Return the (command length, result length) pair for this command, in
    /// bytes including the opcode byte. Both lengths are fixed by the opcode
    /// before any parameter byte arrives.
    pub fn lengths(&self) -> (usize, usize) {
        match self {
            Command::ReadTrack
            | Command::WriteData
            | Command::ReadData
            | Command::WriteDeletedData
            | Command::ReadDeletedData
            | Command::ScanEqual
            | Command::ScanLowOrEqual
            | Command::ScanHighOrEqual => (9, 7),
            Command::ReadSectorId => (2, 7),
            Command::Recalibrate => (2, 0),
            Command::FormatTrack => (6, 7),
            Command::SenseIntStatus => (1, 2),
            Command::Specify => (3, 0),
            Command::SenseDriveStatus => (2, 1),
            Command::SeekHead => (3, 0),
            Command::Invalid => (1, 1),
        }
    }
}

/// Represents the possible values of the Interrupt Code field in Status Register 0.
/// InvalidCommand should be returned for any command not handled by the FDC - later
/// controller models added more commands.
#[derive(Copy, Clone, Debug)]
pub enum InterruptCode {
    NormalTermination,
    AbnormalTermination,
    InvalidCommand,
}

/// Comparison applied by the Scan commands, sector byte against host byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ScanCondition {
    Equal,
    LowOrEqual,
    HighOrEqual,
}

/// Direction of a transfer-family command. All five read/write opcodes and
/// the three scans share one loop body; the grouping is explicit here rather
/// than an artifact of dispatch ordering.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TransferKind {
    Read,
    Write,
    Scan(ScanCondition),
}

#[derive(Copy, Clone, Debug)]
struct TransferOp {
    kind: TransferKind,
    /// Read Track ignores the commanded start sector and always begins at 1.
    force_start_sector: bool,
}

/// Command bytes in flight, carrying the length decoded from the opcode.
/// Bytes past the decoded boundary cannot be stored.
#[derive(Clone, Debug)]
struct CommandBuffer {
    bytes: [u8; CMD_BUFFER_SIZE],
    decoded_len: usize,
    filled: usize,
}

impl CommandBuffer {
    fn new() -> Self {
        CommandBuffer {
            bytes: [0; CMD_BUFFER_SIZE],
            decoded_len: 0,
            filled: 0,
        }
    }

    fn reset(&mut self, decoded_len: usize) {
        debug_assert!(decoded_len >= 1 && decoded_len <= CMD_BUFFER_SIZE);
        self.decoded_len = decoded_len;
        self.filled = 0;
    }

    fn clear(&mut self) {
        self.decoded_len = 0;
        self.filled = 0;
    }

    fn push(&mut self, byte: u8) {
        if self.filled < self.decoded_len {
            self.bytes[self.filled] = byte;
            self.filled += 1;
        }
    }

    fn is_empty(&self) -> bool {
        self.filled == 0
    }

    fn is_full(&self) -> bool {
        self.decoded_len > 0 && self.filled == self.decoded_len
    }

    fn byte(&self, index: usize) -> u8 {
        debug_assert!(index < self.decoded_len);
        self.bytes[index]
    }
}

/// Result bytes queued for the host, carrying the length decoded from the
/// opcode. The Result-phase cursor can never pass it.
#[derive(Clone, Debug)]
struct ResultBuffer {
    bytes: [u8; RESULT_BUFFER_SIZE],
    len: usize,
}

impl ResultBuffer {
    fn new() -> Self {
        ResultBuffer {
            bytes: [0; RESULT_BUFFER_SIZE],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn push(&mut self, byte: u8) {
        debug_assert!(self.len < RESULT_BUFFER_SIZE);
        if self.len < RESULT_BUFFER_SIZE {
            self.bytes[self.len] = byte;
            self.len += 1;
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn byte(&self, index: usize) -> u8 {
        debug_assert!(index < self.len);
        self.bytes[index]
    }
}

pub struct FloppyController {
    io_base: u16,
    phase: Phase,
    command: Command,
    command_buffer: CommandBuffer,
    result_buffer: ResultBuffer,

    // Internal addressing registers, latched from the last command's
    // parameter bytes.
    head_select: u8,
    sector: u8,
    size_code: u8,
    eot: u8,
    gap_len: u8,
    data_len: u8,
    multi_track: bool,
    mfm: bool,
    skip_deleted: bool,

    drive_select: usize,
    dma_cursor: usize,

    seek_end: bool,
    pending_interrupt: bool,

    // Specify command values. Real drive timings; stored, never enforced.
    step_rate: u8,
    head_unload: u8,
    head_load: u8,
    non_dma: bool,

    format_buffer: Vec<SectorIdEntry>,

    drives: [FloppyDiskDrive; FDC_MAX_DRIVES],
    drive_ct: usize,
}

impl Default for FloppyController {
    fn default() -> Self {
        Self {
            io_base: FDC_DEFAULT_IO_BASE,
            phase: Phase::Command,
            command: Command::Invalid,
            command_buffer: CommandBuffer::new(),
            result_buffer: ResultBuffer::new(),

            head_select: 0,
            sector: 1,
            size_code: 0x02,
            eot: 0,
            gap_len: 0,
            data_len: 0,
            multi_track: false,
            mfm: false,
            skip_deleted: false,

            drive_select: 0,
            dma_cursor: 0,

            seek_end: false,
            pending_interrupt: false,

            step_rate: 0,
            head_unload: 0,
            head_load: 0,
            non_dma: false,

            format_buffer: Vec::new(),

            drives: [
                FloppyDiskDrive::default(),
                FloppyDiskDrive::default(),
                FloppyDiskDrive::default(),
                FloppyDiskDrive::default(),
            ],
            drive_ct: 0,
        }
    }
}

/// IO Port handlers for the FDC
impl IoDevice for FloppyController {
    fn read_u8(&mut self, port: u16) -> u8 {
        match port.wrapping_sub(self.io_base) {
            FDC_STATUS_REGISTER => self.handle_status_register_read(),
            FDC_DATA_REGISTER => self.handle_data_register_read(),
            _ => unreachable!("FDC: read from unmapped port: {:04X}", port),
        }
    }

    fn write_u8(&mut self, port: u16, data: u8, dma: Option<&mut dyn DmaChannel>) {
        match port.wrapping_sub(self.io_base) {
            FDC_STATUS_REGISTER => self.handle_drive_select_write(data),
            FDC_DATA_REGISTER => match dma {
                Some(dma) => self.handle_data_register_write(data, dma),
                None => {
                    let mut null_dma = NullDma;
                    self.handle_data_register_write(data, &mut null_dma);
                }
            },
            _ => unreachable!("FDC: write to unmapped port: {:04X}", port),
        }
    }

    fn port_list(&self) -> Vec<(String, u16)> {
        vec![
            (
                String::from("FDC Status/Drive Select Register"),
                self.io_base + FDC_STATUS_REGISTER,
            ),
            (String::from("FDC Data Register"), self.io_base + FDC_DATA_REGISTER),
        ]
    }
}

impl FloppyController {
    pub fn new(config: &FloppyControllerConfig) -> Self {
        let mut fdc = FloppyController {
            io_base: config.io_base.unwrap_or(FDC_DEFAULT_IO_BASE),
            drive_ct: config.drive.len().min(FDC_MAX_DRIVES),
            ..Default::default()
        };

        for (i, drive) in config.drive.iter().take(FDC_MAX_DRIVES).enumerate() {
            fdc.drives[i] = FloppyDiskDrive::new(i, drive.fd_type, drive.write_protect_gate);
        }

        fdc
    }

    /// Reset the Floppy Drive Controller to power-on register state. Drive
    /// attachments survive; head positions return to cylinder 0.
    pub fn reset(&mut self) {
        self.phase = Phase::Command;
        self.command = Command::Invalid;
        self.command_buffer.clear();
        self.result_buffer.clear();

        self.head_select = 0;
        self.sector = 1;
        self.size_code = 0x02;
        self.eot = 0;
        self.gap_len = 0;
        self.data_len = 0;
        self.multi_track = false;
        self.mfm = false;
        self.skip_deleted = false;

        self.drive_select = 0;
        self.dma_cursor = 0;

        self.seek_end = false;
        self.pending_interrupt = false;

        self.format_buffer.clear();

        for drive in self.drives.iter_mut() {
            drive.reset();
        }
    }

    pub fn drive_ct(&self) -> usize {
        self.drive_ct
    }

    pub fn drive(&self, idx: usize) -> &FloppyDiskDrive {
        if idx >= self.drive_ct {
            panic!("Invalid drive index");
        }
        &self.drives[idx]
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Level of the interrupt line to the host PIC. Raised at the end of
    /// every command except Sense Interrupt Status; lowered when the Result
    /// phase drains or Sense Interrupt Status executes.
    pub fn interrupt_pending(&self) -> bool {
        self.pending_interrupt
    }

    /// Program the controller's DMA transfer address. The address advances by
    /// one for every byte moved through the channel.
    pub fn set_dma_address(&mut self, address: usize) {
        self.dma_cursor = address;
    }

    pub fn dma_address(&self) -> usize {
        self.dma_cursor
    }

    /// Mount a disk image into the specified drive.
    pub fn attach_image(&mut self, drive_select: usize, image: Box<dyn DiskImageStore>) -> Result<(), Error> {
        if drive_select >= self.drive_ct {
            bail!("Invalid drive selection: {}", drive_select);
        }
        self.drives[drive_select].attach_image(image);
        Ok(())
    }

    /// Eject the disk image from the specified drive, returning the handle.
    pub fn detach_image(&mut self, drive_select: usize) -> Result<Option<Box<dyn DiskImageStore>>, Error> {
        if drive_select >= self.drive_ct {
            bail!("Invalid drive selection: {}", drive_select);
        }
        Ok(self.drives[drive_select].detach_image())
    }

    /// Read the Main Status Register. RQM is always high - the controller
    /// finishes every operation within the call that started it - and DIO
    /// reports the data direction whenever a command is in flight.
    pub fn handle_status_register_read(&self) -> u8 {
        let mut msr_byte = FDC_STATUS_MRQ;

        // DIO bit => 0=FDC Receiving 1=FDC Sending
        if self.phase != Phase::Command {
            msr_byte |= FDC_STATUS_DIO;
        }

        msr_byte
    }

    /// Handle a write to the status/drive-select port. Only the low two bits
    /// are significant; selecting a drive has no other effect.
    pub fn handle_drive_select_write(&mut self, data: u8) {
        let drive_select = (data & 0x03) as usize;
        if drive_select != self.drive_select {
            log::trace!("Drive {} selected", drive_select);
        }
        self.drive_select = drive_select;
    }

    /// Read the Data Register. In the Result phase this drains one queued
    /// byte; in any other phase the read is benign and returns a fixed value,
    /// since host software polls this port during Format.
    pub fn handle_data_register_read(&mut self) -> u8 {
        match self.phase {
            Phase::Result { cursor } => {
                let out_byte = self.result_buffer.byte(cursor);
                let next = cursor + 1;
                if next >= self.result_buffer.len() {
                    // Host has read all result bytes.
                    log::trace!("Result phase drained, returning to command phase");
                    self.phase = Phase::Command;
                    self.pending_interrupt = false;
                }
                else {
                    self.phase = Phase::Result { cursor: next };
                }
                out_byte
            }
            _ => DATA_REGISTER_IDLE,
        }
    }

    /// Handle a write to the Data Register.
    ///
    /// This register receives commands which may be up to 9 bytes long. The
    /// first byte decodes the opcode and fixes both the command and result
    /// lengths; once the last parameter byte arrives the command executes to
    /// completion before this call returns.
    pub fn handle_data_register_write(&mut self, data: u8, dma: &mut dyn DmaChannel) {
        match self.phase {
            Phase::Command => {
                if self.command_buffer.is_empty() {
                    let command = Command::decode(data & COMMAND_MASK);
                    if let Command::Invalid = command {
                        log::warn!("Received invalid command byte: {:02X}", data);
                    }
                    else {
                        log::trace!("Received {:?} command: {:02X}", command, data);
                    }

                    self.command = command;
                    self.multi_track = data & COMMAND_MT_BIT != 0;
                    self.mfm = data & COMMAND_MFM_BIT != 0;
                    self.skip_deleted = data & COMMAND_SKIP_BIT != 0;

                    let (cmd_len, _) = command.lengths();
                    self.command_buffer.reset(cmd_len);
                }

                self.command_buffer.push(data);
                if self.command_buffer.is_full() {
                    self.phase = Phase::Execution;
                    self.execute_command(dma);
                }
            }
            Phase::Execution => {
                // Only reachable if a DMA channel re-enters the controller,
                // which the contract forbids.
                log::warn!("Data register write during execution phase ignored: {:02X}", data);
            }
            Phase::Result { .. } => {
                log::warn!("Data register write during result phase ignored: {:02X}", data);
            }
        }
    }

    /// Run a fully buffered command to completion, queue its result bytes and
    /// settle the next phase. Every command raises the completion interrupt
    /// except Sense Interrupt Status.
    fn execute_command(&mut self, dma: &mut dyn DmaChannel) {
        let command = self.command;
        let (_, result_len) = command.lengths();
        self.result_buffer.clear();

        match command {
            Command::ReadData | Command::ReadDeletedData => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Read,
                    force_start_sector: false,
                },
                dma,
            ),
            Command::WriteData | Command::WriteDeletedData => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Write,
                    force_start_sector: false,
                },
                dma,
            ),
            Command::ReadTrack => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Read,
                    force_start_sector: true,
                },
                dma,
            ),
            Command::ScanEqual => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Scan(ScanCondition::Equal),
                    force_start_sector: false,
                },
                dma,
            ),
            Command::ScanLowOrEqual => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Scan(ScanCondition::LowOrEqual),
                    force_start_sector: false,
                },
                dma,
            ),
            Command::ScanHighOrEqual => self.command_transfer(
                TransferOp {
                    kind: TransferKind::Scan(ScanCondition::HighOrEqual),
                    force_start_sector: false,
                },
                dma,
            ),
            Command::FormatTrack => self.command_format_track(dma),
            Command::ReadSectorId => self.command_read_sector_id(),
            Command::Recalibrate => self.command_recalibrate(),
            Command::SeekHead => self.command_seek_head(),
            Command::Specify => self.command_specify(),
            Command::SenseDriveStatus => self.command_sense_drive_status(),
            Command::SenseIntStatus => self.command_sense_interrupt(),
            Command::Invalid => self.command_invalid(),
        }

        debug_assert_eq!(self.result_buffer.len(), result_len);

        self.command_buffer.clear();
        if self.result_buffer.is_empty() {
            self.phase = Phase::Command;
        }
        else {
            self.phase = Phase::Result { cursor: 0 };
        }

        if !matches!(command, Command::SenseIntStatus) {
            self.pending_interrupt = true;
        }
    }

    /// Clamp a sector size code to the hardware ceiling. Out-of-range codes
    /// are diagnosed and clamped, never rejected.
    fn clamp_size_code(&self, n: u8) -> u8 {
        if n > MAX_SECTOR_SIZE_CODE {
            log::warn!(
                "Sector size code {} out of range, clamping to {}",
                n,
                MAX_SECTOR_SIZE_CODE
            );
            MAX_SECTOR_SIZE_CODE
        }
        else {
            n
        }
    }

    /// Clamp a format sector count to the per-track hardware maximum.
    fn clamp_sector_count(&self, sc: u8) -> u8 {
        if sc as usize > FDC_MAX_FORMAT_SECTORS {
            log::warn!(
                "Format sector count {} out of range, clamping to {}",
                sc,
                FDC_MAX_FORMAT_SECTORS
            );
            FDC_MAX_FORMAT_SECTORS as u8
        }
        else {
            sc
        }
    }

    /// Create the ST0 status register bitfield with the given parameters.
    fn make_st0_byte(&self, interrupt_code: InterruptCode, drive_select: usize, seek_end: bool) -> u8 {
        // Set selected drive bits
        let mut st0: u8 = (drive_select as u8) & 0x03;

        // Set active head bit
        if self.head_select == 1 {
            st0 |= ST0_HEAD_ACTIVE;
        }

        // Set ready bit
        if !self.drives[drive_select].is_ready() {
            st0 |= ST0_NOT_READY;
        }

        // Set seek bit
        if seek_end {
            st0 |= ST0_SEEK_END;
        }

        // Set interrupt code
        st0 |= match interrupt_code {
            InterruptCode::NormalTermination => 0,
            InterruptCode::AbnormalTermination => ST0_ABNORMAL_TERMINATION,
            InterruptCode::InvalidCommand => ST0_INVALID_OPCODE,
        };

        st0
    }

    /// Generate the value of the ST1 Status Register in response to a command.
    fn make_st1_byte(&self, flags: SectorIoFlags) -> u8 {
        // The ST1 status register contains mostly error codes
        let mut st1_byte = 0;

        if flags.not_found {
            st1_byte |= ST1_NODATA | ST1_NO_ID;
        }
        if flags.crc_error {
            st1_byte |= ST1_CRC_ERROR;
        }
        if flags.not_writable {
            st1_byte |= ST1_WRITE_PROTECT | ST1_NO_ID;
        }

        st1_byte
    }

    /// Generate the value of the ST2 Status Register in response to a command.
    fn make_st2_byte(&self, flags: SectorIoFlags, st2_extra: u8) -> u8 {
        let mut st2_byte = st2_extra;

        if flags.crc_error {
            st2_byte |= ST2_DATA_CRC_ERROR;
        }
        if flags.deleted_mark {
            st2_byte |= ST2_DELETED_MARK;
        }

        st2_byte
    }

    /// Generate the value of the ST3 Status Register in response to a command.
    fn make_st3_byte(&self, drive_select: usize, head_select: u8) -> u8 {
        // Set drive select bits DS0 & DS1
        let mut st3_byte = (drive_select & 0x03) as u8;

        // HDSEL signal: 1 == head 1 active
        if head_select == 1 {
            st3_byte |= ST3_HEAD;
        }

        if self.drives[drive_select].sides() == 2 {
            st3_byte |= ST3_DOUBLESIDED;
        }

        if self.drives[drive_select].track() == 0 {
            st3_byte |= ST3_TRACK0;
        }

        if self.drives[drive_select].is_ready() {
            st3_byte |= ST3_READY;
        }

        if self.drives[drive_select].is_write_protected() {
            st3_byte |= ST3_WRITE_PROTECT;
        }

        st3_byte
    }

    /// Queue the full 7-byte result: three status registers followed by the
    /// C, H, R, N address echo.
    fn send_chs_result(
        &mut self,
        interrupt_code: InterruptCode,
        flags: SectorIoFlags,
        st2_extra: u8,
        c: u8,
        h: u8,
        r: u8,
        n: u8,
    ) {
        let st0_byte = self.make_st0_byte(interrupt_code, self.drive_select, self.seek_end);
        let st1_byte = self.make_st1_byte(flags);
        let st2_byte = self.make_st2_byte(flags, st2_extra);

        self.result_buffer.push(st0_byte);
        self.result_buffer.push(st1_byte);
        self.result_buffer.push(st2_byte);
        self.result_buffer.push(c);
        self.result_buffer.push(h);
        self.result_buffer.push(r);
        self.result_buffer.push(n);
    }

    /// The shared transfer loop behind Read Data, Write Data, their deleted-
    /// mark variants, Read Track and the Scan commands.
    ///
    /// Sector ids run from the start sector through end-of-track inclusive;
    /// every iteration moves exactly one sector of 128 << N bytes through the
    /// DMA channel. A mismatch between the commanded cylinder and the drive's
    /// physical track does not seek - the operation proceeds where commanded
    /// and seek-end is asserted.
    fn command_transfer(&mut self, op: TransferOp, dma: &mut dyn DmaChannel) {
        let drive_head_select = self.command_buffer.byte(1);
        let cylinder = self.command_buffer.byte(2);
        let head = self.command_buffer.byte(3);
        let sector = self.command_buffer.byte(4);
        let sector_size = self.command_buffer.byte(5);
        let track_len = self.command_buffer.byte(6);
        let gap3_len = self.command_buffer.byte(7);
        let data_len = self.command_buffer.byte(8);

        let drive_select = (drive_head_select & 0x03) as usize;
        let head_select = (drive_head_select >> 2) & 0x01;

        if head != head_select {
            // Head and head_select should always match. Seems redundant
            log::warn!("command_transfer(): non-matching head specifiers");
        }

        let n = self.clamp_size_code(sector_size);

        // Latch addressing registers
        self.drive_select = drive_select;
        self.head_select = head_select;
        self.sector = sector;
        self.size_code = n;
        self.eot = track_len;
        self.gap_len = gap3_len;
        self.data_len = data_len;

        if !self.drives[drive_select].is_ready() {
            log::warn!(
                "command_transfer(): drive {} not ready: c:{} h:{} s:{}",
                drive_select,
                cylinder,
                head,
                sector
            );
            self.send_chs_result(
                InterruptCode::AbnormalTermination,
                SectorIoFlags::not_found(),
                0,
                cylinder,
                head_select,
                sector,
                n,
            );
            return;
        }

        // Fail a write operation up front if the disk is write protected and
        // this drive is configured to enforce it.
        if matches!(op.kind, TransferKind::Write)
            && self.drives[drive_select].write_protect_gate
            && self.drives[drive_select].is_write_protected()
        {
            log::warn!("command_transfer(): write operation on write protected disk");
            self.send_chs_result(
                InterruptCode::AbnormalTermination,
                SectorIoFlags::not_writable(),
                0,
                cylinder,
                head_select,
                sector,
                n,
            );
            return;
        }

        // No implicit seek: the operation runs against the commanded cylinder
        // wherever the head happens to be.
        if self.drives[drive_select].track() != cylinder as u16 {
            log::debug!(
                "command_transfer(): drive {} is on track {} but command addresses cylinder {}; no implicit seek",
                drive_select,
                self.drives[drive_select].track(),
                cylinder
            );
            self.seek_end = true;
        }

        let sector_size_decoded = decode_sector_size(n);
        let start_sector = if op.force_start_sector {
            if sector != 1 {
                log::trace!("command_transfer(): start sector forced to 1 (requested {})", sector);
            }
            1
        }
        else {
            sector
        };

        let mut cursor = self.dma_cursor;
        let mut flags = SectorIoFlags::default();
        let mut sector_buf = vec![0u8; sector_size_decoded];
        let mut last_sector = start_sector;
        let mut reached_eot = false;
        let mut scan_hit = false;

        for sector_id in start_sector..=track_len {
            last_sector = sector_id;

            match op.kind {
                TransferKind::Read => {
                    let (sector_flags, media_len) =
                        self.drives[drive_select].read_sector(cylinder, head_select, sector_id, &mut sector_buf);
                    flags.merge(sector_flags);
                    if media_len != 0 && media_len != sector_size_decoded {
                        log::trace!(
                            "command_transfer(): media sector length {} differs from commanded {}",
                            media_len,
                            sector_size_decoded
                        );
                    }
                    for &byte in sector_buf.iter() {
                        dma.put_byte(cursor, byte);
                        cursor += 1;
                    }
                }
                TransferKind::Write => {
                    for byte in sector_buf.iter_mut() {
                        *byte = dma.get_byte(cursor);
                        cursor += 1;
                    }
                    let sector_flags = self.drives[drive_select].write_sector(cylinder, head_select, sector_id, &sector_buf);
                    flags.merge(sector_flags);
                }
                TransferKind::Scan(condition) => {
                    let (sector_flags, _) =
                        self.drives[drive_select].read_sector(cylinder, head_select, sector_id, &mut sector_buf);
                    flags.merge(sector_flags);

                    let mut satisfied = true;
                    for &byte in sector_buf.iter() {
                        let host_byte = dma.get_byte(cursor);
                        cursor += 1;
                        let byte_ok = match condition {
                            ScanCondition::Equal => byte == host_byte,
                            ScanCondition::LowOrEqual => byte <= host_byte,
                            ScanCondition::HighOrEqual => byte >= host_byte,
                        };
                        if !byte_ok {
                            satisfied = false;
                        }
                    }

                    if satisfied {
                        log::trace!("command_transfer(): scan satisfied at sector {}", sector_id);
                        scan_hit = true;
                        if sector_id == track_len {
                            reached_eot = true;
                        }
                        break;
                    }
                }
            }

            if sector_id == track_len {
                reached_eot = true;
            }
        }

        self.dma_cursor = cursor;

        // End-of-track wrap: the sector id returns to 1 and, if the operation
        // ran on head 1, the cylinder advances and the head resets to 0.
        let mut end_cylinder = cylinder;
        let mut end_head = head_select;
        if reached_eot && end_head == 1 {
            end_cylinder = end_cylinder.wrapping_add(1);
            end_head = 0;
        }

        let st2_extra = match op.kind {
            TransferKind::Scan(_) => {
                if scan_hit {
                    ST2_SCAN_EQUAL_HIT
                }
                else {
                    ST2_SCAN_NOT_SATISFIED
                }
            }
            _ => 0,
        };

        let interrupt_code = if flags.any_error() {
            InterruptCode::AbnormalTermination
        }
        else {
            InterruptCode::NormalTermination
        };

        log::trace!(
            "command_transfer() completed: {:?} drive:{} c:{} h:{} s:{}-{} n:{} bytes:{}",
            op.kind,
            drive_select,
            cylinder,
            head_select,
            start_sector,
            last_sector,
            n,
            self.dma_cursor
        );

        self.send_chs_result(interrupt_code, flags, st2_extra, end_cylinder, end_head, last_sector, n);
    }

    /// Accumulate one sector ID into the format buffer. The buffer persists
    /// across commands; an accumulation attempt arriving when it already
    /// holds the requested count resets it rather than failing the command.
    /// Returns true when the accumulated count equals the requested count and
    /// the track is ready to commit.
    fn accumulate_format_entry(&mut self, entry: SectorIdEntry, requested: usize) -> bool {
        let limit = requested.min(FDC_MAX_FORMAT_SECTORS);
        if self.format_buffer.len() >= limit {
            log::warn!(
                "Format sector ID accumulator overflow at {} entries, resetting",
                self.format_buffer.len()
            );
            self.format_buffer.clear();
        }

        self.format_buffer.push(entry);
        self.format_buffer.len() == requested
    }

    /// Perform the Format Track command.
    ///
    /// The host programs DMA for the whole track, but the controller only
    /// pulls 4 ID bytes per sector to build the sector map. Only once the
    /// accumulated map matches the requested sector count is the track
    /// committed to the image in a single operation.
    fn command_format_track(&mut self, dma: &mut dyn DmaChannel) {
        let drive_head_select = self.command_buffer.byte(1);
        let sector_size = self.command_buffer.byte(2);
        let track_len = self.command_buffer.byte(3);
        let gap3_len = self.command_buffer.byte(4);
        let fill_byte = self.command_buffer.byte(5);

        let drive_select = (drive_head_select & 0x03) as usize;
        let head_select = (drive_head_select >> 2) & 0x01;

        let n = self.clamp_size_code(sector_size);
        let sc = self.clamp_sector_count(track_len);

        self.drive_select = drive_select;
        self.head_select = head_select;
        self.size_code = n;
        self.gap_len = gap3_len;

        if !self.drives[drive_select].is_ready() {
            log::warn!("command_format_track(): drive {} not ready", drive_select);
            self.send_chs_result(
                InterruptCode::AbnormalTermination,
                SectorIoFlags::not_found(),
                0,
                0,
                0,
                1,
                n,
            );
            return;
        }

        if self.drives[drive_select].write_protect_gate && self.drives[drive_select].is_write_protected() {
            log::warn!("command_format_track(): format operation on write protected disk");
            self.send_chs_result(
                InterruptCode::AbnormalTermination,
                SectorIoFlags::not_writable(),
                0,
                0,
                0,
                1,
                n,
            );
            return;
        }

        let track = self.drives[drive_select].track() as u8;
        let sector_size_decoded = decode_sector_size(n);
        let mode = if self.mfm { RecordingMode::Mfm } else { RecordingMode::Fm };

        log::trace!(
            "command_format_track(): drive:{} track:{} head:{} sectors:{} n:{} gap3:{} fill:{:02X}",
            drive_select,
            track,
            head_select,
            sc,
            n,
            gap3_len,
            fill_byte
        );

        let mut cursor = self.dma_cursor;
        for _ in 0..sc {
            let entry = SectorIdEntry {
                c: dma.get_byte(cursor),
                h: dma.get_byte(cursor + 1),
                s: dma.get_byte(cursor + 2),
                n: dma.get_byte(cursor + 3),
            };
            cursor += FORMAT_ID_SIZE;

            if self.accumulate_format_entry(entry, sc as usize) {
                let flags = self.drives[drive_select].write_track(
                    track,
                    head_select,
                    sc,
                    sector_size_decoded,
                    &self.format_buffer,
                    mode,
                    fill_byte,
                );
                if flags.any_error() {
                    log::warn!("command_format_track(): track commit reported errors");
                }
                self.format_buffer.clear();
            }
        }
        self.dma_cursor = cursor;

        // The µPD765A datasheet notes the ID information in the Format Track
        // result has no meaning.
        self.send_chs_result(
            InterruptCode::NormalTermination,
            SectorIoFlags::default(),
            0,
            0,
            0,
            1,
            n,
        );
    }

    /// Perform the Read Sector ID command, reporting the logical ID recorded
    /// at the drive's current physical position. Skewed or interleaved media
    /// may record a logical cylinder and head that differ from the physical
    /// ones.
    fn command_read_sector_id(&mut self) {
        let drive_head_select = self.command_buffer.byte(1);

        let drive_select = (drive_head_select & 0x03) as usize;
        let head_select = (drive_head_select >> 2) & 0x01;

        self.drive_select = drive_select;
        self.head_select = head_select;

        if !self.drives[drive_select].is_ready() {
            log::warn!("command_read_sector_id(): drive {} not ready", drive_select);
            self.send_chs_result(
                InterruptCode::AbnormalTermination,
                SectorIoFlags::not_found(),
                0,
                0,
                head_select,
                1,
                self.size_code,
            );
            return;
        }

        let track = self.drives[drive_select].track() as u8;
        let logical_cyl = self.drives[drive_select].logical_cyl(track, head_select, 1);
        let logical_head = self.drives[drive_select].logical_head(track, head_select, 1);

        log::trace!(
            "command_read_sector_id(): drive:{} physical c:{} h:{} logical c:{} h:{}",
            drive_select,
            track,
            head_select,
            logical_cyl,
            logical_head
        );

        self.send_chs_result(
            InterruptCode::NormalTermination,
            SectorIoFlags::default(),
            0,
            logical_cyl,
            logical_head,
            1,
            self.size_code,
        );
    }

    /// Perform the Recalibrate command: return the head to cylinder 0.
    /// There is no result phase; status is reported via Sense Interrupt.
    fn command_recalibrate(&mut self) {
        let drive_select = (self.command_buffer.byte(1) & 0x03) as usize;
        self.drive_select = drive_select;

        if !self.drives[drive_select].is_ready() {
            // An empty drive still completes the command; the not-ready state
            // surfaces in the next Sense Interrupt's ST0.
            log::warn!("command_recalibrate(): drive {} not ready", drive_select);
            self.seek_end = true;
            return;
        }

        self.drives[drive_select].set_track(0);
        self.seek_end = true;

        log::trace!("command_recalibrate() completed: drive:{}", drive_select);
    }

    /// Perform a Seek to the cylinder given in the command.
    ///
    /// This command has no result phase. The status of the command is checked
    /// via Sense Interrupt. Seeks complete instantly; the configured step
    /// timings are never enforced.
    fn command_seek_head(&mut self) {
        let drive_head_select = self.command_buffer.byte(1);
        let cylinder = self.command_buffer.byte(2);

        let drive_select = (drive_head_select & 0x03) as usize;
        let head_select = (drive_head_select >> 2) & 0x01;

        self.drive_select = drive_select;
        self.head_select = head_select;

        if !self.drives[drive_select].is_ready() {
            log::warn!(
                "command_seek_head(): drive {} not ready: c:{} h:{}",
                drive_select,
                cylinder,
                head_select
            );
            self.seek_end = true;
            return;
        }

        self.drives[drive_select].set_track(cylinder as u16);
        self.seek_end = true;

        log::trace!(
            "command_seek_head() completed: drive:{} new track:{}",
            drive_select,
            cylinder
        );
    }

    /// Perform the Specify command.
    /// The provided values model real drive timings; they are stored for
    /// inspection but nothing in this controller enforces them.
    fn command_specify(&mut self) {
        let steprate_unload = self.command_buffer.byte(1);
        let headload_ndm = self.command_buffer.byte(2);

        self.step_rate = (steprate_unload >> 4) & 0x0F;
        self.head_unload = steprate_unload & 0x0F;
        self.head_load = headload_ndm >> 1;
        self.non_dma = headload_ndm & 0x01 != 0;

        log::trace!(
            "command_specify() completed: {:08b},{:08b}",
            steprate_unload,
            headload_ndm
        );
    }

    /// Perform the Sense Drive Status command.
    /// This command returns the ST3 status register.
    fn command_sense_drive_status(&mut self) {
        let drive_head_select = self.command_buffer.byte(1);

        let drive_select = (drive_head_select & 0x03) as usize;
        let head_select = (drive_head_select >> 2) & 0x01;

        self.drive_select = drive_select;
        self.head_select = head_select;

        let st3_byte = self.make_st3_byte(drive_select, head_select);
        self.result_buffer.push(st3_byte);

        log::trace!("command_sense_drive_status() completed: {}", drive_select);
    }

    /// Perform the Sense Interrupt Status command.
    ///
    /// Reports the stored seek-end state and the selected drive's current
    /// track. This is the one command that never raises the completion
    /// interrupt; it instead acknowledges and clears any pending one, so
    /// repeating it with no intervening command reports identical state.
    fn command_sense_interrupt(&mut self) {
        let st0_byte = self.make_st0_byte(InterruptCode::NormalTermination, self.drive_select, self.seek_end);
        let present_cylinder = self.drives[self.drive_select].track() as u8;

        self.result_buffer.push(st0_byte);
        self.result_buffer.push(present_cylinder);

        // Deassert interrupt
        self.pending_interrupt = false;

        log::trace!(
            "command_sense_interrupt() completed: st0:{:08b} pcn:{}",
            st0_byte,
            present_cylinder
        );
    }

    /// Terminal handler for unrecognized opcodes: a single ST0 byte with the
    /// invalid-command code. The controller recovers fully on the next
    /// command byte.
    fn command_invalid(&mut self) {
        let st0_byte = self.make_st0_byte(InterruptCode::InvalidCommand, self.drive_select, false);
        self.result_buffer.push(st0_byte);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device_types::fdc::FloppyImageType,
        floppy_image::MemoryFloppyImage,
        machine_config::{FloppyControllerConfig, FloppyDriveConfig},
        machine_types::FloppyDriveType,
    };
    use std::{cell::RefCell, rc::Rc};

    /// A flat-memory DMA channel that counts traffic in each direction.
    struct VecDma {
        mem: Vec<u8>,
        reads: usize,
        writes: usize,
    }

    impl VecDma {
        fn new(size: usize) -> Self {
            VecDma {
                mem: vec![0; size],
                reads: 0,
                writes: 0,
            }
        }
    }

    impl DmaChannel for VecDma {
        fn get_byte(&mut self, address: usize) -> u8 {
            self.reads += 1;
            self.mem[address % self.mem.len()]
        }
        fn put_byte(&mut self, address: usize, byte: u8) {
            self.writes += 1;
            let len = self.mem.len();
            self.mem[address % len] = byte;
        }
    }

    #[derive(Default)]
    struct ImageLog {
        reads: Vec<(u8, u8, u8)>,
        writes: Vec<(u8, u8, u8)>,
        tracks: Vec<(u8, u8, u8, usize, Vec<SectorIdEntry>, u8)>,
    }

    /// A disk image stub that records every operation for inspection after
    /// the controller has consumed the boxed handle.
    struct RecordingImage {
        log: Rc<RefCell<ImageLog>>,
        fill: u8,
        write_protected: bool,
    }

    impl RecordingImage {
        fn new(fill: u8) -> (Self, Rc<RefCell<ImageLog>>) {
            let log = Rc::new(RefCell::new(ImageLog::default()));
            (
                RecordingImage {
                    log: log.clone(),
                    fill,
                    write_protected: false,
                },
                log,
            )
        }
    }

    impl DiskImageStore for RecordingImage {
        fn is_ready(&self) -> bool {
            true
        }
        fn sides(&self) -> u8 {
            2
        }
        fn is_write_protected(&self) -> bool {
            self.write_protected
        }
        fn logical_cyl(&self, track: u8, _head: u8, _sector: u8) -> u8 {
            track
        }
        fn logical_head(&self, _track: u8, head: u8, _sector: u8) -> u8 {
            head
        }
        fn read_sector(&mut self, track: u8, head: u8, sector: u8, buf: &mut [u8]) -> (SectorIoFlags, usize) {
            self.log.borrow_mut().reads.push((track, head, sector));
            buf.fill(self.fill);
            (SectorIoFlags::default(), buf.len())
        }
        fn write_sector(&mut self, track: u8, head: u8, sector: u8, _data: &[u8]) -> SectorIoFlags {
            self.log.borrow_mut().writes.push((track, head, sector));
            SectorIoFlags::default()
        }
        fn write_track(
            &mut self,
            track: u8,
            head: u8,
            count: u8,
            sector_len: usize,
            sector_map: &[SectorIdEntry],
            _mode: RecordingMode,
            fill_byte: u8,
        ) -> SectorIoFlags {
            self.log
                .borrow_mut()
                .tracks
                .push((track, head, count, sector_len, sector_map.to_vec(), fill_byte));
            SectorIoFlags::default()
        }
    }

    fn test_config(drives: usize) -> FloppyControllerConfig {
        FloppyControllerConfig {
            io_base: None,
            step_rate_ms: None,
            head_settle_ms: None,
            drive: (0..drives)
                .map(|_| FloppyDriveConfig {
                    fd_type: FloppyDriveType::Floppy144M,
                    image: None,
                    write_protect_gate: true,
                })
                .collect(),
        }
    }

    fn fdc_with_image() -> FloppyController {
        let mut fdc = FloppyController::new(&test_config(4));
        fdc.attach_image(0, Box::new(MemoryFloppyImage::new(FloppyImageType::Image144M)))
            .unwrap();
        fdc
    }

    fn write_command(fdc: &mut FloppyController, dma: &mut dyn DmaChannel, bytes: &[u8]) {
        for &byte in bytes {
            fdc.handle_data_register_write(byte, dma);
        }
    }

    fn drain_result(fdc: &mut FloppyController) -> Vec<u8> {
        let mut out = Vec::new();
        while let Phase::Result { .. } = fdc.phase() {
            out.push(fdc.handle_data_register_read());
        }
        out
    }

    #[test]
    fn decoder_table_matches_hardware() {
        for opcode in 0u8..32 {
            let expected = match opcode {
                0x02 | 0x05 | 0x06 | 0x09 | 0x0C | 0x11 | 0x19 | 0x1D => (9, 7),
                0x0A => (2, 7),
                0x07 => (2, 0),
                0x0D => (6, 7),
                0x08 => (1, 2),
                0x03 => (3, 0),
                0x04 => (2, 1),
                0x0F => (3, 0),
                _ => (1, 1),
            };
            assert_eq!(
                Command::decode(opcode).lengths(),
                expected,
                "wrong lengths for opcode {:02X}",
                opcode
            );
        }
    }

    #[test]
    fn decoder_ignores_flag_bits() {
        // MT/MFM/SK occupy the top three bits and must not disturb decode.
        assert_eq!(Command::decode(0xE6 & COMMAND_MASK), Command::ReadData);
        assert_eq!(Command::decode(0x45 & COMMAND_MASK), Command::WriteData);
    }

    #[test]
    fn specify_has_no_result_phase() {
        let mut fdc = FloppyController::new(&test_config(1));
        let mut dma = VecDma::new(16);

        // Step rate 8, head unload 2, head load 4, DMA mode.
        write_command(&mut fdc, &mut dma, &[0x03, 0x82, 0x08]);

        assert_eq!(fdc.phase(), Phase::Command);
        assert_eq!(fdc.handle_status_register_read(), FDC_STATUS_MRQ);
        assert_eq!(fdc.handle_data_register_read(), DATA_REGISTER_IDLE);
        assert_eq!(fdc.step_rate, 8);
        assert_eq!(fdc.head_unload, 2);
        assert_eq!(fdc.head_load, 4);
        assert!(!fdc.non_dma);
        assert!(fdc.interrupt_pending());
    }

    #[test]
    fn seek_then_sense_interrupt() {
        let mut fdc = FloppyController::new(&test_config(1));
        fdc.attach_image(0, Box::new(MemoryFloppyImage::new(FloppyImageType::Image144M)))
            .unwrap();
        let mut dma = VecDma::new(16);

        write_command(&mut fdc, &mut dma, &[0x03, 0x82, 0x08]);
        write_command(&mut fdc, &mut dma, &[0x0F, 0x00, 0x05]);
        assert_eq!(fdc.drive(0).track(), 5);
        assert!(fdc.interrupt_pending());

        write_command(&mut fdc, &mut dma, &[0x08]);
        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 2);
        assert_ne!(result[0] & ST0_SEEK_END, 0);
        assert_eq!(result[0] & 0x03, 0);
        assert_eq!(result[1], 5);
    }

    #[test]
    fn sense_interrupt_is_repeatable() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(16);

        write_command(&mut fdc, &mut dma, &[0x0F, 0x00, 0x05]);

        write_command(&mut fdc, &mut dma, &[0x08]);
        let first = drain_result(&mut fdc);
        assert!(!fdc.interrupt_pending());

        write_command(&mut fdc, &mut dma, &[0x08]);
        let second = drain_result(&mut fdc);

        assert_eq!(first, second);
        // Sense Interrupt never raises a new interrupt of its own.
        assert!(!fdc.interrupt_pending());
    }

    #[test]
    fn oversized_n_clamps_to_max() {
        for n in [7u8, 0x10, 0xFF] {
            let mut fdc = fdc_with_image();
            let mut dma = VecDma::new(16384);

            // Single-sector read with an illegal size code.
            write_command(&mut fdc, &mut dma, &[0x46, 0x00, 0, 0, 1, n, 1, 0x2A, 0xFF]);

            assert_eq!(dma.writes, 128 << 6, "DMA traffic not bounded for N={}", n);
            let result = drain_result(&mut fdc);
            assert_eq!(result.len(), 7);
            assert_eq!(result[6], MAX_SECTOR_SIZE_CODE);
        }
    }

    #[test]
    fn transfer_moves_exact_sector_size() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(1024);

        // One 512-byte sector in each direction; not a byte more.
        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 0, 0, 1, 2, 1, 0x2A, 0xFF]);
        assert_eq!(dma.writes, 512);
        assert_eq!(fdc.dma_address(), 512);
        drain_result(&mut fdc);

        fdc.set_dma_address(0);
        write_command(&mut fdc, &mut dma, &[0x45, 0x00, 0, 0, 1, 2, 1, 0x2A, 0xFF]);
        assert_eq!(dma.reads, 512);
        assert_eq!(fdc.dma_address(), 512);
        drain_result(&mut fdc);
    }

    #[test]
    fn multi_sector_read_runs_to_eot() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, log) = RecordingImage::new(0x11);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(4096);

        // Start sector 8, end of track 10: sectors 8, 9, 10 in order.
        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 0, 0, 8, 2, 10, 0x2A, 0xFF]);

        assert_eq!(log.borrow().reads, vec![(0, 0, 8), (0, 0, 9), (0, 0, 10)]);
        assert_eq!(dma.writes, 3 * 512);

        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert_eq!(result[5], 10, "last sector processed should be EOT");
        assert_eq!(fdc.phase(), Phase::Command);
    }

    #[test]
    fn read_track_forces_start_sector_one() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, log) = RecordingImage::new(0x22);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(4096);

        // Request start sector 5; Read Track must begin at 1 regardless.
        write_command(&mut fdc, &mut dma, &[0x42, 0x00, 0, 0, 5, 2, 3, 0x2A, 0xFF]);

        assert_eq!(log.borrow().reads, vec![(0, 0, 1), (0, 0, 2), (0, 0, 3)]);
        drain_result(&mut fdc);
    }

    #[test]
    fn eot_wrap_on_head_one_advances_cylinder() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, _log) = RecordingImage::new(0x00);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(2048);

        // Head 1, sectors 17..18 of cylinder 2.
        write_command(&mut fdc, &mut dma, &[0x46, 0x04, 2, 1, 17, 2, 18, 0x2A, 0xFF]);

        let result = drain_result(&mut fdc);
        assert_eq!(result[3], 3, "cylinder advances on head 1 wrap");
        assert_eq!(result[4], 0, "head resets to 0 on wrap");
        assert_eq!(result[5], 18, "last sector processed is still EOT");
    }

    #[test]
    fn track_mismatch_proceeds_and_asserts_seek_end() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, log) = RecordingImage::new(0x33);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(1024);

        // Drive is on track 0 but the command addresses cylinder 7.
        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 7, 0, 1, 2, 1, 0x2A, 0xFF]);

        assert_eq!(log.borrow().reads, vec![(7, 0, 1)]);
        assert_eq!(fdc.drive(0).track(), 0, "no implicit seek");

        let result = drain_result(&mut fdc);
        assert_ne!(result[0] & ST0_SEEK_END, 0);
    }

    #[test]
    fn read_id_unattached_drive_reports_not_ready() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(16);

        // Drive 2 has no image.
        write_command(&mut fdc, &mut dma, &[0x0A, 0x02]);

        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert_ne!(result[0] & ST0_NOT_READY, 0);
        assert_ne!(result[0] & ST0_ABNORMAL_TERMINATION, 0);
        assert_eq!(result[0] & 0x03, 2);
        assert_eq!(fdc.phase(), Phase::Command);
    }

    #[test]
    fn read_id_reports_logical_position() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(4096);

        // Format track 0 head 0 with a skewed cylinder id of 9, then read it back.
        for (i, s) in (1..=9).enumerate() {
            let base = i * FORMAT_ID_SIZE;
            dma.mem[base] = 9;
            dma.mem[base + 1] = 0;
            dma.mem[base + 2] = s;
            dma.mem[base + 3] = 2;
        }
        write_command(&mut fdc, &mut dma, &[0x4D, 0x00, 2, 9, 0x54, 0xF6]);
        drain_result(&mut fdc);

        fdc.set_dma_address(0);
        write_command(&mut fdc, &mut dma, &[0x0A, 0x00]);
        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert_eq!(result[3], 9, "logical cylinder read back from the media");
        assert_eq!(result[4], 0);
    }

    #[test]
    fn format_track_commits_full_map_once() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, log) = RecordingImage::new(0x00);
        fdc.attach_image(0, Box::new(image)).unwrap();

        let mut dma = VecDma::new(4096);
        for (i, s) in (1..=18).enumerate() {
            let base = i * FORMAT_ID_SIZE;
            dma.mem[base] = 0;
            dma.mem[base + 1] = 0;
            dma.mem[base + 2] = s;
            dma.mem[base + 3] = 2;
        }

        write_command(&mut fdc, &mut dma, &[0x4D, 0x00, 2, 18, 0x54, 0xF6]);

        {
            let log = log.borrow();
            assert_eq!(log.tracks.len(), 1, "track committed exactly once");
            let (track, head, count, sector_len, map, fill) = &log.tracks[0];
            assert_eq!((*track, *head, *count, *sector_len, *fill), (0, 0, 18, 512, 0xF6));
            assert_eq!(map.len(), 18);
            let sector_ids: Vec<u8> = map.iter().map(|entry| entry.s).collect();
            assert_eq!(sector_ids, (1..=18).collect::<Vec<u8>>());
        }

        assert_eq!(dma.reads, 18 * FORMAT_ID_SIZE);
        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert_eq!(result[0] & (ST0_ABNORMAL_TERMINATION | ST0_INVALID_OPCODE), 0);
    }

    #[test]
    fn format_accumulator_resets_on_overflow() {
        let mut fdc = FloppyController::new(&test_config(1));
        let entry = |s: u8| SectorIdEntry { c: 0, h: 0, s, n: 2 };

        // 18 accumulation attempts fill the map; only the 18th is commit-ready.
        for i in 0..18u8 {
            let ready = fdc.accumulate_format_entry(entry(i + 1), 18);
            assert_eq!(ready, i == 17);
        }
        assert_eq!(fdc.format_buffer.len(), 18);

        // A 19th attempt before any commit resets the accumulator instead of
        // producing a partial map.
        let ready = fdc.accumulate_format_entry(entry(99), 18);
        assert!(!ready);
        assert_eq!(fdc.format_buffer.len(), 1);
        assert_eq!(fdc.format_buffer[0].s, 99);
    }

    #[test]
    fn format_sector_count_clamps_to_hardware_maximum() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, log) = RecordingImage::new(0x00);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(4096);

        // Request 40 sectors; the controller may only lay down 26.
        write_command(&mut fdc, &mut dma, &[0x4D, 0x00, 0, 40, 0x54, 0xE5]);

        let log = log.borrow();
        assert_eq!(log.tracks.len(), 1);
        assert_eq!(log.tracks[0].2, 26);
        assert_eq!(log.tracks[0].4.len(), 26);
        assert_eq!(dma.reads, 26 * FORMAT_ID_SIZE);
    }

    #[test]
    fn write_protect_gate_blocks_write_data() {
        let mut fdc = FloppyController::new(&test_config(1));
        let mut image = MemoryFloppyImage::new(FloppyImageType::Image144M);
        image.set_write_protected(true);
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(1024);

        write_command(&mut fdc, &mut dma, &[0x45, 0x00, 0, 0, 1, 2, 1, 0x2A, 0xFF]);

        assert_eq!(dma.reads, 0, "no DMA traffic for a gated write");
        let result = drain_result(&mut fdc);
        assert_ne!(result[0] & ST0_ABNORMAL_TERMINATION, 0);
        assert_ne!(result[1] & ST1_WRITE_PROTECT, 0);
    }

    #[test]
    fn write_protect_gate_disabled_defers_to_image() {
        let mut config = test_config(1);
        config.drive[0].write_protect_gate = false;
        let mut fdc = FloppyController::new(&config);

        let (mut image, log) = RecordingImage::new(0x00);
        image.write_protected = true;
        fdc.attach_image(0, Box::new(image)).unwrap();
        let mut dma = VecDma::new(1024);

        write_command(&mut fdc, &mut dma, &[0x45, 0x00, 0, 0, 1, 2, 1, 0x2A, 0xFF]);

        // With the gate off the controller moves the data and lets the image
        // decide; this stub accepts the write.
        assert_eq!(dma.reads, 512);
        assert_eq!(log.borrow().writes, vec![(0, 0, 1)]);
        drain_result(&mut fdc);
    }

    #[test]
    fn sense_drive_status_composes_st3() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(16);

        write_command(&mut fdc, &mut dma, &[0x04, 0x00]);
        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 1);
        let st3 = result[0];
        assert_ne!(st3 & ST3_READY, 0);
        assert_ne!(st3 & ST3_TRACK0, 0);
        assert_ne!(st3 & ST3_DOUBLESIDED, 0);
        assert_eq!(st3 & ST3_WRITE_PROTECT, 0);
        assert_eq!(st3 & 0x03, 0);
    }

    #[test]
    fn invalid_opcode_recovers_on_next_command() {
        let mut fdc = FloppyController::new(&test_config(1));
        let mut dma = VecDma::new(16);

        // 0x1F is not a recognized opcode: one command byte, one result byte.
        write_command(&mut fdc, &mut dma, &[0x1F]);
        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 1);
        assert_ne!(result[0] & ST0_INVALID_OPCODE, 0);

        // The controller accepts a normal command immediately afterwards.
        write_command(&mut fdc, &mut dma, &[0x03, 0x82, 0x08]);
        assert_eq!(fdc.phase(), Phase::Command);
    }

    #[test]
    fn data_register_reads_outside_result_are_benign() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(1024);

        assert_eq!(fdc.handle_data_register_read(), DATA_REGISTER_IDLE);

        // Mid-command polling must not disturb the parameter stream.
        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 0]);
        assert_eq!(fdc.handle_data_register_read(), DATA_REGISTER_IDLE);
        write_command(&mut fdc, &mut dma, &[0, 1, 2, 1, 0x2A, 0xFF]);

        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert_eq!(result[5], 1);
    }

    #[test]
    fn result_drain_clears_interrupt_and_direction() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(1024);

        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 0, 0, 1, 2, 1, 0x2A, 0xFF]);
        assert!(fdc.interrupt_pending());
        assert_ne!(fdc.handle_status_register_read() & FDC_STATUS_DIO, 0);

        let result = drain_result(&mut fdc);
        assert_eq!(result.len(), 7);
        assert!(!fdc.interrupt_pending());
        assert_eq!(fdc.handle_status_register_read() & FDC_STATUS_DIO, 0);
    }

    #[test]
    fn drive_select_port_write_selects_drive() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(16);

        fdc.write_u8(FDC_DEFAULT_IO_BASE + FDC_STATUS_REGISTER, 0x02, None);

        write_command(&mut fdc, &mut dma, &[0x08]);
        let result = drain_result(&mut fdc);
        assert_eq!(result[0] & 0x03, 2);
    }

    #[test]
    fn scan_equal_reports_hit_and_stops() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, _log) = RecordingImage::new(0x55);
        fdc.attach_image(0, Box::new(image)).unwrap();

        let mut dma = VecDma::new(2048);
        dma.mem.fill(0x55);

        write_command(&mut fdc, &mut dma, &[0x11, 0x00, 0, 0, 1, 2, 2, 0x2A, 0xFF]);

        // First sector satisfies the comparison; the scan stops there.
        assert_eq!(dma.reads, 512);
        let result = drain_result(&mut fdc);
        assert_ne!(result[2] & ST2_SCAN_EQUAL_HIT, 0);
        assert_eq!(result[2] & ST2_SCAN_NOT_SATISFIED, 0);
        assert_eq!(result[5], 1);
    }

    #[test]
    fn scan_equal_reports_not_satisfied() {
        let mut fdc = FloppyController::new(&test_config(1));
        let (image, _log) = RecordingImage::new(0x55);
        fdc.attach_image(0, Box::new(image)).unwrap();

        // Host memory stays zeroed, so no sector can compare equal.
        let mut dma = VecDma::new(2048);

        write_command(&mut fdc, &mut dma, &[0x11, 0x00, 0, 0, 1, 2, 2, 0x2A, 0xFF]);

        assert_eq!(dma.reads, 2 * 512);
        let result = drain_result(&mut fdc);
        assert_eq!(result[2] & ST2_SCAN_EQUAL_HIT, 0);
        assert_ne!(result[2] & ST2_SCAN_NOT_SATISFIED, 0);
    }

    #[test]
    fn reset_restores_power_on_state() {
        let mut fdc = fdc_with_image();
        let mut dma = VecDma::new(1024);

        write_command(&mut fdc, &mut dma, &[0x0F, 0x00, 0x07]);
        write_command(&mut fdc, &mut dma, &[0x46, 0x00, 7, 0, 1, 2, 1, 0x2A, 0xFF]);
        assert_eq!(fdc.phase(), Phase::Result { cursor: 0 });

        fdc.reset();
        assert_eq!(fdc.phase(), Phase::Command);
        assert!(!fdc.interrupt_pending());
        assert_eq!(fdc.drive(0).track(), 0);
        assert_eq!(fdc.dma_address(), 0);
        // The attachment survives a controller reset.
        assert!(fdc.drive(0).is_ready());
    }

    #[test]
    fn attach_rejects_out_of_range_drive() {
        let mut fdc = FloppyController::new(&test_config(2));
        let result = fdc.attach_image(2, Box::new(MemoryFloppyImage::new(FloppyImageType::Image360K)));
        assert!(result.is_err());
    }
}
