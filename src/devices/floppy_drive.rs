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

    devices::floppy_drive.rs

    Implements a floppy drive: the per-drive state the controller owns, and
    the contract a mounted disk image must satisfy.
*/

use crate::{
    device_types::fdc::{RecordingMode, SectorIdEntry},
    machine_types::FloppyDriveType,
};

/// Outcome flags for a single sector or track operation against a disk image.
/// These feed directly into the controller's ST1/ST2 status bytes.
#[derive(Copy, Clone, Debug, Default)]
pub struct SectorIoFlags {
    pub not_found: bool,
    pub crc_error: bool,
    pub deleted_mark: bool,
    pub not_writable: bool,
}

impl SectorIoFlags {
    pub fn merge(&mut self, other: SectorIoFlags) {
        self.not_found |= other.not_found;
        self.crc_error |= other.crc_error;
        self.deleted_mark |= other.deleted_mark;
        self.not_writable |= other.not_writable;
    }

    pub fn any_error(&self) -> bool {
        self.not_found || self.crc_error || self.not_writable
    }

    pub fn not_found() -> SectorIoFlags {
        SectorIoFlags {
            not_found: true,
            ..Default::default()
        }
    }

    pub fn not_writable() -> SectorIoFlags {
        SectorIoFlags {
            not_writable: true,
            ..Default::default()
        }
    }
}

/// The contract a mounted disk image exposes to the drive.
///
/// Addressing is by physical track, head and sector id; the logical cylinder
/// and head recorded in a sector's ID field may differ from the physical
/// position (interleave, skew, copy protection), which is what the
/// `logical_cyl`/`logical_head` queries report.
///
/// All failures are reported through [SectorIoFlags]; none of these methods
/// may panic for out-of-range addresses.
pub trait DiskImageStore {
    /// Whether the image is spun up and usable.
    fn is_ready(&self) -> bool;
    /// Number of recording sides (1 or 2).
    fn sides(&self) -> u8;
    fn is_write_protected(&self) -> bool;
    /// Logical cylinder recorded in the ID field at the given physical address.
    fn logical_cyl(&self, track: u8, head: u8, sector: u8) -> u8;
    /// Logical head recorded in the ID field at the given physical address.
    fn logical_head(&self, track: u8, head: u8, sector: u8) -> u8;
    /// Read one sector into `buf`. Returns outcome flags and the sector's
    /// native length on the media, which may differ from `buf.len()`.
    fn read_sector(&mut self, track: u8, head: u8, sector: u8, buf: &mut [u8]) -> (SectorIoFlags, usize);
    /// Write one sector from `data`.
    fn write_sector(&mut self, track: u8, head: u8, sector: u8, data: &[u8]) -> SectorIoFlags;
    /// Format a whole track in one operation: `count` sectors of `sector_len`
    /// bytes, laid out per `sector_map`, filled with `fill_byte`.
    fn write_track(
        &mut self,
        track: u8,
        head: u8,
        count: u8,
        sector_len: usize,
        sector_map: &[SectorIdEntry],
        mode: RecordingMode,
        fill_byte: u8,
    ) -> SectorIoFlags;
}

/// One drive position in the controller's drive table.
pub struct FloppyDiskDrive {
    drive_n: usize,
    drive_type: FloppyDriveType,
    pub(crate) track: u16,
    pub(crate) ready: bool,
    /// Whether write protection is enforced at command execution time (see
    /// machine_config::FloppyDriveConfig).
    pub(crate) write_protect_gate: bool,
    image: Option<Box<dyn DiskImageStore>>,
}

impl Default for FloppyDiskDrive {
    fn default() -> Self {
        Self {
            drive_n: 0,
            drive_type: Default::default(),
            track: 0,
            ready: false,
            write_protect_gate: true,
            image: None,
        }
    }
}

impl FloppyDiskDrive {
    pub fn new(drive_n: usize, drive_type: FloppyDriveType, write_protect_gate: bool) -> Self {
        FloppyDiskDrive {
            drive_n,
            drive_type,
            write_protect_gate,
            ..Default::default()
        }
    }

    pub fn drive_type(&self) -> FloppyDriveType {
        self.drive_type
    }

    /// Mount a disk image. The drive becomes ready immediately.
    pub fn attach_image(&mut self, image: Box<dyn DiskImageStore>) {
        log::debug!("drive {}: image attached", self.drive_n);
        self.image = Some(image);
        self.ready = true;
    }

    /// Eject the mounted image, if any, returning the handle to the caller.
    pub fn detach_image(&mut self) -> Option<Box<dyn DiskImageStore>> {
        if self.image.is_some() {
            log::debug!("drive {}: image detached", self.drive_n);
        }
        self.ready = false;
        self.image.take()
    }

    pub fn disk_present(&self) -> bool {
        self.image.is_some()
    }

    /// A drive is ready when an image is mounted and the image itself
    /// reports ready. An empty drive is never ready; the controller reports
    /// this condition through status bytes rather than failing.
    pub fn is_ready(&self) -> bool {
        self.ready && self.image.as_ref().map_or(false, |image| image.is_ready())
    }

    /// Current physical cylinder the head is positioned over.
    pub fn track(&self) -> u16 {
        self.track
    }

    pub fn set_track(&mut self, track: u16) {
        self.track = track;
    }

    pub fn sides(&self) -> u8 {
        self.image.as_ref().map_or(1, |image| image.sides())
    }

    pub fn is_write_protected(&self) -> bool {
        self.image.as_ref().map_or(false, |image| image.is_write_protected())
    }

    pub fn logical_cyl(&self, track: u8, head: u8, sector: u8) -> u8 {
        self.image
            .as_ref()
            .map_or(track, |image| image.logical_cyl(track, head, sector))
    }

    pub fn logical_head(&self, track: u8, head: u8, sector: u8) -> u8 {
        self.image
            .as_ref()
            .map_or(head, |image| image.logical_head(track, head, sector))
    }

    pub fn read_sector(&mut self, track: u8, head: u8, sector: u8, buf: &mut [u8]) -> (SectorIoFlags, usize) {
        match &mut self.image {
            Some(image) => image.read_sector(track, head, sector, buf),
            None => (SectorIoFlags::not_found(), 0),
        }
    }

    pub fn write_sector(&mut self, track: u8, head: u8, sector: u8, data: &[u8]) -> SectorIoFlags {
        match &mut self.image {
            Some(image) => image.write_sector(track, head, sector, data),
            None => SectorIoFlags::not_found(),
        }
    }

    pub fn write_track(
        &mut self,
        track: u8,
        head: u8,
        count: u8,
        sector_len: usize,
        sector_map: &[SectorIdEntry],
        mode: RecordingMode,
        fill_byte: u8,
    ) -> SectorIoFlags {
        match &mut self.image {
            Some(image) => image.write_track(track, head, count, sector_len, sector_map, mode, fill_byte),
            None => SectorIoFlags::not_found(),
        }
    }

    /// Return the head to cylinder 0, as on controller reset.
    pub fn reset(&mut self) {
        self.track = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device_types::fdc::FloppyImageType, floppy_image::MemoryFloppyImage};

    #[test]
    fn empty_drive_is_never_ready() {
        let drive = FloppyDiskDrive::default();
        assert!(!drive.disk_present());
        assert!(!drive.is_ready());
    }

    #[test]
    fn attach_detach_toggles_ready() {
        let mut drive = FloppyDiskDrive::new(0, FloppyDriveType::Floppy360K, true);
        drive.attach_image(Box::new(MemoryFloppyImage::new(FloppyImageType::Image360K)));
        assert!(drive.disk_present());
        assert!(drive.is_ready());
        assert_eq!(drive.sides(), 2);

        let image = drive.detach_image();
        assert!(image.is_some());
        assert!(!drive.is_ready());
    }

    #[test]
    fn empty_drive_reports_not_found() {
        let mut drive = FloppyDiskDrive::default();
        let mut buf = [0u8; 512];
        let (flags, len) = drive.read_sector(0, 0, 1, &mut buf);
        assert!(flags.not_found);
        assert_eq!(len, 0);

        let flags = drive.write_sector(0, 0, 1, &buf);
        assert!(flags.not_found);
    }

    #[test]
    fn logical_queries_pass_through_physical_when_empty() {
        let drive = FloppyDiskDrive::default();
        assert_eq!(drive.logical_cyl(7, 1, 3), 7);
        assert_eq!(drive.logical_head(7, 1, 3), 1);
    }
}
