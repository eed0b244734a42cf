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

    floppy_image.rs

    An in-memory disk image backing store for standard PC diskette formats.
    Container file formats are the host's concern; this store works from a
    raw sector vector and tracks the logical sector maps laid down by format
    operations.
*/

use crate::{
    device_types::{
        chs::DiskChs,
        fdc::{FloppyImageType, RecordingMode, SectorIdEntry},
        geometry::DriveGeometry,
    },
    devices::floppy_drive::{DiskImageStore, SectorIoFlags},
};
use anyhow::{anyhow, Error};
use std::collections::HashMap;

pub struct MemoryFloppyImage {
    geometry: DriveGeometry,
    data: Vec<u8>,
    write_protected: bool,
    /// Logical sector ids laid down by the last format of each (track, head).
    /// Unformatted tracks serve a 1:1 physical mapping.
    sector_maps: HashMap<(u8, u8), Vec<SectorIdEntry>>,
}

impl MemoryFloppyImage {
    /// Create a blank, zero-filled image of the given standard format.
    pub fn new(format: FloppyImageType) -> Self {
        let geometry = format.geometry();
        MemoryFloppyImage {
            geometry,
            data: vec![0; geometry.total_size()],
            write_protected: false,
            sector_maps: HashMap::new(),
        }
    }

    /// Create an image from a raw sector vector. The geometry is derived from
    /// the vector's length; unrecognized sizes are an error.
    pub fn from_vec(src_vec: Vec<u8>, write_protected: bool) -> Result<Self, Error> {
        let format = FloppyImageType::from_size(src_vec.len())
            .ok_or_else(|| anyhow!("No standard format matches raw image size: {}", src_vec.len()))?;

        log::debug!("Raw image of {} bytes mounted as {:?}", src_vec.len(), format);

        Ok(MemoryFloppyImage {
            geometry: format.geometry(),
            data: src_vec,
            write_protected,
            sector_maps: HashMap::new(),
        })
    }

    pub fn geometry(&self) -> DriveGeometry {
        self.geometry
    }

    pub fn set_write_protected(&mut self, write_protected: bool) {
        self.write_protected = write_protected;
    }

    /// Borrow the raw sector data, for hosts that persist the image.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    fn sector_offset(&self, track: u8, head: u8, sector: u8) -> Option<usize> {
        let chs = DiskChs::new(track as u16, head, sector);
        self.geometry
            .contains(chs)
            .then(|| chs.to_lba(&self.geometry) * self.geometry.size())
    }
}

impl DiskImageStore for MemoryFloppyImage {
    fn is_ready(&self) -> bool {
        true
    }

    fn sides(&self) -> u8 {
        self.geometry.h()
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn logical_cyl(&self, track: u8, head: u8, sector: u8) -> u8 {
        self.sector_maps.get(&(track, head)).map_or(track, |map| {
            map.iter()
                .find(|entry| entry.s == sector)
                .or_else(|| map.first())
                .map_or(track, |entry| entry.c)
        })
    }

    fn logical_head(&self, track: u8, head: u8, sector: u8) -> u8 {
        self.sector_maps.get(&(track, head)).map_or(head, |map| {
            map.iter()
                .find(|entry| entry.s == sector)
                .or_else(|| map.first())
                .map_or(head, |entry| entry.h)
        })
    }

    fn read_sector(&mut self, track: u8, head: u8, sector: u8, buf: &mut [u8]) -> (SectorIoFlags, usize) {
        match self.sector_offset(track, head, sector) {
            Some(offset) => {
                let native_len = self.geometry.size();
                let copy_len = native_len.min(buf.len());
                buf[..copy_len].copy_from_slice(&self.data[offset..offset + copy_len]);
                (SectorIoFlags::default(), native_len)
            }
            None => {
                log::trace!("read_sector: no sector at c:{} h:{} s:{}", track, head, sector);
                (SectorIoFlags::not_found(), 0)
            }
        }
    }

    fn write_sector(&mut self, track: u8, head: u8, sector: u8, data: &[u8]) -> SectorIoFlags {
        if self.write_protected {
            return SectorIoFlags::not_writable();
        }
        match self.sector_offset(track, head, sector) {
            Some(offset) => {
                let copy_len = self.geometry.size().min(data.len());
                self.data[offset..offset + copy_len].copy_from_slice(&data[..copy_len]);
                SectorIoFlags::default()
            }
            None => {
                log::trace!("write_sector: no sector at c:{} h:{} s:{}", track, head, sector);
                SectorIoFlags::not_found()
            }
        }
    }

    fn write_track(
        &mut self,
        track: u8,
        head: u8,
        count: u8,
        sector_len: usize,
        sector_map: &[SectorIdEntry],
        mode: RecordingMode,
        fill_byte: u8,
    ) -> SectorIoFlags {
        if self.write_protected {
            return SectorIoFlags::not_writable();
        }
        if count as usize != sector_map.len() {
            log::warn!(
                "write_track: sector count {} disagrees with map length {}",
                count,
                sector_map.len()
            );
        }

        log::debug!(
            "write_track: c:{} h:{} sectors:{} len:{} mode:{} fill:{:02X}",
            track,
            head,
            sector_map.len(),
            sector_len,
            mode,
            fill_byte
        );

        let mut flags = SectorIoFlags::default();
        for entry in sector_map {
            match self.sector_offset(track, head, entry.s) {
                Some(offset) => {
                    let fill_len = self.geometry.size().min(sector_len);
                    self.data[offset..offset + fill_len].fill(fill_byte);
                }
                None => {
                    log::warn!("write_track: sector id {} outside geometry", entry);
                    flags.not_found = true;
                }
            }
        }

        self.sector_maps.insert((track, head), sector_map.to_vec());
        flags
    }
}
