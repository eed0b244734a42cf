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

    device_types::fdc.rs

    Defines types common to implementations of a Floppy Disk Controller
*/

use crate::device_types::geometry::DriveGeometry;
use lazy_static::lazy_static;
use std::{collections::HashMap, fmt::Display};

/// Largest sector size code the controller accepts. The effective sector size
/// is 128 << N, so this caps a single sector at 8192 bytes. Larger codes are
/// silently clamped, never rejected.
pub const MAX_SECTOR_SIZE_CODE: u8 = 0x06;

/// Decode a sector size code (N) into a size in bytes.
pub fn decode_sector_size(n: u8) -> usize {
    128usize << n.min(MAX_SECTOR_SIZE_CODE)
}

/// Encode a sector size in bytes into the nearest sector size code (N).
pub fn encode_sector_size(size: usize) -> u8 {
    let mut n = 0u8;
    while n < MAX_SECTOR_SIZE_CODE && (128usize << n) < size {
        n += 1;
    }
    n
}

/// A single sector ID field, as written to a track during format:
/// cylinder, head, sector id and sector size code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SectorIdEntry {
    pub c: u8,
    pub h: u8,
    pub s: u8,
    pub n: u8,
}

impl Display for SectorIdEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{} h:{} s:{} n:{}]", self.c, self.h, self.s, self.n)
    }
}

/// Recording mode of a track: single density (FM) or double density (MFM).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordingMode {
    Fm,
    Mfm,
}

impl Display for RecordingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordingMode::Fm => write!(f, "FM"),
            RecordingMode::Mfm => write!(f, "MFM"),
        }
    }
}

/// The standard PC diskette formats a drive of this class may contain.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum FloppyImageType {
    Image160K,
    Image180K,
    Image320K,
    Image360K,
    Image720K,
    Image12M,
    Image144M,
}

impl FloppyImageType {
    /// Return the standard geometry for this image type.
    pub fn geometry(&self) -> DriveGeometry {
        // Safe to unwrap as the table covers every variant.
        *DISK_FORMATS.get(self).unwrap()
    }

    /// Find the standard format matching a raw image size, if any.
    pub fn from_size(size: usize) -> Option<FloppyImageType> {
        DISK_FORMATS
            .iter()
            .find(|(_, geom)| geom.total_size() == size)
            .map(|(format, _)| *format)
    }
}

lazy_static! {
    /// Geometry table for the standard image formats.
    pub static ref DISK_FORMATS: HashMap<FloppyImageType, DriveGeometry> = {
        let mut map = HashMap::new();
        map.insert(FloppyImageType::Image160K, DriveGeometry::new(40, 1, 8, 1, 512));
        map.insert(FloppyImageType::Image180K, DriveGeometry::new(40, 1, 9, 1, 512));
        map.insert(FloppyImageType::Image320K, DriveGeometry::new(40, 2, 8, 1, 512));
        map.insert(FloppyImageType::Image360K, DriveGeometry::new(40, 2, 9, 1, 512));
        map.insert(FloppyImageType::Image720K, DriveGeometry::new(80, 2, 9, 1, 512));
        map.insert(FloppyImageType::Image12M, DriveGeometry::new(80, 2, 15, 1, 512));
        map.insert(FloppyImageType::Image144M, DriveGeometry::new(80, 2, 18, 1, 512));
        map
    };
}
