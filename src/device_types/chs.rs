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
*/

//! Define a [DiskChs] that represents cylinder, head, sector addressing.

use crate::device_types::geometry::DriveGeometry;
use std::fmt::Display;

/// A structure representing a cylinder, head, sector address
///  - Cylinder (c)
///  - Head (h)
///  - Sector ID (s)
///
/// A DiskChs may represent a Sector ID, where size is ignored, or an overall disk geometry.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct DiskChs {
    pub(crate) c: u16,
    pub(crate) h: u8,
    pub(crate) s: u8,
}

impl Default for DiskChs {
    fn default() -> Self {
        Self { c: 0, h: 0, s: 1 }
    }
}

impl From<(u16, u8, u8)> for DiskChs {
    fn from((c, h, s): (u16, u8, u8)) -> Self {
        Self { c, h, s }
    }
}

impl From<DiskChs> for (u16, u8, u8) {
    fn from(chs: DiskChs) -> Self {
        (chs.c, chs.h, chs.s)
    }
}

impl Display for DiskChs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{:2} h:{} s:{:3}]", self.c, self.h, self.s)
    }
}

impl DiskChs {
    /// Create a new `DiskChs` structure from cylinder, head and sector id components.
    pub fn new(c: u16, h: u8, s: u8) -> Self {
        Self { c, h, s }
    }
    /// Return the cylinder, head and sector id components in a tuple.
    #[inline]
    pub fn get(&self) -> (u16, u8, u8) {
        (self.c, self.h, self.s)
    }
    /// Return the cylinder (c) field.
    #[inline]
    pub fn c(&self) -> u16 {
        self.c
    }
    /// Return the head (h) field.
    #[inline]
    pub fn h(&self) -> u8 {
        self.h
    }
    /// Return the sector id (s) field.
    #[inline]
    pub fn s(&self) -> u8 {
        self.s
    }
    /// Set the three components of a `DiskChs`
    pub fn set(&mut self, c: u16, h: u8, s: u8) {
        self.c = c;
        self.h = h;
        self.s = s;
    }

    /// Return the number of sectors represented by a DiskChs structure, interpreted as drive geometry.
    pub fn total_sectors(&self) -> usize {
        (self.c as usize) * (self.h as usize) * (self.s as usize)
    }

    /// Convert a [DiskChs] struct to an LBA sector address.
    /// A reference [DriveGeometry] is required to calculate the address.
    /// Only valid for standard disk formats.
    pub fn to_lba(&self, geom: &DriveGeometry) -> usize {
        let hpc = geom.h() as usize;
        let spt = geom.s() as usize;
        (self.c as usize * hpc + (self.h as usize)) * spt + (self.s.saturating_sub(geom.s_off) as usize)
    }

    /// Return a new `DiskChs` that is the next sector on the disk, according to the specified
    /// geometry.
    /// Returns None if the current `DiskChs` represents the last sector of the specified geometry.
    /// This function should only be used for iterating through sectors in a standard disk format.
    pub fn next_sector(&self, geom: &DriveGeometry) -> Option<DiskChs> {
        if self.s < (geom.s() - 1 + geom.s_off) {
            // Not at last sector, just return next sector
            Some(DiskChs::from((self.c, self.h, self.s + 1)))
        }
        else if self.h < geom.h().saturating_sub(1) {
            // At last sector, but not at last head, go to next head, same cylinder, sector (s_off)
            Some(DiskChs::from((self.c, self.h + 1, geom.s_off)))
        }
        else if self.c < geom.c().saturating_sub(1) {
            // At last sector and last head, go to next cylinder, head 0, sector (s_off)
            Some(DiskChs::from((self.c + 1, 0, geom.s_off)))
        }
        else {
            // At end of disk.
            None
        }
    }

    /// Return a `DiskChsIterator` that will iterate through all sectors in order, interpreting the
    /// `DiskChs` as a standard disk geometry.
    pub fn iter(&self, geom: DriveGeometry) -> DiskChsIterator {
        DiskChsIterator { geom, chs: None }
    }
}

pub struct DiskChsIterator {
    geom: DriveGeometry,
    chs:  Option<DiskChs>,
}

impl Iterator for DiskChsIterator {
    type Item = DiskChs;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chs) = &mut self.chs {
            *chs = chs.next_sector(&self.geom)?;
        }
        else {
            self.chs = Some(DiskChs::new(0, 0, self.geom.s_off));
        }
        self.chs
    }
}
