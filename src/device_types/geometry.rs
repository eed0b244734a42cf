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

//! Define a [DriveGeometry] that represents cylinder, head, and sector based
//! drive geometry for standard disk formats.

use crate::device_types::chs::{DiskChs, DiskChsIterator};
use std::fmt::Display;

/// A structure representing how sectors are laid out on a disk (assuming standard format)
///  - Cylinder (c)
///  - Head (h)
///  - Sector count (s)
///
/// Plus a sector ID offset (s_off) to represent whether a standard sector id starts at 0 or 1.
#[derive(Copy, Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct DriveGeometry {
    pub(crate) c: u16,
    pub(crate) h: u8,
    pub(crate) s: u8,
    pub(crate) s_off: u8,
    pub(crate) size: usize,
}

impl Display for DriveGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[c:{:2} h:{} s:{:2} s_off:{}]", self.c, self.h, self.s, self.s_off)
    }
}

impl DriveGeometry {
    /// Create a new [DriveGeometry] structure from cylinder, head and sector id components.
    pub fn new(c: u16, h: u8, s: u8, s_off: u8, size: usize) -> Self {
        Self { c, h, s, s_off, size }
    }
    pub fn get(&self) -> (u16, u8, u8, u8, usize) {
        (self.c, self.h, self.s, self.s_off, self.size)
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
    /// Return the sector count (s) field.
    #[inline]
    pub fn s(&self) -> u8 {
        self.s
    }
    /// Return the sector id offset (s_off) field.
    #[inline]
    pub fn s_off(&self) -> u8 {
        self.s_off
    }
    #[inline]
    /// Return the size of a sector in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
    /// Return a [DiskChs] structure representing the cylinder, head and sector count components
    /// of a [DriveGeometry].
    #[inline]
    pub fn chs(&self) -> DiskChs {
        DiskChs::new(self.c, self.h, self.s)
    }
    /// Return the number of sectors represented by a [DriveGeometry].
    pub fn total_sectors(&self) -> usize {
        (self.c as usize) * (self.h as usize) * (self.s as usize)
    }
    /// Return the total capacity in bytes represented by a [DriveGeometry].
    pub fn total_size(&self) -> usize {
        self.total_sectors() * self.size
    }
    /// Return a boolean indicating whether this [DriveGeometry] contains the specified [DiskChs]
    /// representing a sector id.
    pub fn contains(&self, chs: impl Into<DiskChs>) -> bool {
        let chs = chs.into();
        self.c > chs.c && self.h > chs.h && self.s > (chs.s.saturating_sub(self.s_off)) && chs.s >= self.s_off
    }

    pub fn chs_iter(&self) -> DiskChsIterator {
        DiskChs::new(self.c, self.h, self.s).iter(*self)
    }
}
