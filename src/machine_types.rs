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

    machine_types.rs

    Enums describing drive hardware a machine configuration can request.
*/

use crate::device_types::fdc::FloppyImageType;
use serde_derive::Deserialize;
use std::{fmt, fmt::Display, str::FromStr};

#[derive(Copy, Clone, Default, Debug, Hash, Eq, PartialEq, Deserialize)]
pub enum FloppyDriveType {
    #[default]
    Floppy360K,
    Floppy720K,
    Floppy12M,
    Floppy144M,
}

impl FloppyDriveType {
    /// Return the image formats a drive of this type can mount, smallest first.
    pub fn get_compatible_formats(&self) -> Vec<FloppyImageType> {
        match self {
            FloppyDriveType::Floppy360K => vec![
                FloppyImageType::Image160K,
                FloppyImageType::Image180K,
                FloppyImageType::Image320K,
                FloppyImageType::Image360K,
            ],
            FloppyDriveType::Floppy720K => vec![FloppyImageType::Image720K],
            FloppyDriveType::Floppy12M => vec![
                FloppyImageType::Image160K,
                FloppyImageType::Image180K,
                FloppyImageType::Image320K,
                FloppyImageType::Image360K,
                FloppyImageType::Image12M,
            ],
            FloppyDriveType::Floppy144M => vec![FloppyImageType::Image720K, FloppyImageType::Image144M],
        }
    }
}

/// Convert a FloppyDriveType to its largest native image format.
impl From<FloppyDriveType> for FloppyImageType {
    fn from(val: FloppyDriveType) -> Self {
        match val {
            FloppyDriveType::Floppy360K => FloppyImageType::Image360K,
            FloppyDriveType::Floppy720K => FloppyImageType::Image720K,
            FloppyDriveType::Floppy12M => FloppyImageType::Image12M,
            FloppyDriveType::Floppy144M => FloppyImageType::Image144M,
        }
    }
}

impl Display for FloppyDriveType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FloppyDriveType::Floppy360K => write!(f, "360K"),
            FloppyDriveType::Floppy720K => write!(f, "720K"),
            FloppyDriveType::Floppy12M => write!(f, "1.2M"),
            FloppyDriveType::Floppy144M => write!(f, "1.44M"),
        }
    }
}

impl FromStr for FloppyDriveType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, String>
    where
        Self: Sized,
    {
        match s.to_lowercase().as_str() {
            "360k" => Ok(FloppyDriveType::Floppy360K),
            "720k" => Ok(FloppyDriveType::Floppy720K),
            "1.2m" => Ok(FloppyDriveType::Floppy12M),
            "1.44m" => Ok(FloppyDriveType::Floppy144M),
            _ => Err("Bad value for FloppyDriveType".to_string()),
        }
    }
}
