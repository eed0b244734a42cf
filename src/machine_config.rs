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

    machine_config.rs

    Configuration the host machine supplies when instantiating the controller.
*/

use crate::machine_types::FloppyDriveType;
use anyhow::Error;
use serde_derive::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct FloppyControllerConfig {
    pub io_base: Option<u16>,
    /// Nominal head step rate. Kept for configuration fidelity; the emulated
    /// controller performs all seeks instantly and never enforces timing.
    #[serde(default)]
    pub step_rate_ms: Option<f64>,
    /// Nominal head settle time. Stored, never enforced.
    #[serde(default)]
    pub head_settle_ms: Option<f64>,
    pub drive: Vec<FloppyDriveConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FloppyDriveConfig {
    #[serde(rename = "type")]
    pub fd_type: FloppyDriveType,
    pub image:   Option<String>,
    /// Whether write protection is enforced at command execution time.
    /// Controller implementations in the field disagree on this; both modes
    /// are supported and selectable per drive.
    #[serde(default = "default_write_protect_gate")]
    pub write_protect_gate: bool,
}

fn default_write_protect_gate() -> bool {
    true
}

impl FloppyControllerConfig {
    /// Parse a controller configuration from a TOML document.
    pub fn from_toml_str(toml_str: &str) -> Result<FloppyControllerConfig, Error> {
        Ok(toml::from_str::<FloppyControllerConfig>(toml_str)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_config_parses_from_toml() {
        let config = FloppyControllerConfig::from_toml_str(
            r#"
            io_base = 0x03F0
            step_rate_ms = 3.0

            [[drive]]
            type = "Floppy360K"
            image = "dos330.img"

            [[drive]]
            type = "Floppy144M"
            write_protect_gate = false
            "#,
        )
        .unwrap();

        assert_eq!(config.io_base, Some(0x03F0));
        assert_eq!(config.step_rate_ms, Some(3.0));
        assert_eq!(config.head_settle_ms, None);
        assert_eq!(config.drive.len(), 2);
        assert_eq!(config.drive[0].fd_type, FloppyDriveType::Floppy360K);
        assert_eq!(config.drive[0].image.as_deref(), Some("dos330.img"));
        assert!(config.drive[0].write_protect_gate);
        assert_eq!(config.drive[1].fd_type, FloppyDriveType::Floppy144M);
        assert!(!config.drive[1].write_protect_gate);
    }

    #[test]
    fn controller_config_rejects_unknown_drive_type() {
        let result = FloppyControllerConfig::from_toml_str(
            r#"
            [[drive]]
            type = "Floppy8In"
            "#,
        );
        assert!(result.is_err());
    }
}
