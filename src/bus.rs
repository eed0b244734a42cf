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

    bus.rs

    Traits connecting the controller to the host bus: byte-addressable IO
    ports and the byte-wise DMA channel.
*/

/// Value returned for a read that no device (or register) services.
pub const NO_IO_BYTE: u8 = 0xFF;

/// A device mapped into the host's IO port space.
///
/// The host bus resolves a port number to a device and calls these handlers
/// directly; all device work happens within the call.
pub trait IoDevice {
    /// Read a byte from the specified port.
    fn read_u8(&mut self, port: u16) -> u8;

    /// Write a byte to the specified port. A DMA channel is provided if the
    /// host has wired one up; commands that move sector payloads use it.
    fn write_u8(&mut self, port: u16, data: u8, dma: Option<&mut dyn DmaChannel>);

    /// Return the list of ports the device should be registered at, as tuples
    /// of (port description, port number).
    fn port_list(&self) -> Vec<(String, u16)>;
}

/// The byte get/put contract a DMA channel exposes to a device.
///
/// The device owns the transfer address and increments it once per byte;
/// address wraparound and bounds are the channel's concern, not the
/// device's. Implementations must not call back into the device.
pub trait DmaChannel {
    fn get_byte(&mut self, address: usize) -> u8;
    fn put_byte(&mut self, address: usize, byte: u8);
}

/// Stand-in channel for hosts that service a device without DMA wiring.
/// Reads produce [NO_IO_BYTE] and writes are discarded.
pub struct NullDma;

impl DmaChannel for NullDma {
    fn get_byte(&mut self, _address: usize) -> u8 {
        NO_IO_BYTE
    }
    fn put_byte(&mut self, _address: usize, _byte: u8) {}
}
