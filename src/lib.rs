//! keyflash: reflash programmable keyboards through their serial DFU
//! bootloader.

pub mod dfu;

#[cfg(test)]
mod test_helpers;
