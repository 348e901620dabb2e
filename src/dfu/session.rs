//! Firmware-update session for the Nordic legacy serial bootloader.
//!
//! Drives the bootloader command sequence over a [`DfuTransport`]:
//! 1. StartDfu - Announce image type and sizes, then wait for flash erase
//! 2. InitPacket - Send init data (`.dat` contents)
//! 3. Data - Send the image in 512-byte chunks, pausing for page writes
//! 4. StopData - End the transfer
//! 5. ValidateFirmware / ActivateAndReset - Finalize; the target may reset
//!    before it acknowledges either

use std::time::Duration;

use log::{debug, info, warn};

use super::config::{
    millis_f64, page_write_time, TransportConfig, DFU_PACKET_MAX_SIZE, FLASH_PAGE_ERASE_TIME_MS,
    FLASH_PAGE_SIZE, FRAMES_PER_FLASH_PAGE, MIN_ERASE_WAIT_MS,
};
use super::error::DfuResult;
use super::events::{DfuEvent, EventBus, EventKind};
use super::firmware_reader::FirmwareImage;
use super::packet::{
    data_payload, init_payload, opcode_payload, start_dfu_payload, DfuMode, PacketKind,
};
use super::transport::DfuTransport;

/// Number of flash pages an image of `total_size` bytes touches, counting
/// whole pages only.
fn flash_pages(total_size: u32) -> u32 {
    total_size / FLASH_PAGE_SIZE as u32 + 1
}

/// Time the bootloader needs to erase flash for an image of `total_size` bytes.
pub fn erase_wait_time(total_size: u32) -> Duration {
    let erase_ms = f64::from(flash_pages(total_size)) * FLASH_PAGE_ERASE_TIME_MS;
    millis_f64(erase_ms.max(MIN_ERASE_WAIT_MS))
}

/// Whether to wait for a flash page write after the chunk at `index`.
///
/// The final chunk always gets its own pause in addition to this rule.
pub fn needs_page_write_pause(index: usize) -> bool {
    index > 0 && index % FRAMES_PER_FLASH_PAGE == 0
}

/// Image parameters announced by the last acknowledged StartDfu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParameters {
    pub total_size: u32,
    pub softdevice_size: u32,
    pub single_bank: bool,
}

impl ImageParameters {
    pub fn erase_wait_time(&self) -> Duration {
        erase_wait_time(self.total_size)
    }

    /// How long the target takes to copy and activate the new image.
    pub fn activate_wait_time(&self) -> Duration {
        let erase_wait = self.erase_wait_time();
        if self.single_bank && self.softdevice_size == 0 {
            erase_wait + page_write_time()
        } else {
            erase_wait + page_write_time() * flash_pages(self.total_size)
        }
    }
}

/// How a finalizing request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    /// The bootloader acknowledged the request.
    Acknowledged,
    /// The target went away first, which it does once it accepts the image.
    DeviceReset,
}

/// One firmware-update conversation with a bootloader.
#[derive(Debug)]
pub struct DfuSession {
    transport: DfuTransport,
    image: Option<ImageParameters>,
}

impl DfuSession {
    pub fn new(transport: DfuTransport) -> Self {
        Self {
            transport,
            image: None,
        }
    }

    /// Session over a real serial port.
    pub fn serial(config: TransportConfig) -> Self {
        Self::new(DfuTransport::serial(config))
    }

    pub fn transport(&self) -> &DfuTransport {
        &self.transport
    }

    pub fn open(&mut self) -> DfuResult<()> {
        self.transport.open()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    pub fn on<F>(&mut self, kind: EventKind, callback: F)
    where
        F: Fn(&DfuEvent) + Send + 'static,
    {
        self.transport.on(kind, callback);
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        self.transport.events_mut()
    }

    pub fn image_parameters(&self) -> Option<ImageParameters> {
        self.image
    }

    /// Activation time for the image announced by the last StartDfu.
    ///
    /// `None` until a StartDfu has been acknowledged.
    pub fn activate_wait_time(&self) -> Option<Duration> {
        self.image.map(|image| image.activate_wait_time())
    }

    /// Announce the image and wait for the bootloader to erase flash.
    pub fn send_start_dfu(
        &mut self,
        mode: DfuMode,
        softdevice_size: u32,
        bootloader_size: u32,
        app_size: u32,
    ) -> DfuResult<()> {
        info!(
            "[DFU] StartDfu mode={:?} sd={} bl={} app={}",
            mode, softdevice_size, bootloader_size, app_size
        );
        let payload = start_dfu_payload(mode, softdevice_size, bootloader_size, app_size);
        let packet = self.transport.frame_packet(PacketKind::Start, payload)?;
        self.transport.send_packet(&packet)?;

        let image = ImageParameters {
            total_size: softdevice_size
                .saturating_add(bootloader_size)
                .saturating_add(app_size),
            softdevice_size,
            single_bank: self.transport.config().single_bank,
        };
        let erase_wait = image.erase_wait_time();
        info!(
            "[DFU] Waiting {:.1} ms for flash erase",
            erase_wait.as_secs_f64() * 1000.0
        );
        self.transport.pause(erase_wait);
        self.image = Some(image);
        Ok(())
    }

    /// Send the init packet (`.dat` contents).
    pub fn send_init_packet(&mut self, init_data: &[u8]) -> DfuResult<()> {
        info!("[DFU] Init packet, {} bytes", init_data.len());
        let packet = self
            .transport
            .frame_packet(PacketKind::Init, init_payload(init_data))?;
        self.transport.send_packet(&packet)?;
        Ok(())
    }

    /// Send the image in data packets, then StopData.
    pub fn send_firmware(&mut self, firmware: &[u8]) -> DfuResult<()> {
        let chunks: Vec<&[u8]> = firmware.chunks(DFU_PACKET_MAX_SIZE).collect();
        let total = chunks.len();
        info!(
            "[DFU] Sending {} bytes in {} data packets",
            firmware.len(),
            total
        );

        self.emit_progress(0, false, "Starting firmware transfer".to_string());

        for (index, chunk) in chunks.iter().enumerate() {
            let packet = self
                .transport
                .frame_packet(PacketKind::Data, data_payload(chunk))?;
            self.transport.send_packet(&packet)?;

            let percent = (100 * (index + 1) / total) as u8;
            self.emit_progress(
                percent,
                false,
                format!("Sent packet {} of {}", index + 1, total),
            );

            // After 8 frames (4096 bytes) the nRF52 erases and writes a flash
            // page, blocking its CPU.
            if needs_page_write_pause(index) {
                debug!("[DFU] Flash page complete after packet {}", index + 1);
                self.transport.pause(page_write_time());
            }
        }

        self.transport.pause(page_write_time());

        let packet = self
            .transport
            .frame_packet(PacketKind::StopData, opcode_payload(PacketKind::StopData))?;
        self.transport.send_packet(&packet)?;

        self.emit_progress(100, true, "Firmware transfer complete".to_string());
        Ok(())
    }

    /// Ask the bootloader to validate the received image.
    ///
    /// The target often resets before acknowledging; that counts as success.
    pub fn send_validate_firmware(&mut self) -> DfuResult<ActivationOutcome> {
        let packet = self.transport.frame_packet(
            PacketKind::ValidateFirmware,
            opcode_payload(PacketKind::ValidateFirmware),
        )?;

        let timeout = self.transport.config().validate_timeout();
        match self.transport.send_packet_within(&packet, timeout) {
            Ok(_) => Ok(ActivationOutcome::Acknowledged),
            Err(err) if err.is_device_reset() => {
                info!("[DFU] Device reset during validation ({}), treating as success", err);
                Ok(ActivationOutcome::DeviceReset)
            }
            Err(err) => Err(err),
        }
    }

    /// Ask the bootloader to activate the new image and reset.
    ///
    /// Never fails once the packet is framed: any transport failure is logged
    /// and reported as a device reset.
    pub fn send_activate_firmware(&mut self) -> DfuResult<ActivationOutcome> {
        let packet = self.transport.frame_packet(
            PacketKind::ActivateAndReset,
            opcode_payload(PacketKind::ActivateAndReset),
        )?;

        let timeout = self.transport.config().activate_timeout();
        match self.transport.send_packet_within(&packet, timeout) {
            Ok(_) => Ok(ActivationOutcome::Acknowledged),
            Err(err) => {
                warn!("[DFU] Activate not acknowledged ({}), treating as success", err);
                Ok(ActivationOutcome::DeviceReset)
            }
        }
    }

    /// Check that the bootloader answers.
    pub fn send_ping(&mut self) -> bool {
        let packet = match self
            .transport
            .frame_packet(PacketKind::Ping, opcode_payload(PacketKind::Ping))
        {
            Ok(packet) => packet,
            Err(err) => {
                warn!("[DFU] Could not frame ping: {}", err);
                return false;
            }
        };

        match self.transport.send_packet(&packet) {
            Ok(_) => true,
            Err(err) => {
                debug!("[DFU] Ping failed: {}", err);
                false
            }
        }
    }

    /// Run the complete update of one image.
    ///
    /// Activation is skipped when the target already reset while validating.
    pub fn flash_image(&mut self, image: &FirmwareImage) -> DfuResult<ActivationOutcome> {
        info!(
            "[DFU] Flashing {} ({:?}, {} bytes)",
            image.bin_file,
            image.mode,
            image.firmware_data.len()
        );

        self.send_start_dfu(
            image.mode,
            image.softdevice_size,
            image.bootloader_size,
            image.application_size,
        )?;
        self.send_init_packet(&image.init_data)?;
        self.send_firmware(&image.firmware_data)?;

        match self.send_validate_firmware()? {
            ActivationOutcome::DeviceReset => Ok(ActivationOutcome::DeviceReset),
            ActivationOutcome::Acknowledged => self.send_activate_firmware(),
        }
    }

    fn emit_progress(&self, percent: u8, done: bool, message: String) {
        self.transport.emit(&DfuEvent::Progress {
            percent,
            done,
            message,
        });
    }
}
