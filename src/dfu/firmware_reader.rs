//! Firmware package reader for Nordic legacy DFU.
//!
//! Reads a firmware.zip package containing:
//! - manifest.json - Package metadata listing one or more images
//! - `*.bin` - Image binaries
//! - `*.dat` - Init packets
//!
//! Images are returned in flashing order: combined SoftDevice and
//! bootloader, SoftDevice, bootloader, then application.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::error::{DfuError, DfuResult};
use super::packet::DfuMode;

/// One image to flash, with the sizes the Start packet announces.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub mode: DfuMode,
    /// Init packet data (`.dat` contents).
    pub init_data: Vec<u8>,
    /// Image binary (`.bin` contents).
    pub firmware_data: Vec<u8>,
    pub softdevice_size: u32,
    pub bootloader_size: u32,
    pub application_size: u32,
    /// Name of the binary inside the package.
    pub bin_file: String,
}

impl FirmwareImage {
    /// Sum of all announced component sizes.
    pub fn total_size(&self) -> u32 {
        self.softdevice_size + self.bootloader_size + self.application_size
    }
}

/// Contents of a DFU firmware package.
#[derive(Debug)]
pub struct FirmwarePackage {
    pub images: Vec<FirmwareImage>,
    pub manifest: ManifestData,
    /// Lowercase hex SHA-256 of the package file.
    pub sha256: String,
}

impl FirmwarePackage {
    /// Compare the package digest against an expected hex string.
    pub fn verify_digest(&self, expected: &str) -> DfuResult<()> {
        if self.sha256.eq_ignore_ascii_case(expected.trim()) {
            Ok(())
        } else {
            Err(DfuError::DigestMismatch {
                expected: expected.trim().to_lowercase(),
                actual: self.sha256.clone(),
            })
        }
    }
}

/// Parsed manifest.json data.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestData {
    /// DFU version from manifest.
    pub dfu_version: Option<f32>,
    /// Device type identifier of the application image, if present.
    pub device_type: Option<u16>,
    /// CRC16 of the application image, if present.
    pub firmware_crc16: Option<u16>,
}

/// Raw manifest.json structure for deserialization.
#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: ManifestInner,
}

#[derive(Debug, Deserialize)]
struct ManifestInner {
    #[serde(default)]
    application: Option<ImageManifest>,
    #[serde(default)]
    softdevice: Option<ImageManifest>,
    #[serde(default)]
    bootloader: Option<ImageManifest>,
    #[serde(default)]
    softdevice_bootloader: Option<ImageManifest>,
    #[serde(default)]
    dfu_version: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ImageManifest {
    bin_file: String,
    dat_file: String,
    #[serde(default)]
    init_packet_data: Option<InitPacketData>,
    #[serde(default)]
    sd_size: Option<u32>,
    #[serde(default)]
    bl_size: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InitPacketData {
    device_type: Option<u16>,
    firmware_crc16: Option<u16>,
}

/// Read and parse a firmware.zip package.
pub fn read_firmware_zip<P: AsRef<Path>>(path: P) -> DfuResult<FirmwarePackage> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;

    let sha256 = sha256_hex(&bytes);
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

    let raw = read_manifest(&mut archive)?;
    let inner = raw.manifest;

    let manifest = ManifestData {
        dfu_version: inner.dfu_version,
        device_type: inner
            .application
            .as_ref()
            .and_then(|app| app.init_packet_data.as_ref())
            .and_then(|data| data.device_type),
        firmware_crc16: inner
            .application
            .as_ref()
            .and_then(|app| app.init_packet_data.as_ref())
            .and_then(|data| data.firmware_crc16),
    };

    let ordered = [
        (DfuMode::SoftDeviceBootloader, inner.softdevice_bootloader),
        (DfuMode::SoftDevice, inner.softdevice),
        (DfuMode::Bootloader, inner.bootloader),
        (DfuMode::Application, inner.application),
    ];

    let mut images = Vec::new();
    for (mode, entry) in ordered {
        if let Some(entry) = entry {
            images.push(read_image(&mut archive, mode, entry)?);
        }
    }

    if images.is_empty() {
        return Err(DfuError::InvalidManifest {
            reason: "manifest lists no firmware images".to_string(),
        });
    }

    Ok(FirmwarePackage {
        images,
        manifest,
        sha256,
    })
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{:x}", hash)
}

type Archive = zip::ZipArchive<Cursor<Vec<u8>>>;

/// Read and parse the manifest.json from the archive.
fn read_manifest(archive: &mut Archive) -> DfuResult<RawManifest> {
    let mut manifest_file = archive
        .by_name("manifest.json")
        .map_err(|_| DfuError::MissingFile {
            filename: "manifest.json".to_string(),
        })?;

    let mut contents = String::new();
    manifest_file.read_to_string(&mut contents)?;

    Ok(serde_json::from_str(&contents)?)
}

fn read_image(archive: &mut Archive, mode: DfuMode, entry: ImageManifest) -> DfuResult<FirmwareImage> {
    let init_data = read_file_from_zip(archive, &entry.dat_file)?;
    let firmware_data = read_file_from_zip(archive, &entry.bin_file)?;

    let len = u32::try_from(firmware_data.len()).map_err(|_| DfuError::InvalidManifest {
        reason: format!("{} is too large", entry.bin_file),
    })?;

    let (softdevice_size, bootloader_size, application_size) = match mode {
        DfuMode::Application => (0, 0, len),
        DfuMode::SoftDevice => (len, 0, 0),
        DfuMode::Bootloader => (0, len, 0),
        DfuMode::SoftDeviceBootloader => {
            let (sd, bl) = entry.sd_size.zip(entry.bl_size).ok_or_else(|| {
                DfuError::InvalidManifest {
                    reason: "softdevice_bootloader entry needs sd_size and bl_size".to_string(),
                }
            })?;
            if u64::from(sd) + u64::from(bl) != u64::from(len) {
                return Err(DfuError::InvalidManifest {
                    reason: format!(
                        "sd_size ({}) + bl_size ({}) does not match {} ({} bytes)",
                        sd, bl, entry.bin_file, len
                    ),
                });
            }
            (sd, bl, 0)
        }
    };

    Ok(FirmwareImage {
        mode,
        init_data,
        firmware_data,
        softdevice_size,
        bootloader_size,
        application_size,
        bin_file: entry.bin_file,
    })
}

/// Read a file from the zip archive by name.
fn read_file_from_zip(archive: &mut Archive, name: &str) -> DfuResult<Vec<u8>> {
    let mut file = archive.by_name(name).map_err(|_| DfuError::MissingFile {
        filename: name.to_string(),
    })?;

    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::fixtures::{firmware_image, ManifestBuilder};
    use crate::test_helpers::TestContext;

    #[test]
    fn test_read_application_package() {
        let ctx = TestContext::new();
        let manifest = ManifestBuilder::new()
            .application("firmware.bin", "firmware.dat")
            .build();
        let zip_path = ctx.create_package(
            "firmware.zip",
            Some(&manifest),
            &[
                ("firmware.bin", &[0x01, 0x02, 0x03, 0x04]),
                ("firmware.dat", &[0x0A, 0x0B, 0x0C]),
            ],
        );

        let package = read_firmware_zip(&zip_path).unwrap();

        assert_eq!(package.images.len(), 1);
        let image = &package.images[0];
        assert_eq!(image.mode, DfuMode::Application);
        assert_eq!(image.firmware_data, vec![0x01, 0x02, 0x03, 0x04]);
        assert_eq!(image.init_data, vec![0x0A, 0x0B, 0x0C]);
        assert_eq!((image.softdevice_size, image.bootloader_size, image.application_size), (0, 0, 4));
        assert_eq!(package.manifest.device_type, Some(82));
        assert_eq!(package.manifest.firmware_crc16, Some(18974));
        assert_eq!(package.manifest.dfu_version, Some(0.5));
    }

    #[test]
    fn test_images_come_in_flashing_order() {
        let ctx = TestContext::new();
        let sd_bl = firmware_image(300);
        let manifest = ManifestBuilder::new()
            .application("app.bin", "app.dat")
            .softdevice_bootloader("sd_bl.bin", "sd_bl.dat", 200, 100)
            .build();
        let zip_path = ctx.create_package(
            "combined.zip",
            Some(&manifest),
            &[
                ("app.bin", &firmware_image(64)),
                ("app.dat", &[0x01]),
                ("sd_bl.bin", &sd_bl),
                ("sd_bl.dat", &[0x02]),
            ],
        );

        let package = read_firmware_zip(&zip_path).unwrap();

        let modes: Vec<DfuMode> = package.images.iter().map(|image| image.mode).collect();
        assert_eq!(modes, vec![DfuMode::SoftDeviceBootloader, DfuMode::Application]);
        assert_eq!(package.images[0].softdevice_size, 200);
        assert_eq!(package.images[0].bootloader_size, 100);
        assert_eq!(package.images[0].total_size(), 300);
        assert_eq!(package.images[1].application_size, 64);
    }

    #[test]
    fn test_softdevice_bootloader_sizes_must_add_up() {
        let ctx = TestContext::new();
        let manifest = ManifestBuilder::new()
            .softdevice_bootloader("sd_bl.bin", "sd_bl.dat", 200, 50)
            .build();
        let zip_path = ctx.create_package(
            "bad.zip",
            Some(&manifest),
            &[("sd_bl.bin", &firmware_image(300)), ("sd_bl.dat", &[0x02])],
        );

        let result = read_firmware_zip(&zip_path);

        assert!(matches!(result, Err(DfuError::InvalidManifest { .. })));
    }

    #[test]
    fn test_manifest_without_images_is_rejected() {
        let ctx = TestContext::new();
        let zip_path = ctx.create_package(
            "empty.zip",
            Some(r#"{ "manifest": { "dfu_version": 0.5 } }"#),
            &[],
        );

        let result = read_firmware_zip(&zip_path);

        assert!(matches!(
            result,
            Err(DfuError::InvalidManifest { reason }) if reason.contains("no firmware images")
        ));
    }

    #[test]
    fn test_read_missing_manifest() {
        let ctx = TestContext::new();
        let zip_path = ctx.create_package("firmware.zip", None, &[("firmware.bin", &[0x01])]);

        let result = read_firmware_zip(&zip_path);

        assert!(matches!(
            result,
            Err(DfuError::MissingFile { filename }) if filename == "manifest.json"
        ));
    }

    #[test]
    fn test_read_missing_firmware_bin() {
        let ctx = TestContext::new();
        let manifest = ManifestBuilder::new()
            .application("firmware.bin", "firmware.dat")
            .build();
        let zip_path = ctx.create_package(
            "firmware.zip",
            Some(&manifest),
            &[("firmware.dat", &[0x0A])],
        );

        let result = read_firmware_zip(&zip_path);

        assert!(matches!(
            result,
            Err(DfuError::MissingFile { filename }) if filename == "firmware.bin"
        ));
    }

    #[test]
    fn test_read_invalid_manifest_json() {
        let ctx = TestContext::new();
        let zip_path = ctx.create_package("firmware.zip", Some("{ invalid json }"), &[]);

        let result = read_firmware_zip(&zip_path);

        assert!(matches!(result, Err(DfuError::Json(_))));
    }

    #[test]
    fn test_nonexistent_file() {
        let result = read_firmware_zip("/nonexistent/path/firmware.zip");

        assert!(matches!(result, Err(DfuError::Io(_))));
    }

    #[test]
    fn test_digest_matches_file_bytes() {
        let ctx = TestContext::new();
        let manifest = ManifestBuilder::new()
            .application("firmware.bin", "firmware.dat")
            .build();
        let zip_path = ctx.create_package(
            "firmware.zip",
            Some(&manifest),
            &[("firmware.bin", &[0x01]), ("firmware.dat", &[0x02])],
        );

        let package = read_firmware_zip(&zip_path).unwrap();
        let expected = sha256_hex(&std::fs::read(&zip_path).unwrap());

        assert_eq!(package.sha256, expected);
        assert!(package.verify_digest(&expected.to_uppercase()).is_ok());
        assert!(matches!(
            package.verify_digest("00ff"),
            Err(DfuError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_sha256_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
