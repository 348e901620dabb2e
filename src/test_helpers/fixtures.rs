use serde_json::{json, Map, Value};

/// Deterministic image bytes that include SLIP reserved values.
pub fn firmware_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

/// Builder for test manifest.json contents
pub struct ManifestBuilder {
    entries: Map<String, Value>,
    dfu_version: f64,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self {
            entries: Map::new(),
            dfu_version: 0.5,
        }
    }

    pub fn application(mut self, bin_file: &str, dat_file: &str) -> Self {
        self.entries.insert(
            "application".to_string(),
            json!({
                "bin_file": bin_file,
                "dat_file": dat_file,
                "init_packet_data": {
                    "application_version": 4294967295u32,
                    "device_revision": 65535,
                    "device_type": 82,
                    "firmware_crc16": 18974,
                    "softdevice_req": [182]
                }
            }),
        );
        self
    }

    pub fn softdevice_bootloader(
        mut self,
        bin_file: &str,
        dat_file: &str,
        sd_size: u32,
        bl_size: u32,
    ) -> Self {
        self.entries.insert(
            "softdevice_bootloader".to_string(),
            json!({
                "bin_file": bin_file,
                "dat_file": dat_file,
                "sd_size": sd_size,
                "bl_size": bl_size
            }),
        );
        self
    }

    pub fn build(self) -> String {
        let mut manifest = self.entries;
        manifest.insert("dfu_version".to_string(), json!(self.dfu_version));
        json!({ "manifest": manifest }).to_string()
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}
