// config.rs

use crc::{Crc, CRC_32_ISCSI};
use esp_idf_svc::nvs;

use crate::*;

pub const NVS_BUF_SIZE: usize = 256;

const CONFIG_NAME: &str = "cfg";

/// Whether the device joins an existing network or brings up its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum WifiMode {
    AccessPoint = 0,
    #[default]
    Station = 1,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MyConfig {
    pub wifi_mode: WifiMode,

    pub ap_ssid: String,
    pub ap_pass: String,
    pub ap_channel: u8,

    pub sta_ssid: String,
    pub sta_pass: String,

    pub hostname: String,
    pub mdns_instance: String,

    pub predict_method: PredictMethod,
}

impl Default for MyConfig {
    fn default() -> Self {
        Self {
            wifi_mode: WifiMode::Station,

            ap_ssid: "kwartiwi".into(),
            ap_pass: String::new(),
            ap_channel: 1,

            sta_ssid: option_env!("WIFI_SSID").unwrap_or("internet").into(),
            sta_pass: option_env!("WIFI_PASS").unwrap_or("").into(),

            hostname: "kwartiwi".into(),
            mdns_instance: "Kwartiwi P1 meter".into(),

            predict_method: PredictMethod::default(),
        }
    }
}

impl MyConfig {
    pub fn from_nvs(nvs: &mut nvs::EspNvs<nvs::NvsDefault>) -> Option<Self> {
        let mut nvsbuf = [0u8; NVS_BUF_SIZE];
        info!("Reading up to {sz} bytes from nvs...", sz = NVS_BUF_SIZE);
        let b = match nvs.get_raw(CONFIG_NAME, &mut nvsbuf) {
            Err(e) => {
                error!("Nvs read error {e:?}");
                return None;
            }
            Ok(Some(b)) => b,
            _ => {
                error!("Nvs key not found");
                return None;
            }
        };
        info!("Got {sz} bytes from nvs. Parsing config...", sz = b.len());

        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        match postcard::from_bytes_crc32::<MyConfig>(b, digest) {
            Ok(c) => {
                info!("Successfully parsed config from nvs.");
                Some(c)
            }
            Err(e) => {
                error!("Cannot parse config from nvs: {e:?}");
                None
            }
        }
    }

    pub fn to_nvs(&self, nvs: &mut nvs::EspNvs<nvs::NvsDefault>) -> AppResult<()> {
        let mut nvsbuf = [0u8; NVS_BUF_SIZE];
        let crc = Crc::<u32>::new(&CRC_32_ISCSI);
        let digest = crc.digest();
        let nvsdata = postcard::to_slice_crc32(self, &mut nvsbuf, digest)
            .map_err(|e| AppError::Message(format!("Cannot encode config to buffer {e:?}")))?;
        info!("Encoded config to {sz} bytes. Saving to nvs...", sz = nvsdata.len());

        nvs.set_raw(CONFIG_NAME, nvsdata)
            .map_err(|e| AppError::Message(format!("Cannot save to nvs: {e:?}")))?;
        info!("Config saved.");
        Ok(())
    }
}

// EOF
