// wifi.rs — Wi-Fi bring-up (STA with AP fallback) + mDNS advertisement

use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    handle::RawHandle,
    mdns::EspMdns,
    timer::EspTaskTimerService,
    wifi::{
        AccessPointConfiguration, AsyncWifi, AuthMethod, ClientConfiguration, Configuration,
        EspWifi, WifiDriver,
    },
};

use crate::*;

pub const WIFI_AP_MAX_CONN: u16 = 20;
pub const WIFI_STA_CONN_RETRIES: u32 = 5;
/// Service advertised over mDNS for discovery by the companion UI.
pub const MDNS_SERVICE_TYPE: &str = "_kwartiwi-p1";

pub struct WifiLoop {
    pub state: Arc<Pin<Box<MyState>>>,
}

impl WifiLoop {
    /// Bring the network up and keep it up. Station mode falls back to an
    /// access point when the configured network cannot be joined, so the
    /// device always ends up reachable for (re)configuration.
    pub async fn run(
        self,
        driver: WifiDriver<'static>,
        sysloop: EspSystemEventLoop,
        timer: EspTaskTimerService,
    ) -> AppResult<()> {
        let config = self.state.config.read().await.clone();
        let wifi = EspWifi::wrap(driver)?;
        let mut wifi = AsyncWifi::wrap(wifi, sysloop, timer)?;

        let mode = match config.wifi_mode {
            WifiMode::Station => match Box::pin(connect_sta(&mut wifi, &config)).await {
                Ok(()) => WifiMode::Station,
                Err(e) => {
                    error!("STA setup failed ({e}), falling back to AP mode");
                    Box::pin(start_ap(&mut wifi, &config)).await?;
                    WifiMode::AccessPoint
                }
            },
            WifiMode::AccessPoint => {
                Box::pin(start_ap(&mut wifi, &config)).await?;
                WifiMode::AccessPoint
            }
        };

        set_hostname(&wifi, mode, &config.hostname)?;

        let ip_info = match mode {
            WifiMode::Station => wifi.wifi().sta_netif().get_ip_info()?,
            WifiMode::AccessPoint => wifi.wifi().ap_netif().get_ip_info()?,
        };
        info!("Network up, ip {}", ip_info.ip);
        *self.state.ip_addr.write().await = ip_info.ip;
        *self.state.wifi_up.write().await = true;

        // Held for the lifetime of the task; dropping it would withdraw
        // the advertisement.
        let _mdns = init_mdns(&config)?;

        loop {
            sleep(Duration::from_secs(10)).await;

            if mode == WifiMode::Station && !wifi.wifi().is_connected().unwrap_or(false) {
                warn!("Wi-Fi connection lost, reconnecting");
                *self.state.wifi_up.write().await = false;
                if let Err(e) = Box::pin(connect_sta(&mut wifi, &config)).await {
                    error!("Reconnect failed: {e}");
                    continue;
                }
                *self.state.wifi_up.write().await = true;
            }
        }
    }
}

async fn connect_sta(wifi: &mut AsyncWifi<EspWifi<'static>>, config: &MyConfig) -> AppResult<()> {
    info!("Setting up Wi-Fi in STA mode");
    let auth_method = if config.sta_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let client_config = ClientConfiguration {
        ssid: config
            .sta_ssid
            .as_str()
            .try_into()
            .map_err(|_| AppError::Message("STA SSID too long".into()))?,
        password: config
            .sta_pass
            .as_str()
            .try_into()
            .map_err(|_| AppError::Message("STA password too long".into()))?,
        auth_method,
        ..Default::default()
    };
    wifi.set_configuration(&Configuration::Client(client_config))?;
    wifi.start().await?;

    let mut attempt = 0;
    loop {
        attempt += 1;
        match wifi.connect().await {
            Ok(()) => break,
            Err(e) if attempt < WIFI_STA_CONN_RETRIES => {
                warn!("Wi-Fi connect attempt {attempt}/{WIFI_STA_CONN_RETRIES} failed: {e}");
            }
            Err(e) => {
                wifi.stop().await?;
                return Err(AppError::Message(format!(
                    "could not join {}: {e}",
                    config.sta_ssid
                )));
            }
        }
    }
    wifi.wait_netif_up().await?;
    info!("Connected to SSID {}", config.sta_ssid);
    Ok(())
}

async fn start_ap(wifi: &mut AsyncWifi<EspWifi<'static>>, config: &MyConfig) -> AppResult<()> {
    info!("Setting up Wi-Fi in AP mode");
    // Channel 0 means "pick one"; out-of-range values get the same
    // treatment. An empty password makes the network open.
    let channel = if config.ap_channel == 0 || config.ap_channel > 13 {
        1
    } else {
        config.ap_channel
    };
    let auth_method = if config.ap_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    let ap_config = AccessPointConfiguration {
        ssid: config
            .ap_ssid
            .as_str()
            .try_into()
            .map_err(|_| AppError::Message("AP SSID too long".into()))?,
        password: config
            .ap_pass
            .as_str()
            .try_into()
            .map_err(|_| AppError::Message("AP password too long".into()))?,
        channel,
        auth_method,
        max_connections: WIFI_AP_MAX_CONN,
        ..Default::default()
    };
    wifi.set_configuration(&Configuration::AccessPoint(ap_config))?;
    wifi.start().await?;
    wifi.wait_netif_up().await?;
    info!("Wi-Fi AP started, ssid {} channel {channel}", config.ap_ssid);
    Ok(())
}

fn set_hostname(
    wifi: &AsyncWifi<EspWifi<'static>>,
    mode: WifiMode,
    hostname: &str,
) -> AppResult<()> {
    let netif = match mode {
        WifiMode::Station => wifi.wifi().sta_netif(),
        WifiMode::AccessPoint => wifi.wifi().ap_netif(),
    };
    let name = std::ffi::CString::new(hostname)
        .map_err(|_| AppError::Message("invalid hostname".into()))?;
    esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_netif_set_hostname(netif.handle(), name.as_ptr()) })?;
    Ok(())
}

fn init_mdns(config: &MyConfig) -> AppResult<EspMdns> {
    info!("Initializing mDNS");
    let mut mdns = EspMdns::take()?;
    mdns.set_hostname(&config.hostname)?;
    mdns.set_instance_name(&config.mdns_instance)?;
    mdns.add_service(None, MDNS_SERVICE_TYPE, "_tcp", WEB_SERVER_PORT, &[])?;
    Ok(mdns)
}
// EOF
