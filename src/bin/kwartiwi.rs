// bin/kwartiwi.rs

#![warn(clippy::large_futures)]

use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs, timer::EspTaskTimerService, wifi::WifiDriver};
use esp_idf_sys::esp;
use kwartiwi::*;

fn main() -> anyhow::Result<()> {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    #[allow(clippy::needless_update)]
    let config = esp_idf_sys::esp_vfs_eventfd_config_t {
        max_fds: 1,
        ..Default::default()
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_eventfd_register(&config) } }?;

    info!("Hello.");
    info!("Starting up.");

    let sysloop = EspSystemEventLoop::take()?;
    let timer = EspTaskTimerService::new()?;
    let nvs_default_partition = nvs::EspDefaultNvsPartition::take()?;

    let ns = env!("CARGO_BIN_NAME");
    let mut nvs = match nvs::EspNvs::new(nvs_default_partition.clone(), ns, true) {
        Ok(nvs) => {
            info!("Got namespace {ns:?} from default partition");
            nvs
        }
        Err(e) => panic!("Could not get namespace {ns}: {e:?}"),
    };

    let config = match MyConfig::from_nvs(&mut nvs) {
        None => {
            error!("Could not read nvs config, using defaults");
            let c = MyConfig::default();
            c.to_nvs(&mut nvs)?;
            info!("Successfully saved default config to nvs.");
            c
        }
        Some(c) => c,
    };
    info!("My config:\n{config:#?}");

    mount_frontend_fs()?;

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    // P1 port: RX only on GPIO5, 115200 8N1, inverted line polarity.
    let uart_config = uart::config::Config::new().baudrate(Hertz(115_200));
    let p1_port = uart::UartRxDriver::new(
        peripherals.uart1,
        pins.gpio5,
        None::<esp_idf_hal::gpio::AnyIOPin>,
        None::<esp_idf_hal::gpio::AnyIOPin>,
        &uart_config,
    )?;
    esp! { unsafe {
        esp_idf_sys::uart_set_line_inverse(
            esp_idf_sys::uart_port_t_UART_NUM_1,
            esp_idf_sys::uart_signal_inv_t_UART_SIGNAL_RXD_INV,
        )
    } }?;

    let wifidriver = WifiDriver::new(peripherals.modem, sysloop.clone(), Some(nvs_default_partition))?;

    let state = Box::pin(MyState::new(config));
    let shared_state = Arc::new(state);

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(Box::pin(async move {
            let wifi_loop = WifiLoop {
                state: shared_state.clone(),
            };

            info!("Entering main loop...");
            tokio::select! {
                _ = Box::pin(poll_uptime(shared_state.clone())) => { error!("poll_uptime() ended."); }
                _ = Box::pin(read_p1(shared_state.clone(), p1_port)) => { error!("read_p1() ended."); }
                _ = Box::pin(run_logger(shared_state.clone())) => { error!("run_logger() ended."); }
                _ = Box::pin(run_predictor(shared_state.clone())) => { error!("run_predictor() ended."); }
                _ = Box::pin(run_api_server(shared_state.clone())) => { error!("run_api_server() ended."); }
                _ = Box::pin(wifi_loop.run(wifidriver, sysloop, timer)) => { error!("wifi_loop.run() ended."); }
            };
        }));

    info!("main() finished, reboot.");
    FreeRtos::delay_ms(3000);
    esp_idf_hal::reset::restart();
}

/// Mount the SPIFFS partition carrying the web UI bundle.
fn mount_frontend_fs() -> anyhow::Result<()> {
    let base_path = std::ffi::CString::new(WEB_SERVER_FS_MOUNT_POINT)?;
    let partition_label = std::ffi::CString::new("www")?;
    let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
        base_path: base_path.as_ptr(),
        partition_label: partition_label.as_ptr(),
        max_files: 5,
        format_if_mount_failed: false,
    };
    esp! { unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) } }?;
    info!("Mounted frontend filesystem at {WEB_SERVER_FS_MOUNT_POINT}");
    Ok(())
}

async fn poll_uptime(state: Arc<Pin<Box<MyState>>>) -> AppResult<()> {
    let mut uptime: usize = 0;
    loop {
        sleep(Duration::from_secs(2)).await;

        uptime += 2;
        *(state.uptime.write().await) = uptime;

        if uptime % 300 == 0 {
            let api_cnt = *state.api_cnt.read().await;
            let ip = *state.ip_addr.read().await;
            info!("Up {uptime}s, ip {ip}, {api_cnt} api requests served");
        }
    }
}
// EOF
