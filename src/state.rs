// state.rs

use tokio::sync::RwLock;

use crate::*;

pub struct MyState {
    pub config: RwLock<MyConfig>,
    pub uptime: RwLock<usize>,
    pub api_cnt: RwLock<u64>,
    pub wifi_up: RwLock<bool>,
    pub ip_addr: RwLock<net::Ipv4Addr>,
    pub meter: MeterState,
}

impl MyState {
    pub fn new(config: MyConfig) -> Self {
        MyState {
            config: RwLock::new(config),
            uptime: RwLock::new(0),
            api_cnt: RwLock::new(0),
            wifi_up: RwLock::new(false),
            ip_addr: RwLock::new(net::Ipv4Addr::new(0, 0, 0, 0)),
            meter: MeterState::new(),
        }
    }
}
// EOF
