// logger.rs — telegram history logging

use crate::*;

/// Wait for each new telegram and append it to the history rings.
pub async fn run_logger(state: Arc<Pin<Box<MyState>>>) -> AppResult<()> {
    let mut telegrams = state.meter.telegram_watch();
    info!("Logger running.");

    loop {
        telegrams
            .changed()
            .await
            .map_err(|e| AppError::Message(format!("telegram signal lost: {e}")))?;

        let (short, long) = {
            let data = state.meter.telegram().await;
            history_entries(&data)
        };
        state.meter.append_short_term(short).await;
        state.meter.append_long_term(long).await;
    }
}

/// Derive both history entries from one telegram. Energy registers go into
/// the long-term log in integral Wh.
pub fn history_entries(data: &P1Data) -> (ShortTermEntry, LongTermEntry) {
    let short = ShortTermEntry {
        timestamp: data.msg_timestamp,
        current_avg_demand: data.current_avg_demand,
        current_power_usage: data.current_power_usage,
    };
    let long = LongTermEntry {
        timestamp: data.msg_timestamp,
        delivered_tariff1_wh: to_wh(data.electricity_delivered_tariff1),
        delivered_tariff2_wh: to_wh(data.electricity_delivered_tariff2),
        returned_tariff1_wh: to_wh(data.electricity_returned_tariff1),
        returned_tariff2_wh: to_wh(data.electricity_returned_tariff2),
    };
    (short, long)
}

fn to_wh(kwh: f32) -> u32 {
    (f64::from(kwh) * 1000.0) as u32
}

// EOF
