// predict.rs — end-of-quarter peak prediction

use tokio::time::interval;

use crate::*;

/// Prediction task period.
pub const PREDICT_PEAK_INTERVAL: Duration = Duration::from_secs(5);

/// Peak prediction method, read once from the stored configuration when the
/// predictor task starts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictMethod {
    #[default]
    LinearRegression = 0,
    WeightedAverage = 1,
}

/// Periodically predict the average-demand peak at the end of the running
/// quarter-hour from the short-term log.
pub async fn run_predictor(state: Arc<Pin<Box<MyState>>>) -> AppResult<()> {
    let method = state.config.read().await.predict_method;
    info!("Peak predictor running ({method:?}).");

    let mut ticker = interval(PREDICT_PEAK_INTERVAL);
    loop {
        // Deadline-based tick: a slow cycle does not delay the next one.
        ticker.tick().await;

        let entries = state.meter.short_term_items().await;
        if entries.len() <= 1 {
            continue;
        }

        let first = alignment_index(&entries);
        let end_of_quarter = quarter_end(entries[first].timestamp);
        let peak = match method {
            PredictMethod::LinearRegression => {
                linear_regression(&entries[first..], end_of_quarter)
            }
            PredictMethod::WeightedAverage => weighted_average(&entries, end_of_quarter),
        };

        debug!("Predicted peak: {:.3} kW at {}", peak.value, peak.timestamp);
        state.meter.set_predicted_peak(peak).await;
    }
}

/// Index of the first entry that starts a quarter-hour (minute 0/15/30/45
/// at second 0, local time). Falls back to the oldest entry when the log
/// does not reach back to a quarter boundary yet.
pub fn alignment_index(entries: &[ShortTermEntry]) -> usize {
    entries
        .iter()
        .position(|e| starts_quarter(e.timestamp))
        .unwrap_or(0)
}

fn starts_quarter(timestamp: i64) -> bool {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt.minute() % 15 == 0 && dt.second() == 0,
        None => false,
    }
}

/// The timestamp at which the quarter-hour containing `timestamp` ends,
/// in local wall-clock terms.
pub fn quarter_end(timestamp: i64) -> i64 {
    let into_quarter = match Local.timestamp_opt(timestamp, 0).single() {
        Some(dt) => i64::from(dt.minute() % 15) * 60 + i64::from(dt.second()),
        None => timestamp.rem_euclid(QUARTER_HOUR_SECS),
    };
    timestamp - into_quarter + QUARTER_HOUR_SECS
}

/// Least-squares fit of current_avg_demand against time, extrapolated to
/// the end of the quarter. A degenerate fit (all samples at one instant)
/// falls back to a flat line through the newest sample.
fn linear_regression(entries: &[ShortTermEntry], end_of_quarter: i64) -> PredictedPeak {
    let Some(last) = entries.last() else {
        return PredictedPeak {
            value: 0.0,
            timestamp: end_of_quarter,
        };
    };

    let t0 = entries[0].timestamp;
    let n = entries.len() as f64;
    let (mut sum_t, mut sum_tt, mut sum_y, mut sum_ty) = (0.0_f64, 0.0_f64, 0.0_f64, 0.0_f64);
    for entry in entries {
        let t = (entry.timestamp - t0) as f64;
        let y = f64::from(entry.current_avg_demand);
        sum_t += t;
        sum_tt += t * t;
        sum_y += y;
        sum_ty += t * y;
    }

    let denominator = sum_tt - sum_t * (sum_t / n);
    let slope = if denominator == 0.0 {
        0.0
    } else {
        (sum_ty - sum_t * (sum_y / n)) / denominator
    };

    let value =
        f64::from(last.current_avg_demand) + slope * (end_of_quarter - last.timestamp) as f64;
    PredictedPeak {
        value: value as f32,
        timestamp: end_of_quarter,
    }
}

/// Weighted average of current_power_usage with the newest samples weighing
/// most, taken as a constant load until the end of the quarter.
fn weighted_average(entries: &[ShortTermEntry], end_of_quarter: i64) -> PredictedPeak {
    let Some(first) = entries.first() else {
        return PredictedPeak {
            value: 0.0,
            timestamp: end_of_quarter,
        };
    };

    let (mut weighted_sum, mut weight_sum) = (0.0_f64, 0.0_f64);
    for entry in entries {
        let weight = (entry.timestamp - first.timestamp + 1) as f64;
        weighted_sum += weight * f64::from(entry.current_power_usage);
        weight_sum += weight;
    }

    PredictedPeak {
        value: (weighted_sum / weight_sum) as f32,
        timestamp: end_of_quarter,
    }
}

// EOF
