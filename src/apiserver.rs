// apiserver.rs — local HTTP/JSON API + static frontend serving

use serde_json::{json, Value};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::*;

pub const WEB_SERVER_PORT: u16 = 80;
pub const WEB_SERVER_API_VERSION: &str = "1.0.0";
/// Frontend bundle mount point in the VFS.
pub const WEB_SERVER_FS_MOUNT_POINT: &str = "/www";

/// Upper bound on acquiring a shared telemetry lock inside a handler; a
/// request that cannot get its data in time turns into a 500.
const LOCK_TIMEOUT: Duration = Duration::from_millis(1000);
/// Time allowed for a client to deliver its request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REQUEST_SIZE: usize = 2048;
const FILE_CHUNK_SIZE: usize = 1024;

pub async fn run_api_server(state: Arc<Pin<Box<MyState>>>) -> AppResult<()> {
    loop {
        if *state.wifi_up.read().await {
            break;
        }
        sleep(Duration::from_secs(1)).await;
    }

    let listen = format!("0.0.0.0:{WEB_SERVER_PORT}");
    let addr = listen.parse::<net::SocketAddr>()?;
    let listener = TcpListener::bind(addr).await?;
    info!("Web server listening on {listen}");

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("http client connected: {peer}");
        let state2 = state.clone();
        tokio::spawn(async move {
            if let Err(e) = Box::pin(handle_client(state2, stream)).await {
                warn!("http client error: {e}");
            }
        });
    }
}

async fn handle_client(state: Arc<Pin<Box<MyState>>>, mut stream: TcpStream) -> AppResult<()> {
    let request = match Box::pin(timeout(REQUEST_TIMEOUT, read_request(&mut stream))).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            if is_closed_connection(&e) {
                return Ok(());
            }
            return Err(e.into());
        }
        Err(_) => {
            warn!("http client request timeout");
            return Ok(());
        }
    };

    let Some((method, path)) = parse_request_line(&request) else {
        return send_error(&mut stream, 400, "Bad request").await;
    };

    *state.api_cnt.write().await += 1;
    info!("http {method} {path}");

    if method != "GET" {
        return send_error(&mut stream, 405, "Method not allowed").await;
    }

    match path {
        "/api/version" => {
            let json_data = json!({ "version": WEB_SERVER_API_VERSION });
            send_json(&mut stream, 200, &json_data).await
        }
        "/api/system/info" => {
            let json_data = json!({ "version": FW_VERSION, "cores": chip_cores() });
            send_json(&mut stream, 200, &json_data).await
        }
        "/api/p1/data/basic" => send_p1_data(&state, &mut stream, false).await,
        "/api/p1/data/complete" => send_p1_data(&state, &mut stream, true).await,
        "/api/meter-data" => send_meter_data(&state, &mut stream).await,
        "/api/meter-data-history" => send_meter_data_history(&state, &mut stream).await,
        _ => send_file(&mut stream, path).await,
    }
}

/// Read the request head (request line + headers). Anything past the head
/// is ignored; the API is GET-only.
async fn read_request(stream: &mut TcpStream) -> io::Result<String> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "client closed"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > MAX_REQUEST_SIZE {
            break;
        }
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn parse_request_line(request: &str) -> Option<(&str, &str)> {
    let line = request.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    // The query string, if any, is irrelevant to every route.
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}

fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        500 => "Internal Server Error",
        _ => "",
    }
}

async fn send_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> AppResult<()> {
    let header = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status_reason(status),
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.shutdown().await?;
    Ok(())
}

async fn send_json(stream: &mut TcpStream, status: u16, json_data: &Value) -> AppResult<()> {
    let body = match serde_json::to_string_pretty(json_data) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize response: {e}");
            return send_error(stream, 500, "Failed to serialize response").await;
        }
    };
    send_response(stream, status, "application/json", body.as_bytes()).await
}

async fn send_error(stream: &mut TcpStream, status: u16, msg: &str) -> AppResult<()> {
    send_response(stream, status, "text/plain", msg.as_bytes()).await
}

async fn send_p1_data(
    state: &Arc<Pin<Box<MyState>>>,
    stream: &mut TcpStream,
    complete: bool,
) -> AppResult<()> {
    let json_data = match timeout(LOCK_TIMEOUT, state.meter.telegram()).await {
        Ok(data) => p1_data_json(&data, complete),
        Err(_) => {
            error!("Failed to get P1 data lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get P1 data").await;
        }
    };
    send_json(stream, 200, &json_data).await
}

/// Basic snapshot plus the monthly peak register and the live peak
/// prediction. Locks are taken one at a time, snapshot first.
async fn send_meter_data(state: &Arc<Pin<Box<MyState>>>, stream: &mut TcpStream) -> AppResult<()> {
    let mut json_data = match timeout(LOCK_TIMEOUT, state.meter.telegram()).await {
        Ok(data) => {
            let mut json_data = p1_data_json(&data, false);
            json_data["maxDemandMonth"] = max_demand_json(&data.max_demand_month);
            json_data
        }
        Err(_) => {
            error!("Failed to get P1 data lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get P1 data").await;
        }
    };

    match timeout(LOCK_TIMEOUT, state.meter.predicted_peak()).await {
        Ok(peak) => {
            json_data["predictedPeak"] = json!(peak.value);
            json_data["predictedPeakTime"] = json!(peak.timestamp as f64);
        }
        Err(_) => {
            error!("Failed to get peak prediction lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get peak prediction").await;
        }
    }

    send_json(stream, 200, &json_data).await
}

async fn send_meter_data_history(
    state: &Arc<Pin<Box<MyState>>>,
    stream: &mut TcpStream,
) -> AppResult<()> {
    let max_demand_year = match timeout(LOCK_TIMEOUT, state.meter.telegram()).await {
        Ok(data) => data
            .max_demand_year
            .iter()
            .map(max_demand_json)
            .collect::<Vec<_>>(),
        Err(_) => {
            error!("Failed to get P1 data lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get P1 data").await;
        }
    };

    let short_term = match timeout(LOCK_TIMEOUT, state.meter.short_term_items()).await {
        Ok(items) => short_term_history_json(&items),
        Err(_) => {
            error!("Failed to get short-term log lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get history").await;
        }
    };

    let long_term = match timeout(LOCK_TIMEOUT, state.meter.long_term_items()).await {
        Ok(items) => long_term_history_json(&items),
        Err(_) => {
            error!("Failed to get long-term log lock within {LOCK_TIMEOUT:?}");
            return send_error(stream, 500, "Failed to get history").await;
        }
    };

    let json_data = json!({
        "maxDemandYear": max_demand_year,
        "shortTermHistory": short_term,
        "longTermHistory": long_term,
    });
    send_json(stream, 200, &json_data).await
}

/// Serialize the current telegram. The basic subset carries the fields a
/// dashboard polls every second; `complete` adds the rest of the record.
fn p1_data_json(data: &P1Data, complete: bool) -> Value {
    let mut json_data = json!({
        "timestamp": data.msg_timestamp as f64,
        "electricityDeliveredTariff1": data.electricity_delivered_tariff1,
        "electricityDeliveredTariff2": data.electricity_delivered_tariff2,
        "electricityReturnedTariff1": data.electricity_returned_tariff1,
        "electricityReturnedTariff2": data.electricity_returned_tariff2,
        "currentAvgDemand": data.current_avg_demand,
        "currentPowerUsage": data.current_power_usage,
        "currentPowerReturn": data.current_power_return,
    });

    if complete {
        let extra = json!({
            "versionInfo": data.version_info,
            "equipmentId": data.equipment_id,
            "electricityTariff": data.tariff_indicator,
            "maxDemandMonth": max_demand_json(&data.max_demand_month),
            "maxDemandYear": data.max_demand_year.iter().map(max_demand_json).collect::<Vec<_>>(),
            "currentPowerUsageL1": data.current_power_usage_l1,
            "currentPowerUsageL2": data.current_power_usage_l2,
            "currentPowerUsageL3": data.current_power_usage_l3,
            "currentPowerReturnL1": data.current_power_return_l1,
            "currentPowerReturnL2": data.current_power_return_l2,
            "currentPowerReturnL3": data.current_power_return_l3,
            "voltageL1": data.voltage_l1,
            "voltageL2": data.voltage_l2,
            "voltageL3": data.voltage_l3,
            "currentL1": data.current_l1,
            "currentL2": data.current_l2,
            "currentL3": data.current_l3,
            "breakerState": data.breaker_state.as_str(),
            "limiterThreshold": data.limiter_threshold,
            "fuseSupervisionThreshold": data.fuse_supervision_threshold,
        });
        if let (Value::Object(base), Value::Object(more)) = (&mut json_data, extra) {
            base.extend(more);
        }
    }

    json_data
}

fn max_demand_json(entry: &MaxDemand) -> Value {
    json!({
        "timestamp": entry.timestamp as f64,
        "demand": entry.demand,
    })
}

/// The short-term history starts at the running quarter-hour, the same
/// window the predictor fits against.
fn short_term_history_json(entries: &[ShortTermEntry]) -> Vec<Value> {
    let first = alignment_index(entries);
    entries[first..]
        .iter()
        .map(|e| {
            json!({
                "timestamp": e.timestamp as f64,
                "currentAvgDemand": e.current_avg_demand,
                "currentPowerUsage": e.current_power_usage,
            })
        })
        .collect()
}

fn long_term_history_json(entries: &[LongTermEntry]) -> Vec<Value> {
    entries
        .iter()
        .map(|e| {
            json!({
                "timestamp": e.timestamp as f64,
                "electricityDeliveredTariff1": e.delivered_tariff1_wh,
                "electricityDeliveredTariff2": e.delivered_tariff2_wh,
                "electricityReturnedTariff1": e.returned_tariff1_wh,
                "electricityReturnedTariff2": e.returned_tariff2_wh,
            })
        })
        .collect()
}

/// Serve a file from the frontend bundle. Reads are byte-mode so binary
/// assets (images, favicon) survive intact.
async fn send_file(stream: &mut TcpStream, path: &str) -> AppResult<()> {
    if !path.starts_with('/') || path.contains("..") {
        return send_error(stream, 404, "File not found").await;
    }

    let filepath = if path.ends_with('/') {
        format!("{WEB_SERVER_FS_MOUNT_POINT}{path}index.html")
    } else {
        format!("{WEB_SERVER_FS_MOUNT_POINT}{path}")
    };

    let mut file = match std::fs::File::open(&filepath) {
        Ok(file) => file,
        Err(_) => {
            warn!("Failed to open file: {filepath}");
            return send_error(stream, 404, "File not found").await;
        }
    };

    let ext = filepath.rsplit('.').next().unwrap_or_default();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nConnection: close\r\n\r\n",
        content_type_for(ext)
    );
    stream.write_all(header.as_bytes()).await?;

    let mut buf = [0u8; FILE_CHUNK_SIZE];
    loop {
        let n = std::io::Read::read(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        stream.write_all(&buf[..n]).await?;
    }
    stream.shutdown().await?;
    Ok(())
}

/// Content type by file extension; anything unrecognized goes out as plain
/// text.
fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "html" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "png" => "image/png",
        "jpg" => "image/jpeg",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "json" => "application/json",
        "csv" => "text/csv",
        _ => "text/plain",
    }
}

fn chip_cores() -> u32 {
    let mut chip_info = esp_idf_sys::esp_chip_info_t::default();
    unsafe { esp_idf_sys::esp_chip_info(&mut chip_info) };
    u32::from(chip_info.cores)
}

fn is_closed_connection(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_line_parsing_strips_the_query() {
        let request = "GET /api/meter-data?poll=1 HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(parse_request_line(request), Some(("GET", "/api/meter-data")));
        assert_eq!(parse_request_line("POST / HTTP/1.1\r\n\r\n"), Some(("POST", "/")));
        assert_eq!(parse_request_line(""), None);
        assert_eq!(parse_request_line("GET"), None);
    }

    #[test]
    fn content_types_cover_the_frontend_bundle() {
        assert_eq!(content_type_for("html"), "text/html");
        assert_eq!(content_type_for("svg"), "image/svg+xml");
        assert_eq!(content_type_for("csv"), "text/csv");
        assert_eq!(content_type_for("wasm"), "text/plain");
    }

    #[test]
    fn basic_json_carries_only_the_dashboard_fields() {
        let data = P1Data {
            msg_timestamp: 1700000000,
            current_power_usage: 0.532,
            ..Default::default()
        };
        let json_data = p1_data_json(&data, false);
        let obj = json_data.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        assert_eq!(json_data["timestamp"], json!(1700000000.0));
        assert!((json_data["currentPowerUsage"].as_f64().unwrap() - 0.532).abs() < 1e-6);
        assert!(obj.get("breakerState").is_none());
    }

    #[test]
    fn complete_json_adds_the_full_record() {
        let data = P1Data {
            breaker_state: BreakerState::ReadyForConnection,
            max_demand_year: vec![MaxDemand {
                timestamp: 900,
                demand: 2.5,
            }],
            ..Default::default()
        };
        let json_data = p1_data_json(&data, true);
        assert_eq!(json_data["breakerState"], json!("readyForConnection"));
        assert_eq!(json_data["maxDemandYear"][0]["demand"], json!(2.5));
        assert_eq!(json_data["maxDemandMonth"]["timestamp"], json!(0.0));
    }

    #[test]
    fn empty_histories_serialize_to_empty_arrays() {
        assert!(short_term_history_json(&[]).is_empty());
        assert!(long_term_history_json(&[]).is_empty());
    }

    #[test]
    fn short_term_history_is_trimmed_to_the_running_quarter() {
        let entry = |timestamp| ShortTermEntry {
            timestamp,
            current_avg_demand: 1.0,
            current_power_usage: 1.0,
        };
        // 899 is mid-quarter, 900 starts one: only the tail is reported.
        let history = short_term_history_json(&[entry(898), entry(899), entry(900), entry(901)]);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0]["timestamp"], json!(900.0));
    }
}
// EOF
