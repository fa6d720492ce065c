// telegram.rs — DSMR-5.0 P1 telegram parsing

use crc::{Crc, CRC_16_ARC};

use crate::*;

/// CRC-16 as used on the P1 port: polynomial 0xA001 (reflected 0x8005),
/// init 0, no final xor, LSB first.
pub const P1_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// The monthly-peak history holds at most a 13 month sliding window.
pub const MAX_DEMAND_YEAR_ENTRIES: usize = 13;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BreakerState {
    #[default]
    Disconnected,
    Connected,
    ReadyForConnection,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Disconnected => "disconnected",
            BreakerState::Connected => "connected",
            BreakerState::ReadyForConnection => "readyForConnection",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MaxDemand {
    pub timestamp: i64,
    pub demand: f32,
}

/// One parsed P1 telegram. Units follow the wire: kWh for the tariff
/// registers, kW for power and demand, V and A for the phase readings.
/// Fields a telegram does not carry stay at their zero default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct P1Data {
    pub version_info: String,
    pub equipment_id: String,
    pub msg_timestamp: i64,
    pub electricity_delivered_tariff1: f32,
    pub electricity_delivered_tariff2: f32,
    pub electricity_returned_tariff1: f32,
    pub electricity_returned_tariff2: f32,
    pub tariff_indicator: u16,
    pub current_avg_demand: f32,
    pub max_demand_month: MaxDemand,
    pub max_demand_year: Vec<MaxDemand>,
    pub current_power_usage: f32,
    pub current_power_return: f32,
    pub current_power_usage_l1: f32,
    pub current_power_usage_l2: f32,
    pub current_power_usage_l3: f32,
    pub current_power_return_l1: f32,
    pub current_power_return_l2: f32,
    pub current_power_return_l3: f32,
    pub voltage_l1: f32,
    pub voltage_l2: f32,
    pub voltage_l3: f32,
    pub current_l1: f32,
    pub current_l2: f32,
    pub current_l3: f32,
    pub breaker_state: BreakerState,
    pub limiter_threshold: f32,
    pub fuse_supervision_threshold: f32,
}

/// Parse one assembled telegram (CRC trailer and closing `\r\n` included).
///
/// Returns `None` when the CRC does not match or the frame is malformed;
/// the caller keeps the previous snapshot in that case. Individual field
/// conversion failures only cost that field its value.
pub fn parse_telegram(frame: &[u8]) -> Option<P1Data> {
    if frame.len() < TELEGRAM_TRAILER_LEN + 2 || frame[0] != b'/' {
        warn!("P1: malformed frame ({} bytes)", frame.len());
        return None;
    }

    let body_len = frame.len() - TELEGRAM_TRAILER_LEN;
    let crc_read = &frame[body_len..body_len + 4];
    let crc_calc = format!("{:04X}", P1_CRC.checksum(&frame[..body_len]));
    if crc_calc.as_bytes() != crc_read {
        warn!(
            "P1: CRC mismatch (read={} calc={crc_calc})",
            String::from_utf8_lossy(crc_read)
        );
        return None;
    }

    let body = match std::str::from_utf8(&frame[..body_len]) {
        Ok(body) => body,
        Err(e) => {
            warn!("P1: telegram is not valid ASCII: {e}");
            return None;
        }
    };

    let mut data = P1Data::default();
    for line in body.split("\r\n") {
        parse_line(line, &mut data);
    }
    Some(data)
}

fn parse_line(line: &str, data: &mut P1Data) {
    let Some((id, groups)) = obis_groups(line) else {
        // Identification line, blank separator, the '!' terminator, or a
        // vendor line without value groups.
        return;
    };

    match id {
        "0-0:96.1.4" => data.version_info = text_value(&groups, 0),
        "0-0:96.1.1" => data.equipment_id = text_value(&groups, 0),
        "0-0:1.0.0" => data.msg_timestamp = timestamp_value(id, &groups, 0),
        "1-0:1.8.1" => data.electricity_delivered_tariff1 = unit_value(id, &groups, 0),
        "1-0:1.8.2" => data.electricity_delivered_tariff2 = unit_value(id, &groups, 0),
        "1-0:2.8.1" => data.electricity_returned_tariff1 = unit_value(id, &groups, 0),
        "1-0:2.8.2" => data.electricity_returned_tariff2 = unit_value(id, &groups, 0),
        // The meter reports this as a wider integer; only the low 16 bits
        // are meaningful for the tariff indicator.
        "0-0:96.14.0" => data.tariff_indicator = uint_value(id, &groups, 0) as u16,
        "1-0:1.4.0" => data.current_avg_demand = unit_value(id, &groups, 0),
        "1-0:1.6.0" => {
            data.max_demand_month = MaxDemand {
                timestamp: timestamp_value(id, &groups, 0),
                demand: unit_value(id, &groups, 1),
            }
        }
        "0-0:98.1.0" => data.max_demand_year = max_demand_year(&groups),
        "1-0:1.7.0" => data.current_power_usage = unit_value(id, &groups, 0),
        "1-0:2.7.0" => data.current_power_return = unit_value(id, &groups, 0),
        "1-0:21.7.0" => data.current_power_usage_l1 = unit_value(id, &groups, 0),
        "1-0:41.7.0" => data.current_power_usage_l2 = unit_value(id, &groups, 0),
        "1-0:61.7.0" => data.current_power_usage_l3 = unit_value(id, &groups, 0),
        "1-0:22.7.0" => data.current_power_return_l1 = unit_value(id, &groups, 0),
        "1-0:42.7.0" => data.current_power_return_l2 = unit_value(id, &groups, 0),
        "1-0:62.7.0" => data.current_power_return_l3 = unit_value(id, &groups, 0),
        "1-0:32.7.0" => data.voltage_l1 = unit_value(id, &groups, 0),
        "1-0:52.7.0" => data.voltage_l2 = unit_value(id, &groups, 0),
        "1-0:72.7.0" => data.voltage_l3 = unit_value(id, &groups, 0),
        "1-0:31.7.0" => data.current_l1 = unit_value(id, &groups, 0),
        "1-0:51.7.0" => data.current_l2 = unit_value(id, &groups, 0),
        "1-0:71.7.0" => data.current_l3 = unit_value(id, &groups, 0),
        "0-0:96.3.10" => data.breaker_state = breaker_value(id, &groups),
        "0-0:17.0.0" => data.limiter_threshold = unit_value(id, &groups, 0),
        "1-0:31.4.0" => data.fuse_supervision_threshold = unit_value(id, &groups, 0),
        // Free-form text message: recognized, nothing to keep.
        "0-0:96.13.1" => {}
        _ => {}
    }
}

/// Split an OBIS line into its identifier and the contents of each
/// parenthesized value group.
fn obis_groups(line: &str) -> Option<(&str, Vec<&str>)> {
    let open = line.find('(')?;
    let id = &line[..open];
    let mut groups = Vec::new();
    let mut rest = &line[open..];
    while let Some(inner) = rest.strip_prefix('(') {
        let close = inner.find(')')?;
        groups.push(&inner[..close]);
        rest = &inner[close + 1..];
    }
    Some((id, groups))
}

fn text_value(groups: &[&str], idx: usize) -> String {
    groups.get(idx).copied().unwrap_or_default().to_string()
}

/// Numeric value with a `*unit` suffix, e.g. `(000011.111*kWh)`.
fn unit_value(id: &str, groups: &[&str], idx: usize) -> f32 {
    let Some(group) = groups.get(idx) else {
        warn!("P1 {id}: missing value group {idx}");
        return 0.0;
    };
    let number = group.split('*').next().unwrap_or_default();
    match number.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("P1 {id}: bad numeric value {group:?}");
            0.0
        }
    }
}

fn uint_value(id: &str, groups: &[&str], idx: usize) -> u32 {
    let Some(group) = groups.get(idx) else {
        warn!("P1 {id}: missing value group {idx}");
        return 0;
    };
    match group.parse() {
        Ok(value) => value,
        Err(_) => {
            warn!("P1 {id}: bad integer value {group:?}");
            0
        }
    }
}

fn timestamp_value(id: &str, groups: &[&str], idx: usize) -> i64 {
    let Some(group) = groups.get(idx) else {
        warn!("P1 {id}: missing timestamp group {idx}");
        return 0;
    };
    match parse_p1_timestamp(group) {
        Some(timestamp) => timestamp,
        None => {
            warn!("P1 {id}: bad timestamp {group:?}");
            0
        }
    }
}

/// Convert a P1 wall-clock stamp (`YYMMDDhhmmss`, year 2000-based) to epoch
/// seconds using the local zone. The trailing `S`/`W` DST marker the meter
/// may append is tolerated but not used; an ambiguous local time resolves
/// to its earliest mapping.
pub fn parse_p1_timestamp(stamp: &str) -> Option<i64> {
    let digits = stamp.as_bytes();
    if digits.len() < 12 || !digits[..12].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let num = |i: usize| u32::from(digits[i] - b'0') * 10 + u32::from(digits[i + 1] - b'0');
    Local
        .with_ymd_and_hms(
            2000 + num(0) as i32,
            num(2),
            num(4),
            num(6),
            num(8),
            num(10),
        )
        .earliest()
        .map(|dt| dt.timestamp())
}

fn breaker_value(id: &str, groups: &[&str]) -> BreakerState {
    match uint_value(id, groups, 0) {
        0 => BreakerState::Disconnected,
        1 => BreakerState::Connected,
        2 => BreakerState::ReadyForConnection,
        other => {
            warn!("P1 {id}: unknown breaker state {other}");
            BreakerState::default()
        }
    }
}

/// `0-0:98.1.0`: a count group and two header groups, then per entry two
/// administrative groups followed by the occurrence timestamp and the
/// demand value.
fn max_demand_year(groups: &[&str]) -> Vec<MaxDemand> {
    let id = "0-0:98.1.0";
    let count = (uint_value(id, groups, 0) as usize).min(MAX_DEMAND_YEAR_ENTRIES);
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let base = 3 + i * 4;
        if base + 3 >= groups.len() {
            warn!("P1 {id}: history truncated after {i} of {count} entries");
            break;
        }
        entries.push(MaxDemand {
            timestamp: timestamp_value(id, groups, base + 2),
            demand: unit_value(id, groups, base + 3),
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOLDEN_BODY: &str = concat!(
        "/FLU5\\253769484_A\r\n",
        "\r\n",
        "0-0:96.1.4(50217)\r\n",
        "0-0:96.1.1(3153414733313031303231363035)\r\n",
        "0-0:1.0.0(210204163428W)\r\n",
        "1-0:1.8.1(000011.111*kWh)\r\n",
        "1-0:1.8.2(000022.222*kWh)\r\n",
        "1-0:2.8.1(000001.234*kWh)\r\n",
        "1-0:2.8.2(000002.345*kWh)\r\n",
        "0-0:96.14.0(0001)\r\n",
        "1-0:1.4.0(02.351*kW)\r\n",
        "1-0:1.6.0(210204141500W)(02.589*kW)\r\n",
        "0-0:98.1.0(2)(1-0:1.6.0)(kW)",
        "(210201000000W)(00000000)(210117183000W)(03.695*kW)",
        "(210301000000W)(00000000)(210217224500W)(02.589*kW)\r\n",
        "1-0:1.7.0(00.532*kW)\r\n",
        "1-0:2.7.0(00.000*kW)\r\n",
        "1-0:21.7.0(00.233*kW)\r\n",
        "1-0:41.7.0(00.155*kW)\r\n",
        "1-0:61.7.0(00.144*kW)\r\n",
        "1-0:22.7.0(00.000*kW)\r\n",
        "1-0:42.7.0(00.000*kW)\r\n",
        "1-0:62.7.0(00.000*kW)\r\n",
        "1-0:32.7.0(234.7*V)\r\n",
        "1-0:52.7.0(234.5*V)\r\n",
        "1-0:72.7.0(233.1*V)\r\n",
        "1-0:31.7.0(001*A)\r\n",
        "1-0:51.7.0(002*A)\r\n",
        "1-0:71.7.0(003*A)\r\n",
        "0-0:96.3.10(1)\r\n",
        "0-0:17.0.0(999.9*kW)\r\n",
        "1-0:31.4.0(999*A)\r\n",
        "0-0:96.13.1()\r\n",
        "!"
    );

    /// Append a valid CRC trailer to a telegram body.
    fn seal(body: &str) -> Vec<u8> {
        let mut frame = body.as_bytes().to_vec();
        let trailer = format!("{:04X}\r\n", P1_CRC.checksum(&frame));
        frame.extend_from_slice(trailer.as_bytes());
        frame
    }

    fn local_epoch(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Local
            .with_ymd_and_hms(y, mo, d, h, mi, s)
            .earliest()
            .unwrap()
            .timestamp()
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(P1_CRC.checksum(b"123456789"), 0xBB3D);
    }

    #[test]
    fn golden_telegram_parses() {
        let data = parse_telegram(&seal(GOLDEN_BODY)).unwrap();

        assert_eq!(data.version_info, "50217");
        assert_eq!(data.equipment_id, "3153414733313031303231363035");
        assert_eq!(data.msg_timestamp, local_epoch(2021, 2, 4, 16, 34, 28));
        assert_eq!(data.electricity_delivered_tariff1, 11.111);
        assert_eq!(data.electricity_delivered_tariff2, 22.222);
        assert_eq!(data.electricity_returned_tariff1, 1.234);
        assert_eq!(data.electricity_returned_tariff2, 2.345);
        assert_eq!(data.tariff_indicator, 1);
        assert_eq!(data.current_avg_demand, 2.351);
        assert_eq!(data.max_demand_month.timestamp, local_epoch(2021, 2, 4, 14, 15, 0));
        assert_eq!(data.max_demand_month.demand, 2.589);
        assert_eq!(data.current_power_usage, 0.532);
        assert_eq!(data.current_power_return, 0.0);
        assert_eq!(data.current_power_usage_l2, 0.155);
        assert_eq!(data.voltage_l2, 234.5);
        assert_eq!(data.current_l3, 3.0);
        assert_eq!(data.breaker_state, BreakerState::Connected);
        assert_eq!(data.limiter_threshold, 999.9);
        assert_eq!(data.fuse_supervision_threshold, 999.0);

        assert_eq!(data.max_demand_year.len(), 2);
        assert_eq!(data.max_demand_year[0].timestamp, local_epoch(2021, 1, 17, 18, 30, 0));
        assert_eq!(data.max_demand_year[0].demand, 3.695);
        assert_eq!(data.max_demand_year[1].timestamp, local_epoch(2021, 2, 17, 22, 45, 0));
        assert_eq!(data.max_demand_year[1].demand, 2.589);
    }

    #[test]
    fn flipped_crc_digit_rejects_frame() {
        let mut frame = seal(GOLDEN_BODY);
        let last_digit = frame.len() - 3;
        frame[last_digit] = if frame[last_digit] == b'0' { b'1' } else { b'0' };
        assert!(parse_telegram(&frame).is_none());
    }

    #[test]
    fn frame_not_starting_with_slash_rejected() {
        assert!(parse_telegram(b"XMX5\r\n!12AB\r\n").is_none());
        assert!(parse_telegram(b"!\r\n").is_none());
    }

    #[test]
    fn unknown_lines_are_ignored() {
        let body = "/FLU5\\x\r\n9-9:99.99.9(whatever)(else)\r\n1-0:1.7.0(00.100*kW)\r\n!";
        let data = parse_telegram(&seal(body)).unwrap();
        assert_eq!(data.current_power_usage, 0.1);
    }

    #[test]
    fn bad_field_value_keeps_default_and_parsing_continues() {
        let body = "/FLU5\\x\r\n1-0:1.8.1(not-a-number*kWh)\r\n1-0:1.7.0(00.100*kW)\r\n!";
        let data = parse_telegram(&seal(body)).unwrap();
        assert_eq!(data.electricity_delivered_tariff1, 0.0);
        assert_eq!(data.current_power_usage, 0.1);
    }

    #[test]
    fn truncated_demand_history_stops_short() {
        let body = "/FLU5\\x\r\n0-0:98.1.0(2)(1-0:1.6.0)(kW)(210201000000W)(0)(210117183000W)(03.695*kW)\r\n!";
        let data = parse_telegram(&seal(body)).unwrap();
        assert_eq!(data.max_demand_year.len(), 1);
        assert_eq!(data.max_demand_year[0].demand, 3.695);
    }

    #[test]
    fn timestamp_dst_suffix_is_ignored() {
        let summer = parse_p1_timestamp("210704120000S").unwrap();
        let plain = parse_p1_timestamp("210704120000").unwrap();
        assert_eq!(summer, plain);
        assert!(parse_p1_timestamp("2107041200").is_none());
        assert!(parse_p1_timestamp("21070412000x").is_none());
    }

    #[test]
    fn fields_missing_from_telegram_stay_zero() {
        let body = "/FLU5\\x\r\n1-0:1.7.0(00.100*kW)\r\n!";
        let data = parse_telegram(&seal(body)).unwrap();
        assert_eq!(data.msg_timestamp, 0);
        assert_eq!(data.electricity_delivered_tariff1, 0.0);
        assert_eq!(data.breaker_state, BreakerState::Disconnected);
        assert!(data.max_demand_year.is_empty());
    }
}
// EOF
