use super::BatteryReading;

/// Extracts a [`BatteryReading`] from `dumpsys battery` output.
///
/// Returns `None` when the level is missing or the scale is zero.
pub fn parse_dumpsys_battery(input: &str) -> Option<BatteryReading> {
    let mut level = None::<u64>;
    let mut scale = 100u64;
    let mut plugged = false;

    for raw_line in input.lines() {
        let line = raw_line.trim_end_matches('\r').trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim().to_ascii_lowercase().as_str() {
            "level" => level = value.parse().ok(),
            "scale" => {
                if let Ok(v) = value.parse() {
                    scale = v;
                }
            }
            "ac powered" | "usb powered" | "wireless powered" | "dock powered" => {
                plugged |= value.eq_ignore_ascii_case("true");
            }
            _ => {}
        }
    }

    if scale == 0 {
        return None;
    }
    let percent = (level? * 100 / scale).min(100);
    Some(BatteryReading { level: percent as u8, plugged })
}
