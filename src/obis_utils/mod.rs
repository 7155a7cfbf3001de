use std::collections::HashMap;

pub fn get_obis_description(obis_code: &str) -> Option<&'static str> {
    let descriptions = get_standard_obis_descriptions();
    descriptions.get(expand_obis_code(obis_code).as_str()).copied()
}

pub fn get_standard_obis_descriptions() -> HashMap<&'static str, &'static str> {
    let mut map = HashMap::new();

    // Energy values
    map.insert("1-0:1.8.0", "Active energy + (total)");
    map.insert("1-0:1.8.1", "Active energy + (tariff 1)");
    map.insert("1-0:1.8.2", "Active energy + (tariff 2)");
    map.insert("1-0:2.8.0", "Active energy - (total)");
    map.insert("1-0:2.8.1", "Active energy - (tariff 1)");
    map.insert("1-0:2.8.2", "Active energy - (tariff 2)");
    map.insert("1-0:15.8.0", "Absolute active energy total");

    // Power values
    map.insert("1-0:1.7.0", "Active power + (total)");
    map.insert("1-0:2.7.0", "Active power - (total)");
    map.insert("1-0:15.7.0", "Absolute active instantaneous power");
    map.insert("1-0:16.7.0", "Sum active instantaneous power");
    map.insert("1-0:21.7.0", "Active power + (L1)");
    map.insert("1-0:41.7.0", "Active power + (L2)");
    map.insert("1-0:61.7.0", "Active power + (L3)");

    // Voltage and current values
    map.insert("1-0:32.7.0", "Voltage (L1)");
    map.insert("1-0:52.7.0", "Voltage (L2)");
    map.insert("1-0:72.7.0", "Voltage (L3)");
    map.insert("1-0:31.7.0", "Current (L1)");
    map.insert("1-0:51.7.0", "Current (L2)");
    map.insert("1-0:71.7.0", "Current (L3)");

    // Reactive energy
    map.insert("1-0:3.8.0", "Reactive energy + (total)");
    map.insert("1-0:4.8.0", "Reactive energy - (total)");

    // Identification, time and service values
    map.insert("1-0:0.0.0", "Equipment identifier");
    map.insert("1-0:0.9.1", "Local time");
    map.insert("1-0:0.9.2", "Local date");
    map.insert("1-0:13.7.0", "Power factor");
    map.insert("1-0:14.7.0", "Supply frequency");
    map.insert("1-0:F.F", "Fatal error register");
    map.insert("0-0:1.0.0", "Date and time");
    map.insert("0-0:0.0.0", "Device ID");
    map.insert("0-0:0.2.0", "Firmware version");

    map
}

/// Adds the `1-0:` prefix to reduced `C.D.E` codes as sent by most mode C
/// electricity meters. Full codes are returned trimmed.
pub fn expand_obis_code(code: &str) -> String {
    let code = normalize_obis_code(code);
    if code.contains(':') {
        return code;
    }
    format!("1-0:{}", code)
}

pub fn validate_obis_code(code: &str) -> bool {
    // OBIS code format: A-B:C.D.E*F, the A-B: prefix and *F/&F suffix are optional
    // A: Medium (0=abstract, 1=electricity, 6=heat, 7=gas, 8=water)
    // B: Channel (0-15)
    // C: Physical value (1-255)
    // D: Processing method (0-255)
    // E: Tariff/Time (0-255)
    // F: Storage (optional, 0-255)

    let (prefix, cde_part) = match code.split_once(':') {
        Some((ab, cde)) => (Some(ab), cde),
        None => (None, code),
    };

    let mut numbers: Vec<&str> = Vec::new();
    if let Some(ab) = prefix {
        let ab_parts: Vec<&str> = ab.split('-').collect();
        if ab_parts.len() != 2 {
            return false;
        }
        numbers.extend(ab_parts);
    }

    let (cde, storage) = match cde_part.split_once(['*', '&']) {
        Some((cde, f)) => (cde, Some(f)),
        None => (cde_part, None),
    };

    let cde_parts: Vec<&str> = cde.split('.').collect();
    if cde_parts.len() != 3 {
        return false;
    }
    numbers.extend(cde_parts);
    numbers.extend(storage);

    numbers.iter().all(|part| part.parse::<u8>().is_ok())
}

pub fn normalize_obis_code(code: &str) -> String {
    code.trim().to_string()
}

pub fn extract_numeric_value(value_str: &str) -> Option<f64> {
    // Extract numeric value from strings like "000123.456" or "123.456*kWh"
    let cleaned = value_str
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect::<String>();

    cleaned.parse::<f64>().ok()
}
