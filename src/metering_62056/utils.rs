use super::{structs::{DataMode, MeterIdentification, MeterType}, MeterError};
use log::debug;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ACK: u8 = 0x06;
pub const CR: u8 = 0x0D;
pub const LF: u8 = 0x0A;

pub fn baud_rate_from_char(c: char) -> Option<u32> {
    match c {
        '0' => Some(300),
        '1' => Some(600),
        '2' => Some(1200),
        '3' => Some(2400),
        '4' => Some(4800),
        '5' => Some(9600),
        '6' => Some(19200),
        _ => None,
    }
}

pub fn build_sign_on(device_address: Option<&str>) -> Vec<u8> {
    return format!("/?{}!\r\n", device_address.unwrap_or("")).into_bytes();
}

pub fn build_option_select(baud_char: char, mode: DataMode) -> Result<Vec<u8>, MeterError> {
    let mode_char = mode.as_char()
        .ok_or_else(|| MeterError::UnsupportedMode(format!("{:?}", mode)))?;

    let mut frame = vec![ACK, b'0'];
    frame.push(baud_char as u8);
    frame.push(mode_char as u8);
    frame.extend_from_slice(&[CR, LF]);
    Ok(frame)
}

/// XOR over everything after STX up to and including ETX.
pub fn calculate_bcc(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc ^ b)
}

pub fn parse_identification_line(line: &str) -> Result<MeterIdentification, MeterError> {
    // Example formats:
    // /XXX5Foo
    // /ISK5MT382-1000
    // /EBZ5DD3BL10-112
    // /LGZ4\2ZMD3104407.B32

    let content = line.trim_end_matches(['\r', '\n'])
        .strip_prefix('/')
        .ok_or_else(|| MeterError::IdentificationFailed(format!("missing '/' in {:?}", line)))?;

    let chars: Vec<char> = content.chars().collect();
    if chars.len() < 5 {
        return Err(MeterError::IdentificationFailed(format!("frame too short: {:?}", line)));
    }

    let manufacturer: String = chars[..3].iter().collect();
    if !manufacturer.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(MeterError::IdentificationFailed(format!("invalid manufacturer {:?}", manufacturer)));
    }

    let baud_char = chars[3];
    let mut rest = &chars[4..];
    let mut enhanced = None;
    if rest.len() >= 2 && rest[0] == '\\' {
        enhanced = Some(rest[1]);
        rest = &rest[2..];
    }

    let identification: String = rest.iter().collect();
    if identification.is_empty() || identification.chars().any(|c| c.is_control()) {
        return Err(MeterError::IdentificationFailed(format!("invalid identification {:?}", identification)));
    }

    debug!("Parsed identification - Manufacturer: {}, baud char: {}, ID: {}",
           manufacturer, baud_char, identification);

    Ok(MeterIdentification {
        manufacturer,
        baud_char,
        enhanced,
        identification,
    })
}

pub fn serialize_identification(ident: &MeterIdentification) -> String {
    let enhanced = match ident.enhanced {
        Some(c) => format!("\\{}", c),
        None => String::new(),
    };
    return format!("/{}{}{}{}\r\n", ident.manufacturer, ident.baud_char, enhanced, ident.identification);
}

pub fn get_meter_type_from_manufacturer(manufacturer: &str) -> MeterType {
    match manufacturer.to_uppercase().as_str() {
        "ESY" | "EAS" => MeterType::EasyMeter,
        "EBZ" => MeterType::EBZ,
        _ => MeterType::Generic,
    }
}
