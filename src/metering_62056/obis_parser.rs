use super::{structs::DataSet, MeterError};
use crate::obis_utils;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

lazy_static! {
    static ref DATASET: Regex = Regex::new(r"^([^()/!\s]+)\(([^()*]*)(?:\*([^()]*))?\)").unwrap();
}

/// Parses every dataset of one data line. The whole line has to be made of
/// dataset occurrences, anything left over makes the line malformed.
pub fn parse_obis_line(line: &str) -> Result<Vec<DataSet>, MeterError> {
    // Example formats:
    // 1.8.0(01234.56*kWh)
    // 1-0:15.7.0(001.234*kW)
    // 1.8.0(01234.56*kWh)2.8.0(00100.00*kWh)
    // 0.9.1(123456)

    let line = line.trim();
    let mut rest = line;
    let mut datasets = Vec::new();

    while !rest.is_empty() {
        let caps = DATASET.captures(rest)
            .ok_or_else(|| MeterError::Malformed(format!("invalid data line {:?}", line)))?;

        let unit = caps.get(3)
            .map(|m| m.as_str().to_string())
            .filter(|u| !u.is_empty());

        let address = obis_utils::normalize_obis_code(&caps[1]);
        if !obis_utils::validate_obis_code(&address) {
            debug!("Address {:?} is not a numeric OBIS code", address);
        }
        datasets.push(DataSet {
            address,
            value: caps[2].to_string(),
            unit,
        });

        rest = &rest[caps[0].len()..];
    }

    debug!("Parsed {} datasets from line {:?}", datasets.len(), line);
    Ok(datasets)
}

/// Parses the payload of a data block (between STX and ETX).
pub fn parse_data_block(block: &str) -> Result<Vec<DataSet>, MeterError> {
    let mut datasets = Vec::new();
    for line in block.lines() {
        let line = line.trim();
        if line.is_empty() || line == "!" {
            continue;
        }
        datasets.extend(parse_obis_line(line)?);
    }
    Ok(datasets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(address: &str, value: &str, unit: Option<&str>) -> DataSet {
        DataSet { address: address.to_string(), value: value.to_string(), unit: unit.map(|u| u.to_string()) }
    }

    #[test]
    fn test_parse_obis_line() {
        let result = parse_obis_line("1-0:1.8.1(000123.456*kWh)").unwrap();
        assert_eq!(result, vec![dataset("1-0:1.8.1", "000123.456", Some("kWh"))]);
    }

    #[test]
    fn test_parse_line_without_unit() {
        let result = parse_obis_line("0.9.1(123456)").unwrap();
        assert_eq!(result, vec![dataset("0.9.1", "123456", None)]);

        let result = parse_obis_line("C.1.0()").unwrap();
        assert_eq!(result, vec![dataset("C.1.0", "", None)]);
    }

    #[test]
    fn test_parse_concatenated_datasets() {
        let result = parse_obis_line("1.8.0(01234.56*kWh)2.8.0(00100.00*kWh)").unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], dataset("1.8.0", "01234.56", Some("kWh")));
        assert_eq!(result[1], dataset("2.8.0", "00100.00", Some("kWh")));
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(matches!(parse_obis_line("1.8.0 01234.56"), Err(MeterError::Malformed(_))));
        assert!(matches!(parse_obis_line("1.8.0(01234.56*kWh)garbage"), Err(MeterError::Malformed(_))));
        assert!(matches!(parse_obis_line("(01234.56)"), Err(MeterError::Malformed(_))));
        assert!(matches!(parse_obis_line("1.8.0(0123"), Err(MeterError::Malformed(_))));
    }

    #[test]
    fn test_parse_data_block() {
        let block = "1.8.0(01234.56*kWh)\r\n\r\n2.8.0(00100.00*kWh)\r\n!\r\n";
        let result = parse_data_block(block).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1].address, "2.8.0");
    }
}
