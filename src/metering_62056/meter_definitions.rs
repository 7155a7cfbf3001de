use super::structs::{MeterDefinition, MeterType};
use crate::obis_utils;
use std::collections::HashMap;

pub fn get_easymeter_definition() -> MeterDefinition {
    let mut obis_mapping = HashMap::new();

    // EasyMeter Q3D OBIS code mappings
    obis_mapping.insert("1-0:1.8.0".to_string(), "total_energy_consumed".to_string());
    obis_mapping.insert("1-0:2.8.0".to_string(), "total_energy_delivered".to_string());
    obis_mapping.insert("1-0:1.8.1".to_string(), "energy_consumed_t1".to_string());
    obis_mapping.insert("1-0:1.8.2".to_string(), "energy_consumed_t2".to_string());
    obis_mapping.insert("1-0:15.7.0".to_string(), "current_power".to_string());
    obis_mapping.insert("1-0:32.7.0".to_string(), "voltage_l1".to_string());
    obis_mapping.insert("1-0:52.7.0".to_string(), "voltage_l2".to_string());
    obis_mapping.insert("1-0:72.7.0".to_string(), "voltage_l3".to_string());
    obis_mapping.insert("1-0:31.7.0".to_string(), "current_l1".to_string());
    obis_mapping.insert("1-0:51.7.0".to_string(), "current_l2".to_string());
    obis_mapping.insert("1-0:71.7.0".to_string(), "current_l3".to_string());
    obis_mapping.insert("1-0:14.7.0".to_string(), "frequency".to_string());
    obis_mapping.insert("0-0:1.0.0".to_string(), "timestamp".to_string());

    MeterDefinition {
        meter_type: MeterType::EasyMeter,
        manufacturer_code: "ESY".to_string(),
        default_baud_rate: 9600,
        obis_mapping,
    }
}

pub fn get_ebz_definition() -> MeterDefinition {
    let mut obis_mapping = HashMap::new();

    // EBZ DD3 OBIS code mappings
    obis_mapping.insert("1-0:1.8.1".to_string(), "energy_consumed_t1".to_string());
    obis_mapping.insert("1-0:1.8.2".to_string(), "energy_consumed_t2".to_string());
    obis_mapping.insert("1-0:2.8.1".to_string(), "energy_delivered_t1".to_string());
    obis_mapping.insert("1-0:2.8.2".to_string(), "energy_delivered_t2".to_string());
    obis_mapping.insert("1-0:16.7.0".to_string(), "sum_active_power".to_string());
    obis_mapping.insert("1-0:36.7.0".to_string(), "sum_reactive_power".to_string());
    obis_mapping.insert("1-0:32.7.0".to_string(), "voltage_l1".to_string());
    obis_mapping.insert("1-0:52.7.0".to_string(), "voltage_l2".to_string());
    obis_mapping.insert("1-0:72.7.0".to_string(), "voltage_l3".to_string());
    obis_mapping.insert("1-0:13.7.0".to_string(), "power_factor".to_string());
    obis_mapping.insert("1-0:14.7.0".to_string(), "frequency".to_string());
    obis_mapping.insert("0-0:0.0.0".to_string(), "device_id".to_string());

    MeterDefinition {
        meter_type: MeterType::EBZ,
        manufacturer_code: "EBZ".to_string(),
        default_baud_rate: 9600,
        obis_mapping,
    }
}

pub fn get_meter_definition_by_manufacturer(manufacturer: &str) -> Option<MeterDefinition> {
    match super::utils::get_meter_type_from_manufacturer(manufacturer) {
        MeterType::EasyMeter => Some(get_easymeter_definition()),
        MeterType::EBZ => Some(get_ebz_definition()),
        MeterType::Generic => None,
    }
}

impl MeterDefinition {
    /// Friendly name for a dataset address. Mode C meters often send the
    /// reduced `C.D.E` form, which is looked up as electricity channel 0.
    pub fn friendly_name(&self, address: &str) -> Option<&str> {
        let full = obis_utils::expand_obis_code(address);
        self.obis_mapping.get(&full).map(|s| s.as_str())
    }
}
