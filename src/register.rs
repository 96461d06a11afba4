//! The EMS register map.
//!
//! Turns raw register words into physical values, pairs the registers that
//! hold 32-bit quantities and maps every published register to its MQTT
//! topic name.

use std::collections::HashMap;
use std::fmt;

/// A register value converted to its physical meaning.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A scaled measurement, e.g. volts or amperes.
    Number(f64),
    /// A register without a conversion rule, forwarded unchanged.
    Raw(u32),
    /// A state or enumeration label.
    Label(&'static str),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(value) if value.is_finite() && value.fract() == 0.0 => {
                write!(f, "{value:.1}")
            }
            Value::Number(value) => write!(f, "{value}"),
            Value::Raw(value) => write!(f, "{value}"),
            Value::Label(label) => f.write_str(label),
        }
    }
}

/// A decoded register, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFact {
    pub address: u16,
    pub value: Value,
}

const ON_OFF: [u16; 3] = [0x302D, 0x3039, 0x303B];
const ONLINE_OFFLINE: [u16; 2] = [0x4016, 0x4042];
const SCALE_10: [u16; 14] = [
    0x4001, 0x401F, 0x4002, 0x4005, 0x4018, 0x4017, 0x4020, 0x3027, 0x3029, 0x302A, 0x302C,
    0x4023, 0x4024, 0x4025,
];
const SCALE_100: [u16; 8] = [
    0x4003, 0x4006, 0x4019, 0x401C, 0x401B, 0x4026, 0x4027, 0x4028,
];
const SCALE_1: [u16; 2] = [0x4004, 0x4007];

/// Battery chemistry setting.
const BATTERY_TYPE: u16 = 0x3020;
/// Nominal battery voltage setting.
const BATTERY_VOLTAGE_TYPE: u16 = 0x3021;
/// Energy meter connection state.
const EM_ONLINE: u16 = 0x4022;

/// Signedness of a quantity spread over two registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    /// Energy counter, forwarded as raw 32-bit integer.
    Unsigned,
    /// Power reading in 0.1 W, two's complement.
    Signed,
}

/// Base addresses of the 32-bit quantities. The base register holds the
/// high word, `base + 1` the low word.
const PAIRED: [(u16, Pairing); 6] = [
    (0x400E, Pairing::Unsigned),
    (0x4010, Pairing::Unsigned),
    (0x4029, Pairing::Signed),
    (0x402B, Pairing::Signed),
    (0x402D, Pairing::Signed),
    (0x403A, Pairing::Signed),
];

fn pairing(address: u16) -> Option<Pairing> {
    PAIRED
        .iter()
        .find(|(base, _)| *base == address)
        .map(|(_, pairing)| *pairing)
}

fn scale(raw: u32, divisor: f64) -> Value {
    Value::Number(raw as f64 / divisor)
}

/// Converts a raw register value into its physical value.
///
/// `raw` is a single register word, or the combined 32-bit value of a
/// register pair. Unknown addresses are passed through unchanged.
pub fn interpret(address: u16, raw: u32) -> Value {
    let flag = raw == 1;
    match address {
        a if ON_OFF.contains(&a) => Value::Label(if flag { "on" } else { "off" }),
        a if ONLINE_OFFLINE.contains(&a) => Value::Label(if flag { "Online" } else { "Offline" }),
        a if SCALE_10.contains(&a) => scale(raw, 10.0),
        a if SCALE_100.contains(&a) => scale(raw, 100.0),
        a if SCALE_1.contains(&a) => scale(raw, 1.0),
        a if pairing(a) == Some(Pairing::Signed) => Value::Number(raw as i32 as f64 / 10.0),
        BATTERY_TYPE => match raw {
            1 => Value::Label("Bleigel/Säure Batterie"),
            2 => Value::Label("LiFePo4 Batterie"),
            _ => Value::Raw(raw),
        },
        BATTERY_VOLTAGE_TYPE => match raw {
            0 => Value::Label("48V"),
            1 => Value::Label("51.2V"),
            _ => Value::Raw(raw),
        },
        EM_ONLINE => match raw {
            1 => Value::Label("Online"),
            2 => Value::Label("Disabled"),
            _ => Value::Label("Offline"),
        },
        _ => Value::Raw(raw),
    }
}

/// Decodes the words of one read response starting at register `start`.
///
/// Register pairs are combined into one fact at the base address. A base
/// word whose companion is not part of the response is discarded, as is a
/// companion word without its base.
pub fn decode(start: u16, words: &[u16]) -> Vec<DecodedFact> {
    let mut pending: HashMap<u16, u16> = HashMap::new();
    let mut facts = Vec::with_capacity(words.len());

    for (offset, &word) in words.iter().enumerate() {
        let address = start.wrapping_add(offset as u16);
        if pairing(address).is_some() {
            pending.insert(address, word);
            continue;
        }
        let base = address.wrapping_sub(1);
        if pairing(base).is_some() {
            match pending.remove(&base) {
                Some(high) => {
                    let combined = (u32::from(high) << 16) | u32::from(word);
                    facts.push(DecodedFact {
                        address: base,
                        value: interpret(base, combined),
                    });
                }
                None => log::trace!("Dropping low word of {base:#06x} without its high word"),
            }
            continue;
        }
        facts.push(DecodedFact {
            address,
            value: interpret(address, u32::from(word)),
        });
    }

    for base in pending.keys() {
        log::trace!("Discarding high word of {base:#06x}, low word missing in response");
    }
    facts
}

/// The topic name a register is published under, if it is published at all.
pub fn topic_name(address: u16) -> Option<&'static str> {
    Some(match address {
        0x302D => "EMS_Limit",
        0x302E => "EMS_Power_Limit",
        0x4021 => "EMS_Load_Power",
        0x303B => "EMS_EM",
        0x3039 => "EMS_Bypass",
        0x4001 => "EMS_Temperature",
        0x401F => "EMS_Load_Energy",
        0x3072 => "EMS_Address",
        0x4002 => "MPPT1_Voltage",
        0x4003 => "MPPT1_Current",
        0x4004 => "MPPT1_Power",
        0x400E => "MPPT1_Energy",
        0x4005 => "MPPT2_Voltage",
        0x4006 => "MPPT2_Current",
        0x4007 => "MPPT2_Power",
        0x4010 => "MPPT2_Energy",
        0x401E => "MPPT_Total_Energy",
        0x4016 => "Battery_Online",
        0x4042 => "Battery_BMS_Online",
        0x401D => "Battery_SOC",
        0x4018 => "Battery_Voltage",
        0x401A => "Battery_Charging_Power",
        0x4019 => "Battery_Charging_Current",
        0x401C => "Battery_Discharging_Power",
        0x401B => "Battery_Discharging_Current",
        0x4017 => "Battery_Temperature",
        0x4020 => "Battery_Energy",
        0x301F => "Battery_BMS_Type",
        0x3020 => "Battery_Type",
        0x3021 => "Battery_Voltage_Type",
        0x3022 => "Battery_Capacity",
        0x3027 => "Battery_BMS_Max_Voltage",
        0x3028 => "Battery_BMS_Max_Current",
        0x3029 => "Battery_BMS_Min_Voltage",
        0x302A => "Battery_Max_Voltage",
        0x302B => "Battery_Max_Current",
        0x302C => "Battery_Min_Voltage",
        0x4022 => "EM_Online",
        0x4029 => "EM_A_Power",
        0x4026 => "EM_A_Current",
        0x4023 => "EM_A_Voltage",
        0x402B => "EM_B_Power",
        0x4027 => "EM_B_Current",
        0x4024 => "EM_B_Voltage",
        0x402D => "EM_C_Power",
        0x4028 => "EM_C_Current",
        0x4025 => "EM_C_Voltage",
        0x403A => "EM_Total_Power",
        _ => return None,
    })
}

/// Prefix shared by all topics of one EMS.
pub fn topic_prefix(ems_id: &str) -> String {
    format!("solar/ems/{ems_id}")
}

/// The full topic of a register for the EMS with the given id.
pub fn topic(ems_id: &str, address: u16) -> Option<String> {
    topic_name(address).map(|name| format!("{}/{name}", topic_prefix(ems_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_registers() {
        assert_eq!(interpret(0x303B, 1), Value::Label("on"));
        assert_eq!(interpret(0x303B, 0), Value::Label("off"));
        assert_eq!(interpret(0x302D, 7), Value::Label("off"));
        assert_eq!(interpret(0x4042, 1), Value::Label("Online"));
        assert_eq!(interpret(0x4016, 0), Value::Label("Offline"));
    }

    #[test]
    fn scaled_registers() {
        assert_eq!(interpret(0x4002, 123), Value::Number(12.3));
        assert_eq!(interpret(0x4003, 1234), Value::Number(12.34));
        assert_eq!(interpret(0x4004, 560), Value::Number(560.0));
        assert_eq!(interpret(0x3027, 0), Value::Number(0.0));
    }

    #[test]
    fn enumerations() {
        assert_eq!(interpret(0x3020, 2), Value::Label("LiFePo4 Batterie"));
        assert_eq!(interpret(0x3020, 9), Value::Raw(9));
        assert_eq!(interpret(0x3021, 1), Value::Label("51.2V"));
        assert_eq!(interpret(0x4022, 2), Value::Label("Disabled"));
        assert_eq!(interpret(0x4022, 0), Value::Label("Offline"));
        assert_eq!(interpret(0x4022, 77), Value::Label("Offline"));
    }

    #[test]
    fn unknown_register_passes_through() {
        assert_eq!(interpret(0x1234, 4711), Value::Raw(4711));
        assert_eq!(interpret(0x401D, 87), Value::Raw(87));
    }

    #[test]
    fn signed_pair_is_twos_complement() {
        let facts = decode(0x4029, &[0xFFFF, 0xFFFF]);
        assert_eq!(
            facts,
            [DecodedFact {
                address: 0x4029,
                value: Value::Number(-0.1)
            }]
        );
        let facts = decode(0x403A, &[0x0000, 0x04D2]);
        assert_eq!(facts[0].value, Value::Number(123.4));
    }

    #[test]
    fn unsigned_pair_combines_high_word_first() {
        let facts = decode(0x400E, &[0x0001, 0x0002]);
        assert_eq!(
            facts,
            [DecodedFact {
                address: 0x400E,
                value: Value::Raw(0x0001_0002)
            }]
        );
    }

    #[test]
    fn lone_base_word_yields_nothing() {
        // The telemetry block ends on 0x4010, so its companion never arrives.
        let facts = decode(0x400F, &[0x1111, 0x2222]);
        assert!(facts.is_empty());
        assert!(decode(0x402D, &[0xFFFF]).is_empty());
    }

    #[test]
    fn lone_companion_word_is_dropped() {
        // 0x402A belongs to 0x4029, 0x402B is itself a base without companion.
        assert!(decode(0x402A, &[0x0005, 0x0042]).is_empty());
    }

    #[test]
    fn pairs_and_singles_in_one_response() {
        let facts = decode(0x4028, &[250, 0x0000, 0x0064, 0x0000]);
        assert_eq!(
            facts,
            [
                DecodedFact {
                    address: 0x4028,
                    value: Value::Number(2.5)
                },
                DecodedFact {
                    address: 0x4029,
                    value: Value::Number(10.0)
                },
            ]
        );
    }

    #[test]
    fn payload_formatting() {
        assert_eq!(Value::Number(230.0).to_string(), "230.0");
        assert_eq!(Value::Number(12.3).to_string(), "12.3");
        assert_eq!(Value::Number(-0.1).to_string(), "-0.1");
        assert_eq!(Value::Raw(42).to_string(), "42");
        assert_eq!(Value::Label("51.2V").to_string(), "51.2V");
    }

    #[test]
    fn topics() {
        assert_eq!(
            topic("0001", 0x403A).as_deref(),
            Some("solar/ems/0001/EM_Total_Power")
        );
        assert_eq!(topic("0001", 0x400F), None);
        assert_eq!(topic_name(0x302E), Some("EMS_Power_Limit"));
    }
}
