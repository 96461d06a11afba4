use crate::mqtt::MqttConfig;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use ems_rs485_lib::protocol as proto;
use std::time::Duration;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_address(s: &str) -> Result<proto::Address, String> {
    let address =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid address format: {e}"))?;
    Ok(proto::Address::from(address))
}

const fn about_text() -> &'static str {
    "EMS RS485 bridge - Poll an EMS over RS485 and mirror its registers to an MQTT broker."
}

#[derive(Parser, Debug)]
#[command(name = "emsbridge", author, version, about = about_text(), long_about = None)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -q for warnings only, -v for debug, -vv for trace. Default is info.
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Serial port device name.
    /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
    #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
    pub device: String,

    /// Baud rate of the RS485 line.
    #[arg(short, long, default_value_t = 9600)]
    pub baud_rate: u32,

    /// RS485 address of the EMS.
    /// Can be specified in decimal or hexadecimal (e.g., "0x01").
    #[arg(short, long, default_value = "0x01", value_parser = parse_address, verbatim_doc_comment)]
    pub address: proto::Address,

    /// How long a read waits for the next byte before the response is considered complete.
    /// Examples: "1s", "500ms".
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Pause between two polling cycles.
    #[arg(short, long, default_value = "0s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Minimum delay between two MQTT publications.
    #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
    pub pacing: Duration,

    /// The configuration file for the MQTT broker.
    #[arg(short, long, default_value_t = MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
    pub config_file: String,
}
