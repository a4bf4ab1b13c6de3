//! Serial port discovery.
//!
//! Enumerates ports through `serialport`, classifies each one and gives
//! known USB-serial adapters a friendly name by VID/PID.

use crate::serial::types::*;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Known USB-serial adapters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy)]
pub struct KnownAdapter {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: &'static str,
    pub product: &'static str,
}

const fn adapter(vid: u16, pid: u16, manufacturer: &'static str, product: &'static str) -> KnownAdapter {
    KnownAdapter {
        vid,
        pid,
        manufacturer,
        product,
    }
}

/// Adapters commonly found on debug benches.
pub const KNOWN_ADAPTERS: &[KnownAdapter] = &[
    adapter(0x0403, 0x6001, "FTDI", "FT232R"),
    adapter(0x0403, 0x6010, "FTDI", "FT2232"),
    adapter(0x0403, 0x6014, "FTDI", "FT232H"),
    adapter(0x0403, 0x6015, "FTDI", "FT-X Series"),
    adapter(0x10C4, 0xEA60, "Silicon Labs", "CP2102"),
    adapter(0x10C4, 0xEA70, "Silicon Labs", "CP2105"),
    adapter(0x067B, 0x2303, "Prolific", "PL2303"),
    adapter(0x067B, 0x23A3, "Prolific", "PL2303GS"),
    adapter(0x1A86, 0x7523, "WCH", "CH340"),
    adapter(0x1A86, 0x5523, "WCH", "CH341A"),
    adapter(0x1A86, 0x55D4, "WCH", "CH9102"),
    adapter(0x2341, 0x0043, "Arduino", "Uno R3"),
    adapter(0x303A, 0x1001, "Espressif", "USB-JTAG/serial"),
    adapter(0x0483, 0x5740, "STMicroelectronics", "STM32 VCP"),
    adapter(0x2E8A, 0x000A, "Raspberry Pi", "Pico"),
];

pub fn lookup_adapter(vid: u16, pid: u16) -> Option<&'static KnownAdapter> {
    KNOWN_ADAPTERS.iter().find(|a| a.vid == vid && a.pid == pid)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Guess the port type from its name alone.
pub fn classify_port(port_name: &str) -> PortType {
    let lower = port_name.to_lowercase();
    if lower.contains("usb") || lower.contains("acm") {
        PortType::UsbSerial
    } else if lower.contains("bluetooth") || lower.contains("rfcomm") {
        PortType::Bluetooth
    } else if lower.contains("pts") || lower.contains("pty") || lower.contains("tnt") {
        PortType::Virtual
    } else if lower.starts_with("com") || lower.starts_with("/dev/ttys") {
        PortType::Native
    } else {
        PortType::Unknown
    }
}

/// Friendly name for the port selector.
pub fn generate_display_name(port: &SerialPortInfo) -> String {
    if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        if let Some(adapter) = lookup_adapter(vid, pid) {
            return format!(
                "{} - {} {}",
                port.port_name, adapter.manufacturer, adapter.product
            );
        }
    }
    match port.product.as_deref() {
        Some(product) if !product.is_empty() => format!("{} - {}", port.port_name, product),
        _ => port.port_name.clone(),
    }
}

/// Convert a `serialport` enumeration record.
pub fn from_serialport(info: serialport::SerialPortInfo) -> SerialPortInfo {
    let mut port = SerialPortInfo {
        port_type: classify_port(&info.port_name),
        port_name: info.port_name,
        manufacturer: None,
        product: None,
        vid: None,
        pid: None,
        serial_number: None,
        display_name: String::new(),
    };
    match info.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            port.port_type = PortType::UsbSerial;
            port.vid = Some(usb.vid);
            port.pid = Some(usb.pid);
            port.manufacturer = usb.manufacturer;
            port.product = usb.product;
            port.serial_number = usb.serial_number;
        }
        serialport::SerialPortType::PciPort => port.port_type = PortType::Pci,
        serialport::SerialPortType::BluetoothPort => port.port_type = PortType::Bluetooth,
        serialport::SerialPortType::Unknown => {}
    }
    port.display_name = generate_display_name(&port);
    port
}

/// Enumerate the system's serial ports, sorted by name. Enumeration
/// failures are logged and yield an empty list.
pub fn list_ports() -> Vec<SerialPortInfo> {
    match serialport::available_ports() {
        Ok(ports) => {
            let mut ports: Vec<_> = ports.into_iter().map(from_serialport).collect();
            ports.sort_by(|a, b| a.port_name.cmp(&b.port_name));
            ports
        }
        Err(e) => {
            log::warn!("Port enumeration failed: {}", e);
            Vec::new()
        }
    }
}
