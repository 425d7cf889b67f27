use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const FTDI_VENDOR_ID: u16 = 0x0403;
pub const FT245R_PRODUCT_ID: u16 = 0x6001;
pub const FT245R_PRODUCT_STRING: &str = "FT245R USB FIFO";
// The FT245R drives eight bitbang lines, hence eight relays.
const FT245R_PORTS: u8 = 8;

const SIO_SET_BITMODE: u8 = 0x0b;
const SIO_READ_PINS: u8 = 0x0c;
const BITMODE_BITBANG: u16 = 0x01;
const FTDI_INTERFACE: u16 = 1;
const IO_TIMEOUT: Duration = Duration::from_millis(500);

/// Faults raised by the device transport.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("malformed device response: {0}")]
    Protocol(&'static str),
}

/// Driver capability a relay board exposes to the interpreter. Ports are
/// numbered `min_port()..=max_port()`; a status of 0 means off, anything
/// else means on.
pub trait RelayDevice {
    fn id(&self) -> &str;
    fn min_port(&self) -> u8;
    fn max_port(&self) -> u8;
    fn status(&self, port: u8) -> Result<u8, DriverError>;
    fn switch_on(&mut self, port: u8) -> Result<(), DriverError>;
    fn switch_off(&mut self, port: u8) -> Result<(), DriverError>;
    fn detach_kernel_driver(&mut self) -> Result<(), DriverError>;
}

/// Devices in discovery order. Indices are only stable within one
/// invocation.
pub struct Registry<D> {
    devices: Vec<D>,
}

impl<D: RelayDevice> Registry<D> {
    pub fn new(devices: Vec<D>) -> Self {
        Self { devices }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&D> {
        self.devices.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut D> {
        self.devices.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.devices.iter()
    }

    pub fn position_by_id(&self, id: &str) -> Option<usize> {
        self.devices.iter().position(|device| device.id() == id)
    }
}

/// USB identity the enumerator treats as a relay board.
#[derive(Debug, Clone, Deserialize)]
pub struct Probe {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Extra product-string check, for boards on stock FTDI ids.
    pub product: Option<String>,
    /// Port count, at most the bitbang width.
    #[serde(default = "default_port_count")]
    pub ports: u8,
}

fn default_port_count() -> u8 {
    FT245R_PORTS
}

/// Probe table from `relctl.toml`, searched next to the executable.
/// A missing file or an empty table falls back to the FT245R builtin.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    probe: Vec<Probe>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            probe: vec![Probe {
                vendor_id: FTDI_VENDOR_ID,
                product_id: FT245R_PRODUCT_ID,
                product: Some(FT245R_PRODUCT_STRING.to_string()),
                ports: FT245R_PORTS,
            }],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid probe table {}", path.display()))
    }

    fn parse(raw: &str) -> Result<Self> {
        let config: Config = toml::from_str(raw)?;
        for probe in &config.probe {
            if !(1..=FT245R_PORTS).contains(&probe.ports) {
                bail!(
                    "probe {:04x}:{:04x}: ports must be within 1..={}, got {}",
                    probe.vendor_id,
                    probe.product_id,
                    FT245R_PORTS,
                    probe.ports
                );
            }
        }
        if config.probe.is_empty() {
            return Ok(Self::default());
        }
        Ok(config)
    }

    fn matches(&self, vendor_id: u16, product_id: u16) -> Option<&Probe> {
        self.probe
            .iter()
            .find(|probe| probe.vendor_id == vendor_id && probe.product_id == product_id)
    }
}

fn config_path() -> PathBuf {
    if cfg!(debug_assertions) {
        return PathBuf::from("relctl.toml");
    }
    match std::env::current_exe() {
        Ok(exe) => exe.with_file_name("relctl.toml"),
        Err(_) => PathBuf::from("relctl.toml"),
    }
}

/// FT245R-class board driven with vendor control requests in bitbang
/// mode. Relay `p` sits on pin `p - 1` of the bitbang byte.
pub struct FtdiRelay {
    handle: DeviceHandle<GlobalContext>,
    id: String,
    ports: u8,
}

impl FtdiRelay {
    fn read_pins(&self) -> Result<u8, DriverError> {
        let request_type =
            rusb::request_type(Direction::In, RequestType::Vendor, Recipient::Device);
        let mut pins = [0u8; 1];
        let read = self.handle.read_control(
            request_type,
            SIO_READ_PINS,
            0,
            FTDI_INTERFACE,
            &mut pins,
            IO_TIMEOUT,
        )?;
        if read != 1 {
            return Err(DriverError::Protocol("short pin-state response"));
        }
        Ok(pins[0])
    }

    fn write_pins(&self, pins: u8) -> Result<(), DriverError> {
        let request_type =
            rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);
        self.handle.write_control(
            request_type,
            SIO_SET_BITMODE,
            (BITMODE_BITBANG << 8) | u16::from(pins),
            FTDI_INTERFACE,
            &[],
            IO_TIMEOUT,
        )?;
        Ok(())
    }

    fn bit(port: u8) -> u8 {
        1 << (port - 1)
    }
}

impl RelayDevice for FtdiRelay {
    fn id(&self) -> &str {
        &self.id
    }

    fn min_port(&self) -> u8 {
        1
    }

    fn max_port(&self) -> u8 {
        self.ports
    }

    fn status(&self, port: u8) -> Result<u8, DriverError> {
        Ok((self.read_pins()? >> (port - 1)) & 1)
    }

    fn switch_on(&mut self, port: u8) -> Result<(), DriverError> {
        let pins = self.read_pins()?;
        self.write_pins(pins | Self::bit(port))
    }

    fn switch_off(&mut self, port: u8) -> Result<(), DriverError> {
        let pins = self.read_pins()?;
        self.write_pins(pins & !Self::bit(port))
    }

    fn detach_kernel_driver(&mut self) -> Result<(), DriverError> {
        // Nothing attached counts as done.
        match self.handle.detach_kernel_driver(0) {
            Ok(()) | Err(rusb::Error::NotFound) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Walks the USB bus and opens every device matching a probe entry.
/// Unreadable descriptors are skipped; a matching device that cannot be
/// opened (usually a permissions problem) is fatal.
pub fn discover(config: &Config) -> Result<Registry<FtdiRelay>> {
    let mut found = Vec::new();
    let devices = rusb::devices().context("failed to initialize USB transport")?;
    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
            Err(err) => {
                debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    error = %err,
                    "skipping device with unreadable descriptor"
                );
                continue;
            }
        };
        let Some(probe) = config.matches(descriptor.vendor_id(), descriptor.product_id()) else {
            continue;
        };
        let handle = device.open().with_context(|| {
            format!(
                "failed to open device {:04x}:{:04x} on bus {:03}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                device.bus_number()
            )
        })?;
        if let Some(expected) = &probe.product {
            match handle.read_product_string_ascii(&descriptor) {
                Ok(product) if product == *expected => {}
                Ok(product) => {
                    debug!(product = %product, "skipping device with unexpected product string");
                    continue;
                }
                Err(err) => {
                    debug!(error = %err, "skipping device with unreadable product string");
                    continue;
                }
            }
        }
        let id = handle
            .read_serial_number_string_ascii(&descriptor)
            .unwrap_or_else(|_| format!("{:03}:{:03}", device.bus_number(), device.address()));
        debug!(id = %id, ports = probe.ports, "registered relay board");
        found.push(FtdiRelay {
            handle,
            id,
            ports: probe.ports,
        });
    }
    Ok(Registry::new(found))
}

#[cfg(test)]
pub(crate) mod mock {
    use super::{DriverError, RelayDevice};

    /// Driver call recorded by [`MockDevice`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Call {
        On(u8),
        Off(u8),
        Detach,
    }

    /// In-memory stand-in for a relay board.
    pub struct MockDevice {
        pub id: String,
        pub min: u8,
        pub max: u8,
        pub pins: u8,
        pub calls: Vec<Call>,
        pub fail_switches: bool,
    }

    impl MockDevice {
        pub fn new(id: &str, min: u8, max: u8) -> Self {
            Self {
                id: id.to_string(),
                min,
                max,
                pins: 0,
                calls: Vec::new(),
                fail_switches: false,
            }
        }
    }

    impl RelayDevice for MockDevice {
        fn id(&self) -> &str {
            &self.id
        }

        fn min_port(&self) -> u8 {
            self.min
        }

        fn max_port(&self) -> u8 {
            self.max
        }

        fn status(&self, port: u8) -> Result<u8, DriverError> {
            Ok((self.pins >> (port - self.min)) & 1)
        }

        fn switch_on(&mut self, port: u8) -> Result<(), DriverError> {
            if self.fail_switches {
                return Err(DriverError::Protocol("mock switch failure"));
            }
            self.calls.push(Call::On(port));
            self.pins |= 1 << (port - self.min);
            Ok(())
        }

        fn switch_off(&mut self, port: u8) -> Result<(), DriverError> {
            if self.fail_switches {
                return Err(DriverError::Protocol("mock switch failure"));
            }
            self.calls.push(Call::Off(port));
            self.pins &= !(1 << (port - self.min));
            Ok(())
        }

        fn detach_kernel_driver(&mut self) -> Result<(), DriverError> {
            self.calls.push(Call::Detach);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;

    #[test]
    fn probe_table_parses_hex_ids() {
        let config = Config::parse(
            "[[probe]]\nvendor_id = 0x0403\nproduct_id = 0x6001\nproduct = \"FT245R USB FIFO\"\nports = 4\n",
        )
        .unwrap();
        let probe = config.matches(0x0403, 0x6001).unwrap();
        assert_eq!(probe.ports, 4);
        assert_eq!(probe.product.as_deref(), Some("FT245R USB FIFO"));
    }

    #[test]
    fn port_count_defaults_to_bitbang_width() {
        let config = Config::parse("[[probe]]\nvendor_id = 0x16c0\nproduct_id = 0x05df\n").unwrap();
        assert_eq!(config.probe[0].ports, 8);
        assert!(config.probe[0].product.is_none());
    }

    #[test]
    fn port_counts_beyond_the_bitbang_width_are_rejected() {
        let err = Config::parse("[[probe]]\nvendor_id = 0x0403\nproduct_id = 0x6001\nports = 16\n")
            .unwrap_err();
        assert!(err.to_string().contains("1..=8"));
        assert!(
            Config::parse("[[probe]]\nvendor_id = 0x0403\nproduct_id = 0x6001\nports = 0\n")
                .is_err()
        );
    }

    #[test]
    fn empty_table_falls_back_to_builtin_probe() {
        let config = Config::parse("").unwrap();
        assert!(config.matches(FTDI_VENDOR_ID, FT245R_PRODUCT_ID).is_some());
        assert!(config.matches(0x1234, 0x5678).is_none());
    }

    #[test]
    fn registry_resolves_ids_and_indices() {
        let registry = Registry::new(vec![
            MockDevice::new("A", 1, 8),
            MockDevice::new("B", 1, 4),
        ]);
        assert_eq!(registry.position_by_id("B"), Some(1));
        assert_eq!(registry.position_by_id("C"), None);
        assert_eq!(registry.get(0).map(|device| device.id()), Some("A"));
        assert!(registry.get(2).is_none());
    }
}
