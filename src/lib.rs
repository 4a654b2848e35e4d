//! # modbus-mapper
//!
//! Mapping-driven Modbus client engine for industrial data acquisition.
//!
//! Given a declarative set of typed register mappings spread across one or
//! more slave devices, the engine fuses contiguous mappings into the
//! minimal set of physical read requests, polls them continuously through
//! an abstract transport, decodes the raw 16-bit words into typed values,
//! fires change notifications after deadband and frequency filtering,
//! periodically rewrites watchdog-backed outputs, and mediates typed
//! writes back to the devices.
//!
//! The wire protocol itself is out of scope: a concrete TCP or serial RTU
//! client implements [`ModbusTransport`] and is handed to the
//! [`ModbusReader`]. An in-memory implementation ships under
//! [`transport::mock`] for tests.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use modbus_mapper::{
//!     MappingOptions, ModbusDevice, ModbusReader, RegisterKind, RegisterMapping,
//! };
//! use modbus_mapper::transport::mock::MockTransport;
//!
//! # #[tokio::main]
//! # async fn main() -> modbus_mapper::Result<()> {
//! let mappings = vec![
//!     RegisterMapping::new("temperature", RegisterKind::InputRegister, 100,
//!         MappingOptions::default())?,
//!     RegisterMapping::take_bit("alarm", RegisterKind::HoldingRegister, 4, 0,
//!         MappingOptions::default())?,
//! ];
//! let device = Arc::new(ModbusDevice::new("plc-1", 1, mappings)?);
//! device.set_on_change_bytes(Box::new(|device, handle, words| {
//!     let reference = device.with_mapping(handle, |m| m.reference().to_string());
//!     println!("{reference} changed: {words:?}");
//! }));
//!
//! let reader = ModbusReader::new(Box::new(MockTransport::new()), Duration::from_millis(500));
//! reader.add_device(Arc::clone(&device));
//! reader.start().await;
//! # Ok(())
//! # }
//! ```
//!
//! Change and status callbacks run synchronously on the owning device's
//! polling task and must not block.

pub mod codec;
pub mod device;
pub mod error;
pub mod group;
mod group_reader;
pub mod mapping;
pub mod reader;
pub mod transport;

pub use codec::Endian;
pub use device::{BoolChangeCallback, BytesChangeCallback, ModbusDevice, StatusCallback};
pub use error::{ModbusMapperError, Result};
pub use group::{ClaimKey, RegisterGroup};
pub use mapping::{
    MappingHandle, MappingOptions, OperationType, OutputType, RegisterKind, RegisterMapping,
    TypedValue, UNSET_SLAVE_ADDRESS,
};
pub use reader::ModbusReader;
pub use transport::{ModbusTransport, TransportError};
