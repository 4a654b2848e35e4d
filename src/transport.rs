//! Modbus transport boundary
//!
//! The engine never talks Modbus framing itself; it drives an abstract
//! [`ModbusTransport`] covering the four read spaces and the three write
//! shapes it needs. Concrete TCP or serial RTU clients implement this trait
//! outside the crate. The reader serializes all I/O through one transport
//! lock, so implementations see at most one in-flight operation.
//!
//! Every operation returning `Err` is treated as recoverable by the engine:
//! the failed group is skipped this cycle, the failed write invalidates its
//! mapping, and repeated failure escalates to the reconnect path.

pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// Transport layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped mid-operation
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Request was sent but not answered successfully
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Response did not arrive within the transport's response timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Malformed or unexpected response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Raw Modbus operations the engine consumes
///
/// Reads return the requested number of values or an error; they never
/// return short. The slave address accompanies every call so the transport
/// can address the right station of a multi-drop line.
#[async_trait]
pub trait ModbusTransport: Send + Sync + std::fmt::Debug {
    /// Establish the connection
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear the connection down
    ///
    /// Also called from `stop()` to make a blocked read return promptly.
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Whether the transport currently considers itself connected
    async fn is_connected(&self) -> bool;

    /// Read `count` coils starting at `address`
    async fn read_coils(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    /// Read `count` discrete inputs starting at `address`
    async fn read_discrete_inputs(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<bool>, TransportError>;

    /// Read a single holding register
    async fn read_holding_register(
        &mut self,
        slave_address: i16,
        address: i32,
    ) -> Result<u16, TransportError>;

    /// Read `count` holding registers starting at `address`
    async fn read_holding_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Read `count` input registers starting at `address`
    async fn read_input_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;

    /// Write a single coil
    async fn write_coil(
        &mut self,
        slave_address: i16,
        address: i32,
        value: bool,
    ) -> Result<(), TransportError>;

    /// Write a single holding register
    async fn write_holding_register(
        &mut self,
        slave_address: i16,
        address: i32,
        value: u16,
    ) -> Result<(), TransportError>;

    /// Write a run of holding registers starting at `address`
    async fn write_holding_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        values: &[u16],
    ) -> Result<(), TransportError>;
}
