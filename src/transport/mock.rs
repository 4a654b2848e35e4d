//! In-memory transport for tests and examples
//!
//! Backs the four register spaces with hash maps, scripts connect results,
//! and records every write, so protocol logic can be exercised without a
//! network or a serial line. Tests keep a [`MockHandle`] to the shared
//! state while the reader owns the transport itself.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{ModbusTransport, TransportError};

/// One recorded write operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockWrite {
    Coil {
        slave_address: i16,
        address: i32,
        value: bool,
    },
    Register {
        slave_address: i16,
        address: i32,
        value: u16,
    },
    Registers {
        slave_address: i16,
        address: i32,
        values: Vec<u16>,
    },
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    connect_attempts: u32,
    /// Scripted results for upcoming connect calls; empty means succeed
    connect_script: VecDeque<bool>,
    fail_reads: bool,
    fail_writes: bool,
    coils: HashMap<(i16, i32), bool>,
    discrete_inputs: HashMap<(i16, i32), bool>,
    holding_registers: HashMap<(i16, i32), u16>,
    input_registers: HashMap<(i16, i32), u16>,
    writes: Vec<MockWrite>,
}

/// Test-side view of a [`MockTransport`]'s shared state
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    /// Queue results for the next connect calls; once drained, connects
    /// succeed again
    pub fn script_connect<I: IntoIterator<Item = bool>>(&self, results: I) {
        self.state.lock().connect_script.extend(results);
    }

    /// Make every read fail until cleared
    pub fn set_fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    /// Make every write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Simulate a dropped link
    pub fn drop_connection(&self) {
        self.state.lock().connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state.lock().connect_attempts
    }

    pub fn set_coil(&self, slave_address: i16, address: i32, value: bool) {
        self.state
            .lock()
            .coils
            .insert((slave_address, address), value);
    }

    pub fn set_discrete_input(&self, slave_address: i16, address: i32, value: bool) {
        self.state
            .lock()
            .discrete_inputs
            .insert((slave_address, address), value);
    }

    pub fn set_holding_register(&self, slave_address: i16, address: i32, value: u16) {
        self.state
            .lock()
            .holding_registers
            .insert((slave_address, address), value);
    }

    pub fn set_input_register(&self, slave_address: i16, address: i32, value: u16) {
        self.state
            .lock()
            .input_registers
            .insert((slave_address, address), value);
    }

    pub fn holding_register(&self, slave_address: i16, address: i32) -> u16 {
        self.state
            .lock()
            .holding_registers
            .get(&(slave_address, address))
            .copied()
            .unwrap_or(0)
    }

    pub fn coil(&self, slave_address: i16, address: i32) -> bool {
        self.state
            .lock()
            .coils
            .get(&(slave_address, address))
            .copied()
            .unwrap_or(false)
    }

    /// Every write the transport has accepted, in order
    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }
}

/// In-memory [`ModbusTransport`] implementation
#[derive(Debug)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Shared handle for scripting and inspection from tests
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn check_read(state: &MockState) -> Result<(), TransportError> {
        if !state.connected {
            return Err(TransportError::ConnectionLost("not connected".to_string()));
        }
        if state.fail_reads {
            return Err(TransportError::RequestFailed(
                "read failure injected".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write(state: &MockState) -> Result<(), TransportError> {
        if !state.connected {
            return Err(TransportError::ConnectionLost("not connected".to_string()));
        }
        if state.fail_writes {
            return Err(TransportError::RequestFailed(
                "write failure injected".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModbusTransport for MockTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.connect_attempts += 1;
        let success = state.connect_script.pop_front().unwrap_or(true);
        if success {
            state.connected = true;
            debug!("mock transport connected");
            Ok(())
        } else {
            Err(TransportError::ConnectionFailed(
                "connect failure scripted".to_string(),
            ))
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.state.lock().connected = false;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_coils(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let state = self.state.lock();
        Self::check_read(&state)?;
        Ok((0..i32::from(count))
            .map(|offset| {
                state
                    .coils
                    .get(&(slave_address, address + offset))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn read_discrete_inputs(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<bool>, TransportError> {
        let state = self.state.lock();
        Self::check_read(&state)?;
        Ok((0..i32::from(count))
            .map(|offset| {
                state
                    .discrete_inputs
                    .get(&(slave_address, address + offset))
                    .copied()
                    .unwrap_or(false)
            })
            .collect())
    }

    async fn read_holding_register(
        &mut self,
        slave_address: i16,
        address: i32,
    ) -> Result<u16, TransportError> {
        let state = self.state.lock();
        Self::check_read(&state)?;
        Ok(state
            .holding_registers
            .get(&(slave_address, address))
            .copied()
            .unwrap_or(0))
    }

    async fn read_holding_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let state = self.state.lock();
        Self::check_read(&state)?;
        Ok((0..i32::from(count))
            .map(|offset| {
                state
                    .holding_registers
                    .get(&(slave_address, address + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn read_input_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let state = self.state.lock();
        Self::check_read(&state)?;
        Ok((0..i32::from(count))
            .map(|offset| {
                state
                    .input_registers
                    .get(&(slave_address, address + offset))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_coil(
        &mut self,
        slave_address: i16,
        address: i32,
        value: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_write(&state)?;
        state.coils.insert((slave_address, address), value);
        state.writes.push(MockWrite::Coil {
            slave_address,
            address,
            value,
        });
        Ok(())
    }

    async fn write_holding_register(
        &mut self,
        slave_address: i16,
        address: i32,
        value: u16,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_write(&state)?;
        state
            .holding_registers
            .insert((slave_address, address), value);
        state.writes.push(MockWrite::Register {
            slave_address,
            address,
            value,
        });
        Ok(())
    }

    async fn write_holding_registers(
        &mut self,
        slave_address: i16,
        address: i32,
        values: &[u16],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        Self::check_write(&state)?;
        for (offset, value) in values.iter().enumerate() {
            state
                .holding_registers
                .insert((slave_address, address + offset as i32), *value);
        }
        state.writes.push(MockWrite::Registers {
            slave_address,
            address,
            values: values.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_bank_round_trip() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        transport.connect().await.unwrap();

        handle.set_holding_register(1, 10, 0xBEEF);
        let words = transport.read_holding_registers(1, 9, 3).await.unwrap();
        assert_eq!(words, vec![0, 0xBEEF, 0]);

        transport.write_holding_register(1, 9, 7).await.unwrap();
        assert_eq!(handle.holding_register(1, 9), 7);
        assert_eq!(handle.writes().len(), 1);
    }

    #[tokio::test]
    async fn scripted_connects_fail_then_succeed() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        handle.script_connect([false, false, true]);

        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert!(transport.is_connected().await);
        assert_eq!(handle.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn reads_fail_when_disconnected_or_injected() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();
        assert!(transport.read_coils(1, 0, 1).await.is_err());

        transport.connect().await.unwrap();
        assert!(transport.read_coils(1, 0, 1).await.is_ok());

        handle.set_fail_reads(true);
        assert!(transport.read_coils(1, 0, 1).await.is_err());
        handle.set_fail_reads(false);
        assert!(transport.read_coils(1, 0, 1).await.is_ok());
    }
}
