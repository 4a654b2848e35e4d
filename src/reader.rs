//! Polling orchestrator
//!
//! One [`ModbusReader`] per transport. It owns the device registry, a
//! supervisor task handling connect/reconnect and status fan-out, and one
//! read task plus one rewrite task per device. All Modbus I/O funnels
//! through a single transport lock; user writes come in on the caller's
//! task through the write API and take the same lock.
//!
//! Shutdown is cooperative: every loop checks the shared run flag at least
//! once per sleep slice, and `stop()` disconnects the transport so a
//! blocked read returns promptly before the tasks are joined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::device::ModbusDevice;
use crate::error::{ModbusMapperError, Result};
use crate::group_reader;
use crate::mapping::{MappingHandle, OperationType, OutputType, RegisterKind, TypedValue};
use crate::transport::{ModbusTransport, TransportError};

/// Reconnect backoff schedule, clamped at the last tier
const RECONNECT_BACKOFF: [Duration; 10] = [
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(600),
    Duration::from_secs(1800),
    Duration::from_secs(3600),
];

/// Supervisor pacing between loop iterations
const SUPERVISOR_PACING: Duration = Duration::from_millis(100);
/// Rewrite task pacing between passes
const REWRITE_PACING: Duration = Duration::from_millis(1);
/// Trailing read-task pacing, mirroring the read loop's final yield
const READ_PACING: Duration = Duration::from_millis(1);
/// Slice length for shutdown-interruptible sleeps
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

struct StatusBook {
    active: HashMap<i16, bool>,
    reported: HashMap<i16, bool>,
}

struct ReaderInner {
    transport: tokio::sync::Mutex<Box<dyn ModbusTransport>>,
    devices: RwLock<HashMap<i16, Arc<ModbusDevice>>>,
    statuses: Mutex<StatusBook>,
    read_period: Duration,
    should_run: AtomicBool,
    should_reconnect: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Multi-device polling engine over one Modbus transport
pub struct ModbusReader {
    inner: Arc<ReaderInner>,
}

impl std::fmt::Debug for ModbusReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusReader")
            .field("devices", &self.inner.devices.read().len())
            .field("read_period", &self.inner.read_period)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ModbusReader {
    /// Create a reader over a transport, polling every `read_period`
    pub fn new(transport: Box<dyn ModbusTransport>, read_period: Duration) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                transport: tokio::sync::Mutex::new(transport),
                devices: RwLock::new(HashMap::new()),
                statuses: Mutex::new(StatusBook {
                    active: HashMap::new(),
                    reported: HashMap::new(),
                }),
                read_period,
                should_run: AtomicBool::new(false),
                should_reconnect: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a device; call before [`start`](Self::start)
    pub fn add_device(&self, device: Arc<ModbusDevice>) {
        let slave_address = device.slave_address();
        let mut devices = self.inner.devices.write();
        if devices.insert(slave_address, Arc::clone(&device)).is_some() {
            warn!(slave_address, "replacing device registered for this slave");
        }
        let mut statuses = self.inner.statuses.lock();
        statuses.active.insert(slave_address, false);
        statuses.reported.insert(slave_address, false);
        info!(device = device.name(), slave_address, "added device");
    }

    /// Register several devices at once
    pub fn add_devices(&self, devices: Vec<Arc<ModbusDevice>>) {
        for device in devices {
            self.add_device(device);
        }
    }

    /// Device registered for a slave address, if any
    pub fn device(&self, slave_address: i16) -> Option<Arc<ModbusDevice>> {
        self.inner.devices.read().get(&slave_address).cloned()
    }

    /// Snapshot of the per-slave active flags
    pub fn device_statuses(&self) -> HashMap<i16, bool> {
        self.inner.statuses.lock().active.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.should_run.load(Ordering::SeqCst)
    }

    /// Connect the transport and start the supervisor
    ///
    /// Idempotent; returns whether the reader is running. A failed initial
    /// connect leaves the reader stopped so the caller can retry.
    pub async fn start(&self) -> bool {
        if self.inner.should_run.swap(true, Ordering::SeqCst) {
            return true;
        }
        debug!("starting reader");
        let connected = {
            let mut transport = self.inner.transport.lock().await;
            if transport.is_connected().await {
                true
            } else {
                match transport.connect().await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(%err, "failed to start, connection could not be established");
                        false
                    }
                }
            }
        };
        if connected {
            let inner = Arc::clone(&self.inner);
            self.inner.tasks.lock().push(tokio::spawn(supervisor(inner)));
            debug!("reader started");
        } else {
            self.inner.should_run.store(false, Ordering::SeqCst);
        }
        connected
    }

    /// Stop every task and disconnect the transport
    ///
    /// Idempotent; returns once the supervisor and all per-device tasks
    /// have been joined.
    pub async fn stop(&self) {
        if !self.inner.should_run.swap(false, Ordering::SeqCst) {
            return;
        }
        debug!("stopping reader");
        {
            let mut transport = self.inner.transport.lock().await;
            if transport.is_connected().await {
                let _ = transport.disconnect().await;
            }
        }
        let handles: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        debug!("reader stopped");
    }

    /// Write raw register words to a holding-register mapping
    ///
    /// Precondition violations (wrong kind, wrong word count, unregistered
    /// slave) are programmer errors; a transport failure invalidates the
    /// mapping and returns `Ok(false)`. On success the local cache is
    /// refreshed only when the mapping opted into `auto_local_update`.
    pub async fn write_registers(
        &self,
        device: &ModbusDevice,
        handle: MappingHandle,
        values: &[u16],
    ) -> Result<bool> {
        let auto_update = {
            self.check_registered(device, handle)?;
            device.with_mapping(handle, |m| m.auto_local_update())
        };
        self.write_words_internal(device, handle, values, auto_update)
            .await
    }

    async fn write_words_internal(
        &self,
        device: &ModbusDevice,
        handle: MappingHandle,
        values: &[u16],
        update_on_success: bool,
    ) -> Result<bool> {
        let (kind, operation, slave_address, address, count, reference) =
            device.with_mapping(handle, |m| {
                (
                    m.kind(),
                    m.operation(),
                    m.slave_address(),
                    m.starting_address(),
                    m.register_count(),
                    m.reference().to_string(),
                )
            });
        if kind != RegisterKind::HoldingRegister {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "cannot write register words to {kind} mapping '{reference}'"
            )));
        }
        if operation == OperationType::TakeBit {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{reference}' takes a single bit, write it through write_bit"
            )));
        }
        if values.len() != count {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{reference}' takes {count} register words, got {}",
                values.len()
            )));
        }

        let written = {
            let mut transport = self.inner.transport.lock().await;
            if count == 1 {
                transport
                    .write_holding_register(slave_address, address, values[0])
                    .await
            } else {
                transport
                    .write_holding_registers(slave_address, address, values)
                    .await
            }
        };
        match written {
            Ok(()) => {
                trace!(reference = %reference, "written value for mapping");
                if update_on_success {
                    let mut mapping = device.mapping(handle).lock();
                    let _ = mapping.update_words(values)?;
                }
                Ok(true)
            }
            Err(err) => {
                warn!(reference = %reference, address, %err, "unable to write holding register values");
                device.mapping(handle).lock().set_valid(false);
                Ok(false)
            }
        }
    }

    /// Write a bool to a coil mapping
    pub async fn write_coil(
        &self,
        device: &ModbusDevice,
        handle: MappingHandle,
        value: bool,
    ) -> Result<bool> {
        self.check_registered(device, handle)?;
        let (kind, slave_address, address, reference) = device.with_mapping(handle, |m| {
            (
                m.kind(),
                m.slave_address(),
                m.starting_address(),
                m.reference().to_string(),
            )
        });
        if kind != RegisterKind::Coil {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "cannot write a bool to {kind} mapping '{reference}'"
            )));
        }
        let written = {
            let mut transport = self.inner.transport.lock().await;
            transport.write_coil(slave_address, address, value).await
        };
        match written {
            Ok(()) => {
                trace!(reference = %reference, "written value for mapping");
                device.mapping(handle).lock().update_bool(value);
                Ok(true)
            }
            Err(err) => {
                warn!(reference = %reference, address, value, %err, "unable to write coil value");
                device.mapping(handle).lock().set_valid(false);
                Ok(false)
            }
        }
    }

    /// Write one bit of a holding register through a read-modify-write
    ///
    /// Holds the transport lock across the read and the write so no other
    /// operation interleaves. If the bit already carries the desired value
    /// nothing is written.
    pub async fn write_bit(
        &self,
        device: &ModbusDevice,
        handle: MappingHandle,
        value: bool,
    ) -> Result<bool> {
        self.check_registered(device, handle)?;
        let (kind, operation, bit_index, slave_address, address, reference) =
            device.with_mapping(handle, |m| {
                (
                    m.kind(),
                    m.operation(),
                    m.bit_index(),
                    m.slave_address(),
                    m.starting_address(),
                    m.reference().to_string(),
                )
            });
        if kind != RegisterKind::HoldingRegister {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "cannot write a bit to {kind} mapping '{reference}'"
            )));
        }
        let (OperationType::TakeBit, Some(bit)) = (operation, bit_index) else {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{reference}' is not a TAKE_BIT mapping"
            )));
        };

        let outcome = {
            let mut transport = self.inner.transport.lock().await;
            write_bit_through(transport.as_mut(), slave_address, address, bit, value).await
        };
        match outcome {
            Ok(written) => {
                if written {
                    device.mapping(handle).lock().update_bool(value);
                }
                Ok(true)
            }
            Err(err) => {
                warn!(reference = %reference, address, bit, %err, "unable to write register bit");
                device.mapping(handle).lock().set_valid(false);
                Ok(false)
            }
        }
    }

    /// Write a typed value, encoding it per the mapping's operation
    ///
    /// Dispatches on the value tag: bools go to the coil or bit path,
    /// numerics and strings are encoded into register words and written as
    /// a run. Register-valued typed writes refresh the local cache on
    /// success. A value whose tag does not match the mapping's output type
    /// is a programmer error.
    pub async fn write_typed(
        &self,
        device: &ModbusDevice,
        handle: MappingHandle,
        value: TypedValue,
    ) -> Result<bool> {
        self.check_registered(device, handle)?;
        let (output_type, operation, count, reference) = device.with_mapping(handle, |m| {
            (
                m.output_type(),
                m.operation(),
                m.register_count(),
                m.reference().to_string(),
            )
        });
        let endian = operation.endian().unwrap_or(codec::Endian::Big);
        let words: Vec<u16> = match (&value, output_type) {
            (TypedValue::Bool(v), OutputType::Bool) => {
                return if operation == OperationType::TakeBit {
                    self.write_bit(device, handle, *v).await
                } else {
                    self.write_coil(device, handle, *v).await
                };
            }
            (TypedValue::U16(v), OutputType::U16) => vec![*v],
            (TypedValue::I16(v), OutputType::I16) => vec![codec::i16_to_u16(*v)],
            (TypedValue::U32(v), OutputType::U32) => codec::u32_to_registers(*v, endian).to_vec(),
            (TypedValue::I32(v), OutputType::I32) => codec::i32_to_registers(*v, endian).to_vec(),
            (TypedValue::F32(v), OutputType::F32) => codec::f32_to_registers(*v, endian).to_vec(),
            (TypedValue::Text(text), OutputType::String) => {
                encode_text(text, operation, count, &reference)?
            }
            _ => {
                return Err(ModbusMapperError::InvalidArgument(format!(
                    "value {value} does not match output type {output_type} of mapping '{reference}'"
                )));
            }
        };
        self.write_words_internal(device, handle, &words, true).await
    }

    fn check_registered(&self, device: &ModbusDevice, handle: MappingHandle) -> Result<()> {
        if !device.owns(handle) {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping handle {} was not issued by device '{}'",
                handle.index(),
                device.name()
            )));
        }
        if !self
            .inner
            .devices
            .read()
            .contains_key(&device.slave_address())
        {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "slave address {} is not registered with this reader",
                device.slave_address()
            )));
        }
        Ok(())
    }
}

/// Encode a string into the full register span of a mapping
fn encode_text(
    text: &str,
    operation: OperationType,
    register_count: usize,
    reference: &str,
) -> Result<Vec<u16>> {
    let endian = operation.endian().unwrap_or(codec::Endian::Big);
    let mut padded = text.to_string();
    // Two characters per register word; parity is on characters, which for
    // the ASCII and Latin-1 encodings is one byte each.
    if padded.chars().count() % 2 != 0 {
        padded.push('\0');
    }
    let mut words = match operation {
        OperationType::StringifyAsciiBigEndian | OperationType::StringifyAsciiLittleEndian => {
            codec::ascii_string_to_registers(&padded, endian)?
        }
        OperationType::StringifyUnicodeBigEndian | OperationType::StringifyUnicodeLittleEndian => {
            codec::unicode_string_to_registers(&padded, endian)?
        }
        _ => {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{reference}' is not a string mapping"
            )));
        }
    };
    if words.len() > register_count {
        return Err(ModbusMapperError::InvalidArgument(format!(
            "string does not fit mapping '{reference}': {} bytes into {} registers",
            text.len(),
            register_count * 2
        )));
    }
    words.resize(register_count, 0);
    Ok(words)
}

/// Flip one bit of a holding register in place
///
/// Returns whether a write was issued; reading a bit that already matches
/// issues none.
async fn write_bit_through(
    transport: &mut dyn ModbusTransport,
    slave_address: i16,
    address: i32,
    bit: u8,
    value: bool,
) -> std::result::Result<bool, TransportError> {
    let current = transport.read_holding_register(slave_address, address).await?;
    let next = if value {
        current | (1 << bit)
    } else {
        current & !(1 << bit)
    };
    if next == current {
        return Ok(false);
    }
    transport
        .write_holding_register(slave_address, address, next)
        .await?;
    Ok(true)
}

/// Sleep in short slices so shutdown interrupts long waits
async fn sleep_while_running(inner: &ReaderInner, duration: Duration) {
    let mut remaining = duration;
    while !remaining.is_zero() && inner.should_run.load(Ordering::SeqCst) {
        let slice = remaining.min(SHUTDOWN_POLL);
        tokio::time::sleep(slice).await;
        remaining = remaining.saturating_sub(slice);
    }
}

fn registered_devices(inner: &ReaderInner) -> Vec<Arc<ModbusDevice>> {
    inner.devices.read().values().cloned().collect()
}

/// Flip every device to `status`, firing callbacks under the reported-once
/// idempotence rule
fn mark_all_devices(inner: &ReaderInner, status: bool) {
    let devices = registered_devices(inner);
    let mut to_fire = Vec::new();
    {
        let mut book = inner.statuses.lock();
        for device in &devices {
            let slave_address = device.slave_address();
            let previous = book.active.get(&slave_address).copied().unwrap_or(false);
            let reported = book.reported.get(&slave_address).copied().unwrap_or(false);
            book.active.insert(slave_address, status);
            if previous != status || !reported {
                book.reported.insert(slave_address, true);
                to_fire.push(Arc::clone(device));
            }
        }
    }
    for device in to_fire {
        info!(device = device.name(), status, "device status");
        device.trigger_on_status(status);
    }
}

/// Record one device's cycle status, firing its callback when the status
/// transitions or was never reported
fn report_device_status(inner: &ReaderInner, device: &Arc<ModbusDevice>, status: bool) {
    let fire = {
        let mut book = inner.statuses.lock();
        let slave_address = device.slave_address();
        let previous = book.active.get(&slave_address).copied().unwrap_or(false);
        let reported = book.reported.get(&slave_address).copied().unwrap_or(false);
        book.active.insert(slave_address, status);
        if previous != status || !reported {
            book.reported.insert(slave_address, true);
            true
        } else {
            false
        }
    };
    if fire {
        info!(device = device.name(), status, "device status");
        device.trigger_on_status(status);
    }
}

fn spawn_device_tasks(inner: &Arc<ReaderInner>) {
    let devices = registered_devices(inner);
    let mut handles = Vec::with_capacity(devices.len() * 2);
    {
        let mut book = inner.statuses.lock();
        for device in &devices {
            book.active.insert(device.slave_address(), true);
        }
    }
    for device in devices {
        handles.push(tokio::spawn(read_device(
            Arc::clone(inner),
            Arc::clone(&device),
        )));
        handles.push(tokio::spawn(rewrite_device(Arc::clone(inner), device)));
    }
    inner.tasks.lock().extend(handles);
}

/// Supervisor loop: connect management and reconnect status fan-out
async fn supervisor(inner: Arc<ReaderInner>) {
    let mut tasks_spawned = false;
    let mut backoff_index = 0usize;

    while inner.should_run.load(Ordering::SeqCst) {
        if inner.should_reconnect.load(Ordering::SeqCst) {
            info!("attempting to reconnect");
            mark_all_devices(&inner, false);
            {
                let mut transport = inner.transport.lock().await;
                let _ = transport.disconnect().await;
            }
            while inner.should_run.load(Ordering::SeqCst) {
                let connected = inner.transport.lock().await.connect().await.is_ok();
                if connected {
                    break;
                }
                let delay = RECONNECT_BACKOFF[backoff_index];
                warn!(?delay, "connection attempt failed, backing off");
                sleep_while_running(&inner, delay).await;
                if backoff_index < RECONNECT_BACKOFF.len() - 1 {
                    backoff_index += 1;
                }
            }
            if !inner.should_run.load(Ordering::SeqCst) {
                break;
            }
            backoff_index = 0;
            mark_all_devices(&inner, true);
            inner.should_reconnect.store(false, Ordering::SeqCst);
        } else {
            let connected = inner.transport.lock().await.is_connected().await;
            if connected {
                if !tasks_spawned {
                    spawn_device_tasks(&inner);
                    tasks_spawned = true;
                }
                sleep_while_running(&inner, inner.read_period).await;

                let any_active = inner.statuses.lock().active.values().any(|&active| active);
                if !any_active {
                    warn!("no devices have been read successfully, reconnecting");
                    inner.should_reconnect.store(true, Ordering::SeqCst);
                }
            } else {
                inner.should_reconnect.store(true, Ordering::SeqCst);
            }
            sleep_while_running(&inner, SUPERVISOR_PACING).await;
        }
    }
}

/// Per-device poll loop
async fn read_device(inner: Arc<ReaderInner>, device: Arc<ModbusDevice>) {
    while inner.should_run.load(Ordering::SeqCst) {
        let cycle_start = Instant::now();

        if device.groups().is_empty() {
            warn!(device = device.name(), "device has no mappings, stopping its read task");
            return;
        }
        trace!(device = device.name(), "reading device");

        let mut unread_groups = 0usize;
        for group in device.groups() {
            let read_ok = {
                let mut transport = inner.transport.lock().await;
                group_reader::read_group(transport.as_mut(), &device, group).await
            };
            if !read_ok {
                warn!(
                    device = device.name(),
                    starting_address = group.starting_address(),
                    slave_address = group.slave_address(),
                    "group had an error while reading"
                );
                unread_groups += 1;
            }
        }

        // The device counts as online if at least one group went through.
        let status = unread_groups != device.groups().len();
        report_device_status(&inner, &device, status);

        let elapsed = cycle_start.elapsed();
        if elapsed >= inner.read_period {
            warn!(
                device = device.name(),
                ?elapsed,
                "read cycle took longer than the read period, skipping sleep"
            );
        } else {
            sleep_while_running(&inner, inner.read_period - elapsed).await;
        }
        sleep_while_running(&inner, READ_PACING).await;
    }
}

/// Per-device rewrite loop: re-issues cached values whose rewrite period
/// has lapsed
async fn rewrite_device(inner: Arc<ReaderInner>, device: Arc<ModbusDevice>) {
    while inner.should_run.load(Ordering::SeqCst) {
        let rewritable = device.rewritable();
        if rewritable.is_empty() {
            warn!(
                device = device.name(),
                "device has no rewritable mappings, stopping its rewrite task"
            );
            return;
        }

        let mut required = 0u64;
        let mut succeeded = 0u64;

        for handle in rewritable {
            let snapshot = device.with_mapping(handle, |m| RewriteSnapshot {
                reference: m.reference().to_string(),
                kind: m.kind(),
                operation: m.operation(),
                bit_index: m.bit_index(),
                slave_address: m.slave_address(),
                address: m.starting_address(),
                bool_value: m.bool_value(),
                words: m.word_values().to_vec(),
                period: m.repeated_write(),
                due: m.is_initialized()
                    && !m.repeated_write().is_zero()
                    && m.last_update()
                        .map_or(true, |last| last.elapsed() > m.repeated_write()),
            });
            if snapshot.period.is_zero() || !snapshot.due {
                continue;
            }
            required += 1;

            let written = {
                let mut transport = inner.transport.lock().await;
                match snapshot.kind {
                    RegisterKind::Coil => transport
                        .write_coil(snapshot.slave_address, snapshot.address, snapshot.bool_value)
                        .await
                        .is_ok(),
                    RegisterKind::HoldingRegister => {
                        if snapshot.operation == OperationType::TakeBit {
                            match snapshot.bit_index {
                                Some(bit) => write_bit_through(
                                    transport.as_mut(),
                                    snapshot.slave_address,
                                    snapshot.address,
                                    bit,
                                    snapshot.bool_value,
                                )
                                .await
                                .is_ok(),
                                None => false,
                            }
                        } else if snapshot.words.len() == 1 {
                            transport
                                .write_holding_register(
                                    snapshot.slave_address,
                                    snapshot.address,
                                    snapshot.words[0],
                                )
                                .await
                                .is_ok()
                        } else {
                            transport
                                .write_holding_registers(
                                    snapshot.slave_address,
                                    snapshot.address,
                                    &snapshot.words,
                                )
                                .await
                                .is_ok()
                        }
                    }
                    _ => false,
                }
            };

            if written {
                succeeded += 1;
                let mut mapping = device.mapping(handle).lock();
                if snapshot.kind == RegisterKind::Coil
                    || snapshot.operation == OperationType::TakeBit
                {
                    let value = mapping.bool_value();
                    mapping.update_bool(value);
                } else {
                    let words = mapping.word_values().to_vec();
                    let _ = mapping.update_words(&words);
                }
                debug!(reference = %snapshot.reference, "successfully rewrote mapping");
            } else {
                warn!(reference = %snapshot.reference, "failed to rewrite mapping");
            }
        }

        if required > 0 {
            report_device_status(&inner, &device, succeeded > 0);
        }
        sleep_while_running(&inner, REWRITE_PACING).await;
    }
}

struct RewriteSnapshot {
    reference: String,
    kind: RegisterKind,
    operation: OperationType,
    bit_index: Option<u8>,
    slave_address: i16,
    address: i32,
    bool_value: bool,
    words: Vec<u16>,
    period: Duration,
    due: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingOptions, RegisterMapping};
    use crate::transport::mock::MockTransport;

    fn holding_device(slave_address: i16) -> Arc<ModbusDevice> {
        Arc::new(
            ModbusDevice::new(
                "plc",
                slave_address,
                vec![RegisterMapping::new(
                    "H0",
                    RegisterKind::HoldingRegister,
                    0,
                    MappingOptions::default(),
                )
                .unwrap()],
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn write_checks_the_register_kind() {
        let transport = MockTransport::new();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));
        let device = holding_device(1);
        reader.add_device(Arc::clone(&device));

        let handle = device.mapping_handle("H0").unwrap();
        let err = reader.write_coil(&device, handle, true).await;
        assert!(matches!(err, Err(ModbusMapperError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn write_checks_the_word_count() {
        let transport = MockTransport::new();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));
        let device = holding_device(1);
        reader.add_device(Arc::clone(&device));

        let handle = device.mapping_handle("H0").unwrap();
        let err = reader.write_registers(&device, handle, &[1, 2]).await;
        assert!(matches!(err, Err(ModbusMapperError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn write_to_unregistered_slave_is_rejected() {
        let transport = MockTransport::new();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));
        let device = holding_device(9);

        let handle = device.mapping_handle("H0").unwrap();
        let err = reader.write_registers(&device, handle, &[1]).await;
        assert!(matches!(err, Err(ModbusMapperError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn failed_write_invalidates_the_mapping() {
        let transport = MockTransport::new();
        let mock = transport.handle();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));
        let device = holding_device(1);
        reader.add_device(Arc::clone(&device));
        let handle = device.mapping_handle("H0").unwrap();

        // Never connected, so the write fails operationally.
        mock.set_fail_writes(true);
        let written = reader.write_registers(&device, handle, &[7]).await.unwrap();
        assert!(!written);
        assert!(!device.with_mapping(handle, |m| m.is_valid()));
    }

    #[tokio::test]
    async fn successful_write_honors_auto_local_update() {
        let mut transport = MockTransport::new();
        let mock = transport.handle();
        transport.connect().await.unwrap();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));

        let device = Arc::new(
            ModbusDevice::new(
                "plc",
                1,
                vec![
                    RegisterMapping::new(
                        "PLAIN",
                        RegisterKind::HoldingRegister,
                        0,
                        MappingOptions::default(),
                    )
                    .unwrap(),
                    RegisterMapping::new(
                        "AUTO",
                        RegisterKind::HoldingRegister,
                        1,
                        MappingOptions {
                            auto_local_update: true,
                            ..Default::default()
                        },
                    )
                    .unwrap(),
                ],
            )
            .unwrap(),
        );
        reader.add_device(Arc::clone(&device));

        let plain = device.mapping_handle("PLAIN").unwrap();
        assert!(reader.write_registers(&device, plain, &[5]).await.unwrap());
        assert!(!device.with_mapping(plain, |m| m.is_initialized()));
        assert_eq!(mock.holding_register(1, 0), 5);

        let auto = device.mapping_handle("AUTO").unwrap();
        assert!(reader.write_registers(&device, auto, &[6]).await.unwrap());
        assert_eq!(
            device.with_mapping(auto, |m| m.word_values().to_vec()),
            vec![6]
        );
    }

    #[tokio::test]
    async fn bit_write_reads_modifies_and_writes() {
        let mut transport = MockTransport::new();
        let mock = transport.handle();
        transport.connect().await.unwrap();
        mock.set_holding_register(1, 4, 0b0100);
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));

        let device = Arc::new(
            ModbusDevice::new(
                "plc",
                1,
                vec![RegisterMapping::take_bit(
                    "B4-0",
                    RegisterKind::HoldingRegister,
                    4,
                    0,
                    MappingOptions::default(),
                )
                .unwrap()],
            )
            .unwrap(),
        );
        reader.add_device(Arc::clone(&device));
        let handle = device.mapping_handle("B4-0").unwrap();

        assert!(reader.write_bit(&device, handle, true).await.unwrap());
        // Other bits survive the read-modify-write.
        assert_eq!(mock.holding_register(1, 4), 0b0101);
        assert!(device.with_mapping(handle, |m| m.bool_value()));

        // Writing the same value issues no second register write.
        mock.clear_writes();
        assert!(reader.write_bit(&device, handle, true).await.unwrap());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn typed_write_encodes_and_updates() {
        let mut transport = MockTransport::new();
        let mock = transport.handle();
        transport.connect().await.unwrap();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));

        let device = Arc::new(
            ModbusDevice::new(
                "plc",
                1,
                vec![RegisterMapping::merged(
                    "U32",
                    RegisterKind::HoldingRegister,
                    vec![0, 1],
                    OutputType::U32,
                    OperationType::MergeBigEndian,
                    MappingOptions::default(),
                )
                .unwrap()],
            )
            .unwrap(),
        );
        reader.add_device(Arc::clone(&device));
        let handle = device.mapping_handle("U32").unwrap();

        assert!(reader
            .write_typed(&device, handle, TypedValue::U32(0x1234_5678))
            .await
            .unwrap());
        assert_eq!(mock.holding_register(1, 0), 0x1234);
        assert_eq!(mock.holding_register(1, 1), 0x5678);
        assert_eq!(
            device.with_mapping(handle, |m| m.typed_value().cloned()),
            Some(TypedValue::U32(0x1234_5678))
        );

        let mismatch = reader
            .write_typed(&device, handle, TypedValue::Bool(true))
            .await;
        assert!(matches!(
            mismatch,
            Err(ModbusMapperError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn typed_string_write_pads_the_span() {
        let mut transport = MockTransport::new();
        let mock = transport.handle();
        transport.connect().await.unwrap();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));

        let device = Arc::new(
            ModbusDevice::new(
                "plc",
                1,
                vec![RegisterMapping::merged(
                    "NAME",
                    RegisterKind::HoldingRegister,
                    vec![0, 1, 2],
                    OutputType::String,
                    OperationType::StringifyAsciiBigEndian,
                    MappingOptions::default(),
                )
                .unwrap()],
            )
            .unwrap(),
        );
        reader.add_device(Arc::clone(&device));
        let handle = device.mapping_handle("NAME").unwrap();

        assert!(reader
            .write_typed(&device, handle, TypedValue::Text("Hello".to_string()))
            .await
            .unwrap());
        assert_eq!(mock.holding_register(1, 0), 0x4865);
        assert_eq!(mock.holding_register(1, 1), 0x6C6C);
        assert_eq!(mock.holding_register(1, 2), 0x6F00);

        let too_long = reader
            .write_typed(&device, handle, TypedValue::Text("much too long".to_string()))
            .await;
        assert!(matches!(too_long, Err(ModbusMapperError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_joins() {
        let transport = MockTransport::new();
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));
        reader.add_device(holding_device(1));

        assert!(reader.start().await);
        assert!(reader.is_running());
        assert!(reader.start().await);

        reader.stop().await;
        assert!(!reader.is_running());
        // A second stop is a no-op.
        reader.stop().await;
    }

    #[tokio::test]
    async fn failed_initial_connect_leaves_the_reader_stopped() {
        let transport = MockTransport::new();
        transport.handle().script_connect([false]);
        let reader = ModbusReader::new(Box::new(transport), Duration::from_millis(10));

        assert!(!reader.start().await);
        assert!(!reader.is_running());
    }
}
