//! Slave devices
//!
//! A [`ModbusDevice`] owns the mappings laid over one slave, the groups the
//! grouping pass fuses them into, the list of mappings that want periodic
//! rewrites, and the three callback slots. Mappings live in an arena of
//! per-mapping locks; everything else refers to them through
//! [`MappingHandle`] indices, so there are no back-pointers between
//! devices, groups and mappings.
//!
//! Callback contract: change and status callbacks run synchronously on the
//! device's read task (or on its rewrite task for status flips caused by
//! rewrites). Callback code must not block — it stalls the polling cycle of
//! this device if it does.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{ModbusMapperError, Result};
use crate::group::RegisterGroup;
use crate::mapping::{MappingHandle, RegisterKind, RegisterMapping};

/// Change callback for word-valued mappings
pub type BytesChangeCallback = Box<dyn Fn(&ModbusDevice, MappingHandle, &[u16]) + Send + Sync>;
/// Change callback for bool-valued mappings
pub type BoolChangeCallback = Box<dyn Fn(&ModbusDevice, MappingHandle, bool) + Send + Sync>;
/// Online/offline transition callback
pub type StatusCallback = Box<dyn Fn(&ModbusDevice, bool) + Send + Sync>;

/// One Modbus slave and the mappings laid over it
pub struct ModbusDevice {
    name: String,
    slave_address: i16,
    online: AtomicBool,
    mappings: Vec<Mutex<RegisterMapping>>,
    groups: Vec<RegisterGroup>,
    rewrite_list: Mutex<Vec<MappingHandle>>,
    on_change_bytes: RwLock<Option<BytesChangeCallback>>,
    on_change_bool: RwLock<Option<BoolChangeCallback>>,
    on_status: RwLock<Option<StatusCallback>>,
}

impl std::fmt::Debug for ModbusDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusDevice")
            .field("name", &self.name)
            .field("slave_address", &self.slave_address)
            .field("online", &self.online.load(Ordering::Relaxed))
            .field("mappings", &self.mappings.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl ModbusDevice {
    /// Build a device around its full mapping set
    ///
    /// Attaches the slave address to every mapping, then runs the grouping
    /// pass: mappings are sorted into a total order (kind, start address,
    /// register count, output type, bit index) and folded left to right
    /// into contiguous groups. Read-restricted mappings aggregate into one
    /// group per register kind regardless of contiguity, because they never
    /// participate in a read. Mappings with a rewrite period land on the
    /// rewrite list.
    ///
    /// The group set is immutable afterwards; mappings cannot be added to a
    /// running device.
    pub fn new(
        name: impl Into<String>,
        slave_address: i16,
        mut mappings: Vec<RegisterMapping>,
    ) -> Result<Self> {
        let name = name.into();

        let mut references = HashSet::new();
        for mapping in &mappings {
            if !references.insert(mapping.reference().to_string()) {
                return Err(ModbusMapperError::InvalidConfiguration(format!(
                    "device '{name}' has duplicate mapping reference '{}'",
                    mapping.reference()
                )));
            }
        }
        for mapping in &mut mappings {
            mapping.set_slave_address(slave_address);
        }

        let mut order: Vec<usize> = (0..mappings.len()).collect();
        order.sort_by_key(|&index| {
            let m = &mappings[index];
            (
                m.kind(),
                m.starting_address(),
                m.register_count(),
                m.output_type(),
                m.bit_index(),
            )
        });

        let mut groups: Vec<RegisterGroup> = Vec::new();
        let mut rewrite_list = Vec::new();
        let mut restricted_groups: HashMap<RegisterKind, usize> = HashMap::new();
        let mut current_group: Option<usize> = None;

        for index in order {
            let mapping = &mappings[index];
            let handle = MappingHandle(index);

            if !mapping.repeated_write().is_zero() {
                rewrite_list.push(handle);
            }

            if mapping.is_read_restricted() {
                match restricted_groups.get(&mapping.kind()).copied() {
                    Some(group_index) => groups[group_index].append_restricted(mapping, handle),
                    None => {
                        groups.push(RegisterGroup::seed(mapping, handle));
                        restricted_groups.insert(mapping.kind(), groups.len() - 1);
                    }
                }
                continue;
            }

            let joined = current_group.is_some_and(|group_index| {
                groups[group_index].kind() == mapping.kind()
                    && groups[group_index].add_mapping(mapping, handle)
            });
            if !joined {
                groups.push(RegisterGroup::seed(mapping, handle));
                current_group = Some(groups.len() - 1);
            }
        }

        debug!(
            device = %name,
            groups = groups.len(),
            mappings = mappings.len(),
            "created register groups"
        );

        Ok(Self {
            name,
            slave_address,
            online: AtomicBool::new(false),
            mappings: mappings.into_iter().map(Mutex::new).collect(),
            groups,
            rewrite_list: Mutex::new(rewrite_list),
            on_change_bytes: RwLock::new(None),
            on_change_bool: RwLock::new(None),
            on_status: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slave_address(&self) -> i16 {
        self.slave_address
    }

    /// Whether the last poll or rewrite cycle reached the device
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Groups in grouping order
    pub fn groups(&self) -> &[RegisterGroup] {
        &self.groups
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Handles of every mapping, in arena order
    pub fn handles(&self) -> impl Iterator<Item = MappingHandle> + '_ {
        (0..self.mappings.len()).map(MappingHandle)
    }

    /// Look a mapping up by its unique reference
    pub fn mapping_handle(&self, reference: &str) -> Option<MappingHandle> {
        self.mappings
            .iter()
            .position(|mapping| mapping.lock().reference() == reference)
            .map(MappingHandle)
    }

    /// Whether the handle was issued by this device
    pub fn owns(&self, handle: MappingHandle) -> bool {
        handle.0 < self.mappings.len()
    }

    pub(crate) fn mapping(&self, handle: MappingHandle) -> &Mutex<RegisterMapping> {
        &self.mappings[handle.0]
    }

    /// Read a mapping's state under its lock
    ///
    /// Panics if the handle was issued by a different device.
    pub fn with_mapping<R>(
        &self,
        handle: MappingHandle,
        f: impl FnOnce(&RegisterMapping) -> R,
    ) -> R {
        f(&self.mappings[handle.0].lock())
    }

    /// Change a mapping's rewrite period
    ///
    /// Transitions between zero and non-zero add the mapping to or remove
    /// it from the rewrite list under the device's rewrite lock.
    pub fn set_repeated_write(&self, handle: MappingHandle, period: Duration) -> Result<()> {
        let mut mapping = self.mappings[handle.0].lock();
        if !period.is_zero() && !mapping.kind().is_writable() {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{}' cannot repeat writes on read-only kind {}",
                mapping.reference(),
                mapping.kind()
            )));
        }
        let previous = mapping.repeated_write();
        if previous.is_zero() && !period.is_zero() {
            let mut list = self.rewrite_list.lock();
            if !list.contains(&handle) {
                list.push(handle);
            }
        } else if !previous.is_zero() && period.is_zero() {
            self.rewrite_list.lock().retain(|&entry| entry != handle);
        }
        mapping.set_repeated_write_raw(period);
        Ok(())
    }

    /// Snapshot of the mappings wanting periodic rewrites
    pub fn rewritable(&self) -> Vec<MappingHandle> {
        self.rewrite_list.lock().clone()
    }

    /// Install the change callback for word-valued mappings
    pub fn set_on_change_bytes(&self, callback: BytesChangeCallback) {
        *self.on_change_bytes.write() = Some(callback);
    }

    /// Install the change callback for bool-valued mappings
    pub fn set_on_change_bool(&self, callback: BoolChangeCallback) {
        *self.on_change_bool.write() = Some(callback);
    }

    /// Install the online/offline transition callback
    pub fn set_on_status(&self, callback: StatusCallback) {
        *self.on_status.write() = Some(callback);
    }

    pub(crate) fn trigger_on_change_bytes(&self, handle: MappingHandle, values: &[u16]) {
        if let Some(callback) = self.on_change_bytes.read().as_ref() {
            callback(self, handle, values);
        }
    }

    pub(crate) fn trigger_on_change_bool(&self, handle: MappingHandle, value: bool) {
        if let Some(callback) = self.on_change_bool.read().as_ref() {
            callback(self, handle, value);
        }
    }

    pub(crate) fn trigger_on_status(&self, status: bool) {
        self.online.store(status, Ordering::Relaxed);
        if let Some(callback) = self.on_status.read().as_ref() {
            callback(self, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{MappingOptions, OperationType, OutputType};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn holding(reference: &str, address: i32) -> RegisterMapping {
        RegisterMapping::new(
            reference,
            RegisterKind::HoldingRegister,
            address,
            MappingOptions::default(),
        )
        .unwrap()
    }

    fn coil(reference: &str, address: i32, restricted: bool) -> RegisterMapping {
        RegisterMapping::new(
            reference,
            RegisterKind::Coil,
            address,
            MappingOptions {
                read_restricted: restricted,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn abutting_mappings_merge_and_gaps_split() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                holding("H0", 0),
                holding("H1", 1),
                holding("H3", 3),
                holding("H4", 4),
            ],
        )
        .unwrap();
        let groups = device.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].starting_address(), 0);
        assert_eq!(groups[0].address_count(), 2);
        assert_eq!(groups[1].starting_address(), 3);
        assert_eq!(groups[1].address_count(), 2);
    }

    #[test]
    fn grouping_is_independent_of_input_order() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                holding("H4", 4),
                holding("H0", 0),
                holding("H3", 3),
                holding("H1", 1),
            ],
        )
        .unwrap();
        assert_eq!(device.groups().len(), 2);
        assert_eq!(device.groups()[0].starting_address(), 0);
    }

    #[test]
    fn read_restricted_mappings_aggregate_per_kind() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                coil("C0", 0, true),
                coil("C1", 1, true),
                coil("C5", 5, true),
            ],
        )
        .unwrap();
        let groups = device.groups();
        assert_eq!(groups.len(), 1);
        assert!(groups[0].is_read_restricted());
        assert_eq!(groups[0].mappings().len(), 3);
    }

    #[test]
    fn restricted_and_normal_mappings_keep_separate_groups() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                coil("C0", 0, false),
                coil("C1", 1, true),
                holding("H0", 0),
                RegisterMapping::new(
                    "H9",
                    RegisterKind::HoldingRegister,
                    9,
                    MappingOptions {
                        read_restricted: true,
                        ..Default::default()
                    },
                )
                .unwrap(),
            ],
        )
        .unwrap();
        // One normal coil group, one restricted coil group, one normal
        // holding group, one restricted holding group.
        assert_eq!(device.groups().len(), 4);
        let restricted: Vec<_> = device
            .groups()
            .iter()
            .filter(|group| group.is_read_restricted())
            .collect();
        assert_eq!(restricted.len(), 2);
    }

    #[test]
    fn every_mapping_lands_in_exactly_one_group() {
        let mappings = vec![
            holding("H0", 0),
            holding("H1", 1),
            holding("H5", 5),
            coil("C2", 2, false),
            coil("C9", 9, true),
        ];
        let total = mappings.len();
        let device = ModbusDevice::new("plc", 1, mappings).unwrap();
        let mut seen = HashSet::new();
        for group in device.groups() {
            for handle in group.mappings() {
                assert!(seen.insert(*handle), "mapping appears in two groups");
            }
        }
        assert_eq!(seen.len(), total);
    }

    #[test]
    fn groups_claims_stay_contiguous() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                holding("H0", 0),
                RegisterMapping::merged(
                    "U32",
                    RegisterKind::HoldingRegister,
                    vec![1, 2],
                    OutputType::U32,
                    OperationType::MergeBigEndian,
                    MappingOptions::default(),
                )
                .unwrap(),
                RegisterMapping::take_bit(
                    "B3",
                    RegisterKind::HoldingRegister,
                    3,
                    0,
                    MappingOptions::default(),
                )
                .unwrap(),
            ],
        )
        .unwrap();
        assert_eq!(device.groups().len(), 1);
        let group = &device.groups()[0];
        let addresses: Vec<i32> = group.claims().map(|(key, _)| key.address()).collect();
        assert_eq!(addresses, vec![0, 1, 2, 3]);
        assert_eq!(group.address_count(), 4);
    }

    #[test]
    fn duplicate_references_are_rejected() {
        let result = ModbusDevice::new("plc", 1, vec![holding("H", 0), holding("H", 1)]);
        assert!(matches!(
            result,
            Err(ModbusMapperError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn slave_address_is_attached_to_every_mapping() {
        let device = ModbusDevice::new("plc", 7, vec![holding("H", 0)]).unwrap();
        let handle = device.mapping_handle("H").unwrap();
        assert_eq!(device.with_mapping(handle, |m| m.slave_address()), 7);
        assert_eq!(device.groups()[0].slave_address(), 7);
    }

    #[test]
    fn rewrite_list_tracks_period_transitions() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![
                RegisterMapping::new(
                    "W",
                    RegisterKind::HoldingRegister,
                    0,
                    MappingOptions {
                        repeated_write: Duration::from_secs(1),
                        ..Default::default()
                    },
                )
                .unwrap(),
                holding("H", 1),
            ],
        )
        .unwrap();
        let w = device.mapping_handle("W").unwrap();
        let h = device.mapping_handle("H").unwrap();
        assert_eq!(device.rewritable(), vec![w]);

        device.set_repeated_write(h, Duration::from_secs(2)).unwrap();
        assert_eq!(device.rewritable().len(), 2);
        device.set_repeated_write(w, Duration::ZERO).unwrap();
        assert_eq!(device.rewritable(), vec![h]);
    }

    #[test]
    fn rewrite_period_rejects_read_only_kinds() {
        let device = ModbusDevice::new(
            "plc",
            1,
            vec![RegisterMapping::new(
                "I",
                RegisterKind::InputRegister,
                0,
                MappingOptions::default(),
            )
            .unwrap()],
        )
        .unwrap();
        let handle = device.mapping_handle("I").unwrap();
        assert!(device
            .set_repeated_write(handle, Duration::from_secs(1))
            .is_err());
    }

    #[test]
    fn callbacks_fire_through_trigger_helpers() {
        let device = ModbusDevice::new("plc", 1, vec![holding("H", 0)]).unwrap();
        let bytes_calls = Arc::new(AtomicUsize::new(0));
        let status_calls = Arc::new(AtomicUsize::new(0));
        {
            let bytes_calls = Arc::clone(&bytes_calls);
            device.set_on_change_bytes(Box::new(move |_, _, values| {
                assert_eq!(values, [42]);
                bytes_calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let status_calls = Arc::clone(&status_calls);
            device.set_on_status(Box::new(move |device, status| {
                assert!(status);
                assert_eq!(device.name(), "plc");
                status_calls.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let handle = device.mapping_handle("H").unwrap();
        device.trigger_on_change_bytes(handle, &[42]);
        device.trigger_on_status(true);
        assert_eq!(bytes_calls.load(Ordering::SeqCst), 1);
        assert_eq!(status_calls.load(Ordering::SeqCst), 1);
        assert!(device.is_online());
    }
}
