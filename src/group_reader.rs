//! Group reads and value distribution
//!
//! One read per group: dispatch on the register kind, pull the whole
//! contiguous span in a single transport call, then walk the claim-ordered
//! mappings handing each its slice of the result. Bit claims of one address
//! share a single word, fanned out through the bit separator; multi-word
//! mappings consume their full run and skip the duplicate claim keys their
//! span expanded into. Changed values fire the device callbacks from here,
//! on the calling read task.

use tracing::{info, warn};

use crate::codec;
use crate::device::ModbusDevice;
use crate::group::RegisterGroup;
use crate::mapping::{MappingHandle, RegisterKind};
use crate::transport::ModbusTransport;

/// Read one group and distribute the values to its mappings
///
/// Read-restricted groups are never read and always count as success.
/// Returns `false` on transport failure; no mapping state changes in that
/// case.
pub(crate) async fn read_group(
    transport: &mut dyn ModbusTransport,
    device: &ModbusDevice,
    group: &RegisterGroup,
) -> bool {
    if group.is_read_restricted() {
        return true;
    }

    let slave_address = group.slave_address();
    let starting_address = group.starting_address();
    let address_count = group.address_count();

    match group.kind() {
        RegisterKind::Coil => {
            match transport
                .read_coils(slave_address, starting_address, address_count)
                .await
            {
                Ok(values) if values.len() == usize::from(address_count) => {
                    distribute_bools(device, group, &values);
                    true
                }
                Ok(values) => {
                    warn!(
                        slave_address,
                        starting_address,
                        expected = address_count,
                        got = values.len(),
                        "coil read returned the wrong count"
                    );
                    false
                }
                Err(error) => {
                    warn!(
                        slave_address,
                        starting_address,
                        address_count,
                        %error,
                        "unable to read coil group"
                    );
                    false
                }
            }
        }
        RegisterKind::DiscreteInput => {
            match transport
                .read_discrete_inputs(slave_address, starting_address, address_count)
                .await
            {
                Ok(values) if values.len() == usize::from(address_count) => {
                    distribute_bools(device, group, &values);
                    true
                }
                Ok(values) => {
                    warn!(
                        slave_address,
                        starting_address,
                        expected = address_count,
                        got = values.len(),
                        "discrete input read returned the wrong count"
                    );
                    false
                }
                Err(error) => {
                    warn!(
                        slave_address,
                        starting_address,
                        address_count,
                        %error,
                        "unable to read discrete input group"
                    );
                    false
                }
            }
        }
        RegisterKind::HoldingRegister => {
            match transport
                .read_holding_registers(slave_address, starting_address, address_count)
                .await
            {
                Ok(values) if values.len() == usize::from(address_count) => {
                    distribute_words(device, group, &values);
                    true
                }
                Ok(values) => {
                    warn!(
                        slave_address,
                        starting_address,
                        expected = address_count,
                        got = values.len(),
                        "holding register read returned the wrong count"
                    );
                    false
                }
                Err(error) => {
                    warn!(
                        slave_address,
                        starting_address,
                        address_count,
                        %error,
                        "unable to read holding register group"
                    );
                    false
                }
            }
        }
        RegisterKind::InputRegister => {
            match transport
                .read_input_registers(slave_address, starting_address, address_count)
                .await
            {
                Ok(values) if values.len() == usize::from(address_count) => {
                    distribute_words(device, group, &values);
                    true
                }
                Ok(values) => {
                    warn!(
                        slave_address,
                        starting_address,
                        expected = address_count,
                        got = values.len(),
                        "input register read returned the wrong count"
                    );
                    false
                }
                Err(error) => {
                    warn!(
                        slave_address,
                        starting_address,
                        address_count,
                        %error,
                        "unable to read input register group"
                    );
                    false
                }
            }
        }
    }
}

/// Hand each bool mapping its value, one per claim in claim order
fn distribute_bools(device: &ModbusDevice, group: &RegisterGroup, values: &[bool]) {
    for (index, (_, handle)) in group.claims().enumerate() {
        feed_bool(device, handle, values[index]);
    }
}

/// Walk the claim-ordered mappings through the word vector
///
/// The cursor consumes every word exactly once: a bit claim takes one word
/// and feeds all consecutive claims of the same address from it, a
/// whole-register claim takes its mapping's full span and skips the claim
/// keys covering the rest of that span.
fn distribute_words(device: &ModbusDevice, group: &RegisterGroup, values: &[u16]) {
    let claims: Vec<_> = group.claims().collect();
    let mut cursor = 0usize;
    let mut skip = 0usize;
    let mut index = 0usize;

    while index < claims.len() {
        if skip > 0 {
            skip -= 1;
            index += 1;
            continue;
        }
        let (key, handle) = claims[index];
        if key.bit_index().is_some() {
            let bits = codec::separate_bits(values[cursor]);
            cursor += 1;
            let address = key.address();
            let mut shift = 0usize;
            while index + shift < claims.len() && claims[index + shift].0.address() == address {
                if shift > 0 {
                    skip += 1;
                }
                let (bit_key, bit_handle) = claims[index + shift];
                let Some(bit) = bit_key.bit_index() else {
                    break;
                };
                feed_bool(device, bit_handle, bits[usize::from(bit)]);
                shift += 1;
            }
        } else {
            let count = device.with_mapping(handle, |mapping| mapping.register_count());
            let words = &values[cursor..cursor + count];
            cursor += count;
            skip += count - 1;
            feed_words(device, handle, words);
        }
        index += 1;
    }

    debug_assert_eq!(cursor, usize::from(group.address_count()));
}

fn feed_bool(device: &ModbusDevice, handle: MappingHandle, value: bool) {
    let changed = {
        let mut mapping = device.mapping(handle).lock();
        if mapping.does_update_bool(value) {
            mapping.update_bool(value)
        } else {
            false
        }
    };
    if changed {
        let reference = device.with_mapping(handle, |m| m.reference().to_string());
        info!(reference = %reference, value, "mapping value changed");
        device.trigger_on_change_bool(handle, value);
    }
}

fn feed_words(device: &ModbusDevice, handle: MappingHandle, words: &[u16]) {
    let changed = {
        let mut mapping = device.mapping(handle).lock();
        match mapping.does_update_words(words) {
            Ok(true) => match mapping.update_words(words) {
                Ok(changed) => changed,
                Err(error) => {
                    warn!(reference = mapping.reference(), %error, "update rejected");
                    false
                }
            },
            Ok(false) => false,
            Err(error) => {
                warn!(reference = mapping.reference(), %error, "value vector mismatch");
                false
            }
        }
    };
    if changed {
        let reference = device.with_mapping(handle, |m| m.reference().to_string());
        info!(reference = %reference, values = ?words, "mapping value changed");
        device.trigger_on_change_bytes(handle, words);
    }
}
