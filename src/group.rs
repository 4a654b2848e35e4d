//! Register groups and the claim-key algebra
//!
//! A [`RegisterGroup`] fuses mappings of the same kind and slave into one
//! contiguous address span readable with a single Modbus request. What each
//! mapping occupies inside the group is expressed as *claims*: a
//! whole-register mapping at address `A` spanning `n` registers claims
//! `"A"` through `"A+n-1"`, a bit mapping claims `"A.b"`. Within one
//! address either a single whole-register claim or any set of bit claims
//! may exist, never both.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

use crate::error::ModbusMapperError;
use crate::mapping::{MappingHandle, OperationType, RegisterKind, RegisterMapping};

/// Separator between address and bit index in the textual claim form
pub const CLAIM_SEPARATOR: char = '.';

/// What a mapping occupies within a group: an address, optionally narrowed
/// to a single bit
///
/// Ordering is by address ascending, then whole-register claims before the
/// bit claims of the same address, then bit index ascending. The textual
/// form is `"<address>"` or `"<address>.<bit>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClaimKey {
    address: i32,
    bit: Option<u8>,
}

impl ClaimKey {
    /// Claim of a whole register
    pub fn whole(address: i32) -> Self {
        Self { address, bit: None }
    }

    /// Claim of a single bit of a register
    pub fn bit(address: i32, bit: u8) -> Self {
        Self {
            address,
            bit: Some(bit),
        }
    }

    pub fn address(self) -> i32 {
        self.address
    }

    /// Bit index of a bit claim, `None` for a whole-register claim
    pub fn bit_index(self) -> Option<u8> {
        self.bit
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "{}{}{}", self.address, CLAIM_SEPARATOR, bit),
            None => write!(f, "{}", self.address),
        }
    }
}

impl FromStr for ClaimKey {
    type Err = ModbusMapperError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ModbusMapperError::InvalidArgument(format!("invalid claim '{value}'"));
        match value.split_once(CLAIM_SEPARATOR) {
            Some((address, bit)) => Ok(ClaimKey::bit(
                address.parse().map_err(|_| invalid())?,
                bit.parse().map_err(|_| invalid())?,
            )),
            None => Ok(ClaimKey::whole(value.parse().map_err(|_| invalid())?)),
        }
    }
}

/// A set of same-kind, same-slave mappings readable in one transport call
///
/// Built once by the owning device's grouping pass; the address span is
/// immutable afterwards. Read-restricted groups waive the contiguity rules
/// entirely — they exist only to carry their mappings and are never read.
#[derive(Debug, Clone)]
pub struct RegisterGroup {
    kind: RegisterKind,
    slave_address: i16,
    read_restricted: bool,
    claims: BTreeMap<ClaimKey, MappingHandle>,
    members: Vec<MappingHandle>,
}

impl RegisterGroup {
    /// Start a group around its first mapping
    pub(crate) fn seed(mapping: &RegisterMapping, handle: MappingHandle) -> Self {
        let mut group = Self {
            kind: mapping.kind(),
            slave_address: mapping.slave_address(),
            read_restricted: mapping.is_read_restricted(),
            claims: BTreeMap::new(),
            members: Vec::new(),
        };
        group.insert_claims(mapping, handle);
        group.members.push(handle);
        group
    }

    /// Try to take another mapping without breaking the contiguous span
    ///
    /// Returns whether the mapping was accepted; a rejection only means the
    /// caller has to start a new group. Enlargement is permitted when the
    /// mapping abuts the current span on either side.
    pub(crate) fn add_mapping(&mut self, mapping: &RegisterMapping, handle: MappingHandle) -> bool {
        if mapping.kind() != self.kind {
            warn!(
                reference = mapping.reference(),
                group_kind = %self.kind,
                "rejecting mapping of a different register kind"
            );
            return false;
        }
        if mapping.slave_address() != self.slave_address {
            warn!(
                reference = mapping.reference(),
                group_slave = self.slave_address,
                "rejecting mapping for a different slave address"
            );
            return false;
        }
        if mapping.is_read_restricted() {
            warn!(
                reference = mapping.reference(),
                "read-restricted mappings take a dedicated group"
            );
            return false;
        }

        let accepted = if mapping.operation() == OperationType::TakeBit {
            self.try_add_bit(mapping, handle)
        } else {
            self.try_add_whole(mapping, handle)
        };
        if accepted {
            self.members.push(handle);
        }
        accepted
    }

    fn try_add_bit(&mut self, mapping: &RegisterMapping, handle: MappingHandle) -> bool {
        let target = mapping.starting_address();
        let Some(bit) = mapping.bit_index() else {
            return false;
        };

        if self.claims.contains_key(&ClaimKey::whole(target)) {
            warn!(
                reference = mapping.reference(),
                address = target,
                "cannot take a bit, another mapping claims the full register"
            );
            return false;
        }
        let start = self.starting_address();
        let end = start + i32::from(self.address_count()) - 1;
        if target < start && start - target != 1 {
            warn!(
                reference = mapping.reference(),
                address = target,
                "bit mapping is ahead of the group by more than one address"
            );
            return false;
        }
        if target > end && target - end != 1 {
            warn!(
                reference = mapping.reference(),
                address = target,
                "bit mapping is after the group by more than one address"
            );
            return false;
        }
        let key = ClaimKey::bit(target, bit);
        if self.claims.contains_key(&key) {
            warn!(
                reference = mapping.reference(),
                claim = %key,
                "bit is already occupied"
            );
            return false;
        }
        self.claims.insert(key, handle);
        true
    }

    fn try_add_whole(&mut self, mapping: &RegisterMapping, handle: MappingHandle) -> bool {
        let first = mapping.starting_address();
        let count = mapping.register_count() as i32;
        let start = self.starting_address();
        let span = i32::from(self.address_count());

        if first < start {
            let gap = start - (first + count);
            if gap != 0 {
                warn!(
                    reference = mapping.reference(),
                    address = first,
                    gap,
                    "mapping does not abut the group from below"
                );
                return false;
            }
        } else {
            let gap = first - (start + span);
            if gap != 0 {
                warn!(
                    reference = mapping.reference(),
                    address = first,
                    gap,
                    "mapping does not abut the group from above"
                );
                return false;
            }
        }
        for offset in 0..count {
            self.claims.insert(ClaimKey::whole(first + offset), handle);
        }
        true
    }

    /// Append a read-restricted mapping, waiving contiguity
    ///
    /// Restricted groups never reach the transport, so overlapping claims
    /// between their members are tolerated; `members` keeps every mapping.
    pub(crate) fn append_restricted(&mut self, mapping: &RegisterMapping, handle: MappingHandle) {
        debug_assert!(self.read_restricted && mapping.is_read_restricted());
        self.insert_claims(mapping, handle);
        self.members.push(handle);
    }

    fn insert_claims(&mut self, mapping: &RegisterMapping, handle: MappingHandle) {
        if mapping.operation() == OperationType::TakeBit {
            if let Some(bit) = mapping.bit_index() {
                self.claims
                    .insert(ClaimKey::bit(mapping.starting_address(), bit), handle);
            }
        } else {
            let first = mapping.starting_address();
            for offset in 0..mapping.register_count() as i32 {
                self.claims.insert(ClaimKey::whole(first + offset), handle);
            }
        }
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn slave_address(&self) -> i16 {
        self.slave_address
    }

    pub fn is_read_restricted(&self) -> bool {
        self.read_restricted
    }

    /// Lowest claimed address
    pub fn starting_address(&self) -> i32 {
        self.claims
            .keys()
            .next()
            .map(|key| key.address())
            .unwrap_or(0)
    }

    /// Number of distinct physical addresses the group reads
    pub fn address_count(&self) -> u16 {
        let mut count = 0u16;
        let mut previous: Option<i32> = None;
        for key in self.claims.keys() {
            if previous != Some(key.address()) {
                count += 1;
                previous = Some(key.address());
            }
        }
        count
    }

    /// Claims in order, with the mapping occupying each
    pub fn claims(&self) -> impl Iterator<Item = (ClaimKey, MappingHandle)> + '_ {
        self.claims.iter().map(|(key, handle)| (*key, *handle))
    }

    /// Every mapping in the group, in the order it was added
    pub fn mappings(&self) -> &[MappingHandle] {
        &self.members
    }
}
