//! Typed register mappings
//!
//! A [`RegisterMapping`] is a logical signal laid over one, part of, or
//! several adjacent Modbus registers: it knows which register kind it lives
//! in, how the raw words decode into a typed value, and which changes are
//! significant enough to notify. The legal combinations of register kind,
//! output type and operation are enforced at construction; violations are
//! programmer errors and fail with
//! [`InvalidConfiguration`](crate::ModbusMapperError::InvalidConfiguration).
//!
//! | Kind                      | Output            | Operation            |
//! |---------------------------|-------------------|----------------------|
//! | Coil / DiscreteInput      | Bool              | None                 |
//! | Holding / Input (1 addr)  | U16 or I16        | None                 |
//! | Holding / Input (1 addr)  | Bool              | TakeBit (bit 0..=15) |
//! | Holding / Input (2 addr)  | U32 / I32         | MergeBig / Little    |
//! | Holding / Input (2 addr)  | F32               | MergeFloatBig/Little |
//! | Holding / Input (N addr)  | String            | any Stringify        |

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::codec::{self, Endian};
use crate::error::{ModbusMapperError, Result};

/// Slave address value meaning "not attached to a device yet"
pub const UNSET_SLAVE_ADDRESS: i16 = -1;

/// Modbus register space a mapping lives in
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum RegisterKind {
    /// Read/write single-bit output
    #[serde(rename = "COIL")]
    Coil,
    /// Read-only single-bit input
    #[serde(rename = "INPUT_CONTACT")]
    DiscreteInput,
    /// Read/write 16-bit register
    #[serde(rename = "HOLDING_REGISTER")]
    HoldingRegister,
    /// Read-only 16-bit register
    #[serde(rename = "INPUT_REGISTER")]
    InputRegister,
}

impl RegisterKind {
    /// Whether the register space accepts writes
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }

    /// Whether the register space holds single bits rather than words
    pub fn is_discrete(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }
}

impl fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RegisterKind::Coil => "COIL",
            RegisterKind::DiscreteInput => "INPUT_CONTACT",
            RegisterKind::HoldingRegister => "HOLDING_REGISTER",
            RegisterKind::InputRegister => "INPUT_REGISTER",
        };
        f.write_str(text)
    }
}

impl FromStr for RegisterKind {
    type Err = ModbusMapperError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "COIL" => Ok(RegisterKind::Coil),
            "INPUT_CONTACT" => Ok(RegisterKind::DiscreteInput),
            "HOLDING_REGISTER" => Ok(RegisterKind::HoldingRegister),
            "INPUT_REGISTER" => Ok(RegisterKind::InputRegister),
            other => Err(ModbusMapperError::InvalidArgument(format!(
                "unknown register kind '{other}'"
            ))),
        }
    }
}

/// Decoded value shape of a mapping
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum OutputType {
    #[serde(rename = "BOOL")]
    Bool,
    #[serde(rename = "UINT16")]
    U16,
    #[serde(rename = "INT16")]
    I16,
    #[serde(rename = "UINT32")]
    U32,
    #[serde(rename = "INT32")]
    I32,
    #[serde(rename = "FLOAT")]
    F32,
    #[serde(rename = "STRING")]
    String,
}

impl OutputType {
    /// Whether deadband filtering is meaningful for this shape
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            OutputType::U16 | OutputType::I16 | OutputType::U32 | OutputType::I32 | OutputType::F32
        )
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OutputType::Bool => "BOOL",
            OutputType::U16 => "UINT16",
            OutputType::I16 => "INT16",
            OutputType::U32 => "UINT32",
            OutputType::I32 => "INT32",
            OutputType::F32 => "FLOAT",
            OutputType::String => "STRING",
        };
        f.write_str(text)
    }
}

impl FromStr for OutputType {
    type Err = ModbusMapperError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "BOOL" => Ok(OutputType::Bool),
            "UINT16" => Ok(OutputType::U16),
            "INT16" => Ok(OutputType::I16),
            "UINT32" => Ok(OutputType::U32),
            "INT32" => Ok(OutputType::I32),
            "FLOAT" => Ok(OutputType::F32),
            "STRING" => Ok(OutputType::String),
            other => Err(ModbusMapperError::InvalidArgument(format!(
                "unknown output type '{other}'"
            ))),
        }
    }
}

/// How raw register words are interpreted into the output type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Single-register identity
    #[serde(rename = "NONE")]
    None,
    /// Two registers into U32/I32, index 0 high
    #[serde(rename = "MERGE_BIG_ENDIAN")]
    MergeBigEndian,
    /// Two registers into U32/I32, index 1 high
    #[serde(rename = "MERGE_LITTLE_ENDIAN")]
    MergeLittleEndian,
    /// Two registers into an IEEE-754 float, index 0 high
    #[serde(rename = "MERGE_FLOAT_BIG_ENDIAN", alias = "MERGE_FLOAT")]
    MergeFloatBigEndian,
    /// Two registers into an IEEE-754 float, index 1 high
    #[serde(rename = "MERGE_FLOAT_LITTLE_ENDIAN")]
    MergeFloatLittleEndian,
    /// N registers into an ASCII string, high byte first
    #[serde(rename = "STRINGIFY_ASCII_BIG_ENDIAN", alias = "STRINGIFY_ASCII")]
    StringifyAsciiBigEndian,
    /// N registers into an ASCII string, low byte first
    #[serde(rename = "STRINGIFY_ASCII_LITTLE_ENDIAN")]
    StringifyAsciiLittleEndian,
    /// N registers into a Latin-1 string, high byte first
    #[serde(rename = "STRINGIFY_UNICODE_BIG_ENDIAN", alias = "STRINGIFY_UNICODE")]
    StringifyUnicodeBigEndian,
    /// N registers into a Latin-1 string, low byte first
    #[serde(rename = "STRINGIFY_UNICODE_LITTLE_ENDIAN")]
    StringifyUnicodeLittleEndian,
    /// One bit out of one 16-bit register
    #[serde(rename = "TAKE_BIT")]
    TakeBit,
}

impl OperationType {
    /// Word/byte order of the operation, if it has one
    pub fn endian(self) -> Option<Endian> {
        match self {
            OperationType::MergeBigEndian
            | OperationType::MergeFloatBigEndian
            | OperationType::StringifyAsciiBigEndian
            | OperationType::StringifyUnicodeBigEndian => Some(Endian::Big),
            OperationType::MergeLittleEndian
            | OperationType::MergeFloatLittleEndian
            | OperationType::StringifyAsciiLittleEndian
            | OperationType::StringifyUnicodeLittleEndian => Some(Endian::Little),
            OperationType::None | OperationType::TakeBit => None,
        }
    }

    /// Whether this is one of the integer merge operations
    pub fn is_integer_merge(self) -> bool {
        matches!(
            self,
            OperationType::MergeBigEndian | OperationType::MergeLittleEndian
        )
    }

    /// Whether this is one of the float merge operations
    pub fn is_float_merge(self) -> bool {
        matches!(
            self,
            OperationType::MergeFloatBigEndian | OperationType::MergeFloatLittleEndian
        )
    }

    /// Whether this is one of the string operations
    pub fn is_stringify(self) -> bool {
        matches!(
            self,
            OperationType::StringifyAsciiBigEndian
                | OperationType::StringifyAsciiLittleEndian
                | OperationType::StringifyUnicodeBigEndian
                | OperationType::StringifyUnicodeLittleEndian
        )
    }

    fn is_ascii_stringify(self) -> bool {
        matches!(
            self,
            OperationType::StringifyAsciiBigEndian | OperationType::StringifyAsciiLittleEndian
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OperationType::None => "NONE",
            OperationType::MergeBigEndian => "MERGE_BIG_ENDIAN",
            OperationType::MergeLittleEndian => "MERGE_LITTLE_ENDIAN",
            OperationType::MergeFloatBigEndian => "MERGE_FLOAT_BIG_ENDIAN",
            OperationType::MergeFloatLittleEndian => "MERGE_FLOAT_LITTLE_ENDIAN",
            OperationType::StringifyAsciiBigEndian => "STRINGIFY_ASCII_BIG_ENDIAN",
            OperationType::StringifyAsciiLittleEndian => "STRINGIFY_ASCII_LITTLE_ENDIAN",
            OperationType::StringifyUnicodeBigEndian => "STRINGIFY_UNICODE_BIG_ENDIAN",
            OperationType::StringifyUnicodeLittleEndian => "STRINGIFY_UNICODE_LITTLE_ENDIAN",
            OperationType::TakeBit => "TAKE_BIT",
        };
        f.write_str(text)
    }
}

impl FromStr for OperationType {
    type Err = ModbusMapperError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "NONE" => Ok(OperationType::None),
            "MERGE_BIG_ENDIAN" => Ok(OperationType::MergeBigEndian),
            "MERGE_LITTLE_ENDIAN" => Ok(OperationType::MergeLittleEndian),
            "MERGE_FLOAT" | "MERGE_FLOAT_BIG_ENDIAN" => Ok(OperationType::MergeFloatBigEndian),
            "MERGE_FLOAT_LITTLE_ENDIAN" => Ok(OperationType::MergeFloatLittleEndian),
            "STRINGIFY_ASCII" | "STRINGIFY_ASCII_BIG_ENDIAN" => {
                Ok(OperationType::StringifyAsciiBigEndian)
            }
            "STRINGIFY_ASCII_LITTLE_ENDIAN" => Ok(OperationType::StringifyAsciiLittleEndian),
            "STRINGIFY_UNICODE" | "STRINGIFY_UNICODE_BIG_ENDIAN" => {
                Ok(OperationType::StringifyUnicodeBigEndian)
            }
            "STRINGIFY_UNICODE_LITTLE_ENDIAN" => Ok(OperationType::StringifyUnicodeLittleEndian),
            "TAKE_BIT" => Ok(OperationType::TakeBit),
            other => Err(ModbusMapperError::InvalidArgument(format!(
                "unknown operation type '{other}'"
            ))),
        }
    }
}

/// Decoded value of a mapping, tagged by output type
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Bool(bool),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Text(String),
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Bool(v) => write!(f, "{v}"),
            TypedValue::U16(v) => write!(f, "{v}"),
            TypedValue::I16(v) => write!(f, "{v}"),
            TypedValue::U32(v) => write!(f, "{v}"),
            TypedValue::I32(v) => write!(f, "{v}"),
            TypedValue::F32(v) => write!(f, "{v}"),
            TypedValue::Text(v) => f.write_str(v),
        }
    }
}

/// Stable index of a mapping inside its owning device's arena
///
/// Handles are handed to change callbacks and to the reader's write API in
/// place of references, so no back-pointers exist between mappings, groups
/// and devices. A handle is only meaningful together with the device that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle(pub(crate) usize);

impl MappingHandle {
    /// Arena index of the mapping within its device
    pub fn index(self) -> usize {
        self.0
    }
}

/// Optional knobs shared by every mapping constructor
#[derive(Debug, Clone)]
pub struct MappingOptions {
    /// Never read, only written; requires a writable register kind
    pub read_restricted: bool,
    /// Slave address, normally left unset and filled in at device attach
    pub slave_address: i16,
    /// Minimum decoded-value change that counts as significant (0 = off)
    pub deadband: f64,
    /// Minimum wall-clock time between two change notifications (0 = off)
    pub frequency_filter: Duration,
    /// Period after which the cached value is rewritten to the device (0 = off)
    pub repeated_write: Duration,
    /// Textual default value carried for writable mappings
    pub default_value: Option<String>,
    /// Whether a raw word write also updates the local cache on success
    pub auto_local_update: bool,
}

impl Default for MappingOptions {
    fn default() -> Self {
        Self {
            read_restricted: false,
            slave_address: UNSET_SLAVE_ADDRESS,
            deadband: 0.0,
            frequency_filter: Duration::ZERO,
            repeated_write: Duration::ZERO,
            default_value: None,
            auto_local_update: false,
        }
    }
}

/// A typed logical signal over one, part of, or several adjacent registers
///
/// State transitions happen on the owning device's read task (decode path),
/// on its rewrite task (write-back restamp) and on explicit user writes
/// through the reader; each mapping sits behind a per-mapping lock inside
/// the device arena so readers always observe a fully-decoded value.
#[derive(Debug, Clone)]
pub struct RegisterMapping {
    reference: String,
    kind: RegisterKind,
    addresses: Vec<i32>,
    slave_address: i16,
    output_type: OutputType,
    operation: OperationType,
    bit_index: Option<u8>,
    read_restricted: bool,
    deadband: f64,
    frequency_filter: Duration,
    repeated_write: Duration,
    default_value: Option<String>,
    auto_local_update: bool,

    // Value watching state
    bool_value: bool,
    word_values: Vec<u16>,
    typed_value: Option<TypedValue>,
    initialized: bool,
    valid: bool,
    last_update: Option<Instant>,
}

impl RegisterMapping {
    /// Single-register mapping with the default output type for its kind
    ///
    /// Coils and discrete inputs decode to `Bool`, holding and input
    /// registers to `U16`.
    pub fn new(
        reference: impl Into<String>,
        kind: RegisterKind,
        address: i32,
        options: MappingOptions,
    ) -> Result<Self> {
        let output_type = if kind.is_discrete() {
            OutputType::Bool
        } else {
            OutputType::U16
        };
        Self::with_output(reference, kind, address, output_type, options)
    }

    /// Single-register mapping with an explicit output type
    ///
    /// Register kinds accept `U16` or `I16`; discrete kinds accept `Bool`.
    pub fn with_output(
        reference: impl Into<String>,
        kind: RegisterKind,
        address: i32,
        output_type: OutputType,
        options: MappingOptions,
    ) -> Result<Self> {
        if kind.is_discrete() {
            if output_type != OutputType::Bool {
                return Err(ModbusMapperError::InvalidConfiguration(format!(
                    "single-address {kind} mapping can only output BOOL"
                )));
            }
        } else if !matches!(output_type, OutputType::U16 | OutputType::I16) {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "single-address {kind} mapping can only output UINT16 or INT16"
            )));
        }
        Self::build(
            reference.into(),
            kind,
            vec![address],
            output_type,
            OperationType::None,
            None,
            options,
        )
    }

    /// Bool mapping over one bit of a 16-bit register
    pub fn take_bit(
        reference: impl Into<String>,
        kind: RegisterKind,
        address: i32,
        bit_index: u8,
        options: MappingOptions,
    ) -> Result<Self> {
        if kind.is_discrete() {
            return Err(ModbusMapperError::InvalidConfiguration(
                "TAKE_BIT cannot be done over COIL/INPUT_CONTACT".to_string(),
            ));
        }
        if bit_index > 15 {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "bit index {bit_index} out of range 0..=15"
            )));
        }
        Self::build(
            reference.into(),
            kind,
            vec![address],
            OutputType::Bool,
            OperationType::TakeBit,
            Some(bit_index),
            options,
        )
    }

    /// Mapping merging multiple registers into one output value
    ///
    /// Two registers for the 32-bit merges, any contiguous run for the
    /// string operations (two characters per register).
    pub fn merged(
        reference: impl Into<String>,
        kind: RegisterKind,
        addresses: Vec<i32>,
        output_type: OutputType,
        operation: OperationType,
        options: MappingOptions,
    ) -> Result<Self> {
        if kind.is_discrete() {
            return Err(ModbusMapperError::InvalidConfiguration(
                "multi-register mapping cannot be COIL or INPUT_CONTACT".to_string(),
            ));
        }
        if addresses.is_empty() {
            return Err(ModbusMapperError::InvalidConfiguration(
                "multi-register mapping needs at least one address".to_string(),
            ));
        }
        if addresses.windows(2).any(|pair| pair[1] != pair[0] + 1) {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "multi-register mapping addresses must be contiguous ascending, got {addresses:?}"
            )));
        }
        if operation.is_integer_merge() {
            if addresses.len() != 2 {
                return Err(ModbusMapperError::InvalidConfiguration(
                    "merge operations work only with 2 registers".to_string(),
                ));
            }
            if !matches!(output_type, OutputType::U32 | OutputType::I32) {
                return Err(ModbusMapperError::InvalidConfiguration(
                    "integer merges output UINT32 or INT32".to_string(),
                ));
            }
        } else if operation.is_float_merge() {
            if addresses.len() != 2 {
                return Err(ModbusMapperError::InvalidConfiguration(
                    "merge operations work only with 2 registers".to_string(),
                ));
            }
            if output_type != OutputType::F32 {
                return Err(ModbusMapperError::InvalidConfiguration(
                    "float merges can only output FLOAT".to_string(),
                ));
            }
        } else if operation.is_stringify() {
            if output_type != OutputType::String {
                return Err(ModbusMapperError::InvalidConfiguration(
                    "stringify operations can only output STRING".to_string(),
                ));
            }
        } else {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "operation {operation} is not valid for a multi-register mapping"
            )));
        }
        Self::build(
            reference.into(),
            kind,
            addresses,
            output_type,
            operation,
            None,
            options,
        )
    }

    fn build(
        reference: String,
        kind: RegisterKind,
        addresses: Vec<i32>,
        output_type: OutputType,
        operation: OperationType,
        bit_index: Option<u8>,
        options: MappingOptions,
    ) -> Result<Self> {
        if options.read_restricted && !kind.is_writable() {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{reference}' cannot be read-restricted on read-only kind {kind}"
            )));
        }
        if !options.repeated_write.is_zero() && !kind.is_writable() {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{reference}' cannot repeat writes on read-only kind {kind}"
            )));
        }
        if options.default_value.is_some() && !kind.is_writable() {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{reference}' cannot carry a default value on read-only kind {kind}"
            )));
        }
        if options.deadband < 0.0 {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{reference}' has a negative deadband"
            )));
        }
        if options.deadband > 0.0 && !output_type.is_numeric() {
            return Err(ModbusMapperError::InvalidConfiguration(format!(
                "mapping '{reference}' applies a deadband to non-numeric output {output_type}"
            )));
        }
        let register_count = addresses.len();
        Ok(Self {
            reference,
            kind,
            addresses,
            slave_address: options.slave_address,
            output_type,
            operation,
            bit_index,
            read_restricted: options.read_restricted,
            deadband: options.deadband,
            frequency_filter: options.frequency_filter,
            repeated_write: options.repeated_write,
            default_value: options.default_value,
            auto_local_update: options.auto_local_update,
            bool_value: false,
            word_values: vec![0; register_count],
            typed_value: None,
            initialized: false,
            valid: false,
            last_update: None,
        })
    }

    // --- identity and configuration ---

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    /// First (lowest) physical address the mapping claims
    pub fn starting_address(&self) -> i32 {
        self.addresses[0]
    }

    pub fn addresses(&self) -> &[i32] {
        &self.addresses
    }

    /// Number of physical registers the mapping spans
    pub fn register_count(&self) -> usize {
        self.addresses.len()
    }

    pub fn slave_address(&self) -> i16 {
        self.slave_address
    }

    pub(crate) fn set_slave_address(&mut self, slave_address: i16) {
        self.slave_address = slave_address;
    }

    pub fn output_type(&self) -> OutputType {
        self.output_type
    }

    pub fn operation(&self) -> OperationType {
        self.operation
    }

    pub fn bit_index(&self) -> Option<u8> {
        self.bit_index
    }

    pub fn is_read_restricted(&self) -> bool {
        self.read_restricted
    }

    pub fn deadband(&self) -> f64 {
        self.deadband
    }

    pub fn frequency_filter(&self) -> Duration {
        self.frequency_filter
    }

    pub fn repeated_write(&self) -> Duration {
        self.repeated_write
    }

    pub(crate) fn set_repeated_write_raw(&mut self, period: Duration) {
        self.repeated_write = period;
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn auto_local_update(&self) -> bool {
        self.auto_local_update
    }

    // --- value watching state ---

    pub fn bool_value(&self) -> bool {
        self.bool_value
    }

    /// Raw register words as received from the last read or write
    pub fn word_values(&self) -> &[u16] {
        &self.word_values
    }

    /// Decoded value cached by the last update, if any
    pub fn typed_value(&self) -> Option<&TypedValue> {
        self.typed_value.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Invalidate the mapping so the next successful read always notifies
    ///
    /// The reader calls this after a failed write.
    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    // --- change predicates and updates ---

    /// Whether `new_values` would count as an observable change
    ///
    /// Pure predicate, applied in order: an uninitialized or invalid
    /// mapping always updates; an equal value never does; a change inside
    /// the frequency-filter window is dropped; a change inside the deadband
    /// is dropped.
    pub fn does_update_words(&self, new_values: &[u16]) -> Result<bool> {
        if new_values.len() != self.word_values.len() {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{}' takes {} register words, got {}",
                self.reference,
                self.word_values.len(),
                new_values.len()
            )));
        }
        if !self.initialized || !self.valid {
            return Ok(true);
        }
        if new_values == self.word_values.as_slice() {
            return Ok(false);
        }
        if self.within_frequency_window() {
            return Ok(false);
        }
        if self.deadband > 0.0 {
            return Ok(self.beyond_deadband(new_values));
        }
        Ok(true)
    }

    /// Bool flavor of [`does_update_words`](Self::does_update_words)
    pub fn does_update_bool(&self, new_value: bool) -> bool {
        if !self.initialized || !self.valid {
            return true;
        }
        if new_value == self.bool_value {
            return false;
        }
        !self.within_frequency_window()
    }

    fn within_frequency_window(&self) -> bool {
        if self.frequency_filter.is_zero() {
            return false;
        }
        match self.last_update {
            Some(last) => last.elapsed() < self.frequency_filter,
            None => false,
        }
    }

    fn beyond_deadband(&self, new_values: &[u16]) -> bool {
        let endian = self.operation.endian().unwrap_or(Endian::Big);
        let decode = |words: &[u16]| -> Option<f64> {
            match self.output_type {
                OutputType::U16 => Some(f64::from(words[0])),
                OutputType::I16 => Some(f64::from(codec::u16_to_i16(words[0]))),
                OutputType::U32 => codec::registers_to_u32(words, endian).ok().map(f64::from),
                OutputType::I32 => codec::registers_to_i32(words, endian).ok().map(f64::from),
                OutputType::F32 => codec::registers_to_f32(words, endian).ok().map(f64::from),
                OutputType::Bool | OutputType::String => None,
            }
        };
        match (decode(&self.word_values), decode(new_values)) {
            (Some(current), Some(new)) => {
                new >= current + self.deadband || new <= current - self.deadband
            }
            _ => false,
        }
    }

    /// Apply new register words, stamp the update time, cache the decoded
    /// value and report whether the value observably changed
    ///
    /// Also reports `true` on the first initialization and on the
    /// transition out of the invalid state.
    pub fn update_words(&mut self, new_values: &[u16]) -> Result<bool> {
        if new_values.len() != self.word_values.len() {
            return Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{}' takes {} register words, got {}",
                self.reference,
                self.word_values.len(),
                new_values.len()
            )));
        }
        let different = new_values != self.word_values.as_slice();
        self.word_values.copy_from_slice(new_values);
        self.typed_value = Some(self.decode_words(new_values)?);

        let was_initialized = self.initialized;
        let was_valid = self.valid;
        self.initialized = true;
        self.valid = true;
        self.last_update = Some(Instant::now());
        Ok(!was_initialized || different || !was_valid)
    }

    /// Bool flavor of [`update_words`](Self::update_words)
    pub fn update_bool(&mut self, new_value: bool) -> bool {
        let different = new_value != self.bool_value;
        self.bool_value = new_value;
        self.typed_value = Some(TypedValue::Bool(new_value));

        let was_initialized = self.initialized;
        let was_valid = self.valid;
        self.initialized = true;
        self.valid = true;
        self.last_update = Some(Instant::now());
        !was_initialized || different || !was_valid
    }

    fn decode_words(&self, words: &[u16]) -> Result<TypedValue> {
        let endian = self.operation.endian().unwrap_or(Endian::Big);
        match self.output_type {
            OutputType::U16 => Ok(TypedValue::U16(words[0])),
            OutputType::I16 => Ok(TypedValue::I16(codec::u16_to_i16(words[0]))),
            OutputType::U32 => Ok(TypedValue::U32(codec::registers_to_u32(words, endian)?)),
            OutputType::I32 => Ok(TypedValue::I32(codec::registers_to_i32(words, endian)?)),
            OutputType::F32 => Ok(TypedValue::F32(codec::registers_to_f32(words, endian)?)),
            OutputType::String => {
                let text = if self.operation.is_ascii_stringify() {
                    codec::registers_to_ascii_string(words, endian)
                } else {
                    codec::registers_to_unicode_string(words, endian)
                };
                Ok(TypedValue::Text(text))
            }
            OutputType::Bool => Err(ModbusMapperError::InvalidArgument(format!(
                "mapping '{}' is bool-valued and does not take register words",
                self.reference
            ))),
        }
    }
}
