//! TDS data types and the type metadata service.
//!
//! The session layer never interprets column values. It only needs to know
//! how many bytes to read for each column, which is what
//! [`MetaTypeService`] answers: the shape of the TYPE_INFO block that
//! follows a type byte in COLMETADATA, and the length encoding of the value
//! in a ROW.

use bitflags::bitflags;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata and parameter definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    // Fixed-length types (no length prefix)
    /// Null type.
    Null = 0x1F,
    /// 8-bit signed integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 4-byte datetime.
    DateTimeN = 0x6F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 4-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    // Variable-length types (with length prefix)
    /// Variable-length GUID.
    Guid = 0x24,
    /// Variable-length integer.
    IntN = 0x26,
    /// Variable-length decimal.
    Decimal = 0x37,
    /// Variable-length numeric.
    Numeric = 0x3F,
    /// Variable-length bit.
    BitN = 0x68,
    /// Variable-length decimal (newer).
    DecimalN = 0x6A,
    /// Variable-length numeric (newer).
    NumericN = 0x6C,
    /// Variable-length float.
    FloatN = 0x6D,
    /// Variable-length money.
    MoneyN = 0x6E,

    // Byte-counted types
    /// Fixed-length character.
    Char = 0x2F,
    /// Variable-length character.
    VarChar = 0x27,
    /// Fixed-length binary.
    Binary = 0x2D,
    /// Variable-length binary.
    VarBinary = 0x25,

    // Counted types with 2-byte length
    /// Large variable-length character.
    BigVarChar = 0xA7,
    /// Large variable-length binary.
    BigVarBinary = 0xA5,
    /// Large fixed-length character.
    BigChar = 0xAF,
    /// Large fixed-length binary.
    BigBinary = 0xAD,

    // Unicode types
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character.
    NVarChar = 0xE7,

    // Large object types (PLP - Partially Length-Prefixed)
    /// Text (deprecated, use varchar(max)).
    Text = 0x23,
    /// Image (deprecated, use varbinary(max)).
    Image = 0x22,
    /// NText (deprecated, use nvarchar(max)).
    NText = 0x63,

    // Date/time types (SQL Server 2008+)
    /// Date (3 bytes).
    Date = 0x28,
    /// Time with variable precision.
    Time = 0x29,
    /// DateTime2 with variable precision.
    DateTime2 = 0x2A,
    /// DateTimeOffset with variable precision.
    DateTimeOffset = 0x2B,

    // Special types
    /// SQL Variant.
    Variant = 0x62,
    /// User-defined type.
    Udt = 0xF0,
    /// XML type.
    Xml = 0xF1,
    /// Table-valued parameter.
    Tvp = 0xF3,
}

impl TypeId {
    /// Create a type ID from a raw byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x1F => Some(Self::Null),
            0x30 => Some(Self::Int1),
            0x32 => Some(Self::Bit),
            0x34 => Some(Self::Int2),
            0x38 => Some(Self::Int4),
            0x7F => Some(Self::Int8),
            0x6F => Some(Self::DateTimeN),
            0x3B => Some(Self::Float4),
            0x3E => Some(Self::Float8),
            0x3C => Some(Self::Money),
            0x7A => Some(Self::Money4),
            0x3D => Some(Self::DateTime),
            0x3A => Some(Self::DateTime4),
            0x24 => Some(Self::Guid),
            0x26 => Some(Self::IntN),
            0x37 => Some(Self::Decimal),
            0x3F => Some(Self::Numeric),
            0x68 => Some(Self::BitN),
            0x6A => Some(Self::DecimalN),
            0x6C => Some(Self::NumericN),
            0x6D => Some(Self::FloatN),
            0x6E => Some(Self::MoneyN),
            0x2F => Some(Self::Char),
            0x27 => Some(Self::VarChar),
            0x2D => Some(Self::Binary),
            0x25 => Some(Self::VarBinary),
            0xA7 => Some(Self::BigVarChar),
            0xA5 => Some(Self::BigVarBinary),
            0xAF => Some(Self::BigChar),
            0xAD => Some(Self::BigBinary),
            0xEF => Some(Self::NChar),
            0xE7 => Some(Self::NVarChar),
            0x23 => Some(Self::Text),
            0x22 => Some(Self::Image),
            0x63 => Some(Self::NText),
            0x28 => Some(Self::Date),
            0x29 => Some(Self::Time),
            0x2A => Some(Self::DateTime2),
            0x2B => Some(Self::DateTimeOffset),
            0x62 => Some(Self::Variant),
            0xF0 => Some(Self::Udt),
            0xF1 => Some(Self::Xml),
            0xF3 => Some(Self::Tvp),
            _ => None,
        }
    }

    /// Fixed value width for types that carry no length prefix.
    #[must_use]
    pub const fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Null => Some(0),
            Self::Int1 | Self::Bit => Some(1),
            Self::Int2 => Some(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => Some(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => Some(8),
            _ => None,
        }
    }

    /// Whether values of this type are length-less fixed width.
    #[must_use]
    pub const fn is_fixed_length(&self) -> bool {
        self.fixed_size().is_some()
    }
}

/// SQL Server collation attached to character columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Collation {
    /// Locale ID and comparison flags.
    pub lcid: u32,
    /// Sort ID.
    pub sort_id: u8,
}

impl Collation {
    /// Wire size of a collation.
    pub const SIZE: usize = 5;

    /// Decode from the 5-byte wire form.
    #[must_use]
    pub fn from_bytes(raw: [u8; 5]) -> Self {
        Self {
            lcid: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            sort_id: raw[4],
        }
    }
}

/// Type-specific metadata decoded from TYPE_INFO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeInfo {
    /// Declared maximum length, for length-prefixed types.
    pub max_length: Option<u32>,
    /// Precision for DECIMAL/NUMERIC.
    pub precision: Option<u8>,
    /// Scale for DECIMAL/NUMERIC and the time family.
    pub scale: Option<u8>,
    /// Collation for character types.
    pub collation: Option<Collation>,
}

/// Shape of the TYPE_INFO block following a type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeInfoLayout {
    /// Nothing follows the type byte.
    Empty,
    /// One-byte maximum length.
    ByteLen,
    /// One-byte maximum length, precision and scale.
    ByteLenPrecisionScale,
    /// One scale byte (TIME, DATETIME2, DATETIMEOFFSET).
    Scale,
    /// Two-byte maximum length, optionally followed by a collation.
    UShortLen {
        /// A 5-byte collation follows.
        collation: bool,
    },
    /// Four-byte maximum length (TEXT, NTEXT, IMAGE), then an optional
    /// collation and a multi-part table name.
    LongLen {
        /// A 5-byte collation follows.
        collation: bool,
    },
    /// Four-byte maximum length (SQL_VARIANT).
    VariantLen,
    /// XML schema presence byte and optional schema names.
    Xml,
    /// UDT: two-byte max length plus four names.
    Udt,
}

/// Length encoding of a column value inside ROW/NBCROW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueEncoding {
    /// Exactly this many bytes, never null.
    Fixed(usize),
    /// One-byte length; zero means null.
    ByteLen,
    /// Two-byte length; 0xFFFF means null.
    UShortLen,
    /// Four-byte length; zero means null (SQL_VARIANT).
    LongLen,
    /// Text pointer, timestamp and four-byte length (TEXT, NTEXT, IMAGE).
    TextPtr,
    /// Partially length-prefixed chunks.
    Plp,
}

/// Null marker for two-byte lengths.
pub const USHORT_NULL: u16 = 0xFFFF;

/// PLP total length meaning null.
pub const PLP_NULL: u64 = u64::MAX;

/// PLP total length meaning "unknown, read until the terminator chunk".
pub const PLP_UNKNOWN_LEN: u64 = u64::MAX - 1;

/// Max-length marker selecting PLP encoding for `(max)` types.
pub const MAX_LEN_PLP: u32 = 0xFFFF;

/// The type/metadata collaborator consulted while decoding results.
pub trait MetaTypeService: Send + Sync {
    /// TYPE_INFO layout for a type.
    fn layout(&self, type_id: TypeId) -> TypeInfoLayout;

    /// Value encoding for a column of this type and metadata.
    fn value_encoding(&self, type_id: TypeId, info: &TypeInfo) -> ValueEncoding;
}

/// Built-in catalog of the TDS 7.4 types.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinMetaTypes;

impl MetaTypeService for BuiltinMetaTypes {
    fn layout(&self, type_id: TypeId) -> TypeInfoLayout {
        use TypeId::*;
        match type_id {
            Null | Int1 | Bit | Int2 | Int4 | Int8 | Float4 | Float8 | Money | Money4
            | DateTime | DateTime4 | Date => TypeInfoLayout::Empty,
            Guid | IntN | BitN | FloatN | MoneyN | DateTimeN | Char | VarChar | Binary
            | VarBinary => TypeInfoLayout::ByteLen,
            Decimal | Numeric | DecimalN | NumericN => TypeInfoLayout::ByteLenPrecisionScale,
            Time | DateTime2 | DateTimeOffset => TypeInfoLayout::Scale,
            BigVarChar | BigChar | NVarChar | NChar => TypeInfoLayout::UShortLen { collation: true },
            BigVarBinary | BigBinary => TypeInfoLayout::UShortLen { collation: false },
            Text | NText => TypeInfoLayout::LongLen { collation: true },
            Image => TypeInfoLayout::LongLen { collation: false },
            Variant => TypeInfoLayout::VariantLen,
            Xml => TypeInfoLayout::Xml,
            Udt => TypeInfoLayout::Udt,
            Tvp => TypeInfoLayout::Empty,
        }
    }

    fn value_encoding(&self, type_id: TypeId, info: &TypeInfo) -> ValueEncoding {
        if let Some(size) = type_id.fixed_size() {
            return ValueEncoding::Fixed(size);
        }
        match self.layout(type_id) {
            TypeInfoLayout::UShortLen { .. } if info.max_length == Some(MAX_LEN_PLP) => {
                ValueEncoding::Plp
            }
            TypeInfoLayout::UShortLen { .. } => ValueEncoding::UShortLen,
            TypeInfoLayout::LongLen { .. } => ValueEncoding::TextPtr,
            TypeInfoLayout::VariantLen => ValueEncoding::LongLen,
            TypeInfoLayout::Xml | TypeInfoLayout::Udt => ValueEncoding::Plp,
            TypeInfoLayout::Empty
            | TypeInfoLayout::ByteLen
            | TypeInfoLayout::ByteLenPrecisionScale
            | TypeInfoLayout::Scale => ValueEncoding::ByteLen,
        }
    }
}

bitflags! {
    /// Column flags from COLMETADATA.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Case-sensitive comparison.
        const CASE_SENSITIVE = 0x0002;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0400;
        /// Encrypted column.
        const ENCRYPTED = 0x0800;
        /// Hidden (browse-mode key) column.
        const HIDDEN = 0x2000;
        /// Key column.
        const KEY = 0x4000;
        /// Nullability unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}
