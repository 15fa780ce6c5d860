/// Stable type tags identifying every object stored in a region.
///
/// The first payload word of every object starts with one of these values.
/// Tags below [`PRIMITIVE_THRESHOLD`] identify primitive element types; the
/// rest identify container shapes. The values are part of the wire format and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TypeTag {
    Bool = 1,
    Char = 2,
    UChar = 3,
    Short = 4,
    UShort = 5,
    Int = 6,
    UInt = 7,
    Long = 8,
    ULong = 9,
    LongLong = 10,
    ULongLong = 11,
    Float = 21,
    Double = 22,
    /// Distinct only at the type-encoding level; storage is a char array.
    Str = 101,
    List = 102,
    DictNode = 103,
    Dict = 104,
}

/// Tags below this value denote primitive element types.
pub(crate) const PRIMITIVE_THRESHOLD: i32 = 100;

impl TypeTag {
    pub(crate) fn from_raw(raw: i32) -> Option<TypeTag> {
        Some(match raw {
            1 => TypeTag::Bool,
            2 => TypeTag::Char,
            3 => TypeTag::UChar,
            4 => TypeTag::Short,
            5 => TypeTag::UShort,
            6 => TypeTag::Int,
            7 => TypeTag::UInt,
            8 => TypeTag::Long,
            9 => TypeTag::ULong,
            10 => TypeTag::LongLong,
            11 => TypeTag::ULongLong,
            21 => TypeTag::Float,
            22 => TypeTag::Double,
            101 => TypeTag::Str,
            102 => TypeTag::List,
            103 => TypeTag::DictNode,
            104 => TypeTag::Dict,
            _ => return None,
        })
    }

    /// Whether this tag denotes a primitive element type.
    #[inline]
    pub fn is_primitive(self) -> bool {
        (self as i32) < PRIMITIVE_THRESHOLD
    }

    /// Human-readable name, used in rendered output and error messages.
    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Bool => "bool",
            TypeTag::Char => "char",
            TypeTag::UChar => "uchar",
            TypeTag::Short => "short",
            TypeTag::UShort => "ushort",
            TypeTag::Int => "int",
            TypeTag::UInt => "uint",
            TypeTag::Long => "long",
            TypeTag::ULong => "ulong",
            TypeTag::LongLong => "longlong",
            TypeTag::ULongLong => "ulonglong",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::Str => "string",
            TypeTag::List => "list",
            TypeTag::DictNode => "dict node",
            TypeTag::Dict => "dict",
        }
    }

    /// Element width in bytes for primitive tags, 0 otherwise.
    pub(crate) fn elem_size(self) -> usize {
        match self {
            TypeTag::Bool | TypeTag::Char | TypeTag::UChar => 1,
            TypeTag::Short | TypeTag::UShort => 2,
            TypeTag::Int | TypeTag::UInt | TypeTag::Float => 4,
            TypeTag::Long | TypeTag::ULong | TypeTag::LongLong | TypeTag::ULongLong => 8,
            TypeTag::Double => 8,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for raw in [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 21, 22, 101, 102, 103, 104] {
            let tag = TypeTag::from_raw(raw).unwrap();
            assert_eq!(tag as i32, raw);
        }
        assert_eq!(TypeTag::from_raw(0), None);
        assert_eq!(TypeTag::from_raw(12), None);
        assert_eq!(TypeTag::from_raw(100), None);
    }

    #[test]
    fn primitives_sit_below_threshold() {
        assert!(TypeTag::Bool.is_primitive());
        assert!(TypeTag::Double.is_primitive());
        assert!(!TypeTag::List.is_primitive());
        assert!(!TypeTag::Dict.is_primitive());
    }

    #[test]
    fn element_sizes() {
        assert_eq!(TypeTag::Bool.elem_size(), 1);
        assert_eq!(TypeTag::Short.elem_size(), 2);
        assert_eq!(TypeTag::Int.elem_size(), 4);
        assert_eq!(TypeTag::Long.elem_size(), 8);
        assert_eq!(TypeTag::Float.elem_size(), 4);
        assert_eq!(TypeTag::Double.elem_size(), 8);
        assert_eq!(TypeTag::List.elem_size(), 0);
    }
}
