//! `Mask`: the small bitmask enumerating the value kinds a schema position
//! may accept (§3). Composition by bitwise OR expresses union-of-primitives
//! and optionality.

use std::ops::{BitOr, BitOrAssign};

/// One bit per fundamental/complex kind, plus three format flags.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Hash)]
pub struct Mask(u16);

macro_rules! mask_bits {
    ($($name:ident = $bit:expr;)*) => {
        impl Mask {
            $(pub const $name: Mask = Mask(1 << $bit);)*

            pub const NONE: Mask = Mask(0);

            /// True if `self` shares at least one bit with `other` —
            /// `typeMask(value) & def.mask != 0`.
            pub const fn intersects(self, other: Mask) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn contains(self, other: Mask) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn bits(self) -> u16 {
                self.0
            }

            pub const fn from_bits(bits: u16) -> Mask {
                Mask(bits)
            }
        }
    };
}

mask_bits! {
    UNDEFINED = 0;
    NULL = 1;
    NUMBER = 2;
    STRING = 3;
    BOOLEAN = 4;
    OBJECT = 5;
    ARRAY = 6;
    ID = 7;
    RECORD = 8;
    UNION = 9;
    ENTITY = 10;
    HAS_STRING_FORMAT = 11;
    HAS_NUMBER_FORMAT = 12;
    HAS_SUB_ENTITY = 13;
}

impl BitOr for Mask {
    type Output = Mask;
    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl Mask {
    /// Widens the mask with `null` (§4.1 `nullable`).
    pub const fn nullable(self) -> Mask {
        Mask(self.0 | Mask::NULL.0)
    }

    /// Widens the mask with `undefined` (§4.1 `optional`).
    pub const fn optional(self) -> Mask {
        Mask(self.0 | Mask::UNDEFINED.0)
    }

    /// Widens the mask with both `null` and `undefined` (§4.1 `nullish`).
    pub const fn nullish(self) -> Mask {
        Mask(self.0 | Mask::NULL.0 | Mask::UNDEFINED.0)
    }

    /// The runtime kind bits a parsed JSON value actually presents.
    pub fn of_json(value: &serde_json::Value) -> Mask {
        match value {
            serde_json::Value::Null => Mask::NULL,
            serde_json::Value::Bool(_) => Mask::BOOLEAN,
            serde_json::Value::Number(_) => Mask::NUMBER,
            serde_json::Value::String(_) => Mask::STRING,
            serde_json::Value::Array(_) => Mask::ARRAY,
            serde_json::Value::Object(_) => Mask::OBJECT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composition_is_bitwise_or() {
        let m = Mask::STRING | Mask::NUMBER;
        assert!(m.intersects(Mask::STRING));
        assert!(m.intersects(Mask::NUMBER));
        assert!(!m.intersects(Mask::BOOLEAN));
    }

    #[test]
    fn nullable_widens_with_null_only() {
        let m = Mask::STRING.nullable();
        assert!(m.intersects(Mask::NULL));
        assert!(!m.intersects(Mask::UNDEFINED));
    }

    #[test]
    fn of_json_matches_runtime_kind() {
        assert_eq!(Mask::of_json(&serde_json::json!("x")), Mask::STRING);
        assert_eq!(Mask::of_json(&serde_json::json!(1)), Mask::NUMBER);
        assert_eq!(Mask::of_json(&serde_json::json!(null)), Mask::NULL);
    }
}
