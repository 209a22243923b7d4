//! NaN-boxed script values
//!
//! A [`Value`] is a single 64-bit word. Doubles are stored as-is; every other
//! kind lives in the NaN space with a type tag in the upper 32 bits. Object
//! references keep their address in the low 48 bits, which is what lets the
//! conservative stack scanner recognise them in raw stack memory.

use std::fmt;

use crate::object::ObjectRef;

const NAN_MASK: u32 = 0x7ff8_0000;
const TYPE_MASK: u32 = 0x7fff_0000;
const TAG_SHIFT: u32 = 32;

const UNDEFINED_TAG: u32 = NAN_MASK | 0x7_0000;
const NULL_TAG: u32 = NAN_MASK;
const BOOLEAN_TAG: u32 = NAN_MASK | 0x1_0000;
const OBJECT_TAG: u32 = NAN_MASK | 0x3_0000;

/// Bit pattern every NaN double is normalised to, chosen outside the tag space.
const CANONICAL_NAN: u64 = 0x7ff4_0000_0000_0000;

/// Mask that strips the type tag from an object reference
const PAYLOAD_MASK: u64 = !((TYPE_MASK as u64) << TAG_SHIFT);

/// Largest address an object reference can carry
const MAX_OBJECT_ADDRESS: usize = (1 << 48) - 1;

/// Tagged script value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

/// Kind of value held in a [`Value`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// `true` / `false`
    Boolean,
    /// IEEE-754 double
    Number,
    /// Reference to a heap object
    Object,
}

impl Value {
    /// `undefined`
    #[inline]
    pub const fn undefined() -> Self {
        Self((UNDEFINED_TAG as u64) << TAG_SHIFT)
    }

    /// `null`
    #[inline]
    pub const fn null() -> Self {
        Self((NULL_TAG as u64) << TAG_SHIFT)
    }

    /// Boolean value
    #[inline]
    pub const fn boolean(b: bool) -> Self {
        Self(((BOOLEAN_TAG as u64) << TAG_SHIFT) | b as u64)
    }

    /// Number value
    #[inline]
    pub fn number(n: f64) -> Self {
        if n.is_nan() {
            Self(CANONICAL_NAN)
        } else {
            Self(n.to_bits())
        }
    }

    /// Reference to a heap object
    #[inline]
    pub fn object(obj: ObjectRef) -> Self {
        let addr = obj.addr();
        debug_assert!(addr <= MAX_OBJECT_ADDRESS, "object address out of range");
        Self(addr as u64 | ((OBJECT_TAG as u64) << TAG_SHIFT))
    }

    /// Reinterpret a raw word as a value
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw word
    #[inline]
    pub const fn to_bits(self) -> u64 {
        self.0
    }

    #[inline]
    const fn tag(self) -> u32 {
        (self.0 >> TAG_SHIFT) as u32
    }

    /// Classify this value
    pub const fn kind(self) -> ValueKind {
        let tag = self.tag();
        if tag & NAN_MASK != NAN_MASK {
            return ValueKind::Number;
        }
        match tag & TYPE_MASK {
            UNDEFINED_TAG => ValueKind::Undefined,
            BOOLEAN_TAG => ValueKind::Boolean,
            OBJECT_TAG => ValueKind::Object,
            _ => ValueKind::Null,
        }
    }

    /// Is this `undefined`?
    #[inline]
    pub const fn is_undefined(self) -> bool {
        matches!(self.kind(), ValueKind::Undefined)
    }

    /// Is this `null`?
    #[inline]
    pub const fn is_null(self) -> bool {
        matches!(self.kind(), ValueKind::Null)
    }

    /// Is this a number?
    #[inline]
    pub const fn is_number(self) -> bool {
        matches!(self.kind(), ValueKind::Number)
    }

    /// Does this value claim to reference a heap object?
    #[inline]
    pub const fn is_object(self) -> bool {
        matches!(self.kind(), ValueKind::Object)
    }

    /// Boolean payload
    pub const fn as_boolean(self) -> Option<bool> {
        match self.kind() {
            ValueKind::Boolean => Some(self.0 & 1 == 1),
            _ => None,
        }
    }

    /// Number payload
    pub fn as_number(self) -> Option<f64> {
        self.is_number().then(|| f64::from_bits(self.0))
    }

    /// Raw address carried by an object reference, without validating it.
    #[inline]
    pub const fn object_address(self) -> Option<usize> {
        if self.is_object() {
            Some((self.0 & PAYLOAD_MASK) as usize)
        } else {
            None
        }
    }

    /// Object reference payload
    #[inline]
    pub fn as_object(self) -> Option<ObjectRef> {
        self.object_address().and_then(ObjectRef::from_addr)
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::undefined()
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Self::object(obj)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::boolean(b)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::Undefined => f.write_str("undefined"),
            ValueKind::Null => f.write_str("null"),
            ValueKind::Boolean => write!(f, "{}", self.0 & 1 == 1),
            ValueKind::Number => write!(f, "{}", f64::from_bits(self.0)),
            ValueKind::Object => write!(f, "[object {:#x}]", self.0 & PAYLOAD_MASK),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_kinds() {
        assert!(Value::undefined().is_undefined());
        assert!(Value::null().is_null());
        assert_eq!(Value::boolean(true).as_boolean(), Some(true));
        assert_eq!(Value::boolean(false).as_boolean(), Some(false));
        assert_eq!(Value::number(1.5).as_number(), Some(1.5));
        assert_eq!(Value::default(), Value::undefined());
    }

    #[test]
    fn test_nan_stays_a_number() {
        let v = Value::number(f64::NAN);
        assert!(v.is_number());
        assert!(v.as_number().unwrap().is_nan());

        let negative_nan = f64::from_bits(0xfff8_0000_0000_0000);
        assert!(Value::number(negative_nan).is_number());
    }

    #[test]
    fn test_object_roundtrip() {
        let obj = ObjectRef::from_addr(0x7f12_3456_7890).unwrap();
        let v = Value::object(obj);
        assert!(v.is_object());
        assert!(!v.is_number());
        assert_eq!(v.object_address(), Some(0x7f12_3456_7890));
        assert_eq!(v.as_object(), Some(obj));
    }

    #[test]
    fn test_numbers_never_claim_objects() {
        for n in [0.0, -0.0, 1.0, f64::INFINITY, f64::NEG_INFINITY, 1e300] {
            assert_eq!(Value::number(n).object_address(), None);
        }
        // A plain pointer-sized integer is a denormal double, not an object
        assert!(!Value::from_bits(0x7f12_3456_7890).is_object());
    }
}
