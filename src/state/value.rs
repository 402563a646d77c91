//! Payloads a versioned slot can hold.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a slot payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    /// `f64` elements.
    Real,
    /// `i64` elements.
    Integer,
    /// `bool` elements.
    Boolean,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Real => "real",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
        };
        f.write_str(s)
    }
}

/// Current (or stored) contents of a slot.
///
/// The set of shapes is closed: every participant in the model graph knows
/// at construction time which variant a slot carries.
///
/// # Examples
///
/// ```
/// use mhchain::SlotValue;
///
/// let v = SlotValue::Real(vec![0.5, 1.5]);
/// assert_eq!(v.len(), 2);
/// assert_eq!(v.as_f64(1), Some(1.5));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum SlotValue {
    /// Real elements.
    Real(Vec<f64>),
    /// Integer elements.
    Integer(Vec<i64>),
    /// Boolean elements.
    Boolean(Vec<bool>),
}

impl SlotValue {
    /// The element type.
    #[must_use]
    pub const fn kind(&self) -> SlotKind {
        match self {
            Self::Real(_) => SlotKind::Real,
            Self::Integer(_) => SlotKind::Integer,
            Self::Boolean(_) => SlotKind::Boolean,
        }
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Real(v) => v.len(),
            Self::Integer(v) => v.len(),
            Self::Boolean(v) => v.len(),
        }
    }

    /// Whether there are no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Real elements, if this is a real payload.
    #[must_use]
    pub fn as_reals(&self) -> Option<&[f64]> {
        match self {
            Self::Real(v) => Some(v),
            _ => None,
        }
    }

    /// Integer elements, if this is an integer payload.
    #[must_use]
    pub fn as_integers(&self) -> Option<&[i64]> {
        match self {
            Self::Integer(v) => Some(v),
            _ => None,
        }
    }

    /// Boolean elements, if this is a boolean payload.
    #[must_use]
    pub fn as_booleans(&self) -> Option<&[bool]> {
        match self {
            Self::Boolean(v) => Some(v),
            _ => None,
        }
    }

    /// Element `index` widened to `f64` (booleans map to 0/1).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self, index: usize) -> Option<f64> {
        match self {
            Self::Real(v) => v.get(index).copied(),
            Self::Integer(v) => v.get(index).map(|x| *x as f64),
            Self::Boolean(v) => v.get(index).map(|b| if *b { 1.0 } else { 0.0 }),
        }
    }

    /// Whether `other` has the same kind and dimension.
    #[must_use]
    pub fn same_shape(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.len() == other.len()
    }

    /// Little-endian byte image, used for checksums.
    pub(crate) fn write_bytes(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::Real(v) => {
                for x in v {
                    hasher.update(&x.to_bits().to_le_bytes());
                }
            }
            Self::Integer(v) => {
                for x in v {
                    hasher.update(&x.to_le_bytes());
                }
            }
            Self::Boolean(v) => {
                for b in v {
                    hasher.update(&[u8::from(*b)]);
                }
            }
        }
    }
}

impl fmt::Display for SlotValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real(v) => write_joined(f, v),
            Self::Integer(v) => write_joined(f, v),
            Self::Boolean(v) => write_joined(f, v),
        }
    }
}

fn write_joined<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(" ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Inclusive value range of a slot. Booleans ignore bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    /// Smallest allowed value.
    pub lower: f64,
    /// Largest allowed value.
    pub upper: f64,
}

impl Bounds {
    /// Inclusive range `[lower, upper]`.
    #[must_use]
    pub const fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// `(-inf, +inf)`
    #[must_use]
    pub const fn unbounded() -> Self {
        Self::new(f64::NEG_INFINITY, f64::INFINITY)
    }

    /// `[0, +inf)`
    #[must_use]
    pub const fn non_negative() -> Self {
        Self::new(0.0, f64::INFINITY)
    }

    /// Whether `x` lies within the bounds.
    #[must_use]
    pub fn contains(&self, x: f64) -> bool {
        x >= self.lower && x <= self.upper
    }

    /// Whether every element of `value` lies inside the bounds.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn admits(&self, value: &SlotValue) -> bool {
        match value {
            SlotValue::Real(v) => v.iter().all(|x| self.contains(*x)),
            SlotValue::Integer(v) => v.iter().all(|x| self.contains(*x as f64)),
            SlotValue::Boolean(_) => true,
        }
    }

    pub(crate) fn is_well_formed(&self) -> bool {
        !self.lower.is_nan() && !self.upper.is_nan() && self.lower <= self.upper
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.lower, self.upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_to_f64() {
        assert_eq!(SlotValue::Integer(vec![3, -2]).as_f64(1), Some(-2.0));
        assert_eq!(SlotValue::Boolean(vec![false, true]).as_f64(1), Some(1.0));
        assert_eq!(SlotValue::Real(vec![0.25]).as_f64(4), None);
    }

    #[test]
    fn shape_compares_kind_and_length() {
        let a = SlotValue::Real(vec![1.0, 2.0]);
        assert!(a.same_shape(&SlotValue::Real(vec![0.0, 0.0])));
        assert!(!a.same_shape(&SlotValue::Real(vec![0.0])));
        assert!(!a.same_shape(&SlotValue::Integer(vec![0, 0])));
    }

    #[test]
    fn bounds_admit() {
        let b = Bounds::new(0.0, 1.0);
        assert!(b.admits(&SlotValue::Real(vec![0.0, 0.5, 1.0])));
        assert!(!b.admits(&SlotValue::Real(vec![1.5])));
        assert!(!b.admits(&SlotValue::Integer(vec![2])));
        assert!(b.admits(&SlotValue::Boolean(vec![true])));
        assert!(!Bounds::new(1.0, 0.0).is_well_formed());
    }

    #[test]
    fn display_is_space_separated() {
        assert_eq!(SlotValue::Integer(vec![1, 2, 3]).to_string(), "1 2 3");
        assert_eq!(Bounds::non_negative().to_string(), "(0,inf)");
    }
}
