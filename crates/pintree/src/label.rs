//! label addressing for the fixed-shape tree
//!
//! a label is an unsigned integer of `bits_per_level * height` bits,
//! interpreted as `height` digits base `2^bits_per_level`: the most
//! significant digit selects the root's child, the least significant
//! selects the leaf. labels are only constructed through validation
//! against a shape, so a `Label` value always addresses a real leaf.

use crate::error::{Error, Result};

/// shape of the tree: fanout `2^bits_per_level`, `height` levels of edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeShape {
    bits_per_level: u8,
    height: u8,
}

impl TreeShape {
    /// create a shape, rejecting degenerate or oversized parameters
    pub fn new(bits_per_level: u8, height: u8) -> Result<Self> {
        if bits_per_level == 0 || height == 0 {
            return Err(Error::InvalidShape(
                "bits_per_level and height must be non-zero".into(),
            ));
        }
        let label_bits = bits_per_level as u32 * height as u32;
        if label_bits > 32 {
            return Err(Error::InvalidShape(format!(
                "label width {label_bits} bits exceeds the 32-bit limit"
            )));
        }
        Ok(Self { bits_per_level, height })
    }

    pub fn bits_per_level(&self) -> u8 {
        self.bits_per_level
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    /// number of children per inner node
    pub fn fanout(&self) -> usize {
        1 << self.bits_per_level
    }

    /// total number of addressable leaves
    pub fn num_labels(&self) -> u64 {
        1u64 << (self.bits_per_level as u32 * self.height as u32)
    }
}

impl Default for TreeShape {
    /// 14-bit labels as 7 digits base 4, 16384 leaves
    fn default() -> Self {
        Self { bits_per_level: 2, height: 7 }
    }
}

/// validated leaf address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label {
    value: u64,
    shape: TreeShape,
}

impl Label {
    /// validate a raw value against a shape
    pub fn new(value: u64, shape: TreeShape) -> Result<Self> {
        if value >= shape.num_labels() {
            return Err(Error::InvalidLabel(value));
        }
        Ok(Self { value, shape })
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn shape(&self) -> TreeShape {
        self.shape
    }

    /// digits base fanout, most significant (root's child selector) first
    pub fn digits(&self) -> Vec<usize> {
        let fanout = self.shape.fanout() as u64;
        let mut digits = vec![0usize; self.shape.height() as usize];
        let mut v = self.value;
        for slot in digits.iter_mut().rev() {
            *slot = (v % fanout) as usize;
            v /= fanout;
        }
        digits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_rejects_zero() {
        assert!(TreeShape::new(0, 7).is_err());
        assert!(TreeShape::new(2, 0).is_err());
    }

    #[test]
    fn test_shape_rejects_oversized_labels() {
        assert!(TreeShape::new(8, 5).is_err());
    }

    #[test]
    fn test_default_shape() {
        let shape = TreeShape::default();
        assert_eq!(shape.fanout(), 4);
        assert_eq!(shape.num_labels(), 16384);
    }

    #[test]
    fn test_label_bounds() {
        let shape = TreeShape::new(2, 2).unwrap();
        assert!(Label::new(15, shape).is_ok());
        assert!(Label::new(16, shape).is_err());
    }

    #[test]
    fn test_digits_most_significant_first() {
        let shape = TreeShape::new(2, 3).unwrap();
        // 0b01_10_11 = 27: digits 1, 2, 3
        let label = Label::new(27, shape).unwrap();
        assert_eq!(label.digits(), vec![1, 2, 3]);
    }
}
