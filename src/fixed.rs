//! Fixed-point newtypes for the PPU's affine parameters (20.12) and
//! reference-point fractional math (12.4), per spec §9's redesign note:
//! replace the teacher's raw `i32`/`i16` register math with explicit
//! `from_int`/`raw`/`int` accessors and arithmetic realized through a wider
//! intermediate so multiply doesn't silently overflow before the shift.

use std::ops::{Add, Mul, Sub};

macro_rules! fixed_point {
    ($name:ident, $repr:ty, $wide:ty, $frac_bits:expr) => {
        #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
        pub struct $name($repr);

        impl $name {
            pub const FRAC_BITS: u32 = $frac_bits;

            #[inline]
            pub const fn from_raw(raw: $repr) -> Self {
                $name(raw)
            }

            #[inline]
            pub const fn from_int(value: i32) -> Self {
                $name(((value as $wide) << Self::FRAC_BITS) as $repr)
            }

            #[inline]
            pub const fn raw(self) -> $repr {
                self.0
            }

            #[inline]
            pub const fn int(self) -> i32 {
                (self.0 as $wide >> Self::FRAC_BITS) as i32
            }
        }

        impl Add for $name {
            type Output = $name;
            #[inline]
            fn add(self, rhs: $name) -> $name {
                $name(self.0.wrapping_add(rhs.0))
            }
        }

        impl Sub for $name {
            type Output = $name;
            #[inline]
            fn sub(self, rhs: $name) -> $name {
                $name(self.0.wrapping_sub(rhs.0))
            }
        }

        impl Mul for $name {
            type Output = $name;
            #[inline]
            fn mul(self, rhs: $name) -> $name {
                let wide = (self.0 as $wide) * (rhs.0 as $wide);
                $name((wide >> Self::FRAC_BITS) as $repr)
            }
        }
    };
}

fixed_point!(Affine, i32, i64, 8);
fixed_point!(RefPoint, i32, i64, 12);
fixed_point!(Mosaic, i16, i32, 4);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_int_and_back_round_trips() {
        assert_eq!(Affine::from_int(3).int(), 3);
        assert_eq!(RefPoint::from_int(-7).int(), -7);
    }

    #[test]
    fn multiply_shifts_by_frac_bits() {
        let a = Affine::from_int(2);
        let b = Affine::from_int(3);
        assert_eq!((a * b).int(), 6);
    }
}
