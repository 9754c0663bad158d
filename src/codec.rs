//! Big-endian fixed-point packing for CAN payloads.
//!
//! Every telemetry value crosses the bus as an integer: engineering units are
//! multiplied by a scale factor (x10, x100) before encoding and multiplied by
//! the inverse (x0.1) after decoding.
//!
//! Nothing here can fail. Scaled values go through Rust's `as` cast, which
//! truncates toward zero, saturates at the target type's bounds and maps NaN
//! to zero. An out-of-range value silently clamps instead of being rejected,
//! and 80.49 Ah goes out as 804, byte for byte what the battery firmware
//! sends. The host controller only ever sees what fits in the wire type.

/// Integer types that can be written to and read from a frame payload.
pub trait WireInt: Copy {
    const SIZE: usize;

    fn write_be(self, out: &mut [u8]);
    fn read_be(bytes: &[u8]) -> Self;
}

macro_rules! impl_wire_int {
    ($($ty:ty),*) => {
        $(
            impl WireInt for $ty {
                const SIZE: usize = core::mem::size_of::<$ty>();

                fn write_be(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
                }

                fn read_be(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_be_bytes(raw)
                }
            }
        )*
    };
}

impl_wire_int!(u8, i8, u16, i16, u32, i32);

/// Write `value` big-endian into `buffer[offset..offset + T::SIZE]`.
///
/// Panics if the slot does not fit in `buffer`; frame layouts are fixed so
/// that is a programming error, not a runtime condition.
pub fn encode<T: WireInt>(buffer: &mut [u8], offset: usize, value: T) {
    value.write_be(&mut buffer[offset..offset + T::SIZE]);
}

/// Exact inverse of [`encode`].
pub fn decode<T: WireInt>(buffer: &[u8], offset: usize) -> T {
    T::read_be(&buffer[offset..offset + T::SIZE])
}

/// Scale factors used by the HVS frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scale {
    /// Tenths (volts, amps, degrees, amp-hours).
    Deci,
    /// Hundredths (percentages).
    Centi,
    /// Raw integer.
    Unit,
}

impl Scale {
    pub fn factor(self) -> f32 {
        match self {
            Scale::Deci => 10.0,
            Scale::Centi => 100.0,
            Scale::Unit => 1.0,
        }
    }
}

/// Fixed-point conversion from engineering units to a wire integer.
pub trait FromScaled: WireInt {
    fn from_scaled(value: f32, scale: Scale) -> Self;
    fn to_unscaled(self, scale: Scale) -> f32;
}

macro_rules! impl_from_scaled {
    ($($ty:ty),*) => {
        $(
            impl FromScaled for $ty {
                #[allow(clippy::cast_precision_loss)]
                fn from_scaled(value: f32, scale: Scale) -> Self {
                    (value * scale.factor()) as $ty
                }

                #[allow(clippy::cast_precision_loss, clippy::cast_lossless)]
                fn to_unscaled(self, scale: Scale) -> f32 {
                    self as f32 / scale.factor()
                }
            }
        )*
    };
}

impl_from_scaled!(u16, i16, u32);

/// Scale `value` and write it as `T`.
pub fn encode_scaled<T: FromScaled>(buffer: &mut [u8], offset: usize, value: f32, scale: Scale) {
    encode(buffer, offset, T::from_scaled(value, scale));
}

/// Read a `T` and convert it back to engineering units.
pub fn decode_scaled<T: FromScaled>(buffer: &[u8], offset: usize, scale: Scale) -> f32 {
    decode::<T>(buffer, offset).to_unscaled(scale)
}

/// Format a float the way telemetry payloads carry it: two decimals.
pub fn format_value(value: f32) -> alloc::string::String {
    alloc::format!("{value:.2}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_big_endian() {
        let mut buf = [0u8; 8];
        encode(&mut buf, 0, 0x1234u16);
        encode(&mut buf, 2, -2i16);
        encode(&mut buf, 4, 0xDEAD_BEEFu32);
        assert_eq!(buf, [0x12, 0x34, 0xFF, 0xFE, 0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_decode_inverts_encode() {
        let mut buf = [0u8; 8];
        encode(&mut buf, 3, 0x0308u16);
        assert_eq!(decode::<u16>(&buf, 3), 776);
        encode(&mut buf, 0, -1234i16);
        assert_eq!(decode::<i16>(&buf, 0), -1234);
    }

    #[test]
    fn test_scaled_encoding_truncates() {
        let mut buf = [0u8; 2];
        encode_scaled::<u16>(&mut buf, 0, 230.44, Scale::Deci);
        assert_eq!(decode::<u16>(&buf, 0), 2304);

        encode_scaled::<u16>(&mut buf, 0, 80.49, Scale::Deci);
        assert_eq!(decode::<u16>(&buf, 0), 804);

        // 0.53 x 100 is 52.999996 in f32.
        encode_scaled::<u16>(&mut buf, 0, 0.53, Scale::Centi);
        assert_eq!(decode::<u16>(&buf, 0), 52);

        encode_scaled::<i16>(&mut buf, 0, -4.35, Scale::Deci);
        assert_eq!(decode::<i16>(&buf, 0), -43);
    }

    #[test]
    fn test_scaled_sweep_matches_cast() {
        let mut buf = [0u8; 2];
        for scale in [Scale::Deci, Scale::Centi] {
            for step in 0..10_000u16 {
                let value = f32::from(step) / 100.0;
                encode_scaled::<u16>(&mut buf, 0, value, scale);
                let wire = decode::<u16>(&buf, 0);
                assert_eq!(wire, (value * scale.factor()) as u16);
                assert!((f32::from(wire) - value * scale.factor()).abs() < 1.0);
            }
            for step in -5_000..5_000i16 {
                let value = f32::from(step) / 100.0;
                encode_scaled::<i16>(&mut buf, 0, value, scale);
                let wire = decode::<i16>(&buf, 0);
                assert_eq!(wire, (value * scale.factor()) as i16);
                assert!((f32::from(wire) - value * scale.factor()).abs() < 1.0);
            }
        }
    }

    #[test]
    fn test_out_of_range_saturates() {
        let mut buf = [0u8; 2];
        encode_scaled::<u16>(&mut buf, 0, -5.0, Scale::Deci);
        assert_eq!(decode::<u16>(&buf, 0), 0);

        encode_scaled::<i16>(&mut buf, 0, 10_000.0, Scale::Deci);
        assert_eq!(decode::<i16>(&buf, 0), i16::MAX);

        encode_scaled::<u16>(&mut buf, 0, f32::NAN, Scale::Deci);
        assert_eq!(decode::<u16>(&buf, 0), 0);
    }

    #[test]
    fn test_decode_scaled() {
        let buf = [0x08, 0x66];
        let volts = decode_scaled::<u16>(&buf, 0, Scale::Deci);
        assert!((volts - 215.0).abs() < 1e-4);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(4.3), "4.30");
        assert_eq!(format_value(0.0), "0.00");
    }
}
