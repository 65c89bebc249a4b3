use bitflags::bitflags;

bitflags! {
    /// How a field is quantized on the wire. Only the low 10 bits travel in a
    /// table-definition message.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FieldFlags: u32 {
        const BYTE = 1 << 0;
        const SHORT = 1 << 1;
        const FLOAT = 1 << 2;
        const INTEGER = 1 << 3;
        const ANGLE = 1 << 4;
        const TIMEWINDOW_8 = 1 << 5;
        const TIMEWINDOW_BIG = 1 << 6;
        const STRING = 1 << 7;
        const SIGNED = 1 << 8;
    }
}

impl FieldFlags {
    pub const WIRE_BITS: u32 = 10;

    pub fn from_token(token: &str) -> Option<Self> {
        let flag = match token {
            "DT_BYTE" => Self::BYTE,
            "DT_SHORT" => Self::SHORT,
            "DT_FLOAT" => Self::FLOAT,
            "DT_INTEGER" => Self::INTEGER,
            "DT_ANGLE" => Self::ANGLE,
            "DT_TIMEWINDOW_8" => Self::TIMEWINDOW_8,
            "DT_TIMEWINDOW_BIG" => Self::TIMEWINDOW_BIG,
            "DT_STRING" => Self::STRING,
            "DT_SIGNED" => Self::SIGNED,
            _ => return None,
        };
        Some(flag)
    }

    pub fn is_signed(self) -> bool {
        self.contains(Self::SIGNED)
    }
}

/// A value read from or written into one record field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i32),
    Float(f32),
    Text(String),
}

impl FieldValue {
    pub fn as_f32(&self) -> f32 {
        match self {
            Self::Int(v) => *v as f32,
            Self::Float(v) => *v,
            Self::Text(_) => 0.0,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text(s) => s,
            _ => "",
        }
    }
}

/// One entry of a record table: which accessor slot it uses and how it is
/// scaled on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub slot: usize,
    pub flags: FieldFlags,
    pub bits: u32,
    pub multiplier: f32,
    pub post_multiplier: f32,
}

impl FieldDescriptor {
    pub fn is_string(&self) -> bool {
        self.flags.contains(FieldFlags::STRING)
    }

    /// Inclusive range representable in `bits` bits.
    pub fn range(&self) -> (i64, i64) {
        let bits = self.bits.clamp(1, 32);
        if self.flags.is_signed() {
            let half = 1i64 << (bits - 1);
            (-half, half - 1)
        } else {
            (0, (1i64 << bits) - 1)
        }
    }

    pub fn clamp(&self, value: i64) -> i32 {
        let (lo, hi) = self.range();
        // an unsigned 32-bit value above i32::MAX comes back as its bit pattern
        value.clamp(lo, hi) as u32 as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_tokens() {
        assert_eq!(FieldFlags::from_token("DT_FLOAT"), Some(FieldFlags::FLOAT));
        assert_eq!(FieldFlags::from_token("DT_SIGNED"), Some(FieldFlags::SIGNED));
        assert_eq!(FieldFlags::from_token("DT_VECTOR"), None);
        assert!(FieldFlags::all().bits() < 1 << FieldFlags::WIRE_BITS);
    }

    #[test]
    fn test_clamp_to_bit_range() {
        let mut field = FieldDescriptor {
            name: "gravity",
            slot: 0,
            flags: FieldFlags::FLOAT | FieldFlags::SIGNED,
            bits: 8,
            multiplier: 1.0,
            post_multiplier: 1.0,
        };
        assert_eq!(field.clamp(500), 127);
        assert_eq!(field.clamp(-500), -128);

        field.flags = FieldFlags::INTEGER;
        assert_eq!(field.clamp(-5), 0);
        assert_eq!(field.clamp(300), 255);

        field.bits = 32;
        assert_eq!(field.clamp(u32::MAX as i64), -1);
    }
}
