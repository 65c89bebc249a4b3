//! Bit-granular read/write cursor over a byte buffer.
//!
//! Bit `n` of the stream lives in bit `n % 8` of byte `n / 8`, so whole-byte
//! writes on a byte boundary land in memory unchanged and multi-byte values
//! come out little-endian on every host.

use std::sync::LazyLock;

use glam::Vec3;

pub const MAX_STRING: usize = 2048;

struct Masks {
    write: [[u32; 33]; 32],
    extra: [u32; 32],
}

static MASKS: LazyLock<Masks> = LazyLock::new(|| {
    let mut write = [[0u32; 33]; 32];
    let mut extra = [0u32; 32];

    for start in 0..32usize {
        for left in 0..33usize {
            let end = start + left;
            let mut mask = (1u32 << start) - 1;
            if end < 32 {
                mask |= !((1u32 << end) - 1);
            }
            write[start][left] = mask;
        }
    }

    for (bit, mask) in extra.iter_mut().enumerate() {
        *mask = (1u32 << bit) - 1;
    }

    Masks { write, extra }
});

#[derive(Debug, Clone)]
pub struct BitBuffer<T = Vec<u8>> {
    data: T,
    max_bits: usize,
    cur_bit: usize,
    overflow: bool,
}

impl BitBuffer<Vec<u8>> {
    pub fn with_capacity(bytes: usize) -> Self {
        Self::new(vec![0u8; bytes])
    }
}

impl<T: AsRef<[u8]>> BitBuffer<T> {
    pub fn new(data: T) -> Self {
        let max_bits = data.as_ref().len() * 8;
        Self {
            data,
            max_bits,
            cur_bit: 0,
            overflow: false,
        }
    }

    /// Positions the cursor at `start_bit` and limits the usable region to
    /// `max_bits` (clamped to the storage size).
    pub fn with_bits(data: T, start_bit: usize, max_bits: usize) -> Self {
        let max_bits = max_bits.min(data.as_ref().len() * 8);
        Self {
            data,
            max_bits,
            cur_bit: start_bit.min(max_bits),
            overflow: false,
        }
    }

    pub fn into_inner(self) -> T {
        self.data
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// The bytes covered by the cursor, rounded up to a whole byte.
    pub fn written(&self) -> &[u8] {
        &self.data.as_ref()[..self.bytes_written()]
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn clear(&mut self) {
        self.cur_bit = 0;
        self.overflow = false;
    }

    pub fn bits_written(&self) -> usize {
        self.cur_bit
    }

    pub fn bits_read(&self) -> usize {
        self.cur_bit
    }

    pub fn bytes_written(&self) -> usize {
        self.cur_bit.div_ceil(8)
    }

    pub fn bytes_read(&self) -> usize {
        self.cur_bit.div_ceil(8)
    }

    pub fn max_bits(&self) -> usize {
        self.max_bits
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bits >> 3
    }

    pub fn bits_left(&self) -> usize {
        self.max_bits - self.cur_bit
    }

    pub fn bytes_left(&self) -> usize {
        self.bits_left() >> 3
    }

    pub fn seek_to_bit(&mut self, bit: usize) {
        self.cur_bit = bit.min(self.max_bits);
    }

    pub fn seek_to_byte(&mut self, byte: usize) {
        self.seek_to_bit(byte << 3);
    }

    fn check_overflow(&mut self, nbits: usize) -> bool {
        if self.cur_bit + nbits > self.max_bits {
            self.overflow = true;
            self.cur_bit = self.max_bits;
        }
        self.overflow
    }

    fn load_word(&self, index: usize) -> u32 {
        let bytes = self.data.as_ref();
        let base = index * 4;
        let mut word = [0u8; 4];
        for (i, b) in word.iter_mut().enumerate() {
            if let Some(&v) = bytes.get(base + i) {
                *b = v;
            }
        }
        u32::from_le_bytes(word)
    }

    pub fn read_one_bit(&mut self) -> bool {
        if self.check_overflow(1) {
            return false;
        }
        let byte = self.data.as_ref()[self.cur_bit >> 3];
        let bit = (byte >> (self.cur_bit & 7)) & 1;
        self.cur_bit += 1;
        bit != 0
    }

    pub fn read_ubits(&mut self, nbits: u32) -> u32 {
        debug_assert!(nbits <= 32);
        if nbits == 0 {
            return 0;
        }
        let nbits = nbits.min(32) as usize;
        if self.check_overflow(nbits) {
            return 0;
        }

        let start = self.cur_bit & 31;
        let first = self.cur_bit >> 5;
        let last = (self.cur_bit + nbits - 1) >> 5;
        self.cur_bit += nbits;

        let mut value = self.load_word(first) >> start;
        if first != last {
            value |= self.load_word(last) << (32 - start);
        }

        if nbits < 32 {
            value &= MASKS.extra[nbits];
        }
        value
    }

    pub fn read_sbits(&mut self, nbits: u32) -> i32 {
        if nbits == 0 {
            return 0;
        }
        let raw = self.read_ubits(nbits);
        if nbits >= 32 {
            return raw as i32;
        }
        let shift = 32 - nbits;
        ((raw << shift) as i32) >> shift
    }

    pub fn read_bit_long(&mut self, nbits: u32, signed: bool) -> i32 {
        if signed {
            self.read_sbits(nbits)
        } else {
            self.read_ubits(nbits) as i32
        }
    }

    pub fn read_bits(&mut self, out: &mut [u8], nbits: usize) -> bool {
        let mut left = nbits;
        let mut pos = 0;

        while left >= 8 && pos < out.len() {
            out[pos] = self.read_ubits(8) as u8;
            pos += 1;
            left -= 8;
        }

        if left > 0 && pos < out.len() {
            out[pos] = self.read_ubits(left as u32) as u8;
        }

        !self.overflow
    }

    pub fn read_bit_angle(&mut self, nbits: u32) -> f32 {
        let shift = (1u64 << nbits) as f32;
        let raw = self.read_ubits(nbits);
        let angle = raw as f32 * (360.0 / shift);

        if angle < -180.0 {
            angle + 360.0
        } else if angle > 180.0 {
            angle - 360.0
        } else {
            angle
        }
    }

    pub fn read_char(&mut self) -> i8 {
        self.read_sbits(8) as i8
    }

    pub fn read_byte(&mut self) -> u8 {
        self.read_ubits(8) as u8
    }

    pub fn read_short(&mut self) -> i16 {
        self.read_sbits(16) as i16
    }

    pub fn read_word(&mut self) -> u16 {
        self.read_ubits(16) as u16
    }

    pub fn read_long(&mut self) -> i32 {
        self.read_sbits(32)
    }

    pub fn read_ulong(&mut self) -> u32 {
        self.read_ubits(32)
    }

    pub fn read_float(&mut self) -> f32 {
        f32::from_bits(self.read_ubits(32))
    }

    pub fn read_coord(&mut self) -> f32 {
        self.read_short() as f32 * (1.0 / 8.0)
    }

    pub fn read_vec3_coord(&mut self) -> Vec3 {
        Vec3::new(self.read_coord(), self.read_coord(), self.read_coord())
    }

    pub fn read_bytes(&mut self, out: &mut [u8]) -> bool {
        let nbits = out.len() * 8;
        self.read_bits(out, nbits)
    }

    pub fn read_string(&mut self) -> String {
        self.read_string_ext(MAX_STRING, false)
    }

    pub fn read_string_line(&mut self) -> String {
        self.read_string_ext(MAX_STRING, true)
    }

    /// Reads up to a NUL terminator (or newline when `line` is set), keeping
    /// at most `max_len - 1` characters. `%` is replaced with `.` so the text
    /// is safe to hand to printf-style consumers on the other side.
    pub fn read_string_ext(&mut self, max_len: usize, line: bool) -> String {
        let mut out = Vec::new();

        loop {
            let c = self.read_byte();
            if c == 0 || self.overflow || (line && c == b'\n') {
                break;
            }
            if out.len() + 1 < max_len {
                out.push(if c == b'%' { b'.' } else { c });
            }
        }

        String::from_utf8_lossy(&out).into_owned()
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> BitBuffer<T> {
    fn store_word(&mut self, index: usize, word: u32) {
        let bytes = self.data.as_mut();
        let base = index * 4;
        for (i, b) in word.to_le_bytes().into_iter().enumerate() {
            if let Some(slot) = bytes.get_mut(base + i) {
                *slot = b;
            }
        }
    }

    pub fn write_one_bit(&mut self, bit: bool) {
        if self.check_overflow(1) {
            return;
        }
        let index = self.cur_bit >> 3;
        let mask = 1u8 << (self.cur_bit & 7);
        let bytes = self.data.as_mut();
        if bit {
            bytes[index] |= mask;
        } else {
            bytes[index] &= !mask;
        }
        self.cur_bit += 1;
    }

    pub fn write_ubits(&mut self, value: u32, nbits: u32) {
        debug_assert!(nbits <= 32);
        if nbits == 0 {
            return;
        }
        let nbits = nbits.min(32) as usize;
        if self.check_overflow(nbits) {
            return;
        }

        let mut value = if nbits < 32 {
            value & MASKS.extra[nbits]
        } else {
            value
        };

        let start = self.cur_bit & 31;
        let index = self.cur_bit >> 5;
        let first_fit = (32 - start).min(nbits);

        let word = (self.load_word(index) & MASKS.write[start][first_fit]) | (value << start);
        self.store_word(index, word);

        if first_fit < nbits {
            let rest = nbits - first_fit;
            value >>= first_fit;
            let word = (self.load_word(index + 1) & MASKS.write[0][rest]) | value;
            self.store_word(index + 1, word);
        }

        self.cur_bit += nbits;
    }

    pub fn write_sbits(&mut self, value: i32, nbits: u32) {
        self.write_ubits(value as u32, nbits);
    }

    pub fn write_bit_long(&mut self, value: i32, nbits: u32, signed: bool) {
        if signed {
            self.write_sbits(value, nbits);
        } else {
            self.write_ubits(value as u32, nbits);
        }
    }

    pub fn write_bits(&mut self, data: &[u8], nbits: usize) -> bool {
        if self.check_overflow(nbits) {
            return false;
        }

        let mut left = nbits;
        let mut pos = 0;

        while left >= 8 && pos < data.len() {
            self.write_ubits(data[pos] as u32, 8);
            pos += 1;
            left -= 8;
        }

        if left > 0 && pos < data.len() {
            self.write_ubits(data[pos] as u32, left as u32);
        }

        !self.overflow
    }

    pub fn write_bit_angle(&mut self, angle: f32, nbits: u32) {
        let angle = angle.rem_euclid(360.0);
        let shift = 1u64 << nbits;
        let mask = (shift - 1) as u32;
        let d = ((angle as f64 * shift as f64) / 360.0) as u32 & mask;
        self.write_ubits(d, nbits);
    }

    pub fn write_char(&mut self, value: i8) {
        self.write_sbits(value as i32, 8);
    }

    pub fn write_byte(&mut self, value: u8) {
        self.write_ubits(value as u32, 8);
    }

    pub fn write_short(&mut self, value: i16) {
        self.write_sbits(value as i32, 16);
    }

    pub fn write_word(&mut self, value: u16) {
        self.write_ubits(value as u32, 16);
    }

    pub fn write_long(&mut self, value: i32) {
        self.write_sbits(value, 32);
    }

    pub fn write_ulong(&mut self, value: u32) {
        self.write_ubits(value, 32);
    }

    pub fn write_float(&mut self, value: f32) {
        self.write_ubits(value.to_bits(), 32);
    }

    pub fn write_coord(&mut self, value: f32) {
        self.write_short((value * 8.0) as i16);
    }

    pub fn write_vec3_coord(&mut self, value: Vec3) {
        self.write_coord(value.x);
        self.write_coord(value.y);
        self.write_coord(value.z);
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> bool {
        self.write_bits(data, data.len() * 8)
    }

    /// Writes the string followed by a NUL terminator. Returns false when the
    /// buffer overflowed.
    pub fn write_string(&mut self, value: &str) -> bool {
        for &c in value.as_bytes() {
            if c == 0 {
                break;
            }
            self.write_byte(c);
        }
        self.write_byte(0);
        !self.overflow
    }

    /// Removes `count` bits starting at `start`, shifting the tail of the
    /// readable region down. The cursor is left at `start`.
    pub fn excise_bits(&mut self, start: usize, count: usize) {
        let end = (start + count).min(self.max_bits);
        let count = end - start;
        let tail = self.max_bits - end;

        for i in 0..tail {
            self.cur_bit = end + i;
            let bit = self.read_one_bit();
            self.cur_bit = start + i;
            self.write_one_bit(bit);
        }

        self.max_bits -= count;
        self.cur_bit = start.min(self.max_bits);
        self.overflow = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths_round_trip() {
        let mut buf = BitBuffer::with_capacity(64);
        buf.write_one_bit(true);
        buf.write_ubits(5, 3);
        buf.write_ubits(0xABCDE, 20);
        buf.write_sbits(-3, 7);
        buf.write_ubits(u32::MAX, 32);
        buf.write_float(12.5);

        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        assert!(read.read_one_bit());
        assert_eq!(read.read_ubits(3), 5);
        assert_eq!(read.read_ubits(20), 0xABCDE);
        assert_eq!(read.read_sbits(7), -3);
        assert_eq!(read.read_ubits(32), u32::MAX);
        assert_eq!(read.read_float(), 12.5);
        assert_eq!(read.bits_left(), 0);
        assert!(!read.is_overflowed());
    }

    #[test]
    fn test_byte_layout_is_little_endian() {
        let mut buf = BitBuffer::with_capacity(8);
        buf.write_long(0x0403_0201);
        buf.write_word(0x0605);
        assert_eq!(buf.written(), &[1, 2, 3, 4, 5, 6]);

        let mut buf = BitBuffer::with_capacity(1);
        buf.write_ubits(0b1, 1);
        buf.write_ubits(0b10, 2);
        assert_eq!(buf.data()[0], 0b101);
    }

    #[test]
    fn test_write_overflow_sets_flag() {
        let mut buf = BitBuffer::with_capacity(2);
        buf.write_ubits(0x7F, 7);
        buf.write_ubits(0x3FF, 10);
        assert!(buf.is_overflowed());
        assert_eq!(buf.bits_written(), 16);
        assert_eq!(buf.data()[1], 0);
    }

    #[test]
    fn test_read_overflow_returns_zero() {
        let mut buf = BitBuffer::new(&[0xFFu8][..]);
        assert_eq!(buf.read_ubits(4), 0xF);
        assert_eq!(buf.read_ubits(8), 0);
        assert!(buf.is_overflowed());
        assert_eq!(buf.read_string(), "");
    }

    #[test]
    fn test_string_round_trip() {
        let mut buf = BitBuffer::with_capacity(32);
        buf.write_one_bit(true);
        assert!(buf.write_string("100%"));
        buf.write_string("");

        let mut read = BitBuffer::new(buf.into_inner());
        read.read_one_bit();
        assert_eq!(read.read_string(), "100.");
        assert_eq!(read.read_string(), "");
    }

    #[test]
    fn test_string_line_and_bound() {
        let mut buf = BitBuffer::with_capacity(32);
        buf.write_string("first\nsecond");

        let mut read = BitBuffer::new(buf.data().to_vec());
        assert_eq!(read.read_string_line(), "first");
        assert_eq!(read.read_string_ext(4, false), "sec");
    }

    #[test]
    fn test_bit_angle() {
        let mut buf = BitBuffer::with_capacity(16);
        buf.write_bit_angle(90.0, 16);
        buf.write_bit_angle(-90.0, 16);
        buf.write_bit_angle(450.0, 8);

        let mut read = BitBuffer::new(buf.into_inner());
        assert_eq!(read.read_bit_angle(16), 90.0);
        assert_eq!(read.read_bit_angle(16), -90.0);
        assert_eq!(read.read_bit_angle(8), 90.0);
    }

    #[test]
    fn test_coord() {
        let mut buf = BitBuffer::with_capacity(8);
        buf.write_vec3_coord(Vec3::new(1.5, -2.25, 100.0));
        let mut read = BitBuffer::new(buf.into_inner());
        assert_eq!(read.read_vec3_coord(), Vec3::new(1.5, -2.25, 100.0));
    }

    #[test]
    fn test_excise_bits() {
        let mut buf = BitBuffer::with_capacity(4);
        buf.write_byte(0xAA);
        buf.write_byte(0x11);
        buf.write_byte(0x22);
        buf.write_byte(0xBB);

        buf.excise_bits(8, 16);
        assert_eq!(buf.max_bits(), 16);
        assert_eq!(buf.bits_read(), 8);

        buf.seek_to_bit(0);
        assert_eq!(buf.read_byte(), 0xAA);
        assert_eq!(buf.read_byte(), 0xBB);
    }

    #[test]
    fn test_raw_bits_unaligned() {
        let mut buf = BitBuffer::with_capacity(8);
        buf.write_ubits(0b101, 3);
        buf.write_bits(&[0x12, 0x34, 0x05], 20);

        let mut read = BitBuffer::new(buf.into_inner());
        assert_eq!(read.read_ubits(3), 0b101);
        let mut out = [0u8; 3];
        read.read_bits(&mut out, 20);
        assert_eq!(out, [0x12, 0x34, 0x05]);
    }
}
