//! Field-by-field delta encoding against a baseline record.
//!
//! A delta is a changed-mask with one bit per table field followed by the
//! quantized value of every changed field, each in exactly the configured
//! number of bits.

use super::field::{FieldDescriptor, FieldFlags, FieldValue};
use super::record::DeltaRecord;
use super::table::{ActiveFields, RecordTable};
use crate::bitbuf::BitBuffer;
use crate::error::ProtocolError;

const TIMEWINDOW_8_SCALE: f64 = 100.0;

#[derive(Debug, PartialEq)]
enum Quantized<'a> {
    Int(i32),
    Text(&'a str),
}

fn angle_bits(angle: f32, bits: u32) -> i32 {
    let shift = 1u64 << bits.clamp(1, 32);
    let angle = (angle as f64).rem_euclid(360.0);
    (((angle * shift as f64) / 360.0) as u64 & (shift - 1)) as u32 as i32
}

fn scaled(field: &FieldDescriptor, value: &FieldValue) -> i64 {
    match value {
        FieldValue::Int(v) => {
            // unsigned fields see the i32 as its u32 bit pattern
            let v = if field.flags.is_signed() { *v as i64 } else { *v as u32 as i64 };
            if field.multiplier == 1.0 {
                v
            } else {
                (v as f64 * field.multiplier as f64).round() as i64
            }
        }
        FieldValue::Float(v) => (*v as f64 * field.multiplier as f64).round() as i64,
        FieldValue::Text(_) => 0,
    }
}

/// The value `field` would put on the wire for `value`.
fn quantize<'a>(field: &FieldDescriptor, value: &'a FieldValue, timebase: f32) -> Quantized<'a> {
    let flags = field.flags;

    if flags.contains(FieldFlags::STRING) {
        return Quantized::Text(value.as_str());
    }

    if flags.contains(FieldFlags::ANGLE) {
        return Quantized::Int(angle_bits(value.as_f32(), field.bits));
    }

    if flags.contains(FieldFlags::TIMEWINDOW_8) {
        let v = (value.as_f32() as f64 * TIMEWINDOW_8_SCALE).round() as i64;
        let base = (timebase as f64 * TIMEWINDOW_8_SCALE).round() as i64;
        return Quantized::Int(field.clamp(v - base));
    }

    if flags.contains(FieldFlags::TIMEWINDOW_BIG) {
        let delta = (value.as_f32() as f64 - timebase as f64) * field.multiplier as f64;
        return Quantized::Int(field.clamp(delta.round() as i64));
    }

    Quantized::Int(field.clamp(scaled(field, value)))
}

fn write_field<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    field: &FieldDescriptor,
    quantized: &Quantized<'_>,
) {
    match quantized {
        Quantized::Text(s) => {
            buf.write_string(s);
        }
        Quantized::Int(v) => {
            buf.write_bit_long(*v, field.bits, field.flags.is_signed());
        }
    }
}

fn read_raw<T: AsRef<[u8]>>(buf: &mut BitBuffer<T>, field: &FieldDescriptor) -> i64 {
    if field.flags.is_signed() {
        buf.read_sbits(field.bits) as i64
    } else {
        buf.read_ubits(field.bits) as i64
    }
}

/// Reads one field and converts it back to the shape of `current`.
fn read_field<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    field: &FieldDescriptor,
    current: &FieldValue,
    timebase: f32,
) -> FieldValue {
    let flags = field.flags;

    if flags.contains(FieldFlags::STRING) {
        return FieldValue::Text(buf.read_string());
    }

    let value = if flags.contains(FieldFlags::ANGLE) {
        buf.read_bit_angle(field.bits) as f64
    } else if flags.contains(FieldFlags::TIMEWINDOW_8) {
        timebase as f64 + read_raw(buf, field) as f64 / TIMEWINDOW_8_SCALE
    } else if flags.contains(FieldFlags::TIMEWINDOW_BIG) {
        timebase as f64 + read_raw(buf, field) as f64 / field.multiplier as f64
    } else {
        let raw = read_raw(buf, field);
        if matches!(current, FieldValue::Int(_))
            && field.multiplier == 1.0
            && field.post_multiplier == 1.0
        {
            return FieldValue::Int(raw as i32);
        }
        raw as f64 / field.multiplier as f64 / field.post_multiplier as f64
    };

    match current {
        FieldValue::Int(_) if !flags.is_signed() => {
            FieldValue::Int(value.trunc() as i64 as u32 as i32)
        }
        FieldValue::Int(_) => FieldValue::Int(value.trunc() as i32),
        _ => FieldValue::Float(value as f32),
    }
}

/// Per-field changed flags for `from -> to`, after the table's custom
/// encoder had its say.
pub fn changed_fields<R: DeltaRecord>(
    table: &RecordTable,
    from: &R,
    to: &R,
    timebase: f32,
) -> Vec<bool> {
    let mut active = ActiveFields::new(table);
    if let Some(encoder) = table.encoder() {
        encoder.encode(&mut active, from, to);
    }

    table
        .fields()
        .iter()
        .enumerate()
        .map(|(i, field)| {
            if !active.is_active(i) {
                return false;
            }
            match (from.get(field.slot), to.get(field.slot)) {
                (Some(a), Some(b)) => {
                    quantize(field, &a, timebase) != quantize(field, &b, timebase)
                }
                _ => false,
            }
        })
        .collect()
}

/// Writes the delta from `from` to `to` and returns how many fields changed.
/// The mask is written even when nothing changed.
pub fn write_delta<R: DeltaRecord, T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    table: &RecordTable,
    from: &R,
    to: &R,
    timebase: f32,
) -> Result<usize, ProtocolError> {
    if !table.is_initialised() {
        return Err(ProtocolError::TableNotReady(table.kind().name()));
    }

    let changed = changed_fields(table, from, to, timebase);
    for &bit in &changed {
        buf.write_one_bit(bit);
    }

    let mut count = 0;
    for (field, _) in table.fields().iter().zip(&changed).filter(|(_, c)| **c) {
        if let Some(value) = to.get(field.slot) {
            write_field(buf, field, &quantize(field, &value, timebase));
            count += 1;
        }
    }

    Ok(count)
}

/// Rebuilds a record from `from` plus the delta in `buf`. Fields not in the
/// mask keep their baseline value.
pub fn read_delta<R: DeltaRecord, T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    table: &RecordTable,
    from: &R,
    timebase: f32,
) -> Result<R, ProtocolError> {
    if !table.is_initialised() {
        return Err(ProtocolError::TableNotReady(table.kind().name()));
    }

    let changed: Vec<bool> = (0..table.len()).map(|_| buf.read_one_bit()).collect();

    let mut to = from.clone();
    for (field, _) in table.fields().iter().zip(&changed).filter(|(_, c)| **c) {
        let Some(current) = to.get(field.slot) else {
            continue;
        };
        let value = read_field(buf, field, &current, timebase);
        to.set(field.slot, value);
    }

    if buf.is_overflowed() {
        return Err(ProtocolError::Overflow);
    }
    Ok(to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaRegistry, EntityState, MoveVars, RecordKind, UserCmd};

    fn usercmd_table(text: &str) -> DeltaRegistry {
        DeltaRegistry::from_description(text).unwrap()
    }

    #[test]
    fn test_float_scaled_to_wire_value() {
        let reg = usercmd_table(
            "usercmd_t none { DEFINE_DELTA( forwardmove, DT_FLOAT | DT_SIGNED, 16, 8.0 ) }",
        );
        let table = reg.table(RecordKind::UserCmd);
        let from = UserCmd::default();
        let to = UserCmd {
            forwardmove: 12.375,
            ..UserCmd::default()
        };

        let mut buf = BitBuffer::with_capacity(16);
        assert_eq!(write_delta(&mut buf, table, &from, &to, 0.0).unwrap(), 1);
        let bits = buf.bits_written();
        assert_eq!(bits, 17);

        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        assert!(read.read_one_bit());
        assert_eq!(read.read_sbits(16), 99);

        read.seek_to_bit(0);
        let decoded: UserCmd = read_delta(&mut read, table, &from, 0.0).unwrap();
        assert_eq!(decoded.forwardmove, 12.375);
    }

    #[test]
    fn test_unchanged_fields_keep_baseline() {
        let reg = DeltaRegistry::builtin().unwrap();
        let table = reg.table(RecordKind::UserCmd);

        let from = UserCmd {
            msec: 16,
            buttons: 3,
            sidemove: -200.0,
            ..UserCmd::default()
        };
        let to = UserCmd {
            forwardmove: 400.0,
            ..from.clone()
        };

        let mut buf = BitBuffer::with_capacity(64);
        assert_eq!(write_delta(&mut buf, table, &from, &to, 0.0).unwrap(), 1);

        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        let decoded: UserCmd = read_delta(&mut read, table, &from, 0.0).unwrap();
        assert_eq!(decoded, to);
        assert_eq!(read.bits_left(), 0);
    }

    #[test]
    fn test_quantization_hides_small_changes() {
        let reg = DeltaRegistry::builtin().unwrap();
        let table = reg.table(RecordKind::UserCmd);

        let from = UserCmd {
            forwardmove: 100.0,
            ..UserCmd::default()
        };
        let to = UserCmd {
            forwardmove: 100.2,
            ..UserCmd::default()
        };

        let changed = changed_fields(table, &from, &to, 0.0);
        assert!(changed.iter().all(|c| !c));
    }

    #[test]
    fn test_values_clamped_to_bit_width() {
        let reg = usercmd_table("usercmd_t none { DEFINE_DELTA( msec, DT_BYTE, 4, 1.0 ) }");
        let table = reg.table(RecordKind::UserCmd);
        let from = UserCmd::default();
        let to = UserCmd {
            msec: 200,
            ..UserCmd::default()
        };

        let mut buf = BitBuffer::with_capacity(4);
        write_delta(&mut buf, table, &from, &to, 0.0).unwrap();
        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        let decoded: UserCmd = read_delta(&mut read, table, &from, 0.0).unwrap();
        assert_eq!(decoded.msec, 15);
    }

    #[test]
    fn test_strings_and_post_multiplier() {
        let reg = DeltaRegistry::from_description("").unwrap();
        let table = reg.table(RecordKind::MoveVars);
        let from = MoveVars::default();
        let to = MoveVars {
            sky_name: "space".into(),
            wave_height: 4.0,
            ..MoveVars::default()
        };

        let mut buf = BitBuffer::with_capacity(64);
        assert_eq!(write_delta(&mut buf, table, &from, &to, 0.0).unwrap(), 2);
        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        let decoded: MoveVars = read_delta(&mut read, table, &from, 0.0).unwrap();

        assert_eq!(decoded.sky_name, "space");
        // 4.0 * 16 on the wire, divided by 16 and then by the post multiplier
        assert_eq!(decoded.wave_height, 0.5);
    }

    #[test]
    fn test_time_windows() {
        let reg = DeltaRegistry::builtin().unwrap();
        let table = reg.table(RecordKind::EntityState);
        let timebase = 100.0;

        let from = EntityState::new(5);
        let to = EntityState {
            animtime: 100.5,
            impacttime: 102.25,
            ..from.clone()
        };

        let mut buf = BitBuffer::with_capacity(256);
        write_delta(&mut buf, table, &from, &to, timebase).unwrap();
        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        let decoded: EntityState = read_delta(&mut read, table, &from, timebase).unwrap();

        assert!((decoded.animtime - 100.5).abs() < 0.01);
        assert!((decoded.impacttime - 102.25).abs() < 1.0 / 256.0);
    }

    #[test]
    fn test_angles() {
        let reg = DeltaRegistry::builtin().unwrap();
        let table = reg.table(RecordKind::UserCmd);
        let from = UserCmd::default();
        let mut to = UserCmd::default();
        to.viewangles.y = 90.0;
        to.viewangles.x = -45.0;

        let mut buf = BitBuffer::with_capacity(64);
        write_delta(&mut buf, table, &from, &to, 0.0).unwrap();
        let bits = buf.bits_written();
        let mut read = BitBuffer::with_bits(buf.into_inner(), 0, bits);
        let decoded: UserCmd = read_delta(&mut read, table, &from, 0.0).unwrap();

        assert!((decoded.viewangles.y - 90.0).abs() < 0.01);
        assert!((decoded.viewangles.x + 45.0).abs() < 0.01);
    }

    #[test]
    fn test_uninitialised_table() {
        let reg = DeltaRegistry::new();
        let table = reg.table(RecordKind::UserCmd);
        let mut buf = BitBuffer::with_capacity(8);
        let cmd = UserCmd::default();
        assert_eq!(
            write_delta(&mut buf, table, &cmd, &cmd, 0.0),
            Err(ProtocolError::TableNotReady("usercmd_t"))
        );
    }

    #[test]
    fn test_truncated_delta() {
        let reg = DeltaRegistry::builtin().unwrap();
        let table = reg.table(RecordKind::UserCmd);
        let mut read = BitBuffer::new(vec![0xFF; 2]);
        let result: Result<UserCmd, _> = read_delta(&mut read, table, &UserCmd::default(), 0.0);
        assert_eq!(result, Err(ProtocolError::Overflow));
    }
}
