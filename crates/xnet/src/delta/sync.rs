use super::field::{FieldDescriptor, FieldFlags};
use super::table::{DeltaRegistry, RecordKind, RecordTable};
use crate::bitbuf::BitBuffer;
use crate::error::ProtocolError;
use crate::net::protocol::svc;

const TABLE_INDEX_BITS: u32 = 4;
const FIELD_INDEX_BITS: u32 = 8;
const FIELD_BITS_BITS: u32 = 5;

fn write_definition<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    table: &RecordTable,
    field: &FieldDescriptor,
) {
    buf.write_byte(svc::DELTATABLE);
    buf.write_ubits(table.kind().index() as u32, TABLE_INDEX_BITS);
    buf.write_ubits(field.slot as u32, FIELD_INDEX_BITS);
    buf.write_ubits(field.flags.bits(), FieldFlags::WIRE_BITS);
    buf.write_ubits(field.bits.saturating_sub(1), FIELD_BITS_BITS);

    for scale in [field.multiplier, field.post_multiplier] {
        if scale != 1.0 {
            buf.write_one_bit(true);
            buf.write_float(scale);
        } else {
            buf.write_one_bit(false);
        }
    }
}

impl DeltaRegistry {
    /// Writes one definition message per field of every initialised table.
    /// Returns the number of messages written.
    pub fn write_definitions<T: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuffer<T>) -> usize {
        let mut count = 0;
        for table in self.tables().filter(|t| t.is_initialised()) {
            for field in table.fields() {
                write_definition(buf, table, field);
                count += 1;
            }
        }
        count
    }

    /// Applies one definition message whose `svc::DELTATABLE` byte was
    /// already consumed. Returns false when the registry is frozen and the
    /// definition was ignored.
    pub fn read_definition<T: AsRef<[u8]>>(
        &mut self,
        buf: &mut BitBuffer<T>,
    ) -> Result<bool, ProtocolError> {
        let table_index = buf.read_ubits(TABLE_INDEX_BITS);
        let slot = buf.read_ubits(FIELD_INDEX_BITS);
        let flags = FieldFlags::from_bits_truncate(buf.read_ubits(FieldFlags::WIRE_BITS));
        let bits = buf.read_ubits(FIELD_BITS_BITS) + 1;
        let multiplier = if buf.read_one_bit() { buf.read_float() } else { 1.0 };
        let post_multiplier = if buf.read_one_bit() { buf.read_float() } else { 1.0 };

        if buf.is_overflowed() {
            return Err(ProtocolError::Overflow);
        }

        let kind = RecordKind::from_index(table_index as usize)
            .ok_or(ProtocolError::BadTableIndex(table_index))?;
        let name = kind
            .field_name(slot as usize)
            .ok_or(ProtocolError::BadFieldIndex {
                table: kind.name(),
                index: slot,
            })?;

        if self.is_frozen() {
            log::debug!("Ignoring definition of {kind}.{name}, tables are frozen");
            return Ok(false);
        }

        self.table_mut(kind).apply_definition(FieldDescriptor {
            name,
            slot: slot as usize,
            flags,
            bits,
            multiplier,
            post_multiplier,
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(registry: &mut DeltaRegistry, data: Vec<u8>, bits: usize) -> usize {
        let mut read = BitBuffer::with_bits(data, 0, bits);
        let mut applied = 0;
        while read.bits_left() > 0 {
            assert_eq!(read.read_byte(), svc::DELTATABLE);
            if registry.read_definition(&mut read).unwrap() {
                applied += 1;
            }
        }
        applied
    }

    #[test]
    fn test_definitions_reproduce_tables() {
        let server = DeltaRegistry::builtin().unwrap();
        let mut buf = BitBuffer::with_capacity(16384);
        let written = server.write_definitions(&mut buf);
        assert!(!buf.is_overflowed());

        let bits = buf.bits_written();
        let mut client = DeltaRegistry::new();
        assert_eq!(read_all(&mut client, buf.into_inner(), bits), written);

        for kind in RecordKind::ALL {
            assert_eq!(server.table(kind).fields(), client.table(kind).fields(), "{kind}");
        }
    }

    #[test]
    fn test_frozen_registry_ignores_definitions() {
        let server = DeltaRegistry::builtin().unwrap();
        let mut buf = BitBuffer::with_capacity(16384);
        server.write_definitions(&mut buf);
        let bits = buf.bits_written();

        let mut client = DeltaRegistry::new();
        client.freeze();
        assert_eq!(read_all(&mut client, buf.into_inner(), bits), 0);
        assert_eq!(client.initialised_count(), 0);
    }

    #[test]
    fn test_bad_indices_are_protocol_errors() {
        let mut buf = BitBuffer::with_capacity(16);
        buf.write_ubits(12, TABLE_INDEX_BITS);
        buf.write_ubits(0, FIELD_INDEX_BITS);
        buf.write_ubits(FieldFlags::INTEGER.bits(), FieldFlags::WIRE_BITS);
        buf.write_ubits(7, FIELD_BITS_BITS);
        buf.write_one_bit(false);
        buf.write_one_bit(false);

        let mut client = DeltaRegistry::new();
        let mut read = BitBuffer::new(buf.into_inner());
        assert_eq!(
            client.read_definition(&mut read),
            Err(ProtocolError::BadTableIndex(12))
        );

        let mut buf = BitBuffer::with_capacity(16);
        buf.write_ubits(RecordKind::UserCmd.index() as u32, TABLE_INDEX_BITS);
        buf.write_ubits(250, FIELD_INDEX_BITS);
        buf.write_ubits(0, FieldFlags::WIRE_BITS);
        buf.write_ubits(0, FIELD_BITS_BITS);
        buf.write_one_bit(false);
        buf.write_one_bit(false);

        let mut read = BitBuffer::new(buf.into_inner());
        assert_eq!(
            client.read_definition(&mut read),
            Err(ProtocolError::BadFieldIndex {
                table: "usercmd_t",
                index: 250
            })
        );
    }
}
