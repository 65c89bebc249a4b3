use super::codec::{changed_fields, read_delta, write_delta};
use super::records::{
    ClientData, ENTITY_BEAM, ENTITY_NORMAL, EntityState, EventArgs, MoveVars, UserCmd, WeaponData,
};
use super::table::{DeltaRegistry, RecordKind};
use crate::bitbuf::BitBuffer;
use crate::error::ProtocolError;
use crate::net::protocol::{MAX_EDICTS, MAX_WEAPON_BITS, svc};

const REMOVE_TYPE_BITS: u32 = 2;
const ENTITY_TYPE_BITS: u32 = 2;

/// Outcome of reading one entity record from a packet-entities message.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityUpdate {
    Delta(EntityState),
    /// Left out of this update, the client keeps its state.
    Dropped(i32),
    /// Gone from the server.
    Removed(i32),
}

pub fn write_delta_usercmd<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &UserCmd,
    to: &UserCmd,
) -> Result<(), ProtocolError> {
    write_delta(buf, registry.table(RecordKind::UserCmd), from, to, 0.0).map(|_| ())
}

pub fn read_delta_usercmd<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &UserCmd,
) -> Result<UserCmd, ProtocolError> {
    read_delta(buf, registry.table(RecordKind::UserCmd), from, 0.0)
}

pub fn write_delta_event<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &EventArgs,
    to: &EventArgs,
) -> Result<(), ProtocolError> {
    write_delta(buf, registry.table(RecordKind::Event), from, to, 0.0).map(|_| ())
}

pub fn read_delta_event<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &EventArgs,
) -> Result<EventArgs, ProtocolError> {
    read_delta(buf, registry.table(RecordKind::Event), from, 0.0)
}

/// Writes a complete `svc::DELTAMOVEVARS` message. Nothing is written and
/// false is returned when no field changed.
pub fn write_delta_movevars<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &MoveVars,
    to: &MoveVars,
) -> Result<bool, ProtocolError> {
    let start = buf.bits_written();
    buf.write_byte(svc::DELTAMOVEVARS);

    if write_delta(buf, registry.table(RecordKind::MoveVars), from, to, 0.0)? == 0 {
        buf.seek_to_bit(start);
        return Ok(false);
    }
    Ok(true)
}

pub fn read_delta_movevars<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &MoveVars,
) -> Result<MoveVars, ProtocolError> {
    read_delta(buf, registry.table(RecordKind::MoveVars), from, 0.0)
}

pub fn write_clientdata<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &ClientData,
    to: &ClientData,
    timebase: f32,
) -> Result<(), ProtocolError> {
    write_delta(buf, registry.table(RecordKind::ClientData), from, to, timebase).map(|_| ())
}

pub fn read_clientdata<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &ClientData,
    timebase: f32,
) -> Result<ClientData, ProtocolError> {
    read_delta(buf, registry.table(RecordKind::ClientData), from, timebase)
}

/// Writes a present bit, the weapon slot and the delta. A weapon without
/// changes writes nothing.
pub fn write_weapon_data<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &WeaponData,
    to: &WeaponData,
    timebase: f32,
    index: u32,
) -> Result<bool, ProtocolError> {
    let start = buf.bits_written();
    buf.write_one_bit(true);
    buf.write_ubits(index, MAX_WEAPON_BITS);

    if write_delta(buf, registry.table(RecordKind::WeaponData), from, to, timebase)? == 0 {
        buf.seek_to_bit(start);
        return Ok(false);
    }
    Ok(true)
}

/// Reads the delta part of a weapon record; the present bit and slot are
/// read by the caller.
pub fn read_weapon_data<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &WeaponData,
    timebase: f32,
) -> Result<WeaponData, ProtocolError> {
    read_delta(buf, registry.table(RecordKind::WeaponData), from, timebase)
}

fn entity_table(entity_type: i32, player: bool) -> RecordKind {
    if entity_type == ENTITY_BEAM {
        RecordKind::CustomEntityState
    } else if player {
        RecordKind::EntityStatePlayer
    } else {
        RecordKind::EntityState
    }
}

/// Writes a remove record for `number`. `killed` marks an entity that is
/// gone from the server, otherwise it is only left out of this update.
pub fn write_entity_remove<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    number: i32,
    killed: bool,
) {
    buf.write_word(number as u16);
    buf.write_ubits(if killed { 2 } else { 1 }, REMOVE_TYPE_BITS);
}

/// Writes one entity record of a packet-entities message. Without `force`
/// an entity that did not change writes nothing and false is returned.
pub fn write_delta_entity<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &EntityState,
    to: &EntityState,
    force: bool,
    player: bool,
    timebase: f32,
) -> Result<bool, ProtocolError> {
    if to.number < 0 || to.number as usize >= MAX_EDICTS {
        log::error!("Bad entity number {}", to.number);
        return Ok(false);
    }

    let table = registry.table(entity_table(to.entity_type, player));
    let type_changed = to.entity_type != from.entity_type;

    if !force && !type_changed && !changed_fields(table, from, to, timebase).contains(&true) {
        return Ok(false);
    }

    buf.write_word(to.number as u16);
    buf.write_ubits(0, REMOVE_TYPE_BITS);
    buf.write_one_bit(type_changed);
    if type_changed {
        buf.write_ubits(to.entity_type as u32, ENTITY_TYPE_BITS);
    }

    write_delta(buf, table, from, to, timebase)?;
    Ok(true)
}

/// Reads one entity record whose number was already read by the caller.
pub fn read_delta_entity<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    from: &EntityState,
    number: i32,
    player: bool,
    timebase: f32,
) -> Result<EntityUpdate, ProtocolError> {
    if number < 0 || number as usize >= MAX_EDICTS {
        return Err(ProtocolError::BadEntity(number));
    }

    match buf.read_ubits(REMOVE_TYPE_BITS) {
        0 => {}
        1 => return Ok(EntityUpdate::Dropped(number)),
        2 => return Ok(EntityUpdate::Removed(number)),
        _ => return Err(ProtocolError::BadEntity(number)),
    }

    let mut base = from.clone();
    base.number = number;
    if buf.read_one_bit() {
        base.entity_type = buf.read_ubits(ENTITY_TYPE_BITS) as i32;
    }

    if base.entity_type != ENTITY_NORMAL && base.entity_type != ENTITY_BEAM {
        log::debug!("Entity {number} has unknown type {}", base.entity_type);
    }

    let table = registry.table(entity_table(base.entity_type, player));
    read_delta(buf, table, &base, timebase).map(EntityUpdate::Delta)
}
