//! Sign-on and per-frame game messages exchanged over a channel.

use std::collections::HashMap;

use crate::bitbuf::BitBuffer;
use crate::delta::{
    DeltaRegistry, EntityState, EntityUpdate, UserCmd, read_delta_entity, read_delta_usercmd,
    write_delta_entity, write_delta_usercmd, write_entity_remove,
};
use crate::error::ProtocolError;
use crate::net::protocol::{MAX_EDICTS, clc, svc};

/// Ends the entity list of a packet-entities message.
pub const ENTITY_LIST_END: u16 = 0xFFFF;
/// Commands carried per move message, the newest plus this many older ones.
pub const MAX_BACKUP_COMMANDS: usize = 8;

/// First message of the sign-on stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerData {
    pub protocol: u32,
    pub client_id: u32,
    pub max_entities: u16,
    pub max_clients: u8,
    pub level_name: String,
}

impl ServerData {
    pub fn write<T: AsRef<[u8]> + AsMut<[u8]>>(&self, buf: &mut BitBuffer<T>) {
        buf.write_byte(svc::SERVERDATA);
        buf.write_ulong(self.protocol);
        buf.write_ulong(self.client_id);
        buf.write_word(self.max_entities);
        buf.write_byte(self.max_clients);
        buf.write_string(&self.level_name);
    }

    /// Reads the body after the `svc::SERVERDATA` byte.
    pub fn read<T: AsRef<[u8]>>(buf: &mut BitBuffer<T>) -> Result<Self, ProtocolError> {
        let data = Self {
            protocol: buf.read_ulong(),
            client_id: buf.read_ulong(),
            max_entities: buf.read_word(),
            max_clients: buf.read_byte(),
            level_name: buf.read_string(),
        };
        if buf.is_overflowed() {
            return Err(ProtocolError::Overflow);
        }
        Ok(data)
    }

    pub fn is_player(&self, number: i32) -> bool {
        number >= 1 && number <= self.max_clients as i32
    }
}

/// Baselines are sent as a forced delta from a fresh state.
pub fn write_spawn_baseline<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    baseline: &EntityState,
    player: bool,
) -> Result<(), ProtocolError> {
    buf.write_byte(svc::SPAWNBASELINE);
    let null = EntityState::new(baseline.number);
    write_delta_entity(buf, registry, &null, baseline, true, player, 0.0)?;
    Ok(())
}

pub fn read_spawn_baseline<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    is_player: impl Fn(i32) -> bool,
) -> Result<EntityState, ProtocolError> {
    let number = buf.read_word() as i32;
    let null = EntityState::new(number);
    match read_delta_entity(buf, registry, &null, number, is_player(number), 0.0)? {
        EntityUpdate::Delta(state) => Ok(state),
        _ => Err(ProtocolError::BadEntity(number)),
    }
}

/// One entity in a packet-entities message.
pub struct EntityRecord<'a> {
    pub baseline: &'a EntityState,
    pub state: &'a EntityState,
    pub player: bool,
}

/// Writes a full entity list, each entity as a forced delta from its
/// baseline, followed by remove records for `removed`.
pub fn write_packet_entities<'a, T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    entities: impl ExactSizeIterator<Item = EntityRecord<'a>>,
    removed: &[i32],
    timebase: f32,
) -> Result<(), ProtocolError> {
    buf.write_byte(svc::PACKETENTITIES);
    buf.write_word((entities.len() + removed.len()) as u16);

    for record in entities {
        write_delta_entity(
            buf,
            registry,
            record.baseline,
            record.state,
            true,
            record.player,
            timebase,
        )?;
    }
    for &number in removed {
        write_entity_remove(buf, number, true);
    }
    buf.write_word(ENTITY_LIST_END);
    Ok(())
}

/// Reads the body after the `svc::PACKETENTITIES` byte.
pub fn read_packet_entities<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    baselines: &HashMap<i32, EntityState>,
    is_player: impl Fn(i32) -> bool,
    timebase: f32,
) -> Result<Vec<EntityUpdate>, ProtocolError> {
    let count = buf.read_word() as usize;
    let mut updates = Vec::with_capacity(count.min(MAX_EDICTS));

    loop {
        let number = buf.read_word();
        if buf.is_overflowed() {
            return Err(ProtocolError::Overflow);
        }
        if number == ENTITY_LIST_END {
            break;
        }

        let number = number as i32;
        let fallback;
        let baseline = match baselines.get(&number) {
            Some(baseline) => baseline,
            None => {
                // Only remove records may name an entity without a baseline.
                fallback = EntityState::new(number);
                &fallback
            }
        };
        let update = read_delta_entity(buf, registry, baseline, number, is_player(number), timebase)?;
        if matches!(update, EntityUpdate::Delta(_)) && !baselines.contains_key(&number) {
            return Err(ProtocolError::BadEntity(number));
        }
        updates.push(update);
    }

    if updates.len() != count {
        log::debug!("Entity list announced {count} records, read {}", updates.len());
    }
    Ok(updates)
}

/// Writes a move message. `commands` runs oldest first, the last entry is
/// the current command.
pub fn write_move<T: AsRef<[u8]> + AsMut<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
    commands: &[UserCmd],
) -> Result<(), ProtocolError> {
    let commands = &commands[commands.len().saturating_sub(MAX_BACKUP_COMMANDS + 1)..];
    let Some(backup) = commands.len().checked_sub(1) else {
        return Ok(());
    };

    buf.write_byte(clc::MOVE);
    buf.write_byte(backup as u8);
    let null = UserCmd::default();
    for cmd in commands {
        write_delta_usercmd(buf, registry, &null, cmd)?;
    }
    Ok(())
}

/// Reads the body after the `clc::MOVE` byte, oldest command first.
pub fn read_move<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
) -> Result<Vec<UserCmd>, ProtocolError> {
    let backup = buf.read_byte() as usize;
    if backup > MAX_BACKUP_COMMANDS {
        return Err(ProtocolError::UnknownMessage(clc::MOVE));
    }

    let null = UserCmd::default();
    let mut commands = Vec::with_capacity(backup + 1);
    for _ in 0..=backup {
        commands.push(read_delta_usercmd(buf, registry, &null)?);
    }
    Ok(commands)
}

pub fn write_string_cmd<T: AsRef<[u8]> + AsMut<[u8]>>(buf: &mut BitBuffer<T>, command: &str) {
    buf.write_byte(clc::STRINGCMD);
    buf.write_string(command);
}

/// A message a client sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Move(Vec<UserCmd>),
    StringCmd(String),
}

/// Splits a client payload into messages. Trailing bits shorter than a
/// message id are padding.
pub fn read_client_messages<T: AsRef<[u8]>>(
    buf: &mut BitBuffer<T>,
    registry: &DeltaRegistry,
) -> Result<Vec<ClientMessage>, ProtocolError> {
    let mut messages = Vec::new();
    while buf.bits_left() >= 8 {
        match buf.read_byte() {
            0 => break,
            clc::NOP => {}
            clc::MOVE => messages.push(ClientMessage::Move(read_move(buf, registry)?)),
            clc::STRINGCMD => messages.push(ClientMessage::StringCmd(buf.read_string())),
            other => return Err(ProtocolError::UnknownMessage(other)),
        }
        if buf.is_overflowed() {
            return Err(ProtocolError::Overflow);
        }
    }
    Ok(messages)
}

/// Wraps received bytes in a reader that stops at their end.
pub fn reader(data: Vec<u8>) -> BitBuffer {
    let bits = data.len() * 8;
    BitBuffer::with_bits(data, 0, bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_server_data() {
        let data = ServerData {
            protocol: 48,
            client_id: 3,
            max_entities: 4096,
            max_clients: 16,
            level_name: "arena".into(),
        };
        let mut buf = BitBuffer::with_capacity(64);
        data.write(&mut buf);

        let mut read = reader(buf.written().to_vec());
        assert_eq!(read.read_byte(), svc::SERVERDATA);
        assert_eq!(ServerData::read(&mut read).unwrap(), data);
        assert!(data.is_player(16));
        assert!(!data.is_player(0));
        assert!(!data.is_player(17));
    }

    #[test]
    fn test_packet_entities_and_removal() {
        let registry = DeltaRegistry::builtin().unwrap();
        let baseline = EntityState::new(20);
        let mut state = baseline.clone();
        state.origin = Vec3::new(64.0, 32.0, 0.0);

        let mut buf = BitBuffer::with_capacity(512);
        let records = vec![EntityRecord {
            baseline: &baseline,
            state: &state,
            player: false,
        }];
        write_packet_entities(&mut buf, &registry, records.into_iter(), &[7], 0.0).unwrap();

        let baselines = HashMap::from([(20, baseline.clone())]);
        let mut read = reader(buf.written().to_vec());
        assert_eq!(read.read_byte(), svc::PACKETENTITIES);
        let updates = read_packet_entities(&mut read, &registry, &baselines, |_| false, 0.0).unwrap();
        assert_eq!(updates, vec![EntityUpdate::Delta(state), EntityUpdate::Removed(7)]);
    }

    #[test]
    fn test_entity_without_baseline_rejected() {
        let registry = DeltaRegistry::builtin().unwrap();
        let baseline = EntityState::new(20);
        let mut buf = BitBuffer::with_capacity(512);
        let records = vec![EntityRecord {
            baseline: &baseline,
            state: &baseline,
            player: false,
        }];
        write_packet_entities(&mut buf, &registry, records.into_iter(), &[], 0.0).unwrap();

        let mut read = reader(buf.written().to_vec());
        read.read_byte();
        let result = read_packet_entities(&mut read, &registry, &HashMap::new(), |_| false, 0.0);
        assert_eq!(result, Err(ProtocolError::BadEntity(20)));
    }

    #[test]
    fn test_move_keeps_newest_commands() {
        let registry = DeltaRegistry::builtin().unwrap();
        let commands: Vec<UserCmd> = (0..12u8)
            .map(|i| UserCmd {
                msec: i + 1,
                ..Default::default()
            })
            .collect();

        let mut buf = BitBuffer::with_capacity(512);
        write_move(&mut buf, &registry, &commands).unwrap();
        write_string_cmd(&mut buf, "disconnect");

        let mut read = reader(buf.written().to_vec());
        let messages = read_client_messages(&mut read, &registry).unwrap();
        assert_eq!(messages.len(), 2);
        let ClientMessage::Move(read_commands) = &messages[0] else {
            panic!("expected a move, got {:?}", messages[0]);
        };
        assert_eq!(read_commands.len(), MAX_BACKUP_COMMANDS + 1);
        assert_eq!(read_commands.last().map(|c| c.msec), Some(12));
        assert_eq!(messages[1], ClientMessage::StringCmd("disconnect".into()));
    }

    #[test]
    fn test_unknown_client_message() {
        let registry = DeltaRegistry::builtin().unwrap();
        let mut read = reader(vec![clc::NOP, 99]);
        assert_eq!(
            read_client_messages(&mut read, &registry),
            Err(ProtocolError::UnknownMessage(99))
        );
    }
}
