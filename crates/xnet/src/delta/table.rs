use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use super::field::{FieldDescriptor, FieldFlags};
use super::record::{DeltaRecord, RecordView};
use super::records::{ClientData, EntityState, EventArgs, MoveVars, UserCmd, WeaponData};
use crate::error::ConfigError;

/// Record kinds, in the order their tables are indexed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Event,
    MoveVars,
    UserCmd,
    ClientData,
    WeaponData,
    EntityState,
    EntityStatePlayer,
    CustomEntityState,
}

fn name_at<R: DeltaRecord>(slot: usize) -> Option<&'static str> {
    R::fields().get(slot).map(|f| f.name)
}

impl RecordKind {
    pub const ALL: [RecordKind; 8] = [
        Self::Event,
        Self::MoveVars,
        Self::UserCmd,
        Self::ClientData,
        Self::WeaponData,
        Self::EntityState,
        Self::EntityStatePlayer,
        Self::CustomEntityState,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Event => "event_t",
            Self::MoveVars => "movevars_t",
            Self::UserCmd => "usercmd_t",
            Self::ClientData => "clientdata_t",
            Self::WeaponData => "weapon_data_t",
            Self::EntityState => "entity_state_t",
            Self::EntityStatePlayer => "entity_state_player_t",
            Self::CustomEntityState => "custom_entity_state_t",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn field_index(self, name: &str) -> Option<usize> {
        match self {
            Self::Event => EventArgs::field_index(name),
            Self::MoveVars => MoveVars::field_index(name),
            Self::UserCmd => UserCmd::field_index(name),
            Self::ClientData => ClientData::field_index(name),
            Self::WeaponData => WeaponData::field_index(name),
            Self::EntityState | Self::EntityStatePlayer | Self::CustomEntityState => {
                EntityState::field_index(name)
            }
        }
    }

    pub fn field_name(self, slot: usize) -> Option<&'static str> {
        match self {
            Self::Event => name_at::<EventArgs>(slot),
            Self::MoveVars => name_at::<MoveVars>(slot),
            Self::UserCmd => name_at::<UserCmd>(slot),
            Self::ClientData => name_at::<ClientData>(slot),
            Self::WeaponData => name_at::<WeaponData>(slot),
            Self::EntityState | Self::EntityStatePlayer | Self::CustomEntityState => {
                name_at::<EntityState>(slot)
            }
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side runs a table's custom encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncodeTarget {
    #[default]
    None,
    GameDll,
    ClientDll,
}

impl EncodeTarget {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "gamedll" => Some(Self::GameDll),
            "clientdll" => Some(Self::ClientDll),
            _ => None,
        }
    }
}

/// Per-encode activity mask. Every field starts active; a custom encoder
/// switches off the ones that carry no meaning for this pair of records.
#[derive(Debug)]
pub struct ActiveFields<'a> {
    table: &'a RecordTable,
    active: Vec<bool>,
}

impl<'a> ActiveFields<'a> {
    pub fn new(table: &'a RecordTable) -> Self {
        Self {
            table,
            active: vec![true; table.len()],
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.table.position(name)
    }

    pub fn set(&mut self, name: &str) {
        if let Some(i) = self.find(name) {
            self.active[i] = true;
        }
    }

    pub fn unset(&mut self, name: &str) {
        if let Some(i) = self.find(name) {
            self.active[i] = false;
        }
    }

    pub fn set_index(&mut self, index: usize) {
        if let Some(a) = self.active.get_mut(index) {
            *a = true;
        }
    }

    pub fn unset_index(&mut self, index: usize) {
        if let Some(a) = self.active.get_mut(index) {
            *a = false;
        }
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active.get(index).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|a| **a).count()
    }
}

/// Pre-pass run before a table is diffed.
pub trait CustomEncoder: Send + Sync {
    fn encode(&self, fields: &mut ActiveFields<'_>, from: &dyn RecordView, to: &dyn RecordView);
}

impl<F> CustomEncoder for F
where
    F: Fn(&mut ActiveFields<'_>, &dyn RecordView, &dyn RecordView) + Send + Sync,
{
    fn encode(&self, fields: &mut ActiveFields<'_>, from: &dyn RecordView, to: &dyn RecordView) {
        self(fields, from, to)
    }
}

pub struct RecordTable {
    kind: RecordKind,
    fields: Vec<FieldDescriptor>,
    target: EncodeTarget,
    encoder_name: Option<String>,
    encoder: Option<Arc<dyn CustomEncoder>>,
    initialised: bool,
}

impl fmt::Debug for RecordTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTable")
            .field("kind", &self.kind)
            .field("fields", &self.fields.len())
            .field("target", &self.target)
            .field("encoder_name", &self.encoder_name)
            .field("encoder", &self.encoder.is_some())
            .field("initialised", &self.initialised)
            .finish()
    }
}

impl RecordTable {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            fields: Vec::new(),
            target: EncodeTarget::None,
            encoder_name: None,
            encoder: None,
            initialised: false,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised
    }

    pub fn target(&self) -> EncodeTarget {
        self.target
    }

    pub fn encoder_name(&self) -> Option<&str> {
        self.encoder_name.as_deref()
    }

    pub fn encoder(&self) -> Option<&Arc<dyn CustomEncoder>> {
        self.encoder.as_ref()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn set_encoder(&mut self, target: EncodeTarget, name: Option<String>) {
        self.target = target;
        self.encoder_name = if target == EncodeTarget::None { None } else { name };
        self.encoder = None;
    }

    pub fn add_field(
        &mut self,
        name: &str,
        flags: FieldFlags,
        bits: u32,
        multiplier: f32,
        post_multiplier: f32,
    ) -> Result<(), ConfigError> {
        let table = self.kind.name();
        let slot = self
            .kind
            .field_index(name)
            .ok_or_else(|| ConfigError::UnknownField {
                table,
                field: name.to_string(),
            })?;

        if self.fields.iter().any(|f| f.slot == slot) {
            return Err(ConfigError::DuplicateField {
                table,
                field: name.to_string(),
            });
        }

        if !flags.contains(FieldFlags::STRING) && !(1..=32).contains(&bits) {
            return Err(ConfigError::BadBits {
                table,
                field: name.to_string(),
                bits,
            });
        }

        if self.fields.len() >= 256 {
            return Err(ConfigError::TooManyFields { table });
        }

        self.fields.push(FieldDescriptor {
            name: self.kind.field_name(slot).unwrap_or("unknown"),
            slot,
            flags,
            bits,
            multiplier: if multiplier == 0.0 { 1.0 } else { multiplier },
            post_multiplier: if post_multiplier == 0.0 { 1.0 } else { post_multiplier },
        });
        self.initialised = true;
        Ok(())
    }

    /// Installs a field announced by the peer, replacing any previous
    /// definition for the same slot.
    pub(crate) fn apply_definition(&mut self, field: FieldDescriptor) {
        match self.fields.iter_mut().find(|f| f.slot == field.slot) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self.initialised = true;
    }

    pub fn clear(&mut self) {
        self.fields.clear();
        self.initialised = false;
        self.encoder = None;
        self.encoder_name = None;
        self.target = EncodeTarget::None;
    }
}

/// Built-in description shipped with the engine.
pub const DEFAULT_DESCRIPTION: &str = include_str!("delta.lst");

/// Every record table of one endpoint, plus the encoders registered against
/// them by name.
pub struct DeltaRegistry {
    tables: Vec<RecordTable>,
    encoders: HashMap<String, Arc<dyn CustomEncoder>>,
    frozen: bool,
}

impl fmt::Debug for DeltaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaRegistry")
            .field("tables", &self.tables)
            .field("encoders", &self.encoders.keys().collect::<Vec<_>>())
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl Default for DeltaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaRegistry {
    /// An empty registry, as a client holds before the server's table
    /// definitions arrive.
    pub fn new() -> Self {
        Self {
            tables: RecordKind::ALL.into_iter().map(RecordTable::new).collect(),
            encoders: HashMap::new(),
            frozen: false,
        }
    }

    pub fn from_description(text: &str) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        super::parse::parse_description(text, &mut registry)?;
        registry.add_required_fields()?;
        Ok(registry)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("Loading delta description from {}", path.display());
        Self::from_description(&text)
    }

    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_description(DEFAULT_DESCRIPTION)
    }

    fn add_required_fields(&mut self) -> Result<(), ConfigError> {
        let signed_float = FieldFlags::FLOAT | FieldFlags::SIGNED;

        let event = self.table_mut(RecordKind::Event);
        for name in ["velocity[0]", "velocity[1]", "velocity[2]"] {
            if event.field(name).is_none() {
                event.add_field(name, signed_float, 16, 8.0, 1.0)?;
            }
        }

        let movevars = self.table_mut(RecordKind::MoveVars);
        if movevars.is_initialised() {
            return Ok(());
        }

        for &(name, flags, bits, mul, post) in DEFAULT_MOVEVARS {
            movevars.add_field(name, flags, bits, mul, post)?;
        }
        Ok(())
    }

    pub fn table(&self, kind: RecordKind) -> &RecordTable {
        &self.tables[kind.index()]
    }

    pub fn table_mut(&mut self, kind: RecordKind) -> &mut RecordTable {
        &mut self.tables[kind.index()]
    }

    pub fn tables(&self) -> impl Iterator<Item = &RecordTable> {
        self.tables.iter()
    }

    /// Attaches `encoder` to every table whose description names it. Returns
    /// false when no table asked for it.
    pub fn register_encoder(&mut self, name: &str, encoder: Arc<dyn CustomEncoder>) -> bool {
        let mut used = false;
        for table in &mut self.tables {
            if table.target != EncodeTarget::None && table.encoder_name.as_deref() == Some(name) {
                table.encoder = Some(Arc::clone(&encoder));
                used = true;
            }
        }

        if !used {
            log::error!("No delta table uses custom encoder {name}");
        }
        self.encoders.insert(name.to_string(), encoder);
        used
    }

    /// Re-resolves encoder names after tables were redefined.
    pub fn resolve_encoders(&mut self) {
        for table in &mut self.tables {
            table.encoder = table
                .encoder_name
                .as_ref()
                .filter(|_| table.target != EncodeTarget::None)
                .and_then(|name| self.encoders.get(name))
                .cloned();
        }
    }

    /// Stops accepting table definitions from the network.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn clear(&mut self) {
        for table in &mut self.tables {
            table.clear();
        }
        self.frozen = false;
    }

    pub fn initialised_count(&self) -> usize {
        self.tables.iter().filter(|t| t.initialised).count()
    }
}

type DefaultField = (&'static str, FieldFlags, u32, f32, f32);

const SF: FieldFlags = FieldFlags::FLOAT.union(FieldFlags::SIGNED);

static DEFAULT_MOVEVARS: &[DefaultField] = &[
    ("gravity", SF, 16, 8.0, 1.0),
    ("stopspeed", SF, 16, 8.0, 1.0),
    ("maxspeed", SF, 16, 8.0, 1.0),
    ("spectatormaxspeed", SF, 16, 8.0, 1.0),
    ("accelerate", SF, 16, 8.0, 1.0),
    ("airaccelerate", SF, 16, 8.0, 1.0),
    ("wateraccelerate", SF, 16, 8.0, 1.0),
    ("friction", SF, 16, 8.0, 1.0),
    ("edgefriction", SF, 16, 8.0, 1.0),
    ("waterfriction", SF, 16, 8.0, 1.0),
    ("bounce", SF, 16, 8.0, 1.0),
    ("stepsize", SF, 16, 16.0, 1.0),
    ("maxvelocity", SF, 16, 8.0, 1.0),
    ("zmax", SF, 16, 1.0, 1.0),
    ("waveHeight", SF, 16, 16.0, 8.0),
    ("skyName", FieldFlags::STRING, 1, 1.0, 1.0),
    ("footsteps", FieldFlags::INTEGER, 1, 1.0, 1.0),
    ("rollangle", SF, 16, 32.0, 1.0),
    ("rollspeed", SF, 16, 8.0, 1.0),
    ("skycolor_r", SF, 12, 1.0, 1.0),
    ("skycolor_g", SF, 12, 1.0, 1.0),
    ("skycolor_b", SF, 12, 1.0, 1.0),
    ("skyvec_x", SF, 16, 32.0, 1.0),
    ("skyvec_y", SF, 16, 32.0, 1.0),
    ("skyvec_z", SF, 16, 32.0, 1.0),
    ("skydir_x", SF, 16, 32.0, 1.0),
    ("skydir_y", SF, 16, 32.0, 1.0),
    ("skydir_z", SF, 16, 32.0, 1.0),
    ("skyangle", FieldFlags::ANGLE, 16, 1.0, 1.0),
    ("wateralpha", SF, 16, 32.0, 1.0),
    ("fog_settings", FieldFlags::INTEGER, 32, 1.0, 1.0),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_order_matches_wire_indices() {
        assert_eq!(RecordKind::Event.index(), 0);
        assert_eq!(RecordKind::CustomEntityState.index(), 7);
        assert_eq!(RecordKind::from_index(2), Some(RecordKind::UserCmd));
        assert_eq!(RecordKind::from_index(8), None);
        assert_eq!(
            RecordKind::from_name("entity_state_player_t"),
            Some(RecordKind::EntityStatePlayer)
        );
    }

    #[test]
    fn test_add_field_validation() {
        let mut table = RecordTable::new(RecordKind::UserCmd);
        let f = FieldFlags::FLOAT | FieldFlags::SIGNED;

        table.add_field("forwardmove", f, 12, 1.0, 1.0).unwrap();
        assert!(table.is_initialised());

        assert!(matches!(
            table.add_field("forwardmove", f, 12, 1.0, 1.0),
            Err(ConfigError::DuplicateField { .. })
        ));
        assert!(matches!(
            table.add_field("no_such_field", f, 12, 1.0, 1.0),
            Err(ConfigError::UnknownField { .. })
        ));
        assert!(matches!(
            table.add_field("sidemove", f, 33, 1.0, 1.0),
            Err(ConfigError::BadBits { bits: 33, .. })
        ));
        assert!(matches!(
            table.add_field("upmove", f, 0, 1.0, 1.0),
            Err(ConfigError::BadBits { bits: 0, .. })
        ));
    }

    #[test]
    fn test_movevars_defaults_installed() {
        let registry = DeltaRegistry::from_description("").unwrap();
        let movevars = registry.table(RecordKind::MoveVars);
        assert_eq!(movevars.len(), DEFAULT_MOVEVARS.len());
        assert_eq!(movevars.field("waveHeight").unwrap().post_multiplier, 8.0);

        let event = registry.table(RecordKind::Event);
        assert_eq!(event.len(), 3);
        assert_eq!(event.field("velocity[2]").unwrap().bits, 16);
    }

    #[test]
    fn test_active_fields() {
        let mut table = RecordTable::new(RecordKind::UserCmd);
        table.add_field("msec", FieldFlags::BYTE, 8, 1.0, 1.0).unwrap();
        table.add_field("buttons", FieldFlags::SHORT, 16, 1.0, 1.0).unwrap();

        let mut active = ActiveFields::new(&table);
        assert_eq!(active.active_count(), 2);
        active.unset("buttons");
        assert!(!active.is_active(1));
        active.unset("missing");
        active.unset_index(9);
        assert_eq!(active.active_count(), 1);
        active.set_index(1);
        assert!(active.is_active(1));
    }

    #[test]
    fn test_register_encoder_by_name() {
        let text = "entity_state_t gamedll Entity_Encode { DEFINE_DELTA( modelindex, DT_INTEGER, 10, 1.0 ) }";
        let mut registry = DeltaRegistry::from_description(text).unwrap();

        let noop = |_: &mut ActiveFields<'_>, _: &dyn RecordView, _: &dyn RecordView| {};
        assert!(!registry.register_encoder("Player_Encode", Arc::new(noop)));
        assert!(registry.register_encoder("Entity_Encode", Arc::new(noop)));
        assert!(registry.table(RecordKind::EntityState).encoder().is_some());
        assert!(registry.table(RecordKind::UserCmd).encoder().is_none());
    }
}
