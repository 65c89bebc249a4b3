//! Table-driven delta compression of structured records.

mod codec;
mod field;
mod messages;
mod parse;
mod record;
mod records;
mod sync;
mod table;

pub use codec::{changed_fields, read_delta, write_delta};
pub use field::{FieldDescriptor, FieldFlags, FieldValue};
pub use messages::{
    EntityUpdate, read_clientdata, read_delta_entity, read_delta_event, read_delta_movevars,
    read_delta_usercmd, read_weapon_data, write_clientdata, write_delta_entity, write_delta_event,
    write_delta_movevars, write_delta_usercmd, write_entity_remove, write_weapon_data,
};
pub use parse::parse_description;
pub use record::{DeltaRecord, FieldAccess, RecordView};
pub use records::{
    ClientData, ENTITY_BEAM, ENTITY_NORMAL, EntityState, EventArgs, MoveVars, UserCmd, WeaponData,
};
pub use table::{
    ActiveFields, CustomEncoder, DEFAULT_DESCRIPTION, DeltaRegistry, EncodeTarget, RecordKind,
    RecordTable,
};
