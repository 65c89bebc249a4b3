//! Game-side encoders that prune entity and weapon deltas before they
//! are diffed.

use std::sync::Arc;

use xnet::delta::{ActiveFields, EntityState, RecordView, WeaponData};
use xnet::DeltaRegistry;

pub const MOVETYPE_FOLLOW: i32 = 12;

const ORIGIN: [&str; 3] = ["origin[0]", "origin[1]", "origin[2]"];

fn as_entity(view: &dyn RecordView) -> Option<&EntityState> {
    view.as_any().downcast_ref::<EntityState>()
}

/// Attached entities take their origin from the entity they follow.
fn follow_rules(fields: &mut ActiveFields<'_>, from: &EntityState, to: &EntityState) {
    if to.movetype == MOVETYPE_FOLLOW && to.aiment != 0 {
        for name in ORIGIN {
            fields.unset(name);
        }
    } else if to.aiment != from.aiment {
        for name in ORIGIN {
            fields.set(name);
        }
    }
}

fn entity_encode(fields: &mut ActiveFields<'_>, from: &dyn RecordView, to: &dyn RecordView) {
    let (Some(from), Some(to)) = (as_entity(from), as_entity(to)) else {
        return;
    };

    // Projectiles in flight are extrapolated from startpos and endpos.
    if to.impacttime != 0.0 && to.starttime != 0.0 {
        for name in ORIGIN {
            fields.unset(name);
        }
        for name in ["angles[0]", "angles[1]", "angles[2]"] {
            fields.unset(name);
        }
    }

    follow_rules(fields, from, to);
}

fn player_encode(fields: &mut ActiveFields<'_>, from: &dyn RecordView, to: &dyn RecordView) {
    if let (Some(from), Some(to)) = (as_entity(from), as_entity(to)) {
        follow_rules(fields, from, to);
    }
}

fn weapon_encode(fields: &mut ActiveFields<'_>, _from: &dyn RecordView, to: &dyn RecordView) {
    let Some(to) = to.as_any().downcast_ref::<WeaponData>() else {
        return;
    };

    // An empty slot only needs its id.
    if to.id == 0 {
        let keep = fields.find("m_iId");
        for index in 0..fields.len() {
            if Some(index) != keep {
                fields.unset_index(index);
            }
        }
    }
}

pub fn register_game_encoders(registry: &mut DeltaRegistry) {
    registry.register_encoder("Entity_Encode", Arc::new(entity_encode));
    registry.register_encoder("Player_Encode", Arc::new(player_encode));
    registry.register_encoder("Weapon_Encode", Arc::new(weapon_encode));
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use xnet::RecordKind;
    use xnet::delta::changed_fields;

    fn registry() -> DeltaRegistry {
        let mut registry = DeltaRegistry::builtin().unwrap();
        register_game_encoders(&mut registry);
        registry
    }

    fn changed_names(registry: &DeltaRegistry, kind: RecordKind, changed: &[bool]) -> Vec<&'static str> {
        let table = registry.table(kind);
        table
            .fields()
            .iter()
            .zip(changed)
            .filter(|(_, c)| **c)
            .map(|(f, _)| f.name)
            .collect()
    }

    #[test]
    fn test_following_entity_hides_origin() {
        let registry = registry();
        let table = registry.table(RecordKind::EntityState);
        let from = EntityState::new(40);
        let mut to = from.clone();
        to.origin = Vec3::new(10.0, 20.0, 30.0);
        to.movetype = MOVETYPE_FOLLOW;
        to.aiment = 3;

        let changed = changed_fields(table, &from, &to, 0.0);
        let names = changed_names(&registry, RecordKind::EntityState, &changed);
        assert!(names.contains(&"movetype"));
        assert!(!names.iter().any(|n| n.starts_with("origin")));
    }

    #[test]
    fn test_player_origin_sent_normally() {
        let registry = registry();
        let table = registry.table(RecordKind::EntityStatePlayer);
        let from = EntityState::new(1);
        let mut to = from.clone();
        to.origin = Vec3::new(10.0, 0.0, 0.0);

        let changed = changed_fields(table, &from, &to, 0.0);
        let names = changed_names(&registry, RecordKind::EntityStatePlayer, &changed);
        assert_eq!(names, vec!["origin[0]"]);
    }

    #[test]
    fn test_empty_weapon_slot_sends_only_id() {
        let registry = registry();
        let table = registry.table(RecordKind::WeaponData);
        let from = WeaponData {
            id: 5,
            clip: 30,
            ..Default::default()
        };
        let to = WeaponData::default();

        let changed = changed_fields(table, &from, &to, 0.0);
        let names = changed_names(&registry, RecordKind::WeaponData, &changed);
        assert_eq!(names, vec!["m_iId"]);
    }
}
