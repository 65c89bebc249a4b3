use glam::Vec3;
use serde::{Deserialize, Serialize};

use super::record::delta_record;

pub const ENTITY_NORMAL: i32 = 1 << 0;
pub const ENTITY_BEAM: i32 = 1 << 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserCmd {
    pub lerp_msec: i16,
    pub msec: u8,
    pub viewangles: Vec3,
    pub forwardmove: f32,
    pub sidemove: f32,
    pub upmove: f32,
    pub lightlevel: u8,
    pub buttons: u16,
    pub impulse: u8,
    pub weaponselect: u8,
    pub impact_index: i32,
    pub impact_position: Vec3,
}

delta_record!(UserCmd {
    "lerp_msec": int(lerp_msec),
    "msec": int(msec),
    "viewangles[0]": float(viewangles.x),
    "viewangles[1]": float(viewangles.y),
    "viewangles[2]": float(viewangles.z),
    "forwardmove": float(forwardmove),
    "sidemove": float(sidemove),
    "upmove": float(upmove),
    "lightlevel": int(lightlevel),
    "buttons": int(buttons),
    "impulse": int(impulse),
    "weaponselect": int(weaponselect),
    "impact_index": int(impact_index),
    "impact_position[0]": float(impact_position.x),
    "impact_position[1]": float(impact_position.y),
    "impact_position[2]": float(impact_position.z),
});

/// Physics constants shared by server and client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MoveVars {
    pub gravity: f32,
    pub stopspeed: f32,
    pub maxspeed: f32,
    pub spectatormaxspeed: f32,
    pub accelerate: f32,
    pub airaccelerate: f32,
    pub wateraccelerate: f32,
    pub friction: f32,
    pub edgefriction: f32,
    pub waterfriction: f32,
    pub bounce: f32,
    pub stepsize: f32,
    pub maxvelocity: f32,
    pub zmax: f32,
    pub wave_height: f32,
    pub footsteps: i32,
    pub sky_name: String,
    pub rollangle: f32,
    pub rollspeed: f32,
    pub skycolor: Vec3,
    pub skyvec: Vec3,
    pub fog_settings: i32,
    pub wateralpha: f32,
    pub skydir: Vec3,
    pub skyangle: f32,
}

impl MoveVars {
    /// The values a fresh server starts from.
    pub fn standard() -> Self {
        Self {
            gravity: 800.0,
            stopspeed: 100.0,
            maxspeed: 320.0,
            spectatormaxspeed: 500.0,
            accelerate: 10.0,
            airaccelerate: 10.0,
            wateraccelerate: 10.0,
            friction: 4.0,
            edgefriction: 2.0,
            waterfriction: 1.0,
            bounce: 1.0,
            stepsize: 18.0,
            maxvelocity: 2000.0,
            zmax: 4096.0,
            wave_height: 0.0,
            footsteps: 1,
            sky_name: "desert".into(),
            rollangle: 0.0,
            rollspeed: 0.0,
            skycolor: Vec3::ZERO,
            skyvec: Vec3::ZERO,
            fog_settings: 0,
            wateralpha: 1.0,
            skydir: Vec3::ZERO,
            skyangle: 0.0,
        }
    }
}

delta_record!(MoveVars {
    "gravity": float(gravity),
    "stopspeed": float(stopspeed),
    "maxspeed": float(maxspeed),
    "spectatormaxspeed": float(spectatormaxspeed),
    "accelerate": float(accelerate),
    "airaccelerate": float(airaccelerate),
    "wateraccelerate": float(wateraccelerate),
    "friction": float(friction),
    "edgefriction": float(edgefriction),
    "waterfriction": float(waterfriction),
    "bounce": float(bounce),
    "stepsize": float(stepsize),
    "maxvelocity": float(maxvelocity),
    "zmax": float(zmax),
    "waveHeight": float(wave_height),
    "footsteps": int(footsteps),
    "skyName": text(sky_name),
    "rollangle": float(rollangle),
    "rollspeed": float(rollspeed),
    "skycolor_r": float(skycolor.x),
    "skycolor_g": float(skycolor.y),
    "skycolor_b": float(skycolor.z),
    "skyvec_x": float(skyvec.x),
    "skyvec_y": float(skyvec.y),
    "skyvec_z": float(skyvec.z),
    "fog_settings": int(fog_settings),
    "wateralpha": float(wateralpha),
    "skydir_x": float(skydir.x),
    "skydir_y": float(skydir.y),
    "skydir_z": float(skydir.z),
    "skyangle": float(skyangle),
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventArgs {
    pub flags: i32,
    pub entindex: i32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub velocity: Vec3,
    pub ducking: i32,
    pub fparam1: f32,
    pub fparam2: f32,
    pub iparam1: i32,
    pub iparam2: i32,
    pub bparam1: i32,
    pub bparam2: i32,
}

delta_record!(EventArgs {
    "flags": int(flags),
    "entindex": int(entindex),
    "origin[0]": float(origin.x),
    "origin[1]": float(origin.y),
    "origin[2]": float(origin.z),
    "angles[0]": float(angles.x),
    "angles[1]": float(angles.y),
    "angles[2]": float(angles.z),
    "velocity[0]": float(velocity.x),
    "velocity[1]": float(velocity.y),
    "velocity[2]": float(velocity.z),
    "ducking": int(ducking),
    "fparam1": float(fparam1),
    "fparam2": float(fparam2),
    "iparam1": int(iparam1),
    "iparam2": int(iparam2),
    "bparam1": int(bparam1),
    "bparam2": int(bparam2),
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeaponData {
    pub id: i32,
    pub clip: i32,
    pub next_primary_attack: f32,
    pub next_secondary_attack: f32,
    pub time_weapon_idle: f32,
    pub in_reload: i32,
    pub in_special_reload: i32,
    pub next_reload: f32,
    pub pump_time: f32,
    pub reload_time: f32,
    pub aimed_damage: f32,
    pub next_aim_bonus: f32,
    pub in_zoom: i32,
    pub weapon_state: i32,
    pub iuser: [i32; 4],
    pub fuser: [f32; 4],
}

delta_record!(WeaponData {
    "m_iId": int(id),
    "m_iClip": int(clip),
    "m_flNextPrimaryAttack": float(next_primary_attack),
    "m_flNextSecondaryAttack": float(next_secondary_attack),
    "m_flTimeWeaponIdle": float(time_weapon_idle),
    "m_fInReload": int(in_reload),
    "m_fInSpecialReload": int(in_special_reload),
    "m_flNextReload": float(next_reload),
    "m_flPumpTime": float(pump_time),
    "m_fReloadTime": float(reload_time),
    "m_fAimedDamage": float(aimed_damage),
    "m_fNextAimBonus": float(next_aim_bonus),
    "m_fInZoom": int(in_zoom),
    "m_iWeaponState": int(weapon_state),
    "iuser1": int(iuser[0]),
    "iuser2": int(iuser[1]),
    "iuser3": int(iuser[2]),
    "iuser4": int(iuser[3]),
    "fuser1": float(fuser[0]),
    "fuser2": float(fuser[1]),
    "fuser3": float(fuser[2]),
    "fuser4": float(fuser[3]),
});

/// State only the owning client sees.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientData {
    pub origin: Vec3,
    pub velocity: Vec3,
    pub viewmodel: i32,
    pub punchangle: Vec3,
    pub flags: i32,
    pub waterlevel: i32,
    pub watertype: i32,
    pub view_ofs: Vec3,
    pub health: f32,
    pub in_duck: i32,
    pub weapons: i32,
    pub time_step_sound: i32,
    pub duck_time: i32,
    pub swim_time: i32,
    pub waterjumptime: i32,
    pub maxspeed: f32,
    pub fov: f32,
    pub weaponanim: i32,
    pub id: i32,
    pub ammo_shells: i32,
    pub ammo_nails: i32,
    pub ammo_cells: i32,
    pub ammo_rockets: i32,
    pub next_attack: f32,
    pub tfstate: i32,
    pub pushmsec: i32,
    pub deadflag: i32,
    pub physinfo: String,
    pub iuser: [i32; 4],
    pub fuser: [f32; 4],
    pub vuser: [Vec3; 2],
}

delta_record!(ClientData {
    "origin[0]": float(origin.x),
    "origin[1]": float(origin.y),
    "origin[2]": float(origin.z),
    "velocity[0]": float(velocity.x),
    "velocity[1]": float(velocity.y),
    "velocity[2]": float(velocity.z),
    "viewmodel": int(viewmodel),
    "punchangle[0]": float(punchangle.x),
    "punchangle[1]": float(punchangle.y),
    "punchangle[2]": float(punchangle.z),
    "flags": int(flags),
    "waterlevel": int(waterlevel),
    "watertype": int(watertype),
    "view_ofs[0]": float(view_ofs.x),
    "view_ofs[1]": float(view_ofs.y),
    "view_ofs[2]": float(view_ofs.z),
    "health": float(health),
    "bInDuck": int(in_duck),
    "weapons": int(weapons),
    "flTimeStepSound": int(time_step_sound),
    "flDuckTime": int(duck_time),
    "flSwimTime": int(swim_time),
    "waterjumptime": int(waterjumptime),
    "maxspeed": float(maxspeed),
    "fov": float(fov),
    "weaponanim": int(weaponanim),
    "m_iId": int(id),
    "ammo_shells": int(ammo_shells),
    "ammo_nails": int(ammo_nails),
    "ammo_cells": int(ammo_cells),
    "ammo_rockets": int(ammo_rockets),
    "m_flNextAttack": float(next_attack),
    "tfstate": int(tfstate),
    "pushmsec": int(pushmsec),
    "deadflag": int(deadflag),
    "physinfo": text(physinfo),
    "iuser1": int(iuser[0]),
    "iuser2": int(iuser[1]),
    "iuser3": int(iuser[2]),
    "iuser4": int(iuser[3]),
    "fuser1": float(fuser[0]),
    "fuser2": float(fuser[1]),
    "fuser3": float(fuser[2]),
    "fuser4": float(fuser[3]),
    "vuser1[0]": float(vuser[0].x),
    "vuser1[1]": float(vuser[0].y),
    "vuser1[2]": float(vuser[0].z),
    "vuser2[0]": float(vuser[1].x),
    "vuser2[1]": float(vuser[1].y),
    "vuser2[2]": float(vuser[1].z),
});

/// Networked entity state. Normal entities, players and beams all use this
/// record with different tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub number: i32,
    pub entity_type: i32,
    pub msg_time: f32,
    pub origin: Vec3,
    pub angles: Vec3,
    pub modelindex: i32,
    pub sequence: i32,
    pub frame: f32,
    pub colormap: i32,
    pub skin: i16,
    pub solid: i16,
    pub effects: i32,
    pub scale: f32,
    pub eflags: u8,
    pub rendermode: i32,
    pub renderamt: i32,
    pub rendercolor: [u8; 3],
    pub renderfx: i32,
    pub movetype: i32,
    pub animtime: f32,
    pub framerate: f32,
    pub body: i32,
    pub controller: [u8; 4],
    pub blending: [u8; 4],
    pub velocity: Vec3,
    pub mins: Vec3,
    pub maxs: Vec3,
    pub aiment: i32,
    pub owner: i32,
    pub friction: f32,
    pub gravity: f32,
    pub team: i32,
    pub playerclass: i32,
    pub health: i32,
    pub spectator: i32,
    pub weaponmodel: i32,
    pub gaitsequence: i32,
    pub basevelocity: Vec3,
    pub usehull: i32,
    pub oldbuttons: i32,
    pub onground: i32,
    pub step_left: i32,
    pub fall_velocity: f32,
    pub fov: f32,
    pub weaponanim: i32,
    pub startpos: Vec3,
    pub endpos: Vec3,
    pub impacttime: f32,
    pub starttime: f32,
    pub iuser: [i32; 4],
    pub fuser: [f32; 4],
    pub vuser: [Vec3; 2],
}

delta_record!(EntityState {
    "entityType": int(entity_type),
    "origin[0]": float(origin.x),
    "origin[1]": float(origin.y),
    "origin[2]": float(origin.z),
    "angles[0]": float(angles.x),
    "angles[1]": float(angles.y),
    "angles[2]": float(angles.z),
    "modelindex": int(modelindex),
    "sequence": int(sequence),
    "frame": float(frame),
    "colormap": int(colormap),
    "skin": int(skin),
    "solid": int(solid),
    "effects": int(effects),
    "scale": float(scale),
    "eflags": int(eflags),
    "rendermode": int(rendermode),
    "renderamt": int(renderamt),
    "rendercolor.r": int(rendercolor[0]),
    "rendercolor.g": int(rendercolor[1]),
    "rendercolor.b": int(rendercolor[2]),
    "renderfx": int(renderfx),
    "movetype": int(movetype),
    "animtime": float(animtime),
    "framerate": float(framerate),
    "body": int(body),
    "controller[0]": int(controller[0]),
    "controller[1]": int(controller[1]),
    "controller[2]": int(controller[2]),
    "controller[3]": int(controller[3]),
    "blending[0]": int(blending[0]),
    "blending[1]": int(blending[1]),
    "blending[2]": int(blending[2]),
    "blending[3]": int(blending[3]),
    "velocity[0]": float(velocity.x),
    "velocity[1]": float(velocity.y),
    "velocity[2]": float(velocity.z),
    "mins[0]": float(mins.x),
    "mins[1]": float(mins.y),
    "mins[2]": float(mins.z),
    "maxs[0]": float(maxs.x),
    "maxs[1]": float(maxs.y),
    "maxs[2]": float(maxs.z),
    "aiment": int(aiment),
    "owner": int(owner),
    "friction": float(friction),
    "gravity": float(gravity),
    "team": int(team),
    "playerclass": int(playerclass),
    "health": int(health),
    "spectator": int(spectator),
    "weaponmodel": int(weaponmodel),
    "gaitsequence": int(gaitsequence),
    "basevelocity[0]": float(basevelocity.x),
    "basevelocity[1]": float(basevelocity.y),
    "basevelocity[2]": float(basevelocity.z),
    "usehull": int(usehull),
    "oldbuttons": int(oldbuttons),
    "onground": int(onground),
    "iStepLeft": int(step_left),
    "flFallVelocity": float(fall_velocity),
    "fov": float(fov),
    "weaponanim": int(weaponanim),
    "startpos[0]": float(startpos.x),
    "startpos[1]": float(startpos.y),
    "startpos[2]": float(startpos.z),
    "endpos[0]": float(endpos.x),
    "endpos[1]": float(endpos.y),
    "endpos[2]": float(endpos.z),
    "impacttime": float(impacttime),
    "starttime": float(starttime),
    "iuser1": int(iuser[0]),
    "iuser2": int(iuser[1]),
    "iuser3": int(iuser[2]),
    "iuser4": int(iuser[3]),
    "fuser1": float(fuser[0]),
    "fuser2": float(fuser[1]),
    "fuser3": float(fuser[2]),
    "fuser4": float(fuser[3]),
    "vuser1[0]": float(vuser[0].x),
    "vuser1[1]": float(vuser[0].y),
    "vuser1[2]": float(vuser[0].z),
    "vuser2[0]": float(vuser[1].x),
    "vuser2[1]": float(vuser[1].y),
    "vuser2[2]": float(vuser[1].z),
});

impl EntityState {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            entity_type: ENTITY_NORMAL,
            scale: 1.0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::{DeltaRecord, FieldValue};

    #[test]
    fn test_accessors_reach_nested_fields() {
        let mut cmd = UserCmd::default();
        let slot = UserCmd::field_index("viewangles[1]").unwrap();
        cmd.set(slot, FieldValue::Float(90.0));
        assert_eq!(cmd.viewangles.y, 90.0);
        assert_eq!(cmd.get(slot), Some(FieldValue::Float(90.0)));

        let mut ent = EntityState::default();
        let slot = EntityState::field_index("controller[2]").unwrap();
        ent.set(slot, FieldValue::Int(200));
        assert_eq!(ent.controller[2], 200);
    }

    #[test]
    fn test_field_names_unique() {
        fn check<R: DeltaRecord>() {
            let names: Vec<_> = R::fields().iter().map(|f| f.name).collect();
            for (i, name) in names.iter().enumerate() {
                assert!(!names[i + 1..].contains(name), "{name} listed twice");
            }
            assert!(names.len() <= 256);
        }
        check::<UserCmd>();
        check::<MoveVars>();
        check::<EventArgs>();
        check::<WeaponData>();
        check::<ClientData>();
        check::<EntityState>();
    }

    #[test]
    fn test_text_field() {
        let mut mv = MoveVars::standard();
        let slot = MoveVars::field_index("skyName").unwrap();
        mv.set(slot, FieldValue::Text("night".into()));
        assert_eq!(mv.sky_name, "night");
        assert_eq!(mv.get(slot), Some(FieldValue::Text("night".into())));
    }
}
