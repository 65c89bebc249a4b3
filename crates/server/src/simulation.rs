use std::collections::BTreeMap;

use glam::Vec3;

use xnet::delta::{EntityState, MoveVars, UserCmd};

const PLAYER_MODEL: i32 = 1;
const PROP_MODEL: i32 = 2;
const PLAYER_MINS: Vec3 = Vec3::new(-16.0, -16.0, -36.0);
const PLAYER_MAXS: Vec3 = Vec3::new(16.0, 16.0, 36.0);

/// Entity numbers 1..=max_players belong to players, props follow.
pub struct World {
    entities: BTreeMap<i32, EntityState>,
    baselines: BTreeMap<i32, EntityState>,
    removed: Vec<i32>,
    max_players: i32,
    movevars: MoveVars,
    time: f32,
}

impl World {
    pub fn new(max_players: usize, prop_count: usize) -> Self {
        let max_players = max_players as i32;
        let mut world = Self {
            entities: BTreeMap::new(),
            baselines: BTreeMap::new(),
            removed: Vec::new(),
            max_players,
            movevars: MoveVars::standard(),
            time: 0.0,
        };

        for i in 0..prop_count as i32 {
            let mut prop = EntityState::new(max_players + 1 + i);
            prop.modelindex = PROP_MODEL;
            prop.origin = prop_position(i, 0.0);
            world.spawn(prop);
        }
        world
    }

    fn spawn(&mut self, entity: EntityState) {
        self.baselines.insert(entity.number, entity.clone());
        self.entities.insert(entity.number, entity);
    }

    pub fn is_player(&self, number: i32) -> bool {
        (1..=self.max_players).contains(&number)
    }

    /// Takes the lowest free player slot.
    pub fn spawn_player(&mut self) -> Option<i32> {
        let number = (1..=self.max_players).find(|n| !self.entities.contains_key(n))?;
        let mut player = EntityState::new(number);
        player.modelindex = PLAYER_MODEL;
        player.origin = Vec3::new(0.0, 0.0, 36.0);
        player.mins = PLAYER_MINS;
        player.maxs = PLAYER_MAXS;
        player.health = 100;
        self.spawn(player);
        Some(number)
    }

    pub fn despawn(&mut self, number: i32) {
        if self.entities.remove(&number).is_some() {
            self.baselines.remove(&number);
            self.removed.push(number);
        }
    }

    pub fn take_removed(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.removed)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn baseline(&self, number: i32) -> Option<&EntityState> {
        self.baselines.get(&number)
    }

    pub fn baselines(&self) -> impl Iterator<Item = &EntityState> {
        self.baselines.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn movevars(&self) -> &MoveVars {
        &self.movevars
    }

    pub fn movevars_mut(&mut self) -> &mut MoveVars {
        &mut self.movevars
    }

    pub fn time(&self) -> f32 {
        self.time
    }

    pub fn apply_usercmd(&mut self, number: i32, cmd: &UserCmd) {
        let maxspeed = self.movevars.maxspeed;
        let gravity = self.movevars.gravity;
        let Some(player) = self.entities.get_mut(&number) else {
            return;
        };
        apply_usercmd(player, cmd, maxspeed, gravity);
    }

    pub fn simulate(&mut self, dt: f32) {
        self.time += dt;
        for entity in self.entities.values_mut() {
            if entity.modelindex == PROP_MODEL {
                let index = entity.number - self.max_players - 1;
                entity.origin = prop_position(index, self.time);
                entity.angles.y = (self.time * 45.0 + index as f32 * 30.0).rem_euclid(360.0);
                entity.animtime = self.time;
            }
        }
    }
}

fn prop_position(index: i32, time: f32) -> Vec3 {
    let phase = index as f32 * std::f32::consts::TAU / 8.0 + time * 0.5;
    let radius = 256.0 + 32.0 * index as f32;
    Vec3::new(phase.cos() * radius, phase.sin() * radius, 0.0)
}

/// Moves a player by one command. `cmd.msec` is the frame time the client
/// simulated.
pub fn apply_usercmd(player: &mut EntityState, cmd: &UserCmd, maxspeed: f32, gravity: f32) {
    let dt = cmd.msec as f32 / 1000.0;
    let yaw = cmd.viewangles.y.to_radians();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();
    let forward = Vec3::new(cos_yaw, sin_yaw, 0.0);
    let right = Vec3::new(sin_yaw, -cos_yaw, 0.0);

    let mut wish = forward * cmd.forwardmove + right * cmd.sidemove;
    if wish.length() > maxspeed {
        wish = wish.normalize() * maxspeed;
    }

    player.velocity.x = wish.x;
    player.velocity.y = wish.y;
    player.velocity.z += cmd.upmove.min(maxspeed) - gravity * dt;
    player.origin += player.velocity * dt;

    let floor = -PLAYER_MINS.z;
    if player.origin.z <= floor {
        player.origin.z = floor;
        player.velocity.z = 0.0;
        player.onground = 1;
    } else {
        player.onground = 0;
    }

    player.angles = cmd.viewangles;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_slots() {
        let mut world = World::new(2, 3);
        assert_eq!(world.entity_count(), 3);
        assert_eq!(world.spawn_player(), Some(1));
        assert_eq!(world.spawn_player(), Some(2));
        assert_eq!(world.spawn_player(), None);
        assert!(world.is_player(2));
        assert!(!world.is_player(3));

        world.despawn(1);
        assert_eq!(world.take_removed(), vec![1]);
        assert_eq!(world.spawn_player(), Some(1));
    }

    #[test]
    fn test_forward_move() {
        let mut player = EntityState::new(1);
        player.origin = Vec3::new(0.0, 0.0, 36.0);
        let cmd = UserCmd {
            msec: 100,
            forwardmove: 400.0,
            ..Default::default()
        };
        apply_usercmd(&mut player, &cmd, 320.0, 800.0);
        assert!((player.origin.x - 32.0).abs() < 1e-3);
        assert_eq!(player.origin.z, 36.0);
        assert_eq!(player.onground, 1);
    }

    #[test]
    fn test_props_move() {
        let mut world = World::new(1, 1);
        let before = world.entities().next().unwrap().origin;
        world.simulate(0.5);
        assert_ne!(world.entities().next().unwrap().origin, before);
    }
}
