//! Player records: persistence, the write-through cache, and the
//! player-centric operations (registration, movement, upgrades, item use,
//! attacks, leaderboard).
//!
//! Records are stored whole (`payload_json`), never as deltas. The cache is
//! an explicit object with read-through/write-through semantics: a cached
//! entry is only ever replaced after the SQLite write committed, so the
//! cache can lag the store but never diverge from it.

use crate::{append_event_tx, economy, now_ms, worldgen, Engine};
use anyhow::Context;
use gridlands_protocol::{CellPos, Color, ItemKind, LeaderboardRow, RejectReason, UpgradeKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

/// Ordered palette colors a player unlocks as their collection total grows.
pub const PALETTE: [&str; 16] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
    "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324", "#fffac8", "#800000", "#aaffc3",
];

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _-]{1,23}$").expect("name regex"))
}

/// Full mutable record of one player. Serialized as the whole `payload_json`
/// document and also used directly as the client-facing view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerState {
    pub id: String,
    pub name: String,
    pub position: CellPos,
    /// Color hex -> count.
    pub inventory: BTreeMap<String, u32>,
    pub unlocked_colors: Vec<String>,
    pub satiety: f64,
    pub weight: f64,
    pub stamina: u32,
    pub collection_power: u32,
    pub experience: u32,
    pub power: u32,
    pub level: u32,
    pub available_upgrades: u32,
    pub health: f64,
    pub max_health: f64,
    pub defense: u32,
    pub luck: u32,
    pub regeneration: f64,
    pub total_food_eaten: f64,
    pub total_collected: u64,
    /// Completed building counts by template name.
    pub buildings: BTreeMap<String, u32>,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            position: CellPos::new(0, 0),
            inventory: BTreeMap::new(),
            unlocked_colors: vec![PALETTE[0].to_string()],
            satiety: 255.0,
            weight: 255.0,
            stamina: 1,
            collection_power: 1,
            experience: 0,
            power: 1,
            level: 1,
            available_upgrades: 0,
            health: 100.0,
            max_health: 100.0,
            defense: 1,
            luck: 1,
            regeneration: 0.0,
            total_food_eaten: 0.0,
            total_collected: 0,
            buildings: BTreeMap::new(),
        }
    }
}

impl PlayerState {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Total carried weight, derived per color via the color inverse.
    #[must_use]
    pub fn inventory_weight(&self) -> f64 {
        self.inventory
            .iter()
            .filter_map(|(hex, count)| {
                let color = Color::from_hex(hex)?;
                Some(economy::item_weight(&worldgen::params_from_color(&color), *count))
            })
            .sum()
    }

    /// Capacity check happens here, at write time; nothing re-validates
    /// already-carried items later.
    #[must_use]
    pub fn can_carry(&self, params: &gridlands_protocol::CellParams, count: u32) -> bool {
        self.inventory_weight() + economy::item_weight(params, count)
            <= economy::max_inventory_weight(self.weight, self.stamina)
    }

    /// Add items if capacity allows. Returns false (unchanged) otherwise.
    pub fn try_add_items(&mut self, color: &Color, count: u32) -> bool {
        let params = worldgen::params_from_color(color);
        if !self.can_carry(&params, count) {
            return false;
        }
        *self.inventory.entry(color.hex()).or_insert(0) += count;
        true
    }

    /// Remove items, failing without mutation when the stack is short.
    pub fn try_remove_items(&mut self, color: &Color, count: u32) -> bool {
        let key = color.hex();
        match self.inventory.get_mut(&key) {
            Some(have) if *have >= count => {
                *have -= count;
                if *have == 0 {
                    self.inventory.remove(&key);
                }
                true
            }
            _ => false,
        }
    }

    pub fn unlock_color(&mut self, hex: &str) -> bool {
        if self.unlocked_colors.iter().any(|c| c == hex) {
            return false;
        }
        self.unlocked_colors.push(hex.to_string());
        true
    }

    /// Palette progression: the next palette color unlocks while
    /// `total_collected >= unlocked.len()^2`.
    pub fn advance_palette(&mut self) {
        for hex in PALETTE {
            let threshold = (self.unlocked_colors.len() as u64).pow(2);
            if self.total_collected < threshold {
                break;
            }
            if !self.unlocked_colors.iter().any(|c| c == hex) {
                self.unlocked_colors.push(hex.to_string());
            }
        }
    }
}

/// Read-through/write-through player cache. The raw map never escapes; every
/// access goes through these methods.
#[derive(Debug, Clone, Default)]
pub struct PlayerCache {
    inner: Arc<Mutex<HashMap<String, PlayerState>>>,
}

impl PlayerCache {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PlayerState>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: &str) -> Option<PlayerState> {
        self.lock().get(id).cloned()
    }

    /// Only called after a successful store write.
    pub fn put(&self, player: PlayerState) {
        self.lock().insert(player.id.clone(), player);
    }

    pub fn invalidate(&self, id: &str) {
        self.lock().remove(id);
    }
}

/// Outcome of consuming an inventory item.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UseItemOutcome {
    pub restored_or_gained: f64,
    pub player: PlayerState,
}

/// Outcome of one player attacking another.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttackOutcome {
    pub damage: f64,
    pub target_satiety: f64,
}

impl Engine {
    /// Get-or-create a player record. Creation is an atomic
    /// `INSERT OR IGNORE`; a lost race simply reads the winner's row.
    pub fn register_player(
        &self,
        id: &str,
        name: &str,
    ) -> anyhow::Result<Result<PlayerState, RejectReason>> {
        let name = name.trim();
        if !name_pattern().is_match(name) {
            return Ok(Err(RejectReason::InvalidName));
        }

        let mut conn = self.open()?;
        let fresh = PlayerState::new(id, name);
        let payload = serde_json::to_string(&fresh)?;
        let ts = now_ms();

        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO players (id, name, payload_json, created_at_ms, updated_at_ms, rev)
             VALUES (?1, ?2, ?3, ?4, ?4, 1)",
            (id, name, &payload, ts),
        )?;
        if inserted > 0 {
            append_event_tx(
                &tx,
                "player.registered",
                Some(id),
                serde_json::json!({ "id": id, "name": name }),
            )?;
        }
        tx.commit()?;

        let player = self
            .load_player(id)?
            .context("player row vanished after insert")?;
        Ok(Ok(player))
    }

    /// Read-through load: cache first, then the store.
    pub fn load_player(&self, id: &str) -> anyhow::Result<Option<PlayerState>> {
        if let Some(player) = self.player_cache().get(id) {
            return Ok(Some(player));
        }
        let conn = self.open()?;
        let payload: Option<String> = conn
            .query_row("SELECT payload_json FROM players WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let player: PlayerState =
            serde_json::from_str(&payload).with_context(|| format!("parse player {id}"))?;
        self.player_cache().put(player.clone());
        Ok(Some(player))
    }

    /// Write the full record; the cache updates only after commit.
    pub fn persist_player(&self, player: &PlayerState) -> anyhow::Result<()> {
        let payload = serde_json::to_string(player)?;
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE players SET payload_json = ?1, name = ?2, updated_at_ms = ?3, rev = rev + 1
             WHERE id = ?4",
            (&payload, &player.name, now_ms(), &player.id),
        )?;
        anyhow::ensure!(changed == 1, "player {} not persisted", player.id);
        self.player_cache().put(player.clone());
        Ok(())
    }

    /// Move a player, debiting the movement cost from satiety.
    pub fn move_player(
        &self,
        id: &str,
        pos: CellPos,
    ) -> anyhow::Result<Result<PlayerState, RejectReason>> {
        let Some(mut player) = self.load_player(id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        let cost = economy::move_cost(player.weight, player.collection_power, player.stamina);
        if player.satiety < cost {
            return Ok(Err(RejectReason::InsufficientSatiety));
        }
        player.satiety -= cost;
        player.position = pos;
        self.persist_player(&player)?;
        Ok(Ok(player))
    }

    /// Spend one banked upgrade point.
    pub fn apply_upgrade(
        &self,
        id: &str,
        kind: UpgradeKind,
    ) -> anyhow::Result<Result<PlayerState, RejectReason>> {
        let Some(mut player) = self.load_player(id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        if let Err(reason) = economy::apply_upgrade(&mut player, kind) {
            return Ok(Err(reason));
        }
        self.persist_player(&player)?;
        Ok(Ok(player))
    }

    /// Consume one unit of a carried color. Food restores satiety (clamped
    /// to body weight) and feeds weight growth; experience feeds the
    /// leveling loop. The grant derives from the color-inverse parameters.
    pub fn use_inventory_item(
        &self,
        id: &str,
        color: &Color,
        kind: ItemKind,
    ) -> anyhow::Result<Result<UseItemOutcome, RejectReason>> {
        let Some(mut player) = self.load_player(id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        if !player.try_remove_items(color, 1) {
            return Ok(Err(RejectReason::InsufficientItems));
        }
        let params = worldgen::params_from_color(color);
        let gained = match kind {
            ItemKind::Food => {
                let before = player.satiety;
                player.satiety = (player.satiety + f64::from(params.food)).min(player.weight);
                player.total_food_eaten += f64::from(params.food);
                economy::apply_weight_growth(&mut player);
                player.satiety - before
            }
            ItemKind::Experience => {
                player.experience += params.experience;
                economy::apply_leveling(&mut player);
                f64::from(params.experience)
            }
        };
        self.persist_player(&player)?;
        Ok(Ok(UseItemOutcome {
            restored_or_gained: gained,
            player,
        }))
    }

    /// Attack another player. Damage lands on satiety (see DESIGN.md on the
    /// defense question).
    pub fn attack_player(
        &self,
        attacker_id: &str,
        target_id: &str,
    ) -> anyhow::Result<Result<AttackOutcome, RejectReason>> {
        let Some(attacker) = self.load_player(attacker_id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        let Some(mut target) = self.load_player(target_id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        let damage = economy::attack_damage(attacker.power);
        economy::apply_attack(&mut target, damage);
        self.persist_player(&target)?;
        Ok(Ok(AttackOutcome {
            damage,
            target_satiety: target.satiety,
        }))
    }

    /// Leaderboard for the given (online) id set, ranked by total collected
    /// descending, name ascending on ties.
    pub fn leaderboard(&self, online: &[String]) -> anyhow::Result<Vec<LeaderboardRow>> {
        let mut rows = Vec::with_capacity(online.len());
        for id in online {
            if let Some(p) = self.load_player(id)? {
                rows.push(LeaderboardRow {
                    player_id: p.id,
                    name: p.name,
                    level: p.level,
                    total_collected: p.total_collected,
                });
            }
        }
        rows.sort_by(|a, b| {
            b.total_collected
                .cmp(&a.total_collected)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_engine;

    #[test]
    fn register_is_idempotent_and_validates_names() {
        let engine = temp_engine();

        let reject = engine.register_player("p1", "  ").unwrap();
        assert_eq!(reject, Err(RejectReason::InvalidName));
        let reject = engine.register_player("p1", "-leading-dash").unwrap();
        assert_eq!(reject, Err(RejectReason::InvalidName));

        let first = engine.register_player("p1", "Ada").unwrap().unwrap();
        assert_eq!(first.satiety, 255.0);
        assert_eq!(first.level, 1);
        assert_eq!(first.unlocked_colors, vec![PALETTE[0].to_string()]);

        // Second registration keeps the existing record.
        let mut mutated = first.clone();
        mutated.experience = 42;
        engine.persist_player(&mutated).unwrap();
        let again = engine.register_player("p1", "Ada").unwrap().unwrap();
        assert_eq!(again.experience, 42);
    }

    #[test]
    fn cache_reads_through_and_only_updates_on_successful_write() {
        let engine = temp_engine();
        let player = engine.register_player("p1", "Ada").unwrap().unwrap();

        // Fresh engine handle over the same file: cold cache, read-through.
        let other = Engine::new(engine.db_path().to_path_buf());
        let loaded = other.load_player("p1").unwrap().unwrap();
        assert_eq!(loaded, player);

        // A write for an unknown id must fail and must not poison the cache.
        let ghost = PlayerState::new("ghost", "Ghost");
        assert!(other.persist_player(&ghost).is_err());
        assert!(other.load_player("ghost").unwrap().is_none());
    }

    #[test]
    fn move_debits_satiety_and_rejects_when_starved() {
        let engine = temp_engine();
        let mut player = engine.register_player("p1", "Ada").unwrap().unwrap();

        let moved = engine.move_player("p1", CellPos::new(3, -2)).unwrap().unwrap();
        assert_eq!(moved.position, CellPos::new(3, -2));
        assert_eq!(moved.satiety, 254.0);

        player = moved;
        player.satiety = 0.5;
        engine.persist_player(&player).unwrap();
        let reject = engine.move_player("p1", CellPos::new(0, 0)).unwrap();
        assert_eq!(reject, Err(RejectReason::InsufficientSatiety));

        // Rejection left the record untouched.
        let unchanged = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(unchanged.position, CellPos::new(3, -2));
        assert!(unchanged.satiety >= 0.0 && unchanged.satiety <= unchanged.weight);
    }

    #[test]
    fn use_food_item_clamps_to_weight_and_feeds_growth_counter() {
        let engine = temp_engine();
        let mut player = engine.register_player("p1", "Ada").unwrap().unwrap();
        let color = Color::new(179, 219, 99); // food 120 via inverse

        player.satiety = 200.0;
        assert!(player.try_add_items(&color, 2));
        engine.persist_player(&player).unwrap();

        let out = engine
            .use_inventory_item("p1", &color, ItemKind::Food)
            .unwrap()
            .unwrap();
        // 200 + 120 clamps at weight 255: restored 55.
        assert_eq!(out.player.satiety, 255.0);
        assert_eq!(out.restored_or_gained, 55.0);
        assert_eq!(out.player.total_food_eaten, 120.0);
        assert_eq!(out.player.inventory.get(&color.hex()), Some(&1));

        let empty = Color::new(1, 2, 3);
        let reject = engine.use_inventory_item("p1", &empty, ItemKind::Food).unwrap();
        assert_eq!(
            reject.map(|o| o.restored_or_gained),
            Err(RejectReason::InsufficientItems)
        );
    }

    #[test]
    fn use_experience_item_levels_up() {
        let engine = temp_engine();
        let mut player = engine.register_player("p1", "Ada").unwrap().unwrap();
        player.experience = 280;
        let color = Color::new(179, 219, 99);
        assert!(player.try_add_items(&color, 1));
        engine.persist_player(&player).unwrap();

        let out = engine
            .use_inventory_item("p1", &color, ItemKind::Experience)
            .unwrap()
            .unwrap();
        assert!(out.player.level >= 2);
        assert!(out.player.experience < economy::required_experience(out.player.level));
    }

    #[test]
    fn attack_hits_satiety_and_persists() {
        let engine = temp_engine();
        let mut attacker = engine.register_player("a", "Attacker").unwrap().unwrap();
        engine.register_player("b", "Target").unwrap().unwrap();
        attacker.power = 7;
        engine.persist_player(&attacker).unwrap();

        let out = engine.attack_player("a", "b").unwrap().unwrap();
        assert_eq!(out.damage, 7.0);
        assert_eq!(out.target_satiety, 248.0);
        let target = engine.load_player("b").unwrap().unwrap();
        assert_eq!(target.satiety, 248.0);

        let reject = engine.attack_player("a", "nobody").unwrap();
        assert_eq!(reject.map(|o| o.damage as i64), Err(RejectReason::PlayerNotFound));
    }

    #[test]
    fn leaderboard_ranks_by_total_collected() {
        let engine = temp_engine();
        for (id, name, total) in [("a", "Ann", 5u64), ("b", "Bob", 9), ("c", "Cat", 5)] {
            let mut p = engine.register_player(id, name).unwrap().unwrap();
            p.total_collected = total;
            engine.persist_player(&p).unwrap();
        }
        let rows = engine
            .leaderboard(&["a".into(), "b".into(), "c".into(), "offline".into()])
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.player_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn palette_advances_on_square_thresholds() {
        let mut p = PlayerState::new("p", "P");
        assert_eq!(p.unlocked_colors.len(), 1);

        p.total_collected = 1; // >= 1^2 unlocks the second color
        p.advance_palette();
        assert_eq!(p.unlocked_colors.len(), 2);

        p.total_collected = 3; // < 2^2, nothing new
        p.advance_palette();
        assert_eq!(p.unlocked_colors.len(), 2);

        p.total_collected = 4;
        p.advance_palette();
        assert_eq!(p.unlocked_colors.len(), 3);
    }
}
