//! Contested collection: the tap protocol, white-cell detonation and the
//! periodic regeneration sweep.
//!
//! A cell is ACTIVE until tapping drives its health to zero, then terminal
//! white until a regeneration event revisits it. Many sessions race on the
//! same cell; the exact-once accounting lives in the CellStore CAS, and the
//! exactly-once collection resolution happens inside a single document
//! mutation so concurrent finishers cannot both claim the kill.

use crate::{economy, Engine};
use anyhow::Context;
use gridlands_protocol::{CellPos, Color, DetonationOutcome, RejectReason, TapOutcome};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Taps on a terminal cell before it detonates.
const WHITE_DETONATION_TAPS: u32 = 10;
/// Detonations regenerate white cells within Euclidean radius 3.
const DETONATION_RADIUS_SQ: i64 = 9;
/// Per-cycle regeneration chance for each white cell in the sweep.
const SWEEP_REGEN_CHANCE: f64 = 0.5;

fn rejected(color: Color, reason: RejectReason) -> TapOutcome {
    TapOutcome {
        collected: false,
        progress: 0,
        health: None,
        color,
        winner_id: None,
        collected_amount: 0,
        tap_amount: 0,
        reason: Some(reason),
    }
}

/// Snapshot handed out of the collection resolution: the winner and what the
/// cell looked like the instant before it went white.
struct CollectionResult {
    winner_id: String,
    color: Color,
}

impl Engine {
    /// One contested tap. Illegal taps reject up front with no mutation;
    /// legal taps debit satiety, apply collection power to the cell, and
    /// resolve the collection if this tap finished it.
    pub fn tap_cell(&self, player_id: &str, pos: CellPos) -> anyhow::Result<TapOutcome> {
        let Some(mut player) = self.load_player(player_id)? else {
            return Ok(rejected(Color::WHITE, RejectReason::PlayerNotFound));
        };
        let cell = self.get_or_create_cell(pos)?;
        if cell.is_terminal() {
            return Ok(rejected(Color::WHITE, RejectReason::CellAlreadyCollected));
        }
        let color = cell.color();

        if !economy::can_tap(&player, cell.params.power) {
            return Ok(rejected(color, RejectReason::InsufficientCollectionPower));
        }
        if !player.can_carry(&cell.params, 1) {
            return Ok(rejected(color, RejectReason::InsufficientInventorySpace));
        }
        let food_cost = economy::tap_food_cost(
            player.collection_power,
            player.power,
            player.stamina,
            player.defense,
        );
        if player.satiety.round() < food_cost {
            return Ok(rejected(color, RejectReason::InsufficientSatiety));
        }

        // Apply the damage first: if the cell went terminal under our feet
        // the player is not charged for a rejected tap.
        let tap_amount = player.collection_power;
        let Some((progress, health)) = self.apply_tap_progress(pos, player_id, tap_amount)? else {
            return Ok(rejected(Color::WHITE, RejectReason::CellAlreadyCollected));
        };

        // The gate rounds, so a fractional tail can sit just under the cost;
        // clamp the debit to keep satiety non-negative.
        player.satiety = (player.satiety - food_cost).max(0.0);
        player.total_food_eaten += food_cost;
        economy::apply_weight_growth(&mut player);
        self.persist_player(&player)?;

        if health > 0 {
            return Ok(TapOutcome {
                collected: false,
                progress,
                health: Some(health),
                color,
                winner_id: None,
                collected_amount: 0,
                tap_amount,
                reason: None,
            });
        }

        // Health crossed zero: resolve at most once, inside the document CAS.
        let Some(result) = self.resolve_collection(pos)? else {
            // A concurrent finisher beat us to the resolution.
            return Ok(TapOutcome {
                collected: false,
                progress,
                health: None,
                color,
                winner_id: None,
                collected_amount: 0,
                tap_amount,
                reason: None,
            });
        };

        let mut rng = SmallRng::from_entropy();
        let granted = self.grant_collection_reward(&result, &mut rng)?;

        Ok(TapOutcome {
            collected: true,
            progress,
            health: None,
            color: result.color,
            winner_id: Some(result.winner_id),
            collected_amount: granted,
            tap_amount,
            reason: None,
        })
    }

    /// Pick the winner and flip the cell terminal in one atomic mutation.
    /// Returns `None` when someone else already resolved it.
    fn resolve_collection(&self, pos: CellPos) -> anyhow::Result<Option<CollectionResult>> {
        self.mutate_cell(pos, |cell| {
            if cell.is_terminal() || cell.health.is_some_and(|h| h > 0) {
                return Ok((None, None));
            }
            // Strictly highest cumulative progress wins; ties go to the
            // earliest first contribution, never to map iteration order.
            let winner = cell
                .progress
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.amount
                        .cmp(&b.amount)
                        .then(b.first_tap_seq.cmp(&a.first_tap_seq))
                })
                .map(|(id, c)| (id.clone(), c.amount))
                .context("collection resolved with no contributors")?;
            let color = cell.color();
            cell.make_terminal();
            let event = serde_json::json!({
                "pos": pos,
                "winner": winner.0,
                "progress": winner.1,
            });
            Ok((
                Some(CollectionResult {
                    winner_id: winner.0,
                    color,
                }),
                Some(("cell.collected", event)),
            ))
        })
    }

    /// Pay the winner. The reward is dropped whole if it would overflow the
    /// winner's inventory; no partial credit.
    fn grant_collection_reward(
        &self,
        result: &CollectionResult,
        rng: &mut impl Rng,
    ) -> anyhow::Result<u32> {
        let Some(mut winner) = self.load_player(&result.winner_id)? else {
            tracing::warn!(
                target: "gridlands::tap",
                winner = %result.winner_id,
                "collection winner has no player record"
            );
            return Ok(0);
        };
        let amount = economy::collected_amount(winner.luck, winner.level, rng);
        if !winner.try_add_items(&result.color, amount) {
            tracing::debug!(
                target: "gridlands::tap",
                winner = %winner.id,
                amount,
                "reward dropped: inventory full"
            );
            return Ok(0);
        }
        winner.total_collected += u64::from(amount);
        winner.unlock_color(&result.color.hex());
        winner.advance_palette();
        self.persist_player(&winner)?;
        Ok(amount)
    }

    /// Tap a terminal cell. The tenth tap detonates: every white cell within
    /// Euclidean radius 3 regenerates and all their counters reset.
    pub fn tap_white_cell(&self, pos: CellPos) -> anyhow::Result<DetonationOutcome> {
        let exploded = self.mutate_cell(pos, |cell| {
            if !cell.is_terminal() {
                return Ok((false, None));
            }
            cell.white_taps += 1;
            if cell.white_taps < WHITE_DETONATION_TAPS {
                return Ok((false, None));
            }
            cell.white_taps = 0;
            Ok((true, Some(("cell.detonated", serde_json::json!({ "pos": pos })))))
        })?;
        if !exploded {
            return Ok(DetonationOutcome {
                exploded: false,
                affected_cells: Vec::new(),
            });
        }

        let mut affected = Vec::new();
        for candidate in self.list_terminal_cells()? {
            if candidate.dist_sq(&pos) > DETONATION_RADIUS_SQ {
                continue;
            }
            self.mutate_cell(candidate, |cell| {
                if cell.is_terminal() {
                    cell.regenerate(1);
                } else {
                    cell.white_taps = 0;
                }
                Ok(((), None))
            })?;
            affected.push(candidate);
        }
        tracing::info!(
            target: "gridlands::tap",
            %pos,
            affected = affected.len(),
            "white cell detonation"
        );
        Ok(DetonationOutcome {
            exploded: true,
            affected_cells: affected,
        })
    }

    /// One scheduled regeneration cycle: every white cell gets a 50% chance
    /// to re-enter play, with generated power floored at the current maximum
    /// player level so respawns never trivialize for late-game players.
    /// Players also heal by their regeneration stat.
    pub fn run_regeneration_sweep(&self, rng: &mut impl Rng) -> anyhow::Result<SweepReport> {
        let floor = self.max_player_level()?;
        let mut report = SweepReport::default();

        for pos in self.list_terminal_cells()? {
            report.examined += 1;
            if rng.gen::<f64>() >= SWEEP_REGEN_CHANCE {
                continue;
            }
            self.mutate_cell(pos, |cell| {
                if cell.is_terminal() {
                    cell.regenerate(floor);
                }
                Ok(((), None))
            })?;
            report.regenerated += 1;
        }

        for id in self.list_player_ids()? {
            let Some(mut player) = self.load_player(&id)? else {
                continue;
            };
            if player.regeneration <= 0.0 || player.health >= player.max_health {
                continue;
            }
            player.health = (player.health + player.regeneration).min(player.max_health);
            self.persist_player(&player)?;
            report.players_healed += 1;
        }

        tracing::info!(
            target: "gridlands::sweep",
            examined = report.examined,
            regenerated = report.regenerated,
            players_healed = report.players_healed,
            "regeneration sweep complete"
        );
        Ok(report)
    }

    fn max_player_level(&self) -> anyhow::Result<u32> {
        let conn = self.open()?;
        let level: Option<i64> = conn.query_row(
            "SELECT MAX(json_extract(payload_json, '$.level')) FROM players",
            [],
            |row| row.get(0),
        )?;
        Ok(level.unwrap_or(1).max(1) as u32)
    }

    /// Every registered player id.
    pub fn list_player_ids(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT id FROM players")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.filter_map(Result::ok).collect())
    }
}

/// Counters from one regeneration cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: u64,
    pub regenerated: u64,
    pub players_healed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{temp_engine, worldgen};
    use gridlands_protocol::CellParams;

    /// Pin a cell's parameters so tests control eligibility and health.
    fn force_cell(engine: &Engine, pos: CellPos, params: CellParams) {
        engine
            .mutate_cell(pos, |cell| {
                cell.params = params;
                cell.health = Some(worldgen::initial_health(&params));
                cell.progress.clear();
                cell.tap_seq = 0;
                Ok(((), None))
            })
            .unwrap();
    }

    // High power/stamina keep the per-tap food cost near zero so contests
    // can run long without starving.
    fn strong_player(engine: &Engine, id: &str, collection_power: u32) -> crate::PlayerState {
        let mut p = engine.register_player(id, id).unwrap().unwrap();
        p.collection_power = collection_power;
        p.power = 40;
        p.stamina = 40;
        engine.persist_player(&p).unwrap();
        p
    }

    #[test]
    fn tap_rejects_overpowered_cells_without_mutation() {
        let engine = temp_engine();
        strong_player(&engine, "p1", 1);
        let pos = CellPos::new(3, 3);
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 50,
                power: 248,
            },
        );

        let out = engine.tap_cell("p1", pos).unwrap();
        assert_eq!(out.reason, Some(RejectReason::InsufficientCollectionPower));
        assert_eq!(out.tap_amount, 0);

        let cell = engine.read_cell(pos).unwrap().unwrap();
        assert!(cell.progress.is_empty());
        let player = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(player.satiety, 255.0);
    }

    #[test]
    fn tap_rejects_when_starved_or_overloaded() {
        let engine = temp_engine();
        let mut p = strong_player(&engine, "p1", 30);
        let pos = CellPos::new(1, 2);
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 50,
                power: 8,
            },
        );

        p.satiety = 5.0;
        p.power = 4;
        p.stamina = 4;
        engine.persist_player(&p).unwrap();
        // cost = ceil(30 - (4+4+1)/3) = 27 > 5; eligibility cap 30*3 = 90
        // still clears the power-8 cell, so satiety is the rejection.
        let out = engine.tap_cell("p1", pos).unwrap();
        assert_eq!(out.reason, Some(RejectReason::InsufficientSatiety));

        p.satiety = 255.0;
        // A huge carried stack leaves no room for even one more unit.
        p.inventory.insert(Color::new(230, 230, 0).hex(), 10_000);
        engine.persist_player(&p).unwrap();
        let out = engine.tap_cell("p1", pos).unwrap();
        assert_eq!(out.reason, Some(RejectReason::InsufficientInventorySpace));
    }

    #[test]
    fn fractional_satiety_clamps_at_zero() {
        let engine = temp_engine();
        let mut p = strong_player(&engine, "p1", 30);
        // cost = ceil(30 - (4+4+1)/3) = 27; satiety 26.5 rounds to 27 and
        // passes the gate with a half-point shortfall.
        p.power = 4;
        p.stamina = 4;
        p.satiety = 26.5;
        engine.persist_player(&p).unwrap();

        let pos = CellPos::new(8, 3);
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 50,
                power: 8,
            },
        );

        let out = engine.tap_cell("p1", pos).unwrap();
        assert!(out.reason.is_none());
        let after = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(after.satiety, 0.0);
        assert!(after.satiety >= 0.0 && after.satiety <= after.weight);
    }

    #[test]
    fn tap_on_white_cell_rejects() {
        let engine = temp_engine();
        strong_player(&engine, "p1", 10);
        let pos = CellPos::new(9, 9);
        engine.collect_cell(pos).unwrap();

        let out = engine.tap_cell("p1", pos).unwrap();
        assert_eq!(out.reason, Some(RejectReason::CellAlreadyCollected));
        assert!(out.color.is_white());
    }

    #[test]
    fn highest_progress_wins_the_contest() {
        let engine = temp_engine();
        strong_player(&engine, "heavy", 30);
        strong_player(&engine, "light", 10);
        let pos = CellPos::new(4, 4);
        // health 16 * 50 = 800
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 50,
                power: 16,
            },
        );

        // heavy: 30+30+30 = 90, light: 10. Then heavy finishes it.
        for _ in 0..3 {
            assert!(engine.tap_cell("heavy", pos).unwrap().reason.is_none());
        }
        assert!(engine.tap_cell("light", pos).unwrap().reason.is_none());

        let mut last = None;
        for _ in 0..100 {
            let out = engine.tap_cell("heavy", pos).unwrap();
            assert!(out.reason.is_none());
            if out.collected {
                last = Some(out);
                break;
            }
        }
        let out = last.expect("cell collected");
        assert_eq!(out.winner_id.as_deref(), Some("heavy"));
        assert!((1..=10).contains(&out.collected_amount));

        let cell = engine.read_cell(pos).unwrap().unwrap();
        assert!(cell.is_terminal());

        let winner = engine.load_player("heavy").unwrap().unwrap();
        assert_eq!(winner.total_collected, u64::from(out.collected_amount));
        assert!(winner.inventory.values().sum::<u32>() >= out.collected_amount);
        assert!(winner.unlocked_colors.iter().any(|c| c == &out.color.hex()));
    }

    #[test]
    fn equal_progress_breaks_ties_by_first_contribution() {
        let engine = temp_engine();
        strong_player(&engine, "first", 10);
        strong_player(&engine, "second", 10);
        let pos = CellPos::new(6, 1);
        // health 1 * 30 = 30: three taps of 10 finish it.
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 30,
                power: 1,
            },
        );

        assert!(engine.tap_cell("first", pos).unwrap().reason.is_none());
        assert!(engine.tap_cell("second", pos).unwrap().reason.is_none());
        // Both at 10; "second" lands the kill, reaching 20 vs "first" 10.
        let out = engine.tap_cell("second", pos).unwrap();
        assert!(out.collected);
        assert_eq!(out.winner_id.as_deref(), Some("second"));

        // Now an exact tie: both contribute 10 to a 20-health cell and the
        // earlier first tap wins regardless of who finished.
        let pos = CellPos::new(6, 2);
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 100,
                building: 100,
                experience: 20,
                power: 1,
            },
        );
        assert!(!engine.tap_cell("first", pos).unwrap().collected);
        let out = engine.tap_cell("second", pos).unwrap();
        assert!(out.collected);
        assert_eq!(out.winner_id.as_deref(), Some("first"));
    }

    #[test]
    fn reward_is_dropped_whole_when_inventory_is_full() {
        let engine = temp_engine();
        let mut p = strong_player(&engine, "p1", 20);
        let pos = CellPos::new(2, 8);
        force_cell(
            &engine,
            pos,
            CellParams {
                food: 200,
                building: 200,
                experience: 20,
                power: 1,
            },
        );
        // Nearly full inventory: one more unit fits for the tap eligibility
        // check, but a multi-unit reward cannot be guaranteed. Fill to the
        // brim so even one reward unit overflows after the tap.
        let filler = Color::new(230, 230, 0);
        while p.try_add_items(&filler, 1) {}
        // Leave room for exactly the eligibility probe.
        p.try_remove_items(&filler, 2);
        engine.persist_player(&p).unwrap();

        let out = engine.tap_cell("p1", pos).unwrap();
        assert!(out.reason.is_none());
        assert!(out.collected);
        // Either the roll fit in the slack or it was dropped whole.
        let after = engine.load_player("p1").unwrap().unwrap();
        if out.collected_amount == 0 {
            assert_eq!(after.total_collected, 0);
        } else {
            assert_eq!(after.total_collected, u64::from(out.collected_amount));
        }
    }

    #[test]
    fn tenth_white_tap_detonates_radius_three() {
        let engine = temp_engine();
        let center = CellPos::new(0, 0);
        let near = CellPos::new(2, 2); // dist^2 = 8
        let far = CellPos::new(4, 0); // dist^2 = 16
        for pos in [center, near, far] {
            engine.collect_cell(pos).unwrap();
        }

        for _ in 0..9 {
            let out = engine.tap_white_cell(center).unwrap();
            assert!(!out.exploded);
        }
        let out = engine.tap_white_cell(center).unwrap();
        assert!(out.exploded);
        assert!(out.affected_cells.contains(&center));
        assert!(out.affected_cells.contains(&near));
        assert!(!out.affected_cells.contains(&far));

        assert!(!engine.read_cell(center).unwrap().unwrap().is_terminal());
        assert!(!engine.read_cell(near).unwrap().unwrap().is_terminal());
        assert!(engine.read_cell(far).unwrap().unwrap().is_terminal());

        // Counter reset: the regenerated center starts from zero again.
        let cell = engine.read_cell(center).unwrap().unwrap();
        assert_eq!(cell.white_taps, 0);
    }

    #[test]
    fn white_taps_on_active_cells_are_noops() {
        let engine = temp_engine();
        let pos = CellPos::new(5, 5);
        engine.get_or_create_cell(pos).unwrap();
        for _ in 0..12 {
            let out = engine.tap_white_cell(pos).unwrap();
            assert!(!out.exploded);
        }
        assert!(!engine.read_cell(pos).unwrap().unwrap().is_terminal());
    }

    #[test]
    fn sweep_regenerates_about_half_with_power_floor() {
        let engine = temp_engine();
        let mut p = engine.register_player("vet", "Veteran").unwrap().unwrap();
        p.level = 40;
        engine.persist_player(&p).unwrap();

        for i in 0..40 {
            engine.collect_cell(CellPos::new(i, 100)).unwrap();
        }

        let mut rng = SmallRng::seed_from_u64(42);
        let report = engine.run_regeneration_sweep(&mut rng).unwrap();
        assert_eq!(report.examined, 40);
        assert!(report.regenerated > 5 && report.regenerated < 35);

        let mut revived: u64 = 0;
        for i in 0..40 {
            let cell = engine.read_cell(CellPos::new(i, 100)).unwrap().unwrap();
            if !cell.is_terminal() {
                revived += 1;
                assert!(cell.params.power >= 40, "power floored at max level");
            }
        }
        assert_eq!(revived, report.regenerated);
    }

    #[test]
    fn sweep_heals_players_up_to_max_health() {
        let engine = temp_engine();
        let mut p = engine.register_player("p1", "Healer").unwrap().unwrap();
        p.health = 99.8;
        p.regeneration = 0.5;
        engine.persist_player(&p).unwrap();

        let mut rng = SmallRng::seed_from_u64(1);
        let report = engine.run_regeneration_sweep(&mut rng).unwrap();
        assert_eq!(report.players_healed, 1);
        let healed = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(healed.health, 100.0);

        // Already full: nothing to heal.
        let report = engine.run_regeneration_sweep(&mut rng).unwrap();
        assert_eq!(report.players_healed, 0);
    }
}
