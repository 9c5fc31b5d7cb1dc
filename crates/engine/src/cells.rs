//! Persisted per-coordinate cell state.
//!
//! Cells materialize lazily: the first access inserts a freshly generated
//! document with `INSERT OR IGNORE`, so two racing first-accesses cannot
//! double-initialize or reset progress. Every mutation goes through a
//! compare-and-swap loop keyed on the row's `rev`: read the document, apply
//! the closure, write back only if nobody else wrote in between, retry
//! otherwise. That makes the per-cell health/progress read-modify-write exact
//! under concurrency without any process-wide locking.

use crate::{append_event_tx, now_ms, worldgen, Engine};
use anyhow::Context;
use gridlands_protocol::{CellParams, CellPos, CellView, Color};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CAS_MAX_RETRIES: u32 = 32;

/// One player's stake in a contested cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub amount: u32,
    /// Order of this player's first tap on the cell; the winner tie-break.
    pub first_tap_seq: u32,
}

/// The full persisted cell document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Cell {
    pub pos: CellPos,
    pub params: CellParams,
    /// `None` once the cell went terminal (collected, rendered white).
    pub health: Option<i64>,
    /// Player id -> accumulated damage on this cell.
    pub progress: BTreeMap<String, Contribution>,
    /// Cell-local counter feeding `first_tap_seq`.
    pub tap_seq: u32,
    /// Taps received while terminal; 10 triggers a detonation.
    pub white_taps: u32,
    pub construction_points: u32,
    pub construction_type: Option<u32>,
    pub building_id: Option<String>,
    pub building_name: Option<String>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            pos: CellPos::new(0, 0),
            params: CellParams::default(),
            health: None,
            progress: BTreeMap::new(),
            tap_seq: 0,
            white_taps: 0,
            construction_points: 0,
            construction_type: None,
            building_id: None,
            building_name: None,
        }
    }
}

impl Cell {
    /// A freshly generated, active cell for a coordinate.
    pub fn generate(pos: CellPos) -> Self {
        let params = worldgen::cell_params(pos);
        Self {
            pos,
            params,
            health: Some(worldgen::initial_health(&params)),
            ..Self::default()
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.health.is_none()
    }

    /// Rendered color: terminal beats everything (construction grayscale
    /// counts, since gray starts at white), then hotspot overrides, then the
    /// normal parameter mapping.
    pub fn color(&self) -> Color {
        if self.is_terminal() {
            return match self.construction_type {
                Some(ty) => {
                    worldgen::params_to_color(&self.params, self.construction_points, Some(ty))
                }
                None => Color::WHITE,
            };
        }
        if let Some(name) = &self.building_name {
            if let Some(c) = crate::building::building_color(name) {
                return c;
            }
        }
        if let Some(c) = worldgen::hotspot_color(self.pos) {
            return c;
        }
        worldgen::params_to_color(&self.params, self.construction_points, self.construction_type)
    }

    /// Irreversible transition to terminal white. Progress, params and the
    /// detonation counter all reset; only regeneration revisits this cell.
    pub fn make_terminal(&mut self) {
        self.health = None;
        self.progress.clear();
        self.params = CellParams::default();
        self.white_taps = 0;
    }

    /// Re-enter ACTIVE with fresh parameters, optionally raising power to a
    /// floor so regenerated cells keep up with late-game players.
    pub fn regenerate(&mut self, power_floor: u32) {
        let mut params = worldgen::cell_params(self.pos);
        if params.power < power_floor {
            params.power = power_floor.min(248);
        }
        self.params = params;
        self.health = Some(worldgen::initial_health(&self.params));
        self.progress.clear();
        self.tap_seq = 0;
        self.white_taps = 0;
        self.construction_points = 0;
        self.construction_type = None;
        self.building_id = None;
        self.building_name = None;
    }

    pub fn view(&self) -> CellView {
        CellView {
            pos: self.pos,
            color: self.color(),
            params: self.params,
            name: worldgen::cell_name(&self.params).to_string(),
            construction_points: self.construction_points,
            construction_type: self.construction_type,
            building_name: self.building_name.clone(),
        }
    }
}

/// A speculative view for a coordinate the store has not materialized.
/// Clients render these identically because they run the same generator.
fn speculative_view(pos: CellPos) -> CellView {
    let params = worldgen::cell_params(pos);
    CellView {
        pos,
        color: worldgen::hotspot_color(pos)
            .unwrap_or_else(|| worldgen::params_to_color(&params, 0, None)),
        params,
        name: worldgen::cell_name(&params).to_string(),
        construction_points: 0,
        construction_type: None,
        building_name: None,
    }
}

fn parse_cell(payload: &str, pos: CellPos) -> anyhow::Result<Cell> {
    serde_json::from_str(payload).with_context(|| format!("parse cell {pos}"))
}

impl Engine {
    /// Materialize a cell, generating it on first access. The insert is
    /// atomic; a lost race reads whatever the winner wrote.
    pub fn get_or_create_cell(&self, pos: CellPos) -> anyhow::Result<Cell> {
        let conn = self.open()?;
        let fresh = Cell::generate(pos);
        let payload = serde_json::to_string(&fresh)?;
        let ts = now_ms();
        conn.execute(
            "INSERT OR IGNORE INTO cells (x, y, payload_json, terminal, created_at_ms, updated_at_ms, rev)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, 1)",
            (pos.x, pos.y, &payload, ts),
        )?;
        let payload: String = conn.query_row(
            "SELECT payload_json FROM cells WHERE x = ?1 AND y = ?2",
            (pos.x, pos.y),
            |row| row.get(0),
        )?;
        parse_cell(&payload, pos)
    }

    /// Read a materialized cell without creating it.
    pub fn read_cell(&self, pos: CellPos) -> anyhow::Result<Option<Cell>> {
        let conn = self.open()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload_json FROM cells WHERE x = ?1 AND y = ?2",
                (pos.x, pos.y),
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        payload.map(|p| parse_cell(&p, pos)).transpose()
    }

    /// Optimistic read-modify-write against the persisted document. The
    /// closure may also emit one event to append atomically with the write.
    pub(crate) fn mutate_cell<T>(
        &self,
        pos: CellPos,
        mut op: impl FnMut(&mut Cell) -> anyhow::Result<(T, Option<(&'static str, serde_json::Value)>)>,
    ) -> anyhow::Result<T> {
        // Ensure the row exists before entering the loop.
        self.get_or_create_cell(pos)?;
        let mut conn = self.open()?;

        for attempt in 0..CAS_MAX_RETRIES {
            // Immediate: take the write lock before reading, so the rev we
            // read is the rev we overwrite. The rev guard stays as a backstop
            // for writers that bypass this path.
            let tx =
                conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let (payload, rev): (String, i64) = tx.query_row(
                "SELECT payload_json, rev FROM cells WHERE x = ?1 AND y = ?2",
                (pos.x, pos.y),
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            let mut cell = parse_cell(&payload, pos)?;
            let (value, event) = op(&mut cell)?;
            let next = serde_json::to_string(&cell)?;

            let changed = tx.execute(
                "UPDATE cells SET payload_json = ?1, terminal = ?2, updated_at_ms = ?3, rev = rev + 1
                 WHERE x = ?4 AND y = ?5 AND rev = ?6",
                (&next, cell.is_terminal() as i64, now_ms(), pos.x, pos.y, rev),
            )?;
            if changed == 1 {
                if let Some((kind, payload)) = event {
                    append_event_tx(&tx, kind, Some(&pos.to_string()), payload)?;
                }
                tx.commit()?;
                return Ok(value);
            }
            // Somebody else won this rev; drop our work and retry.
            drop(tx);
            tracing::debug!(target: "gridlands::cells", %pos, attempt, "cell cas retry");
        }
        anyhow::bail!("cell {pos} contended beyond {CAS_MAX_RETRIES} cas attempts")
    }

    /// Atomically add `delta` to a player's progress and subtract it from
    /// health. Returns the player's new progress and the new health, or
    /// `None` if the cell had already gone terminal.
    pub fn apply_tap_progress(
        &self,
        pos: CellPos,
        player_id: &str,
        delta: u32,
    ) -> anyhow::Result<Option<(u32, i64)>> {
        self.mutate_cell(pos, |cell| {
            let Some(health) = cell.health else {
                return Ok((None, None));
            };
            if !cell.progress.contains_key(player_id) {
                cell.tap_seq += 1;
                cell.progress.insert(
                    player_id.to_string(),
                    Contribution {
                        amount: 0,
                        first_tap_seq: cell.tap_seq,
                    },
                );
            }
            let entry = cell
                .progress
                .get_mut(player_id)
                .context("contribution just inserted")?;
            entry.amount += delta;
            let new_health = health - i64::from(delta);
            cell.health = Some(new_health);
            Ok((Some((entry.amount, new_health)), None))
        })
    }

    /// Terminal transition; irreversible except via regeneration.
    pub fn collect_cell(&self, pos: CellPos) -> anyhow::Result<Cell> {
        self.mutate_cell(pos, |cell| {
            cell.make_terminal();
            Ok((
                cell.clone(),
                Some(("cell.collected", serde_json::json!({ "pos": pos }))),
            ))
        })
    }

    /// Set construction metadata with the usual per-key atomicity.
    pub fn set_construction(
        &self,
        pos: CellPos,
        points: u32,
        construction_type: u32,
    ) -> anyhow::Result<Cell> {
        self.mutate_cell(pos, |cell| {
            cell.construction_points = points;
            cell.construction_type = Some(construction_type);
            Ok((cell.clone(), None))
        })
    }

    /// Convert a cell into part of a completed building: fixed power and
    /// health, construction state consumed, tagged with the shared id.
    pub fn assign_building(
        &self,
        pos: CellPos,
        building_id: &str,
        building_name: &str,
        power: u32,
        health: i64,
    ) -> anyhow::Result<Cell> {
        self.mutate_cell(pos, |cell| {
            cell.params = CellParams {
                power,
                ..CellParams::default()
            };
            cell.health = Some(health);
            cell.progress.clear();
            cell.construction_points = 0;
            cell.construction_type = None;
            cell.building_id = Some(building_id.to_string());
            cell.building_name = Some(building_name.to_string());
            Ok((cell.clone(), None))
        })
    }

    /// Every terminal (white) cell currently in the store.
    pub fn list_terminal_cells(&self) -> anyhow::Result<Vec<CellPos>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT x, y FROM cells WHERE terminal = 1")?;
        let rows = stmt.query_map([], |row| Ok(CellPos::new(row.get(0)?, row.get(1)?)))?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    /// Viewport read: a Chebyshev square around `center`. Stored cells come
    /// from the store; the rest are speculative and never persisted.
    pub fn viewport(&self, center: CellPos, radius: i64) -> anyhow::Result<Vec<CellView>> {
        let radius = radius.max(0);
        let (x0, x1) = (center.x - radius, center.x + radius);
        let (y0, y1) = (center.y - radius, center.y + radius);

        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT x, y, payload_json FROM cells
             WHERE x BETWEEN ?1 AND ?2 AND y BETWEEN ?3 AND ?4",
        )?;
        let mut stored: BTreeMap<CellPos, Cell> = BTreeMap::new();
        let rows = stmt.query_map((x0, x1, y0, y1), |row| {
            Ok((CellPos::new(row.get(0)?, row.get(1)?), row.get::<_, String>(2)?))
        })?;
        for row in rows {
            let (pos, payload) = row?;
            stored.insert(pos, parse_cell(&payload, pos)?);
        }

        let mut views = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
        for y in y0..=y1 {
            for x in x0..=x1 {
                let pos = CellPos::new(x, y);
                match stored.get(&pos) {
                    Some(cell) => views.push(cell.view()),
                    None => views.push(speculative_view(pos)),
                }
            }
        }
        Ok(views)
    }
}
