//! Multi-cell structures: dropping inventory as construction material and
//! validating/committing named building templates.
//!
//! Construction is a two-phase economy. Players first drop carried items onto
//! white cells, converting them into typed construction material; the cell
//! darkens from white toward black as points accumulate. Once the footprint
//! of a named template is sufficiently built up, `build_structure` validates
//! every offset all-or-nothing and commits the whole footprint in one batch
//! under a shared building id.

use crate::{new_id, worldgen, Engine, PlayerState};
use gridlands_protocol::{CellPos, Color, RejectReason};
use serde::Serialize;
use std::sync::OnceLock;

/// One footprint cell of a template, relative to the build origin.
#[derive(Debug, Clone)]
pub struct TemplateOffset {
    pub dx: i64,
    pub dy: i64,
    /// Construction points the target cell must have accumulated.
    pub min_points: u32,
    /// Construction types acceptable at this offset.
    pub allowed_types: &'static [u32],
}

impl TemplateOffset {
    const fn new(dx: i64, dy: i64, min_points: u32, allowed_types: &'static [u32]) -> Self {
        Self {
            dx,
            dy,
            min_points,
            allowed_types,
        }
    }
}

/// A named structure blueprint. Completed footprint cells all take the
/// template's color, power and health.
#[derive(Debug, Clone)]
pub struct BuildingTemplate {
    pub name: &'static str,
    pub color: Color,
    pub power: u32,
    pub health: i64,
    pub offsets: Vec<TemplateOffset>,
}

const ANY_TYPE: &[u32] = &[1, 2, 3, 4, 5, 6, 7];
const LIGHT_TYPES: &[u32] = &[1, 2, 3];
const HEAVY_TYPES: &[u32] = &[4, 5, 6, 7];

/// Fixed template registry.
pub fn templates() -> &'static [BuildingTemplate] {
    static REGISTRY: OnceLock<Vec<BuildingTemplate>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            // Single-cell starter structure, any material.
            BuildingTemplate {
                name: "outpost",
                color: Color::new(140, 90, 40),
                power: 16,
                health: 2_000,
                offsets: vec![TemplateOffset::new(0, 0, 255, ANY_TYPE)],
            },
            // Vertical tower, heavy material, a reinforced base.
            BuildingTemplate {
                name: "watchtower",
                color: Color::new(90, 90, 110),
                power: 64,
                health: 8_000,
                offsets: vec![
                    TemplateOffset::new(0, 0, 765, HEAVY_TYPES),
                    TemplateOffset::new(0, 1, 510, HEAVY_TYPES),
                    TemplateOffset::new(0, 2, 255, HEAVY_TYPES),
                ],
            },
            // 2x2 storage block, light material throughout.
            BuildingTemplate {
                name: "granary",
                color: Color::new(180, 150, 60),
                power: 32,
                health: 4_000,
                offsets: vec![
                    TemplateOffset::new(0, 0, 510, LIGHT_TYPES),
                    TemplateOffset::new(1, 0, 510, LIGHT_TYPES),
                    TemplateOffset::new(0, 1, 510, LIGHT_TYPES),
                    TemplateOffset::new(1, 1, 510, LIGHT_TYPES),
                ],
            },
        ]
    })
}

pub fn template(name: &str) -> Option<&'static BuildingTemplate> {
    templates().iter().find(|t| t.name == name)
}

/// Rendered color for a completed building cell.
pub fn building_color(name: &str) -> Option<Color> {
    template(name).map(|t| t.color)
}

/// Construction type derived from an item color's building parameter.
#[must_use]
pub fn construction_type_for(building: u32) -> u32 {
    (building / 32).max(1)
}

/// Outcome of dropping inventory onto the player's current cell.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropOutcome {
    pub construction_points: u32,
    pub construction_type: u32,
    pub player: PlayerState,
}

/// Outcome of committing a completed template.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutcome {
    pub building_id: String,
    pub building_name: String,
    pub cells: Vec<CellPos>,
    pub player: PlayerState,
}

impl Engine {
    /// Drop `count` carried units of `color` onto the player's current cell,
    /// converting them into construction material. The target must be
    /// terminal white (starts a construction) or an existing construction of
    /// the same derived type.
    pub fn drop_inventory(
        &self,
        player_id: &str,
        color: &Color,
        count: u32,
    ) -> anyhow::Result<Result<DropOutcome, RejectReason>> {
        let Some(mut player) = self.load_player(player_id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        // The debit stays local until the cell write lands: a rejected or
        // failed cell mutation must not cost the player items.
        if count == 0 || !player.try_remove_items(color, count) {
            return Ok(Err(RejectReason::InsufficientItems));
        }

        let params = worldgen::params_from_color(color);
        let ty = construction_type_for(params.building);
        let added = count * params.building;
        let pos = player.position;

        let result: Result<u32, RejectReason> = self.mutate_cell(pos, |cell| {
            if cell.building_id.is_some() {
                return Ok((Err(RejectReason::AlreadyPartOfBuilding), None));
            }
            match cell.construction_type {
                Some(existing) if existing != ty => {
                    return Ok((Err(RejectReason::ConstructionTypeMismatch), None));
                }
                None if !cell.is_terminal() => {
                    return Ok((Err(RejectReason::ConstructionTypeMismatch), None));
                }
                _ => {}
            }
            cell.construction_type = Some(ty);
            cell.construction_points += added;
            let event = serde_json::json!({
                "pos": pos,
                "type": ty,
                "points": cell.construction_points,
            });
            Ok((
                Ok(cell.construction_points),
                Some(("construction.progress", event)),
            ))
        })?;

        match result {
            Ok(points) => {
                self.persist_player(&player)?;
                Ok(Ok(DropOutcome {
                    construction_points: points,
                    construction_type: ty,
                    player,
                }))
            }
            Err(reason) => Ok(Err(reason)),
        }
    }

    /// Validate a template footprint rooted at the player's current cell and
    /// commit it. Validation is all-or-nothing: the first failing offset
    /// aborts the whole operation, naming the offset and why.
    pub fn build_structure(
        &self,
        player_id: &str,
        template_name: &str,
    ) -> anyhow::Result<Result<BuildOutcome, RejectReason>> {
        let Some(mut player) = self.load_player(player_id)? else {
            return Ok(Err(RejectReason::PlayerNotFound));
        };
        let Some(template) = template(template_name) else {
            return Ok(Err(RejectReason::BuildingTemplateNotFound));
        };
        let origin = player.position;

        for offset in &template.offsets {
            let pos = CellPos::new(origin.x + offset.dx, origin.y + offset.dy);
            let reject = |reason: &str| {
                RejectReason::ConstructionRequirementNotMet {
                    offset: (offset.dx, offset.dy),
                    reason: reason.to_string(),
                }
            };
            let Some(cell) = self.read_cell(pos)? else {
                return Ok(Err(reject("cell not materialized")));
            };
            if cell.building_id.is_some() {
                return Ok(Err(reject("already part of a building")));
            }
            if cell.construction_points == 0 {
                return Ok(Err(reject("no construction material")));
            }
            let Some(ty) = cell.construction_type else {
                return Ok(Err(reject("no construction type")));
            };
            if !offset.allowed_types.contains(&ty) {
                return Ok(Err(reject("construction type not allowed here")));
            }
            if cell.construction_points < offset.min_points {
                return Ok(Err(reject("insufficient construction points")));
            }
        }

        // Footprint validated; commit the batch under one shared id.
        let building_id = new_id("bld");
        let mut cells = Vec::with_capacity(template.offsets.len());
        for offset in &template.offsets {
            let pos = CellPos::new(origin.x + offset.dx, origin.y + offset.dy);
            self.assign_building(pos, &building_id, template.name, template.power, template.health)?;
            cells.push(pos);
        }

        *player
            .buildings
            .entry(template.name.to_string())
            .or_insert(0) += 1;
        self.persist_player(&player)?;

        tracing::info!(
            target: "gridlands::building",
            player = %player.id,
            template = template.name,
            %origin,
            "building completed"
        );
        Ok(Ok(BuildOutcome {
            building_id,
            building_name: template.name.to_string(),
            cells,
            player,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_engine;

    // #b3db63 inverts to food 120, building 80, type 2, light material.
    fn light_material() -> Color {
        Color::new(179, 219, 99)
    }

    fn player_at(engine: &Engine, id: &str, pos: CellPos) -> PlayerState {
        let mut p = engine.register_player(id, id).unwrap().unwrap();
        p.position = pos;
        p.stamina = 10; // full carrying capacity for test setup
        engine.persist_player(&p).unwrap();
        p
    }

    fn give(engine: &Engine, player: &mut PlayerState, color: &Color, count: u32) {
        assert!(player.try_add_items(color, count));
        engine.persist_player(player).unwrap();
    }

    #[test]
    fn drop_starts_construction_on_white_cells_only() {
        let engine = temp_engine();
        let pos = CellPos::new(3, 3);
        let mut p = player_at(&engine, "p1", pos);
        let color = light_material();
        give(&engine, &mut p, &color, 5);

        // Active cell underfoot: rejected, items refunded.
        engine.get_or_create_cell(pos).unwrap();
        let reject = engine.drop_inventory("p1", &color, 2).unwrap();
        assert_eq!(
            reject.map(|o| o.construction_points),
            Err(RejectReason::ConstructionTypeMismatch)
        );
        let p = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(p.inventory.get(&color.hex()), Some(&5));

        engine.collect_cell(pos).unwrap();
        let out = engine.drop_inventory("p1", &color, 2).unwrap().unwrap();
        // building 80: type 80/32 = 2, points 2 * 80 = 160.
        assert_eq!(out.construction_type, 2);
        assert_eq!(out.construction_points, 160);
        assert_eq!(out.player.inventory.get(&color.hex()), Some(&3));

        // Second drop of the same type accumulates.
        let out = engine.drop_inventory("p1", &color, 3).unwrap().unwrap();
        assert_eq!(out.construction_points, 400);
        assert!(out.player.inventory.get(&color.hex()).is_none());

        let reject = engine.drop_inventory("p1", &color, 1).unwrap();
        assert_eq!(
            reject.map(|o| o.construction_points),
            Err(RejectReason::InsufficientItems)
        );
    }

    #[test]
    fn failed_cell_write_never_destroys_items() {
        let engine = temp_engine();
        let pos = CellPos::new(4, 4);
        let mut p = player_at(&engine, "p1", pos);
        let color = light_material();
        give(&engine, &mut p, &color, 3);

        // An unreadable cell document makes the mutation fail outright.
        engine.get_or_create_cell(pos).unwrap();
        let conn = engine.open().unwrap();
        conn.execute(
            "UPDATE cells SET payload_json = 'not json' WHERE x = ?1 AND y = ?2",
            (pos.x, pos.y),
        )
        .unwrap();

        assert!(engine.drop_inventory("p1", &color, 2).is_err());

        // The debit was never persisted; a fresh handle sees the full stack.
        let other = Engine::new(engine.db_path().to_path_buf());
        let stored = other.load_player("p1").unwrap().unwrap();
        assert_eq!(stored.inventory.get(&color.hex()), Some(&3));
    }

    #[test]
    fn drop_rejects_mismatched_construction_type() {
        let engine = temp_engine();
        let pos = CellPos::new(1, 1);
        let mut p = player_at(&engine, "p1", pos);
        engine.collect_cell(pos).unwrap();

        let light = light_material();
        // #e6b363 inverts to building 131, type 4: heavy material.
        let heavy = Color::new(230, 179, 99);
        give(&engine, &mut p, &light, 1);
        give(&engine, &mut p, &heavy, 1);

        engine.drop_inventory("p1", &light, 1).unwrap().unwrap();
        let reject = engine.drop_inventory("p1", &heavy, 1).unwrap();
        assert_eq!(
            reject.map(|o| o.construction_points),
            Err(RejectReason::ConstructionTypeMismatch)
        );
        // The mismatched drop was refunded.
        let p = engine.load_player("p1").unwrap().unwrap();
        assert_eq!(p.inventory.get(&heavy.hex()), Some(&1));
    }

    #[test]
    fn construction_darkens_toward_black() {
        let engine = temp_engine();
        let pos = CellPos::new(2, 2);
        let mut p = player_at(&engine, "p1", pos);
        engine.collect_cell(pos).unwrap();

        let color = light_material();
        give(&engine, &mut p, &color, 4);
        engine.drop_inventory("p1", &color, 1).unwrap().unwrap();
        let first = engine.read_cell(pos).unwrap().unwrap().color();
        engine.drop_inventory("p1", &color, 3).unwrap().unwrap();
        let second = engine.read_cell(pos).unwrap().unwrap().color();

        assert_eq!(first.r, first.g);
        assert_eq!(first.g, first.b);
        assert!(first.r < 255, "material darkens the white cell");
        assert!(second.r < first.r, "more points, darker gray");
    }

    #[test]
    fn build_validates_all_or_nothing_with_offset_reasons() {
        let engine = temp_engine();
        let origin = CellPos::new(10, 10);
        let mut p = player_at(&engine, "p1", origin);

        let reject = engine.build_structure("p1", "cathedral").unwrap();
        assert_eq!(
            reject.map(|o| o.building_id),
            Err(RejectReason::BuildingTemplateNotFound)
        );

        // granary needs a 2x2 footprint at 510 points each; fund only three.
        let color = light_material();
        give(&engine, &mut p, &color, 30);
        for (dx, dy) in [(0, 0), (1, 0), (0, 1)] {
            let pos = CellPos::new(origin.x + dx, origin.y + dy);
            engine.collect_cell(pos).unwrap();
            engine.move_player("p1", pos).unwrap().unwrap();
            engine.drop_inventory("p1", &color, 7).unwrap().unwrap(); // 560
        }
        engine.move_player("p1", origin).unwrap().unwrap();

        let reject = engine.build_structure("p1", "granary").unwrap();
        match reject {
            Err(RejectReason::ConstructionRequirementNotMet { offset, .. }) => {
                assert_eq!(offset, (1, 1));
            }
            other => panic!("expected offset rejection, got {other:?}"),
        }

        // No cell was converted by the failed attempt.
        let cell = engine.read_cell(origin).unwrap().unwrap();
        assert!(cell.building_id.is_none());
        assert_eq!(cell.construction_points, 560);
    }

    #[test]
    fn build_commits_footprint_under_shared_id() {
        let engine = temp_engine();
        let origin = CellPos::new(20, 20);
        let mut p = player_at(&engine, "p1", origin);
        let color = light_material();
        // 28 fund the footprint; one spare is dropped on the finished
        // building below.
        give(&engine, &mut p, &color, 29);

        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let pos = CellPos::new(origin.x + dx, origin.y + dy);
            engine.collect_cell(pos).unwrap();
            engine.move_player("p1", pos).unwrap().unwrap();
            engine.drop_inventory("p1", &color, 7).unwrap().unwrap();
        }
        engine.move_player("p1", origin).unwrap().unwrap();

        let out = engine.build_structure("p1", "granary").unwrap().unwrap();
        assert_eq!(out.building_name, "granary");
        assert_eq!(out.cells.len(), 4);
        assert_eq!(out.player.buildings.get("granary"), Some(&1));

        let template = template("granary").unwrap();
        for pos in &out.cells {
            let cell = engine.read_cell(*pos).unwrap().unwrap();
            assert_eq!(cell.building_id.as_deref(), Some(out.building_id.as_str()));
            assert_eq!(cell.building_name.as_deref(), Some("granary"));
            assert_eq!(cell.params.power, template.power);
            assert_eq!(cell.health, Some(template.health));
            assert_eq!(cell.construction_points, 0);
            assert_eq!(cell.color(), template.color);
        }

        // Building cells reject further drops.
        engine.move_player("p1", origin).unwrap().unwrap();
        let reject = engine.drop_inventory("p1", &color, 1).unwrap();
        assert_eq!(
            reject.map(|o| o.construction_points),
            Err(RejectReason::AlreadyPartOfBuilding)
        );
    }

    #[test]
    fn registry_has_fixed_named_templates() {
        assert!(templates().len() >= 3);
        for t in templates() {
            assert!(!t.offsets.is_empty());
            assert!(template(t.name).is_some());
        }
        assert_eq!(construction_type_for(0), 1);
        assert_eq!(construction_type_for(80), 2);
        assert_eq!(construction_type_for(230), 7);
    }
}
