//! Deterministic procedural cell generation.
//!
//! Cell parameters are a pure function of the coordinate: the plane is cut
//! into diagonal segments ten cells deep, each segment into strips of a
//! hashed width, and the (segment, strip) pair seeds every draw. Clients are
//! expected to run this exact algorithm for speculative rendering of cells
//! the server has not materialized yet, so any change must bump
//! [`GENERATOR_VERSION`].

use gridlands_protocol::{CellParams, CellPos, Color};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Bumped whenever any generation constant or draw order changes.
pub const GENERATOR_VERSION: u32 = 1;

const FOOD_MIN: u32 = 30;
const FOOD_MAX: u32 = 230;
const EXPERIENCE_MIN: u32 = 20;
const EXPERIENCE_SPAN: u32 = 210;

const SEGMENT_DEPTH: i64 = 10;
const STRIP_WIDTH_MIN: i64 = 3;
const STRIP_WIDTH_CHOICES: i64 = 4;

/// Tap-power candidates: 1, then every multiple of 8 up to 248. Sampling
/// weight is power^-1.5, so high-power cells stay rare.
pub const POWER_CANDIDATES: [u32; 32] = [
    1, 8, 16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 136, 144, 152, 160,
    168, 176, 184, 192, 200, 208, 216, 224, 232, 240, 248,
];

/// Fixed landmark coordinates that render a constant color for every cell
/// within Euclidean distance 2, overriding normal generation.
pub const HOTSPOTS: [(CellPos, Color); 4] = [
    (CellPos::new(12, 12), Color::new(255, 215, 0)),
    (CellPos::new(-40, 25), Color::new(64, 224, 208)),
    (CellPos::new(63, -18), Color::new(255, 105, 180)),
    (CellPos::new(-7, -52), Color::new(148, 0, 211)),
];

const HOTSPOT_RADIUS_SQ: i64 = 4;

/// Biome labels by decile of `food / (food + building)`, building-heavy
/// ratios first.
pub const BIOME_NAMES: [&str; 10] = [
    "Slag Flats",
    "Quarry Reach",
    "Rust Barrens",
    "Dry Steppe",
    "Mixed Scrub",
    "Open Prairie",
    "Low Meadow",
    "Orchard Belt",
    "Berry Fen",
    "Honey Glade",
];

/// 64-bit finalizer (splitmix-style avalanche) over a salted input. Stdlib
/// hashers are randomized per process, which would break speculative
/// client-side generation.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

fn hash_i64(v: i64, salt: u64) -> u64 {
    mix((v as u64).wrapping_add(salt))
}

const SEGMENT_SALT: u64 = 0x9e37_79b9_7f4a_7c15;
const STRIP_SALT: u64 = 0x2545_f491_4f6c_dd1d;

/// Seed shared by every cell of one (segment, strip) patch.
fn patch_seed(pos: CellPos) -> u64 {
    let segment = (pos.x + pos.y).div_euclid(SEGMENT_DEPTH);
    let seg_hash = hash_i64(segment, SEGMENT_SALT);
    let line_width = STRIP_WIDTH_MIN + (seg_hash % STRIP_WIDTH_CHOICES as u64) as i64;
    let strip = (pos.x - pos.y).div_euclid(line_width);
    seg_hash ^ hash_i64(strip, STRIP_SALT).rotate_left(17)
}

/// Generate the economic parameters for a coordinate. Pure: identical input
/// always yields identical output.
#[must_use]
pub fn cell_params(pos: CellPos) -> CellParams {
    let mut rng = SmallRng::seed_from_u64(patch_seed(pos));
    let food = rng.gen_range(FOOD_MIN..=FOOD_MAX);
    let building = rng.gen_range(FOOD_MIN..=FOOD_MAX);
    let power = sample_power(&mut rng);
    let experience = sample_experience(&mut rng, power);
    CellParams {
        food,
        building,
        experience,
        power,
    }
}

fn sample_power(rng: &mut impl Rng) -> u32 {
    let weights: Vec<f64> = POWER_CANDIDATES
        .iter()
        .map(|&p| f64::from(p).powf(-1.5))
        .collect();
    let total: f64 = weights.iter().sum();
    let mut roll = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        roll -= w;
        if roll <= 0.0 {
            return POWER_CANDIDATES[i];
        }
    }
    POWER_CANDIDATES[POWER_CANDIDATES.len() - 1]
}

/// Experience cap grows linearly with power.
fn max_experience(power: u32) -> f64 {
    f64::from(EXPERIENCE_MIN) + f64::from(EXPERIENCE_SPAN) * f64::from(power) / 248.0
}

/// Skew exponent in [1,3]: weak cells draw with exponent near 3 (biased
/// low), the strongest draw uniformly.
fn experience_skew(power: u32) -> f64 {
    3.0 - 2.0 * f64::from(power - 1) / 247.0
}

fn sample_experience(rng: &mut impl Rng, power: u32) -> u32 {
    let max = max_experience(power);
    let u: f64 = rng.gen();
    let value = f64::from(EXPERIENCE_MIN) + (max - f64::from(EXPERIENCE_MIN)) * u.powf(experience_skew(power));
    value.round() as u32
}

/// Initial cell health: `power * experience`.
#[must_use]
pub fn initial_health(params: &CellParams) -> i64 {
    i64::from(params.power) * i64::from(params.experience)
}

fn clamp_channel(v: i64) -> u8 {
    v.clamp(0, 255) as u8
}

/// Map parameters to the rendered color. A cell under construction renders
/// as grayscale that darkens linearly as points approach `type * 255`.
#[must_use]
pub fn params_to_color(
    params: &CellParams,
    construction_points: u32,
    construction_type: Option<u32>,
) -> Color {
    if construction_points > 0 {
        if let Some(ty) = construction_type {
            let cap = f64::from(ty.max(1)) * 255.0;
            let frac = (f64::from(construction_points) / cap).min(1.0);
            let gray = (255.0 * (1.0 - frac)).round() as u8;
            return Color::new(gray, gray, gray);
        }
    }
    let brightness = 115 - i64::from(params.power);
    Color::new(
        clamp_channel(i64::from(params.building) + brightness),
        clamp_channel(i64::from(params.food) + brightness),
        clamp_channel(brightness),
    )
}

/// Invert [`params_to_color`] for an uncontested normal color. Experience is
/// not encoded in the color; it is reconstructed as the distribution mean for
/// the recovered power, which keeps inventory weights and the use-item
/// economy deterministic per color.
#[must_use]
pub fn params_from_color(color: &Color) -> CellParams {
    let brightness = i64::from(color.b);
    let building = (i64::from(color.r) - brightness).max(0) as u32;
    let food = (i64::from(color.g) - brightness).max(0) as u32;
    let power = (115 - brightness).max(1) as u32;
    let max = max_experience(power);
    let mean_u = 1.0 / (1.0 + experience_skew(power));
    let experience =
        (f64::from(EXPERIENCE_MIN) + (max - f64::from(EXPERIENCE_MIN)) * mean_u).round() as u32;
    CellParams {
        food,
        building,
        experience,
        power,
    }
}

/// Cosmetic biome label by food/building ratio decile. Identical ratio
/// bucket, identical label.
#[must_use]
pub fn cell_name(params: &CellParams) -> &'static str {
    let total = params.food + params.building;
    if total == 0 {
        return BIOME_NAMES[0];
    }
    let decile = (params.food as usize * 10 / total as usize).min(9);
    BIOME_NAMES[decile]
}

/// Constant override color if `pos` lies within distance 2 of a hotspot.
#[must_use]
pub fn hotspot_color(pos: CellPos) -> Option<Color> {
    HOTSPOTS
        .iter()
        .find(|(center, _)| pos.dist_sq(center) <= HOTSPOT_RADIUS_SQ)
        .map(|(_, color)| *color)
}
