use serde::{Deserialize, Serialize};

/// Fixed-point currency unit: 1 EUR = 1,000,000 micro-euros.
///
/// Spend tracking uses integer arithmetic throughout so repeated small
/// reservations and settlements never accumulate binary-float drift.
pub const MICROS_PER_EUR: f64 = 1_000_000.0;

pub fn eur_to_micros(eur: f64) -> i64 {
    (eur * MICROS_PER_EUR).round() as i64
}

pub fn micros_to_eur(micros: i64) -> f64 {
    micros as f64 / MICROS_PER_EUR
}

/// A single reserved-then-settled-or-released spend claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub session_id: String,
    pub reserved_micros: i64,
    pub status: ReservationStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Settled,
    Released,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Settled => "settled",
            ReservationStatus::Released => "released",
        }
    }
}

impl std::str::FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(ReservationStatus::Reserved),
            "settled" => Ok(ReservationStatus::Settled),
            "released" => Ok(ReservationStatus::Released),
            other => Err(format!("unknown reservation status: {other}")),
        }
    }
}

/// Threshold evaluation against the configured warn/stop ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub cumulative_eur: f64,
    pub warn_eur: f64,
    pub stop_eur: f64,
    pub warn_crossed: bool,
}
