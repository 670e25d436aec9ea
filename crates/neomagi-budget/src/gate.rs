use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{BudgetError, Result};
use crate::types::{eur_to_micros, micros_to_eur, BudgetStatus, Reservation, ReservationStatus};

/// Atomic spend gate backing the dispatch orchestrator's reserve-before-call,
/// settle-or-release-after-call pattern.
///
/// The entire ledger is one row (`budget_state.id = 1`) updated with a
/// single guarded `UPDATE ... WHERE ... RETURNING` so concurrent dispatches
/// across sessions never race past the stop ceiling, without a distributed
/// lock.
pub struct BudgetGate {
    db: Mutex<Connection>,
    warn_eur: f64,
    stop_eur: f64,
}

impl BudgetGate {
    pub fn new(conn: Connection, warn_eur: f64, stop_eur: f64) -> Self {
        Self {
            db: Mutex::new(conn),
            warn_eur,
            stop_eur,
        }
    }

    /// Reserve `amount_eur` against the ledger. Fails with
    /// `BudgetError::Exceeded` if doing so would cross `stop_eur` — the
    /// caller must not start the paid operation in that case.
    #[instrument(skip(self), fields(session_id, amount_eur))]
    pub fn reserve(&self, session_id: &str, amount_eur: f64) -> Result<Reservation> {
        let amount_micros = eur_to_micros(amount_eur);
        let stop_micros = eur_to_micros(self.stop_eur);
        let warn_micros = eur_to_micros(self.warn_eur);
        let now = chrono::Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();

        let db = self.db.lock().unwrap();
        let new_cumulative: Option<i64> = db
            .query_row(
                "UPDATE budget_state
                 SET cumulative_micros = cumulative_micros + ?1
                 WHERE id = 1 AND cumulative_micros + ?1 < ?2
                 RETURNING cumulative_micros",
                params![amount_micros, stop_micros],
                |row| row.get(0),
            )
            .optional()?;

        let new_cumulative = match new_cumulative {
            Some(c) => c,
            None => {
                let cumulative: i64 = db.query_row(
                    "SELECT cumulative_micros FROM budget_state WHERE id = 1",
                    [],
                    |row| row.get(0),
                )?;
                return Err(BudgetError::Exceeded {
                    cumulative_eur: micros_to_eur(cumulative),
                    attempted_eur: amount_eur,
                    stop_eur: self.stop_eur,
                });
            }
        };

        if new_cumulative >= warn_micros {
            warn!(
                cumulative_eur = micros_to_eur(new_cumulative),
                warn_eur = self.warn_eur,
                "budget_warning"
            );
        }

        db.execute(
            "INSERT INTO budget_reservations (id, session_id, reserved_micros, status, created_at)
             VALUES (?1, ?2, ?3, 'reserved', ?4)",
            params![id, session_id, amount_micros, now],
        )?;

        Ok(Reservation {
            id,
            session_id: session_id.to_string(),
            reserved_micros: amount_micros,
            status: ReservationStatus::Reserved,
            created_at: now,
        })
    }

    /// Settle a reservation against the true cost once it's known. The
    /// ledger is adjusted by the delta between actual and reserved spend —
    /// positive if the call cost more than reserved, negative if less.
    /// Idempotent: settling an already-settled or already-released
    /// reservation is a silent no-op, since the dispatch path calls this
    /// best-effort and may retry.
    #[instrument(skip(self), fields(reservation_id, actual_eur))]
    pub fn settle(&self, reservation_id: &str, actual_eur: f64) -> Result<()> {
        let actual_micros = eur_to_micros(actual_eur);
        let now = chrono::Utc::now().to_rfc3339();

        let db = self.db.lock().unwrap();
        let reserved: Option<i64> = db
            .query_row(
                "UPDATE budget_reservations
                 SET status = 'settled', settled_at = ?1
                 WHERE id = ?2 AND status = 'reserved'
                 RETURNING reserved_micros",
                params![now, reservation_id],
                |row| row.get(0),
            )
            .optional()?;

        let reserved_micros = match reserved {
            Some(r) => r,
            None => return Ok(()),
        };

        let delta = actual_micros - reserved_micros;
        if delta != 0 {
            db.execute(
                "UPDATE budget_state SET cumulative_micros = cumulative_micros + ?1 WHERE id = 1",
                params![delta],
            )?;
        }
        Ok(())
    }

    /// Release a reservation that was never settled (the paid operation
    /// never ran, e.g. the session claim or provider routing failed before
    /// dispatch started). Refunds the full reserved amount. Best-effort,
    /// same idempotency guarantee as `settle`.
    #[instrument(skip(self), fields(reservation_id))]
    pub fn release(&self, reservation_id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let reserved: Option<i64> = db
            .query_row(
                "UPDATE budget_reservations
                 SET status = 'released', settled_at = ?1
                 WHERE id = ?2 AND status = 'reserved'
                 RETURNING reserved_micros",
                params![now, reservation_id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(reserved_micros) = reserved {
            db.execute(
                "UPDATE budget_state SET cumulative_micros = cumulative_micros - ?1 WHERE id = 1",
                params![reserved_micros],
            )?;
        }
        Ok(())
    }

    /// Current spend relative to the configured thresholds.
    pub fn status(&self) -> Result<BudgetStatus> {
        let db = self.db.lock().unwrap();
        let cumulative_micros: i64 =
            db.query_row("SELECT cumulative_micros FROM budget_state WHERE id = 1", [], |row| {
                row.get(0)
            })?;
        let cumulative_eur = micros_to_eur(cumulative_micros);
        Ok(BudgetStatus {
            cumulative_eur,
            warn_eur: self.warn_eur,
            stop_eur: self.stop_eur,
            warn_crossed: cumulative_eur >= self.warn_eur,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mem(warn: f64, stop: f64) -> BudgetGate {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        BudgetGate::new(conn, warn, stop)
    }

    #[test]
    fn reserve_under_stop_succeeds() {
        let gate = open_mem(5.0, 10.0);
        let r = gate.reserve("s1", 2.0).unwrap();
        assert_eq!(r.reserved_micros, 2_000_000);
    }

    #[test]
    fn reserve_crossing_stop_is_rejected() {
        let gate = open_mem(5.0, 10.0);
        gate.reserve("s1", 9.0).unwrap();
        let err = gate.reserve("s1", 2.0).unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { .. }));
    }

    #[test]
    fn settle_adjusts_by_delta_not_absolute() {
        let gate = open_mem(5.0, 10.0);
        let r = gate.reserve("s1", 1.0).unwrap();
        gate.settle(&r.id, 1.5).unwrap();
        let status = gate.status().unwrap();
        assert!((status.cumulative_eur - 1.5).abs() < 1e-9);
    }

    #[test]
    fn settle_is_idempotent() {
        let gate = open_mem(5.0, 10.0);
        let r = gate.reserve("s1", 1.0).unwrap();
        gate.settle(&r.id, 1.5).unwrap();
        gate.settle(&r.id, 99.0).unwrap(); // second settle must not double-charge
        let status = gate.status().unwrap();
        assert!((status.cumulative_eur - 1.5).abs() < 1e-9);
    }

    #[test]
    fn release_refunds_full_reservation() {
        let gate = open_mem(5.0, 10.0);
        let r = gate.reserve("s1", 3.0).unwrap();
        gate.release(&r.id).unwrap();
        let status = gate.status().unwrap();
        assert!((status.cumulative_eur - 0.0).abs() < 1e-9);
    }

    #[test]
    fn warn_crossed_reported_once_threshold_passed() {
        let gate = open_mem(1.0, 10.0);
        gate.reserve("s1", 0.5).unwrap();
        assert!(!gate.status().unwrap().warn_crossed);
        gate.reserve("s1", 0.6).unwrap();
        assert!(gate.status().unwrap().warn_crossed);
    }
}
