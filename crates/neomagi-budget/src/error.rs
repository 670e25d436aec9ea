use thiserror::Error;

#[derive(Debug, Error)]
pub enum BudgetError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Reserving `attempted_eur` on top of `cumulative_eur` would cross the
    /// configured `stop_eur` ceiling.
    #[error("budget exceeded: cumulative={cumulative_eur:.6} attempted={attempted_eur:.6} stop={stop_eur:.6}")]
    Exceeded {
        cumulative_eur: f64,
        attempted_eur: f64,
        stop_eur: f64,
    },

    #[error("reservation not found: {id}")]
    ReservationNotFound { id: String },
}

impl BudgetError {
    pub fn code(&self) -> &'static str {
        match self {
            BudgetError::Database(_) => "DATABASE_ERROR",
            BudgetError::Exceeded { .. } => "BUDGET_EXCEEDED",
            BudgetError::ReservationNotFound { .. } => "RESERVATION_NOT_FOUND",
        }
    }
}

pub type Result<T> = std::result::Result<T, BudgetError>;
