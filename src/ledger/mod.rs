pub mod models;
pub mod repository;
pub mod schema;

pub use repository::LedgerRepository;

use crate::payer::Mechanism;
use std::path::{Path, PathBuf};

/// Ledger file for one batch paid through one mechanism.
///
/// The mechanism is part of the name so two chains never share a ledger.
pub fn ledger_path(dir: impl AsRef<Path>, batch: &str, mechanism: Mechanism) -> PathBuf {
    dir.as_ref().join(format!("{}.{}.db", batch, mechanism))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_path_includes_mechanism() {
        let path = ledger_path("/var/payouts", "2024-06", Mechanism::Polygon);
        assert_eq!(path, PathBuf::from("/var/payouts/2024-06.polygon.db"));
        assert_ne!(
            ledger_path(".", "batch", Mechanism::Eth),
            ledger_path(".", "batch", Mechanism::ZkSync)
        );
    }
}
