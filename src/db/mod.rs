// Postgres ledger store
pub mod postgres;

pub use postgres::PostgresLedgerStore;
