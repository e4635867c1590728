mod agent;
mod audit;
mod db;
mod domain;
mod error;

pub use agent::{NewDecision, NewStep};
pub use audit::{AuditFilter, AuditStats, NewAuditLog};
pub use db::Store;
pub use domain::{NewDocumentJob, NewRiskScore, RunFilter};
pub use error::{StoreError, StoreResult};
