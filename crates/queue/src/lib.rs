//! Reservation records and the durable work queue shared by all controllers.
//!
//! The queue is the only globally mutable state in the system: a mapping from
//! reservation id to record, plus a FIFO side buffer for command-audit
//! events. All writers overwrite whole records; safety against conflicting
//! writers comes from status-partitioned ownership (each loop only writes
//! records in the states it owns), not from locks.

mod audit;
mod memory;
mod redis_store;
mod reservation;
mod store;

pub use audit::AuditEntry;
pub use memory::MemoryStore;
pub use redis_store::{RedisStore, AUDIT_BUFFER_KEY, RESERVATIONS_KEY};
pub use reservation::{InvalidTransition, Reservation, Status, WorkloadKind};
pub use store::{ReservationStore, StoreError};
