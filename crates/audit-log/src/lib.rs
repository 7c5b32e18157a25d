//! JSON-lines security audit trail for the console gateway.
//!
//! Every admitted or rejected console connection attempt, and every bridge
//! teardown, is recorded as one newline-terminated JSON object. Tokens never
//! appear in the trail; attempts are correlated by a per-attempt UUID.
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/console-gateway/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::GatewayStarted,
//!     AuditSource::new("console-gateway"),
//!     serde_json::json!({"listen_addr": "0.0.0.0:6080"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AttemptOutcome, AuditEntry, AuditEventType, AuditSource};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
