//! Classification of deletion-gateway failures.
//!
//! Every backend engine reports a lock conflict differently. Classification
//! is centralized here so that supporting a new backend means registering
//! one more [`LockSignature`], never touching the cycle logic.

use crate::gateway::GatewayError;

/// Kind of a classified gateway failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The backend signaled a resource-busy / lock-timeout condition;
    /// the affected keys should be quarantined and retried later.
    LockConflict,
    /// A dependent record was already removed by a concurrent operation;
    /// expected under concurrent reaping.
    DependencyGone,
    /// Anything else. Treated conservatively as cycle-fatal.
    Unclassified,
}

/// Per-backend matcher for lock-conflict signatures.
pub trait LockSignature: Send + Sync {
    /// Backend engine this signature belongs to.
    fn backend(&self) -> &'static str;

    /// Whether the driver error code/message is this backend's
    /// resource-busy condition.
    fn matches(&self, code: Option<&str>, message: &str) -> bool;
}

/// PostgreSQL: SQLSTATE 55P03 (`lock_not_available`), raised for
/// `SELECT ... FOR UPDATE NOWAIT` and `lock_timeout` violations.
struct PostgresLockNotAvailable;

impl LockSignature for PostgresLockNotAvailable {
    fn backend(&self) -> &'static str {
        "postgresql"
    }

    fn matches(&self, code: Option<&str>, message: &str) -> bool {
        code == Some("55P03")
            || message.contains("lock not available")
            || message.contains("could not obtain lock")
    }
}

/// MySQL: error 3572 (NOWAIT lock rejection) or 1205 (lock wait timeout).
struct MysqlLockNowait;

impl LockSignature for MysqlLockNowait {
    fn backend(&self) -> &'static str {
        "mysql"
    }

    fn matches(&self, code: Option<&str>, message: &str) -> bool {
        code == Some("3572")
            || code == Some("1205")
            || message.contains("NOWAIT is set")
            || message.contains("Lock wait timeout exceeded")
    }
}

/// Oracle: ORA-00054, resource busy and acquire with NOWAIT specified.
struct OracleResourceBusy;

impl LockSignature for OracleResourceBusy {
    fn backend(&self) -> &'static str {
        "oracle"
    }

    fn matches(&self, _code: Option<&str>, message: &str) -> bool {
        message.contains("ORA-00054")
    }
}

/// SQLite: SQLITE_BUSY, surfaced as "database is locked".
struct SqliteBusy;

impl LockSignature for SqliteBusy {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn matches(&self, code: Option<&str>, message: &str) -> bool {
        code == Some("5")
            || message.contains("database is locked")
            || message.contains("database table is locked")
    }
}

/// Maps an opaque gateway failure onto a [`FailureKind`].
pub struct ErrorClassifier {
    signatures: Vec<Box<dyn LockSignature>>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Classifier knowing the lock signatures of all supported backends.
    pub fn new() -> Self {
        Self {
            signatures: vec![
                Box::new(PostgresLockNotAvailable),
                Box::new(MysqlLockNowait),
                Box::new(OracleResourceBusy),
                Box::new(SqliteBusy),
            ],
        }
    }

    /// Classifier with an explicit signature set.
    pub fn with_signatures(signatures: Vec<Box<dyn LockSignature>>) -> Self {
        Self { signatures }
    }

    /// Register an additional backend signature.
    pub fn register(&mut self, signature: Box<dyn LockSignature>) {
        self.signatures.push(signature);
    }

    /// Classify a gateway failure into exactly one [`FailureKind`].
    pub fn classify(&self, error: &GatewayError) -> FailureKind {
        match error {
            GatewayError::DependencyGone { .. } => FailureKind::DependencyGone,
            GatewayError::Database { code, message } => {
                let matched = self
                    .signatures
                    .iter()
                    .find(|signature| signature.matches(code.as_deref(), message));
                match matched {
                    Some(signature) => {
                        tracing::debug!(
                            backend = signature.backend(),
                            "matched lock-conflict signature"
                        );
                        FailureKind::LockConflict
                    }
                    None => FailureKind::Unclassified,
                }
            }
            GatewayError::Unsupported(_) => FailureKind::Unclassified,
        }
    }
}
