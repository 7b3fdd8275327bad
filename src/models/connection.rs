//! Connection-related data models.
//!
//! A [`ConnectionSignature`] identifies one downstream database endpoint and is
//! the key of the pool registry. A [`ConnectTarget`] pairs it with the password
//! needed to actually open connections.

use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

/// Deterministic key for one downstream endpoint: user, host, port, dbname.
///
/// The host is normalized (trimmed, ASCII-lowercased) because host names are
/// case-insensitive; user and database names are case-sensitive in PostgreSQL
/// and are only trimmed. The password is never part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionSignature {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub dbname: String,
}

impl ConnectionSignature {
    pub fn new(
        user: impl AsRef<str>,
        host: impl AsRef<str>,
        port: u16,
        dbname: impl AsRef<str>,
    ) -> Self {
        Self {
            user: user.as_ref().trim().to_string(),
            host: host.as_ref().trim().to_ascii_lowercase(),
            port,
            dbname: dbname.as_ref().trim().to_string(),
        }
    }
}

impl fmt::Display for ConnectionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}/{}", self.user, self.host, self.port, self.dbname)
        } else {
            write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.dbname)
        }
    }
}

/// Everything needed to open a pool against one downstream database.
#[derive(Clone)]
pub struct ConnectTarget {
    pub signature: ConnectionSignature,
    /// Contains sensitive data - never log
    password: Zeroizing<String>,
}

impl ConnectTarget {
    pub fn new(signature: ConnectionSignature, password: Zeroizing<String>) -> Self {
        Self {
            signature,
            password,
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ConnectTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectTarget")
            .field("signature", &self.signature)
            .field("password", &"***")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_normalizes_host() {
        let a = ConnectionSignature::new("app", " DB.Example.COM ", 5432, "sales");
        let b = ConnectionSignature::new("app", "db.example.com", 5432, "sales");
        assert_eq!(a, b);
    }

    #[test]
    fn test_signature_keeps_user_and_dbname_case() {
        let a = ConnectionSignature::new("App", "localhost", 5432, "Sales");
        let b = ConnectionSignature::new("app", "localhost", 5432, "sales");
        assert_ne!(a, b);
    }

    #[test]
    fn test_signature_distinguishes_port() {
        let a = ConnectionSignature::new("app", "localhost", 5432, "sales");
        let b = ConnectionSignature::new("app", "localhost", 5433, "sales");
        assert_ne!(a, b);
    }

    #[test]
    fn test_signature_display() {
        let sig = ConnectionSignature::new("app", "localhost", 5432, "sales");
        assert_eq!(sig.to_string(), "app@localhost:5432/sales");

        let v6 = ConnectionSignature::new("app", "::1", 5432, "sales");
        assert_eq!(v6.to_string(), "app@[::1]:5432/sales");
    }

    #[test]
    fn test_connect_target_debug_redacts_password() {
        let target = ConnectTarget::new(
            ConnectionSignature::new("app", "localhost", 5432, "sales"),
            Zeroizing::new("hunter2".to_string()),
        );
        let debug = format!("{:?}", target);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
        assert_eq!(target.password(), "hunter2");
    }
}
