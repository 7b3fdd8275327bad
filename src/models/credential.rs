//! Credential models.
//!
//! [`RegisterCredentials`] is the inbound payload, [`CredentialRecord`] the
//! stored row. Secret material never leaves these types through `Serialize`
//! or `Debug`.

use crate::error::{BrokerError, BrokerResult};
use crate::models::ConnectionSignature;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_FIELD_LEN: usize = 255;
const MAX_PASSWORD_LEN: usize = 1024;

/// Payload of `POST /credentials`.
///
/// `port` is deserialized as a wide integer so an out-of-range value is a
/// validation error instead of a body decoding failure.
#[derive(Clone, Deserialize)]
pub struct RegisterCredentials {
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: i64,
}

impl fmt::Debug for RegisterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterCredentials")
            .field("dbname", &self.dbname)
            .field("user", &self.user)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish()
    }
}

impl RegisterCredentials {
    /// Check field shapes and return the validated port.
    pub fn validate(&self) -> BrokerResult<u16> {
        check_field("user", &self.user)?;
        check_field("host", &self.host)?;
        check_field("dbname", &self.dbname)?;

        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(BrokerError::validation(format!(
                "password must be at most {} characters",
                MAX_PASSWORD_LEN
            )));
        }
        if self.password.contains('\0') {
            return Err(BrokerError::validation("password must not contain NUL bytes"));
        }

        u16::try_from(self.port)
            .ok()
            .filter(|port| *port != 0)
            .ok_or_else(|| {
                BrokerError::validation(format!(
                    "port must be between 1 and 65535 (got {})",
                    self.port
                ))
            })
    }
}

fn check_field(name: &str, value: &str) -> BrokerResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BrokerError::validation(format!("{} must not be empty", name)));
    }
    if trimmed.len() > MAX_FIELD_LEN {
        return Err(BrokerError::validation(format!(
            "{} must be at most {} characters",
            name, MAX_FIELD_LEN
        )));
    }
    if trimmed.contains('\0') {
        return Err(BrokerError::validation(format!(
            "{} must not contain NUL bytes",
            name
        )));
    }
    Ok(())
}

/// A stored credential row.
#[derive(Clone, Serialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub user: String,
    /// Argon2id PHC string
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// base64 AES-256-GCM blob, see [`crate::secret::SecretCipher`]
    #[serde(skip_serializing)]
    pub password_ciphertext: String,
    pub host: String,
    pub dbname: String,
    pub port: u16,
}

impl CredentialRecord {
    /// Registry key for this record.
    pub fn signature(&self) -> ConnectionSignature {
        ConnectionSignature::new(&self.user, &self.host, self.port, &self.dbname)
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("host", &self.host)
            .field("dbname", &self.dbname)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Response of `POST /credentials`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsAdded {
    pub message: String,
    pub id: i64,
}

impl CredentialsAdded {
    pub fn new(id: i64) -> Self {
        Self {
            message: "Credentials added successfully".to_string(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> RegisterCredentials {
        RegisterCredentials {
            dbname: "testdb".to_string(),
            user: "testuser".to_string(),
            password: "testpassword".to_string(),
            host: "testhost".to_string(),
            port: 5432,
        }
    }

    #[test]
    fn test_valid_payload() {
        assert_eq!(payload().validate().unwrap(), 5432);
    }

    #[test]
    fn test_port_bounds() {
        for port in [0, -1, 65536, i64::MAX] {
            let mut p = payload();
            p.port = port;
            assert!(
                matches!(p.validate(), Err(BrokerError::Validation { .. })),
                "port {port} should be rejected"
            );
        }
        let mut p = payload();
        p.port = 65535;
        assert_eq!(p.validate().unwrap(), 65535);
        p.port = 1;
        assert_eq!(p.validate().unwrap(), 1);
    }

    #[test]
    fn test_empty_fields_rejected() {
        let mut p = payload();
        p.host = "   ".to_string();
        assert!(p.validate().is_err());

        let mut p = payload();
        p.user = String::new();
        assert!(p.validate().is_err());

        let mut p = payload();
        p.dbname = String::new();
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_empty_password_allowed() {
        let mut p = payload();
        p.password = String::new();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_overlong_field_rejected() {
        let mut p = payload();
        p.host = "h".repeat(256);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let debug = format!("{:?}", payload());
        assert!(!debug.contains("testpassword"));
    }

    #[test]
    fn test_record_serialization_skips_secrets() {
        let record = CredentialRecord {
            id: 1,
            user: "u".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            password_ciphertext: "c2VjcmV0".to_string(),
            host: "h".to_string(),
            dbname: "d".to_string(),
            port: 5432,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("argon2"));
        assert!(!json.contains("c2VjcmV0"));
        assert!(!format!("{:?}", record).contains("argon2"));
    }

    #[test]
    fn test_credentials_added_message() {
        let added = CredentialsAdded::new(7);
        assert_eq!(added.message, "Credentials added successfully");
        assert_eq!(added.id, 7);
    }
}
