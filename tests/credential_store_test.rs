//! Integration tests for the credential store on an embedded SQLite metadata database.

use schema_broker::db::CredentialStore;
use schema_broker::error::BrokerError;
use schema_broker::models::{ConnectionSignature, RegisterCredentials};
use schema_broker::secret::{KEY_SIZE, SecretCipher, SecretCodec};
use tokio_test::{assert_err, assert_ok};

/// Low-cost Argon2 params keep the suite fast.
fn codec(key_byte: u8) -> SecretCodec {
    SecretCodec::with_hash_params(SecretCipher::new(&[key_byte; KEY_SIZE]), 1024, 1, 1).unwrap()
}

async fn memory_store() -> CredentialStore {
    // One connection: every sqlite::memory: connection is its own database
    let store = CredentialStore::connect("sqlite::memory:", 1, codec(7))
        .await
        .unwrap();
    store.ensure_schema().await.unwrap();
    store
}

fn payload() -> RegisterCredentials {
    RegisterCredentials {
        dbname: "testdb".to_string(),
        user: "testuser".to_string(),
        password: "testpassword".to_string(),
        host: "testhost".to_string(),
        port: 5432,
    }
}

#[tokio::test]
async fn test_register_then_lookup() {
    let store = memory_store().await;

    let id = store.register(&payload()).await.unwrap();
    let record = store.lookup(id).await.unwrap();

    assert_eq!(record.id, id);
    assert_eq!(record.user, "testuser");
    assert_eq!(record.host, "testhost");
    assert_eq!(record.dbname, "testdb");
    assert_eq!(record.port, 5432);
    assert_ne!(record.password_hash, "testpassword");
    assert!(!record.password_ciphertext.contains("testpassword"));
    assert!(store.verify_password(&record, "testpassword"));
    assert!(!store.verify_password(&record, "wrong"));
}

#[tokio::test]
async fn test_lookup_unknown_id_is_not_found() {
    let store = memory_store().await;

    let err = store.lookup(9999).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound { .. }));
    assert_eq!(err.to_string(), "Database credentials not found");

    store.register(&payload()).await.unwrap();
    assert!(matches!(
        store.lookup(9999).await,
        Err(BrokerError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_ids_are_distinct() {
    let store = memory_store().await;
    let a = store.register(&payload()).await.unwrap();
    let b = store.register(&payload()).await.unwrap();
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_invalid_payload_is_not_persisted() {
    let store = memory_store().await;

    let mut bad = payload();
    bad.port = 70000;
    let err = store.register(&bad).await.unwrap_err();
    assert!(matches!(err, BrokerError::Validation { .. }));

    let mut bad = payload();
    bad.host = "  ".to_string();
    assert_err!(store.register(&bad).await);

    assert!(matches!(store.lookup(1).await, Err(BrokerError::NotFound { .. })));
}

#[tokio::test]
async fn test_fields_are_stored_exactly() {
    let store = memory_store().await;
    let mut p = payload();
    p.host = "DB.Example.com".to_string();
    p.user = "Mixed_Case".to_string();

    let record = store.lookup(store.register(&p).await.unwrap()).await.unwrap();
    assert_eq!(record.host, "DB.Example.com");
    assert_eq!(record.user, "Mixed_Case");
    // Signature normalizes only the host
    assert_eq!(
        record.signature(),
        ConnectionSignature::new("Mixed_Case", "db.example.com", 5432, "testdb")
    );
}

#[tokio::test]
async fn test_connect_target_recovers_password() {
    let store = memory_store().await;
    let record = store.lookup(store.register(&payload()).await.unwrap()).await.unwrap();

    let target = store.connect_target(&record).unwrap();
    assert_eq!(target.password(), "testpassword");
    assert_eq!(target.signature, record.signature());
    assert!(!format!("{:?}", target).contains("testpassword"));
}

#[tokio::test]
async fn test_records_survive_reopen_and_need_the_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("credentials.db").display());

    let id = {
        let store = CredentialStore::connect(&url, 1, codec(7)).await.unwrap();
        store.ensure_schema().await.unwrap();
        let id = store.register(&payload()).await.unwrap();
        store.close().await;
        id
    };

    let store = CredentialStore::connect(&url, 1, codec(7)).await.unwrap();
    assert_ok!(store.ensure_schema().await);
    let record = store.lookup(id).await.unwrap();
    assert_eq!(store.connect_target(&record).unwrap().password(), "testpassword");
    store.close().await;

    let other_key = CredentialStore::connect(&url, 1, codec(8)).await.unwrap();
    let record = other_key.lookup(id).await.unwrap();
    assert!(matches!(
        other_key.connect_target(&record),
        Err(BrokerError::Internal { .. })
    ));
}

#[tokio::test]
async fn test_ping() {
    let store = memory_store().await;
    assert_ok!(store.ping().await);
}
