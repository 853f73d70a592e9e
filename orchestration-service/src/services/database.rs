//! MongoDB persistence for audit entries and consent history.
//!
//! Both collections are tenant-partitioned: every read goes through
//! [`tenant_filter`], so a query can never return another tenant's documents.

use crate::error::OrchestrationError;
use crate::models::{AuditLogEntry, ConsentRecord};
use crate::services::audit::AuditSink;
use crate::services::consent::ConsentStore;
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::{
    bson::{doc, Document},
    options::{FindOptions, IndexOptions},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

const AUDIT_LOGS: &str = "audit_logs";
const CONSENT_RECORDS: &str = "consent_records";

#[derive(Clone)]
pub struct CareDb {
    client: MongoClient,
    db: Database,
}

impl CareDb {
    /// Build the client. The driver connects lazily, so this succeeds even
    /// while MongoDB is unreachable; [`health_check`](Self::health_check)
    /// reports reachability.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to create MongoDB client: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for orchestration-service");

        self.create_index(
            AUDIT_LOGS,
            doc! { "tenant_id": 1, "timestamp": -1 },
            "tenant_time_idx",
        )
        .await?;
        self.create_index(
            AUDIT_LOGS,
            doc! { "tenant_id": 1, "user_id": 1, "timestamp": -1 },
            "tenant_user_time_idx",
        )
        .await?;
        self.create_index(
            CONSENT_RECORDS,
            doc! { "tenant_id": 1, "user_id": 1, "timestamp": 1 },
            "tenant_user_time_idx",
        )
        .await?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    async fn create_index(
        &self,
        collection: &str,
        keys: Document,
        name: &str,
    ) -> Result<(), AppError> {
        let index = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().name(name.to_string()).build())
            .build();

        self.db
            .collection::<Document>(collection)
            .create_index(index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create {} index on {}: {}", name, collection, e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), AppError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                tracing::error!("MongoDB health check failed: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;
        Ok(())
    }

    // Collection accessors

    pub fn audit_logs(&self) -> Collection<AuditLogEntry> {
        self.db.collection(AUDIT_LOGS)
    }

    pub fn consent_records(&self) -> Collection<ConsentRecord> {
        self.db.collection(CONSENT_RECORDS)
    }

    /// Audit entries for a tenant, newest first, optionally for one user.
    pub async fn find_audit_entries(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>, OrchestrationError> {
        let mut filter = Document::new();
        if let Some(user_id) = user_id {
            filter.insert("user_id", user_id);
        }
        let options = FindOptions::builder()
            .sort(doc! { "timestamp": -1 })
            .limit(limit)
            .build();

        let cursor = self
            .audit_logs()
            .find(tenant_filter(tenant_id, filter), options)
            .await
            .map_err(persistence_error("find audit entries"))?;
        cursor
            .try_collect()
            .await
            .map_err(persistence_error("read audit entries"))
    }
}

/// Scope `filter` to `tenant_id`. The tenant condition always wins over any
/// `tenant_id` already present in `filter`.
pub fn tenant_filter(tenant_id: &str, mut filter: Document) -> Document {
    filter.insert("tenant_id", tenant_id);
    filter
}

fn persistence_error(context: &'static str) -> impl Fn(mongodb::error::Error) -> OrchestrationError {
    move |e| {
        tracing::error!("Failed to {}: {}", context, e);
        OrchestrationError::Persistence(format!("{}: {}", context, e))
    }
}

/// Audit sink writing straight to the `audit_logs` collection.
#[derive(Clone)]
pub struct MongoAuditSink {
    db: CareDb,
}

impl MongoAuditSink {
    pub fn new(db: CareDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for MongoAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), OrchestrationError> {
        self.db
            .audit_logs()
            .insert_one(entry, None)
            .await
            .map_err(persistence_error("insert audit entry"))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mongodb"
    }
}

#[derive(Clone)]
pub struct MongoConsentStore {
    db: CareDb,
}

impl MongoConsentStore {
    pub fn new(db: CareDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ConsentStore for MongoConsentStore {
    async fn append(&self, record: &ConsentRecord) -> Result<(), OrchestrationError> {
        self.db
            .consent_records()
            .insert_one(record, None)
            .await
            .map_err(persistence_error("insert consent record"))?;
        Ok(())
    }

    async fn history(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<ConsentRecord>, OrchestrationError> {
        let options = FindOptions::builder()
            .sort(doc! { "timestamp": 1, "_id": 1 })
            .build();

        let cursor = self
            .db
            .consent_records()
            .find(tenant_filter(tenant_id, doc! { "user_id": user_id }), options)
            .await
            .map_err(persistence_error("find consent records"))?;
        cursor
            .try_collect()
            .await
            .map_err(persistence_error("read consent records"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditStatus, ConsentAction, ConsentType};

    #[test]
    fn tenant_filter_overrides_caller_supplied_tenant() {
        let filter = tenant_filter("tenant-a", doc! { "tenant_id": "tenant-b", "user_id": "u1" });
        assert_eq!(filter.get_str("tenant_id").unwrap(), "tenant-a");
        assert_eq!(filter.get_str("user_id").unwrap(), "u1");
    }

    async fn test_db() -> Option<CareDb> {
        let uri = match std::env::var("MONGODB_TEST_URI") {
            Ok(uri) => uri,
            Err(_) => {
                eprintln!("Skipping test: MONGODB_TEST_URI is not set");
                return None;
            }
        };
        let database = format!("orchestration_test_{}", uuid::Uuid::new_v4().simple());
        let db = CareDb::connect(&uri, &database).await.unwrap();
        db.initialize_indexes().await.unwrap();
        Some(db)
    }

    #[tokio::test]
    async fn audit_entries_are_tenant_scoped() {
        let Some(db) = test_db().await else { return };
        let sink = MongoAuditSink::new(db.clone());

        for tenant in ["tenant-a", "tenant-b"] {
            let entry = AuditLogEntry::new(
                tenant,
                Some("u1".to_string()),
                "meal_log.read",
                "meal_log",
                None,
                true,
                1,
                vec![],
                AuditStatus::Success,
                None,
            );
            sink.append(&entry).await.unwrap();
        }

        let a = db.find_audit_entries("tenant-a", Some("u1"), 10).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].tenant_id, "tenant-a");
        assert!(db.find_audit_entries("tenant-c", None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn consent_history_round_trips_in_order() {
        let Some(db) = test_db().await else { return };
        let store = MongoConsentStore::new(db);

        for (tier, action) in [
            (ConsentType::Basic, ConsentAction::Granted),
            (ConsentType::Basic, ConsentAction::Revoked),
        ] {
            let record = ConsentRecord::new(
                "tenant-a",
                "u1",
                "v1",
                "127.0.0.1",
                "f".repeat(64),
                tier,
                action,
                vec![],
            );
            store.append(&record).await.unwrap();
        }

        let history = store.history("tenant-a", "u1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, ConsentAction::Revoked);
        assert!(store.history("tenant-b", "u1").await.unwrap().is_empty());
    }
}
