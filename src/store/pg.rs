//! Postgres-backed [`Store`] implementation.
//!
//! Tables mirror spec.md §3 one-for-one. Composite/JSON-shaped fields
//! (policy sets, platform filter, metadata, labels) are stored as
//! `jsonb` columns rather than normalized further — the engines only
//! ever read them whole.

use super::{AccountSweepKind, ManifestIngest, RepoSweepKind, Store};
use crate::error::{Error, Result};
use crate::model::{
    Account, Blob, BlobMount, Manifest, ManifestBlobRef, ManifestManifestRef, PendingBlob, Peer, Quota, Repository,
    Tag, TrivySecurityInfo, UnknownBlob, UnknownManifest, Upload, VulnScanBlock, VulnStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(Error::Database)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded schema migration. Production deployments would
    /// use `sqlx::migrate!`; kept explicit here since the schema is
    /// small and fully owned by this crate.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(include_str!("schema.sql"))
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }
}

fn vuln_scan_block_from_str(s: &str) -> VulnScanBlock {
    match s {
        "blocked" => VulnScanBlock::Blocked,
        "allowed" => VulnScanBlock::Allowed,
        _ => VulnScanBlock::Unknown,
    }
}

fn vuln_scan_block_as_str(v: VulnScanBlock) -> &'static str {
    match v {
        VulnScanBlock::Unknown => "unknown",
        VulnScanBlock::Blocked => "blocked",
        VulnScanBlock::Allowed => "allowed",
    }
}

fn vuln_status_from_str(s: &str) -> VulnStatus {
    match s {
        "clean" => VulnStatus::Clean,
        "vulnerable" => VulnStatus::Vulnerable,
        "error" => VulnStatus::Error,
        _ => VulnStatus::Pending,
    }
}

fn vuln_status_as_str(v: VulnStatus) -> &'static str {
    match v {
        VulnStatus::Pending => "pending",
        VulnStatus::Clean => "clean",
        VulnStatus::Vulnerable => "vulnerable",
        VulnStatus::Error => "error",
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_account(&self, name: &str) -> Result<Option<Account>> {
        let row = sqlx::query(
            r#"SELECT name, auth_tenant_id, replication, platform_filter, validation_rule,
                      policies, metadata, next_blob_sweep_at, next_storage_sweep_at,
                      next_federation_announce_at, is_deleting
               FROM accounts WHERE name = $1"#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(Account {
            name: row.try_get::<String, _>("name")?.parse()?,
            auth_tenant_id: row.try_get("auth_tenant_id")?,
            replication: serde_json::from_value(row.try_get("replication")?).map_err(Error::Json)?,
            platform_filter: serde_json::from_value(row.try_get("platform_filter")?).map_err(Error::Json)?,
            validation_rule: row.try_get("validation_rule")?,
            policies: serde_json::from_value(row.try_get("policies")?).map_err(Error::Json)?,
            metadata: serde_json::from_value(row.try_get("metadata")?).map_err(Error::Json)?,
            next_blob_sweep_at: row.try_get("next_blob_sweep_at")?,
            next_storage_sweep_at: row.try_get("next_storage_sweep_at")?,
            next_federation_announce_at: row.try_get("next_federation_announce_at")?,
            is_deleting: row.try_get("is_deleting")?,
        }))
    }

    async fn put_account(&self, account: Account) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO accounts (name, auth_tenant_id, replication, platform_filter,
                   validation_rule, policies, metadata, next_blob_sweep_at,
                   next_storage_sweep_at, next_federation_announce_at, is_deleting)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (name) DO UPDATE SET
                   auth_tenant_id = EXCLUDED.auth_tenant_id,
                   replication = EXCLUDED.replication,
                   platform_filter = EXCLUDED.platform_filter,
                   validation_rule = EXCLUDED.validation_rule,
                   policies = EXCLUDED.policies,
                   metadata = EXCLUDED.metadata,
                   next_blob_sweep_at = EXCLUDED.next_blob_sweep_at,
                   next_storage_sweep_at = EXCLUDED.next_storage_sweep_at,
                   next_federation_announce_at = EXCLUDED.next_federation_announce_at,
                   is_deleting = EXCLUDED.is_deleting"#,
        )
        .bind(account.name.to_string())
        .bind(account.auth_tenant_id)
        .bind(serde_json::to_value(&account.replication).map_err(Error::Json)?)
        .bind(serde_json::to_value(&account.platform_filter).map_err(Error::Json)?)
        .bind(account.validation_rule)
        .bind(serde_json::to_value(&account.policies).map_err(Error::Json)?)
        .bind(serde_json::to_value(&account.metadata).map_err(Error::Json)?)
        .bind(account.next_blob_sweep_at)
        .bind(account.next_storage_sweep_at)
        .bind(account.next_federation_announce_at)
        .bind(account.is_deleting)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>> {
        let rows = sqlx::query(r#"SELECT name FROM accounts"#)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            if let Some(account) = self.get_account(&name).await? {
                out.push(account);
            }
        }
        Ok(out)
    }

    async fn delete_account(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM accounts WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_or_create_repository(&self, account: &str, repo_name: &str) -> Result<Repository> {
        if let Some(repo) = self.get_repository(account, repo_name).await? {
            return Ok(repo);
        }
        let now = Utc::now();
        let row = sqlx::query(
            r#"INSERT INTO repositories (account_name, name, next_blob_mount_sweep_at, next_manifest_sync_at, next_gc_at)
               VALUES ($1, $2, $3, $3, $3)
               ON CONFLICT (account_name, name) DO UPDATE SET name = EXCLUDED.name
               RETURNING id"#,
        )
        .bind(account)
        .bind(repo_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(Repository {
            id: row.try_get("id")?,
            account_name: account.parse()?,
            name: repo_name.parse()?,
            next_blob_mount_sweep_at: now,
            next_manifest_sync_at: now,
            next_gc_at: now,
        })
    }

    async fn get_repository(&self, account: &str, repo_name: &str) -> Result<Option<Repository>> {
        let row = sqlx::query(
            r#"SELECT id, next_blob_mount_sweep_at, next_manifest_sync_at, next_gc_at
               FROM repositories WHERE account_name = $1 AND name = $2"#,
        )
        .bind(account)
        .bind(repo_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Repository {
            id: row.try_get("id")?,
            account_name: account.parse()?,
            name: repo_name.parse()?,
            next_blob_mount_sweep_at: row.try_get("next_blob_mount_sweep_at")?,
            next_manifest_sync_at: row.try_get("next_manifest_sync_at")?,
            next_gc_at: row.try_get("next_gc_at")?,
        }))
    }

    async fn get_repository_by_id(&self, repo_id: i64) -> Result<Option<Repository>> {
        let row = sqlx::query(
            r#"SELECT account_name, name, next_blob_mount_sweep_at, next_manifest_sync_at, next_gc_at
               FROM repositories WHERE id = $1"#,
        )
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        let account_name: String = row.try_get("account_name")?;
        let name: String = row.try_get("name")?;
        Ok(Some(Repository {
            id: repo_id,
            account_name: account_name.parse()?,
            name: name.parse()?,
            next_blob_mount_sweep_at: row.try_get("next_blob_mount_sweep_at")?,
            next_manifest_sync_at: row.try_get("next_manifest_sync_at")?,
            next_gc_at: row.try_get("next_gc_at")?,
        }))
    }

    async fn get_blob(&self, account: &str, digest: &str) -> Result<Option<Blob>> {
        let row = sqlx::query(
            r#"SELECT id, size_bytes, storage_id, media_type, pushed_at, validated_at,
                      validation_error_message, can_be_deleted_at, blocks_vuln_scanning
               FROM blobs WHERE account_name = $1 AND digest = $2"#,
        )
        .bind(account)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Blob {
            id: row.try_get("id")?,
            account_name: account.parse()?,
            digest: digest.parse()?,
            size_bytes: row.try_get("size_bytes")?,
            storage_id: row.try_get("storage_id")?,
            media_type: row.try_get("media_type")?,
            pushed_at: row.try_get("pushed_at")?,
            validated_at: row.try_get("validated_at")?,
            validation_error_message: row.try_get("validation_error_message")?,
            can_be_deleted_at: row.try_get("can_be_deleted_at")?,
            blocks_vuln_scanning: vuln_scan_block_from_str(row.try_get("blocks_vuln_scanning")?),
        }))
    }

    async fn insert_blob(&self, blob: Blob, mount_repo_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let row = sqlx::query(
            r#"INSERT INTO blobs (account_name, digest, size_bytes, storage_id, media_type,
                   pushed_at, validated_at, validation_error_message, can_be_deleted_at, blocks_vuln_scanning)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
               RETURNING id"#,
        )
        .bind(blob.account_name.to_string())
        .bind(blob.digest.to_string())
        .bind(blob.size_bytes)
        .bind(&blob.storage_id)
        .bind(&blob.media_type)
        .bind(blob.pushed_at)
        .bind(blob.validated_at)
        .bind(&blob.validation_error_message)
        .bind(blob.can_be_deleted_at)
        .bind(vuln_scan_block_as_str(blob.blocks_vuln_scanning))
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let blob_id: i64 = row.try_get("id")?;

        sqlx::query(
            r#"INSERT INTO blob_mounts (blob_id, repo_id, can_be_deleted_at) VALUES ($1, $2, NULL)
               ON CONFLICT DO NOTHING"#,
        )
        .bind(blob_id)
        .bind(mount_repo_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn get_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<Option<BlobMount>> {
        let row = sqlx::query("SELECT can_be_deleted_at FROM blob_mounts WHERE blob_id = $1 AND repo_id = $2")
            .bind(blob_id)
            .bind(repo_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(BlobMount { blob_id, repo_id, can_be_deleted_at: row.try_get("can_be_deleted_at")? }))
    }

    async fn insert_blob_mount(&self, mount: BlobMount) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO blob_mounts (blob_id, repo_id, can_be_deleted_at) VALUES ($1, $2, $3)
               ON CONFLICT (blob_id, repo_id) DO UPDATE SET can_be_deleted_at = EXCLUDED.can_be_deleted_at"#,
        )
        .bind(mount.blob_id)
        .bind(mount.repo_id)
        .bind(mount.can_be_deleted_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_blob_deletable(&self, blob_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE blobs SET can_be_deleted_at = $1 WHERE id = $2")
            .bind(at)
            .bind(blob_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_blob(&self, blob_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM blobs WHERE id = $1")
            .bind(blob_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn unreferenced_blobs(&self, account: &str, limit: u32) -> Result<Vec<Blob>> {
        let rows = sqlx::query(
            r#"SELECT b.id, b.digest, b.size_bytes, b.storage_id, b.media_type, b.pushed_at,
                      b.validated_at, b.validation_error_message, b.can_be_deleted_at, b.blocks_vuln_scanning
               FROM blobs b
               WHERE b.account_name = $1
                 AND NOT EXISTS (SELECT 1 FROM blob_mounts m WHERE m.blob_id = b.id)
               LIMIT $2"#,
        )
        .bind(account)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let digest: String = row.try_get("digest")?;
            out.push(Blob {
                id: row.try_get("id")?,
                account_name: account.parse()?,
                digest: digest.parse()?,
                size_bytes: row.try_get("size_bytes")?,
                storage_id: row.try_get("storage_id")?,
                media_type: row.try_get("media_type")?,
                pushed_at: row.try_get("pushed_at")?,
                validated_at: row.try_get("validated_at")?,
                validation_error_message: row.try_get("validation_error_message")?,
                can_be_deleted_at: row.try_get("can_be_deleted_at")?,
                blocks_vuln_scanning: vuln_scan_block_from_str(row.try_get("blocks_vuln_scanning")?),
            });
        }
        Ok(out)
    }

    async fn account_has_blobs(&self, account: &str) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM blobs WHERE account_name = $1) AS present")
            .bind(account)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.try_get("present")?)
    }

    async fn blob_exists_by_storage_id(&self, account: &str, storage_id: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM blobs WHERE account_name = $1 AND storage_id = $2) AS present",
        )
        .bind(account)
        .bind(storage_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.try_get("present")?)
    }

    async fn try_acquire_pending_blob(&self, pending: PendingBlob) -> Result<bool> {
        let result = sqlx::query(
            r#"INSERT INTO pending_blobs (account_name, digest, reason, since)
               VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"#,
        )
        .bind(pending.account_name.to_string())
        .bind(pending.digest.to_string())
        .bind("replication")
        .bind(pending.since)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_pending_blob(&self, account: &str, digest: &str) -> Result<Option<PendingBlob>> {
        let row = sqlx::query("SELECT since FROM pending_blobs WHERE account_name = $1 AND digest = $2")
            .bind(account)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(PendingBlob {
            account_name: account.parse()?,
            digest: digest.parse()?,
            reason: crate::model::PendingBlobReason::Replication,
            since: row.try_get("since")?,
        }))
    }

    async fn delete_pending_blob(&self, account: &str, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_blobs WHERE account_name = $1 AND digest = $2")
            .bind(account)
            .bind(digest)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn create_upload(&self, upload: Upload) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO uploads (repo_id, uuid, storage_id, size_bytes, digest_state_hex, chunk_count, updated_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .bind(&upload.storage_id)
        .bind(upload.size_bytes)
        .bind(&upload.digest_state_hex)
        .bind(upload.chunk_count)
        .bind(upload.updated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<Option<Upload>> {
        let row = sqlx::query(
            r#"SELECT storage_id, size_bytes, digest_state_hex, chunk_count, updated_at
               FROM uploads WHERE repo_id = $1 AND uuid = $2"#,
        )
        .bind(repo_id)
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Upload {
            repo_id,
            uuid,
            storage_id: row.try_get("storage_id")?,
            size_bytes: row.try_get("size_bytes")?,
            digest_state_hex: row.try_get("digest_state_hex")?,
            chunk_count: row.try_get("chunk_count")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    async fn update_upload(&self, upload: Upload) -> Result<()> {
        sqlx::query(
            r#"UPDATE uploads SET size_bytes = $1, digest_state_hex = $2, chunk_count = $3, updated_at = $4
               WHERE repo_id = $5 AND uuid = $6"#,
        )
        .bind(upload.size_bytes)
        .bind(&upload.digest_state_hex)
        .bind(upload.chunk_count)
        .bind(upload.updated_at)
        .bind(upload.repo_id)
        .bind(upload.uuid)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_upload(&self, repo_id: i64, uuid: uuid::Uuid) -> Result<()> {
        sqlx::query("DELETE FROM uploads WHERE repo_id = $1 AND uuid = $2")
            .bind(repo_id)
            .bind(uuid)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_manifest(&self, repo_id: i64, digest: &str) -> Result<Option<Manifest>> {
        let row = sqlx::query(
            r#"SELECT media_type, size_bytes, pushed_at, validated_at, validation_error_message,
                      last_pulled_at, min_layer_created_at, max_layer_created_at, labels, gc_status
               FROM manifests WHERE repo_id = $1 AND digest = $2"#,
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Manifest {
            repo_id,
            digest: digest.parse()?,
            media_type: row.try_get("media_type")?,
            size_bytes: row.try_get("size_bytes")?,
            pushed_at: row.try_get("pushed_at")?,
            validated_at: row.try_get("validated_at")?,
            validation_error_message: row.try_get("validation_error_message")?,
            last_pulled_at: row.try_get("last_pulled_at")?,
            min_layer_created_at: row.try_get("min_layer_created_at")?,
            max_layer_created_at: row.try_get("max_layer_created_at")?,
            labels: serde_json::from_value(row.try_get("labels")?).map_err(Error::Json)?,
            gc_status: serde_json::from_value(row.try_get("gc_status")?).map_err(Error::Json)?,
        }))
    }

    async fn get_manifest_content(&self, repo_id: i64, digest: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT content FROM manifest_contents WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.map(|r| r.try_get::<Vec<u8>, _>("content")).transpose()?)
    }

    async fn manifest_blob_refs(&self, repo_id: i64, digest: &str) -> Result<Vec<ManifestBlobRef>> {
        let rows = sqlx::query("SELECT blob_id FROM manifest_blob_refs WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(ManifestBlobRef { repo_id, digest: digest.parse()?, blob_id: row.try_get("blob_id")? })
            })
            .collect()
    }

    async fn manifest_parent_refs(&self, repo_id: i64, child_digest: &str) -> Result<Vec<ManifestManifestRef>> {
        let rows = sqlx::query(
            "SELECT parent_digest FROM manifest_manifest_refs WHERE repo_id = $1 AND child_digest = $2",
        )
        .bind(repo_id)
        .bind(child_digest)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                let parent_digest: String = row.try_get("parent_digest")?;
                Ok(ManifestManifestRef {
                    repo_id,
                    parent_digest: parent_digest.parse()?,
                    child_digest: child_digest.parse()?,
                })
            })
            .collect()
    }

    async fn commit_manifest_ingest(&self, ingest: ManifestIngest) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let repo_id = ingest.manifest.repo_id;
        let digest = ingest.manifest.digest.to_string();

        sqlx::query(
            r#"INSERT INTO manifests (repo_id, digest, media_type, size_bytes, pushed_at, validated_at,
                   validation_error_message, last_pulled_at, min_layer_created_at, max_layer_created_at,
                   labels, gc_status)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
               ON CONFLICT (repo_id, digest) DO NOTHING"#,
        )
        .bind(repo_id)
        .bind(&digest)
        .bind(&ingest.manifest.media_type)
        .bind(ingest.manifest.size_bytes)
        .bind(ingest.manifest.pushed_at)
        .bind(ingest.manifest.validated_at)
        .bind(&ingest.manifest.validation_error_message)
        .bind(ingest.manifest.last_pulled_at)
        .bind(ingest.manifest.min_layer_created_at)
        .bind(ingest.manifest.max_layer_created_at)
        .bind(serde_json::to_value(&ingest.manifest.labels).map_err(Error::Json)?)
        .bind(serde_json::to_value(&ingest.manifest.gc_status).map_err(Error::Json)?)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "INSERT INTO manifest_contents (repo_id, digest, content) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        )
        .bind(repo_id)
        .bind(&digest)
        .bind(&ingest.content.content)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        for blob_ref in &ingest.blob_refs {
            sqlx::query(
                "INSERT INTO manifest_blob_refs (repo_id, digest, blob_id) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(repo_id)
            .bind(&digest)
            .bind(blob_ref.blob_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        for manifest_ref in &ingest.manifest_refs {
            sqlx::query(
                r#"INSERT INTO manifest_manifest_refs (repo_id, parent_digest, child_digest)
                   VALUES ($1, $2, $3) ON CONFLICT DO NOTHING"#,
            )
            .bind(repo_id)
            .bind(manifest_ref.parent_digest.to_string())
            .bind(manifest_ref.child_digest.to_string())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        if let Some(tag) = &ingest.tag_upsert {
            sqlx::query(
                r#"INSERT INTO tags (repo_id, name, digest, pushed_at, last_pulled_at)
                   VALUES ($1, $2, $3, $4, $5)
                   ON CONFLICT (repo_id, name) DO UPDATE SET digest = EXCLUDED.digest, pushed_at = EXCLUDED.pushed_at"#,
            )
            .bind(tag.repo_id)
            .bind(&tag.name)
            .bind(tag.digest.to_string())
            .bind(tag.pushed_at)
            .bind(tag.last_pulled_at)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            r#"INSERT INTO trivy_security_info (repo_id, digest, status, message, next_check_at, checked_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (repo_id, digest) DO NOTHING"#,
        )
        .bind(repo_id)
        .bind(&ingest.trivy_info.digest)
        .bind(vuln_status_as_str(ingest.trivy_info.status))
        .bind(&ingest.trivy_info.message)
        .bind(ingest.trivy_info.next_check_at)
        .bind(ingest.trivy_info.checked_at)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_manifest(&self, repo_id: i64, digest: &str) -> Result<()> {
        let referenced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM manifest_manifest_refs WHERE repo_id = $1 AND child_digest = $2)",
        )
        .bind(repo_id)
        .bind(digest)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        if referenced {
            return Err(Error::Denied(format!(
                "manifest {digest} is still referenced by a parent manifest"
            )));
        }
        sqlx::query("DELETE FROM manifests WHERE repo_id = $1 AND digest = $2")
            .bind(repo_id)
            .bind(digest)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn count_manifests_for_tenant(&self, auth_tenant_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM manifests m
               JOIN repositories r ON r.id = m.repo_id
               JOIN accounts a ON a.name = r.account_name
               WHERE a.auth_tenant_id = $1"#,
        )
        .bind(auth_tenant_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count)
    }

    async fn get_tag(&self, repo_id: i64, name: &str) -> Result<Option<Tag>> {
        let row = sqlx::query("SELECT digest, pushed_at, last_pulled_at FROM tags WHERE repo_id = $1 AND name = $2")
            .bind(repo_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        let digest: String = row.try_get("digest")?;
        Ok(Some(Tag {
            repo_id,
            name: name.to_string(),
            digest: digest.parse()?,
            pushed_at: row.try_get("pushed_at")?,
            last_pulled_at: row.try_get("last_pulled_at")?,
        }))
    }

    async fn list_tags(&self, repo_id: i64) -> Result<Vec<Tag>> {
        let rows = sqlx::query("SELECT name, digest, pushed_at, last_pulled_at FROM tags WHERE repo_id = $1")
            .bind(repo_id)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                let digest: String = row.try_get("digest")?;
                Ok(Tag {
                    repo_id,
                    name: row.try_get("name")?,
                    digest: digest.parse()?,
                    pushed_at: row.try_get("pushed_at")?,
                    last_pulled_at: row.try_get("last_pulled_at")?,
                })
            })
            .collect()
    }

    async fn delete_tag(&self, repo_id: i64, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM tags WHERE repo_id = $1 AND name = $2")
            .bind(repo_id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_quota(&self, auth_tenant_id: &str) -> Result<Option<Quota>> {
        let row = sqlx::query("SELECT manifest_count_limit FROM quotas WHERE auth_tenant_id = $1")
            .bind(auth_tenant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Quota {
            auth_tenant_id: auth_tenant_id.to_string(),
            manifest_count_limit: row.try_get("manifest_count_limit")?,
        }))
    }

    async fn put_quota(&self, quota: Quota) -> Result<()> {
        sqlx::query(
            "INSERT INTO quotas (auth_tenant_id, manifest_count_limit) VALUES ($1, $2)
             ON CONFLICT (auth_tenant_id) DO UPDATE SET manifest_count_limit = EXCLUDED.manifest_count_limit",
        )
        .bind(&quota.auth_tenant_id)
        .bind(quota.manifest_count_limit)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_peer(&self, hostname: &str) -> Result<Option<Peer>> {
        let row = sqlx::query(
            r#"SELECT our_password, their_current_password_hash, their_previous_password_hash, last_peered_at
               FROM peers WHERE hostname = $1"#,
        )
        .bind(hostname)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Peer {
            hostname: hostname.to_string(),
            our_password: row.try_get("our_password")?,
            their_current_password_hash: row.try_get("their_current_password_hash")?,
            their_previous_password_hash: row.try_get("their_previous_password_hash")?,
            last_peered_at: row.try_get("last_peered_at")?,
        }))
    }

    async fn put_peer(&self, peer: Peer) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO peers (hostname, our_password, their_current_password_hash,
                   their_previous_password_hash, last_peered_at)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (hostname) DO UPDATE SET
                   our_password = EXCLUDED.our_password,
                   their_current_password_hash = EXCLUDED.their_current_password_hash,
                   their_previous_password_hash = EXCLUDED.their_previous_password_hash,
                   last_peered_at = EXCLUDED.last_peered_at"#,
        )
        .bind(&peer.hostname)
        .bind(&peer.our_password)
        .bind(&peer.their_current_password_hash)
        .bind(&peer.their_previous_password_hash)
        .bind(peer.last_peered_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn record_unknown_blob(&self, unknown: UnknownBlob) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO unknown_blobs (account_name, storage_id, can_be_deleted_at)
               VALUES ($1, $2, $3)
               ON CONFLICT (account_name, storage_id) DO NOTHING"#,
        )
        .bind(unknown.account_name.to_string())
        .bind(&unknown.storage_id)
        .bind(unknown.can_be_deleted_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn due_unknown_blobs(&self, account: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<UnknownBlob>> {
        let rows = sqlx::query(
            "SELECT storage_id, can_be_deleted_at FROM unknown_blobs WHERE account_name = $1 AND can_be_deleted_at <= $2 LIMIT $3",
        )
        .bind(account)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(UnknownBlob {
                    account_name: account.parse()?,
                    storage_id: row.try_get("storage_id")?,
                    can_be_deleted_at: row.try_get("can_be_deleted_at")?,
                })
            })
            .collect()
    }

    async fn clear_unknown_blob(&self, account: &str, storage_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM unknown_blobs WHERE account_name = $1 AND storage_id = $2")
            .bind(account)
            .bind(storage_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn record_unknown_manifest(&self, unknown: UnknownManifest) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO unknown_manifests (account_name, repo_name, digest, can_be_deleted_at)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (account_name, repo_name, digest) DO NOTHING"#,
        )
        .bind(unknown.account_name.to_string())
        .bind(&unknown.repo_name)
        .bind(unknown.digest.to_string())
        .bind(unknown.can_be_deleted_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn due_unknown_manifests(
        &self,
        account: &str,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnknownManifest>> {
        let rows = sqlx::query(
            r#"SELECT repo_name, digest, can_be_deleted_at FROM unknown_manifests
               WHERE account_name = $1 AND can_be_deleted_at <= $2 LIMIT $3"#,
        )
        .bind(account)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                let digest: String = row.try_get("digest")?;
                Ok(UnknownManifest {
                    account_name: account.parse()?,
                    repo_name: row.try_get("repo_name")?,
                    digest: digest.parse()?,
                    can_be_deleted_at: row.try_get("can_be_deleted_at")?,
                })
            })
            .collect()
    }

    async fn clear_unknown_manifest(&self, account: &str, repo_name: &str, digest: &str) -> Result<()> {
        sqlx::query("DELETE FROM unknown_manifests WHERE account_name = $1 AND repo_name = $2 AND digest = $3")
            .bind(account)
            .bind(repo_name)
            .bind(digest)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn upsert_trivy_info(&self, info: TrivySecurityInfo) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO trivy_security_info (repo_id, digest, status, message, next_check_at, checked_at)
               VALUES ($1, $2, $3, $4, $5, $6)
               ON CONFLICT (repo_id, digest) DO UPDATE SET
                   status = EXCLUDED.status, message = EXCLUDED.message,
                   next_check_at = EXCLUDED.next_check_at, checked_at = EXCLUDED.checked_at"#,
        )
        .bind(info.repo_id)
        .bind(&info.digest)
        .bind(vuln_status_as_str(info.status))
        .bind(&info.message)
        .bind(info.next_check_at)
        .bind(info.checked_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn due_trivy_checks(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<TrivySecurityInfo>> {
        let rows = sqlx::query(
            r#"SELECT repo_id, digest, status, message, next_check_at, checked_at
               FROM trivy_security_info WHERE next_check_at <= $1 LIMIT $2"#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(TrivySecurityInfo {
                    repo_id: row.try_get("repo_id")?,
                    digest: row.try_get("digest")?,
                    status: vuln_status_from_str(row.try_get("status")?),
                    message: row.try_get("message")?,
                    next_check_at: row.try_get("next_check_at")?,
                    checked_at: row.try_get("checked_at")?,
                    check_duration: None,
                })
            })
            .collect()
    }

    async fn due_accounts_for(&self, kind: AccountSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Account>> {
        let column = account_sweep_column(kind);
        let query = format!("SELECT name FROM accounts WHERE {column} <= $1 ORDER BY {column} LIMIT $2");
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            if let Some(account) = self.get_account(&name).await? {
                out.push(account);
            }
        }
        Ok(out)
    }

    async fn reschedule_account(&self, name: &str, kind: AccountSweepKind, next_at: DateTime<Utc>) -> Result<()> {
        let column = account_sweep_column(kind);
        let query = format!("UPDATE accounts SET {column} = $1 WHERE name = $2");
        sqlx::query(&query)
            .bind(next_at)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn due_repositories_for(&self, kind: RepoSweepKind, now: DateTime<Utc>, limit: u32) -> Result<Vec<Repository>> {
        let column = repo_sweep_column(kind);
        let query = format!(
            "SELECT id, account_name, name FROM repositories WHERE {column} <= $1 ORDER BY {column} LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let account: String = row.try_get("account_name")?;
            let name: String = row.try_get("name")?;
            if let Some(repo) = self.get_repository(&account, &name).await? {
                out.push(repo);
            }
        }
        Ok(out)
    }

    async fn reschedule_repository(&self, repo_id: i64, kind: RepoSweepKind, next_at: DateTime<Utc>) -> Result<()> {
        let column = repo_sweep_column(kind);
        let query = format!("UPDATE repositories SET {column} = $1 WHERE id = $2");
        sqlx::query(&query)
            .bind(next_at)
            .bind(repo_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_manifests(&self, repo_id: i64) -> Result<Vec<Manifest>> {
        let rows = sqlx::query(
            r#"SELECT digest, media_type, size_bytes, pushed_at, validated_at, validation_error_message,
                      last_pulled_at, min_layer_created_at, max_layer_created_at, labels, gc_status
               FROM manifests WHERE repo_id = $1"#,
        )
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(Manifest {
                    repo_id,
                    digest: row.try_get::<String, _>("digest")?.parse()?,
                    media_type: row.try_get("media_type")?,
                    size_bytes: row.try_get("size_bytes")?,
                    pushed_at: row.try_get("pushed_at")?,
                    validated_at: row.try_get("validated_at")?,
                    validation_error_message: row.try_get("validation_error_message")?,
                    last_pulled_at: row.try_get("last_pulled_at")?,
                    min_layer_created_at: row.try_get("min_layer_created_at")?,
                    max_layer_created_at: row.try_get("max_layer_created_at")?,
                    labels: serde_json::from_value(row.try_get("labels")?).map_err(Error::Json)?,
                    gc_status: serde_json::from_value(row.try_get("gc_status")?).map_err(Error::Json)?,
                })
            })
            .collect()
    }

    async fn manifest_has_children(&self, repo_id: i64, parent_digest: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM manifest_manifest_refs WHERE repo_id = $1 AND parent_digest = $2) AS present",
        )
        .bind(repo_id)
        .bind(parent_digest)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.try_get("present")?)
    }

    async fn unreferenced_mounts(&self, repo_id: i64, limit: u32) -> Result<Vec<BlobMount>> {
        let rows = sqlx::query(
            r#"SELECT blob_id, can_be_deleted_at FROM blob_mounts
               WHERE repo_id = $1
                 AND NOT EXISTS (
                     SELECT 1 FROM manifest_blob_refs
                     WHERE manifest_blob_refs.repo_id = blob_mounts.repo_id
                       AND manifest_blob_refs.blob_id = blob_mounts.blob_id
                 )
               LIMIT $2"#,
        )
        .bind(repo_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                Ok(BlobMount {
                    blob_id: row.try_get("blob_id")?,
                    repo_id,
                    can_be_deleted_at: row.try_get("can_be_deleted_at")?,
                })
            })
            .collect()
    }

    async fn mark_mount_deletable(&self, blob_id: i64, repo_id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE blob_mounts SET can_be_deleted_at = $1 WHERE blob_id = $2 AND repo_id = $3")
            .bind(at)
            .bind(blob_id)
            .bind(repo_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn delete_blob_mount(&self, blob_id: i64, repo_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM blob_mounts WHERE blob_id = $1 AND repo_id = $2")
            .bind(blob_id)
            .bind(repo_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn blobs_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Blob>> {
        let rows = sqlx::query(
            r#"SELECT id, account_name, digest, size_bytes, storage_id, media_type, pushed_at, validated_at,
                      validation_error_message, can_be_deleted_at, blocks_vuln_scanning
               FROM blobs
               WHERE validated_at IS NULL OR validated_at < $1
               ORDER BY validated_at ASC NULLS FIRST
               LIMIT $2"#,
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let account_name: String = row.try_get("account_name")?;
            let digest: String = row.try_get("digest")?;
            out.push(Blob {
                id: row.try_get("id")?,
                account_name: account_name.parse()?,
                digest: digest.parse()?,
                size_bytes: row.try_get("size_bytes")?,
                storage_id: row.try_get("storage_id")?,
                media_type: row.try_get("media_type")?,
                pushed_at: row.try_get("pushed_at")?,
                validated_at: row.try_get("validated_at")?,
                validation_error_message: row.try_get("validation_error_message")?,
                can_be_deleted_at: row.try_get("can_be_deleted_at")?,
                blocks_vuln_scanning: vuln_scan_block_from_str(row.try_get("blocks_vuln_scanning")?),
            });
        }
        Ok(out)
    }

    async fn manifests_due_for_validation(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<Manifest>> {
        let rows = sqlx::query(
            r#"SELECT repo_id, digest, media_type, size_bytes, pushed_at, validated_at,
                      validation_error_message, last_pulled_at, min_layer_created_at, max_layer_created_at,
                      labels, gc_status
               FROM manifests
               WHERE validated_at IS NULL OR validated_at < $1
               ORDER BY validated_at ASC NULLS FIRST
               LIMIT $2"#,
        )
        .bind(before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.into_iter()
            .map(|row| {
                let digest: String = row.try_get("digest")?;
                Ok(Manifest {
                    repo_id: row.try_get("repo_id")?,
                    digest: digest.parse()?,
                    media_type: row.try_get("media_type")?,
                    size_bytes: row.try_get("size_bytes")?,
                    pushed_at: row.try_get("pushed_at")?,
                    validated_at: row.try_get("validated_at")?,
                    validation_error_message: row.try_get("validation_error_message")?,
                    last_pulled_at: row.try_get("last_pulled_at")?,
                    min_layer_created_at: row.try_get("min_layer_created_at")?,
                    max_layer_created_at: row.try_get("max_layer_created_at")?,
                    labels: serde_json::from_value(row.try_get("labels")?).map_err(Error::Json)?,
                    gc_status: serde_json::from_value(row.try_get("gc_status")?).map_err(Error::Json)?,
                })
            })
            .collect()
    }

    async fn update_blob_validation(
        &self,
        blob_id: i64,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()> {
        sqlx::query("UPDATE blobs SET validated_at = $1, validation_error_message = $2 WHERE id = $3")
            .bind(validated_at)
            .bind(error_message)
            .bind(blob_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn update_manifest_validation(
        &self,
        repo_id: i64,
        digest: &str,
        validated_at: DateTime<Utc>,
        error_message: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE manifests SET validated_at = $1, validation_error_message = $2 WHERE repo_id = $3 AND digest = $4",
        )
        .bind(validated_at)
        .bind(error_message)
        .bind(repo_id)
        .bind(digest)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }
}

fn account_sweep_column(kind: AccountSweepKind) -> &'static str {
    match kind {
        AccountSweepKind::BlobSweep => "next_blob_sweep_at",
        AccountSweepKind::StorageSweep => "next_storage_sweep_at",
        AccountSweepKind::FederationAnnounce => "next_federation_announce_at",
    }
}

fn repo_sweep_column(kind: RepoSweepKind) -> &'static str {
    match kind {
        RepoSweepKind::MountSweep => "next_blob_mount_sweep_at",
        RepoSweepKind::ManifestSync => "next_manifest_sync_at",
        RepoSweepKind::Gc => "next_gc_at",
    }
}
