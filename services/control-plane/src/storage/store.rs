//! Store queries. The core depends only on durable CRUD, keyed lookup and
//! timestamp range scans.

use super::models::{
    AuditRow, BlacklistRow, EndpointRow, MetricSample, NodeRow, WhitelistRow,
};
use chrono::{DateTime, Utc};
use obsidianprotection_common::db;
use obsidianprotection_common::error::{Error, Result};
use sqlx::PgPool;
use tracing::{info, instrument};

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::internal(format!("migration failed: {e}")))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Endpoints
    // ------------------------------------------------------------------

    #[instrument(skip(self, row))]
    pub async fn create_endpoint(&self, row: &EndpointRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO endpoints
                (id, organization_id, name, front_ip, front_port, origin_ip, origin_port,
                 kind, rate_limit, burst_limit, maintenance, active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&row.id)
        .bind(&row.organization_id)
        .bind(&row.name)
        .bind(&row.front_ip)
        .bind(row.front_port)
        .bind(&row.origin_ip)
        .bind(row.origin_port)
        .bind(&row.kind)
        .bind(row.rate_limit)
        .bind(row.burst_limit)
        .bind(row.maintenance)
        .bind(row.active)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_endpoint(&self, id: &str) -> Result<EndpointRow> {
        sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoints WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Endpoint", id))
    }

    pub async fn list_endpoints(
        &self,
        organization_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT * FROM endpoints
            WHERE organization_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(organization_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Every endpoint, for fleet resync at startup.
    pub async fn list_all_endpoints(&self) -> Result<Vec<EndpointRow>> {
        let rows = sqlx::query_as::<_, EndpointRow>("SELECT * FROM endpoints ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn front_tuple_taken(&self, front_ip: &str, front_port: i32, kind: &str) -> Result<bool> {
        let found: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM endpoints WHERE front_ip = $1 AND front_port = $2 AND kind = $3",
        )
        .bind(front_ip)
        .bind(front_port)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    #[instrument(skip(self, row))]
    pub async fn update_endpoint(&self, row: &EndpointRow) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE endpoints
            SET name = $2, rate_limit = $3, burst_limit = $4, maintenance = $5,
                active = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(row.rate_limit)
        .bind(row.burst_limit)
        .bind(row.maintenance)
        .bind(row.active)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("Endpoint", row.id.clone()));
        }
        Ok(())
    }

    pub async fn delete_endpoint(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM endpoints WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Endpoint", id));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Nodes
    // ------------------------------------------------------------------

    pub async fn upsert_node(&self, row: &NodeRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes
                (id, name, ip, control_address, interface, status, last_seen,
                 cpu_usage, memory_usage, packet_rate)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                ip = EXCLUDED.ip,
                control_address = EXCLUDED.control_address,
                interface = EXCLUDED.interface,
                status = EXCLUDED.status,
                last_seen = EXCLUDED.last_seen,
                cpu_usage = EXCLUDED.cpu_usage,
                memory_usage = EXCLUDED.memory_usage,
                packet_rate = EXCLUDED.packet_rate
            "#,
        )
        .bind(&row.id)
        .bind(&row.name)
        .bind(&row.ip)
        .bind(&row.control_address)
        .bind(&row.interface)
        .bind(&row.status)
        .bind(row.last_seen)
        .bind(row.cpu_usage)
        .bind(row.memory_usage)
        .bind(row.packet_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_node(&self, id: &str) -> Result<NodeRow> {
        sqlx::query_as::<_, NodeRow>("SELECT * FROM nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Node", id))
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blacklist
    // ------------------------------------------------------------------

    pub async fn add_blacklist(&self, ip: &str, reason: &str, ttl_ms: i64) -> Result<BlacklistRow> {
        let row = BlacklistRow {
            id: db::generate_id(),
            ip: ip.to_string(),
            reason: reason.to_string(),
            duration_ms: ttl_ms,
            expires_at: Utc::now() + chrono::Duration::milliseconds(ttl_ms),
            active: true,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO blacklist (id, ip, reason, duration_ms, expires_at, active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (ip) DO UPDATE SET
                reason = EXCLUDED.reason,
                duration_ms = EXCLUDED.duration_ms,
                expires_at = EXCLUDED.expires_at,
                active = TRUE
            "#,
        )
        .bind(&row.id)
        .bind(&row.ip)
        .bind(&row.reason)
        .bind(row.duration_ms)
        .bind(row.expires_at)
        .bind(row.active)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn remove_blacklist(&self, ip: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM blacklist WHERE ip = $1")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Blacklist entry", ip));
        }
        Ok(())
    }

    pub async fn list_blacklist(&self, offset: i64, limit: i64) -> Result<Vec<BlacklistRow>> {
        let rows = sqlx::query_as::<_, BlacklistRow>(
            r#"
            SELECT * FROM blacklist
            WHERE active AND expires_at > NOW()
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Deactivate rows whose expiry has passed. Ran alongside the node-side
    /// reapers so listings stay truthful.
    pub async fn expire_blacklist(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE blacklist SET active = FALSE WHERE expires_at <= NOW() AND active")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Whitelist
    // ------------------------------------------------------------------

    pub async fn add_whitelist(
        &self,
        endpoint_id: &str,
        ip: &str,
        description: &str,
    ) -> Result<WhitelistRow> {
        let row = WhitelistRow {
            id: db::generate_id(),
            endpoint_id: endpoint_id.to_string(),
            ip: ip.to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"
            INSERT INTO whitelist (id, endpoint_id, ip, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (endpoint_id, ip) DO UPDATE SET description = EXCLUDED.description
            "#,
        )
        .bind(&row.id)
        .bind(&row.endpoint_id)
        .bind(&row.ip)
        .bind(&row.description)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_whitelist(&self, endpoint_id: &str) -> Result<Vec<WhitelistRow>> {
        let rows = sqlx::query_as::<_, WhitelistRow>(
            "SELECT * FROM whitelist WHERE endpoint_id = $1 ORDER BY created_at",
        )
        .bind(endpoint_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn remove_whitelist(&self, endpoint_id: &str, ip: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM whitelist WHERE endpoint_id = $1 AND ip = $2")
            .bind(endpoint_id)
            .bind(ip)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Whitelist entry", ip));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metrics and audit
    // ------------------------------------------------------------------

    pub async fn insert_metric(&self, node_id: &str, name: &str, value: f64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metric_samples (id, node_id, name, value, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(db::generate_id())
        .bind(node_id)
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn metrics_since(&self, since: DateTime<Utc>) -> Result<Vec<MetricSample>> {
        let rows = sqlx::query_as::<_, MetricSample>(
            "SELECT * FROM metric_samples WHERE recorded_at >= $1 ORDER BY recorded_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn record_audit(
        &self,
        actor: &str,
        action: &str,
        resource: &str,
        resource_id: &str,
        details: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (id, actor, action, resource, resource_id, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(db::generate_id())
        .bind(actor)
        .bind(action)
        .bind(resource)
        .bind(resource_id)
        .bind(details)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_audit(&self, offset: i64, limit: i64) -> Result<Vec<AuditRow>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT * FROM audit_log ORDER BY created_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
