//! SQLite storage for watermark sets, assignments and the resource catalog

use crate::config::DatabaseConfig;
use crate::error::{Result, WatermarkError};
use crate::models::{
    validate_assignment_row, MediaFile, NewWatermarkSet, NewWatermarkSetting,
    ResourceAssignment, ResourceId, ResourceRef, ResourceType, SetId, SettingId, WatermarkSet,
    WatermarkSetUpdate, WatermarkSetting, WatermarkSettingUpdate,
};
use crate::store::{ResourceLookup, WatermarkStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

const SET_COLUMNS: &str = "id, name, is_default, enabled, created, modified";
const SETTING_COLUMNS: &str = "id, set_id, type, position, opacity, image_ref, created";
const ASSIGNMENT_COLUMNS: &str =
    "resource_type, resource_id, watermark_set_id, explicitly_no_watermark, created, modified";

/// Database manager backed by a SQLite connection pool
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Connect (creating the file if needed) and run migrations
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .journal_mode(if config.enable_wal_mode {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .foreign_keys(true);

        let filename = options.clone().get_filename();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.run_migrations().await?;

        Ok(manager)
    }

    /// Create tables and indexes if they do not exist yet
    pub async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS watermark_sets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                is_default INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created TEXT NOT NULL,
                modified TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS watermark_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                set_id INTEGER NOT NULL REFERENCES watermark_sets (id) ON DELETE CASCADE,
                type TEXT NOT NULL CHECK (type IN ('all', 'landscape', 'portrait', 'square')),
                position TEXT NOT NULL,
                opacity REAL NOT NULL CHECK (opacity >= 0.0 AND opacity <= 1.0),
                image_ref TEXT NOT NULL,
                created TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS watermark_assignments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_type TEXT NOT NULL CHECK (resource_type IN ('item', 'item_set', 'media')),
                resource_id INTEGER NOT NULL,
                watermark_set_id INTEGER REFERENCES watermark_sets (id) ON DELETE SET NULL,
                explicitly_no_watermark INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                modified TEXT NOT NULL,
                UNIQUE (resource_type, resource_id),
                CHECK (NOT (watermark_set_id IS NOT NULL AND explicitly_no_watermark = 1))
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS item_sets (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS item_item_sets (
                item_id INTEGER NOT NULL REFERENCES items (id) ON DELETE CASCADE,
                item_set_id INTEGER NOT NULL REFERENCES item_sets (id) ON DELETE CASCADE,
                PRIMARY KEY (item_id, item_set_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id INTEGER PRIMARY KEY,
                item_id INTEGER NOT NULL REFERENCES items (id) ON DELETE CASCADE,
                storage_id TEXT NOT NULL,
                media_type TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        self.create_indexes().await?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        let indexes = [
            // At most one default set, whatever the writer does
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_watermark_sets_single_default ON watermark_sets (is_default) WHERE is_default = 1",
            "CREATE INDEX IF NOT EXISTS idx_watermark_settings_set_id ON watermark_settings (set_id)",
            "CREATE INDEX IF NOT EXISTS idx_watermark_assignments_set_id ON watermark_assignments (watermark_set_id)",
            "CREATE INDEX IF NOT EXISTS idx_media_item_id ON media (item_id)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Register (or retitle) an item set in the catalog
    pub async fn register_item_set(&self, id: ResourceId, title: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO item_sets (id, title) VALUES (?1, ?2) \
             ON CONFLICT (id) DO UPDATE SET title = excluded.title",
        )
        .bind(id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Register (or retitle) an item in the catalog
    pub async fn register_item(&self, id: ResourceId, title: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO items (id, title) VALUES (?1, ?2) \
             ON CONFLICT (id) DO UPDATE SET title = excluded.title",
        )
        .bind(id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Put an item into an item set
    pub async fn link_item_to_set(&self, item_id: ResourceId, item_set_id: ResourceId) -> Result<()> {
        self.require_resource(ResourceRef::item(item_id)).await?;
        self.require_resource(ResourceRef::item_set(item_set_id)).await?;

        sqlx::query("INSERT OR IGNORE INTO item_item_sets (item_id, item_set_id) VALUES (?1, ?2)")
            .bind(item_id)
            .bind(item_set_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Register (or replace) a media belonging to an item
    pub async fn register_media(
        &self,
        id: ResourceId,
        item_id: ResourceId,
        storage_id: &str,
        media_type: &str,
    ) -> Result<()> {
        self.require_resource(ResourceRef::item(item_id)).await?;

        sqlx::query(
            "INSERT INTO media (id, item_id, storage_id, media_type) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (id) DO UPDATE SET item_id = excluded.item_id, \
             storage_id = excluded.storage_id, media_type = excluded.media_type",
        )
        .bind(id)
        .bind(item_id)
        .bind(storage_id)
        .bind(media_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Media ids in ascending order, optionally restricted to one item
    pub async fn list_media_ids(&self, item_id: Option<ResourceId>) -> Result<Vec<ResourceId>> {
        let ids = match item_id {
            Some(item_id) => {
                sqlx::query_scalar::<_, i64>("SELECT id FROM media WHERE item_id = ?1 ORDER BY id")
                    .bind(item_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar::<_, i64>("SELECT id FROM media ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(ids)
    }

    /// Get database connection pool for advanced operations
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connections
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn require_resource(&self, resource: ResourceRef) -> Result<()> {
        if self.exists(resource).await? {
            Ok(())
        } else {
            Err(WatermarkError::ResourceNotFound { resource })
        }
    }

    async fn require_set(&self, id: SetId) -> Result<WatermarkSet> {
        self.get_set(id).await?.ok_or_else(|| missing_set(id))
    }

    async fn fetch_setting(&self, id: SettingId) -> Result<Option<WatermarkSetting>> {
        let query = format!("SELECT {SETTING_COLUMNS} FROM watermark_settings WHERE id = ?1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(setting_from_row).transpose()
    }

    async fn settings_for(&self, set_id: SetId) -> Result<Vec<WatermarkSetting>> {
        let query =
            format!("SELECT {SETTING_COLUMNS} FROM watermark_settings WHERE set_id = ?1 ORDER BY id");
        let rows = sqlx::query(&query)
            .bind(set_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(setting_from_row).collect()
    }

    async fn load_set(&self, row: &SqliteRow) -> Result<WatermarkSet> {
        let mut set = set_from_row(row)?;
        set.settings = self.settings_for(set.id).await?;
        Ok(set)
    }
}

#[async_trait]
impl ResourceLookup for DatabaseManager {
    async fn exists(&self, resource: ResourceRef) -> Result<bool> {
        let query = match resource.resource_type {
            ResourceType::Item => "SELECT EXISTS (SELECT 1 FROM items WHERE id = ?1)",
            ResourceType::ItemSet => "SELECT EXISTS (SELECT 1 FROM item_sets WHERE id = ?1)",
            ResourceType::Media => "SELECT EXISTS (SELECT 1 FROM media WHERE id = ?1)",
        };
        let found = sqlx::query_scalar::<_, i64>(query)
            .bind(resource.id)
            .fetch_one(&self.pool)
            .await?;
        Ok(found != 0)
    }

    async fn parents(&self, resource: ResourceRef) -> Result<Vec<ResourceRef>> {
        match resource.resource_type {
            ResourceType::Media => {
                let item_id = sqlx::query_scalar::<_, i64>("SELECT item_id FROM media WHERE id = ?1")
                    .bind(resource.id)
                    .fetch_optional(&self.pool)
                    .await?;
                Ok(item_id.map(ResourceRef::item).into_iter().collect())
            }
            ResourceType::Item => {
                let ids = sqlx::query_scalar::<_, i64>(
                    "SELECT item_set_id FROM item_item_sets WHERE item_id = ?1 ORDER BY item_set_id",
                )
                .bind(resource.id)
                .fetch_all(&self.pool)
                .await?;
                Ok(ids.into_iter().map(ResourceRef::item_set).collect())
            }
            ResourceType::ItemSet => Ok(Vec::new()),
        }
    }

    async fn media_file(&self, media_id: ResourceId) -> Result<Option<MediaFile>> {
        let row = sqlx::query("SELECT id, item_id, storage_id, media_type FROM media WHERE id = ?1")
            .bind(media_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<MediaFile> {
            Ok(MediaFile {
                media_id: row.try_get("id")?,
                item_id: row.try_get("item_id")?,
                storage_id: row.try_get("storage_id")?,
                media_type: row.try_get("media_type")?,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl WatermarkStore for DatabaseManager {
    async fn create_set(&self, new_set: &NewWatermarkSet) -> Result<WatermarkSet> {
        new_set.validate()?;
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        if new_set.is_default {
            sqlx::query("UPDATE watermark_sets SET is_default = 0, modified = ?1 WHERE is_default = 1")
                .bind(&now)
                .execute(&mut *tx)
                .await?;
        }
        let id = sqlx::query(
            "INSERT INTO watermark_sets (name, is_default, enabled, created, modified) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(new_set.name.trim())
        .bind(new_set.is_default)
        .bind(new_set.enabled)
        .bind(&now)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        tracing::info!(set_id = id, name = %new_set.name, "Created watermark set");
        self.require_set(id).await
    }

    async fn update_set(&self, id: SetId, update: &WatermarkSetUpdate) -> Result<WatermarkSet> {
        let current = self.require_set(id).await?;
        let name = match &update.name {
            Some(name) if name.trim().is_empty() => {
                return Err(WatermarkError::invalid_argument(
                    "watermark set name must not be empty",
                ))
            }
            Some(name) => name.trim().to_string(),
            None => current.name,
        };
        let enabled = update.enabled.unwrap_or(current.enabled);
        let is_default = update.is_default.unwrap_or(current.is_default);
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        if is_default {
            sqlx::query(
                "UPDATE watermark_sets SET is_default = 0, modified = ?1 \
                 WHERE is_default = 1 AND id != ?2",
            )
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE watermark_sets SET name = ?1, enabled = ?2, is_default = ?3, modified = ?4 \
             WHERE id = ?5",
        )
        .bind(&name)
        .bind(enabled)
        .bind(is_default)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.require_set(id).await
    }

    async fn set_default(&self, id: SetId) -> Result<WatermarkSet> {
        self.update_set(
            id,
            &WatermarkSetUpdate {
                is_default: Some(true),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete_set(&self, id: SetId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        let nulled = sqlx::query(
            "UPDATE watermark_assignments SET watermark_set_id = NULL, modified = ?1 \
             WHERE watermark_set_id = ?2",
        )
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        sqlx::query("DELETE FROM watermark_settings WHERE set_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM watermark_sets WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if removed > 0 {
            tracing::info!(set_id = id, nulled_assignments = nulled, "Deleted watermark set");
        }
        Ok(removed > 0)
    }

    async fn get_set(&self, id: SetId) -> Result<Option<WatermarkSet>> {
        let query = format!("SELECT {SET_COLUMNS} FROM watermark_sets WHERE id = ?1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_set(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_sets(&self) -> Result<Vec<WatermarkSet>> {
        let query = format!("SELECT {SET_COLUMNS} FROM watermark_sets ORDER BY id");
        let set_rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let query = format!("SELECT {SETTING_COLUMNS} FROM watermark_settings ORDER BY set_id, id");
        let setting_rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut settings: HashMap<SetId, Vec<WatermarkSetting>> = HashMap::new();
        for row in &setting_rows {
            let setting = setting_from_row(row)?;
            settings.entry(setting.set_id).or_default().push(setting);
        }

        set_rows
            .iter()
            .map(|row| -> Result<WatermarkSet> {
                let mut set = set_from_row(row)?;
                set.settings = settings.remove(&set.id).unwrap_or_default();
                Ok(set)
            })
            .collect()
    }

    async fn default_set(&self) -> Result<Option<WatermarkSet>> {
        let query = format!(
            "SELECT {SET_COLUMNS} FROM watermark_sets \
             WHERE is_default = 1 AND enabled = 1 ORDER BY id LIMIT 1"
        );
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(self.load_set(&row).await?)),
            None => Ok(None),
        }
    }

    async fn add_setting(
        &self,
        set_id: SetId,
        setting: &NewWatermarkSetting,
    ) -> Result<WatermarkSetting> {
        setting.validate()?;
        self.require_set(set_id).await?;

        let id = sqlx::query(
            "INSERT INTO watermark_settings (set_id, type, position, opacity, image_ref, created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(set_id)
        .bind(setting.orientation_type.as_str())
        .bind(setting.position.as_str())
        .bind(setting.opacity as f64)
        .bind(setting.image_ref.trim())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.fetch_setting(id)
            .await?
            .ok_or_else(|| missing_setting(id))
    }

    async fn update_setting(
        &self,
        id: SettingId,
        update: &WatermarkSettingUpdate,
    ) -> Result<WatermarkSetting> {
        update.validate()?;
        let current = self.fetch_setting(id).await?.ok_or_else(|| missing_setting(id))?;

        sqlx::query(
            "UPDATE watermark_settings SET type = ?1, position = ?2, opacity = ?3, image_ref = ?4 \
             WHERE id = ?5",
        )
        .bind(update.orientation_type.unwrap_or(current.orientation_type).as_str())
        .bind(update.position.unwrap_or(current.position).as_str())
        .bind(update.opacity.unwrap_or(current.opacity) as f64)
        .bind(
            update
                .image_ref
                .as_deref()
                .map(str::trim)
                .unwrap_or(current.image_ref.as_str()),
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        self.fetch_setting(id)
            .await?
            .ok_or_else(|| missing_setting(id))
    }

    async fn delete_setting(&self, id: SettingId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM watermark_settings WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_assignment(&self, resource: ResourceRef) -> Result<Option<ResourceAssignment>> {
        let query = format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM watermark_assignments \
             WHERE resource_type = ?1 AND resource_id = ?2"
        );
        let row = sqlx::query(&query)
            .bind(resource.resource_type.as_str())
            .bind(resource.id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(assignment_from_row).transpose()
    }

    async fn upsert_assignment(
        &self,
        resource: ResourceRef,
        watermark_set_id: Option<SetId>,
        explicitly_no_watermark: bool,
    ) -> Result<ResourceAssignment> {
        validate_assignment_row(watermark_set_id, explicitly_no_watermark)?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO watermark_assignments \
             (resource_type, resource_id, watermark_set_id, explicitly_no_watermark, created, modified) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5) \
             ON CONFLICT (resource_type, resource_id) DO UPDATE SET \
             watermark_set_id = excluded.watermark_set_id, \
             explicitly_no_watermark = excluded.explicitly_no_watermark, \
             modified = excluded.modified",
        )
        .bind(resource.resource_type.as_str())
        .bind(resource.id)
        .bind(watermark_set_id)
        .bind(explicitly_no_watermark)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.find_assignment(resource).await?.ok_or_else(|| {
            WatermarkError::Persistence(sqlx::Error::RowNotFound)
        })
    }

    async fn delete_assignment(&self, resource: ResourceRef) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM watermark_assignments WHERE resource_type = ?1 AND resource_id = ?2",
        )
        .bind(resource.resource_type.as_str())
        .bind(resource.id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn missing_set(id: SetId) -> WatermarkError {
    WatermarkError::invalid_argument(format!("watermark set {} does not exist", id))
}

fn missing_setting(id: SettingId) -> WatermarkError {
    WatermarkError::invalid_argument(format!("watermark setting {} does not exist", id))
}

fn decode_error(message: String) -> WatermarkError {
    WatermarkError::Persistence(sqlx::Error::Decode(message.into()))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| decode_error(format!("invalid timestamp '{}': {}", value, e)))
}

fn set_from_row(row: &SqliteRow) -> Result<WatermarkSet> {
    Ok(WatermarkSet {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        is_default: row.try_get("is_default")?,
        enabled: row.try_get("enabled")?,
        settings: Vec::new(),
        created: parse_timestamp(&row.try_get::<String, _>("created")?)?,
        modified: parse_timestamp(&row.try_get::<String, _>("modified")?)?,
    })
}

fn setting_from_row(row: &SqliteRow) -> Result<WatermarkSetting> {
    let orientation_type: String = row.try_get("type")?;
    let position: String = row.try_get("position")?;

    Ok(WatermarkSetting {
        id: row.try_get("id")?,
        set_id: row.try_get("set_id")?,
        orientation_type: orientation_type
            .parse()
            .map_err(|e: WatermarkError| decode_error(e.to_string()))?,
        position: position
            .parse()
            .map_err(|e: WatermarkError| decode_error(e.to_string()))?,
        opacity: row.try_get::<f64, _>("opacity")? as f32,
        image_ref: row.try_get("image_ref")?,
        created: parse_timestamp(&row.try_get::<String, _>("created")?)?,
    })
}

fn assignment_from_row(row: &SqliteRow) -> Result<ResourceAssignment> {
    let resource_type: String = row.try_get("resource_type")?;

    Ok(ResourceAssignment {
        resource: ResourceRef::new(
            resource_type
                .parse()
                .map_err(|e: WatermarkError| decode_error(e.to_string()))?,
            row.try_get("resource_id")?,
        ),
        watermark_set_id: row.try_get("watermark_set_id")?,
        explicitly_no_watermark: row.try_get("explicitly_no_watermark")?,
        created: parse_timestamp(&row.try_get::<String, _>("created")?)?,
        modified: parse_timestamp(&row.try_get::<String, _>("modified")?)?,
    })
}
