//! Stage 5: the step database.
//!
//! One SQLite file holds two tables. `pdf_documents` has a row per
//! processed manual, written even when the manual yielded no steps, so the
//! cache check is a single primary-key lookup. `pdf_steps` has a row per
//! step; its asset filename columns start empty and are filled in as voice
//! and model files appear.
//!
//! Hashes are stored as the raw 32-byte digest (`BLOB`). Rows for a manual
//! are only ever replaced as a whole, inside one transaction, so a reader
//! never sees half of a re-analysis.

use crate::error::{AssetKind, GuideError};
use crate::hash::ContentHash;
use crate::output::{Confidence, DocumentRecord, StepRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const CREATE_DOCUMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS pdf_documents (
    pdf_hash     BLOB PRIMARY KEY,
    pdf_name     TEXT NOT NULL,
    image_count  INTEGER NOT NULL,
    step_count   INTEGER NOT NULL,
    processed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
)"#;

const CREATE_STEPS: &str = r#"
CREATE TABLE IF NOT EXISTS pdf_steps (
    pdf_hash             BLOB NOT NULL,
    step                 INTEGER NOT NULL,
    pdf_name             TEXT NOT NULL,
    pdf_filename         TEXT,
    image_filename       TEXT,
    instruction_filename TEXT,
    model_filename       TEXT,
    voice_filename       TEXT,
    title                TEXT,
    description          TEXT,
    reference            TEXT,
    confidence           TEXT NOT NULL DEFAULT 'unknown',
    page_number          INTEGER,
    y_percentage         REAL,
    PRIMARY KEY (pdf_hash, step)
)"#;

const STEP_COLUMNS: &str = "step, pdf_name, image_filename, instruction_filename, \
     model_filename, voice_filename, title, description, reference, confidence, \
     page_number, y_percentage";

/// The facts about a manual written alongside its steps.
#[derive(Debug, Clone)]
pub struct DocumentInfo<'a> {
    pub pdf_name: &'a str,
    /// File name of the PDF inside the volume, when it was uploaded there.
    pub pdf_filename: Option<&'a str>,
    pub image_count: usize,
}

/// Handle to the step database.
#[derive(Debug, Clone)]
pub struct StepStore {
    pool: SqlitePool,
}

impl StepStore {
    /// Open (creating if needed) the database file and its tables.
    pub async fn open(db_path: &Path) -> Result<Self, GuideError> {
        let newly_created = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| GuideError::io(parent, e))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5000));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        if newly_created {
            info!("Initialized new database: {}", db_path.display());
        } else {
            info!("Opened existing database: {}", db_path.display());
        }

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`StepStore::init`] before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables if they do not exist. Idempotent.
    pub async fn init(&self) -> Result<(), GuideError> {
        sqlx::query(CREATE_DOCUMENTS).execute(&self.pool).await?;
        sqlx::query(CREATE_STEPS).execute(&self.pool).await?;
        Ok(())
    }

    /// Whether this manual has been analyzed before.
    pub async fn is_processed(&self, hash: &ContentHash) -> Result<bool, GuideError> {
        let row = sqlx::query("SELECT 1 FROM pdf_documents WHERE pdf_hash = ?")
            .bind(hash.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Replace everything stored for `hash` with `steps`.
    pub async fn record_analysis(
        &self,
        hash: &ContentHash,
        doc: &DocumentInfo<'_>,
        steps: &[StepRecord],
    ) -> Result<(), GuideError> {
        let key = hash.as_bytes().as_slice();
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM pdf_steps WHERE pdf_hash = ?")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        for s in steps {
            sqlx::query(
                "INSERT INTO pdf_steps (pdf_hash, step, pdf_name, pdf_filename, image_filename, \
                 instruction_filename, model_filename, voice_filename, title, description, \
                 reference, confidence, page_number, y_percentage) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(key)
            .bind(s.step as i64)
            .bind(&s.pdf_name)
            .bind(doc.pdf_filename)
            .bind(&s.image_filename)
            .bind(&s.instruction_filename)
            .bind(&s.model_filename)
            .bind(&s.voice_filename)
            .bind(&s.title)
            .bind(&s.description)
            .bind(&s.reference)
            .bind(s.confidence.as_str())
            .bind(s.page_number.map(|p| p as i64))
            .bind(s.y_percentage.map(f64::from))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO pdf_documents (pdf_hash, pdf_name, image_count, step_count) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(key)
        .bind(doc.pdf_name)
        .bind(doc.image_count as i64)
        .bind(steps.len() as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("Recorded {} steps for {}", steps.len(), hash.key());
        Ok(())
    }

    /// All steps of a manual, ordered by step number.
    pub async fn steps(&self, hash: &ContentHash) -> Result<Vec<StepRecord>, GuideError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM pdf_steps WHERE pdf_hash = ? ORDER BY step"
        ))
        .bind(hash.as_bytes().as_slice())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(step_from_row).collect()
    }

    /// `(step, instruction_filename)` for steps that have an instruction file.
    pub async fn instructions(&self, hash: &ContentHash) -> Result<Vec<(u32, String)>, GuideError> {
        self.step_files(hash, "instruction_filename").await
    }

    /// `(step, image_filename)` for steps that have an image.
    pub async fn instruction_images(
        &self,
        hash: &ContentHash,
    ) -> Result<Vec<(u32, String)>, GuideError> {
        self.step_files(hash, "image_filename").await
    }

    async fn step_files(
        &self,
        hash: &ContentHash,
        column: &'static str,
    ) -> Result<Vec<(u32, String)>, GuideError> {
        let rows = sqlx::query(&format!(
            "SELECT step, {column} AS filename FROM pdf_steps \
             WHERE pdf_hash = ? AND {column} IS NOT NULL ORDER BY step"
        ))
        .bind(hash.as_bytes().as_slice())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<(u32, String), GuideError> {
                let step: i64 = row.try_get("step")?;
                let filename: String = row.try_get("filename")?;
                Ok((step as u32, filename))
            })
            .collect()
    }

    pub async fn set_voice_filename(
        &self,
        hash: &ContentHash,
        step: u32,
        filename: &str,
    ) -> Result<(), GuideError> {
        self.set_asset_filename(hash, step, AssetKind::Voice, filename)
            .await
    }

    pub async fn set_model_filename(
        &self,
        hash: &ContentHash,
        step: u32,
        filename: &str,
    ) -> Result<(), GuideError> {
        self.set_asset_filename(hash, step, AssetKind::Model, filename)
            .await
    }

    /// Record an asset file for a step. Unknown steps are ignored.
    pub async fn set_asset_filename(
        &self,
        hash: &ContentHash,
        step: u32,
        kind: AssetKind,
        filename: &str,
    ) -> Result<(), GuideError> {
        let sql = match kind {
            AssetKind::Voice => "UPDATE pdf_steps SET voice_filename = ? WHERE pdf_hash = ? AND step = ?",
            AssetKind::Model => "UPDATE pdf_steps SET model_filename = ? WHERE pdf_hash = ? AND step = ?",
        };
        sqlx::query(sql)
            .bind(filename)
            .bind(hash.as_bytes().as_slice())
            .bind(step as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every processed manual, most recent first.
    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, GuideError> {
        let rows = sqlx::query(
            "SELECT pdf_hash, pdf_name, image_count, step_count, processed_at \
             FROM pdf_documents ORDER BY processed_at DESC, pdf_name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DocumentRecord, GuideError> {
                let hash: Vec<u8> = row.try_get("pdf_hash")?;
                let image_count: i64 = row.try_get("image_count")?;
                let step_count: i64 = row.try_get("step_count")?;
                Ok(DocumentRecord {
                    pdf_hash: hex::encode(hash),
                    pdf_name: row.try_get("pdf_name")?,
                    image_count: image_count as usize,
                    step_count: step_count as usize,
                    processed_at: row.try_get("processed_at")?,
                })
            })
            .collect()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn step_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StepRecord, GuideError> {
    let step: i64 = row.try_get("step")?;
    let confidence: String = row.try_get("confidence")?;
    let page_number: Option<i64> = row.try_get("page_number")?;
    let y_percentage: Option<f64> = row.try_get("y_percentage")?;
    Ok(StepRecord {
        step: step as u32,
        pdf_name: row.try_get("pdf_name")?,
        image_filename: row.try_get("image_filename")?,
        instruction_filename: row.try_get("instruction_filename")?,
        model_filename: row.try_get("model_filename")?,
        voice_filename: row.try_get("voice_filename")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        reference: row.try_get("reference")?,
        confidence: Confidence::parse(&confidence),
        page_number: page_number.map(|p| p as usize),
        y_percentage: y_percentage.map(|y| y as f32),
    })
}
