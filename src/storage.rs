use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::open_db_connection;
use crate::violation::{NewViolation, PersistedRecord, ViolationType};

pub const STATUS_PENDING: &str = "pending";

/// Violation persistence.
///
/// `insert` returns `Ok(None)` when the store accepted the call but created no
/// new record (the same evidence crop was already stored for that violation
/// type). Implementations are shared between finalizer threads.
pub trait ViolationStore: Send + Sync {
    fn insert(&self, violation: &NewViolation<'_>) -> Result<Option<PersistedRecord>>;

    /// Most recent records first.
    fn recent(&self, limit: usize) -> Result<Vec<PersistedRecord>>;
}

pub fn crop_digest(crop_jpeg: &[u8]) -> String {
    hex::encode(Sha256::digest(crop_jpeg))
}

fn epoch_s(t: SystemTime) -> Result<u64> {
    Ok(t.duration_since(UNIX_EPOCH)
        .context("violation timestamp before unix epoch")?
        .as_secs())
}

pub struct SqliteViolationStore {
    conn: Mutex<Connection>,
}

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("open violation store at {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("violation store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              license_plate TEXT NOT NULL,
              owner_name TEXT,
              owner_phone TEXT,
              owner_email TEXT,
              owner_address TEXT,
              violation_type TEXT NOT NULL,
              violation_address TEXT NOT NULL,
              fine INTEGER NOT NULL,
              confidence REAL NOT NULL,
              crop_jpeg BLOB NOT NULL,
              crop_sha256 TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              status TEXT NOT NULL DEFAULT 'pending',
              UNIQUE(crop_sha256, violation_type)
            );

            CREATE INDEX IF NOT EXISTS idx_violations_timestamp ON violations(timestamp);
            CREATE INDEX IF NOT EXISTS idx_violations_plate ON violations(license_plate);
            "#,
        )?;
        Ok(())
    }

    /// Stored evidence crop for a record.
    pub fn crop_jpeg(&self, id: i64) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let crop = conn
            .query_row(
                "SELECT crop_jpeg FROM violations WHERE id = ?1",
                params![id],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(crop)
    }
}

fn record_from_row(row: &Row<'_>) -> Result<PersistedRecord> {
    let violation_type: String = row.get(6)?;
    let violation_type = ViolationType::parse(&violation_type)
        .ok_or_else(|| anyhow!("corrupt violation row: type '{}'", violation_type))?;
    let fine: i64 = row.get(8)?;
    let detected_at: i64 = row.get(11)?;
    Ok(PersistedRecord {
        id: row.get(0)?,
        license_plate: row.get(1)?,
        owner_name: row.get(2)?,
        owner_phone: row.get(3)?,
        owner_email: row.get(4)?,
        owner_address: row.get(5)?,
        violation_type,
        violation_address: row.get(7)?,
        fine: u32::try_from(fine).map_err(|_| anyhow!("corrupt violation row: fine"))?,
        confidence: row.get::<_, f64>(9)? as f32,
        crop_sha256: row.get(10)?,
        detected_at: u64::try_from(detected_at)
            .map_err(|_| anyhow!("corrupt violation row: timestamp"))?,
        status: row.get(12)?,
    })
}

const RECORD_COLUMNS: &str = "id, license_plate, owner_name, owner_phone, owner_email, \
     owner_address, violation_type, violation_address, fine, confidence, crop_sha256, \
     timestamp, status";

impl ViolationStore for SqliteViolationStore {
    fn insert(&self, violation: &NewViolation<'_>) -> Result<Option<PersistedRecord>> {
        let detected_at = epoch_s(violation.detected_at)?;
        let created_at =
            i64::try_from(detected_at).map_err(|_| anyhow!("timestamp exceeds i64 range"))?;
        let digest = crop_digest(violation.crop_jpeg);
        let owner = violation.owner;

        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO violations(
              license_plate, owner_name, owner_phone, owner_email, owner_address,
              violation_type, violation_address, fine, confidence,
              crop_jpeg, crop_sha256, timestamp, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                owner.license_plate_number,
                owner.full_name,
                owner.phone_number,
                owner.email,
                owner.address,
                violation.violation_type.as_str(),
                violation.violation_address,
                i64::from(violation.fine),
                f64::from(violation.confidence),
                violation.crop_jpeg,
                digest,
                created_at,
                STATUS_PENDING,
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }

        Ok(Some(PersistedRecord {
            id: conn.last_insert_rowid(),
            license_plate: owner.license_plate_number.clone(),
            owner_name: owner.full_name.clone(),
            owner_phone: owner.phone_number.clone(),
            owner_email: owner.email.clone(),
            owner_address: owner.address.clone(),
            violation_type: violation.violation_type,
            violation_address: violation.violation_address.to_string(),
            fine: violation.fine,
            confidence: violation.confidence,
            crop_sha256: digest,
            detected_at,
            status: STATUS_PENDING.to_string(),
        }))
    }

    fn recent(&self, limit: usize) -> Result<Vec<PersistedRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM violations ORDER BY id DESC LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(record_from_row(row)?);
        }
        Ok(out)
    }
}

#[derive(Clone, Debug)]
struct InMemoryViolationEntry {
    record: PersistedRecord,
    crop_jpeg: Vec<u8>,
}

/// Store backed by a vector; same dedup rule as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryViolationStore {
    entries: Mutex<Vec<InMemoryViolationEntry>>,
}

impl InMemoryViolationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn crop_jpeg(&self, id: i64) -> Option<Vec<u8>> {
        let entries = self.entries.lock().ok()?;
        entries
            .iter()
            .find(|e| e.record.id == id)
            .map(|e| e.crop_jpeg.clone())
    }
}

impl ViolationStore for InMemoryViolationStore {
    fn insert(&self, violation: &NewViolation<'_>) -> Result<Option<PersistedRecord>> {
        let detected_at = epoch_s(violation.detected_at)?;
        let digest = crop_digest(violation.crop_jpeg);
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("violation store lock poisoned"))?;

        let duplicate = entries.iter().any(|e| {
            e.record.crop_sha256 == digest && e.record.violation_type == violation.violation_type
        });
        if duplicate {
            return Ok(None);
        }

        let owner = violation.owner;
        let record = PersistedRecord {
            id: entries.len() as i64 + 1,
            license_plate: owner.license_plate_number.clone(),
            owner_name: owner.full_name.clone(),
            owner_phone: owner.phone_number.clone(),
            owner_email: owner.email.clone(),
            owner_address: owner.address.clone(),
            violation_type: violation.violation_type,
            violation_address: violation.violation_address.to_string(),
            fine: violation.fine,
            confidence: violation.confidence,
            crop_sha256: digest,
            detected_at,
            status: STATUS_PENDING.to_string(),
        };
        entries.push(InMemoryViolationEntry {
            record: record.clone(),
            crop_jpeg: violation.crop_jpeg.to_vec(),
        });
        Ok(Some(record))
    }

    fn recent(&self, limit: usize) -> Result<Vec<PersistedRecord>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("violation store lock poisoned"))?;
        Ok(entries
            .iter()
            .rev()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }
}
