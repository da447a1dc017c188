//! SQLite-backed roster and attendance ledger.
//!
//! One connection per `SqliteLedger`, held for the value's lifetime and
//! closed on drop. Timestamps are stored as Unix milliseconds so range
//! queries compare integers.

use chrono::{DateTime, TimeZone, Utc};
use presence_core::{AttendanceRecord, CorpusEntry, Identity, Ledger, LedgerError, RecordId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;

/// Status written for every recognised sighting.
pub const STATUS_PRESENT: &str = "present";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS students (
    student_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    metadata   TEXT
);
CREATE TABLE IF NOT EXISTS attendance (
    attendance_id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id    INTEGER NOT NULL REFERENCES students(student_id) ON DELETE CASCADE,
    timestamp_ms  INTEGER NOT NULL,
    status        TEXT NOT NULL DEFAULT 'present'
);
CREATE INDEX IF NOT EXISTS idx_attendance_student_time
    ON attendance(student_id, timestamp_ms);
CREATE TABLE IF NOT EXISTS student_images (
    image_id   INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id INTEGER NOT NULL REFERENCES students(student_id) ON DELETE CASCADE,
    image_url  TEXT NOT NULL,
    UNIQUE(student_id, image_url)
);
";

/// An enrolled person.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub metadata: Option<String>,
}

/// An enrollment image registered for a student.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentImage {
    pub id: i64,
    pub student_id: i64,
    pub image_url: String,
}

/// Attendance query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AttendanceFilter {
    pub student_id: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Counters from [`SqliteLedger::enroll_entries`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollReport {
    pub students_created: usize,
    pub images_added: usize,
}

pub struct SqliteLedger {
    conn: Connection,
}

fn storage(e: rusqlite::Error) -> LedgerError {
    LedgerError::Storage(e.to_string())
}

/// Lower bounds round up so a sub-millisecond `from` never admits the
/// stored millisecond just before it.
fn ceil_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis() + i64::from(at.timestamp_subsec_nanos() % 1_000_000 != 0)
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| LedgerError::Storage(format!("timestamp out of range: {ms}")))
}

impl SqliteLedger {
    /// Open or create the database file with full schema.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| LedgerError::Storage(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(storage)?;
        let ledger = Self { conn };
        ledger.apply_pragmas()?;
        ledger.init_schema()?;
        tracing::debug!(path = %path.display(), "opened attendance ledger");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(storage)?;
        let ledger = Self { conn };
        ledger.apply_pragmas()?;
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn apply_pragmas(&self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
            .map_err(storage)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(SCHEMA_SQL).map_err(storage)
    }

    fn student_id_for(&self, identity: &Identity) -> Result<i64, LedgerError> {
        self.conn
            .query_row(
                "SELECT student_id FROM students WHERE name = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage)?
            .ok_or_else(|| LedgerError::UnknownIdentity(identity.clone()))
    }

    // ── Students ────────────────────────────────────────────────────────

    pub fn create_student(&self, name: &str, metadata: Option<&str>) -> Result<i64, LedgerError> {
        self.conn
            .execute(
                "INSERT INTO students (name, metadata) VALUES (?1, ?2)",
                params![name, metadata],
            )
            .map_err(storage)?;
        let id = self.conn.last_insert_rowid();
        tracing::info!(student = id, name, "student created");
        Ok(id)
    }

    pub fn student(&self, id: i64) -> Result<Option<Student>, LedgerError> {
        self.conn
            .query_row(
                "SELECT student_id, name, metadata FROM students WHERE student_id = ?1",
                params![id],
                |row| {
                    Ok(Student {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        metadata: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(storage)
    }

    pub fn student_by_name(&self, name: &str) -> Result<Option<Student>, LedgerError> {
        self.conn
            .query_row(
                "SELECT student_id, name, metadata FROM students WHERE name = ?1",
                params![name],
                |row| {
                    Ok(Student {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        metadata: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(storage)
    }

    pub fn list_students(&self) -> Result<Vec<Student>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT student_id, name, metadata FROM students ORDER BY name")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Student {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    metadata: row.get(2)?,
                })
            })
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Update the provided fields. Returns false when nothing changed.
    pub fn update_student(
        &self,
        id: i64,
        name: Option<&str>,
        metadata: Option<&str>,
    ) -> Result<bool, LedgerError> {
        if name.is_none() && metadata.is_none() {
            return Ok(false);
        }
        let changed = self
            .conn
            .execute(
                "UPDATE students
                 SET name = COALESCE(?1, name), metadata = COALESCE(?2, metadata)
                 WHERE student_id = ?3",
                params![name, metadata, id],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    /// Delete a student along with their attendance and image rows.
    pub fn delete_student(&self, id: i64) -> Result<bool, LedgerError> {
        let changed = self
            .conn
            .execute("DELETE FROM students WHERE student_id = ?1", params![id])
            .map_err(storage)?;
        if changed > 0 {
            tracing::info!(student = id, "student deleted");
        }
        Ok(changed > 0)
    }

    // ── Images ──────────────────────────────────────────────────────────

    /// Register an image for a student. Returns false if it was already known.
    pub fn add_student_image(&self, student_id: i64, image_url: &str) -> Result<bool, LedgerError> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO student_images (student_id, image_url) VALUES (?1, ?2)",
                params![student_id, image_url],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    pub fn student_images(&self, student_id: i64) -> Result<Vec<StudentImage>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT image_id, student_id, image_url FROM student_images
                 WHERE student_id = ?1 ORDER BY image_id",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![student_id], |row| {
                Ok(StudentImage {
                    id: row.get(0)?,
                    student_id: row.get(1)?,
                    image_url: row.get(2)?,
                })
            })
            .map_err(storage)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage)
    }

    /// Create missing students and register every corpus image, in one
    /// transaction. Safe to run repeatedly.
    pub fn enroll_entries(&mut self, entries: &[CorpusEntry]) -> Result<EnrollReport, LedgerError> {
        let tx = self.conn.transaction().map_err(storage)?;
        let mut report = EnrollReport::default();
        let mut seen = BTreeSet::new();

        for entry in entries {
            let name = entry.identity.as_str();
            if seen.insert(name) {
                let created = tx
                    .execute(
                        "INSERT OR IGNORE INTO students (name) VALUES (?1)",
                        params![name],
                    )
                    .map_err(storage)?;
                report.students_created += created;
            }
            let added = tx
                .execute(
                    "INSERT OR IGNORE INTO student_images (student_id, image_url)
                     SELECT student_id, ?2 FROM students WHERE name = ?1",
                    params![name, entry.source],
                )
                .map_err(storage)?;
            report.images_added += added;
        }

        tx.commit().map_err(storage)?;
        tracing::info!(
            students_created = report.students_created,
            images_added = report.images_added,
            "enrolled corpus into roster"
        );
        Ok(report)
    }

    // ── Attendance ──────────────────────────────────────────────────────

    pub fn attendance_records(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.attendance_id, s.name, a.timestamp_ms, a.status
                 FROM attendance a JOIN students s ON s.student_id = a.student_id
                 WHERE (?1 IS NULL OR a.student_id = ?1)
                   AND (?2 IS NULL OR a.timestamp_ms >= ?2)
                   AND (?3 IS NULL OR a.timestamp_ms <= ?3)
                 ORDER BY a.timestamp_ms, a.attendance_id",
            )
            .map_err(storage)?;

        let rows = stmt
            .query_map(
                params![
                    filter.student_id,
                    filter.from.map(ceil_millis),
                    filter.to.map(|t| t.timestamp_millis()),
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .map_err(storage)?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, ms, status) = row.map_err(storage)?;
            records.push(AttendanceRecord {
                id,
                identity: Identity::new(name),
                timestamp: from_millis(ms)?,
                status,
            });
        }
        Ok(records)
    }

    pub fn update_attendance_status(&self, id: RecordId, status: &str) -> Result<bool, LedgerError> {
        let changed = self
            .conn
            .execute(
                "UPDATE attendance SET status = ?1 WHERE attendance_id = ?2",
                params![status, id],
            )
            .map_err(storage)?;
        Ok(changed > 0)
    }

    pub fn delete_attendance_record(&self, id: RecordId) -> Result<bool, LedgerError> {
        let changed = self
            .conn
            .execute("DELETE FROM attendance WHERE attendance_id = ?1", params![id])
            .map_err(storage)?;
        Ok(changed > 0)
    }
}

impl Ledger for SqliteLedger {
    fn query_range(
        &self,
        identity: &Identity,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, LedgerError> {
        let student_id = self.student_id_for(identity)?;
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT timestamp_ms FROM attendance
                 WHERE student_id = ?1 AND timestamp_ms BETWEEN ?2 AND ?3
                 ORDER BY timestamp_ms",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(
                params![student_id, ceil_millis(from), to.timestamp_millis()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage)?;

        let mut stamps = Vec::new();
        for ms in rows {
            stamps.push(from_millis(ms.map_err(storage)?)?);
        }
        Ok(stamps)
    }

    fn insert(&self, identity: &Identity, at: DateTime<Utc>) -> Result<RecordId, LedgerError> {
        let student_id = self.student_id_for(identity)?;
        self.conn
            .execute(
                "INSERT INTO attendance (student_id, timestamp_ms, status) VALUES (?1, ?2, ?3)",
                params![student_id, at.timestamp_millis(), STATUS_PRESENT],
            )
            .map_err(storage)?;
        Ok(self.conn.last_insert_rowid())
    }
}
