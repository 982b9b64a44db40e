use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::app_dirs::AppDirs;
use crate::attempts::{Achievement, AchievementSource, AttemptRecorder, AttemptUpdate, NewAttempt};
use crate::error::{ServiceError, ServiceResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_id TEXT NOT NULL,
    exercise_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    total_attempts INTEGER NOT NULL DEFAULT 0,
    total_correct INTEGER NOT NULL DEFAULT 0,
    score INTEGER,
    display_speed REAL NOT NULL,
    settings TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_attempts_student ON attempts(student_id);
"#;

/// A stored attempt row
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRow {
    pub id: i64,
    pub student_id: String,
    pub exercise_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_attempts: u32,
    pub total_correct: u32,
    pub score: Option<u32>,
}

/// Local attempt store backed by SQLite
#[derive(Debug)]
pub struct StatsDb {
    conn: Mutex<Connection>,
}

impl StatsDb {
    /// Open the database at the default state path, creating it if needed
    pub fn new() -> ServiceResult<Self> {
        let path = AppDirs::db_path().unwrap_or_else(|| "anzan_stats.db".into());
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> ServiceResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Unavailable(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> ServiceResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> ServiceResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(StatsDb {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> ServiceResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ServiceError::Unavailable("stats database lock poisoned".into()))
    }

    pub fn attempt(&self, id: i64) -> ServiceResult<Option<AttemptRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT id, student_id, exercise_id, started_at, completed_at,
                       total_attempts, total_correct, score
                FROM attempts WHERE id = ?1
                "#,
                [id],
                read_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent attempts first
    pub fn recent_attempts(&self, student_id: &str, limit: usize) -> ServiceResult<Vec<AttemptRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, student_id, exercise_id, started_at, completed_at,
                   total_attempts, total_correct, score
            FROM attempts
            WHERE student_id = ?1
            ORDER BY started_at DESC, id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![student_id, limit as i64], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_time(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| {
            rusqlite::Error::InvalidColumnType(idx, "timestamp".to_string(), rusqlite::types::Type::Text)
        })
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttemptRow> {
    let completed_at: Option<String> = row.get(4)?;
    Ok(AttemptRow {
        id: row.get(0)?,
        student_id: row.get(1)?,
        exercise_id: row.get(2)?,
        started_at: parse_time(3, row.get(3)?)?,
        completed_at: completed_at.map(|t| parse_time(4, t)).transpose()?,
        total_attempts: row.get(5)?,
        total_correct: row.get(6)?,
        score: row.get(7)?,
    })
}

fn parse_id(attempt_id: &str) -> ServiceResult<i64> {
    attempt_id
        .parse()
        .map_err(|_| ServiceError::Unavailable(format!("unknown attempt id {}", attempt_id)))
}

impl AttemptRecorder for StatsDb {
    fn create(&self, attempt: &NewAttempt) -> ServiceResult<String> {
        let settings = serde_json::to_string(&attempt.settings)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO attempts (student_id, exercise_id, started_at, display_speed, settings)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                attempt.student_id,
                attempt.exercise_id,
                attempt.started_at.to_rfc3339(),
                attempt.settings.display_speed,
                settings,
            ],
        )?;
        Ok(conn.last_insert_rowid().to_string())
    }

    fn update(&self, attempt_id: &str, update: &AttemptUpdate) -> ServiceResult<()> {
        let id = parse_id(attempt_id)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE attempts SET
                total_attempts = COALESCE(?2, total_attempts),
                total_correct = COALESCE(?3, total_correct),
                completed_at = COALESCE(?4, completed_at),
                score = COALESCE(?5, score)
            WHERE id = ?1 AND (completed_at IS NULL OR ?4 IS NOT NULL)
            "#,
            params![
                id,
                update.total_attempts,
                update.total_correct,
                update.completed_at.map(|t| t.to_rfc3339()),
                update.score,
            ],
        )?;
        if changed == 0 {
            let exists: bool =
                conn.query_row("SELECT COUNT(*) > 0 FROM attempts WHERE id = ?1", [id], |row| row.get(0))?;
            if !exists {
                return Err(ServiceError::Unavailable(format!(
                    "attempt {} does not exist",
                    attempt_id
                )));
            }
            // a running-total update that lost the race with the final one
            tracing::debug!("ignoring late update for completed attempt {}", attempt_id);
        }
        Ok(())
    }
}

struct Rule {
    id: &'static str,
    title: &'static str,
    description: &'static str,
    query: &'static str,
}

// Each query returns 1 when the student holds the achievement
const RULES: [Rule; 5] = [
    Rule {
        id: "first_session",
        title: "First Steps",
        description: "Finish your first session",
        query: "SELECT COUNT(*) >= 1 FROM attempts WHERE student_id = ?1 AND completed_at IS NOT NULL",
    },
    Rule {
        id: "ten_correct",
        title: "Sharp Mind",
        description: "Answer 10 rounds correctly",
        query: "SELECT COALESCE(SUM(total_correct), 0) >= 10 FROM attempts WHERE student_id = ?1 AND completed_at IS NOT NULL",
    },
    Rule {
        id: "century",
        title: "Century",
        description: "Answer 100 rounds",
        query: "SELECT COALESCE(SUM(total_attempts), 0) >= 100 FROM attempts WHERE student_id = ?1 AND completed_at IS NOT NULL",
    },
    Rule {
        id: "flawless",
        title: "Flawless",
        description: "Finish a session of at least 5 rounds without a mistake",
        query: "SELECT COUNT(*) >= 1 FROM attempts WHERE student_id = ?1 AND completed_at IS NOT NULL AND total_attempts >= 5 AND total_correct = total_attempts",
    },
    Rule {
        id: "lightning",
        title: "Lightning",
        description: "Finish a flawless session at half a second per card or faster",
        query: "SELECT COUNT(*) >= 1 FROM attempts WHERE student_id = ?1 AND completed_at IS NOT NULL AND total_attempts >= 5 AND total_correct = total_attempts AND display_speed <= 0.5",
    },
];

impl AchievementSource for StatsDb {
    fn achievements(&self, student_id: &str) -> ServiceResult<Vec<Achievement>> {
        let conn = self.conn()?;
        let mut held = Vec::new();
        for rule in RULES.iter() {
            let earned: bool = conn.query_row(rule.query, [student_id], |row| row.get(0))?;
            if earned {
                held.push(Achievement {
                    id: rule.id.to_string(),
                    title: rule.title.to_string(),
                    description: rule.description.to_string(),
                });
            }
        }
        Ok(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::AttemptSettings;
    use crate::session::SessionConfig;

    fn new_attempt(student: &str, speed: f64) -> NewAttempt {
        let cfg = SessionConfig {
            display_speed: speed,
            ..SessionConfig::new("addition", "Addition")
        };
        NewAttempt {
            student_id: student.into(),
            exercise_id: "ex-1".into(),
            started_at: Utc::now(),
            settings: AttemptSettings::from(&cfg),
        }
    }

    fn ids(list: &[Achievement]) -> Vec<&str> {
        list.iter().map(|a| a.id.as_str()).collect()
    }

    #[test]
    fn create_and_read_back() {
        let db = StatsDb::open_in_memory().unwrap();
        let id = db.create(&new_attempt("s1", 1.0)).unwrap();
        let row = db.attempt(id.parse().unwrap()).unwrap().unwrap();
        assert_eq!(row.student_id, "s1");
        assert_eq!(row.total_attempts, 0);
        assert_eq!(row.completed_at, None);
    }

    #[test]
    fn partial_update_keeps_other_columns() {
        let db = StatsDb::open_in_memory().unwrap();
        let id = db.create(&new_attempt("s1", 1.0)).unwrap();
        db.update(&id, &AttemptUpdate::totals(3, 2)).unwrap();
        db.update(
            &id,
            &AttemptUpdate {
                score: Some(67),
                ..AttemptUpdate::default()
            },
        )
        .unwrap();

        let row = db.attempt(id.parse().unwrap()).unwrap().unwrap();
        assert_eq!(row.total_attempts, 3);
        assert_eq!(row.total_correct, 2);
        assert_eq!(row.score, Some(67));
    }

    #[test]
    fn updating_unknown_attempt_fails() {
        let db = StatsDb::open_in_memory().unwrap();
        assert!(db.update("42", &AttemptUpdate::totals(1, 1)).is_err());
        assert!(db.update("not-a-number", &AttemptUpdate::totals(1, 1)).is_err());
    }

    #[test]
    fn late_totals_do_not_reopen_completed_attempt() {
        let db = StatsDb::open_in_memory().unwrap();
        let id = db.create(&new_attempt("s1", 1.0)).unwrap();
        db.update(&id, &AttemptUpdate::completion(4, 3, Utc::now()))
            .unwrap();
        db.update(&id, &AttemptUpdate::totals(3, 2)).unwrap();

        let row = db.attempt(id.parse().unwrap()).unwrap().unwrap();
        assert_eq!(row.total_attempts, 4);
        assert_eq!(row.total_correct, 3);
        assert_eq!(row.score, Some(75));
    }

    #[test]
    fn open_attempts_earn_nothing() {
        let db = StatsDb::open_in_memory().unwrap();
        let id = db.create(&new_attempt("s1", 1.0)).unwrap();
        db.update(&id, &AttemptUpdate::totals(20, 20)).unwrap();
        assert!(db.achievements("s1").unwrap().is_empty());
    }

    #[test]
    fn completed_attempts_unlock_achievements() {
        let db = StatsDb::open_in_memory().unwrap();
        let id = db.create(&new_attempt("s1", 1.0)).unwrap();
        db.update(&id, &AttemptUpdate::completion(5, 5, Utc::now()))
            .unwrap();
        assert_eq!(ids(&db.achievements("s1").unwrap()), vec!["first_session", "flawless"]);

        let fast = db.create(&new_attempt("s1", 0.5)).unwrap();
        db.update(&fast, &AttemptUpdate::completion(6, 6, Utc::now()))
            .unwrap();
        assert_eq!(
            ids(&db.achievements("s1").unwrap()),
            vec!["first_session", "ten_correct", "flawless", "lightning"]
        );

        // other students are unaffected
        assert!(db.achievements("s2").unwrap().is_empty());
    }

    #[test]
    fn recent_attempts_newest_first() {
        let db = StatsDb::open_in_memory().unwrap();
        let first = db.create(&new_attempt("s1", 1.0)).unwrap();
        let second = db.create(&new_attempt("s1", 1.0)).unwrap();
        db.create(&new_attempt("s2", 1.0)).unwrap();

        let rows = db.recent_attempts("s1", 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id.to_string(), second);
        assert_eq!(rows[1].id.to_string(), first);
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("stats.db");
        let db = StatsDb::open(&path).unwrap();
        db.create(&new_attempt("s1", 1.0)).unwrap();
        assert!(path.exists());
    }
}
