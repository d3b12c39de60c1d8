//! Durable fabric store: a single `rusqlite` connection in WAL mode,
//! guarded by an async `Mutex` so every operation serializes on the store's
//! transaction boundary while readers still see a point-in-time consistent
//! view.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::errors::FabricError;
use crate::fabric::types::{
    Discovery, DiscoveryKind, Entanglement, EntanglementKind, EntanglementStatus, FileClaim,
    PhaseState, Pulse, PulseKind,
};

pub struct Fabric {
    conn: Mutex<Connection>,
}

impl Fabric {
    pub fn open_in_memory() -> Result<Self, FabricError> {
        let conn = Connection::open_in_memory().map_err(|e| FabricError::Store(e.into()))?;
        Self::from_connection(conn)
    }

    pub fn open(path: &std::path::Path) -> Result<Self, FabricError> {
        let conn = Connection::open(path).map_err(|e| FabricError::Store(e.into()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| FabricError::Store(e.into()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, FabricError> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| FabricError::Store(e.into()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub async fn set_phase_state(&self, task: &str, state: PhaseState) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO phase_states (task, state) VALUES (?1, ?2)
             ON CONFLICT(task) DO UPDATE SET state = excluded.state",
            params![task, state.as_str()],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(())
    }

    pub async fn all_phase_states(&self) -> Result<Vec<(String, PhaseState)>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT task, state FROM phase_states ORDER BY task")
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], |row| {
                let task: String = row.get(0)?;
                let state: String = row.get(1)?;
                Ok((task, state))
            })
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            let (task, state) = row.map_err(|e| FabricError::Store(e.into()))?;
            if let Some(state) = PhaseState::from_str(&state) {
                out.push((task, state));
            }
        }
        Ok(out)
    }

    /// Publishes an entanglement, upserting on `(producer, name, kind)`.
    /// The status transition is checked against the existing row (if any)
    /// inside the same lock: a regression (`fulfilled -> pending`, or out of
    /// `disputed`) keeps the existing status instead of overwriting it, per
    /// the monotonic-transition invariant.
    pub async fn publish_entanglement(&self, e: &Entanglement) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT status FROM entanglements WHERE producer = ?1 AND name = ?2 AND kind = ?3",
                params![e.producer, e.name, kind_str(e.kind)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FabricError::Store(e.into()))?;

        let status = match existing.as_deref().and_then(status_from_str) {
            Some(current) if !current.can_transition_to(e.status) => current,
            _ => e.status,
        };

        conn.execute(
            "INSERT INTO entanglements (producer, consumer, kind, name, signature, package, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(producer, name, kind) DO UPDATE SET
                consumer = excluded.consumer,
                signature = excluded.signature,
                package = excluded.package,
                status = excluded.status",
            params![
                e.producer,
                e.consumer,
                kind_str(e.kind),
                e.name,
                e.signature,
                e.package,
                status_str(status),
            ],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(())
    }

    /// Fails with `ClaimHeld` if `path` is already claimed by a different
    /// owner. Idempotent when the owner matches.
    pub async fn claim_file(&self, path: &str, owner: &str) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        let existing: Option<String> = conn
            .query_row(
                "SELECT owner_task FROM file_claims WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| FabricError::Store(e.into()))?;
        match existing {
            Some(ref other) if other == owner => Ok(()),
            Some(other) => Err(FabricError::ClaimHeld {
                path: path.to_string(),
                other_owner: other,
            }),
            None => {
                conn.execute(
                    "INSERT INTO file_claims (path, owner_task, claimed_at) VALUES (?1, ?2, ?3)",
                    params![path, owner, Utc::now().to_rfc3339()],
                )
                .map_err(|e| FabricError::Store(e.into()))?;
                Ok(())
            }
        }
    }

    pub async fn release_claims(&self, owner: &str) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM file_claims WHERE owner_task = ?1",
            params![owner],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(())
    }

    pub async fn all_claims(&self) -> Result<Vec<FileClaim>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT path, owner_task, claimed_at FROM file_claims ORDER BY path")
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], |row| {
                let path: String = row.get(0)?;
                let owner_task: String = row.get(1)?;
                let claimed_at: String = row.get(2)?;
                Ok((path, owner_task, claimed_at))
            })
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            let (path, owner_task, claimed_at) = row.map_err(|e| FabricError::Store(e.into()))?;
            let claimed_at = chrono::DateTime::parse_from_rfc3339(&claimed_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            out.push(FileClaim {
                path,
                owner_task,
                claimed_at,
            });
        }
        Ok(out)
    }

    pub async fn post_discovery(
        &self,
        source_task: &str,
        kind: DiscoveryKind,
        detail: &str,
    ) -> Result<i64, FabricError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO discoveries (source_task, kind, detail, resolved, created_at)
             VALUES (?1, ?2, ?3, 0, ?4)",
            params![
                source_task,
                discovery_kind_str(kind),
                detail,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn resolve_discovery(&self, id: i64) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE discoveries SET resolved = 1 WHERE id = ?1",
            params![id],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(())
    }

    pub async fn unresolved_discoveries(&self) -> Result<Vec<Discovery>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, source_task, kind, detail, resolved, created_at
                 FROM discoveries WHERE resolved = 0 ORDER BY id",
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], row_to_discovery)
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| FabricError::Store(e.into()))?);
        }
        Ok(out)
    }

    /// Every discovery regardless of resolution, used by the neutron
    /// archive to carry resolved discoveries into the archive file before
    /// the fabric is purged.
    pub async fn all_discoveries(&self) -> Result<Vec<Discovery>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, source_task, kind, detail, resolved, created_at
                 FROM discoveries ORDER BY id",
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], row_to_discovery)
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| FabricError::Store(e.into()))?);
        }
        Ok(out)
    }

    pub async fn emit_pulse(
        &self,
        task_id: &str,
        kind: PulseKind,
        content: &str,
    ) -> Result<i64, FabricError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO pulses (task_id, content, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, content, pulse_kind_str(kind), Utc::now().to_rfc3339()],
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn all_pulses(&self) -> Result<Vec<Pulse>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, task_id, content, kind, created_at FROM pulses ORDER BY id")
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], row_to_pulse)
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| FabricError::Store(e.into()))?);
        }
        Ok(out)
    }

    pub async fn all_entanglements(&self) -> Result<Vec<Entanglement>, FabricError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, producer, consumer, kind, name, signature, package, status
                 FROM entanglements ORDER BY id",
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        let rows = stmt
            .query_map([], row_to_entanglement)
            .map_err(|e| FabricError::Store(e.into()))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| FabricError::Store(e.into()))?);
        }
        Ok(out)
    }

    /// Removes every row, atomically. Used by the neutron archive after a
    /// successful copy.
    pub async fn purge_all(&self) -> Result<(), FabricError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "BEGIN;
             DELETE FROM phase_states;
             DELETE FROM entanglements;
             DELETE FROM file_claims;
             DELETE FROM discoveries;
             DELETE FROM pulses;
             COMMIT;",
        )
        .map_err(|e| FabricError::Store(e.into()))?;
        Ok(())
    }
}

fn kind_str(kind: EntanglementKind) -> &'static str {
    match kind {
        EntanglementKind::Type => "type",
        EntanglementKind::Function => "function",
        EntanglementKind::Interface => "interface",
    }
}

fn status_str(status: EntanglementStatus) -> &'static str {
    match status {
        EntanglementStatus::Pending => "pending",
        EntanglementStatus::Fulfilled => "fulfilled",
        EntanglementStatus::Disputed => "disputed",
    }
}

fn status_from_str(s: &str) -> Option<EntanglementStatus> {
    Some(match s {
        "pending" => EntanglementStatus::Pending,
        "fulfilled" => EntanglementStatus::Fulfilled,
        "disputed" => EntanglementStatus::Disputed,
        _ => return None,
    })
}

fn discovery_kind_str(kind: DiscoveryKind) -> &'static str {
    match kind {
        DiscoveryKind::FileConflict => "file_conflict",
        DiscoveryKind::RequirementsAmbiguity => "requirements_ambiguity",
        DiscoveryKind::BudgetAlert => "budget_alert",
        DiscoveryKind::Other => "other",
    }
}

fn pulse_kind_str(kind: PulseKind) -> &'static str {
    match kind {
        PulseKind::Note => "note",
        PulseKind::ReviewerFeedback => "reviewer_feedback",
    }
}

fn row_to_discovery(row: &rusqlite::Row) -> rusqlite::Result<Discovery> {
    let kind: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(Discovery {
        id: row.get(0)?,
        source_task: row.get(1)?,
        kind: match kind.as_str() {
            "file_conflict" => DiscoveryKind::FileConflict,
            "requirements_ambiguity" => DiscoveryKind::RequirementsAmbiguity,
            "budget_alert" => DiscoveryKind::BudgetAlert,
            _ => DiscoveryKind::Other,
        },
        detail: row.get(3)?,
        resolved: row.get::<_, i64>(4)? != 0,
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_pulse(row: &rusqlite::Row) -> rusqlite::Result<Pulse> {
    let kind: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(Pulse {
        id: row.get(0)?,
        task_id: row.get(1)?,
        content: row.get(2)?,
        kind: match kind.as_str() {
            "reviewer_feedback" => PulseKind::ReviewerFeedback,
            _ => PulseKind::Note,
        },
        created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn row_to_entanglement(row: &rusqlite::Row) -> rusqlite::Result<Entanglement> {
    let kind: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(Entanglement {
        id: row.get(0)?,
        producer: row.get(1)?,
        consumer: row.get(2)?,
        kind: match kind.as_str() {
            "type" => EntanglementKind::Type,
            "function" => EntanglementKind::Function,
            _ => EntanglementKind::Interface,
        },
        name: row.get(4)?,
        signature: row.get(5)?,
        package: row.get(6)?,
        status: match status.as_str() {
            "fulfilled" => EntanglementStatus::Fulfilled,
            "disputed" => EntanglementStatus::Disputed,
            _ => EntanglementStatus::Pending,
        },
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS phase_states (
    task TEXT PRIMARY KEY,
    state TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS entanglements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    producer TEXT NOT NULL,
    consumer TEXT,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    signature TEXT NOT NULL,
    package TEXT NOT NULL,
    status TEXT NOT NULL,
    UNIQUE(producer, name, kind)
);
CREATE TABLE IF NOT EXISTS file_claims (
    path TEXT PRIMARY KEY,
    owner_task TEXT NOT NULL,
    claimed_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS discoveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_task TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    resolved INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pulses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    content TEXT NOT NULL,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";
