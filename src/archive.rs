//! Neutron archive and reaper: closing out an epoch's fabric into a
//! standalone archive file, and periodic cleanup of claims left behind by
//! phases that never released them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use crate::errors::FabricError;
use crate::fabric::{Fabric, PhaseState};

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// When true, archives even with unresolved discoveries remaining.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct Neutron {
    pub epoch_id: String,
    pub created_at: DateTime<Utc>,
    pub db_path: std::path::PathBuf,
}

/// Closes out `fabric` into a new archive file at `out_path`.
/// Fails without mutating the fabric if any claim is held, or if unresolved
/// discoveries remain and `opts.force` is false.
pub async fn archive(
    fabric: &Fabric,
    epoch_id: &str,
    out_path: &std::path::Path,
    opts: &ArchiveOptions,
) -> Result<Neutron, FabricError> {
    let claims = fabric.all_claims().await?;
    if !claims.is_empty() {
        return Err(FabricError::ActiveClaims(claims.len()));
    }

    let unresolved = fabric.unresolved_discoveries().await?;
    if !unresolved.is_empty() && !opts.force {
        return Err(FabricError::UnresolvedDiscoveries);
    }

    let phase_states = fabric.all_phase_states().await?;
    let entanglements = fabric.all_entanglements().await?;
    let all_discoveries = fabric.all_discoveries().await?;
    let pulses = fabric.all_pulses().await?;

    let created_at = Utc::now();
    let conn = Connection::open(out_path).map_err(|e| FabricError::Store(e.into()))?;
    conn.execute_batch(ARCHIVE_SCHEMA)
        .map_err(|e| FabricError::Store(e.into()))?;

    conn.execute_batch("BEGIN;")
        .map_err(|e| FabricError::Store(e.into()))?;
    let result: Result<(), FabricError> = (|| {
        conn.execute(
            "INSERT INTO metadata (epoch_id, created_at, total_cost, wall_clock, task_count, cycle_count)
             VALUES (?1, ?2, 0.0, 0, ?3, 0)",
            params![epoch_id, created_at.to_rfc3339(), phase_states.len() as i64],
        )
        .map_err(|e| FabricError::Store(e.into()))?;

        for (task_id, state) in &phase_states {
            conn.execute(
                "INSERT INTO tasks (task_id, final_state, cycles_used, cost_usd) VALUES (?1, ?2, 0, 0.0)",
                params![task_id, state.as_str()],
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        }

        for e in &entanglements {
            let interface = format!("{:?}:{}:{}", e.kind, e.name, e.signature);
            conn.execute(
                "INSERT INTO entanglements (id, producer, consumer, interface, status) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    e.id,
                    e.producer,
                    e.consumer,
                    interface,
                    format!("{:?}", e.status)
                ],
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        }

        for d in &all_discoveries {
            conn.execute(
                "INSERT INTO discoveries (id, source_task, kind, detail, resolved, created) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    d.id,
                    d.source_task,
                    format!("{:?}", d.kind),
                    d.detail,
                    d.resolved,
                    d.created_at.to_rfc3339()
                ],
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        }

        for p in &pulses {
            conn.execute(
                "INSERT INTO pulses (id, task_id, content, kind, created) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![p.id, p.task_id, p.content, format!("{:?}", p.kind), p.created_at.to_rfc3339()],
            )
            .map_err(|e| FabricError::Store(e.into()))?;
        }

        Ok(())
    })();

    match result {
        Ok(()) => conn.execute_batch("COMMIT;").map_err(|e| FabricError::Store(e.into()))?,
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK;");
            return Err(e);
        }
    }
    drop(conn);

    fabric.purge_all().await?;

    Ok(Neutron {
        epoch_id: epoch_id.to_string(),
        created_at,
        db_path: out_path.to_path_buf(),
    })
}

const ARCHIVE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metadata (
    epoch_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    total_cost REAL NOT NULL,
    wall_clock INTEGER NOT NULL,
    task_count INTEGER NOT NULL,
    cycle_count INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    final_state TEXT NOT NULL,
    cycles_used INTEGER NOT NULL,
    cost_usd REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS entanglements (
    id INTEGER PRIMARY KEY,
    producer TEXT NOT NULL,
    consumer TEXT,
    interface TEXT NOT NULL,
    status TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS discoveries (
    id INTEGER PRIMARY KEY,
    source_task TEXT NOT NULL,
    kind TEXT NOT NULL,
    detail TEXT NOT NULL,
    resolved INTEGER NOT NULL,
    created TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pulses (
    id INTEGER PRIMARY KEY,
    task_id TEXT NOT NULL,
    content TEXT NOT NULL,
    kind TEXT NOT NULL,
    created TEXT NOT NULL
);
";

/// An action the reaper could not take automatically: an epoch whose
/// leftover claims/discoveries are old enough to need a human look, without
/// the reaper ever auto-purging it.
#[derive(Debug, Clone)]
pub struct FlaggedEpoch {
    pub reason: String,
    pub stale_claim_owners: Vec<String>,
    pub unresolved_discovery_count: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReaperReport {
    pub released_owners: Vec<String>,
    pub flagged: Option<FlaggedEpoch>,
}

/// Releases claims stale by `stale_claim` (deduplicated per owner, and only
/// for owners not currently `RUNNING`), then flags (never purges) an epoch
/// whose leftover claims or discoveries are stale by `stale_epoch`.
pub async fn reap(
    fabric: &Fabric,
    stale_claim: chrono::Duration,
    stale_epoch: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<ReaperReport, FabricError> {
    let claims = fabric.all_claims().await?;
    let phase_states = fabric.all_phase_states().await?;
    let running: std::collections::HashSet<&str> = phase_states
        .iter()
        .filter(|(_, state)| *state == PhaseState::Running)
        .map(|(id, _)| id.as_str())
        .collect();

    let mut released_owners = Vec::new();
    for claim in &claims {
        let age = now.signed_duration_since(claim.claimed_at);
        if age >= stale_claim
            && !running.contains(claim.owner_task.as_str())
            && !released_owners.contains(&claim.owner_task)
        {
            fabric.release_claims(&claim.owner_task).await?;
            released_owners.push(claim.owner_task.clone());
        }
    }

    let remaining_claims = fabric.all_claims().await?;
    let unresolved = fabric.unresolved_discoveries().await?;

    let all_terminal = phase_states
        .iter()
        .all(|(_, state)| matches!(state, PhaseState::Done | PhaseState::Failed));

    let flagged = if all_terminal && (!remaining_claims.is_empty() || !unresolved.is_empty()) {
        let oldest_claim_age = remaining_claims
            .iter()
            .map(|c| now.signed_duration_since(c.claimed_at))
            .max();
        let stale_enough = match oldest_claim_age {
            Some(age) => age >= stale_epoch,
            None => !unresolved.is_empty(),
        };
        if stale_enough {
            Some(FlaggedEpoch {
                reason: "epoch terminal but claims or discoveries remain".to_string(),
                stale_claim_owners: remaining_claims.iter().map(|c| c.owner_task.clone()).collect(),
                unresolved_discovery_count: unresolved.len(),
            })
        } else {
            None
        }
    } else {
        None
    };

    Ok(ReaperReport {
        released_owners,
        flagged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{DiscoveryKind, PulseKind};
    use tempfile::tempdir;

    #[tokio::test]
    async fn archive_fails_when_claims_held() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric.claim_file("src/a.rs", "phase-01").await.unwrap();
        let dir = tempdir().unwrap();
        let err = archive(&fabric, "epoch-1", &dir.path().join("n.db"), &ArchiveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::ActiveClaims(1)));
    }

    #[tokio::test]
    async fn archive_fails_on_unresolved_discoveries_unless_forced() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric
            .post_discovery("phase-01", DiscoveryKind::Other, "ambiguous")
            .await
            .unwrap();
        let dir = tempdir().unwrap();
        let out = dir.path().join("n.db");
        let err = archive(&fabric, "epoch-1", &out, &ArchiveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::UnresolvedDiscoveries));

        let neutron = archive(&fabric, "epoch-1", &out, &ArchiveOptions { force: true })
            .await
            .unwrap();
        assert_eq!(neutron.epoch_id, "epoch-1");
        assert!(fabric.unresolved_discoveries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn archive_purges_fabric_and_writes_expected_rows() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric.set_phase_state("phase-01", PhaseState::Done).await.unwrap();
        fabric.set_phase_state("phase-02", PhaseState::Done).await.unwrap();
        fabric.emit_pulse("phase-01", PulseKind::Note, "done").await.unwrap();
        fabric.emit_pulse("phase-01", PulseKind::Note, "done2").await.unwrap();

        let dir = tempdir().unwrap();
        let out = dir.path().join("n.db");
        let neutron = archive(&fabric, "epoch-1", &out, &ArchiveOptions::default())
            .await
            .unwrap();
        assert_eq!(neutron.epoch_id, "epoch-1");

        assert!(fabric.all_phase_states().await.unwrap().is_empty());
        assert!(fabric.all_pulses().await.unwrap().is_empty());

        let conn = Connection::open(&out).unwrap();
        let task_count: i64 = conn.query_row("SELECT COUNT(*) FROM tasks", [], |r| r.get(0)).unwrap();
        assert_eq!(task_count, 2);
        let pulse_count: i64 = conn.query_row("SELECT COUNT(*) FROM pulses", [], |r| r.get(0)).unwrap();
        assert_eq!(pulse_count, 2);
    }

    #[tokio::test]
    async fn reaper_releases_stale_claim_for_non_running_owner() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric.claim_file("src/a.rs", "phase-01").await.unwrap();
        fabric.set_phase_state("phase-01", PhaseState::Failed).await.unwrap();

        let report = reap(
            &fabric,
            chrono::Duration::seconds(0),
            chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::minutes(31),
        )
        .await
        .unwrap();

        assert_eq!(report.released_owners, vec!["phase-01".to_string()]);
        assert!(fabric.all_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reaper_never_releases_claim_of_running_owner() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric.claim_file("src/a.rs", "phase-01").await.unwrap();
        fabric.set_phase_state("phase-01", PhaseState::Running).await.unwrap();

        let report = reap(
            &fabric,
            chrono::Duration::seconds(0),
            chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(2),
        )
        .await
        .unwrap();

        assert!(report.released_owners.is_empty());
        assert_eq!(fabric.all_claims().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reaper_flags_epoch_when_terminal_with_leftover_discoveries() {
        let fabric = Fabric::open_in_memory().unwrap();
        fabric.set_phase_state("phase-01", PhaseState::Done).await.unwrap();
        fabric
            .post_discovery("phase-01", DiscoveryKind::Other, "leftover")
            .await
            .unwrap();

        let report = reap(
            &fabric,
            chrono::Duration::hours(1),
            chrono::Duration::hours(1),
            Utc::now(),
        )
        .await
        .unwrap();

        let flagged = report.flagged.expect("expected a flagged epoch");
        assert_eq!(flagged.unresolved_discovery_count, 1);
    }
}
