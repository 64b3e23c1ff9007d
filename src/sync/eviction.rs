//! Cache eviction
//!
//! Runs as a single transaction in three ordered passes: attachment bytes
//! first, then message bodies, then whole stale headers. Each pass only
//! considers entities past the minimum age and outside the access grace
//! window, oldest first, and stops as soon as usage drops under the budget.
//! Anything referenced by a pending mutation, or synced recently, is exempt.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::db::{Database, DbResult};
use crate::sync::gatekeeper::CacheUsage;
use crate::sync::EngineError;

pub const LAST_RUN_SETTING: &str = "eviction_last_run";

/// What one eviction run removed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvictionReport {
    pub attachments_evicted: usize,
    pub bodies_evicted: usize,
    pub headers_evicted: usize,
    pub bytes_freed: u64,
    pub bytes_used_after: u64,
}

const MUTATION_EXEMPT: &str =
    "NOT EXISTS (SELECT 1 FROM pending_mutations p WHERE p.entity_id = m.id)";

/// Run the eviction passes. Safe to call when already under budget;
/// it returns immediately with an empty report.
pub fn run(db: &Database, config: &EngineConfig, usage: &CacheUsage) -> Result<EvictionReport, EngineError> {
    let budget = config.cache_budget_bytes;
    let used = db.compute_cache_usage()?;
    let mut report = EvictionReport::default();

    let now = Utc::now();
    let age_cutoff = (now - Duration::days(config.eviction_min_age_days)).to_rfc3339();
    let access_cutoff = (now - Duration::hours(config.eviction_access_grace_hours)).to_rfc3339();

    if used <= budget {
        log::debug!("eviction skipped, {} bytes within budget {}", used, budget);
        usage.set_bytes_used(used);
        db.set_setting(LAST_RUN_SETTING, &now.to_rfc3339())?;
        return Ok(report);
    }

    log::info!("eviction starting: {} bytes used, budget {}", used, budget);

    evict_passes(db, budget, &age_cutoff, &access_cutoff, used, &mut report)?;

    let after = db.compute_cache_usage()?;
    usage.set_bytes_used(after);
    report.bytes_used_after = after;
    db.set_setting(LAST_RUN_SETTING, &now.to_rfc3339())?;

    log::info!(
        "eviction done: {} attachments, {} bodies, {} headers, {} bytes freed, {} bytes used",
        report.attachments_evicted,
        report.bodies_evicted,
        report.headers_evicted,
        report.bytes_freed,
        report.bytes_used_after
    );
    Ok(report)
}

/// The transactional passes. The connection is held only inside this
/// function; recomputing usage afterwards needs the pool slot back.
fn evict_passes(
    db: &Database,
    budget: u64,
    age_cutoff: &str,
    access_cutoff: &str,
    mut used: u64,
    report: &mut EvictionReport,
) -> DbResult<()> {
    let mut conn = db.get_conn()?;
    let tx = conn.transaction()?;

    // Pass 1: attachment bytes
    if used > budget {
        let candidates: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT a.id, a.size_bytes
                FROM attachments a
                JOIN messages m ON m.id = a.message_id
                WHERE a.cached = 1
                  AND m.received_at < ?1
                  AND (a.last_accessed_at IS NULL OR a.last_accessed_at < ?2)
                  AND (m.last_accessed_at IS NULL OR m.last_accessed_at < ?2)
                  AND m.synced_at < ?2
                  AND {MUTATION_EXEMPT}
                ORDER BY m.received_at ASC
                "#
            ))?;
            let rows = stmt.query_map(params![age_cutoff, access_cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (id, size) in candidates {
            if used <= budget {
                break;
            }
            tx.execute(
                "UPDATE attachments SET data = NULL, cached = 0 WHERE id = ?1",
                params![id],
            )?;
            used = used.saturating_sub(size.max(0) as u64);
            report.attachments_evicted += 1;
            report.bytes_freed += size.max(0) as u64;
        }
    }

    // Pass 2: message bodies
    if used > budget {
        let candidates: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT m.id, m.body_size
                FROM messages m
                WHERE m.body_cached = 1
                  AND m.received_at < ?1
                  AND (m.last_accessed_at IS NULL OR m.last_accessed_at < ?2)
                  AND m.synced_at < ?2
                  AND {MUTATION_EXEMPT}
                ORDER BY m.received_at ASC
                "#
            ))?;
            let rows = stmt.query_map(params![age_cutoff, access_cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (id, size) in candidates {
            if used <= budget {
                break;
            }
            tx.execute(
                "UPDATE messages SET body = NULL, body_cached = 0, body_size = 0 WHERE id = ?1",
                params![id],
            )?;
            used = used.saturating_sub(size.max(0) as u64);
            report.bodies_evicted += 1;
            report.bytes_freed += size.max(0) as u64;
        }
    }

    // Pass 3: whole stale headers, for whatever cached bytes remain on them
    if used > budget {
        let candidates: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare(&format!(
                r#"
                SELECT m.id,
                       (m.body_size * m.body_cached) +
                       COALESCE((SELECT SUM(a.size_bytes * a.cached) FROM attachments a WHERE a.message_id = m.id), 0)
                FROM messages m
                WHERE m.received_at < ?1
                  AND (m.last_accessed_at IS NULL OR m.last_accessed_at < ?2)
                  AND m.synced_at < ?2
                  AND {MUTATION_EXEMPT}
                ORDER BY m.received_at ASC
                "#
            ))?;
            let rows = stmt.query_map(params![age_cutoff, access_cutoff], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (id, size) in candidates {
            if used <= budget {
                break;
            }
            tx.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
            used = used.saturating_sub(size.max(0) as u64);
            report.headers_evicted += 1;
            report.bytes_freed += size.max(0) as u64;
        }
    }

    tx.commit()?;
    Ok(())
}
