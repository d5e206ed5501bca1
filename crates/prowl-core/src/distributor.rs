//! Date-seeded partition of the area catalog across a day's sessions.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};

use crate::error::AppError;
use crate::models::{AreaAssignment, AreaCode};

fn seed_for(date_seed: &str) -> [u8; 32] {
    let digest = Sha256::digest(date_seed.as_bytes());
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&digest);
    seed
}

/// Canonical, shuffled order of the catalog for one date.
fn shuffled(all_areas: &[AreaCode], date_seed: &str) -> Vec<AreaCode> {
    let mut areas = all_areas.to_vec();
    areas.sort();
    areas.dedup();
    let mut rng = StdRng::from_seed(seed_for(date_seed));
    areas.shuffle(&mut rng);
    areas
}

fn check_ordinal(session_ordinal: u32, total_sessions: u32) -> Result<(), AppError> {
    if total_sessions == 0 {
        return Err(AppError::ConfigError(
            "total sessions per day must be at least 1".into(),
        ));
    }
    if session_ordinal >= total_sessions {
        return Err(AppError::ConfigError(format!(
            "session ordinal {session_ordinal} out of range for {total_sessions} sessions per day"
        )));
    }
    Ok(())
}

/// Areas owned by `session_ordinal` on the day identified by `date_seed`.
///
/// Across all ordinals of one date the outputs are disjoint and together
/// cover every distinct area. An empty catalog yields an empty assignment.
pub fn assign(
    all_areas: &[AreaCode],
    session_ordinal: u32,
    total_sessions: u32,
    date_seed: &str,
) -> Result<Vec<AreaAssignment>, AppError> {
    check_ordinal(session_ordinal, total_sessions)?;

    let assignment = shuffled(all_areas, date_seed)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| (*i % total_sessions as usize) == session_ordinal as usize)
        .enumerate()
        .map(|(sequence_index, (_, area_code))| AreaAssignment {
            area_code,
            sequence_index,
        })
        .collect();

    Ok(assignment)
}

/// Every session's area list for one date, indexed by ordinal.
pub fn plan_day(
    all_areas: &[AreaCode],
    total_sessions: u32,
    date_seed: &str,
) -> Result<Vec<Vec<AreaCode>>, AppError> {
    check_ordinal(0, total_sessions)?;

    let mut plan = vec![Vec::new(); total_sessions as usize];
    for (i, area) in shuffled(all_areas, date_seed).into_iter().enumerate() {
        plan[i % total_sessions as usize].push(area);
    }
    Ok(plan)
}

/// Ordinal of a session within its day.
///
/// An explicit ordinal wins. Otherwise a trailing number in the session id
/// (`2025-01-01-session-3`) is used modulo `total_sessions`, falling back to
/// a hash of the id.
pub fn resolve_ordinal(
    explicit: Option<u32>,
    session_id: &str,
    total_sessions: u32,
) -> Result<u32, AppError> {
    if let Some(ordinal) = explicit {
        check_ordinal(ordinal, total_sessions)?;
        return Ok(ordinal);
    }
    check_ordinal(0, total_sessions)?;

    let digits: String = session_id
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    if let Ok(n) = digits.parse::<u64>() {
        return Ok((n % total_sessions as u64) as u32);
    }

    let digest = Sha256::digest(session_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let ordinal = (u64::from_be_bytes(head) % total_sessions as u64) as u32;
    tracing::warn!(
        session_id,
        ordinal,
        "No session ordinal given and none in the session id; derived one from its hash"
    );
    Ok(ordinal)
}
