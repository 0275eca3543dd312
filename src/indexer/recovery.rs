//! Job id recovery
//!
//! Some submit paths do not return the id of the job they created. The id
//! can be recovered by scanning the most recent job ids for one matching the
//! buyer and provider, but two jobs created close together by the same pair
//! are indistinguishable that way. The scan therefore reports ambiguity
//! instead of guessing, and [`reconcile_with_mirror`] narrows the candidates
//! once the indexer has mirrored the `JobCreated` events.

use tracing::{debug, warn};

use crate::core_types::{JobId, Version};
use crate::ledger::types::{first_return, value_as_u64};
use crate::ledger::{Address, LedgerClient, LedgerError, LedgerModules, functions};
use crate::store::{MirrorStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovered {
    /// Exactly one job matches
    Unique(JobId),
    /// Several jobs match, ascending by id
    Ambiguous(Vec<JobId>),
    NotFound,
}

impl Recovered {
    fn from_candidates(mut candidates: Vec<JobId>) -> Self {
        candidates.sort_unstable();
        candidates.dedup();
        match candidates.as_slice() {
            [] => Recovered::NotFound,
            [id] => Recovered::Unique(*id),
            _ => Recovered::Ambiguous(candidates),
        }
    }
}

/// Scan the last `window` job ids for jobs between `buyer` and `provider`
pub async fn recover_job_id(
    ledger: &dyn LedgerClient,
    modules: &LedgerModules,
    buyer: &Address,
    provider: &Address,
    window: u64,
) -> Result<Recovered, LedgerError> {
    let job_module = modules.job_module();

    let next = ledger
        .view(&job_module, functions::GET_NEXT_JOB_ID, vec![])
        .await?;
    let next_id = value_as_u64(first_return(&next))
        .ok_or_else(|| LedgerError::rejected("get_next_job_id returned no integer"))?;

    let mut candidates = Vec::new();
    for job_id in next_id.saturating_sub(window)..next_id {
        let job = match ledger
            .view(
                &job_module,
                functions::GET_JOB,
                vec![serde_json::Value::String(job_id.to_string())],
            )
            .await
        {
            Ok(value) => value,
            Err(e) if e.kind.is_definitive_gone() => continue,
            Err(e) => return Err(e),
        };

        let job = first_return(&job);
        let party = |field: &str| job[field].as_str().and_then(|raw| Address::parse(raw).ok());
        if party("buyer").as_ref() == Some(buyer) && party("provider").as_ref() == Some(provider) {
            candidates.push(job_id);
        }
    }

    let recovered = Recovered::from_candidates(candidates);
    match &recovered {
        Recovered::Ambiguous(ids) => {
            warn!(buyer = %buyer, provider = %provider, candidates = ?ids, "Job id recovery is ambiguous");
        }
        other => debug!(buyer = %buyer, provider = %provider, result = ?other, "Job id recovery"),
    }
    Ok(recovered)
}

/// Narrow ambiguous candidates using the mirror.
///
/// A candidate survives if the mirror holds it with a `created_version`
/// above `created_after`, the head version observed before the create was
/// submitted. If no candidate qualifies yet, the input is returned as is.
pub async fn reconcile_with_mirror(
    store: &dyn MirrorStore,
    candidates: &[JobId],
    buyer: &Address,
    provider: &Address,
    created_after: Version,
) -> Result<Recovered, StoreError> {
    let mirrored = store.find_jobs_by_parties(buyer, provider).await?;

    let confirmed: Vec<JobId> = mirrored
        .iter()
        .filter(|job| candidates.contains(&job.job_id) && job.created_version > created_after)
        .map(|job| job.job_id)
        .collect();

    if confirmed.is_empty() {
        // Mirror has not caught up; nothing to narrow with
        return Ok(Recovered::from_candidates(candidates.to_vec()));
    }
    Ok(Recovered::from_candidates(confirmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MockLedgerClient;
    use crate::store::{JobRecord, JobStatus, MemoryStore};
    use serde_json::json;

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    fn script_jobs(ledger: &MockLedgerClient, jobs: &[(u64, &str, &str)], next_id: u64) {
        let module = ledger.modules().job_module();
        ledger.set_view(&module, functions::GET_NEXT_JOB_ID, &[], Ok(json!([next_id.to_string()])));
        for (id, buyer, provider) in jobs {
            ledger.set_view(
                &module,
                functions::GET_JOB,
                &[json!(id.to_string())],
                Ok(json!([{ "job_id": id.to_string(), "buyer": buyer, "provider": provider }])),
            );
        }
    }

    fn job(job_id: u64, created_version: u64) -> JobRecord {
        JobRecord {
            job_id,
            buyer: addr("0xb0"),
            provider: addr("0xa1"),
            status: JobStatus::Pending,
            max_duration_secs: 60,
            price_per_second: 1,
            created_at: 0,
            created_version,
            updated_version: created_version,
        }
    }

    #[tokio::test]
    async fn test_unique_match() {
        let ledger = MockLedgerClient::new();
        script_jobs(&ledger, &[(8, "0xb0", "0xa1"), (9, "0xcc", "0xa1")], 10);

        let found = recover_job_id(&ledger, ledger.modules(), &addr("0xB0"), &addr("0xa1"), 5)
            .await
            .unwrap();
        assert_eq!(found, Recovered::Unique(8));
    }

    #[tokio::test]
    async fn test_same_parties_are_ambiguous() {
        let ledger = MockLedgerClient::new();
        script_jobs(&ledger, &[(7, "0xb0", "0xa1"), (9, "0xb0", "0xa1")], 10);

        let found = recover_job_id(&ledger, ledger.modules(), &addr("0xb0"), &addr("0xa1"), 5)
            .await
            .unwrap();
        assert_eq!(found, Recovered::Ambiguous(vec![7, 9]));
    }

    #[tokio::test]
    async fn test_nothing_in_window() {
        let ledger = MockLedgerClient::new();
        script_jobs(&ledger, &[(2, "0xb0", "0xa1")], 10);

        let found = recover_job_id(&ledger, ledger.modules(), &addr("0xb0"), &addr("0xa1"), 3)
            .await
            .unwrap();
        assert_eq!(found, Recovered::NotFound);
    }

    #[tokio::test]
    async fn test_mirror_narrows_candidates() {
        let store = MemoryStore::new();
        store.upsert_job(&job(7, 100)).await.unwrap();
        store.upsert_job(&job(9, 250)).await.unwrap();

        let narrowed = reconcile_with_mirror(&store, &[7, 9], &addr("0xb0"), &addr("0xa1"), 200)
            .await
            .unwrap();
        assert_eq!(narrowed, Recovered::Unique(9));
    }

    #[tokio::test]
    async fn test_mirror_behind_keeps_ambiguity() {
        let store = MemoryStore::new();
        let narrowed = reconcile_with_mirror(&store, &[7, 9], &addr("0xb0"), &addr("0xa1"), 200)
            .await
            .unwrap();
        assert_eq!(narrowed, Recovered::Ambiguous(vec![7, 9]));
    }
}
