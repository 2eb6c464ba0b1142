//! Authority write interface shared by the HTTP API, the CLI and feed imports.

use serde::Serialize;
use tracing::info;

use crate::error::ImportError;
use crate::model::{InsertOutcome, ListKind};
use crate::normalizer::{canonicalize, BatchMeta, Normalizer};
use crate::store::ListStore;

/// Human-readable outcome of an import plus the count of new rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub message: String,
    pub inserted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<usize>,
}

#[derive(Clone)]
pub struct ListService {
    store: ListStore,
    normalizer: Normalizer,
}

impl ListService {
    pub fn new(store: ListStore, normalizer: Normalizer) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &ListStore {
        &self.store
    }

    /// Store one address or range as given (ranges are not expanded).
    pub fn import_single(
        &self,
        kind: ListKind,
        ip_or_cidr: &str,
        meta: &BatchMeta,
    ) -> Result<ImportSummary, ImportError> {
        let canonical = canonicalize(ip_or_cidr)?;
        let outcome = self.store.insert(
            kind,
            &canonical,
            &meta.source,
            meta.reason.as_deref(),
            meta.comment.as_deref(),
        )?;

        let summary = match outcome {
            InsertOutcome::Inserted => ImportSummary {
                message: format!("Added {} to {} from source {}", canonical, kind, meta.source),
                inserted: 1,
                rejected: None,
            },
            InsertOutcome::AlreadyPresent => ImportSummary {
                message: format!("IP {} already exists in {}", canonical, kind),
                inserted: 0,
                rejected: None,
            },
        };
        Ok(summary)
    }

    /// Normalize a batch and insert-or-ignore every resulting host.
    pub fn import_bulk<I, S>(
        &self,
        kind: ListKind,
        tokens: I,
        meta: &BatchMeta,
    ) -> Result<ImportSummary, ImportError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let batch = self.normalizer.normalize(tokens, meta)?;
        let expanded = batch.entries.len();
        let rejected = batch.rejected.len();
        let inserted = self.store.insert_many(kind, &batch.entries)?;

        info!(
            list = %kind,
            source = %meta.source,
            inserted,
            expanded,
            rejected,
            "Bulk import complete"
        );

        Ok(ImportSummary {
            message: format!(
                "Added {} IPs to {} ({} already present, {} rejected)",
                inserted,
                kind,
                expanded - inserted,
                rejected
            ),
            inserted,
            rejected: Some(rejected),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NormalizeError;

    fn service() -> ListService {
        ListService::new(ListStore::open_in_memory().unwrap(), Normalizer::default())
    }

    #[test]
    fn test_single_insert_messages() {
        let svc = service();
        let meta = BatchMeta::new("manual");

        let first = svc.import_single(ListKind::Blacklist, "1.2.3.4", &meta).unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.message, "Added 1.2.3.4 to blacklist from source manual");

        let second = svc.import_single(ListKind::Blacklist, "1.2.3.4", &meta).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.message, "IP 1.2.3.4 already exists in blacklist");
    }

    #[test]
    fn test_single_insert_keeps_range_unexpanded() {
        let svc = service();
        svc.import_single(ListKind::Whitelist, "192.168.1.77/24", &BatchMeta::new("ops"))
            .unwrap();
        let rows = svc
            .store()
            .list(ListKind::Whitelist, &Default::default())
            .unwrap();
        assert_eq!(rows[0].ip_or_cidr, "192.168.1.0/24");
    }

    #[test]
    fn test_single_insert_invalid() {
        let err = service()
            .import_single(ListKind::Blacklist, "999.1.1.1", &BatchMeta::new("manual"))
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Validation(NormalizeError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_bulk_summary_counts() {
        let svc = service();
        svc.import_single(ListKind::Blacklist, "10.0.0.1", &BatchMeta::new("manual"))
            .unwrap();

        let summary = svc
            .import_bulk(
                ListKind::Blacklist,
                ["10.0.0.0/30", "junk"],
                &BatchMeta::new("bulk-import"),
            )
            .unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.rejected, Some(1));
        assert_eq!(
            summary.message,
            "Added 1 IPs to blacklist (1 already present, 1 rejected)"
        );
    }

    #[test]
    fn test_bulk_all_invalid_inserts_nothing() {
        let svc = service();
        let err = svc
            .import_bulk(ListKind::Blacklist, ["not-an-ip", "also-bad"], &BatchMeta::new("x"))
            .unwrap_err();
        assert!(matches!(
            err,
            ImportError::Validation(NormalizeError::NoValidAddresses { rejected: 2 })
        ));
        assert_eq!(svc.store().count(ListKind::Blacklist).unwrap(), 0);
    }
}
