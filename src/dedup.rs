use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::api::{ApiError, CheckInstantRequest, MergeRequest, TransferApi};
use crate::models::{ContentDigest, TransferId};

/// Result of existence negotiation, reduced to what the scheduler needs.
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Server already holds the complete file; skip every upload.
    pub already_complete: bool,
    /// Chunks that exist server-side with matching digests.
    pub confirmed: BTreeSet<u32>,
    /// Chunks that exist but do not match; these must be re-uploaded even
    /// if local state claims they were confirmed earlier.
    pub mismatched: BTreeSet<u32>,
}

/// Talks to the existence-check, status and merge endpoints. Check and
/// status failures degrade to "nothing exists" so an unavailable dedup
/// service never blocks a transfer.
pub struct DedupNegotiator {
    api: Arc<dyn TransferApi>,
}

impl DedupNegotiator {
    pub fn new(api: Arc<dyn TransferApi>) -> Self {
        Self { api }
    }

    pub async fn check_existing(&self, request: &CheckInstantRequest) -> DedupOutcome {
        match self.api.check_instant(request).await {
            Ok(response) => {
                if response.uploaded {
                    return DedupOutcome {
                        already_complete: true,
                        ..DedupOutcome::default()
                    };
                }
                let mut outcome = DedupOutcome::default();
                for check in &response.chunk_check_result {
                    if check.exist && check.matches {
                        outcome.confirmed.insert(check.index);
                    } else if check.exist {
                        outcome.mismatched.insert(check.index);
                    }
                }
                debug!(
                    transfer = %request.transfer_id,
                    confirmed = outcome.confirmed.len(),
                    mismatched = outcome.mismatched.len(),
                    "dedup check complete"
                );
                outcome
            }
            Err(e) => {
                warn!(transfer = %request.transfer_id, error = %e,
                    "dedup check unavailable; uploading everything");
                DedupOutcome::default()
            }
        }
    }

    /// Chunk indices the server reports as held, empty on failure.
    pub async fn server_status(
        &self,
        transfer_id: &TransferId,
        file_digest: &ContentDigest,
    ) -> BTreeSet<u32> {
        match self.api.get_status(transfer_id, file_digest).await {
            Ok(indices) => indices.into_iter().collect(),
            Err(e) => {
                warn!(transfer = %transfer_id, error = %e,
                    "status lookup unavailable; assuming no chunks held");
                BTreeSet::new()
            }
        }
    }

    /// Only called once the confirmed set equals the planned set.
    pub async fn request_merge(&self, request: &MergeRequest) -> Result<String, ApiError> {
        self.api.merge(request).await
    }
}
