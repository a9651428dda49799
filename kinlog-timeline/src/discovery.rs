//! Password-to-timeline discovery.
//!
//! Given a password and the candidate timelines in priority order, discovery
//! trial-decrypts a handful of each candidate's most recent entries. The
//! first candidate for which any probe opens is the match. A match is then
//! followed by a bulk load of that whole timeline.
//!
//! Key derivation is deliberately slow, so every probe and bulk load runs on
//! tokio's blocking pool.

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use kinlog_crypto::CryptoProvider;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::config::DiscoveryStrategy;
use crate::dispatch::{open_entry_as, OpenedEntry};
use crate::error::{EntryError, TimelineError, TimelineResult};
use crate::identity::TimelineId;
use crate::store::EntryStore;

/// The timeline a password was found to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimelineMatch {
    pub timeline: TimelineId,
    /// Id of the probe entry that opened.
    pub matched_entry: String,
    /// Probe entries tried across all candidates before the decision.
    pub probes_tried: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Match(TimelineMatch),
    NoMatch,
}

impl DiscoveryOutcome {
    pub fn timeline(&self) -> Option<&TimelineId> {
        match self {
            Self::Match(m) => Some(&m.timeline),
            Self::NoMatch => None,
        }
    }
}

/// An entry that could not be opened during a bulk load.
#[derive(Debug)]
pub struct EntryAnomaly {
    pub entry_id: String,
    pub error: EntryError,
}

/// Every entry of one timeline that opened, oldest first, plus the ones that
/// did not.
#[derive(Debug)]
pub struct TimelineLoad {
    pub timeline: TimelineId,
    pub entries: Vec<OpenedEntry>,
    pub anomalies: Vec<EntryAnomaly>,
}

#[derive(Debug)]
pub enum UnlockOutcome {
    Unlocked(TimelineLoad),
    NoMatch,
}

#[derive(Debug)]
struct ProbeReport {
    timeline: TimelineId,
    matched: Option<String>,
    tried: usize,
}

/// Trial-decryption discovery over an entry store.
pub struct TimelineDiscovery<S: EntryStore + 'static> {
    store: Arc<S>,
    crypto: Arc<dyn CryptoProvider>,
    probe_size: usize,
    strategy: DiscoveryStrategy,
}

impl<S: EntryStore + 'static> TimelineDiscovery<S> {
    pub fn new(
        store: Arc<S>,
        crypto: Arc<dyn CryptoProvider>,
        probe_size: usize,
        strategy: DiscoveryStrategy,
    ) -> Self {
        Self {
            store,
            crypto,
            probe_size: probe_size.max(1),
            strategy,
        }
    }

    /// Finds which of `candidates` the password belongs to.
    ///
    /// `candidates` must already be in priority order; when a password opens
    /// more than one timeline the earliest candidate wins under either
    /// strategy.
    pub async fn discover(
        &self,
        password: &str,
        candidates: &[TimelineId],
    ) -> TimelineResult<DiscoveryOutcome> {
        if password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        let password = Arc::new(Zeroizing::new(password.to_owned()));
        let started = Instant::now();

        let outcome = match self.strategy {
            DiscoveryStrategy::Sequential => self.discover_sequential(&password, candidates).await?,
            DiscoveryStrategy::Parallel => self.discover_parallel(&password, candidates).await?,
        };

        match &outcome {
            DiscoveryOutcome::Match(m) => info!(
                timeline = %m.timeline,
                probes = m.probes_tried,
                elapsed_ms = elapsed_ms(started),
                "Password matched timeline"
            ),
            DiscoveryOutcome::NoMatch => info!(
                candidates = candidates.len(),
                elapsed_ms = elapsed_ms(started),
                "Password matched no timeline"
            ),
        }
        Ok(outcome)
    }

    async fn discover_sequential(
        &self,
        password: &Arc<Zeroizing<String>>,
        candidates: &[TimelineId],
    ) -> TimelineResult<DiscoveryOutcome> {
        let mut probes_tried = 0;
        for candidate in candidates {
            let report = self.spawn_probe(*candidate, Arc::clone(password)).await?;
            probes_tried += report.tried;
            if let Some(matched_entry) = report.matched {
                return Ok(DiscoveryOutcome::Match(TimelineMatch {
                    timeline: report.timeline,
                    matched_entry,
                    probes_tried,
                }));
            }
        }
        Ok(DiscoveryOutcome::NoMatch)
    }

    async fn discover_parallel(
        &self,
        password: &Arc<Zeroizing<String>>,
        candidates: &[TimelineId],
    ) -> TimelineResult<DiscoveryOutcome> {
        let probes = candidates
            .iter()
            .map(|candidate| self.spawn_probe(*candidate, Arc::clone(password)));
        // join_all keeps input order, so scanning the results front to back
        // preserves candidate priority regardless of completion order.
        let reports = join_all(probes).await;

        let mut probes_tried = 0;
        for report in reports {
            let report = report?;
            probes_tried += report.tried;
            if let Some(matched_entry) = report.matched {
                return Ok(DiscoveryOutcome::Match(TimelineMatch {
                    timeline: report.timeline,
                    matched_entry,
                    probes_tried,
                }));
            }
        }
        Ok(DiscoveryOutcome::NoMatch)
    }

    async fn spawn_probe(
        &self,
        timeline: TimelineId,
        password: Arc<Zeroizing<String>>,
    ) -> TimelineResult<ProbeReport> {
        let store = Arc::clone(&self.store);
        let crypto = Arc::clone(&self.crypto);
        let probe_size = self.probe_size;
        tokio::task::spawn_blocking(move || {
            probe(store.as_ref(), crypto.as_ref(), timeline, &password, probe_size)
        })
        .await
        .map_err(|e| TimelineError::Task(e.to_string()))?
    }

    /// Opens every entry of `timeline` with `password`.
    ///
    /// Entries that fail are reported as anomalies and do not abort the load.
    pub async fn load_timeline(
        &self,
        timeline: TimelineId,
        password: &str,
    ) -> TimelineResult<TimelineLoad> {
        if password.is_empty() {
            return Err(TimelineError::EmptyPassword);
        }
        let store = Arc::clone(&self.store);
        let crypto = Arc::clone(&self.crypto);
        let password = Zeroizing::new(password.to_owned());
        tokio::task::spawn_blocking(move || {
            load(store.as_ref(), crypto.as_ref(), timeline, &password)
        })
        .await
        .map_err(|e| TimelineError::Task(e.to_string()))?
    }

    /// Discovers the password's timeline and loads it.
    pub async fn unlock(
        &self,
        password: &str,
        candidates: &[TimelineId],
    ) -> TimelineResult<UnlockOutcome> {
        match self.discover(password, candidates).await? {
            DiscoveryOutcome::Match(m) => {
                let load = self.load_timeline(m.timeline, password).await?;
                Ok(UnlockOutcome::Unlocked(load))
            }
            DiscoveryOutcome::NoMatch => Ok(UnlockOutcome::NoMatch),
        }
    }
}

fn probe<S: EntryStore + ?Sized>(
    store: &S,
    crypto: &dyn CryptoProvider,
    timeline: TimelineId,
    password: &str,
    probe_size: usize,
) -> TimelineResult<ProbeReport> {
    let recent = store.query_recent(&timeline, probe_size)?;
    let mut tried = 0;
    for entry in &recent {
        tried += 1;
        match open_entry_as(crypto, entry, password, &timeline) {
            Ok(_) => {
                debug!(%timeline, entry = %entry.id, tried, "Probe opened");
                return Ok(ProbeReport {
                    timeline,
                    matched: Some(entry.id.clone()),
                    tried,
                });
            }
            Err(EntryError::AuthenticationMismatch) => {}
            Err(e) => debug!(%timeline, entry = %entry.id, error = %e, "Probe entry unusable"),
        }
    }
    debug!(%timeline, tried, "No probe opened");
    Ok(ProbeReport {
        timeline,
        matched: None,
        tried,
    })
}

/// Milliseconds since `started`, saturating instead of wrapping.
fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn load<S: EntryStore + ?Sized>(
    store: &S,
    crypto: &dyn CryptoProvider,
    timeline: TimelineId,
    password: &str,
) -> TimelineResult<TimelineLoad> {
    let records = store.query_by_target(&timeline)?;
    let mut entries = Vec::with_capacity(records.len());
    let mut anomalies = Vec::new();

    for record in &records {
        match open_entry_as(crypto, record, password, &timeline) {
            Ok(opened) => entries.push(opened),
            Err(error) => {
                warn!(%timeline, entry = %record.id, %error, "Skipping entry during timeline load");
                anomalies.push(EntryAnomaly {
                    entry_id: record.id.clone(),
                    error,
                });
            }
        }
    }

    info!(
        %timeline,
        loaded = entries.len(),
        skipped = anomalies.len(),
        "Timeline loaded"
    );
    Ok(TimelineLoad {
        timeline,
        entries,
        anomalies,
    })
}
