pub mod progress;
pub mod retry;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::db::{PersistedRecord, RecordStore};
use crate::error::{FetchError, PipelineError};
use crate::fetch::{PageEnvelope, PageSource};
use crate::mapper::map_page;
use progress::ProgressObserver;
use retry::RetryPolicy;

/// Knobs for one harvest run.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Stop after this many pages even if the service has more.
    pub max_pages: u32,
    pub per_page: u32,
    /// Pause between consecutive pages. Not applied before retries.
    pub pacing: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Distinct pages requested.
    pub pages_attempted: u32,
    /// Requests sent, retries included.
    pub fetch_attempts: u32,
    pub records_upserted: usize,
}

#[derive(Debug)]
pub enum RunOutcome {
    Done(RunSummary),
    Aborted {
        summary: RunSummary,
        error: PipelineError,
    },
}

impl RunOutcome {
    pub fn summary(&self) -> &RunSummary {
        match self {
            RunOutcome::Done(s) => s,
            RunOutcome::Aborted { summary, .. } => summary,
        }
    }
}

enum State {
    Fetching(u32),
    Mapping {
        page: u32,
        envelope: PageEnvelope,
    },
    Persisting {
        page: u32,
        records: Vec<PersistedRecord>,
        has_next: bool,
    },
    Advancing {
        page: u32,
        has_next: bool,
    },
    Done,
    Aborted(PipelineError),
}

/// Walks the catalog page by page: fetch, map, upsert, decide whether to go on.
///
/// Each page is fully persisted before the next request goes out, and only
/// this loop decides when the run ends.
pub struct Driver {
    config: DriverConfig,
    retry: RetryPolicy,
}

impl Driver {
    pub fn new(config: DriverConfig, retry: RetryPolicy) -> Self {
        Self { config, retry }
    }

    pub async fn run<F, S, O>(&self, fetcher: &mut F, store: &mut S, observer: &mut O) -> RunOutcome
    where
        F: PageSource + ?Sized,
        S: RecordStore + ?Sized,
        O: ProgressObserver + ?Sized,
    {
        let mut summary = RunSummary::default();
        let mut failures = 0u32;
        let mut state = if self.config.max_pages == 0 {
            State::Done
        } else {
            State::Fetching(1)
        };

        loop {
            state = match state {
                State::Fetching(page) => {
                    if failures == 0 {
                        summary.pages_attempted += 1;
                        observer.on_page_start(page);
                    }
                    summary.fetch_attempts += 1;

                    match fetcher.fetch_page(page, self.config.per_page).await {
                        Ok(envelope) => {
                            failures = 0;
                            State::Mapping { page, envelope }
                        }
                        Err(err @ FetchError::Transport { .. }) => {
                            failures += 1;
                            match self.retry.next_delay(&err, failures) {
                                Some(wait) => {
                                    warn!(
                                        "{} on page {} (attempt {}), retrying in {:.1}s",
                                        err,
                                        page,
                                        failures,
                                        wait.as_secs_f64()
                                    );
                                    observer.on_retry(page, failures, wait, &err);
                                    tokio::time::sleep(wait).await;
                                    State::Fetching(page)
                                }
                                None => State::Aborted(PipelineError::RetriesExhausted {
                                    page,
                                    attempts: failures,
                                    last: err,
                                }),
                            }
                        }
                        Err(err) => State::Aborted(PipelineError::Fetch(err)),
                    }
                }

                State::Mapping { page, envelope } => {
                    if envelope.current_page != page {
                        debug!("asked for page {}, service says {}", page, envelope.current_page);
                    }
                    let records = map_page(&envelope.items);
                    let skipped = envelope.items.len() - records.len();
                    if skipped > 0 {
                        debug!("page {}: skipped {} items without id", page, skipped);
                    }
                    State::Persisting {
                        page,
                        records,
                        has_next: envelope.has_next_page,
                    }
                }

                State::Persisting {
                    page,
                    records,
                    has_next,
                } => {
                    let written = if records.is_empty() {
                        Ok(0)
                    } else {
                        store.upsert_batch(&records)
                    };
                    match written {
                        Ok(n) => {
                            summary.records_upserted += n;
                            observer.on_page_complete(page, n);
                            debug!("page {}: upserted {} records", page, n);
                            State::Advancing { page, has_next }
                        }
                        Err(e) => State::Aborted(e.into()),
                    }
                }

                State::Advancing { page, has_next } => {
                    if has_next && page < self.config.max_pages {
                        if !self.config.pacing.is_zero() {
                            tokio::time::sleep(self.config.pacing).await;
                        }
                        State::Fetching(page + 1)
                    } else {
                        if !has_next {
                            info!("Reached last page ({})", page);
                        } else {
                            info!("Page budget of {} exhausted", self.config.max_pages);
                        }
                        State::Done
                    }
                }

                State::Done => return RunOutcome::Done(summary),
                State::Aborted(error) => return RunOutcome::Aborted { summary, error },
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::error::StorageError;
    use crate::fetch::{RawCatalogItem, RawTitle};
    use async_trait::async_trait;

    type Handler = Box<dyn FnMut(u32, usize) -> Result<PageEnvelope, FetchError> + Send>;

    /// Serves pages from a closure and records every page it was asked for.
    struct ScriptedSource {
        handler: Handler,
        calls: Vec<u32>,
    }

    impl ScriptedSource {
        fn new(
            handler: impl FnMut(u32, usize) -> Result<PageEnvelope, FetchError> + Send + 'static,
        ) -> Self {
            Self {
                handler: Box::new(handler),
                calls: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&mut self, page: u32, _per_page: u32) -> Result<PageEnvelope, FetchError> {
            let seen = self.calls.iter().filter(|&&p| p == page).count();
            self.calls.push(page);
            (self.handler)(page, seen)
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl ProgressObserver for Recorder {
        fn on_page_start(&mut self, page: u32) {
            self.events.push(format!("start {}", page));
        }
        fn on_page_complete(&mut self, page: u32, upserted: usize) {
            self.events.push(format!("complete {} {}", page, upserted));
        }
        fn on_retry(&mut self, page: u32, attempt: u32, _wait: Duration, _error: &FetchError) {
            self.events.push(format!("retry {} {}", page, attempt));
        }
    }

    struct CountingStore {
        inner: SqliteStore,
        batches: usize,
    }

    impl RecordStore for CountingStore {
        fn upsert_batch(&mut self, records: &[PersistedRecord]) -> Result<usize, StorageError> {
            self.batches += 1;
            self.inner.upsert_batch(records)
        }
    }

    struct BrokenStore;

    impl RecordStore for BrokenStore {
        fn upsert_batch(&mut self, _records: &[PersistedRecord]) -> Result<usize, StorageError> {
            Err(StorageError::Sqlite(rusqlite::Error::InvalidQuery))
        }
    }

    fn item(id: Option<i64>) -> RawCatalogItem {
        RawCatalogItem {
            id,
            title: Some(RawTitle {
                romaji: Some(format!("title {:?}", id)),
                english: None,
            }),
            ..Default::default()
        }
    }

    /// Ten items per page, ids derived from the page number.
    fn page(n: u32, has_next: bool) -> PageEnvelope {
        PageEnvelope {
            current_page: n,
            has_next_page: has_next,
            items: (0..10).map(|i| item(Some(n as i64 * 100 + i))).collect(),
        }
    }

    fn driver(max_pages: u32, retry: RetryPolicy) -> Driver {
        Driver::new(
            DriverConfig {
                max_pages,
                per_page: 10,
                pacing: Duration::ZERO,
            },
            retry,
        )
    }

    #[tokio::test]
    async fn stops_when_no_next_page() {
        let mut source = ScriptedSource::new(|n, _| {
            let mut p = page(n, false);
            p.items.push(item(None));
            Ok(p)
        });
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1]);
        match outcome {
            RunOutcome::Done(s) => {
                assert_eq!(s.pages_attempted, 1);
                assert_eq!(s.records_upserted, 10);
            }
            other => panic!("expected Done, got {:?}", other),
        }
        assert_eq!(store.count_records().unwrap(), 10);
    }

    #[tokio::test]
    async fn stops_at_page_budget() {
        let mut source = ScriptedSource::new(|n, _| Ok(page(n, true)));
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(3, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1, 2, 3]);
        assert!(matches!(outcome, RunOutcome::Done(_)));
        assert_eq!(outcome.summary().fetch_attempts, 3);
        assert_eq!(outcome.summary().records_upserted, 30);
    }

    #[tokio::test]
    async fn retries_rate_limited_page() {
        let mut source = ScriptedSource::new(|n, seen| match (n, seen) {
            (2, 0) => Err(FetchError::transport(Some(429), "Too Many Requests")),
            (2, _) => Ok(page(2, false)),
            _ => Ok(page(n, true)),
        });
        let mut store = SqliteStore::in_memory().unwrap();
        let mut recorder = Recorder::default();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut recorder)
            .await;

        assert_eq!(source.calls, vec![1, 2, 2]);
        assert!(matches!(outcome, RunOutcome::Done(_)));
        let s = outcome.summary();
        assert_eq!(s.pages_attempted, 2);
        assert_eq!(s.fetch_attempts, 3);
        assert_eq!(s.records_upserted, 20);
        assert_eq!(store.count_records().unwrap(), 20);
        for id in 200..210 {
            assert!(store.get(id).unwrap().is_some());
        }
        assert_eq!(
            recorder.events,
            vec!["start 1", "complete 1 10", "start 2", "retry 2 1", "complete 2 10"]
        );
    }

    #[tokio::test]
    async fn protocol_error_aborts() {
        let mut source = ScriptedSource::new(|_, _| {
            Err(FetchError::Protocol {
                messages: vec![serde_json::json!({"message": "Validation error"})],
            })
        });
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1]);
        match outcome {
            RunOutcome::Aborted { summary, error } => {
                assert_eq!(summary.records_upserted, 0);
                assert!(matches!(error, PipelineError::Fetch(FetchError::Protocol { .. })));
            }
            other => panic!("expected Aborted, got {:?}", other),
        }
        assert_eq!(store.count_records().unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_body_aborts_without_retry() {
        let mut source = ScriptedSource::new(|_, _| Err(FetchError::Malformed("eof".into())));
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1]);
        assert!(matches!(outcome, RunOutcome::Aborted { .. }));
    }

    #[tokio::test]
    async fn many_failures_then_success() {
        let mut source = ScriptedSource::new(|n, seen| {
            if seen < 50 {
                Err(FetchError::transport(None, "connection reset"))
            } else {
                Ok(page(n, false))
            }
        });
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls.len(), 51);
        assert!(matches!(outcome, RunOutcome::Done(_)));
        assert_eq!(store.count_records().unwrap(), 10);
    }

    #[tokio::test]
    async fn bounded_retries_give_up() {
        let mut source =
            ScriptedSource::new(|_, _| Err(FetchError::transport(Some(503), "Service Unavailable")));
        let mut store = SqliteStore::in_memory().unwrap();
        let retry = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::immediate()
        };

        let outcome = driver(10, retry)
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1, 1]);
        match outcome {
            RunOutcome::Aborted {
                error: PipelineError::RetriesExhausted { page, attempts, last },
                ..
            } => {
                assert_eq!(page, 1);
                assert_eq!(attempts, 2);
                assert!(matches!(last, FetchError::Transport { status: Some(503), .. }));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failure_count_resets_per_page() {
        let mut source = ScriptedSource::new(|n, seen| {
            if seen == 0 {
                Err(FetchError::transport(Some(500), "Internal Server Error"))
            } else {
                Ok(page(n, n < 3))
            }
        });
        let mut store = SqliteStore::in_memory().unwrap();
        let retry = RetryPolicy {
            max_attempts: Some(2),
            ..RetryPolicy::immediate()
        };

        let outcome = driver(10, retry)
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1, 1, 2, 2, 3, 3]);
        assert!(matches!(outcome, RunOutcome::Done(_)));
    }

    #[tokio::test]
    async fn storage_error_aborts() {
        let mut source = ScriptedSource::new(|n, _| Ok(page(n, true)));

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut BrokenStore, &mut progress::NoProgress)
            .await;

        assert_eq!(source.calls, vec![1]);
        assert!(matches!(
            outcome,
            RunOutcome::Aborted {
                error: PipelineError::Storage(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn pages_without_ids_skip_the_store() {
        let mut source = ScriptedSource::new(|n, _| {
            if n == 1 {
                Ok(PageEnvelope {
                    current_page: 1,
                    has_next_page: true,
                    items: vec![item(None), item(None)],
                })
            } else {
                Ok(page(n, false))
            }
        });
        let mut store = CountingStore {
            inner: SqliteStore::in_memory().unwrap(),
            batches: 0,
        };
        let mut recorder = Recorder::default();

        let outcome = driver(10, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut recorder)
            .await;

        assert_eq!(source.calls, vec![1, 2]);
        assert_eq!(store.batches, 1);
        assert_eq!(outcome.summary().records_upserted, 10);
        assert!(recorder.events.contains(&"complete 1 0".to_string()));
    }

    #[tokio::test]
    async fn rerun_does_not_duplicate() {
        let mut store = SqliteStore::in_memory().unwrap();
        for _ in 0..2 {
            let mut source = ScriptedSource::new(|n, _| Ok(page(n, n < 2)));
            let outcome = driver(5, RetryPolicy::immediate())
                .run(&mut source, &mut store, &mut progress::NoProgress)
                .await;
            assert_eq!(outcome.summary().records_upserted, 20);
        }
        assert_eq!(store.count_records().unwrap(), 20);
    }

    #[tokio::test]
    async fn zero_page_budget_fetches_nothing() {
        let mut source = ScriptedSource::new(|n, _| Ok(page(n, true)));
        let mut store = SqliteStore::in_memory().unwrap();

        let outcome = driver(0, RetryPolicy::immediate())
            .run(&mut source, &mut store, &mut progress::NoProgress)
            .await;

        assert!(source.calls.is_empty());
        assert!(matches!(outcome, RunOutcome::Done(_)));
    }
}
