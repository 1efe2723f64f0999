//! Token Pool
//!
//! Holds the latest complete set of issued tokens. A refresh cycle builds a
//! new set off to the side and swaps it in under a short write guard, so a
//! reader sees either the old pool or the new one, never a mix.
//!
//! A cycle that issues nothing leaves the previous pool in place: stale
//! tokens are preferred over none.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use super::{Token, TokenIssuer};
use crate::credentials::CredentialSource;
use crate::error::CredentialLoadError;
use crate::metrics;

/// Default number of issuance calls in flight during one refresh cycle
pub const DEFAULT_ISSUE_CONCURRENCY: usize = 8;

/// One complete generation of the pool
#[derive(Debug)]
pub struct PoolSnapshot {
    pub tokens: Vec<Token>,
    pub refreshed_at: DateTime<Utc>,
    pub generation: u64,
}

/// What a refresh cycle did to the pool
#[derive(Debug)]
pub enum RefreshOutcome {
    /// The pool was replaced with `issued` fresh tokens
    Replaced { issued: usize, failed: usize },

    /// No token could be issued; the previous pool (if any) is kept
    NothingIssued { failed: usize },

    /// The credential store could not be read; the previous pool is kept
    CredentialsUnavailable(CredentialLoadError),
}

impl RefreshOutcome {
    pub fn replaced(&self) -> bool {
        matches!(self, RefreshOutcome::Replaced { .. })
    }
}

/// Concurrently readable pool of tokens derived from stored credentials
pub struct TokenPool {
    current: RwLock<Option<Arc<PoolSnapshot>>>,

    /// Round-robin start position for token selection
    cursor: AtomicUsize,

    /// Serializes refresh cycles so an older cycle never overwrites a newer one
    refresh_guard: Mutex<()>,

    source: Arc<dyn CredentialSource>,
    issuer: Arc<dyn TokenIssuer>,
    issue_concurrency: usize,
}

impl TokenPool {
    pub fn new(source: Arc<dyn CredentialSource>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            current: RwLock::new(None),
            cursor: AtomicUsize::new(0),
            refresh_guard: Mutex::new(()),
            source,
            issuer,
            issue_concurrency: DEFAULT_ISSUE_CONCURRENCY,
        }
    }

    pub fn with_issue_concurrency(mut self, concurrency: usize) -> Self {
        self.issue_concurrency = concurrency.max(1);
        self
    }

    /// Latest complete pool, or `None` if no cycle has issued a token yet
    pub fn snapshot(&self) -> Option<Arc<PoolSnapshot>> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        guard.clone()
    }

    /// Tokens of the latest complete pool; empty before the first successful cycle
    pub fn current_tokens(&self) -> Vec<Token> {
        self.snapshot()
            .map(|snapshot| snapshot.tokens.clone())
            .unwrap_or_default()
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot().is_some()
    }

    pub fn len(&self) -> usize {
        self.snapshot().map(|s| s.tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next round-robin start index into a pool of `len` tokens
    pub fn next_start(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }

    /// Run one refresh cycle
    ///
    /// Every credential is exchanged independently; failures are logged and
    /// skipped, never retried within the cycle beyond the issuer's own retry
    /// policy. The pool is only touched if at least one token was issued.
    pub async fn refresh(&self) -> RefreshOutcome {
        let _cycle = self.refresh_guard.lock().await;
        metrics::REFRESH_CYCLES_TOTAL.inc();
        tracing::info!("Refreshing token pool");

        let credentials = match self.source.load().await {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::error!("Skipping refresh, credential store unavailable: {}", e);
                return RefreshOutcome::CredentialsUnavailable(e);
            }
        };

        let total = credentials.len();
        let semaphore = Arc::new(Semaphore::new(self.issue_concurrency));
        let mut tasks = JoinSet::new();

        for (index, credential) in credentials.into_iter().enumerate() {
            let issuer = Arc::clone(&self.issuer);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = issuer.issue(&credential).await;
                (index, credential.account_id, result)
            });
        }

        let mut issued = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(token))) => issued.push((index, token)),
                Ok((_, account_id, Err(e))) => {
                    metrics::ISSUANCE_FAILURES_TOTAL.inc();
                    tracing::warn!("Token issuance failed for account {}: {}", account_id, e);
                }
                Err(e) => {
                    metrics::ISSUANCE_FAILURES_TOTAL.inc();
                    tracing::error!("Token issuance task failed: {}", e);
                }
            }
        }

        // Keep credential-store order so round-robin is stable across cycles.
        issued.sort_by_key(|(index, _)| *index);
        let tokens: Vec<Token> = issued.into_iter().map(|(_, token)| token).collect();
        let failed = total - tokens.len();

        if tokens.is_empty() {
            tracing::warn!(
                "Refresh issued no tokens ({} failed), keeping previous pool of {}",
                failed,
                self.len()
            );
            return RefreshOutcome::NothingIssued { failed };
        }

        let count = tokens.len();
        self.replace(tokens);
        tracing::info!("Token pool refreshed: {} tokens, {} failed", count, failed);

        RefreshOutcome::Replaced {
            issued: count,
            failed,
        }
    }

    fn replace(&self, tokens: Vec<Token>) {
        let count = tokens.len();
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let generation = guard.as_ref().map(|s| s.generation + 1).unwrap_or(1);
        *guard = Some(Arc::new(PoolSnapshot {
            tokens,
            refreshed_at: Utc::now(),
            generation,
        }));
        drop(guard);
        metrics::TOKENS_IN_POOL.set(count as i64);
    }
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("tokens", &self.len())
            .field("issue_concurrency", &self.issue_concurrency)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::Credential;
    use crate::error::IssuanceError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    struct StaticSource(StdMutex<Result<Vec<Credential>, ()>>);

    impl StaticSource {
        fn accounts(ids: &[&str]) -> Arc<Self> {
            let creds = ids.iter().map(|id| Credential::new(*id, "pw")).collect();
            Arc::new(Self(StdMutex::new(Ok(creds))))
        }

        fn set(&self, ids: &[&str]) {
            *self.0.lock().unwrap() = Ok(ids.iter().map(|id| Credential::new(*id, "pw")).collect());
        }

        fn break_store(&self) {
            *self.0.lock().unwrap() = Err(());
        }
    }

    #[async_trait]
    impl CredentialSource for StaticSource {
        async fn load(&self) -> Result<Vec<Credential>, CredentialLoadError> {
            self.0
                .lock()
                .unwrap()
                .clone()
                .map_err(|_| CredentialLoadError::NotFound("accs.txt".into()))
        }
    }

    /// Issues `tok-<account>-<cycle>` except for accounts listed as failing
    #[derive(Default)]
    struct ScriptedIssuer {
        failing: StdMutex<HashSet<String>>,
        cycle: AtomicUsize,
    }

    impl ScriptedIssuer {
        fn fail(&self, ids: &[&str]) {
            let mut failing = self.failing.lock().unwrap();
            failing.clear();
            failing.extend(ids.iter().map(|s| s.to_string()));
        }
    }

    #[async_trait]
    impl TokenIssuer for ScriptedIssuer {
        async fn issue(&self, credential: &Credential) -> Result<Token, IssuanceError> {
            if self.failing.lock().unwrap().contains(&credential.account_id) {
                return Err(IssuanceError::Rejected {
                    account_id: credential.account_id.clone(),
                    status: 401,
                });
            }
            Ok(Token {
                account_id: credential.account_id.clone(),
                value: format!("tok-{}-{}", credential.account_id, self.cycle.load(Ordering::SeqCst)),
                issued_at: Utc::now(),
            })
        }
    }

    fn pool(source: Arc<StaticSource>, issuer: Arc<ScriptedIssuer>) -> TokenPool {
        TokenPool::new(source, issuer)
    }

    #[tokio::test]
    async fn test_uninitialized_pool() {
        let pool = pool(StaticSource::accounts(&[]), Arc::new(ScriptedIssuer::default()));
        assert!(!pool.is_initialized());
        assert!(pool.current_tokens().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_populates_in_store_order() {
        let pool = pool(
            StaticSource::accounts(&["a", "b", "c", "d"]),
            Arc::new(ScriptedIssuer::default()),
        );

        let outcome = pool.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Replaced { issued: 4, failed: 0 }));

        let ids: Vec<_> = pool.current_tokens().into_iter().map(|t| t.account_id).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(pool.snapshot().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_failed_issuance_skipped() {
        let issuer = Arc::new(ScriptedIssuer::default());
        issuer.fail(&["b"]);
        let pool = pool(StaticSource::accounts(&["a", "b", "c"]), Arc::clone(&issuer));

        let outcome = pool.refresh().await;
        assert!(matches!(outcome, RefreshOutcome::Replaced { issued: 2, failed: 1 }));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_issued_keeps_previous_pool() {
        let issuer = Arc::new(ScriptedIssuer::default());
        let pool = pool(StaticSource::accounts(&["a", "b"]), Arc::clone(&issuer));
        pool.refresh().await;
        let before = pool.current_tokens();

        issuer.fail(&["a", "b"]);
        let outcome = pool.refresh().await;

        assert!(matches!(outcome, RefreshOutcome::NothingIssued { failed: 2 }));
        assert_eq!(pool.current_tokens(), before);
        assert_eq!(pool.snapshot().unwrap().generation, 1);
    }

    #[tokio::test]
    async fn test_nothing_issued_before_first_pool() {
        let issuer = Arc::new(ScriptedIssuer::default());
        issuer.fail(&["a"]);
        let pool = pool(StaticSource::accounts(&["a"]), issuer);

        let outcome = pool.refresh().await;
        assert!(!outcome.replaced());
        assert!(!pool.is_initialized());
    }

    #[tokio::test]
    async fn test_credential_store_failure_keeps_pool() {
        let source = StaticSource::accounts(&["a"]);
        let pool = pool(Arc::clone(&source), Arc::new(ScriptedIssuer::default()));
        pool.refresh().await;

        source.break_store();
        let outcome = pool.refresh().await;

        assert!(matches!(outcome, RefreshOutcome::CredentialsUnavailable(_)));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_replaces_wholesale() {
        let source = StaticSource::accounts(&["a", "b"]);
        let issuer = Arc::new(ScriptedIssuer::default());
        let pool = pool(Arc::clone(&source), Arc::clone(&issuer));
        pool.refresh().await;

        source.set(&["c"]);
        issuer.cycle.store(1, Ordering::SeqCst);
        pool.refresh().await;

        let tokens = pool.current_tokens();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].value, "tok-c-1");
        assert_eq!(pool.snapshot().unwrap().generation, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_partial_pool() {
        let ids: Vec<String> = (0..50).map(|i| format!("acct-{}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let source = StaticSource::accounts(&id_refs[..10]);
        let issuer = Arc::new(ScriptedIssuer::default());
        let pool = Arc::new(pool(Arc::clone(&source), issuer));
        pool.refresh().await;

        source.set(&id_refs);
        let reader_pool = Arc::clone(&pool);
        let reader = tokio::spawn(async move {
            for _ in 0..2000 {
                let len = reader_pool.len();
                assert!(len == 10 || len == 50, "observed partial pool of {}", len);
                tokio::task::yield_now().await;
            }
        });

        for _ in 0..5 {
            pool.refresh().await;
        }
        reader.await.unwrap();
        assert_eq!(pool.len(), 50);
    }

    #[tokio::test]
    async fn test_round_robin_cursor() {
        let pool = pool(StaticSource::accounts(&[]), Arc::new(ScriptedIssuer::default()));
        let starts: Vec<_> = (0..5).map(|_| pool.next_start(3)).collect();
        assert_eq!(starts, vec![0, 1, 2, 0, 1]);
        assert_eq!(pool.next_start(0), 0);
    }
}
