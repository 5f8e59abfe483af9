//! Periodic certificate maintenance
//!
//! Runs every orchestrator once per pass, concurrently, and sleeps between
//! passes. A fatal error from any orchestrator or a shutdown request stops the
//! scheduler after a best-effort deregistration of every certificate;
//! everything else is logged and retried on the next pass.

use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::error::LifecycleError;
use crate::orchestrator::{Orchestrator, RunReport};

/// Default pass interval (24 hours)
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Minimum pass interval (1 hour)
const MIN_INTERVAL: Duration = Duration::from_secs(3600);

/// Run a single pass or keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Once,
    Every(Duration),
}

/// Why the scheduler stopped with an error
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("certificate '{certificate}' failed fatally: {source}")]
    Fatal {
        certificate: String,
        #[source]
        source: LifecycleError,
    },

    #[error("{failed} of {total} certificate(s) failed")]
    Failed { failed: usize, total: usize },
}

/// Result of one pass over every orchestrator
#[derive(Debug, Default)]
pub struct PassSummary {
    pub reports: Vec<(String, RunReport)>,
    pub failures: Vec<(String, LifecycleError)>,
}

impl PassSummary {
    /// First failure that must stop the process
    fn take_fatal(&mut self) -> Option<(String, LifecycleError)> {
        let index = self.failures.iter().position(|(_, e)| !e.is_retryable())?;
        Some(self.failures.swap_remove(index))
    }
}

/// Drives a set of orchestrators
#[derive(Debug)]
pub struct RenewalScheduler {
    orchestrators: Vec<Orchestrator>,
    mode: ScheduleMode,
}

impl RenewalScheduler {
    pub fn new(orchestrators: Vec<Orchestrator>) -> Self {
        Self {
            orchestrators,
            mode: ScheduleMode::Every(DEFAULT_INTERVAL),
        }
    }

    /// Run one pass and stop
    pub fn once(mut self) -> Self {
        self.mode = ScheduleMode::Once;
        self
    }

    /// Set the pass interval, clamped to at least one hour
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.mode = ScheduleMode::Every(interval.max(MIN_INTERVAL));
        self
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Run every orchestrator once, concurrently
    pub async fn run_pass(&mut self) -> PassSummary {
        let runs = self.orchestrators.iter_mut().map(|orchestrator| {
            let name = orchestrator.name().to_string();
            let span = info_span!("certificate", name = %name);
            async move { (name, orchestrator.run().await) }.instrument(span)
        });

        let mut summary = PassSummary::default();
        for (name, result) in join_all(runs).await {
            match result {
                Ok(report) => {
                    info!(
                        certificate = %name,
                        action = %report.action,
                        not_after = %report.not_after,
                        notifier_errors = report.notifier_errors.len(),
                        "Certificate pass finished"
                    );
                    summary.reports.push((name, report));
                }
                Err(e) => {
                    error!(
                        certificate = %name,
                        kind = %e.kind(),
                        error = %e,
                        "Certificate pass failed"
                    );
                    summary.failures.push((name, e));
                }
            }
        }
        summary
    }

    /// Best-effort removal of every certificate from the registry
    pub async fn deregister_all(&self) {
        let results = join_all(self.orchestrators.iter().map(|o| async move {
            (o.name().to_string(), o.deregister().await)
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                warn!(certificate = %name, error = %e, "Deregistration failed");
            }
        }
    }

    /// Run until done, a fatal error, or `shutdown` resolves
    ///
    /// `shutdown` is only observed between passes.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), SchedulerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(
            certificates = self.orchestrators.len(),
            mode = ?self.mode,
            "Starting certificate scheduler"
        );

        loop {
            let mut summary = self.run_pass().await;

            if let Some((certificate, source)) = summary.take_fatal() {
                error!(certificate = %certificate, error = %source, "Fatal error, deregistering and stopping");
                self.deregister_all().await;
                return Err(SchedulerError::Fatal {
                    certificate,
                    source,
                });
            }

            let interval = match self.mode {
                ScheduleMode::Once => {
                    if summary.failures.is_empty() {
                        return Ok(());
                    }
                    return Err(SchedulerError::Failed {
                        failed: summary.failures.len(),
                        total: self.orchestrators.len(),
                    });
                }
                ScheduleMode::Every(interval) => interval,
            };

            debug!(next_in_secs = interval.as_secs(), "Waiting for next pass");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => {
                    info!("Shutdown requested, deregistering certificates");
                    self.deregister_all().await;
                    return Ok(());
                }
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => debug!("Received SIGINT"),
        _ = terminate => debug!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::ca::{AccountIdentity, CaConnector, CertificateAuthority};
    use crate::cert::{Certificate, CertificateBundle};
    use crate::domains::DomainSet;
    use crate::error::{CaError, NotifierError};
    use crate::key::{KeyAlgorithm, PrivateKey};
    use crate::registry::Notifier;
    use crate::storage::{CertStore, KeyStore, MemoryStore};
    use crate::test_support::{issue_cert, CertSpec};

    struct Offline;

    #[async_trait]
    impl CaConnector for Offline {
        async fn connect(
            &self,
            _identity: &AccountIdentity,
        ) -> Result<Arc<dyn CertificateAuthority>, CaError> {
            Err(CaError::Protocol("offline".to_string()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, String)>>,
    }

    impl Recorder {
        fn record(&self, event: &'static str, leaf: &Certificate) -> Result<(), NotifierError> {
            self.events.lock().push((event, leaf.fingerprint().to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify_certs_available(&self, leaf: &Certificate) -> Result<(), NotifierError> {
            self.record("available", leaf)
        }

        async fn notify_certs_unavailable(&self, leaf: &Certificate) -> Result<(), NotifierError> {
            self.record("unavailable", leaf)
        }

        async fn notify_certs_renewed(&self, leaf: &Certificate) -> Result<(), NotifierError> {
            self.record("renewed", leaf)
        }

        async fn deregister(&self, leaf: &Certificate) -> Result<(), NotifierError> {
            self.record("deregister", leaf)
        }
    }

    /// Orchestrator whose stored certificate is fresh, so a pass needs no CA
    fn fresh_orchestrator(name: &str, notifier: Arc<Recorder>) -> (Orchestrator, Certificate) {
        let leaf = issue_cert(CertSpec::valid_for_days(60).names(&[name]));
        let certs = MemoryStore::new();
        certs
            .save_certs(&CertificateBundle::from_parts(leaf.clone(), Vec::new()))
            .unwrap();
        let domain_keys = MemoryStore::new();
        domain_keys
            .save_key(&PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap())
            .unwrap();

        let orchestrator = Orchestrator::builder()
            .email("admin@example.com")
            .domains(DomainSet::new([name]).unwrap())
            .account_key_store(Box::new(MemoryStore::with_key(
                PrivateKey::generate(KeyAlgorithm::EcdsaP256).unwrap(),
            )))
            .domain_key_store(Box::new(domain_keys))
            .cert_store(Box::new(certs))
            .connector(Arc::new(Offline))
            .notifier(notifier)
            .build()
            .unwrap();
        (orchestrator, leaf)
    }

    #[test]
    fn test_interval_is_clamped() {
        let scheduler = RenewalScheduler::new(Vec::new()).with_interval(Duration::from_secs(60));
        assert_eq!(scheduler.mode(), ScheduleMode::Every(MIN_INTERVAL));

        let scheduler = RenewalScheduler::new(Vec::new()).with_interval(Duration::from_secs(7200));
        assert_eq!(scheduler.mode(), ScheduleMode::Every(Duration::from_secs(7200)));
    }

    #[tokio::test]
    async fn test_empty_once_succeeds() {
        let scheduler = RenewalScheduler::new(Vec::new()).once();
        scheduler.run(std::future::pending()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_between_passes() {
        let scheduler = RenewalScheduler::new(Vec::new());
        scheduler.run(async {}).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deregisters_every_certificate() {
        let notifier = Arc::new(Recorder::default());
        let (first, first_leaf) = fresh_orchestrator("a.example.com", notifier.clone());
        let (second, second_leaf) = fresh_orchestrator("b.example.com", notifier.clone());

        RenewalScheduler::new(vec![first, second])
            .run(async {})
            .await
            .unwrap();

        let events = notifier.events.lock().clone();
        for leaf in [&first_leaf, &second_leaf] {
            let fingerprint = leaf.fingerprint().to_string();
            assert!(events.contains(&("available", fingerprint.clone())));
            assert!(events.contains(&("deregister", fingerprint)));
        }
        let deregistrations = events.iter().filter(|(e, _)| *e == "deregister").count();
        assert_eq!(deregistrations, 2);
    }
}
