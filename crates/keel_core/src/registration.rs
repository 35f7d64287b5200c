use anyhow::Result;
use chrono::Utc;
use keel_traits::{
    AdvertisedAddress, RegistrationOutcome, RegistrationRecord, RegistrationTarget, Signer,
    ValidatorRegistry,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Tags baked into the signed message. The timestamp sits inside the
/// signed text so the receiving side can bound replay.
const REGISTER_TAG: &str = "REGISTER_VALIDATOR";
const UNREGISTER_TAG: &str = "UNREGISTER_VALIDATOR";

/// Clears the per-target in-flight flag on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Performs the signed, idempotent validator announce against the local
/// node and the bootstrap peers.
///
/// The two targets are a best-effort availability pair, not a quorum:
/// the local write makes the node self-report as a validator even
/// offline, the bootstrap write tells the network. Failure on one is
/// logged and reported in the outcome, never propagated, and never
/// blocks or cancels the other.
///
/// Every attempt signs a fresh record. The targets sit behind
/// transports with very different latencies, so a record shared between
/// them would age on the slow path and risk falling out of the server's
/// replay window.
pub struct RegistrationCoordinator {
    registry: Arc<dyn ValidatorRegistry>,
    signer: Arc<dyn Signer>,
    local_url: String,
    bootstrap_urls: Vec<String>,
    advertised: RwLock<Option<AdvertisedAddress>>,
    local_in_flight: AtomicBool,
    bootstrap_in_flight: AtomicBool,
}

impl RegistrationCoordinator {
    pub fn new(
        registry: Arc<dyn ValidatorRegistry>,
        signer: Arc<dyn Signer>,
        local_url: String,
        bootstrap_urls: Vec<String>,
    ) -> Self {
        Self {
            registry,
            signer,
            local_url,
            bootstrap_urls,
            advertised: RwLock::new(None),
            local_in_flight: AtomicBool::new(false),
            bootstrap_in_flight: AtomicBool::new(false),
        }
    }

    /// Record the address the node publishes, included in every record
    /// signed from now on.
    pub fn set_advertised(&self, address: AdvertisedAddress) {
        *self.advertised.write() = Some(address);
    }

    fn flag(&self, target: RegistrationTarget) -> &AtomicBool {
        match target {
            RegistrationTarget::Local => &self.local_in_flight,
            RegistrationTarget::Bootstrap => &self.bootstrap_in_flight,
        }
    }

    fn target_urls(&self, target: RegistrationTarget) -> Vec<String> {
        match target {
            RegistrationTarget::Local => vec![self.local_url.clone()],
            RegistrationTarget::Bootstrap => self.bootstrap_urls.clone(),
        }
    }

    async fn build_record(&self, tag: &str) -> Result<RegistrationRecord> {
        let address = self.signer.address();
        let timestamp = Utc::now().timestamp().max(0) as u64;
        let message = format!("{}:{}:{}", tag, address, timestamp);
        let signature = self.signer.sign(message.as_bytes()).await?;
        Ok(RegistrationRecord {
            address,
            public_key: self.signer.public_key_hex(),
            signature: hex::encode(signature),
            timestamp,
            advertised_address: self.advertised.read().as_ref().map(|a| a.to_string()),
        })
    }

    /// One best-effort announce toward one target.
    pub async fn register_on_target(&self, target: RegistrationTarget) -> RegistrationOutcome {
        let flag = self.flag(target);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RegistrationOutcome::Skipped(format!(
                "a prior {} registration attempt is still in flight",
                target
            ));
        }
        let _guard = FlightGuard(flag);

        let urls = self.target_urls(target);
        if urls.is_empty() {
            return RegistrationOutcome::Skipped(format!("no {} URL configured", target));
        }

        let address = self.signer.address();
        let mut last_failure = String::new();

        for url in &urls {
            // Read before write keeps the operation idempotent and
            // avoids a redundant signed write.
            match self.registry.is_registered(url, &address).await {
                Ok(true) => {
                    info!("{} target already lists {} as validator", target, address);
                    return RegistrationOutcome::AlreadyRegistered;
                }
                Ok(false) => {
                    let record = match self.build_record(REGISTER_TAG).await {
                        Ok(record) => record,
                        Err(e) => return RegistrationOutcome::Failed(format!("signing failed: {}", e)),
                    };
                    match self.registry.register(url, &record).await {
                        Ok(()) => {
                            info!("registered {} on {} target via {}", address, target, url);
                            return RegistrationOutcome::Registered;
                        }
                        Err(e) => {
                            warn!("{} registration via {} failed: {}", target, url, e);
                            last_failure = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    warn!("{} registry read via {} failed: {}", target, url, e);
                    last_failure = e.to_string();
                }
            }
        }

        RegistrationOutcome::Failed(last_failure)
    }

    /// Voluntary exit, mirroring registration. In the outcome,
    /// AlreadyRegistered reads as "already in the desired state": the
    /// target no longer lists the address.
    pub async fn unregister_on_target(&self, target: RegistrationTarget) -> RegistrationOutcome {
        let flag = self.flag(target);
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RegistrationOutcome::Skipped(format!(
                "a prior {} registration attempt is still in flight",
                target
            ));
        }
        let _guard = FlightGuard(flag);

        let urls = self.target_urls(target);
        if urls.is_empty() {
            return RegistrationOutcome::Skipped(format!("no {} URL configured", target));
        }

        let address = self.signer.address();
        let mut last_failure = String::new();

        for url in &urls {
            match self.registry.is_registered(url, &address).await {
                Ok(false) => {
                    info!("{} target no longer lists {}", target, address);
                    return RegistrationOutcome::AlreadyRegistered;
                }
                Ok(true) => {
                    let record = match self.build_record(UNREGISTER_TAG).await {
                        Ok(record) => record,
                        Err(e) => return RegistrationOutcome::Failed(format!("signing failed: {}", e)),
                    };
                    match self.registry.unregister(url, &record).await {
                        Ok(()) => {
                            info!("unregistered {} on {} target via {}", address, target, url);
                            return RegistrationOutcome::Registered;
                        }
                        Err(e) => {
                            warn!("{} unregistration via {} failed: {}", target, url, e);
                            last_failure = e.to_string();
                        }
                    }
                }
                Err(e) => {
                    warn!("{} registry read via {} failed: {}", target, url, e);
                    last_failure = e.to_string();
                }
            }
        }

        RegistrationOutcome::Failed(last_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct MockSigner {
        sign_calls: AtomicUsize,
        messages: Mutex<Vec<String>>,
    }

    impl MockSigner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sign_calls: AtomicUsize::new(0),
                messages: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Signer for MockSigner {
        fn address(&self) -> String {
            "KEEL1abc".to_string()
        }

        fn public_key_hex(&self) -> String {
            "00ff".to_string()
        }

        async fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
            let n = self.sign_calls.fetch_add(1, Ordering::SeqCst);
            self.messages
                .lock()
                .push(String::from_utf8_lossy(message).into_owned());
            Ok(format!("sig-{}", n).into_bytes())
        }
    }

    #[derive(Default)]
    struct MockRegistry {
        registered: Mutex<HashSet<(String, String)>>,
        failing_urls: Mutex<HashSet<String>>,
        writes: Mutex<Vec<(String, RegistrationRecord)>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockRegistry {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn preregister(&self, url: &str, address: &str) {
            self.registered
                .lock()
                .insert((url.to_string(), address.to_string()));
        }

        fn fail_url(&self, url: &str) {
            self.failing_urls.lock().insert(url.to_string());
        }

        fn heal_url(&self, url: &str) {
            self.failing_urls.lock().remove(url);
        }

        fn write_count(&self) -> usize {
            self.writes.lock().len()
        }
    }

    #[async_trait]
    impl ValidatorRegistry for MockRegistry {
        async fn is_registered(&self, base_url: &str, address: &str) -> Result<bool> {
            let delay = *self.delay.lock();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if self.failing_urls.lock().contains(base_url) {
                anyhow::bail!("connection refused");
            }
            Ok(self
                .registered
                .lock()
                .contains(&(base_url.to_string(), address.to_string())))
        }

        async fn register(&self, base_url: &str, record: &RegistrationRecord) -> Result<()> {
            if self.failing_urls.lock().contains(base_url) {
                anyhow::bail!("connection refused");
            }
            self.registered
                .lock()
                .insert((base_url.to_string(), record.address.clone()));
            self.writes
                .lock()
                .push((base_url.to_string(), record.clone()));
            Ok(())
        }

        async fn unregister(&self, base_url: &str, record: &RegistrationRecord) -> Result<()> {
            if self.failing_urls.lock().contains(base_url) {
                anyhow::bail!("connection refused");
            }
            self.registered
                .lock()
                .remove(&(base_url.to_string(), record.address.clone()));
            self.writes
                .lock()
                .push((base_url.to_string(), record.clone()));
            Ok(())
        }
    }

    fn coordinator(registry: Arc<MockRegistry>, signer: Arc<MockSigner>) -> RegistrationCoordinator {
        RegistrationCoordinator::new(
            registry,
            signer,
            "http://local:3030".to_string(),
            vec!["http://boot:3030".to_string()],
        )
    }

    #[tokio::test]
    async fn read_before_write_keeps_registration_idempotent() {
        let registry = MockRegistry::new();
        let signer = MockSigner::new();
        registry.preregister("http://local:3030", "KEEL1abc");

        let coord = coordinator(registry.clone(), signer.clone());
        let outcome = coord.register_on_target(RegistrationTarget::Local).await;

        assert_eq!(outcome, RegistrationOutcome::AlreadyRegistered);
        assert_eq!(registry.write_count(), 0);
        assert_eq!(signer.sign_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn registers_with_signed_template_message() {
        let registry = MockRegistry::new();
        let signer = MockSigner::new();
        let coord = coordinator(registry.clone(), signer.clone());
        coord.set_advertised(AdvertisedAddress::Onion("abc.onion".to_string()));

        let outcome = coord.register_on_target(RegistrationTarget::Local).await;
        assert_eq!(outcome, RegistrationOutcome::Registered);

        let writes = registry.writes.lock();
        let (url, record) = &writes[0];
        assert_eq!(url, "http://local:3030");
        assert_eq!(record.address, "KEEL1abc");
        assert_eq!(record.public_key, "00ff");
        assert_eq!(record.advertised_address.as_deref(), Some("abc.onion"));
        assert!(record.timestamp > 0);

        let messages = signer.messages.lock();
        assert!(messages[0].starts_with("REGISTER_VALIDATOR:KEEL1abc:"));
        assert!(messages[0].ends_with(&record.timestamp.to_string()));
    }

    #[tokio::test]
    async fn each_attempt_signs_a_fresh_record() {
        let registry = MockRegistry::new();
        let signer = MockSigner::new();
        let coord = coordinator(registry.clone(), signer.clone());

        coord.register_on_target(RegistrationTarget::Local).await;
        coord.register_on_target(RegistrationTarget::Bootstrap).await;

        // One signature per attempt, never reused across targets.
        assert_eq!(signer.sign_calls.load(Ordering::SeqCst), 2);
        let writes = registry.writes.lock();
        assert_ne!(writes[0].1.signature, writes[1].1.signature);
    }

    #[tokio::test]
    async fn concurrent_attempts_to_one_target_are_collapsed() {
        let registry = MockRegistry::new();
        *registry.delay.lock() = Some(Duration::from_millis(100));
        let signer = MockSigner::new();
        let coord = Arc::new(coordinator(registry.clone(), signer));

        let a = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.register_on_target(RegistrationTarget::Local).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let b = coord.register_on_target(RegistrationTarget::Local).await;
        let a = a.await.unwrap();

        assert!(matches!(b, RegistrationOutcome::Skipped(_)));
        assert_eq!(a, RegistrationOutcome::Registered);
        assert_eq!(registry.write_count(), 1);
    }

    #[tokio::test]
    async fn target_failures_are_independent() {
        let registry = MockRegistry::new();
        let signer = MockSigner::new();
        registry.fail_url("http://boot:3030");

        let coord = coordinator(registry.clone(), signer);

        let local = coord.register_on_target(RegistrationTarget::Local).await;
        let boot = coord.register_on_target(RegistrationTarget::Bootstrap).await;
        assert_eq!(local, RegistrationOutcome::Registered);
        assert!(matches!(boot, RegistrationOutcome::Failed(_)));

        // A later retry succeeds on bootstrap without a second local
        // write.
        registry.heal_url("http://boot:3030");
        let boot = coord.register_on_target(RegistrationTarget::Bootstrap).await;
        assert_eq!(boot, RegistrationOutcome::Registered);
        let local = coord.register_on_target(RegistrationTarget::Local).await;
        assert_eq!(local, RegistrationOutcome::AlreadyRegistered);
        assert_eq!(registry.write_count(), 2);
    }

    #[tokio::test]
    async fn unregister_mirrors_registration() {
        let registry = MockRegistry::new();
        let signer = MockSigner::new();
        let coord = coordinator(registry.clone(), signer.clone());

        // Not registered yet: already in the desired state.
        let outcome = coord.unregister_on_target(RegistrationTarget::Local).await;
        assert_eq!(outcome, RegistrationOutcome::AlreadyRegistered);

        coord.register_on_target(RegistrationTarget::Local).await;
        let outcome = coord.unregister_on_target(RegistrationTarget::Local).await;
        assert_eq!(outcome, RegistrationOutcome::Registered);

        let messages = signer.messages.lock();
        assert!(messages
            .last()
            .unwrap()
            .starts_with("UNREGISTER_VALIDATOR:KEEL1abc:"));
    }
}
