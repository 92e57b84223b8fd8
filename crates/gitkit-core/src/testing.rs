//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::auth::{
    AuthError, Handshake, IdentityProvider, MemoryStore, Navigator, Principal, ProviderCredential,
    SessionManager,
};
use crate::notify::{Notice, Notifier};

pub(crate) fn principal(uid: &str) -> Principal {
    Principal {
        uid: uid.to_string(),
        display_name: Some("Octo Cat".to_string()),
        avatar_url: None,
        email: Some("octo@example.com".to_string()),
    }
}

pub(crate) fn handshake(uid: &str, identity_token: &str, access_token: Option<&str>) -> Handshake {
    Handshake {
        principal: principal(uid),
        identity_token: identity_token.to_string(),
        credential: ProviderCredential {
            provider_id: "github.com".to_string(),
            access_token: access_token.map(str::to_string),
            scopes: vec!["repo".to_string()],
        },
    }
}

/// Lets a test hold a scripted sign-in open.
#[derive(Clone, Default)]
pub(crate) struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub(crate) struct MockProvider {
    principal: watch::Sender<Option<Principal>>,
    sign_in_results: Mutex<VecDeque<Result<Handshake, AuthError>>>,
    mint_result: Mutex<Result<String, AuthError>>,
    gate: Option<Gate>,
    mint_gate: Option<Gate>,
    sign_in_calls: AtomicUsize,
    mint_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        let (principal, _) = watch::channel(None);
        Self {
            principal,
            sign_in_results: Mutex::new(VecDeque::new()),
            mint_result: Mutex::new(Ok("minted".to_string())),
            gate: None,
            mint_gate: None,
            sign_in_calls: AtomicUsize::new(0),
            mint_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_principal(principal: Principal) -> Self {
        let provider = Self::new();
        provider.principal.send_replace(Some(principal));
        provider
    }

    pub fn gated(mut self) -> (Self, Gate) {
        let gate = Gate::default();
        self.gate = Some(gate.clone());
        (self, gate)
    }

    /// Holds every mint open until released. The scripted result is read
    /// after release, so it can be changed while the mint is pending.
    pub fn gated_mint(mut self) -> (Self, Gate) {
        let gate = Gate::default();
        self.mint_gate = Some(gate.clone());
        (self, gate)
    }

    pub fn push_sign_in(&self, result: Result<Handshake, AuthError>) {
        self.sign_in_results.lock().unwrap().push_back(result);
    }

    pub fn set_mint(&self, result: Result<String, AuthError>) {
        *self.mint_result.lock().unwrap() = result;
    }

    pub fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub fn mint_calls(&self) -> usize {
        self.mint_calls.load(Ordering::SeqCst)
    }

    pub fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for MockProvider {
    async fn sign_in(&self, _scopes: &[String]) -> Result<Handshake, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        let result = self
            .sign_in_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AuthError::Provider("no scripted sign-in".to_string())));
        if let Ok(handshake) = &result {
            self.principal.send_replace(Some(handshake.principal.clone()));
        }
        result
    }

    fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.principal.subscribe()
    }

    async fn mint_identity_token(
        &self,
        _principal: &Principal,
        _force_refresh: bool,
    ) -> Result<String, AuthError> {
        self.mint_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.mint_gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        self.mint_result.lock().unwrap().clone()
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.principal.send_replace(None);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNavigator {
    count: AtomicUsize,
}

impl RecordingNavigator {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Navigator for RecordingNavigator {
    fn navigate_to_entry(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.message.clone())
            .collect()
    }

    pub fn last(&self) -> Option<Notice> {
        self.notices.lock().unwrap().last().cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

/// A session manager wired to in-memory collaborators.
pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MockProvider>,
    pub navigator: Arc<RecordingNavigator>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: Arc<SessionManager>,
}

impl Harness {
    pub fn new(provider: MockProvider) -> Self {
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(provider);
        let navigator = Arc::new(RecordingNavigator::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            provider.clone(),
            navigator.clone(),
            notifier.clone(),
        ));
        Self {
            store,
            provider,
            navigator,
            notifier,
            manager,
        }
    }
}
