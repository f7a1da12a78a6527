//! Lifecycle events and the sinks that receive them.
//!
//! Sinks form an ordered list. `EventBus::notify` runs them in order and
//! stops at the first error, which is returned to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::AuthError;
use crate::models::identity::User;

/// Something that happened to a user.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    UserCreated { user: User },
    FirstLogin { user: User },
    Login { user: User, source: String },
    PasswordReset { user: User },
    NewRegistration { user: User, registration_source: String },
    RegistrationActivated { user: User },
    AuthSensitiveOperation { user: User, operation: String },
}

impl AuthEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthEvent::UserCreated { .. } => "user_created",
            AuthEvent::FirstLogin { .. } => "first_login",
            AuthEvent::Login { .. } => "login",
            AuthEvent::PasswordReset { .. } => "password_reset",
            AuthEvent::NewRegistration { .. } => "new_registration",
            AuthEvent::RegistrationActivated { .. } => "registration_activated",
            AuthEvent::AuthSensitiveOperation { .. } => "auth_sensitive_operation",
        }
    }

    pub fn user(&self) -> &User {
        match self {
            AuthEvent::UserCreated { user }
            | AuthEvent::FirstLogin { user }
            | AuthEvent::Login { user, .. }
            | AuthEvent::PasswordReset { user }
            | AuthEvent::NewRegistration { user, .. }
            | AuthEvent::RegistrationActivated { user }
            | AuthEvent::AuthSensitiveOperation { user, .. } => user,
        }
    }
}

/// Receiver of lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn notify(&self, event: &AuthEvent) -> Result<(), AuthError>;

    /// Sink identifier for logging.
    fn name(&self) -> &str;
}

/// Ordered fan-out to every registered sink.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }

    pub fn empty() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn push(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub async fn notify(&self, event: AuthEvent) -> Result<(), AuthError> {
        for sink in &self.sinks {
            sink.notify(&event).await?;
        }
        Ok(())
    }
}

/// Records every event as a structured tracing event.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn notify(&self, event: &AuthEvent) -> Result<(), AuthError> {
        let user = event.user();
        match event {
            AuthEvent::Login { source, .. } => {
                info!(kind = event.kind(), user_id = user.id, source = %source, "auth event");
            }
            AuthEvent::AuthSensitiveOperation { operation, .. } => {
                info!(kind = event.kind(), user_id = user.id, operation = %operation, "auth event");
            }
            _ => info!(kind = event.kind(), user_id = user.id, "auth event"),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "TracingEventSink"
    }
}

/// Keeps every event it sees. Useful for tests and audit embedding.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: std::sync::Mutex<Vec<AuthEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuthEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Event kinds in arrival order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(AuthEvent::kind).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn notify(&self, event: &AuthEvent) -> Result<(), AuthError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "RecordingEventSink"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::models::identity::UserProfile;

    fn user() -> User {
        User {
            id: 1,
            uuid: Uuid::new_v4(),
            username: Some("user-1".into()),
            email: Some("a@example.com".into()),
            password_hash: None,
            enabled: true,
            created_at: Utc::now(),
            activated_at: None,
            last_login_at: None,
            last_login_ip: None,
            last_auth_sensitive_operation_at: None,
            profile: UserProfile::default(),
        }
    }

    struct Counting(Arc<AtomicU32>);

    #[async_trait]
    impl EventSink for Counting {
        async fn notify(&self, _event: &AuthEvent) -> Result<(), AuthError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "Counting"
        }
    }

    struct Failing;

    #[async_trait]
    impl EventSink for Failing {
        async fn notify(&self, _event: &AuthEvent) -> Result<(), AuthError> {
            Err(AuthError::Dispatch("sink down".into()))
        }

        fn name(&self) -> &str {
            "Failing"
        }
    }

    #[tokio::test]
    async fn bus_delivers_to_every_sink_in_order() {
        let recorder = Arc::new(RecordingEventSink::new());
        let count = Arc::new(AtomicU32::new(0));
        let bus = EventBus::new(vec![
            recorder.clone(),
            Arc::new(Counting(count.clone())),
        ]);

        bus.notify(AuthEvent::UserCreated { user: user() }).await.unwrap();
        bus.notify(AuthEvent::Login {
            user: user(),
            source: "login_form".into(),
        })
        .await
        .unwrap();

        assert_eq!(recorder.kinds(), vec!["user_created", "login"]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(bus.sink_names(), vec!["RecordingEventSink", "Counting"]);
    }

    #[tokio::test]
    async fn bus_stops_at_first_failure() {
        let count = Arc::new(AtomicU32::new(0));
        let bus = EventBus::new(vec![Arc::new(Failing), Arc::new(Counting(count.clone()))]);
        let err = bus
            .notify(AuthEvent::FirstLogin { user: user() })
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Dispatch(_)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_bus_is_a_no_op() {
        EventBus::empty()
            .notify(AuthEvent::PasswordReset { user: user() })
            .await
            .unwrap();
    }
}
