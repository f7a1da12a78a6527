//! Outbound mail boundary.
//!
//! Template rendering and transport live outside this crate; the services
//! only hand over a recipient, a template id and a JSON context.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use super::AuthError;

/// Template sent after e-mail sign-up.
pub const TEMPLATE_ACTIVATE: &str = "login/email/activate";

/// Template sent for a password reset request.
pub const TEMPLATE_FORGOT_PASSWORD: &str = "login/email/forgot_password";

#[async_trait]
pub trait MailDispatcher: Send + Sync {
    async fn send(&self, to: &str, template_id: &str, context: Value) -> Result<(), AuthError>;
}

/// Writes each message to the log instead of sending it. Used by the CLI
/// so operators can copy links during setup.
#[derive(Debug, Default)]
pub struct TracingMailDispatcher;

#[async_trait]
impl MailDispatcher for TracingMailDispatcher {
    async fn send(&self, to: &str, template_id: &str, context: Value) -> Result<(), AuthError> {
        info!(to, template_id, context = %context, "mail dispatched");
        Ok(())
    }
}

/// A message captured by [`OutboxMailDispatcher`].
#[derive(Debug, Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub template_id: String,
    pub context: Value,
}

/// Keeps messages in memory.
#[derive(Debug, Default)]
pub struct OutboxMailDispatcher {
    sent: std::sync::Mutex<Vec<OutgoingMail>>,
}

impl OutboxMailDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutgoingMail> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn last(&self) -> Option<OutgoingMail> {
        self.sent().pop()
    }
}

#[async_trait]
impl MailDispatcher for OutboxMailDispatcher {
    async fn send(&self, to: &str, template_id: &str, context: Value) -> Result<(), AuthError> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(OutgoingMail {
                to: to.to_string(),
                template_id: template_id.to_string(),
                context,
            });
        Ok(())
    }
}

/// `<base>/<code>`, tolerating a trailing slash on `base`.
pub fn code_link(base: &str, code: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), code)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn code_link_joins_with_single_slash() {
        assert_eq!(code_link("https://x/activate/", "abc"), "https://x/activate/abc");
        assert_eq!(code_link("https://x/activate", "abc"), "https://x/activate/abc");
    }

    #[tokio::test]
    async fn outbox_keeps_messages() {
        let outbox = OutboxMailDispatcher::new();
        outbox
            .send("a@example.com", TEMPLATE_ACTIVATE, json!({"link": "l"}))
            .await
            .unwrap();
        let last = outbox.last().unwrap();
        assert_eq!(last.to, "a@example.com");
        assert_eq!(last.template_id, TEMPLATE_ACTIVATE);
        assert_eq!(last.context["link"], "l");
    }
}
