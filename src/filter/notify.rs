//! Command mirroring via email
//!
//! When configured with recipients, every executed command and its response
//! is mirrored to the recipient list on a detached task. The pipeline never
//! waits for delivery and never fails because delivery failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::mailer::MailClient;

/// Response excerpt length carried in notification mails
const NOTIFY_RESPONSE_CAP: usize = 2048;

/// Fire-and-forget command notification
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NotifyViaEmail {
    /// Recipients of the mirror mail; empty disables the stage
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<String>,
}

impl NotifyViaEmail {
    /// True when the stage has somewhere to deliver to
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.recipients.is_empty()
    }

    /// Mirror one executed command on a detached task.
    pub fn send(&self, mailer: &Arc<MailClient>, trigger: &str, argument: &str, response: &str) {
        if !self.is_configured() || !mailer.is_configured() {
            return;
        }
        let mailer = Arc::clone(mailer);
        let recipients = self.recipients.clone();
        let subject = format!("toolhost command {trigger}");
        let mut excerpt = response.to_string();
        if excerpt.len() > NOTIFY_RESPONSE_CAP {
            let mut cut = NOTIFY_RESPONSE_CAP;
            while !excerpt.is_char_boundary(cut) {
                cut -= 1;
            }
            excerpt.truncate(cut);
        }
        let body = format!("{trigger} {argument}\n\n{excerpt}");
        tokio::spawn(async move {
            if let Err(err) = mailer.send(&subject, &body, &recipients).await {
                warn!(error = %err, "command notification mail failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unconfigured_without_recipients() {
        assert!(!NotifyViaEmail::default().is_configured());
        let n = NotifyViaEmail {
            recipients: vec!["ops@localhost".into()],
        };
        assert!(n.is_configured());
    }

    #[tokio::test]
    async fn test_send_never_blocks_on_unreachable_mta() {
        // MTA points at a closed port; send must return immediately and the
        // failure stays on the detached task.
        let mailer = Arc::new(MailClient::new("127.0.0.1", 1, "toolhost@localhost"));
        let notify = NotifyViaEmail {
            recipients: vec!["ops@localhost".into()],
        };
        let started = std::time::Instant::now();
        notify.send(&mailer, ".s", "date", "Mon Jan 1");
        assert!(started.elapsed() < std::time::Duration::from_millis(50));
    }
}
