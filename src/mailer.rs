//! Outbound mail client
//!
//! Minimal asynchronous SMTP submission towards one configured MTA. This is
//! deliberately not a full MTA conversation: no TLS, no authentication, no
//! pipelining. The server relies on a local or trusted relay, and every mail
//! this process sends (maintenance reports, command notifications) is
//! best effort.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Dial deadline towards the MTA
const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Whole-conversation deadline for one submission
const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Subject prefix carried by all mails this process originates
pub const OUTGOING_SUBJECT_KEYWORD: &str = "toolhost";

/// SMTP submission client
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MailClient {
    /// Relay host
    #[serde(rename = "MTAHost", default)]
    pub mta_host: String,

    /// Relay port, conventionally 25
    #[serde(rename = "MTAPort", default)]
    pub mta_port: u16,

    /// Envelope and header sender address
    #[serde(rename = "MailFrom", default)]
    pub mail_from: String,
}

impl MailClient {
    /// Create a client
    #[must_use]
    pub fn new(host: &str, port: u16, from: &str) -> Self {
        Self {
            mta_host: host.to_string(),
            mta_port: port,
            mail_from: from.to_string(),
        }
    }

    /// True when host, port and sender are all present
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.mta_host.is_empty() && self.mta_port != 0 && !self.mail_from.is_empty()
    }

    /// Submit one mail to every recipient.
    ///
    /// A missing configuration or an empty recipient list is a no-op, not an
    /// error. The whole conversation is bounded by [`SEND_TIMEOUT`].
    pub async fn send(&self, subject: &str, body: &str, recipients: &[String]) -> io::Result<()> {
        if !self.is_configured() || recipients.is_empty() {
            return Ok(());
        }
        tokio::time::timeout(SEND_TIMEOUT, self.submit(subject, body, recipients))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "SMTP conversation timed out"))?
    }

    /// Verify the MTA is reachable and greets properly.
    pub async fn self_test(&self) -> io::Result<()> {
        if !self.is_configured() {
            return Ok(());
        }
        let stream = self.dial().await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        expect_reply(&mut reader, "220").await?;
        write_half.write_all(b"QUIT\r\n").await?;
        Ok(())
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        tokio::time::timeout(
            DIAL_TIMEOUT,
            TcpStream::connect((self.mta_host.as_str(), self.mta_port)),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "MTA dial timed out"))?
    }

    async fn submit(&self, subject: &str, body: &str, recipients: &[String]) -> io::Result<()> {
        let stream = self.dial().await?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        expect_reply(&mut reader, "220").await?;
        command(&mut writer, &mut reader, "EHLO toolhost", "250").await?;
        command(
            &mut writer,
            &mut reader,
            &format!("MAIL FROM:<{}>", self.mail_from),
            "250",
        )
        .await?;
        for recipient in recipients {
            command(
                &mut writer,
                &mut reader,
                &format!("RCPT TO:<{recipient}>"),
                "25",
            )
            .await?;
        }
        command(&mut writer, &mut reader, "DATA", "354").await?;

        let mut message = String::new();
        message.push_str(&format!("From: {}\r\n", self.mail_from));
        message.push_str(&format!("To: {}\r\n", recipients.join(", ")));
        message.push_str(&format!("Subject: {OUTGOING_SUBJECT_KEYWORD}-{subject}\r\n"));
        message.push_str("\r\n");
        for line in body.lines() {
            // Dot stuffing so a body line of "." cannot end the DATA phase
            if line.starts_with('.') {
                message.push('.');
            }
            message.push_str(line);
            message.push_str("\r\n");
        }
        message.push_str(".\r\n");
        writer.write_all(message.as_bytes()).await?;
        expect_reply(&mut reader, "250").await?;

        writer.write_all(b"QUIT\r\n").await?;
        debug!(recipients = recipients.len(), subject, "mail submitted");
        Ok(())
    }
}

async fn command(
    writer: &mut OwnedWriteHalf,
    reader: &mut BufReader<OwnedReadHalf>,
    line: &str,
    expect: &str,
) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    expect_reply(reader, expect).await
}

/// Read one possibly multi-line SMTP reply and check its code prefix.
async fn expect_reply(
    reader: &mut BufReader<OwnedReadHalf>,
    expect: &str,
) -> io::Result<()> {
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "MTA closed the connection mid-reply",
            ));
        }
        let line = line.trim_end();
        if !line.starts_with(expect) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("MTA replied {line:?}, expected {expect}xx"),
            ));
        }
        // "250-EXTENSION" continues the reply, "250 ok" ends it
        if line.as_bytes().get(3) != Some(&b'-') {
            return Ok(());
        }
    }
}
