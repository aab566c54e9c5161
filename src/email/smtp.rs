//! Mail transport seam and a plain SMTP client behind it.

use std::io;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, instrument};

/// Credentials for `AUTH PLAIN`. An empty username skips authentication.
#[derive(Clone, Default)]
pub struct SmtpAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for SmtpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Errors raised while handing a message to the mail server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to mail server {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("mail server I/O error: {0}")]
    Io(#[from] io::Error),

    /// A command argument would have split into several protocol lines.
    #[error("refusing to send {command}: line break in argument")]
    LineBreak { command: &'static str },

    /// The server answered a command with an unexpected reply code.
    #[error("mail server rejected {command}: {code} {message}")]
    Rejected {
        command: &'static str,
        code: u16,
        message: String,
    },
}

/// Sends a fully built message. Implementations do not retry.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_mail(
        &self,
        server_addr: &str,
        auth: &SmtpAuth,
        from: &str,
        to: &[String],
        message: &[u8],
    ) -> Result<(), TransportError>;
}

/// Plaintext SMTP over TCP. No STARTTLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmtpTransport;

struct Conversation {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conversation {
    /// Reads one (possibly multi-line) reply and checks its code.
    async fn expect(&mut self, command: &'static str, ok: &[u16]) -> Result<(), TransportError> {
        let mut text = String::new();
        let code = loop {
            let mut line = String::new();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "mail server closed the connection",
                )));
            }
            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| TransportError::Rejected {
                    command,
                    code: 0,
                    message: line.to_string(),
                })?;
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(line.get(4..).unwrap_or_default());
            if line.as_bytes().get(3) != Some(&b'-') {
                break code;
            }
        };

        if ok.contains(&code) {
            debug!(command, code, "smtp reply");
            Ok(())
        } else {
            Err(TransportError::Rejected {
                command,
                code,
                message: text,
            })
        }
    }

    async fn command(
        &mut self,
        command: &'static str,
        line: &str,
        ok: &[u16],
    ) -> Result<(), TransportError> {
        if line.contains(['\r', '\n']) {
            return Err(TransportError::LineBreak { command });
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.expect(command, ok).await
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    #[instrument(skip(self, auth, message), fields(bytes = message.len()))]
    async fn send_mail(
        &self,
        server_addr: &str,
        auth: &SmtpAuth,
        from: &str,
        to: &[String],
        message: &[u8],
    ) -> Result<(), TransportError> {
        let stream =
            TcpStream::connect(server_addr)
                .await
                .map_err(|source| TransportError::Connect {
                    addr: server_addr.to_string(),
                    source,
                })?;
        let (read_half, writer) = stream.into_split();
        let mut conv = Conversation {
            reader: BufReader::new(read_half),
            writer,
        };

        conv.expect("greeting", &[220]).await?;
        conv.command("EHLO", "EHLO bookrelay", &[250]).await?;
        if !auth.username.is_empty() {
            let token = BASE64_STANDARD.encode(format!("\0{}\0{}", auth.username, auth.password));
            conv.command("AUTH", &format!("AUTH PLAIN {token}"), &[235])
                .await?;
        }
        conv.command("MAIL FROM", &format!("MAIL FROM:<{from}>"), &[250])
            .await?;
        for rcpt in to {
            conv.command("RCPT TO", &format!("RCPT TO:<{rcpt}>"), &[250, 251])
                .await?;
        }
        conv.command("DATA", "DATA", &[354]).await?;
        conv.writer.write_all(&dot_stuff(message)).await?;
        conv.writer.write_all(b"\r\n.\r\n").await?;
        conv.expect("message body", &[250]).await?;
        // The message is accepted at this point; a failed QUIT changes nothing.
        let _ = conv.command("QUIT", "QUIT", &[221]).await;
        Ok(())
    }
}

/// Doubles any `.` that starts a line, so the body cannot end the DATA section early.
#[must_use]
pub fn dot_stuff(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 16);
    let mut line_start = true;
    for &b in message {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n';
    }
    // Strip a trailing CRLF; the terminator adds its own.
    if out.ends_with(b"\r\n") {
        out.truncate(out.len() - 2);
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_dot_stuff_leading_dots() {
        assert_eq!(dot_stuff(b".hidden\r\nok\r\n.\r\n"), b"..hidden\r\nok\r\n..");
        assert_eq!(dot_stuff(b"a.b\r\n"), b"a.b");
        assert_eq!(dot_stuff(b""), b"");
    }

    #[test]
    fn test_auth_debug_redacts_password() {
        let auth = SmtpAuth {
            username: "me".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    /// Scripted server: replies to each command and records what it saw.
    async fn fake_server(listener: TcpListener, rcpt_code: &'static str) -> Vec<String> {
        let (socket, _) = listener.accept().await.unwrap();
        let (read_half, mut writer) = socket.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut seen = Vec::new();

        writer.write_all(b"220 test ready\r\n").await.unwrap();
        while let Some(line) = lines.next_line().await.unwrap() {
            seen.push(line.clone());
            let reply: &[u8] = if line.starts_with("EHLO") {
                b"250-test\r\n250 AUTH PLAIN\r\n"
            } else if line.starts_with("AUTH") {
                b"235 ok\r\n"
            } else if line.starts_with("MAIL") {
                b"250 ok\r\n"
            } else if line.starts_with("RCPT") {
                if rcpt_code == "250" { b"250 ok\r\n" } else { b"550 no such user\r\n" }
            } else if line == "DATA" {
                b"354 go\r\n"
            } else if line == "." {
                b"250 queued\r\n"
            } else if line == "QUIT" {
                writer.write_all(b"221 bye\r\n").await.unwrap();
                break;
            } else {
                continue;
            };
            writer.write_all(reply).await.unwrap();
        }
        seen
    }

    #[tokio::test]
    async fn test_send_mail_full_dialogue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_server(listener, "250"));

        let auth = SmtpAuth {
            username: "user".to_string(),
            password: "pass".to_string(),
        };
        SmtpTransport
            .send_mail(
                &addr,
                &auth,
                "relay@example.com",
                &["reader@kindle.com".to_string()],
                b"Subject: hi\r\n\r\n.starts with dot\r\n",
            )
            .await
            .unwrap();

        let seen = server.await.unwrap();
        assert_eq!(seen[0], "EHLO bookrelay");
        assert_eq!(
            seen[1],
            format!("AUTH PLAIN {}", BASE64_STANDARD.encode("\0user\0pass"))
        );
        assert_eq!(seen[2], "MAIL FROM:<relay@example.com>");
        assert_eq!(seen[3], "RCPT TO:<reader@kindle.com>");
        assert_eq!(seen[4], "DATA");
        assert!(seen.contains(&"..starts with dot".to_string()));
        assert_eq!(seen.last().unwrap(), "QUIT");
    }

    #[tokio::test]
    async fn test_recipient_with_line_break_is_never_sent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(fake_server(listener, "250"));

        let err = SmtpTransport
            .send_mail(
                &addr,
                &SmtpAuth::default(),
                "relay@example.com",
                &["me@kindle.com>\r\nRCPT TO:<attacker@evil.example".to_string()],
                b"body",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::LineBreak { command: "RCPT TO" }));

        let seen = server.await.unwrap();
        assert_eq!(seen, vec!["EHLO bookrelay", "MAIL FROM:<relay@example.com>"]);
    }

    #[tokio::test]
    async fn test_rejected_recipient_surfaces_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(fake_server(listener, "550"));

        let err = SmtpTransport
            .send_mail(
                &addr,
                &SmtpAuth::default(),
                "relay@example.com",
                &["nobody@kindle.com".to_string()],
                b"body",
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected { command: "RCPT TO", code: 550, .. }
        ));
        assert!(err.to_string().contains("no such user"));
    }
}
