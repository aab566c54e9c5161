//! Multipart message construction for book attachments.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

/// Fixed multipart boundary. Base64 output can never contain `-`, so the
/// token cannot collide with attachment content.
pub const MIME_BOUNDARY: &str = "bookrelay-boundary-12345";

/// Maximum length of an encoded attachment line.
pub const BASE64_LINE_WIDTH: usize = 76;

/// A single outgoing message: plain-text body plus one attachment.
#[derive(Debug, Clone)]
pub struct MailEnvelope<'a> {
    pub to: &'a str,
    pub from: &'a str,
    pub title: &'a str,
    pub author: &'a str,
    pub attachment: &'a [u8],
    pub filename: &'a str,
}

impl MailEnvelope<'_> {
    #[must_use]
    pub fn subject(&self) -> String {
        header_value(&format!("Book: {} by {}", self.title, self.author))
    }

    /// Renders the full RFC 5322 message with CRLF line endings.
    #[must_use]
    pub fn to_message(&self) -> String {
        let encoded = BASE64_STANDARD.encode(self.attachment);
        let mut out = String::with_capacity(encoded.len() + encoded.len() / 38 + 512);

        out.push_str(&format!("To: {}\r\n", header_value(self.to)));
        out.push_str(&format!("From: {}\r\n", header_value(self.from)));
        out.push_str(&format!("Subject: {}\r\n", self.subject()));
        out.push_str("MIME-Version: 1.0\r\n");
        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary={MIME_BOUNDARY}\r\n"
        ));
        out.push_str("\r\n");

        out.push_str(&format!("--{MIME_BOUNDARY}\r\n"));
        out.push_str("Content-Type: text/plain; charset=UTF-8\r\n\r\n");
        out.push_str(&format!(
            "Please find attached: {} by {}\r\n",
            header_value(self.title),
            header_value(self.author)
        ));
        out.push_str("\r\nSent from BookRelay\r\n\r\n");

        out.push_str(&format!("--{MIME_BOUNDARY}\r\n"));
        out.push_str("Content-Type: application/octet-stream\r\n");
        out.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{}\"\r\n",
            header_value(self.filename).replace('"', "'")
        ));
        out.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
        push_wrapped(&mut out, &encoded, BASE64_LINE_WIDTH);

        out.push_str(&format!("--{MIME_BOUNDARY}--\r\n"));
        out
    }
}

/// Flattens a header value onto one line; CR, LF and other control
/// characters become spaces.
fn header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Appends `encoded` as CRLF-terminated lines of at most `width` characters.
fn push_wrapped(out: &mut String, encoded: &str, width: usize) {
    // Base64 is pure ASCII, so byte chunks are char chunks.
    for chunk in encoded.as_bytes().chunks(width) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
}
