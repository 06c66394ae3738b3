//! SMTP session state machine
//!
//! Pure protocol logic: consumes command lines, produces replies and tells
//! the I/O layer what to do next. No sockets here.

use mailcatch_common::types::Envelope;

/// Per-listener protocol settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub max_message_size: usize,
    /// A TLS acceptor is configured, so STARTTLS may be offered
    pub tls_available: bool,
}

/// Observable protocol state, derived from the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Greeted,
    HaveSender,
    HaveRecipients,
    ReceivingBody,
    Closed,
}

/// An SMTP reply, possibly multi-line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// Wire form: `code-text` on every line but the last, `code text` on the last
    pub fn to_wire(&self) -> String {
        let last = self.lines.len().saturating_sub(1);
        let mut out = String::new();
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{} \r\n", self.code));
        }
        out
    }
}

/// What the connection should do after a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Send the reply and read the next command
    Reply(Reply),
    /// Send the reply, then handshake TLS on the same connection
    StartTls(Reply),
    /// Send the reply, then read the message body
    ReceiveData(Reply),
    /// Send the reply, then close
    Close(Reply),
}

/// Result of reading and handing off a message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOutcome {
    Accepted,
    /// Parsing or dispatch failed
    Rejected,
    /// Body exceeded the size limit
    TooLarge,
}

/// One SMTP conversation
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    envelope: Envelope,
    tls_active: bool,
    receiving: bool,
    closed: bool,
}

impl Session {
    /// `tls_active` is true for connections accepted on implicit TLS ports
    pub fn new(config: SessionConfig, tls_active: bool) -> Self {
        Self {
            config,
            envelope: Envelope::default(),
            tls_active,
            receiving: false,
            closed: false,
        }
    }

    pub fn greeting(&self) -> Reply {
        Reply::new(220, format!("{} ESMTP Ready", self.config.hostname))
    }

    /// Reply sent when a read times out
    pub fn timeout_reply(&self) -> Reply {
        Reply::new(
            421,
            format!("{} Timeout, closing connection", self.config.hostname),
        )
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.receiving {
            SessionState::ReceivingBody
        } else if self.envelope.helo_domain.is_none() {
            SessionState::Init
        } else if self.envelope.mail_from.is_none() {
            SessionState::Greeted
        } else if self.envelope.rcpt_to.is_empty() {
            SessionState::HaveSender
        } else {
            SessionState::HaveRecipients
        }
    }

    /// Process one command line (line ending optional)
    pub fn handle_line(&mut self, line: &str) -> Step {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, args) = match line.trim_start().split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line.trim(), ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => self.helo(args, false),
            "EHLO" => self.helo(args, true),
            "STARTTLS" => self.starttls(),
            "MAIL" => Step::Reply(self.mail(args)),
            "RCPT" => Step::Reply(self.rcpt(args)),
            "DATA" => self.data(),
            "RSET" => {
                self.envelope = self.envelope.reset_transaction();
                Step::Reply(Reply::new(250, "OK"))
            }
            "NOOP" => Step::Reply(Reply::new(250, "OK")),
            "QUIT" => {
                self.closed = true;
                Step::Close(Reply::new(221, "Bye"))
            }
            _ => Step::Reply(Reply::new(500, "Command not recognized")),
        }
    }

    /// The handshake succeeded: everything said in cleartext is forgotten
    pub fn tls_established(&mut self) {
        self.tls_active = true;
        self.envelope = Envelope::default();
    }

    /// Body read and handed off; the transaction ends either way
    pub fn finish_data(&mut self, outcome: DataOutcome) -> Reply {
        self.receiving = false;
        self.envelope = self.envelope.reset_transaction();
        match outcome {
            DataOutcome::Accepted => Reply::new(250, "OK: message accepted"),
            DataOutcome::Rejected => Reply::new(554, "Transaction failed"),
            DataOutcome::TooLarge => Reply::new(552, "Message size exceeds fixed maximum message size"),
        }
    }

    fn helo(&mut self, domain: &str, extended: bool) -> Step {
        if domain.is_empty() {
            let verb = if extended { "EHLO" } else { "HELO" };
            return Step::Reply(Reply::new(501, format!("Syntax: {} hostname", verb)));
        }

        self.envelope = Envelope::greeted(domain);
        let hello = format!("{} Hello {}", self.config.hostname, domain);
        if !extended {
            return Step::Reply(Reply::new(250, hello));
        }

        let mut lines = vec![hello];
        if self.config.tls_available && !self.tls_active {
            lines.push("STARTTLS".to_string());
        }
        lines.push(format!("SIZE {}", self.config.max_message_size));
        lines.push("8BITMIME".to_string());
        lines.push("PIPELINING".to_string());
        Step::Reply(Reply::multiline(250, lines))
    }

    fn starttls(&mut self) -> Step {
        if !self.config.tls_available {
            Step::Reply(Reply::new(502, "TLS not available"))
        } else if self.tls_active {
            Step::Reply(Reply::new(503, "TLS already active"))
        } else {
            Step::StartTls(Reply::new(220, "Ready to start TLS"))
        }
    }

    fn mail(&mut self, args: &str) -> Reply {
        if self.envelope.helo_domain.is_none() {
            return Reply::new(503, "Need HELO first");
        }

        let Some((address, params)) = path_argument(args, "FROM:") else {
            return Reply::new(501, "Syntax: MAIL FROM:<address>");
        };

        if let Some(size) = size_param(params) {
            if size > self.config.max_message_size {
                return Reply::new(552, "Message size exceeds fixed maximum message size");
            }
        }

        self.envelope = Envelope {
            mail_from: Some(address.to_string()),
            ..self.envelope.reset_transaction()
        };
        Reply::new(250, "OK")
    }

    fn rcpt(&mut self, args: &str) -> Reply {
        if self.envelope.mail_from.is_none() {
            return Reply::new(503, "Need MAIL first");
        }

        match path_argument(args, "TO:") {
            Some((address, _)) if !address.is_empty() => {
                self.envelope.rcpt_to.push(address.to_string());
                Reply::new(250, "OK")
            }
            _ => Reply::new(501, "Syntax: RCPT TO:<address>"),
        }
    }

    fn data(&mut self) -> Step {
        if self.envelope.rcpt_to.is_empty() {
            return Step::Reply(Reply::new(503, "Need RCPT first"));
        }
        self.receiving = true;
        Step::ReceiveData(Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>"))
    }
}

/// Split `FROM:<addr> PARAMS` into the bare address and the parameter text
fn path_argument<'a>(args: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let head = args.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = args[prefix.len()..].trim_start();

    if let Some(inner) = rest.strip_prefix('<') {
        let end = inner.find('>')?;
        Some((inner[..end].trim(), inner[end + 1..].trim()))
    } else {
        let mut parts = rest.splitn(2, char::is_whitespace);
        let address = parts.next()?;
        if address.is_empty() {
            return None;
        }
        Some((address, parts.next().unwrap_or("").trim()))
    }
}

/// `SIZE=n` from MAIL parameters
fn size_param(params: &str) -> Option<usize> {
    params.split_whitespace().find_map(|p| {
        let (key, value) = p.split_once('=')?;
        if key.eq_ignore_ascii_case("SIZE") {
            value.parse().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn session(tls_available: bool) -> Session {
        Session::new(
            SessionConfig {
                hostname: "mx.test".into(),
                max_message_size: 1000,
                tls_available,
            },
            false,
        )
    }

    fn code(step: Step) -> u16 {
        match step {
            Step::Reply(r) | Step::StartTls(r) | Step::ReceiveData(r) | Step::Close(r) => r.code,
        }
    }

    #[test]
    fn test_transaction_reply_sequence() {
        let mut s = session(false);
        assert_eq!(s.greeting().to_wire(), "220 mx.test ESMTP Ready\r\n");

        let mut codes = vec![
            code(s.handle_line("HELO client.test\r\n")),
            code(s.handle_line("MAIL FROM:<a@x.com>\r\n")),
            code(s.handle_line("RCPT TO:<b@y.com>\r\n")),
            code(s.handle_line("DATA\r\n")),
        ];
        assert_eq!(s.state(), SessionState::ReceivingBody);
        codes.push(s.finish_data(DataOutcome::Accepted).code);
        assert_eq!(s.state(), SessionState::Greeted);
        codes.push(code(s.handle_line("QUIT\r\n")));

        assert_eq!(codes, vec![250, 250, 250, 354, 250, 221]);
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn test_out_of_order_commands() {
        let mut s = session(false);
        assert_eq!(code(s.handle_line("MAIL FROM:<a@x.com>")), 503);
        s.handle_line("EHLO client.test");
        assert_eq!(code(s.handle_line("RCPT TO:<b@y.com>")), 503);
        s.handle_line("MAIL FROM:<a@x.com>");
        assert_eq!(code(s.handle_line("DATA")), 503);
        assert_eq!(s.state(), SessionState::HaveSender);
    }

    #[test]
    fn test_syntax_errors() {
        let mut s = session(false);
        assert_eq!(code(s.handle_line("HELO")), 501);
        assert_eq!(code(s.handle_line("EHLO   ")), 501);
        s.handle_line("HELO client.test");
        assert_eq!(code(s.handle_line("MAIL <a@x.com>")), 501);
        assert_eq!(code(s.handle_line("MAIL FROM:<a@x.com")), 501);
        s.handle_line("MAIL FROM:<a@x.com>");
        assert_eq!(code(s.handle_line("RCPT <b@y.com>")), 501);
        assert_eq!(code(s.handle_line("RCPT TO:<>")), 501);
        assert_eq!(code(s.handle_line("VRFY root")), 500);
        assert_eq!(code(s.handle_line("")), 500);
    }

    #[test]
    fn test_ehlo_extensions_in_order() {
        let mut s = session(true);
        let Step::Reply(reply) = s.handle_line("EHLO client.test") else {
            panic!("expected reply");
        };
        assert_eq!(
            reply.to_wire(),
            "250-mx.test Hello client.test\r\n\
             250-STARTTLS\r\n\
             250-SIZE 1000\r\n\
             250-8BITMIME\r\n\
             250 PIPELINING\r\n"
        );

        s.tls_established();
        let Step::Reply(reply) = s.handle_line("EHLO client.test") else {
            panic!("expected reply");
        };
        assert!(!reply.lines.contains(&"STARTTLS".to_string()));
    }

    #[test]
    fn test_starttls_resets_envelope() {
        let mut s = session(true);
        s.handle_line("EHLO client.test");
        s.handle_line("MAIL FROM:<a@x.com>");
        s.handle_line("RCPT TO:<b@y.com>");

        assert!(matches!(s.handle_line("STARTTLS"), Step::StartTls(Reply { code: 220, .. })));
        s.tls_established();

        assert_eq!(s.envelope(), &Envelope::default());
        assert_eq!(s.state(), SessionState::Init);
        assert_eq!(code(s.handle_line("STARTTLS")), 503);
    }

    #[test]
    fn test_starttls_without_tls() {
        let mut s = session(false);
        s.handle_line("EHLO client.test");
        assert_eq!(code(s.handle_line("STARTTLS")), 502);
    }

    #[test]
    fn test_mail_resets_recipients() {
        let mut s = session(false);
        s.handle_line("HELO client.test");
        s.handle_line("MAIL FROM:<a@x.com>");
        s.handle_line("RCPT TO:<b@y.com>");
        s.handle_line("RCPT TO:<b@y.com>");
        assert_eq!(s.envelope().rcpt_to, vec!["b@y.com", "b@y.com"]);

        s.handle_line("mail from: c@z.com");
        assert_eq!(s.envelope().mail_from.as_deref(), Some("c@z.com"));
        assert!(s.envelope().rcpt_to.is_empty());
    }

    #[test]
    fn test_null_sender_and_size() {
        let mut s = session(false);
        s.handle_line("EHLO client.test");
        assert_eq!(code(s.handle_line("MAIL FROM:<> SIZE=2000")), 552);
        assert_eq!(code(s.handle_line("MAIL FROM:<> SIZE=200 BODY=8BITMIME")), 250);
        assert_eq!(s.envelope().mail_from.as_deref(), Some(""));
    }

    #[test]
    fn test_rset_and_noop() {
        let mut s = session(false);
        s.handle_line("HELO client.test");
        s.handle_line("MAIL FROM:<a@x.com>");
        assert_eq!(code(s.handle_line("NOOP")), 250);
        assert_eq!(s.state(), SessionState::HaveSender);
        assert_eq!(code(s.handle_line("RSET")), 250);
        assert_eq!(s.state(), SessionState::Greeted);
    }

    #[test]
    fn test_failed_data_keeps_session_open() {
        let mut s = session(false);
        s.handle_line("HELO client.test");
        s.handle_line("MAIL FROM:<a@x.com>");
        s.handle_line("RCPT TO:<b@y.com>");
        s.handle_line("DATA");

        assert_eq!(s.finish_data(DataOutcome::Rejected).code, 554);
        assert_eq!(s.state(), SessionState::Greeted);
        assert_eq!(code(s.handle_line("MAIL FROM:<a@x.com>")), 250);
    }
}
