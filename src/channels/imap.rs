//! IMAP inbound adapter: raw IMAP4rev1 over rustls.
//!
//! Blocking I/O runs on `spawn_blocking`. Listing opens a fresh session
//! (LOGIN → quirk → SELECT → `UID SEARCH UNSEEN` → `UID FETCH (BODY.PEEK[])`)
//! and keeps it open for the `mark_seen` calls that follow in the same cycle.
//! `BODY.PEEK` keeps fetching from setting `\Seen`; only `mark_seen` does.
//! Any I/O error drops the session; the next call reconnects.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channels::parse::parse_message;
use crate::error::TransportError;
use crate::pipeline::types::{InboundTransport, MessageId, MessageSummary};

const TRANSPORT: &str = "imap";

// ── Configuration ───────────────────────────────────────────────────

/// Provider-specific behavior applied right after login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderQuirk {
    #[default]
    None,
    /// NetEase (163.com / 188.com) rejects unidentified clients with
    /// "Unsafe Login" until an RFC 2971 `ID` command is sent.
    NeteaseId,
}

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub quirk: ProviderQuirk,
    /// Socket connect/read/write timeout.
    pub timeout: Duration,
    pub max_body_bytes: usize,
    /// Bodies downloaded per listing at most, oldest UIDs first.
    pub fetch_limit: usize,
}

// ── Adapter ─────────────────────────────────────────────────────────

#[derive(Default)]
struct SessionState {
    session: Option<ImapSession>,
    folder: Option<String>,
}

pub struct ImapInbox {
    config: Arc<ImapConfig>,
    state: Arc<Mutex<SessionState>>,
}

impl ImapInbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SessionState::default())),
        }
    }
}

#[async_trait]
impl InboundTransport for ImapInbox {
    fn name(&self) -> &str {
        TRANSPORT
    }

    async fn list_unseen(&self, folder: &str) -> Result<Vec<MessageSummary>, TransportError> {
        self.list_unseen_excluding(folder, &HashSet::new()).await
    }

    async fn list_unseen_excluding(
        &self,
        folder: &str,
        known: &HashSet<MessageId>,
    ) -> Result<Vec<MessageSummary>, TransportError> {
        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);
        let folder = folder.to_string();
        let skip: HashSet<u32> = known.iter().filter_map(|id| id.as_str().parse().ok()).collect();

        tokio::task::spawn_blocking(move || -> Result<Vec<MessageSummary>, TransportError> {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = state.session.take() {
                old.logout();
            }
            state.folder = Some(folder.clone());

            let mut session = ImapSession::open(&config, &folder)?;
            let messages = session.fetch_unseen(&skip, config.fetch_limit, config.max_body_bytes)?;
            state.session = Some(session);
            Ok(messages)
        })
        .await
        .map_err(|e| TransportError::transient(TRANSPORT, format!("IMAP task panicked: {e}")))?
    }

    async fn mark_seen(&self, id: &MessageId) -> Result<(), TransportError> {
        let uid: u32 = id
            .as_str()
            .parse()
            .map_err(|_| TransportError::permanent(TRANSPORT, format!("not an IMAP UID: {id}")))?;
        let config = Arc::clone(&self.config);
        let state = Arc::clone(&self.state);

        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let mut session = match state.session.take() {
                Some(session) => session,
                None => {
                    let folder = state.folder.clone().ok_or_else(|| {
                        TransportError::permanent(TRANSPORT, "no folder selected yet")
                    })?;
                    ImapSession::open(&config, &folder)?
                }
            };
            session.store_seen(uid)?;
            state.session = Some(session);
            Ok(())
        })
        .await
        .map_err(|e| TransportError::transient(TRANSPORT, format!("IMAP task panicked: {e}")))?
    }
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

#[derive(Debug)]
struct Response {
    status: Status,
    text: String,
    untagged: Vec<String>,
    literals: Vec<Vec<u8>>,
}

struct ImapSession<S = TlsStream> {
    stream: BufReader<S>,
    next_tag: u32,
}

fn io_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::transient(TRANSPORT, e.to_string())
}

impl ImapSession {
    /// Connect, log in, apply the quirk and select `folder`.
    fn open(config: &ImapConfig, folder: &str) -> Result<Self, TransportError> {
        let mut session = Self::connect(config)?;
        session.login(config)?;
        session.apply_quirk(config.quirk);
        session.select(folder)?;
        Ok(session)
    }

    fn connect(config: &ImapConfig) -> Result<Self, TransportError> {
        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(io_error)?
            .next()
            .ok_or_else(|| io_error(format!("no address for {}", config.host)))?;
        let tcp = TcpStream::connect_timeout(&addr, config.timeout).map_err(io_error)?;
        tcp.set_read_timeout(Some(config.timeout)).map_err(io_error)?;
        tcp.set_write_timeout(Some(config.timeout)).map_err(io_error)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| TransportError::permanent(TRANSPORT, format!("invalid host: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name).map_err(io_error)?;

        let mut session = Self::from_stream(rustls::StreamOwned::new(conn, tcp));

        let greeting = session.read_line()?;
        if !(greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH")) {
            return Err(io_error(format!("unexpected greeting: {}", greeting.trim_end())));
        }
        debug!(host = %config.host, "IMAP connected");
        Ok(session)
    }
}

impl<S: Read + Write> ImapSession<S> {
    fn from_stream(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    fn login(&mut self, config: &ImapConfig) -> Result<(), TransportError> {
        let resp = self.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if resp.status != Status::Ok {
            return Err(TransportError::permanent(
                TRANSPORT,
                format!("login rejected: {}", resp.text),
            ));
        }
        Ok(())
    }

    fn apply_quirk(&mut self, quirk: ProviderQuirk) {
        match quirk {
            ProviderQuirk::None => {}
            ProviderQuirk::NeteaseId => {
                let id = format!(
                    "ID (\"name\" \"mail-reply-smith\" \"version\" \"{}\" \"vendor\" \"mail-reply-smith\")",
                    env!("CARGO_PKG_VERSION")
                );
                match self.command(&id) {
                    Ok(resp) if resp.status == Status::Ok => debug!("IMAP ID sent"),
                    Ok(resp) => debug!(status = ?resp.status, text = %resp.text, "IMAP ID not accepted"),
                    Err(e) => debug!(error = %e, "IMAP ID failed"),
                }
            }
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), TransportError> {
        let resp = self.command(&format!("SELECT {}", quote(folder)))?;
        if resp.status != Status::Ok {
            return Err(TransportError::permanent(
                TRANSPORT,
                format!("cannot select {folder}: {}", resp.text),
            ));
        }
        Ok(())
    }

    /// Download unseen messages, skipping `skip` and keeping the oldest
    /// `limit` of the rest.
    fn fetch_unseen(
        &mut self,
        skip: &HashSet<u32>,
        limit: usize,
        max_body_bytes: usize,
    ) -> Result<Vec<MessageSummary>, TransportError> {
        let resp = self.command("UID SEARCH UNSEEN")?;
        if resp.status != Status::Ok {
            return Err(io_error(format!("SEARCH failed: {}", resp.text)));
        }
        let mut uids = parse_search(&resp.untagged);
        uids.retain(|uid| !skip.contains(uid));
        uids.sort_unstable();
        if uids.len() > limit {
            debug!(unseen = uids.len(), limit, "Unseen backlog over fetch limit, deferring the newest");
            uids.truncate(limit);
        }

        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            let resp = self.command(&format!("UID FETCH {uid} (BODY.PEEK[])"))?;
            let raw = match (resp.status, resp.literals.into_iter().next()) {
                (Status::Ok, Some(raw)) => raw,
                (status, _) => {
                    warn!(uid, ?status, "Failed to fetch message, skipping");
                    continue;
                }
            };
            match parse_message(MessageId::new(uid.to_string()), &raw, max_body_bytes) {
                Some(summary) => messages.push(summary),
                None => warn!(uid, "Unparseable message, skipping"),
            }
        }

        if !messages.is_empty() {
            info!(count = messages.len(), "Fetched unseen messages");
        }
        Ok(messages)
    }

    fn store_seen(&mut self, uid: u32) -> Result<(), TransportError> {
        let resp = self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        match resp.status {
            Status::Ok => Ok(()),
            Status::No => Err(io_error(format!("STORE refused: {}", resp.text))),
            Status::Bad => Err(TransportError::permanent(
                TRANSPORT,
                format!("STORE rejected: {}", resp.text),
            )),
        }
    }

    fn logout(mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "IMAP logout error (non-fatal)");
        }
    }

    fn command(&mut self, cmd: &str) -> Result<Response, TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let stream = self.stream.get_mut();
        stream
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(io_error)?;
        stream.flush().map_err(io_error)?;

        let tagged_prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        let mut literals = Vec::new();

        loop {
            let mut line = self.read_line()?;

            // A line ending in {N} is followed by N raw bytes, then the rest of the line.
            while let Some(len) = literal_len(&line) {
                let mut literal = vec![0u8; len];
                self.stream.read_exact(&mut literal).map_err(io_error)?;
                literals.push(literal);
                line.push_str(&self.read_line()?);
            }

            if let Some(rest) = line.strip_prefix(&tagged_prefix) {
                let (status, text) = parse_status(rest);
                return Ok(Response {
                    status,
                    text,
                    untagged,
                    literals,
                });
            }
            untagged.push(line);
        }
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).map_err(io_error)?;
        if n == 0 {
            return Err(io_error("IMAP connection closed"));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

// ── Protocol helpers (public for testing) ───────────────────────────

/// Quote a string as an IMAP quoted string.
pub fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Size of the literal announced at the end of `line` (`... {123}\r\n`).
pub fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let inner = trimmed.strip_suffix('}')?;
    let open = inner.rfind('{')?;
    inner[open + 1..].parse().ok()
}

/// UIDs from `* SEARCH` untagged responses.
pub fn parse_search(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace())
        .filter_map(|n| n.parse().ok())
        .collect()
}

fn parse_status(rest: &str) -> (Status, String) {
    let rest = rest.trim_end();
    let (word, text) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        _ => Status::Bad,
    };
    (status, text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote(r#"pa"ss\word"#), r#""pa\"ss\\word""#);
    }

    #[test]
    fn literal_length_is_parsed() {
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {342}\r\n"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (FLAGS (\\Seen))\r\n"), None);
        assert_eq!(literal_len("A1 OK done\r\n"), None);
    }

    #[test]
    fn search_response_yields_uids() {
        let lines = vec![
            "* SEARCH 4 9 12\r\n".to_string(),
            "* OK still here\r\n".to_string(),
        ];
        assert_eq!(parse_search(&lines), vec![4, 9, 12]);
        assert!(parse_search(&["* SEARCH\r\n".to_string()]).is_empty());
    }

    #[test]
    fn tagged_status_is_classified() {
        assert_eq!(parse_status("OK LOGIN completed\r\n"), (Status::Ok, "LOGIN completed".to_string()));
        assert_eq!(parse_status("NO [AUTHENTICATIONFAILED] nope").0, Status::No);
        assert_eq!(parse_status("BAD parse error").0, Status::Bad);
    }

    /// Replays canned server output and records what the client wrote.
    struct Scripted {
        input: std::io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Scripted {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn scripted(server: &str) -> ImapSession<Scripted> {
        ImapSession::from_stream(Scripted {
            input: std::io::Cursor::new(server.as_bytes().to_vec()),
            written: Vec::new(),
        })
    }

    fn written(session: &ImapSession<Scripted>) -> String {
        String::from_utf8(session.stream.get_ref().written.clone()).unwrap()
    }

    const RAW: &str = "From: Boss <boss@co.com>\r\nSubject: Hi\r\n\r\nSee you at 3.\r\n";

    #[test]
    fn command_reads_literal_and_tagged_status() {
        let server = format!(
            "* 1 FETCH (UID 7 BODY[] {{{}}}\r\n{RAW})\r\nA1 OK FETCH completed\r\n",
            RAW.len()
        );
        let mut session = scripted(&server);

        let resp = session.command("UID FETCH 7 (BODY.PEEK[])").unwrap();
        assert_eq!(resp.status, Status::Ok);
        assert_eq!(resp.text, "FETCH completed");
        assert_eq!(resp.literals, vec![RAW.as_bytes().to_vec()]);
        assert_eq!(resp.untagged.len(), 1);
        assert!(resp.untagged[0].ends_with(")\r\n"));
        assert_eq!(written(&session), "A1 UID FETCH 7 (BODY.PEEK[])\r\n");
    }

    #[test]
    fn command_fails_when_server_hangs_up() {
        let mut session = scripted("* OK partial\r\n");
        let err = session.command("NOOP").unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn fetch_skips_known_uids_and_caps_the_batch() {
        let server = format!(
            "* SEARCH 9 3 5 7\r\nA1 OK SEARCH completed\r\n\
             * 1 FETCH (UID 5 BODY[] {{{len}}}\r\n{RAW})\r\nA2 OK done\r\n",
            len = RAW.len()
        );
        let mut session = scripted(&server);

        let skip = HashSet::from([3]);
        let messages = session.fetch_unseen(&skip, 1, 1024).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::new("5"));
        assert_eq!(messages[0].sender, "boss@co.com");
        assert_eq!(
            written(&session),
            "A1 UID SEARCH UNSEEN\r\nA2 UID FETCH 5 (BODY.PEEK[])\r\n"
        );
    }

    #[test]
    fn refused_fetch_is_skipped() {
        let server = "* SEARCH 4\r\nA1 OK SEARCH completed\r\nA2 NO message gone\r\n";
        let mut session = scripted(server);
        let messages = session.fetch_unseen(&HashSet::new(), 10, 1024).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn quirk_deserializes_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            quirk: ProviderQuirk,
        }
        let w: Wrapper = toml::from_str("quirk = \"netease_id\"").unwrap();
        assert_eq!(w.quirk, ProviderQuirk::NeteaseId);
        assert_eq!(ProviderQuirk::default(), ProviderQuirk::None);
    }
}
