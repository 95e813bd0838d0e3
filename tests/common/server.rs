//! In-process mock store.
//!
//! Speaks the command subset the endpoints use: HELLO, CLIENT ID,
//! CLIENT UNBLOCK, XGROUP CREATE, XADD, XREADGROUP (blocking) and QUIT.
//! Every connection runs in its own task against shared state, so the
//! forced-unblock second connection works the way it does against a real
//! store. Test hooks: inject entries, fail the next XADD, ignore unblocks,
//! kill all connections, and inspect the command log.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};

use resp_stream::resp::{decode, frame_len, Token};

/// Install the test log subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Clone)]
pub struct MockEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, Vec<MockEntry>>,
    /// Delivery cursor per (stream, group).
    cursors: HashMap<(String, String), usize>,
    groups: HashSet<(String, String)>,
    command_log: Vec<String>,
    next_client_id: i64,
    next_entry_seq: u64,
    unblock_handles: HashMap<i64, Arc<Notify>>,
    ignore_unblock: bool,
    fail_next_xadd: bool,
    fail_reads: bool,
    required_password: Option<String>,
    blocked_reads: usize,
    max_blocked_reads: usize,
}

/// Handle to a running mock store.
pub struct MockRedis {
    port: u16,
    state: Arc<Mutex<State>>,
    kill_tx: watch::Sender<u64>,
}

impl MockRedis {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::serve(listener)
    }

    /// Bind a specific port (for tests that reserve one up front).
    pub async fn start_on(port: u16) -> Self {
        init_tracing();
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        Self::serve(listener)
    }

    fn serve(listener: TcpListener) -> Self {
        let port = listener.local_addr().unwrap().port();
        let state: Arc<Mutex<State>> = Arc::default();
        let (kill_tx, kill_rx) = watch::channel(0u64);

        let accept_state = state.clone();
        let accept_kill = kill_rx;
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let state = accept_state.clone();
                let kill = accept_kill.clone();
                tokio::spawn(serve_conn(socket, state, kill));
            }
        });

        Self { port, state, kill_tx }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Append an entry directly, waking any blocked reader.
    pub fn push_entry(&self, stream: &str, fields: &[(&str, &str)]) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_entry_seq += 1;
        let id = format!("{}-0", state.next_entry_seq);
        let entry = MockEntry {
            id: id.clone(),
            fields: fields
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        };
        state.streams.entry(stream.to_string()).or_default().push(entry);
        id
    }

    pub fn command_log(&self) -> Vec<String> {
        self.state.lock().unwrap().command_log.clone()
    }

    pub fn commands_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .command_log
            .iter()
            .filter(|line| line.starts_with(name))
            .count()
    }

    pub fn stream_entries(&self, stream: &str) -> Vec<MockEntry> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneously blocked XREADGROUPs seen.
    pub fn max_blocked_reads(&self) -> usize {
        self.state.lock().unwrap().max_blocked_reads
    }

    pub fn fail_next_xadd(&self) {
        self.state.lock().unwrap().fail_next_xadd = true;
    }

    /// Answer every XREADGROUP with `-ERR NOGROUP`, as a store does after a
    /// server-side group delete.
    pub fn fail_reads(&self) {
        self.state.lock().unwrap().fail_reads = true;
    }

    /// Make CLIENT UNBLOCK a no-op, forcing the teardown timeout path.
    pub fn ignore_unblock(&self) {
        self.state.lock().unwrap().ignore_unblock = true;
    }

    pub fn require_password(&self, password: &str) {
        self.state.lock().unwrap().required_password = Some(password.to_string());
    }

    /// Drop every live connection.
    pub fn kill_connections(&self) {
        self.kill_tx.send_modify(|generation| *generation += 1);
    }
}

fn bulks(frame: &[Token]) -> Option<Vec<String>> {
    match frame.first()? {
        Token::Array(n) if frame.len() == n + 1 => {}
        _ => return None,
    }
    frame[1..]
        .iter()
        .map(|token| match token {
            Token::Bulk(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

fn bulk_reply(payload: &str) -> Vec<u8> {
    format!("${}\r\n{}\r\n", payload.len(), payload).into_bytes()
}

fn entry_reply(stream: &str, entry: &MockEntry) -> Vec<u8> {
    let mut wire = format!(
        "%1\r\n${}\r\n{}\r\n*1\r\n*2\r\n${}\r\n{}\r\n*{}\r\n",
        stream.len(),
        stream,
        entry.id.len(),
        entry.id,
        entry.fields.len() * 2
    );
    for (field, value) in &entry.fields {
        wire.push_str(&format!("${}\r\n{}\r\n", field.len(), field));
        wire.push_str(&format!("${}\r\n{}\r\n", value.len(), value));
    }
    wire.into_bytes()
}

async fn serve_conn(
    mut socket: TcpStream,
    state: Arc<Mutex<State>>,
    mut kill_rx: watch::Receiver<u64>,
) {
    let (client_id, unblock) = {
        let mut st = state.lock().unwrap();
        st.next_client_id += 1;
        let id = st.next_client_id;
        let handle = Arc::new(Notify::new());
        st.unblock_handles.insert(id, handle.clone());
        (id, handle)
    };

    let mut carry: Vec<u8> = Vec::new();
    let mut tokens: Vec<Token> = Vec::new();
    let mut buf = [0u8; 4096];

    'conn: loop {
        while let Some(len) = frame_len(&tokens) {
            let frame: Vec<Token> = tokens.drain(..len).collect();
            let Some(parts) = bulks(&frame) else { continue };
            if parts.is_empty() {
                continue;
            }
            state.lock().unwrap().command_log.push(parts.join(" "));

            let reply: Vec<u8> = match parts[0].to_uppercase().as_str() {
                "HELLO" => {
                    let required = state.lock().unwrap().required_password.clone();
                    match required {
                        Some(required) if parts.get(4) != Some(&required) => {
                            b"-WRONGPASS invalid username-password pair\r\n".to_vec()
                        }
                        _ => b"%0\r\n".to_vec(),
                    }
                }
                "CLIENT" if parts.get(1).map(|s| s.to_uppercase()) == Some("ID".into()) => {
                    format!(":{}\r\n", client_id).into_bytes()
                }
                "CLIENT" if parts.get(1).map(|s| s.to_uppercase()) == Some("UNBLOCK".into()) => {
                    let target: i64 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
                    let handle = {
                        let st = state.lock().unwrap();
                        if st.ignore_unblock {
                            None
                        } else {
                            st.unblock_handles.get(&target).cloned()
                        }
                    };
                    match handle {
                        Some(handle) => {
                            handle.notify_one();
                            b":1\r\n".to_vec()
                        }
                        None => b":0\r\n".to_vec(),
                    }
                }
                "XGROUP" => {
                    // XGROUP CREATE <stream> <group> $ MKSTREAM
                    let stream = parts.get(2).cloned().unwrap_or_default();
                    let group = parts.get(3).cloned().unwrap_or_default();
                    let mut st = state.lock().unwrap();
                    if st.groups.insert((stream.clone(), group)) {
                        st.streams.entry(stream).or_default();
                        b"+OK\r\n".to_vec()
                    } else {
                        b"-BUSYGROUP Consumer Group name already exists\r\n".to_vec()
                    }
                }
                "XADD" => {
                    let stream = parts.get(1).cloned().unwrap_or_default();
                    let mut st = state.lock().unwrap();
                    if st.fail_next_xadd {
                        st.fail_next_xadd = false;
                        b"-ERR injected append failure\r\n".to_vec()
                    } else if parts.len() < 5 || parts.len() % 2 != 1 {
                        b"-ERR wrong number of arguments for 'xadd' command\r\n".to_vec()
                    } else {
                        st.next_entry_seq += 1;
                        let id = format!("{}-0", st.next_entry_seq);
                        let fields = parts[3..]
                            .chunks(2)
                            .map(|pair| (pair[0].clone(), pair[1].clone()))
                            .collect();
                        st.streams
                            .entry(stream)
                            .or_default()
                            .push(MockEntry { id: id.clone(), fields });
                        bulk_reply(&id)
                    }
                }
                "XREADGROUP" => {
                    // XREADGROUP GROUP <g> <c> BLOCK 0 COUNT 1 STREAMS <s> >
                    let group = parts.get(2).cloned().unwrap_or_default();
                    let stream = parts.get(9).cloned().unwrap_or_default();
                    if state.lock().unwrap().fail_reads {
                        b"-ERR NOGROUP No such key or consumer group\r\n".to_vec()
                    } else {
                        match blocking_read(&state, &unblock, &mut kill_rx, &stream, &group).await
                        {
                            Some(reply) => reply,
                            None => break 'conn,
                        }
                    }
                }
                "QUIT" => {
                    let _ = socket.write_all(b"+OK\r\n").await;
                    break 'conn;
                }
                other => format!("-ERR unknown command '{}'\r\n", other).into_bytes(),
            };
            if socket.write_all(&reply).await.is_err() {
                break 'conn;
            }
        }

        tokio::select! {
            read = socket.read(&mut buf) => match read {
                Ok(0) | Err(_) => break 'conn,
                Ok(n) => {
                    carry.extend_from_slice(&buf[..n]);
                    let decoded = decode(&carry);
                    carry = decoded.remainder;
                    tokens.extend(decoded.tokens);
                }
            },
            _ = kill_rx.changed() => break 'conn,
        }
    }

    state.lock().unwrap().unblock_handles.remove(&client_id);
}

/// Block until an undelivered entry exists for (stream, group), the client
/// is unblocked, or the connection is killed (`None`).
async fn blocking_read(
    state: &Arc<Mutex<State>>,
    unblock: &Arc<Notify>,
    kill_rx: &mut watch::Receiver<u64>,
    stream: &str,
    group: &str,
) -> Option<Vec<u8>> {
    {
        let mut st = state.lock().unwrap();
        st.blocked_reads += 1;
        st.max_blocked_reads = st.max_blocked_reads.max(st.blocked_reads);
    }
    let result = loop {
        {
            let mut st = state.lock().unwrap();
            let key = (stream.to_string(), group.to_string());
            let cursor = *st.cursors.get(&key).unwrap_or(&0);
            let next = st.streams.get(stream).and_then(|e| e.get(cursor)).cloned();
            if let Some(entry) = next {
                st.cursors.insert(key, cursor + 1);
                break Some(entry_reply(stream, &entry));
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(5)) => {}
            _ = unblock.notified() => break Some(b"_\r\n".to_vec()),
            _ = kill_rx.changed() => break None,
        }
    };
    state.lock().unwrap().blocked_reads -= 1;
    result
}
