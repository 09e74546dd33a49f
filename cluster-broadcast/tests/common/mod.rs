// ABOUTME: In-process RESP2 server covering the Redis commands the coordination store and relay send
// ABOUTME: Can cut every open client connection or refuse new ones to stage Redis outages in tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Keyspace {
    values: HashMap<String, (String, Option<Instant>)>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Keyspace {
    /// Value of `key`, evicting it first if its TTL has passed.
    fn live(&mut self, key: &str) -> Option<String> {
        let expired = matches!(
            self.values.get(key),
            Some((_, Some(deadline))) if *deadline <= Instant::now()
        );
        if expired {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value.clone())
    }
}

pub struct FakeRedis {
    addr: SocketAddr,
    keyspace: Arc<Mutex<Keyspace>>,
    generation: Arc<Mutex<CancellationToken>>,
    refusing: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl FakeRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let keyspace = Arc::new(Mutex::new(Keyspace::default()));
        let generation = Arc::new(Mutex::new(CancellationToken::new()));
        let refusing = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let accept_keyspace = keyspace.clone();
        let accept_generation = generation.clone();
        let accept_refusing = refusing.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((socket, _)) = accepted else { continue };
                        if accept_refusing.load(Ordering::SeqCst) {
                            drop(socket);
                            continue;
                        }
                        let kill = accept_generation.lock().unwrap().clone();
                        tokio::spawn(serve_client(socket, accept_keyspace.clone(), kill));
                    }
                }
            }
        });

        Self {
            addr,
            keyspace,
            generation,
            refusing,
            shutdown,
        }
    }

    pub fn url(&self) -> String {
        format!("redis://{}", self.addr)
    }

    /// Close every client connection currently open. The listener keeps
    /// accepting, so clients that redial get a fresh connection.
    pub fn drop_connections(&self) {
        let mut generation = self.generation.lock().unwrap();
        generation.cancel();
        *generation = CancellationToken::new();
    }

    /// While set, new connections are closed as soon as they are accepted.
    pub fn refuse_connections(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.keyspace.lock().unwrap().live(key)
    }
}

impl Drop for FakeRedis {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.drop_connections();
    }
}

async fn serve_client(socket: TcpStream, keyspace: Arc<Mutex<Keyspace>>, kill: CancellationToken) {
    let (mut reader, mut writer) = socket.into_split();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        tokio::select! {
            _ = kill.cancelled() => return,
            Some(frame) = push_rx.recv() => {
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some((args, used)) = parse_command(&buf) {
                    buf.drain(..used);
                    let reply = execute(&keyspace, &args, &push_tx);
                    if writer.write_all(&reply).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// One complete `*N` array of bulk strings from the front of `buf`, with the
/// number of bytes it took. None until the whole command has arrived.
fn parse_command(buf: &[u8]) -> Option<(Vec<String>, usize)> {
    let (count, mut pos) = parse_header(buf, 0, b'*')?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let (len, start) = parse_header(buf, pos, b'$')?;
        let end = start + len;
        if buf.len() < end + 2 {
            return None;
        }
        args.push(String::from_utf8_lossy(&buf[start..end]).into_owned());
        pos = end + 2;
    }
    Some((args, pos))
}

fn parse_header(buf: &[u8], pos: usize, marker: u8) -> Option<(usize, usize)> {
    if *buf.get(pos)? != marker {
        return None;
    }
    let line_len = buf[pos..].windows(2).position(|w| w == b"\r\n")?;
    let n = std::str::from_utf8(&buf[pos + 1..pos + line_len]).ok()?.parse().ok()?;
    Some((n, pos + line_len + 2))
}

fn execute(
    keyspace: &Mutex<Keyspace>,
    args: &[String],
    push: &mpsc::UnboundedSender<Vec<u8>>,
) -> Vec<u8> {
    let Some(name) = args.first() else {
        return error("empty command");
    };
    let mut keyspace = keyspace.lock().unwrap();

    match name.to_ascii_uppercase().as_str() {
        "PING" => simple("PONG"),
        "SET" if args.len() >= 3 => {
            let options: Vec<String> = args[3..].iter().map(|a| a.to_ascii_uppercase()).collect();
            let nx = options.iter().any(|o| o == "NX");
            let ttl = options
                .iter()
                .position(|o| o == "EX")
                .and_then(|i| args.get(3 + i + 1))
                .and_then(|secs| secs.parse::<u64>().ok())
                .map(Duration::from_secs);
            if nx && keyspace.live(&args[1]).is_some() {
                return nil();
            }
            let deadline = ttl.map(|ttl| Instant::now() + ttl);
            keyspace
                .values
                .insert(args[1].clone(), (args[2].clone(), deadline));
            simple("OK")
        }
        "GET" if args.len() == 2 => match keyspace.live(&args[1]) {
            Some(value) => bulk(&value),
            None => nil(),
        },
        "DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if keyspace.live(key).is_some() {
                    keyspace.values.remove(key);
                    removed += 1;
                }
            }
            integer(removed)
        }
        "KEYS" if args.len() == 2 => {
            let prefix = args[1].trim_end_matches('*');
            let candidates: Vec<String> = keyspace
                .values
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            let live: Vec<String> = candidates
                .into_iter()
                .filter(|k| keyspace.live(k).is_some())
                .collect();
            array(live.iter().map(|k| bulk(k)).collect())
        }
        "PUBLISH" if args.len() == 3 => {
            let frame = array(vec![bulk("message"), bulk(&args[1]), bulk(&args[2])]);
            let receivers = keyspace.subscribers.entry(args[1].clone()).or_default();
            receivers.retain(|tx| tx.send(frame.clone()).is_ok());
            integer(receivers.len() as i64)
        }
        "SUBSCRIBE" => {
            let mut reply = Vec::new();
            for (i, channel) in args[1..].iter().enumerate() {
                keyspace
                    .subscribers
                    .entry(channel.clone())
                    .or_default()
                    .push(push.clone());
                reply.extend(array(vec![
                    bulk("subscribe"),
                    bulk(channel),
                    integer(i as i64 + 1),
                ]));
            }
            reply
        }
        "SCRIPT" => bulk("0000000000000000000000000000000000000000"),
        // EVALSHA <sha> 1 <lease key> <holder> [ttl]: renew with a TTL,
        // release without one
        "EVALSHA" | "EVAL" if args.len() >= 5 => {
            let key = &args[3];
            let holder = &args[4];
            if keyspace.live(key).as_deref() != Some(holder.as_str()) {
                return integer(0);
            }
            match args.get(5).and_then(|secs| secs.parse::<u64>().ok()) {
                Some(secs) => {
                    if let Some((_, deadline)) = keyspace.values.get_mut(key) {
                        *deadline = Some(Instant::now() + Duration::from_secs(secs));
                    }
                }
                None => {
                    keyspace.values.remove(key);
                }
            }
            integer(1)
        }
        // CLIENT SETINFO and other connection setup chatter
        _ => simple("OK"),
    }
}

fn simple(s: &str) -> Vec<u8> {
    format!("+{}\r\n", s).into_bytes()
}

fn error(s: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", s).into_bytes()
}

fn nil() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

fn integer(n: i64) -> Vec<u8> {
    format!(":{}\r\n", n).into_bytes()
}

fn bulk(s: &str) -> Vec<u8> {
    let mut out = format!("${}\r\n", s.len()).into_bytes();
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
    out
}

fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        out.extend(item);
    }
    out
}
