//! In-process fake server for tests
//!
//! Speaks enough of the protocol for GET, SET, SETEX, MGET and PING, and can
//! be told to misbehave: drop a connection, stall, or send garbage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::core::ServerAddress;
use crate::protocol::{Reply, WireCodec};

#[derive(Default)]
struct Behavior {
    drop_next: bool,
    drop_all: bool,
    delay: Option<Duration>,
    garbage: bool,
    error: Option<String>,
}

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    behavior: Mutex<Behavior>,
    accepted: AtomicUsize,
    commands: Mutex<Vec<Vec<Bytes>>>,
}

pub(crate) struct FakeServer {
    address: ServerAddress,
    shared: Arc<Shared>,
}

impl FakeServer {
    pub(crate) async fn start() -> FakeServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_shared.clone()));
            }
        });

        FakeServer {
            address: ServerAddress::new("127.0.0.1", port),
            shared,
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_accepted(&self, expected: usize) {
        for _ in 0..400 {
            if self.accepted() >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {} accepted connections, saw {}",
            expected,
            self.accepted()
        );
    }

    pub(crate) fn insert(&self, key: &[u8], value: &[u8]) {
        self.shared
            .data
            .lock()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
    }

    pub(crate) fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shared.data.lock().unwrap().get(key).cloned()
    }

    /// Commands received so far, as argument lists
    pub(crate) fn commands(&self) -> Vec<Vec<Bytes>> {
        self.shared.commands.lock().unwrap().clone()
    }

    /// Close the connection that carries the next command, without replying
    pub(crate) fn drop_next_command(&self) {
        self.shared.behavior.lock().unwrap().drop_next = true;
    }

    /// Close every connection on its first command, without replying
    pub(crate) fn drop_all_commands(&self) {
        self.shared.behavior.lock().unwrap().drop_all = true;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.shared.behavior.lock().unwrap().delay = Some(delay);
    }

    /// Answer every command with an error frame
    pub(crate) fn reply_error(&self, message: &str) {
        self.shared.behavior.lock().unwrap().error = Some(message.to_string());
    }

    pub(crate) fn reply_garbage(&self) {
        self.shared.behavior.lock().unwrap().garbage = true;
    }
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Some(args) = next_command(&mut buf) {
            shared.commands.lock().unwrap().push(args.clone());

            let (drop_now, delay, garbage, error) = {
                let mut behavior = shared.behavior.lock().unwrap();
                let drop_now = std::mem::take(&mut behavior.drop_next) || behavior.drop_all;
                (
                    drop_now,
                    behavior.delay,
                    behavior.garbage,
                    behavior.error.clone(),
                )
            };
            if drop_now {
                return;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let reply = match (garbage, error) {
                (true, _) => b"?garbage\r\n".to_vec(),
                (false, Some(message)) => format!("-{}\r\n", message).into_bytes(),
                (false, None) => execute(&shared, &args),
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

fn next_command(buf: &mut BytesMut) -> Option<Vec<Bytes>> {
    let len = WireCodec::frame_len(buf, 0).ok()??;
    let mut cursor = 0;
    let mut args = Vec::new();
    let count = match WireCodec::decode_next(buf, &mut cursor).ok()?? {
        Reply::Multibulk(count) => count,
        _ => return None,
    };
    for _ in 0..count {
        if let Some(Reply::Bulk(arg)) = WireCodec::decode_next(buf, &mut cursor).ok()? {
            args.push(arg);
        }
    }
    let _ = buf.split_to(len);
    Some(args)
}

fn execute(shared: &Shared, args: &[Bytes]) -> Vec<u8> {
    let mut data = shared.data.lock().unwrap();
    let command = args
        .first()
        .map(|c| String::from_utf8_lossy(c).to_uppercase())
        .unwrap_or_default();

    match (command.as_str(), args.len()) {
        ("PING", 1) => b"+PONG\r\n".to_vec(),
        ("GET", 2) => bulk(data.get(&args[1][..])),
        ("SET", 3) => {
            data.insert(args[1].to_vec(), args[2].to_vec());
            b"+OK\r\n".to_vec()
        }
        ("SETEX", 4) => {
            if std::str::from_utf8(&args[2])
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .is_none()
            {
                return b"-ERR value is not an integer or out of range\r\n".to_vec();
            }
            data.insert(args[1].to_vec(), args[3].to_vec());
            b"+OK\r\n".to_vec()
        }
        ("MGET", n) if n > 1 => {
            let mut out = format!("*{}\r\n", n - 1).into_bytes();
            for key in &args[1..] {
                out.extend(bulk(data.get(&key[..])));
            }
            out
        }
        _ => format!("-ERR unknown command '{}'\r\n", command).into_bytes(),
    }
}

fn bulk(value: Option<&Vec<u8>>) -> Vec<u8> {
    match value {
        Some(value) => {
            let mut out = format!("${}\r\n", value.len()).into_bytes();
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
            out
        }
        None => b"$-1\r\n".to_vec(),
    }
}
