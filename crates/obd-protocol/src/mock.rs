//! Scripted ELM327 Adapter
//!
//! An in-memory adapter on the far end of a `tokio::io::duplex` pipe. It answers
//! commands from an ordered script so tests can assert exactly which commands
//! reached the line. Out-of-script commands are answered with `?`.

use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

/// What the adapter does after receiving a command
#[derive(Debug, Clone)]
pub enum Reply {
    /// Send these lines followed by the prompt
    Text(String),
    /// Send nothing, forcing the caller to time out
    Silent,
}

/// Builder for a [`MockAdapter`]
#[derive(Debug, Default)]
pub struct MockAdapterBuilder {
    script: VecDeque<(String, Reply)>,
    echo: bool,
}

impl MockAdapterBuilder {
    /// Answer `command` with `reply` (lines separated by `\n`)
    pub fn expect(mut self, command: &str, reply: &str) -> Self {
        self.script
            .push_back((command.to_string(), Reply::Text(reply.to_string())));
        self
    }

    /// Swallow `command` without answering
    pub fn silent(mut self, command: &str) -> Self {
        self.script.push_back((command.to_string(), Reply::Silent));
        self
    }

    /// Standard four-step handshake answered with `OK`
    pub fn handshake(self, protocol_command: &str) -> Self {
        self.expect("ATZ", "ELM327 v1.5")
            .expect("ATE0", "OK")
            .expect("ATL0", "OK")
            .expect(protocol_command, "OK")
    }

    /// Echo commands back until `ATE0` is received, like a freshly reset chip
    pub fn with_echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Start the adapter task and return the near end as a transport
    pub fn spawn(self) -> (Transport<DuplexStream>, MockAdapter) {
        let (near, far) = duplex(4096);
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(run(far, self.script, self.echo, Arc::clone(&received)));

        (
            Transport::from_stream(near, "mock", 115200),
            MockAdapter { received, task },
        )
    }
}

/// Handle to a running scripted adapter
#[derive(Debug)]
pub struct MockAdapter {
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl MockAdapter {
    pub fn builder() -> MockAdapterBuilder {
        MockAdapterBuilder::default()
    }

    /// Every command received so far, in order
    pub fn received(&self) -> Vec<String> {
        self.received.lock().expect("mock log poisoned").clone()
    }

    /// How many times `command` was received
    pub fn count(&self, command: &str) -> usize {
        self.received()
            .iter()
            .filter(|c| c.eq_ignore_ascii_case(command))
            .count()
    }
}

impl Drop for MockAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    mut stream: DuplexStream,
    mut script: VecDeque<(String, Reply)>,
    mut echo: bool,
    received: Arc<Mutex<Vec<String>>>,
) {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 256];

    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        while let Some(pos) = pending.iter().position(|&b| b == b'\r') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let command = String::from_utf8_lossy(&line[..line.len() - 1]).trim().to_string();
            received.lock().expect("mock log poisoned").push(command.clone());

            let reply = match script.pop_front() {
                Some((expected, reply)) if expected.eq_ignore_ascii_case(&command) => reply,
                _ => Reply::Text("?".to_string()),
            };

            let mut out = String::new();
            if echo {
                out.push_str(&command);
                out.push('\r');
            }
            if command.eq_ignore_ascii_case("ATE0") {
                echo = false;
            }

            match reply {
                Reply::Silent => continue,
                Reply::Text(text) => {
                    out.push_str(&text.replace('\n', "\r"));
                    out.push_str("\r\r>");
                }
            }

            if stream.write_all(out.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}
