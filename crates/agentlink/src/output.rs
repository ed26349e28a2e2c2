use std::io::{IsTerminal, Write};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Pretty
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ListeningOutput {
    event: &'static str,
    addr: String,
}

#[derive(Serialize)]
struct MessageOutput {
    event: &'static str,
    peer: Option<String>,
    payload_size: usize,
    payload: String,
    timestamp: String,
}

/// Announce the bound address; always the first line a server prints.
pub fn print_listening(addr: SocketAddr, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ListeningOutput {
                event: "listening",
                addr: addr.to_string(),
            };
            print_json(&out);
        }
        OutputFormat::Pretty | OutputFormat::Raw => println!("listening on {addr}"),
    }
    let _ = std::io::stdout().flush();
}

pub fn print_message(payload: &[u8], peer: Option<SocketAddr>, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                event: "message",
                peer: peer.map(|addr| addr.to_string()),
                payload_size: payload.len(),
                payload: payload_preview(payload),
                timestamp: now_unix_seconds(),
            };
            print_json(&out);
        }
        OutputFormat::Pretty => {
            let peer = peer.map_or_else(|| "-".to_string(), |addr| addr.to_string());
            println!(
                "size={} peer={} payload={}",
                payload.len(),
                peer,
                payload_preview(payload)
            );
        }
        OutputFormat::Raw => print_raw(payload),
    }
    let _ = std::io::stdout().flush();
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
