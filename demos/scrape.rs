//! Interactive health lookups against a single DHT node.
//!
//! A deliberately tiny engine: every lookup sends one `get_peers` query to each address of the
//! node given on the command line (default: the BitTorrent router). Enter info hashes in hex, `q`
//! to quit. Run with `RUST_LOG=btdht_health=debug` to see the lookup lifecycle.

use btdht_health::{
    message::{GetPeersRequest, Message, MessageBody, Request},
    HealthHooksHandle, HealthManager, InfoHash, LengthError, ScrapeSocket, SocketTrait,
};
use std::{
    convert::TryFrom,
    net::{Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{self, UdpSocket},
    select,
    sync::mpsc,
    task,
};

const DEFAULT_NODE: &str = "router.bittorrent.com:6881";

#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let node = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_NODE.to_owned());
    let nodes: Vec<_> = net::lookup_host(node)
        .await
        .unwrap()
        .filter(|addr| addr.is_ipv4())
        .collect();

    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();

    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let manager = HealthManager::builder()
        .set_default_timeout(Duration::from_secs(5))
        .start(engine_tx);

    task::spawn(run_engine(
        ScrapeSocket::new(socket, manager.hooks()),
        nodes,
        engine_rx,
    ));

    let mut stdout = io::stdout();
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();

    loop {
        stdout.write_all(b"> ").await.unwrap();
        stdout.flush().await.unwrap();

        line.clear();
        if stdin.read_line(&mut line).await.unwrap() == 0 {
            break;
        }

        let input = line.trim();

        if input == "q" {
            break;
        }

        let info_hash = match parse_info_hash(input) {
            Ok(info_hash) => info_hash,
            Err(_) => {
                println!("invalid info hash");
                continue;
            }
        };

        let start = Instant::now();
        let info = match manager.lookup(info_hash) {
            Ok(lookup) => lookup.await,
            Err(error) => {
                println!("lookup failed: {}", error);
                continue;
            }
        };

        println!(
            "{:?}: {} seeders, {} leechers ({} ms)",
            info.info_hash,
            info.seeders,
            info.leechers,
            start.elapsed().as_millis()
        );
    }

    manager.shutdown();
}

async fn run_engine(
    mut socket: ScrapeSocket<UdpSocket, HealthHooksHandle>,
    nodes: Vec<SocketAddr>,
    mut engine_rx: mpsc::UnboundedReceiver<InfoHash>,
) {
    let id: InfoHash = rand::random();
    let mut next_tid: u16 = 0;
    let mut buffer = vec![0u8; 1500];

    loop {
        select! {
            info_hash = engine_rx.recv() => {
                let info_hash = match info_hash {
                    Some(info_hash) => info_hash,
                    None => break,
                };

                for node in &nodes {
                    next_tid = next_tid.wrapping_add(1);

                    let query = Message {
                        transaction_id: next_tid.to_be_bytes().to_vec(),
                        body: MessageBody::Request(Request::GetPeers(GetPeersRequest {
                            id,
                            info_hash,
                            want: None,
                            scrape: false,
                            noseed: false,
                        })),
                    };

                    if let Err(error) = socket.send_to(&query.encode(), node).await {
                        log::warn!("Failed to query {node:?}: {}", error);
                    }
                }
            }
            // The socket reports scrape responses to the manager on its own.
            result = socket.recv_from(&mut buffer) => {
                if let Err(error) = result {
                    log::warn!("Failed to receive: {}", error);
                }
            }
        }
    }
}

struct ParseError;

impl From<hex::FromHexError> for ParseError {
    fn from(_: hex::FromHexError) -> Self {
        ParseError
    }
}

impl From<LengthError> for ParseError {
    fn from(_: LengthError) -> Self {
        ParseError
    }
}

fn parse_info_hash(s: &str) -> Result<InfoHash, ParseError> {
    Ok(InfoHash::try_from(hex::decode(s)?.as_ref())?)
}
