//! Local control socket: one command per line on 127.0.0.1, one reply per command.
//!
//! ```text
//! BACKUP <path> <degree>   -> sent | already backed up | file not found | ...
//! RESTORE <path>           -> true | false
//! DELETE <path>            -> true | false
//! RECLAIM <bytes>          -> ok
//! STATE                    -> state dump, terminated by an empty line
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::engine::Peer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Backup { path: String, degree: u32 },
    Restore(String),
    Delete(String),
    Reclaim(i64),
    State,
}

/// Parse one command line. Paths may contain spaces; the degree is the last word.
pub fn parse(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    match verb.to_ascii_uppercase().as_str() {
        "BACKUP" => {
            let (path, degree) = rest
                .rsplit_once(char::is_whitespace)
                .ok_or("usage: BACKUP <path> <degree>")?;
            let degree = degree
                .parse()
                .map_err(|_| format!("invalid degree {:?}", degree))?;
            Ok(Command::Backup {
                path: path.trim().to_string(),
                degree,
            })
        }
        "RESTORE" if !rest.is_empty() => Ok(Command::Restore(rest.to_string())),
        "DELETE" if !rest.is_empty() => Ok(Command::Delete(rest.to_string())),
        "RECLAIM" => rest
            .parse()
            .map(Command::Reclaim)
            .map_err(|_| format!("invalid byte count {:?}", rest)),
        "STATE" if rest.is_empty() => Ok(Command::State),
        "" => Err("empty command".to_string()),
        _ => Err(format!("unknown command {:?}", line)),
    }
}

/// Accept control connections and serve each on its own task.
pub async fn run_control(bind: SocketAddr, peer: Arc<Peer>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!("control socket on {}", bind);
    loop {
        let (stream, from) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("control accept failed: {}", e);
                continue;
            }
        };
        let peer = peer.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, peer).await {
                tracing::debug!("control client {} closed: {}", from, e);
            }
        });
    }
}

async fn handle_client(stream: TcpStream, peer: Arc<Peer>) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match parse(&line) {
            Ok(cmd) => execute(&peer, cmd).await,
            Err(reason) => format!("error: {}\n", reason),
        };
        write.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

async fn execute(peer: &Arc<Peer>, cmd: Command) -> String {
    tracing::debug!("control: {:?}", cmd);
    match cmd {
        Command::Backup { path, degree } => format!("{}\n", peer.backup(&path, degree).await),
        Command::Restore(path) => format!("{}\n", peer.restore(&path).await),
        Command::Delete(path) => format!("{}\n", peer.delete(&path).await),
        Command::Reclaim(bytes) => {
            peer.reclaim(bytes).await;
            "ok\n".to_string()
        }
        Command::State => format!("{}\n", peer.state()),
    }
}
