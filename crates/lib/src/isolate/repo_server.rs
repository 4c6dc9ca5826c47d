//! Read-only HTTP server for the pinned package-repository snapshot.
//!
//! Bound to loopback only; the nested build's package installer fetches
//! from it so no external network is needed inside the appliance. Supports
//! `GET` and `HEAD` of regular files and nothing else.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest request head we accept.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// A running snapshot server. Stops when dropped.
#[derive(Debug)]
pub struct RepoServer {
  addr: SocketAddr,
  root: Arc<PathBuf>,
  task: JoinHandle<()>,
}

impl RepoServer {
  /// Serve `root` on an ephemeral loopback port.
  pub async fn start(root: impl Into<PathBuf>) -> std::io::Result<Self> {
    let root = Arc::new(root.into());
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, root = %root.display(), "serving package repository snapshot");

    let serve_root = Arc::clone(&root);
    let task = tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((stream, peer)) => {
            let root = Arc::clone(&serve_root);
            tokio::spawn(async move {
              if let Err(e) = serve_connection(stream, &root).await {
                debug!(%peer, error = %e, "repo connection failed");
              }
            });
          }
          Err(e) => warn!(error = %e, "failed to accept repo connection"),
        }
      }
    });

    Ok(Self { addr, root, task })
  }

  pub fn addr(&self) -> SocketAddr {
    self.addr
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Base URL for the package installer.
  pub fn url(&self) -> String {
    format!("http://{}/", self.addr)
  }
}

impl Drop for RepoServer {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[derive(Debug, PartialEq, Eq)]
enum Resolved {
  File(PathBuf),
  BadRequest,
  NotFound,
}

fn percent_decode(raw: &str) -> Option<String> {
  let bytes = raw.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' {
      let hex = raw.get(i + 1..i + 3)?;
      out.push(u8::from_str_radix(hex, 16).ok()?);
      i += 3;
    } else {
      out.push(bytes[i]);
      i += 1;
    }
  }
  String::from_utf8(out).ok()
}

/// Map a request target onto a regular file under `root`.
fn resolve(root: &Path, target: &str) -> Resolved {
  let path = target.split(['?', '#']).next().unwrap_or_default();
  let Some(decoded) = percent_decode(path) else {
    return Resolved::BadRequest;
  };

  let mut resolved = root.to_path_buf();
  for part in decoded.split('/') {
    match part {
      "" | "." => {}
      ".." => return Resolved::BadRequest,
      other => resolved.push(other),
    }
  }

  // Symlinks inside the snapshot must not lead out of it.
  match (dunce::canonicalize(&resolved), dunce::canonicalize(root)) {
    (Ok(real), Ok(real_root)) if real.starts_with(&real_root) && real.is_file() => Resolved::File(real),
    _ => Resolved::NotFound,
  }
}

async fn respond_status(stream: &mut TcpStream, status: &str, extra: &str) -> std::io::Result<()> {
  let head = format!("HTTP/1.1 {status}\r\n{extra}Content-Length: 0\r\nConnection: close\r\n\r\n");
  stream.write_all(head.as_bytes()).await
}

async fn serve_connection(mut stream: TcpStream, root: &Path) -> std::io::Result<()> {
  let mut reader = BufReader::new(&mut stream);
  let mut request_line = String::new();
  reader.read_line(&mut request_line).await?;

  // Drain the remaining headers.
  let mut consumed = request_line.len();
  loop {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    consumed += n;
    if n == 0 || line == "\r\n" || line == "\n" || consumed > MAX_HEAD_BYTES {
      break;
    }
  }
  drop(reader);

  if consumed > MAX_HEAD_BYTES {
    return respond_status(&mut stream, "431 Request Header Fields Too Large", "").await;
  }

  let mut parts = request_line.split_whitespace();
  let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
    return respond_status(&mut stream, "400 Bad Request", "").await;
  };
  debug!(method, target, "repo request");

  let head_only = match method {
    "GET" => false,
    "HEAD" => true,
    _ => return respond_status(&mut stream, "405 Method Not Allowed", "Allow: GET, HEAD\r\n").await,
  };

  let path = match resolve(root, target) {
    Resolved::File(path) => path,
    Resolved::BadRequest => return respond_status(&mut stream, "400 Bad Request", "").await,
    Resolved::NotFound => return respond_status(&mut stream, "404 Not Found", "").await,
  };

  let mut file = tokio::fs::File::open(&path).await?;
  let len = file.metadata().await?.len();
  let head = format!(
    "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n"
  );
  stream.write_all(head.as_bytes()).await?;
  if !head_only {
    tokio::io::copy(&mut file, &mut stream).await?;
  }
  stream.shutdown().await
}
