//! Scripted in-process dqlite server.
//!
//! [`TestServer`] listens on a loopback port, reads the handshake and then
//! answers each request frame with whatever its handler returns. It knows
//! nothing about SQL; tests script the answers.
//!
//! ```ignore
//! let server = TestServer::leader(|request| match request {
//!     Request::QuerySql { .. } => vec![rows(&["1"], vec![vec![Value::BigInt(1)]])],
//!     _ => vec![Response::Empty],
//! })?;
//! let conn = DqliteConnection::connect(DqliteConfig::from_address(server.address()))?;
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use dqlite_core::Value;
use dqlite_core::error::SQLITE_IOERR_NOT_LEADER;
use dqlite_wire::{HEADER_SIZE, Header, NodeInfo, NodeRole, Request, Response, RowsBatch, WORD_SIZE};

type Handler = dyn Fn(&str, &Request) -> Vec<Response> + Send + Sync;

/// A loopback server answering dqlite frames from a handler.
pub struct TestServer {
    address: String,
    requests: Arc<Mutex<Vec<Request>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
    accept: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl TestServer {
    /// Start a server. The handler gets the server's own address and the
    /// decoded request.
    pub fn start<F>(handler: F) -> io::Result<Self>
    where
        F: Fn(&str, &Request) -> Vec<Response> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?.to_string();
        let handler: Arc<Handler> = Arc::new(handler);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept = {
            let address = address.clone();
            let requests = Arc::clone(&requests);
            let connections = Arc::clone(&connections);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let Ok(stream) = stream else { continue };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let handler = Arc::clone(&handler);
                    let requests = Arc::clone(&requests);
                    let address = address.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = serve(stream, &address, handler.as_ref(), &requests) {
                            tracing::trace!(error = %e, "test server connection ended");
                        }
                    });
                }
            })
        };

        Ok(Self {
            address,
            requests,
            connections,
            shutdown,
            accept: Some(accept),
        })
    }

    /// A leader that answers the session requests itself and hands
    /// statement requests to `statements`.
    pub fn leader<F>(statements: F) -> io::Result<Self>
    where
        F: Fn(&Request) -> Vec<Response> + Send + Sync + 'static,
    {
        Self::start(move |own, request| {
            session_reply(own, own, request).unwrap_or_else(|| statements(request))
        })
    }

    /// A follower that points every client at `leader` and refuses
    /// statements with "not leader".
    pub fn follower(leader: impl Into<String>) -> io::Result<Self> {
        let leader = leader.into();
        Self::start(move |_, request| match request {
            Request::Leader => vec![Response::Server {
                id: 1,
                address: leader.clone(),
            }],
            _ => vec![not_leader()],
        })
    }

    /// A node that knows of no leader.
    pub fn leaderless() -> io::Result<Self> {
        Self::start(|_, request| match request {
            Request::Leader => vec![Response::Server {
                id: 0,
                address: String::new(),
            }],
            _ => vec![not_leader()],
        })
    }

    /// `host:port` the server listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Every request received so far, across connections.
    pub fn requests(&self) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of accepted TCP connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the accept loop.
        TcpStream::connect(&self.address).ok();
        if let Some(handle) = self.accept.take() {
            handle.join().ok();
        }
    }
}

/// Standard answers to the requests that set up a session.
///
/// `own` is the node's address and `leader` the address it reports.
pub fn session_reply(own: &str, leader: &str, request: &Request) -> Option<Vec<Response>> {
    let reply = match request {
        Request::Leader => Response::Server {
            id: 1,
            address: leader.to_string(),
        },
        Request::Client { .. } => Response::Welcome {
            heartbeat_timeout: 15_000,
        },
        Request::Open { .. } => Response::Db { id: 0 },
        Request::Cluster { .. } => Response::Servers(vec![NodeInfo {
            id: 1,
            address: own.to_string(),
            role: NodeRole::Voter,
        }]),
        Request::Describe { .. } => Response::Metadata {
            failure_domain: 0,
            weight: 0,
        },
        Request::Interrupt { .. } => Response::Empty,
        Request::Heartbeat { .. } => Response::Empty,
        _ => return None,
    };
    Some(vec![reply])
}

/// A final `Rows` batch.
pub fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Response {
    Response::Rows(RowsBatch {
        columns: columns.iter().map(|c| (*c).to_string()).collect(),
        rows,
        more: false,
    })
}

/// A `Result` response.
pub fn exec_result(last_insert_id: u64, rows_affected: u64) -> Response {
    Response::Result {
        last_insert_id,
        rows_affected,
    }
}

/// The failure a follower sends for statements.
pub fn not_leader() -> Response {
    Response::Failure {
        code: SQLITE_IOERR_NOT_LEADER,
        message: "not leader".to_string(),
    }
}

fn serve(
    mut stream: TcpStream,
    own: &str,
    handler: &Handler,
    requests: &Mutex<Vec<Request>>,
) -> io::Result<()> {
    let mut handshake = [0u8; WORD_SIZE];
    stream.read_exact(&mut handshake)?;

    loop {
        let mut raw = [0u8; HEADER_SIZE];
        stream.read_exact(&mut raw)?;
        let header = Header::from_bytes(&raw);
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body)?;

        let replies = match Request::decode(&header, &body) {
            Ok(request) => {
                let replies = handler(own, &request);
                requests
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(request);
                replies
            }
            Err(e) => vec![Response::Failure {
                code: 1,
                message: e.to_string(),
            }],
        };
        for reply in replies {
            let frame = reply
                .encode()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            stream.write_all(&frame)?;
        }
        stream.flush()?;
    }
}
