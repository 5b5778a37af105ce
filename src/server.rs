/// TCP front-end dispatching client requests onto the job manager.
///
/// One thread per connection; the first frame is the `Hello` handshake
/// carrying the identity the transport authenticated. All ownership
/// decisions happen here, above the core: the manager itself knows nothing
/// about principals beyond storing the owner string.
use crate::job::Job;
use crate::manager::JobManager;
use crate::protocol::{self, Request, Response, PERMISSION_DENIED};
use crate::types::{Result, TelePilotError};
use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9090";

const LOG_CHUNK_SIZE: usize = 32 * 1024;

pub struct Server {
    manager: Arc<JobManager>,
}

impl Server {
    pub fn new(manager: Arc<JobManager>) -> Self {
        Server { manager }
    }

    /// Bind `addr` and serve until the process exits.
    pub fn serve(&self, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| TelePilotError::Io(std::io::Error::new(e.kind(), format!("listen on {}: {}", addr, e))))?;
        self.serve_listener(listener)
    }

    /// Serve on an already-bound listener.
    pub fn serve_listener(&self, listener: TcpListener) -> Result<()> {
        log::info!(
            "Server listening on {}",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".to_string())
        );
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let manager = Arc::clone(&self.manager);
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &manager) {
                            log::debug!("Connection ended: {}", e);
                        }
                    });
                }
                Err(e) => log::warn!("Accept error: {}", e),
            }
        }
        Ok(())
    }
}

fn handle_connection(stream: TcpStream, manager: &JobManager) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let user = match protocol::read_frame::<Request>(&mut reader)? {
        Request::Hello { user } if !user.is_empty() => user,
        _ => {
            protocol::write_frame(
                &mut writer,
                &Response::Error {
                    message: "expected hello".to_string(),
                },
            )?;
            return Ok(());
        }
    };
    protocol::write_frame(&mut writer, &Response::Hello)?;

    loop {
        let request = match protocol::read_frame::<Request>(&mut reader) {
            Ok(request) => request,
            // Client hung up between requests; a normal end of session.
            Err(TelePilotError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        dispatch(request, &user, manager, &mut writer)?;
    }
}

fn dispatch(
    request: Request,
    user: &str,
    manager: &JobManager,
    writer: &mut impl Write,
) -> Result<()> {
    match request {
        Request::Hello { .. } => protocol::write_frame(
            writer,
            &Response::Error {
                message: "unexpected hello".to_string(),
            },
        ),
        Request::Start { command, args } => match manager.start_job(user, &command, &args) {
            Ok(id) => {
                log::info!("Job {} started by {}: {} {:?}", id, user, command, args);
                protocol::write_frame(writer, &Response::Started { id })
            }
            Err(e) => {
                log::warn!("Start for {} failed: {}", user, e);
                protocol::write_frame(
                    writer,
                    &Response::Error {
                        message: e.to_string(),
                    },
                )
            }
        },
        Request::Stop { id } => {
            let result = authorize(manager, &id, user).and_then(|_| manager.stop_job(&id));
            match result {
                Ok(()) => protocol::write_frame(writer, &Response::Stopped),
                Err(e) => write_error(writer, e),
            }
        }
        Request::Status { id } => {
            let result = authorize(manager, &id, user).map(|job| job.status());
            match result {
                Ok((status, exit_code)) => protocol::write_frame(
                    writer,
                    &Response::Status {
                        status,
                        exit_code: status.is_terminal().then_some(exit_code),
                    },
                ),
                Err(e) => write_error(writer, e),
            }
        }
        Request::StreamLogs { id } => {
            let result = authorize(manager, &id, user).and_then(|_| manager.stream_logs(&id));
            let mut stream = match result {
                Ok(stream) => stream,
                Err(e) => return write_error(writer, e),
            };
            let mut buf = [0u8; LOG_CHUNK_SIZE];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => protocol::write_frame(
                        writer,
                        &Response::LogChunk {
                            data: buf[..n].to_vec(),
                        },
                    )?,
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        log::debug!("Log stream for job {} ended: {}", id, e);
                        break;
                    }
                }
            }
            protocol::write_frame(writer, &Response::LogEnd)
        }
    }
}

/// Ownership policy: the creator of a job is the only principal allowed to
/// touch it. Unknown ids and foreign jobs are indistinguishable to the
/// caller.
fn authorize(manager: &JobManager, id: &Uuid, user: &str) -> Result<Arc<Job>> {
    match manager.lookup(id) {
        Ok(job) if job.owner == user => Ok(job),
        Ok(_) | Err(TelePilotError::JobNotFound) => {
            Err(TelePilotError::Remote(PERMISSION_DENIED.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn write_error(writer: &mut impl Write, err: TelePilotError) -> Result<()> {
    protocol::write_frame(
        writer,
        &Response::Error {
            message: err.to_string(),
        },
    )
}
