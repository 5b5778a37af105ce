/// Blocking client for the supervisor's wire protocol; the CLI's backend.
use crate::protocol::{self, Request, Response};
use crate::types::{JobStatus, Result, TelePilotError};
use std::io::{BufReader, BufWriter, Write};
use std::net::TcpStream;
use uuid::Uuid;

pub struct ApiClient {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl ApiClient {
    /// Connect and identify as `user`.
    pub fn connect(addr: &str, user: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| TelePilotError::Io(std::io::Error::new(e.kind(), format!("connect {}: {}", addr, e))))?;
        let mut client = ApiClient {
            reader: BufReader::new(stream.try_clone()?),
            writer: BufWriter::new(stream),
        };
        match client.call(&Request::Hello {
            user: user.to_string(),
        })? {
            Response::Hello => Ok(client),
            other => Err(unexpected(other)),
        }
    }

    pub fn start_job(&mut self, command: &str, args: &[String]) -> Result<Uuid> {
        match self.call(&Request::Start {
            command: command.to_string(),
            args: args.to_vec(),
        })? {
            Response::Started { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn stop_job(&mut self, id: &Uuid) -> Result<()> {
        match self.call(&Request::Stop { id: *id })? {
            Response::Stopped => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn job_status(&mut self, id: &Uuid) -> Result<(JobStatus, Option<i32>)> {
        match self.call(&Request::Status { id: *id })? {
            Response::Status { status, exit_code } => Ok((status, exit_code)),
            other => Err(unexpected(other)),
        }
    }

    /// Stream the job's merged output into `out` until the job ends or the
    /// server cuts the stream.
    pub fn stream_logs(&mut self, id: &Uuid, out: &mut dyn Write) -> Result<()> {
        protocol::write_frame(&mut self.writer, &Request::StreamLogs { id: *id })?;
        loop {
            match protocol::read_frame::<Response>(&mut self.reader)? {
                Response::LogChunk { data } => out.write_all(&data)?,
                Response::LogEnd => return Ok(()),
                Response::Error { message } => return Err(TelePilotError::Remote(message)),
                other => return Err(unexpected(other)),
            }
        }
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        protocol::write_frame(&mut self.writer, request)?;
        match protocol::read_frame::<Response>(&mut self.reader)? {
            Response::Error { message } => Err(TelePilotError::Remote(message)),
            response => Ok(response),
        }
    }
}

fn unexpected(response: Response) -> TelePilotError {
    TelePilotError::Protocol(format!("unexpected response: {:?}", response))
}
