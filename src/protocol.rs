/// Wire protocol between clients and the supervisor.
///
/// Frames are a 4-byte big-endian length prefix followed by a JSON payload.
/// The transport layer in front of the supervisor authenticates the peer;
/// the identity it established travels in the `Hello` handshake and is the
/// owner of every job the connection starts.
use crate::types::{JobStatus, Result, TelePilotError};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use uuid::Uuid;

/// Upper bound on a frame body; rejects garbage length prefixes early.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The one answer given for unknown ids and foreign jobs alike, so callers
/// cannot probe for the existence of other users' jobs.
pub const PERMISSION_DENIED: &str = "permission denied";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// First message on every connection.
    Hello { user: String },
    Start { command: String, args: Vec<String> },
    Stop { id: Uuid },
    Status { id: Uuid },
    StreamLogs { id: Uuid },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Hello,
    Started { id: Uuid },
    Stopped,
    Status {
        status: JobStatus,
        /// Present only in a terminal status.
        exit_code: Option<i32>,
    },
    LogChunk { data: Vec<u8> },
    /// The job ended or the stream was cut; no more chunks follow.
    LogEnd,
    Error { message: String },
}

pub fn write_frame<T: Serialize>(w: &mut impl Write, msg: &T) -> Result<()> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| TelePilotError::Protocol(format!("encode frame: {}", e)))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| TelePilotError::Protocol("frame too large".to_string()))?;
    if len > MAX_FRAME_LEN {
        return Err(TelePilotError::Protocol("frame too large".to_string()));
    }
    w.write_all(&len.to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

pub fn read_frame<T: for<'de> Deserialize<'de>>(r: &mut impl Read) -> Result<T> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(TelePilotError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    serde_json::from_slice(&payload)
        .map_err(|e| TelePilotError::Protocol(format!("decode frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trip() {
        let request = Request::Start {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo hello".to_string()],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();

        let decoded: Request = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_status_response_keeps_exit_code_optional() {
        let mut buf = Vec::new();
        write_frame(
            &mut buf,
            &Response::Status {
                status: JobStatus::Running,
                exit_code: None,
            },
        )
        .unwrap();
        let decoded: Response = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(
            decoded,
            Response::Status {
                status: JobStatus::Running,
                exit_code: None,
            }
        );
    }

    #[test]
    fn test_log_chunk_preserves_raw_bytes() {
        let data = vec![0u8, 159, 146, 150, 255, 10];
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response::LogChunk { data: data.clone() }).unwrap();
        let decoded: Response = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, Response::LogChunk { data });
    }

    #[test]
    fn test_oversized_length_prefix_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        buf.extend_from_slice(b"junk");
        assert!(read_frame::<Request>(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Hello { user: "alice".to_string() }).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_frame::<Request>(&mut buf.as_slice()).is_err());
    }
}
