//! Binary wire protocol between edges and the controller
//!
//! Message format:
//! ```text
//! +----------+----------+----------+----------------------------------+
//! | Ver(1)   | Cmd(1)   | Len(2)   | Payload (JSON, variable)         |
//! +----------+----------+----------+----------------------------------+
//! ```
//!
//! The same framing carries control messages on the edge/controller
//! connection and tunneled IP packets between edges ([`Command::Packet`]).

use crate::error::{MeshError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size (1 byte version + 1 byte command + 2 bytes length)
pub const HEADER_SIZE: usize = 4;

/// Maximum body size: the length field is 16 bits, so this is a hard
/// message-size ceiling, not a tunable.
pub const MAX_BODY_SIZE: usize = 65535;

// =============================================================================
// Commands
// =============================================================================

/// Command discriminants carried in the header
///
/// Unknown bytes decode to [`Command::Unsupported`] so that protocol-evolution
/// mistakes surface in logs instead of silently dropping on the floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Keepalive between edge and controller (bidirectional)
    Heartbeat,
    /// Edge registration request / reply
    Register,
    /// Controller tells edges a peer came online
    Add,
    /// Controller tells edges a peer went offline
    Del,
    /// Edge reports traffic/host stats to the controller
    Report,
    /// Controller pushes an administrative route
    AddRoute,
    /// Controller withdraws an administrative route
    DelRoute,
    /// Edge raises an alarm to the controller
    Alarm,
    /// Controller orders the edge to tear down its control connection
    Exit,
    /// Tunneled IP packet between edges
    Packet,
    /// Any command byte this build does not know
    Unsupported(u8),
}

impl Command {
    /// Parse a command from its wire byte
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            1 => Self::Heartbeat,
            2 => Self::Register,
            3 => Self::Add,
            4 => Self::Del,
            5 => Self::Report,
            6 => Self::AddRoute,
            7 => Self::DelRoute,
            8 => Self::Alarm,
            9 => Self::Exit,
            10 => Self::Packet,
            other => Self::Unsupported(other),
        }
    }

    /// Convert to the wire byte
    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Heartbeat => 1,
            Self::Register => 2,
            Self::Add => 3,
            Self::Del => 4,
            Self::Report => 5,
            Self::AddRoute => 6,
            Self::DelRoute => 7,
            Self::Alarm => 8,
            Self::Exit => 9,
            Self::Packet => 10,
            Self::Unsupported(byte) => byte,
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header([u8; HEADER_SIZE]);

impl Header {
    /// Build a header for the given command and body length
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the body exceeds [`MAX_BODY_SIZE`].
    pub fn new(cmd: Command, body_len: usize) -> Result<Self> {
        if body_len > MAX_BODY_SIZE {
            return Err(MeshError::protocol(format!(
                "body too large: {body_len} bytes, max {MAX_BODY_SIZE}"
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = (body_len as u16).to_be_bytes();
        Ok(Self([PROTOCOL_VERSION, cmd.to_byte(), len[0], len[1]]))
    }

    /// Protocol version byte
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.0[0]
    }

    /// Command carried by this frame
    #[must_use]
    pub const fn cmd(&self) -> Command {
        Command::from_byte(self.0[1])
    }

    /// Body length in bytes
    #[must_use]
    pub const fn body_len(&self) -> usize {
        ((self.0[2] as usize) << 8) + self.0[3] as usize
    }

    /// Raw header bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HEADER_SIZE] {
        &self.0
    }
}

// =============================================================================
// Frame I/O
// =============================================================================

/// Read one frame from an ordered byte stream
///
/// Blocks until exactly [`HEADER_SIZE`] header bytes plus the advertised body
/// are available.
///
/// # Errors
///
/// Returns a connection error on short read or stream close.
pub async fn read_frame<R>(reader: &mut R) -> Result<(Header, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw).await?;
    let header = Header(raw);

    let body_len = header.body_len();
    if body_len == 0 {
        return Ok((header, Vec::new()));
    }

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

/// Write one frame to an ordered byte stream
///
/// Header and body are emitted as a single write so concurrent writers
/// serialized on the same stream never interleave partial frames.
///
/// # Errors
///
/// Returns a protocol error if the body exceeds [`MAX_BODY_SIZE`], or a
/// connection error if the write fails.
pub async fn write_frame<W>(writer: &mut W, cmd: Command, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = Header::new(cmd, body.len())?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    Ok(())
}

/// Write a frame with a JSON-encoded body
///
/// # Errors
///
/// Returns a protocol error on serialization failure or oversized body, or a
/// connection error if the write fails.
pub async fn write_json<W, T>(writer: &mut W, cmd: Command, obj: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + Sync,
{
    let body = serde_json::to_vec(obj)
        .map_err(|e| MeshError::protocol(format!("encode body: {e}")))?;
    write_frame(writer, cmd, &body).await
}

/// Read a frame and decode its body as JSON
///
/// # Errors
///
/// Returns a connection error on short read, or a protocol error if the body
/// is not valid JSON for `T`.
pub async fn read_json<R, T>(reader: &mut R) -> Result<(Header, T)>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let (header, body) = read_frame(reader).await?;
    let obj = serde_json::from_slice(&body)
        .map_err(|e| MeshError::protocol(format!("decode body: {e}")))?;
    Ok((header, obj))
}

// =============================================================================
// Message bodies
// =============================================================================

/// A peer edge as seen on the wire: where to dial it and what it fronts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EdgeInfo {
    /// Public `ip:port` other edges dial for data traffic
    #[serde(rename = "listenAddr")]
    pub listen_addr: String,
    /// The subnet this edge fronts
    pub cidr: String,
}

/// An administrative route entry as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RouteInfo {
    /// Destination subnet
    pub cidr: String,
    /// Listen address of the edge that receives traffic for `cidr`
    pub nexthop: String,
    /// Route name, unique within its namespace
    pub name: String,
}

/// Cloud provider credentials handed to an edge at registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CspInfo {
    /// Provider identifier, e.g. `ali-vpc` or `aws-vpc`
    #[serde(rename = "type")]
    pub csp_type: String,
    /// Provider API access key
    #[serde(rename = "accessKey")]
    pub access_key: String,
    /// Provider API access secret
    #[serde(rename = "accessSecret")]
    pub access_secret: String,
}

/// Edge registration request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisterReq {
    /// Tenant namespace the edge claims to belong to
    pub namespace: String,
    /// Edge name, unique within the namespace
    pub name: String,
    /// Shared secret proving namespace membership
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    /// Publicly visible IP, for deployments where the source address
    /// is not the edge's public one
    #[serde(rename = "publicIP", default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
}

/// Reply to a successful registration: the full topology snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegisterReply {
    /// All other edges currently configured in the namespace
    #[serde(rename = "edgeList")]
    pub edge_list: Vec<EdgeInfo>,
    /// All routes in the namespace except those pointing back at this edge
    pub routes: Vec<RouteInfo>,
    /// Cloud provider credentials, when the edge has a CSP configured
    #[serde(rename = "cspInfo", default, skip_serializing_if = "Option::is_none")]
    pub csp_info: Option<CspInfo>,
}

/// Broadcast body: an edge came online (or was modified)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BroadcastOnlineMsg {
    /// Listen address of the edge that came online
    #[serde(rename = "listenAddr")]
    pub listen_addr: String,
    /// Subnet the edge fronts
    pub cidr: String,
}

/// Broadcast body: an edge went offline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BroadcastOfflineMsg {
    /// Listen address of the edge that went offline
    #[serde(rename = "listenAddr")]
    pub listen_addr: String,
    /// Subnet the edge fronted
    pub cidr: String,
}

/// Broadcast body: an administrative route was added
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AddRouteMsg {
    /// Destination subnet
    pub cidr: String,
    /// Listen address of the edge receiving traffic for `cidr`
    pub nexthop: String,
}

/// Broadcast body: an administrative route was removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DelRouteMsg {
    /// Destination subnet
    pub cidr: String,
    /// Listen address the route pointed at
    pub nexthop: String,
}

/// Periodic edge report: traffic counters and host samples since last report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReportMsg {
    /// Unix timestamp (seconds) when the report was taken
    pub timestamp: i64,
    /// Process CPU usage percent
    pub cpu: i32,
    /// Host memory usage percent
    pub mem: i32,
    /// Bytes received from peers since the last report
    #[serde(rename = "trafficIn")]
    pub traffic_in: i64,
    /// Bytes sent to peers since the last report
    #[serde(rename = "trafficOut")]
    pub traffic_out: i64,
    /// Error samples accumulated since the last report
    pub errors: Vec<String>,
}

/// Alarm raised by an edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AlarmMsg {
    /// Human-readable alarm text
    pub message: String,
}

/// Heartbeat body (empty)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Heartbeat {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a frame into a buffer and read it back
    async fn roundtrip(cmd: Command, body: &[u8]) {
        let (mut client, mut server) = tokio::io::duplex(MAX_BODY_SIZE + HEADER_SIZE);
        write_frame(&mut client, cmd, body).await.expect("write");
        let (header, read_body) = read_frame(&mut server).await.expect("read");
        assert_eq!(header.version(), PROTOCOL_VERSION);
        assert_eq!(header.cmd(), cmd);
        assert_eq!(read_body, body);
    }

    #[tokio::test]
    async fn test_frame_roundtrip_empty_body() {
        roundtrip(Command::Heartbeat, &[]).await;
    }

    #[tokio::test]
    async fn test_frame_roundtrip_small_body() {
        roundtrip(Command::Register, br#"{"name":"edge-1"}"#).await;
    }

    #[tokio::test]
    async fn test_frame_roundtrip_max_body() {
        let body = vec![0xAB; MAX_BODY_SIZE];
        roundtrip(Command::Packet, &body).await;
    }

    #[tokio::test]
    async fn test_frame_roundtrip_all_commands() {
        for cmd in [
            Command::Heartbeat,
            Command::Register,
            Command::Add,
            Command::Del,
            Command::Report,
            Command::AddRoute,
            Command::DelRoute,
            Command::Alarm,
            Command::Exit,
            Command::Packet,
        ] {
            roundtrip(cmd, b"x").await;
        }
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_write() {
        let (mut client, _server) = tokio::io::duplex(64);
        let body = vec![0u8; MAX_BODY_SIZE + 1];
        let err = write_frame(&mut client, Command::Packet, &body)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_read_short_stream() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 1]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_read_truncated_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // Header claims 16 bytes of body, only 3 arrive.
        client.write_all(&[1, 1, 0, 16, 0xAA, 0xBB, 0xCC]).await.unwrap();
        drop(client);
        assert!(read_frame(&mut server).await.is_err());
    }

    #[tokio::test]
    async fn test_multiple_frames_on_one_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);
        write_frame(&mut client, Command::Heartbeat, b"").await.unwrap();
        write_frame(&mut client, Command::Add, b"abc").await.unwrap();
        write_frame(&mut client, Command::Del, b"defg").await.unwrap();

        let (h1, b1) = read_frame(&mut server).await.unwrap();
        let (h2, b2) = read_frame(&mut server).await.unwrap();
        let (h3, b3) = read_frame(&mut server).await.unwrap();
        assert_eq!((h1.cmd(), b1.as_slice()), (Command::Heartbeat, &b""[..]));
        assert_eq!((h2.cmd(), b2.as_slice()), (Command::Add, &b"abc"[..]));
        assert_eq!((h3.cmd(), b3.as_slice()), (Command::Del, &b"defg"[..]));
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let req = RegisterReq {
            namespace: "ns".to_string(),
            name: "edge-1".to_string(),
            secret_key: "s3cret".to_string(),
            public_ip: Some("203.0.113.7".to_string()),
        };
        write_json(&mut client, Command::Register, &req).await.unwrap();
        let (header, decoded): (Header, RegisterReq) = read_json(&mut server).await.unwrap();
        assert_eq!(header.cmd(), Command::Register);
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn test_json_malformed_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, Command::Add, b"not json").await.unwrap();
        let err = read_json::<_, BroadcastOnlineMsg>(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Protocol { .. }));
    }

    #[test]
    fn test_command_byte_mapping() {
        for byte in 1..=10u8 {
            let cmd = Command::from_byte(byte);
            assert!(!matches!(cmd, Command::Unsupported(_)), "byte {byte}");
            assert_eq!(cmd.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_command_is_visible() {
        let cmd = Command::from_byte(0xEE);
        assert_eq!(cmd, Command::Unsupported(0xEE));
        assert_eq!(cmd.to_byte(), 0xEE);
    }

    #[test]
    fn test_wire_field_names() {
        let reply = RegisterReply {
            edge_list: vec![EdgeInfo {
                listen_addr: "a:1".to_string(),
                cidr: "10.1.0.0/24".to_string(),
            }],
            routes: vec![],
            csp_info: Some(CspInfo {
                csp_type: "ali-vpc".to_string(),
                access_key: "ak".to_string(),
                access_secret: "as".to_string(),
            }),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert!(json.get("edgeList").is_some());
        assert!(json["edgeList"][0].get("listenAddr").is_some());
        assert_eq!(json["cspInfo"]["type"], "ali-vpc");
        assert_eq!(json["cspInfo"]["accessKey"], "ak");

        let report = ReportMsg::default();
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("trafficIn").is_some());
        assert!(json.get("trafficOut").is_some());
    }

    #[test]
    fn test_register_req_public_ip_optional() {
        let req: RegisterReq =
            serde_json::from_str(r#"{"namespace":"ns","name":"e","secretKey":"k"}"#).unwrap();
        assert!(req.public_ip.is_none());
    }
}
