// Text protocol spoken between courier clients and the broker.
//
// Every operation is a single control line terminated by CRLF. `PUB`, `HPUB`,
// `MSG` and `HMSG` announce a byte count and are followed by exactly that many
// payload bytes plus a trailing CRLF, so payloads may contain anything.
pub mod codec;
pub mod op;

pub use codec::{
    ClientCodec, HEADER_VERSION_LINE, MAX_CONTROL_LINE, ServerCodec, decode_client_op,
    decode_headers, decode_server_op, encode_client_op, encode_headers, encode_server_op,
    encoded_headers_len,
};
pub use op::{ClientOp, ConnectInfo, HeaderList, ServerInfo, ServerOp};

pub const PROTOCOL_VERSION: u8 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown protocol operation {0:?}")]
    UnknownOperation(String),
    #[error("invalid {op} arguments: {reason}")]
    InvalidArguments { op: &'static str, reason: String },
    #[error("maximum payload violation ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("control line longer than {0} bytes")]
    LineTooLong(usize),
    #[error("payload not terminated by CRLF")]
    MissingTerminator,
    #[error("invalid header block")]
    InvalidHeaders,
    #[error("control line is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid json body")]
    Json(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Text sent back to the peer in `-ERR '...'` before closing.
    pub fn protocol_text(&self) -> &'static str {
        match self {
            Error::PayloadTooLarge { .. } => "Maximum Payload Violation",
            Error::Io(_) => "Read Error",
            _ => "Unknown Protocol Operation",
        }
    }
}
