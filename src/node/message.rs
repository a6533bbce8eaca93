use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed width of the command header on the wire.
pub const COMMAND_LENGTH: usize = 12;

/// Protocol version announced in `version` messages.
pub const NODE_VERSION: u64 = 1;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("message is shorter than the command header")]
    ShortMessage,

    #[error("payload encoding failed: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("payload decoding failed: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// The closed set of wire commands. Each is framed as a 12-byte null-padded
/// ASCII name followed by its bincode payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Version,
    Addr,
    Inv,
    /// Kept under its historical wire spelling for cross-node compatibility.
    GetBlocks,
    GetData,
    Block,
    Tx,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Version => "version",
            Command::Addr => "addr",
            Command::Inv => "inv",
            Command::GetBlocks => "getblcoks",
            Command::GetData => "getdata",
            Command::Block => "block",
            Command::Tx => "tx",
        }
    }

    pub fn to_bytes(self) -> [u8; COMMAND_LENGTH] {
        let mut bytes = [0u8; COMMAND_LENGTH];
        bytes[..self.as_str().len()].copy_from_slice(self.as_str().as_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Command, WireError> {
        if bytes.len() < COMMAND_LENGTH {
            return Err(WireError::ShortMessage);
        }
        let name: Vec<u8> = bytes[..COMMAND_LENGTH]
            .iter()
            .copied()
            .filter(|&b| b != 0)
            .collect();
        let name = String::from_utf8_lossy(&name).into_owned();

        match name.as_str() {
            "version" => Ok(Command::Version),
            "addr" => Ok(Command::Addr),
            "inv" => Ok(Command::Inv),
            "getblcoks" => Ok(Command::GetBlocks),
            "getdata" => Ok(Command::GetData),
            "block" => Ok(Command::Block),
            "tx" => Ok(Command::Tx),
            _ => Err(WireError::UnknownCommand(name)),
        }
    }
}

/// Kind selector used by `inv` and `getdata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct VersionPayload {
    pub version: u64,
    pub best_height: u64,
    pub addr_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct AddrPayload {
    pub addr_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct GetBlocksPayload {
    pub addr_from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct InvPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct GetDataPayload {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct BlockPayload {
    pub addr_from: String,
    pub block: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Encode, Decode)]
pub struct TxPayload {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

/// Frame a command and payload into one wire message.
pub fn frame<P: Encode>(command: Command, payload: &P) -> Result<Vec<u8>, WireError> {
    let mut message = command.to_bytes().to_vec();
    message.extend(bincode::encode_to_vec(
        payload,
        bincode::config::standard(),
    )?);
    Ok(message)
}

/// Decode the payload portion of a received message.
pub fn decode_payload<P: Decode<()>>(message: &[u8]) -> Result<P, WireError> {
    if message.len() < COMMAND_LENGTH {
        return Err(WireError::ShortMessage);
    }
    let (payload, _) =
        bincode::decode_from_slice(&message[COMMAND_LENGTH..], bincode::config::standard())?;
    Ok(payload)
}
