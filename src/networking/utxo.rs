//! BIP64 `getutxos` / `utxos` payload codec.
//!
//! rust-bitcoin does not ship these messages, so they ride in
//! `NetworkMessage::Unknown` frames and the payloads are coded here. The
//! reply's bitmap marks which queried outpoints came back with a result.

use bitcoin::consensus::encode::{self, VarInt};
use bitcoin::p2p::message::CommandString;
use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, TxOut};

use super::error::NetworkError;

pub const GETUTXOS_COMMAND: &str = "getutxos";
pub const UTXOS_COMMAND: &str = "utxos";

/// One unspent output as reported by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script: ScriptBuf,
    /// Confirmation height; `None` for mempool outputs.
    pub height: Option<u32>,
}

/// Decoded `utxos` reply, still in query order.
#[derive(Debug, Clone)]
pub struct UtxosReply {
    pub chain_height: u32,
    pub chain_tip: BlockHash,
    /// One slot per queried outpoint; `None` means spent or unknown.
    pub entries: Vec<Option<UtxoEntry>>,
}

pub fn getutxos_command() -> CommandString {
    CommandString::try_from_static(GETUTXOS_COMMAND).expect("static command fits")
}

/// Serialize a BIP64 query payload.
pub fn encode_getutxos(outpoints: &[OutPoint], include_mempool: bool) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + 9 + outpoints.len() * 36);
    payload.push(include_mempool as u8);
    payload.extend_from_slice(&encode::serialize(&VarInt(outpoints.len() as u64)));
    for outpoint in outpoints {
        payload.extend_from_slice(&encode::serialize(outpoint));
    }
    payload
}

/// Parse a BIP64 reply against the `n_queried` outpoints of the request.
pub fn decode_utxos(payload: &[u8], n_queried: usize) -> Result<UtxosReply, NetworkError> {
    let mut cursor = Cursor::new(payload);
    let chain_height: u32 = cursor.consensus()?;
    let chain_tip: BlockHash = cursor.consensus()?;
    let bitmap_len: VarInt = cursor.consensus()?;
    let bitmap = cursor.take(bitmap_len.0 as usize)?.to_vec();

    let mut entries = Vec::with_capacity(n_queried);
    for index in 0..n_queried {
        let present = bitmap
            .get(index / 8)
            .map(|byte| byte & (1 << (index % 8)) != 0)
            .unwrap_or(false);
        if !present {
            entries.push(None);
            continue;
        }
        let _tx_version: u32 = cursor.consensus()?;
        let height: u32 = cursor.consensus()?;
        let output: TxOut = cursor.consensus()?;
        entries.push(Some(UtxoEntry {
            value: output.value,
            script: output.script_pubkey,
            height: if height == 0x7fff_ffff { None } else { Some(height) },
        }));
    }
    Ok(UtxosReply { chain_height, chain_tip, entries })
}

/// Byte cursor over a peer payload with consensus decoding.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn consensus<T: bitcoin::consensus::Decodable>(&mut self) -> Result<T, NetworkError> {
        let (value, consumed) = encode::deserialize_partial(&self.bytes[self.pos..])
            .map_err(|e| NetworkError::Protocol(format!("bad utxos payload: {e}")))?;
        self.pos += consumed;
        Ok(value)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], NetworkError> {
        if self.pos + len > self.bytes.len() {
            return Err(NetworkError::Protocol("truncated utxos payload".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}
