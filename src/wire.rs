use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum number of inventory vectors a single getdata/inv message may carry.
pub const MAX_INV_PER_MSG: usize = 50_000;

pub type Hash256 = [u8; 32];

/// All-zero hash. Terminates getblocks/getheaders ranges.
pub const ZERO_HASH: Hash256 = [0u8; 32];

// Service bits advertised in the version handshake.
pub const SERVICE_NODE_NETWORK: u64 = 1;
pub const SERVICE_NODE_WITNESS: u64 = 1 << 3;
pub const SERVICE_NODE_UTREEXO: u64 = 1 << 24;

pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// Render a hash the way block explorers print them (reversed byte order).
pub fn hash_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum InvType {
    Block,
    UBlock,
    Tx,
    WitnessBlock,
    WitnessUBlock,
    WitnessTx,
}

impl InvType {
    pub fn is_block(self) -> bool {
        matches!(self, InvType::Block | InvType::WitnessBlock)
    }

    pub fn is_ublock(self) -> bool {
        matches!(self, InvType::UBlock | InvType::WitnessUBlock)
    }

    pub fn is_tx(self) -> bool {
        matches!(self, InvType::Tx | InvType::WitnessTx)
    }

    /// The witness-carrying variant of this inventory type.
    pub fn to_witness(self) -> InvType {
        match self {
            InvType::Block => InvType::WitnessBlock,
            InvType::UBlock => InvType::WitnessUBlock,
            InvType::Tx => InvType::WitnessTx,
            other => other,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct InvVect {
    pub inv_type: InvType,
    pub hash: Hash256,
}

impl InvVect {
    pub fn new(inv_type: InvType, hash: Hash256) -> Self {
        Self { inv_type, hash }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn block_hash(&self) -> Hash256 {
        sha256d(&bincode::serialize(self).expect("header serialization is infallible"))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_out: OutPoint,
    pub script_sig: Vec<u8>,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// Transaction id over the witness-stripped encoding.
    pub fn txid(&self) -> Hash256 {
        let stripped = Transaction {
            version: self.version,
            inputs: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    prev_out: input.prev_out,
                    script_sig: input.script_sig.clone(),
                    witness: Vec::new(),
                })
                .collect(),
            outputs: self.outputs.clone(),
            lock_time: self.lock_time,
        };
        sha256d(&bincode::serialize(&stripped).expect("tx serialization is infallible"))
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn block_hash(&self) -> Hash256 {
        self.header.block_hash()
    }
}

/// Accumulator data attached to a ublock: the inclusion proof for every
/// output the block spends plus time-to-live hints for the outputs it
/// creates.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UData {
    pub proof_targets: Vec<u64>,
    pub proof_hashes: Vec<Hash256>,
    pub leaf_ttls: Vec<u32>,
}

/// A block plus the accumulator proof a compact-state node needs to verify
/// it. The height is filled in from the verified header chain.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct UBlock {
    pub block: Block,
    pub udata: UData,
    pub height: i32,
}

impl UBlock {
    pub fn block_hash(&self) -> Hash256 {
        self.block.block_hash()
    }
}

/// Either flavor of block the sync manager moves through its pipeline. The
/// two are the same procedure almost everywhere; dispatch happens only at
/// chain submission and inv-type selection.
#[derive(Clone, Debug)]
pub enum AnyBlock {
    Plain(Arc<Block>),
    Utreexo(Arc<UBlock>),
}

impl AnyBlock {
    pub fn hash(&self) -> Hash256 {
        match self {
            AnyBlock::Plain(block) => block.block_hash(),
            AnyBlock::Utreexo(ublock) => ublock.block_hash(),
        }
    }

    pub fn header(&self) -> &BlockHeader {
        match self {
            AnyBlock::Plain(block) => &block.header,
            AnyBlock::Utreexo(ublock) => &ublock.block.header,
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        match self {
            AnyBlock::Plain(block) => &block.transactions,
            AnyBlock::Utreexo(ublock) => &ublock.block.transactions,
        }
    }

    pub fn is_utreexo(&self) -> bool {
        matches!(self, AnyBlock::Utreexo(_))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

/// Outbound protocol messages the sync manager asks a peer to send.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    GetHeaders { locator: Vec<Hash256>, stop_hash: Hash256 },
    GetBlocks { locator: Vec<Hash256>, stop_hash: Hash256 },
    GetUBlocks { locator: Vec<Hash256>, stop_hash: Hash256 },
    Headers(Vec<BlockHeader>),
    NotFound(Vec<InvVect>),
    Reject {
        message: String,
        code: RejectCode,
        reason: String,
        hash: Hash256,
    },
    Ping { nonce: u64 },
    Pong { nonce: u64 },
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message serialization is infallible")
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn witness_upgrade_covers_all_base_types() {
        assert_eq!(InvType::Block.to_witness(), InvType::WitnessBlock);
        assert_eq!(InvType::UBlock.to_witness(), InvType::WitnessUBlock);
        assert_eq!(InvType::Tx.to_witness(), InvType::WitnessTx);
        assert_eq!(InvType::WitnessTx.to_witness(), InvType::WitnessTx);
    }

    #[test]
    fn txid_ignores_witness_data() {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_out: OutPoint { hash: [1u8; 32], index: 0 },
                script_sig: vec![0x51],
                witness: Vec::new(),
            }],
            outputs: vec![TxOut { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
        };
        let bare = tx.txid();
        tx.inputs[0].witness = vec![vec![0xaa; 16]];
        assert!(tx.has_witness());
        assert_eq!(tx.txid(), bare);
    }

    #[test]
    fn message_round_trips_through_bincode() {
        let msg = Message::GetHeaders {
            locator: vec![[7u8; 32]],
            stop_hash: ZERO_HASH,
        };
        let decoded = Message::deserialize(&msg.serialize()).unwrap();
        match decoded {
            Message::GetHeaders { locator, stop_hash } => {
                assert_eq!(locator, vec![[7u8; 32]]);
                assert_eq!(stop_hash, ZERO_HASH);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn hex_rendering_reverses_byte_order() {
        let mut hash = [0u8; 32];
        hash[31] = 0xab;
        assert!(hash_to_hex(&hash).starts_with("ab"));
    }
}
