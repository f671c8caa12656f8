//! Archivas Core Library
//!
//! A Proof-of-Space-and-Time chain: farmers search precomputed plots for
//! proofs against a VDF-gated challenge, the node links accepted blocks,
//! applies account transfers and keeps peers in sync.

pub mod config;
pub mod consensus;
pub mod crypto;
pub mod farmer;
pub mod ibd;
pub mod ledger;
pub mod mempool;
pub mod metrics;
pub mod node;
pub mod p2p;
pub mod pospace;
pub mod rpc;
pub mod storage;
pub mod vdf;

/// Protocol constants
pub mod constants {
    /// Number of decimal places of the native denomination
    pub const DECIMALS: u8 = 8;

    /// Base units per RCHV
    pub const BASE_UNITS_PER_COIN: i64 = 100_000_000;

    /// Denomination symbol
    pub const DENOM_SYMBOL: &str = "RCHV";

    /// Block reward paid to the farmer by the coinbase (20 RCHV)
    pub const INITIAL_BLOCK_REWARD: i64 = 20 * BASE_UNITS_PER_COIN;

    /// Sender marker of the coinbase transaction
    pub const COINBASE_SENDER: &str = "coinbase";

    /// Bech32 human-readable prefix for addresses
    pub const BECH32_HRP: &str = "arcv";

    /// Seed string hashed into the genesis challenge
    pub const GENESIS_CHALLENGE_SEED: &str = "Archivas Devnet Genesis";

    /// Difficulty parameter set advertised in the handshake
    pub const DIFFICULTY_PARAMS_ID: &str = "v2-normalized-qmax1e12";

    /// Software version string carried in handshakes and /version
    pub const NODE_VERSION: &str = "v1.1.1-ibd";

    /// Deepest reorganization the node will perform
    pub const MAX_REORG_DEPTH: u64 = 100;

    /// Upper bound on blocks served per range request
    pub const MAX_BLOCKS_PER_BATCH: u32 = 512;

    /// Default per-block gas limit
    pub const BLOCK_GAS_LIMIT: u64 = 30_000_000;

    /// Gas charged for a plain value transfer
    pub const TRANSFER_GAS: u64 = 21_000;

    /// Root of an empty state or receipts trie
    pub const EMPTY_ROOT_HEX: &str =
        "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421";

    /// Wei per base unit (18 - 8 decimals) for the ETH shim
    pub const WEI_PER_BASE_UNIT: u128 = 10_000_000_000;
}
