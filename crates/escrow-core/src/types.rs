//! Core types for the escrow trade protocol
//!
//! Newtype wrappers for identifiers, network addresses, public key material,
//! amounts and prices, following the same semantic-validation approach used
//! throughout the crate.

use core::fmt;
use core::str::FromStr;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::EscrowError;

// ----------------------------------------------------------------------------
// Trade Identifier
// ----------------------------------------------------------------------------

/// Identifier of a trade (the offer/take identifier shared by both parties)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeId(String);

impl TradeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random trade id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TradeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

// ----------------------------------------------------------------------------
// Message Uid
// ----------------------------------------------------------------------------

/// Unique message id used for idempotent dedup and delivery tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Uid(Uuid);

impl Uid {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Uid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Node Address
// ----------------------------------------------------------------------------

/// Network address of a node on the peer-to-peer overlay
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or_else(|| {
            EscrowError::invalid_input(format!("Node address '{}' is missing a port", s))
        })?;
        if host.is_empty() {
            return Err(EscrowError::invalid_input(format!(
                "Node address '{}' is missing a host",
                s
            )));
        }
        let port = port.parse::<u16>().map_err(|_| {
            EscrowError::invalid_input(format!("Invalid port in node address '{}'", s))
        })?;
        Ok(Self::new(host, port))
    }
}

// ----------------------------------------------------------------------------
// Public Key Ring
// ----------------------------------------------------------------------------

/// Public key material a party is known by (Ed25519 signature key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    signature_pub_key: [u8; 32],
}

impl PubKeyRing {
    pub fn new(signature_pub_key: [u8; 32]) -> Self {
        Self { signature_pub_key }
    }

    pub fn signature_pub_key(&self) -> &[u8; 32] {
        &self.signature_pub_key
    }

    /// Derive the trader id used to key dispute tickets (first 64 bits of the key digest)
    pub fn trader_id(&self) -> TraderId {
        let digest = Sha256::digest(self.signature_pub_key);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        TraderId(u64::from_be_bytes(prefix))
    }
}

impl fmt::Display for PubKeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        write!(f, "{}", hex::encode(&self.signature_pub_key[..8]))
    }
}

/// Short identifier of a trader within a dispute (disambiguates buyer and seller tickets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraderId(pub u64);

impl fmt::Display for TraderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Transaction Identifier
// ----------------------------------------------------------------------------

/// Identifier of an on-chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(String);

impl TxId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ----------------------------------------------------------------------------
// Amounts and Prices
// ----------------------------------------------------------------------------

/// Number of base units per coin
pub const COIN: u64 = 100_000_000;

/// Amount of the escrowed asset in base units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coin(u64);

impl Coin {
    pub const ZERO: Self = Self(0);

    pub fn from_sat(value: u64) -> Self {
        Self(value)
    }

    pub fn sat(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    /// Signed difference, used for gain/loss reporting
    pub fn signed_diff(self, other: Self) -> i64 {
        self.0 as i64 - other.0 as i64
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_sat(self.0 as i64))
    }
}

/// Format a signed base-unit amount as a friendly coin string
pub fn format_sat(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    format!("{}{}.{:08} BTC", sign, abs / COIN, abs % COIN)
}

/// Scale used for counter-currency volumes and prices (4 decimal places)
pub const FIAT_SCALE: i64 = 10_000;

/// Counter-currency volume, scaled by [`FIAT_SCALE`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Volume {
    pub currency: String,
    pub value: i64,
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:04} {}",
            self.value / FIAT_SCALE,
            (self.value % FIAT_SCALE).abs(),
            self.currency
        )
    }
}

/// Price of one coin in a counter currency, scaled by [`FIAT_SCALE`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub currency: String,
    pub value: i64,
}

impl Price {
    pub fn new(currency: impl Into<String>, value: i64) -> Self {
        Self {
            currency: currency.into(),
            value,
        }
    }

    /// Convert a floating market price into a scaled price
    pub fn from_market(currency: impl Into<String>, price: f64) -> Option<Self> {
        let scaled = (price * FIAT_SCALE as f64).round();
        if !scaled.is_finite() || scaled <= 0.0 || scaled > i64::MAX as f64 {
            return None;
        }
        Some(Self::new(currency, scaled as i64))
    }

    /// Volume paid in counter currency for the given amount at this price
    pub fn volume_by_amount(&self, amount: Coin) -> Volume {
        let value = (amount.sat() as i128 * self.value as i128) / COIN as i128;
        Volume {
            currency: self.currency.clone(),
            value: value as i64,
        }
    }

    /// Amount obtained for the given volume at this price
    pub fn amount_by_volume(&self, volume: &Volume) -> Coin {
        if self.value <= 0 || volume.value <= 0 {
            return Coin::ZERO;
        }
        let sat = (volume.value as i128 * COIN as i128) / self.value as i128;
        Coin::from_sat(sat as u64)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:04} {}/BTC",
            self.value / FIAT_SCALE,
            self.value % FIAT_SCALE,
            self.currency
        )
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps, injected so tests can control the clock
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
