use crate::error::IdentityError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const ADDRESS_HEX_LEN: usize = 40;

/// Ledger account address (`0x` + 40 hex digits).
///
/// Stored lowercase so that equality is case-insensitive by construction; checksummed
/// input from a wallet compares equal to the contract's lowercase form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, IdentityError> {
        let trimmed = raw.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| {
                IdentityError::InvalidInput(format!("address '{raw}' lacks 0x prefix"))
            })?;

        if digits.len() != ADDRESS_HEX_LEN || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdentityError::InvalidInput(format!(
                "address '{raw}' must be 0x followed by {ADDRESS_HEX_LEN} hex digits"
            )));
        }

        Ok(Self(format!("0x{}", digits.to_ascii_lowercase())))
    }

    /// Wrap an address literal already known to be well formed.
    pub(crate) fn from_known(raw: &str) -> Self {
        Self(raw.to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against an unparsed address string.
    pub fn matches(&self, raw: &str) -> bool {
        self.0.eq_ignore_ascii_case(raw.trim())
    }

    /// Abbreviated `0x1234...abcd` form for display.
    pub fn short(&self) -> String {
        let len = self.0.len();
        format!("{}...{}", &self.0[..6], &self.0[len - 4..])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Authorization role of the connected account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Unauthenticated,
    User,
    Verifier,
}

impl Role {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::User => "user",
            Self::Verifier => "verifier",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What the session last learned about the ledger's verifier address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "address")]
pub enum VerifierObservation {
    /// No account yet, so nothing was read.
    Unchecked,
    /// A read for the current account is in flight.
    Pending,
    Observed(Address),
    /// The last read failed; role fails open to `Unauthenticated`.
    Unavailable,
}

/// Wallet session as observed by the client.
///
/// The role is never stored: it is derived from the account and the verifier observation
/// so the two cannot drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub account: Option<Address>,
    pub connection: ConnectionState,
    pub verifier: VerifierObservation,
    pub last_error: Option<String>,
}

impl Session {
    pub fn disconnected() -> Self {
        Self {
            account: None,
            connection: ConnectionState::Disconnected,
            verifier: VerifierObservation::Unchecked,
            last_error: None,
        }
    }

    pub fn role(&self) -> Role {
        let Some(account) = &self.account else {
            return Role::Unauthenticated;
        };
        match &self.verifier {
            VerifierObservation::Observed(verifier) if verifier == account => Role::Verifier,
            VerifierObservation::Observed(_) => Role::User,
            VerifierObservation::Unchecked
            | VerifierObservation::Pending
            | VerifierObservation::Unavailable => Role::Unauthenticated,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected && self.account.is_some()
    }

    /// True while a connect request or role read has not settled yet.
    pub fn is_settling(&self) -> bool {
        self.connection == ConnectionState::Connecting
            || self.verifier == VerifierObservation::Pending
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::disconnected()
    }
}
