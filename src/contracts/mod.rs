//! The badge registry contract.
//!
//! Every function runs against the [`TransactionContext`] it is handed and
//! returns on the first failure. Isolation between concurrent invocations and
//! rollback of a failed invocation belong to the host that owns the context.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, debug_span, info, warn};

use crate::ledger::{StateError, StateQueryIterator, TransactionContext};

/// Badge records written by `InitLedger`: id, publisher, description, validity.
const SEED_BADGES: [(&str, &str, &str, i64); 7] = [
    ("B032701", "T001", "First Badge", 3),
    ("B032702", "T002", "Second Badge", 3),
    ("B032703", "T003", "Third Badge", 3),
    ("B032704", "T001", "Forth Badge", 3),
    ("B032705", "T002", "Fifth Badge", 3),
    ("B032706", "T003", "Sixth Badge", 3),
    ("B032707", "T001", "Seventh Badge", 3),
];

/// A stored badge. Fields missing from a stored document decode to their zero
/// value; only documents that are not well-formed JSON objects are rejected.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Badge {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "PublisherID")]
    pub publisher_id: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Validity")]
    pub validity: i64,
}

impl Badge {
    pub fn new(
        id: impl Into<String>,
        publisher_id: impl Into<String>,
        description: impl Into<String>,
        validity: i64,
    ) -> Self {
        Self {
            id: id.into(),
            publisher_id: publisher_id.into(),
            description: description.into(),
            validity,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ContractError> {
        serde_json::to_vec(self).map_err(|source| ContractError::Serialization {
            id: self.id.clone(),
            source,
        })
    }

    /// Decodes the document stored at `key`.
    pub fn from_json(key: &str, bytes: &[u8]) -> Result<Self, ContractError> {
        serde_json::from_slice(bytes).map_err(|source| ContractError::Deserialization {
            key: key.to_owned(),
            source,
        })
    }
}

pub fn seed_badges() -> Vec<Badge> {
    SEED_BADGES
        .iter()
        .map(|&(id, publisher, description, validity)| {
            Badge::new(id, publisher, description, validity)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Serialization,
    Deserialization,
    Storage,
    InvalidInvocation,
}

/// Errors returned by contract functions.
///
/// `AlreadyExists` and `NotFound` carry one message each for every function
/// that raises them, so callers can match on text regardless of the operation.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("the badge {id} already exists")]
    AlreadyExists { id: String },
    #[error("the badge {id} does not exist")]
    NotFound { id: String },
    #[error("failed to serialize badge {id}: {source}")]
    Serialization {
        id: String,
        source: serde_json::Error,
    },
    #[error("failed to deserialize world state entry {key}: {source}")]
    Deserialization {
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to access world state: {0}")]
    Storage(#[from] StateError),
    #[error("unknown contract function {0}")]
    UnknownFunction(String),
    #[error("invalid arguments for {function}: {reason}")]
    InvalidArguments { function: String, reason: String },
}

impl ContractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Serialization { .. } => ErrorKind::Serialization,
            Self::Deserialization { .. } => ErrorKind::Deserialization,
            Self::Storage(_) => ErrorKind::Storage,
            Self::UnknownFunction(_) | Self::InvalidArguments { .. } => {
                ErrorKind::InvalidInvocation
            }
        }
    }
}

/// Closes the wrapped range query when dropped unless it was closed already.
struct ScanGuard<'a> {
    iter: Box<dyn StateQueryIterator + 'a>,
    closed: bool,
}

impl<'a> ScanGuard<'a> {
    fn new(iter: Box<dyn StateQueryIterator + 'a>) -> Self {
        Self {
            iter,
            closed: false,
        }
    }

    fn close(mut self) -> Result<(), StateError> {
        self.closed = true;
        self.iter.close()
    }
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.iter.close() {
            warn!(%err, "failed to close state query iterator");
        }
    }
}

/// Names accepted by [`BadgeContract::invoke`].
pub const FUNCTIONS: [&str; 7] = [
    "InitLedger",
    "CreateBadge",
    "ReadBadge",
    "UpdateBadge",
    "DeleteBadge",
    "BadgeExists",
    "GetAllBadge",
];

#[derive(Clone, Copy, Debug, Default)]
pub struct BadgeContract;

impl BadgeContract {
    pub fn new() -> Self {
        Self
    }

    /// Writes the seed badges, overwriting any record with the same id.
    pub fn init_ledger(&self, ctx: &mut dyn TransactionContext) -> Result<(), ContractError> {
        let _span = debug_span!("InitLedger", tx_id = %ctx.tx_id()).entered();
        let badges = seed_badges();
        for badge in &badges {
            let bytes = badge.to_json()?;
            ctx.stub().put_state(&badge.id, bytes)?;
        }
        info!(count = badges.len(), "seeded badge registry");
        Ok(())
    }

    pub fn create_badge(
        &self,
        ctx: &mut dyn TransactionContext,
        id: &str,
        publisher_id: &str,
        description: &str,
        validity: i64,
    ) -> Result<(), ContractError> {
        let _span = debug_span!("CreateBadge", tx_id = %ctx.tx_id(), id).entered();
        if self.badge_exists(ctx, id)? {
            return Err(ContractError::AlreadyExists { id: id.to_owned() });
        }
        let badge = Badge::new(id, publisher_id, description, validity);
        ctx.stub().put_state(id, badge.to_json()?)?;
        debug!("badge created");
        Ok(())
    }

    pub fn read_badge(
        &self,
        ctx: &mut dyn TransactionContext,
        id: &str,
    ) -> Result<Badge, ContractError> {
        let _span = debug_span!("ReadBadge", tx_id = %ctx.tx_id(), id).entered();
        let bytes = ctx
            .stub()
            .get_state(id)?
            .ok_or_else(|| ContractError::NotFound { id: id.to_owned() })?;
        Badge::from_json(id, &bytes)
    }

    /// Replaces every field of an existing badge.
    pub fn update_badge(
        &self,
        ctx: &mut dyn TransactionContext,
        id: &str,
        publisher_id: &str,
        description: &str,
        validity: i64,
    ) -> Result<(), ContractError> {
        let _span = debug_span!("UpdateBadge", tx_id = %ctx.tx_id(), id).entered();
        if !self.badge_exists(ctx, id)? {
            return Err(ContractError::NotFound { id: id.to_owned() });
        }
        let badge = Badge::new(id, publisher_id, description, validity);
        ctx.stub().put_state(id, badge.to_json()?)?;
        debug!("badge updated");
        Ok(())
    }

    pub fn delete_badge(
        &self,
        ctx: &mut dyn TransactionContext,
        id: &str,
    ) -> Result<(), ContractError> {
        let _span = debug_span!("DeleteBadge", tx_id = %ctx.tx_id(), id).entered();
        if !self.badge_exists(ctx, id)? {
            return Err(ContractError::NotFound { id: id.to_owned() });
        }
        ctx.stub().del_state(id)?;
        debug!("badge deleted");
        Ok(())
    }

    pub fn badge_exists(
        &self,
        ctx: &mut dyn TransactionContext,
        id: &str,
    ) -> Result<bool, ContractError> {
        Ok(ctx.stub().get_state(id)?.is_some())
    }

    /// Every record in the world state, in key order. A malformed entry aborts
    /// the scan.
    pub fn get_all_badge(
        &self,
        ctx: &mut dyn TransactionContext,
    ) -> Result<Vec<Badge>, ContractError> {
        let _span = debug_span!("GetAllBadge", tx_id = %ctx.tx_id()).entered();
        let mut scan = ScanGuard::new(ctx.stub().get_state_by_range("", "")?);
        let mut badges = Vec::new();
        for entry in scan.iter.by_ref() {
            let entry = entry?;
            badges.push(Badge::from_json(&entry.key, &entry.value)?);
        }
        scan.close()?;
        debug!(count = badges.len(), "listed badges");
        Ok(badges)
    }

    /// Whether `function` only reads world state.
    pub fn is_read_only(function: &str) -> bool {
        matches!(function, "ReadBadge" | "BadgeExists" | "GetAllBadge")
    }

    /// Routes a named invocation with string arguments and returns the JSON
    /// payload of its result (`null` for functions without one).
    pub fn invoke(
        &self,
        ctx: &mut dyn TransactionContext,
        function: &str,
        args: &[String],
    ) -> Result<Value, ContractError> {
        match function {
            "InitLedger" => {
                expect_args(function, args, 0)?;
                self.init_ledger(ctx)?;
                Ok(Value::Null)
            }
            "CreateBadge" => {
                expect_args(function, args, 4)?;
                let validity = parse_validity(function, &args[3])?;
                self.create_badge(ctx, &args[0], &args[1], &args[2], validity)?;
                Ok(Value::Null)
            }
            "ReadBadge" => {
                expect_args(function, args, 1)?;
                to_payload(&self.read_badge(ctx, &args[0])?)
            }
            "UpdateBadge" => {
                expect_args(function, args, 4)?;
                let validity = parse_validity(function, &args[3])?;
                self.update_badge(ctx, &args[0], &args[1], &args[2], validity)?;
                Ok(Value::Null)
            }
            "DeleteBadge" => {
                expect_args(function, args, 1)?;
                self.delete_badge(ctx, &args[0])?;
                Ok(Value::Null)
            }
            "BadgeExists" => {
                expect_args(function, args, 1)?;
                Ok(Value::Bool(self.badge_exists(ctx, &args[0])?))
            }
            "GetAllBadge" => {
                expect_args(function, args, 0)?;
                to_payload(&self.get_all_badge(ctx)?)
            }
            other => Err(ContractError::UnknownFunction(other.to_owned())),
        }
    }
}

fn expect_args(function: &str, args: &[String], expected: usize) -> Result<(), ContractError> {
    if args.len() != expected {
        return Err(ContractError::InvalidArguments {
            function: function.to_owned(),
            reason: format!("expected {expected} arguments, got {}", args.len()),
        });
    }
    Ok(())
}

fn parse_validity(function: &str, raw: &str) -> Result<i64, ContractError> {
    raw.trim()
        .parse()
        .map_err(|err| ContractError::InvalidArguments {
            function: function.to_owned(),
            reason: format!("validity {raw:?} is not an integer: {err}"),
        })
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, ContractError> {
    serde_json::to_value(value).map_err(|source| ContractError::Serialization {
        id: String::from("<payload>"),
        source,
    })
}
