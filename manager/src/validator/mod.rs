//! Validator management over the node binary's CLI.
//!
//! [`ValidatorFacade`] turns operator intents (register, delegate, unjail,
//! vote, ...) into node-binary invocations through a [`CommandRunner`] and
//! maps their output onto typed results. Nothing here signs or encodes
//! transactions itself.

pub mod address;
pub mod mnemonic;
pub mod tx;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ValidatorDefaults;
use crate::error::{Classify, ErrorKind, Remediation};
use crate::exec::{self, CommandRunner, ExecError};

pub use address::AddressForms;

/// Base units per whole token (18 decimals).
pub const POWER_REDUCTION: u128 = 1_000_000_000_000_000_000;

/// Kept back from the balance by `restake` to pay the delegation fee.
pub const FEE_RESERVE: u128 = 100_000_000_000_000_000;

const MIN_COMMISSION: f64 = 0.01;
const MAX_COMMISSION: f64 = 1.0;
const DEFAULT_MAX_COMMISSION: f64 = 0.20;
const MAX_CHANGE_RATE: &str = "0.01";

#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("commission rate {0} must be a decimal between 0.01 and 1.0")]
    InvalidCommission(String),
    #[error("amount {0:?} must be a positive integer in base units")]
    InvalidAmount(String),
    #[error("vote option {0:?} must be one of yes, no, abstain, no_with_veto")]
    InvalidVoteOption(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("this node is already registered as a validator")]
    AlreadyRegistered,
    #[error("validator is still jailed: {0}")]
    JailNotExpired(String),
    #[error("validator is not jailed")]
    NotJailed,
    #[error("proposal is not in its voting period: {0}")]
    VotingClosed(String),
    #[error("could not reach the node: {0}")]
    Network(String),
    #[error("transaction {txhash} failed with code {code}: {log}")]
    TxFailed { txhash: String, code: u32, log: String },
    #[error("could not parse {what}: {message}")]
    Parse { what: &'static str, message: String },
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for ValidatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            ValidatorError::InvalidMnemonic(_)
            | ValidatorError::InvalidCommission(_)
            | ValidatorError::InvalidAmount(_)
            | ValidatorError::InvalidVoteOption(_) => ErrorKind::Validation,
            ValidatorError::KeyNotFound(_) => ErrorKind::Precondition,
            ValidatorError::InsufficientFunds(_)
            | ValidatorError::AlreadyRegistered
            | ValidatorError::JailNotExpired(_)
            | ValidatorError::NotJailed
            | ValidatorError::VotingClosed(_) => ErrorKind::State,
            ValidatorError::Network(_) => ErrorKind::Network,
            ValidatorError::TxFailed { .. } => ErrorKind::Subprocess,
            ValidatorError::Parse { .. } => ErrorKind::Protocol,
            ValidatorError::Exec(e) => e.kind(),
            ValidatorError::Io { .. } => ErrorKind::Internal,
        }
    }

    fn remediation(&self) -> Remediation {
        let base = Remediation::new(self.to_string());
        match self {
            ValidatorError::InsufficientFunds(_) => base
                .cause("the key's account does not hold enough tokens for the amount plus fees")
                .action("push-validator balance")
                .action("fund the account, then retry"),
            ValidatorError::KeyNotFound(_) => base
                .action("push-validator keys ensure")
                .action("push-validator keys import --name <name>"),
            ValidatorError::AlreadyRegistered => base.action("push-validator status"),
            ValidatorError::JailNotExpired(_) => base
                .cause("the downtime jail period has not elapsed")
                .action("wait until the jail time shown by push-validator status, then push-validator unjail"),
            ValidatorError::NotJailed => base.action("nothing to do"),
            ValidatorError::VotingClosed(_) => base.cause("the proposal's voting period has ended or not started"),
            ValidatorError::Network(_) => base
                .cause("the local node is not running or its RPC is not bound")
                .action("push-validator status")
                .action("push-validator start"),
            ValidatorError::Exec(e) => e.remediation(),
            _ => base,
        }
    }
}

/// A key in the keyring.
#[derive(Clone, Debug, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub address: String,
    /// Only set when the key was created by this call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mnemonic: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BondStatus {
    Bonded,
    Unbonding,
    Unbonded,
}

impl BondStatus {
    fn from_chain(s: &str) -> Self {
        match s {
            "BOND_STATUS_BONDED" | "Bonded" => BondStatus::Bonded,
            "BOND_STATUS_UNBONDING" | "Unbonding" => BondStatus::Unbonding,
            _ => BondStatus::Unbonded,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BondStatus::Bonded => "bonded",
            BondStatus::Unbonding => "unbonding",
            BondStatus::Unbonded => "unbonded",
        }
    }
}

/// A validator as seen by the staking and slashing modules.
#[derive(Clone, Debug, Serialize)]
pub struct ValidatorRecord {
    pub operator_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub account_address: String,
    pub moniker: String,
    pub status: BondStatus,
    pub jailed: bool,
    /// Bonded tokens in whole units.
    pub voting_power: u128,
    /// Share of the bonded validators' total tokens, 0..1.
    pub voting_fraction: f64,
    pub commission_rate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jailed_until: Option<DateTime<Utc>>,
    pub missed_blocks: u64,
    pub tombstoned: bool,
    #[serde(skip)]
    consensus_key: String,
}

/// Arguments for `create-validator`.
#[derive(Clone, Debug)]
pub struct RegisterArgs {
    pub moniker: String,
    /// Self-bond in base units.
    pub amount: String,
    pub key_name: String,
    pub commission_rate: String,
    pub min_self_delegation: String,
}

#[derive(Clone, Debug)]
pub struct DelegateArgs {
    pub validator: String,
    pub amount: String,
    pub key_name: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VoteOption {
    Yes,
    No,
    Abstain,
    NoWithVeto,
}

impl VoteOption {
    pub fn as_str(self) -> &'static str {
        match self {
            VoteOption::Yes => "yes",
            VoteOption::No => "no",
            VoteOption::Abstain => "abstain",
            VoteOption::NoWithVeto => "no_with_veto",
        }
    }
}

impl std::str::FromStr for VoteOption {
    type Err = ValidatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "yes" => Ok(VoteOption::Yes),
            "no" => Ok(VoteOption::No),
            "abstain" => Ok(VoteOption::Abstain),
            "no_with_veto" | "veto" => Ok(VoteOption::NoWithVeto),
            _ => Err(ValidatorError::InvalidVoteOption(s.to_string())),
        }
    }
}

#[derive(Clone, Debug)]
pub struct VoteArgs {
    pub proposal_id: u64,
    pub option: VoteOption,
    pub key_name: String,
}

/// Outcome of `restake`.
#[derive(Clone, Debug, Serialize)]
pub struct RestakeOutcome {
    pub withdraw_tx: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_tx: Option<String>,
    pub restaked: String,
}

/// Typed surface over the node binary.
pub struct ValidatorFacade<R> {
    runner: R,
    binary: PathBuf,
    home: PathBuf,
    chain_id: String,
    node_rpc: String,
    defaults: ValidatorDefaults,
}

impl<R: CommandRunner> ValidatorFacade<R> {
    pub fn new(
        runner: R,
        binary: impl Into<PathBuf>,
        home: impl Into<PathBuf>,
        chain_id: impl Into<String>,
        node_rpc: impl Into<String>,
        defaults: ValidatorDefaults,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            home: home.into(),
            chain_id: chain_id.into(),
            node_rpc: node_rpc.into(),
            defaults,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn defaults(&self) -> &ValidatorDefaults {
        &self.defaults
    }

    fn home_arg(&self) -> String {
        self.home.display().to_string()
    }

    fn keyring_args(&self) -> Vec<String> {
        exec::args([
            "--keyring-backend".to_string(),
            self.defaults.keyring_backend.clone(),
            "--home".to_string(),
            self.home_arg(),
        ])
    }

    fn query_args(&self) -> Vec<String> {
        exec::args([
            "--node".to_string(),
            self.node_rpc.clone(),
            "--output".to_string(),
            "json".to_string(),
        ])
    }

    fn tx_args(&self, key_name: &str) -> Vec<String> {
        let mut args = exec::args([
            "--from".to_string(),
            key_name.to_string(),
            "--chain-id".to_string(),
            self.chain_id.clone(),
        ]);
        args.extend(self.keyring_args());
        args.extend(exec::args([
            "--node".to_string(),
            self.node_rpc.clone(),
            "--gas".to_string(),
            "auto".to_string(),
            "--gas-adjustment".to_string(),
            self.defaults.gas_adjustment.clone(),
            "--gas-prices".to_string(),
            self.defaults.gas_prices.clone(),
            "--yes".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ]));
        args
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>, ValidatorError> {
        tracing::debug!(command = %exec::command_line(&self.binary, &args), "invoking node binary");
        self.runner
            .run(&self.binary, &args)
            .await
            .map_err(classify_exec)
    }

    async fn query_json(&self, what: &'static str, mut args: Vec<String>) -> Result<Value, ValidatorError> {
        args.extend(self.query_args());
        let out = self.run(args).await?;
        parse_json(what, &out)
    }

    /// Broadcasts a transaction and returns its hash; non-zero codes are
    /// classified from the raw log.
    async fn submit(&self, mut args: Vec<String>, key_name: &str) -> Result<String, ValidatorError> {
        args.extend(self.tx_args(key_name));
        let out = self.run(args).await?;
        let resp = tx::parse_response(&out)?;
        if resp.code != 0 {
            return Err(tx::classify(&resp.raw_log).unwrap_or(ValidatorError::TxFailed {
                txhash: resp.txhash,
                code: resp.code,
                log: resp.raw_log,
            }));
        }
        tracing::info!(txhash = %resp.txhash, "transaction accepted");
        Ok(resp.txhash)
    }

    /// Existing key `name`; [`ValidatorError::KeyNotFound`] when absent.
    pub async fn show_key(&self, name: &str) -> Result<KeyInfo, ValidatorError> {
        let mut show = exec::args(["keys", "show", name]);
        show.extend(self.keyring_args());
        show.extend(exec::args(["--output", "json"]));

        let info = parse_key(&self.run(show).await?)?;
        Ok(KeyInfo {
            mnemonic: None,
            ..info
        })
    }

    /// Existing key `name`, or a freshly created one with its mnemonic.
    pub async fn ensure_key(&self, name: &str) -> Result<KeyInfo, ValidatorError> {
        match self.show_key(name).await {
            Ok(info) => return Ok(info),
            Err(ValidatorError::KeyNotFound(_)) => {}
            Err(other) => return Err(other),
        }

        let mut add = exec::args(["keys", "add", name]);
        add.extend(self.keyring_args());
        add.extend(exec::args(["--output", "json"]));
        let out = self.run(add).await?;
        let info = parse_key(&out)?;
        tracing::info!(key = name, address = %info.address, "created key");
        Ok(info)
    }

    /// Recovers `name` from `phrase` after validating it locally.
    pub async fn import_key(&self, name: &str, phrase: &str) -> Result<KeyInfo, ValidatorError> {
        let normalized = mnemonic::validate(phrase)?;
        let mut args = exec::args(["keys", "add", name, "--recover"]);
        args.extend(self.keyring_args());
        args.extend(exec::args(["--output", "json"]));

        let out = self
            .runner
            .run_with_input(&self.binary, &args, &format!("{normalized}\n"))
            .await
            .map_err(classify_exec)?;
        let info = parse_key(&out)?;
        Ok(KeyInfo {
            mnemonic: None,
            ..info
        })
    }

    /// Spendable balance of `account` in the configured denomination.
    pub async fn balance(&self, account: &str) -> Result<String, ValidatorError> {
        let value = self
            .query_json("balances", exec::args(["query", "bank", "balances", account]))
            .await?;
        let amount = value
            .get("balances")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|c| c.get("denom").and_then(Value::as_str) == Some(self.defaults.denom.as_str()))
            .and_then(|c| c.get("amount").and_then(Value::as_str))
            .unwrap_or("0");
        Ok(amount.to_string())
    }

    /// All address encodings of `addr` (bech32 of any kind, or hex).
    pub async fn addresses(&self, addr: &str) -> Result<AddressForms, ValidatorError> {
        let out = self
            .run(exec::args(["debug", "addr", address::debug_addr_input(addr)]))
            .await?;
        let text = String::from_utf8_lossy(&out);
        address::parse_debug_addr(&text).ok_or_else(|| ValidatorError::Parse {
            what: "debug addr output",
            message: text.lines().next().unwrap_or_default().to_string(),
        })
    }

    /// Consensus public key of this node as JSON.
    async fn consensus_pubkey(&self) -> Result<Value, ValidatorError> {
        let out = self
            .run(exec::args(["comet".to_string(), "show-validator".to_string(), "--home".to_string(), self.home_arg()]))
            .await?;
        parse_json("show-validator output", &out)
    }

    /// Every validator known to the staking module, largest first.
    pub async fn validators(&self) -> Result<Vec<ValidatorRecord>, ValidatorError> {
        let value = self
            .query_json(
                "validators",
                exec::args(["query", "staking", "validators", "--limit", "10000"]),
            )
            .await?;
        Ok(parse_validators(&value))
    }

    /// Whether `addr` (operator, account or hex) is a validator. With an
    /// empty address this node's consensus key is looked up instead.
    pub async fn is_validator(&self, addr: &str) -> Result<bool, ValidatorError> {
        Ok(self.find_validator(addr).await?.is_some())
    }

    async fn find_validator(&self, addr: &str) -> Result<Option<ValidatorRecord>, ValidatorError> {
        let validators = self.validators().await?;
        if addr.is_empty() {
            let pubkey = self.consensus_pubkey().await?;
            let key = pubkey_key(&pubkey);
            return Ok(validators.into_iter().find(|v| !key.is_empty() && v.consensus_key == key));
        }
        let operator = if addr.contains("valoper") {
            addr.to_string()
        } else {
            self.addresses(addr).await?.operator
        };
        Ok(validators.into_iter().find(|v| v.operator_address == operator))
    }

    /// This node's validator record with slashing info, if registered.
    pub async fn my_validator(&self) -> Result<Option<ValidatorRecord>, ValidatorError> {
        let Some(mut record) = self.find_validator("").await? else {
            return Ok(None);
        };
        if let Ok(forms) = self.addresses(&record.operator_address).await {
            record.account_address = forms.account;
        }
        let pubkey = self.consensus_pubkey().await?;
        match self
            .query_json(
                "signing info",
                exec::args(["query".to_string(), "slashing".to_string(), "signing-info".to_string(), pubkey.to_string()]),
            )
            .await
        {
            Ok(info) => apply_signing_info(&mut record, &info),
            Err(err) => tracing::debug!(%err, "signing info unavailable"),
        }
        Ok(Some(record))
    }

    /// Submits `create-validator` for this node's consensus key.
    pub async fn register(&self, args: &RegisterArgs) -> Result<String, ValidatorError> {
        let rate = validate_commission(&args.commission_rate)?;
        validate_amount(&args.amount)?;
        validate_amount(&args.min_self_delegation)?;
        if self.is_validator("").await? {
            return Err(ValidatorError::AlreadyRegistered);
        }

        let pubkey = self.consensus_pubkey().await?;
        let spec = create_validator_body(args, rate, pubkey, &self.defaults.denom);
        let path = self.home.join("config").join("create-validator.json");
        write_json(&path, &spec)?;

        let result = self
            .submit(
                exec::args([
                    "tx".to_string(),
                    "staking".to_string(),
                    "create-validator".to_string(),
                    path.display().to_string(),
                ]),
                &args.key_name,
            )
            .await;
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(path = %path.display(), %err, "failed to remove create-validator file");
        }
        result
    }

    pub async fn delegate(&self, args: &DelegateArgs) -> Result<String, ValidatorError> {
        validate_amount(&args.amount)?;
        self.submit(
            exec::args([
                "tx".to_string(),
                "staking".to_string(),
                "delegate".to_string(),
                args.validator.clone(),
                format!("{}{}", args.amount, self.defaults.denom),
            ]),
            &args.key_name,
        )
        .await
    }

    pub async fn unjail(&self, key_name: &str) -> Result<String, ValidatorError> {
        self.submit(exec::args(["tx", "slashing", "unjail"]), key_name)
            .await
    }

    pub async fn withdraw_rewards(
        &self,
        validator: &str,
        key_name: &str,
        include_commission: bool,
    ) -> Result<String, ValidatorError> {
        let mut args = exec::args(["tx", "distribution", "withdraw-rewards", validator]);
        if include_commission {
            args.push("--commission".to_string());
        }
        self.submit(args, key_name).await
    }

    pub async fn vote(&self, args: &VoteArgs) -> Result<String, ValidatorError> {
        self.submit(
            exec::args([
                "tx".to_string(),
                "gov".to_string(),
                "vote".to_string(),
                args.proposal_id.to_string(),
                args.option.as_str().to_string(),
            ]),
            &args.key_name,
        )
        .await
    }

    /// Withdraws rewards and commission, then delegates the spendable
    /// balance minus [`FEE_RESERVE`] back to the validator.
    pub async fn restake(&self, validator: &str, key_name: &str) -> Result<RestakeOutcome, ValidatorError> {
        let withdraw_tx = self.withdraw_rewards(validator, key_name, true).await?;
        let account = self.addresses(validator).await?.account;
        let balance = self.balance(&account).await?;
        let balance: u128 = balance
            .parse()
            .map_err(|_| ValidatorError::Parse {
                what: "balance",
                message: balance.clone(),
            })?;

        let spendable = balance.saturating_sub(FEE_RESERVE);
        if spendable == 0 {
            tracing::info!(balance, "nothing to restake after fee reserve");
            return Ok(RestakeOutcome {
                withdraw_tx,
                delegate_tx: None,
                restaked: "0".to_string(),
            });
        }
        let delegate_tx = self
            .delegate(&DelegateArgs {
                validator: validator.to_string(),
                amount: spendable.to_string(),
                key_name: key_name.to_string(),
            })
            .await?;
        Ok(RestakeOutcome {
            withdraw_tx,
            delegate_tx: Some(delegate_tx),
            restaked: spendable.to_string(),
        })
    }
}

/// Known chain/CLI failures become typed errors; the rest stay `Exec`.
fn classify_exec(err: ExecError) -> ValidatorError {
    if matches!(err, ExecError::Failed { .. } | ExecError::Timeout { .. }) {
        if let Some(typed) = tx::classify(&err.output_text()) {
            return typed;
        }
    }
    ValidatorError::Exec(err)
}

fn parse_json(what: &'static str, out: &[u8]) -> Result<Value, ValidatorError> {
    let text = String::from_utf8_lossy(out);
    let start = text.find(['{', '[']).unwrap_or(0);
    serde_json::from_str(&text[start..]).map_err(|e| ValidatorError::Parse {
        what,
        message: e.to_string(),
    })
}

#[derive(Deserialize)]
struct RawKey {
    name: String,
    address: String,
    #[serde(default)]
    mnemonic: Option<String>,
}

fn parse_key(out: &[u8]) -> Result<KeyInfo, ValidatorError> {
    let value = parse_json("key record", out)?;
    let raw: RawKey = serde_json::from_value(value).map_err(|e| ValidatorError::Parse {
        what: "key record",
        message: e.to_string(),
    })?;
    Ok(KeyInfo {
        name: raw.name,
        address: raw.address,
        mnemonic: raw.mnemonic.filter(|m| !m.is_empty()),
    })
}

/// `key` (or legacy `value`) of a consensus pubkey object.
fn pubkey_key(pubkey: &Value) -> String {
    pubkey
        .get("key")
        .or_else(|| pubkey.get("value"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_validators(value: &Value) -> Vec<ValidatorRecord> {
    let raw = value
        .get("validators")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let tokens_of = |v: &Value| -> u128 {
        v.get("tokens")
            .and_then(Value::as_str)
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    };
    let bonded_total: u128 = raw
        .iter()
        .filter(|v| v.get("status").and_then(Value::as_str) == Some("BOND_STATUS_BONDED"))
        .map(tokens_of)
        .sum();

    let mut records: Vec<ValidatorRecord> = raw
        .iter()
        .map(|v| {
            let tokens = tokens_of(v);
            let status = BondStatus::from_chain(v.get("status").and_then(Value::as_str).unwrap_or_default());
            let fraction = if status == BondStatus::Bonded && bonded_total > 0 {
                tokens as f64 / bonded_total as f64
            } else {
                0.0
            };
            ValidatorRecord {
                operator_address: str_at(v, "/operator_address"),
                account_address: String::new(),
                moniker: str_at(v, "/description/moniker"),
                status,
                jailed: v.get("jailed").and_then(Value::as_bool).unwrap_or(false),
                voting_power: tokens / POWER_REDUCTION,
                voting_fraction: fraction,
                commission_rate: str_at(v, "/commission/commission_rates/rate"),
                jailed_until: None,
                missed_blocks: 0,
                tombstoned: false,
                consensus_key: v.get("consensus_pubkey").map(pubkey_key).unwrap_or_default(),
            }
        })
        .collect();
    records.sort_by(|a, b| b.voting_power.cmp(&a.voting_power));
    records
}

fn apply_signing_info(record: &mut ValidatorRecord, info: &Value) {
    let info = info.get("val_signing_info").unwrap_or(info);
    record.missed_blocks = info
        .get("missed_blocks_counter")
        .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_u64()))
        .unwrap_or(0);
    record.tombstoned = info.get("tombstoned").and_then(Value::as_bool).unwrap_or(false);
    record.jailed_until = info
        .get("jailed_until")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .filter(|t| t.timestamp() > 0);
}

fn str_at(v: &Value, pointer: &str) -> String {
    v.pointer(pointer)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parses a commission rate and checks it lies in `[0.01, 1.0]`.
pub fn validate_commission(rate: &str) -> Result<f64, ValidatorError> {
    let parsed: f64 = rate
        .trim()
        .parse()
        .map_err(|_| ValidatorError::InvalidCommission(rate.to_string()))?;
    if !(MIN_COMMISSION..=MAX_COMMISSION).contains(&parsed) {
        return Err(ValidatorError::InvalidCommission(rate.to_string()));
    }
    Ok(parsed)
}

fn validate_amount(amount: &str) -> Result<(), ValidatorError> {
    let positive = !amount.is_empty()
        && amount.bytes().all(|b| b.is_ascii_digit())
        && amount.bytes().any(|b| b != b'0');
    if positive {
        Ok(())
    } else {
        Err(ValidatorError::InvalidAmount(amount.to_string()))
    }
}

/// `create-validator` JSON. The max rate is the commission itself when
/// it exceeds the default cap, verbatim so it never rounds below the rate.
fn create_validator_body(args: &RegisterArgs, rate: f64, pubkey: Value, denom: &str) -> Value {
    let max_rate = if rate >= DEFAULT_MAX_COMMISSION {
        args.commission_rate.trim().to_string()
    } else {
        format!("{DEFAULT_MAX_COMMISSION:.2}")
    };
    serde_json::json!({
        "pubkey": pubkey,
        "amount": format!("{}{denom}", args.amount),
        "moniker": args.moniker,
        "commission-rate": args.commission_rate.trim(),
        "commission-max-rate": max_rate,
        "commission-max-change-rate": MAX_CHANGE_RATE,
        "min-self-delegation": args.min_self_delegation,
    })
}

fn write_json(path: &Path, value: &Value) -> Result<(), ValidatorError> {
    let io = |context: String| move |source: std::io::Error| ValidatorError::Io { context, source };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io(format!("create {}", parent.display())))?;
    }
    let body = serde_json::to_vec_pretty(value).map_err(|e| ValidatorError::Parse {
        what: "validator spec",
        message: e.to_string(),
    })?;
    std::fs::write(path, body).map_err(io(format!("write {}", path.display())))
}
