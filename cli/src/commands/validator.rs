//! Validator transactions, key management and queries.

use std::path::PathBuf;

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};

use manager::ProcessRunner;
use manager::validator::{
    self as facade_types, KeyInfo, POWER_REDUCTION, ValidatorError, ValidatorFacade, VoteOption,
};

use crate::CliError;
use crate::deps::Deps;
use crate::output::{Glyph, Printer};
use crate::prompt;

#[derive(Args, Clone, Debug, Default)]
pub struct RegisterArgs {
    /// Validator moniker (env MONIKER)
    #[arg(long)]
    pub moniker: Option<String>,

    /// Self-bond in base units (env STAKE_AMOUNT)
    #[arg(long)]
    pub amount: Option<String>,

    /// Key that signs and funds the registration (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,

    /// Commission as a decimal fraction, 0.01 to 1.0 (env COMMISSION_RATE)
    #[arg(long)]
    pub commission_rate: Option<String>,

    /// Minimum self delegation (env MIN_SELF_DELEGATION)
    #[arg(long)]
    pub min_self_delegation: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct DelegateArgs {
    /// Amount in base units
    pub amount: String,

    /// Operator address (default: this node's validator)
    #[arg(long)]
    pub validator: Option<String>,

    /// Signing key (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct KeyArgs {
    /// Signing key (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct WithdrawArgs {
    /// Operator address (default: this node's validator)
    #[arg(long)]
    pub validator: Option<String>,

    /// Signing key (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,

    /// Also withdraw the validator's commission
    #[arg(long)]
    pub commission: bool,
}

#[derive(Args, Clone, Debug)]
pub struct RestakeArgs {
    /// Operator address (default: this node's validator)
    #[arg(long)]
    pub validator: Option<String>,

    /// Signing key (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct VoteArgs {
    /// Proposal id
    pub proposal_id: u64,

    /// yes, no, abstain or no_with_veto
    pub option: VoteOption,

    /// Signing key (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,
}

#[derive(Args, Clone, Debug)]
pub struct BalanceArgs {
    /// Account address (default: the validator key's account)
    pub address: Option<String>,

    /// Key whose account is shown when no address is given (env KEY_NAME)
    #[arg(long)]
    pub key_name: Option<String>,
}

#[derive(Subcommand, Clone, Debug)]
pub enum KeysCommand {
    /// Show the key, creating it when absent
    Ensure {
        /// Key name (env KEY_NAME)
        #[arg(long)]
        name: Option<String>,
    },

    /// Recover a key from a 12 or 24 word mnemonic read from stdin or a file
    Import {
        /// Key name (env KEY_NAME)
        #[arg(long)]
        name: Option<String>,

        /// File holding the mnemonic
        #[arg(long)]
        mnemonic_file: Option<PathBuf>,
    },
}

#[derive(Args, Clone, Debug)]
pub struct AddrArgs {
    /// Account, operator, consensus or hex address
    pub address: String,
}

#[derive(Serialize)]
struct TxReport {
    action: &'static str,
    txhash: String,
}

fn emit_tx(deps: &Deps, action: &'static str, txhash: String) -> anyhow::Result<()> {
    let report = TxReport { action, txhash };
    deps.out.emit(&report, |p| {
        format!("{} {action} submitted\n{}", p.glyph(Glyph::Ok), p.field("tx hash", &report.txhash))
    })
}

fn key_name(deps: &Deps, flag: &Option<String>) -> String {
    flag.clone()
        .unwrap_or_else(|| deps.cfg.validator.key_name.clone())
}

/// `flag`, or this node's operator address.
async fn own_or(
    facade: &ValidatorFacade<ProcessRunner>,
    flag: &Option<String>,
) -> anyhow::Result<String> {
    if let Some(addr) = flag {
        return Ok(addr.clone());
    }
    let record = facade
        .my_validator()
        .await
        .context("failed to look up this node's validator")?;
    record.map(|r| r.operator_address).ok_or_else(|| {
        CliError::Precondition(
            "this node is not a registered validator; pass --validator".into(),
        )
        .into()
    })
}

#[derive(Debug, Serialize)]
pub struct RegisterOutcome {
    pub moniker: String,
    pub key: KeyInfo,
    pub txhash: String,
}

/// Validates inputs, prepares the key, checks funds, then submits
/// `create-validator`.
pub async fn register_flow(deps: &Deps, args: &RegisterArgs) -> anyhow::Result<RegisterOutcome> {
    let defaults = &deps.cfg.validator;
    let pick = |flag: &Option<String>, fallback: &String| flag.clone().unwrap_or_else(|| fallback.clone());
    let request = facade_types::RegisterArgs {
        moniker: pick(&args.moniker, &deps.cfg.node.moniker),
        amount: pick(&args.amount, &defaults.stake_amount),
        key_name: pick(&args.key_name, &defaults.key_name),
        commission_rate: pick(&args.commission_rate, &defaults.commission_rate),
        min_self_delegation: pick(&args.min_self_delegation, &defaults.min_self_delegation),
    };
    facade_types::validate_commission(&request.commission_rate)?;
    let needed: u128 = request
        .amount
        .parse()
        .ok()
        .filter(|a| *a > 0)
        .ok_or_else(|| ValidatorError::InvalidAmount(request.amount.clone()))?;

    let facade = deps.validator()?;

    deps.out.step(&format!("preparing key {}", request.key_name));
    let key = facade
        .ensure_key(&request.key_name)
        .await
        .context("failed to prepare the validator key")?;
    if let Some(mnemonic) = &key.mnemonic {
        deps.out.warn("a new key was created; store its mnemonic somewhere safe:");
        if deps.out.is_text() {
            eprintln!("\n  {mnemonic}\n");
        }
    }

    let balance = facade
        .balance(&key.address)
        .await
        .context("failed to query the key's balance")?;
    let available: u128 = balance.parse().unwrap_or(0);
    if available < needed {
        let denom = &facade.defaults().denom;
        return Err(ValidatorError::InsufficientFunds(format!(
            "{} holds {available}{denom}, registration needs {needed}{denom} plus fees",
            key.address
        ))
        .into());
    }

    deps.out.step("submitting create-validator");
    let txhash = facade
        .register(&request)
        .await
        .context("validator registration failed")?;
    Ok(RegisterOutcome {
        moniker: request.moniker,
        key,
        txhash,
    })
}

pub async fn register(deps: &Deps, args: &RegisterArgs) -> anyhow::Result<()> {
    let outcome = register_flow(deps, args).await?;
    deps.out.emit(&outcome, |p| {
        let mut text = format!("{} validator {} registered\n", p.glyph(Glyph::Ok), outcome.moniker);
        text.push_str(&p.field("account", &outcome.key.address));
        text.push_str(&p.field("tx hash", &outcome.txhash));
        text
    })
}

pub async fn delegate(deps: &Deps, args: &DelegateArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let validator = own_or(&facade, &args.validator).await?;
    let txhash = facade
        .delegate(&facade_types::DelegateArgs {
            validator,
            amount: args.amount.clone(),
            key_name: key_name(deps, &args.key_name),
        })
        .await
        .context("delegation failed")?;
    emit_tx(deps, "delegate", txhash)
}

pub async fn unjail(deps: &Deps, args: &KeyArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let record = facade
        .my_validator()
        .await
        .context("failed to look up this node's validator")?
        .ok_or_else(|| CliError::Precondition("this node is not a registered validator".into()))?;
    if !record.jailed {
        return Err(ValidatorError::NotJailed.into());
    }
    if let Some(until) = record.jailed_until.filter(|t| *t > Utc::now()) {
        return Err(ValidatorError::JailNotExpired(format!("jailed until {}", until.to_rfc3339())).into());
    }

    let txhash = facade
        .unjail(&key_name(deps, &args.key_name))
        .await
        .context("unjail failed")?;
    emit_tx(deps, "unjail", txhash)
}

pub async fn withdraw_rewards(deps: &Deps, args: &WithdrawArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let validator = own_or(&facade, &args.validator).await?;
    let txhash = facade
        .withdraw_rewards(&validator, &key_name(deps, &args.key_name), args.commission)
        .await
        .context("reward withdrawal failed")?;
    emit_tx(deps, "withdraw-rewards", txhash)
}

pub async fn restake(deps: &Deps, args: &RestakeArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let validator = own_or(&facade, &args.validator).await?;
    let outcome = facade
        .restake(&validator, &key_name(deps, &args.key_name))
        .await
        .context("restake failed")?;

    let denom = facade.defaults().denom.clone();
    deps.out.emit(&outcome, |p| {
        let mut text = format!("{} rewards withdrawn\n", p.glyph(Glyph::Ok));
        text.push_str(&p.field("withdraw tx", &outcome.withdraw_tx));
        match &outcome.delegate_tx {
            Some(tx) => {
                text.push_str(&p.field("restaked", format!("{}{denom}", outcome.restaked)));
                text.push_str(&p.field("delegate tx", tx));
            }
            None => text.push_str(&p.field("restaked", "nothing above the fee reserve")),
        }
        text
    })
}

pub async fn vote(deps: &Deps, args: &VoteArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let txhash = facade
        .vote(&facade_types::VoteArgs {
            proposal_id: args.proposal_id,
            option: args.option,
            key_name: key_name(deps, &args.key_name),
        })
        .await
        .with_context(|| format!("vote on proposal {} failed", args.proposal_id))?;
    emit_tx(deps, "vote", txhash)
}

#[derive(Serialize)]
struct BalanceReport {
    address: String,
    amount: String,
    denom: String,
}

pub async fn balance(deps: &Deps, args: &BalanceArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let address = match &args.address {
        Some(addr) => addr.clone(),
        None => facade.show_key(&key_name(deps, &args.key_name)).await?.address,
    };
    let amount = facade
        .balance(&address)
        .await
        .context("balance query failed")?;

    let report = BalanceReport {
        address,
        amount,
        denom: facade.defaults().denom.clone(),
    };
    deps.out.emit(&report, |p| {
        let mut text = p.field("address", &report.address);
        text.push_str(&p.field("balance", format!("{}{}", report.amount, report.denom)));
        text.push_str(&p.field("whole tokens", whole_tokens(&report.amount)));
        text
    })
}

/// Base units rendered with four decimals of whole tokens.
fn whole_tokens(base_units: &str) -> String {
    let Ok(units) = base_units.parse::<u128>() else {
        return base_units.to_string();
    };
    let whole = units / POWER_REDUCTION;
    let frac = (units % POWER_REDUCTION) / (POWER_REDUCTION / 10_000);
    format!("{whole}.{frac:04}")
}

pub async fn keys(deps: &Deps, command: &KeysCommand) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let info = match command {
        KeysCommand::Ensure { name } => facade
            .ensure_key(&key_name(deps, name))
            .await
            .context("failed to ensure key")?,
        KeysCommand::Import {
            name,
            mnemonic_file,
        } => {
            let phrase = read_mnemonic(mnemonic_file.as_ref()).await?;
            facade
                .import_key(&key_name(deps, name), &phrase)
                .await
                .context("key import failed")?
        }
    };

    deps.out.emit(&info, |p| {
        let mut text = p.field("key", &info.name);
        text.push_str(&p.field("address", &info.address));
        if let Some(mnemonic) = &info.mnemonic {
            text.push_str(&format!(
                "\n{} new key; store this mnemonic somewhere safe:\n  {mnemonic}\n",
                p.glyph(Glyph::Warn)
            ));
        }
        text
    })
}

async fn read_mnemonic(file: Option<&PathBuf>) -> anyhow::Result<String> {
    if let Some(path) = file {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()));
    }
    if prompt::is_tty() {
        eprint!("Mnemonic: ");
    }
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("failed to read mnemonic from stdin")?;
    Ok(line)
}

pub async fn validators(deps: &Deps) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let list = facade
        .validators()
        .await
        .context("failed to list validators")?;
    deps.out.emit(&list, |p| render_validators(p, &list))
}

fn render_validators(p: &Printer, list: &[manager::ValidatorRecord]) -> String {
    let mut text = format!(
        "{:<24} {:<10} {:>14} {:>8}  {}\n",
        "MONIKER", "STATUS", "POWER", "SHARE", "OPERATOR"
    );
    for v in list {
        let status = if v.jailed { "jailed" } else { v.status.label() };
        let moniker: String = v.moniker.chars().take(24).collect();
        text.push_str(&format!(
            "{moniker:<24} {status:<10} {:>14} {:>7.2}%  {}\n",
            v.voting_power,
            v.voting_fraction * 100.0,
            v.operator_address
        ));
    }
    text.push_str(&format!("{} {} validators", p.glyph(Glyph::Step), list.len()));
    text
}

pub async fn addr(deps: &Deps, args: &AddrArgs) -> anyhow::Result<()> {
    let facade = deps.validator()?;
    let forms = facade
        .addresses(&args.address)
        .await
        .context("address conversion failed")?;
    deps.out.emit(&forms, |p| {
        let mut text = p.field("hex", &forms.hex);
        text.push_str(&p.field("evm", &forms.evm));
        text.push_str(&p.field("account", &forms.account));
        text.push_str(&p.field("operator", &forms.operator));
        text.push_str(&p.field("consensus", &forms.consensus));
        text
    })
}
