//! Command handlers: one function per command, dispatched from
//! a `Command` enum parsed out of the request's first token -- a tagged sum,
//! not a runtime string->fn-pointer table.

use payproc_api_core::currency;
use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::kv::{KvList, Name};

use crate::context::Context;
use crate::journal::{JournalFields, RecordType};
use crate::protocol::Request;

/// The outcome of dispatching one request: an ordinary synchronous
/// response, the special two-stage `PPIPNHD` flow, or a
/// shutdown request to hand back to the accept loop after the `OK` has
/// been written.
pub enum Outcome {
    Response(Result<KvList, PayprocError>),
    /// `OK` has already been decided; the caller must shut down the write
    /// half and hand `body` to `crate::gateway::paypal::PaypalClient::
    /// verify_ipn` on a detached task.
    Ipn { ok: Result<KvList, PayprocError>, body: String },
    Shutdown(Result<KvList, PayprocError>),
}

enum Command {
    Ping,
    GetInfo,
    Session,
    CardToken,
    ChargeCard,
    PpCheckout,
    SepaPreorder,
    CheckAmount,
    CommitPreorder,
    GetPreorder,
    ListPreorder,
    PpIpnHd,
    Shutdown,
    Unknown,
}

impl Command {
    fn parse(token: &str) -> Self {
        match token {
            "PING" => Command::Ping,
            "GETINFO" => Command::GetInfo,
            "SESSION" => Command::Session,
            "CARDTOKEN" => Command::CardToken,
            "CHARGECARD" => Command::ChargeCard,
            "PPCHECKOUT" => Command::PpCheckout,
            "SEPAPREORDER" => Command::SepaPreorder,
            "CHECKAMOUNT" => Command::CheckAmount,
            "COMMITPREORDER" => Command::CommitPreorder,
            "GETPREORDER" => Command::GetPreorder,
            "LISTPREORDER" => Command::ListPreorder,
            "PPIPNHD" => Command::PpIpnHd,
            "SHUTDOWN" => Command::Shutdown,
            _ => Command::Unknown,
        }
    }

    /// Whether this command requires the admin uid allow-list rather than
    /// the ordinary one ("a subset allow-list gates admin
    /// commands (`SHUTDOWN`)").
    fn is_admin_only(&self) -> bool {
        matches!(self, Command::Shutdown)
    }
}

/// Dispatches one parsed request against `ctx`, gating on `uid` first.
/// `PING`/`GETINFO` are exempt from the allow-list -- liveness and version
/// queries are meant to work even for an otherwise-unlisted local health
/// check.
pub async fn dispatch(ctx: &Context, uid: u32, req: Request) -> Outcome {
    let command = Command::parse(&req.command);

    if command.is_admin_only() {
        if !ctx.is_admin(uid) {
            return Outcome::Response(Err(PayprocError::new(ErrorKind::Permission, "admin command not allowed for this uid")));
        }
    } else if !matches!(command, Command::Ping | Command::GetInfo) && !ctx.is_allowed(uid) {
        return Outcome::Response(Err(PayprocError::new(ErrorKind::Permission, "command not allowed for this uid")));
    }

    match command {
        Command::Ping => Outcome::Response(handle_ping(&req)),
        Command::GetInfo => Outcome::Response(handle_getinfo(ctx, &req)),
        Command::Session => Outcome::Response(handle_session(ctx, &req).await),
        Command::CardToken => Outcome::Response(handle_cardtoken(ctx, req).await),
        Command::ChargeCard => Outcome::Response(handle_chargecard(ctx, req).await),
        Command::PpCheckout => Outcome::Response(handle_ppcheckout(ctx, req).await),
        Command::SepaPreorder => Outcome::Response(handle_sepapreorder(ctx, &req)),
        Command::CheckAmount => Outcome::Response(handle_checkamount(ctx, &req).await),
        Command::CommitPreorder => Outcome::Response(handle_commitpreorder(ctx, &req)),
        Command::GetPreorder => Outcome::Response(handle_getpreorder(ctx, &req)),
        Command::ListPreorder => Outcome::Response(handle_listpreorder(ctx, &req)),
        Command::PpIpnHd => handle_ppipnhd(&req),
        Command::Shutdown => Outcome::Shutdown(Ok(KvList::new())),
        Command::Unknown => Outcome::Response(Err(PayprocError::new(ErrorKind::UnknownCommand, format!("unknown command '{}'", req.command)))),
    }
}

fn ok(pairs: impl IntoIterator<Item = (&'static str, String)>) -> Result<KvList, PayprocError> {
    let mut dict = KvList::new();
    for (name, value) in pairs {
        dict.put(Name::new(name)?, value);
    }
    Ok(dict)
}

/// The one internal name the connection loop special-cases: its value, if
/// present, becomes the `OK`-line's trailing extra text (`PING`'s
/// `OK pong`/`OK text`) rather than being written as a data line.
pub const OK_EXTRA_NAME: &str = "_Ok-Extra";

/// `PING [text]`: echoes `text` back, or `pong` if none was
/// given.
fn handle_ping(req: &Request) -> Result<KvList, PayprocError> {
    let text = req.args.first().cloned().unwrap_or_else(|| "pong".to_owned());
    let mut dict = KvList::new();
    dict.put(Name::new(OK_EXTRA_NAME)?, text);
    Ok(dict)
}

fn handle_getinfo(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let sub = req.args.first().map(String::as_str).unwrap_or_default();
    match sub {
        "version" => ok([("Version", env!("CARGO_PKG_VERSION").to_owned())]),
        "pid" => ok([("Pid", std::process::id().to_string())]),
        "live" => ok([("Live", if ctx.config.live { "t" } else { "f" }.to_owned())]),
        "list-currencies" => {
            let codes: Vec<&str> = currency::CURRENCIES.iter().map(|c| c.code).collect();
            ok([("Currencies", codes.join(","))])
        }
        _ => Err(PayprocError::invalid_value("sub")),
    }
}

/// `SESSION <sub> [id]`.
async fn handle_session(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let sub = req.args.first().map(String::as_str).unwrap_or_default();
    match sub {
        "create" => {
            let ttl = req.args.get(1).map(|s| s.parse::<i64>()).transpose().map_err(|_| PayprocError::invalid_value("ttl"))?;
            let sessid = ctx.sessions.create(ttl, req.dict.clone()).await?;
            ok([("_SESSID", sessid)])
        }
        "get" => {
            let sessid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Session-Id"))?;
            let dict = ctx.sessions.get(sessid).await?;
            Ok(dict)
        }
        "put" => {
            let sessid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Session-Id"))?;
            ctx.sessions.put(sessid, req.dict.clone()).await?;
            ok([])
        }
        "destroy" => {
            let sessid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Session-Id"))?;
            ctx.sessions.destroy(sessid).await?;
            ok([])
        }
        "alias" => {
            let sessid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Session-Id"))?;
            let aliasid = ctx.sessions.create_alias(sessid).await?;
            ok([("_ALIASID", aliasid)])
        }
        "dealias" => {
            let aliasid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Alias-Id"))?;
            ctx.sessions.destroy_alias(aliasid).await?;
            ok([])
        }
        "sessid" => {
            let aliasid = req.args.get(1).ok_or_else(|| PayprocError::missing_value("Alias-Id"))?;
            let sessid = ctx.sessions.get_sessid(aliasid).await?;
            ok([("_SESSID", sessid)])
        }
        _ => Err(PayprocError::invalid_value("sub")),
    }
}

async fn handle_cardtoken(ctx: &Context, mut req: Request) -> Result<KvList, PayprocError> {
    ctx.stripe.create_card_token(&mut req.dict).await?;
    Ok(req.dict)
}

/// `CHARGECARD`: converts `Amount`/`Currency` to `_amount` minor units
/// before handing off to the Stripe adapter, then journals the charge.
async fn handle_chargecard(ctx: &Context, mut req: Request) -> Result<KvList, PayprocError> {
    let currency_code = currency::validate_code(req.dict.get_str("Currency").ok_or_else(|| PayprocError::missing_value("Currency"))?)?;
    let meta = currency::lookup(&currency_code).expect("validated above");
    let amount_str = req.dict.get_str("Amount").ok_or_else(|| PayprocError::missing_value("Amount"))?;
    let minor = currency::to_minor_units(amount_str, meta.decdigits).ok_or_else(|| PayprocError::invalid_value("Amount"))?;
    req.dict.put(Name::new("Currency")?, currency_code.clone());
    req.dict.put(Name::new("_amount")?, minor.to_string());

    let email = req.dict.get_str("Email").map(str::to_owned);
    let desc = req.dict.get_str("Desc").unwrap_or_default().to_owned();

    ctx.stripe.charge_card(&mut req.dict).await?;

    let charge_id = req.dict.get_str("Charge-Id").unwrap_or_default().to_owned();
    let last4 = req.dict.get_str("Last4").unwrap_or_default().to_owned();
    let live = req.dict.get_str("Live").unwrap_or("f").to_owned();
    let euro = ctx.currency.convert_to_euro(minor, meta.decdigits, &currency_code).await;

    ctx.journal.append(
        &ctx.shutdown,
        RecordType::Charge,
        &JournalFields {
            date: crate::journal::new_timestamp(),
            live,
            currency: currency_code,
            amount: amount_str.to_owned(),
            desc,
            mail: email.unwrap_or_default(),
            meta: crate::preorder::serialize_meta(&req.dict),
            last4,
            service: "stripe".to_owned(),
            chargeid: charge_id,
            euro,
            ..Default::default()
        },
    );
    req.dict.put(Name::new("_timestamp")?, crate::journal::new_timestamp());
    Ok(req.dict)
}

async fn handle_ppcheckout(ctx: &Context, mut req: Request) -> Result<KvList, PayprocError> {
    let sub = req.args.first().map(String::as_str).unwrap_or_default();
    match sub {
        "prepare" => {
            if req.dict.contains(&Name::new("Recur")?) {
                ctx.paypal.prepare_subscription(&mut req.dict, &ctx.sessions, &ctx.accounts).await?;
            } else {
                ctx.paypal.checkout_prepare(&mut req.dict, &ctx.sessions).await?;
            }
            Ok(req.dict)
        }
        "execute" => {
            ctx.paypal.checkout_execute(&mut req.dict, &ctx.sessions, &ctx.accounts, &ctx.keys).await?;

            let currency_code = req.dict.get_str("Currency").unwrap_or_default().to_owned();
            let amount_str = req.dict.get_str("Amount").unwrap_or_default().to_owned();
            let meta = currency::lookup(&currency_code);
            let euro = match meta {
                Some(meta) => match currency::to_minor_units(&amount_str, meta.decdigits) {
                    Some(minor) => ctx.currency.convert_to_euro(minor, meta.decdigits, &currency_code).await,
                    None => String::new(),
                },
                None => String::new(),
            };
            ctx.journal.append(
                &ctx.shutdown,
                RecordType::Charge,
                &JournalFields {
                    date: crate::journal::new_timestamp(),
                    live: req.dict.get_str("Live").unwrap_or("f").to_owned(),
                    currency: currency_code,
                    amount: amount_str,
                    mail: req.dict.get_str("Email").unwrap_or_default().to_owned(),
                    service: "paypal".to_owned(),
                    account: req.dict.get_str("account-id").unwrap_or_default().to_owned(),
                    chargeid: req.dict.get_str("Charge-Id").unwrap_or_default().to_owned(),
                    euro,
                    ..Default::default()
                },
            );
            Ok(req.dict)
        }
        _ => Err(PayprocError::invalid_value("sub")),
    }
}

/// `SEPAPREORDER`: the journal acquires a new `C` row at preorder-creation
/// time too (in addition to `COMMITPREORDER`'s row at payment
/// confirmation) -- an unpaid intent is still a charge-in-waiting worth a
/// journal trail. See `DESIGN.md`.
fn handle_sepapreorder(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let currency_code = currency::validate_code(req.dict.get_str("Currency").unwrap_or("EUR"))?;
    if currency_code != "EUR" {
        return Err(PayprocError::invalid_value("Currency"));
    }
    let amount_str = req.dict.get_str("Amount").ok_or_else(|| PayprocError::missing_value("Amount"))?.to_owned();
    let meta = currency::lookup(&currency_code).expect("EUR is always known");
    currency::to_minor_units(&amount_str, meta.decdigits).ok_or_else(|| PayprocError::invalid_value("Amount"))?;

    let (sepa_ref, _refnn) = ctx.preorders.store(&req.dict)?;
    let timestamp = crate::journal::new_timestamp();

    ctx.journal.append(
        &ctx.shutdown,
        RecordType::Charge,
        &JournalFields {
            date: timestamp.clone(),
            live: "f".to_owned(),
            currency: currency_code.clone(),
            amount: amount_str.clone(),
            desc: req.dict.get_str("Desc").unwrap_or_default().to_owned(),
            mail: req.dict.get_str("Email").unwrap_or_default().to_owned(),
            meta: crate::preorder::serialize_meta(&req.dict),
            service: "sepa".to_owned(),
            chargeid: sepa_ref.clone(),
            ..Default::default()
        },
    );

    ok([
        ("Sepa-Ref", sepa_ref),
        ("Amount", amount_str),
        ("Currency", currency_code),
        ("_timestamp", timestamp),
    ])
}

/// `CHECKAMOUNT`: validates an amount against its
/// currency's grammar and reports the canonical minor-unit amount plus its
/// Euro equivalent when a rate is known.
async fn handle_checkamount(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let currency_code = currency::validate_code(req.dict.get_str("Currency").ok_or_else(|| PayprocError::missing_value("Currency"))?)?;
    let meta = currency::lookup(&currency_code).expect("validated above");
    let amount_str = req.dict.get_str("Amount").ok_or_else(|| PayprocError::missing_value("Amount"))?;
    let minor = currency::to_minor_units(amount_str, meta.decdigits).ok_or_else(|| PayprocError::invalid_value("Amount"))?;
    let canonical = currency::from_minor_units(minor, meta.decdigits);
    let euro = ctx.currency.convert_to_euro(minor, meta.decdigits, &currency_code).await;

    let mut dict = ok([("_amount", minor.to_string()), ("Amount", canonical)])?;
    if !euro.is_empty() {
        dict.put(Name::new("Euro")?, euro);
    }
    Ok(dict)
}

/// `COMMITPREORDER`: posts a received SEPA payment
/// against an existing preorder row, then journals it. The journal write
/// happens after the SQL update has succeeded.
fn handle_commitpreorder(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let sepa_ref = req.dict.get_str("Sepa-Ref").ok_or_else(|| PayprocError::missing_value("Sepa-Ref"))?.to_owned();
    let currency_code = currency::validate_code(req.dict.get_str("Currency").unwrap_or("EUR"))?;
    if currency_code != "EUR" {
        return Err(PayprocError::invalid_value("Currency"));
    }
    let amount_str = req.dict.get_str("Amount").ok_or_else(|| PayprocError::missing_value("Amount"))?.to_owned();

    let mut dict = req.dict.clone();
    ctx.preorders.update(&sepa_ref, &mut dict)?;

    let record = ctx.preorders.get(&sepa_ref)?;
    ctx.journal.append(
        &ctx.shutdown,
        RecordType::Charge,
        &JournalFields {
            date: dict.get_str("_timestamp").unwrap_or_default().to_owned(),
            live: "f".to_owned(),
            currency: currency_code,
            amount: amount_str,
            desc: record.get_str("Desc").unwrap_or_default().to_owned(),
            mail: record.get_str("Email").unwrap_or_default().to_owned(),
            service: "sepa".to_owned(),
            chargeid: sepa_ref,
            ..Default::default()
        },
    );
    Ok(dict)
}

fn handle_getpreorder(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let sepa_ref = req.dict.get_str("Sepa-Ref").ok_or_else(|| PayprocError::missing_value("Sepa-Ref"))?;
    ctx.preorders.get(sepa_ref)
}

fn handle_listpreorder(ctx: &Context, req: &Request) -> Result<KvList, PayprocError> {
    let refnn = req
        .dict
        .get_str("Refnn")
        .map(|s| s.parse::<u8>())
        .transpose()
        .map_err(|_| PayprocError::invalid_value("Refnn"))?;
    ctx.preorders.list(refnn)
}

/// `PPIPNHD`: the two-stage async flow. The dispatcher
/// itself only produces the immediate `OK` and hands the raw body back to
/// the caller, which shuts down the write half and spawns the offline
/// verification task.
fn handle_ppipnhd(req: &Request) -> Outcome {
    let body = req.dict.get_str("Request").unwrap_or_default().to_owned();
    Outcome::Ipn { ok: Ok(KvList::new()), body }
}
