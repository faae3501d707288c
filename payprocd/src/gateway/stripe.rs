//! The Stripe adapter: card tokenization, charging, and the
//! plan/subscription flow behind recurring donations.

use payproc_api_core::error::{ErrorKind, PayprocError};
use payproc_api_core::kv::{KvList, Name};
use payproc_crypto::Keys;
use serde_json::Value;

use crate::account::AccountStore;

use super::parse_json_body;

const BASE_URL: &str = "https://api.stripe.com/v1";

pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    base_url: String,
}

impl StripeClient {
    pub fn new(http: reqwest::Client, secret_key: String) -> Self {
        Self { http, secret_key, base_url: BASE_URL.to_owned() }
    }

    /// Test/sandbox hook: points requests at a mock server instead of
    /// `api.stripe.com`.
    #[cfg(test)]
    pub fn with_base_url(http: reqwest::Client, secret_key: String, base_url: String) -> Self {
        Self { http, secret_key, base_url }
    }

    async fn get(&self, path: &str) -> Result<(u16, Value), PayprocError> {
        let response = self
            .http
            .get(format!("{}/{path}", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("Stripe request failed: {e}")))?;
        parse_json_body("stripe", response).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<(u16, Value), PayprocError> {
        let response = self
            .http
            .post(format!("{}/{path}", self.base_url))
            .basic_auth(&self.secret_key, Some(""))
            .form(form)
            .send()
            .await
            .map_err(|e| PayprocError::new(ErrorKind::General, format!("Stripe request failed: {e}")))?;
        parse_json_body("stripe", response).await
    }

    /// Demultiplexes a non-2xx Stripe error envelope: a
    /// `card_error` surfaces the issuer's own `code`/`message` as
    /// `failure`/`failure-mesg`; everything else (`invalid_request_error`,
    /// `api_error`, ...) produces a generic failure tag.
    fn demux_error(status: u16, body: &Value) -> PayprocError {
        let error = &body["error"];
        let err_type = error["type"].as_str().unwrap_or("unknown").to_owned();
        let message = error["message"].as_str().map(str::to_owned);
        let code = error["code"].as_str().map(str::to_owned);
        let base = PayprocError::new(
            ErrorKind::Upstream { gateway: "stripe", status, code: code.clone(), r#type: Some(err_type.clone()), message: message.clone() },
            message.clone().unwrap_or_else(|| format!("Stripe request failed with status {status}")),
        );
        if err_type == "card_error" {
            base.with_failure(code, message)
        } else {
            base
        }
    }

    /// **Create card token** (`CARDTOKEN`). Validates `Exp-Year`/
    /// `Exp-Month`/`Cvc` ranges itself (an invalid month fails with the
    /// specific wire code 55, not the generic `InvalidValue` default),
    /// then strips the raw card fields from `dict` so they are never
    /// echoed or journaled.
    pub async fn create_card_token(&self, dict: &mut KvList) -> Result<(), PayprocError> {
        let number = dict.get_str("Number").ok_or_else(|| PayprocError::missing_value("Number")).map(str::to_owned)?;
        let exp_year: u32 = dict
            .get_str("Exp-Year")
            .ok_or_else(|| PayprocError::missing_value("Exp-Year"))?
            .parse()
            .map_err(|_| PayprocError::invalid_value("Exp-Year"))?;
        if !(2014..=2199).contains(&exp_year) {
            return Err(PayprocError::with_code(ErrorKind::InvalidValue, 55, "Invalid expiration year"));
        }
        let exp_month: u32 = dict
            .get_str("Exp-Month")
            .ok_or_else(|| PayprocError::missing_value("Exp-Month"))?
            .parse()
            .map_err(|_| PayprocError::with_code(ErrorKind::InvalidValue, 55, "Invalid expiration month"))?;
        if !(1..=12).contains(&exp_month) {
            return Err(PayprocError::with_code(ErrorKind::InvalidValue, 55, "Invalid expiration month"));
        }
        let cvc: u32 = dict
            .get_str("Cvc")
            .ok_or_else(|| PayprocError::missing_value("Cvc"))?
            .parse()
            .map_err(|_| PayprocError::invalid_value("Cvc"))?;
        if !(100..=9999).contains(&cvc) {
            return Err(PayprocError::invalid_value("Cvc"));
        }
        let name = dict.get_str("Name").map(str::to_owned);

        let mut form = vec![
            ("card[number]", number),
            ("card[exp_month]", exp_month.to_string()),
            ("card[exp_year]", exp_year.to_string()),
            ("card[cvc]", cvc.to_string()),
        ];
        if let Some(name) = &name {
            form.push(("card[name]", name.clone()));
        }

        let (status, body) = self.post_form("tokens", &form).await?;
        if status >= 400 {
            return Err(Self::demux_error(status, &body));
        }

        for name in ["Number", "Exp-Year", "Exp-Month", "Cvc", "Name"] {
            dict.remove(&Name::new(name)?);
        }

        let token = body["id"].as_str().ok_or_else(|| PayprocError::new(ErrorKind::InvalidObject, "Stripe token response missing 'id'"))?;
        let last4 = body["card"]["last4"].as_str().unwrap_or("");
        let live = body["livemode"].as_bool().unwrap_or(false);
        dict.put(Name::new("Token")?, token);
        dict.put(Name::new("Last4")?, last4);
        dict.put(Name::new("Live")?, if live { "t" } else { "f" });
        Ok(())
    }

    /// **Charge card**. `_amount` is already an integer count of minor
    /// units; Stripe's `amount` parameter takes exactly that.
    pub async fn charge_card(&self, dict: &mut KvList) -> Result<(), PayprocError> {
        let currency = dict.get_str("Currency").ok_or_else(|| PayprocError::missing_value("Currency"))?.to_lowercase();
        let amount = dict.get_str("_amount").ok_or_else(|| PayprocError::missing_value("_amount"))?.to_owned();
        let card_token = dict.get_str("Card-Token").ok_or_else(|| PayprocError::missing_value("Card-Token"))?.to_owned();
        let desc = dict.get_str("Desc").map(str::to_owned);
        let stmt_desc = dict.get_str("Stmt-Desc").map(str::to_owned);

        let mut form = vec![
            ("amount", amount.clone()),
            ("currency", currency),
            ("source", card_token),
        ];
        if let Some(desc) = &desc {
            form.push(("description", desc.clone()));
        }
        if let Some(stmt_desc) = &stmt_desc {
            form.push(("statement_descriptor", stmt_desc.clone()));
        }

        let (status, body) = self.post_form("charges", &form).await?;
        if status >= 400 {
            return Err(Self::demux_error(status, &body));
        }

        let charge_id = body["id"].as_str().ok_or_else(|| PayprocError::new(ErrorKind::InvalidObject, "Stripe charge response missing 'id'"))?;
        let balance_txn = body["balance_transaction"].as_str().unwrap_or("");
        let live = body["livemode"].as_bool().unwrap_or(false);
        let last4 = body["source"]["last4"].as_str().unwrap_or("");
        dict.put(Name::new("Charge-Id")?, charge_id);
        dict.put(Name::new("balance-transaction")?, balance_txn);
        dict.put(Name::new("Live")?, if live { "t" } else { "f" });
        dict.put(Name::new("_amount")?, amount);
        dict.put(Name::new("Last4")?, last4);
        Ok(())
    }

    /// **Find-or-create plan**. The plan id is
    /// deterministic (`gnupg-<recur>-<amount>-<currency>`) so repeated
    /// donations of the same shape reuse one plan rather than accumulating
    /// duplicates.
    pub async fn find_or_create_plan(&self, dict: &mut KvList) -> Result<(), PayprocError> {
        let currency = dict.get_str("Currency").ok_or_else(|| PayprocError::missing_value("Currency"))?.to_lowercase();
        let recur: u32 = dict
            .get_str("Recur")
            .ok_or_else(|| PayprocError::missing_value("Recur"))?
            .parse()
            .map_err(|_| PayprocError::invalid_value("Recur"))?;
        if ![1, 4, 12].contains(&recur) {
            return Err(PayprocError::invalid_value("Recur"));
        }
        let amount = dict.get_str("_amount").ok_or_else(|| PayprocError::missing_value("_amount"))?.to_owned();
        let stmt_desc = dict.get_str("Stmt-Desc").ok_or_else(|| PayprocError::missing_value("Stmt-Desc"))?.to_owned();

        let plan_id = format!("gnupg-{recur}-{amount}-{currency}");

        let (status, _body) = self.get(&format!("plans/{plan_id}")).await?;
        if status != 404 {
            dict.put(Name::new("_plan-id")?, plan_id);
            return Ok(());
        }

        let (interval, interval_count) = match recur {
            1 => ("year", "1"),
            4 => ("month", "3"),
            12 => ("month", "1"),
            _ => unreachable!("validated above"),
        };
        let form = vec![
            ("id", plan_id.clone()),
            ("amount", amount),
            ("currency", currency),
            ("interval", interval.to_owned()),
            ("interval_count", interval_count.to_owned()),
            ("product[name]", stmt_desc),
        ];
        let (status, body) = self.post_form("plans", &form).await?;
        if status >= 400 {
            return Err(Self::demux_error(status, &body));
        }
        dict.put(Name::new("_plan-id")?, plan_id);
        Ok(())
    }

    /// **Create subscription**: creates a fresh payproc account, a Stripe
    /// customer carrying the account id as metadata, the subscription
    /// binding, then persists the encrypted customer id.
    pub async fn create_subscription(
        &self,
        dict: &mut KvList,
        accounts: &AccountStore,
        keys: &Keys,
    ) -> Result<(), PayprocError> {
        let plan_id = dict.get_str("_plan-id").ok_or_else(|| PayprocError::missing_value("_plan-id"))?.to_owned();
        let card_token = dict.get_str("Card-Token").ok_or_else(|| PayprocError::missing_value("Card-Token"))?.to_owned();
        let email = dict.get_str("Email").map(str::to_owned);

        let account_id = accounts.create(email.as_deref())?;

        let mut customer_form = vec![("source", card_token), ("metadata[account_id]", account_id.clone())];
        if let Some(email) = &email {
            customer_form.push(("email", email.clone()));
        }
        let (status, customer_body) = self.post_form("customers", &customer_form).await?;
        if status >= 400 {
            return Err(Self::demux_error(status, &customer_body));
        }
        let customer_id = customer_body["id"]
            .as_str()
            .ok_or_else(|| PayprocError::new(ErrorKind::InvalidObject, "Stripe customer response missing 'id'"))?
            .to_owned();

        let sub_form = vec![("customer", customer_id.clone()), ("items[0][plan]", plan_id)];
        let (status, sub_body) = self.post_form("subscriptions", &sub_form).await?;
        if status >= 400 {
            return Err(Self::demux_error(status, &sub_body));
        }
        let live = sub_body["livemode"].as_bool().unwrap_or(false);

        accounts.set_stripe_customer(&account_id, &customer_id, keys)?;

        dict.put(Name::new("Live")?, if live { "t" } else { "f" });
        dict.put(Name::new("account-id")?, account_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequoia_openpgp::cert::CertBuilder;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn dict_with(pairs: &[(&str, &str)]) -> KvList {
        let mut kv = KvList::new();
        for (k, v) in pairs {
            kv.put(Name::new(*k).unwrap(), *v);
        }
        kv
    }

    fn test_keys() -> Keys {
        let (cert, _rev) = CertBuilder::general_purpose(None, Some("payproc test <test@example.com>")).generate().unwrap();
        Keys::new(cert, None).unwrap()
    }

    #[tokio::test]
    async fn cardtoken_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "tok_1", "livemode": false, "card": {"last4": "4242"}
            })))
            .mount(&server)
            .await;

        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), server.uri());
        let mut dict = dict_with(&[("Number", "4242424242424242"), ("Exp-Year", "2030"), ("Exp-Month", "12"), ("Cvc", "123")]);
        client.create_card_token(&mut dict).await.unwrap();

        assert_eq!(dict.get_str("Token"), Some("tok_1"));
        assert_eq!(dict.get_str("Last4"), Some("4242"));
        assert_eq!(dict.get_str("Live"), Some("f"));
        assert_eq!(dict.get_str("Number"), None, "raw card fields must be stripped");
    }

    #[tokio::test]
    async fn cardtoken_invalid_month() {
        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), "http://unused.invalid".to_owned());
        let mut dict = dict_with(&[("Number", "4242424242424242"), ("Exp-Year", "2030"), ("Exp-Month", "13"), ("Cvc", "123")]);
        let err = client.create_card_token(&mut dict).await.unwrap_err();
        assert_eq!(err.code, 55);
    }

    #[tokio::test]
    async fn charge_card_demuxes_card_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/charges"))
            .respond_with(ResponseTemplate::new(402).set_body_json(serde_json::json!({
                "error": {"type": "card_error", "code": "card_declined", "message": "Your card was declined."}
            })))
            .mount(&server)
            .await;

        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), server.uri());
        let mut dict = dict_with(&[("Currency", "EUR"), ("_amount", "1000"), ("Card-Token", "tok_1")]);
        let err = client.charge_card(&mut dict).await.unwrap_err();
        assert_eq!(err.failure.as_deref(), Some("card_declined"));
        assert_eq!(err.failure_mesg.as_deref(), Some("Your card was declined."));
    }

    #[tokio::test]
    async fn find_or_create_plan_reuses_existing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plans/gnupg-1-1000-eur"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "gnupg-1-1000-eur"})))
            .mount(&server)
            .await;

        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), server.uri());
        let mut dict = dict_with(&[("Currency", "EUR"), ("Recur", "1"), ("_amount", "1000"), ("Stmt-Desc", "Donation")]);
        client.find_or_create_plan(&mut dict).await.unwrap();
        assert_eq!(dict.get_str("_plan-id"), Some("gnupg-1-1000-eur"));
    }

    #[tokio::test]
    async fn find_or_create_plan_creates_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/plans/gnupg-12-500-usd"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({"error": {"type": "invalid_request_error"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/plans"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "gnupg-12-500-usd"})))
            .mount(&server)
            .await;

        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), server.uri());
        let mut dict = dict_with(&[("Currency", "USD"), ("Recur", "12"), ("_amount", "500"), ("Stmt-Desc", "Donation")]);
        client.find_or_create_plan(&mut dict).await.unwrap();
        assert_eq!(dict.get_str("_plan-id"), Some("gnupg-12-500-usd"));
    }

    #[tokio::test]
    async fn create_subscription_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/customers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "cus_1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/subscriptions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "sub_1", "livemode": false})))
            .mount(&server)
            .await;

        let client = StripeClient::with_base_url(reqwest::Client::new(), "sk_test".to_owned(), server.uri());
        let accounts = AccountStore::open_in_memory().unwrap();
        let keys = test_keys();
        let mut dict = dict_with(&[("_plan-id", "gnupg-1-1000-eur"), ("Card-Token", "tok_1"), ("Email", "a@b.com")]);

        client.create_subscription(&mut dict, &accounts, &keys).await.unwrap();
        assert_eq!(dict.get_str("Live"), Some("f"));
        let account_id = dict.get_str("account-id").unwrap().to_owned();

        let got = accounts.get(&account_id, &keys).unwrap();
        assert_eq!(got.get_str("_Stripe-Cus"), Some("cus_1"));
    }
}
