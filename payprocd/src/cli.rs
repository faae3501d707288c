//! Command-line flags. The config file (`--config <path>`) shares this same
//! flag syntax -- see [`crate::config::load_args`] -- rather than introducing
//! a bespoke file format.

use argh::FromArgs;

/// payproc: a payment-processing daemon mediating Stripe/PayPal over a local
/// socket.
#[derive(Debug, FromArgs)]
pub struct Args {
    /// path to a newline-delimited file of additional flags, in the same
    /// syntax as the command line (`/etc/payproc/payprocd.conf` by default
    /// in live mode)
    #[argh(option)]
    pub config: Option<String>,

    /// run against the `-test` path family (`/var/run/payproc-test/...`,
    /// `/var/lib/payproc-test/...`) instead of the live one
    #[argh(switch)]
    pub test_mode: bool,

    /// local socket path; overrides the test-mode default
    #[argh(option)]
    pub socket_path: Option<String>,

    /// directory holding `preorder.db` and `account.db`; overrides the
    /// test-mode default
    #[argh(option)]
    pub db_dir: Option<String>,

    /// basename for daily journal files (`<basename>-YYYYMMDD.log`)
    #[argh(option)]
    pub journal_basename: Option<String>,

    /// uids allowed to issue ordinary (non-admin) commands; may be given
    /// multiple times
    #[argh(option)]
    pub allow_uid: Vec<u32>,

    /// uids allowed to issue admin commands (currently just `SHUTDOWN`); may
    /// be given multiple times
    #[argh(option)]
    pub admin_uid: Vec<u32>,

    /// path to the database OpenPGP key (must carry usable secret material)
    #[argh(option)]
    pub database_key: Option<String>,

    /// path to the back-office OpenPGP public key, if field encryption
    /// should also target an offline operator key
    #[argh(option)]
    pub backoffice_key: Option<String>,

    /// Stripe secret API key
    #[argh(option)]
    pub stripe_secret_key: Option<String>,

    /// PayPal OAuth2 client id
    #[argh(option)]
    pub paypal_client_id: Option<String>,

    /// PayPal OAuth2 client secret
    #[argh(option)]
    pub paypal_client_secret: Option<String>,

    /// use PayPal's sandbox host instead of the live one
    #[argh(switch)]
    pub paypal_sandbox: bool,

    /// receiver email PayPal IPN payloads must match
    #[argh(option)]
    pub paypal_receiver_email: Option<String>,

    /// `tracing-subscriber` `EnvFilter` directive; falls back to `RUST_LOG`,
    /// then `info`
    #[argh(option)]
    pub log_level: Option<String>,
}

impl Args {
    pub fn socket_path(&self) -> String {
        self.socket_path.clone().unwrap_or_else(|| {
            if self.test_mode {
                "/var/run/payproc-test/daemon".to_owned()
            } else {
                "/var/run/payproc/daemon".to_owned()
            }
        })
    }

    pub fn db_dir(&self) -> String {
        self.db_dir.clone().unwrap_or_else(|| {
            if self.test_mode {
                "/var/lib/payproc-test".to_owned()
            } else {
                "/var/lib/payproc".to_owned()
            }
        })
    }
}
