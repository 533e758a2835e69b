use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::model::Actor;
use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password authentication. The login name carries the caller's
/// identity as `<role>:<user ulid>` and must parse before a password is
/// even offered.
#[derive(Debug)]
pub struct StaylockAuthSource {
    password: String,
}

impl StaylockAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for StaylockAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        if let Err(e) = user.parse::<Actor>() {
            metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("invalid login {user:?}: {e}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
