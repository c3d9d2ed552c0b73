use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Every client logs in with the shared access code as its cleartext
/// password; the user name is not checked.
#[derive(Debug)]
pub struct AccessCodeAuthSource {
    access_code: String,
}

impl AccessCodeAuthSource {
    pub fn new(access_code: String) -> Self {
        Self { access_code }
    }
}

#[async_trait]
impl AuthSource for AccessCodeAuthSource {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.access_code.as_bytes().to_vec()))
    }
}
