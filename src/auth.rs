use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared connection password. Which user a login acts as is decided per
/// query by `access::resolve`, not here.
#[derive(Debug)]
pub struct LabresAuthSource {
    password: String,
}

impl LabresAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for LabresAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!("password check for login {:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
