use std::collections::BTreeMap;

use super::config::App;
use crate::error::{AuthError, Result};
use crate::token::{Token, secure_compare};
use crate::websocket::SocketId;

/// How far an `auth_timestamp` may drift from server wall clock.
pub const AUTH_TIMESTAMP_TOLERANCE_SECS: i64 = 600;

pub const AUTH_VERSION: &str = "1.0";

/// Signature checks for channel subscriptions and REST API requests.
pub struct AuthValidator;

impl AuthValidator {
    fn subscription_string_to_sign(
        socket_id: &SocketId,
        channel: &str,
        channel_data: Option<&str>,
    ) -> String {
        match channel_data {
            Some(data) => format!("{socket_id}:{channel}:{data}"),
            None => format!("{socket_id}:{channel}"),
        }
    }

    /// Produce the auth token a client presents on subscribe:
    /// `app_key:hex_hmac`.
    pub fn sign_channel_auth(
        app: &App,
        socket_id: &SocketId,
        channel: &str,
        channel_data: Option<&str>,
    ) -> String {
        let token = Token::new(app.key.clone(), app.secret.clone());
        let signature = token.sign(&Self::subscription_string_to_sign(
            socket_id,
            channel,
            channel_data,
        ));
        format!("{}:{}", app.key, signature)
    }

    /// Verify a subscribe auth token. The comparison covers the whole
    /// `key:signature` token in constant time.
    pub fn validate_channel_auth(
        app: &App,
        socket_id: &SocketId,
        channel: &str,
        channel_data: Option<&str>,
        auth: &str,
    ) -> bool {
        let expected = Self::sign_channel_auth(app, socket_id, channel, channel_data);
        secure_compare(auth, &expected)
    }

    /// Validate a signed REST request against the app secret.
    ///
    /// `params` is the full query multimap as received; values are used
    /// exactly as parsed, without URL re-encoding, to stay bit-compatible
    /// with reference signers.
    pub fn validate_api_request(
        app: &App,
        method: &str,
        path: &str,
        params: &BTreeMap<String, Vec<String>>,
        body: &[u8],
    ) -> Result<()> {
        let auth_key = Self::required_param(params, "auth_key")?;
        if auth_key != app.key {
            return Err(AuthError::UnknownKey.into());
        }

        let auth_version = Self::required_param(params, "auth_version")?;
        if auth_version != AUTH_VERSION {
            return Err(
                AuthError::InvalidFormat(format!("auth_version must be {AUTH_VERSION}")).into(),
            );
        }

        let timestamp: i64 = Self::required_param(params, "auth_timestamp")?
            .parse()
            .map_err(|_| AuthError::InvalidFormat("auth_timestamp is not an integer".into()))?;
        let now = chrono::Utc::now().timestamp();
        if (now - timestamp).abs() > AUTH_TIMESTAMP_TOLERANCE_SECS {
            return Err(AuthError::StaleTimestamp.into());
        }

        if !body.is_empty() {
            let body_md5 = Self::required_param(params, "body_md5")?;
            let expected_md5 = format!("{:x}", md5::compute(body));
            if !secure_compare(body_md5, &expected_md5) {
                return Err(AuthError::BodyMd5Mismatch.into());
            }
        }

        let signature = Self::required_param(params, "auth_signature")?;
        let string_to_sign = Self::api_string_to_sign(method, path, params);
        let token = Token::new(app.key.clone(), app.secret.clone());
        if !secure_compare(signature, &token.sign(&string_to_sign)) {
            return Err(AuthError::SignatureMismatch.into());
        }

        Ok(())
    }

    /// `METHOD\nPATH\nk=v&k=v...` over every parameter except
    /// `auth_signature`, keys in lexicographic order, repeated values
    /// expanded in arrival order.
    pub fn api_string_to_sign(
        method: &str,
        path: &str,
        params: &BTreeMap<String, Vec<String>>,
    ) -> String {
        let query_string = params
            .iter()
            .filter(|(key, _)| key.as_str() != "auth_signature")
            .flat_map(|(key, values)| values.iter().map(move |value| format!("{key}={value}")))
            .collect::<Vec<_>>()
            .join("&");

        format!("{}\n{}\n{}", method.to_uppercase(), path, query_string)
    }

    fn required_param<'a>(
        params: &'a BTreeMap<String, Vec<String>>,
        name: &'static str,
    ) -> std::result::Result<&'a str, AuthError> {
        params
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
            .ok_or(AuthError::MissingParam(name))
    }
}
