//! Protocol-level error codes shared between handlers and the dispatcher.
//! These are the codes placed in the `error` message's `error_code` field,
//! not Rust error types themselves. The catalog is normative: handlers
//! must not invent new codes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthMissingCredentials,
    CredentialsTooLong,
    UserNotFound,
    IncorrectPassword,
    SignupMissingCredentials,
    FieldsTooLong,
    InvalidNameFormat,
    InvalidUsername,
    WeakPassword,
    UsernameExists,
    MissingRefreshToken,
    RefreshFailed,
    MissingToken,
    TokenExpired,
    InvalidToken,
    InvalidUser,
    MissingFields,
    MissingUserId,
    AddContactFailed,
    FetchFailed,
    TargetNotAvailable,
    TargetNotConnected,
    CallerNotAvailable,
    NotConnected,
    NoActiveConnection,
    CallHistoryError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthMissingCredentials => "AUTH_MISSING_CREDENTIALS",
            ErrorCode::CredentialsTooLong => "CREDENTIALS_TOO_LONG",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::IncorrectPassword => "INCORRECT_PASSWORD",
            ErrorCode::SignupMissingCredentials => "SIGNUP_MISSING_CREDENTIALS",
            ErrorCode::FieldsTooLong => "FIELDS_TOO_LONG",
            ErrorCode::InvalidNameFormat => "INVALID_NAME_FORMAT",
            ErrorCode::InvalidUsername => "INVALID_USERNAME",
            ErrorCode::WeakPassword => "WEAK_PASSWORD",
            ErrorCode::UsernameExists => "USERNAME_EXISTS",
            ErrorCode::MissingRefreshToken => "MISSING_REFRESH_TOKEN",
            ErrorCode::RefreshFailed => "REFRESH_FAILED",
            ErrorCode::MissingToken => "MISSING_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::InvalidUser => "INVALID_USER",
            ErrorCode::MissingFields => "MISSING_FIELDS",
            ErrorCode::MissingUserId => "MISSING_USER_ID",
            ErrorCode::AddContactFailed => "ADD_CONTACT_FAILED",
            ErrorCode::FetchFailed => "FETCH_FAILED",
            ErrorCode::TargetNotAvailable => "TARGET_NOT_AVAILABLE",
            ErrorCode::TargetNotConnected => "TARGET_NOT_CONNECTED",
            ErrorCode::CallerNotAvailable => "CALLER_NOT_AVAILABLE",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::NoActiveConnection => "NO_ACTIVE_CONNECTION",
            ErrorCode::CallHistoryError => "CALL_HISTORY_ERROR",
            ErrorCode::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_to_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::TargetNotAvailable).unwrap();
        assert_eq!(json, "\"TARGET_NOT_AVAILABLE\"");
    }

    #[test]
    fn as_str_matches_serde_rename() {
        for code in [
            ErrorCode::AuthMissingCredentials,
            ErrorCode::WeakPassword,
            ErrorCode::InvalidUser,
            ErrorCode::CallHistoryError,
            ErrorCode::UnknownError,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }
}
