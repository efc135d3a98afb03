//! Per-connection authentication state.

/// Identity cached after a successful LOGIN.
#[derive(Clone, Debug)]
pub struct AuthedUser {
    pub user_id: i64,
    pub username: String,
}

/// Session state owned by one connection handler for one connection.
///
/// SIGNUP does not authenticate; only LOGIN does. A later LOGIN replaces
/// the identity, a failed one leaves it untouched. The session dies with
/// the connection.
#[derive(Debug, Default)]
pub struct Session {
    auth: Option<AuthedUser>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful LOGIN.
    pub fn authenticate(&mut self, user_id: i64, username: String) {
        self.auth = Some(AuthedUser { user_id, username });
    }

    /// The logged-in identity, if any.
    pub fn user(&self) -> Option<&AuthedUser> {
        self.auth.as_ref()
    }
}
