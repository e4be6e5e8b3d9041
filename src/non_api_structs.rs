use crate::{User, UserId};
use serde::{Deserialize, Serialize};

/// Stored user record. Never leaves the server as-is; handlers project it
/// through [`UserRecord::public`] so the password field stays internal.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: String,
    pub password: String,
    pub friends: Vec<UserId>,
}

impl UserRecord {
    pub fn public(&self) -> User {
        User {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    pub fn is_friend(&self, other: &UserId) -> bool {
        self.friends.contains(other)
    }
}
