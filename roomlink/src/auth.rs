//! Static login table for the demo deployment

use roomlink_session::LocalUser;

struct Credentials {
    user_id: &'static str,
    password: &'static str,
    user_name: &'static str,
}

const USERS: [Credentials; 3] = [
    Credentials {
        user_id: "aa",
        password: "aa",
        user_name: "testUser01",
    },
    Credentials {
        user_id: "bb",
        password: "bb",
        user_name: "testUser02",
    },
    Credentials {
        user_id: "cc",
        password: "cc",
        user_name: "testUser03",
    },
];

/// Resolve a login to its display identity
///
/// Returns `None` for an unknown user or a wrong password.
pub fn find_user(user_id: &str, password: &str) -> Option<LocalUser> {
    USERS
        .iter()
        .find(|c| c.user_id == user_id && c.password == password)
        .map(|c| LocalUser::new(c.user_id, c.user_name))
}
