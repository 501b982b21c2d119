// the login service (out of scope here) verifies the bearer token and
// stores the user's id under this key; chat trusts it and nothing else
pub const USER_ID: &str = "user_id";
