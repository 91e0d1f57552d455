//! Resource paths, relative to the API root.

pub const CONNECTION: &str = "/connection";
pub const MESSAGES: &str = "/messaging/messages";

pub const USER_ACTIVATIONS: &str = "/activations/users";
pub const IMAGE_RESOURCES: &str = "/configuration/image-resources";
pub const LAYOUTS: &str = "/configuration/layouts";
pub const POSITIONS: &str = "/configuration/positions";
pub const USERS: &str = "/configuration/users";
pub const STRUCTURED_PARAMETERS: &str = "/configuration/structured-parameters";
pub const SERVER_PARAMETERS: &str = "/configuration/server-parameters";
pub const STATUS_MESSAGES: &str = "/status/status-messages";
pub const USER_STATUSES: &str = "/status/user-statuses";
pub const INTERACTIONS: &str = "/interactions";

/// Subscription resource for a message family, e.g. `status/user-statuses`.
pub fn subscription(family: &str) -> String {
    format!("/messaging/subscriptions/{}", family.trim_matches('/'))
}
