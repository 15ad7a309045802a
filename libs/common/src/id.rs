use ulid::Ulid;

/// `<prefix>_<ulid>`; sortable by creation time.
///
/// ```
/// let id = meh_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

pub mod prefix {
    /// Hub session (one client connection and its channels).
    pub const SESSION: &str = "ses";
}
