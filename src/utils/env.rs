/// Get environment variable with TOLLGATE_ prefix, falling back to unprefixed version
///
/// This helper function checks for `TOLLGATE_{key}` first, then falls back to `{key}`
/// for compatibility with standard environment variable naming.
///
/// # Examples
///
/// ```rust
/// use tollgate::utils::get_env_with_prefix;
///
/// // Checks TOLLGATE_CARD_WEBHOOK_SECRET first, then CARD_WEBHOOK_SECRET
/// let secret = get_env_with_prefix("CARD_WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLGATE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}
