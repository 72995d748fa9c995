//! Deterministic names for kubeconfig entries.
//!
//! Every entry written by the login flow is named from the installation
//! codename, the principal and the workload cluster, so logging in twice
//! overwrites the same entries instead of adding new ones.

/// Prefix of every management cluster context.
pub const CONTEXT_PREFIX: &str = "gs-";

/// Suffix of workload cluster client certificate contexts.
pub const CLIENT_CERT_SUFFIX: &str = "-clientcert";

/// `gs-<codename>`
pub fn management_context_name(codename: &str) -> String {
    format!("{CONTEXT_PREFIX}{codename}")
}

/// `gs-<codename>`, shared with the context name.
pub fn management_cluster_name(codename: &str) -> String {
    management_context_name(codename)
}

/// `gs-<principal>-<codename>`
pub fn management_user_name(principal: &str, codename: &str) -> String {
    format!("{CONTEXT_PREFIX}{principal}-{codename}")
}

/// `<management context>-<workload cluster>-clientcert`
pub fn client_cert_context_name(management_context: &str, cluster: &str) -> String {
    format!("{management_context}-{cluster}{CLIENT_CERT_SUFFIX}")
}

pub fn client_cert_user_name(context: &str) -> String {
    format!("{context}-user")
}

/// Client certificate context an identifier may refer to, adding the context
/// prefix when it is missing.
pub fn client_cert_fallback(identifier: &str) -> String {
    if identifier.starts_with(CONTEXT_PREFIX) {
        format!("{identifier}{CLIENT_CERT_SUFFIX}")
    } else {
        format!("{CONTEXT_PREFIX}{identifier}{CLIENT_CERT_SUFFIX}")
    }
}

pub fn is_client_cert_context(name: &str) -> bool {
    name.ends_with(CLIENT_CERT_SUFFIX)
}

pub fn is_context_name(identifier: &str) -> bool {
    identifier.starts_with(CONTEXT_PREFIX)
}

/// Codenames are single DNS labels, URLs are not.
pub fn is_codename(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Context name for an identifier that is either a context name or a codename.
pub fn context_for_identifier(identifier: &str) -> String {
    if is_context_name(identifier) {
        identifier.to_string()
    } else {
        management_context_name(identifier)
    }
}
